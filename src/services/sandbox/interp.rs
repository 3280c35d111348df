//! Tree-walking interpreter with an instruction and wall-clock budget.
//!
//! The interpreter has no host access: the only inputs are the parsed
//! expression and a read-only JSON context. Helper functions close over
//! context fields (`issues`, `filesChanged`, `authorAssociation`), never
//! over the process.

use regex::Regex;
use serde_json::{Map, Number, Value};
use std::time::Instant;
use tracing::info;

use crate::domain::errors::SandboxError;
use crate::domain::models::run::PermissionLevel;

use super::parser::{BinaryOp, Expr, LogicalOp, UnaryOp};

pub struct Budget {
    ops: u64,
    max_ops: u64,
    started: Instant,
    max_wall_ms: u64,
}

impl Budget {
    pub fn new(max_ops: u64, max_wall_ms: u64) -> Self {
        Self { ops: 0, max_ops, started: Instant::now(), max_wall_ms }
    }

    fn charge(&mut self, amount: u64) -> Result<(), SandboxError> {
        self.ops += amount;
        if self.ops > self.max_ops {
            return Err(SandboxError::Timeout(format!("instruction budget of {} ops", self.max_ops)));
        }
        // Check the clock sparsely; Instant::elapsed is not free.
        if self.ops % 256 == 0
            && self.started.elapsed().as_millis() as u64 > self.max_wall_ms
        {
            return Err(SandboxError::Timeout(format!("{}ms wall clock", self.max_wall_ms)));
        }
        Ok(())
    }
}

pub struct Interpreter<'a> {
    context: &'a Value,
    budget: Budget,
}

impl<'a> Interpreter<'a> {
    pub fn new(context: &'a Value, budget: Budget) -> Self {
        Self { context, budget }
    }

    pub fn eval(&mut self, expr: &Expr) -> Result<Value, SandboxError> {
        self.budget.charge(1)?;
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Num(n) => Ok(number(*n)),
            Expr::Str(s) => Ok(Value::String(s.clone())),
            Expr::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item)?);
                }
                Ok(Value::Array(values))
            }
            Expr::Object(fields) => {
                let mut map = Map::new();
                for (key, value) in fields {
                    map.insert(key.clone(), self.eval(value)?);
                }
                Ok(Value::Object(map))
            }
            Expr::Ident(name) => self.lookup(name),
            Expr::Member { base, name, optional } => {
                let base = self.eval(base)?;
                if base.is_null() {
                    if *optional {
                        return Ok(Value::Null);
                    }
                    return Err(SandboxError::Type(format!(
                        "cannot read property '{name}' of null"
                    )));
                }
                self.member(&base, name)
            }
            Expr::Index { base, index, optional } => {
                let base = self.eval(base)?;
                if base.is_null() {
                    if *optional {
                        return Ok(Value::Null);
                    }
                    return Err(SandboxError::Type("cannot index null".into()));
                }
                let index = self.eval(index)?;
                self.index(&base, &index)
            }
            Expr::Call { callee, args } => self.call(callee, args),
            Expr::Unary { op, expr } => {
                let value = self.eval(expr)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                    UnaryOp::Neg => {
                        let n = value.as_f64().ok_or_else(|| {
                            SandboxError::Type("unary minus requires a number".into())
                        })?;
                        Ok(number(-n))
                    }
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                self.binary(*op, &lhs, &rhs)
            }
            Expr::Logical { op, lhs, rhs } => {
                let lhs = self.eval(lhs)?;
                match op {
                    LogicalOp::And => {
                        if truthy(&lhs) {
                            self.eval(rhs)
                        } else {
                            Ok(lhs)
                        }
                    }
                    LogicalOp::Or => {
                        if truthy(&lhs) {
                            Ok(lhs)
                        } else {
                            self.eval(rhs)
                        }
                    }
                    LogicalOp::Nullish => {
                        if lhs.is_null() {
                            self.eval(rhs)
                        } else {
                            Ok(lhs)
                        }
                    }
                }
            }
            Expr::Ternary { cond, then, otherwise } => {
                let cond = self.eval(cond)?;
                if truthy(&cond) {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, SandboxError> {
        match self.context.get(name) {
            Some(value) => Ok(value.clone()),
            None => Err(SandboxError::Reference(name.to_string())),
        }
    }

    fn member(&mut self, base: &Value, name: &str) -> Result<Value, SandboxError> {
        match base {
            Value::Object(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
            Value::Array(items) => match name {
                "length" => Ok(Value::from(items.len())),
                _ => Ok(Value::Null),
            },
            Value::String(s) => match name {
                "length" => Ok(Value::from(s.chars().count())),
                _ => Ok(Value::Null),
            },
            _ => Ok(Value::Null),
        }
    }

    fn index(&mut self, base: &Value, index: &Value) -> Result<Value, SandboxError> {
        match (base, index) {
            (Value::Array(items), idx) => {
                let i = idx
                    .as_f64()
                    .ok_or_else(|| SandboxError::Type("array index must be a number".into()))?;
                if i < 0.0 {
                    return Ok(Value::Null);
                }
                Ok(items.get(i as usize).cloned().unwrap_or(Value::Null))
            }
            (Value::Object(map), Value::String(key)) => {
                Ok(map.get(key).cloned().unwrap_or(Value::Null))
            }
            (Value::String(s), idx) => {
                let i = idx
                    .as_f64()
                    .ok_or_else(|| SandboxError::Type("string index must be a number".into()))?;
                if i < 0.0 {
                    return Ok(Value::Null);
                }
                Ok(s.chars()
                    .nth(i as usize)
                    .map_or(Value::Null, |c| Value::String(c.to_string())))
            }
            _ => Err(SandboxError::Type("value is not indexable".into())),
        }
    }

    fn binary(&mut self, op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, SandboxError> {
        match op {
            BinaryOp::Eq => Ok(Value::Bool(loose_eq(lhs, rhs))),
            BinaryOp::NotEq => Ok(Value::Bool(!loose_eq(lhs, rhs))),
            BinaryOp::Add => match (lhs, rhs) {
                (Value::String(a), b) => Ok(Value::String(format!("{a}{}", display(b)))),
                (a, Value::String(b)) => Ok(Value::String(format!("{}{b}", display(a)))),
                (a, b) => {
                    let (a, b) = both_numbers(a, b, "+")?;
                    Ok(number(a + b))
                }
            },
            BinaryOp::Sub => {
                let (a, b) = both_numbers(lhs, rhs, "-")?;
                Ok(number(a - b))
            }
            BinaryOp::Mul => {
                let (a, b) = both_numbers(lhs, rhs, "*")?;
                Ok(number(a * b))
            }
            BinaryOp::Div => {
                let (a, b) = both_numbers(lhs, rhs, "/")?;
                if b == 0.0 {
                    return Err(SandboxError::Type("division by zero".into()));
                }
                Ok(number(a / b))
            }
            BinaryOp::Rem => {
                let (a, b) = both_numbers(lhs, rhs, "%")?;
                if b == 0.0 {
                    return Err(SandboxError::Type("division by zero".into()));
                }
                Ok(number(a % b))
            }
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let ordering = match (lhs, rhs) {
                    (Value::String(a), Value::String(b)) => a.cmp(b),
                    (a, b) => {
                        let (a, b) = both_numbers(a, b, "comparison")?;
                        a.partial_cmp(&b).ok_or_else(|| {
                            SandboxError::Type("NaN is not comparable".into())
                        })?
                    }
                };
                let result = match op {
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::Le => ordering.is_le(),
                    BinaryOp::Gt => ordering.is_gt(),
                    BinaryOp::Ge => ordering.is_ge(),
                    _ => unreachable!(),
                };
                Ok(Value::Bool(result))
            }
        }
    }

    fn call(&mut self, callee: &Expr, args: &[Expr]) -> Result<Value, SandboxError> {
        if let Expr::Member { base, name, optional } = callee {
            let base = self.eval(base)?;
            if base.is_null() && *optional {
                return Ok(Value::Null);
            }
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(self.eval(arg)?);
            }
            return self.method(&base, name, &values);
        }

        if let Expr::Ident(name) = callee {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(self.eval(arg)?);
            }
            return self.helper(name, &values);
        }

        Err(SandboxError::Type("value is not callable".into()))
    }

    fn method(&mut self, base: &Value, name: &str, args: &[Value]) -> Result<Value, SandboxError> {
        match base {
            Value::String(s) => self.string_method(s, name, args),
            Value::Array(items) => self.array_method(items, name, args),
            Value::Number(_) => self.number_method(base, name, args),
            _ => Err(SandboxError::Type(format!(
                "method '{name}' is not available on this value"
            ))),
        }
    }

    fn string_method(&mut self, s: &str, name: &str, args: &[Value]) -> Result<Value, SandboxError> {
        self.budget.charge(s.len() as u64 / 16 + 1)?;
        let arg_str = |i: usize| -> Result<String, SandboxError> {
            args.get(i)
                .and_then(Value::as_str)
                .map(String::from)
                .ok_or_else(|| SandboxError::Type(format!("'{name}' expects a string argument")))
        };
        match name {
            "includes" => Ok(Value::Bool(s.contains(&arg_str(0)?))),
            "startsWith" => Ok(Value::Bool(s.starts_with(&arg_str(0)?))),
            "endsWith" => Ok(Value::Bool(s.ends_with(&arg_str(0)?))),
            "toLowerCase" => Ok(Value::String(s.to_lowercase())),
            "toUpperCase" => Ok(Value::String(s.to_uppercase())),
            "trim" => Ok(Value::String(s.trim().to_string())),
            "split" => {
                let sep = arg_str(0)?;
                let parts: Vec<Value> = if sep.is_empty() {
                    s.chars().map(|c| Value::String(c.to_string())).collect()
                } else {
                    s.split(&sep).map(|p| Value::String(p.to_string())).collect()
                };
                Ok(Value::Array(parts))
            }
            "indexOf" => {
                let needle = arg_str(0)?;
                Ok(Value::from(s.find(&needle).map_or(-1i64, |i| i as i64)))
            }
            "replace" => {
                let from = arg_str(0)?;
                let to = arg_str(1)?;
                Ok(Value::String(s.replacen(&from, &to, 1)))
            }
            "slice" => {
                let chars: Vec<char> = s.chars().collect();
                let (start, end) = slice_bounds(args, chars.len())?;
                Ok(Value::String(chars[start..end].iter().collect()))
            }
            "charAt" => {
                let i = args.first().and_then(Value::as_u64).unwrap_or(0) as usize;
                Ok(Value::String(
                    s.chars().nth(i).map(String::from).unwrap_or_default(),
                ))
            }
            "repeat" => {
                let n = args.first().and_then(Value::as_u64).unwrap_or(0);
                if n.saturating_mul(s.len() as u64) > 65_536 {
                    return Err(SandboxError::Timeout("repeat result too large".into()));
                }
                Ok(Value::String(s.repeat(n as usize)))
            }
            _ => Err(SandboxError::Type(format!("unknown string method '{name}'"))),
        }
    }

    fn array_method(
        &mut self,
        items: &[Value],
        name: &str,
        args: &[Value],
    ) -> Result<Value, SandboxError> {
        self.budget.charge(items.len() as u64 + 1)?;
        match name {
            "includes" => {
                let needle = args.first().cloned().unwrap_or(Value::Null);
                Ok(Value::Bool(items.iter().any(|v| loose_eq(v, &needle))))
            }
            "indexOf" => {
                let needle = args.first().cloned().unwrap_or(Value::Null);
                Ok(Value::from(
                    items
                        .iter()
                        .position(|v| loose_eq(v, &needle))
                        .map_or(-1i64, |i| i as i64),
                ))
            }
            "join" => {
                let sep = args.first().and_then(Value::as_str).unwrap_or(",");
                let parts: Vec<String> = items.iter().map(display).collect();
                Ok(Value::String(parts.join(sep)))
            }
            "slice" => {
                let (start, end) = slice_bounds(args, items.len())?;
                Ok(Value::Array(items[start..end].to_vec()))
            }
            "concat" => {
                let mut result = items.to_vec();
                for arg in args {
                    match arg {
                        Value::Array(more) => result.extend(more.clone()),
                        other => result.push(other.clone()),
                    }
                }
                Ok(Value::Array(result))
            }
            "flat" => {
                let mut result = Vec::new();
                for item in items {
                    match item {
                        Value::Array(inner) => result.extend(inner.clone()),
                        other => result.push(other.clone()),
                    }
                }
                Ok(Value::Array(result))
            }
            "at" => {
                let i = args
                    .first()
                    .and_then(Value::as_i64)
                    .ok_or_else(|| SandboxError::Type("'at' expects an index".into()))?;
                let idx = if i < 0 { items.len() as i64 + i } else { i };
                if idx < 0 {
                    return Ok(Value::Null);
                }
                Ok(items.get(idx as usize).cloned().unwrap_or(Value::Null))
            }
            _ => Err(SandboxError::Type(format!("unknown array method '{name}'"))),
        }
    }

    fn number_method(
        &mut self,
        base: &Value,
        name: &str,
        args: &[Value],
    ) -> Result<Value, SandboxError> {
        let n = base.as_f64().unwrap_or(0.0);
        match name {
            "toFixed" => {
                let digits = args.first().and_then(Value::as_u64).unwrap_or(0).min(20) as usize;
                Ok(Value::String(format!("{n:.digits$}")))
            }
            "toString" => Ok(Value::String(display(base))),
            _ => Err(SandboxError::Type(format!("unknown number method '{name}'"))),
        }
    }

    fn helper(&mut self, name: &str, args: &[Value]) -> Result<Value, SandboxError> {
        match name {
            "always" => Ok(Value::Bool(true)),
            "success" => Ok(Value::Bool(self.no_fatal_issues())),
            "failure" => Ok(Value::Bool(!self.no_fatal_issues())),
            "contains" => {
                let haystack = args.first().cloned().unwrap_or(Value::Null);
                let needle = args.get(1).cloned().unwrap_or(Value::Null);
                match &haystack {
                    Value::String(s) => Ok(Value::Bool(
                        needle.as_str().is_some_and(|n| s.contains(n)),
                    )),
                    Value::Array(items) => {
                        Ok(Value::Bool(items.iter().any(|v| loose_eq(v, &needle))))
                    }
                    _ => Ok(Value::Bool(false)),
                }
            }
            "startsWith" | "endsWith" => {
                let subject = args.first().and_then(Value::as_str).unwrap_or_default();
                let pattern = args.get(1).and_then(Value::as_str).unwrap_or_default();
                let hit = if name == "startsWith" {
                    subject.starts_with(pattern)
                } else {
                    subject.ends_with(pattern)
                };
                Ok(Value::Bool(hit))
            }
            "length" => {
                let value = args.first().cloned().unwrap_or(Value::Null);
                let len = match &value {
                    Value::String(s) => s.chars().count(),
                    Value::Array(items) => items.len(),
                    Value::Object(map) => map.len(),
                    _ => 0,
                };
                Ok(Value::from(len))
            }
            "log" => {
                let parts: Vec<String> = args.iter().map(display).collect();
                info!(target: "vigil::sandbox", "{}", parts.join(" "));
                Ok(Value::Null)
            }
            "hasIssue" => Ok(Value::Bool(self.count_issues(args) > 0)),
            "countIssues" => Ok(Value::from(self.count_issues(args))),
            "hasFileMatching" => {
                let pattern = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| SandboxError::Type("hasFileMatching expects a pattern".into()))?;
                let regex = glob_to_regex(pattern)?;
                let files = self
                    .context
                    .get("filesChanged")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                self.budget.charge(files.len() as u64 + 1)?;
                Ok(Value::Bool(files.iter().any(|f| {
                    f.as_str().is_some_and(|path| regex.is_match(path))
                })))
            }
            "hasMinPermission" => {
                let level = args.first().and_then(Value::as_str).unwrap_or("none");
                Ok(Value::Bool(self.permission() >= PermissionLevel::parse(level)))
            }
            "isOwner" => Ok(Value::Bool(self.permission() == PermissionLevel::Owner)),
            "isMember" => Ok(Value::Bool(self.permission() >= PermissionLevel::Member)),
            "isCollaborator" => {
                Ok(Value::Bool(self.permission() >= PermissionLevel::Collaborator))
            }
            "isContributor" => {
                Ok(Value::Bool(self.permission() >= PermissionLevel::Contributor))
            }
            "isFirstTimer" => {
                Ok(Value::Bool(self.permission() == PermissionLevel::FirstTimer))
            }
            other => Err(SandboxError::Reference(other.to_string())),
        }
    }

    fn issues(&self) -> Vec<Value> {
        self.context
            .get("issues")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    fn no_fatal_issues(&self) -> bool {
        !self.issues().iter().any(|issue| {
            matches!(
                issue.get("severity").and_then(Value::as_str),
                Some("error") | Some("critical")
            )
        })
    }

    /// `hasIssue()`/`countIssues()` filters: no args means all issues, one
    /// arg filters by severity, two args filter by (field, value).
    fn count_issues(&self, args: &[Value]) -> usize {
        let issues = self.issues();
        match args {
            [] => issues.len(),
            [severity] => {
                let severity = severity.as_str().unwrap_or_default();
                issues
                    .iter()
                    .filter(|i| i.get("severity").and_then(Value::as_str) == Some(severity))
                    .count()
            }
            [field, value, ..] => {
                let field = field.as_str().unwrap_or_default();
                issues
                    .iter()
                    .filter(|i| i.get(field).is_some_and(|v| loose_eq(v, value)))
                    .count()
            }
        }
    }

    fn permission(&self) -> PermissionLevel {
        self.context
            .get("authorAssociation")
            .and_then(Value::as_str)
            .map_or(PermissionLevel::None, PermissionLevel::parse)
    }
}

/// Common dynamic-language truthiness: empty string, null, 0, false are
/// falsy; everything else (including empty arrays/objects) is truthy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

fn both_numbers(a: &Value, b: &Value, op: &str) -> Result<(f64, f64), SandboxError> {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(SandboxError::Type(format!("'{op}' requires numeric operands"))),
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn slice_bounds(args: &[Value], len: usize) -> Result<(usize, usize), SandboxError> {
    let resolve = |v: Option<&Value>, default: i64| -> i64 {
        v.and_then(Value::as_i64).unwrap_or(default)
    };
    let clamp = |i: i64| -> usize {
        if i < 0 {
            (len as i64 + i).max(0) as usize
        } else {
            (i as usize).min(len)
        }
    };
    let start = clamp(resolve(args.first(), 0));
    let end = clamp(resolve(args.get(1), len as i64));
    Ok((start, end.max(start)))
}

/// Compile a glob (`*`, `**`, `?`) to an anchored regex.
fn glob_to_regex(pattern: &str) -> Result<Regex, SandboxError> {
    let mut regex = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    // `**/` spans directories; bare `**` matches anything.
                    if chars.get(i + 2) == Some(&'/') {
                        regex.push_str("(?:.*/)?");
                        i += 3;
                    } else {
                        regex.push_str(".*");
                        i += 2;
                    }
                } else {
                    regex.push_str("[^/]*");
                    i += 1;
                }
            }
            '?' => {
                regex.push_str("[^/]");
                i += 1;
            }
            c => {
                regex.push_str(&regex::escape(&c.to_string()));
                i += 1;
            }
        }
    }
    regex.push('$');
    Regex::new(&regex)
        .map_err(|e| SandboxError::Type(format!("invalid file pattern '{pattern}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::sandbox::parser::parse;
    use serde_json::json;

    fn eval_with(src: &str, ctx: &Value) -> Result<Value, SandboxError> {
        let expr = parse(src)?;
        let mut interp = Interpreter::new(ctx, Budget::new(1_000_000, 250));
        interp.eval(&expr)
    }

    fn eval(src: &str) -> Result<Value, SandboxError> {
        eval_with(src, &json!({}))
    }

    #[test]
    fn arithmetic_and_concat() {
        assert_eq!(eval("1 + 2 * 3").unwrap(), json!(7));
        assert_eq!(eval("'a' + 1").unwrap(), json!("a1"));
        assert_eq!(eval("10 % 3").unwrap(), json!(1));
        assert!(matches!(eval("1 / 0"), Err(SandboxError::Type(_))));
    }

    #[test]
    fn member_and_index_access() {
        let ctx = json!({"output": {"items": ["a", "b"]}, "n": 2});
        assert_eq!(eval_with("output.items[1]", &ctx).unwrap(), json!("b"));
        assert_eq!(eval_with("output.items.length", &ctx).unwrap(), json!(2));
        assert_eq!(eval_with("output.missing", &ctx).unwrap(), Value::Null);
        assert_eq!(eval_with("output.missing?.deep", &ctx).unwrap(), Value::Null);
        assert!(matches!(
            eval_with("output.missing.deep", &ctx),
            Err(SandboxError::Type(_))
        ));
    }

    #[test]
    fn unknown_identifier_is_reference_error() {
        assert!(matches!(eval("nonexistent"), Err(SandboxError::Reference(_))));
    }

    #[test]
    fn string_methods() {
        assert_eq!(eval("'Hello'.toLowerCase()").unwrap(), json!("hello"));
        assert_eq!(eval("'a,b,c'.split(',')").unwrap(), json!(["a", "b", "c"]));
        assert_eq!(eval("'hello'.includes('ell')").unwrap(), json!(true));
        assert_eq!(eval("'hello'.slice(1, 3)").unwrap(), json!("el"));
        assert_eq!(eval("'hello'.indexOf('z')").unwrap(), json!(-1));
        assert!(eval("'x'.eval('danger')").is_err());
    }

    #[test]
    fn array_methods() {
        let ctx = json!({"xs": [1, 2, 3]});
        assert_eq!(eval_with("xs.includes(2)", &ctx).unwrap(), json!(true));
        assert_eq!(eval_with("xs.join('-')", &ctx).unwrap(), json!("1-2-3"));
        assert_eq!(eval_with("xs.slice(-2)", &ctx).unwrap(), json!([2, 3]));
        assert_eq!(eval_with("xs.at(-1)", &ctx).unwrap(), json!(3));
        assert_eq!(eval_with("xs.concat([4])", &ctx).unwrap(), json!([1, 2, 3, 4]));
    }

    #[test]
    fn logic_returns_operands() {
        let ctx = json!({"a": "", "b": "fallback"});
        assert_eq!(eval_with("a || b", &ctx).unwrap(), json!("fallback"));
        assert_eq!(eval_with("b && a", &ctx).unwrap(), json!(""));
        assert_eq!(eval_with("null ?? 'x'", &ctx).unwrap(), json!("x"));
        assert_eq!(eval_with("'' ?? 'x'", &ctx).unwrap(), json!(""));
    }

    #[test]
    fn ternary() {
        assert_eq!(eval("1 > 2 ? 'yes' : 'no'").unwrap(), json!("no"));
    }

    #[test]
    fn helpers_over_issue_context() {
        let ctx = json!({
            "issues": [
                {"severity": "error", "category": "security"},
                {"severity": "warning", "category": "style"},
            ]
        });
        assert_eq!(eval_with("hasIssue()", &ctx).unwrap(), json!(true));
        assert_eq!(eval_with("countIssues('warning')", &ctx).unwrap(), json!(1));
        assert_eq!(
            eval_with("countIssues('category', 'security')", &ctx).unwrap(),
            json!(1)
        );
        assert_eq!(eval_with("success()", &ctx).unwrap(), json!(false));
        assert_eq!(eval_with("failure()", &ctx).unwrap(), json!(true));
        assert_eq!(eval_with("always()", &ctx).unwrap(), json!(true));
    }

    #[test]
    fn file_matching_glob() {
        let ctx = json!({"filesChanged": ["src/lib.rs", "docs/readme.md"]});
        assert_eq!(eval_with("hasFileMatching('**/*.rs')", &ctx).unwrap(), json!(true));
        assert_eq!(eval_with("hasFileMatching('*.rs')", &ctx).unwrap(), json!(false));
        assert_eq!(eval_with("hasFileMatching('docs/*.md')", &ctx).unwrap(), json!(true));
    }

    #[test]
    fn permission_helpers() {
        let ctx = json!({"authorAssociation": "member"});
        assert_eq!(eval_with("isMember()", &ctx).unwrap(), json!(true));
        assert_eq!(eval_with("isOwner()", &ctx).unwrap(), json!(false));
        assert_eq!(eval_with("hasMinPermission('contributor')", &ctx).unwrap(), json!(true));
        assert_eq!(eval_with("hasMinPermission('owner')", &ctx).unwrap(), json!(false));
    }

    #[test]
    fn budget_stops_runaway_repeat() {
        assert!(matches!(
            eval("'aaaaaaaaaaaaaaaa'.repeat(100000)"),
            Err(SandboxError::Timeout(_))
        ));
    }

    #[test]
    fn truthiness_table() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!(1)));
        assert!(truthy(&json!([])));
        assert!(truthy(&json!({})));
    }
}
