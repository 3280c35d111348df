//! Execution scopes.
//!
//! A scope is an ordered path of `{check, index}` pairs identifying a
//! forEach item context. The empty scope is the aggregate (root) level.

use serde::{Deserialize, Serialize};

/// One step of a scope path: the forEach producer and the item index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeSegment {
    pub check: String,
    pub index: usize,
}

impl ScopeSegment {
    pub fn new(check: impl Into<String>, index: usize) -> Self {
        Self { check: check.into(), index }
    }
}

/// An ordered path of scope segments. Depth 0 is the aggregate level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope(Vec<ScopeSegment>);

impl Scope {
    /// The aggregate (parent-level) scope.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// A depth-1 scope for one item of a forEach producer.
    pub fn item(check: impl Into<String>, index: usize) -> Self {
        Self(vec![ScopeSegment::new(check, index)])
    }

    pub fn segments(&self) -> &[ScopeSegment] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Child scope one level deeper.
    pub fn child(&self, check: impl Into<String>, index: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(ScopeSegment::new(check, index));
        Self(segments)
    }

    /// Parent scope, or None at the root.
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// True when `self` is a strict prefix of `other`.
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        self.0.len() < other.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<root>");
        }
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|s| format!("{}[{}]", s.check, s.index))
            .collect();
        f.write_str(&parts.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestry() {
        let root = Scope::root();
        let item = Scope::item("list", 2);
        let nested = item.child("inner", 0);

        assert!(root.is_ancestor_of(&item));
        assert!(root.is_ancestor_of(&nested));
        assert!(item.is_ancestor_of(&nested));
        assert!(!item.is_ancestor_of(&root));
        assert!(!item.is_ancestor_of(&Scope::item("list", 3)));
        assert!(!item.is_ancestor_of(&item));
    }

    #[test]
    fn parent_chain_reaches_root() {
        let nested = Scope::item("a", 1).child("b", 2);
        let parent = nested.parent().unwrap();
        assert_eq!(parent, Scope::item("a", 1));
        assert_eq!(parent.parent().unwrap(), Scope::root());
        assert!(Scope::root().parent().is_none());
    }

    #[test]
    fn display_formats_path() {
        assert_eq!(Scope::root().to_string(), "<root>");
        assert_eq!(Scope::item("list", 0).child("greet", 3).to_string(), "list[0].greet[3]");
    }
}
