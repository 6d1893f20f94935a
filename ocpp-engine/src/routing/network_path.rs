//! Network path: the relay chain a message has traversed

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{NodeId, RoutingError};

/// Default upper bound on the number of hops recorded in a path
pub const DEFAULT_MAX_HOPS: usize = 10;

/// Ordered, append-only list of node identifiers, oldest first.
///
/// Appending never mutates the path in place: every relay works on its own
/// copy, so a rejected append leaves the original untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkPath {
    hops: Vec<NodeId>,
}

impl NetworkPath {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_hops<I, S>(hops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        Self {
            hops: hops.into_iter().map(Into::into).collect(),
        }
    }

    /// Append a node, bounded by [`DEFAULT_MAX_HOPS`]
    pub fn append(&self, node: impl Into<NodeId>) -> Result<Self, RoutingError> {
        self.append_bounded(node, DEFAULT_MAX_HOPS)
    }

    /// Append a node, rejecting the result if it would exceed `max_hops`
    pub fn append_bounded(
        &self,
        node: impl Into<NodeId>,
        max_hops: usize,
    ) -> Result<Self, RoutingError> {
        if self.hops.len() >= max_hops {
            return Err(RoutingError::HopLimitExceeded {
                limit: max_hops,
                path: self.clone(),
            });
        }

        let mut hops = self.hops.clone();
        hops.push(node.into());
        Ok(Self { hops })
    }

    /// The same hops, newest first
    pub fn reversed(&self) -> Self {
        Self {
            hops: self.hops.iter().rev().cloned().collect(),
        }
    }

    pub fn contains(&self, node: &str) -> bool {
        self.hops.iter().any(|hop| hop == node)
    }

    /// The node that first stamped the path
    pub fn origin(&self) -> Option<&NodeId> {
        self.hops.first()
    }

    pub fn last(&self) -> Option<&NodeId> {
        self.hops.last()
    }

    pub fn hops(&self) -> &[NodeId] {
        &self.hops
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn into_hops(self) -> Vec<NodeId> {
        self.hops
    }
}

impl fmt::Display for NetworkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hops.is_empty() {
            write!(f, "[]")
        } else {
            write!(f, "[{}]", self.hops.join(" -> "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_returns_new_path() {
        let path = NetworkPath::from_hops(["CS001"]);
        let next = path.append("NN1").unwrap();

        assert_eq!(path.hops(), ["CS001"]);
        assert_eq!(next.hops(), ["CS001", "NN1"]);
        assert_eq!(next.origin().map(String::as_str), Some("CS001"));
        assert_eq!(next.last().map(String::as_str), Some("NN1"));
    }

    #[test]
    fn test_hop_limit() {
        let full = NetworkPath::from_hops((0..DEFAULT_MAX_HOPS).map(|i| format!("nn{}", i)));
        assert_eq!(full.len(), DEFAULT_MAX_HOPS);

        let err = full.append("one-too-many").unwrap_err();
        assert!(matches!(err, RoutingError::HopLimitExceeded { limit: DEFAULT_MAX_HOPS, .. }));
        assert_eq!(full.len(), DEFAULT_MAX_HOPS);
    }

    #[test]
    fn test_custom_bound() {
        let path = NetworkPath::from_hops(["a", "b"]);
        assert!(path.append_bounded("c", 3).is_ok());
        assert!(path.append_bounded("c", 2).is_err());
    }

    #[test]
    fn test_reversed_and_display() {
        let path = NetworkPath::from_hops(["a", "b", "c"]);
        assert_eq!(path.reversed().hops(), ["c", "b", "a"]);
        assert_eq!(path.to_string(), "[a -> b -> c]");
        assert_eq!(NetworkPath::empty().to_string(), "[]");
        assert!(path.contains("b"));
        assert!(!path.contains("d"));
    }

    #[test]
    fn test_serializes_as_plain_array() {
        let path = NetworkPath::from_hops(["a", "b"]);
        assert_eq!(serde_json::to_string(&path).unwrap(), r#"["a","b"]"#);
    }
}
