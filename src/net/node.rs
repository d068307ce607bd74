//! A host-on-a-network representation.
//!
//! Grounded on `original_source/include/libnetworkd/Network.hpp`'s
//! `NetworkNode` struct: a name (IPv4/IPv6 literal or DNS string) plus a
//! port, with an `operator==` that treats the literal string `"any"` as a
//! wildcard on either side.

use std::fmt;

/// Wildcard sentinel for [`NetworkNode::name`], matching any other name with
/// the same port.
pub const ANY: &str = "any";

/// IPv4, IPv6 or DNS name plus a TCP/UDP port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkNode {
    pub name: String,
    pub port: u16,
}

impl NetworkNode {
    pub fn new(name: impl Into<String>, port: u16) -> NetworkNode {
        NetworkNode { name: name.into(), port }
    }

    pub fn any(port: u16) -> NetworkNode {
        NetworkNode { name: ANY.to_string(), port }
    }

    pub fn is_wildcard(&self) -> bool {
        self.name == ANY
    }

    /// The original's `operator==`: ports must match exactly, names match if
    /// either side is the `"any"` wildcard or they're textually equal.
    ///
    /// Deliberately not `PartialEq`: wildcard matching isn't transitive
    /// (`any:80 == a:80`, `any:80 == b:80`, but `a:80 != b:80`), so it can't
    /// back a `HashMap`/`IndexMap` key without violating their contract. Use
    /// the derived exact `Eq`/`Hash` for lookup tables and `matches` for
    /// bind-address comparisons.
    pub fn matches(&self, other: &NetworkNode) -> bool {
        self.port == other.port && (self.is_wildcard() || other.is_wildcard() || self.name == other.name)
    }
}

impl fmt::Display for NetworkNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_any_name_same_port() {
        let wildcard = NetworkNode::any(80);
        let concrete = NetworkNode::new("10.0.0.1", 80);
        assert!(wildcard.matches(&concrete));
        assert!(concrete.matches(&wildcard));
    }

    #[test]
    fn mismatched_port_never_matches() {
        let a = NetworkNode::any(80);
        let b = NetworkNode::any(81);
        assert!(!a.matches(&b));
    }

    #[test]
    fn concrete_names_require_exact_match() {
        let a = NetworkNode::new("10.0.0.1", 80);
        let b = NetworkNode::new("10.0.0.2", 80);
        assert!(!a.matches(&b));
    }

    #[test]
    fn exact_eq_does_not_special_case_wildcard() {
        let wildcard = NetworkNode::any(80);
        let concrete = NetworkNode::new("10.0.0.1", 80);
        assert_ne!(wildcard, concrete);
    }
}
