//! Agent identifiers.
//!
//! An agent is named by a three-label string `name.authority1.authority2`.
//! The last two labels form the *authority*, which determines the default
//! auth, heartbeat, and message servers for the identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::AcpError;

/// A validated three-label agent identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId {
    full: String,
}

impl AgentId {
    /// Parse and validate an identifier.
    ///
    /// Requires exactly three non-empty dot-separated labels.
    pub fn parse(s: &str) -> Result<Self, AcpError> {
        let labels: Vec<&str> = s.split('.').collect();
        if labels.len() != 3 || labels.iter().any(|l| l.is_empty()) {
            return Err(AcpError::invalid_agent_id(s));
        }
        Ok(Self { full: s.to_owned() })
    }

    /// The full `name.authority1.authority2` string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// The leading label (the agent's short name).
    #[must_use]
    pub fn name(&self) -> &str {
        self.full.split('.').next().unwrap_or(&self.full)
    }

    /// The authority: the last two labels joined with a dot.
    #[must_use]
    pub fn authority(&self) -> String {
        let labels: Vec<&str> = self.full.split('.').collect();
        labels[labels.len() - 2..].join(".")
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl FromStr for AgentId {
    type Err = AcpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AgentId {
    type Error = AcpError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.full
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_id() {
        let id = AgentId::parse("alice.corp.example").unwrap();
        assert_eq!(id.as_str(), "alice.corp.example");
        assert_eq!(id.name(), "alice");
        assert_eq!(id.authority(), "corp.example");
    }

    #[test]
    fn reject_two_labels() {
        assert!(AgentId::parse("alice.example").is_err());
    }

    #[test]
    fn reject_four_labels() {
        assert!(AgentId::parse("a.b.c.d").is_err());
    }

    #[test]
    fn reject_empty_label() {
        assert!(AgentId::parse("alice..example").is_err());
        assert!(AgentId::parse(".corp.example").is_err());
        assert!(AgentId::parse("alice.corp.").is_err());
    }

    #[test]
    fn reject_empty_string() {
        assert!(AgentId::parse("").is_err());
    }

    #[test]
    fn display_round_trip() {
        let id: AgentId = "bob.corp.example".parse().unwrap();
        assert_eq!(id.to_string(), "bob.corp.example");
    }

    #[test]
    fn serde_round_trip() {
        let id = AgentId::parse("carol.corp.example").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"carol.corp.example\"");
        let back: AgentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn serde_rejects_invalid() {
        let result: Result<AgentId, _> = serde_json::from_str("\"not-an-aid\"");
        assert!(result.is_err());
    }

    #[test]
    fn ids_hash_and_compare() {
        let a = AgentId::parse("a.corp.example").unwrap();
        let b = AgentId::parse("a.corp.example").unwrap();
        let c = AgentId::parse("c.corp.example").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
