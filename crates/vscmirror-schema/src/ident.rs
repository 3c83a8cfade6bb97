//! Extension identifiers.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Borrow;
use thiserror::Error;

/// Why a `publisher.name` identifier was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    /// Nothing but whitespace was supplied.
    #[error("Extension identifier is empty")]
    Empty,

    /// No `.` between publisher and name.
    #[error("Extension identifier '{0}' is missing the '.' between publisher and name")]
    MissingSeparator(String),

    /// More than one `.` was found.
    #[error("Extension identifier '{0}' must contain exactly one '.'")]
    TooManySeparators(String),

    /// Nothing before the dot.
    #[error("Extension identifier '{0}' has an empty publisher")]
    EmptyPublisher(String),

    /// Nothing after the dot.
    #[error("Extension identifier '{0}' has an empty name")]
    EmptyName(String),

    /// A character outside `[A-Za-z0-9_-]` appeared in either half.
    #[error("Extension identifier '{id}' contains invalid character {ch:?}")]
    InvalidCharacter {
        /// The identifier as supplied.
        id: String,
        /// The first offending character.
        ch: char,
    },
}

/// A validated, normalized extension identifier (`publisher.name`).
///
/// Identifiers compare case-insensitively; the stored form is lowercase and
/// doubles as the directory name in the artifact store, which is why path
/// separators and other punctuation are rejected outright.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExtensionId {
    full: String,
    dot: usize,
}

impl ExtensionId {
    /// Parse and normalize an identifier.
    ///
    /// # Errors
    ///
    /// Returns an [`IdentifierError`] describing the first rule the input breaks.
    pub fn parse(raw: &str) -> Result<Self, IdentifierError> {
        let s = raw.trim();
        if s.is_empty() {
            return Err(IdentifierError::Empty);
        }

        let mut dots = s.match_indices('.');
        let Some((dot, _)) = dots.next() else {
            return Err(IdentifierError::MissingSeparator(s.to_string()));
        };
        if dots.next().is_some() {
            return Err(IdentifierError::TooManySeparators(s.to_string()));
        }
        if dot == 0 {
            return Err(IdentifierError::EmptyPublisher(s.to_string()));
        }
        if dot == s.len() - 1 {
            return Err(IdentifierError::EmptyName(s.to_string()));
        }

        if let Some(ch) = s
            .chars()
            .filter(|c| *c != '.')
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(IdentifierError::InvalidCharacter {
                id: s.to_string(),
                ch,
            });
        }

        Ok(Self {
            full: s.to_ascii_lowercase(),
            dot,
        })
    }

    /// Build an identifier from the two halves reported by the marketplace.
    ///
    /// # Errors
    ///
    /// Same rules as [`ExtensionId::parse`].
    pub fn from_parts(publisher: &str, name: &str) -> Result<Self, IdentifierError> {
        Self::parse(&format!("{publisher}.{name}"))
    }

    /// Lowercase publisher half.
    pub fn publisher(&self) -> &str {
        &self.full[..self.dot]
    }

    /// Lowercase name half.
    pub fn name(&self) -> &str {
        &self.full[self.dot + 1..]
    }

    /// The normalized `publisher.name` form.
    pub fn as_str(&self) -> &str {
        &self.full
    }
}

impl std::fmt::Display for ExtensionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full)
    }
}

impl std::str::FromStr for ExtensionId {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for ExtensionId {
    fn as_ref(&self) -> &str {
        &self.full
    }
}

impl AsRef<std::path::Path> for ExtensionId {
    fn as_ref(&self) -> &std::path::Path {
        std::path::Path::new(&self.full)
    }
}

// Hashes like the borrowed `str` so map lookups by `&str` find the entry.
impl std::hash::Hash for ExtensionId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.full.hash(state);
    }
}

impl Borrow<str> for ExtensionId {
    fn borrow(&self) -> &str {
        &self.full
    }
}

impl PartialEq<str> for ExtensionId {
    fn eq(&self, other: &str) -> bool {
        self.full.eq_ignore_ascii_case(other)
    }
}

impl PartialEq<&str> for ExtensionId {
    fn eq(&self, other: &&str) -> bool {
        self.full.eq_ignore_ascii_case(other)
    }
}

impl Serialize for ExtensionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.full)
    }
}

impl<'de> Deserialize<'de> for ExtensionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn parses_and_lowercases() {
        let id = ExtensionId::parse("  GitHub.Copilot ").unwrap();
        assert_eq!(id.as_str(), "github.copilot");
        assert_eq!(id.publisher(), "github");
        assert_eq!(id.name(), "copilot");
        assert!(id == "GITHUB.copilot");
    }

    #[test]
    fn rejects_malformed_identifiers() {
        assert_eq!(ExtensionId::parse(""), Err(IdentifierError::Empty));
        assert_eq!(ExtensionId::parse("   "), Err(IdentifierError::Empty));
        assert!(matches!(
            ExtensionId::parse("nodot"),
            Err(IdentifierError::MissingSeparator(_))
        ));
        assert!(matches!(
            ExtensionId::parse(".name"),
            Err(IdentifierError::EmptyPublisher(_))
        ));
        assert!(matches!(
            ExtensionId::parse("publisher."),
            Err(IdentifierError::EmptyName(_))
        ));
        assert!(matches!(
            ExtensionId::parse("a.b.c"),
            Err(IdentifierError::TooManySeparators(_))
        ));
        assert!(matches!(
            ExtensionId::parse("pub/../x.name"),
            Err(IdentifierError::InvalidCharacter { ch: '/', .. })
        ));
    }

    #[test]
    fn hyphens_and_underscores_are_allowed() {
        let id = ExtensionId::parse("ms-python.debugpy_ext").unwrap();
        assert_eq!(id.publisher(), "ms-python");
        assert_eq!(id.name(), "debugpy_ext");
    }

    #[test]
    fn deserialization_validates() {
        let ok: ExtensionId = serde_json::from_str("\"Ms-Python.Python\"").unwrap();
        assert_eq!(ok.as_str(), "ms-python.python");
        assert!(serde_json::from_str::<ExtensionId>("\"broken\"").is_err());
    }

    #[test]
    fn maps_keyed_by_id_answer_str_lookups() {
        let mut installs = HashMap::new();
        installs.insert(ExtensionId::parse("Acme.Tool").unwrap(), 7_u64);
        assert_eq!(installs.get("acme.tool"), Some(&7));
        assert!(installs.contains_key("acme.tool"));
        assert_eq!(installs.get("acme.other"), None);
    }
}
