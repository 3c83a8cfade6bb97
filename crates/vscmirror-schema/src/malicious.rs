//! The marketplace malicious-extension list.

use crate::ident::ExtensionId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Deserialize)]
struct MarketplaceControl {
    #[serde(default)]
    malicious: Vec<String>,
}

/// Extension identifiers flagged as unsafe by upstream.
///
/// Parsed from the marketplace control file (`marketplace.json`), of which
/// only the `malicious` key matters here. Entries that are not valid
/// identifiers are dropped since they can never match an installed extension.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MaliciousList {
    ids: BTreeSet<ExtensionId>,
}

impl MaliciousList {
    /// Parse an upstream control file.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if the document is not an object of the
    /// expected shape.
    pub fn from_control_file(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let control: MarketplaceControl = serde_json::from_slice(bytes)?;
        Ok(control.malicious.iter().map(String::as_str).collect())
    }

    /// Whether `id` is flagged.
    pub fn contains(&self, id: &ExtensionId) -> bool {
        self.ids.contains(id)
    }

    /// Number of flagged identifiers.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether nothing is flagged.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Flagged identifiers in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &ExtensionId> {
        self.ids.iter()
    }
}

impl<'a> FromIterator<&'a str> for MaliciousList {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Self {
            ids: iter
                .into_iter()
                .filter_map(|s| ExtensionId::parse(s).ok())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_control_file_and_drops_garbage() {
        let list = MaliciousList::from_control_file(
            br#"{"malicious": ["Evil.Miner", "not-an-id", "bad.actor"], "deprecated": {"a.b": true}}"#,
        )
        .unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.contains(&ExtensionId::parse("evil.miner").unwrap()));
        assert!(!list.contains(&ExtensionId::parse("good.citizen").unwrap()));
    }

    #[test]
    fn missing_key_is_an_empty_list() {
        let list = MaliciousList::from_control_file(b"{}").unwrap();
        assert!(list.is_empty());
        assert!(MaliciousList::from_control_file(b"[]").is_err());
    }
}
