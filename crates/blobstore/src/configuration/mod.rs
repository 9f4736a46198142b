//! Durable blob store configuration and the stores that persist it.

mod memory;
mod sqlite;

pub use memory::MemoryConfigurationStore;
pub use sqlite::SqliteConfigurationStore;

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Value substituted for secret attributes whenever a configuration leaves
/// the engine for display.
pub const SECRET_PLACEHOLDER: &str = "#~REDACTED~#";

/// Attribute sections: `section -> key -> value`.
pub type Attributes = BTreeMap<String, BTreeMap<String, Value>>;

/// Persisted description of one blob store.
///
/// Names are unique case-insensitively; the registry and configuration
/// stores key on [`BlobStoreConfiguration::key`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobStoreConfiguration {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl BlobStoreConfiguration {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(
        mut self,
        section: &str,
        key: &str,
        value: impl Into<Value>,
    ) -> Self {
        self.set_attribute(section, key, value);
        self
    }

    pub fn set_attribute(&mut self, section: &str, key: &str, value: impl Into<Value>) {
        self.attributes
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    pub fn remove_attribute(&mut self, section: &str, key: &str) -> Option<Value> {
        let entries = self.attributes.get_mut(section)?;
        let removed = entries.remove(key);
        if entries.is_empty() {
            self.attributes.remove(section);
        }
        removed
    }

    pub fn section(&self, section: &str) -> Option<&BTreeMap<String, Value>> {
        self.attributes.get(section)
    }

    pub fn attribute(&self, section: &str, key: &str) -> Option<&Value> {
        self.attributes.get(section)?.get(key)
    }

    pub fn string_attribute(&self, section: &str, key: &str) -> Option<&str> {
        self.attribute(section, key)?.as_str()
    }

    /// Numeric attribute; numeric strings are accepted as well.
    pub fn u64_attribute(&self, section: &str, key: &str) -> Option<u64> {
        match self.attribute(section, key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn bool_attribute(&self, section: &str, key: &str) -> Option<bool> {
        match self.attribute(section, key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// List attribute given either as a JSON array of strings or as a comma
    /// separated string.
    pub fn string_list_attribute(&self, section: &str, key: &str) -> Option<Vec<String>> {
        match self.attribute(section, key)? {
            Value::Array(items) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect(),
            Value::String(s) => Some(
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Case-insensitive registry key.
    pub fn key(&self) -> String {
        normalize_name(&self.name)
    }

    /// Copy with every listed secret attribute replaced by
    /// [`SECRET_PLACEHOLDER`].
    pub fn redacted(&self, secrets: &[(&str, &str)]) -> Self {
        let mut copy = self.clone();
        for (section, key) in secrets {
            if let Some(value) = copy
                .attributes
                .get_mut(*section)
                .and_then(|entries| entries.get_mut(*key))
            {
                *value = Value::String(SECRET_PLACEHOLDER.to_string());
            }
        }
        copy
    }

    /// Replace placeholder secrets with the values held by `previous`, so a
    /// round-tripped redacted configuration does not overwrite credentials.
    pub fn restore_secrets(&mut self, previous: &Self, secrets: &[(&str, &str)]) {
        for (section, key) in secrets {
            if self.string_attribute(section, key) != Some(SECRET_PLACEHOLDER) {
                continue;
            }
            match previous.attribute(section, key) {
                Some(value) => self.set_attribute(section, key, value.clone()),
                None => {
                    self.remove_attribute(section, key);
                }
            }
        }
    }
}

pub fn normalize_name(name: &str) -> String {
    name.to_lowercase()
}

/// Durable storage for blob store configurations.
///
/// `create` must reject a name that already exists (case-insensitively)
/// with [`crate::BlobStoreError::DuplicateStore`].
#[async_trait]
pub trait ConfigurationStore: Send + Sync + Debug {
    async fn list(&self) -> Result<Vec<BlobStoreConfiguration>>;

    async fn read(&self, name: &str) -> Result<Option<BlobStoreConfiguration>>;

    async fn create(&self, config: &BlobStoreConfiguration) -> Result<()>;

    async fn update(&self, config: &BlobStoreConfiguration) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn s3_config() -> BlobStoreConfiguration {
        BlobStoreConfiguration::new("Cloud-1", "cloud")
            .with_attribute("cloud", "bucket", "artifacts")
            .with_attribute("cloud", "secretAccessKey", "s3cr3t")
    }

    const SECRETS: &[(&str, &str)] = &[("cloud", "secretAccessKey")];

    #[test]
    fn test_typed_attributes() {
        let config = BlobStoreConfiguration::new("g", "group")
            .with_attribute("group", "members", json!(["a", "b"]))
            .with_attribute("softQuota", "limit", "1024")
            .with_attribute("file", "flag", true);

        assert_eq!(
            config.string_list_attribute("group", "members"),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(config.u64_attribute("softQuota", "limit"), Some(1024));
        assert_eq!(config.bool_attribute("file", "flag"), Some(true));
        assert_eq!(config.string_attribute("file", "missing"), None);

        let csv = config.with_attribute("group", "members", "a, b ,,c");
        assert_eq!(
            csv.string_list_attribute("group", "members").unwrap(),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn test_redaction_round_trip_keeps_secret() {
        let original = s3_config();
        let redacted = original.redacted(SECRETS);
        assert_eq!(
            redacted.string_attribute("cloud", "secretAccessKey"),
            Some(SECRET_PLACEHOLDER)
        );
        assert_eq!(redacted.string_attribute("cloud", "bucket"), Some("artifacts"));

        let mut incoming = redacted.with_attribute("cloud", "bucket", "renamed");
        incoming.restore_secrets(&original, SECRETS);
        assert_eq!(
            incoming.string_attribute("cloud", "secretAccessKey"),
            Some("s3cr3t")
        );
        assert_eq!(incoming.string_attribute("cloud", "bucket"), Some("renamed"));
    }

    #[test]
    fn test_key_is_case_insensitive() {
        assert_eq!(s3_config().key(), "cloud-1");
        assert_eq!(normalize_name("FOO"), normalize_name("foo"));
    }
}
