//! Opaque property bag handed to bot factories.

use crate::error::ConnectError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key/value settings a bot factory reads while connecting.
///
/// The core fills in the keys it knows from configuration (`token`,
/// `guild_id`, `update_non_synced`, `sync_names`, database settings,
/// `base_path`, `language`); platforms are free to look for more.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BotProperties(Map<String, Value>);

impl BotProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    /// A string property that must be present and non-blank.
    pub fn require_str(&self, key: &str) -> Result<&str, ConnectError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Err(ConnectError::MissingProperty(key.to_string())),
            Some(Value::String(s)) if s.trim().is_empty() => {
                Err(ConnectError::MissingProperty(key.to_string()))
            }
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(ConnectError::InvalidProperty {
                key: key.to_string(),
                reason: format!("expected a string, got {}", other),
            }),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_getters() {
        let props = BotProperties::new()
            .with("token", "abc")
            .with("sync_names", true)
            .with("port", 3306u64);

        assert_eq!(props.get_str("token"), Some("abc"));
        assert_eq!(props.get_bool("sync_names"), Some(true));
        assert_eq!(props.get_u64("port"), Some(3306));
        assert_eq!(props.get_str("port"), None);
        assert_eq!(props.len(), 3);
    }

    #[test]
    fn require_str_rejects_blank_and_wrong_types() {
        let props = BotProperties::new()
            .with("token", "  ")
            .with("guild_id", 12u64);

        assert!(matches!(
            props.require_str("token"),
            Err(ConnectError::MissingProperty(_))
        ));
        assert!(matches!(
            props.require_str("guild_id"),
            Err(ConnectError::InvalidProperty { .. })
        ));
        assert!(matches!(
            props.require_str("absent"),
            Err(ConnectError::MissingProperty(_))
        ));
    }
}
