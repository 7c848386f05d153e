//! Queue-wide configuration.

use crate::error::{QueueError, Result};
use crate::retry::RetryPolicy;
use serde::Deserialize;

/// Global settings, validated at startup. The only knob the core carries
/// is the bottom retry layer; worker and job overrides merge over it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QueueConfig {
    pub retry: Option<RetryPolicy>,
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Parse and validate a JSON config. Unknown keys, wrong types and
    /// negative integers fail here, before the queue exists.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| QueueError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Limit;

    #[test]
    fn empty_config_is_valid() {
        let cfg = QueueConfig::from_json("{}").unwrap();
        assert!(cfg.retry.is_none());
    }

    #[test]
    fn parses_a_retry_layer() {
        let cfg =
            QueueConfig::from_json(r#"{"retry": {"delay": 100, "max_attempts": 2}}"#).unwrap();
        let retry = cfg.retry.unwrap();
        assert_eq!(retry.delay, Some(100));
        assert_eq!(retry.max_attempts, Some(Limit::Finite(2)));
    }

    #[test]
    fn parses_a_shorthand_retry_layer() {
        let cfg = QueueConfig::from_json(r#"{"retry": "no_retry"}"#).unwrap();
        assert_eq!(cfg.retry, Some(RetryPolicy::no_retry()));
    }

    #[test]
    fn unknown_keys_are_fatal() {
        assert!(QueueConfig::from_json(r#"{"retyr": "no_retry"}"#).is_err());
        assert!(QueueConfig::from_json(r#"{"retry": {"delya": 5}}"#).is_err());
    }
}
