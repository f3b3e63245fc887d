//! Extractors pull a value out of an inbound message, updaters write one into
//! an outbound message.
//!
//! Templates reference these through [`ExtractorSpec`], the persisted form,
//! which is turned into a trait object when the template enters the cache.

use crate::message::Message;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pulls a value out of a message.
pub trait Extractor: Send + Sync + fmt::Debug {
    /// Returns `None` when the message carries no value for this extractor.
    fn extract(&self, message: &Message) -> Option<String>;
}

/// Writes a value into a message.
pub trait Updater: Send + Sync + fmt::Debug {
    fn update(&self, message: &mut Message, value: String);
}

/// Reads a header by exact name.
#[derive(Debug, Clone)]
pub struct HeaderExtractor {
    name: String,
}

impl HeaderExtractor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Extractor for HeaderExtractor {
    fn extract(&self, message: &Message) -> Option<String> {
        message.headers.get(&self.name).cloned()
    }
}

/// Sets a header, replacing any previous value.
#[derive(Debug, Clone)]
pub struct HeaderUpdater {
    name: String,
}

impl HeaderUpdater {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Updater for HeaderUpdater {
    fn update(&self, message: &mut Message, value: String) {
        message.headers.insert(self.name.clone(), value);
    }
}

/// Persisted description of an extractor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExtractorSpec {
    /// Value of the named request header
    Header { name: String },
}

impl ExtractorSpec {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ExtractorSpec::Header { name } if name.is_empty() => {
                Err("header extractor requires a header name".to_string())
            }
            ExtractorSpec::Header { .. } => Ok(()),
        }
    }

    pub fn build(&self) -> Box<dyn Extractor> {
        match self {
            ExtractorSpec::Header { name } => Box::new(HeaderExtractor::new(name.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_extractor() {
        let msg = Message::new("").with_header("X-Name", "Ann");

        assert_eq!(HeaderExtractor::new("X-Name").extract(&msg), Some("Ann".to_string()));
        // Header names are case-sensitive
        assert_eq!(HeaderExtractor::new("x-name").extract(&msg), None);
    }

    #[test]
    fn test_header_updater_overwrites() {
        let mut msg = Message::new("body").with_header("X-Trace", "old");
        HeaderUpdater::new("X-Trace").update(&mut msg, "new".to_string());

        assert_eq!(msg.header("X-Trace"), Some("new"));
        assert_eq!(msg.body, "body");
    }

    #[test]
    fn test_spec_round_trip_from_json() {
        let spec: ExtractorSpec =
            serde_json::from_value(serde_json::json!({"type": "header", "name": "X-Id"})).unwrap();
        assert_eq!(
            spec,
            ExtractorSpec::Header {
                name: "X-Id".to_string()
            }
        );

        let msg = Message::new("").with_header("X-Id", "42");
        assert_eq!(spec.build().extract(&msg), Some("42".to_string()));
    }

    #[test]
    fn test_spec_validation() {
        let empty = ExtractorSpec::Header {
            name: String::new(),
        };
        assert!(empty.validate().is_err());
    }
}
