//! Settings shared by channels, formatters and binding elements.

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::messaging::KeyValueFormConformanceLevel;

/// Tunables for message lifetimes, token lifetimes and wire strictness.
///
/// Durations are stored as whole seconds so the struct loads directly from
/// JSON; accessors return [`TimeDelta`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingSettings {
    /// Reject messages that carry parts the receiver does not understand
    /// where the protocol makes that an error.
    pub strict: bool,
    pub maximum_message_lifetime_secs: u64,
    pub maximum_clock_skew_secs: u64,
    pub kvf_conformance: KeyValueFormConformanceLevel,
    /// Indirect messages with longer URLs are sent as auto-posting forms.
    pub maximum_indirect_url_length: usize,
    /// Lifetime of return_to signing keys and similar local secrets.
    pub symmetric_key_lifetime_secs: u64,
    /// Minimum life a symmetric key must have left to sign something new.
    pub minimum_key_remaining_secs: u64,
    pub shared_association_lifetime_secs: u64,
    pub private_association_lifetime_secs: u64,
    pub authorization_code_lifetime_secs: u64,
    /// `None` lets refresh tokens live until their signing key is retired.
    pub refresh_token_lifetime_secs: Option<u64>,
    pub access_token_lifetime_secs: u64,
    pub accept_unsigned_extensions: bool,
    pub direct_request_timeout_secs: Option<u64>,
}

impl Default for MessagingSettings {
    fn default() -> Self {
        Self {
            strict: true,
            maximum_message_lifetime_secs: 13 * 60,
            maximum_clock_skew_secs: 10 * 60,
            kvf_conformance: KeyValueFormConformanceLevel::OpenId20,
            maximum_indirect_url_length: 2048,
            symmetric_key_lifetime_secs: 14 * 24 * 60 * 60,
            minimum_key_remaining_secs: 13 * 60,
            shared_association_lifetime_secs: 14 * 24 * 60 * 60,
            private_association_lifetime_secs: 13 * 60,
            authorization_code_lifetime_secs: 300,
            refresh_token_lifetime_secs: None,
            access_token_lifetime_secs: 3600,
            accept_unsigned_extensions: true,
            direct_request_timeout_secs: Some(30),
        }
    }
}

fn seconds(value: u64) -> TimeDelta {
    TimeDelta::seconds(i64::try_from(value).unwrap_or(i64::MAX).min(i64::MAX / 1000))
}

impl MessagingSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses settings from JSON. Missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn maximum_message_lifetime(&self) -> TimeDelta {
        seconds(self.maximum_message_lifetime_secs)
    }

    pub fn maximum_clock_skew(&self) -> TimeDelta {
        seconds(self.maximum_clock_skew_secs)
    }

    pub fn symmetric_key_lifetime(&self) -> TimeDelta {
        seconds(self.symmetric_key_lifetime_secs)
    }

    pub fn minimum_key_remaining(&self) -> TimeDelta {
        seconds(self.minimum_key_remaining_secs)
    }

    pub fn shared_association_lifetime(&self) -> TimeDelta {
        seconds(self.shared_association_lifetime_secs)
    }

    pub fn private_association_lifetime(&self) -> TimeDelta {
        seconds(self.private_association_lifetime_secs)
    }

    pub fn authorization_code_lifetime(&self) -> TimeDelta {
        seconds(self.authorization_code_lifetime_secs)
    }

    pub fn refresh_token_lifetime(&self) -> Option<TimeDelta> {
        self.refresh_token_lifetime_secs.map(seconds)
    }

    pub fn access_token_lifetime(&self) -> TimeDelta {
        seconds(self.access_token_lifetime_secs)
    }

    pub fn direct_request_timeout(&self) -> Option<std::time::Duration> {
        self.direct_request_timeout_secs.map(std::time::Duration::from_secs)
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_maximum_message_lifetime(mut self, secs: u64) -> Self {
        self.maximum_message_lifetime_secs = secs;
        self
    }

    pub fn with_maximum_clock_skew(mut self, secs: u64) -> Self {
        self.maximum_clock_skew_secs = secs;
        self
    }

    pub fn with_kvf_conformance(mut self, level: KeyValueFormConformanceLevel) -> Self {
        self.kvf_conformance = level;
        self
    }

    pub fn with_maximum_indirect_url_length(mut self, length: usize) -> Self {
        self.maximum_indirect_url_length = length;
        self
    }

    pub fn with_symmetric_key_lifetime(mut self, secs: u64) -> Self {
        self.symmetric_key_lifetime_secs = secs;
        self
    }

    pub fn with_shared_association_lifetime(mut self, secs: u64) -> Self {
        self.shared_association_lifetime_secs = secs;
        self
    }

    pub fn with_private_association_lifetime(mut self, secs: u64) -> Self {
        self.private_association_lifetime_secs = secs;
        self
    }

    pub fn with_authorization_code_lifetime(mut self, secs: u64) -> Self {
        self.authorization_code_lifetime_secs = secs;
        self
    }

    pub fn with_refresh_token_lifetime(mut self, secs: Option<u64>) -> Self {
        self.refresh_token_lifetime_secs = secs;
        self
    }

    pub fn with_access_token_lifetime(mut self, secs: u64) -> Self {
        self.access_token_lifetime_secs = secs;
        self
    }

    pub fn with_accept_unsigned_extensions(mut self, accept: bool) -> Self {
        self.accept_unsigned_extensions = accept;
        self
    }

    pub fn with_direct_request_timeout(mut self, secs: Option<u64>) -> Self {
        self.direct_request_timeout_secs = secs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let settings = MessagingSettings::from_json_str(
            r#"{"maximum_message_lifetime_secs": 60, "kvf_conformance": "loose"}"#,
        )
        .unwrap();
        assert_eq!(settings.maximum_message_lifetime(), TimeDelta::minutes(1));
        assert_eq!(settings.kvf_conformance, KeyValueFormConformanceLevel::Loose);
        assert_eq!(settings.access_token_lifetime_secs, 3600);
        assert!(settings.strict);
    }

    #[test]
    fn builder_overrides() {
        let settings = MessagingSettings::new()
            .with_refresh_token_lifetime(Some(86400))
            .with_accept_unsigned_extensions(false);
        assert_eq!(settings.refresh_token_lifetime(), Some(TimeDelta::days(1)));
        assert!(!settings.accept_unsigned_extensions);
    }
}
