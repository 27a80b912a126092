//! Error types for message encoding, validation and the channel pipeline.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::oauth2::TokenErrorCode;

/// Coarse classification of a [`ProtocolError`], used for logging and for
/// deciding what the far end is told.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or disallowed combination of message parts.
    Violation,
    /// A signature or MAC did not verify.
    Tamper,
    /// A message or token is older than its allowed age.
    Expiration,
    /// A nonce or single-use token was presented again.
    Replay,
    /// A value could not be decoded.
    Format,
    /// A collaborator or the local configuration is broken.
    Host,
    /// Direct message delivery failed.
    Transport,
}

/// Failure converting between a typed value and its wire string.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("cannot decode {value:?}: {reason}")]
    Invalid { value: String, reason: String },
    #[error("cannot encode value: {0}")]
    Unencodable(String),
}

impl EncodingError {
    pub fn invalid(value: &str, reason: impl Into<String>) -> Self {
        EncodingError::Invalid { value: value.to_string(), reason: reason.into() }
    }
}

/// Key-Value Form codec errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvfError {
    #[error("illegal character in key-value form key {0:?}")]
    IllegalKeyCharacter(String),
    #[error("illegal character in key-value form value of {0:?}")]
    IllegalValueCharacter(String),
    #[error("line {line}: missing ':' separator")]
    MissingSeparator { line: usize },
    #[error("line {line}: whitespace around ':' separator")]
    WhitespaceAroundSeparator { line: usize },
    #[error("key-value form data does not end with a newline")]
    MissingTrailingNewline,
    #[error("duplicate key {0:?}")]
    DuplicateKey(String),
    #[error("key-value form data is not valid UTF-8")]
    InvalidUtf8,
}

/// Reasons a serialized data bag was refused.
///
/// Each is logged separately. At an OAuth 2.0 endpoint they all surface as
/// `invalid_grant`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DataBagError {
    #[error("data bag signature is invalid")]
    BadSignature,
    #[error("data bag expired at {expired_at}")]
    Expired { expired_at: DateTime<Utc> },
    #[error("data bag has already been redeemed")]
    Replayed,
    #[error("data bag is malformed: {0}")]
    Malformed(String),
    #[error("no key {handle:?} in bucket {bucket:?}")]
    MissingKey { bucket: String, handle: String },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("{message} is missing required parts: {}", .parts.join(", "))]
    MissingParts { message: &'static str, parts: Vec<String> },

    #[error("{message} has empty values for parts that must not be empty: {}", .parts.join(", "))]
    EmptyParts { message: &'static str, parts: Vec<String> },

    #[error("part {part} of {message} must be {expected:?} but was {actual:?}")]
    ConstantMismatch { message: &'static str, part: String, expected: String, actual: String },

    #[error("part {part} of {message} is malformed: {source}")]
    Format {
        message: &'static str,
        part: String,
        #[source]
        source: EncodingError,
    },

    #[error("invalid message description for {message}: {reason}")]
    Description { message: &'static str, reason: String },

    #[error("protocol violation: {0}")]
    Violation(String),

    #[error("signature verification failed: {0}")]
    InvalidSignature(String),

    #[error("message expired: {0}")]
    Expired(String),

    #[error("replayed message detected: {0}")]
    Replayed(String),

    #[error("{message} requires {required:?} protection but only {applied:?} was applied")]
    UnprotectedMessage { message: &'static str, required: String, applied: String },

    #[error(transparent)]
    DataBag(#[from] DataBagError),

    #[error(transparent)]
    Kvf(#[from] KvfError),

    #[error("{code}: {description}")]
    TokenEndpoint { code: TokenErrorCode, description: String },

    #[error("access token lacks required scope: {}", .required.join(" "))]
    InsufficientScope { required: Vec<String> },

    #[error("request carries no access token")]
    MissingAccessToken,

    #[error("signature with association {handle:?} must be verified directly with the provider")]
    DirectVerificationRequired { handle: String },

    #[error("host configuration error: {0}")]
    Host(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::MissingParts { .. }
            | ProtocolError::EmptyParts { .. }
            | ProtocolError::ConstantMismatch { .. }
            | ProtocolError::Violation(_)
            | ProtocolError::UnprotectedMessage { .. }
            | ProtocolError::TokenEndpoint { .. }
            | ProtocolError::InsufficientScope { .. }
            | ProtocolError::MissingAccessToken
            | ProtocolError::DirectVerificationRequired { .. } => ErrorKind::Violation,
            ProtocolError::Format { .. } | ProtocolError::Kvf(_) => ErrorKind::Format,
            ProtocolError::InvalidSignature(_) => ErrorKind::Tamper,
            ProtocolError::Expired(_) => ErrorKind::Expiration,
            ProtocolError::Replayed(_) => ErrorKind::Replay,
            ProtocolError::DataBag(bag) => match bag {
                DataBagError::BadSignature | DataBagError::MissingKey { .. } => ErrorKind::Tamper,
                DataBagError::Expired { .. } => ErrorKind::Expiration,
                DataBagError::Replayed => ErrorKind::Replay,
                DataBagError::Malformed(_) => ErrorKind::Format,
            },
            ProtocolError::Description { .. } | ProtocolError::Host(_) => ErrorKind::Host,
            ProtocolError::Transport(_) | ProtocolError::Cancelled => ErrorKind::Transport,
        }
    }

    pub fn violation(message: impl Into<String>) -> Self {
        ProtocolError::Violation(message.into())
    }

    pub fn token(code: TokenErrorCode, description: impl Into<String>) -> Self {
        ProtocolError::TokenEndpoint { code, description: description.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_bag_failures_are_classified_separately() {
        let kinds: Vec<ErrorKind> = [
            DataBagError::BadSignature,
            DataBagError::Expired { expired_at: Utc::now() },
            DataBagError::Replayed,
            DataBagError::Malformed("x".into()),
        ]
        .into_iter()
        .map(|e| ProtocolError::from(e).kind())
        .collect();
        assert_eq!(
            kinds,
            vec![ErrorKind::Tamper, ErrorKind::Expiration, ErrorKind::Replay, ErrorKind::Format]
        );
    }

    #[test]
    fn missing_parts_lists_names() {
        let err = ProtocolError::MissingParts { message: "Foo", parts: vec!["a".into(), "b".into()] };
        assert_eq!(err.to_string(), "Foo is missing required parts: a, b");
    }
}
