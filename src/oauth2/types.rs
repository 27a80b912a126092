//! OAuth 2.0 primitives: clients, authorizations and token endpoint errors.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use url::Url;

/// Error codes a token endpoint answers with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenErrorCode {
    #[default]
    InvalidRequest,
    InvalidClient,
    InvalidGrant,
    UnauthorizedClient,
    UnsupportedGrantType,
    InvalidScope,
    /// The host failed; never reported as the client's fault.
    ServerError,
}

impl TokenErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenErrorCode::InvalidRequest => "invalid_request",
            TokenErrorCode::InvalidClient => "invalid_client",
            TokenErrorCode::InvalidGrant => "invalid_grant",
            TokenErrorCode::UnauthorizedClient => "unauthorized_client",
            TokenErrorCode::UnsupportedGrantType => "unsupported_grant_type",
            TokenErrorCode::InvalidScope => "invalid_scope",
            TokenErrorCode::ServerError => "server_error",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        Some(match code {
            "invalid_request" => TokenErrorCode::InvalidRequest,
            "invalid_client" => TokenErrorCode::InvalidClient,
            "invalid_grant" => TokenErrorCode::InvalidGrant,
            "unauthorized_client" => TokenErrorCode::UnauthorizedClient,
            "unsupported_grant_type" => TokenErrorCode::UnsupportedGrantType,
            "invalid_scope" => TokenErrorCode::InvalidScope,
            "server_error" => TokenErrorCode::ServerError,
            _ => return None,
        })
    }

    pub fn http_status(&self) -> u16 {
        match self {
            TokenErrorCode::InvalidClient => 401,
            TokenErrorCode::ServerError => 500,
            _ => 400,
        }
    }
}

impl fmt::Display for TokenErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GrantType {
    AuthorizationCode,
    RefreshToken,
    Password,
    ClientCredentials,
}

impl GrantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::AuthorizationCode => "authorization_code",
            GrantType::RefreshToken => "refresh_token",
            GrantType::Password => "password",
            GrantType::ClientCredentials => "client_credentials",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "authorization_code" => GrantType::AuthorizationCode,
            "refresh_token" => GrantType::RefreshToken,
            "password" => GrantType::Password,
            "client_credentials" => GrantType::ClientCredentials,
            _ => return None,
        })
    }
}

impl fmt::Display for GrantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the authorization server knows about a registered client.
pub trait ClientDescription: Send + Sync {
    fn client_id(&self) -> &str;

    /// Callback used when an authorization request names none.
    fn default_callback(&self) -> Option<&Url>;

    /// Confidential clients have a secret; public clients do not.
    fn has_secret(&self) -> bool;

    /// Compares in constant time.
    fn is_valid_secret(&self, secret: &str) -> bool;

    fn is_callback_allowed(&self, callback: &Url) -> bool;
}

/// A registered OAuth 2.0 client application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub id: String,
    pub secret: Option<String>,
    /// Allowed redirect URIs. A callback matches when scheme, authority and
    /// path are equal; its query string may differ.
    pub redirect_uris: Vec<Url>,
}

impl Client {
    pub fn new(id: impl Into<String>, secret: Option<&str>, redirect_uris: Vec<Url>) -> Self {
        Self { id: id.into(), secret: secret.map(str::to_string), redirect_uris }
    }
}

impl ClientDescription for Client {
    fn client_id(&self) -> &str {
        &self.id
    }

    fn default_callback(&self) -> Option<&Url> {
        self.redirect_uris.first()
    }

    fn has_secret(&self) -> bool {
        self.secret.as_deref().is_some_and(|s| !s.is_empty())
    }

    fn is_valid_secret(&self, secret: &str) -> bool {
        match self.secret.as_deref() {
            Some(expected) if !expected.is_empty() => bool::from(expected.as_bytes().ct_eq(secret.as_bytes())),
            _ => false,
        }
    }

    fn is_callback_allowed(&self, callback: &Url) -> bool {
        self.redirect_uris.iter().any(|allowed| {
            allowed.scheme() == callback.scheme()
                && allowed.host_str() == callback.host_str()
                && allowed.port_or_known_default() == callback.port_or_known_default()
                && allowed.path() == callback.path()
        })
    }
}

/// A grant of access: who authorized which client for what, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationDescription {
    pub client_id: String,
    /// Absent for client credentials grants.
    pub user: Option<String>,
    pub scope: BTreeSet<String>,
    pub utc_issued: DateTime<Utc>,
}

/// The host's answer to a resource owner password or client credentials grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantDecision {
    /// Granted, with the canonical user name (when a user is involved) and
    /// the scope actually approved.
    Approved { user: Option<String>, scope: BTreeSet<String> },
    Rejected,
    /// The host does not offer this grant type at all.
    NotSupported,
}

/// `true` when every requested scope token is granted.
pub fn is_scope_satisfied(requested: &BTreeSet<String>, granted: &BTreeSet<String>) -> bool {
    requested.is_subset(granted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Client {
        Client::new("app", Some("s3cret"), vec![Url::parse("https://app.example/cb").unwrap()])
    }

    #[test]
    fn error_codes_round_trip_and_map_status() {
        for code in [
            TokenErrorCode::InvalidRequest,
            TokenErrorCode::InvalidClient,
            TokenErrorCode::InvalidGrant,
            TokenErrorCode::UnauthorizedClient,
            TokenErrorCode::UnsupportedGrantType,
            TokenErrorCode::InvalidScope,
        ] {
            assert_eq!(TokenErrorCode::parse(code.as_str()), Some(code));
        }
        assert_eq!(TokenErrorCode::InvalidClient.http_status(), 401);
        assert_eq!(TokenErrorCode::InvalidScope.http_status(), 400);
    }

    #[test]
    fn callbacks_match_on_path_and_ignore_query() {
        let client = client();
        assert!(client.is_callback_allowed(&Url::parse("https://app.example/cb?state=1").unwrap()));
        assert!(!client.is_callback_allowed(&Url::parse("https://app.example/other").unwrap()));
        assert!(!client.is_callback_allowed(&Url::parse("http://app.example/cb").unwrap()));
    }

    #[test]
    fn secrets_compare_exactly() {
        let client = client();
        assert!(client.is_valid_secret("s3cret"));
        assert!(!client.is_valid_secret("s3cre"));
        let public = Client::new("spa", None, vec![]);
        assert!(!public.has_secret());
        assert!(!public.is_valid_secret(""));
    }

    #[test]
    fn scope_containment() {
        let granted: BTreeSet<String> = ["read", "write"].iter().map(|s| s.to_string()).collect();
        let read: BTreeSet<String> = ["read"].iter().map(|s| s.to_string()).collect();
        let admin: BTreeSet<String> = ["read", "admin"].iter().map(|s| s.to_string()).collect();
        assert!(is_scope_satisfied(&read, &granted));
        assert!(is_scope_satisfied(&granted, &granted));
        assert!(!is_scope_satisfied(&admin, &granted));
    }
}
