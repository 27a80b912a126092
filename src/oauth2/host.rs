use std::collections::BTreeSet;
use std::sync::Arc;

use super::authorization::AccessTokenParameters;
use super::types::{AuthorizationDescription, ClientDescription, GrantDecision};
use crate::messaging::{CryptoKeyStore, NonceStore, ProtocolError};

/// What an authorization server needs from the application hosting it.
///
/// `Err` from any method is a host failure and reaches the client as
/// `server_error`.
pub trait AuthorizationServerHost: Send + Sync {
    /// Keys for codes, refresh tokens and symmetric access tokens.
    fn crypto_key_store(&self) -> Arc<dyn CryptoKeyStore>;

    /// Tracks redeemed authorization codes. Must remember entries at least
    /// as long as the authorization code lifetime.
    fn nonce_store(&self) -> Arc<dyn NonceStore>;

    fn get_client(&self, client_id: &str) -> Result<Option<Arc<dyn ClientDescription>>, ProtocolError>;

    /// Whether a grant still stands, e.g. the user has not revoked it since
    /// it was issued.
    fn is_authorization_valid(&self, authorization: &AuthorizationDescription) -> Result<bool, ProtocolError>;

    fn check_resource_owner_credentials(
        &self,
        user_name: &str,
        password: &str,
        client_id: Option<&str>,
        scope: &BTreeSet<String>,
    ) -> Result<GrantDecision, ProtocolError>;

    fn check_client_credentials_grant(
        &self,
        client_id: &str,
        scope: &BTreeSet<String>,
    ) -> Result<GrantDecision, ProtocolError>;

    fn access_token_parameters(&self, _authorization: &AuthorizationDescription) -> AccessTokenParameters {
        AccessTokenParameters::default()
    }
}
