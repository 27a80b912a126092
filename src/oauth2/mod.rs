//! OAuth 2.0 authorization server and resource server support.
//!
//! Codes and tokens are self-contained data bags; the server keeps no
//! per-grant state beyond redeemed code nonces and revocations.

pub mod authorization;
pub mod client_auth;
pub mod elements;
pub mod factory;
pub mod host;
pub mod memory;
pub mod messages;
pub mod resource_server;
pub mod server;
pub mod types;

pub use authorization::{
    AccessToken, AccessTokenParameters, AccessTokenSigning, AccessTokenVerification, AuthorizationCode,
    BagServices, RefreshToken,
};
pub use client_auth::{
    AggregatingClientAuthentication, ClientAuthenticationModule, ClientAuthenticationResult,
    HttpBasicAuthentication, MessagePartAuthentication,
};
pub use factory::OAuth2MessageFactory;
pub use host::AuthorizationServerHost;
pub use memory::{InMemoryAuthorizationServerHost, InMemoryClientStore};
pub use messages::{
    AccessTokenAuthorizationCodeRequest, AccessTokenClientCredentialsRequest, AccessTokenFailedResponse,
    AccessTokenRefreshRequest, AccessTokenRequest, AccessTokenResourceOwnerPasswordRequest,
    AccessTokenSuccessResponse, ClientCredentials, EndUserAuthorizationFailedResponse, EndUserAuthorizationRequest,
    EndUserAuthorizationSuccessCodeResponse, OAuth2Message,
};
pub use resource_server::{AccessTokenAnalyzer, ResourceServer, StandardAccessTokenAnalyzer};
pub use server::{AuthorizationServer, token_error};
pub use types::{
    AuthorizationDescription, Client, ClientDescription, GrantDecision, GrantType, TokenErrorCode,
    is_scope_satisfied,
};

pub const AUTHORIZATION_CODE_BUCKET: &str = "https://localhost/dnoa/oauth_authorization_code";
pub const REFRESH_TOKEN_BUCKET: &str = "https://localhost/dnoa/oauth_refresh_token";
pub const ACCESS_TOKEN_BUCKET: &str = "https://localhost/dnoa/oauth_access_token";
