//! OAuth 2.0 authorization and token endpoint messages.

use std::collections::BTreeSet;

use url::Url;

use super::types::{AuthorizationDescription, GrantType, TokenErrorCode};
use crate::messaging::message::{MessageBase, impl_message, protocol_message_union};
use crate::messaging::{
    DescribedMessage, EncodingError, MessagePart, MessageRouting, MessageTransport, MessageUri, ProtocolError,
    ProtocolVersion, ScopeEncoder, ValueEncoder,
};

/// Every OAuth 2.0 message is described at this version.
pub const OAUTH2_VERSION: ProtocolVersion = ProtocolVersion::V2_0;

/// `token_type` of every issued access token.
pub const BEARER_TOKEN_TYPE: &str = "bearer";

#[derive(Debug, Default, Clone, Copy)]
pub struct TokenErrorCodeEncoder;

impl ValueEncoder<TokenErrorCode> for TokenErrorCodeEncoder {
    fn encode(&self, value: &TokenErrorCode) -> Result<String, EncodingError> {
        Ok(value.as_str().to_string())
    }

    fn decode(&self, value: &str) -> Result<TokenErrorCode, EncodingError> {
        TokenErrorCode::parse(value).ok_or_else(|| EncodingError::invalid(value, "unknown token endpoint error"))
    }
}

fn scope_part<M: 'static>(get: fn(&M) -> &Option<BTreeSet<String>>, get_mut: fn(&mut M) -> &mut Option<BTreeSet<String>>) -> MessagePart<M> {
    MessagePart::optional_with("scope", get, get_mut, ScopeEncoder)
}

/// Client credentials a token request may carry in its body, plus what
/// client authentication made of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// The client the request is attributed to once authentication ran.
    pub authenticated_client_id: Option<String>,
    /// Whether the client proved possession of its secret.
    pub client_authenticated: bool,
}

impl ClientCredentials {
    pub fn parts() -> Vec<MessagePart<ClientCredentials>> {
        vec![
            MessagePart::<ClientCredentials>::optional("client_id", |c| &c.client_id, |c| &mut c.client_id)
                .non_empty(),
            MessagePart::<ClientCredentials>::optional(
                "client_secret",
                |c| &c.client_secret,
                |c| &mut c.client_secret,
            )
            .security_sensitive(),
        ]
    }
}

/// Shared view of the four access token requests.
pub trait AccessTokenRequest {
    fn grant_type(&self) -> GrantType;

    fn credentials(&self) -> &ClientCredentials;

    fn credentials_mut(&mut self) -> &mut ClientCredentials;

    /// The scope named in the request, if the grant type allows one.
    fn requested_scope(&self) -> Option<&BTreeSet<String>> {
        None
    }

    /// The grant this request redeems, once known.
    fn authorization(&self) -> Option<&AuthorizationDescription>;

    fn set_authorization(&mut self, authorization: AuthorizationDescription);
}

macro_rules! access_token_request {
    ($ty:ty, $grant:expr) => {
        impl AccessTokenRequest for $ty {
            fn grant_type(&self) -> GrantType {
                $grant
            }

            fn credentials(&self) -> &ClientCredentials {
                &self.client
            }

            fn credentials_mut(&mut self) -> &mut ClientCredentials {
                &mut self.client
            }

            fn authorization(&self) -> Option<&AuthorizationDescription> {
                self.authorization.as_ref()
            }

            fn set_authorization(&mut self, authorization: AuthorizationDescription) {
                self.authorization = Some(authorization);
            }
        }
    };
    ($ty:ty, $grant:expr, scoped) => {
        impl AccessTokenRequest for $ty {
            fn grant_type(&self) -> GrantType {
                $grant
            }

            fn credentials(&self) -> &ClientCredentials {
                &self.client
            }

            fn credentials_mut(&mut self) -> &mut ClientCredentials {
                &mut self.client
            }

            fn requested_scope(&self) -> Option<&BTreeSet<String>> {
                self.scope.as_ref()
            }

            fn authorization(&self) -> Option<&AuthorizationDescription> {
                self.authorization.as_ref()
            }

            fn set_authorization(&mut self, authorization: AuthorizationDescription) {
                self.authorization = Some(authorization);
            }
        }
    };
}

/// Sent by the client, through the user agent, to ask for an authorization code.
#[derive(Debug, Clone, Default)]
pub struct EndUserAuthorizationRequest {
    pub base: MessageBase,
    /// The authorization endpoint.
    pub recipient: Option<Url>,
    pub client_id: String,
    pub redirect_uri: Option<MessageUri>,
    pub scope: Option<BTreeSet<String>>,
    pub state: Option<String>,
}

impl EndUserAuthorizationRequest {
    pub fn new(authorization_endpoint: Url, client_id: impl Into<String>) -> Self {
        Self {
            base: MessageBase::new(OAUTH2_VERSION),
            recipient: Some(authorization_endpoint),
            client_id: client_id.into(),
            ..Default::default()
        }
    }
}

impl_message!(EndUserAuthorizationRequest);

impl DescribedMessage for EndUserAuthorizationRequest {
    fn declare_parts() -> Vec<MessagePart<Self>> {
        vec![
            MessagePart::constant("response_type", "code"),
            MessagePart::<Self>::value("client_id", |m| &m.client_id, |m| &mut m.client_id).required().non_empty(),
            MessagePart::<Self>::optional("redirect_uri", |m| &m.redirect_uri, |m| &mut m.redirect_uri).non_empty(),
            scope_part(|m: &Self| &m.scope, |m: &mut Self| &mut m.scope),
            MessagePart::<Self>::optional("state", |m| &m.state, |m| &mut m.state),
        ]
    }

    fn new_for_version(version: ProtocolVersion) -> Self {
        Self { base: MessageBase::new(version), ..Default::default() }
    }
}

impl MessageRouting for EndUserAuthorizationRequest {
    const KIND: &'static str = "EndUserAuthorizationRequest";

    fn transport(&self) -> MessageTransport {
        MessageTransport::Indirect
    }

    fn recipient(&self) -> Option<&Url> {
        self.recipient.as_ref()
    }
}

/// Carries the authorization code back to the client's callback.
#[derive(Debug, Clone, Default)]
pub struct EndUserAuthorizationSuccessCodeResponse {
    pub base: MessageBase,
    /// The client callback.
    pub recipient: Option<Url>,
    /// Filled in by token serialization on the way out.
    pub code: Option<String>,
    pub state: Option<String>,
    /// What the user approved.
    pub authorization: Option<AuthorizationDescription>,
    /// The redirect_uri named in the authorization request, which the token
    /// request must repeat.
    pub requested_callback: Option<Url>,
}

impl_message!(EndUserAuthorizationSuccessCodeResponse);

impl DescribedMessage for EndUserAuthorizationSuccessCodeResponse {
    fn declare_parts() -> Vec<MessagePart<Self>> {
        vec![
            MessagePart::<Self>::optional("code", |m| &m.code, |m| &mut m.code)
                .required()
                .non_empty()
                .security_sensitive(),
            MessagePart::<Self>::optional("state", |m| &m.state, |m| &mut m.state),
        ]
    }

    fn new_for_version(version: ProtocolVersion) -> Self {
        Self { base: MessageBase::new(version), ..Default::default() }
    }
}

impl MessageRouting for EndUserAuthorizationSuccessCodeResponse {
    const KIND: &'static str = "EndUserAuthorizationSuccessCodeResponse";

    fn transport(&self) -> MessageTransport {
        MessageTransport::Indirect
    }

    fn recipient(&self) -> Option<&Url> {
        self.recipient.as_ref()
    }
}

/// Tells the client the user (or the server) declined.
#[derive(Debug, Clone, Default)]
pub struct EndUserAuthorizationFailedResponse {
    pub base: MessageBase,
    pub recipient: Option<Url>,
    pub error: String,
    pub error_description: Option<String>,
    pub state: Option<String>,
}

impl EndUserAuthorizationFailedResponse {
    pub fn new(callback: Url, error: impl Into<String>) -> Self {
        Self {
            base: MessageBase::new(OAUTH2_VERSION),
            recipient: Some(callback),
            error: error.into(),
            ..Default::default()
        }
    }
}

impl_message!(EndUserAuthorizationFailedResponse);

impl DescribedMessage for EndUserAuthorizationFailedResponse {
    fn declare_parts() -> Vec<MessagePart<Self>> {
        vec![
            MessagePart::<Self>::value("error", |m| &m.error, |m| &mut m.error).required().non_empty(),
            MessagePart::<Self>::optional("error_description", |m| &m.error_description, |m| &mut m.error_description),
            MessagePart::<Self>::optional("state", |m| &m.state, |m| &mut m.state),
        ]
    }

    fn new_for_version(version: ProtocolVersion) -> Self {
        Self { base: MessageBase::new(version), ..Default::default() }
    }
}

impl MessageRouting for EndUserAuthorizationFailedResponse {
    const KIND: &'static str = "EndUserAuthorizationFailedResponse";

    fn transport(&self) -> MessageTransport {
        MessageTransport::Indirect
    }

    fn recipient(&self) -> Option<&Url> {
        self.recipient.as_ref()
    }
}

/// Redeems an authorization code.
#[derive(Debug, Clone, Default)]
pub struct AccessTokenAuthorizationCodeRequest {
    pub base: MessageBase,
    /// The token endpoint.
    pub recipient: Option<Url>,
    pub code: String,
    pub redirect_uri: Option<MessageUri>,
    pub client: ClientCredentials,
    pub authorization: Option<AuthorizationDescription>,
    /// SHA-256 of the callback the code was issued for, read from the code.
    pub callback_hash: Option<Vec<u8>>,
}

impl_message!(AccessTokenAuthorizationCodeRequest);

impl DescribedMessage for AccessTokenAuthorizationCodeRequest {
    fn declare_parts() -> Vec<MessagePart<Self>> {
        let mut parts = vec![
            MessagePart::constant("grant_type", GrantType::AuthorizationCode.as_str()),
            MessagePart::<Self>::value("code", |m| &m.code, |m| &mut m.code)
                .required()
                .non_empty()
                .security_sensitive(),
            MessagePart::<Self>::optional("redirect_uri", |m| &m.redirect_uri, |m| &mut m.redirect_uri).non_empty(),
        ];
        parts.extend(MessagePart::inherit(ClientCredentials::parts(), |m: &Self| &m.client, |m: &mut Self| &mut m.client));
        parts
    }

    fn new_for_version(version: ProtocolVersion) -> Self {
        Self { base: MessageBase::new(version), ..Default::default() }
    }
}

impl MessageRouting for AccessTokenAuthorizationCodeRequest {
    const KIND: &'static str = "AccessTokenAuthorizationCodeRequest";

    fn transport(&self) -> MessageTransport {
        MessageTransport::DirectRequest
    }

    fn recipient(&self) -> Option<&Url> {
        self.recipient.as_ref()
    }
}

access_token_request!(AccessTokenAuthorizationCodeRequest, GrantType::AuthorizationCode);

/// Trades a refresh token for a new access token, optionally narrowing scope.
#[derive(Debug, Clone, Default)]
pub struct AccessTokenRefreshRequest {
    pub base: MessageBase,
    pub recipient: Option<Url>,
    pub refresh_token: String,
    pub scope: Option<BTreeSet<String>>,
    pub client: ClientCredentials,
    pub authorization: Option<AuthorizationDescription>,
}

impl_message!(AccessTokenRefreshRequest);

impl DescribedMessage for AccessTokenRefreshRequest {
    fn declare_parts() -> Vec<MessagePart<Self>> {
        let mut parts = vec![
            MessagePart::constant("grant_type", GrantType::RefreshToken.as_str()),
            MessagePart::<Self>::value("refresh_token", |m| &m.refresh_token, |m| &mut m.refresh_token)
                .required()
                .non_empty()
                .security_sensitive(),
            scope_part(|m: &Self| &m.scope, |m: &mut Self| &mut m.scope),
        ];
        parts.extend(MessagePart::inherit(ClientCredentials::parts(), |m: &Self| &m.client, |m: &mut Self| &mut m.client));
        parts
    }

    fn new_for_version(version: ProtocolVersion) -> Self {
        Self { base: MessageBase::new(version), ..Default::default() }
    }
}

impl MessageRouting for AccessTokenRefreshRequest {
    const KIND: &'static str = "AccessTokenRefreshRequest";

    fn transport(&self) -> MessageTransport {
        MessageTransport::DirectRequest
    }

    fn recipient(&self) -> Option<&Url> {
        self.recipient.as_ref()
    }
}

access_token_request!(AccessTokenRefreshRequest, GrantType::RefreshToken, scoped);

/// The resource owner password credentials grant.
#[derive(Debug, Clone, Default)]
pub struct AccessTokenResourceOwnerPasswordRequest {
    pub base: MessageBase,
    pub recipient: Option<Url>,
    pub username: String,
    pub password: String,
    pub scope: Option<BTreeSet<String>>,
    pub client: ClientCredentials,
    pub authorization: Option<AuthorizationDescription>,
}

impl_message!(AccessTokenResourceOwnerPasswordRequest);

impl DescribedMessage for AccessTokenResourceOwnerPasswordRequest {
    fn declare_parts() -> Vec<MessagePart<Self>> {
        let mut parts = vec![
            MessagePart::constant("grant_type", GrantType::Password.as_str()),
            MessagePart::<Self>::value("username", |m| &m.username, |m| &mut m.username).required().non_empty(),
            MessagePart::<Self>::value("password", |m| &m.password, |m| &mut m.password)
                .required()
                .security_sensitive(),
            scope_part(|m: &Self| &m.scope, |m: &mut Self| &mut m.scope),
        ];
        parts.extend(MessagePart::inherit(ClientCredentials::parts(), |m: &Self| &m.client, |m: &mut Self| &mut m.client));
        parts
    }

    fn new_for_version(version: ProtocolVersion) -> Self {
        Self { base: MessageBase::new(version), ..Default::default() }
    }
}

impl MessageRouting for AccessTokenResourceOwnerPasswordRequest {
    const KIND: &'static str = "AccessTokenResourceOwnerPasswordRequest";

    fn transport(&self) -> MessageTransport {
        MessageTransport::DirectRequest
    }

    fn recipient(&self) -> Option<&Url> {
        self.recipient.as_ref()
    }
}

access_token_request!(AccessTokenResourceOwnerPasswordRequest, GrantType::Password, scoped);

/// A client acting on its own behalf.
#[derive(Debug, Clone, Default)]
pub struct AccessTokenClientCredentialsRequest {
    pub base: MessageBase,
    pub recipient: Option<Url>,
    pub scope: Option<BTreeSet<String>>,
    pub client: ClientCredentials,
    pub authorization: Option<AuthorizationDescription>,
}

impl_message!(AccessTokenClientCredentialsRequest);

impl DescribedMessage for AccessTokenClientCredentialsRequest {
    fn declare_parts() -> Vec<MessagePart<Self>> {
        let mut parts = vec![
            MessagePart::constant("grant_type", GrantType::ClientCredentials.as_str()),
            scope_part(|m: &Self| &m.scope, |m: &mut Self| &mut m.scope),
        ];
        parts.extend(MessagePart::inherit(ClientCredentials::parts(), |m: &Self| &m.client, |m: &mut Self| &mut m.client));
        parts
    }

    fn new_for_version(version: ProtocolVersion) -> Self {
        Self { base: MessageBase::new(version), ..Default::default() }
    }
}

impl MessageRouting for AccessTokenClientCredentialsRequest {
    const KIND: &'static str = "AccessTokenClientCredentialsRequest";

    fn transport(&self) -> MessageTransport {
        MessageTransport::DirectRequest
    }

    fn recipient(&self) -> Option<&Url> {
        self.recipient.as_ref()
    }
}

access_token_request!(AccessTokenClientCredentialsRequest, GrantType::ClientCredentials, scoped);

/// The issued access token, serialized as JSON.
#[derive(Debug, Clone, Default)]
pub struct AccessTokenSuccessResponse {
    pub base: MessageBase,
    /// Filled in by token serialization on the way out.
    pub access_token: Option<String>,
    pub expires_in: Option<u64>,
    pub refresh_token: Option<String>,
    pub scope: Option<BTreeSet<String>>,
    /// The grant the tokens are minted from.
    pub authorization: Option<AuthorizationDescription>,
    pub grant_type: Option<GrantType>,
    pub include_refresh_token: bool,
}

impl AccessTokenSuccessResponse {
    pub fn new(authorization: AuthorizationDescription, grant_type: GrantType) -> Self {
        Self {
            base: MessageBase::new(OAUTH2_VERSION),
            scope: Some(authorization.scope.clone()),
            authorization: Some(authorization),
            grant_type: Some(grant_type),
            include_refresh_token: grant_type != GrantType::ClientCredentials,
            ..Default::default()
        }
    }

    fn check(&self) -> Result<(), ProtocolError> {
        if self.grant_type == Some(GrantType::ClientCredentials) && self.refresh_token.is_some() {
            return Err(ProtocolError::violation("client credentials grants never issue refresh tokens"));
        }
        Ok(())
    }
}

impl_message!(AccessTokenSuccessResponse, ensure_valid = check);

impl DescribedMessage for AccessTokenSuccessResponse {
    fn declare_parts() -> Vec<MessagePart<Self>> {
        vec![
            MessagePart::<Self>::optional("access_token", |m| &m.access_token, |m| &mut m.access_token)
                .required()
                .non_empty()
                .security_sensitive(),
            MessagePart::constant("token_type", BEARER_TOKEN_TYPE),
            MessagePart::<Self>::optional("expires_in", |m| &m.expires_in, |m| &mut m.expires_in),
            MessagePart::<Self>::optional("refresh_token", |m| &m.refresh_token, |m| &mut m.refresh_token)
                .non_empty()
                .security_sensitive(),
            scope_part(|m: &Self| &m.scope, |m: &mut Self| &mut m.scope),
        ]
    }

    fn new_for_version(version: ProtocolVersion) -> Self {
        Self { base: MessageBase::new(version), ..Default::default() }
    }
}

impl MessageRouting for AccessTokenSuccessResponse {
    const KIND: &'static str = "AccessTokenSuccessResponse";

    fn transport(&self) -> MessageTransport {
        MessageTransport::DirectResponse
    }
}

/// A token endpoint error, serialized as JSON.
#[derive(Debug, Clone, Default)]
pub struct AccessTokenFailedResponse {
    pub base: MessageBase,
    pub error: TokenErrorCode,
    pub error_description: Option<String>,
}

impl AccessTokenFailedResponse {
    pub fn new(error: TokenErrorCode, description: Option<String>) -> Self {
        Self { base: MessageBase::new(OAUTH2_VERSION), error, error_description: description }
    }
}

impl_message!(AccessTokenFailedResponse);

impl DescribedMessage for AccessTokenFailedResponse {
    fn declare_parts() -> Vec<MessagePart<Self>> {
        vec![
            MessagePart::<Self>::value_with("error", |m| &m.error, |m| &mut m.error, TokenErrorCodeEncoder).required(),
            MessagePart::<Self>::optional("error_description", |m| &m.error_description, |m| &mut m.error_description),
        ]
    }

    fn new_for_version(version: ProtocolVersion) -> Self {
        Self { base: MessageBase::new(version), ..Default::default() }
    }
}

impl MessageRouting for AccessTokenFailedResponse {
    const KIND: &'static str = "AccessTokenFailedResponse";

    fn transport(&self) -> MessageTransport {
        MessageTransport::DirectResponse
    }

    fn http_status(&self) -> u16 {
        self.error.http_status()
    }
}

protocol_message_union! {
    #[derive(Debug, Clone)]
    pub enum OAuth2Message {
        EndUserAuthorizationRequest(EndUserAuthorizationRequest),
        EndUserAuthorizationSuccessCodeResponse(EndUserAuthorizationSuccessCodeResponse),
        EndUserAuthorizationFailedResponse(EndUserAuthorizationFailedResponse),
        AccessTokenAuthorizationCodeRequest(AccessTokenAuthorizationCodeRequest),
        AccessTokenRefreshRequest(AccessTokenRefreshRequest),
        AccessTokenResourceOwnerPasswordRequest(AccessTokenResourceOwnerPasswordRequest),
        AccessTokenClientCredentialsRequest(AccessTokenClientCredentialsRequest),
        AccessTokenSuccessResponse(AccessTokenSuccessResponse),
        AccessTokenFailedResponse(AccessTokenFailedResponse),
    }
}

impl OAuth2Message {
    pub fn as_token_request(&self) -> Option<&dyn AccessTokenRequest> {
        match self {
            OAuth2Message::AccessTokenAuthorizationCodeRequest(m) => Some(m),
            OAuth2Message::AccessTokenRefreshRequest(m) => Some(m),
            OAuth2Message::AccessTokenResourceOwnerPasswordRequest(m) => Some(m),
            OAuth2Message::AccessTokenClientCredentialsRequest(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_token_request_mut(&mut self) -> Option<&mut dyn AccessTokenRequest> {
        match self {
            OAuth2Message::AccessTokenAuthorizationCodeRequest(m) => Some(m),
            OAuth2Message::AccessTokenRefreshRequest(m) => Some(m),
            OAuth2Message::AccessTokenResourceOwnerPasswordRequest(m) => Some(m),
            OAuth2Message::AccessTokenClientCredentialsRequest(m) => Some(m),
            _ => None,
        }
    }
}
