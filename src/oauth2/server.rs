use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{error, info, instrument, warn};
use url::Url;

use super::authorization::BagServices;
use super::client_auth::AggregatingClientAuthentication;
use super::elements::{
    ClientAuthenticationBindingElement, MessageValidationBindingElement, TokenCodeSerializationBindingElement,
};
use super::factory::OAuth2MessageFactory;
use super::host::AuthorizationServerHost;
use super::messages::{
    AccessTokenFailedResponse, AccessTokenSuccessResponse, EndUserAuthorizationFailedResponse,
    EndUserAuthorizationRequest, EndUserAuthorizationSuccessCodeResponse, OAUTH2_VERSION, OAuth2Message,
};
use super::types::{AuthorizationDescription, TokenErrorCode};
use crate::config::MessagingSettings;
use crate::messaging::http::CONTENT_TYPE_JSON;
use crate::messaging::message::MessageBase;
use crate::messaging::{
    Channel, Clock, DirectEncoding, ErrorKind, HttpRequest, HttpResponse, MessageDescriptions, ProtocolError,
    ProtocolMessage, RandomSource, SystemClock, SystemRandomSource,
};

/// Parts of a JSON token response written as numbers.
pub const NUMERIC_TOKEN_PARTS: &[&str] = &["expires_in"];

/// The wire error a failed token request is answered with.
pub fn token_error(error: &ProtocolError) -> (TokenErrorCode, Option<String>) {
    match error {
        ProtocolError::TokenEndpoint { code, description } => (*code, Some(description.clone())),
        ProtocolError::DataBag(_)
        | ProtocolError::Expired(_)
        | ProtocolError::Replayed(_)
        | ProtocolError::InvalidSignature(_) => {
            (TokenErrorCode::InvalidGrant, Some("the grant is invalid, expired or already used".to_string()))
        }
        other if other.kind() == ErrorKind::Host => (TokenErrorCode::ServerError, None),
        other => (TokenErrorCode::InvalidRequest, Some(other.to_string())),
    }
}

/// An OAuth 2.0 authorization server: the authorization endpoint's
/// request and response handling plus the token endpoint.
pub struct AuthorizationServer {
    host: Arc<dyn AuthorizationServerHost>,
    channel: Channel<OAuth2Message>,
}

impl AuthorizationServer {
    pub fn new(host: Arc<dyn AuthorizationServerHost>, settings: MessagingSettings) -> Result<Self, ProtocolError> {
        Self::with_clock(host, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        host: Arc<dyn AuthorizationServerHost>,
        settings: MessagingSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ProtocolError> {
        let services = BagServices {
            clock,
            random: Arc::new(SystemRandomSource::new()) as Arc<dyn RandomSource>,
            descriptions: Arc::new(MessageDescriptions::new()),
        };
        let channel = Channel::<OAuth2Message>::builder(Arc::new(OAuth2MessageFactory))
            .element(Arc::new(MessageValidationBindingElement::new(host.clone())))
            .element(Arc::new(TokenCodeSerializationBindingElement::new(
                host.clone(),
                settings.clone(),
                services.clone(),
            )))
            .element(Arc::new(ClientAuthenticationBindingElement::new(
                host.clone(),
                AggregatingClientAuthentication::default(),
            )))
            .settings(settings)
            .descriptions(services.descriptions)
            .clock(services.clock)
            .random(services.random)
            .direct_encoding(DirectEncoding::Json { numeric_parts: NUMERIC_TOKEN_PARTS })
            .build()?;
        Ok(Self { host, channel })
    }

    pub fn channel(&self) -> &Channel<OAuth2Message> {
        &self.channel
    }

    pub fn host(&self) -> &Arc<dyn AuthorizationServerHost> {
        &self.host
    }

    /// Reads an authorization request arriving at the authorization endpoint.
    /// Requests from unknown clients or for unregistered callbacks fail.
    #[instrument(skip_all, fields(path = %request.url.path()))]
    pub fn read_authorization_request(
        &self,
        request: &HttpRequest,
    ) -> Result<Option<EndUserAuthorizationRequest>, ProtocolError> {
        match self.channel.receive(request)? {
            Some(OAuth2Message::EndUserAuthorizationRequest(authorization)) => Ok(Some(authorization)),
            Some(other) => Err(ProtocolError::violation(format!("{} sent to the authorization endpoint", other.kind()))),
            None => Ok(None),
        }
    }

    fn callback(&self, request: &EndUserAuthorizationRequest) -> Result<Url, ProtocolError> {
        if let Some(uri) = &request.redirect_uri {
            return Ok(uri.url().clone());
        }
        self.host
            .get_client(&request.client_id)?
            .and_then(|client| client.default_callback().cloned())
            .ok_or_else(|| ProtocolError::violation(format!("no callback for client {}", request.client_id)))
    }

    /// The response granting `request` on behalf of `user`. `scope` narrows
    /// what the client asked for; `None` approves the request as made.
    pub fn prepare_approved_authorization(
        &self,
        request: &EndUserAuthorizationRequest,
        user: &str,
        scope: Option<BTreeSet<String>>,
    ) -> Result<EndUserAuthorizationSuccessCodeResponse, ProtocolError> {
        let callback = self.callback(request)?;
        let scope = scope.or_else(|| request.scope.clone()).unwrap_or_default();
        info!(client = %request.client_id, user, "authorization approved");
        Ok(EndUserAuthorizationSuccessCodeResponse {
            base: MessageBase::new(OAUTH2_VERSION),
            recipient: Some(callback),
            code: None,
            state: request.state.clone(),
            authorization: Some(AuthorizationDescription {
                client_id: request.client_id.clone(),
                user: Some(user.to_string()),
                scope,
                utc_issued: self.channel.clock().now(),
            }),
            requested_callback: request.redirect_uri.as_ref().map(|uri| uri.url().clone()),
        })
    }

    pub fn prepare_rejected_authorization(
        &self,
        request: &EndUserAuthorizationRequest,
    ) -> Result<EndUserAuthorizationFailedResponse, ProtocolError> {
        let mut response = EndUserAuthorizationFailedResponse::new(self.callback(request)?, "access_denied");
        response.state = request.state.clone();
        info!(client = %request.client_id, "authorization denied");
        Ok(response)
    }

    /// Renders an authorization endpoint response as a redirect to the client.
    pub fn send(&self, message: impl Into<OAuth2Message>) -> Result<HttpResponse, ProtocolError> {
        self.channel.send(message.into())
    }

    /// Answers a token endpoint request. Failures become JSON error bodies.
    #[instrument(skip_all, fields(path = %request.url.path()))]
    pub fn handle_token_request(&self, request: &HttpRequest) -> HttpResponse {
        let response = self.issue_token(request).unwrap_or_else(|e| {
            let (code, description) = token_error(&e);
            match e.kind() {
                ErrorKind::Host => error!(error = %e, "token request failed on the host"),
                kind => warn!(error = %e, ?kind, %code, "token request refused"),
            }
            AccessTokenFailedResponse::new(code, description).into()
        });
        let status = response.http_status();
        let rendered = self.channel.send(response).unwrap_or_else(|e| {
            error!(error = %e, "cannot encode token response");
            HttpResponse::new(500, CONTENT_TYPE_JSON, br#"{"error":"server_error"}"#.to_vec())
        });
        if status == 401 {
            rendered.with_header("WWW-Authenticate", "Basic")
        } else {
            rendered
        }
    }

    fn issue_token(&self, request: &HttpRequest) -> Result<OAuth2Message, ProtocolError> {
        let message = self.channel.receive_required(request)?;
        let token_request = message
            .as_token_request()
            .ok_or_else(|| ProtocolError::violation("request is not an access token request"))?;
        let grant_type = token_request.grant_type();
        let authorization = token_request
            .authorization()
            .cloned()
            .ok_or_else(|| ProtocolError::Host("token request left without a grant".to_string()))?;
        Ok(AccessTokenSuccessResponse::new(authorization, grant_type).into())
    }
}
