//! Authorization server binding elements.
//!
//! Incoming token requests pass client authentication first, then token and
//! code deserialization, then validation against the recovered grant.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::authorization::{AccessToken, AuthorizationCode, BagServices, RefreshToken, callback_hash};
use super::client_auth::{AggregatingClientAuthentication, ClientAuthenticationResult};
use super::host::AuthorizationServerHost;
use super::messages::{AccessTokenRequest, OAuth2Message};
use super::types::{AuthorizationDescription, GrantDecision, GrantType, TokenErrorCode, is_scope_satisfied};
use crate::config::MessagingSettings;
use crate::messaging::{
    ChannelBindingElement, ChannelContext, DataBagFormatter, ProtocolError, Protections,
};

pub const CLIENT_AUTHENTICATION: &str = "oauth2.client_authentication";
pub const TOKEN_CODE_SERIALIZATION: &str = "oauth2.token_code_serialization";
pub const MESSAGE_VALIDATION: &str = "oauth2.message_validation";

/// Authenticates the client behind every token request.
pub struct ClientAuthenticationBindingElement {
    host: Arc<dyn AuthorizationServerHost>,
    modules: AggregatingClientAuthentication,
}

impl ClientAuthenticationBindingElement {
    pub fn new(host: Arc<dyn AuthorizationServerHost>, modules: AggregatingClientAuthentication) -> Self {
        Self { host, modules }
    }
}

impl ChannelBindingElement<OAuth2Message> for ClientAuthenticationBindingElement {
    fn name(&self) -> &'static str {
        CLIENT_AUTHENTICATION
    }

    fn protection(&self) -> Protections {
        Protections::NONE
    }

    fn process_outgoing(
        &self,
        _message: &mut OAuth2Message,
        _context: &ChannelContext<'_>,
    ) -> Result<Option<Protections>, ProtocolError> {
        Ok(None)
    }

    fn process_incoming(
        &self,
        message: &mut OAuth2Message,
        context: &ChannelContext<'_>,
    ) -> Result<Option<Protections>, ProtocolError> {
        let Some(request) = message.as_token_request_mut() else {
            return Ok(None);
        };
        let grant_type = request.grant_type();
        let result = self.modules.authenticate(self.host.as_ref(), request.credentials(), context.request)?;
        let credentials = request.credentials_mut();
        match result {
            ClientAuthenticationResult::ClientAuthenticated(id) => {
                debug!(client = %id, "client authenticated");
                credentials.authenticated_client_id = Some(id);
                credentials.client_authenticated = true;
            }
            ClientAuthenticationResult::ClientIdNotAuthenticated(id) => {
                if grant_type == GrantType::ClientCredentials {
                    return Err(ProtocolError::token(
                        TokenErrorCode::InvalidClient,
                        "client credentials grant requires client authentication",
                    ));
                }
                debug!(client = %id, "public client identified");
                credentials.authenticated_client_id = Some(id);
            }
            ClientAuthenticationResult::NoAuthenticationRecognized => {
                if grant_type != GrantType::Password {
                    return Err(ProtocolError::token(TokenErrorCode::InvalidClient, "client authentication required"));
                }
            }
            ClientAuthenticationResult::ClientAuthenticationRejected(reason) => {
                warn!(%reason, "client authentication rejected");
                return Err(ProtocolError::token(TokenErrorCode::InvalidClient, reason));
            }
        }
        Ok(Some(Protections::NONE))
    }
}

/// Turns grants into codes and tokens on the way out and back into grants
/// on the way in.
pub struct TokenCodeSerializationBindingElement {
    host: Arc<dyn AuthorizationServerHost>,
    settings: MessagingSettings,
    services: BagServices,
    codes: DataBagFormatter<AuthorizationCode>,
    refresh_tokens: DataBagFormatter<RefreshToken>,
}

impl TokenCodeSerializationBindingElement {
    pub fn new(host: Arc<dyn AuthorizationServerHost>, settings: MessagingSettings, services: BagServices) -> Self {
        let codes = AuthorizationCode::formatter(host.crypto_key_store(), host.nonce_store(), &settings, &services);
        let refresh_tokens = RefreshToken::formatter(host.crypto_key_store(), &settings, &services);
        Self { host, settings, services, codes, refresh_tokens }
    }
}

impl ChannelBindingElement<OAuth2Message> for TokenCodeSerializationBindingElement {
    fn name(&self) -> &'static str {
        TOKEN_CODE_SERIALIZATION
    }

    fn protection(&self) -> Protections {
        Protections::NONE
    }

    fn process_outgoing(
        &self,
        message: &mut OAuth2Message,
        _context: &ChannelContext<'_>,
    ) -> Result<Option<Protections>, ProtocolError> {
        match message {
            OAuth2Message::EndUserAuthorizationSuccessCodeResponse(response) => {
                let authorization = response
                    .authorization
                    .as_ref()
                    .ok_or_else(|| ProtocolError::Host("authorization response carries no grant".to_string()))?;
                let mut code = AuthorizationCode::new(authorization, response.requested_callback.as_ref());
                response.code = Some(self.codes.serialize(&mut code)?);
                Ok(Some(Protections::NONE))
            }
            OAuth2Message::AccessTokenSuccessResponse(response) => {
                let authorization = response
                    .authorization
                    .clone()
                    .ok_or_else(|| ProtocolError::Host("token response carries no grant".to_string()))?;
                let parameters = self.host.access_token_parameters(&authorization);
                let lifetime = parameters.lifetime.unwrap_or_else(|| self.settings.access_token_lifetime());
                let formatter = AccessToken::issuing_formatter(
                    &parameters.signing,
                    self.host.crypto_key_store(),
                    lifetime,
                    &self.settings,
                    &self.services,
                );
                response.access_token = Some(formatter.serialize(&mut AccessToken::new(&authorization, lifetime))?);
                response.expires_in = u64::try_from(lifetime.num_seconds()).ok();
                response.scope = (!authorization.scope.is_empty()).then(|| authorization.scope.clone());

                let refresh = response.include_refresh_token
                    && parameters.include_refresh_token
                    && response.grant_type != Some(GrantType::ClientCredentials);
                if refresh {
                    response.refresh_token = Some(self.refresh_tokens.serialize(&mut RefreshToken::new(&authorization))?);
                }
                info!(client = %authorization.client_id, refresh, "issued access token");
                Ok(Some(Protections::NONE))
            }
            _ => Ok(None),
        }
    }

    fn process_incoming(
        &self,
        message: &mut OAuth2Message,
        _context: &ChannelContext<'_>,
    ) -> Result<Option<Protections>, ProtocolError> {
        match message {
            OAuth2Message::AccessTokenAuthorizationCodeRequest(request) => {
                let code = self.codes.deserialize(&request.code)?;
                request.callback_hash = code.callback_hash.clone();
                request.set_authorization(code.authorization());
                Ok(Some(Protections::NONE))
            }
            OAuth2Message::AccessTokenRefreshRequest(request) => {
                let token = self.refresh_tokens.deserialize(&request.refresh_token)?;
                request.set_authorization(token.authorization());
                Ok(Some(Protections::NONE))
            }
            _ => Ok(None),
        }
    }
}

/// Checks requests against the client that made them and the grant they
/// redeem, and asks the host about password and client credentials grants.
pub struct MessageValidationBindingElement {
    host: Arc<dyn AuthorizationServerHost>,
}

impl MessageValidationBindingElement {
    pub fn new(host: Arc<dyn AuthorizationServerHost>) -> Self {
        Self { host }
    }

    fn ensure_same_client(authorization: &AuthorizationDescription, client_id: &str) -> Result<(), ProtocolError> {
        if authorization.client_id != client_id {
            warn!(issued_to = %authorization.client_id, presented_by = %client_id, "grant presented by another client");
            return Err(ProtocolError::token(TokenErrorCode::InvalidClient, "grant was issued to another client"));
        }
        Ok(())
    }

    fn ensure_still_valid(&self, authorization: &AuthorizationDescription) -> Result<(), ProtocolError> {
        if !self.host.is_authorization_valid(authorization)? {
            info!(client = %authorization.client_id, "grant has been revoked");
            return Err(ProtocolError::token(TokenErrorCode::InvalidGrant, "authorization has been revoked"));
        }
        Ok(())
    }

    fn validate_token_request(
        &self,
        message: &mut OAuth2Message,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), ProtocolError> {
        let Some(request) = message.as_token_request() else {
            return Ok(());
        };
        let grant_type = request.grant_type();
        let client_id = request.credentials().authenticated_client_id.clone();
        if client_id.is_none() && grant_type != GrantType::Password {
            return Err(ProtocolError::token(TokenErrorCode::InvalidClient, "client has not been authenticated"));
        }
        let requested: BTreeSet<String> = request.requested_scope().cloned().unwrap_or_default();

        match message {
            OAuth2Message::AccessTokenAuthorizationCodeRequest(request) => {
                let authorization = request
                    .authorization
                    .as_ref()
                    .ok_or_else(|| ProtocolError::Host("authorization code was not deserialized".to_string()))?;
                Self::ensure_same_client(authorization, client_id.as_deref().unwrap_or_default())?;
                if let Some(expected) = &request.callback_hash {
                    let presented = request.redirect_uri.as_ref().map(|uri| callback_hash(uri.url()));
                    if presented.as_ref() != Some(expected) {
                        return Err(ProtocolError::token(
                            TokenErrorCode::InvalidGrant,
                            "redirect_uri does not match the authorization request",
                        ));
                    }
                }
                self.ensure_still_valid(authorization)?;
            }
            OAuth2Message::AccessTokenRefreshRequest(request) => {
                let authorization = request
                    .authorization
                    .as_mut()
                    .ok_or_else(|| ProtocolError::Host("refresh token was not deserialized".to_string()))?;
                Self::ensure_same_client(authorization, client_id.as_deref().unwrap_or_default())?;
                self.ensure_still_valid(authorization)?;
                if request.scope.is_some() {
                    if !is_scope_satisfied(&requested, &authorization.scope) {
                        return Err(ProtocolError::token(
                            TokenErrorCode::InvalidScope,
                            "requested scope exceeds the original grant",
                        ));
                    }
                    authorization.scope = requested;
                }
            }
            OAuth2Message::AccessTokenResourceOwnerPasswordRequest(request) => {
                let decision = self.host.check_resource_owner_credentials(
                    &request.username,
                    &request.password,
                    client_id.as_deref(),
                    &requested,
                )?;
                match decision {
                    GrantDecision::Approved { user, scope } => {
                        let user = user.unwrap_or_else(|| request.username.clone());
                        request.set_authorization(AuthorizationDescription {
                            client_id: client_id.unwrap_or_default(),
                            user: Some(user),
                            scope,
                            utc_issued: now,
                        });
                    }
                    GrantDecision::Rejected => {
                        return Err(ProtocolError::token(
                            TokenErrorCode::InvalidGrant,
                            "resource owner credentials are invalid",
                        ));
                    }
                    GrantDecision::NotSupported => {
                        return Err(ProtocolError::token(
                            TokenErrorCode::UnsupportedGrantType,
                            "resource owner password grant is not supported",
                        ));
                    }
                }
            }
            OAuth2Message::AccessTokenClientCredentialsRequest(request) => {
                let client_id = client_id.unwrap_or_default();
                if !request.client.client_authenticated {
                    return Err(ProtocolError::token(TokenErrorCode::InvalidClient, "client has not been authenticated"));
                }
                match self.host.check_client_credentials_grant(&client_id, &requested)? {
                    GrantDecision::Approved { scope, .. } => request.set_authorization(AuthorizationDescription {
                        client_id,
                        user: None,
                        scope,
                        utc_issued: now,
                    }),
                    GrantDecision::Rejected => {
                        return Err(ProtocolError::token(
                            TokenErrorCode::UnauthorizedClient,
                            "client may not use the client credentials grant",
                        ));
                    }
                    GrantDecision::NotSupported => {
                        return Err(ProtocolError::token(
                            TokenErrorCode::UnsupportedGrantType,
                            "client credentials grant is not supported",
                        ));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn validate_authorization_request(&self, message: &OAuth2Message) -> Result<(), ProtocolError> {
        let OAuth2Message::EndUserAuthorizationRequest(request) = message else {
            return Ok(());
        };
        let client = self
            .host
            .get_client(&request.client_id)?
            .ok_or_else(|| ProtocolError::violation(format!("unknown client {}", request.client_id)))?;
        match &request.redirect_uri {
            Some(uri) if !client.is_callback_allowed(uri.url()) => {
                Err(ProtocolError::violation(format!("redirect_uri {} is not registered", uri.url())))
            }
            None if client.default_callback().is_none() => {
                Err(ProtocolError::violation("client has no registered redirect_uri"))
            }
            _ => Ok(()),
        }
    }
}

impl ChannelBindingElement<OAuth2Message> for MessageValidationBindingElement {
    fn name(&self) -> &'static str {
        MESSAGE_VALIDATION
    }

    fn protection(&self) -> Protections {
        Protections::NONE
    }

    fn requires(&self) -> &'static [&'static str] {
        &[TOKEN_CODE_SERIALIZATION, CLIENT_AUTHENTICATION]
    }

    fn process_outgoing(
        &self,
        _message: &mut OAuth2Message,
        _context: &ChannelContext<'_>,
    ) -> Result<Option<Protections>, ProtocolError> {
        Ok(None)
    }

    fn process_incoming(
        &self,
        message: &mut OAuth2Message,
        context: &ChannelContext<'_>,
    ) -> Result<Option<Protections>, ProtocolError> {
        if matches!(message, OAuth2Message::EndUserAuthorizationRequest(_)) {
            self.validate_authorization_request(message)?;
        } else if message.as_token_request().is_some() {
            self.validate_token_request(message, context.clock.now())?;
        } else {
            return Ok(None);
        }
        Ok(Some(Protections::NONE))
    }
}
