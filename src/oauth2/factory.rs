use std::collections::BTreeMap;

use tracing::debug;
use url::Url;

use super::messages::{
    AccessTokenAuthorizationCodeRequest, AccessTokenClientCredentialsRequest, AccessTokenFailedResponse,
    AccessTokenRefreshRequest, AccessTokenResourceOwnerPasswordRequest, AccessTokenSuccessResponse,
    EndUserAuthorizationFailedResponse, EndUserAuthorizationRequest, EndUserAuthorizationSuccessCodeResponse,
    OAUTH2_VERSION, OAuth2Message,
};
use super::types::{GrantType, TokenErrorCode};
use crate::messaging::{MessageDescriptions, MessageFactory, ProtocolError};

/// Picks the OAuth 2.0 message type from `grant_type`, `response_type`,
/// `code` and `error`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OAuth2MessageFactory;

impl MessageFactory<OAuth2Message> for OAuth2MessageFactory {
    fn new_request_message(
        &self,
        recipient: &Url,
        fields: &BTreeMap<String, String>,
        descriptions: &MessageDescriptions,
    ) -> Result<Option<OAuth2Message>, ProtocolError> {
        if let Some(grant_type) = fields.get("grant_type") {
            let grant = GrantType::parse(grant_type).ok_or_else(|| {
                ProtocolError::token(TokenErrorCode::UnsupportedGrantType, format!("grant_type {} is not supported", grant_type))
            })?;
            let recipient = Some(recipient.clone());
            let message: OAuth2Message = match grant {
                GrantType::AuthorizationCode => {
                    let mut request: AccessTokenAuthorizationCodeRequest =
                        descriptions.deserialize(OAUTH2_VERSION, fields)?;
                    request.recipient = recipient;
                    request.into()
                }
                GrantType::RefreshToken => {
                    let mut request: AccessTokenRefreshRequest = descriptions.deserialize(OAUTH2_VERSION, fields)?;
                    request.recipient = recipient;
                    request.into()
                }
                GrantType::Password => {
                    let mut request: AccessTokenResourceOwnerPasswordRequest =
                        descriptions.deserialize(OAUTH2_VERSION, fields)?;
                    request.recipient = recipient;
                    request.into()
                }
                GrantType::ClientCredentials => {
                    let mut request: AccessTokenClientCredentialsRequest =
                        descriptions.deserialize(OAUTH2_VERSION, fields)?;
                    request.recipient = recipient;
                    request.into()
                }
            };
            return Ok(Some(message));
        }

        if let Some(response_type) = fields.get("response_type") {
            if response_type != "code" {
                return Err(ProtocolError::violation(format!("response_type {} is not supported", response_type)));
            }
            let mut request: EndUserAuthorizationRequest = descriptions.deserialize(OAUTH2_VERSION, fields)?;
            request.recipient = Some(recipient.clone());
            return Ok(Some(request.into()));
        }

        // Responses arriving at a client's callback.
        if fields.contains_key("code") {
            let mut response: EndUserAuthorizationSuccessCodeResponse =
                descriptions.deserialize(OAUTH2_VERSION, fields)?;
            response.recipient = Some(recipient.clone());
            return Ok(Some(response.into()));
        }
        if fields.contains_key("error") {
            let mut response: EndUserAuthorizationFailedResponse = descriptions.deserialize(OAUTH2_VERSION, fields)?;
            response.recipient = Some(recipient.clone());
            return Ok(Some(response.into()));
        }

        debug!(fields = fields.len(), "no OAuth 2.0 discriminator present");
        Ok(None)
    }

    fn new_response_message(
        &self,
        request: &OAuth2Message,
        fields: &BTreeMap<String, String>,
        descriptions: &MessageDescriptions,
    ) -> Result<Option<OAuth2Message>, ProtocolError> {
        if request.as_token_request().is_none() {
            return Ok(None);
        }
        let message: OAuth2Message = if fields.contains_key("error") {
            descriptions.deserialize::<AccessTokenFailedResponse>(OAUTH2_VERSION, fields)?.into()
        } else {
            descriptions.deserialize::<AccessTokenSuccessResponse>(OAUTH2_VERSION, fields)?.into()
        };
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::ProtocolMessage;

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn token_endpoint() -> Url {
        Url::parse("https://as.example/token").unwrap()
    }

    #[test]
    fn grant_type_selects_request() {
        let descriptions = MessageDescriptions::new();
        let message = OAuth2MessageFactory
            .new_request_message(
                &token_endpoint(),
                &fields(&[("grant_type", "password"), ("username", "alice"), ("password", "pw")]),
                &descriptions,
            )
            .unwrap()
            .unwrap();
        assert_eq!(message.kind(), "AccessTokenResourceOwnerPasswordRequest");
        assert_eq!(message.recipient(), Some(&token_endpoint()));
    }

    #[test]
    fn unknown_grant_type_is_unsupported() {
        let descriptions = MessageDescriptions::new();
        let err = OAuth2MessageFactory
            .new_request_message(&token_endpoint(), &fields(&[("grant_type", "device_code")]), &descriptions)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::TokenEndpoint { code: TokenErrorCode::UnsupportedGrantType, .. }));
    }

    #[test]
    fn only_code_response_type_is_accepted() {
        let descriptions = MessageDescriptions::new();
        let authorize = Url::parse("https://as.example/authorize").unwrap();
        let message = OAuth2MessageFactory
            .new_request_message(&authorize, &fields(&[("response_type", "code"), ("client_id", "app")]), &descriptions)
            .unwrap()
            .unwrap();
        assert_eq!(message.kind(), "EndUserAuthorizationRequest");

        let implicit = OAuth2MessageFactory.new_request_message(
            &authorize,
            &fields(&[("response_type", "token"), ("client_id", "app")]),
            &descriptions,
        );
        assert!(matches!(implicit, Err(ProtocolError::Violation(_))));
    }

    #[test]
    fn token_responses_split_on_error() {
        let descriptions = MessageDescriptions::new();
        let request: OAuth2Message = AccessTokenClientCredentialsRequest::default().into();
        let failed = OAuth2MessageFactory
            .new_response_message(&request, &fields(&[("error", "invalid_scope")]), &descriptions)
            .unwrap()
            .unwrap();
        assert_eq!(failed.http_status(), 400);
        let issued = OAuth2MessageFactory
            .new_response_message(
                &request,
                &fields(&[("access_token", "abc"), ("token_type", "bearer"), ("expires_in", "60")]),
                &descriptions,
            )
            .unwrap()
            .unwrap();
        let OAuth2Message::AccessTokenSuccessResponse(issued) = issued else {
            panic!("expected a success response");
        };
        assert_eq!(issued.expires_in, Some(60));
    }
}
