//! Client authentication at the token endpoint.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, warn};

use openauth_lib::url_encoding;

use super::host::AuthorizationServerHost;
use super::messages::ClientCredentials;
use crate::messaging::{HttpRequest, ProtocolError};

/// Outcome of one authentication module, or of all of them together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAuthenticationResult {
    /// The request carries nothing this module understands.
    NoAuthenticationRecognized,
    /// A client identified itself without proving it.
    ClientIdNotAuthenticated(String),
    ClientAuthenticated(String),
    ClientAuthenticationRejected(String),
}

impl ClientAuthenticationResult {
    pub fn client_id(&self) -> Option<&str> {
        match self {
            ClientAuthenticationResult::ClientIdNotAuthenticated(id)
            | ClientAuthenticationResult::ClientAuthenticated(id) => Some(id),
            _ => None,
        }
    }
}

/// One way a client can present credentials.
pub trait ClientAuthenticationModule: Send + Sync {
    fn name(&self) -> &'static str;

    fn try_authenticate(
        &self,
        host: &dyn AuthorizationServerHost,
        credentials: &ClientCredentials,
        request: Option<&HttpRequest>,
    ) -> Result<ClientAuthenticationResult, ProtocolError>;
}

/// Checks a presented id and optional secret against the registered client.
fn authenticate(
    host: &dyn AuthorizationServerHost,
    client_id: &str,
    secret: Option<&str>,
) -> Result<ClientAuthenticationResult, ProtocolError> {
    let Some(client) = host.get_client(client_id)? else {
        return Ok(ClientAuthenticationResult::ClientAuthenticationRejected(format!("unknown client {}", client_id)));
    };
    Ok(match secret {
        Some(secret) if client.is_valid_secret(secret) => {
            ClientAuthenticationResult::ClientAuthenticated(client_id.to_string())
        }
        Some(_) => ClientAuthenticationResult::ClientAuthenticationRejected("invalid client secret".to_string()),
        None if client.has_secret() => {
            ClientAuthenticationResult::ClientAuthenticationRejected("client secret required".to_string())
        }
        None => ClientAuthenticationResult::ClientIdNotAuthenticated(client_id.to_string()),
    })
}

/// `Authorization: Basic` with form-encoded id and secret.
#[derive(Debug, Default)]
pub struct HttpBasicAuthentication;

impl HttpBasicAuthentication {
    fn credentials(header: &str) -> Option<(String, String)> {
        let (scheme, encoded) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = STANDARD.decode(encoded.trim()).ok()?;
        let text = String::from_utf8(decoded).ok()?;
        let (id, secret) = text.split_once(':')?;
        Some((
            url_encoding::decode_form_component(id).ok()?,
            url_encoding::decode_form_component(secret).ok()?,
        ))
    }
}

impl ClientAuthenticationModule for HttpBasicAuthentication {
    fn name(&self) -> &'static str {
        "http_basic"
    }

    fn try_authenticate(
        &self,
        host: &dyn AuthorizationServerHost,
        _credentials: &ClientCredentials,
        request: Option<&HttpRequest>,
    ) -> Result<ClientAuthenticationResult, ProtocolError> {
        let Some(header) = request.and_then(|r| r.header("Authorization")) else {
            return Ok(ClientAuthenticationResult::NoAuthenticationRecognized);
        };
        match Self::credentials(header) {
            Some((id, secret)) => authenticate(host, &id, Some(&secret)),
            None if header.trim_start().to_ascii_lowercase().starts_with("basic") => Ok(
                ClientAuthenticationResult::ClientAuthenticationRejected("malformed basic credentials".to_string()),
            ),
            None => Ok(ClientAuthenticationResult::NoAuthenticationRecognized),
        }
    }
}

/// `client_id` and `client_secret` in the request body.
#[derive(Debug, Default)]
pub struct MessagePartAuthentication;

impl ClientAuthenticationModule for MessagePartAuthentication {
    fn name(&self) -> &'static str {
        "message_part"
    }

    fn try_authenticate(
        &self,
        host: &dyn AuthorizationServerHost,
        credentials: &ClientCredentials,
        _request: Option<&HttpRequest>,
    ) -> Result<ClientAuthenticationResult, ProtocolError> {
        match (&credentials.client_id, &credentials.client_secret) {
            (Some(id), secret) => authenticate(host, id, secret.as_deref()),
            (None, Some(_)) => Ok(ClientAuthenticationResult::ClientAuthenticationRejected(
                "client_secret without client_id".to_string(),
            )),
            (None, None) => Ok(ClientAuthenticationResult::NoAuthenticationRecognized),
        }
    }
}

/// Runs every module. Credentials presented more than one way are rejected.
#[derive(Clone)]
pub struct AggregatingClientAuthentication {
    modules: Vec<Arc<dyn ClientAuthenticationModule>>,
}

impl Default for AggregatingClientAuthentication {
    fn default() -> Self {
        Self::new(vec![Arc::new(HttpBasicAuthentication), Arc::new(MessagePartAuthentication)])
    }
}

impl AggregatingClientAuthentication {
    pub fn new(modules: Vec<Arc<dyn ClientAuthenticationModule>>) -> Self {
        Self { modules }
    }

    pub fn authenticate(
        &self,
        host: &dyn AuthorizationServerHost,
        credentials: &ClientCredentials,
        request: Option<&HttpRequest>,
    ) -> Result<ClientAuthenticationResult, ProtocolError> {
        let mut answered: Option<(&'static str, ClientAuthenticationResult)> = None;
        for module in &self.modules {
            let result = module.try_authenticate(host, credentials, request)?;
            if result == ClientAuthenticationResult::NoAuthenticationRecognized {
                continue;
            }
            if let Some((first, _)) = &answered {
                warn!(first = *first, second = module.name(), "client presented credentials more than once");
                return Ok(ClientAuthenticationResult::ClientAuthenticationRejected(
                    "multiple client credentials presented".to_string(),
                ));
            }
            debug!(module = module.name(), ?result, "client authentication module answered");
            answered = Some((module.name(), result));
        }
        Ok(answered.map_or(ClientAuthenticationResult::NoAuthenticationRecognized, |(_, result)| result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MessagingSettings;
    use crate::oauth2::memory::InMemoryAuthorizationServerHost;
    use crate::oauth2::types::Client;
    use url::Url;

    fn host() -> InMemoryAuthorizationServerHost {
        InMemoryAuthorizationServerHost::new(&MessagingSettings::default())
            .with_client(Client::new("app", Some("s3cret"), vec![]))
            .with_client(Client::new("spa", None, vec![]))
    }

    fn token_request() -> HttpRequest {
        HttpRequest::get(Url::parse("https://as.example/token").unwrap())
    }

    fn basic(id: &str, secret: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{}:{}", id, secret)))
    }

    #[test]
    fn basic_header_authenticates() {
        let request = token_request().with_header("Authorization", basic("app", "s3cret"));
        let result = AggregatingClientAuthentication::default()
            .authenticate(&host(), &ClientCredentials::default(), Some(&request))
            .unwrap();
        assert_eq!(result, ClientAuthenticationResult::ClientAuthenticated("app".into()));
    }

    #[test]
    fn credentials_in_header_and_body_are_rejected() {
        let request = token_request().with_header("Authorization", basic("app", "s3cret"));
        let body = ClientCredentials {
            client_id: Some("app".into()),
            client_secret: Some("s3cret".into()),
            ..Default::default()
        };
        let result = AggregatingClientAuthentication::default().authenticate(&host(), &body, Some(&request)).unwrap();
        assert!(matches!(result, ClientAuthenticationResult::ClientAuthenticationRejected(_)));
    }

    #[test]
    fn lone_client_id_only_for_public_clients() {
        let modules = AggregatingClientAuthentication::default();
        let public = ClientCredentials { client_id: Some("spa".into()), ..Default::default() };
        assert_eq!(
            modules.authenticate(&host(), &public, None).unwrap(),
            ClientAuthenticationResult::ClientIdNotAuthenticated("spa".into())
        );
        let confidential = ClientCredentials { client_id: Some("app".into()), ..Default::default() };
        assert!(matches!(
            modules.authenticate(&host(), &confidential, None).unwrap(),
            ClientAuthenticationResult::ClientAuthenticationRejected(_)
        ));
    }

    #[test]
    fn wrong_secret_and_unknown_client_are_rejected() {
        let modules = AggregatingClientAuthentication::default();
        let wrong = ClientCredentials {
            client_id: Some("app".into()),
            client_secret: Some("nope".into()),
            ..Default::default()
        };
        assert!(matches!(
            modules.authenticate(&host(), &wrong, None).unwrap(),
            ClientAuthenticationResult::ClientAuthenticationRejected(_)
        ));
        let request = token_request().with_header("Authorization", basic("ghost", "x"));
        assert!(matches!(
            modules.authenticate(&host(), &ClientCredentials::default(), Some(&request)).unwrap(),
            ClientAuthenticationResult::ClientAuthenticationRejected(_)
        ));
    }

    #[test]
    fn basic_components_are_form_decoded() {
        let header = format!("Basic {}", STANDARD.encode("my%20app:p%3Ass"));
        assert_eq!(
            HttpBasicAuthentication::credentials(&header),
            Some(("my app".to_string(), "p:ss".to_string()))
        );
        assert_eq!(HttpBasicAuthentication::credentials("Bearer abc"), None);
    }
}
