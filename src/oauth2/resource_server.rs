//! Bearer token checks for resource servers.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use super::authorization::{AccessToken, AccessTokenVerification, BagServices};
use super::messages::OAuth2Message;
use super::types::{AuthorizationDescription, is_scope_satisfied};
use crate::messaging::http::CONTENT_TYPE_JSON;
use crate::messaging::{Channel, Clock, DataBagFormatter, HttpRequest, HttpResponse, ProtocolError};

/// Turns a presented access token back into the grant behind it.
pub trait AccessTokenAnalyzer: Send + Sync {
    fn analyze(&self, token: &str) -> Result<AuthorizationDescription, ProtocolError>;
}

/// Reads tokens issued by this crate's authorization server.
pub struct StandardAccessTokenAnalyzer {
    formatter: DataBagFormatter<AccessToken>,
    clock: Arc<dyn Clock>,
}

impl StandardAccessTokenAnalyzer {
    pub fn new(verification: AccessTokenVerification, services: BagServices) -> Self {
        Self { formatter: AccessToken::verifying_formatter(&verification, &services), clock: services.clock }
    }
}

impl AccessTokenAnalyzer for StandardAccessTokenAnalyzer {
    fn analyze(&self, token: &str) -> Result<AuthorizationDescription, ProtocolError> {
        let token = self.formatter.deserialize(token)?;
        token.ensure_unexpired(self.clock.now())?;
        Ok(token.authorization())
    }
}

pub struct ResourceServer {
    analyzer: Arc<dyn AccessTokenAnalyzer>,
}

impl ResourceServer {
    pub fn new(analyzer: Arc<dyn AccessTokenAnalyzer>) -> Self {
        Self { analyzer }
    }

    /// The token from an `Authorization: Bearer` header, or failing that an
    /// `access_token` query or form parameter.
    pub fn read_token(request: &HttpRequest) -> Result<Option<String>, ProtocolError> {
        if let Some(header) = request.header("Authorization") {
            if let Some((scheme, token)) = header.trim().split_once(' ') {
                if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
                    return Ok(Some(token.trim().to_string()));
                }
            }
        }
        let mut fields = Channel::<OAuth2Message>::read_fields(request)?;
        Ok(fields.remove("access_token").filter(|token| !token.is_empty()))
    }

    /// The grant behind the request's access token, provided it covers
    /// `required_scope`.
    pub fn get_access_token(
        &self,
        request: &HttpRequest,
        required_scope: &BTreeSet<String>,
    ) -> Result<AuthorizationDescription, ProtocolError> {
        let token = Self::read_token(request)?.ok_or(ProtocolError::MissingAccessToken)?;
        let authorization = self.analyzer.analyze(&token)?;
        if !is_scope_satisfied(required_scope, &authorization.scope) {
            debug!(client = %authorization.client_id, "access token lacks required scope");
            return Err(ProtocolError::InsufficientScope {
                required: required_scope.difference(&authorization.scope).cloned().collect(),
            });
        }
        Ok(authorization)
    }

    /// The challenge answering a failed [`get_access_token`](Self::get_access_token).
    pub fn error_response(error: &ProtocolError) -> HttpResponse {
        let (status, code, description) = match error {
            ProtocolError::MissingAccessToken => (401, None, None),
            ProtocolError::InsufficientScope { .. } => (403, Some("insufficient_scope"), Some(error.to_string())),
            ProtocolError::Violation(_) => (400, Some("invalid_request"), Some(error.to_string())),
            other => {
                warn!(error = %other, kind = ?other.kind(), "rejected access token");
                (401, Some("invalid_token"), Some("the access token is invalid or expired".to_string()))
            }
        };
        let challenge = match (code, error) {
            (None, _) => "Bearer".to_string(),
            (Some(code), ProtocolError::InsufficientScope { required }) => {
                format!("Bearer error=\"{}\", scope=\"{}\"", code, required.join(" "))
            }
            (Some(code), _) => format!("Bearer error=\"{}\"", code),
        };
        let body = match code {
            Some(code) => json!({ "error": code, "error_description": description }).to_string(),
            None => String::new(),
        };
        HttpResponse::new(status, CONTENT_TYPE_JSON, body.into_bytes()).with_header("WWW-Authenticate", challenge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    struct Fixed(AuthorizationDescription);

    impl AccessTokenAnalyzer for Fixed {
        fn analyze(&self, token: &str) -> Result<AuthorizationDescription, ProtocolError> {
            if token == "good" {
                Ok(self.0.clone())
            } else {
                Err(ProtocolError::InvalidSignature("bad token".into()))
            }
        }
    }

    fn server() -> ResourceServer {
        ResourceServer::new(Arc::new(Fixed(AuthorizationDescription {
            client_id: "app".into(),
            user: Some("alice".into()),
            scope: ["read".to_string()].into_iter().collect(),
            utc_issued: chrono::Utc::now(),
        })))
    }

    fn scope(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn api() -> Url {
        Url::parse("https://api.example/photos").unwrap()
    }

    #[test]
    fn header_and_query_tokens() {
        let request = HttpRequest::get(api()).with_header("Authorization", "Bearer good");
        assert_eq!(server().get_access_token(&request, &scope(&["read"])).unwrap().client_id, "app");

        let request = HttpRequest::get(Url::parse("https://api.example/photos?access_token=good").unwrap());
        assert!(server().get_access_token(&request, &BTreeSet::new()).is_ok());
    }

    #[test]
    fn challenges() {
        let missing = server().get_access_token(&HttpRequest::get(api()), &BTreeSet::new()).unwrap_err();
        let response = ResourceServer::error_response(&missing);
        assert_eq!(response.status, 401);
        assert_eq!(response.header("WWW-Authenticate"), Some("Bearer"));

        let request = HttpRequest::get(api()).with_header("Authorization", "Bearer good");
        let narrow = server().get_access_token(&request, &scope(&["read", "write"])).unwrap_err();
        let response = ResourceServer::error_response(&narrow);
        assert_eq!(response.status, 403);
        assert_eq!(response.header("WWW-Authenticate"), Some("Bearer error=\"insufficient_scope\", scope=\"write\""));

        let request = HttpRequest::get(api()).with_header("Authorization", "Bearer forged");
        let forged = server().get_access_token(&request, &BTreeSet::new()).unwrap_err();
        let response = ResourceServer::error_response(&forged);
        assert_eq!(response.status, 401);
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["error"], "invalid_token");
    }
}
