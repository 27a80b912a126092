//! HTTP request/response values and the injected transport capability.

use std::collections::BTreeMap;
use std::error::Error;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use url::Url;

use openauth_lib::url_encoding;

/// HTTP methods a channel reads messages from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

pub const CONTENT_TYPE_FORM: &str = "application/x-www-form-urlencoded";
pub const CONTENT_TYPE_KVF: &str = "text/plain; charset=utf-8";
pub const CONTENT_TYPE_JSON: &str = "application/json; charset=utf-8";
pub const CONTENT_TYPE_HTML: &str = "text/html; charset=utf-8";

/// An HTTP request as seen by a channel, either received or about to be sent.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn get(url: Url) -> Self {
        Self { method: HttpMethod::Get, url, headers: Vec::new(), body: None }
    }

    /// A POST carrying `fields` as an urlencoded form.
    pub fn post_form<'a, I>(url: Url, fields: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let body = url_encoding::encode_form(fields.into_iter().map(|(k, v)| (k.as_str(), v.as_str())));
        Self {
            method: HttpMethod::Post,
            url,
            headers: vec![("Content-Type".to_string(), CONTENT_TYPE_FORM.to_string())],
            body: Some(body.into_bytes()),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_form(&self) -> bool {
        self.header("Content-Type")
            .is_some_and(|ct| ct.trim_start().to_ascii_lowercase().starts_with(CONTENT_TYPE_FORM))
    }
}

/// An HTTP response produced by a channel or returned by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, content_type: &str, body: Vec<u8>) -> Self {
        Self { status, headers: vec![("Content-Type".to_string(), content_type.to_string())], body }
    }

    pub fn redirect(location: &Url) -> Self {
        Self {
            status: 302,
            headers: vec![("Location".to_string(), location.to_string())],
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Query parameters of a redirect's `Location`.
    pub fn location_fields(&self) -> Option<BTreeMap<String, String>> {
        let location = Url::parse(self.header("Location")?).ok()?;
        Some(location.query_pairs().into_owned().collect())
    }
}

/// Error type for transport failures.
pub type HttpTransportError = Box<dyn Error + Send + Sync>;

/// Sends direct messages to a remote party.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpTransportError>;
}

type Responder = Arc<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

/// In-memory transport for tests. Routes by URL without query string.
#[derive(Clone, Default)]
pub struct InMemoryHttpTransport {
    routes: Arc<DashMap<String, Responder>>,
    sent: Arc<Mutex<Vec<HttpRequest>>>,
}

impl InMemoryHttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn route_key(url: &Url) -> String {
        let mut url = url.clone();
        url.set_query(None);
        url.set_fragment(None);
        url.to_string()
    }

    /// Answers every request to `url` with a fixed response.
    pub fn insert_response(&self, url: &Url, response: HttpResponse) {
        self.routes.insert(Self::route_key(url), Arc::new(move |_| response.clone()));
    }

    /// Answers requests to `url` by calling `handler`.
    pub fn insert_handler<F>(&self, url: &Url, handler: F)
    where
        F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    {
        self.routes.insert(Self::route_key(url), Arc::new(handler));
    }

    /// Requests executed so far.
    pub fn sent(&self) -> Vec<HttpRequest> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl HttpTransport for InMemoryHttpTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpTransportError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(request.clone());
        }
        let responder = self
            .routes
            .get(&Self::route_key(&request.url))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| format!("no in-memory route for {}", request.url))?;
        Ok(responder(&request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_ignores_case() {
        let request = HttpRequest::get(Url::parse("https://a.example/").unwrap()).with_header("Authorization", "Basic x");
        assert_eq!(request.header("authorization"), Some("Basic x"));
        assert!(!request.is_form());
    }

    #[tokio::test]
    async fn in_memory_transport_routes_without_query() {
        let transport = InMemoryHttpTransport::new();
        let url = Url::parse("https://op.example/server").unwrap();
        transport.insert_response(&url, HttpResponse::new(200, CONTENT_TYPE_KVF, b"mode:x\n".to_vec()));

        let request = HttpRequest::get(Url::parse("https://op.example/server?a=1").unwrap());
        let response = transport.execute(request).await.unwrap();
        assert_eq!(response.body_text(), Some("mode:x\n"));
        assert_eq!(transport.sent().len(), 1);

        let missing = transport.execute(HttpRequest::get(Url::parse("https://other.example/").unwrap())).await;
        assert!(missing.is_err());
    }
}
