//! The channel: an ordered binding element pipeline plus wire encodings.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use super::binding::{ChannelBindingElement, ChannelContext, Protections};
use super::clock::{Clock, SystemClock};
use super::description::MessageDescriptions;
use super::error::ProtocolError;
use super::http::{
    CONTENT_TYPE_HTML, CONTENT_TYPE_JSON, CONTENT_TYPE_KVF, HttpMethod, HttpRequest, HttpResponse, HttpTransport,
};
use super::kvf::KeyValueFormEncoding;
use super::message::{MessageTransport, ProtocolMessage};
use super::random::{RandomSource, SystemRandomSource};
use crate::config::MessagingSettings;

use openauth_lib::url_encoding;

/// Builds typed messages from wire fields for one protocol.
///
/// Implementations are decision tables over discriminator fields. They
/// return `Ok(None)` when the fields describe no known message.
pub trait MessageFactory<P>: Send + Sync {
    fn new_request_message(
        &self,
        recipient: &Url,
        fields: &BTreeMap<String, String>,
        descriptions: &MessageDescriptions,
    ) -> Result<Option<P>, ProtocolError>;

    fn new_response_message(
        &self,
        request: &P,
        fields: &BTreeMap<String, String>,
        descriptions: &MessageDescriptions,
    ) -> Result<Option<P>, ProtocolError>;
}

/// Body encoding of direct responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectEncoding {
    KeyValueForm,
    /// A flat JSON object. Listed parts are written as numbers.
    Json { numeric_parts: &'static [&'static str] },
}

pub struct Channel<P> {
    elements: Vec<Arc<dyn ChannelBindingElement<P>>>,
    factory: Arc<dyn MessageFactory<P>>,
    settings: MessagingSettings,
    descriptions: Arc<MessageDescriptions>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    transport: Option<Arc<dyn HttpTransport>>,
    direct_encoding: DirectEncoding,
}

pub struct ChannelBuilder<P> {
    elements: Vec<Arc<dyn ChannelBindingElement<P>>>,
    factory: Arc<dyn MessageFactory<P>>,
    settings: MessagingSettings,
    descriptions: Option<Arc<MessageDescriptions>>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    transport: Option<Arc<dyn HttpTransport>>,
    direct_encoding: DirectEncoding,
}

impl<P: ProtocolMessage> ChannelBuilder<P> {
    pub fn element(mut self, element: Arc<dyn ChannelBindingElement<P>>) -> Self {
        self.elements.push(element);
        self
    }

    pub fn settings(mut self, settings: MessagingSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Shares a description cache between channels.
    pub fn descriptions(mut self, descriptions: Arc<MessageDescriptions>) -> Self {
        self.descriptions = Some(descriptions);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn direct_encoding(mut self, encoding: DirectEncoding) -> Self {
        self.direct_encoding = encoding;
        self
    }

    pub fn build(self) -> Result<Channel<P>, ProtocolError> {
        Ok(Channel {
            elements: order_elements(self.elements)?,
            factory: self.factory,
            settings: self.settings,
            descriptions: self.descriptions.unwrap_or_default(),
            clock: self.clock,
            random: self.random,
            transport: self.transport,
            direct_encoding: self.direct_encoding,
        })
    }
}

/// Keeps transforms in their given order and appends protection elements,
/// strongest protection first. Fails when a protection is present without
/// the weaker ones it builds on, or when an element's prerequisite does not
/// come after it.
fn order_elements<P>(
    elements: Vec<Arc<dyn ChannelBindingElement<P>>>,
) -> Result<Vec<Arc<dyn ChannelBindingElement<P>>>, ProtocolError> {
    let (mut protecting, transforming): (Vec<_>, Vec<_>) =
        elements.into_iter().partition(|element| !element.protection().is_empty());
    protecting.sort_by(|a, b| b.protection().cmp(&a.protection()));

    let mut previous_present = true;
    for kind in [Protections::TAMPER_PROTECTION, Protections::EXPIRATION, Protections::REPLAY_PROTECTION] {
        let present = protecting.iter().any(|element| element.protection().contains(kind));
        if present && !previous_present {
            return Err(ProtocolError::Host(format!("{} protection requires the weaker protections too", kind)));
        }
        previous_present = present;
    }

    let ordered: Vec<_> = transforming.into_iter().chain(protecting).collect();
    for (i, element) in ordered.iter().enumerate() {
        for needed in element.requires() {
            if !ordered[i + 1..].iter().any(|later| later.name() == *needed) {
                return Err(ProtocolError::Host(format!(
                    "binding element {} requires {} to follow it",
                    element.name(),
                    needed
                )));
            }
        }
    }
    Ok(ordered)
}

impl<P: ProtocolMessage> Channel<P> {
    pub fn builder(factory: Arc<dyn MessageFactory<P>>) -> ChannelBuilder<P> {
        ChannelBuilder {
            elements: Vec::new(),
            factory,
            settings: MessagingSettings::default(),
            descriptions: None,
            clock: Arc::new(SystemClock),
            random: Arc::new(SystemRandomSource::new()),
            transport: None,
            direct_encoding: DirectEncoding::KeyValueForm,
        }
    }

    pub fn settings(&self) -> &MessagingSettings {
        &self.settings
    }

    pub fn descriptions(&self) -> &Arc<MessageDescriptions> {
        &self.descriptions
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn random(&self) -> &Arc<dyn RandomSource> {
        &self.random
    }

    /// Element names in processing order for outgoing messages.
    pub fn element_names(&self) -> Vec<&'static str> {
        self.elements.iter().map(|element| element.name()).collect()
    }

    fn context<'a>(&'a self, request: Option<&'a HttpRequest>) -> ChannelContext<'a> {
        ChannelContext {
            settings: &self.settings,
            clock: self.clock.as_ref(),
            random: self.random.as_ref(),
            descriptions: &self.descriptions,
            request,
        }
    }

    /// Runs the outgoing chain and checks the message got the protection it requires.
    pub fn process_outgoing(&self, message: &mut P) -> Result<(), ProtocolError> {
        let context = self.context(None);
        let mut applied = Protections::empty();
        for element in &self.elements {
            if let Some(protection) = element.process_outgoing(message, &context)? {
                if applied.intersects(protection) {
                    return Err(ProtocolError::Host(format!(
                        "binding element {} applied {} protection a second time",
                        element.name(),
                        protection
                    )));
                }
                applied |= protection;
                debug!(element = element.name(), %protection, "outgoing binding element applied");
            }
        }
        let required = message.required_protection();
        if !applied.contains(required) {
            return Err(ProtocolError::UnprotectedMessage {
                message: message.kind(),
                required: required.to_string(),
                applied: applied.to_string(),
            });
        }
        message.ensure_valid()
    }

    /// Runs the incoming chain in reverse order.
    pub fn process_incoming(&self, message: &mut P, request: Option<&HttpRequest>) -> Result<(), ProtocolError> {
        let context = self.context(request);
        let mut applied = Protections::empty();
        for element in self.elements.iter().rev() {
            if let Some(protection) = element.process_incoming(message, &context)? {
                if applied.intersects(protection) {
                    warn!(element = element.name(), %protection, "protection verified more than once");
                }
                applied |= protection;
                debug!(element = element.name(), %protection, "incoming binding element applied");
            }
        }
        let required = message.required_protection();
        if !applied.contains(required) {
            return Err(ProtocolError::UnprotectedMessage {
                message: message.kind(),
                required: required.to_string(),
                applied: applied.to_string(),
            });
        }
        message.ensure_valid()
    }

    /// Prepares `message` and renders the HTTP response that delivers it.
    #[instrument(skip_all, fields(kind = message.kind()))]
    pub fn send(&self, mut message: P) -> Result<HttpResponse, ProtocolError> {
        self.process_outgoing(&mut message)?;
        self.encode(&message)
    }

    /// Renders an already processed message.
    pub fn encode(&self, message: &P) -> Result<HttpResponse, ProtocolError> {
        match message.transport() {
            MessageTransport::Indirect => self.indirect_response(message),
            MessageTransport::DirectResponse => self.direct_response(message),
            MessageTransport::DirectRequest => Err(ProtocolError::Host(format!(
                "{} is a direct request and must be sent with request_async",
                message.kind()
            ))),
        }
    }

    fn indirect_response(&self, message: &P) -> Result<HttpResponse, ProtocolError> {
        let recipient = message
            .recipient()
            .ok_or_else(|| ProtocolError::Host(format!("{} has no recipient", message.kind())))?;
        let fields = message.serialize(&self.descriptions)?;

        let mut location = recipient.clone();
        if !fields.is_empty() {
            let mut pairs = location.query_pairs_mut();
            for (key, value) in &fields {
                pairs.append_pair(key, value);
            }
        }
        if location.as_str().len() <= self.settings.maximum_indirect_url_length {
            return Ok(HttpResponse::redirect(&location).with_header("Cache-Control", "no-cache, no-store"));
        }
        debug!(length = location.as_str().len(), "indirect message too long for a redirect, using a form post");
        Ok(HttpResponse::new(200, CONTENT_TYPE_HTML, auto_post_form(recipient, &fields).into_bytes())
            .with_header("Cache-Control", "no-cache, no-store"))
    }

    fn direct_response(&self, message: &P) -> Result<HttpResponse, ProtocolError> {
        let fields = message.serialize(&self.descriptions)?;
        let (content_type, body) = match self.direct_encoding {
            DirectEncoding::KeyValueForm => (
                CONTENT_TYPE_KVF,
                KeyValueFormEncoding::new(self.settings.kvf_conformance).encode(&fields)?,
            ),
            DirectEncoding::Json { numeric_parts } => (CONTENT_TYPE_JSON, encode_json(&fields, numeric_parts)?),
        };
        Ok(HttpResponse::new(message.http_status(), content_type, body)
            .with_header("Cache-Control", "no-store")
            .with_header("Pragma", "no-cache"))
    }

    fn direct_request(&self, message: &P) -> Result<HttpRequest, ProtocolError> {
        let recipient = message
            .recipient()
            .ok_or_else(|| ProtocolError::Host(format!("{} has no recipient", message.kind())))?;
        let fields = message.serialize(&self.descriptions)?;
        Ok(HttpRequest::post_form(recipient.clone(), &fields))
    }

    fn decode_direct_body(&self, body: &[u8]) -> Result<BTreeMap<String, String>, ProtocolError> {
        match self.direct_encoding {
            DirectEncoding::KeyValueForm => Ok(KeyValueFormEncoding::new(self.settings.kvf_conformance).decode(body)?),
            DirectEncoding::Json { .. } => decode_json(body),
        }
    }

    /// Message fields of a GET query string or urlencoded POST body.
    /// A parameter given twice is a protocol violation.
    pub fn read_fields(request: &HttpRequest) -> Result<BTreeMap<String, String>, ProtocolError> {
        let pairs: Vec<(String, String)> = match request.method {
            HttpMethod::Get => request.url.query_pairs().into_owned().collect(),
            HttpMethod::Post => {
                let body = request.body.as_deref().unwrap_or_default();
                let text = std::str::from_utf8(body)
                    .map_err(|_| ProtocolError::violation("request body is not valid UTF-8"))?;
                url_encoding::parse_form(text).map_err(ProtocolError::Violation)?
            }
        };
        let mut fields = BTreeMap::new();
        for (key, value) in pairs {
            if fields.contains_key(&key) {
                return Err(ProtocolError::violation(format!("parameter {} appears more than once", key)));
            }
            fields.insert(key, value);
        }
        Ok(fields)
    }

    /// Builds the message an incoming HTTP request carries without running
    /// the incoming chain.
    pub fn read_message(&self, request: &HttpRequest) -> Result<Option<P>, ProtocolError> {
        let fields = Self::read_fields(request)?;
        if fields.is_empty() {
            return Ok(None);
        }
        let mut recipient = request.url.clone();
        recipient.set_query(None);
        let message = self.factory.new_request_message(&recipient, &fields, &self.descriptions)?;
        if message.is_none() {
            debug!(fields = fields.len(), "request carries no recognized message");
        }
        Ok(message)
    }

    /// Reads the message carried by an incoming HTTP request, if any.
    #[instrument(skip_all, fields(path = %request.url.path()))]
    pub fn receive(&self, request: &HttpRequest) -> Result<Option<P>, ProtocolError> {
        let Some(mut message) = self.read_message(request)? else {
            return Ok(None);
        };
        self.process_incoming(&mut message, Some(request))?;
        Ok(Some(message))
    }

    /// Like [`receive`](Self::receive) but a missing message is an error.
    pub fn receive_required(&self, request: &HttpRequest) -> Result<P, ProtocolError> {
        self.receive(request)?
            .ok_or_else(|| ProtocolError::violation("request does not carry a recognized message"))
    }

    /// Interprets the body of a direct response to `request`.
    pub fn read_response(&self, request: &P, response: &HttpResponse) -> Result<P, ProtocolError> {
        let fields = self.decode_direct_body(&response.body)?;
        let mut message = self
            .factory
            .new_response_message(request, &fields, &self.descriptions)?
            .ok_or_else(|| {
                ProtocolError::violation(format!("unrecognized direct response to {}", request.kind()))
            })?;
        self.process_incoming(&mut message, None)?;
        Ok(message)
    }

    /// Sends a direct request and returns the processed response.
    ///
    /// Cancelling `cancel` abandons the exchange. No lock is held while
    /// waiting on the transport.
    #[instrument(skip_all, fields(kind = request.kind()))]
    pub async fn request_async(&self, mut request: P, cancel: &CancellationToken) -> Result<P, ProtocolError> {
        let transport = self
            .transport
            .clone()
            .ok_or_else(|| ProtocolError::Host("no HTTP transport configured".to_string()))?;
        self.process_outgoing(&mut request)?;
        let http_request = self.direct_request(&request)?;
        let limit = self.settings.direct_request_timeout();

        let exchange = async move {
            let sent = transport.execute(http_request);
            let result = match limit {
                Some(limit) => tokio::time::timeout(limit, sent)
                    .await
                    .map_err(|_| ProtocolError::Transport(format!("no response within {:?}", limit)))?,
                None => sent.await,
            };
            result.map_err(|e| ProtocolError::Transport(e.to_string()))
        };

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProtocolError::Cancelled),
            response = exchange => response?,
        };
        debug!(status = response.status, "direct response received");
        self.read_response(&request, &response)
    }
}

fn encode_json(fields: &BTreeMap<String, String>, numeric_parts: &[&str]) -> Result<Vec<u8>, ProtocolError> {
    let mut object = serde_json::Map::new();
    for (key, value) in fields {
        let json = match value.parse::<i64>() {
            Ok(number) if numeric_parts.contains(&key.as_str()) => serde_json::Value::from(number),
            _ => serde_json::Value::from(value.as_str()),
        };
        object.insert(key.clone(), json);
    }
    serde_json::to_vec(&object).map_err(|e| ProtocolError::Host(format!("cannot render JSON body: {}", e)))
}

fn decode_json(body: &[u8]) -> Result<BTreeMap<String, String>, ProtocolError> {
    let object: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(body)
        .map_err(|e| ProtocolError::violation(format!("direct response is not a JSON object: {}", e)))?;
    let mut fields = BTreeMap::new();
    for (key, value) in object {
        let text = match value {
            serde_json::Value::Null => continue,
            serde_json::Value::String(text) => text,
            serde_json::Value::Number(number) => number.to_string(),
            serde_json::Value::Bool(flag) => flag.to_string(),
            _ => return Err(ProtocolError::violation(format!("JSON member {} is not a scalar", key))),
        };
        fields.insert(key, text);
    }
    Ok(fields)
}

fn html_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn auto_post_form(action: &Url, fields: &BTreeMap<String, String>) -> String {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html><head><title>Continue</title></head>\n<body onload=\"document.forms[0].submit()\">\n",
    );
    html.push_str(&format!("<form method=\"post\" action=\"{}\">\n", html_escape(action.as_str())));
    for (key, value) in fields {
        html.push_str(&format!(
            "<input type=\"hidden\" name=\"{}\" value=\"{}\" />\n",
            html_escape(key),
            html_escape(value)
        ));
    }
    html.push_str("<noscript><input type=\"submit\" value=\"Continue\" /></noscript>\n</form>\n</body></html>\n");
    html
}
