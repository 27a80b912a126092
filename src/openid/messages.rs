//! OpenID 1.x and 2.0 messages.

use std::collections::BTreeMap;

use url::Url;

use super::extensions::ExtensionData;
use super::{OPENID_2_0_NAMESPACE, PROVIDER_ENDPOINT_KEY};
use crate::messaging::message::{MessageBase, impl_message, protocol_message_union};
use crate::messaging::{
    DescribedMessage, EncodingError, Message, MessageDescriptions, MessagePart, MessageRouting, MessageTransport,
    MessageUri, ProtocolError, ProtocolVersion, Protections, ValueEncoder,
};

const V1_1: ProtocolVersion = ProtocolVersion::V1_1;
const V2_0: ProtocolVersion = ProtocolVersion::V2_0;

fn indirect_ns<M: 'static>() -> MessagePart<M> {
    MessagePart::constant("openid.ns", OPENID_2_0_NAMESPACE).min_version(V2_0)
}

fn direct_ns<M: 'static>() -> MessagePart<M> {
    MessagePart::constant("ns", OPENID_2_0_NAMESPACE).min_version(V2_0)
}

/// `openid.mode` of a checkid request; `true` means immediate.
#[derive(Debug, Default, Clone, Copy)]
pub struct CheckIdModeEncoder;

impl ValueEncoder<bool> for CheckIdModeEncoder {
    fn encode(&self, immediate: &bool) -> Result<String, EncodingError> {
        Ok(if *immediate { "checkid_immediate" } else { "checkid_setup" }.to_string())
    }

    fn decode(&self, value: &str) -> Result<bool, EncodingError> {
        match value {
            "checkid_immediate" => Ok(true),
            "checkid_setup" => Ok(false),
            other => Err(EncodingError::invalid(other, "not a checkid mode")),
        }
    }
}

/// Whether `return_to` falls under `realm`. A realm host of `*.example.com`
/// matches `example.com` and any subdomain of it.
pub fn realm_matches(realm: &Url, return_to: &Url) -> bool {
    if realm.fragment().is_some()
        || realm.scheme() != return_to.scheme()
        || realm.port_or_known_default() != return_to.port_or_known_default()
    {
        return false;
    }
    let (Some(realm_host), Some(host)) = (realm.host_str(), return_to.host_str()) else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    let host_matches = match realm_host.strip_prefix("*.") {
        Some(domain) => {
            let domain = domain.to_ascii_lowercase();
            host == domain || host.ends_with(&format!(".{}", domain))
        }
        None => host == realm_host.to_ascii_lowercase(),
    };
    let realm_path = realm.path();
    let path = return_to.path();
    let path_matches = path == realm_path
        || (path.starts_with(realm_path) && (realm_path.ends_with('/') || path[realm_path.len()..].starts_with('/')));
    host_matches && path_matches
}

/// Value of a query parameter on a return_to URL.
pub(crate) fn return_to_argument(return_to: &Url, key: &str) -> Option<String> {
    return_to.query_pairs().find(|(k, _)| k == key).map(|(_, v)| v.into_owned())
}

/// The protocol version implied by an `openid.ns` (or `ns`) value.
pub fn version_for_namespace(namespace: Option<&str>) -> Option<ProtocolVersion> {
    match namespace {
        None | Some(super::OPENID_1_1_NAMESPACE) => Some(ProtocolVersion::V1_1),
        Some(super::OPENID_1_0_NAMESPACE) => Some(ProtocolVersion::V1_0),
        Some(OPENID_2_0_NAMESPACE) => Some(ProtocolVersion::V2_0),
        Some(_) => None,
    }
}

/// Requests a shared association with a provider.
#[derive(Debug, Clone, Default)]
pub struct AssociateRequest {
    pub base: MessageBase,
    pub recipient: Option<Url>,
    pub association_type: String,
    /// Absent only in 1.x, where it means no encryption.
    pub session_type: Option<String>,
}

impl AssociateRequest {
    pub fn new(provider: Url, version: ProtocolVersion, association_type: &str) -> Self {
        Self {
            base: MessageBase::new(version),
            recipient: Some(provider),
            association_type: association_type.to_string(),
            session_type: Some(super::NO_ENCRYPTION.to_string()),
        }
    }

    /// The session type with the 1.x blank default applied.
    pub fn effective_session_type(&self) -> &str {
        match self.session_type.as_deref() {
            None | Some("") => super::NO_ENCRYPTION,
            Some(session) => session,
        }
    }
}

impl_message!(AssociateRequest);

impl DescribedMessage for AssociateRequest {
    fn declare_parts() -> Vec<MessagePart<Self>> {
        vec![
            indirect_ns(),
            MessagePart::constant("openid.mode", "associate"),
            MessagePart::<Self>::value("openid.assoc_type", |m| &m.association_type, |m| &mut m.association_type)
                .required()
                .non_empty(),
            MessagePart::<Self>::optional("openid.session_type", |m| &m.session_type, |m| &mut m.session_type)
                .required()
                .non_empty()
                .min_version(V2_0),
            MessagePart::<Self>::optional("openid.session_type", |m| &m.session_type, |m| &mut m.session_type)
                .max_version(V1_1),
        ]
    }

    fn new_for_version(version: ProtocolVersion) -> Self {
        Self { base: MessageBase::new(version), ..Default::default() }
    }
}

impl MessageRouting for AssociateRequest {
    const KIND: &'static str = "AssociateRequest";

    fn transport(&self) -> MessageTransport {
        MessageTransport::DirectRequest
    }

    fn recipient(&self) -> Option<&Url> {
        self.recipient.as_ref()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AssociateSuccessfulResponse {
    pub base: MessageBase,
    pub assoc_handle: String,
    pub association_type: String,
    pub session_type: Option<String>,
    pub expires_in: u64,
    pub mac_key: Vec<u8>,
}

impl_message!(AssociateSuccessfulResponse);

impl DescribedMessage for AssociateSuccessfulResponse {
    fn declare_parts() -> Vec<MessagePart<Self>> {
        vec![
            direct_ns(),
            MessagePart::<Self>::value("assoc_handle", |m| &m.assoc_handle, |m| &mut m.assoc_handle)
                .required()
                .non_empty(),
            MessagePart::<Self>::value("assoc_type", |m| &m.association_type, |m| &mut m.association_type)
                .required()
                .non_empty(),
            MessagePart::<Self>::optional("session_type", |m| &m.session_type, |m| &mut m.session_type)
                .required()
                .min_version(V2_0),
            MessagePart::<Self>::optional("session_type", |m| &m.session_type, |m| &mut m.session_type)
                .max_version(V1_1),
            MessagePart::<Self>::value("expires_in", |m| &m.expires_in, |m| &mut m.expires_in).required(),
            MessagePart::<Self>::value("mac_key", |m| &m.mac_key, |m| &mut m.mac_key)
                .required()
                .non_empty()
                .security_sensitive(),
        ]
    }

    fn new_for_version(version: ProtocolVersion) -> Self {
        Self { base: MessageBase::new(version), ..Default::default() }
    }
}

impl MessageRouting for AssociateSuccessfulResponse {
    const KIND: &'static str = "AssociateSuccessfulResponse";

    fn transport(&self) -> MessageTransport {
        MessageTransport::DirectResponse
    }
}

/// The provider will not create the association asked for, and may suggest
/// another type.
#[derive(Debug, Clone, Default)]
pub struct AssociateUnsuccessfulResponse {
    pub base: MessageBase,
    pub error: String,
    pub association_type: Option<String>,
    pub session_type: Option<String>,
}

impl_message!(AssociateUnsuccessfulResponse);

impl DescribedMessage for AssociateUnsuccessfulResponse {
    fn declare_parts() -> Vec<MessagePart<Self>> {
        vec![
            direct_ns(),
            MessagePart::<Self>::value("error", |m| &m.error, |m| &mut m.error).required(),
            MessagePart::constant("error_code", "unsupported-type").min_version(V2_0),
            MessagePart::<Self>::optional("assoc_type", |m| &m.association_type, |m| &mut m.association_type)
                .non_empty(),
            MessagePart::<Self>::optional("session_type", |m| &m.session_type, |m| &mut m.session_type).non_empty(),
        ]
    }

    fn new_for_version(version: ProtocolVersion) -> Self {
        Self { base: MessageBase::new(version), ..Default::default() }
    }
}

impl MessageRouting for AssociateUnsuccessfulResponse {
    const KIND: &'static str = "AssociateUnsuccessfulResponse";

    fn transport(&self) -> MessageTransport {
        MessageTransport::DirectResponse
    }

    fn http_status(&self) -> u16 {
        400
    }
}

/// An authentication request relayed to the provider through the user agent.
#[derive(Debug, Clone, Default)]
pub struct CheckIdRequest {
    pub base: MessageBase,
    pub recipient: Option<Url>,
    pub immediate: bool,
    pub claimed_id: Option<String>,
    pub local_identifier: Option<String>,
    pub assoc_handle: Option<String>,
    pub return_to: Option<MessageUri>,
    pub realm: Option<MessageUri>,
    pub extensions: Vec<ExtensionData>,
}

impl CheckIdRequest {
    pub fn new(provider: Url, version: ProtocolVersion, immediate: bool) -> Self {
        Self { base: MessageBase::new(version), recipient: Some(provider), immediate, ..Default::default() }
    }

    /// The realm, defaulting to return_to when none was given.
    pub fn effective_realm(&self) -> Option<&MessageUri> {
        self.realm.as_ref().or(self.return_to.as_ref())
    }

    fn check(&self) -> Result<(), ProtocolError> {
        if self.base.version >= V2_0 {
            if self.return_to.is_none() && self.realm.is_none() {
                return Err(ProtocolError::violation("checkid request needs openid.return_to or openid.realm"));
            }
            if self.claimed_id.is_some() != self.local_identifier.is_some() {
                return Err(ProtocolError::violation(
                    "openid.claimed_id and openid.identity must be given together",
                ));
            }
        }
        if let (Some(realm), Some(return_to)) = (&self.realm, &self.return_to) {
            if !realm_matches(realm.url(), return_to.url()) {
                return Err(ProtocolError::violation(format!(
                    "return_to {} is not within realm {}",
                    return_to, realm
                )));
            }
        }
        Ok(())
    }
}

impl_message!(CheckIdRequest, ensure_valid = check);

impl DescribedMessage for CheckIdRequest {
    fn declare_parts() -> Vec<MessagePart<Self>> {
        vec![
            indirect_ns(),
            MessagePart::<Self>::value_with(
                "openid.mode",
                |m| &m.immediate,
                |m| &mut m.immediate,
                CheckIdModeEncoder,
            )
            .required(),
            MessagePart::<Self>::optional("openid.claimed_id", |m| &m.claimed_id, |m| &mut m.claimed_id)
                .non_empty()
                .min_version(V2_0),
            MessagePart::<Self>::optional("openid.identity", |m| &m.local_identifier, |m| &mut m.local_identifier)
                .non_empty()
                .min_version(V2_0),
            MessagePart::<Self>::optional("openid.identity", |m| &m.local_identifier, |m| &mut m.local_identifier)
                .required()
                .non_empty()
                .max_version(V1_1),
            MessagePart::<Self>::optional("openid.assoc_handle", |m| &m.assoc_handle, |m| &mut m.assoc_handle)
                .non_empty(),
            MessagePart::<Self>::optional("openid.return_to", |m| &m.return_to, |m| &mut m.return_to)
                .min_version(V2_0),
            MessagePart::<Self>::optional("openid.return_to", |m| &m.return_to, |m| &mut m.return_to)
                .required()
                .max_version(V1_1),
            MessagePart::<Self>::optional("openid.realm", |m| &m.realm, |m| &mut m.realm).min_version(V2_0),
            MessagePart::<Self>::optional("openid.trust_root", |m| &m.realm, |m| &mut m.realm).max_version(V1_1),
        ]
    }

    fn new_for_version(version: ProtocolVersion) -> Self {
        Self { base: MessageBase::new(version), ..Default::default() }
    }
}

impl MessageRouting for CheckIdRequest {
    const KIND: &'static str = "CheckIdRequest";

    fn transport(&self) -> MessageTransport {
        MessageTransport::Indirect
    }

    fn recipient(&self) -> Option<&Url> {
        self.recipient.as_ref()
    }
}

/// A signed assertion that the user controls an identifier.
#[derive(Debug, Clone, Default)]
pub struct PositiveAssertion {
    pub base: MessageBase,
    pub op_endpoint: Option<MessageUri>,
    pub claimed_id: Option<String>,
    pub local_identifier: Option<String>,
    pub return_to: Option<MessageUri>,
    pub response_nonce: Option<String>,
    pub invalidate_handle: Option<String>,
    pub assoc_handle: String,
    pub signed: String,
    pub sig: String,
    pub extensions: Vec<ExtensionData>,
    /// Set once the provider confirmed the signature directly.
    pub signature_verified: bool,
    /// Set when the return_to arguments carried a valid local signature.
    pub return_to_signature_verified: bool,
}

impl PositiveAssertion {
    pub fn new(version: ProtocolVersion, op_endpoint: Url, return_to: MessageUri) -> Self {
        Self {
            base: MessageBase::new(version),
            op_endpoint: Some(op_endpoint.into()),
            return_to: Some(return_to),
            ..Default::default()
        }
    }

    /// Names listed in `openid.signed`, without the `openid.` prefix.
    pub fn signed_names(&self) -> Vec<&str> {
        self.signed.split(',').filter(|name| !name.is_empty()).collect()
    }

    /// The provider endpoint, falling back to the value tunneled through
    /// return_to for 1.x providers.
    pub fn provider_endpoint(&self) -> Option<Url> {
        if let Some(endpoint) = &self.op_endpoint {
            return Some(endpoint.url().clone());
        }
        let return_to = self.return_to.as_ref()?;
        return_to_argument(return_to.url(), PROVIDER_ENDPOINT_KEY).and_then(|value| Url::parse(&value).ok())
    }

    fn check(&self) -> Result<(), ProtocolError> {
        if self.base.version >= V2_0 && self.claimed_id.is_some() != self.local_identifier.is_some() {
            return Err(ProtocolError::violation(
                "openid.claimed_id and openid.identity must be given together",
            ));
        }
        Ok(())
    }
}

impl_message!(PositiveAssertion, ensure_valid = check);

impl DescribedMessage for PositiveAssertion {
    fn declare_parts() -> Vec<MessagePart<Self>> {
        let tamper = Protections::TAMPER_PROTECTION;
        vec![
            indirect_ns(),
            MessagePart::constant("openid.mode", "id_res"),
            MessagePart::<Self>::optional("openid.op_endpoint", |m| &m.op_endpoint, |m| &mut m.op_endpoint)
                .required()
                .protection(tamper)
                .min_version(V2_0),
            MessagePart::<Self>::optional("openid.claimed_id", |m| &m.claimed_id, |m| &mut m.claimed_id)
                .non_empty()
                .protection(tamper)
                .min_version(V2_0),
            MessagePart::<Self>::optional("openid.identity", |m| &m.local_identifier, |m| &mut m.local_identifier)
                .non_empty()
                .protection(tamper)
                .min_version(V2_0),
            MessagePart::<Self>::optional("openid.identity", |m| &m.local_identifier, |m| &mut m.local_identifier)
                .required()
                .non_empty()
                .protection(tamper)
                .max_version(V1_1),
            MessagePart::<Self>::optional("openid.return_to", |m| &m.return_to, |m| &mut m.return_to)
                .required()
                .protection(tamper),
            MessagePart::<Self>::optional("openid.response_nonce", |m| &m.response_nonce, |m| &mut m.response_nonce)
                .required()
                .non_empty()
                .protection(tamper)
                .min_version(V2_0),
            MessagePart::<Self>::optional("openid.response_nonce", |m| &m.response_nonce, |m| &mut m.response_nonce)
                .max_version(V1_1),
            MessagePart::<Self>::optional(
                "openid.invalidate_handle",
                |m| &m.invalidate_handle,
                |m| &mut m.invalidate_handle,
            )
            .non_empty(),
            MessagePart::<Self>::value("openid.assoc_handle", |m| &m.assoc_handle, |m| &mut m.assoc_handle)
                .required()
                .non_empty()
                .protection(tamper)
                .min_version(V2_0),
            MessagePart::<Self>::value("openid.assoc_handle", |m| &m.assoc_handle, |m| &mut m.assoc_handle)
                .required()
                .non_empty()
                .max_version(V1_1),
            MessagePart::<Self>::value("openid.signed", |m| &m.signed, |m| &mut m.signed)
                .required()
                .non_empty(),
            MessagePart::<Self>::value("openid.sig", |m| &m.sig, |m| &mut m.sig).required().non_empty(),
        ]
    }

    fn new_for_version(version: ProtocolVersion) -> Self {
        Self { base: MessageBase::new(version), ..Default::default() }
    }
}

impl MessageRouting for PositiveAssertion {
    const KIND: &'static str = "PositiveAssertion";

    /// 1.x assertions get expiration and replay protection from the
    /// relying party's return_to nonce.
    fn required_protection(&self) -> Protections {
        Protections::all()
    }

    fn transport(&self) -> MessageTransport {
        MessageTransport::Indirect
    }

    fn recipient(&self) -> Option<&Url> {
        self.return_to.as_ref().map(MessageUri::url)
    }
}

/// The user cancelled, or an immediate request needs interaction.
#[derive(Debug, Clone, Default)]
pub struct NegativeAssertion {
    pub base: MessageBase,
    pub return_to: Option<Url>,
    /// `cancel` or `setup_needed`; 1.x immediate failures use `id_res`.
    pub mode: String,
    pub user_setup_url: Option<MessageUri>,
}

impl NegativeAssertion {
    pub fn new(version: ProtocolVersion, return_to: Url, immediate: bool) -> Self {
        let mode = match (immediate, version >= V2_0) {
            (false, _) => "cancel",
            (true, true) => "setup_needed",
            (true, false) => "id_res",
        };
        Self { base: MessageBase::new(version), return_to: Some(return_to), mode: mode.to_string(), user_setup_url: None }
    }

    pub fn is_setup_needed(&self) -> bool {
        self.mode != "cancel"
    }

    fn check(&self) -> Result<(), ProtocolError> {
        let allowed: &[&str] = if self.base.version >= V2_0 { &["cancel", "setup_needed"] } else { &["cancel", "id_res"] };
        if !allowed.contains(&self.mode.as_str()) {
            return Err(ProtocolError::violation(format!("{} is not a negative assertion mode", self.mode)));
        }
        if self.base.version < V2_0 && self.mode == "id_res" && self.user_setup_url.is_none() {
            return Err(ProtocolError::violation("1.x setup needed responses carry openid.user_setup_url"));
        }
        Ok(())
    }
}

impl_message!(NegativeAssertion, ensure_valid = check);

impl DescribedMessage for NegativeAssertion {
    fn declare_parts() -> Vec<MessagePart<Self>> {
        vec![
            indirect_ns(),
            MessagePart::<Self>::value("openid.mode", |m| &m.mode, |m| &mut m.mode).required().non_empty(),
            MessagePart::<Self>::optional("openid.user_setup_url", |m| &m.user_setup_url, |m| &mut m.user_setup_url)
                .max_version(V1_1),
        ]
    }

    fn new_for_version(version: ProtocolVersion) -> Self {
        Self { base: MessageBase::new(version), ..Default::default() }
    }
}

impl MessageRouting for NegativeAssertion {
    const KIND: &'static str = "NegativeAssertion";

    fn transport(&self) -> MessageTransport {
        MessageTransport::Indirect
    }

    fn recipient(&self) -> Option<&Url> {
        self.return_to.as_ref()
    }
}

/// Asks the provider to verify an assertion signed with a private association.
///
/// Every field of the assertion travels along; only the declared ones are
/// typed, the rest stay in extra data.
#[derive(Debug, Clone, Default)]
pub struct CheckAuthenticationRequest {
    pub base: MessageBase,
    pub recipient: Option<Url>,
    pub op_endpoint: Option<MessageUri>,
    pub assoc_handle: String,
    pub signed: String,
    pub sig: String,
    pub response_nonce: Option<String>,
    pub invalidate_handle: Option<String>,
    /// Set by the provider once the signature checks out.
    pub signature_valid: bool,
}

impl CheckAuthenticationRequest {
    /// Builds the request from the wire fields of a received assertion.
    pub fn from_assertion_fields(
        provider: Url,
        version: ProtocolVersion,
        assertion: &BTreeMap<String, String>,
        descriptions: &MessageDescriptions,
    ) -> Result<Self, ProtocolError> {
        let mut fields = assertion.clone();
        fields.insert("openid.mode".to_string(), "check_authentication".to_string());
        let mut request: Self = descriptions.deserialize(version, &fields)?;
        request.recipient = Some(provider);
        Ok(request)
    }

    pub fn signed_names(&self) -> Vec<&str> {
        self.signed.split(',').filter(|name| !name.is_empty()).collect()
    }
}

impl_message!(CheckAuthenticationRequest);

impl DescribedMessage for CheckAuthenticationRequest {
    fn declare_parts() -> Vec<MessagePart<Self>> {
        vec![
            indirect_ns(),
            MessagePart::constant("openid.mode", "check_authentication"),
            MessagePart::<Self>::optional("openid.op_endpoint", |m| &m.op_endpoint, |m| &mut m.op_endpoint),
            MessagePart::<Self>::value("openid.assoc_handle", |m| &m.assoc_handle, |m| &mut m.assoc_handle)
                .required()
                .non_empty(),
            MessagePart::<Self>::value("openid.signed", |m| &m.signed, |m| &mut m.signed)
                .required()
                .non_empty(),
            MessagePart::<Self>::value("openid.sig", |m| &m.sig, |m| &mut m.sig).required().non_empty(),
            MessagePart::<Self>::optional("openid.response_nonce", |m| &m.response_nonce, |m| &mut m.response_nonce),
            MessagePart::<Self>::optional(
                "openid.invalidate_handle",
                |m| &m.invalidate_handle,
                |m| &mut m.invalidate_handle,
            ),
        ]
    }

    fn new_for_version(version: ProtocolVersion) -> Self {
        Self { base: MessageBase::new(version), ..Default::default() }
    }
}

impl MessageRouting for CheckAuthenticationRequest {
    const KIND: &'static str = "CheckAuthenticationRequest";

    fn transport(&self) -> MessageTransport {
        MessageTransport::DirectRequest
    }

    fn recipient(&self) -> Option<&Url> {
        self.recipient.as_ref()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CheckAuthenticationResponse {
    pub base: MessageBase,
    pub is_valid: bool,
    /// A handle the relying party should forget.
    pub invalidate_handle: Option<String>,
}

impl_message!(CheckAuthenticationResponse);

impl DescribedMessage for CheckAuthenticationResponse {
    fn declare_parts() -> Vec<MessagePart<Self>> {
        vec![
            direct_ns(),
            MessagePart::<Self>::value("is_valid", |m| &m.is_valid, |m| &mut m.is_valid).required(),
            MessagePart::<Self>::optional("invalidate_handle", |m| &m.invalidate_handle, |m| &mut m.invalidate_handle)
                .non_empty(),
        ]
    }

    fn new_for_version(version: ProtocolVersion) -> Self {
        Self { base: MessageBase::new(version), ..Default::default() }
    }
}

impl MessageRouting for CheckAuthenticationResponse {
    const KIND: &'static str = "CheckAuthenticationResponse";

    fn transport(&self) -> MessageTransport {
        MessageTransport::DirectResponse
    }
}

/// An error reported back to the relying party through the user agent.
#[derive(Debug, Clone, Default)]
pub struct IndirectErrorResponse {
    pub base: MessageBase,
    pub recipient: Option<Url>,
    pub error: String,
    pub contact: Option<String>,
    pub reference: Option<String>,
}

impl IndirectErrorResponse {
    pub fn new(version: ProtocolVersion, recipient: Url, error: impl Into<String>) -> Self {
        Self { base: MessageBase::new(version), recipient: Some(recipient), error: error.into(), ..Default::default() }
    }
}

impl_message!(IndirectErrorResponse);

impl DescribedMessage for IndirectErrorResponse {
    fn declare_parts() -> Vec<MessagePart<Self>> {
        vec![
            indirect_ns(),
            MessagePart::constant("openid.mode", "error"),
            MessagePart::<Self>::value("openid.error", |m| &m.error, |m| &mut m.error).required().non_empty(),
            MessagePart::<Self>::optional("openid.contact", |m| &m.contact, |m| &mut m.contact),
            MessagePart::<Self>::optional("openid.reference", |m| &m.reference, |m| &mut m.reference),
        ]
    }

    fn new_for_version(version: ProtocolVersion) -> Self {
        Self { base: MessageBase::new(version), ..Default::default() }
    }
}

impl MessageRouting for IndirectErrorResponse {
    const KIND: &'static str = "IndirectErrorResponse";

    fn transport(&self) -> MessageTransport {
        MessageTransport::Indirect
    }

    fn recipient(&self) -> Option<&Url> {
        self.recipient.as_ref()
    }
}

/// Body of a failed direct request.
#[derive(Debug, Clone, Default)]
pub struct DirectErrorResponse {
    pub base: MessageBase,
    pub error: String,
    pub contact: Option<String>,
    pub reference: Option<String>,
}

impl DirectErrorResponse {
    pub fn new(version: ProtocolVersion, error: impl Into<String>) -> Self {
        Self { base: MessageBase::new(version), error: error.into(), ..Default::default() }
    }
}

impl_message!(DirectErrorResponse);

impl DescribedMessage for DirectErrorResponse {
    fn declare_parts() -> Vec<MessagePart<Self>> {
        vec![
            direct_ns(),
            MessagePart::<Self>::value("error", |m| &m.error, |m| &mut m.error).required(),
            MessagePart::<Self>::optional("contact", |m| &m.contact, |m| &mut m.contact),
            MessagePart::<Self>::optional("reference", |m| &m.reference, |m| &mut m.reference),
        ]
    }

    fn new_for_version(version: ProtocolVersion) -> Self {
        Self { base: MessageBase::new(version), ..Default::default() }
    }
}

impl MessageRouting for DirectErrorResponse {
    const KIND: &'static str = "DirectErrorResponse";

    fn transport(&self) -> MessageTransport {
        MessageTransport::DirectResponse
    }

    fn http_status(&self) -> u16 {
        400
    }
}

protocol_message_union! {
    /// Every message an OpenID relying party or provider handles.
    #[derive(Debug, Clone)]
    pub enum OpenIdMessage {
        AssociateRequest(AssociateRequest),
        AssociateSuccessfulResponse(AssociateSuccessfulResponse),
        AssociateUnsuccessfulResponse(AssociateUnsuccessfulResponse),
        CheckIdRequest(CheckIdRequest),
        PositiveAssertion(PositiveAssertion),
        NegativeAssertion(NegativeAssertion),
        CheckAuthenticationRequest(CheckAuthenticationRequest),
        CheckAuthenticationResponse(CheckAuthenticationResponse),
        IndirectErrorResponse(IndirectErrorResponse),
        DirectErrorResponse(DirectErrorResponse),
    }
}
