//! Extension arguments: `openid.ns.<alias>` declarations and the
//! `openid.<alias>.*` fields that go with them.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::messages::OpenIdMessage;
use super::signing::SIGNING_ELEMENT;
use crate::messaging::message::{MessageBase, impl_message};
use crate::messaging::{
    ChannelBindingElement, ChannelContext, DescribedMessage, EncodingError, MessageDescriptions, MessagePart,
    MessageUri, ProtocolError, ProtocolVersion, Protections, ValueEncoder,
};

pub const EXTENSIONS_ELEMENT: &str = "Extensions";

pub const SREG_1_1_TYPE_URI: &str = "http://openid.net/extensions/sreg/1.1";
pub const SREG_1_0_TYPE_URI: &str = "http://openid.net/sreg/1.0";

const SREG_ALIAS: &str = "sreg";
const NS_PREFIX: &str = "openid.ns.";

/// One extension's arguments, keyed without the alias prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionData {
    pub type_uri: String,
    pub fields: BTreeMap<String, String>,
    /// Every argument was covered by the assertion signature.
    pub signed: bool,
}

impl ExtensionData {
    pub fn new(type_uri: impl Into<String>) -> Self {
        Self { type_uri: type_uri.into(), ..Default::default() }
    }

    /// Extension messages are described like protocol messages, at a fixed
    /// version.
    pub fn from_message<M: DescribedMessage>(
        type_uri: impl Into<String>,
        message: &M,
        descriptions: &MessageDescriptions,
    ) -> Result<Self, ProtocolError> {
        Ok(Self { type_uri: type_uri.into(), fields: descriptions.serialize(message)?, signed: false })
    }

    pub fn to_message<M: DescribedMessage>(&self, descriptions: &MessageDescriptions) -> Result<M, ProtocolError> {
        descriptions.deserialize(ProtocolVersion::V1_0, &self.fields)
    }

    pub fn is_sreg(&self) -> bool {
        self.type_uri == SREG_1_1_TYPE_URI || self.type_uri == SREG_1_0_TYPE_URI
    }
}

/// Writes extension arguments into outgoing messages and gathers them from
/// incoming ones.
#[derive(Debug, Default)]
pub struct ExtensionsBindingElement;

impl ExtensionsBindingElement {
    pub fn new() -> Self {
        Self
    }

    fn write(extensions: &[ExtensionData], version: ProtocolVersion, extra: &mut BTreeMap<String, String>) {
        let mut next_alias = 1;
        for extension in extensions {
            let alias = if extension.is_sreg() {
                SREG_ALIAS.to_string()
            } else if version < ProtocolVersion::V2_0 {
                warn!(type_uri = %extension.type_uri, "1.x messages can only carry simple registration");
                continue;
            } else {
                loop {
                    let candidate = format!("ext{}", next_alias);
                    next_alias += 1;
                    if !extra.contains_key(&format!("{}{}", NS_PREFIX, candidate)) {
                        break candidate;
                    }
                }
            };
            if version >= ProtocolVersion::V2_0 {
                extra.insert(format!("{}{}", NS_PREFIX, alias), extension.type_uri.clone());
            }
            for (key, value) in &extension.fields {
                extra.insert(format!("openid.{}.{}", alias, key), value.clone());
            }
        }
    }

    /// Alias to type URI for the extensions present in `extra`.
    fn aliases(version: ProtocolVersion, extra: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut aliases: BTreeMap<String, String> = extra
            .iter()
            .filter_map(|(key, value)| key.strip_prefix(NS_PREFIX).map(|alias| (alias.to_string(), value.clone())))
            .collect();
        let sreg_prefix = format!("openid.{}.", SREG_ALIAS);
        if version < ProtocolVersion::V2_0 && extra.keys().any(|key| key.starts_with(&sreg_prefix)) {
            aliases.entry(SREG_ALIAS.to_string()).or_insert_with(|| SREG_1_0_TYPE_URI.to_string());
        }
        aliases
    }

    /// Removes and returns each extension's arguments. `signed` lists the
    /// signed parameter names without their `openid.` prefix.
    fn read(
        version: ProtocolVersion,
        extra: &mut BTreeMap<String, String>,
        signed: Option<&[&str]>,
    ) -> Vec<ExtensionData> {
        let mut extensions = Vec::new();
        for (alias, type_uri) in Self::aliases(version, extra) {
            let ns_key = format!("{}{}", NS_PREFIX, alias);
            let prefix = format!("openid.{}.", alias);
            let keys: Vec<String> = extra.keys().filter(|key| key.starts_with(&prefix)).cloned().collect();

            let covered = |key: &str| signed.is_some_and(|names| names.contains(&&key["openid.".len()..]));
            let ns_signed = version < ProtocolVersion::V2_0 || covered(&ns_key);
            let mut data = ExtensionData::new(type_uri);
            data.signed = signed.is_some() && ns_signed && keys.iter().all(|key| covered(key));

            extra.remove(&ns_key);
            for key in keys {
                if let Some(value) = extra.remove(&key) {
                    data.fields.insert(key[prefix.len()..].to_string(), value);
                }
            }
            extensions.push(data);
        }
        extensions
    }
}

impl ChannelBindingElement<OpenIdMessage> for ExtensionsBindingElement {
    fn name(&self) -> &'static str {
        EXTENSIONS_ELEMENT
    }

    fn protection(&self) -> Protections {
        Protections::NONE
    }

    fn requires(&self) -> &'static [&'static str] {
        &[SIGNING_ELEMENT]
    }

    fn process_outgoing(
        &self,
        message: &mut OpenIdMessage,
        _context: &ChannelContext<'_>,
    ) -> Result<Option<Protections>, ProtocolError> {
        let (extensions, version, extra) = match message {
            OpenIdMessage::CheckIdRequest(request) => {
                (&request.extensions, request.base.version, &mut request.base.extra_data)
            }
            OpenIdMessage::PositiveAssertion(assertion) => {
                (&assertion.extensions, assertion.base.version, &mut assertion.base.extra_data)
            }
            _ => return Ok(None),
        };
        if extensions.is_empty() {
            return Ok(None);
        }
        Self::write(extensions, version, extra);
        debug!(count = extensions.len(), "wrote extension arguments");
        Ok(Some(Protections::NONE))
    }

    fn process_incoming(
        &self,
        message: &mut OpenIdMessage,
        context: &ChannelContext<'_>,
    ) -> Result<Option<Protections>, ProtocolError> {
        match message {
            OpenIdMessage::CheckIdRequest(request) => {
                request.extensions = Self::read(request.base.version, &mut request.base.extra_data, None);
            }
            OpenIdMessage::PositiveAssertion(assertion) => {
                let signed = assertion.signed.clone();
                let names: Vec<&str> = signed.split(',').filter(|name| !name.is_empty()).collect();
                let mut extensions =
                    Self::read(assertion.base.version, &mut assertion.base.extra_data, Some(&names));
                if !context.settings.accept_unsigned_extensions {
                    extensions.retain(|extension| {
                        if !extension.signed {
                            warn!(type_uri = %extension.type_uri, "dropping unsigned extension");
                        }
                        extension.signed
                    });
                }
                assertion.extensions = extensions;
            }
            _ => return Ok(None),
        }
        Ok(Some(Protections::NONE))
    }
}

/// Comma separated field names.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommaListEncoder;

impl ValueEncoder<Vec<String>> for CommaListEncoder {
    fn encode(&self, value: &Vec<String>) -> Result<String, EncodingError> {
        Ok(value.join(","))
    }

    fn decode(&self, value: &str) -> Result<Vec<String>, EncodingError> {
        Ok(value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
    }
}

/// Simple registration request: profile fields the relying party wants.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClaimsRequest {
    pub base: MessageBase,
    pub required: Option<Vec<String>>,
    pub optional: Option<Vec<String>>,
    pub policy_url: Option<MessageUri>,
}

impl ClaimsRequest {
    pub fn new() -> Self {
        Self::new_for_version(ProtocolVersion::V1_0)
    }

    pub fn require(mut self, field: &str) -> Self {
        self.required.get_or_insert_with(Vec::new).push(field.to_string());
        self
    }

    pub fn request(mut self, field: &str) -> Self {
        self.optional.get_or_insert_with(Vec::new).push(field.to_string());
        self
    }

    pub fn into_extension(self, descriptions: &MessageDescriptions) -> Result<ExtensionData, ProtocolError> {
        ExtensionData::from_message(SREG_1_1_TYPE_URI, &self, descriptions)
    }

    pub fn find(extensions: &[ExtensionData], descriptions: &MessageDescriptions) -> Option<Result<Self, ProtocolError>> {
        extensions.iter().find(|e| e.is_sreg()).map(|e| e.to_message(descriptions))
    }
}

impl_message!(ClaimsRequest);

impl DescribedMessage for ClaimsRequest {
    fn declare_parts() -> Vec<MessagePart<Self>> {
        vec![
            MessagePart::<Self>::optional_with("required", |m| &m.required, |m| &mut m.required, CommaListEncoder),
            MessagePart::<Self>::optional_with("optional", |m| &m.optional, |m| &mut m.optional, CommaListEncoder),
            MessagePart::<Self>::optional("policy_url", |m| &m.policy_url, |m| &mut m.policy_url),
        ]
    }

    fn new_for_version(version: ProtocolVersion) -> Self {
        Self { base: MessageBase::new(version), ..Default::default() }
    }
}

/// Simple registration response: the profile fields the user released.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClaimsResponse {
    pub base: MessageBase,
    pub nickname: Option<String>,
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub birth_date: Option<String>,
    pub gender: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub language: Option<String>,
    pub time_zone: Option<String>,
}

impl ClaimsResponse {
    pub fn new() -> Self {
        Self::new_for_version(ProtocolVersion::V1_0)
    }

    pub fn into_extension(self, descriptions: &MessageDescriptions) -> Result<ExtensionData, ProtocolError> {
        ExtensionData::from_message(SREG_1_1_TYPE_URI, &self, descriptions)
    }

    pub fn find(extensions: &[ExtensionData], descriptions: &MessageDescriptions) -> Option<Result<Self, ProtocolError>> {
        extensions.iter().find(|e| e.is_sreg()).map(|e| e.to_message(descriptions))
    }
}

impl_message!(ClaimsResponse);

impl DescribedMessage for ClaimsResponse {
    fn declare_parts() -> Vec<MessagePart<Self>> {
        vec![
            MessagePart::<Self>::optional("nickname", |m| &m.nickname, |m| &mut m.nickname),
            MessagePart::<Self>::optional("email", |m| &m.email, |m| &mut m.email),
            MessagePart::<Self>::optional("fullname", |m| &m.full_name, |m| &mut m.full_name),
            MessagePart::<Self>::optional("dob", |m| &m.birth_date, |m| &mut m.birth_date),
            MessagePart::<Self>::optional("gender", |m| &m.gender, |m| &mut m.gender),
            MessagePart::<Self>::optional("postcode", |m| &m.postal_code, |m| &mut m.postal_code),
            MessagePart::<Self>::optional("country", |m| &m.country, |m| &mut m.country),
            MessagePart::<Self>::optional("language", |m| &m.language, |m| &mut m.language),
            MessagePart::<Self>::optional("timezone", |m| &m.time_zone, |m| &mut m.time_zone),
        ]
    }

    fn new_for_version(version: ProtocolVersion) -> Self {
        Self { base: MessageBase::new(version), ..Default::default() }
    }
}
