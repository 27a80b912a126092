//! Per-(type, version) part tables, their validation, and the shared cache.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use super::error::ProtocolError;
use super::message::{DescribedMessage, ProtocolVersion};
use super::part::MessagePart;

/// Whether a failed check raises an error or just reports `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    Strict,
    Probe,
}

impl ValidationMode {
    fn fail(self, error: ProtocolError) -> Result<bool, ProtocolError> {
        match self {
            ValidationMode::Strict => Err(error),
            ValidationMode::Probe => Ok(false),
        }
    }
}

/// The resolved parts of message type `M` at one protocol version.
pub struct MessageDescription<M> {
    message_type: &'static str,
    version: ProtocolVersion,
    parts: Vec<MessagePart<M>>,
    index: HashMap<&'static str, usize>,
}

impl<M: DescribedMessage> MessageDescription<M> {
    /// Resolves `M`'s declarations for `version`.
    ///
    /// When several declarations share a wire name, the one nearest the
    /// message type wins, then the one with the highest minimum version.
    pub fn build(version: ProtocolVersion) -> Result<Self, ProtocolError> {
        let message_type = std::any::type_name::<M>();
        let mut parts: Vec<MessagePart<M>> = Vec::new();

        for part in M::declare_parts() {
            if !part.is_nullable() && !part.is_required() {
                return Err(ProtocolError::Description {
                    message: message_type,
                    reason: format!("non-nullable part {} must be required", part.name()),
                });
            }
            if !part.applies_to(version) {
                continue;
            }
            match parts.iter().position(|existing| existing.name() == part.name()) {
                Some(i) => {
                    let existing = &parts[i];
                    let replaces = part.depth() < existing.depth()
                        || (part.depth() == existing.depth()
                            && part.min_version_bound() > existing.min_version_bound());
                    debug!(
                        message = message_type,
                        part = part.name(),
                        replaces,
                        "resolving duplicate part declaration"
                    );
                    if replaces {
                        parts[i] = part;
                    }
                }
                None => parts.push(part),
            }
        }

        let index = parts.iter().enumerate().map(|(i, p)| (p.name(), i)).collect();
        Ok(Self { message_type, version, parts, index })
    }

    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn part(&self, name: &str) -> Option<&MessagePart<M>> {
        self.index.get(name).map(|&i| &self.parts[i])
    }

    pub fn parts(&self) -> impl Iterator<Item = &MessagePart<M>> {
        self.parts.iter()
    }

    pub fn check_required_present(
        &self,
        fields: &BTreeMap<String, String>,
        mode: ValidationMode,
    ) -> Result<bool, ProtocolError> {
        let missing: Vec<String> = self
            .parts
            .iter()
            .filter(|p| p.is_required() && !fields.contains_key(p.name()))
            .map(|p| p.name().to_string())
            .collect();
        if missing.is_empty() {
            Ok(true)
        } else {
            mode.fail(ProtocolError::MissingParts { message: self.message_type, parts: missing })
        }
    }

    pub fn check_required_nonempty(
        &self,
        fields: &BTreeMap<String, String>,
        mode: ValidationMode,
    ) -> Result<bool, ProtocolError> {
        let empty: Vec<String> = self
            .parts
            .iter()
            .filter(|p| !p.allows_empty())
            .filter(|p| fields.get(p.name()).is_some_and(|v| v.is_empty()))
            .map(|p| p.name().to_string())
            .collect();
        if empty.is_empty() {
            Ok(true)
        } else {
            mode.fail(ProtocolError::EmptyParts { message: self.message_type, parts: empty })
        }
    }

    pub fn check_constant_values(
        &self,
        fields: &BTreeMap<String, String>,
        mode: ValidationMode,
    ) -> Result<bool, ProtocolError> {
        for part in &self.parts {
            let (Some(expected), Some(actual)) = (part.constant_value(), fields.get(part.name())) else {
                continue;
            };
            if expected != actual {
                return mode.fail(ProtocolError::ConstantMismatch {
                    message: self.message_type,
                    part: part.name().to_string(),
                    expected: expected.to_string(),
                    actual: actual.clone(),
                });
            }
        }
        Ok(true)
    }

    /// Runs every basic check. Probe mode never returns `Err`.
    pub fn validate(&self, fields: &BTreeMap<String, String>, mode: ValidationMode) -> Result<bool, ProtocolError> {
        Ok(self.check_required_present(fields, mode)?
            && self.check_required_nonempty(fields, mode)?
            && self.check_constant_values(fields, mode)?)
    }

    fn collect(&self, message: &M, original: bool) -> Result<BTreeMap<String, String>, ProtocolError> {
        let mut fields = BTreeMap::new();
        for part in &self.parts {
            let value = if original { part.get_original_value(message) } else { part.get_value(message) };
            let value = value.map_err(|source| ProtocolError::Format {
                message: self.message_type,
                part: part.name().to_string(),
                source,
            })?;
            if let Some(value) = value {
                fields.insert(part.name().to_string(), value);
            }
        }
        for (key, value) in message.extra_data() {
            if self.index.contains_key(key.as_str()) {
                warn!(message = self.message_type, key = %key, "extra data shadows a declared part; ignoring it");
                continue;
            }
            fields.insert(key.clone(), value.clone());
        }
        self.validate(&fields, ValidationMode::Strict)?;
        Ok(fields)
    }

    /// Wire fields for an outgoing message, failing if a required part is unset.
    pub fn serialize(&self, message: &M) -> Result<BTreeMap<String, String>, ProtocolError> {
        self.collect(message, false)
    }

    /// Like [`serialize`](Self::serialize) but with values as originally received.
    pub fn serialize_original(&self, message: &M) -> Result<BTreeMap<String, String>, ProtocolError> {
        self.collect(message, true)
    }

    /// Populates `message` from wire fields after strict validation. Unknown
    /// keys land in the message's extra data.
    pub fn deserialize(&self, fields: &BTreeMap<String, String>, message: &mut M) -> Result<(), ProtocolError> {
        self.validate(fields, ValidationMode::Strict)?;
        for (key, value) in fields {
            match self.part(key) {
                Some(part) => part.set_value(message, Some(value)).map_err(|source| ProtocolError::Format {
                    message: self.message_type,
                    part: key.clone(),
                    source,
                })?,
                None => {
                    message.extra_data_mut().insert(key.clone(), value.clone());
                }
            }
        }
        message.ensure_valid()
    }
}

/// Cache of descriptions keyed by message type and version.
///
/// Descriptions are built outside any lock; when two callers race, the first
/// to publish wins and both receive that instance.
#[derive(Default)]
pub struct MessageDescriptions {
    cache: DashMap<(TypeId, ProtocolVersion), Arc<dyn Any + Send + Sync>>,
}

impl MessageDescriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<M: DescribedMessage>(&self, version: ProtocolVersion) -> Result<Arc<MessageDescription<M>>, ProtocolError> {
        let key = (TypeId::of::<M>(), version);
        let cached = self.cache.get(&key).map(|entry| entry.value().clone());
        let description = match cached {
            Some(description) => description,
            None => {
                let built: Arc<dyn Any + Send + Sync> = Arc::new(MessageDescription::<M>::build(version)?);
                self.cache.entry(key).or_insert(built).value().clone()
            }
        };
        description
            .downcast::<MessageDescription<M>>()
            .map_err(|_| ProtocolError::Host("message description cache holds a foreign type".to_string()))
    }

    pub fn serialize<M: DescribedMessage>(&self, message: &M) -> Result<BTreeMap<String, String>, ProtocolError> {
        self.get::<M>(message.version())?.serialize(message)
    }

    pub fn serialize_original<M: DescribedMessage>(&self, message: &M) -> Result<BTreeMap<String, String>, ProtocolError> {
        self.get::<M>(message.version())?.serialize_original(message)
    }

    pub fn deserialize<M: DescribedMessage>(
        &self,
        version: ProtocolVersion,
        fields: &BTreeMap<String, String>,
    ) -> Result<M, ProtocolError> {
        let description = self.get::<M>(version)?;
        let mut message = M::new_for_version(version);
        description.deserialize(fields, &mut message)?;
        Ok(message)
    }

    /// Whether `fields` pass `M`'s basic checks, without raising.
    pub fn probe<M: DescribedMessage>(&self, version: ProtocolVersion, fields: &BTreeMap<String, String>) -> bool {
        self.get::<M>(version)
            .and_then(|d| d.validate(fields, ValidationMode::Probe))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::messaging::message::{MessageBase, impl_message};
    use crate::messaging::{MessageUri, Protections};

    #[derive(Debug, Default)]
    pub(crate) struct Greeting {
        pub base: MessageBase,
        pub count: u32,
        pub text: Option<String>,
        pub target: Option<MessageUri>,
        pub legacy_target: Option<MessageUri>,
    }

    impl_message!(Greeting);

    impl DescribedMessage for Greeting {
        fn declare_parts() -> Vec<MessagePart<Self>> {
            vec![
                MessagePart::constant("mode", "greet"),
                MessagePart::<Self>::value("count", |m| &m.count, |m| &mut m.count).required(),
                MessagePart::<Self>::optional("text", |m| &m.text, |m| &mut m.text)
                    .non_empty()
                    .protection(Protections::TAMPER_PROTECTION),
                MessagePart::<Self>::optional("target", |m| &m.target, |m| &mut m.target)
                    .max_version(ProtocolVersion::V1_1),
                MessagePart::<Self>::optional("target", |m| &m.target, |m| &mut m.target)
                    .required()
                    .min_version(ProtocolVersion::V2_0),
                MessagePart::<Self>::optional("legacy", |m| &m.legacy_target, |m| &mut m.legacy_target)
                    .max_version(ProtocolVersion::V1_1),
            ]
        }

        fn new_for_version(version: ProtocolVersion) -> Self {
            Self { base: MessageBase::new(version), ..Default::default() }
        }
    }

    #[derive(Debug, Default)]
    struct Broken {
        base: MessageBase,
        count: u32,
    }

    impl_message!(Broken);

    impl DescribedMessage for Broken {
        fn declare_parts() -> Vec<MessagePart<Self>> {
            vec![MessagePart::<Self>::value("count", |m| &m.count, |m| &mut m.count)]
        }

        fn new_for_version(version: ProtocolVersion) -> Self {
            Self { base: MessageBase::new(version), ..Default::default() }
        }
    }

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn optional_non_nullable_part_fails_at_build() {
        let err = MessageDescription::<Broken>::build(ProtocolVersion::V2_0).err().unwrap();
        assert!(matches!(err, ProtocolError::Description { .. }));
    }

    #[test]
    fn version_scoped_declarations_are_selected() {
        let v1 = MessageDescription::<Greeting>::build(ProtocolVersion::V1_1).unwrap();
        let v2 = MessageDescription::<Greeting>::build(ProtocolVersion::V2_0).unwrap();
        assert!(!v1.part("target").unwrap().is_required());
        assert!(v2.part("target").unwrap().is_required());
        assert!(v1.part("legacy").is_some());
        assert!(v2.part("legacy").is_none());
    }

    #[test]
    fn strict_and_probe_agree() {
        let description = MessageDescription::<Greeting>::build(ProtocolVersion::V2_0).unwrap();
        let cases = [
            fields(&[("mode", "greet"), ("count", "1"), ("target", "https://a.example/")]),
            fields(&[("mode", "greet"), ("count", "1")]),
            fields(&[("mode", "wave"), ("count", "1"), ("target", "https://a.example/")]),
            fields(&[("mode", "greet"), ("count", "1"), ("target", "https://a.example/"), ("text", "")]),
        ];
        for case in &cases {
            let strict = description.validate(case, ValidationMode::Strict);
            let probe = description.validate(case, ValidationMode::Probe).unwrap();
            assert_eq!(strict.is_ok(), probe, "{:?}", case);
        }
    }

    #[test]
    fn deserialize_maps_parts_and_keeps_extras() {
        let descriptions = MessageDescriptions::new();
        let greeting: Greeting = descriptions
            .deserialize(
                ProtocolVersion::V2_0,
                &fields(&[("mode", "greet"), ("count", "7"), ("target", "https://a.example/x"), ("ext", "y")]),
            )
            .unwrap();
        assert_eq!(greeting.count, 7);
        assert_eq!(greeting.target.as_ref().unwrap().url().as_str(), "https://a.example/x");
        assert_eq!(greeting.base.extra_data.get("ext").map(String::as_str), Some("y"));
    }

    #[test]
    fn format_errors_name_the_part() {
        let descriptions = MessageDescriptions::new();
        let err = descriptions
            .deserialize::<Greeting>(
                ProtocolVersion::V2_0,
                &fields(&[("mode", "greet"), ("count", "many"), ("target", "https://a.example/")]),
            )
            .err()
            .unwrap();
        match err {
            ProtocolError::Format { part, .. } => assert_eq!(part, "count"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn serialize_requires_required_parts() {
        let descriptions = MessageDescriptions::new();
        let greeting = Greeting::new_for_version(ProtocolVersion::V2_0);
        let err = descriptions.serialize(&greeting).err().unwrap();
        assert!(matches!(err, ProtocolError::MissingParts { ref parts, .. } if parts == &vec!["target".to_string()]));
    }

    #[test]
    fn cache_returns_one_instance_under_contention() {
        let descriptions = Arc::new(MessageDescriptions::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let descriptions = descriptions.clone();
                std::thread::spawn(move || descriptions.get::<Greeting>(ProtocolVersion::V2_0).unwrap())
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(descriptions.len(), 1);
    }
}
