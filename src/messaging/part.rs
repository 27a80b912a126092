//! Declarative message part tables.
//!
//! A message type lists its parts once, each binding a wire name to a field
//! through plain accessor functions. No runtime type inspection is involved.

use std::sync::Arc;

use super::binding::Protections;
use super::encoding::{ValueEncoder, WireValue};
use super::error::EncodingError;
use super::message::ProtocolVersion;

/// Reads and writes one part of a message as its wire string.
pub trait PartAccessor<M>: Send + Sync {
    fn get(&self, message: &M) -> Result<Option<String>, EncodingError>;

    fn get_original(&self, message: &M) -> Result<Option<String>, EncodingError>;

    /// `None` resets the part to absent, or to its default for non-nullable parts.
    fn set(&self, message: &mut M, value: Option<&str>) -> Result<(), EncodingError>;

    fn is_nullable(&self) -> bool;

    fn is_default(&self, message: &M) -> bool;
}

struct ValueAccessor<M, T, E> {
    get: fn(&M) -> &T,
    get_mut: fn(&mut M) -> &mut T,
    encoder: E,
}

impl<M, T, E> PartAccessor<M> for ValueAccessor<M, T, E>
where
    T: Default + PartialEq + Send + Sync,
    E: ValueEncoder<T>,
{
    fn get(&self, message: &M) -> Result<Option<String>, EncodingError> {
        self.encoder.encode((self.get)(message)).map(Some)
    }

    fn get_original(&self, message: &M) -> Result<Option<String>, EncodingError> {
        self.encoder.encode_original((self.get)(message)).map(Some)
    }

    fn set(&self, message: &mut M, value: Option<&str>) -> Result<(), EncodingError> {
        *(self.get_mut)(message) = match value {
            Some(value) => self.encoder.decode(value)?,
            None => T::default(),
        };
        Ok(())
    }

    fn is_nullable(&self) -> bool {
        false
    }

    fn is_default(&self, message: &M) -> bool {
        *(self.get)(message) == T::default()
    }
}

struct OptionalAccessor<M, T, E> {
    get: fn(&M) -> &Option<T>,
    get_mut: fn(&mut M) -> &mut Option<T>,
    encoder: E,
}

impl<M, T, E> PartAccessor<M> for OptionalAccessor<M, T, E>
where
    T: Send + Sync,
    E: ValueEncoder<T>,
{
    fn get(&self, message: &M) -> Result<Option<String>, EncodingError> {
        match (self.get)(message) {
            Some(value) => self.encoder.encode(value).map(Some),
            None => Ok(self.encoder.null_encoding().map(str::to_string)),
        }
    }

    fn get_original(&self, message: &M) -> Result<Option<String>, EncodingError> {
        match (self.get)(message) {
            Some(value) => self.encoder.encode_original(value).map(Some),
            None => Ok(self.encoder.null_encoding().map(str::to_string)),
        }
    }

    fn set(&self, message: &mut M, value: Option<&str>) -> Result<(), EncodingError> {
        *(self.get_mut)(message) = match value {
            Some(value) if Some(value) == self.encoder.null_encoding() => None,
            Some(value) => Some(self.encoder.decode(value)?),
            None => None,
        };
        Ok(())
    }

    fn is_nullable(&self) -> bool {
        true
    }

    fn is_default(&self, message: &M) -> bool {
        (self.get)(message).is_none()
    }
}

/// A part with a fixed value and no backing field.
struct ConstantAccessor {
    value: &'static str,
}

impl<M> PartAccessor<M> for ConstantAccessor {
    fn get(&self, _message: &M) -> Result<Option<String>, EncodingError> {
        Ok(Some(self.value.to_string()))
    }

    fn get_original(&self, message: &M) -> Result<Option<String>, EncodingError> {
        self.get(message)
    }

    fn set(&self, _message: &mut M, value: Option<&str>) -> Result<(), EncodingError> {
        match value {
            Some(value) if value != self.value => {
                Err(EncodingError::invalid(value, format!("constant part must be {:?}", self.value)))
            }
            _ => Ok(()),
        }
    }

    fn is_nullable(&self) -> bool {
        false
    }

    fn is_default(&self, _message: &M) -> bool {
        false
    }
}

/// Exposes a base message's part through the derived message that embeds it.
struct ProjectedAccessor<M, B> {
    inner: Arc<dyn PartAccessor<B>>,
    get: fn(&M) -> &B,
    get_mut: fn(&mut M) -> &mut B,
}

impl<M, B> PartAccessor<M> for ProjectedAccessor<M, B> {
    fn get(&self, message: &M) -> Result<Option<String>, EncodingError> {
        self.inner.get((self.get)(message))
    }

    fn get_original(&self, message: &M) -> Result<Option<String>, EncodingError> {
        self.inner.get_original((self.get)(message))
    }

    fn set(&self, message: &mut M, value: Option<&str>) -> Result<(), EncodingError> {
        self.inner.set((self.get_mut)(message), value)
    }

    fn is_nullable(&self) -> bool {
        self.inner.is_nullable()
    }

    fn is_default(&self, message: &M) -> bool {
        self.inner.is_default((self.get)(message))
    }
}

/// One declared part: wire name, policy and accessor.
pub struct MessagePart<M> {
    name: &'static str,
    required: bool,
    allow_empty: bool,
    protection: Protections,
    security_sensitive: bool,
    constant: Option<&'static str>,
    min_version: ProtocolVersion,
    max_version: ProtocolVersion,
    depth: u8,
    accessor: Arc<dyn PartAccessor<M>>,
}

impl<M> Clone for MessagePart<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            required: self.required,
            allow_empty: self.allow_empty,
            protection: self.protection,
            security_sensitive: self.security_sensitive,
            constant: self.constant,
            min_version: self.min_version,
            max_version: self.max_version,
            depth: self.depth,
            accessor: self.accessor.clone(),
        }
    }
}

impl<M> std::fmt::Debug for MessagePart<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePart")
            .field("name", &self.name)
            .field("required", &self.required)
            .field("allow_empty", &self.allow_empty)
            .field("protection", &self.protection)
            .field("constant", &self.constant)
            .field("versions", &(self.min_version, self.max_version))
            .finish()
    }
}

impl<M: 'static> MessagePart<M> {
    fn with_accessor(name: &'static str, accessor: Arc<dyn PartAccessor<M>>) -> Self {
        Self {
            name,
            required: false,
            allow_empty: true,
            protection: Protections::empty(),
            security_sensitive: false,
            constant: None,
            min_version: ProtocolVersion::MIN,
            max_version: ProtocolVersion::MAX,
            depth: 0,
            accessor,
        }
    }

    /// A non-nullable field. Such parts must also be marked [`required`](Self::required).
    pub fn value<T>(name: &'static str, get: fn(&M) -> &T, get_mut: fn(&mut M) -> &mut T) -> Self
    where
        T: WireValue + Default + PartialEq,
    {
        Self::value_with(name, get, get_mut, T::Encoder::default())
    }

    pub fn value_with<T, E>(name: &'static str, get: fn(&M) -> &T, get_mut: fn(&mut M) -> &mut T, encoder: E) -> Self
    where
        T: Default + PartialEq + Send + Sync + 'static,
        E: ValueEncoder<T>,
    {
        Self::with_accessor(name, Arc::new(ValueAccessor { get, get_mut, encoder }))
    }

    /// An `Option` field using `T`'s default encoder.
    pub fn optional<T>(name: &'static str, get: fn(&M) -> &Option<T>, get_mut: fn(&mut M) -> &mut Option<T>) -> Self
    where
        T: WireValue,
    {
        Self::optional_with(name, get, get_mut, T::Encoder::default())
    }

    pub fn optional_with<T, E>(
        name: &'static str,
        get: fn(&M) -> &Option<T>,
        get_mut: fn(&mut M) -> &mut Option<T>,
        encoder: E,
    ) -> Self
    where
        T: Send + Sync + 'static,
        E: ValueEncoder<T>,
    {
        Self::with_accessor(name, Arc::new(OptionalAccessor { get, get_mut, encoder }))
    }

    /// A required part that always carries `value`.
    pub fn constant(name: &'static str, value: &'static str) -> Self {
        let mut part = Self::with_accessor(name, Arc::new(ConstantAccessor { value }));
        part.required = true;
        part.allow_empty = false;
        part.constant = Some(value);
        part
    }

    /// Lifts a base message's parts onto a message that embeds the base.
    pub fn inherit<B: 'static>(
        parts: Vec<MessagePart<B>>,
        get: fn(&M) -> &B,
        get_mut: fn(&mut M) -> &mut B,
    ) -> Vec<MessagePart<M>> {
        parts
            .into_iter()
            .map(|part| MessagePart {
                name: part.name,
                required: part.required,
                allow_empty: part.allow_empty,
                protection: part.protection,
                security_sensitive: part.security_sensitive,
                constant: part.constant,
                min_version: part.min_version,
                max_version: part.max_version,
                depth: part.depth.saturating_add(1),
                accessor: Arc::new(ProjectedAccessor { inner: part.accessor, get, get_mut }),
            })
            .collect()
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Present values must not be empty strings.
    pub fn non_empty(mut self) -> Self {
        self.allow_empty = false;
        self
    }

    pub fn protection(mut self, protection: Protections) -> Self {
        self.protection = protection;
        self
    }

    /// Marks values that must never be logged.
    pub fn security_sensitive(mut self) -> Self {
        self.security_sensitive = true;
        self
    }

    pub fn min_version(mut self, version: ProtocolVersion) -> Self {
        self.min_version = version;
        self
    }

    pub fn max_version(mut self, version: ProtocolVersion) -> Self {
        self.max_version = version;
        self
    }
}

impl<M> MessagePart<M> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn allows_empty(&self) -> bool {
        self.allow_empty
    }

    pub fn required_protection(&self) -> Protections {
        self.protection
    }

    pub fn is_security_sensitive(&self) -> bool {
        self.security_sensitive
    }

    pub fn constant_value(&self) -> Option<&'static str> {
        self.constant
    }

    pub fn is_nullable(&self) -> bool {
        self.accessor.is_nullable()
    }

    pub fn min_version_bound(&self) -> ProtocolVersion {
        self.min_version
    }

    /// How many `inherit` steps separate this declaration from the message type.
    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn applies_to(&self, version: ProtocolVersion) -> bool {
        self.min_version <= version && version <= self.max_version
    }

    pub fn get_value(&self, message: &M) -> Result<Option<String>, EncodingError> {
        self.accessor.get(message)
    }

    pub fn get_original_value(&self, message: &M) -> Result<Option<String>, EncodingError> {
        self.accessor.get_original(message)
    }

    pub fn set_value(&self, message: &mut M, value: Option<&str>) -> Result<(), EncodingError> {
        self.accessor.set(message, value)
    }

    pub fn holds_default(&self, message: &M) -> bool {
        self.accessor.is_default(message)
    }
}
