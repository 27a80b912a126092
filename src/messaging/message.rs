//! Message traits shared by every protocol.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use super::binding::Protections;
use super::description::MessageDescriptions;
use super::error::ProtocolError;
use super::part::MessagePart;

/// A protocol version, ordered by major then minor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    pub const MIN: ProtocolVersion = ProtocolVersion::new(0, 0);
    pub const MAX: ProtocolVersion = ProtocolVersion::new(u8::MAX, u8::MAX);

    pub const V1_0: ProtocolVersion = ProtocolVersion::new(1, 0);
    pub const V1_1: ProtocolVersion = ProtocolVersion::new(1, 1);
    pub const V2_0: ProtocolVersion = ProtocolVersion::new(2, 0);
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// How a message crosses the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTransport {
    /// Server-to-server request carried in a POST body.
    DirectRequest,
    /// Body of the HTTP response to a direct request.
    DirectResponse,
    /// Relayed through the user agent by redirect or auto-posting form.
    Indirect,
}

/// State every concrete message carries besides its declared parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageBase {
    pub version: ProtocolVersion,
    /// Fields that no declared part maps, kept for extensions and forward compatibility.
    pub extra_data: BTreeMap<String, String>,
}

impl MessageBase {
    pub fn new(version: ProtocolVersion) -> Self {
        Self { version, extra_data: BTreeMap::new() }
    }
}

pub trait Message: Send + Sync + 'static {
    fn version(&self) -> ProtocolVersion;

    fn extra_data(&self) -> &BTreeMap<String, String>;

    fn extra_data_mut(&mut self) -> &mut BTreeMap<String, String>;

    /// Cross-part checks that the part table cannot express.
    fn ensure_valid(&self) -> Result<(), ProtocolError> {
        Ok(())
    }
}

/// A message whose parts are listed in a static table.
pub trait DescribedMessage: Message + Sized {
    /// Every part declaration, most derived first. Parts inherited through
    /// [`MessagePart::inherit`] follow the type's own.
    fn declare_parts() -> Vec<MessagePart<Self>>;

    /// An empty instance ready to receive wire values.
    fn new_for_version(version: ProtocolVersion) -> Self;
}

/// Routing for one concrete message type.
pub trait MessageRouting: DescribedMessage {
    const KIND: &'static str;

    fn required_protection(&self) -> Protections {
        Protections::empty()
    }

    fn transport(&self) -> MessageTransport;

    fn recipient(&self) -> Option<&Url> {
        None
    }

    fn http_status(&self) -> u16 {
        200
    }
}

/// The set of messages one protocol can send or receive, as a tagged union.
pub trait ProtocolMessage: Message {
    fn kind(&self) -> &'static str;

    fn required_protection(&self) -> Protections;

    fn transport(&self) -> MessageTransport;

    fn recipient(&self) -> Option<&Url>;

    fn http_status(&self) -> u16;

    fn serialize(&self, descriptions: &MessageDescriptions) -> Result<BTreeMap<String, String>, ProtocolError>;
}

/// Implements [`Message`] for a struct with a `base: MessageBase` field.
macro_rules! impl_message {
    ($ty:ty) => {
        impl $crate::messaging::Message for $ty {
            fn version(&self) -> $crate::messaging::ProtocolVersion {
                self.base.version
            }

            fn extra_data(&self) -> &::std::collections::BTreeMap<String, String> {
                &self.base.extra_data
            }

            fn extra_data_mut(&mut self) -> &mut ::std::collections::BTreeMap<String, String> {
                &mut self.base.extra_data
            }
        }
    };
    ($ty:ty, ensure_valid = $check:ident) => {
        impl $crate::messaging::Message for $ty {
            fn version(&self) -> $crate::messaging::ProtocolVersion {
                self.base.version
            }

            fn extra_data(&self) -> &::std::collections::BTreeMap<String, String> {
                &self.base.extra_data
            }

            fn extra_data_mut(&mut self) -> &mut ::std::collections::BTreeMap<String, String> {
                &mut self.base.extra_data
            }

            fn ensure_valid(&self) -> Result<(), $crate::messaging::ProtocolError> {
                self.$check()
            }
        }
    };
}

/// Declares a protocol's message union and dispatches [`ProtocolMessage`]
/// to each variant.
macro_rules! protocol_message_union {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident($ty:ty)),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        pub enum $name {
            $($variant($ty)),+
        }

        impl $crate::messaging::Message for $name {
            fn version(&self) -> $crate::messaging::ProtocolVersion {
                match self { $($name::$variant(m) => $crate::messaging::Message::version(m)),+ }
            }

            fn extra_data(&self) -> &::std::collections::BTreeMap<String, String> {
                match self { $($name::$variant(m) => $crate::messaging::Message::extra_data(m)),+ }
            }

            fn extra_data_mut(&mut self) -> &mut ::std::collections::BTreeMap<String, String> {
                match self { $($name::$variant(m) => $crate::messaging::Message::extra_data_mut(m)),+ }
            }

            fn ensure_valid(&self) -> Result<(), $crate::messaging::ProtocolError> {
                match self { $($name::$variant(m) => $crate::messaging::Message::ensure_valid(m)),+ }
            }
        }

        impl $crate::messaging::ProtocolMessage for $name {
            fn kind(&self) -> &'static str {
                match self { $($name::$variant(_) => <$ty as $crate::messaging::MessageRouting>::KIND),+ }
            }

            fn required_protection(&self) -> $crate::messaging::Protections {
                match self { $($name::$variant(m) => $crate::messaging::MessageRouting::required_protection(m)),+ }
            }

            fn transport(&self) -> $crate::messaging::MessageTransport {
                match self { $($name::$variant(m) => $crate::messaging::MessageRouting::transport(m)),+ }
            }

            fn recipient(&self) -> Option<&::url::Url> {
                match self { $($name::$variant(m) => $crate::messaging::MessageRouting::recipient(m)),+ }
            }

            fn http_status(&self) -> u16 {
                match self { $($name::$variant(m) => $crate::messaging::MessageRouting::http_status(m)),+ }
            }

            fn serialize(
                &self,
                descriptions: &$crate::messaging::MessageDescriptions,
            ) -> Result<::std::collections::BTreeMap<String, String>, $crate::messaging::ProtocolError> {
                match self { $($name::$variant(m) => descriptions.serialize(m)),+ }
            }
        }

        $(
            impl From<$ty> for $name {
                fn from(message: $ty) -> Self {
                    $name::$variant(message)
                }
            }
        )+
    };
}

pub(crate) use impl_message;
pub(crate) use protocol_message_union;
