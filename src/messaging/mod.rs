//! Protocol independent messaging: message descriptions, encoders, the
//! channel pipeline, data bags and the stores they depend on.

pub mod binding;
pub mod channel;
pub mod clock;
pub mod databag;
pub mod description;
pub mod dictionary;
pub mod encoding;
pub mod error;
pub mod http;
pub mod kvf;
pub mod message;
pub mod part;
pub mod random;
pub mod replay;
pub mod stores;

pub use binding::{ChannelBindingElement, ChannelContext, Protections};
pub use channel::{Channel, ChannelBuilder, DirectEncoding, MessageFactory};
pub use clock::{Clock, FixedClock, SystemClock};
pub use databag::{DATA_BAG_VERSION, DataBag, DataBagBase, DataBagFormatter, FormatterKeys};
pub use description::{MessageDescription, MessageDescriptions, ValidationMode};
pub use dictionary::MessageDictionary;
pub use encoding::{
    Base64Encoder, BooleanEncoder, DateTimeEncoder, IntegerEncoder, Locale, LocaleEncoder, LocaleListEncoder,
    MessageUri, ParseEncoder, ScopeEncoder, StringEncoder, TimeSpanEncoder, TypeName, TypeNameEncoder,
    UnixTimestampEncoder, UriEncoder, ValueEncoder, WireValue,
};
pub use error::{DataBagError, EncodingError, ErrorKind, KvfError, ProtocolError};
pub use http::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, HttpTransportError, InMemoryHttpTransport};
pub use kvf::{KeyValueFormConformanceLevel, KeyValueFormEncoding};
pub use message::{DescribedMessage, Message, MessageBase, MessageRouting, MessageTransport, ProtocolMessage, ProtocolVersion};
pub use part::{MessagePart, PartAccessor};
pub use random::{RandomSource, SystemRandomSource};
pub use replay::{ReplayAccessor, ReplayProtected, StandardReplayProtectionBindingElement, check_nonce};
pub use stores::{
    CryptoKey, CryptoKeyStore, InMemoryCryptoKeyStore, InMemoryNonceStore, KeyCollision, NonceStore, current_key,
};
