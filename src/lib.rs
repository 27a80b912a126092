pub mod config;
pub mod messaging;
pub mod oauth2;
pub mod openid;

pub use config::MessagingSettings;
pub use messaging::{Channel, ChannelBindingElement, Protections, ProtocolError, ProtocolVersion};
