//! The binding element contract and the context elements run in.

use bitflags::bitflags;

use super::clock::Clock;
use super::description::MessageDescriptions;
use super::error::ProtocolError;
use super::http::HttpRequest;
use super::random::RandomSource;
use crate::config::MessagingSettings;

bitflags! {
    /// Kinds of protection a binding element can give a message.
    ///
    /// Higher bits depend on lower ones: replay protection is meaningless
    /// without expiration, and neither holds without tamper protection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
    pub struct Protections: u8 {
        const TAMPER_PROTECTION = 1;
        const EXPIRATION = 2;
        const REPLAY_PROTECTION = 4;
    }
}

impl Protections {
    pub const NONE: Protections = Protections::empty();
}

impl std::fmt::Display for Protections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        f.write_str(&names.join("|"))
    }
}

/// Everything an element may consult while processing a message.
pub struct ChannelContext<'a> {
    pub settings: &'a MessagingSettings,
    pub clock: &'a dyn Clock,
    pub random: &'a dyn RandomSource,
    pub descriptions: &'a MessageDescriptions,
    /// The HTTP request an incoming message arrived on, when there is one.
    pub request: Option<&'a HttpRequest>,
}

/// One transform in a channel's pipeline.
///
/// Outgoing messages visit elements in list order; incoming messages visit
/// them in reverse. Returning `Ok(None)` means the element does not apply to
/// the message. `Ok(Some(p))` reports the protection it applied or verified,
/// which is empty for pure transforms.
pub trait ChannelBindingElement<P>: Send + Sync {
    fn name(&self) -> &'static str;

    fn protection(&self) -> Protections;

    /// Elements that must process an incoming message before this one,
    /// which places them later in the list.
    fn requires(&self) -> &'static [&'static str] {
        &[]
    }

    fn process_outgoing(&self, message: &mut P, context: &ChannelContext<'_>)
        -> Result<Option<Protections>, ProtocolError>;

    fn process_incoming(&self, message: &mut P, context: &ChannelContext<'_>)
        -> Result<Option<Protections>, ProtocolError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protections_display() {
        assert_eq!(Protections::NONE.to_string(), "none");
        assert_eq!(
            (Protections::TAMPER_PROTECTION | Protections::REPLAY_PROTECTION).to_string(),
            "TAMPER_PROTECTION|REPLAY_PROTECTION"
        );
    }

    #[test]
    fn protections_order_by_bits() {
        let mut kinds = vec![Protections::TAMPER_PROTECTION, Protections::REPLAY_PROTECTION, Protections::EXPIRATION];
        kinds.sort_by(|a, b| b.cmp(a));
        assert_eq!(
            kinds,
            vec![Protections::REPLAY_PROTECTION, Protections::EXPIRATION, Protections::TAMPER_PROTECTION]
        );
    }
}
