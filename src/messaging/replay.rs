//! Nonce and timestamp based expiration and replay protection.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use super::binding::{ChannelBindingElement, ChannelContext, Protections};
use super::error::ProtocolError;
use super::stores::NonceStore;

const DEFAULT_NONCE_LENGTH: usize = 8;

/// Refuses a nonce that is too old, dated in the future or already seen in
/// `nonce_context`, and records it otherwise.
pub fn check_nonce(
    element: &str,
    store: &dyn NonceStore,
    context: &ChannelContext<'_>,
    nonce_context: &str,
    nonce: &str,
    timestamp: DateTime<Utc>,
) -> Result<(), ProtocolError> {
    let now = context.clock.now();
    if timestamp + context.settings.maximum_message_lifetime() < now {
        warn!(element, %timestamp, "message is too old");
        return Err(ProtocolError::Expired(format!("message issued at {} is too old", timestamp)));
    }
    if timestamp - context.settings.maximum_clock_skew() > now {
        warn!(element, %timestamp, "message is dated in the future");
        return Err(ProtocolError::Expired(format!("message issued at {} is dated in the future", timestamp)));
    }
    if !store.store_nonce(nonce_context, nonce, timestamp) {
        error!(element, context = %nonce_context, "replayed nonce");
        return Err(ProtocolError::Replayed(format!("nonce already used in {}", nonce_context)));
    }
    Ok(())
}

/// A message carrying a (nonce, timestamp) pair.
pub trait ReplayProtected {
    /// Scope the nonce must be unique in, usually the issuing endpoint.
    fn nonce_context(&self) -> String;

    fn nonce(&self) -> Option<&str>;

    fn timestamp(&self) -> Option<DateTime<Utc>>;

    /// Records a freshly generated nonce and its issue time.
    fn stamp(&mut self, timestamp: DateTime<Utc>, random: String);
}

/// Projects the replay protected view out of a protocol message, when the
/// message has one.
pub type ReplayAccessor<P> = fn(&mut P) -> Option<&mut dyn ReplayProtected>;

/// Stamps outgoing messages with nonces and refuses stale or repeated ones
/// on the way in.
pub struct StandardReplayProtectionBindingElement<P> {
    name: &'static str,
    store: Arc<dyn NonceStore>,
    accessor: ReplayAccessor<P>,
    issue: bool,
    verify: bool,
    nonce_length: usize,
}

impl<P> StandardReplayProtectionBindingElement<P> {
    pub fn new(store: Arc<dyn NonceStore>, accessor: ReplayAccessor<P>) -> Self {
        Self {
            name: "StandardReplayProtection",
            store,
            accessor,
            issue: true,
            verify: true,
            nonce_length: DEFAULT_NONCE_LENGTH,
        }
    }

    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Whether outgoing messages get stamped.
    pub fn issuing(mut self, issue: bool) -> Self {
        self.issue = issue;
        self
    }

    /// Whether incoming messages get checked.
    pub fn verifying(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn nonce_length(mut self, length: usize) -> Self {
        self.nonce_length = length;
        self
    }
}

impl<P: Send + Sync> ChannelBindingElement<P> for StandardReplayProtectionBindingElement<P> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn protection(&self) -> Protections {
        Protections::EXPIRATION | Protections::REPLAY_PROTECTION
    }

    fn process_outgoing(&self, message: &mut P, context: &ChannelContext<'_>) -> Result<Option<Protections>, ProtocolError> {
        if !self.issue {
            return Ok(None);
        }
        let Some(protected) = (self.accessor)(message) else {
            return Ok(None);
        };
        if protected.nonce().is_none() {
            let random = context.random.alphanumeric(self.nonce_length)?;
            protected.stamp(context.clock.now(), random);
        }
        Ok(Some(self.protection()))
    }

    fn process_incoming(&self, message: &mut P, context: &ChannelContext<'_>) -> Result<Option<Protections>, ProtocolError> {
        if !self.verify {
            return Ok(None);
        }
        let Some(protected) = (self.accessor)(message) else {
            return Ok(None);
        };
        let nonce = protected
            .nonce()
            .filter(|nonce| !nonce.is_empty())
            .ok_or_else(|| ProtocolError::violation("message is missing its nonce"))?;
        let timestamp = protected
            .timestamp()
            .ok_or_else(|| ProtocolError::violation("message nonce carries no timestamp"))?;

        let nonce_context = protected.nonce_context();
        check_nonce(self.name, self.store.as_ref(), context, &nonce_context, nonce, timestamp)?;
        debug!(element = self.name, "nonce accepted");
        Ok(Some(self.protection()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MessagingSettings;
    use crate::messaging::clock::{Clock, FixedClock};
    use crate::messaging::description::MessageDescriptions;
    use crate::messaging::random::SystemRandomSource;
    use crate::messaging::stores::InMemoryNonceStore;
    use chrono::{TimeDelta, TimeZone};

    #[derive(Default)]
    struct Stamped {
        nonce: Option<String>,
        timestamp: Option<DateTime<Utc>>,
    }

    impl ReplayProtected for Stamped {
        fn nonce_context(&self) -> String {
            "https://op.example/".to_string()
        }

        fn nonce(&self) -> Option<&str> {
            self.nonce.as_deref()
        }

        fn timestamp(&self) -> Option<DateTime<Utc>> {
            self.timestamp
        }

        fn stamp(&mut self, timestamp: DateTime<Utc>, random: String) {
            self.timestamp = Some(timestamp);
            self.nonce = Some(random);
        }
    }

    fn stamped(message: &mut Stamped) -> Option<&mut dyn ReplayProtected> {
        Some(message)
    }

    struct Fixture {
        settings: MessagingSettings,
        clock: Arc<FixedClock>,
        random: SystemRandomSource,
        descriptions: MessageDescriptions,
        element: StandardReplayProtectionBindingElement<Stamped>,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()));
            let store = Arc::new(InMemoryNonceStore::new(TimeDelta::hours(1), clock.clone()));
            Self {
                settings: MessagingSettings::default()
                    .with_maximum_message_lifetime(300)
                    .with_maximum_clock_skew(60),
                clock,
                random: SystemRandomSource::new(),
                descriptions: MessageDescriptions::new(),
                element: StandardReplayProtectionBindingElement::new(store, stamped),
            }
        }

        fn context(&self) -> ChannelContext<'_> {
            ChannelContext {
                settings: &self.settings,
                clock: self.clock.as_ref(),
                random: &self.random,
                descriptions: &self.descriptions,
                request: None,
            }
        }

        fn issued_at(&self, offset: TimeDelta) -> Stamped {
            Stamped { nonce: Some("n0nce".to_string()), timestamp: Some(self.clock.now() + offset) }
        }
    }

    #[test]
    fn stamped_message_is_accepted_once() {
        let fixture = Fixture::new();
        let mut message = Stamped::default();
        let applied = fixture.element.process_outgoing(&mut message, &fixture.context()).unwrap();
        assert_eq!(applied, Some(Protections::EXPIRATION | Protections::REPLAY_PROTECTION));
        assert_eq!(message.nonce.as_ref().map(String::len), Some(DEFAULT_NONCE_LENGTH));

        assert!(fixture.element.process_incoming(&mut message, &fixture.context()).is_ok());
        let err = fixture.element.process_incoming(&mut message, &fixture.context()).unwrap_err();
        assert!(matches!(err, ProtocolError::Replayed(_)), "got {err:?}");
    }

    #[test]
    fn messages_older_than_the_lifetime_expire() {
        let fixture = Fixture::new();
        let mut at_limit = fixture.issued_at(TimeDelta::seconds(-300));
        assert!(fixture.element.process_incoming(&mut at_limit, &fixture.context()).is_ok());

        let mut too_old = fixture.issued_at(TimeDelta::seconds(-301));
        let err = fixture.element.process_incoming(&mut too_old, &fixture.context()).unwrap_err();
        assert!(matches!(err, ProtocolError::Expired(_)), "got {err:?}");
    }

    #[test]
    fn future_timestamps_beyond_the_skew_are_refused() {
        let fixture = Fixture::new();
        let mut within_skew = fixture.issued_at(TimeDelta::seconds(60));
        assert!(fixture.element.process_incoming(&mut within_skew, &fixture.context()).is_ok());

        let mut ahead = fixture.issued_at(TimeDelta::seconds(61));
        ahead.nonce = Some("other".to_string());
        let err = fixture.element.process_incoming(&mut ahead, &fixture.context()).unwrap_err();
        assert!(matches!(err, ProtocolError::Expired(_)), "got {err:?}");
    }

    #[test]
    fn missing_nonce_is_a_violation() {
        let fixture = Fixture::new();
        let mut message = Stamped { nonce: None, timestamp: Some(fixture.clock.now()) };
        let err = fixture.element.process_incoming(&mut message, &fixture.context()).unwrap_err();
        assert!(matches!(err, ProtocolError::Violation(_)), "got {err:?}");
    }
}
