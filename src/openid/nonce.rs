//! `openid.response_nonce`: a UTC timestamp followed by a unique suffix.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, warn};

use super::messages::{CheckAuthenticationRequest, OpenIdMessage, PositiveAssertion, return_to_argument};
use super::return_to::ReturnToSignatureBindingElement;
use crate::messaging::{
    ChannelBindingElement, ChannelContext, Message, MessageUri, NonceStore, ProtocolError, ProtocolVersion,
    Protections, ReplayProtected, StandardReplayProtectionBindingElement, check_nonce,
};

pub const RESPONSE_NONCE_ELEMENT: &str = "ResponseNonce";
pub const RETURN_TO_NONCE_ELEMENT: &str = "ReturnToNonce";

/// return_to argument holding the relying party's request nonce.
pub const RETURN_TO_NONCE_KEY: &str = "dnoa.request_nonce";
/// Every request nonce is unique within this one context.
pub const RETURN_TO_NONCE_CONTEXT: &str = "https://localhost/dnoa/return_to_nonce";
const RETURN_TO_NONCE_LENGTH: usize = 16;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub fn format_response_nonce(timestamp: DateTime<Utc>, unique: &str) -> String {
    format!("{}{}", timestamp.format(TIMESTAMP_FORMAT), unique)
}

/// The timestamp prefix of a response nonce, which ends at the first `Z`.
pub fn parse_response_nonce(nonce: &str) -> Option<DateTime<Utc>> {
    let end = nonce.find('Z')?;
    NaiveDateTime::parse_from_str(&nonce[..=end], TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

impl ReplayProtected for PositiveAssertion {
    fn nonce_context(&self) -> String {
        self.op_endpoint.as_ref().map(|endpoint| endpoint.original().to_string()).unwrap_or_default()
    }

    fn nonce(&self) -> Option<&str> {
        self.response_nonce.as_deref()
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.response_nonce.as_deref().and_then(parse_response_nonce)
    }

    fn stamp(&mut self, timestamp: DateTime<Utc>, random: String) {
        self.response_nonce = Some(format_response_nonce(timestamp, &random));
    }
}

/// A provider checks the nonce of an assertion it is asked to verify, in a
/// context of its own so a relying party sharing the store is unaffected.
impl ReplayProtected for CheckAuthenticationRequest {
    fn nonce_context(&self) -> String {
        let endpoint = self.op_endpoint.as_ref().map(|endpoint| endpoint.original()).unwrap_or_default();
        format!("check_authentication {}", endpoint)
    }

    fn nonce(&self) -> Option<&str> {
        self.response_nonce.as_deref()
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.response_nonce.as_deref().and_then(parse_response_nonce)
    }

    fn stamp(&mut self, timestamp: DateTime<Utc>, random: String) {
        self.response_nonce = Some(format_response_nonce(timestamp, &random));
    }
}

/// 1.x defines no response nonce, so relying parties only trust it on 2.0.
fn signed_response_nonce(message: &mut OpenIdMessage) -> Option<&mut dyn ReplayProtected> {
    match message {
        OpenIdMessage::PositiveAssertion(assertion) if assertion.base.version >= ProtocolVersion::V2_0 => {
            Some(assertion)
        }
        OpenIdMessage::CheckAuthenticationRequest(request) if request.base.version >= ProtocolVersion::V2_0 => {
            Some(request)
        }
        _ => None,
    }
}

/// Providers stamp every assertion, including 1.x ones where the nonce is
/// an unsigned extra.
fn issued_response_nonce(message: &mut OpenIdMessage) -> Option<&mut dyn ReplayProtected> {
    match message {
        OpenIdMessage::PositiveAssertion(assertion) => Some(assertion),
        other => signed_response_nonce(other),
    }
}

/// Checks assertion nonces on arrival; issues none.
pub fn relying_party_response_nonce(
    store: Arc<dyn NonceStore>,
) -> StandardReplayProtectionBindingElement<OpenIdMessage> {
    StandardReplayProtectionBindingElement::new(store, signed_response_nonce)
        .named(RESPONSE_NONCE_ELEMENT)
        .issuing(false)
}

/// Stamps outgoing assertions and checks nonces on check_authentication.
pub fn provider_response_nonce(store: Arc<dyn NonceStore>) -> StandardReplayProtectionBindingElement<OpenIdMessage> {
    StandardReplayProtectionBindingElement::new(store, issued_response_nonce)
        .named(RESPONSE_NONCE_ELEMENT)
        .nonce_length(6)
}

/// Replay protection for 1.x assertions, whose providers send no usable
/// nonce. The relying party puts its own nonce in the signed return_to of
/// each request and redeems it once when the assertion comes back.
///
/// Protection elements run after transforms on the way out and before them
/// on the way in, so this element signs and verifies return_to itself.
pub struct ReturnToNonceBindingElement {
    store: Arc<dyn NonceStore>,
    return_to: Arc<ReturnToSignatureBindingElement>,
}

impl ReturnToNonceBindingElement {
    pub fn new(store: Arc<dyn NonceStore>, return_to: Arc<ReturnToSignatureBindingElement>) -> Self {
        Self { store, return_to }
    }
}

impl ChannelBindingElement<OpenIdMessage> for ReturnToNonceBindingElement {
    fn name(&self) -> &'static str {
        RETURN_TO_NONCE_ELEMENT
    }

    fn protection(&self) -> Protections {
        Protections::EXPIRATION | Protections::REPLAY_PROTECTION
    }

    fn process_outgoing(
        &self,
        message: &mut OpenIdMessage,
        context: &ChannelContext<'_>,
    ) -> Result<Option<Protections>, ProtocolError> {
        let OpenIdMessage::CheckIdRequest(request) = message else {
            return Ok(None);
        };
        if request.version() >= ProtocolVersion::V2_0 {
            return Ok(None);
        }
        let Some(return_to) = &request.return_to else {
            return Ok(None);
        };
        if return_to_argument(return_to.url(), RETURN_TO_NONCE_KEY).is_some() {
            return Ok(Some(self.protection()));
        }
        let nonce = format_response_nonce(context.clock.now(), &context.random.alphanumeric(RETURN_TO_NONCE_LENGTH)?);
        let mut url = return_to.url().clone();
        url.query_pairs_mut().append_pair(RETURN_TO_NONCE_KEY, &nonce);
        request.return_to = Some(MessageUri::from(self.return_to.sign(&url, context)?));
        debug!("added request nonce to return_to");
        Ok(Some(self.protection()))
    }

    fn process_incoming(
        &self,
        message: &mut OpenIdMessage,
        context: &ChannelContext<'_>,
    ) -> Result<Option<Protections>, ProtocolError> {
        let OpenIdMessage::PositiveAssertion(assertion) = message else {
            return Ok(None);
        };
        if assertion.version() >= ProtocolVersion::V2_0 {
            return Ok(None);
        }
        let return_to = assertion
            .return_to
            .as_ref()
            .ok_or_else(|| ProtocolError::violation("assertion has no return_to"))?
            .url();
        let nonce = return_to_argument(return_to, RETURN_TO_NONCE_KEY)
            .ok_or_else(|| ProtocolError::violation("1.x assertion return_to carries no request nonce"))?;
        if !self.return_to.verify(return_to) {
            warn!("request nonce arrived in an unsigned return_to");
            return Err(ProtocolError::InvalidSignature(
                "return_to carrying the request nonce is not signed".to_string(),
            ));
        }
        assertion.return_to_signature_verified = true;
        let timestamp = parse_response_nonce(&nonce)
            .ok_or_else(|| ProtocolError::violation("request nonce carries no timestamp"))?;
        check_nonce(RETURN_TO_NONCE_ELEMENT, self.store.as_ref(), context, RETURN_TO_NONCE_CONTEXT, &nonce, timestamp)?;
        debug!("request nonce accepted");
        Ok(Some(self.protection()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::clock::Clock;
    use crate::config::MessagingSettings;
    use crate::messaging::{FixedClock, InMemoryCryptoKeyStore, InMemoryNonceStore, MessageDescriptions, SystemRandomSource};
    use crate::openid::messages::CheckIdRequest;
    use chrono::{TimeDelta, TimeZone};
    use url::Url;

    struct Fixture {
        settings: MessagingSettings,
        clock: Arc<FixedClock>,
        random: SystemRandomSource,
        descriptions: MessageDescriptions,
        return_to: Arc<ReturnToSignatureBindingElement>,
        element: ReturnToNonceBindingElement,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
            let return_to = Arc::new(ReturnToSignatureBindingElement::new(Arc::new(InMemoryCryptoKeyStore::new())));
            Self {
                settings: MessagingSettings::default(),
                random: SystemRandomSource::new(),
                descriptions: MessageDescriptions::new(),
                element: ReturnToNonceBindingElement::new(
                    Arc::new(InMemoryNonceStore::new(TimeDelta::hours(1), clock.clone())),
                    return_to.clone(),
                ),
                return_to,
                clock,
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

        /// Sends a checkid request and echoes its return_to back in an assertion.
        fn round_trip(&self, version: ProtocolVersion) -> (Option<Protections>, OpenIdMessage) {
            let mut request = CheckIdRequest::new(Url::parse("https://op.example/").unwrap(), version, false);
            request.return_to = Some(MessageUri::from(Url::parse("https://rp.example/cb?session=1").unwrap()));
            let mut message = OpenIdMessage::CheckIdRequest(request);
            let applied = self.element.process_outgoing(&mut message, &self.context()).unwrap();
            let OpenIdMessage::CheckIdRequest(request) = message else { unreachable!() };
            let assertion = PositiveAssertion::new(
                version,
                Url::parse("https://op.example/").unwrap(),
                request.return_to.unwrap(),
            );
            (applied, OpenIdMessage::PositiveAssertion(assertion))
        }
    }

    fn return_to_of(message: &OpenIdMessage) -> Url {
        let OpenIdMessage::PositiveAssertion(assertion) = message else { unreachable!() };
        assertion.return_to.as_ref().unwrap().url().clone()
    }

    #[test]
    fn v1_requests_carry_a_signed_request_nonce() {
        let fixture = Fixture::new();
        let (applied, mut assertion) = fixture.round_trip(ProtocolVersion::V1_1);
        assert_eq!(applied, Some(Protections::EXPIRATION | Protections::REPLAY_PROTECTION));
        let return_to = return_to_of(&assertion);
        let nonce = return_to_argument(&return_to, RETURN_TO_NONCE_KEY).unwrap();
        assert_eq!(parse_response_nonce(&nonce), Some(fixture.clock.now()));
        assert!(fixture.return_to.verify(&return_to));

        let applied = fixture.element.process_incoming(&mut assertion, &fixture.context()).unwrap();
        assert_eq!(applied, Some(Protections::EXPIRATION | Protections::REPLAY_PROTECTION));
        let err = fixture.element.process_incoming(&mut assertion, &fixture.context()).unwrap_err();
        assert!(matches!(err, ProtocolError::Replayed(_)), "got {err:?}");
    }

    #[test]
    fn v2_messages_are_left_alone() {
        let fixture = Fixture::new();
        let (applied, mut assertion) = fixture.round_trip(ProtocolVersion::V2_0);
        assert_eq!(applied, None);
        assert!(return_to_argument(&return_to_of(&assertion), RETURN_TO_NONCE_KEY).is_none());
        assert_eq!(fixture.element.process_incoming(&mut assertion, &fixture.context()).unwrap(), None);
    }

    #[test]
    fn nonce_in_an_unsigned_return_to_is_refused() {
        let fixture = Fixture::new();
        let mut forged = Url::parse("https://rp.example/cb").unwrap();
        let nonce = format_response_nonce(fixture.clock.now(), "abc");
        forged.query_pairs_mut().append_pair(RETURN_TO_NONCE_KEY, &nonce);
        let mut assertion = OpenIdMessage::PositiveAssertion(PositiveAssertion::new(
            ProtocolVersion::V1_1,
            Url::parse("https://op.example/").unwrap(),
            MessageUri::from(forged),
        ));
        let err = fixture.element.process_incoming(&mut assertion, &fixture.context()).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidSignature(_)), "got {err:?}");
    }

    #[test]
    fn v1_assertion_without_request_nonce_is_refused() {
        let fixture = Fixture::new();
        let mut assertion = OpenIdMessage::PositiveAssertion(PositiveAssertion::new(
            ProtocolVersion::V1_1,
            Url::parse("https://op.example/").unwrap(),
            MessageUri::from(Url::parse("https://rp.example/cb").unwrap()),
        ));
        let err = fixture.element.process_incoming(&mut assertion, &fixture.context()).unwrap_err();
        assert!(matches!(err, ProtocolError::Violation(_)), "got {err:?}");
    }

    #[test]
    fn stale_request_nonce_expires() {
        let fixture = Fixture::new();
        let (_, mut assertion) = fixture.round_trip(ProtocolVersion::V1_0);
        fixture.clock.advance(fixture.settings.maximum_message_lifetime() + TimeDelta::seconds(1));
        let err = fixture.element.process_incoming(&mut assertion, &fixture.context()).unwrap_err();
        assert!(matches!(err, ProtocolError::Expired(_)), "got {err:?}");
    }

    #[test]
    fn timestamp_ends_at_first_z() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 5).unwrap();
        let nonce = format_response_nonce(at, "Zq9x");
        assert_eq!(nonce, "2024-05-01T12:30:05ZZq9x");
        assert_eq!(parse_response_nonce(&nonce), Some(at));
    }

    #[test]
    fn garbage_has_no_timestamp() {
        assert_eq!(parse_response_nonce("not-a-nonce"), None);
        assert_eq!(parse_response_nonce("2024-13-01T00:00:00Zabc"), None);
    }
}
