//! Signs the relying party's own return_to arguments so values it tunnels
//! through the provider can be trusted when they come back.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ring::hmac;
use tracing::{debug, warn};
use url::Url;

use super::messages::{OpenIdMessage, return_to_argument};
use crate::messaging::{
    ChannelBindingElement, ChannelContext, CryptoKeyStore, KeyValueFormEncoding, MessageUri, ProtocolError,
    Protections, current_key,
};

pub const RETURN_TO_SIGNATURE_ELEMENT: &str = "ReturnToSignature";

/// Key store bucket for return_to signing keys.
pub const RETURN_TO_SECRET_BUCKET: &str = "https://localhost/dnoa/secret";
pub const RETURN_TO_SIGNATURE_HANDLE_KEY: &str = "dnoa.return_to_sig_handle";
pub const RETURN_TO_SIGNATURE_KEY: &str = "dnoa.return_to_sig";

pub struct ReturnToSignatureBindingElement {
    store: Arc<dyn CryptoKeyStore>,
}

impl ReturnToSignatureBindingElement {
    pub fn new(store: Arc<dyn CryptoKeyStore>) -> Self {
        Self { store }
    }

    /// Key-Value Form of every return_to argument except the signature,
    /// sorted by key ignoring case. The MAC is HMAC-SHA256 over this.
    fn signed_data(return_to: &Url) -> Result<Vec<u8>, ProtocolError> {
        let mut arguments: Vec<(String, String)> = return_to
            .query_pairs()
            .filter(|(k, _)| k != RETURN_TO_SIGNATURE_KEY)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        arguments.sort_by(|a, b| a.0.to_lowercase().cmp(&b.0.to_lowercase()).then_with(|| a.0.cmp(&b.0)));
        Ok(KeyValueFormEncoding::default().encode(arguments)?)
    }

    fn without_signature(return_to: &Url) -> Url {
        let kept: Vec<(String, String)> = return_to
            .query_pairs()
            .filter(|(k, _)| k != RETURN_TO_SIGNATURE_KEY && k != RETURN_TO_SIGNATURE_HANDLE_KEY)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let mut url = return_to.clone();
        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(kept);
        }
        url
    }

    /// `return_to` with a fresh signature appended.
    pub fn sign(&self, return_to: &Url, context: &ChannelContext<'_>) -> Result<Url, ProtocolError> {
        let (handle, key) = current_key(
            self.store.as_ref(),
            context.clock,
            context.random,
            RETURN_TO_SECRET_BUCKET,
            context.settings.maximum_message_lifetime(),
            context.settings.symmetric_key_lifetime(),
        )?;
        let mut signed = Self::without_signature(return_to);
        signed.query_pairs_mut().append_pair(RETURN_TO_SIGNATURE_HANDLE_KEY, &handle);
        let data = Self::signed_data(&signed)?;
        let signature = hmac::sign(&hmac::Key::new(hmac::HMAC_SHA256, key.key()), &data);
        signed.query_pairs_mut().append_pair(RETURN_TO_SIGNATURE_KEY, &BASE64.encode(signature.as_ref()));
        Ok(signed)
    }

    /// Whether `return_to` carries a signature made with one of our keys.
    pub fn verify(&self, return_to: &Url) -> bool {
        let (Some(handle), Some(signature)) = (
            return_to_argument(return_to, RETURN_TO_SIGNATURE_HANDLE_KEY),
            return_to_argument(return_to, RETURN_TO_SIGNATURE_KEY),
        ) else {
            return false;
        };
        let Some(key) = self.store.get_key(RETURN_TO_SECRET_BUCKET, &handle) else {
            warn!(handle = %handle, "return_to signed with an unknown key");
            return false;
        };
        let Ok(signature) = BASE64.decode(signature) else {
            return false;
        };
        let Ok(data) = Self::signed_data(return_to) else {
            return false;
        };
        hmac::verify(&hmac::Key::new(hmac::HMAC_SHA256, key.key()), &data, &signature).is_ok()
    }
}

impl ChannelBindingElement<OpenIdMessage> for ReturnToSignatureBindingElement {
    fn name(&self) -> &'static str {
        RETURN_TO_SIGNATURE_ELEMENT
    }

    fn protection(&self) -> Protections {
        Protections::NONE
    }

    fn process_outgoing(
        &self,
        message: &mut OpenIdMessage,
        context: &ChannelContext<'_>,
    ) -> Result<Option<Protections>, ProtocolError> {
        let OpenIdMessage::CheckIdRequest(request) = message else {
            return Ok(None);
        };
        let Some(return_to) = &request.return_to else {
            return Ok(None);
        };
        let signed = self.sign(return_to.url(), context)?;
        request.return_to = Some(MessageUri::from(signed));
        debug!("signed return_to arguments");
        Ok(Some(Protections::NONE))
    }

    fn process_incoming(
        &self,
        message: &mut OpenIdMessage,
        _context: &ChannelContext<'_>,
    ) -> Result<Option<Protections>, ProtocolError> {
        let OpenIdMessage::PositiveAssertion(assertion) = message else {
            return Ok(None);
        };
        let Some(return_to) = &assertion.return_to else {
            return Ok(None);
        };
        if return_to_argument(return_to.url(), RETURN_TO_SIGNATURE_HANDLE_KEY).is_none() {
            return Ok(None);
        }
        let verified = self.verify(return_to.url());
        if !verified {
            warn!("return_to arguments carry an invalid signature");
        }
        assertion.return_to_signature_verified = verified;
        Ok(Some(Protections::NONE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MessagingSettings;
    use crate::messaging::{FixedClock, InMemoryCryptoKeyStore, MessageDescriptions, SystemRandomSource};
    use chrono::{TimeZone, Utc};

    struct Fixture {
        settings: MessagingSettings,
        clock: FixedClock,
        random: SystemRandomSource,
        descriptions: MessageDescriptions,
        store: Arc<InMemoryCryptoKeyStore>,
        element: ReturnToSignatureBindingElement,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(InMemoryCryptoKeyStore::new());
            Self {
                settings: MessagingSettings::default(),
                clock: FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
                random: SystemRandomSource::new(),
                descriptions: MessageDescriptions::new(),
                element: ReturnToSignatureBindingElement::new(store.clone()),
                store,
            }
        }

        fn context(&self) -> ChannelContext<'_> {
            ChannelContext {
                settings: &self.settings,
                clock: &self.clock,
                random: &self.random,
                descriptions: &self.descriptions,
                request: None,
            }
        }

        fn sign(&self, url: &str) -> Url {
            self.element.sign(&Url::parse(url).unwrap(), &self.context()).unwrap()
        }
    }

    fn with_pairs(url: &Url, pairs: Vec<(String, String)>) -> Url {
        let mut url = url.clone();
        url.query_pairs_mut().clear().extend_pairs(pairs);
        url
    }

    fn pairs(url: &Url) -> Vec<(String, String)> {
        url.query_pairs().into_owned().collect()
    }

    #[test]
    fn signature_covers_sorted_arguments_without_itself() {
        let fixture = Fixture::new();
        let signed = fixture.sign("https://rp.example/return?session=42&Beta=2&alpha=1");

        let handle = return_to_argument(&signed, RETURN_TO_SIGNATURE_HANDLE_KEY).unwrap();
        let key = fixture.store.get_key(RETURN_TO_SECRET_BUCKET, &handle).unwrap();
        let mut arguments: Vec<(String, String)> =
            pairs(&signed).into_iter().filter(|(k, _)| k != RETURN_TO_SIGNATURE_KEY).collect();
        arguments.sort_by_key(|(k, _)| k.to_lowercase());
        let data: String = arguments.iter().map(|(k, v)| format!("{k}:{v}\n")).collect();
        assert!(data.starts_with("alpha:1\nBeta:2\ndnoa.return_to_sig_handle:"));

        let expected = hmac::sign(&hmac::Key::new(hmac::HMAC_SHA256, key.key()), data.as_bytes());
        assert_eq!(
            return_to_argument(&signed, RETURN_TO_SIGNATURE_KEY),
            Some(BASE64.encode(expected.as_ref()))
        );
        assert!(fixture.element.verify(&signed));
    }

    #[test]
    fn argument_order_does_not_matter() {
        let fixture = Fixture::new();
        let signed = fixture.sign("https://rp.example/return?a=1&b=2&c=3");
        let mut reversed = pairs(&signed);
        reversed.reverse();
        assert!(fixture.element.verify(&with_pairs(&signed, reversed)));
    }

    #[test]
    fn any_change_after_signing_fails() {
        let fixture = Fixture::new();
        let signed = fixture.sign("https://rp.example/return?a=1&b=2");

        let altered: Vec<(String, String)> = pairs(&signed)
            .into_iter()
            .map(|(k, v)| if k == "b" { (k, "3".to_string()) } else { (k, v) })
            .collect();
        assert!(!fixture.element.verify(&with_pairs(&signed, altered)));

        let mut added = pairs(&signed);
        added.push(("c".to_string(), "4".to_string()));
        assert!(!fixture.element.verify(&with_pairs(&signed, added)));

        let dropped: Vec<(String, String)> = pairs(&signed).into_iter().filter(|(k, _)| k != "a").collect();
        assert!(!fixture.element.verify(&with_pairs(&signed, dropped)));

        let unsigned: Vec<(String, String)> =
            pairs(&signed).into_iter().filter(|(k, _)| k != RETURN_TO_SIGNATURE_KEY).collect();
        assert!(!fixture.element.verify(&with_pairs(&signed, unsigned)));
    }

    #[test]
    fn resigning_replaces_the_old_signature() {
        let fixture = Fixture::new();
        let signed = fixture.sign("https://rp.example/return?a=1");
        let again = fixture.element.sign(&signed, &fixture.context()).unwrap();
        let keys: Vec<String> = pairs(&again).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["a", RETURN_TO_SIGNATURE_HANDLE_KEY, RETURN_TO_SIGNATURE_KEY]);
        assert!(fixture.element.verify(&again));
    }

    #[test]
    fn keys_from_another_store_are_unknown() {
        let fixture = Fixture::new();
        let signed = fixture.sign("https://rp.example/return?a=1");
        let stranger = ReturnToSignatureBindingElement::new(Arc::new(InMemoryCryptoKeyStore::new()));
        assert!(!stranger.verify(&signed));
    }
}
