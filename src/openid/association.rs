//! Associations: HMAC secrets shared between a relying party and a provider.
//!
//! Providers keep no association table. The secret and expiry are sealed
//! into the handle itself as an encrypted data bag, so any provider node
//! holding the bucket key can recover them.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use ring::hmac;
use tracing::{debug, warn};
use url::Url;

use super::messages::AssociateSuccessfulResponse;
use crate::config::MessagingSettings;
use crate::messaging::message::{MessageBase, impl_message};
use crate::messaging::{
    BooleanEncoder, Clock, CryptoKey, CryptoKeyStore, DataBag, DataBagBase, DataBagFormatter, DescribedMessage,
    MessageDescriptions, MessagePart, ProtocolError, ProtocolVersion, RandomSource, UnixTimestampEncoder,
};

/// Key store bucket holding the keys that seal provider association handles.
pub const ASSOCIATION_SECRETS_BUCKET: &str = "https://localhost/dnoa/association_secrets";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationType {
    HmacSha1,
    HmacSha256,
}

impl AssociationType {
    pub fn as_str(self) -> &'static str {
        match self {
            AssociationType::HmacSha1 => "HMAC-SHA1",
            AssociationType::HmacSha256 => "HMAC-SHA256",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "HMAC-SHA1" => Some(AssociationType::HmacSha1),
            "HMAC-SHA256" => Some(AssociationType::HmacSha256),
            _ => None,
        }
    }

    pub fn secret_len(self) -> usize {
        match self {
            AssociationType::HmacSha1 => 20,
            AssociationType::HmacSha256 => 32,
        }
    }

    pub fn from_secret_len(len: usize) -> Option<Self> {
        match len {
            20 => Some(AssociationType::HmacSha1),
            32 => Some(AssociationType::HmacSha256),
            _ => None,
        }
    }

    /// HMAC-SHA256 arrived with OpenID 2.0.
    pub fn supported_by(self, version: ProtocolVersion) -> bool {
        self == AssociationType::HmacSha1 || version >= ProtocolVersion::V2_0
    }

    /// The strongest type a protocol version allows.
    pub fn preferred_for(version: ProtocolVersion) -> Self {
        if version >= ProtocolVersion::V2_0 { AssociationType::HmacSha256 } else { AssociationType::HmacSha1 }
    }

    fn algorithm(self) -> hmac::Algorithm {
        match self {
            AssociationType::HmacSha1 => hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            AssociationType::HmacSha256 => hmac::HMAC_SHA256,
        }
    }
}

/// A shared (or provider-private) signing secret with its handle.
#[derive(Clone)]
pub struct Association {
    handle: String,
    secret: Vec<u8>,
    association_type: AssociationType,
    expires_utc: DateTime<Utc>,
    private: bool,
}

impl std::fmt::Debug for Association {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Association")
            .field("handle", &self.handle)
            .field("type", &self.association_type)
            .field("expires_utc", &self.expires_utc)
            .field("private", &self.private)
            .finish()
    }
}

impl Association {
    /// The type follows from the secret length.
    pub fn new(
        handle: impl Into<String>,
        secret: Vec<u8>,
        expires_utc: DateTime<Utc>,
        private: bool,
    ) -> Result<Self, ProtocolError> {
        let association_type = AssociationType::from_secret_len(secret.len())
            .ok_or_else(|| ProtocolError::violation(format!("no association type has a {}-byte secret", secret.len())))?;
        Ok(Self { handle: handle.into(), secret, association_type, expires_utc, private })
    }

    /// The association a provider granted in an associate response.
    pub fn from_response(response: &AssociateSuccessfulResponse, now: DateTime<Utc>) -> Result<Self, ProtocolError> {
        let declared = AssociationType::parse(&response.association_type).ok_or_else(|| {
            ProtocolError::violation(format!("unknown association type {}", response.association_type))
        })?;
        if declared.secret_len() != response.mac_key.len() {
            return Err(ProtocolError::violation(format!(
                "{} association with a {}-byte secret",
                declared.as_str(),
                response.mac_key.len()
            )));
        }
        let lifetime = TimeDelta::seconds(i64::try_from(response.expires_in).unwrap_or(i64::MAX).min(i64::MAX / 1000));
        Self::new(response.assoc_handle.clone(), response.mac_key.clone(), now + lifetime, false)
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    pub fn association_type(&self) -> AssociationType {
        self.association_type
    }

    pub fn expires_utc(&self) -> DateTime<Utc> {
        self.expires_utc
    }

    /// Private associations sign assertions for relying parties in
    /// stateless mode and are only ever checked by the provider.
    pub fn is_private(&self) -> bool {
        self.private
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_utc <= now
    }

    /// Whole seconds left, never negative.
    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> u64 {
        u64::try_from((self.expires_utc - now).num_seconds()).unwrap_or(0)
    }

    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let key = hmac::Key::new(self.association_type.algorithm(), &self.secret);
        hmac::sign(&key, data).as_ref().to_vec()
    }

    /// Constant time comparison against `signature`.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let key = hmac::Key::new(self.association_type.algorithm(), &self.secret);
        hmac::verify(&key, data, signature).is_ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct AssociationBag {
    base: MessageBase,
    bag: DataBagBase,
    secret: Vec<u8>,
    expires_utc: DateTime<Utc>,
    private: bool,
}

impl_message!(AssociationBag);

impl DescribedMessage for AssociationBag {
    fn declare_parts() -> Vec<MessagePart<Self>> {
        let mut parts = vec![
            MessagePart::<Self>::value("s", |m| &m.secret, |m| &mut m.secret)
                .required()
                .non_empty()
                .security_sensitive(),
            MessagePart::<Self>::value_with("x", |m| &m.expires_utc, |m| &mut m.expires_utc, UnixTimestampEncoder)
                .required(),
            MessagePart::<Self>::value_with("p", |m| &m.private, |m| &mut m.private, BooleanEncoder).required(),
        ];
        parts.extend(MessagePart::<Self>::inherit(DataBagBase::parts(), |m| &m.bag, |m| &mut m.bag));
        parts
    }

    fn new_for_version(version: ProtocolVersion) -> Self {
        Self { base: MessageBase::new(version), ..Default::default() }
    }
}

impl DataBag for AssociationBag {
    fn bag(&self) -> &DataBagBase {
        &self.bag
    }

    fn bag_mut(&mut self) -> &mut DataBagBase {
        &mut self.bag
    }
}

/// Mints and recovers provider associations whose handles carry their own
/// encrypted secret.
pub struct ProviderAssociationStore {
    formatter: DataBagFormatter<AssociationBag>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
}

impl ProviderAssociationStore {
    pub fn new(
        key_store: Arc<dyn CryptoKeyStore>,
        settings: &MessagingSettings,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
        descriptions: Arc<MessageDescriptions>,
    ) -> Self {
        let longest = settings.shared_association_lifetime().max(settings.private_association_lifetime());
        let formatter = DataBagFormatter::symmetric(
            key_store,
            ASSOCIATION_SECRETS_BUCKET,
            settings.symmetric_key_lifetime(),
            clock.clone(),
            random.clone(),
            descriptions,
        )
        .encrypted(true)
        .maximum_age(longest);
        Self { formatter, clock, random }
    }

    pub fn create(
        &self,
        association_type: AssociationType,
        lifetime: TimeDelta,
        private: bool,
    ) -> Result<Association, ProtocolError> {
        let secret = self.random.bytes(association_type.secret_len())?;
        let expires_utc = self.clock.now() + lifetime;
        let mut bag = AssociationBag {
            base: MessageBase::new(ProtocolVersion::V1_0),
            secret: secret.clone(),
            expires_utc,
            private,
            ..Default::default()
        };
        let handle = self.formatter.serialize(&mut bag)?;
        debug!(kind = association_type.as_str(), private, "created association");
        Association::new(handle, secret, expires_utc, private)
    }

    /// The live association behind `handle`, if it decodes and its
    /// privacy matches `private`.
    pub fn recover(&self, handle: &str, private: bool) -> Option<Association> {
        let bag = self.formatter.deserialize(handle).ok()?;
        if bag.private != private {
            warn!(private, "association handle used with the wrong privacy");
            return None;
        }
        let association = Association::new(handle, bag.secret, bag.expires_utc, bag.private).ok()?;
        if association.is_expired(self.clock.now()) {
            debug!("association handle has expired");
            return None;
        }
        Some(association)
    }
}

/// The associations a relying party holds, per provider endpoint.
pub trait RelyingPartyAssociationStore: Send + Sync {
    fn store_association(&self, provider: &Url, association: &Association);

    fn get_association(&self, provider: &Url, handle: &str) -> Option<Association>;

    /// The association with the longest remaining life, provided it has at
    /// least `minimum_remaining` left.
    fn best_association(&self, provider: &Url, minimum_remaining: TimeDelta) -> Option<Association>;

    /// Returns whether the handle was known.
    fn remove_association(&self, provider: &Url, handle: &str) -> bool;
}

/// Relying party associations kept in a crypto key store, one bucket per
/// provider endpoint.
pub struct CryptoKeyAssociationStore {
    keys: Arc<dyn CryptoKeyStore>,
    clock: Arc<dyn Clock>,
}

impl CryptoKeyAssociationStore {
    pub fn new(keys: Arc<dyn CryptoKeyStore>, clock: Arc<dyn Clock>) -> Self {
        Self { keys, clock }
    }

    fn live(&self, handle: &str, key: CryptoKey) -> Option<Association> {
        let association = Association::new(handle, key.key().to_vec(), key.expires_utc(), false).ok()?;
        (!association.is_expired(self.clock.now())).then_some(association)
    }
}

impl RelyingPartyAssociationStore for CryptoKeyAssociationStore {
    fn store_association(&self, provider: &Url, association: &Association) {
        let bucket = provider.as_str();
        let key = CryptoKey::new(association.secret().to_vec(), association.expires_utc());
        if self.keys.store_key(bucket, association.handle(), key.clone()).is_err() {
            warn!(provider = %provider, handle = association.handle(), "replacing association with the same handle");
            self.keys.remove_key(bucket, association.handle());
            if let Err(collision) = self.keys.store_key(bucket, association.handle(), key) {
                warn!(error = %collision, "could not store association");
            }
        }
    }

    fn get_association(&self, provider: &Url, handle: &str) -> Option<Association> {
        let key = self.keys.get_key(provider.as_str(), handle)?;
        self.live(handle, key)
    }

    fn best_association(&self, provider: &Url, minimum_remaining: TimeDelta) -> Option<Association> {
        let cutoff = self.clock.now() + minimum_remaining;
        self.keys
            .get_keys(provider.as_str())
            .into_iter()
            .find(|(_, key)| key.expires_utc() > cutoff)
            .and_then(|(handle, key)| self.live(&handle, key))
    }

    fn remove_association(&self, provider: &Url, handle: &str) -> bool {
        let known = self.keys.get_key(provider.as_str(), handle).is_some();
        self.keys.remove_key(provider.as_str(), handle);
        known
    }
}
