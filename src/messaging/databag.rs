//! Opaque, signed and optionally encrypted tokens built from messages.
//!
//! Wire layout before base64url: `[len][signature][len][payload]` with
//! little-endian `i32` lengths. The payload is the urlencoded field set,
//! optionally deflated, then optionally AES-256-GCM sealed. Symmetric bags
//! prefix the key handle and a `!`.

use std::any::type_name;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeDelta, Utc};
use ring::hmac;
use ring::signature::{ED25519, Ed25519KeyPair, UnparsedPublicKey};
use tracing::{debug, error, warn};

use openauth_lib::{compression, ende::aes, url_encoding};

use super::clock::Clock;
use super::description::MessageDescriptions;
use super::encoding::{Base64Encoder, UnixTimestampEncoder};
use super::error::{DataBagError, ProtocolError};
use super::message::{DescribedMessage, ProtocolVersion};
use super::part::MessagePart;
use super::random::RandomSource;
use super::stores::{CryptoKeyStore, NonceStore, current_key};

/// Version every data bag description is resolved at.
pub const DATA_BAG_VERSION: ProtocolVersion = ProtocolVersion::V1_0;

const NONCE_LEN: usize = 6;
const MAX_SIGNATURE_LEN: usize = 1024;
const MAX_PAYLOAD_LEN: usize = 8 * 1024;
const HANDLE_SEPARATOR: char = '!';

/// Fields every data bag carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataBagBase {
    /// Present on decode-once bags.
    pub nonce: Option<Vec<u8>>,
    /// Set when the bag is serialized, truncated to whole seconds.
    pub creation_utc: DateTime<Utc>,
}

impl DataBagBase {
    pub fn parts() -> Vec<MessagePart<DataBagBase>> {
        vec![
            MessagePart::<DataBagBase>::optional_with("n", |b| &b.nonce, |b| &mut b.nonce, Base64Encoder),
            MessagePart::<DataBagBase>::value_with(
                "timestamp",
                |b| &b.creation_utc,
                |b| &mut b.creation_utc,
                UnixTimestampEncoder,
            )
            .required(),
        ]
    }
}

/// A message that travels as an opaque token.
pub trait DataBag: DescribedMessage {
    fn bag(&self) -> &DataBagBase;

    fn bag_mut(&mut self) -> &mut DataBagBase;
}

/// Where a formatter's signing and encryption keys come from.
pub enum FormatterKeys {
    /// Keys from a crypto key store bucket; the handle travels with the bag.
    Symmetric {
        store: Arc<dyn CryptoKeyStore>,
        bucket: String,
        /// Remaining life a key must have to be used for a new bag.
        minimum_age: TimeDelta,
        key_lifetime: TimeDelta,
    },
    /// Ed25519 signatures, with an optional pre-shared encryption key.
    /// A verifier needs only the public key.
    Asymmetric {
        signing: Option<Arc<Ed25519KeyPair>>,
        public_key: Option<Vec<u8>>,
        encryption_key: Option<[u8; 32]>,
    },
}

/// Serializes and recovers data bags of type `T`.
pub struct DataBagFormatter<T> {
    keys: FormatterKeys,
    signed: bool,
    encrypted: bool,
    compressed: bool,
    maximum_age: Option<TimeDelta>,
    decode_once: Option<Arc<dyn NonceStore>>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    descriptions: Arc<MessageDescriptions>,
    _bag: PhantomData<fn() -> T>,
}

fn truncate_to_seconds(now: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now)
}

fn frame(signature: &[u8], payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(8 + signature.len() + payload.len());
    for section in [signature, payload] {
        let len = i32::try_from(section.len())
            .map_err(|_| ProtocolError::Host("data bag section too large".to_string()))?;
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(section);
    }
    Ok(out)
}

fn read_section<'a>(data: &mut &'a [u8], max: usize) -> Result<&'a [u8], DataBagError> {
    if data.len() < 4 {
        return Err(DataBagError::Malformed("truncated length prefix".to_string()));
    }
    let (prefix, rest) = data.split_at(4);
    let len = i32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    let len = usize::try_from(len).map_err(|_| DataBagError::Malformed("negative section length".to_string()))?;
    if len > max || len > rest.len() {
        return Err(DataBagError::Malformed(format!("section length {} out of range", len)));
    }
    let (section, rest) = rest.split_at(len);
    *data = rest;
    Ok(section)
}

fn unframe(data: &[u8]) -> Result<(&[u8], &[u8]), DataBagError> {
    let mut cursor = data;
    let signature = read_section(&mut cursor, MAX_SIGNATURE_LEN)?;
    let payload = read_section(&mut cursor, MAX_PAYLOAD_LEN)?;
    if !cursor.is_empty() {
        return Err(DataBagError::Malformed("trailing bytes after payload".to_string()));
    }
    Ok((signature, payload))
}

/// Material a single serialize or deserialize call works with.
struct ResolvedKeys {
    handle: Option<String>,
    secret: Option<Vec<u8>>,
}

impl<T: DataBag> DataBagFormatter<T> {
    /// A formatter keyed from `bucket` of `store`. Signs by default.
    pub fn symmetric(
        store: Arc<dyn CryptoKeyStore>,
        bucket: impl Into<String>,
        key_lifetime: TimeDelta,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
        descriptions: Arc<MessageDescriptions>,
    ) -> Self {
        Self::with_keys(
            FormatterKeys::Symmetric { store, bucket: bucket.into(), minimum_age: TimeDelta::zero(), key_lifetime },
            clock,
            random,
            descriptions,
        )
    }

    pub fn asymmetric(
        signing: Option<Arc<Ed25519KeyPair>>,
        public_key: Option<Vec<u8>>,
        encryption_key: Option<[u8; 32]>,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
        descriptions: Arc<MessageDescriptions>,
    ) -> Self {
        let formatter = Self::with_keys(
            FormatterKeys::Asymmetric { signing, public_key, encryption_key },
            clock,
            random,
            descriptions,
        );
        formatter.encrypted(encryption_key.is_some())
    }

    fn with_keys(
        keys: FormatterKeys,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
        descriptions: Arc<MessageDescriptions>,
    ) -> Self {
        Self {
            keys,
            signed: true,
            encrypted: false,
            compressed: false,
            maximum_age: None,
            decode_once: None,
            clock,
            random,
            descriptions,
            _bag: PhantomData,
        }
    }

    pub fn signed(mut self, signed: bool) -> Self {
        self.signed = signed;
        self
    }

    pub fn encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    /// Bags older than `age` are refused. For symmetric keys this also
    /// becomes the minimum remaining life of the signing key.
    pub fn maximum_age(mut self, age: TimeDelta) -> Self {
        self.maximum_age = Some(age);
        if let FormatterKeys::Symmetric { minimum_age, .. } = &mut self.keys {
            *minimum_age = age;
        }
        self
    }

    /// Each bag may be deserialized once; redemptions are tracked in `store`.
    pub fn decode_once(mut self, store: Arc<dyn NonceStore>) -> Self {
        self.decode_once = Some(store);
        self
    }

    fn outgoing_keys(&self) -> Result<ResolvedKeys, ProtocolError> {
        match &self.keys {
            FormatterKeys::Symmetric { store, bucket, minimum_age, key_lifetime } => {
                let (handle, key) = current_key(
                    store.as_ref(),
                    self.clock.as_ref(),
                    self.random.as_ref(),
                    bucket,
                    *minimum_age,
                    *key_lifetime,
                )?;
                Ok(ResolvedKeys { handle: Some(handle), secret: Some(key.key().to_vec()) })
            }
            FormatterKeys::Asymmetric { .. } => Ok(ResolvedKeys { handle: None, secret: None }),
        }
    }

    fn encryption_key(&self, keys: &ResolvedKeys) -> Result<[u8; 32], ProtocolError> {
        match (&self.keys, &keys.secret) {
            (FormatterKeys::Symmetric { .. }, Some(secret)) => {
                aes::derive_key(secret, "encryption").map_err(ProtocolError::Host)
            }
            (FormatterKeys::Asymmetric { encryption_key: Some(key), .. }, _) => Ok(*key),
            _ => Err(ProtocolError::Host("no encryption key configured".to_string())),
        }
    }

    fn signed_bytes(handle: Option<&str>, payload: &[u8]) -> Vec<u8> {
        let mut data = handle.map(|h| h.as_bytes().to_vec()).unwrap_or_default();
        data.extend_from_slice(payload);
        data
    }

    fn sign(&self, keys: &ResolvedKeys, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let data = Self::signed_bytes(keys.handle.as_deref(), payload);
        match (&self.keys, &keys.secret) {
            (FormatterKeys::Symmetric { .. }, Some(secret)) => {
                let signing = aes::derive_key(secret, "signing").map_err(ProtocolError::Host)?;
                let key = hmac::Key::new(hmac::HMAC_SHA256, &signing);
                Ok(hmac::sign(&key, &data).as_ref().to_vec())
            }
            (FormatterKeys::Asymmetric { signing: Some(pair), .. }, _) => Ok(pair.sign(&data).as_ref().to_vec()),
            _ => Err(ProtocolError::Host("no signing key configured".to_string())),
        }
    }

    fn verify(&self, keys: &ResolvedKeys, payload: &[u8], signature: &[u8]) -> Result<(), ProtocolError> {
        let data = Self::signed_bytes(keys.handle.as_deref(), payload);
        let verified = match (&self.keys, &keys.secret) {
            (FormatterKeys::Symmetric { .. }, Some(secret)) => {
                let signing = aes::derive_key(secret, "signing").map_err(ProtocolError::Host)?;
                let key = hmac::Key::new(hmac::HMAC_SHA256, &signing);
                hmac::verify(&key, &data, signature).is_ok()
            }
            (FormatterKeys::Asymmetric { public_key: Some(public_key), .. }, _) => {
                UnparsedPublicKey::new(&ED25519, public_key).verify(&data, signature).is_ok()
            }
            _ => return Err(ProtocolError::Host("no verification key configured".to_string())),
        };
        if verified { Ok(()) } else { Err(DataBagError::BadSignature.into()) }
    }

    /// Stamps the bag with its creation time (and nonce, for decode-once
    /// bags) and renders it as an opaque string.
    pub fn serialize(&self, bag: &mut T) -> Result<String, ProtocolError> {
        if self.decode_once.is_some() {
            bag.bag_mut().nonce = Some(self.random.bytes(NONCE_LEN)?);
        }
        bag.bag_mut().creation_utc = truncate_to_seconds(self.clock.now());

        let fields = self.descriptions.serialize(bag)?;
        let mut payload = url_encoding::encode_form(&fields).into_bytes();
        let keys = self.outgoing_keys()?;

        if self.compressed {
            payload = compression::compress_deflate(&payload)
                .map_err(|e| ProtocolError::Host(format!("cannot compress data bag: {}", e)))?;
        }
        if self.encrypted {
            let key = self.encryption_key(&keys)?;
            let mut nonce = [0u8; aes::NONCE_LEN];
            self.random.fill(&mut nonce)?;
            payload = aes::encrypt(&key, nonce, &payload).map_err(ProtocolError::Host)?;
        }
        let signature = if self.signed { self.sign(&keys, &payload)? } else { Vec::new() };

        let encoded = URL_SAFE_NO_PAD.encode(frame(&signature, &payload)?);
        debug!(bag = type_name::<T>(), len = encoded.len(), "serialized data bag");
        Ok(match keys.handle {
            Some(handle) => format!("{}{}{}", handle, HANDLE_SEPARATOR, encoded),
            None => encoded,
        })
    }

    fn incoming_keys<'a>(&self, value: &'a str) -> Result<(ResolvedKeys, &'a str), ProtocolError> {
        match &self.keys {
            FormatterKeys::Symmetric { store, bucket, .. } => {
                let (handle, rest) = value
                    .split_once(HANDLE_SEPARATOR)
                    .ok_or_else(|| DataBagError::Malformed("missing key handle".to_string()))?;
                let key = store.get_key(bucket, handle).ok_or_else(|| DataBagError::MissingKey {
                    bucket: bucket.clone(),
                    handle: handle.to_string(),
                })?;
                Ok((ResolvedKeys { handle: Some(handle.to_string()), secret: Some(key.key().to_vec()) }, rest))
            }
            FormatterKeys::Asymmetric { .. } => Ok((ResolvedKeys { handle: None, secret: None }, value)),
        }
    }

    /// Recovers a bag, checking signature, age and single use in that order.
    pub fn deserialize(&self, value: &str) -> Result<T, ProtocolError> {
        let bag_type = type_name::<T>();
        self.deserialize_inner(value).inspect_err(|e| match e {
            ProtocolError::DataBag(DataBagError::BadSignature) => {
                error!(bag = bag_type, "data bag signature verification failed")
            }
            ProtocolError::DataBag(DataBagError::Replayed) => error!(bag = bag_type, "data bag replay detected"),
            ProtocolError::DataBag(DataBagError::Expired { expired_at }) => {
                warn!(bag = bag_type, %expired_at, "data bag expired")
            }
            ProtocolError::DataBag(DataBagError::MissingKey { bucket, handle }) => {
                warn!(bag = bag_type, bucket = %bucket, handle = %handle, "data bag key not found")
            }
            other => warn!(bag = bag_type, error = %other, "data bag is malformed"),
        })
    }

    fn deserialize_inner(&self, value: &str) -> Result<T, ProtocolError> {
        let (keys, encoded) = self.incoming_keys(value)?;
        let framed = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| DataBagError::Malformed(format!("bad base64: {}", e)))?;
        let (signature, payload) = unframe(&framed)?;

        if self.signed {
            self.verify(&keys, payload, signature)?;
        }
        let mut payload = payload.to_vec();
        if self.encrypted {
            let key = self.encryption_key(&keys)?;
            payload = aes::decrypt(&key, &payload).map_err(|_| DataBagError::BadSignature)?;
        }
        if self.compressed {
            payload = compression::decompress_deflate(&payload)
                .map_err(|e| DataBagError::Malformed(format!("cannot decompress: {}", e)))?;
        }

        let text = String::from_utf8(payload).map_err(|_| DataBagError::Malformed("payload is not UTF-8".into()))?;
        let mut fields = BTreeMap::new();
        for (key, value) in url_encoding::parse_form(&text).map_err(DataBagError::Malformed)? {
            if fields.insert(key, value).is_some() {
                return Err(DataBagError::Malformed("repeated field".to_string()).into());
            }
        }
        let bag: T = self
            .descriptions
            .deserialize(DATA_BAG_VERSION, &fields)
            .map_err(|e| DataBagError::Malformed(e.to_string()))?;

        let creation = bag.bag().creation_utc;
        if let Some(maximum_age) = self.maximum_age {
            let expired_at = creation + maximum_age;
            if expired_at < self.clock.now() {
                return Err(DataBagError::Expired { expired_at }.into());
            }
        }

        if let Some(store) = &self.decode_once {
            let nonce = bag
                .bag()
                .nonce
                .as_ref()
                .ok_or_else(|| DataBagError::Malformed("single-use bag has no nonce".to_string()))?;
            if !store.store_nonce(type_name::<T>(), &URL_SAFE_NO_PAD.encode(nonce), creation) {
                return Err(DataBagError::Replayed.into());
            }
        }
        Ok(bag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::clock::FixedClock;
    use crate::messaging::message::{MessageBase, impl_message};
    use crate::messaging::random::SystemRandomSource;
    use crate::messaging::stores::{InMemoryCryptoKeyStore, InMemoryNonceStore};
    use chrono::TimeZone;
    use ring::signature::KeyPair;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct NoteBag {
        base: MessageBase,
        bag: DataBagBase,
        note: Option<String>,
    }

    impl_message!(NoteBag);

    impl DescribedMessage for NoteBag {
        fn declare_parts() -> Vec<MessagePart<Self>> {
            let mut parts = vec![MessagePart::<Self>::optional("note", |m| &m.note, |m| &mut m.note)];
            parts.extend(MessagePart::<Self>::inherit(DataBagBase::parts(), |m| &m.bag, |m| &mut m.bag));
            parts
        }

        fn new_for_version(version: ProtocolVersion) -> Self {
            Self { base: MessageBase::new(version), ..Default::default() }
        }
    }

    impl DataBag for NoteBag {
        fn bag(&self) -> &DataBagBase {
            &self.bag
        }

        fn bag_mut(&mut self) -> &mut DataBagBase {
            &mut self.bag
        }
    }

    fn note(text: &str) -> NoteBag {
        NoteBag { base: MessageBase::new(DATA_BAG_VERSION), note: Some(text.into()), ..Default::default() }
    }

    struct Fixture {
        clock: Arc<FixedClock>,
        store: Arc<InMemoryCryptoKeyStore>,
        descriptions: Arc<MessageDescriptions>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                clock: Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())),
                store: Arc::new(InMemoryCryptoKeyStore::new()),
                descriptions: Arc::new(MessageDescriptions::new()),
            }
        }

        fn formatter(&self) -> DataBagFormatter<NoteBag> {
            DataBagFormatter::symmetric(
                self.store.clone(),
                "https://localhost/test",
                TimeDelta::days(1),
                self.clock.clone(),
                Arc::new(SystemRandomSource::new()),
                self.descriptions.clone(),
            )
        }
    }

    #[test]
    fn round_trip_with_every_option() {
        let fixture = Fixture::new();
        let formatter = fixture.formatter().encrypted(true).compressed(true).maximum_age(TimeDelta::minutes(5));
        let mut bag = note("hello world & more");
        let token = formatter.serialize(&mut bag).unwrap();
        assert!(token.contains('!'));
        assert!(!token.contains("hello"));
        let recovered = formatter.deserialize(&token).unwrap();
        assert_eq!(recovered, bag);
    }

    #[test]
    fn any_flipped_byte_is_detected() {
        let fixture = Fixture::new();
        let formatter = fixture.formatter().encrypted(true);
        let token = formatter.serialize(&mut note("x")).unwrap();
        let (handle, encoded) = token.split_once('!').unwrap();
        let raw = URL_SAFE_NO_PAD.decode(encoded).unwrap();
        // Skip the two length prefixes; every signature or payload byte counts.
        let sig_len = i32::from_le_bytes(raw[0..4].try_into().unwrap()) as usize;
        let positions: Vec<usize> = (4..4 + sig_len).chain(8 + sig_len..raw.len()).collect();
        for i in positions {
            let mut tampered = raw.clone();
            tampered[i] ^= 0x01;
            let token = format!("{}!{}", handle, URL_SAFE_NO_PAD.encode(&tampered));
            let err = formatter.deserialize(&token).err().unwrap();
            assert!(matches!(err, ProtocolError::DataBag(DataBagError::BadSignature)), "byte {}", i);
        }
    }

    #[test]
    fn expiry_boundary() {
        let fixture = Fixture::new();
        let formatter = fixture.formatter().maximum_age(TimeDelta::seconds(60));
        let token = formatter.serialize(&mut note("x")).unwrap();

        fixture.clock.advance(TimeDelta::seconds(59));
        assert!(formatter.deserialize(&token).is_ok());
        fixture.clock.advance(TimeDelta::seconds(2));
        let err = formatter.deserialize(&token).err().unwrap();
        assert!(matches!(err, ProtocolError::DataBag(DataBagError::Expired { .. })));
    }

    #[test]
    fn decode_once_refuses_second_redemption() {
        let fixture = Fixture::new();
        let nonces = Arc::new(InMemoryNonceStore::new(TimeDelta::minutes(10), fixture.clock.clone()));
        let formatter = fixture.formatter().maximum_age(TimeDelta::minutes(5)).decode_once(nonces);
        let token = formatter.serialize(&mut note("x")).unwrap();
        assert!(formatter.deserialize(&token).is_ok());
        let err = formatter.deserialize(&token).err().unwrap();
        assert!(matches!(err, ProtocolError::DataBag(DataBagError::Replayed)));
    }

    #[test]
    fn unknown_handle_is_missing_key() {
        let fixture = Fixture::new();
        let formatter = fixture.formatter();
        let token = formatter.serialize(&mut note("x")).unwrap();
        let (_, encoded) = token.split_once('!').unwrap();
        let err = formatter.deserialize(&format!("nope!{}", encoded)).err().unwrap();
        assert!(matches!(err, ProtocolError::DataBag(DataBagError::MissingKey { .. })));
    }

    #[test]
    fn oversized_sections_are_malformed() {
        let fixture = Fixture::new();
        let formatter = fixture.formatter();
        let token = formatter.serialize(&mut note("x")).unwrap();
        let (handle, _) = token.split_once('!').unwrap();
        let mut raw = (2000i32).to_le_bytes().to_vec();
        raw.extend(vec![0u8; 2000]);
        let err = formatter.deserialize(&format!("{}!{}", handle, URL_SAFE_NO_PAD.encode(raw))).err().unwrap();
        assert!(matches!(err, ProtocolError::DataBag(DataBagError::Malformed(_))));
    }

    #[test]
    fn ed25519_bags_verify_with_public_key_only() {
        let rng = ring::rand::SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let pair = Arc::new(Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap());
        let public_key = pair.public_key().as_ref().to_vec();
        let fixture = Fixture::new();
        let random: Arc<dyn RandomSource> = Arc::new(SystemRandomSource::new());

        let issuer = DataBagFormatter::<NoteBag>::asymmetric(
            Some(pair),
            None,
            Some([7u8; 32]),
            fixture.clock.clone(),
            random.clone(),
            fixture.descriptions.clone(),
        );
        let verifier = DataBagFormatter::<NoteBag>::asymmetric(
            None,
            Some(public_key),
            Some([7u8; 32]),
            fixture.clock.clone(),
            random,
            fixture.descriptions.clone(),
        );
        let mut bag = note("token");
        let token = issuer.serialize(&mut bag).unwrap();
        assert_eq!(verifier.deserialize(&token).unwrap(), bag);
        assert!(issuer.deserialize(&token).is_err());
    }
}
