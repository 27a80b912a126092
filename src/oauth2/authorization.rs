//! Authorization codes, refresh tokens and access tokens as data bags.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use ring::digest;
use ring::signature::Ed25519KeyPair;
use url::Url;

use super::types::AuthorizationDescription;
use super::{ACCESS_TOKEN_BUCKET, AUTHORIZATION_CODE_BUCKET, REFRESH_TOKEN_BUCKET};
use crate::config::MessagingSettings;
use crate::messaging::message::{MessageBase, impl_message};
use crate::messaging::{
    Clock, CryptoKeyStore, DATA_BAG_VERSION, DataBag, DataBagBase, DataBagFormatter, DescribedMessage,
    MessageDescriptions, MessagePart, NonceStore, ProtocolError, ProtocolVersion, RandomSource, ScopeEncoder,
};

/// Shared collaborators every token formatter is built from.
#[derive(Clone)]
pub struct BagServices {
    pub clock: Arc<dyn Clock>,
    pub random: Arc<dyn RandomSource>,
    pub descriptions: Arc<MessageDescriptions>,
}

/// SHA-256 of a callback URL as the authorization code records it.
pub fn callback_hash(callback: &Url) -> Vec<u8> {
    digest::digest(&digest::SHA256, callback.as_str().as_bytes()).as_ref().to_vec()
}

fn description(
    client_id: &str,
    user: &Option<String>,
    scope: &Option<BTreeSet<String>>,
    issued: DateTime<Utc>,
) -> AuthorizationDescription {
    AuthorizationDescription {
        client_id: client_id.to_string(),
        user: user.clone(),
        scope: scope.clone().unwrap_or_default(),
        utc_issued: issued,
    }
}

fn scope_or_none(scope: &BTreeSet<String>) -> Option<BTreeSet<String>> {
    (!scope.is_empty()).then(|| scope.clone())
}

/// A single-use authorization code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationCode {
    pub base: MessageBase,
    pub bag: DataBagBase,
    pub client_id: String,
    pub user: Option<String>,
    pub scope: Option<BTreeSet<String>>,
    /// Hash of the redirect_uri the authorization request named.
    pub callback_hash: Option<Vec<u8>>,
}

impl AuthorizationCode {
    pub fn new(authorization: &AuthorizationDescription, callback: Option<&Url>) -> Self {
        Self {
            base: MessageBase::new(DATA_BAG_VERSION),
            client_id: authorization.client_id.clone(),
            user: authorization.user.clone(),
            scope: scope_or_none(&authorization.scope),
            callback_hash: callback.map(callback_hash),
            ..Default::default()
        }
    }

    /// Signed, encrypted and redeemable once within the code lifetime.
    pub fn formatter(
        store: Arc<dyn CryptoKeyStore>,
        nonces: Arc<dyn NonceStore>,
        settings: &MessagingSettings,
        services: &BagServices,
    ) -> DataBagFormatter<Self> {
        DataBagFormatter::symmetric(
            store,
            AUTHORIZATION_CODE_BUCKET,
            settings.symmetric_key_lifetime(),
            services.clock.clone(),
            services.random.clone(),
            services.descriptions.clone(),
        )
        .encrypted(true)
        .maximum_age(settings.authorization_code_lifetime())
        .decode_once(nonces)
    }

    pub fn authorization(&self) -> AuthorizationDescription {
        description(&self.client_id, &self.user, &self.scope, self.bag.creation_utc)
    }
}

impl_message!(AuthorizationCode);

impl DescribedMessage for AuthorizationCode {
    fn declare_parts() -> Vec<MessagePart<Self>> {
        let mut parts = vec![
            MessagePart::<Self>::value("cid", |m| &m.client_id, |m| &mut m.client_id).required(),
            MessagePart::<Self>::optional("u", |m| &m.user, |m| &mut m.user),
            MessagePart::<Self>::optional_with("scope", |m| &m.scope, |m| &mut m.scope, ScopeEncoder),
            MessagePart::<Self>::optional("cb", |m| &m.callback_hash, |m| &mut m.callback_hash),
        ];
        parts.extend(MessagePart::<Self>::inherit(DataBagBase::parts(), |m| &m.bag, |m| &mut m.bag));
        parts
    }

    fn new_for_version(version: ProtocolVersion) -> Self {
        Self { base: MessageBase::new(version), ..Default::default() }
    }
}

impl DataBag for AuthorizationCode {
    fn bag(&self) -> &DataBagBase {
        &self.bag
    }

    fn bag_mut(&mut self) -> &mut DataBagBase {
        &mut self.bag
    }
}

/// A long lived grant a client trades for fresh access tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshToken {
    pub base: MessageBase,
    pub bag: DataBagBase,
    pub client_id: String,
    pub user: Option<String>,
    pub scope: Option<BTreeSet<String>>,
}

impl RefreshToken {
    pub fn new(authorization: &AuthorizationDescription) -> Self {
        Self {
            base: MessageBase::new(DATA_BAG_VERSION),
            client_id: authorization.client_id.clone(),
            user: authorization.user.clone(),
            scope: scope_or_none(&authorization.scope),
            ..Default::default()
        }
    }

    pub fn formatter(
        store: Arc<dyn CryptoKeyStore>,
        settings: &MessagingSettings,
        services: &BagServices,
    ) -> DataBagFormatter<Self> {
        let formatter = DataBagFormatter::symmetric(
            store,
            REFRESH_TOKEN_BUCKET,
            settings.symmetric_key_lifetime(),
            services.clock.clone(),
            services.random.clone(),
            services.descriptions.clone(),
        )
        .encrypted(true);
        match settings.refresh_token_lifetime() {
            Some(lifetime) => formatter.maximum_age(lifetime),
            None => formatter,
        }
    }

    pub fn authorization(&self) -> AuthorizationDescription {
        description(&self.client_id, &self.user, &self.scope, self.bag.creation_utc)
    }
}

impl_message!(RefreshToken);

impl DescribedMessage for RefreshToken {
    fn declare_parts() -> Vec<MessagePart<Self>> {
        let mut parts = vec![
            MessagePart::<Self>::value("cid", |m| &m.client_id, |m| &mut m.client_id).required(),
            MessagePart::<Self>::optional("u", |m| &m.user, |m| &mut m.user),
            MessagePart::<Self>::optional_with("scope", |m| &m.scope, |m| &mut m.scope, ScopeEncoder),
        ];
        parts.extend(MessagePart::<Self>::inherit(DataBagBase::parts(), |m| &m.bag, |m| &mut m.bag));
        parts
    }

    fn new_for_version(version: ProtocolVersion) -> Self {
        Self { base: MessageBase::new(version), ..Default::default() }
    }
}

impl DataBag for RefreshToken {
    fn bag(&self) -> &DataBagBase {
        &self.bag
    }

    fn bag_mut(&mut self) -> &mut DataBagBase {
        &mut self.bag
    }
}

/// How access tokens are protected. Resource servers need the matching
/// [`AccessTokenVerification`].
#[derive(Clone)]
pub enum AccessTokenSigning {
    /// HMAC with a key from the host's crypto key store; encrypted as well.
    Symmetric,
    /// Ed25519 signatures, encrypted when a pre-shared key is given.
    Asymmetric { signing: Arc<Ed25519KeyPair>, encryption_key: Option<[u8; 32]> },
}

impl std::fmt::Debug for AccessTokenSigning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessTokenSigning::Symmetric => f.write_str("Symmetric"),
            AccessTokenSigning::Asymmetric { encryption_key, .. } => f
                .debug_struct("Asymmetric")
                .field("encrypted", &encryption_key.is_some())
                .finish(),
        }
    }
}

/// Verification side of [`AccessTokenSigning`].
#[derive(Clone)]
pub enum AccessTokenVerification {
    Symmetric(Arc<dyn CryptoKeyStore>),
    Asymmetric { public_key: Vec<u8>, encryption_key: Option<[u8; 32]> },
}

/// Per-token choices the host makes when an access token is issued.
#[derive(Debug, Clone)]
pub struct AccessTokenParameters {
    pub signing: AccessTokenSigning,
    /// `None` uses the configured access token lifetime.
    pub lifetime: Option<TimeDelta>,
    pub include_refresh_token: bool,
}

impl Default for AccessTokenParameters {
    fn default() -> Self {
        Self { signing: AccessTokenSigning::Symmetric, lifetime: None, include_refresh_token: true }
    }
}

/// A bearer token presented to resource servers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessToken {
    pub base: MessageBase,
    pub bag: DataBagBase,
    pub client_id: String,
    pub user: Option<String>,
    pub scope: Option<BTreeSet<String>>,
    pub lifetime: Option<TimeDelta>,
}

impl AccessToken {
    pub fn new(authorization: &AuthorizationDescription, lifetime: TimeDelta) -> Self {
        Self {
            base: MessageBase::new(DATA_BAG_VERSION),
            client_id: authorization.client_id.clone(),
            user: authorization.user.clone(),
            scope: scope_or_none(&authorization.scope),
            lifetime: Some(lifetime),
            ..Default::default()
        }
    }

    /// The formatter an authorization server issues tokens with.
    pub fn issuing_formatter(
        signing: &AccessTokenSigning,
        store: Arc<dyn CryptoKeyStore>,
        lifetime: TimeDelta,
        settings: &MessagingSettings,
        services: &BagServices,
    ) -> DataBagFormatter<Self> {
        match signing {
            AccessTokenSigning::Symmetric => DataBagFormatter::symmetric(
                store,
                ACCESS_TOKEN_BUCKET,
                settings.symmetric_key_lifetime(),
                services.clock.clone(),
                services.random.clone(),
                services.descriptions.clone(),
            )
            .encrypted(true)
            .maximum_age(lifetime),
            AccessTokenSigning::Asymmetric { signing, encryption_key } => DataBagFormatter::asymmetric(
                Some(signing.clone()),
                None,
                *encryption_key,
                services.clock.clone(),
                services.random.clone(),
                services.descriptions.clone(),
            ),
        }
    }

    /// The formatter a resource server reads tokens with. Expiry is
    /// checked against the lifetime each token carries.
    pub fn verifying_formatter(verification: &AccessTokenVerification, services: &BagServices) -> DataBagFormatter<Self> {
        match verification {
            AccessTokenVerification::Symmetric(store) => DataBagFormatter::symmetric(
                store.clone(),
                ACCESS_TOKEN_BUCKET,
                TimeDelta::zero(),
                services.clock.clone(),
                services.random.clone(),
                services.descriptions.clone(),
            )
            .encrypted(true),
            AccessTokenVerification::Asymmetric { public_key, encryption_key } => DataBagFormatter::asymmetric(
                None,
                Some(public_key.clone()),
                *encryption_key,
                services.clock.clone(),
                services.random.clone(),
                services.descriptions.clone(),
            ),
        }
    }

    pub fn expires_utc(&self) -> Option<DateTime<Utc>> {
        self.lifetime.map(|lifetime| self.bag.creation_utc + lifetime)
    }

    pub fn authorization(&self) -> AuthorizationDescription {
        description(&self.client_id, &self.user, &self.scope, self.bag.creation_utc)
    }

    /// Fails once the token has outlived its lifetime.
    pub fn ensure_unexpired(&self, now: DateTime<Utc>) -> Result<(), ProtocolError> {
        match self.expires_utc() {
            Some(expires) if expires < now => Err(ProtocolError::Expired(format!("access token expired at {}", expires))),
            _ => Ok(()),
        }
    }
}

impl_message!(AccessToken);

impl DescribedMessage for AccessToken {
    fn declare_parts() -> Vec<MessagePart<Self>> {
        let mut parts = vec![
            MessagePart::<Self>::value("cid", |m| &m.client_id, |m| &mut m.client_id).required(),
            MessagePart::<Self>::optional("u", |m| &m.user, |m| &mut m.user),
            MessagePart::<Self>::optional_with("scope", |m| &m.scope, |m| &mut m.scope, ScopeEncoder),
            MessagePart::<Self>::optional("ttl", |m| &m.lifetime, |m| &mut m.lifetime),
        ];
        parts.extend(MessagePart::<Self>::inherit(DataBagBase::parts(), |m| &m.bag, |m| &mut m.bag));
        parts
    }

    fn new_for_version(version: ProtocolVersion) -> Self {
        Self { base: MessageBase::new(version), ..Default::default() }
    }
}

impl DataBag for AccessToken {
    fn bag(&self) -> &DataBagBase {
        &self.bag
    }

    fn bag_mut(&mut self) -> &mut DataBagBase {
        &mut self.bag
    }
}
