//! OpenID 1.1 and 2.0 authentication on top of the messaging channel.
//!
//! Relying party incoming order: signature, return_to nonce, response
//! nonce, return_to signature, tunneled 1.x values, extensions.

use std::sync::Arc;

use crate::config::MessagingSettings;
use crate::messaging::{
    Clock, CryptoKeyStore, HttpTransport, InMemoryCryptoKeyStore, InMemoryNonceStore, MessageDescriptions,
    NonceStore, RandomSource, SystemClock, SystemRandomSource,
};

pub mod association;
pub mod backward_compat;
pub mod extensions;
pub mod factory;
pub mod messages;
pub mod nonce;
pub mod provider;
pub mod relying_party;
pub mod return_to;
pub mod signing;

pub use association::{
    Association, AssociationType, CryptoKeyAssociationStore, ProviderAssociationStore, RelyingPartyAssociationStore,
};
pub use extensions::{ClaimsRequest, ClaimsResponse, ExtensionData};
pub use factory::OpenIdMessageFactory;
pub use nonce::ReturnToNonceBindingElement;
pub use messages::{
    AssociateRequest, AssociateSuccessfulResponse, AssociateUnsuccessfulResponse, CheckAuthenticationRequest,
    CheckAuthenticationResponse, CheckIdRequest, DirectErrorResponse, IndirectErrorResponse, NegativeAssertion,
    OpenIdMessage, PositiveAssertion,
};
pub use provider::Provider;
pub use relying_party::RelyingParty;

pub const OPENID_2_0_NAMESPACE: &str = "http://specs.openid.net/auth/2.0";
pub const OPENID_1_1_NAMESPACE: &str = "http://openid.net/signon/1.1";
pub const OPENID_1_0_NAMESPACE: &str = "http://openid.net/signon/1.0";
pub const IDENTIFIER_SELECT: &str = "http://specs.openid.net/auth/2.0/identifier_select";
pub const NO_ENCRYPTION: &str = "no-encryption";

/// return_to argument carrying the provider endpoint to 1.x relying parties.
pub const PROVIDER_ENDPOINT_KEY: &str = "dnoa.op_endpoint";
/// return_to argument carrying the claimed identifier to 1.x relying parties.
pub const CLAIMED_ID_KEY: &str = "dnoa.claimed_id";

/// Collaborators a relying party or provider is built from.
#[derive(Clone)]
pub struct OpenIdHost {
    pub settings: MessagingSettings,
    pub clock: Arc<dyn Clock>,
    pub random: Arc<dyn RandomSource>,
    pub descriptions: Arc<MessageDescriptions>,
    pub key_store: Arc<dyn CryptoKeyStore>,
    pub nonce_store: Arc<dyn NonceStore>,
    pub transport: Option<Arc<dyn HttpTransport>>,
}

impl OpenIdHost {
    /// Process-local stores and the system clock.
    pub fn in_memory(settings: MessagingSettings) -> Self {
        Self::in_memory_with_clock(settings, Arc::new(SystemClock))
    }

    pub fn in_memory_with_clock(settings: MessagingSettings, clock: Arc<dyn Clock>) -> Self {
        let nonce_age = settings.maximum_message_lifetime() + settings.maximum_clock_skew();
        Self {
            nonce_store: Arc::new(InMemoryNonceStore::new(nonce_age, clock.clone())),
            settings,
            clock,
            random: Arc::new(SystemRandomSource::new()),
            descriptions: Arc::new(MessageDescriptions::new()),
            key_store: Arc::new(InMemoryCryptoKeyStore::new()),
            transport: None,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }
}
