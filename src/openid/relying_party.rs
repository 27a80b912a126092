use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use super::association::{Association, AssociationType, CryptoKeyAssociationStore, RelyingPartyAssociationStore};
use super::backward_compat::BackwardCompatibilityBindingElement;
use super::extensions::ExtensionsBindingElement;
use super::factory::OpenIdMessageFactory;
use super::messages::{
    AssociateRequest, CheckAuthenticationRequest, CheckIdRequest, OpenIdMessage, PositiveAssertion,
};
use super::nonce::{ReturnToNonceBindingElement, relying_party_response_nonce};
use super::return_to::ReturnToSignatureBindingElement;
use super::signing::RelyingPartySigningBindingElement;
use super::{IDENTIFIER_SELECT, NO_ENCRYPTION, OpenIdHost};
use crate::messaging::{
    Channel, DirectEncoding, HttpRequest, HttpResponse, Message, MessageUri, ProtocolError, ProtocolMessage,
    ProtocolVersion,
};

/// The relying party side: associates with providers, sends authentication
/// requests and verifies the assertions that come back.
pub struct RelyingParty {
    channel: Channel<OpenIdMessage>,
    associations: Arc<dyn RelyingPartyAssociationStore>,
    return_to: Arc<ReturnToSignatureBindingElement>,
}

impl RelyingParty {
    pub fn new(host: OpenIdHost, associations: Arc<dyn RelyingPartyAssociationStore>) -> Result<Self, ProtocolError> {
        let return_to = Arc::new(ReturnToSignatureBindingElement::new(host.key_store.clone()));
        let mut builder = Channel::<OpenIdMessage>::builder(Arc::new(OpenIdMessageFactory))
            .element(Arc::new(ExtensionsBindingElement::new()))
            .element(Arc::new(BackwardCompatibilityBindingElement::new()))
            .element(return_to.clone())
            .element(Arc::new(relying_party_response_nonce(host.nonce_store.clone())))
            .element(Arc::new(ReturnToNonceBindingElement::new(host.nonce_store.clone(), return_to.clone())))
            .element(Arc::new(RelyingPartySigningBindingElement::new(associations.clone())))
            .settings(host.settings)
            .descriptions(host.descriptions)
            .clock(host.clock)
            .random(host.random)
            .direct_encoding(DirectEncoding::KeyValueForm);
        if let Some(transport) = host.transport {
            builder = builder.transport(transport);
        }
        Ok(Self { channel: builder.build()?, associations, return_to })
    }

    /// Associations live in the host's crypto key store.
    pub fn in_memory(host: OpenIdHost) -> Result<Self, ProtocolError> {
        let associations = Arc::new(CryptoKeyAssociationStore::new(host.key_store.clone(), host.clock.clone()));
        Self::new(host, associations)
    }

    pub fn channel(&self) -> &Channel<OpenIdMessage> {
        &self.channel
    }

    pub fn associations(&self) -> &Arc<dyn RelyingPartyAssociationStore> {
        &self.associations
    }

    /// A usable shared association with `provider`, establishing one when
    /// none is on hand. `None` means the provider declined and stateless
    /// verification will be used.
    #[instrument(skip(self, cancel), fields(provider = %provider))]
    pub async fn associate_async(
        &self,
        provider: &Url,
        version: ProtocolVersion,
        cancel: &CancellationToken,
    ) -> Result<Option<Association>, ProtocolError> {
        let minimum_remaining = self.channel.settings().maximum_message_lifetime();
        if let Some(existing) = self.associations.best_association(provider, minimum_remaining) {
            return Ok(Some(existing));
        }

        let mut association_type = AssociationType::preferred_for(version);
        for retried in [false, true] {
            let request = AssociateRequest::new(provider.clone(), version, association_type.as_str());
            match self.channel.request_async(request.into(), cancel).await? {
                OpenIdMessage::AssociateSuccessfulResponse(response) => {
                    let association = Association::from_response(&response, self.channel.clock().now())?;
                    self.associations.store_association(provider, &association);
                    info!(handle = association.handle(), kind = association_type.as_str(), "associated");
                    return Ok(Some(association));
                }
                OpenIdMessage::AssociateUnsuccessfulResponse(response) => {
                    let suggested = response.association_type.as_deref().and_then(AssociationType::parse);
                    let session_ok = response.session_type.as_deref().map_or(true, |s| s == NO_ENCRYPTION);
                    match suggested {
                        Some(next) if !retried && session_ok && next != association_type && next.supported_by(version) => {
                            debug!(suggested = next.as_str(), "provider suggested another association type");
                            association_type = next;
                        }
                        _ => {
                            warn!(error = %response.error, "provider declined to associate");
                            return Ok(None);
                        }
                    }
                }
                OpenIdMessage::DirectErrorResponse(response) => {
                    warn!(error = %response.error, "associate request failed");
                    return Ok(None);
                }
                other => {
                    return Err(ProtocolError::violation(format!("unexpected {} to associate request", other.kind())));
                }
            }
        }
        Ok(None)
    }

    /// A checkid_setup request for `provider`, using a shared association
    /// when one is stored. Identifiers default to identifier select on 2.0.
    pub fn create_request(&self, provider: &Url, version: ProtocolVersion, return_to: Url) -> CheckIdRequest {
        let mut request = CheckIdRequest::new(provider.clone(), version, false);
        request.return_to = Some(MessageUri::from(return_to));
        if version >= ProtocolVersion::V2_0 {
            request.claimed_id = Some(IDENTIFIER_SELECT.to_string());
            request.local_identifier = Some(IDENTIFIER_SELECT.to_string());
        }
        request.assoc_handle = self
            .associations
            .best_association(provider, self.channel.settings().maximum_message_lifetime())
            .map(|association| association.handle().to_string());
        request
    }

    /// The redirect (or form post) that carries `request` to the provider.
    pub fn redirect(&self, request: CheckIdRequest) -> Result<HttpResponse, ProtocolError> {
        self.channel.send(request.into())
    }

    /// Reads and verifies the provider's response arriving at return_to.
    ///
    /// Assertions signed with an association this party does not hold are
    /// confirmed with the provider through check_authentication first.
    #[instrument(skip_all, fields(path = %request.url.path()))]
    pub async fn receive_assertion_async(
        &self,
        request: &HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<OpenIdMessage>, ProtocolError> {
        let Some(mut message) = self.channel.read_message(request)? else {
            return Ok(None);
        };
        match self.channel.process_incoming(&mut message, Some(request)) {
            Ok(()) => {}
            Err(ProtocolError::DirectVerificationRequired { handle }) => {
                debug!(handle = %handle, "verifying assertion with the provider");
                let OpenIdMessage::PositiveAssertion(assertion) = &mut message else {
                    return Err(ProtocolError::violation("only positive assertions are verified directly"));
                };
                self.verify_with_provider(request, assertion, cancel).await?;
                self.channel.process_incoming(&mut message, Some(request))?;
            }
            Err(other) => return Err(other),
        }
        if let OpenIdMessage::PositiveAssertion(assertion) = &message {
            ensure_return_to_matches(assertion, request)?;
        }
        Ok(Some(message))
    }

    async fn verify_with_provider(
        &self,
        request: &HttpRequest,
        assertion: &mut PositiveAssertion,
        cancel: &CancellationToken,
    ) -> Result<(), ProtocolError> {
        if assertion.version() < ProtocolVersion::V2_0 {
            let trusted = assertion.return_to.as_ref().is_some_and(|uri| self.return_to.verify(uri.url()));
            if !trusted {
                return Err(ProtocolError::InvalidSignature(
                    "1.x assertion cannot be verified without a signed return_to".to_string(),
                ));
            }
        }
        let provider = assertion
            .provider_endpoint()
            .ok_or_else(|| ProtocolError::violation("assertion does not name its provider endpoint"))?;
        let fields = Channel::<OpenIdMessage>::read_fields(request)?;
        let check = CheckAuthenticationRequest::from_assertion_fields(
            provider.clone(),
            assertion.version(),
            &fields,
            self.channel.descriptions(),
        )?;

        let response = match self.channel.request_async(check.into(), cancel).await? {
            OpenIdMessage::CheckAuthenticationResponse(response) => response,
            OpenIdMessage::DirectErrorResponse(response) => {
                return Err(ProtocolError::violation(format!("check_authentication failed: {}", response.error)));
            }
            other => {
                return Err(ProtocolError::violation(format!("unexpected {} to check_authentication", other.kind())));
            }
        };
        if let Some(handle) = &response.invalidate_handle {
            if self.associations.remove_association(&provider, handle) {
                info!(handle = %handle, "provider invalidated association");
            }
        }
        if !response.is_valid {
            error!(handle = %assertion.assoc_handle, "provider rejected the assertion signature");
            return Err(ProtocolError::InvalidSignature("provider rejected the assertion signature".to_string()));
        }
        assertion.signature_verified = true;
        Ok(())
    }
}

/// The assertion must arrive at the URL it names, with every return_to
/// argument intact.
fn ensure_return_to_matches(assertion: &PositiveAssertion, request: &HttpRequest) -> Result<(), ProtocolError> {
    let return_to = assertion
        .return_to
        .as_ref()
        .ok_or_else(|| ProtocolError::violation("assertion has no return_to"))?
        .url();
    let received = &request.url;
    let same_endpoint = return_to.scheme() == received.scheme()
        && return_to.host_str().map(str::to_ascii_lowercase) == received.host_str().map(str::to_ascii_lowercase)
        && return_to.port_or_known_default() == received.port_or_known_default()
        && return_to.path() == received.path();
    if !same_endpoint {
        return Err(ProtocolError::violation(format!(
            "assertion for {} arrived at {}",
            return_to.path(),
            received.path()
        )));
    }
    let arrived: Vec<(String, String)> = received.query_pairs().into_owned().collect();
    for (key, value) in return_to.query_pairs() {
        if !arrived.iter().any(|(k, v)| *k == key && *v == value) {
            return Err(ProtocolError::violation(format!("return_to argument {} was altered or dropped", key)));
        }
    }
    Ok(())
}
