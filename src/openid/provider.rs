use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};
use url::Url;

use super::association::{AssociationType, ProviderAssociationStore};
use super::extensions::ExtensionsBindingElement;
use super::factory::OpenIdMessageFactory;
use super::messages::{
    AssociateRequest, AssociateSuccessfulResponse, AssociateUnsuccessfulResponse, CheckAuthenticationRequest,
    CheckAuthenticationResponse, CheckIdRequest, DirectErrorResponse, IndirectErrorResponse, NegativeAssertion,
    OpenIdMessage, PositiveAssertion, version_for_namespace,
};
use super::nonce::provider_response_nonce;
use super::signing::ProviderSigningBindingElement;
use super::{NO_ENCRYPTION, OpenIdHost};
use crate::messaging::http::CONTENT_TYPE_KVF;
use crate::messaging::message::MessageBase;
use crate::messaging::{
    Channel, DirectEncoding, HttpRequest, HttpResponse, Message, MessageUri, ProtocolError, ProtocolMessage,
    ProtocolVersion,
};

/// The provider side: grants associations, answers check_authentication and
/// issues signed assertions.
pub struct Provider {
    channel: Channel<OpenIdMessage>,
    associations: Arc<ProviderAssociationStore>,
    endpoint: Url,
}

impl Provider {
    pub fn new(host: OpenIdHost, endpoint: Url) -> Result<Self, ProtocolError> {
        let associations = Arc::new(ProviderAssociationStore::new(
            host.key_store.clone(),
            &host.settings,
            host.clock.clone(),
            host.random.clone(),
            host.descriptions.clone(),
        ));
        let mut builder = Channel::<OpenIdMessage>::builder(Arc::new(OpenIdMessageFactory))
            .element(Arc::new(ExtensionsBindingElement::new()))
            .element(Arc::new(provider_response_nonce(host.nonce_store.clone())))
            .element(Arc::new(ProviderSigningBindingElement::new(associations.clone())))
            .settings(host.settings)
            .descriptions(host.descriptions)
            .clock(host.clock)
            .random(host.random)
            .direct_encoding(DirectEncoding::KeyValueForm);
        if let Some(transport) = host.transport {
            builder = builder.transport(transport);
        }
        Ok(Self { channel: builder.build()?, associations, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn channel(&self) -> &Channel<OpenIdMessage> {
        &self.channel
    }

    pub fn associations(&self) -> &Arc<ProviderAssociationStore> {
        &self.associations
    }

    /// Reads an indirect request relayed by the user agent.
    pub fn receive(&self, request: &HttpRequest) -> Result<Option<OpenIdMessage>, ProtocolError> {
        self.channel.receive(request)
    }

    /// Answers a direct request (associate or check_authentication) from a
    /// relying party. Failures become a Key-Value Form error body.
    #[instrument(skip_all, fields(path = %request.url.path()))]
    pub fn handle_direct(&self, request: &HttpRequest) -> HttpResponse {
        let version = Channel::<OpenIdMessage>::read_fields(request)
            .ok()
            .and_then(|fields| version_for_namespace(fields.get("openid.ns").map(String::as_str)))
            .unwrap_or(ProtocolVersion::V2_0);

        let answer = self.channel.receive_required(request).and_then(|message| match message {
            OpenIdMessage::AssociateRequest(associate) => self.associate(&associate),
            OpenIdMessage::CheckAuthenticationRequest(check) => Ok(self.check_authentication(&check).into()),
            other => Err(ProtocolError::violation(format!("{} is not a direct request", other.kind()))),
        });
        let answer = answer.unwrap_or_else(|e| {
            warn!(error = %e, kind = ?e.kind(), "direct request failed");
            DirectErrorResponse::new(version, e.to_string()).into()
        });
        self.channel.send(answer).unwrap_or_else(|e| {
            error!(error = %e, "cannot encode direct response");
            HttpResponse::new(500, CONTENT_TYPE_KVF, b"error:internal error\n".to_vec())
        })
    }

    /// A shared association of the requested type, or a refusal naming the
    /// type this provider prefers.
    pub fn associate(&self, request: &AssociateRequest) -> Result<OpenIdMessage, ProtocolError> {
        let version = request.version();
        let requested = AssociationType::parse(&request.association_type).filter(|t| t.supported_by(version));
        let session_type = request.effective_session_type();
        match requested {
            Some(association_type) if session_type == NO_ENCRYPTION => {
                let association = self.associations.create(
                    association_type,
                    self.channel.settings().shared_association_lifetime(),
                    false,
                )?;
                info!(kind = association_type.as_str(), "granted shared association");
                Ok(AssociateSuccessfulResponse {
                    base: MessageBase::new(version),
                    assoc_handle: association.handle().to_string(),
                    association_type: association_type.as_str().to_string(),
                    session_type: Some(NO_ENCRYPTION.to_string()),
                    expires_in: association.seconds_remaining(self.channel.clock().now()),
                    mac_key: association.secret().to_vec(),
                }
                .into())
            }
            _ => {
                debug!(
                    assoc_type = %request.association_type,
                    session_type,
                    "declining unsupported association request"
                );
                Ok(AssociateUnsuccessfulResponse {
                    base: MessageBase::new(version),
                    error: format!(
                        "unsupported association {} with session {}",
                        request.association_type, session_type
                    ),
                    association_type: Some(AssociationType::preferred_for(version).as_str().to_string()),
                    session_type: Some(NO_ENCRYPTION.to_string()),
                }
                .into())
            }
        }
    }

    /// The verdict on a check_authentication request the signing element
    /// has already examined.
    pub fn check_authentication(&self, request: &CheckAuthenticationRequest) -> CheckAuthenticationResponse {
        CheckAuthenticationResponse {
            base: MessageBase::new(request.version()),
            is_valid: request.signature_valid,
            invalidate_handle: request.invalidate_handle.clone(),
        }
    }

    /// An assertion answering `request`. For identifier select requests the
    /// caller supplies the identifiers chosen for the user.
    pub fn positive_assertion(
        &self,
        request: &CheckIdRequest,
        claimed_id: &str,
        local_identifier: &str,
    ) -> Result<PositiveAssertion, ProtocolError> {
        let return_to = request
            .return_to
            .clone()
            .ok_or_else(|| ProtocolError::violation("checkid request has no return_to to answer"))?;
        let mut assertion = PositiveAssertion::new(request.version(), self.endpoint.clone(), return_to);
        if request.version() >= ProtocolVersion::V2_0 {
            assertion.claimed_id = Some(claimed_id.to_string());
        }
        assertion.local_identifier = Some(local_identifier.to_string());
        assertion.assoc_handle = request.assoc_handle.clone().unwrap_or_default();
        Ok(assertion)
    }

    pub fn negative_assertion(&self, request: &CheckIdRequest) -> Result<NegativeAssertion, ProtocolError> {
        let return_to = request
            .return_to
            .as_ref()
            .ok_or_else(|| ProtocolError::violation("checkid request has no return_to to answer"))?;
        let mut negative = NegativeAssertion::new(request.version(), return_to.url().clone(), request.immediate);
        if request.version() < ProtocolVersion::V2_0 && request.immediate {
            negative.user_setup_url = Some(MessageUri::from(self.endpoint.clone()));
        }
        Ok(negative)
    }

    pub fn error_response(&self, request: &CheckIdRequest, error: &str) -> Option<IndirectErrorResponse> {
        let return_to = request.return_to.as_ref()?;
        Some(IndirectErrorResponse::new(request.version(), return_to.url().clone(), error))
    }

    /// Signs (for assertions) and renders an indirect response.
    pub fn send(&self, message: impl Into<OpenIdMessage>) -> Result<HttpResponse, ProtocolError> {
        self.channel.send(message.into())
    }
}
