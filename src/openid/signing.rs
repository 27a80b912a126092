//! Association signatures over `openid.signed` parameters.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{debug, error, warn};

use super::association::{Association, AssociationType, ProviderAssociationStore, RelyingPartyAssociationStore};
use super::messages::{OpenIdMessage, PositiveAssertion};
use crate::messaging::{
    ChannelBindingElement, ChannelContext, DescribedMessage, KeyValueFormEncoding, Message, MessageDescriptions,
    MessageDictionary, ProtocolError, Protections,
};

/// Name both signing elements register under.
pub const SIGNING_ELEMENT: &str = "Signing";

const PREFIX: &str = "openid.";

/// The Key-Value Form of the signed parameters, in `names` order, with the
/// `openid.` prefix dropped from each key. `mode_override` replaces the
/// value of `mode`, for verifying a check_authentication copy of an assertion.
pub fn signature_base<M: DescribedMessage>(
    message: &mut M,
    names: &[&str],
    descriptions: &MessageDescriptions,
    mode_override: Option<&str>,
) -> Result<Vec<u8>, ProtocolError> {
    let dictionary = MessageDictionary::new(message, descriptions)?;
    let mut pairs = Vec::with_capacity(names.len());
    for name in names {
        let value = match (*name, mode_override) {
            ("mode", Some(mode)) => Some(mode.to_string()),
            _ => dictionary.get_original(&format!("{}{}", PREFIX, name))?,
        };
        let value =
            value.ok_or_else(|| ProtocolError::violation(format!("signed parameter {}{} is missing", PREFIX, name)))?;
        pairs.push((*name, value));
    }
    Ok(KeyValueFormEncoding::default().encode(pairs)?)
}

/// Parameters a provider signs: every protected part holding a value, then
/// extension and other `openid.` extra data.
fn names_to_sign(assertion: &PositiveAssertion, descriptions: &MessageDescriptions) -> Result<Vec<String>, ProtocolError> {
    let description = descriptions.get::<PositiveAssertion>(assertion.version())?;
    let mut names = Vec::new();
    for part in description.parts() {
        if !part.required_protection().contains(Protections::TAMPER_PROTECTION) {
            continue;
        }
        let value = part.get_value(assertion).map_err(|source| ProtocolError::Format {
            message: description.message_type(),
            part: part.name().to_string(),
            source,
        })?;
        if value.is_some() {
            if let Some(name) = part.name().strip_prefix(PREFIX) {
                names.push(name.to_string());
            }
        }
    }
    for key in assertion.extra_data().keys() {
        if let Some(name) = key.strip_prefix(PREFIX) {
            if name != "sig" && name != "signed" && !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

/// Fails unless every protected part that carries a meaningful value is
/// listed in `openid.signed`.
fn ensure_protected_parts_signed(
    assertion: &PositiveAssertion,
    descriptions: &MessageDescriptions,
) -> Result<(), ProtocolError> {
    let description = descriptions.get::<PositiveAssertion>(assertion.version())?;
    let signed = assertion.signed_names();
    for part in description.parts() {
        if !part.required_protection().contains(Protections::TAMPER_PROTECTION) {
            continue;
        }
        let present = matches!(part.get_value(assertion), Ok(Some(_)));
        if !present || !(part.is_required() || !part.holds_default(assertion)) {
            continue;
        }
        let name = part.name().strip_prefix(PREFIX).unwrap_or(part.name());
        if !signed.contains(&name) {
            error!(part = part.name(), "protected parameter is not covered by the signature");
            return Err(ProtocolError::InvalidSignature(format!("{} must be signed", part.name())));
        }
    }
    Ok(())
}

/// Signs positive assertions and verifies check_authentication requests.
pub struct ProviderSigningBindingElement {
    associations: Arc<ProviderAssociationStore>,
}

impl ProviderSigningBindingElement {
    pub fn new(associations: Arc<ProviderAssociationStore>) -> Self {
        Self { associations }
    }

    /// The association to sign with. An unknown requested handle is echoed
    /// back in `openid.invalidate_handle` and a private association is used
    /// instead. Re-signing with a private handle reuses it.
    fn signing_association(
        &self,
        assertion: &mut PositiveAssertion,
        context: &ChannelContext<'_>,
    ) -> Result<Association, ProtocolError> {
        let requested = assertion.assoc_handle.clone();
        if !requested.is_empty() {
            if let Some(shared) = self.associations.recover(&requested, false) {
                return Ok(shared);
            }
            if !assertion.sig.is_empty() {
                if let Some(private) = self.associations.recover(&requested, true) {
                    return Ok(private);
                }
            }
            warn!(handle = %requested, "relying party named an unknown or expired association");
            assertion.invalidate_handle = Some(requested);
        }
        self.associations.create(
            AssociationType::preferred_for(assertion.version()),
            context.settings.private_association_lifetime(),
            true,
        )
    }
}

impl ChannelBindingElement<OpenIdMessage> for ProviderSigningBindingElement {
    fn name(&self) -> &'static str {
        SIGNING_ELEMENT
    }

    fn protection(&self) -> Protections {
        Protections::TAMPER_PROTECTION
    }

    fn process_outgoing(
        &self,
        message: &mut OpenIdMessage,
        context: &ChannelContext<'_>,
    ) -> Result<Option<Protections>, ProtocolError> {
        let OpenIdMessage::PositiveAssertion(assertion) = message else {
            return Ok(None);
        };
        let association = self.signing_association(assertion, context)?;
        assertion.assoc_handle = association.handle().to_string();

        let names = names_to_sign(assertion, context.descriptions)?;
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        assertion.signed = names.join(",");
        let base = signature_base(assertion, &names, context.descriptions, None)?;
        assertion.sig = BASE64.encode(association.sign(&base));
        debug!(private = association.is_private(), signed = %assertion.signed, "signed positive assertion");
        Ok(Some(self.protection()))
    }

    fn process_incoming(
        &self,
        message: &mut OpenIdMessage,
        context: &ChannelContext<'_>,
    ) -> Result<Option<Protections>, ProtocolError> {
        let OpenIdMessage::CheckAuthenticationRequest(request) = message else {
            return Ok(None);
        };
        if let Some(handle) = request.invalidate_handle.take() {
            if self.associations.recover(&handle, false).is_none() {
                request.invalidate_handle = Some(handle);
            }
        }

        let Some(association) = self.associations.recover(&request.assoc_handle, true) else {
            warn!(handle = %request.assoc_handle, "check_authentication names an unknown private association");
            request.signature_valid = false;
            return Ok(None);
        };
        let signed = request.signed.clone();
        let names: Vec<&str> = signed.split(',').filter(|name| !name.is_empty()).collect();
        let base = signature_base(request, &names, context.descriptions, Some("id_res"))?;
        let valid = BASE64
            .decode(&request.sig)
            .map(|sig| association.verify(&base, &sig))
            .unwrap_or(false);
        request.signature_valid = valid;
        if valid {
            debug!("check_authentication signature verified");
            Ok(Some(self.protection()))
        } else {
            error!(handle = %request.assoc_handle, "check_authentication signature mismatch");
            Ok(None)
        }
    }
}

/// Verifies positive assertions against shared associations.
///
/// Without a usable shared association the element fails with
/// [`ProtocolError::DirectVerificationRequired`], and the relying party asks
/// the provider instead.
pub struct RelyingPartySigningBindingElement {
    associations: Arc<dyn RelyingPartyAssociationStore>,
}

impl RelyingPartySigningBindingElement {
    pub fn new(associations: Arc<dyn RelyingPartyAssociationStore>) -> Self {
        Self { associations }
    }
}

impl ChannelBindingElement<OpenIdMessage> for RelyingPartySigningBindingElement {
    fn name(&self) -> &'static str {
        SIGNING_ELEMENT
    }

    fn protection(&self) -> Protections {
        Protections::TAMPER_PROTECTION
    }

    fn process_outgoing(
        &self,
        _message: &mut OpenIdMessage,
        _context: &ChannelContext<'_>,
    ) -> Result<Option<Protections>, ProtocolError> {
        Ok(None)
    }

    fn process_incoming(
        &self,
        message: &mut OpenIdMessage,
        context: &ChannelContext<'_>,
    ) -> Result<Option<Protections>, ProtocolError> {
        let OpenIdMessage::PositiveAssertion(assertion) = message else {
            return Ok(None);
        };
        ensure_protected_parts_signed(assertion, context.descriptions)?;
        if assertion.signature_verified {
            debug!("assertion signature already confirmed by the provider");
            return Ok(Some(self.protection()));
        }

        let now = context.clock.now();
        let association = assertion
            .provider_endpoint()
            .and_then(|provider| self.associations.get_association(&provider, &assertion.assoc_handle))
            .filter(|association| !association.is_expired(now));
        let Some(association) = association else {
            return Err(ProtocolError::DirectVerificationRequired { handle: assertion.assoc_handle.clone() });
        };

        let signed = assertion.signed.clone();
        let names: Vec<&str> = signed.split(',').filter(|name| !name.is_empty()).collect();
        let base = signature_base(assertion, &names, context.descriptions, None)?;
        let sig = BASE64
            .decode(&assertion.sig)
            .map_err(|_| ProtocolError::InvalidSignature("openid.sig is not base64".to_string()))?;
        if !association.verify(&base, &sig) {
            error!(handle = %assertion.assoc_handle, "positive assertion signature mismatch");
            return Err(ProtocolError::InvalidSignature(format!(
                "signature does not match association {}",
                assertion.assoc_handle
            )));
        }
        debug!(handle = %assertion.assoc_handle, "positive assertion signature verified");
        Ok(Some(self.protection()))
    }
}
