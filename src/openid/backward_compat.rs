//! Carries values 1.x assertions lack (provider endpoint, claimed
//! identifier) through the return_to URL.

use tracing::{debug, warn};
use url::Url;

use super::messages::{OpenIdMessage, return_to_argument};
use super::return_to::RETURN_TO_SIGNATURE_ELEMENT;
use super::{CLAIMED_ID_KEY, PROVIDER_ENDPOINT_KEY};
use crate::messaging::{ChannelBindingElement, ChannelContext, MessageUri, ProtocolError, ProtocolVersion, Protections};

pub const BACKWARD_COMPATIBILITY_ELEMENT: &str = "BackwardCompatibility";

#[derive(Debug, Default)]
pub struct BackwardCompatibilityBindingElement;

impl BackwardCompatibilityBindingElement {
    pub fn new() -> Self {
        Self
    }
}

impl ChannelBindingElement<OpenIdMessage> for BackwardCompatibilityBindingElement {
    fn name(&self) -> &'static str {
        BACKWARD_COMPATIBILITY_ELEMENT
    }

    fn protection(&self) -> Protections {
        Protections::NONE
    }

    /// Tunneled values are only trusted once the return_to signature checked out.
    fn requires(&self) -> &'static [&'static str] {
        &[RETURN_TO_SIGNATURE_ELEMENT]
    }

    fn process_outgoing(
        &self,
        message: &mut OpenIdMessage,
        _context: &ChannelContext<'_>,
    ) -> Result<Option<Protections>, ProtocolError> {
        let OpenIdMessage::CheckIdRequest(request) = message else {
            return Ok(None);
        };
        if request.base.version >= ProtocolVersion::V2_0 {
            return Ok(None);
        }
        let (Some(return_to), Some(provider)) = (&request.return_to, &request.recipient) else {
            return Ok(None);
        };
        let mut tunneled = return_to.url().clone();
        {
            let mut pairs = tunneled.query_pairs_mut();
            pairs.append_pair(PROVIDER_ENDPOINT_KEY, provider.as_str());
            if let Some(claimed_id) = &request.claimed_id {
                pairs.append_pair(CLAIMED_ID_KEY, claimed_id);
            }
        }
        request.return_to = Some(MessageUri::from(tunneled));
        debug!("tunneled provider endpoint through return_to");
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
        if assertion.base.version >= ProtocolVersion::V2_0 {
            return Ok(None);
        }
        let Some(return_to) = assertion.return_to.as_ref().map(|uri| uri.url().clone()) else {
            return Ok(None);
        };
        let Some(endpoint) = return_to_argument(&return_to, PROVIDER_ENDPOINT_KEY) else {
            return Ok(None);
        };
        if !assertion.return_to_signature_verified {
            warn!("ignoring tunneled 1.x values without a valid return_to signature");
            return Ok(Some(Protections::NONE));
        }
        let endpoint = Url::parse(&endpoint)
            .map_err(|e| ProtocolError::violation(format!("tunneled provider endpoint is not a URL: {}", e)))?;
        assertion.op_endpoint = Some(endpoint.into());
        if let Some(claimed_id) = return_to_argument(&return_to, CLAIMED_ID_KEY) {
            assertion.claimed_id = Some(claimed_id);
        }
        Ok(Some(Protections::NONE))
    }
}
