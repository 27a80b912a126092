use std::collections::BTreeMap;

use tracing::{debug, warn};
use url::Url;

use super::messages::{
    AssociateRequest, AssociateSuccessfulResponse, AssociateUnsuccessfulResponse, CheckAuthenticationRequest,
    CheckAuthenticationResponse, CheckIdRequest, DirectErrorResponse, IndirectErrorResponse, NegativeAssertion,
    OpenIdMessage, PositiveAssertion, version_for_namespace,
};
use crate::messaging::{Message, MessageDescriptions, MessageFactory, ProtocolError, ProtocolVersion};

/// Picks the OpenID message type from `openid.mode` and the namespace.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenIdMessageFactory;

impl MessageFactory<OpenIdMessage> for OpenIdMessageFactory {
    fn new_request_message(
        &self,
        recipient: &Url,
        fields: &BTreeMap<String, String>,
        descriptions: &MessageDescriptions,
    ) -> Result<Option<OpenIdMessage>, ProtocolError> {
        let Some(mode) = fields.get("openid.mode") else {
            return Ok(None);
        };
        let Some(version) = version_for_namespace(fields.get("openid.ns").map(String::as_str)) else {
            warn!(ns = ?fields.get("openid.ns"), "unrecognized OpenID namespace");
            return Ok(None);
        };

        let message: OpenIdMessage = match mode.as_str() {
            "associate" => {
                let mut request: AssociateRequest = descriptions.deserialize(version, fields)?;
                request.recipient = Some(recipient.clone());
                request.into()
            }
            "checkid_setup" | "checkid_immediate" => {
                let mut request: CheckIdRequest = descriptions.deserialize(version, fields)?;
                request.recipient = Some(recipient.clone());
                request.into()
            }
            "check_authentication" => {
                let mut request: CheckAuthenticationRequest = descriptions.deserialize(version, fields)?;
                request.recipient = Some(recipient.clone());
                request.into()
            }
            "id_res"
                if version < ProtocolVersion::V2_0
                    && descriptions.probe::<NegativeAssertion>(version, fields)
                    && fields.contains_key("openid.user_setup_url") =>
            {
                let mut negative: NegativeAssertion = descriptions.deserialize(version, fields)?;
                negative.return_to = Some(recipient.clone());
                negative.into()
            }
            "id_res" => descriptions.deserialize::<PositiveAssertion>(version, fields)?.into(),
            "cancel" | "setup_needed" => {
                let mut negative: NegativeAssertion = descriptions.deserialize(version, fields)?;
                negative.return_to = Some(recipient.clone());
                negative.into()
            }
            "error" => {
                let mut error: IndirectErrorResponse = descriptions.deserialize(version, fields)?;
                error.recipient = Some(recipient.clone());
                error.into()
            }
            other => {
                debug!(mode = other, "unknown openid.mode");
                return Ok(None);
            }
        };
        Ok(Some(message))
    }

    fn new_response_message(
        &self,
        request: &OpenIdMessage,
        fields: &BTreeMap<String, String>,
        descriptions: &MessageDescriptions,
    ) -> Result<Option<OpenIdMessage>, ProtocolError> {
        let version = version_for_namespace(fields.get("ns").map(String::as_str))
            .ok_or_else(|| ProtocolError::violation("direct response has an unrecognized namespace"))?;
        if version != request.version() {
            debug!(request = %request.version(), response = %version, "provider answered in another version");
        }
        let is_error = fields.contains_key("error");

        let message: OpenIdMessage = match request {
            OpenIdMessage::AssociateRequest(_) if is_error => {
                if descriptions.probe::<AssociateUnsuccessfulResponse>(version, fields) {
                    descriptions.deserialize::<AssociateUnsuccessfulResponse>(version, fields)?.into()
                } else {
                    descriptions.deserialize::<DirectErrorResponse>(version, fields)?.into()
                }
            }
            OpenIdMessage::AssociateRequest(_) => {
                descriptions.deserialize::<AssociateSuccessfulResponse>(version, fields)?.into()
            }
            OpenIdMessage::CheckAuthenticationRequest(_) if is_error => {
                descriptions.deserialize::<DirectErrorResponse>(version, fields)?.into()
            }
            OpenIdMessage::CheckAuthenticationRequest(_) => {
                descriptions.deserialize::<CheckAuthenticationResponse>(version, fields)?.into()
            }
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openid::OPENID_2_0_NAMESPACE;

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn mode_selects_message_type() {
        let descriptions = MessageDescriptions::new();
        let recipient = Url::parse("https://op.example/server").unwrap();
        let message = OpenIdMessageFactory
            .new_request_message(
                &recipient,
                &fields(&[
                    ("openid.ns", OPENID_2_0_NAMESPACE),
                    ("openid.mode", "associate"),
                    ("openid.assoc_type", "HMAC-SHA256"),
                    ("openid.session_type", "no-encryption"),
                ]),
                &descriptions,
            )
            .unwrap()
            .unwrap();
        assert!(matches!(message, OpenIdMessage::AssociateRequest(ref r) if r.recipient.as_ref() == Some(&recipient)));

        let none = OpenIdMessageFactory
            .new_request_message(&recipient, &fields(&[("openid.mode", "bogus")]), &descriptions)
            .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn v1_immediate_failure_is_negative() {
        let descriptions = MessageDescriptions::new();
        let recipient = Url::parse("https://rp.example/return").unwrap();
        let message = OpenIdMessageFactory
            .new_request_message(
                &recipient,
                &fields(&[("openid.mode", "id_res"), ("openid.user_setup_url", "https://op.example/setup")]),
                &descriptions,
            )
            .unwrap()
            .unwrap();
        assert!(matches!(message, OpenIdMessage::NegativeAssertion(_)));
    }

    #[test]
    fn associate_error_with_code_is_unsuccessful_response() {
        let descriptions = MessageDescriptions::new();
        let request = OpenIdMessage::from(AssociateRequest::new(
            Url::parse("https://op.example/server").unwrap(),
            ProtocolVersion::V2_0,
            "HMAC-SHA256",
        ));
        let response = OpenIdMessageFactory
            .new_response_message(
                &request,
                &fields(&[
                    ("ns", OPENID_2_0_NAMESPACE),
                    ("error", "unsupported"),
                    ("error_code", "unsupported-type"),
                    ("assoc_type", "HMAC-SHA1"),
                ]),
                &descriptions,
            )
            .unwrap()
            .unwrap();
        assert!(matches!(response, OpenIdMessage::AssociateUnsuccessfulResponse(_)));

        let plain = OpenIdMessageFactory
            .new_response_message(&request, &fields(&[("ns", OPENID_2_0_NAMESPACE), ("error", "boom")]), &descriptions)
            .unwrap()
            .unwrap();
        assert!(matches!(plain, OpenIdMessage::DirectErrorResponse(_)));
    }
}
