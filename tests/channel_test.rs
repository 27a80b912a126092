use std::collections::BTreeMap;
use std::sync::Arc;

use openauth::MessagingSettings;
use openauth::messaging::{
    Channel, ChannelBindingElement, HttpRequest, KeyValueFormConformanceLevel, KeyValueFormEncoding,
    MessageDescriptions, ProtocolError, SystemClock, SystemRandomSource,
};
use openauth::oauth2::elements::{
    ClientAuthenticationBindingElement, MessageValidationBindingElement, TokenCodeSerializationBindingElement,
};
use openauth::oauth2::{
    AggregatingClientAuthentication, AuthorizationServerHost, BagServices, InMemoryAuthorizationServerHost,
    OAuth2Message, OAuth2MessageFactory,
};
use openauth::openid::{OpenIdHost, Provider};
use url::Url;

fn oauth2_elements() -> Vec<Arc<dyn ChannelBindingElement<OAuth2Message>>> {
    let settings = MessagingSettings::default();
    let host: Arc<dyn AuthorizationServerHost> = Arc::new(InMemoryAuthorizationServerHost::new(&settings));
    let services = BagServices {
        clock: Arc::new(SystemClock),
        random: Arc::new(SystemRandomSource::new()),
        descriptions: Arc::new(MessageDescriptions::new()),
    };
    vec![
        Arc::new(ClientAuthenticationBindingElement::new(host.clone(), AggregatingClientAuthentication::default())),
        Arc::new(TokenCodeSerializationBindingElement::new(host.clone(), settings, services)),
        Arc::new(MessageValidationBindingElement::new(host)),
    ]
}

#[test]
fn validation_must_run_after_its_prerequisites() {
    let mut builder = Channel::<OAuth2Message>::builder(Arc::new(OAuth2MessageFactory));
    for element in oauth2_elements() {
        builder = builder.element(element);
    }
    let err = builder.build().err().expect("misordered channel is refused");
    assert!(matches!(err, ProtocolError::Host(_)), "got {err:?}");

    let mut builder = Channel::<OAuth2Message>::builder(Arc::new(OAuth2MessageFactory));
    for element in oauth2_elements().into_iter().rev() {
        builder = builder.element(element);
    }
    let channel = builder.build().unwrap();
    assert_eq!(
        channel.element_names(),
        ["oauth2.message_validation", "oauth2.token_code_serialization", "oauth2.client_authentication"]
    );
}

#[test]
fn settings_load_from_json_with_defaults() {
    let settings = MessagingSettings::from_json_str(
        r#"{ "access_token_lifetime_secs": 120, "kvf_conformance": "loose", "refresh_token_lifetime_secs": 86400 }"#,
    )
    .unwrap();
    assert_eq!(settings.access_token_lifetime().num_seconds(), 120);
    assert_eq!(settings.refresh_token_lifetime().map(|t| t.num_days()), Some(1));
    assert_eq!(settings.kvf_conformance, KeyValueFormConformanceLevel::Loose);
    assert_eq!(settings.authorization_code_lifetime(), MessagingSettings::default().authorization_code_lifetime());
}

#[test]
fn provider_answers_garbage_with_a_kvf_error() {
    let endpoint = Url::parse("https://op.example/server").unwrap();
    let provider = Provider::new(OpenIdHost::in_memory(MessagingSettings::default()), endpoint.clone()).unwrap();

    let fields: BTreeMap<String, String> = [
        ("openid.ns".to_string(), "http://specs.openid.net/auth/2.0".to_string()),
        ("openid.mode".to_string(), "associate".to_string()),
    ]
    .into_iter()
    .collect();
    let response = provider.handle_direct(&HttpRequest::post_form(endpoint, &fields));
    assert_eq!(response.status, 400);

    let body = KeyValueFormEncoding::default().decode(&response.body).unwrap();
    assert_eq!(body.get("ns").map(String::as_str), Some("http://specs.openid.net/auth/2.0"));
    assert!(body.contains_key("error"));
}
