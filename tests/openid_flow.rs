use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use openauth::MessagingSettings;
use openauth::messaging::{
    Clock, FixedClock, HttpRequest, HttpResponse, InMemoryHttpTransport, Message, ProtocolError, ProtocolVersion,
    SystemClock,
};
use openauth::openid::nonce::RETURN_TO_NONCE_KEY;
use openauth::openid::{OpenIdHost, OpenIdMessage, Provider, RelyingParty};
use tokio_util::sync::CancellationToken;
use url::Url;

fn provider_endpoint() -> Url {
    Url::parse("https://op.example/server").unwrap()
}

fn return_to() -> Url {
    Url::parse("https://rp.example/login/return?session=42").unwrap()
}

fn settings() -> MessagingSettings {
    MessagingSettings::default().with_maximum_indirect_url_length(16 * 1024)
}

const ALICE: &str = "https://op.example/user/alice";

/// A provider reachable through an in-memory transport and a relying party
/// that talks to it.
fn parties() -> (Arc<Provider>, RelyingParty, InMemoryHttpTransport) {
    parties_with_clock(Arc::new(SystemClock))
}

fn parties_with_clock(clock: Arc<dyn Clock>) -> (Arc<Provider>, RelyingParty, InMemoryHttpTransport) {
    let provider = Arc::new(Provider::new(OpenIdHost::in_memory(settings()), provider_endpoint()).unwrap());
    let transport = InMemoryHttpTransport::new();
    let answering = provider.clone();
    transport.insert_handler(&provider_endpoint(), move |request| answering.handle_direct(request));
    let host = OpenIdHost::in_memory_with_clock(settings(), clock).with_transport(Arc::new(transport.clone()));
    (provider, RelyingParty::in_memory(host).unwrap(), transport)
}

fn follow(response: &HttpResponse) -> HttpRequest {
    assert_eq!(response.status, 302, "expected a redirect, got {:?}", response.body_text());
    let location = response.header("Location").expect("redirect has a Location");
    HttpRequest::get(Url::parse(location).unwrap())
}

/// Runs the user agent round trip and returns the request arriving at return_to.
fn authenticate(provider: &Provider, relying_party: &RelyingParty) -> HttpRequest {
    authenticate_at(provider, relying_party, ProtocolVersion::V2_0)
}

fn authenticate_at(provider: &Provider, relying_party: &RelyingParty, version: ProtocolVersion) -> HttpRequest {
    let mut request = relying_party.create_request(&provider_endpoint(), version, return_to());
    if version < ProtocolVersion::V2_0 {
        request.claimed_id = Some(ALICE.to_string());
        request.local_identifier = Some(ALICE.to_string());
    }
    let to_provider = follow(&relying_party.redirect(request).unwrap());

    let Some(OpenIdMessage::CheckIdRequest(checkid)) = provider.receive(&to_provider).unwrap() else {
        panic!("provider did not read a checkid request");
    };
    let assertion = provider.positive_assertion(&checkid, ALICE, ALICE).unwrap();
    follow(&provider.send(assertion).unwrap())
}

#[tokio::test]
async fn smart_mode_verifies_with_shared_association() {
    let (provider, relying_party, transport) = parties();
    let cancel = CancellationToken::new();
    let association = relying_party
        .associate_async(&provider_endpoint(), ProtocolVersion::V2_0, &cancel)
        .await
        .unwrap()
        .expect("provider grants an association");
    assert_eq!(transport.sent().len(), 1);

    let at_return_to = authenticate(&provider, &relying_party);
    let message = relying_party.receive_assertion_async(&at_return_to, &cancel).await.unwrap();
    let Some(OpenIdMessage::PositiveAssertion(assertion)) = message else {
        panic!("expected a positive assertion");
    };
    assert_eq!(assertion.assoc_handle, association.handle());
    assert_eq!(assertion.claimed_id.as_deref(), Some(ALICE));
    assert!(assertion.return_to_signature_verified);
    // No check_authentication round trip was needed.
    assert_eq!(transport.sent().len(), 1);
}

#[tokio::test]
async fn dumb_mode_asks_the_provider() {
    let (provider, relying_party, transport) = parties();
    let cancel = CancellationToken::new();

    let at_return_to = authenticate(&provider, &relying_party);
    let message = relying_party.receive_assertion_async(&at_return_to, &cancel).await.unwrap();
    assert!(matches!(message, Some(OpenIdMessage::PositiveAssertion(_))));

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    let fields = openauth::messaging::Channel::<OpenIdMessage>::read_fields(&sent[0]).unwrap();
    assert_eq!(fields.get("openid.mode").map(String::as_str), Some("check_authentication"));
}

#[tokio::test]
async fn tampered_assertion_is_rejected() {
    let (provider, relying_party, _) = parties();
    let cancel = CancellationToken::new();
    relying_party
        .associate_async(&provider_endpoint(), ProtocolVersion::V2_0, &cancel)
        .await
        .unwrap();

    let mut at_return_to = authenticate(&provider, &relying_party);
    let pairs: Vec<(String, String)> = at_return_to
        .url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == "openid.claimed_id" { "https://op.example/user/mallory".into() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();
    at_return_to.url.query_pairs_mut().clear().extend_pairs(pairs);

    let err = relying_party.receive_assertion_async(&at_return_to, &cancel).await.unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidSignature(_)), "got {err:?}");
}

#[tokio::test]
async fn replayed_assertion_is_rejected() {
    let (provider, relying_party, _) = parties();
    let cancel = CancellationToken::new();
    relying_party
        .associate_async(&provider_endpoint(), ProtocolVersion::V2_0, &cancel)
        .await
        .unwrap();

    let at_return_to = authenticate(&provider, &relying_party);
    relying_party.receive_assertion_async(&at_return_to, &cancel).await.unwrap();
    let err = relying_party.receive_assertion_async(&at_return_to, &cancel).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Replayed(_)), "got {err:?}");
}

#[tokio::test]
async fn replayed_v1_assertion_is_rejected() {
    let (provider, relying_party, _) = parties();
    let cancel = CancellationToken::new();
    relying_party
        .associate_async(&provider_endpoint(), ProtocolVersion::V1_1, &cancel)
        .await
        .unwrap()
        .expect("provider grants an association");

    let at_return_to = authenticate_at(&provider, &relying_party, ProtocolVersion::V1_1);
    assert!(at_return_to.url.query_pairs().any(|(k, _)| k == RETURN_TO_NONCE_KEY));

    let first = relying_party.receive_assertion_async(&at_return_to, &cancel).await.unwrap();
    let Some(OpenIdMessage::PositiveAssertion(assertion)) = first else {
        panic!("expected a positive assertion");
    };
    assert_eq!(assertion.version(), ProtocolVersion::V1_1);
    assert!(assertion.return_to_signature_verified);

    let err = relying_party.receive_assertion_async(&at_return_to, &cancel).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Replayed(_)), "got {err:?}");
}

#[tokio::test]
async fn stale_v1_assertion_is_rejected() {
    let clock = Arc::new(FixedClock::new(Utc::now()));
    let (provider, relying_party, _) = parties_with_clock(clock.clone());
    let cancel = CancellationToken::new();
    relying_party
        .associate_async(&provider_endpoint(), ProtocolVersion::V1_1, &cancel)
        .await
        .unwrap();

    let at_return_to = authenticate_at(&provider, &relying_party, ProtocolVersion::V1_1);
    clock.advance(TimeDelta::minutes(14));
    let err = relying_party.receive_assertion_async(&at_return_to, &cancel).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Expired(_)), "got {err:?}");
}

#[tokio::test]
async fn v1_dumb_mode_still_redeems_the_request_nonce() {
    let (provider, relying_party, transport) = parties();
    let cancel = CancellationToken::new();

    let at_return_to = authenticate_at(&provider, &relying_party, ProtocolVersion::V1_1);
    relying_party.receive_assertion_async(&at_return_to, &cancel).await.unwrap();
    assert_eq!(transport.sent().len(), 1);

    let err = relying_party.receive_assertion_async(&at_return_to, &cancel).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Replayed(_)), "got {err:?}");
}

#[tokio::test]
async fn cancelled_association_stops_waiting() {
    let (_, relying_party, _) = parties();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = relying_party
        .associate_async(&provider_endpoint(), ProtocolVersion::V2_0, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Cancelled));
}
