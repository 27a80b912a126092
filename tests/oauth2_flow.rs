use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{TimeDelta, Utc};
use openauth::MessagingSettings;
use openauth::messaging::{
    Clock, FixedClock, HttpRequest, HttpResponse, MessageDescriptions, ProtocolError, SystemRandomSource,
};
use openauth::oauth2::{
    AccessTokenVerification, AuthorizationServer, AuthorizationServerHost, BagServices, Client,
    InMemoryAuthorizationServerHost, ResourceServer, StandardAccessTokenAnalyzer,
};
use serde_json::Value;
use url::Url;

const CLIENT_ID: &str = "photo-printer";
const CLIENT_SECRET: &str = "s3cret";

fn authorize_url() -> Url {
    Url::parse("https://as.example/authorize").unwrap()
}

fn token_url() -> Url {
    Url::parse("https://as.example/token").unwrap()
}

fn callback() -> Url {
    Url::parse("https://printer.example/cb").unwrap()
}

struct Fixture {
    clock: Arc<FixedClock>,
    host: InMemoryAuthorizationServerHost,
    server: Arc<AuthorizationServer>,
}

fn fixture() -> Fixture {
    let settings = MessagingSettings::default().with_access_token_lifetime(600);
    let clock = Arc::new(FixedClock::new(Utc::now()));
    let host = InMemoryAuthorizationServerHost::with_clock(&settings, clock.clone())
        .with_client(Client::new(CLIENT_ID, Some(CLIENT_SECRET), vec![callback()]))
        .with_client(Client::new("public-app", None, vec![Url::parse("https://public.example/cb").unwrap()]))
        .with_client_credentials(CLIENT_ID, ["photos", "print"]);
    let server = AuthorizationServer::with_clock(Arc::new(host.clone()), settings, clock.clone()).unwrap();
    Fixture { clock, host, server: Arc::new(server) }
}

fn basic(id: &str, secret: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{}:{}", id, secret)))
}

fn form(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn token_request(pairs: &[(&str, &str)]) -> HttpRequest {
    HttpRequest::post_form(token_url(), &form(pairs))
}

fn json(response: &HttpResponse) -> Value {
    serde_json::from_slice(&response.body).unwrap()
}

fn scope(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// The user agent visits the authorization endpoint, the user approves, and
/// the code arrives at the callback.
fn obtain_code(fixture: &Fixture, requested_scope: &str) -> String {
    let mut url = authorize_url();
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", CLIENT_ID)
        .append_pair("redirect_uri", callback().as_str())
        .append_pair("scope", requested_scope)
        .append_pair("state", "xyz");
    let request = fixture
        .server
        .read_authorization_request(&HttpRequest::get(url))
        .unwrap()
        .expect("authorization request");
    let approved = fixture.server.prepare_approved_authorization(&request, "alice", None).unwrap();
    let redirect = fixture.server.send(approved).unwrap();
    assert_eq!(redirect.status, 302);
    assert!(redirect.header("Location").unwrap().starts_with(callback().as_str()));
    let fields = redirect.location_fields().unwrap();
    assert_eq!(fields.get("state").map(String::as_str), Some("xyz"));
    fields.get("code").cloned().expect("code in redirect")
}

fn redeem(fixture: &Fixture, code: &str) -> HttpResponse {
    let request = token_request(&[
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", callback().as_str()),
    ])
    .with_header("Authorization", basic(CLIENT_ID, CLIENT_SECRET));
    fixture.server.handle_token_request(&request)
}

fn resource_server(fixture: &Fixture) -> ResourceServer {
    let services = BagServices {
        clock: fixture.clock.clone() as Arc<dyn Clock>,
        random: Arc::new(SystemRandomSource::new()),
        descriptions: Arc::new(MessageDescriptions::new()),
    };
    let verification = AccessTokenVerification::Symmetric(fixture.host.crypto_key_store());
    ResourceServer::new(Arc::new(StandardAccessTokenAnalyzer::new(verification, services)))
}

fn api_call(token: &str) -> HttpRequest {
    HttpRequest::get(Url::parse("https://api.example/photos").unwrap())
        .with_header("Authorization", format!("Bearer {}", token))
}

#[test]
fn authorization_code_grant_end_to_end() {
    let fixture = fixture();
    let code = obtain_code(&fixture, "photos print");

    let response = redeem(&fixture, &code);
    assert_eq!(response.status, 200, "{:?}", response.body_text());
    assert_eq!(response.header("Cache-Control"), Some("no-store"));
    let body = json(&response);
    assert_eq!(body["token_type"], "bearer");
    assert_eq!(body["expires_in"], 600);
    assert_eq!(body["scope"], "photos print");
    let access_token = body["access_token"].as_str().unwrap();
    assert!(body["refresh_token"].is_string());

    let resource = resource_server(&fixture);
    let grant = resource.get_access_token(&api_call(access_token), &scope(&["photos"])).unwrap();
    assert_eq!(grant.client_id, CLIENT_ID);
    assert_eq!(grant.user.as_deref(), Some("alice"));

    let err = resource.get_access_token(&api_call(access_token), &scope(&["admin"])).unwrap_err();
    assert_eq!(ResourceServer::error_response(&err).status, 403);
}

#[test]
fn code_is_redeemed_once() {
    let fixture = fixture();
    let code = obtain_code(&fixture, "photos");
    assert_eq!(redeem(&fixture, &code).status, 200);

    let again = redeem(&fixture, &code);
    assert_eq!(again.status, 400);
    assert_eq!(json(&again)["error"], "invalid_grant");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_redemptions_issue_one_token() {
    let fixture = fixture();
    let code = obtain_code(&fixture, "photos");
    let request = token_request(&[
        ("grant_type", "authorization_code"),
        ("code", code.as_str()),
        ("redirect_uri", callback().as_str()),
    ])
    .with_header("Authorization", basic(CLIENT_ID, CLIENT_SECRET));

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let server = fixture.server.clone();
            let request = request.clone();
            tokio::spawn(async move { server.handle_token_request(&request).status })
        })
        .collect();
    let statuses = futures::future::join_all(attempts).await;
    let issued = statuses.iter().filter(|status| matches!(status, Ok(200))).count();
    assert_eq!(issued, 1, "{statuses:?}");
}

#[test]
fn redirect_uri_must_match_the_authorization_request() {
    let fixture = fixture();
    let code = obtain_code(&fixture, "photos");
    let request = token_request(&[
        ("grant_type", "authorization_code"),
        ("code", code.as_str()),
        ("redirect_uri", "https://printer.example/elsewhere"),
    ])
    .with_header("Authorization", basic(CLIENT_ID, CLIENT_SECRET));
    let response = fixture.server.handle_token_request(&request);
    assert_eq!(json(&response)["error"], "invalid_grant");
}

#[test]
fn authorization_requests_are_checked_against_the_registration() {
    let fixture = fixture();
    let mut url = authorize_url();
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", CLIENT_ID)
        .append_pair("redirect_uri", "https://evil.example/cb");
    let err = fixture.server.read_authorization_request(&HttpRequest::get(url)).unwrap_err();
    assert!(matches!(err, ProtocolError::Violation(_)));

    let mut url = authorize_url();
    url.query_pairs_mut().append_pair("response_type", "code").append_pair("client_id", "nobody");
    assert!(fixture.server.read_authorization_request(&HttpRequest::get(url)).is_err());
}

#[test]
fn denied_authorization_returns_access_denied() {
    let fixture = fixture();
    let mut url = authorize_url();
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", CLIENT_ID)
        .append_pair("state", "s1");
    let request = fixture.server.read_authorization_request(&HttpRequest::get(url)).unwrap().unwrap();
    let denied = fixture.server.prepare_rejected_authorization(&request).unwrap();
    let fields = fixture.server.send(denied).unwrap().location_fields().unwrap();
    assert_eq!(fields.get("error").map(String::as_str), Some("access_denied"));
    assert_eq!(fields.get("state").map(String::as_str), Some("s1"));
}

#[test]
fn refresh_narrows_scope_and_stops_after_revocation() {
    let fixture = fixture();
    let code = obtain_code(&fixture, "photos print");
    let refresh_token = json(&redeem(&fixture, &code))["refresh_token"].as_str().unwrap().to_string();

    let refresh = |requested: &str| {
        let request = token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("scope", requested),
            ("client_id", CLIENT_ID),
            ("client_secret", CLIENT_SECRET),
        ]);
        fixture.server.handle_token_request(&request)
    };

    let narrowed = refresh("photos");
    assert_eq!(narrowed.status, 200, "{:?}", narrowed.body_text());
    assert_eq!(json(&narrowed)["scope"], "photos");

    let widened = refresh("photos admin");
    assert_eq!(widened.status, 400);
    assert_eq!(json(&widened)["error"], "invalid_scope");

    fixture.clock.advance(TimeDelta::seconds(1));
    fixture.host.revoke(CLIENT_ID, Some("alice"));
    let revoked = refresh("photos");
    assert_eq!(json(&revoked)["error"], "invalid_grant");
}

#[test]
fn expired_access_token_is_rejected() {
    let fixture = fixture();
    let code = obtain_code(&fixture, "photos");
    let access_token = json(&redeem(&fixture, &code))["access_token"].as_str().unwrap().to_string();
    let resource = resource_server(&fixture);
    assert!(resource.get_access_token(&api_call(&access_token), &BTreeSet::new()).is_ok());

    fixture.clock.advance(TimeDelta::seconds(601));
    let err = resource.get_access_token(&api_call(&access_token), &BTreeSet::new()).unwrap_err();
    let challenge = ResourceServer::error_response(&err);
    assert_eq!(challenge.status, 401);
    assert_eq!(challenge.header("WWW-Authenticate"), Some("Bearer error=\"invalid_token\""));
}

#[test]
fn client_credentials_grant_issues_no_refresh_token() {
    let fixture = fixture();
    let request = token_request(&[("grant_type", "client_credentials"), ("scope", "print")])
        .with_header("Authorization", basic(CLIENT_ID, CLIENT_SECRET));
    let response = fixture.server.handle_token_request(&request);
    assert_eq!(response.status, 200, "{:?}", response.body_text());
    let body = json(&response);
    assert_eq!(body["scope"], "print");
    assert!(body.get("refresh_token").is_none());

    let too_much = token_request(&[("grant_type", "client_credentials"), ("scope", "admin")])
        .with_header("Authorization", basic(CLIENT_ID, CLIENT_SECRET));
    assert_eq!(json(&fixture.server.handle_token_request(&too_much))["error"], "unauthorized_client");
}

#[test]
fn client_authentication_failures_are_invalid_client() {
    let fixture = fixture();

    let unauthenticated = token_request(&[("grant_type", "client_credentials"), ("client_id", CLIENT_ID)]);
    let response = fixture.server.handle_token_request(&unauthenticated);
    assert_eq!(response.status, 401);
    assert_eq!(response.header("WWW-Authenticate"), Some("Basic"));
    assert_eq!(json(&response)["error"], "invalid_client");

    let wrong_secret = token_request(&[("grant_type", "client_credentials")])
        .with_header("Authorization", basic(CLIENT_ID, "guess"));
    assert_eq!(json(&fixture.server.handle_token_request(&wrong_secret))["error"], "invalid_client");

    let twice = token_request(&[
        ("grant_type", "client_credentials"),
        ("client_id", CLIENT_ID),
        ("client_secret", CLIENT_SECRET),
    ])
    .with_header("Authorization", basic(CLIENT_ID, CLIENT_SECRET));
    let response = fixture.server.handle_token_request(&twice);
    assert_eq!(response.status, 401);
    assert_eq!(json(&response)["error"], "invalid_client");
}

#[test]
fn code_issued_to_one_client_cannot_be_redeemed_by_another() {
    let fixture = fixture();
    let code = obtain_code(&fixture, "photos");
    let request = token_request(&[
        ("grant_type", "authorization_code"),
        ("code", code.as_str()),
        ("redirect_uri", callback().as_str()),
        ("client_id", "public-app"),
    ]);
    let response = fixture.server.handle_token_request(&request);
    assert_eq!(json(&response)["error"], "invalid_client");
}

#[test]
fn malformed_token_requests() {
    let fixture = fixture();
    let unknown_grant = token_request(&[("grant_type", "urn:example:magic"), ("client_id", CLIENT_ID)]);
    let response = fixture.server.handle_token_request(&unknown_grant);
    assert_eq!(response.status, 400);
    assert_eq!(json(&response)["error"], "unsupported_grant_type");

    let forged_code = token_request(&[
        ("grant_type", "authorization_code"),
        ("code", "not-a-real-code"),
        ("redirect_uri", callback().as_str()),
    ])
    .with_header("Authorization", basic(CLIENT_ID, CLIENT_SECRET));
    assert_eq!(json(&fixture.server.handle_token_request(&forged_code))["error"], "invalid_grant");

    let missing_code = token_request(&[("grant_type", "authorization_code")])
        .with_header("Authorization", basic(CLIENT_ID, CLIENT_SECRET));
    assert_eq!(json(&fixture.server.handle_token_request(&missing_code))["error"], "invalid_request");
}

#[test]
fn password_grant_is_unsupported_without_users() {
    let fixture = fixture();
    let request = token_request(&[("grant_type", "password"), ("username", "alice"), ("password", "pw")]);
    let response = fixture.server.handle_token_request(&request);
    assert_eq!(json(&response)["error"], "unsupported_grant_type");
}
