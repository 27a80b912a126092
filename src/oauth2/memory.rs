//! In-memory client registry and authorization server host.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use subtle::ConstantTimeEq;
use tracing::info;

use super::authorization::AccessTokenParameters;
use super::host::AuthorizationServerHost;
use super::types::{AuthorizationDescription, Client, ClientDescription, GrantDecision, is_scope_satisfied};
use crate::config::MessagingSettings;
use crate::messaging::{
    Clock, CryptoKeyStore, InMemoryCryptoKeyStore, InMemoryNonceStore, NonceStore, ProtocolError, SystemClock,
};

#[derive(Clone, Default)]
pub struct InMemoryClientStore {
    clients: Arc<DashMap<String, Arc<Client>>>,
}

impl InMemoryClientStore {
    /// Creates a store holding an initial set of clients.
    pub fn new(initial_clients: Vec<Client>) -> Self {
        let map = DashMap::new();
        for client in initial_clients {
            map.insert(client.id.clone(), Arc::new(client));
        }
        Self { clients: Arc::new(map) }
    }

    /// Registers `client`, replacing any client with the same id.
    pub fn insert(&self, client: Client) {
        self.clients.insert(client.id.clone(), Arc::new(client));
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<Client>> {
        self.clients.get(client_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, client_id: &str) -> bool {
        self.clients.remove(client_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// A host keeping clients, users and revocations in process memory.
#[derive(Clone)]
pub struct InMemoryAuthorizationServerHost {
    clients: InMemoryClientStore,
    key_store: Arc<InMemoryCryptoKeyStore>,
    nonce_store: Arc<InMemoryNonceStore>,
    users: Arc<DashMap<String, String>>,
    /// Scope each client may request through the client credentials grant.
    client_grants: Arc<DashMap<String, BTreeSet<String>>>,
    /// When a user last revoked a client, keyed by (client, user).
    revocations: Arc<DashMap<(String, Option<String>), DateTime<Utc>>>,
    access_token_parameters: AccessTokenParameters,
    clock: Arc<dyn Clock>,
}

impl InMemoryAuthorizationServerHost {
    pub fn new(settings: &MessagingSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: &MessagingSettings, clock: Arc<dyn Clock>) -> Self {
        let code_window = settings.authorization_code_lifetime() + settings.maximum_clock_skew();
        Self {
            clients: InMemoryClientStore::default(),
            key_store: Arc::new(InMemoryCryptoKeyStore::new()),
            nonce_store: Arc::new(InMemoryNonceStore::new(code_window, clock.clone())),
            users: Arc::new(DashMap::new()),
            client_grants: Arc::new(DashMap::new()),
            revocations: Arc::new(DashMap::new()),
            access_token_parameters: AccessTokenParameters::default(),
            clock,
        }
    }

    pub fn with_client(self, client: Client) -> Self {
        self.clients.insert(client);
        self
    }

    /// Enables the password grant for `user_name`.
    pub fn with_user(self, user_name: &str, password: &str) -> Self {
        self.users.insert(user_name.to_string(), password.to_string());
        self
    }

    /// Enables the client credentials grant for `client_id` up to `scope`.
    pub fn with_client_credentials<I, S>(self, client_id: &str, scope: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.client_grants.insert(client_id.to_string(), scope.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_access_token_parameters(mut self, parameters: AccessTokenParameters) -> Self {
        self.access_token_parameters = parameters;
        self
    }

    pub fn clients(&self) -> &InMemoryClientStore {
        &self.clients
    }

    /// Invalidates every code, refresh token and access token issued to
    /// `client_id` on behalf of `user` so far.
    pub fn revoke(&self, client_id: &str, user: Option<&str>) {
        info!(client = client_id, user = ?user, "authorization revoked");
        self.revocations
            .insert((client_id.to_string(), user.map(str::to_string)), self.clock.now());
    }
}

impl AuthorizationServerHost for InMemoryAuthorizationServerHost {
    fn crypto_key_store(&self) -> Arc<dyn CryptoKeyStore> {
        self.key_store.clone()
    }

    fn nonce_store(&self) -> Arc<dyn NonceStore> {
        self.nonce_store.clone()
    }

    fn get_client(&self, client_id: &str) -> Result<Option<Arc<dyn ClientDescription>>, ProtocolError> {
        Ok(self.clients.get(client_id).map(|client| client as Arc<dyn ClientDescription>))
    }

    fn is_authorization_valid(&self, authorization: &AuthorizationDescription) -> Result<bool, ProtocolError> {
        let key = (authorization.client_id.clone(), authorization.user.clone());
        Ok(self
            .revocations
            .get(&key)
            .map_or(true, |revoked| authorization.utc_issued > *revoked.value()))
    }

    fn check_resource_owner_credentials(
        &self,
        user_name: &str,
        password: &str,
        _client_id: Option<&str>,
        scope: &BTreeSet<String>,
    ) -> Result<GrantDecision, ProtocolError> {
        if self.users.is_empty() {
            return Ok(GrantDecision::NotSupported);
        }
        let matches = self
            .users
            .get(user_name)
            .is_some_and(|expected| bool::from(expected.value().as_bytes().ct_eq(password.as_bytes())));
        Ok(if matches {
            GrantDecision::Approved { user: Some(user_name.to_string()), scope: scope.clone() }
        } else {
            GrantDecision::Rejected
        })
    }

    fn check_client_credentials_grant(
        &self,
        client_id: &str,
        scope: &BTreeSet<String>,
    ) -> Result<GrantDecision, ProtocolError> {
        if self.client_grants.is_empty() {
            return Ok(GrantDecision::NotSupported);
        }
        let Some(allowed) = self.client_grants.get(client_id) else {
            return Ok(GrantDecision::Rejected);
        };
        if !is_scope_satisfied(scope, allowed.value()) {
            return Ok(GrantDecision::Rejected);
        }
        let approved = if scope.is_empty() { allowed.value().clone() } else { scope.clone() };
        Ok(GrantDecision::Approved { user: None, scope: approved })
    }

    fn access_token_parameters(&self, _authorization: &AuthorizationDescription) -> AccessTokenParameters {
        self.access_token_parameters.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::FixedClock;
    use chrono::{TimeDelta, TimeZone};

    fn scope(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn client_store_replaces_by_id() {
        let store = InMemoryClientStore::new(vec![Client::new("app", Some("a"), vec![])]);
        store.insert(Client::new("app", Some("b"), vec![]));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("app").unwrap().secret.as_deref(), Some("b"));
        assert!(store.remove("app"));
        assert!(store.get("app").is_none());
    }

    #[test]
    fn revocation_invalidates_earlier_grants_only() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()));
        let host = InMemoryAuthorizationServerHost::with_clock(&MessagingSettings::default(), clock.clone());
        let earlier = AuthorizationDescription {
            client_id: "app".into(),
            user: Some("alice".into()),
            scope: BTreeSet::new(),
            utc_issued: clock.now(),
        };
        clock.advance(TimeDelta::seconds(5));
        host.revoke("app", Some("alice"));
        assert!(!host.is_authorization_valid(&earlier).unwrap());

        clock.advance(TimeDelta::seconds(5));
        let later = AuthorizationDescription { utc_issued: clock.now(), ..earlier.clone() };
        assert!(host.is_authorization_valid(&later).unwrap());
        let other_user = AuthorizationDescription { user: Some("bob".into()), ..earlier };
        assert!(host.is_authorization_valid(&other_user).unwrap());
    }

    #[test]
    fn grant_decisions() {
        let host = InMemoryAuthorizationServerHost::new(&MessagingSettings::default());
        assert_eq!(
            host.check_resource_owner_credentials("alice", "pw", None, &BTreeSet::new()).unwrap(),
            GrantDecision::NotSupported
        );
        assert_eq!(host.check_client_credentials_grant("app", &BTreeSet::new()).unwrap(), GrantDecision::NotSupported);

        let host = host.with_user("alice", "pw").with_client_credentials("app", ["read", "write"]);
        assert!(matches!(
            host.check_resource_owner_credentials("alice", "pw", None, &scope(&["read"])).unwrap(),
            GrantDecision::Approved { .. }
        ));
        assert_eq!(
            host.check_resource_owner_credentials("alice", "nope", None, &BTreeSet::new()).unwrap(),
            GrantDecision::Rejected
        );
        assert_eq!(
            host.check_client_credentials_grant("app", &BTreeSet::new()).unwrap(),
            GrantDecision::Approved { user: None, scope: scope(&["read", "write"]) }
        );
        assert_eq!(host.check_client_credentials_grant("app", &scope(&["admin"])).unwrap(), GrantDecision::Rejected);
        assert_eq!(host.check_client_credentials_grant("other", &BTreeSet::new()).unwrap(), GrantDecision::Rejected);
    }
}
