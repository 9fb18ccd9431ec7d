//! Token lifecycle management.
//!
//! The [`TokenManager`] owns every credential validity decision. Its core
//! guarantee is single-flight refresh: no matter how many callers ask for
//! a refresh while one is in flight, exactly one remote call happens and
//! every caller observes its result, released in arrival order.
//!
//! Offline-issued credentials are trusted for local operations only and
//! are never auto-expired; reconnect validation replaces them with a real
//! server session through the stored refresh token.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::api::{AuthRemote, TokenGrant};
use crate::net::ConnectivityMonitor;

use super::vault::CredentialVault;
use super::AuthError;

/// The current access credential.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub issued_at: DateTime<Utc>,
    /// Absent for offline-issued credentials and for servers that omit an
    /// expiry claim; the proactive refresh interval bounds staleness then.
    pub expires_at: Option<DateTime<Utc>>,
    pub subject_id: String,
    pub subject_name: String,
    /// Minted locally from a verified offline login; never sent to the
    /// server and never auto-expired.
    pub offline_issued: bool,
}

impl Credential {
    pub fn from_grant(grant: TokenGrant) -> Self {
        Self {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            issued_at: Utc::now(),
            expires_at: grant.expires_at,
            subject_id: grant.subject_id,
            subject_name: grant.subject_name,
            offline_issued: false,
        }
    }

    pub fn is_expired(&self) -> bool {
        if self.offline_issued {
            return false;
        }
        match self.expires_at {
            Some(expiry) => Utc::now() > expiry,
            None => false,
        }
    }

    /// Whether the credential is inside the warning margin before expiry.
    pub fn needs_refresh(&self, margin: Duration) -> bool {
        if self.offline_issued {
            return false;
        }
        match self.expires_at {
            Some(expiry) => {
                let margin = chrono::Duration::milliseconds(margin.as_millis() as i64);
                Utc::now() > expiry - margin
            }
            None => false,
        }
    }
}

/// Observable token lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    NoCredential,
    Valid,
    Expiring,
    Refreshing,
    Invalid,
}

type RefreshResult = Result<Credential, AuthError>;

enum RefreshSlot {
    Idle,
    InFlight {
        flight: u64,
        waiters: Vec<oneshot::Sender<RefreshResult>>,
    },
}

/// Credential provider seam for the sync engine.
pub trait AccessTokens: Send + Sync + 'static {
    /// A credential usable right now, refreshing first when allowed and
    /// needed.
    fn bearer(
        &self,
        auto_refresh: bool,
    ) -> impl Future<Output = Result<Credential, AuthError>> + Send;
}

pub struct TokenManager<A: AuthRemote, V: CredentialVault> {
    remote: Arc<A>,
    vault: Arc<V>,
    net: ConnectivityMonitor,
    current: Mutex<Option<Credential>>,
    slot: Mutex<RefreshSlot>,
    /// Bumped by every credential wipe; an in-flight refresh whose result
    /// arrives after a wipe is discarded rather than resurrecting the
    /// session.
    generation: AtomicU64,
    flight_seq: AtomicU64,
    state_tx: watch::Sender<TokenState>,
    refresh_margin: Duration,
}

impl<A: AuthRemote, V: CredentialVault> TokenManager<A, V> {
    pub fn new(
        remote: Arc<A>,
        vault: Arc<V>,
        net: ConnectivityMonitor,
        refresh_margin: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(TokenState::NoCredential);
        Self {
            remote,
            vault,
            net,
            current: Mutex::new(None),
            slot: Mutex::new(RefreshSlot::Idle),
            generation: AtomicU64::new(0),
            flight_seq: AtomicU64::new(0),
            state_tx,
            refresh_margin,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TokenState> {
        self.state_tx.subscribe()
    }

    /// Restore a persisted credential from the vault, e.g. at app start.
    pub async fn load_persisted(&self) -> Result<Option<Credential>, AuthError> {
        let credential = self.vault.load_credential()?;
        if let Some(credential) = &credential {
            *self.current.lock().await = Some(credential.clone());
            self.state_tx.send_replace(TokenState::Valid);
            debug!(subject = %credential.subject_name, "restored persisted credential");
        }
        Ok(credential)
    }

    /// Install a freshly issued credential (login or offline login).
    pub async fn install(&self, credential: Credential) {
        *self.current.lock().await = Some(credential.clone());
        if let Err(e) = self.vault.store_credential(&credential) {
            // The in-memory session still works; only restart persistence
            // is lost.
            warn!(error = %e, "failed to persist credential");
        }
        self.state_tx.send_replace(TokenState::Valid);
    }

    pub async fn current(&self) -> Option<Credential> {
        self.current.lock().await.clone()
    }

    /// A credential usable right now. Offline-issued credentials are
    /// always considered valid; an expired credential is refreshed first
    /// when `auto_refresh` allows.
    pub async fn bearer(&self, auto_refresh: bool) -> Result<Credential, AuthError> {
        let current = self.current.lock().await.clone();
        match current {
            Some(c) if c.offline_issued => Ok(c),
            Some(c) if !c.is_expired() => {
                if c.needs_refresh(self.refresh_margin) {
                    self.state_tx.send_replace(TokenState::Expiring);
                }
                Ok(c)
            }
            Some(_) if auto_refresh => self.refresh().await,
            Some(_) => Err(AuthError::NotAuthenticated),
            // No in-memory credential: a stored refresh token may still
            // re-establish the session.
            None if auto_refresh => self.refresh().await,
            None => Err(AuthError::NotAuthenticated),
        }
    }

    /// Convenience wrapper over [`Self::bearer`] that drops the error.
    pub async fn access_token(&self, auto_refresh: bool) -> Option<Credential> {
        self.bearer(auto_refresh).await.ok()
    }

    /// Single-flight refresh. If a refresh is already in flight the caller
    /// is enqueued and receives that flight's result; otherwise the caller
    /// becomes the leader and performs the one remote call.
    pub async fn refresh(&self) -> RefreshResult {
        let entry: Result<u64, oneshot::Receiver<RefreshResult>> = {
            let mut slot = self.slot.lock().await;
            match &mut *slot {
                RefreshSlot::InFlight { waiters, .. } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Err(rx)
                }
                idle @ RefreshSlot::Idle => {
                    let flight = self.flight_seq.fetch_add(1, Ordering::AcqRel);
                    *idle = RefreshSlot::InFlight { flight, waiters: Vec::new() };
                    Ok(flight)
                }
            }
        };
        let my_flight = match entry {
            Ok(flight) => flight,
            // Waiter path: suspend until the in-flight refresh resolves.
            // A dropped sender means the session was cleared out from
            // under us.
            Err(rx) => {
                return match rx.await {
                    Ok(result) => result,
                    Err(_) => Err(AuthError::SessionCleared),
                };
            }
        };

        self.state_tx.send_replace(TokenState::Refreshing);
        let result = self.perform_refresh().await;

        // Release our flight's waiters in arrival order. If the slot no
        // longer belongs to this flight (cleared and restarted mid-air),
        // its waiters were already handled elsewhere.
        let waiters = {
            let mut slot = self.slot.lock().await;
            let ours = matches!(&*slot, RefreshSlot::InFlight { flight, .. } if *flight == my_flight);
            if ours {
                match std::mem::replace(&mut *slot, RefreshSlot::Idle) {
                    RefreshSlot::InFlight { waiters, .. } => waiters,
                    RefreshSlot::Idle => Vec::new(),
                }
            } else {
                Vec::new()
            }
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }

        match &result {
            Ok(credential) => {
                info!(subject = %credential.subject_name, "token refreshed");
                self.state_tx.send_replace(TokenState::Valid);
            }
            Err(e) if e.is_definitive() => {
                // Refresh token revoked or account rejected: the session
                // is over regardless of what the old access token said.
                warn!(error = %e, "refresh definitively rejected; clearing credential");
                self.wipe_credential().await;
                self.state_tx.send_replace(TokenState::Invalid);
            }
            Err(AuthError::SessionCleared) => {}
            Err(e) => {
                // Network or rate limit: keep the credential, the caller
                // retries with backoff.
                debug!(error = %e, "refresh failed transiently; credential kept");
                let state = if self.current.lock().await.is_some() {
                    TokenState::Valid
                } else {
                    TokenState::NoCredential
                };
                self.state_tx.send_replace(state);
            }
        }

        result
    }

    async fn perform_refresh(&self) -> RefreshResult {
        let generation = self.generation.load(Ordering::Acquire);

        let refresh_token = {
            let current = self.current.lock().await.clone();
            current.and_then(|c| c.refresh_token).or_else(|| {
                self.vault
                    .load_identity()
                    .ok()
                    .flatten()
                    .and_then(|identity| identity.refresh_token)
            })
        };
        let Some(refresh_token) = refresh_token else {
            return Err(AuthError::NoRefreshToken);
        };

        let grant = self.remote.refresh(&refresh_token).await?;
        let credential = Credential::from_grant(grant);

        if self.generation.load(Ordering::Acquire) != generation {
            debug!("discarding refresh result; credential was cleared mid-flight");
            return Err(AuthError::SessionCleared);
        }

        *self.current.lock().await = Some(credential.clone());
        if let Err(e) = self.vault.store_credential(&credential) {
            warn!(error = %e, "failed to persist refreshed credential");
        }
        Ok(credential)
    }

    /// Lightweight server check after an offline→online transition.
    ///
    /// Returns `Ok(true)` when the session is confirmed, `Ok(false)` on a
    /// definitive rejection, and `Err` on a transient failure. Never logs
    /// the user out itself - that call belongs to the facade.
    pub async fn validate_on_reconnect(&self) -> Result<bool, AuthError> {
        let Some(current) = self.current.lock().await.clone() else {
            return Err(AuthError::NotAuthenticated);
        };

        if current.offline_issued {
            // An offline token means nothing to the server; the stored
            // refresh token decides whether the session can continue.
            return match self.refresh().await {
                Ok(_) => Ok(true),
                Err(e) if e.is_definitive() => Ok(false),
                Err(e) => Err(e),
            };
        }

        match self.remote.validate(&current.access_token).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_definitive_auth() => match self.refresh().await {
                Ok(_) => Ok(true),
                Err(err) if err.is_definitive() => Ok(false),
                Err(err) => Err(err),
            },
            Err(e) => Err(AuthError::from(e)),
        }
    }

    async fn wipe_credential(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        *self.current.lock().await = None;
        if let Err(e) = self.vault.delete_credential() {
            warn!(error = %e, "failed to delete stored credential");
        }
    }

    /// Destroy the credential and reject any queued refresh waiters.
    /// Waiters are told the session was cleared, never silently dropped.
    pub async fn clear(&self) {
        self.wipe_credential().await;

        let waiters = {
            let mut slot = self.slot.lock().await;
            match std::mem::replace(&mut *slot, RefreshSlot::Idle) {
                RefreshSlot::InFlight { waiters, .. } => waiters,
                RefreshSlot::Idle => Vec::new(),
            }
        };
        for waiter in waiters {
            let _ = waiter.send(Err(AuthError::SessionCleared));
        }

        self.state_tx.send_replace(TokenState::NoCredential);
        debug!("credential cleared");
    }

    /// Refresh on a fixed interval while a server-issued credential is
    /// held and the device is online. The fixed interval bounds token
    /// staleness independent of whether the server embeds an expiry claim.
    pub fn spawn_proactive_refresh(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !manager.net.is_online() {
                            continue;
                        }
                        let current = manager.current.lock().await.clone();
                        let Some(credential) = current else { continue };
                        if credential.offline_issued {
                            continue;
                        }
                        if credential.needs_refresh(manager.refresh_margin) {
                            manager.state_tx.send_replace(TokenState::Expiring);
                        }
                        if let Err(e) = manager.refresh().await {
                            debug!(error = %e, "proactive refresh failed; next interval retries");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

impl<A: AuthRemote, V: CredentialVault> AccessTokens for TokenManager<A, V> {
    async fn bearer(&self, auto_refresh: bool) -> Result<Credential, AuthError> {
        TokenManager::bearer(self, auto_refresh).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::auth::vault::MemoryVault;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct MockAuth {
        refresh_calls: AtomicUsize,
        validate_calls: AtomicUsize,
        block_refresh: AtomicBool,
        gate: Notify,
        refresh_error: StdMutex<Option<ApiError>>,
        validate_error: StdMutex<Option<ApiError>>,
        token_seq: AtomicUsize,
    }

    impl MockAuth {
        fn grant(&self) -> TokenGrant {
            let n = self.token_seq.fetch_add(1, Ordering::SeqCst);
            TokenGrant {
                access_token: format!("tok-{n}"),
                refresh_token: Some("refresh-token".to_string()),
                subject_id: "u-17".to_string(),
                subject_name: "budi".to_string(),
                expires_at: Some(Utc::now() + chrono::Duration::minutes(30)),
            }
        }

        fn fail_refresh_with(&self, err: ApiError) {
            *self.refresh_error.lock().unwrap() = Some(err);
        }
    }

    impl AuthRemote for MockAuth {
        async fn login(&self, _identity: &str, _secret: &str) -> Result<TokenGrant, ApiError> {
            Ok(self.grant())
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, ApiError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            if self.block_refresh.load(Ordering::SeqCst) {
                self.gate.notified().await;
            }
            if let Some(err) = self.refresh_error.lock().unwrap().take() {
                return Err(err);
            }
            Ok(self.grant())
        }

        async fn validate(&self, _access_token: &str) -> Result<(), ApiError> {
            self.validate_calls.fetch_add(1, Ordering::SeqCst);
            match self.validate_error.lock().unwrap().take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        async fn change_password(
            &self,
            _access_token: &str,
            _current_secret: &str,
            _new_secret: &str,
        ) -> Result<(), ApiError> {
            Ok(())
        }
    }

    fn expired_credential() -> Credential {
        Credential {
            access_token: "stale".to_string(),
            refresh_token: Some("refresh-token".to_string()),
            issued_at: Utc::now() - chrono::Duration::hours(2),
            expires_at: Some(Utc::now() - chrono::Duration::hours(1)),
            subject_id: "u-17".to_string(),
            subject_name: "budi".to_string(),
            offline_issued: false,
        }
    }

    fn offline_credential() -> Credential {
        Credential {
            access_token: "local-token".to_string(),
            refresh_token: None,
            issued_at: Utc::now() - chrono::Duration::days(3),
            expires_at: None,
            subject_id: "u-17".to_string(),
            subject_name: "budi".to_string(),
            offline_issued: true,
        }
    }

    fn manager(mock: &Arc<MockAuth>) -> Arc<TokenManager<MockAuth, MemoryVault>> {
        Arc::new(TokenManager::new(
            Arc::clone(mock),
            Arc::new(MemoryVault::new()),
            ConnectivityMonitor::new(true),
            Duration::from_secs(300),
        ))
    }

    #[tokio::test]
    async fn test_single_flight_coalesces_concurrent_refreshes() {
        let mock = Arc::new(MockAuth::default());
        mock.block_refresh.store(true, Ordering::SeqCst);
        let manager = manager(&mock);
        manager.install(expired_credential()).await;

        let release = async {
            while mock.refresh_calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
            // Give the other callers time to enqueue as waiters
            for _ in 0..20 {
                tokio::task::yield_now().await;
            }
            mock.gate.notify_one();
        };

        let (a, b, c, _) =
            tokio::join!(manager.refresh(), manager.refresh(), manager.refresh(), release);

        assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 1);
        let token = a.expect("leader result").access_token;
        assert_eq!(b.expect("waiter result").access_token, token);
        assert_eq!(c.expect("waiter result").access_token, token);
    }

    #[tokio::test]
    async fn test_waiters_observe_shared_failure() {
        let mock = Arc::new(MockAuth::default());
        mock.block_refresh.store(true, Ordering::SeqCst);
        mock.fail_refresh_with(ApiError::Timeout);
        let manager = manager(&mock);
        manager.install(expired_credential()).await;

        let release = async {
            while mock.refresh_calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
            for _ in 0..20 {
                tokio::task::yield_now().await;
            }
            mock.gate.notify_one();
        };

        let (a, b, _) = tokio::join!(manager.refresh(), manager.refresh(), release);
        assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 1);
        assert!(matches!(a, Err(AuthError::Network(_))));
        assert!(matches!(b, Err(AuthError::Network(_))));

        // Transient failure keeps the credential
        assert!(manager.current().await.is_some());
    }

    #[tokio::test]
    async fn test_definitive_refresh_failure_clears_credential() {
        let mock = Arc::new(MockAuth::default());
        mock.fail_refresh_with(ApiError::Unauthorized);
        let manager = manager(&mock);
        manager.install(expired_credential()).await;

        let result = manager.refresh().await;
        assert_eq!(result, Err(AuthError::InvalidCredentials));
        assert!(manager.current().await.is_none());
        assert_eq!(*manager.subscribe_state().borrow(), TokenState::Invalid);
    }

    #[tokio::test]
    async fn test_rate_limit_keeps_credential() {
        let mock = Arc::new(MockAuth::default());
        mock.fail_refresh_with(ApiError::RateLimited { retry_after_secs: Some(30) });
        let manager = manager(&mock);
        manager.install(expired_credential()).await;

        let result = manager.refresh().await;
        assert_eq!(result, Err(AuthError::RateLimited { retry_after_secs: Some(30) }));
        assert!(manager.current().await.is_some());
    }

    #[tokio::test]
    async fn test_clear_rejects_queued_waiters() {
        let mock = Arc::new(MockAuth::default());
        mock.block_refresh.store(true, Ordering::SeqCst);
        let manager = manager(&mock);
        manager.install(expired_credential()).await;

        let leader = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.refresh().await }
        });
        while mock.refresh_calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let waiter = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.refresh().await }
        });
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        manager.clear().await;
        assert_eq!(waiter.await.unwrap(), Err(AuthError::SessionCleared));

        // Let the in-flight call finish; its result must be discarded
        mock.gate.notify_one();
        assert_eq!(leader.await.unwrap(), Err(AuthError::SessionCleared));
        assert!(manager.current().await.is_none());
    }

    #[tokio::test]
    async fn test_bearer_refreshes_expired_credential() {
        let mock = Arc::new(MockAuth::default());
        let manager = manager(&mock);
        manager.install(expired_credential()).await;

        let credential = manager.bearer(true).await.expect("refreshed");
        assert_ne!(credential.access_token, "stale");
        assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bearer_without_auto_refresh_rejects_expired() {
        let mock = Arc::new(MockAuth::default());
        let manager = manager(&mock);
        manager.install(expired_credential()).await;

        assert_eq!(manager.bearer(false).await, Err(AuthError::NotAuthenticated));
        assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_offline_credential_is_always_valid() {
        let mock = Arc::new(MockAuth::default());
        let manager = manager(&mock);
        manager.install(offline_credential()).await;

        let credential = manager.bearer(false).await.expect("offline credential");
        assert!(credential.offline_issued);
        assert!(!credential.is_expired());
        assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_validate_on_reconnect_success() {
        let mock = Arc::new(MockAuth::default());
        let manager = manager(&mock);
        manager.install(Credential::from_grant(mock.grant())).await;

        assert_eq!(manager.validate_on_reconnect().await, Ok(true));
        assert_eq!(mock.validate_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_validate_on_reconnect_definitive_rejection() {
        let mock = Arc::new(MockAuth::default());
        *mock.validate_error.lock().unwrap() = Some(ApiError::Unauthorized);
        mock.fail_refresh_with(ApiError::Unauthorized);
        let manager = manager(&mock);
        manager.install(Credential::from_grant(mock.grant())).await;

        // 401 on validate, then the rescue refresh is rejected too
        assert_eq!(manager.validate_on_reconnect().await, Ok(false));
    }

    #[tokio::test]
    async fn test_validate_on_reconnect_transient_failure() {
        let mock = Arc::new(MockAuth::default());
        *mock.validate_error.lock().unwrap() = Some(ApiError::Timeout);
        let manager = manager(&mock);
        manager.install(Credential::from_grant(mock.grant())).await;

        assert!(matches!(
            manager.validate_on_reconnect().await,
            Err(AuthError::Network(_))
        ));
        // Transient failure must not destroy the session
        assert!(manager.current().await.is_some());
    }

    #[tokio::test]
    async fn test_offline_credential_reconnect_refreshes_via_identity() {
        let mock = Arc::new(MockAuth::default());
        let vault = Arc::new(MemoryVault::new());
        vault
            .store_identity(&crate::auth::IdentitySnapshot {
                subject_id: "u-17".to_string(),
                subject_name: "budi".to_string(),
                refresh_token: Some("refresh-token".to_string()),
            })
            .unwrap();
        let manager = Arc::new(TokenManager::new(
            Arc::clone(&mock),
            vault,
            ConnectivityMonitor::new(true),
            Duration::from_secs(300),
        ));
        manager.install(offline_credential()).await;

        assert_eq!(manager.validate_on_reconnect().await, Ok(true));
        assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 1);
        let current = manager.current().await.expect("real credential installed");
        assert!(!current.offline_issued);
    }

    #[tokio::test]
    async fn test_load_persisted_restores_vault_credential() {
        let mock = Arc::new(MockAuth::default());
        let vault = Arc::new(MemoryVault::new());
        vault.store_credential(&expired_credential()).unwrap();
        let manager = TokenManager::new(
            Arc::clone(&mock),
            vault,
            ConnectivityMonitor::new(true),
            Duration::from_secs(300),
        );

        let restored = manager.load_persisted().await.unwrap();
        assert!(restored.is_some());
        assert!(manager.current().await.is_some());
    }
}
