//! Authentication facade.
//!
//! [`AuthManager`] is the one entry point the UI layer drives: login with
//! offline fallback, logout, password change, session extension, and the
//! background tasks that keep tokens fresh and react to reconnects. It is
//! also the only place a logout is ever triggered.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::AuthRemote;
use crate::config::Config;
use crate::net::ConnectivityMonitor;

use super::session::{SessionState, SessionTracker};
use super::token::{Credential, TokenManager};
use super::vault::{
    generate_offline_token, hash_secret, verify_secret, CredentialVault, IdentitySnapshot,
    OfflineCredentialRecord,
};
use super::AuthError;

/// How close to expiry a credential is reported as expiring.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Top-level authentication state for the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    SignedOut,
    SignedIn {
        /// True while running on a locally verified offline login.
        offline: bool,
    },
}

pub struct AuthManager<A: AuthRemote, V: CredentialVault> {
    remote: Arc<A>,
    vault: Arc<V>,
    tokens: Arc<TokenManager<A, V>>,
    session: Arc<SessionTracker>,
    net: ConnectivityMonitor,
    config: Config,
    state_tx: watch::Sender<AuthState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<A: AuthRemote, V: CredentialVault> AuthManager<A, V> {
    pub fn new(remote: Arc<A>, vault: Arc<V>, net: ConnectivityMonitor, config: Config) -> Self {
        let tokens = Arc::new(TokenManager::new(
            Arc::clone(&remote),
            Arc::clone(&vault),
            net.clone(),
            TOKEN_REFRESH_MARGIN,
        ));
        let session = Arc::new(SessionTracker::new(
            config.session_idle_window(),
            config.session_warning_margin(),
        ));
        let (state_tx, _) = watch::channel(AuthState::SignedOut);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            remote,
            vault,
            tokens,
            session,
            net,
            config,
            state_tx,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn tokens(&self) -> &Arc<TokenManager<A, V>> {
        &self.tokens
    }

    pub fn session(&self) -> &Arc<SessionTracker> {
        &self.session
    }

    pub fn subscribe_state(&self) -> watch::Receiver<AuthState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> AuthState {
        *self.state_tx.borrow()
    }

    /// Online-first login. Falls back to locally stored offline credentials
    /// only when the server could not be reached; a definitive rejection is
    /// returned as-is and never masked by the offline path.
    pub async fn login(&self, identity: &str, secret: &str) -> Result<Credential, AuthError> {
        if !self.net.is_online() {
            debug!("device offline; using offline credentials");
            return self.offline_login(identity, secret).await;
        }

        match self.remote.login(identity, secret).await {
            Ok(grant) => {
                let credential = Credential::from_grant(grant);
                self.store_login_material(&credential, secret);
                self.tokens.install(credential.clone()).await;
                self.session.begin();
                self.state_tx.send_replace(AuthState::SignedIn { offline: false });
                info!(subject = %credential.subject_name, "logged in online");
                Ok(credential)
            }
            Err(e) => {
                let err = AuthError::from(e);
                if matches!(err, AuthError::Network(_)) {
                    warn!(error = %err, "server unreachable; trying offline credentials");
                    self.offline_login(identity, secret).await
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Verify the secret against the stored argon2 hash and mint a
    /// locally scoped credential. No network access.
    pub async fn offline_login(&self, identity: &str, secret: &str) -> Result<Credential, AuthError> {
        let record = self
            .vault
            .load_offline_record(identity)?
            .ok_or_else(|| AuthError::NoOfflineRecord(identity.to_string()))?;
        if !verify_secret(secret, &record.password_hash)? {
            return Err(AuthError::InvalidCredentials);
        }

        let credential = Credential {
            access_token: generate_offline_token(),
            refresh_token: None,
            issued_at: Utc::now(),
            expires_at: None,
            subject_id: record.subject_id.clone(),
            subject_name: record.subject_name.clone(),
            offline_issued: true,
        };
        self.tokens.install(credential.clone()).await;
        self.session.begin();
        self.state_tx.send_replace(AuthState::SignedIn { offline: true });
        info!(subject = %record.subject_name, "logged in offline");
        Ok(credential)
    }

    /// Persist what an offline login will later need. Storage failures are
    /// logged but do not fail the login that already succeeded.
    fn store_login_material(&self, credential: &Credential, secret: &str) {
        let identity = IdentitySnapshot {
            subject_id: credential.subject_id.clone(),
            subject_name: credential.subject_name.clone(),
            refresh_token: credential.refresh_token.clone(),
        };
        if let Err(e) = self.vault.store_identity(&identity) {
            warn!(error = %e, "failed to persist identity snapshot");
        }

        match hash_secret(secret) {
            Ok(password_hash) => {
                let record = OfflineCredentialRecord {
                    subject_id: credential.subject_id.clone(),
                    subject_name: credential.subject_name.clone(),
                    password_hash,
                    last_online_auth_at: Utc::now(),
                };
                if let Err(e) = self.vault.store_offline_record(&record) {
                    warn!(error = %e, "failed to persist offline credential record");
                }
            }
            Err(e) => warn!(error = %e, "failed to hash secret for offline record"),
        }
    }

    pub async fn logout(&self) {
        self.session.reset();
        self.tokens.clear().await;
        self.state_tx.send_replace(AuthState::SignedOut);
        info!("signed out");
    }

    pub async fn is_session_valid(&self) -> bool {
        self.session.is_active() && self.tokens.current().await.is_some()
    }

    /// Refresh now, retrying transient failures with exponential backoff.
    /// A server-supplied retry-after overrides the computed delay.
    pub async fn force_token_refresh(&self) -> Result<Credential, AuthError> {
        let attempts = self.config.refresh_retry_attempts.max(1);
        let mut backoff = self.config.initial_backoff();
        let mut last = AuthError::Offline;
        for attempt in 1..=attempts {
            match self.tokens.refresh().await {
                Ok(credential) => return Ok(credential),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = match &e {
                        AuthError::RateLimited { retry_after_secs: Some(secs) } => {
                            Duration::from_secs(*secs)
                        }
                        _ => backoff,
                    };
                    warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "refresh failed; retrying");
                    tokio::time::sleep(delay).await;
                    backoff = (backoff * 2).min(self.config.max_backoff());
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Change the account secret. Requires connectivity and a server-issued
    /// credential; on success the offline record is rehashed so offline
    /// login keeps working with the new secret.
    pub async fn change_password(
        &self,
        current_secret: &str,
        new_secret: &str,
    ) -> Result<(), AuthError> {
        if !self.net.is_online() {
            return Err(AuthError::Offline);
        }
        let credential = self
            .tokens
            .current()
            .await
            .ok_or(AuthError::NotAuthenticated)?;
        if credential.offline_issued {
            return Err(AuthError::Offline);
        }

        self.remote
            .change_password(&credential.access_token, current_secret, new_secret)
            .await
            .map_err(AuthError::from)?;

        self.store_login_material(&credential, new_secret);
        info!(subject = %credential.subject_name, "password changed");
        Ok(())
    }

    /// User chose to continue from the expiring warning. Also refreshes the
    /// token when possible so the extension is backed by fresh material;
    /// transient refresh failures do not undo the extension.
    pub async fn extend_session(&self) -> Result<(), AuthError> {
        self.session.confirm_continuation();
        let Some(credential) = self.tokens.current().await else {
            return Err(AuthError::NotAuthenticated);
        };
        if credential.offline_issued || !self.net.is_online() {
            return Ok(());
        }
        match self.tokens.refresh().await {
            Ok(_) => Ok(()),
            Err(e) if e.is_definitive() => Err(e),
            Err(e) => {
                debug!(error = %e, "extension refresh failed transiently");
                Ok(())
            }
        }
    }

    /// Validate the session against the server after a reconnect. Exactly
    /// one validation per offline→online transition; transient failures
    /// retry a bounded number of times and then leave the session alone.
    async fn handle_reconnect(&self) {
        let attempts = self.config.refresh_retry_attempts.max(1);
        for attempt in 1..=attempts {
            match self.tokens.validate_on_reconnect().await {
                Ok(true) => {
                    // An offline login may just have been upgraded to a
                    // real server session.
                    if let Some(c) = self.tokens.current().await {
                        if !c.offline_issued {
                            self.state_tx
                                .send_replace(AuthState::SignedIn { offline: false });
                        }
                    }
                    info!("session confirmed after reconnect");
                    return;
                }
                Ok(false) => {
                    warn!("session rejected after reconnect; signing out");
                    self.logout().await;
                    return;
                }
                Err(e) if e.is_definitive() => {
                    warn!(error = %e, "session rejected after reconnect; signing out");
                    self.logout().await;
                    return;
                }
                Err(e) => {
                    debug!(attempt, error = %e, "reconnect validation failed transiently");
                    if attempt < attempts {
                        tokio::time::sleep(self.config.initial_backoff()).await;
                    }
                }
            }
        }
        // Budget exhausted on transient failures; the session survives and
        // the next reconnect or proactive refresh will try again.
    }

    /// Spawn the background tasks: proactive refresh, the session checker,
    /// the idle-timeout watcher, and the reconnect listener.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        tasks.push(self.tokens.spawn_proactive_refresh(
            self.config.proactive_refresh_interval(),
            self.shutdown_tx.subscribe(),
        ));
        tasks.push(
            self.session
                .spawn_checker(self.config.session_check_interval(), self.shutdown_tx.subscribe()),
        );

        // Idle timeout is the only session transition that forces a logout.
        let manager = Arc::clone(self);
        let mut session_rx = self.session.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = session_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *session_rx.borrow_and_update() == SessionState::Timeout {
                            info!("idle timeout; signing out");
                            manager.logout().await;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        // Edge-triggered reconnect validation.
        let manager = Arc::clone(self);
        let mut net_rx = self.net.subscribe();
        // Baseline read before the task is spawned: a transition landing
        // before the first poll must still be seen as a transition
        let initially_online = *net_rx.borrow_and_update();
        let mut shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut was_online = initially_online;
            loop {
                tokio::select! {
                    changed = net_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *net_rx.borrow_and_update();
                        let reconnected = online && !was_online;
                        was_online = online;
                        if !reconnected {
                            continue;
                        }
                        if manager.tokens.current().await.is_none() {
                            continue;
                        }
                        manager.handle_reconnect().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Stop the background tasks. Does not touch the credential.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles = {
            let mut tasks = self
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *tasks)
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}
