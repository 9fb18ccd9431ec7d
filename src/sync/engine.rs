//! Background synchronization engine.
//!
//! Enqueueing is a local SQLite write and nothing else; the engine pushes
//! queued records to the server later, oldest first, whenever a drain is
//! triggered by the periodic timer, a connectivity restore, or an explicit
//! `sync_now`. At most one drain runs at a time.
//!
//! Failure handling per record: retryable errors back off exponentially up
//! to a bounded retry budget, definitive rejections park the record
//! immediately. Parked records wait for manual requeue from the UI.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::api::DeliveryRemote;
use crate::auth::AccessTokens;
use crate::config::Config;
use crate::models::{Submission, SubmissionKind, SyncableRecord};
use crate::net::ConnectivityMonitor;
use crate::store::{QueueStore, StoreError};

use super::state::{DrainOutcome, SyncStatus};

pub struct SyncEngine<D: DeliveryRemote, T: AccessTokens> {
    remote: Arc<D>,
    tokens: Arc<T>,
    store: Arc<QueueStore>,
    net: ConnectivityMonitor,
    /// Held for the duration of a drain pass; `try_lock` makes overlapping
    /// triggers collapse into the pass already running.
    drain_lock: Mutex<()>,
    status_tx: watch::Sender<SyncStatus>,
    shutdown_tx: watch::Sender<bool>,
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    drain_interval: Duration,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl<D: DeliveryRemote, T: AccessTokens> SyncEngine<D, T> {
    pub fn new(
        remote: Arc<D>,
        tokens: Arc<T>,
        store: Arc<QueueStore>,
        net: ConnectivityMonitor,
        config: &Config,
    ) -> Self {
        let initial = SyncStatus {
            online: net.is_online(),
            ..SyncStatus::default()
        };
        let (status_tx, _) = watch::channel(initial);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            remote,
            tokens,
            store,
            net,
            drain_lock: Mutex::new(()),
            status_tx,
            shutdown_tx,
            max_retries: config.max_sync_retries,
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            drain_interval: config.drain_interval(),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        *self.status_tx.borrow()
    }

    /// Record a submission locally. Succeeds or fails on the SQLite write
    /// alone; connectivity plays no part.
    pub fn enqueue(&self, submission: &Submission) -> Result<SyncableRecord, StoreError> {
        let record = self.store.enqueue(submission)?;
        debug!(id = record.id, key = %record.business_key, kind = record.kind.as_str(), "submission queued");
        self.publish_status();
        Ok(record)
    }

    /// Explicit user-triggered drain.
    pub async fn sync_now(self: &Arc<Self>) -> Result<DrainOutcome, StoreError> {
        self.drain().await
    }

    /// Push all due records, oldest first. A no-op while offline or while
    /// another drain holds the lock.
    pub async fn drain(self: &Arc<Self>) -> Result<DrainOutcome, StoreError> {
        if !self.net.is_online() {
            debug!("drain skipped; offline");
            return Ok(DrainOutcome::default());
        }
        let Ok(_guard) = self.drain_lock.try_lock() else {
            debug!("drain skipped; another drain in progress");
            return Ok(DrainOutcome::default());
        };

        let due = self.store.due_records()?;
        let mut outcome = DrainOutcome::default();
        if !due.is_empty() {
            info!(records = due.len(), "draining submission queue");
            for record in &due {
                if !self.net.is_online() {
                    debug!("connectivity lost mid-drain; remaining records deferred");
                    break;
                }
                if self.push_record(record).await? {
                    outcome.synced += 1;
                } else {
                    outcome.failed += 1;
                }
            }
        }

        self.status_tx
            .send_modify(|status| status.last_drain_at = Some(Utc::now()));
        self.publish_status();
        Ok(outcome)
    }

    /// Push one record. `Ok(true)` means the server now has it, `Ok(false)`
    /// means it stayed queued or was parked; `Err` is a local store failure.
    async fn push_record(self: &Arc<Self>, record: &SyncableRecord) -> Result<bool, StoreError> {
        let credential = match self.tokens.bearer(true).await {
            Ok(credential) => credential,
            Err(e) => {
                debug!(id = record.id, error = %e, "no usable credential; record deferred");
                return Ok(false);
            }
        };
        if credential.offline_issued {
            // A locally minted token means nothing to the server
            debug!(id = record.id, "offline credential cannot sync; record deferred");
            return Ok(false);
        }

        // Idempotence guard: a record may have reached the server on an
        // earlier attempt whose acknowledgment was lost.
        match self
            .remote
            .fetch_status(&credential.access_token, &record.business_key)
            .await
        {
            Ok(status) if status.covers(record.kind) => {
                info!(id = record.id, key = %record.business_key, "already processed server-side");
                self.store.mark_synced(record.id)?;
                return Ok(true);
            }
            Ok(_) => {}
            Err(e) => {
                // The guard is advisory; the submit itself decides
                debug!(id = record.id, error = %e, "status check failed; submitting anyway");
            }
        }

        self.store.mark_syncing(record.id)?;
        let result = match record.kind {
            SubmissionKind::Acceptance => {
                self.remote
                    .submit_acceptance(&credential.access_token, &record.payload)
                    .await
            }
            SubmissionKind::ExceptionReport => {
                self.remote
                    .submit_exception(&credential.access_token, &record.payload)
                    .await
            }
        };

        match result {
            Ok(()) => {
                self.store.mark_synced(record.id)?;
                info!(id = record.id, key = %record.business_key, "record synced");
                Ok(true)
            }
            Err(e) if e.is_retryable() => {
                let count = self
                    .store
                    .record_retryable_failure(record.id, &e.to_string())?;
                if count >= self.max_retries {
                    warn!(id = record.id, retries = count, "retry budget exhausted; parking record");
                    self.store
                        .mark_permanent_failure(record.id, &format!("retry budget exhausted: {e}"))?;
                } else {
                    self.schedule_retry(record.id, count);
                }
                Ok(false)
            }
            Err(e) => {
                warn!(id = record.id, error = %e, "definitive rejection; parking record");
                self.store.mark_permanent_failure(record.id, &e.to_string())?;
                Ok(false)
            }
        }
    }

    /// Delay before the retry that follows the given failure count:
    /// `initial_backoff * 2^retry_count`, capped.
    fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Retry a single record after its backoff delay, without waiting for
    /// the next full drain.
    fn schedule_retry(self: &Arc<Self>, id: i64, retry_count: u32) {
        let delay = self.backoff_delay(retry_count);
        debug!(id, retry_count, delay_ms = delay.as_millis() as u64, "retry scheduled");

        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
            if !engine.net.is_online() {
                return;
            }
            // Single-record pass; waits its turn behind any running drain
            let _guard = engine.drain_lock.lock().await;
            let record = match engine.store.get(id) {
                Ok(record) => record,
                Err(e) => {
                    warn!(id, error = %e, "retry lookup failed");
                    return;
                }
            };
            if !record.status.is_drainable() {
                return;
            }
            if let Err(e) = engine.push_record(&record).await {
                warn!(id, error = %e, "retry pass failed");
            }
            engine.publish_status();
        }));
    }

    /// Parked records awaiting manual intervention.
    pub fn permanent_failures(&self) -> Result<Vec<SyncableRecord>, StoreError> {
        self.store.permanent_failures()
    }

    /// Put a parked record back in the automatic queue.
    pub fn requeue(&self, id: i64) -> Result<(), StoreError> {
        self.store.requeue(id)?;
        info!(id, "record requeued");
        self.publish_status();
        Ok(())
    }

    pub fn records_for_key(&self, business_key: &str) -> Result<Vec<SyncableRecord>, StoreError> {
        self.store.records_for_key(business_key)
    }

    fn publish_status(&self) {
        match self.store.counts() {
            Ok(counts) => {
                let online = self.net.is_online();
                self.status_tx.send_modify(|status| {
                    status.pending = counts.outstanding();
                    status.syncing = counts.syncing;
                    status.failed_permanent = counts.permanent;
                    status.online = online;
                });
            }
            Err(e) => warn!(error = %e, "failed to read queue counts"),
        }
    }

    /// Spawn the periodic drain and the connectivity-restore listener.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.drain_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = engine.drain().await {
                            warn!(error = %e, "periodic drain failed");
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

        // Edge-triggered: a restore drains once, going offline just
        // updates the published snapshot.
        let engine = Arc::clone(self);
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
                        engine.publish_status();
                        if reconnected {
                            info!("connectivity restored; draining queue");
                            if let Err(e) = engine.drain().await {
                                warn!(error = %e, "reconnect drain failed");
                            }
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
    }

    /// Stop the background tasks and any scheduled retries.
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, RemoteSpbStatus};
    use crate::auth::{AuthError, Credential};
    use crate::models::RecordStatus;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct MockDelivery {
        submissions: StdMutex<Vec<(String, SubmissionKind)>>,
        submit_errors: StdMutex<Vec<ApiError>>,
        statuses: StdMutex<HashMap<String, RemoteSpbStatus>>,
        fetch_calls: AtomicUsize,
        submit_calls: AtomicUsize,
        block_submit: AtomicBool,
        gate: Notify,
    }

    impl MockDelivery {
        async fn submit(&self, key: &str, kind: SubmissionKind) -> Result<(), ApiError> {
            self.submit_calls.fetch_add(1, Ordering::SeqCst);
            if self.block_submit.load(Ordering::SeqCst) {
                self.gate.notified().await;
            }
            let err = {
                let mut errors = self.submit_errors.lock().unwrap();
                if errors.is_empty() { None } else { Some(errors.remove(0)) }
            };
            if let Some(err) = err {
                return Err(err);
            }
            self.submissions
                .lock()
                .unwrap()
                .push((key.to_string(), kind));
            Ok(())
        }
    }

    impl DeliveryRemote for MockDelivery {
        async fn submit_acceptance(
            &self,
            _access_token: &str,
            submission: &Submission,
        ) -> Result<(), ApiError> {
            self.submit(&submission.business_key, SubmissionKind::Acceptance).await
        }

        async fn submit_exception(
            &self,
            _access_token: &str,
            submission: &Submission,
        ) -> Result<(), ApiError> {
            self.submit(&submission.business_key, SubmissionKind::ExceptionReport).await
        }

        async fn fetch_status(
            &self,
            _access_token: &str,
            business_key: &str,
        ) -> Result<RemoteSpbStatus, ApiError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .statuses
                .lock()
                .unwrap()
                .get(business_key)
                .copied()
                .unwrap_or_default())
        }
    }

    struct MockTokens {
        credential: StdMutex<Credential>,
        bearer_errors: StdMutex<Vec<AuthError>>,
    }

    impl MockTokens {
        fn new(offline_issued: bool) -> Self {
            Self {
                credential: StdMutex::new(Credential {
                    access_token: "tok".to_string(),
                    refresh_token: Some("refresh".to_string()),
                    issued_at: Utc::now(),
                    expires_at: None,
                    subject_id: "u-17".to_string(),
                    subject_name: "budi".to_string(),
                    offline_issued,
                }),
                bearer_errors: StdMutex::new(Vec::new()),
            }
        }
    }

    impl AccessTokens for MockTokens {
        async fn bearer(&self, _auto_refresh: bool) -> Result<Credential, AuthError> {
            let err = {
                let mut errors = self.bearer_errors.lock().unwrap();
                if errors.is_empty() { None } else { Some(errors.remove(0)) }
            };
            match err {
                Some(err) => Err(err),
                None => Ok(self.credential.lock().unwrap().clone()),
            }
        }
    }

    fn test_config() -> Config {
        Config {
            max_sync_retries: 2,
            // Keep scheduled retries from firing inside a test unless the
            // test wants them to
            initial_backoff_ms: 60_000,
            max_backoff_ms: 300_000,
            ..Config::default()
        }
    }

    struct Harness {
        remote: Arc<MockDelivery>,
        net: ConnectivityMonitor,
        engine: Arc<SyncEngine<MockDelivery, MockTokens>>,
    }

    fn harness_with(online: bool, config: Config) -> Harness {
        let remote = Arc::new(MockDelivery::default());
        let tokens = Arc::new(MockTokens::new(false));
        let store = Arc::new(QueueStore::open_in_memory().unwrap());
        let net = ConnectivityMonitor::new(online);
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&remote),
            tokens,
            store,
            net.clone(),
            &config,
        ));
        Harness { remote, net, engine }
    }

    fn harness(online: bool) -> Harness {
        harness_with(online, test_config())
    }

    fn submission(key: &str, kind: SubmissionKind) -> Submission {
        Submission {
            business_key: key.to_string(),
            kind,
            latitude: Some(-6.17),
            longitude: Some(106.82),
            actor_id: "u-17".to_string(),
            actor_name: "Budi".to_string(),
            reason: match kind {
                SubmissionKind::Acceptance => None,
                SubmissionKind::ExceptionReport => Some("crate damaged in transit".to_string()),
            },
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_is_a_local_write_only() {
        let h = harness(false);
        let record = h
            .engine
            .enqueue(&submission("SPB-100", SubmissionKind::Acceptance))
            .unwrap();

        assert_eq!(record.status, RecordStatus::Pending);
        assert_eq!(h.remote.submit_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.engine.status().pending, 1);
        assert!(!h.engine.status().online);
    }

    #[tokio::test]
    async fn test_drain_is_noop_while_offline() {
        let h = harness(false);
        h.engine
            .enqueue(&submission("SPB-100", SubmissionKind::Acceptance))
            .unwrap();

        let outcome = h.engine.drain().await.unwrap();
        assert_eq!(outcome, DrainOutcome::default());
        assert_eq!(h.remote.submit_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_drain_pushes_fifo_for_same_key() {
        let h = harness(true);
        h.engine
            .enqueue(&submission("SPB-100", SubmissionKind::Acceptance))
            .unwrap();
        h.engine
            .enqueue(&submission("SPB-100", SubmissionKind::ExceptionReport))
            .unwrap();

        let outcome = h.engine.drain().await.unwrap();
        assert_eq!(outcome.synced, 2);

        let submitted = h.remote.submissions.lock().unwrap().clone();
        assert_eq!(
            submitted,
            vec![
                ("SPB-100".to_string(), SubmissionKind::Acceptance),
                ("SPB-100".to_string(), SubmissionKind::ExceptionReport),
            ]
        );
        let status = h.engine.status();
        assert_eq!(status.pending, 0);
        assert!(status.last_drain_at.is_some());
    }

    #[tokio::test]
    async fn test_idempotence_guard_skips_processed_records() {
        let h = harness(true);
        h.remote.statuses.lock().unwrap().insert(
            "SPB-100".to_string(),
            RemoteSpbStatus { accepted: true, exception_reported: false },
        );
        h.engine
            .enqueue(&submission("SPB-100", SubmissionKind::Acceptance))
            .unwrap();

        let outcome = h.engine.drain().await.unwrap();
        assert_eq!(outcome.synced, 1);
        // Marked synced without a duplicate submit
        assert_eq!(h.remote.submit_calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            h.engine.records_for_key("SPB-100").unwrap()[0].status,
            RecordStatus::Synced
        );
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_parks_record() {
        let h = harness(true);
        {
            let mut errors = h.remote.submit_errors.lock().unwrap();
            errors.push(ApiError::Timeout);
            errors.push(ApiError::Timeout);
        }
        let record = h
            .engine
            .enqueue(&submission("SPB-9", SubmissionKind::Acceptance))
            .unwrap();

        // First failure stays retryable, second exhausts max_sync_retries=2
        assert_eq!(h.engine.drain().await.unwrap().failed, 1);
        assert_eq!(h.engine.drain().await.unwrap().failed, 1);

        let parked = h.engine.permanent_failures().unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].id, record.id);
        assert_eq!(parked[0].retry_count, 2);

        // Parked records are excluded from later drains
        assert_eq!(h.engine.drain().await.unwrap(), DrainOutcome::default());
    }

    #[tokio::test]
    async fn test_definitive_rejection_parks_immediately() {
        let h = harness(true);
        h.remote
            .submit_errors
            .lock()
            .unwrap()
            .push(ApiError::Validation("unknown delivery note".to_string()));
        h.engine
            .enqueue(&submission("SPB-404", SubmissionKind::Acceptance))
            .unwrap();

        assert_eq!(h.engine.drain().await.unwrap().failed, 1);
        let parked = h.engine.permanent_failures().unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].retry_count, 0);
        assert_eq!(h.engine.status().failed_permanent, 1);
    }

    #[tokio::test]
    async fn test_requeue_returns_record_to_the_queue() {
        let h = harness(true);
        h.remote
            .submit_errors
            .lock()
            .unwrap()
            .push(ApiError::Validation("bad".to_string()));
        let record = h
            .engine
            .enqueue(&submission("SPB-5", SubmissionKind::Acceptance))
            .unwrap();
        h.engine.drain().await.unwrap();
        assert_eq!(h.engine.permanent_failures().unwrap().len(), 1);

        h.engine.requeue(record.id).unwrap();
        let outcome = h.engine.drain().await.unwrap();
        assert_eq!(outcome.synced, 1);
        assert!(h.engine.permanent_failures().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_issued_credential_defers_records() {
        let remote = Arc::new(MockDelivery::default());
        let tokens = Arc::new(MockTokens::new(true));
        let store = Arc::new(QueueStore::open_in_memory().unwrap());
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&remote),
            tokens,
            store,
            ConnectivityMonitor::new(true),
            &test_config(),
        ));
        engine
            .enqueue(&submission("SPB-100", SubmissionKind::Acceptance))
            .unwrap();

        let outcome = engine.drain().await.unwrap();
        assert_eq!(outcome, DrainOutcome { synced: 0, failed: 1 });
        assert_eq!(remote.submit_calls.load(Ordering::SeqCst), 0);
        // Still queued, not parked
        assert_eq!(
            engine.records_for_key("SPB-100").unwrap()[0].status,
            RecordStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_bearer_failure_defers_record_without_parking() {
        let remote = Arc::new(MockDelivery::default());
        let tokens = Arc::new(MockTokens::new(false));
        tokens
            .bearer_errors
            .lock()
            .unwrap()
            .push(AuthError::NotAuthenticated);
        let store = Arc::new(QueueStore::open_in_memory().unwrap());
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&remote),
            tokens,
            store,
            ConnectivityMonitor::new(true),
            &test_config(),
        ));
        engine
            .enqueue(&submission("SPB-7", SubmissionKind::Acceptance))
            .unwrap();

        engine.drain().await.unwrap();
        assert_eq!(remote.submit_calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            engine.records_for_key("SPB-7").unwrap()[0].status,
            RecordStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_concurrent_drain_collapses_into_one() {
        let h = harness(true);
        h.remote.block_submit.store(true, Ordering::SeqCst);
        h.engine
            .enqueue(&submission("SPB-1", SubmissionKind::Acceptance))
            .unwrap();

        let first = tokio::spawn({
            let engine = Arc::clone(&h.engine);
            async move { engine.drain().await }
        });
        while h.remote.submit_calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        // The overlapping trigger returns immediately with nothing done
        let overlapped = h.engine.sync_now().await.unwrap();
        assert_eq!(overlapped, DrainOutcome::default());

        h.remote.gate.notify_one();
        let outcome = first.await.unwrap().unwrap();
        assert_eq!(outcome.synced, 1);
        assert_eq!(h.remote.submit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scheduled_retry_fires_after_backoff() {
        let config = Config {
            max_sync_retries: 3,
            initial_backoff_ms: 5,
            max_backoff_ms: 50,
            ..Config::default()
        };
        let h = harness_with(true, config);
        h.remote.submit_errors.lock().unwrap().push(ApiError::Timeout);
        h.engine
            .enqueue(&submission("SPB-8", SubmissionKind::Acceptance))
            .unwrap();

        assert_eq!(h.engine.drain().await.unwrap().failed, 1);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let status = h.engine.records_for_key("SPB-8").unwrap()[0].status;
            if status == RecordStatus::Synced {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "retry never fired");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.remote.submit_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reconnect_triggers_drain() {
        let h = harness(false);
        h.engine.start();
        let record = h
            .engine
            .enqueue(&submission("SPB-100", SubmissionKind::ExceptionReport))
            .unwrap();
        assert_eq!(record.status, RecordStatus::Pending);

        h.net.set_online(true);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let status = h.engine.records_for_key("SPB-100").unwrap()[0].status;
            if status == RecordStatus::Synced {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "reconnect drain never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            *h.remote.submissions.lock().unwrap(),
            vec![("SPB-100".to_string(), SubmissionKind::ExceptionReport)]
        );
        assert!(h.engine.status().online);
        h.engine.stop().await;
    }

    #[tokio::test]
    async fn test_backoff_doubles_and_caps() {
        let config = Config {
            initial_backoff_ms: 2_000,
            max_backoff_ms: 10_000,
            ..Config::default()
        };
        let h = harness_with(true, config);
        assert_eq!(h.engine.backoff_delay(1), Duration::from_millis(4_000));
        assert_eq!(h.engine.backoff_delay(2), Duration::from_millis(8_000));
        assert_eq!(h.engine.backoff_delay(3), Duration::from_millis(10_000));
        assert_eq!(h.engine.backoff_delay(40), Duration::from_millis(10_000));
    }
}
