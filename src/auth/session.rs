//! Idle-session tracking.
//!
//! The tracker is purely advisory: it watches activity timestamps and
//! reports state transitions, but never clears credentials or logs anyone
//! out. Timeout is terminal until the next login; the expiring warning is
//! reversible by any activity.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Observable session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session; nothing is tracked.
    Inactive,
    /// Recent activity inside the idle window.
    Active,
    /// Inside the warning margin before timeout; activity reverses this.
    Expiring,
    /// Idle window elapsed. Terminal until the next `begin`.
    Timeout,
}

struct Inner {
    last_activity: DateTime<Utc>,
    state: SessionState,
}

pub struct SessionTracker {
    inner: Mutex<Inner>,
    idle_window: chrono::Duration,
    warning_margin: chrono::Duration,
    state_tx: watch::Sender<SessionState>,
}

impl SessionTracker {
    pub fn new(idle_window: Duration, warning_margin: Duration) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Inactive);
        Self {
            inner: Mutex::new(Inner {
                last_activity: Utc::now(),
                state: SessionState::Inactive,
            }),
            idle_window: chrono::Duration::milliseconds(idle_window.as_millis() as i64),
            warning_margin: chrono::Duration::milliseconds(warning_margin.as_millis() as i64),
            state_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> SessionState {
        self.lock().state
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.current_state(),
            SessionState::Active | SessionState::Expiring
        )
    }

    /// Start tracking after a successful login.
    pub fn begin(&self) {
        {
            let mut inner = self.lock();
            inner.last_activity = Utc::now();
            inner.state = SessionState::Active;
        }
        self.publish(SessionState::Active);
        info!("session started");
    }

    /// Stop tracking (logout).
    pub fn reset(&self) {
        self.lock().state = SessionState::Inactive;
        self.publish(SessionState::Inactive);
    }

    /// Record user activity. Ignored once timed out: a stale screen tap
    /// must not resurrect a dead session.
    pub fn touch(&self) {
        let changed = {
            let mut inner = self.lock();
            match inner.state {
                SessionState::Active | SessionState::Expiring => {
                    inner.last_activity = Utc::now();
                    let was_expiring = inner.state == SessionState::Expiring;
                    inner.state = SessionState::Active;
                    was_expiring
                }
                SessionState::Inactive | SessionState::Timeout => return,
            }
        };
        if changed {
            self.publish(SessionState::Active);
            debug!("activity reversed expiring session");
        }
    }

    /// Explicit user confirmation from the expiring warning dialog.
    pub fn confirm_continuation(&self) {
        self.touch();
    }

    /// Remaining time before the idle window elapses, `None` when not
    /// tracking.
    pub fn time_until_expiry(&self) -> Option<Duration> {
        let inner = self.lock();
        match inner.state {
            SessionState::Active | SessionState::Expiring => {
                let deadline = inner.last_activity + self.idle_window;
                let remaining = deadline - Utc::now();
                Some(remaining.to_std().unwrap_or(Duration::ZERO))
            }
            SessionState::Inactive | SessionState::Timeout => None,
        }
    }

    /// Evaluate the idle clock and publish any transition. Called by the
    /// periodic checker; exposed so callers can force an immediate check.
    pub fn check_now(&self) -> SessionState {
        let (state, transitioned) = {
            let mut inner = self.lock();
            match inner.state {
                SessionState::Inactive | SessionState::Timeout => (inner.state, false),
                SessionState::Active | SessionState::Expiring => {
                    let idle = Utc::now() - inner.last_activity;
                    let next = if idle >= self.idle_window {
                        SessionState::Timeout
                    } else if idle >= self.idle_window - self.warning_margin {
                        SessionState::Expiring
                    } else {
                        SessionState::Active
                    };
                    let transitioned = next != inner.state;
                    inner.state = next;
                    (next, transitioned)
                }
            }
        };
        if transitioned {
            match state {
                SessionState::Timeout => info!("session timed out"),
                SessionState::Expiring => debug!("session expiring soon"),
                _ => {}
            }
            self.publish(state);
        }
        state
    }

    /// Periodic checker task. Stops on shutdown; timeout detection lags
    /// the deadline by at most one interval.
    pub fn spawn_checker(
        self: &std::sync::Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let tracker = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tracker.check_now();
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

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn publish(&self, state: SessionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    #[cfg(test)]
    fn backdate(&self, by: Duration) {
        self.lock().last_activity -= chrono::Duration::milliseconds(by.as_millis() as i64);
    }
}
