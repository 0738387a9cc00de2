//! Recovery controller
//!
//! Turns link failures into a bounded series of reconnection attempts. A
//! recovery episode starts when the link is observed down with an error and
//! ends when the link is observed up again or the attempts run out:
//!
//! ```text
//! failure ─ initial_delay ─► #1 ─ retry_delay×1 ─► #2 ─ retry_delay×2 ─► #3 ─► failed
//! ```
//!
//! The controller gives up as soon as the last attempt has been dispatched. A
//! link that still comes up afterwards is picked up by the next connected
//! observation. With `max_retries = 0` a failure goes straight to `failed`.
//!
//! Attempts only ask the orchestrator to re-negotiate; their outcome is learned
//! from later observations. Every timer belongs to an episode number so a
//! stale timer never touches a newer episode.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ClassroomResult;
use crate::events::{ClassroomEvent, EventEmitter};
use crate::session::SessionId;

/// Retry budget and backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub initial_delay: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(2_000),
            initial_delay: Duration::from_millis(1_000),
        }
    }
}

impl RecoveryPolicy {
    /// Wait before attempt `attempt` (1-based), measured from the failure for
    /// the first attempt and from the previous attempt otherwise
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            self.initial_delay
        } else {
            self.retry_delay.saturating_mul(attempt - 1)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStatus {
    Idle,
    Reconnecting,
    Connected,
    Failed,
}

/// What the UI banner shows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryState {
    pub retry_count: u32,
    pub max_retries: u32,
    pub is_recovering: bool,
    pub status: RecoveryStatus,
}

impl RecoveryState {
    pub fn new(max_retries: u32) -> Self {
        Self {
            retry_count: 0,
            max_retries,
            is_recovering: false,
            status: RecoveryStatus::Idle,
        }
    }

    pub fn banner(&self) -> String {
        match self.status {
            RecoveryStatus::Idle => "idle".to_string(),
            RecoveryStatus::Reconnecting => format!("reconnecting ({}/{})", self.retry_count, self.max_retries),
            RecoveryStatus::Connected => "connected".to_string(),
            RecoveryStatus::Failed => "failed".to_string(),
        }
    }
}

/// Entry point the controller calls to start a new negotiation
#[async_trait]
pub trait Reconnect: Send + Sync {
    async fn attempt_reconnect(&self) -> ClassroomResult<()>;
}

struct Machine {
    state: RecoveryState,
    episode: u64,
    timer: Option<JoinHandle<()>>,
    last_error: Option<String>,
    shut_down: bool,
}

impl Machine {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Stop automatic retries and wait for a manual one
    fn exhaust(&mut self) -> RecoveryState {
        self.timer = None;
        self.state.is_recovering = false;
        self.state.status = RecoveryStatus::Failed;
        self.state.clone()
    }
}

struct Inner {
    session_id: SessionId,
    policy: RecoveryPolicy,
    reconnect: Arc<dyn Reconnect>,
    emitter: Arc<EventEmitter>,
    machine: Mutex<Machine>,
}

/// Drives reconnection attempts for one session
#[derive(Clone)]
pub struct RecoveryController {
    inner: Arc<Inner>,
}

impl RecoveryController {
    pub fn new(
        session_id: SessionId,
        policy: RecoveryPolicy,
        reconnect: Arc<dyn Reconnect>,
        emitter: Arc<EventEmitter>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                session_id,
                policy,
                reconnect,
                emitter,
                machine: Mutex::new(Machine {
                    state: RecoveryState::new(policy.max_retries),
                    episode: 0,
                    timer: None,
                    last_error: None,
                    shut_down: false,
                }),
            }),
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.inner.machine.lock().state.clone()
    }

    /// Most recent error that started or fed an episode
    pub fn last_error(&self) -> Option<String> {
        self.inner.machine.lock().last_error.clone()
    }

    /// Feed the latest view of the link
    pub async fn observe(&self, is_connected: bool, last_error: Option<String>) {
        let changed = {
            let mut m = self.inner.machine.lock();
            if m.shut_down {
                return;
            }

            if is_connected && last_error.is_none() {
                let settled = m.state.status == RecoveryStatus::Connected
                    && m.state.retry_count == 0
                    && !m.state.is_recovering;
                if settled {
                    None
                } else {
                    m.episode += 1;
                    m.cancel_timer();
                    m.last_error = None;
                    m.state.retry_count = 0;
                    m.state.is_recovering = false;
                    m.state.status = RecoveryStatus::Connected;
                    Some(m.state.clone())
                }
            } else if !is_connected && last_error.is_some() {
                m.last_error = last_error;
                let busy = m.state.status == RecoveryStatus::Failed
                    || m.state.is_recovering
                    || m.state.retry_count > 0
                    || m.timer.is_some();
                if busy {
                    debug!("Recovery for {} already handled ({})", self.inner.session_id, m.state.banner());
                    None
                } else if self.inner.policy.max_retries == 0 {
                    m.episode += 1;
                    let state = m.exhaust();
                    warn!(
                        session_id = %self.inner.session_id,
                        "Link lost ({}), automatic reconnection disabled",
                        m.last_error.as_deref().unwrap_or("unknown")
                    );
                    Some(state)
                } else {
                    m.episode += 1;
                    m.state.status = RecoveryStatus::Reconnecting;
                    info!(
                        session_id = %self.inner.session_id,
                        "Link lost ({}), first reconnection attempt in {:?}",
                        m.last_error.as_deref().unwrap_or("unknown"),
                        self.inner.policy.initial_delay
                    );
                    let delay = self.inner.policy.delay_before_attempt(1);
                    Inner::schedule_attempt(&self.inner, &mut m, 1, delay);
                    Some(m.state.clone())
                }
            } else {
                None
            }
        };

        if let Some(state) = changed {
            self.inner.publish(state).await;
        }
    }

    /// Start a fresh episode right away, whatever the current status
    pub async fn manual_retry(&self) -> RecoveryState {
        let state = {
            let mut m = self.inner.machine.lock();
            if m.shut_down {
                return m.state.clone();
            }
            m.episode += 1;
            m.cancel_timer();
            m.state.retry_count = 0;
            m.state.is_recovering = false;
            m.state.status = RecoveryStatus::Reconnecting;
            info!(session_id = %self.inner.session_id, "Manual reconnection requested");
            Inner::schedule_attempt(&self.inner, &mut m, 1, Duration::ZERO);
            m.state.clone()
        };
        self.inner.publish(state.clone()).await;
        state
    }

    /// Clear every pending timer; later observations are ignored
    pub fn shutdown(&self) {
        let mut m = self.inner.machine.lock();
        m.shut_down = true;
        m.episode += 1;
        m.cancel_timer();
        debug!("Recovery controller for {} shut down", self.inner.session_id);
    }
}

impl Inner {
    fn schedule_attempt(inner: &Arc<Inner>, m: &mut Machine, attempt: u32, delay: Duration) {
        let episode = m.episode;
        let task_inner = inner.clone();
        m.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            Inner::run_attempt(task_inner, episode, attempt).await;
        }));
    }

    async fn run_attempt(inner: Arc<Inner>, episode: u64, attempt: u32) {
        let state = {
            let mut m = inner.machine.lock();
            if m.shut_down || m.episode != episode {
                return;
            }
            m.state.is_recovering = true;
            m.state.status = RecoveryStatus::Reconnecting;
            m.state.retry_count = (m.state.retry_count + 1).min(inner.policy.max_retries);
            m.state.clone()
        };
        info!(session_id = %inner.session_id, "Reconnection attempt {}/{}", attempt, inner.policy.max_retries);
        inner.publish(state).await;

        if let Err(e) = inner.reconnect.attempt_reconnect().await {
            warn!("Reconnection attempt {} for {} failed to start: {}", attempt, inner.session_id, e);
        }

        let state = {
            let mut m = inner.machine.lock();
            if m.shut_down || m.episode != episode {
                return;
            }
            if m.state.retry_count < inner.policy.max_retries {
                let next = m.state.retry_count + 1;
                let delay = inner.policy.delay_before_attempt(next);
                Inner::schedule_attempt(&inner, &mut m, next, delay);
                return;
            }
            m.exhaust()
        };
        warn!(
            session_id = %inner.session_id,
            "Reconnection failed after {} attempts, waiting for manual retry",
            state.retry_count
        );
        inner.publish(state).await;
    }

    async fn publish(&self, state: RecoveryState) {
        self.emitter
            .emit(ClassroomEvent::RecoveryStateChanged {
                session_id: self.session_id.clone(),
                state,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClassroomError;
    use tokio::time::Instant;

    struct CountingReconnect {
        calls: Mutex<Vec<Instant>>,
        fail: bool,
    }

    impl CountingReconnect {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail,
            })
        }

        fn count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl Reconnect for CountingReconnect {
        async fn attempt_reconnect(&self) -> ClassroomResult<()> {
            self.calls.lock().push(Instant::now());
            if self.fail {
                Err(ClassroomError::negotiation("offer rejected"))
            } else {
                Ok(())
            }
        }
    }

    fn controller(reconnect: Arc<CountingReconnect>) -> (RecoveryController, Arc<EventEmitter>) {
        let emitter = Arc::new(EventEmitter::new());
        let controller = RecoveryController::new("s".into(), RecoveryPolicy::default(), reconnect, emitter.clone());
        (controller, emitter)
    }

    fn assert_near(actual: Duration, expected: Duration) {
        assert!(
            actual >= expected && actual < expected + Duration::from_millis(10),
            "expected ~{:?}, got {:?}",
            expected,
            actual
        );
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RecoveryPolicy::default();
        assert_eq!(policy.delay_before_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_before_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_before_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_before_attempt(4), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_after_three_attempts() {
        let reconnect = CountingReconnect::new(false);
        let (controller, emitter) = controller(reconnect.clone());
        let mut events = emitter.listen();
        let start = Instant::now();

        controller.observe(false, Some("connection lost".into())).await;
        tokio::time::sleep(Duration::from_millis(6_900)).await;
        assert_eq!(reconnect.count(), 2);
        assert_eq!(controller.state().status, RecoveryStatus::Reconnecting);

        // the third attempt is the last one; failed right after it is made
        tokio::time::sleep(Duration::from_millis(200)).await;
        let calls = reconnect.calls.lock().clone();
        assert_eq!(calls.len(), 3);
        assert_near(calls[0] - start, Duration::from_secs(1));
        assert_near(calls[1] - start, Duration::from_secs(3));
        assert_near(calls[2] - start, Duration::from_secs(7));

        let state = controller.state();
        assert_eq!(state.status, RecoveryStatus::Failed);
        assert_eq!(state.retry_count, 3);
        assert!(!state.is_recovering);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(reconnect.count(), 3);

        // no automatic retries once failed
        controller.observe(false, Some("still down".into())).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(reconnect.count(), 3);

        let mut counts = Vec::new();
        while let Ok(ClassroomEvent::RecoveryStateChanged { state, .. }) = events.try_recv() {
            counts.push(state.retry_count);
        }
        assert!(counts.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(counts.last(), Some(&3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_budget_fails_without_attempting() {
        let reconnect = CountingReconnect::new(false);
        let emitter = Arc::new(EventEmitter::new());
        let policy = RecoveryPolicy {
            max_retries: 0,
            ..RecoveryPolicy::default()
        };
        let controller = RecoveryController::new("s".into(), policy, reconnect.clone(), emitter);

        controller.observe(false, Some("connection lost".into())).await;
        let state = controller.state();
        assert_eq!(state.status, RecoveryStatus::Failed);
        assert_eq!(state.retry_count, 0);
        assert!(!state.is_recovering);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(reconnect.count(), 0);

        controller.observe(true, None).await;
        assert_eq!(controller.state().status, RecoveryStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_after_last_attempt_recovers() {
        let reconnect = CountingReconnect::new(false);
        let (controller, _emitter) = controller(reconnect.clone());

        controller.observe(false, Some("connection lost".into())).await;
        tokio::time::sleep(Duration::from_millis(7_100)).await;
        assert_eq!(controller.state().status, RecoveryStatus::Failed);

        controller.observe(true, None).await;
        let state = controller.state();
        assert_eq!(state.status, RecoveryStatus::Connected);
        assert_eq!(state.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_resets_episode() {
        let reconnect = CountingReconnect::new(false);
        let (controller, _emitter) = controller(reconnect.clone());

        controller.observe(false, Some("connection lost".into())).await;
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(controller.state().retry_count, 1);

        controller.observe(true, None).await;
        let state = controller.state();
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.status, RecoveryStatus::Connected);
        assert!(!state.is_recovering);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(reconnect.count(), 1);

        // a later failure opens a new episode
        controller.observe(false, Some("connection lost".into())).await;
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(reconnect.count(), 2);
        assert_eq!(controller.state().retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempt_still_counts() {
        let reconnect = CountingReconnect::new(true);
        let (controller, _emitter) = controller(reconnect.clone());

        controller.observe(false, Some("offer timed out".into())).await;
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        assert_eq!(controller.state().retry_count, 2);
        assert_eq!(controller.last_error().as_deref(), Some("offer timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_without_error_is_ignored() {
        let reconnect = CountingReconnect::new(false);
        let (controller, _emitter) = controller(reconnect.clone());

        controller.observe(false, None).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(reconnect.count(), 0);
        assert_eq!(controller.state().status, RecoveryStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_retry_after_failure() {
        let reconnect = CountingReconnect::new(false);
        let (controller, _emitter) = controller(reconnect.clone());

        controller.observe(false, Some("connection lost".into())).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(controller.state().status, RecoveryStatus::Failed);

        let state = controller.manual_retry().await;
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.status, RecoveryStatus::Reconnecting);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(reconnect.count(), 4);
        assert_eq!(controller.state().banner(), "reconnecting (1/3)");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_clears_pending_timer() {
        let reconnect = CountingReconnect::new(false);
        let (controller, _emitter) = controller(reconnect.clone());

        controller.observe(false, Some("connection lost".into())).await;
        controller.shutdown();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(reconnect.count(), 0);

        controller.observe(false, Some("connection lost".into())).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(reconnect.count(), 0);
    }
}
