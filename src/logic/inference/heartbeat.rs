//! Heartbeat Scheduler
//!
//! Periodic liveness check on the active session. One failure is tolerated;
//! a second consecutive failure reports the connection lost, and a reply
//! saying the session expired reports that immediately. Each loss is
//! reported once until the scheduler is restarted for a new session.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::constants::MAX_HEARTBEAT_FAILURES;
use crate::logic::scheduler::PeriodicTask;
use super::error::{is_session_expired, InferenceResult};
use super::session::HeartbeatTarget;

/// Why the session has to be replaced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatLoss {
    /// Consecutive failures reached the limit
    ConnectionLost(String),
    /// Server no longer knows the session
    SessionExpired(String),
}

impl HeartbeatLoss {
    pub fn reason(&self) -> &str {
        match self {
            HeartbeatLoss::ConnectionLost(r) | HeartbeatLoss::SessionExpired(r) => r,
        }
    }
}

/// Result of feeding one heartbeat outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    Healthy,
    /// Failure below the limit
    Tolerated { failures: u32 },
    /// Report this loss now
    Lost(HeartbeatLoss),
    /// Loss already reported for this session
    AlreadyReported,
}

/// Failure streak bookkeeping
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    failures: u32,
    max_failures: u32,
    reported: bool,
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new(MAX_HEARTBEAT_FAILURES)
    }
}

impl HeartbeatMonitor {
    pub fn new(max_failures: u32) -> Self {
        Self {
            failures: 0,
            max_failures: max_failures.max(1),
            reported: false,
        }
    }

    pub fn record(&mut self, outcome: &InferenceResult<i64>) -> HeartbeatVerdict {
        let error = match outcome {
            Ok(_) => {
                self.failures = 0;
                return HeartbeatVerdict::Healthy;
            }
            Err(e) => e,
        };

        if self.reported {
            return HeartbeatVerdict::AlreadyReported;
        }

        self.failures += 1;
        log::warn!(
            "[Inference] Heartbeat failed ({}/{}): {}",
            self.failures,
            self.max_failures,
            error
        );

        let loss = if is_session_expired(error) {
            HeartbeatLoss::SessionExpired(error.to_string())
        } else if self.failures >= self.max_failures {
            HeartbeatLoss::ConnectionLost(error.to_string())
        } else {
            return HeartbeatVerdict::Tolerated { failures: self.failures };
        };

        self.reported = true;
        HeartbeatVerdict::Lost(loss)
    }

    /// Start over for a new session
    pub fn rearm(&mut self) {
        self.failures = 0;
        self.reported = false;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

type LossCallback = Arc<dyn Fn(HeartbeatLoss) + Send + Sync>;
type VerdictCallback = Arc<dyn Fn(&HeartbeatVerdict) + Send + Sync>;

/// Runs heartbeats against a target on a restartable timer
pub struct HeartbeatScheduler {
    task: PeriodicTask,
    monitor: Arc<Mutex<HeartbeatMonitor>>,
}

impl Default for HeartbeatScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatScheduler {
    pub fn new() -> Self {
        Self {
            task: PeriodicTask::new("heartbeat"),
            monitor: Arc::new(Mutex::new(HeartbeatMonitor::default())),
        }
    }

    /// (Re)start for a session. `on_loss` runs at most once per start;
    /// `on_verdict` sees every outcome (state tracking).
    pub fn start(
        &mut self,
        runtime: &Handle,
        interval: Duration,
        target: Arc<dyn HeartbeatTarget>,
        on_loss: LossCallback,
        on_verdict: Option<VerdictCallback>,
    ) {
        self.monitor.lock().rearm();
        let monitor = self.monitor.clone();

        self.task.start(runtime, interval, move || {
            let target = target.clone();
            let monitor = monitor.clone();
            let on_loss = on_loss.clone();
            let on_verdict = on_verdict.clone();
            async move {
                let outcome = target.heartbeat().await;
                let verdict = monitor.lock().record(&outcome);
                if let Some(cb) = on_verdict.as_ref() {
                    cb(&verdict);
                }
                if let HeartbeatVerdict::Lost(loss) = verdict {
                    log::error!("[Inference] Heartbeat check failed: {}", loss.reason());
                    on_loss(loss);
                }
            }
        });
        log::info!("[Inference] Heartbeat scheduler started (interval: {:?})", interval);
    }

    pub fn stop(&mut self) {
        if self.task.is_running() {
            self.task.stop();
            log::info!("[Inference] Heartbeat scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    pub fn failures(&self) -> u32 {
        self.monitor.lock().failures()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::inference::error::InferenceError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedTarget {
        outcomes: Mutex<VecDeque<InferenceResult<i64>>>,
    }

    #[async_trait]
    impl HeartbeatTarget for ScriptedTarget {
        async fn heartbeat(&self) -> InferenceResult<i64> {
            self.outcomes
                .lock()
                .pop_front()
                .unwrap_or(Err(InferenceError::Transport("down".into())))
        }
    }

    fn transient() -> InferenceResult<i64> {
        Err(InferenceError::Timeout(5000))
    }

    #[test]
    fn test_single_failure_tolerated() {
        let mut monitor = HeartbeatMonitor::default();
        assert_eq!(monitor.record(&transient()), HeartbeatVerdict::Tolerated { failures: 1 });
        assert_eq!(monitor.record(&Ok(1)), HeartbeatVerdict::Healthy);
        assert_eq!(monitor.record(&transient()), HeartbeatVerdict::Tolerated { failures: 1 });
    }

    #[test]
    fn test_two_failures_report_once() {
        let mut monitor = HeartbeatMonitor::default();
        monitor.record(&transient());
        assert!(matches!(
            monitor.record(&transient()),
            HeartbeatVerdict::Lost(HeartbeatLoss::ConnectionLost(_))
        ));
        assert_eq!(monitor.record(&transient()), HeartbeatVerdict::AlreadyReported);

        monitor.rearm();
        assert_eq!(monitor.record(&transient()), HeartbeatVerdict::Tolerated { failures: 1 });
    }

    #[test]
    fn test_malformed_reply_counts_as_failure() {
        let mut monitor = HeartbeatMonitor::default();
        let garbled = Err(InferenceError::Protocol("bad Heartbeat reply: invalid type".into()));
        assert_eq!(monitor.record(&garbled), HeartbeatVerdict::Tolerated { failures: 1 });
        assert!(matches!(
            monitor.record(&garbled),
            HeartbeatVerdict::Lost(HeartbeatLoss::ConnectionLost(_))
        ));
    }

    #[test]
    fn test_expired_session_reports_immediately() {
        let mut monitor = HeartbeatMonitor::default();
        let expired = Err(InferenceError::Session("NOT_AUTHENTICATED: expired".into()));
        assert!(matches!(
            monitor.record(&expired),
            HeartbeatVerdict::Lost(HeartbeatLoss::SessionExpired(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_invokes_callback_exactly_once() {
        let target = Arc::new(ScriptedTarget {
            outcomes: Mutex::new(VecDeque::from(vec![Ok(1), transient(), transient(), transient()])),
        });
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let mut scheduler = HeartbeatScheduler::new();
        scheduler.start(
            &Handle::current(),
            Duration::from_secs(30),
            target,
            Arc::new(move |loss: HeartbeatLoss| {
                assert!(matches!(loss, HeartbeatLoss::ConnectionLost(_)));
                c.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        );

        tokio::time::sleep(Duration::from_secs(30 * 6 + 1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        scheduler.stop();
        assert!(!scheduler.is_running());
    }
}
