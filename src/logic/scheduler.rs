//! Periodic Task - restartable interval timer
//!
//! Backs the VL decay job, the heartbeat and the stats report. Starting a
//! running task aborts the previous timer first, so reloads never leak timers.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Named interval job
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn new(name: &'static str) -> Self {
        Self { name, handle: None }
    }

    /// (Re)start the job: `job` runs every `period`, first run one period from now
    pub fn start<F, Fut>(&mut self, runtime: &Handle, period: Duration, mut job: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stop();

        let period = period.max(Duration::from_millis(1));
        let name = self.name;
        log::debug!("Starting periodic task '{}' every {:?}", name, period);

        self.handle = Some(runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                job().await;
            }
        }));
    }

    /// Cancel the timer if running
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            log::debug!("Stopped periodic task '{}'", self.name);
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_runs_every_period() {
        let count = Arc::new(AtomicU32::new(0));
        let mut task = PeriodicTask::new("counter");

        let c = count.clone();
        task.start(&Handle::current(), Duration::from_secs(60), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(151)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_cancels_previous_timer() {
        let count = Arc::new(AtomicU32::new(0));
        let mut task = PeriodicTask::new("decay");

        for _ in 0..5 {
            let c = count.clone();
            task.start(&Handle::current(), Duration::from_secs(10), move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        task.stop();
        assert!(!task.is_running());
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
