//! The boundary between the sync core and the server that hosts it.

use crate::config::ConfigProvider;
use crate::name::NameResource;
use crate::rank::{RankMapping, RankResource};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

/// What a periodic task wants after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskControl {
    Continue,
    Stop,
}

/// A periodic task. Called once per period; the timer stops on [`TaskControl::Stop`].
pub type TimerTask = Arc<dyn Fn() -> BoxFuture<'static, TaskControl> + Send + Sync>;

/// Services the host server provides to the lifecycle manager.
#[async_trait]
pub trait RankSyncHost: Send + Sync {
    fn config(&self) -> &dyn ConfigProvider;

    /// Directory the core may create its `data/` subdirectory in.
    fn data_folder(&self) -> &Path;

    fn create_name_resource(&self) -> Arc<dyn NameResource>;

    /// Checks that the host's permission system is usable with `mapping`.
    ///
    /// `None` aborts startup before any listener is registered.
    async fn validate_dependencies(&self, mapping: &RankMapping) -> Option<Arc<dyn RankResource>>;

    /// Runs `task` after `delay` and then every `period`.
    fn run_task_timer(&self, task: TimerTask, delay: Duration, period: Duration) {
        TokioTaskTimer::spawn(task, delay, period);
    }
}

/// Reference timer on the tokio runtime.
pub struct TokioTaskTimer;

impl TokioTaskTimer {
    pub fn spawn(task: TimerTask, delay: Duration, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if task().await == TaskControl::Stop {
                    trace!("Timer task stopped");
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn timer_runs_until_the_task_stops_it() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let task: TimerTask = Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                if counter.fetch_add(1, Ordering::SeqCst) + 1 >= 3 {
                    TaskControl::Stop
                } else {
                    TaskControl::Continue
                }
            })
        });

        let handle = TokioTaskTimer::spawn(task, Duration::from_secs(5), Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        handle.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
