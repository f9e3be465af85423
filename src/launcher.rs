use crate::error::LoadError;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Outcome of one [`Launcher::run`] call
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LaunchSummary {
    pub attempted: usize,
    pub failed: usize,
}

/// Runs batches of independent actions with bounded concurrency.
///
/// Starting thousands of subscriptions at once would itself be a handshake
/// storm against the broker, so workers are started and stopped through
/// this instead of all at once.
#[derive(Debug, Clone)]
pub struct Launcher {
    concurrency: usize,
}

impl Launcher {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Runs every action exactly once with at most `concurrency` in flight
    /// and returns when all of them have finished. Failures are logged and
    /// counted; they never stop the remaining actions.
    pub async fn run<I, F, Fut>(&self, label: &str, actions: I) -> LaunchSummary
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), LoadError>> + Send + 'static,
    {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut summary = LaunchSummary::default();

        for action in actions {
            // Submission waits here once the ceiling is reached
            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .expect("launcher semaphore is never closed");
            summary.attempted += 1;
            tasks.spawn(async move {
                let result = action().await;
                drop(permit);
                result
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    summary.failed += 1;
                    error!("{}: {}", label, e);
                }
                Err(e) => {
                    summary.failed += 1;
                    error!("{}: task aborted: {}", label, e);
                }
            }
        }

        debug!(
            "{}: {} actions finished, {} failed",
            label, summary.attempted, summary.failed
        );
        summary
    }
}
