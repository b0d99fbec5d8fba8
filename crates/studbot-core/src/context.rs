//! Process-wide wiring.
//!
//! All shared services live in one explicitly-passed [`AppContext`]; nothing
//! in the crate reaches for globals. Background loops are spawned through
//! the context's [`TaskRegistry`] so shutdown can cancel and join every one
//! of them.

use std::sync::Arc;

use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::UserCache,
    config::Config,
    limiter::AdmissionGate,
    messaging::MessagingPort,
    report::CrashReportPort,
    store::{NewUserDefaults, StorePort},
};

/// Named background tasks plus the cancellation token they all watch.
#[derive(Default)]
pub struct TaskRegistry {
    shutdown: CancellationToken,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token background loops should select on.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn spawn<F>(&self, name: &str, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tracing::debug!(task = name, "background task spawned");
        self.tasks
            .lock()
            .await
            .push((name.to_string(), tokio::spawn(task)));
    }

    /// Cancel every registered task and wait for each to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let drained: Vec<(String, JoinHandle<()>)> =
            self.tasks.lock().await.drain(..).collect();
        for (name, handle) in drained {
            match handle.await {
                Ok(()) => tracing::debug!(task = %name, "background task finished"),
                Err(err) => tracing::error!(task = %name, error = %err, "background task aborted"),
            }
        }
    }
}

/// Everything a handler or background loop needs, threaded explicitly.
pub struct AppContext {
    pub config: Config,
    pub store: Arc<dyn StorePort>,
    pub cache: Arc<UserCache>,
    pub gate: Arc<AdmissionGate>,
    pub messenger: Arc<dyn MessagingPort>,
    pub report: Arc<dyn CrashReportPort>,
    pub tasks: TaskRegistry,
}

impl AppContext {
    pub fn new(
        config: Config,
        store: Arc<dyn StorePort>,
        messenger: Arc<dyn MessagingPort>,
        report: Arc<dyn CrashReportPort>,
    ) -> Self {
        let cache = Arc::new(UserCache::new(
            store.clone(),
            NewUserDefaults::from_config(&config),
        ));
        Self {
            config,
            store,
            cache,
            gate: Arc::new(AdmissionGate::new()),
            messenger,
            report,
            tasks: TaskRegistry::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_cancels_and_joins_registered_tasks() {
        let registry = TaskRegistry::new();
        let stopped = Arc::new(AtomicBool::new(false));

        let token = registry.shutdown_token();
        let flag = stopped.clone();
        registry
            .spawn("ticker", async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                    }
                }
                flag.store(true, Ordering::SeqCst);
            })
            .await;

        registry.shutdown().await;
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_with_no_tasks_is_a_no_op() {
        let registry = TaskRegistry::new();
        registry.shutdown().await;
    }
}
