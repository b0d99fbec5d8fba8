use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    payments::gateway::PaymentGatewayPort,
    report::CrashReportPort,
    store::{PaymentDoc, StorePort},
    Result,
};

/// Reacts to a payment status transition. Called after the local record has
/// been updated, so `payment.status` is already the new status.
#[async_trait]
pub trait PaymentStatusHandler: Send + Sync {
    async fn on_status_changed(&self, payment: &PaymentDoc) -> Result<()>;
}

/// Polls the gateway for settled payments and applies each status
/// transition to the local record exactly once.
///
/// Replays are cheap: a payment whose local status already matches the
/// gateway's is skipped, so seeing the same settled payment on every poll
/// fires handlers at most once.
pub struct Reconciler {
    gateway: Arc<dyn PaymentGatewayPort>,
    store: Arc<dyn StorePort>,
    handlers: Vec<Arc<dyn PaymentStatusHandler>>,
    report: Arc<dyn CrashReportPort>,
    page_limit: usize,
}

impl Reconciler {
    pub fn new(
        gateway: Arc<dyn PaymentGatewayPort>,
        store: Arc<dyn StorePort>,
        report: Arc<dyn CrashReportPort>,
        page_limit: usize,
    ) -> Self {
        Self {
            gateway,
            store,
            handlers: Vec::new(),
            report,
            page_limit,
        }
    }

    pub fn register(&mut self, handler: Arc<dyn PaymentStatusHandler>) {
        self.handlers.push(handler);
    }

    /// One reconciliation pass. Returns the number of transitions applied.
    pub async fn poll_once(&self) -> Result<usize> {
        let settled = self.gateway.list_succeeded(self.page_limit).await?;
        let mut applied = 0;

        for remote in settled {
            let Some(local) = self.store.get_payment(&remote.payment_id).await? else {
                // Not ours (another deployment, or manual gateway activity).
                tracing::debug!(payment = %remote.payment_id, "settled payment has no local record");
                continue;
            };
            if local.status == remote.status {
                continue;
            }

            self.store
                .update_payment_status(&remote.payment_id, remote.status)
                .await?;
            applied += 1;
            tracing::info!(
                payment = %remote.payment_id,
                from = local.status.as_str(),
                to = remote.status.as_str(),
                "payment status changed"
            );

            let updated = PaymentDoc {
                status: remote.status,
                ..local
            };
            for handler in &self.handlers {
                // The transition is already recorded; a handler failure is
                // reported, not retried.
                if let Err(err) = handler.on_status_changed(&updated).await {
                    tracing::error!(payment = %updated.payment_id, error = %err, "payment handler failed");
                    self.report.capture("payment handler", &err).await;
                }
            }
        }
        Ok(applied)
    }

    /// Poll until `shutdown` fires. Gateway or store errors are logged and
    /// the loop keeps its cadence.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        tracing::info!(?interval, "payment reconciler started");
        loop {
            if let Err(err) = self.poll_once().await {
                tracing::warn!(error = %err, "payment reconciliation pass failed");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::info!("payment reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UserId;
    use crate::payments::gateway::test_support::FakeGateway;
    use crate::payments::gateway::GatewayPayment;
    use crate::report::LogReporter;
    use crate::store::{MemoryStore, PaymentStatus};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    fn pending_payment(id: &str, user: i64) -> PaymentDoc {
        PaymentDoc {
            payment_id: id.to_string(),
            user_id: UserId(user),
            created: Utc::now(),
            status: PaymentStatus::Pending,
            product: "Plus".to_string(),
            price: 299.0,
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<PaymentDoc>>,
    }

    #[async_trait]
    impl PaymentStatusHandler for RecordingHandler {
        async fn on_status_changed(&self, payment: &PaymentDoc) -> Result<()> {
            self.seen.lock().await.push(payment.clone());
            Ok(())
        }
    }

    struct FailingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PaymentStatusHandler for FailingHandler {
        async fn on_status_changed(&self, _payment: &PaymentDoc) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(crate::Error::Store("handler broke".to_string()))
        }
    }

    #[tokio::test]
    async fn settled_payment_is_applied_exactly_once() {
        let gateway = Arc::new(FakeGateway::default());
        let store = Arc::new(MemoryStore::new());
        store.insert_payment(&pending_payment("pay-1", 7)).await.unwrap();
        gateway.settled.lock().await.push(GatewayPayment {
            payment_id: "pay-1".to_string(),
            status: PaymentStatus::Succeeded,
        });

        let handler = Arc::new(RecordingHandler::default());
        let mut reconciler =
            Reconciler::new(gateway, store.clone(), Arc::new(LogReporter), 20);
        reconciler.register(handler.clone());

        assert_eq!(reconciler.poll_once().await.unwrap(), 1);
        let seen = handler.seen.lock().await.clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, PaymentStatus::Succeeded);
        assert_eq!(seen[0].user_id, UserId(7));

        let local = store.get_payment("pay-1").await.unwrap().unwrap();
        assert_eq!(local.status, PaymentStatus::Succeeded);

        // The gateway keeps reporting it; nothing fires again.
        assert_eq!(reconciler.poll_once().await.unwrap(), 0);
        assert_eq!(handler.seen.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_payments_are_skipped() {
        let gateway = Arc::new(FakeGateway::default());
        gateway.settled.lock().await.push(GatewayPayment {
            payment_id: "stranger".to_string(),
            status: PaymentStatus::Succeeded,
        });

        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(gateway, store, Arc::new(LogReporter), 20);
        assert_eq!(reconciler.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn handler_failure_does_not_roll_back_the_transition() {
        let gateway = Arc::new(FakeGateway::default());
        let store = Arc::new(MemoryStore::new());
        store.insert_payment(&pending_payment("pay-2", 8)).await.unwrap();
        gateway.settled.lock().await.push(GatewayPayment {
            payment_id: "pay-2".to_string(),
            status: PaymentStatus::Succeeded,
        });

        let failing = Arc::new(FailingHandler {
            calls: AtomicUsize::new(0),
        });
        let mut reconciler =
            Reconciler::new(gateway, store.clone(), Arc::new(LogReporter), 20);
        reconciler.register(failing.clone());

        assert_eq!(reconciler.poll_once().await.unwrap(), 1);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        let local = store.get_payment("pay-2").await.unwrap().unwrap();
        assert_eq!(local.status, PaymentStatus::Succeeded);

        // Status already matches; the failing handler is not retried.
        assert_eq!(reconciler.poll_once().await.unwrap(), 0);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn page_limit_caps_a_pass() {
        let gateway = Arc::new(FakeGateway::default());
        let store = Arc::new(MemoryStore::new());
        for i in 0..5 {
            let id = format!("pay-{i}");
            store.insert_payment(&pending_payment(&id, i)).await.unwrap();
            gateway.settled.lock().await.push(GatewayPayment {
                payment_id: id,
                status: PaymentStatus::Succeeded,
            });
        }

        let reconciler = Reconciler::new(gateway, store, Arc::new(LogReporter), 2);
        assert_eq!(reconciler.poll_once().await.unwrap(), 2);
        // Same page again: already applied, nothing new fires.
        assert_eq!(reconciler.poll_once().await.unwrap(), 0);
    }
}
