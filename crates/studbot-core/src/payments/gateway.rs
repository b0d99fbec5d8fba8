use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    domain::UserId,
    store::{PaymentDoc, PaymentStatus, PlanDoc, StorePort},
    Result,
};

/// Payment creation parameters handed to the gateway.
#[derive(Clone, Debug)]
pub struct PaymentRequest {
    pub amount: f64,
    pub description: String,
    pub receipt_email: String,
}

/// Gateway's answer to a creation call.
#[derive(Clone, Debug)]
pub struct CreatedPayment {
    pub payment_id: String,
    /// Hosted page the user must visit to confirm the payment.
    pub confirmation_url: String,
}

/// A payment as the gateway currently sees it.
#[derive(Clone, Debug)]
pub struct GatewayPayment {
    pub payment_id: String,
    pub status: PaymentStatus,
}

/// Port to the external payment gateway.
#[async_trait]
pub trait PaymentGatewayPort: Send + Sync {
    async fn create_payment(&self, request: &PaymentRequest) -> Result<CreatedPayment>;
    /// Current gateway-side state of one payment, by external id.
    async fn get_payment(&self, payment_id: &str) -> Result<GatewayPayment>;
    /// Most recent settled payments, newest first, at most `limit`.
    async fn list_succeeded(&self, limit: usize) -> Result<Vec<GatewayPayment>>;
    async fn cancel_payment(&self, payment_id: &str) -> Result<()>;
}

/// Purchase initiation: one gateway payment plus one local pending record.
///
/// The local record is the source of truth for "which user bought which
/// plan"; the gateway only ever reports ids and statuses back.
pub struct Billing {
    gateway: Arc<dyn PaymentGatewayPort>,
    store: Arc<dyn StorePort>,
    receipt_email: String,
}

impl Billing {
    pub fn new(
        gateway: Arc<dyn PaymentGatewayPort>,
        store: Arc<dyn StorePort>,
        receipt_email: String,
    ) -> Self {
        Self {
            gateway,
            store,
            receipt_email,
        }
    }

    /// Start a purchase of `plan` for `user_id`. Returns the confirmation
    /// URL to hand to the user.
    pub async fn start_purchase(&self, user_id: UserId, plan: &PlanDoc) -> Result<String> {
        let created = self
            .gateway
            .create_payment(&PaymentRequest {
                amount: plan.price,
                description: plan.description.clone(),
                receipt_email: self.receipt_email.clone(),
            })
            .await?;

        self.store
            .insert_payment(&PaymentDoc {
                payment_id: created.payment_id.clone(),
                user_id,
                created: Utc::now(),
                status: PaymentStatus::Pending,
                product: plan.name.clone(),
                price: plan.price,
            })
            .await?;

        tracing::info!(
            user = user_id.0,
            payment = %created.payment_id,
            plan = %plan.name,
            "purchase initiated"
        );
        Ok(created.confirmation_url)
    }

    /// Ask the gateway for a payment's current status. The local record is
    /// untouched; only the reconciliation loop mutates it.
    pub async fn payment_status(&self, payment_id: &str) -> Result<GatewayPayment> {
        self.gateway.get_payment(payment_id).await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tokio::sync::Mutex;

    /// Gateway double: scripted settled list, recorded creations.
    #[derive(Default)]
    pub struct FakeGateway {
        pub settled: Mutex<Vec<GatewayPayment>>,
        pub created: Mutex<Vec<PaymentRequest>>,
        pub cancelled: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PaymentGatewayPort for FakeGateway {
        async fn create_payment(&self, request: &PaymentRequest) -> Result<CreatedPayment> {
            let mut created = self.created.lock().await;
            created.push(request.clone());
            let n = created.len();
            Ok(CreatedPayment {
                payment_id: format!("pay-{n}"),
                confirmation_url: format!("https://gw.example.org/confirm/pay-{n}"),
            })
        }

        async fn get_payment(&self, payment_id: &str) -> Result<GatewayPayment> {
            self.settled
                .lock()
                .await
                .iter()
                .find(|p| p.payment_id == payment_id)
                .cloned()
                .ok_or_else(|| crate::Error::Gateway(format!("no payment {payment_id}")))
        }

        async fn list_succeeded(&self, limit: usize) -> Result<Vec<GatewayPayment>> {
            let settled = self.settled.lock().await;
            Ok(settled.iter().take(limit).cloned().collect())
        }

        async fn cancel_payment(&self, payment_id: &str) -> Result<()> {
            self.cancelled.lock().await.push(payment_id.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FakeGateway;
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn start_purchase_records_pending_payment() {
        let gateway = Arc::new(FakeGateway::default());
        let store = Arc::new(MemoryStore::new());
        let billing = Billing::new(gateway.clone(), store.clone(), "r@example.org".to_string());

        let plan = PlanDoc {
            name: "Plus".to_string(),
            description: "100 requests per day".to_string(),
            price: 299.0,
            quota: 100,
            expire_days: 30,
        };

        let url = billing.start_purchase(UserId(9), &plan).await.unwrap();
        assert_eq!(url, "https://gw.example.org/confirm/pay-1");

        let doc = store.get_payment("pay-1").await.unwrap().unwrap();
        assert_eq!(doc.user_id, UserId(9));
        assert_eq!(doc.status, PaymentStatus::Pending);
        assert_eq!(doc.product, "Plus");
        assert_eq!(doc.price, 299.0);

        let requests = gateway.created.lock().await;
        assert_eq!(requests[0].amount, 299.0);
        assert_eq!(requests[0].receipt_email, "r@example.org");
    }

    #[tokio::test]
    async fn payment_status_comes_from_the_gateway() {
        let gateway = Arc::new(FakeGateway::default());
        gateway.settled.lock().await.push(GatewayPayment {
            payment_id: "pay-9".to_string(),
            status: PaymentStatus::Succeeded,
        });
        let store = Arc::new(MemoryStore::new());
        let billing = Billing::new(gateway, store, "r@example.org".to_string());

        let payment = billing.payment_status("pay-9").await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Succeeded);

        let err = billing.payment_status("pay-404").await.unwrap_err();
        assert!(matches!(err, crate::Error::Gateway(_)));
    }
}
