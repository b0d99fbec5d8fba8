use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    cache::UserCache,
    domain::ChatId,
    messaging::MessagingPort,
    payments::reconcile::PaymentStatusHandler,
    store::{PaymentDoc, PaymentStatus, StorePort, SubscriptionDoc},
    Error, Result,
};

/// Applies a settled payment: replace the buyer's subscription with the
/// purchased plan, drop their cache entry so the next interaction sees it,
/// and notify both the buyer and the operations chat.
pub struct SubscriptionActivation {
    store: Arc<dyn StorePort>,
    cache: Arc<UserCache>,
    messenger: Arc<dyn MessagingPort>,
    ops_chat_id: ChatId,
}

impl SubscriptionActivation {
    pub fn new(
        store: Arc<dyn StorePort>,
        cache: Arc<UserCache>,
        messenger: Arc<dyn MessagingPort>,
        ops_chat_id: ChatId,
    ) -> Self {
        Self {
            store,
            cache,
            messenger,
            ops_chat_id,
        }
    }
}

#[async_trait]
impl PaymentStatusHandler for SubscriptionActivation {
    async fn on_status_changed(&self, payment: &PaymentDoc) -> Result<()> {
        if payment.status != PaymentStatus::Succeeded {
            return Ok(());
        }

        let plan = self
            .store
            .get_plan(&payment.product)
            .await?
            .ok_or_else(|| {
                Error::Store(format!("paid plan '{}' does not exist", payment.product))
            })?;

        let now = Utc::now();
        let sub = SubscriptionDoc {
            name: plan.name.clone(),
            description: plan.description.clone(),
            quota: plan.quota,
            expire_datetime: now + chrono::Duration::days(plan.expire_days),
        };
        self.store.set_subscription(payment.user_id, &sub).await?;
        self.cache.invalidate(payment.user_id).await;

        tracing::info!(
            user = payment.user_id.0,
            plan = %plan.name,
            payment = %payment.payment_id,
            "subscription activated"
        );

        // The bot talks to buyers in direct chats, where the chat id is the
        // user id.
        self.messenger
            .send_text(
                ChatId(payment.user_id.0),
                &format!(
                    "Payment received. Your \"{}\" subscription is now active: {} requests per day.",
                    plan.name, plan.quota
                ),
            )
            .await?;
        self.messenger
            .send_text(
                self.ops_chat_id,
                &format!(
                    "New subscription: \"{}\" bought by user {} for {:.2}.",
                    plan.name, payment.user_id.0, payment.price
                ),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MessageId, MessageRef, UserId, UserProfile};
    use crate::store::{MemoryStore, NewUserDefaults, PlanDoc};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingMessenger {
        sent: Mutex<Vec<(ChatId, String)>>,
    }

    #[async_trait]
    impl MessagingPort for RecordingMessenger {
        async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef> {
            self.sent.lock().await.push((chat_id, text.to_string()));
            Ok(MessageRef {
                chat_id,
                message_id: MessageId(1),
            })
        }

        async fn edit_text(&self, _msg: MessageRef, _text: &str) -> Result<()> {
            Ok(())
        }

        async fn delete_message(&self, _msg: MessageRef) -> Result<()> {
            Ok(())
        }
    }

    fn defaults() -> NewUserDefaults {
        NewUserDefaults {
            plan_name: "Free".to_string(),
            plan_description: "Standard plan".to_string(),
            quota: 10,
            expire_days: 2000,
            text_model: "gpt-3.5-turbo".to_string(),
        }
    }

    fn profile(id: i64) -> UserProfile {
        UserProfile {
            user_id: UserId(id),
            username: None,
            first_name: "Buyer".to_string(),
            last_name: None,
        }
    }

    fn payment(user: i64, status: PaymentStatus) -> PaymentDoc {
        PaymentDoc {
            payment_id: "pay-1".to_string(),
            user_id: UserId(user),
            created: Utc::now(),
            status,
            product: "Plus".to_string(),
            price: 299.0,
        }
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .seed_plan(PlanDoc {
                name: "Plus".to_string(),
                description: "100 requests per day".to_string(),
                price: 299.0,
                quota: 100,
                expire_days: 30,
            })
            .await;
        store
    }

    #[tokio::test]
    async fn succeeded_payment_replaces_subscription_and_notifies() {
        let store = seeded_store().await;
        let cache = Arc::new(UserCache::new(store.clone(), defaults()));
        let messenger = Arc::new(RecordingMessenger::default());
        let handler = SubscriptionActivation::new(
            store.clone(),
            cache.clone(),
            messenger.clone(),
            ChatId(-100),
        );

        // Buyer already known and cached with the free plan.
        let entry = cache.get(&profile(7)).await.unwrap();
        assert_eq!(entry.subscription().await.unwrap().name, "Free");

        handler
            .on_status_changed(&payment(7, PaymentStatus::Succeeded))
            .await
            .unwrap();

        // The cached entry was invalidated; a fresh lookup sees the plan.
        let entry = cache.get(&profile(7)).await.unwrap();
        let sub = entry.subscription().await.unwrap();
        assert_eq!(sub.name, "Plus");
        assert_eq!(sub.quota, 100);

        let sent = messenger.sent.lock().await.clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, ChatId(7));
        assert!(sent[0].1.contains("Plus"));
        assert_eq!(sent[1].0, ChatId(-100));
        assert!(sent[1].1.contains("user 7"));
    }

    #[tokio::test]
    async fn non_succeeded_statuses_are_ignored() {
        let store = seeded_store().await;
        let cache = Arc::new(UserCache::new(store.clone(), defaults()));
        let messenger = Arc::new(RecordingMessenger::default());
        let handler =
            SubscriptionActivation::new(store, cache, messenger.clone(), ChatId(-100));

        handler
            .on_status_changed(&payment(7, PaymentStatus::Canceled))
            .await
            .unwrap();
        assert!(messenger.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_plan_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(UserCache::new(store.clone(), defaults()));
        let messenger = Arc::new(RecordingMessenger::default());
        let handler = SubscriptionActivation::new(
            store.clone(),
            cache.clone(),
            messenger,
            ChatId(-100),
        );

        cache.get(&profile(7)).await.unwrap();
        let err = handler
            .on_status_changed(&payment(7, PaymentStatus::Succeeded))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }
}
