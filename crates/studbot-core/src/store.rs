//! Persistent-store port and the per-collection document schemas.
//!
//! The store itself is an external collaborator; everything it holds is
//! described by the typed documents below, and deserialization is the single
//! validation boundary (see [`decode_field`]). Field-level writes return the
//! post-write value so callers can adopt what the store actually persisted
//! instead of echoing their local write.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    config::Config,
    domain::{ChatId, MessageId, UserId, UserProfile},
    Error, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    User,
    Admin,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Canceled,
    WaitingForCapture,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Canceled => "canceled",
            PaymentStatus::WaitingForCapture => "waiting_for_capture",
        }
    }
}

/// Subscription sub-document: plan name, remaining daily quota and expiry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionDoc {
    pub name: String,
    pub description: String,
    pub quota: i64,
    pub expire_datetime: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SettingsDoc {
    pub text_model: String,
    pub stream_mode: bool,
    pub dialogue_mode: bool,
    pub gpt_role: Option<String>,
    pub language_code: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsDoc {
    pub image_prompts: i64,
    pub text_prompts: i64,
}

/// The whole persisted state for one user (`users` collection).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserDoc {
    pub user_id: UserId,
    pub reg_date: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: Option<String>,
    pub role: UserRole,
    pub banned: bool,
    pub email: Option<String>,
    pub subscription: SubscriptionDoc,
    pub settings: SettingsDoc,
    pub statistics: StatisticsDoc,
}

/// Defaults applied when a user is seen for the first time.
#[derive(Clone, Debug)]
pub struct NewUserDefaults {
    pub plan_name: String,
    pub plan_description: String,
    pub quota: i64,
    pub expire_days: i64,
    pub text_model: String,
}

impl NewUserDefaults {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            plan_name: cfg.free_plan_name.clone(),
            plan_description: cfg.free_plan_description.clone(),
            quota: cfg.free_plan_quota,
            expire_days: cfg.free_plan_expire_days,
            text_model: cfg.default_text_model.clone(),
        }
    }
}

impl UserDoc {
    /// Default aggregate for a first-contact user.
    pub fn fresh(profile: &UserProfile, defaults: &NewUserDefaults, now: DateTime<Utc>) -> Self {
        Self {
            user_id: profile.user_id,
            reg_date: now,
            last_update: now,
            username: profile.username.clone(),
            first_name: profile.first_name.clone(),
            last_name: profile.last_name.clone(),
            role: UserRole::User,
            banned: false,
            email: None,
            subscription: SubscriptionDoc {
                name: defaults.plan_name.clone(),
                description: defaults.plan_description.clone(),
                quota: defaults.quota,
                expire_datetime: now + chrono::Duration::days(defaults.expire_days),
            },
            settings: SettingsDoc {
                text_model: defaults.text_model.clone(),
                stream_mode: false,
                dialogue_mode: false,
                gpt_role: None,
                language_code: None,
            },
            statistics: StatisticsDoc::default(),
        }
    }
}

/// Purchasable plan (`plans` collection).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanDoc {
    pub name: String,
    pub description: String,
    pub price: f64,
    pub quota: i64,
    pub expire_days: i64,
}

/// Local payment record (`payments` collection), keyed by the gateway's
/// external payment id. Created at payment initiation; status updated only
/// by the reconciliation loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentDoc {
    pub payment_id: String,
    pub user_id: UserId,
    pub created: DateTime<Utc>,
    pub status: PaymentStatus,
    pub product: String,
    pub price: f64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// Completed generation (`completions` collection), keyed by chat + answer
/// message id so replies can continue the conversation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletionDoc {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub created: DateTime<Utc>,
    pub model: String,
    pub total_tokens: i64,
    pub history: Vec<ChatTurn>,
}

/// Port to the persistent store.
///
/// `upsert_user` is an unconditional whole-document overwrite keyed by
/// identity: last-writer-wins, no optimistic concurrency token. The `set_*`
/// and `incr_*` methods are single-field writes that return the post-write
/// value for verification.
#[async_trait]
pub trait StorePort: Send + Sync {
    async fn get_user(&self, user_id: UserId) -> Result<Option<UserDoc>>;
    async fn insert_user(&self, doc: &UserDoc) -> Result<()>;
    async fn upsert_user(&self, doc: &UserDoc) -> Result<()>;

    async fn set_subscription(
        &self,
        user_id: UserId,
        sub: &SubscriptionDoc,
    ) -> Result<SubscriptionDoc>;
    async fn set_quota(&self, user_id: UserId, quota: i64) -> Result<i64>;
    async fn set_last_update(&self, user_id: UserId, at: DateTime<Utc>) -> Result<()>;
    async fn set_email(&self, user_id: UserId, email: &str) -> Result<String>;
    async fn set_text_model(&self, user_id: UserId, model: &str) -> Result<String>;
    async fn set_stream_mode(&self, user_id: UserId, enabled: bool) -> Result<bool>;
    async fn set_dialogue_mode(&self, user_id: UserId, enabled: bool) -> Result<bool>;
    async fn set_gpt_role(&self, user_id: UserId, role: Option<&str>) -> Result<Option<String>>;
    async fn incr_text_prompts(&self, user_id: UserId, by: i64) -> Result<i64>;
    async fn incr_image_prompts(&self, user_id: UserId, by: i64) -> Result<i64>;

    async fn get_plan(&self, name: &str) -> Result<Option<PlanDoc>>;

    async fn insert_payment(&self, doc: &PaymentDoc) -> Result<()>;
    async fn get_payment(&self, payment_id: &str) -> Result<Option<PaymentDoc>>;
    async fn update_payment_status(&self, payment_id: &str, status: PaymentStatus) -> Result<()>;

    async fn get_completion(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<Option<CompletionDoc>>;
    async fn insert_completion(&self, doc: &CompletionDoc) -> Result<()>;
}

/// Decode a raw value read back from a store into its typed form.
///
/// This is the single validation boundary for loosely-typed adapters: a
/// value of unexpected shape aborts the operation with `ShapeMismatch`.
pub fn decode_field<T: DeserializeOwned>(field: &str, value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::ShapeMismatch {
        field: field.to_string(),
        detail: e.to_string(),
    })
}

/// In-process store used by the standalone bin and by tests. Deployments
/// with a real document database implement [`StorePort`] in an adapter
/// crate instead.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Collections>,
}

#[derive(Default)]
struct Collections {
    users: HashMap<i64, UserDoc>,
    plans: HashMap<String, PlanDoc>,
    payments: HashMap<String, PaymentDoc>,
    completions: HashMap<(i64, i32), CompletionDoc>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_plan(&self, plan: PlanDoc) {
        self.inner.lock().await.plans.insert(plan.name.clone(), plan);
    }

    async fn with_user<T>(
        &self,
        user_id: UserId,
        f: impl FnOnce(&mut UserDoc) -> T + Send,
    ) -> Result<T> {
        let mut inner = self.inner.lock().await;
        let doc = inner
            .users
            .get_mut(&user_id.0)
            .ok_or_else(|| Error::Store(format!("no user {}", user_id.0)))?;
        Ok(f(doc))
    }
}

#[async_trait]
impl StorePort for MemoryStore {
    async fn get_user(&self, user_id: UserId) -> Result<Option<UserDoc>> {
        Ok(self.inner.lock().await.users.get(&user_id.0).cloned())
    }

    async fn insert_user(&self, doc: &UserDoc) -> Result<()> {
        self.inner
            .lock()
            .await
            .users
            .insert(doc.user_id.0, doc.clone());
        Ok(())
    }

    async fn upsert_user(&self, doc: &UserDoc) -> Result<()> {
        // Whole-document overwrite, same as insert for an in-memory map.
        self.insert_user(doc).await
    }

    async fn set_subscription(
        &self,
        user_id: UserId,
        sub: &SubscriptionDoc,
    ) -> Result<SubscriptionDoc> {
        self.with_user(user_id, |doc| {
            doc.subscription = sub.clone();
            doc.subscription.clone()
        })
        .await
    }

    async fn set_quota(&self, user_id: UserId, quota: i64) -> Result<i64> {
        self.with_user(user_id, |doc| {
            doc.subscription.quota = quota;
            doc.subscription.quota
        })
        .await
    }

    async fn set_last_update(&self, user_id: UserId, at: DateTime<Utc>) -> Result<()> {
        self.with_user(user_id, |doc| doc.last_update = at).await
    }

    async fn set_email(&self, user_id: UserId, email: &str) -> Result<String> {
        self.with_user(user_id, |doc| {
            doc.email = Some(email.to_string());
            email.to_string()
        })
        .await
    }

    async fn set_text_model(&self, user_id: UserId, model: &str) -> Result<String> {
        self.with_user(user_id, |doc| {
            doc.settings.text_model = model.to_string();
            doc.settings.text_model.clone()
        })
        .await
    }

    async fn set_stream_mode(&self, user_id: UserId, enabled: bool) -> Result<bool> {
        self.with_user(user_id, |doc| {
            doc.settings.stream_mode = enabled;
            doc.settings.stream_mode
        })
        .await
    }

    async fn set_dialogue_mode(&self, user_id: UserId, enabled: bool) -> Result<bool> {
        self.with_user(user_id, |doc| {
            doc.settings.dialogue_mode = enabled;
            doc.settings.dialogue_mode
        })
        .await
    }

    async fn set_gpt_role(&self, user_id: UserId, role: Option<&str>) -> Result<Option<String>> {
        self.with_user(user_id, |doc| {
            doc.settings.gpt_role = role.map(|r| r.to_string());
            doc.settings.gpt_role.clone()
        })
        .await
    }

    async fn incr_text_prompts(&self, user_id: UserId, by: i64) -> Result<i64> {
        self.with_user(user_id, |doc| {
            doc.statistics.text_prompts += by;
            doc.statistics.text_prompts
        })
        .await
    }

    async fn incr_image_prompts(&self, user_id: UserId, by: i64) -> Result<i64> {
        self.with_user(user_id, |doc| {
            doc.statistics.image_prompts += by;
            doc.statistics.image_prompts
        })
        .await
    }

    async fn get_plan(&self, name: &str) -> Result<Option<PlanDoc>> {
        Ok(self.inner.lock().await.plans.get(name).cloned())
    }

    async fn insert_payment(&self, doc: &PaymentDoc) -> Result<()> {
        self.inner
            .lock()
            .await
            .payments
            .insert(doc.payment_id.clone(), doc.clone());
        Ok(())
    }

    async fn get_payment(&self, payment_id: &str) -> Result<Option<PaymentDoc>> {
        Ok(self.inner.lock().await.payments.get(payment_id).cloned())
    }

    async fn update_payment_status(&self, payment_id: &str, status: PaymentStatus) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let doc = inner
            .payments
            .get_mut(payment_id)
            .ok_or_else(|| Error::Store(format!("no payment {payment_id}")))?;
        doc.status = status;
        Ok(())
    }

    async fn get_completion(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<Option<CompletionDoc>> {
        Ok(self
            .inner
            .lock()
            .await
            .completions
            .get(&(chat_id.0, message_id.0))
            .cloned())
    }

    async fn insert_completion(&self, doc: &CompletionDoc) -> Result<()> {
        self.inner
            .lock()
            .await
            .completions
            .insert((doc.chat_id.0, doc.message_id.0), doc.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> NewUserDefaults {
        NewUserDefaults {
            plan_name: "Free".to_string(),
            plan_description: "Standard plan".to_string(),
            quota: 10,
            expire_days: 2000,
            text_model: "gpt-3.5-turbo".to_string(),
        }
    }

    #[tokio::test]
    async fn field_writes_return_post_write_values() {
        let store = MemoryStore::new();
        let profile = UserProfile::bare(UserId(7));
        store
            .insert_user(&UserDoc::fresh(&profile, &defaults(), Utc::now()))
            .await
            .unwrap();

        assert_eq!(store.set_quota(UserId(7), 3).await.unwrap(), 3);
        assert_eq!(store.incr_text_prompts(UserId(7), 1).await.unwrap(), 1);
        assert_eq!(store.incr_text_prompts(UserId(7), 2).await.unwrap(), 3);
        assert_eq!(
            store.set_email(UserId(7), "a@b.c").await.unwrap(),
            "a@b.c".to_string()
        );

        let doc = store.get_user(UserId(7)).await.unwrap().unwrap();
        assert_eq!(doc.subscription.quota, 3);
        assert_eq!(doc.statistics.text_prompts, 3);
    }

    #[tokio::test]
    async fn field_writes_on_missing_user_fail() {
        let store = MemoryStore::new();
        let err = store.set_quota(UserId(404), 1).await.unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }

    #[test]
    fn decode_field_flags_unexpected_shapes() {
        let ok: i64 = decode_field("subscription.quota", serde_json::json!(5)).unwrap();
        assert_eq!(ok, 5);

        let err = decode_field::<i64>("subscription.quota", serde_json::json!("five")).unwrap_err();
        match err {
            Error::ShapeMismatch { field, .. } => assert_eq!(field, "subscription.quota"),
            other => panic!("expected ShapeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn payment_status_serializes_snake_case() {
        let s = serde_json::to_string(&PaymentStatus::WaitingForCapture).unwrap();
        assert_eq!(s, "\"waiting_for_capture\"");
        let back: PaymentStatus = serde_json::from_str("\"succeeded\"").unwrap();
        assert_eq!(back, PaymentStatus::Succeeded);
    }
}
