//! Coherent per-user entity cache.
//!
//! Each user gets one cache entry holding the loaded aggregate behind its
//! own lock; that lock serializes every mutation of that user's state
//! (quota, settings, subscription). The map itself is synchronized
//! independently so a first-load race cannot create two entries. Entries are
//! never evicted automatically; out-of-band writers (payment reconciliation)
//! call [`UserCache::invalidate`] so the next lookup reloads fresh state.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::{
    domain::{UserId, UserProfile},
    store::{NewUserDefaults, StorePort, SubscriptionDoc, UserDoc, UserRole},
    Error, Result,
};

pub struct UserCache {
    store: Arc<dyn StorePort>,
    defaults: NewUserDefaults,
    map: Mutex<HashMap<i64, Arc<UserEntry>>>,
    last_purge: Mutex<DateTime<Utc>>,
}

impl UserCache {
    pub fn new(store: Arc<dyn StorePort>, defaults: NewUserDefaults) -> Self {
        Self {
            store,
            defaults,
            map: Mutex::new(HashMap::new()),
            last_purge: Mutex::new(Utc::now()),
        }
    }

    /// Get the cached entry for a user, loading or creating the aggregate on
    /// first contact.
    ///
    /// The map-level get-or-insert is atomic under the map lock; the load
    /// itself runs under the entry's lock, so concurrent first lookups agree
    /// on a single loader and a single persisted create.
    pub async fn get(&self, profile: &UserProfile) -> Result<Arc<UserEntry>> {
        let entry = {
            let mut map = self.map.lock().await;
            map.entry(profile.user_id.0)
                .or_insert_with(|| {
                    Arc::new(UserEntry::new(profile.user_id, self.store.clone()))
                })
                .clone()
        };
        entry.ensure_loaded(profile, &self.defaults).await?;
        Ok(entry)
    }

    /// Drop the cached entry so the next `get` reloads from the store. Used
    /// after out-of-band mutation (e.g. payment activation).
    pub async fn invalidate(&self, user_id: UserId) {
        self.map.lock().await.remove(&user_id.0);
    }

    /// Force-clear the whole cache, draining each entry under its own lock
    /// first. Best-effort and maintenance-only: not safe to call while
    /// entries are actively loading.
    pub async fn purge_all(&self) {
        let drained: Vec<Arc<UserEntry>> = {
            let mut map = self.map.lock().await;
            map.drain().map(|(_, v)| v).collect()
        };
        for entry in drained {
            let _guard = entry.state.lock().await;
        }
        *self.last_purge.lock().await = Utc::now();
    }

    pub async fn size(&self) -> usize {
        self.map.lock().await.len()
    }

    pub async fn last_purge(&self) -> DateTime<Utc> {
        *self.last_purge.lock().await
    }
}

/// One cached user aggregate. All mutation goes through `&self` methods that
/// take the entry lock; the lock is held across storage calls but never
/// across provider HTTP calls.
pub struct UserEntry {
    user_id: UserId,
    store: Arc<dyn StorePort>,
    state: Mutex<Option<UserDoc>>,
}

impl UserEntry {
    fn new(user_id: UserId, store: Arc<dyn StorePort>) -> Self {
        Self {
            user_id,
            store,
            state: Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    async fn ensure_loaded(&self, profile: &UserProfile, defaults: &NewUserDefaults) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }

        let now = Utc::now();
        match self.store.get_user(self.user_id).await? {
            Some(mut doc) => {
                // Refresh the profile facts the frontend just gave us.
                doc.last_update = now;
                doc.username = profile.username.clone();
                doc.first_name = profile.first_name.clone();
                doc.last_name = profile.last_name.clone();
                self.store.upsert_user(&doc).await?;
            }
            None => {
                let doc = UserDoc::fresh(profile, defaults, now);
                self.store.insert_user(&doc).await?;
            }
        }

        // Reread-after-write: adopt what the store persisted, not the local
        // copy we just handed it.
        let doc = self
            .store
            .get_user(self.user_id)
            .await?
            .ok_or_else(|| Error::Store(format!("user {} missing after create", self.user_id.0)))?;
        *state = Some(doc);
        Ok(())
    }

    pub async fn snapshot(&self) -> Result<UserDoc> {
        let state = self.state.lock().await;
        loaded(&state).cloned()
    }

    pub async fn banned(&self) -> Result<bool> {
        Ok(self.snapshot().await?.banned)
    }

    pub async fn role(&self) -> Result<UserRole> {
        Ok(self.snapshot().await?.role)
    }

    pub async fn text_model(&self) -> Result<String> {
        Ok(self.snapshot().await?.settings.text_model)
    }

    pub async fn has_quota(&self) -> Result<bool> {
        Ok(self.snapshot().await?.subscription.quota > 0)
    }

    /// Check-and-decrement the remaining allowance. Mutates (and persists
    /// the subscription sub-document) iff `n <= remaining`; the remaining
    /// quota never goes negative.
    pub async fn take_quota(&self, n: i64) -> Result<bool> {
        let mut state = self.state.lock().await;
        let doc = loaded_mut(&mut state)?;
        if doc.subscription.quota < n {
            return Ok(false);
        }

        let mut sub = doc.subscription.clone();
        sub.quota -= n;
        let written = self.store.set_subscription(self.user_id, &sub).await?;
        doc.subscription = written;
        Ok(true)
    }

    /// Reset the daily allowance if the stored `last_update` calendar date
    /// precedes today. Dates are compared in UTC; the reset boundary is
    /// midnight UTC.
    ///
    /// Returns the restored allotment when the reset fired.
    pub async fn apply_daily_reset(&self) -> Result<Option<i64>> {
        let mut state = self.state.lock().await;
        let doc = loaded_mut(&mut state)?;

        let now = Utc::now();
        if doc.last_update.date_naive() >= now.date_naive() {
            return Ok(None);
        }

        let Some(plan) = self.store.get_plan(&doc.subscription.name).await? else {
            tracing::warn!(
                user = self.user_id.0,
                plan = %doc.subscription.name,
                "daily reset skipped: plan not found"
            );
            return Ok(None);
        };

        let quota = self.store.set_quota(self.user_id, plan.quota).await?;
        self.store.set_last_update(self.user_id, now).await?;
        doc.subscription.quota = quota;
        doc.last_update = now;
        Ok(Some(quota))
    }

    pub async fn set_email(&self, email: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let doc = loaded_mut(&mut state)?;
        let written = self.store.set_email(self.user_id, email).await?;
        doc.email = Some(written);
        Ok(())
    }

    pub async fn set_text_model(&self, model: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let doc = loaded_mut(&mut state)?;
        let written = self.store.set_text_model(self.user_id, model).await?;
        doc.settings.text_model = written;
        Ok(())
    }

    pub async fn set_stream_mode(&self, enabled: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let doc = loaded_mut(&mut state)?;
        let written = self.store.set_stream_mode(self.user_id, enabled).await?;
        doc.settings.stream_mode = written;
        Ok(())
    }

    pub async fn set_dialogue_mode(&self, enabled: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let doc = loaded_mut(&mut state)?;
        let written = self.store.set_dialogue_mode(self.user_id, enabled).await?;
        doc.settings.dialogue_mode = written;
        Ok(())
    }

    pub async fn set_gpt_role(&self, role: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().await;
        let doc = loaded_mut(&mut state)?;
        let written = self.store.set_gpt_role(self.user_id, role).await?;
        doc.settings.gpt_role = written;
        Ok(())
    }

    pub async fn inc_text_prompts(&self) -> Result<i64> {
        let mut state = self.state.lock().await;
        let doc = loaded_mut(&mut state)?;
        let count = self.store.incr_text_prompts(self.user_id, 1).await?;
        doc.statistics.text_prompts = count;
        Ok(count)
    }

    pub async fn inc_image_prompts(&self) -> Result<i64> {
        let mut state = self.state.lock().await;
        let doc = loaded_mut(&mut state)?;
        let count = self.store.incr_image_prompts(self.user_id, 1).await?;
        doc.statistics.image_prompts = count;
        Ok(count)
    }

    /// Whole-document overwrite of the current in-memory aggregate:
    /// last-writer-wins, concurrent out-of-process writers can be lost.
    pub async fn save(&self) -> Result<()> {
        let state = self.state.lock().await;
        let doc = loaded(&state)?;
        self.store.upsert_user(doc).await
    }

    pub async fn subscription(&self) -> Result<SubscriptionDoc> {
        Ok(self.snapshot().await?.subscription)
    }

    /// Backdate the in-memory `last_update`, emulating an overnight gap.
    #[cfg(test)]
    pub(crate) async fn age_last_update_for_test(&self, by: chrono::Duration) {
        let mut state = self.state.lock().await;
        if let Some(doc) = state.as_mut() {
            doc.last_update = doc.last_update - by;
        }
    }
}

fn loaded<'a>(state: &'a Option<UserDoc>) -> Result<&'a UserDoc> {
    state
        .as_ref()
        .ok_or_else(|| Error::Store("user entry not loaded".to_string()))
}

fn loaded_mut<'a>(state: &'a mut Option<UserDoc>) -> Result<&'a mut UserDoc> {
    state
        .as_mut()
        .ok_or_else(|| Error::Store("user entry not loaded".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChatId, MessageId};
    use crate::store::{
        CompletionDoc, MemoryStore, PaymentDoc, PaymentStatus, PlanDoc, SettingsDoc,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

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
            username: Some(format!("user{id}")),
            first_name: "Test".to_string(),
            last_name: None,
        }
    }

    /// MemoryStore wrapper that counts create-document writes.
    struct CountingStore {
        inner: MemoryStore,
        inserts: AtomicUsize,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                inserts: AtomicUsize::new(0),
            }
        }

        fn insert_count(&self) -> usize {
            self.inserts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StorePort for CountingStore {
        async fn get_user(&self, user_id: UserId) -> Result<Option<UserDoc>> {
            self.inner.get_user(user_id).await
        }

        async fn insert_user(&self, doc: &UserDoc) -> Result<()> {
            self.inserts.fetch_add(1, Ordering::SeqCst);
            self.inner.insert_user(doc).await
        }

        async fn upsert_user(&self, doc: &UserDoc) -> Result<()> {
            self.inner.upsert_user(doc).await
        }

        async fn set_subscription(
            &self,
            user_id: UserId,
            sub: &SubscriptionDoc,
        ) -> Result<SubscriptionDoc> {
            self.inner.set_subscription(user_id, sub).await
        }

        async fn set_quota(&self, user_id: UserId, quota: i64) -> Result<i64> {
            self.inner.set_quota(user_id, quota).await
        }

        async fn set_last_update(&self, user_id: UserId, at: DateTime<Utc>) -> Result<()> {
            self.inner.set_last_update(user_id, at).await
        }

        async fn set_email(&self, user_id: UserId, email: &str) -> Result<String> {
            self.inner.set_email(user_id, email).await
        }

        async fn set_text_model(&self, user_id: UserId, model: &str) -> Result<String> {
            self.inner.set_text_model(user_id, model).await
        }

        async fn set_stream_mode(&self, user_id: UserId, enabled: bool) -> Result<bool> {
            self.inner.set_stream_mode(user_id, enabled).await
        }

        async fn set_dialogue_mode(&self, user_id: UserId, enabled: bool) -> Result<bool> {
            self.inner.set_dialogue_mode(user_id, enabled).await
        }

        async fn set_gpt_role(
            &self,
            user_id: UserId,
            role: Option<&str>,
        ) -> Result<Option<String>> {
            self.inner.set_gpt_role(user_id, role).await
        }

        async fn incr_text_prompts(&self, user_id: UserId, by: i64) -> Result<i64> {
            self.inner.incr_text_prompts(user_id, by).await
        }

        async fn incr_image_prompts(&self, user_id: UserId, by: i64) -> Result<i64> {
            self.inner.incr_image_prompts(user_id, by).await
        }

        async fn get_plan(&self, name: &str) -> Result<Option<PlanDoc>> {
            self.inner.get_plan(name).await
        }

        async fn insert_payment(&self, doc: &PaymentDoc) -> Result<()> {
            self.inner.insert_payment(doc).await
        }

        async fn get_payment(&self, payment_id: &str) -> Result<Option<PaymentDoc>> {
            self.inner.get_payment(payment_id).await
        }

        async fn update_payment_status(
            &self,
            payment_id: &str,
            status: PaymentStatus,
        ) -> Result<()> {
            self.inner.update_payment_status(payment_id, status).await
        }

        async fn get_completion(
            &self,
            chat_id: ChatId,
            message_id: MessageId,
        ) -> Result<Option<CompletionDoc>> {
            self.inner.get_completion(chat_id, message_id).await
        }

        async fn insert_completion(&self, doc: &CompletionDoc) -> Result<()> {
            self.inner.insert_completion(doc).await
        }
    }

    #[tokio::test]
    async fn concurrent_first_lookups_create_exactly_once() {
        let store = Arc::new(CountingStore::new());
        let cache = Arc::new(UserCache::new(store.clone(), defaults()));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                cache.get(&profile(42)).await.unwrap().user_id()
            }));
        }

        for t in tasks {
            assert_eq!(t.await.unwrap(), UserId(42));
        }
        assert_eq!(store.insert_count(), 1);
        assert_eq!(cache.size().await, 1);
    }

    #[tokio::test]
    async fn first_load_rereads_persisted_document() {
        let store = Arc::new(MemoryStore::new());
        let cache = UserCache::new(store.clone(), defaults());

        let entry = cache.get(&profile(1)).await.unwrap();
        let doc = entry.snapshot().await.unwrap();
        assert_eq!(doc.subscription.name, "Free");
        assert_eq!(doc.subscription.quota, 10);

        // The in-memory value is what the store handed back, so a second
        // lookup from a fresh cache agrees with it.
        let cache2 = UserCache::new(store, defaults());
        let doc2 = cache2.get(&profile(1)).await.unwrap().snapshot().await.unwrap();
        assert_eq!(doc2.reg_date, doc.reg_date);
    }

    #[tokio::test]
    async fn take_quota_never_goes_negative() {
        let store = Arc::new(MemoryStore::new());
        let cache = UserCache::new(store.clone(), defaults());
        let entry = cache.get(&profile(2)).await.unwrap();

        assert!(!entry.take_quota(11).await.unwrap());
        assert_eq!(entry.subscription().await.unwrap().quota, 10);

        assert!(entry.take_quota(10).await.unwrap());
        assert_eq!(entry.subscription().await.unwrap().quota, 0);

        assert!(!entry.take_quota(1).await.unwrap());
        assert_eq!(entry.subscription().await.unwrap().quota, 0);
        assert!(!entry.has_quota().await.unwrap());

        // Persisted value agrees with the in-memory one.
        let stored = store.get_user(UserId(2)).await.unwrap().unwrap();
        assert_eq!(stored.subscription.quota, 0);
    }

    #[tokio::test]
    async fn daily_reset_fires_once_per_date_boundary() {
        let store = Arc::new(MemoryStore::new());
        store
            .seed_plan(PlanDoc {
                name: "Free".to_string(),
                description: "Standard plan".to_string(),
                price: 0.0,
                quota: 10,
                expire_days: 2000,
            })
            .await;
        let cache = UserCache::new(store.clone(), defaults());

        let entry = cache.get(&profile(3)).await.unwrap();
        assert!(entry.take_quota(4).await.unwrap());

        // Same day: no reset, no matter how many interactions.
        assert_eq!(entry.apply_daily_reset().await.unwrap(), None);
        assert_eq!(entry.apply_daily_reset().await.unwrap(), None);
        assert_eq!(entry.subscription().await.unwrap().quota, 6);

        // Entry loading refreshes last_update, so age the in-memory copy
        // directly to simulate the first interaction of the next day.
        {
            let mut state = entry.state.lock().await;
            if let Some(doc) = state.as_mut() {
                doc.last_update = Utc::now() - chrono::Duration::days(1);
            }
        }

        assert_eq!(entry.apply_daily_reset().await.unwrap(), Some(10));
        assert_eq!(entry.apply_daily_reset().await.unwrap(), None);
        assert_eq!(entry.subscription().await.unwrap().quota, 10);

        let stored = store.get_user(UserId(3)).await.unwrap().unwrap();
        assert_eq!(stored.subscription.quota, 10);
    }

    #[tokio::test]
    async fn invalidate_reloads_out_of_band_changes() {
        let store = Arc::new(MemoryStore::new());
        let cache = UserCache::new(store.clone(), defaults());

        let entry = cache.get(&profile(4)).await.unwrap();
        assert_eq!(entry.subscription().await.unwrap().quota, 10);

        // Out-of-band writer bumps the subscription.
        let sub = SubscriptionDoc {
            name: "Plus".to_string(),
            description: "Paid".to_string(),
            quota: 100,
            expire_datetime: Utc::now() + chrono::Duration::days(30),
        };
        store.set_subscription(UserId(4), &sub).await.unwrap();

        // Cached entry still sees the old value until invalidated.
        assert_eq!(entry.subscription().await.unwrap().quota, 10);
        cache.invalidate(UserId(4)).await;
        let fresh = cache.get(&profile(4)).await.unwrap();
        assert_eq!(fresh.subscription().await.unwrap().quota, 100);
        assert_eq!(fresh.subscription().await.unwrap().name, "Plus");
    }

    #[tokio::test]
    async fn purge_all_clears_and_stamps() {
        let store = Arc::new(MemoryStore::new());
        let cache = UserCache::new(store, defaults());

        cache.get(&profile(5)).await.unwrap();
        cache.get(&profile(6)).await.unwrap();
        assert_eq!(cache.size().await, 2);

        let before = cache.last_purge().await;
        cache.purge_all().await;
        assert_eq!(cache.size().await, 0);
        assert!(cache.last_purge().await >= before);
    }

    #[tokio::test]
    async fn settings_setters_adopt_post_write_values() {
        let store = Arc::new(MemoryStore::new());
        let cache = UserCache::new(store.clone(), defaults());
        let entry = cache.get(&profile(8)).await.unwrap();

        entry.set_text_model("gpt-4o").await.unwrap();
        entry.set_stream_mode(true).await.unwrap();
        entry.set_gpt_role(Some("tutor")).await.unwrap();
        entry.set_email("s@example.org").await.unwrap();

        let doc = entry.snapshot().await.unwrap();
        assert_eq!(doc.settings.text_model, "gpt-4o");
        assert!(doc.settings.stream_mode);
        assert_eq!(doc.settings.gpt_role.as_deref(), Some("tutor"));
        assert_eq!(doc.email.as_deref(), Some("s@example.org"));

        let settings: SettingsDoc = store
            .get_user(UserId(8))
            .await
            .unwrap()
            .unwrap()
            .settings;
        assert_eq!(settings.text_model, "gpt-4o");
    }
}
