//! Provider executor: admission-gated submission, a perpetual draining
//! loop, and the chat-completion handler.
//!
//! One `Provider` owns one FIFO queue and one consumer loop. `submit` can
//! fail only because the admission gate refuses the user; once queued, a
//! work item is processed exactly once. The loop spawns each handler
//! detached and paces dispatches, so handler concurrency is bounded only by
//! the gate. The handler releases the user's admission marker on every exit
//! path.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::UserEntry,
    domain::{ChatId, MessageId, MessageRef, UserId},
    limiter::AdmissionGate,
    messaging::MessagingPort,
    queue::WorkQueue,
    report::CrashReportPort,
    store::{ChatTurn, CompletionDoc, StorePort, UserDoc},
    Result,
};

pub(crate) const QUOTA_NOTICE: &str =
    "You have run out of requests for today. The limit resets tomorrow, or you can upgrade your plan with /buy.";
pub(crate) const FAILURE_NOTICE: &str =
    "Something went wrong while processing your request. Please try again later.";

/// One chat-completion call.
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatTurn>,
    /// Opaque per-user tag forwarded to the provider for its abuse
    /// monitoring; a hash, never the raw identity.
    pub user_tag: Option<String>,
}

#[derive(Clone, Debug)]
pub struct CompletionResponse {
    pub content: String,
    pub total_tokens: i64,
}

/// Port to the AI completion provider. Implementations own transport,
/// auth and timeouts; callers only see the typed request/response pair.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;
}

/// One image-generation call.
#[derive(Clone, Debug)]
pub struct ImageRequest {
    pub prompt: String,
}

#[derive(Clone, Debug)]
pub struct ImageResponse {
    /// Hosted or data URL of the generated image.
    pub image_url: String,
}

/// Port to the image-generation provider.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    async fn generate(&self, request: &ImageRequest) -> Result<ImageResponse>;
}

/// A queued chat request. The placeholder message was already sent by the
/// intake side; the handler edits it with the answer or a failure notice.
pub struct ChatJob {
    pub entry: Arc<UserEntry>,
    pub chat_id: ChatId,
    pub prompt: String,
    pub reply_to: Option<MessageId>,
    pub placeholder: MessageRef,
}

/// A queued image generation. The image goes out as a fresh message and the
/// placeholder is deleted afterwards.
pub struct ImageJob {
    pub entry: Arc<UserEntry>,
    pub chat_id: ChatId,
    pub prompt: String,
    pub placeholder: MessageRef,
}

/// Kind-tagged unit of deferred work.
pub enum WorkItem {
    ChatCompletion(ChatJob),
    ImageGeneration(ImageJob),
}

impl WorkItem {
    fn user_id(&self) -> UserId {
        match self {
            WorkItem::ChatCompletion(job) => job.entry.user_id(),
            WorkItem::ImageGeneration(job) => job.entry.user_id(),
        }
    }
}

struct Inner {
    gate: Arc<AdmissionGate>,
    store: Arc<dyn StorePort>,
    messenger: Arc<dyn MessagingPort>,
    backend: Arc<dyn CompletionBackend>,
    images: Arc<dyn ImageBackend>,
    report: Arc<dyn CrashReportPort>,
    queue: WorkQueue<WorkItem>,
    pacing: Duration,
    empty_backoff: Duration,
}

#[derive(Clone)]
pub struct Provider {
    inner: Arc<Inner>,
}

impl Provider {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gate: Arc<AdmissionGate>,
        store: Arc<dyn StorePort>,
        messenger: Arc<dyn MessagingPort>,
        backend: Arc<dyn CompletionBackend>,
        images: Arc<dyn ImageBackend>,
        report: Arc<dyn CrashReportPort>,
        pacing: Duration,
        empty_backoff: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                gate,
                store,
                messenger,
                backend,
                images,
                report,
                queue: WorkQueue::new(),
                pacing,
                empty_backoff,
            }),
        }
    }

    /// Admission-gated enqueue. Returns `false` iff the user already has a
    /// request in flight; once this returns `true` the grant travels with
    /// the item and the handler will release it.
    pub async fn submit(&self, item: WorkItem) -> bool {
        let user_id = item.user_id();
        if !self.inner.gate.try_grant(user_id).await {
            tracing::debug!(user = user_id.0, "submission refused: request in flight");
            return false;
        }
        self.inner.queue.enqueue(item).await;
        true
    }

    pub async fn backlog(&self) -> usize {
        self.inner.queue.len().await
    }

    /// Perpetual consumer loop. Dispatches each item as a detached task and
    /// paces between dispatches; backs off while the queue is empty; exits
    /// only when `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            pacing = ?self.inner.pacing,
            empty_backoff = ?self.inner.empty_backoff,
            "provider executor started"
        );
        loop {
            let delay = match self.inner.queue.try_dequeue().await {
                Some(item) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.dispatch(item).await });
                    self.inner.pacing
                }
                None => self.inner.empty_backoff,
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        let backlog = self.backlog().await;
        tracing::info!(backlog, "provider executor stopped");
    }

    async fn dispatch(&self, item: WorkItem) {
        match item {
            WorkItem::ChatCompletion(job) => self.handle_chat(job).await,
            WorkItem::ImageGeneration(job) => self.handle_image(job).await,
        }
    }

    /// Process one queued item inline. Test hook; `run` spawns instead.
    #[cfg(test)]
    pub(crate) async fn drain_one(&self) -> bool {
        match self.inner.queue.try_dequeue().await {
            Some(item) => {
                self.dispatch(item).await;
                true
            }
            None => false,
        }
    }

    /// Chat handler. Releases the admission grant on every path, then
    /// forwards any failure to the crash reporter.
    async fn handle_chat(&self, job: ChatJob) {
        let user_id = job.entry.user_id();
        let outcome = self.process_chat(&job).await;
        self.inner.gate.release(user_id).await;

        if let Err(err) = outcome {
            tracing::error!(user = user_id.0, error = %err, "chat request failed");
            self.inner.report.capture("chat completion", &err).await;
        }
    }

    async fn process_chat(&self, job: &ChatJob) -> Result<()> {
        // Charge before the provider call. A refusal is a user notice, not
        // an error; a consumed charge is not refunded on provider failure.
        if !job.entry.take_quota(1).await? {
            self.inner
                .messenger
                .edit_text(job.placeholder, QUOTA_NOTICE)
                .await?;
            return Ok(());
        }

        let doc = job.entry.snapshot().await?;
        let history = self.reply_history(&doc, job.chat_id, job.reply_to).await?;
        let mut messages = Vec::with_capacity(history.len() + 2);
        if let Some(role) = &doc.settings.gpt_role {
            messages.push(ChatTurn::new("system", role));
        }
        messages.extend(history);
        messages.push(ChatTurn::new("user", job.prompt.as_str()));

        let request = CompletionRequest {
            model: doc.settings.text_model.clone(),
            messages: messages.clone(),
            user_tag: Some(user_tag(job.entry.user_id())),
        };

        let response = match self.inner.backend.complete(&request).await {
            Ok(response) => response,
            Err(err) => {
                self.notify_failure(job.placeholder).await;
                return Err(err);
            }
        };

        self.inner
            .messenger
            .edit_text(job.placeholder, &response.content)
            .await?;

        messages.push(ChatTurn::new("assistant", &response.content));
        self.inner
            .store
            .insert_completion(&CompletionDoc {
                user_id: job.entry.user_id(),
                chat_id: job.chat_id,
                message_id: job.placeholder.message_id,
                created: Utc::now(),
                model: request.model,
                total_tokens: response.total_tokens,
                history: messages,
            })
            .await?;
        job.entry.inc_text_prompts().await?;
        Ok(())
    }

    /// Image handler. Same release discipline as the chat handler.
    async fn handle_image(&self, job: ImageJob) {
        let user_id = job.entry.user_id();
        let outcome = self.process_image(&job).await;
        self.inner.gate.release(user_id).await;

        if let Err(err) = outcome {
            tracing::error!(user = user_id.0, error = %err, "image request failed");
            self.inner.report.capture("image generation", &err).await;
        }
    }

    async fn process_image(&self, job: &ImageJob) -> Result<()> {
        if !job.entry.take_quota(1).await? {
            self.inner
                .messenger
                .edit_text(job.placeholder, QUOTA_NOTICE)
                .await?;
            return Ok(());
        }

        let request = ImageRequest {
            prompt: job.prompt.clone(),
        };
        let response = match self.inner.images.generate(&request).await {
            Ok(response) => response,
            Err(err) => {
                self.notify_failure(job.placeholder).await;
                return Err(err);
            }
        };

        // The image goes out as its own message; the placeholder is dropped.
        self.inner
            .messenger
            .send_text(job.chat_id, &response.image_url)
            .await?;
        self.inner.messenger.delete_message(job.placeholder).await?;
        job.entry.inc_image_prompts().await?;
        Ok(())
    }

    /// The provider error must still reach the crash reporter when the
    /// failure notice itself cannot be delivered.
    async fn notify_failure(&self, placeholder: MessageRef) {
        if let Err(err) = self
            .inner
            .messenger
            .edit_text(placeholder, FAILURE_NOTICE)
            .await
        {
            tracing::warn!(error = %err, "failure notice could not be delivered");
        }
    }

    /// Prior turns when the prompt replies to one of our answers and the
    /// user keeps dialogue mode on. A reply to anything else starts fresh.
    async fn reply_history(
        &self,
        doc: &UserDoc,
        chat_id: ChatId,
        reply_to: Option<MessageId>,
    ) -> Result<Vec<ChatTurn>> {
        if !doc.settings.dialogue_mode {
            return Ok(Vec::new());
        }
        let Some(message_id) = reply_to else {
            return Ok(Vec::new());
        };
        let Some(prior) = self.inner.store.get_completion(chat_id, message_id).await? else {
            return Ok(Vec::new());
        };
        // The system turn is rebuilt from current settings, not replayed.
        Ok(prior
            .history
            .into_iter()
            .filter(|turn| turn.role != "system")
            .collect())
    }
}

fn user_tag(user_id: UserId) -> String {
    let digest = Sha256::digest(user_id.0.to_string().as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
