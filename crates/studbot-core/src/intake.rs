//! Prompt intake: the inbound edge of the request flow.
//!
//! Loads the user, applies the daily reset, sends the placeholder message
//! and hands the request to the provider. Everything after admission
//! (quota charge, provider call, delivery) happens in the provider's
//! handler, on the executor.

use std::sync::Arc;

use crate::{
    cache::{UserCache, UserEntry},
    domain::{ChatId, MessageId, MessageRef, UserProfile},
    messaging::MessagingPort,
    provider::{ChatJob, ImageJob, Provider, WorkItem},
    Result,
};

const PLACEHOLDER_NOTICE: &str = "⏳ Thinking...";
const BUSY_NOTICE: &str =
    "Your previous request is still being processed. Please wait for it to finish.";
const RESET_NOTICE_PREFIX: &str = "Your daily limit has been restored: ";
const BANNED_NOTICE: &str =
    "Your account has been deactivated. If you believe this is a mistake, contact the administrator.";

/// Terminal state of the synchronous part of intake. Rejections here are
/// ordinary outcomes, not errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// Job accepted and queued; the admission grant travels with it.
    Queued,
    /// The account is deactivated; the user is told so and nothing queues.
    Banned,
    /// A previous request for the same user is still in flight.
    Busy,
}

enum Admission {
    Proceed {
        entry: Arc<UserEntry>,
        placeholder: MessageRef,
    },
    Banned,
}

#[derive(Clone)]
pub struct Intake {
    cache: Arc<UserCache>,
    chat: Provider,
    images: Provider,
    messenger: Arc<dyn MessagingPort>,
}

impl Intake {
    pub fn new(
        cache: Arc<UserCache>,
        chat: Provider,
        images: Provider,
        messenger: Arc<dyn MessagingPort>,
    ) -> Self {
        Self {
            cache,
            chat,
            images,
            messenger,
        }
    }

    /// Admit a text prompt. Returns once the job is queued (or refused);
    /// the provider call itself happens later, on the executor.
    pub async fn handle_prompt(
        &self,
        profile: &UserProfile,
        chat_id: ChatId,
        prompt: &str,
        reply_to: Option<MessageId>,
    ) -> Result<IntakeOutcome> {
        let (entry, placeholder) = match self.admit(profile, chat_id).await? {
            Admission::Proceed { entry, placeholder } => (entry, placeholder),
            Admission::Banned => return Ok(IntakeOutcome::Banned),
        };

        let submitted = self
            .chat
            .submit(WorkItem::ChatCompletion(ChatJob {
                entry,
                chat_id,
                prompt: prompt.to_string(),
                reply_to,
                placeholder,
            }))
            .await;
        self.finish(submitted, placeholder).await
    }

    /// Admit an image prompt; same admission path, different provider queue.
    pub async fn handle_image_prompt(
        &self,
        profile: &UserProfile,
        chat_id: ChatId,
        prompt: &str,
    ) -> Result<IntakeOutcome> {
        let (entry, placeholder) = match self.admit(profile, chat_id).await? {
            Admission::Proceed { entry, placeholder } => (entry, placeholder),
            Admission::Banned => return Ok(IntakeOutcome::Banned),
        };

        let submitted = self
            .images
            .submit(WorkItem::ImageGeneration(ImageJob {
                entry,
                chat_id,
                prompt: prompt.to_string(),
                placeholder,
            }))
            .await;
        self.finish(submitted, placeholder).await
    }

    /// Shared prologue: load the user, refuse deactivated accounts, apply
    /// the daily reset, send the placeholder.
    async fn admit(&self, profile: &UserProfile, chat_id: ChatId) -> Result<Admission> {
        let entry = self.cache.get(profile).await?;
        if entry.banned().await? {
            self.messenger.send_text(chat_id, BANNED_NOTICE).await?;
            return Ok(Admission::Banned);
        }

        if let Some(restored) = entry.apply_daily_reset().await? {
            self.messenger
                .send_text(chat_id, &format!("{RESET_NOTICE_PREFIX}{restored} requests."))
                .await?;
        }

        let placeholder = self.messenger.send_text(chat_id, PLACEHOLDER_NOTICE).await?;
        Ok(Admission::Proceed { entry, placeholder })
    }

    async fn finish(&self, submitted: bool, placeholder: MessageRef) -> Result<IntakeOutcome> {
        if !submitted {
            self.messenger.edit_text(placeholder, BUSY_NOTICE).await?;
            return Ok(IntakeOutcome::Busy);
        }
        Ok(IntakeOutcome::Queued)
    }
}
