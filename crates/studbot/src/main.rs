//! Console deployment of the studbot backend.
//!
//! Wires the core services to the OpenAI, fal.ai and YooKassa adapters and
//! drives them from stdin: each line is a prompt from the operator's user,
//! a few slash commands cover settings, images and purchases. A
//! chat-platform frontend plugs in at the same seams (`MessagingPort` +
//! a router calling `Intake::handle_prompt`).

use std::sync::{
    atomic::{AtomicI32, Ordering},
    Arc,
};

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use studbot_core::{
    config::Config,
    context::AppContext,
    domain::{ChatId, MessageId, MessageRef, UserId, UserProfile},
    intake::Intake,
    messaging::MessagingPort,
    payments::{Billing, Reconciler, SubscriptionActivation},
    provider::Provider,
    report::LogReporter,
    store::{MemoryStore, PlanDoc},
};
use studbot_falai::FalaiClient;
use studbot_openai::OpenAiClient;
use studbot_yookassa::YookassaGateway;

/// The single console user.
const OPERATOR: i64 = 1;

/// Console frontend: every outgoing message is printed, edits re-print
/// under the same message number.
#[derive(Default)]
struct ConsoleMessenger {
    next_id: AtomicI32,
}

#[async_trait]
impl MessagingPort for ConsoleMessenger {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> studbot_core::Result<MessageRef> {
        let message_id = MessageId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        println!("[chat {} #{}] {text}", chat_id.0, message_id.0);
        Ok(MessageRef {
            chat_id,
            message_id,
        })
    }

    async fn edit_text(&self, msg: MessageRef, text: &str) -> studbot_core::Result<()> {
        println!("[chat {} #{}] {text}", msg.chat_id.0, msg.message_id.0);
        Ok(())
    }

    async fn delete_message(&self, _msg: MessageRef) -> studbot_core::Result<()> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    studbot_core::logging::init("studbot");

    let config = Config::load().context("configuration")?;
    let api_key = config
        .openai_api_key
        .clone()
        .context("OPENAI_API_KEY environment variable is required")?;
    let falai_key = config
        .falai_api_key
        .clone()
        .context("FALAI_API_KEY environment variable is required")?;

    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    seed_plans(&store, &config).await;

    let messenger = Arc::new(ConsoleMessenger::default());
    let report = Arc::new(LogReporter);
    let ctx = AppContext::new(
        config,
        store.clone(),
        messenger.clone(),
        report.clone(),
    );

    let backend = Arc::new(OpenAiClient::new(api_key, ctx.config.provider_timeout)?);
    let images = Arc::new(FalaiClient::new(
        falai_key,
        ctx.config.default_image_model.clone(),
        ctx.config.provider_timeout,
    )?);
    let gateway = Arc::new(YookassaGateway::new(
        &ctx.config.gateway_account_id,
        &ctx.config.gateway_secret_key,
        ctx.config.gateway_redirect_url.clone(),
        ctx.config.provider_timeout,
    )?);

    // One executor per provider; the admission gate is shared across both.
    let chat_provider = Provider::new(
        ctx.gate.clone(),
        store.clone(),
        messenger.clone(),
        backend.clone(),
        images.clone(),
        report.clone(),
        ctx.config.executor_pacing,
        ctx.config.queue_empty_backoff,
    );
    let image_provider = Provider::new(
        ctx.gate.clone(),
        store.clone(),
        messenger.clone(),
        backend,
        images,
        report.clone(),
        ctx.config.executor_pacing,
        ctx.config.queue_empty_backoff,
    );
    let intake = Intake::new(
        ctx.cache.clone(),
        chat_provider.clone(),
        image_provider.clone(),
        messenger.clone(),
    );
    let billing = Billing::new(
        gateway.clone(),
        store.clone(),
        ctx.config.gateway_receipt_email.clone(),
    );

    let mut reconciler = Reconciler::new(
        gateway,
        store.clone(),
        report,
        ctx.config.payment_page_limit,
    );
    reconciler.register(Arc::new(SubscriptionActivation::new(
        store.clone(),
        ctx.cache.clone(),
        messenger.clone(),
        ChatId(ctx.config.ops_chat_id),
    )));
    let reconciler = Arc::new(reconciler);

    let token = ctx.tasks.shutdown_token();
    ctx.tasks
        .spawn("chat-provider", {
            let provider = chat_provider.clone();
            let token = token.clone();
            async move { provider.run(token).await }
        })
        .await;
    ctx.tasks
        .spawn("image-provider", {
            let provider = image_provider.clone();
            let token = token.clone();
            async move { provider.run(token).await }
        })
        .await;
    ctx.tasks
        .spawn(
            "payment-reconciler",
            reconciler.run(ctx.config.payment_poll_interval, token.clone()),
        )
        .await;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        res = run_console(&intake, &billing, &ctx, token.clone()) => res?,
    }

    tracing::info!("shutting down");
    ctx.tasks.shutdown().await;
    Ok(())
}

async fn seed_plans(store: &MemoryStore, config: &Config) {
    store
        .seed_plan(PlanDoc {
            name: config.free_plan_name.clone(),
            description: config.free_plan_description.clone(),
            price: 0.0,
            quota: config.free_plan_quota,
            expire_days: config.free_plan_expire_days,
        })
        .await;
    store
        .seed_plan(PlanDoc {
            name: "Premium".to_string(),
            description: "100 requests per day".to_string(),
            price: 299.0,
            quota: 100,
            expire_days: 30,
        })
        .await;
}

async fn run_console(
    intake: &Intake,
    billing: &Billing,
    ctx: &AppContext,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let profile = UserProfile {
        user_id: UserId(OPERATOR),
        username: Some("operator".to_string()),
        first_name: "Operator".to_string(),
        last_name: None,
    };
    let chat_id = ChatId(OPERATOR);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Ok(()); // stdin closed
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(plan_name) = line.strip_prefix("/buy ") {
            match ctx.store.get_plan(plan_name.trim()).await? {
                Some(plan) => {
                    let url = billing.start_purchase(profile.user_id, &plan).await?;
                    println!("Pay here: {url}");
                }
                None => println!("No such plan: {plan_name}"),
            }
            continue;
        }
        if let Some(model) = line.strip_prefix("/model ") {
            let entry = ctx.cache.get(&profile).await?;
            entry.set_text_model(model.trim()).await?;
            println!("Model set to {}", model.trim());
            continue;
        }
        if let Some(mode) = line.strip_prefix("/dialogue ") {
            let entry = ctx.cache.get(&profile).await?;
            entry.set_dialogue_mode(mode.trim() == "on").await?;
            println!("Dialogue mode: {}", mode.trim());
            continue;
        }
        if let Some(prompt) = line.strip_prefix("/image ") {
            intake
                .handle_image_prompt(&profile, chat_id, prompt.trim())
                .await?;
            continue;
        }
        if let Some(payment_id) = line.strip_prefix("/status ") {
            match billing.payment_status(payment_id.trim()).await {
                Ok(payment) => {
                    println!("Payment {}: {}", payment.payment_id, payment.status.as_str())
                }
                Err(err) => println!("Status lookup failed: {err}"),
            }
            continue;
        }

        intake.handle_prompt(&profile, chat_id, line, None).await?;
    }
}
