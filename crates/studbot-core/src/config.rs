use std::{env, fs, path::Path, time::Duration};

use crate::{errors::Error, Result};

/// Typed process configuration, loaded from the environment (with `.env`
/// support for local runs).
#[derive(Clone, Debug)]
pub struct Config {
    /// Chat that receives operational notices (new subscribers, etc).
    pub ops_chat_id: i64,

    // Payment gateway
    pub gateway_account_id: String,
    pub gateway_secret_key: String,
    pub gateway_redirect_url: String,
    pub gateway_receipt_email: String,

    // AI providers
    pub openai_api_key: Option<String>,
    pub falai_api_key: Option<String>,
    pub default_text_model: String,
    pub default_image_model: String,
    pub provider_timeout: Duration,

    // Executor cadence
    pub executor_pacing: Duration,
    pub queue_empty_backoff: Duration,

    // Payment reconciliation
    pub payment_poll_interval: Duration,
    pub payment_page_limit: usize,

    // Default (free) plan used when creating new users.
    pub free_plan_name: String,
    pub free_plan_description: String,
    pub free_plan_quota: i64,
    pub free_plan_expire_days: i64,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let ops_chat_id = env_i64("OPS_CHAT_ID")
            .ok_or_else(|| Error::Config("OPS_CHAT_ID environment variable is required".into()))?;

        let gateway_account_id = env_str("GATEWAY_ACCOUNT_ID")
            .and_then(non_empty)
            .ok_or_else(|| {
                Error::Config("GATEWAY_ACCOUNT_ID environment variable is required".into())
            })?;
        let gateway_secret_key = env_str("GATEWAY_SECRET_KEY")
            .and_then(non_empty)
            .ok_or_else(|| {
                Error::Config("GATEWAY_SECRET_KEY environment variable is required".into())
            })?;
        let gateway_redirect_url = env_str("GATEWAY_REDIRECT_URL")
            .and_then(non_empty)
            .unwrap_or_else(|| "https://example.org/".to_string());
        let gateway_receipt_email = env_str("GATEWAY_RECEIPT_EMAIL")
            .and_then(non_empty)
            .unwrap_or_else(|| "receipts@example.org".to_string());

        let openai_api_key = env_str("OPENAI_API_KEY").and_then(non_empty);
        let falai_api_key = env_str("FALAI_API_KEY").and_then(non_empty);
        let default_text_model = env_str("DEFAULT_TEXT_MODEL")
            .and_then(non_empty)
            .unwrap_or_else(|| "gpt-3.5-turbo".to_string());
        let default_image_model = env_str("DEFAULT_IMAGE_MODEL")
            .and_then(non_empty)
            .unwrap_or_else(|| "fal-ai/fast-lcm-diffusion".to_string());
        let provider_timeout =
            Duration::from_millis(env_u64("PROVIDER_TIMEOUT_MS").unwrap_or(60_000));

        let executor_pacing = Duration::from_millis(env_u64("EXECUTOR_PACING_MS").unwrap_or(500));
        let queue_empty_backoff =
            Duration::from_millis(env_u64("QUEUE_EMPTY_BACKOFF_MS").unwrap_or(30));

        let payment_poll_interval =
            Duration::from_secs(env_u64("PAYMENT_POLL_INTERVAL_SECS").unwrap_or(10));
        let payment_page_limit = env_usize("PAYMENT_PAGE_LIMIT").unwrap_or(20).max(1);

        let free_plan_name = env_str("FREE_PLAN_NAME")
            .and_then(non_empty)
            .unwrap_or_else(|| "Free".to_string());
        let free_plan_description = env_str("FREE_PLAN_DESCRIPTION")
            .and_then(non_empty)
            .unwrap_or_else(|| "Standard plan".to_string());
        let free_plan_quota = env_i64("FREE_PLAN_QUOTA").unwrap_or(10);
        let free_plan_expire_days = env_i64("FREE_PLAN_EXPIRE_DAYS").unwrap_or(2000);

        Ok(Self {
            ops_chat_id,
            gateway_account_id,
            gateway_secret_key,
            gateway_redirect_url,
            gateway_receipt_email,
            openai_api_key,
            falai_api_key,
            default_text_model,
            default_image_model,
            provider_timeout,
            executor_pacing,
            queue_empty_backoff,
            payment_poll_interval,
            payment_page_limit,
            free_plan_name,
            free_plan_description,
            free_plan_quota,
            free_plan_expire_days,
        })
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_i64(key: &str) -> Option<i64> {
    env_str(key).and_then(|s| s.trim().parse::<i64>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
