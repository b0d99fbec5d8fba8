//! OpenAI adapter (chat completions).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use studbot_core::{
    errors::Error,
    provider::{CompletionBackend, CompletionRequest, CompletionResponse},
    Result,
};

const COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Clone, Debug)]
pub struct OpenAiClient {
    api_key: String,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Provider(format!("openai client build error: {e}")))?;
        Ok(Self {
            api_key: api_key.into(),
            http,
        })
    }
}

#[async_trait]
impl CompletionBackend for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|turn| json!({ "role": turn.role, "content": turn.content }))
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
        });
        if let Some(tag) = &request.user_tag {
            body["user"] = json!(tag);
        }

        let resp = self
            .http
            .post(COMPLETIONS_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("openai request error: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Provider(format!(
                "openai completion failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let v: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::Provider(format!("openai json error: {e}")))?;

        parse_completion(&v)
    }
}

fn parse_completion(v: &serde_json::Value) -> Result<CompletionResponse> {
    let content = v
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string();
    if content.trim().is_empty() {
        return Err(Error::Provider(
            "openai completion returned empty content".to_string(),
        ));
    }

    let total_tokens = v
        .pointer("/usage/total_tokens")
        .and_then(|t| t.as_i64())
        .unwrap_or(0);

    Ok(CompletionResponse {
        content,
        total_tokens,
    })
}
