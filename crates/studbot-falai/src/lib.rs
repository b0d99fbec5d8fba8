//! fal.ai adapter (image generation).
//!
//! Synchronous generation endpoint: one POST per image, `Key` auth. The
//! returned URL may be a hosted link or a data URL depending on the model.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use studbot_core::{
    errors::Error,
    provider::{ImageBackend, ImageRequest, ImageResponse},
    Result,
};

const API_BASE: &str = "https://fal.run";

pub struct FalaiClient {
    api_key: String,
    model: String,
    http: reqwest::Client,
}

impl FalaiClient {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Provider(format!("falai client build error: {e}")))?;
        Ok(Self {
            api_key: api_key.into(),
            model: model.into(),
            http,
        })
    }
}

#[async_trait]
impl ImageBackend for FalaiClient {
    async fn generate(&self, request: &ImageRequest) -> Result<ImageResponse> {
        let body = json!({
            "prompt": request.prompt,
            "negative_prompt": "nsfw, nude, sexual",
            "num_images": 1,
            "sync_mode": true,
            "enable_safety_checker": true,
            "format": "jpeg",
        });

        let resp = self
            .http
            .post(format!("{API_BASE}/{}", self.model))
            .header("Authorization", format!("Key {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("falai request error: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Provider(format!(
                "falai generation failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let v: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::Provider(format!("falai json error: {e}")))?;

        parse_image(&v)
    }
}

fn parse_image(v: &serde_json::Value) -> Result<ImageResponse> {
    let image_url = v
        .pointer("/images/0/url")
        .and_then(|u| u.as_str())
        .ok_or_else(|| Error::Provider("falai response without an image".to_string()))?
        .to_string();
    Ok(ImageResponse { image_url })
}
