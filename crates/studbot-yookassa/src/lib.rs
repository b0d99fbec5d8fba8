//! YooKassa payment gateway adapter.
//!
//! REST API v3: HTTP basic auth with the shop id and secret key, and an
//! `Idempotence-Key` header (fresh UUID) on every mutating call so retried
//! requests cannot double-charge.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::json;
use uuid::Uuid;

use studbot_core::{
    errors::Error,
    payments::{CreatedPayment, GatewayPayment, PaymentGatewayPort, PaymentRequest},
    store::PaymentStatus,
    Result,
};

const API_BASE: &str = "https://api.yookassa.ru/v3";

pub struct YookassaGateway {
    auth_header: String,
    redirect_url: String,
    http: reqwest::Client,
}

impl YookassaGateway {
    pub fn new(
        account_id: &str,
        secret_key: &str,
        redirect_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Gateway(format!("yookassa client build error: {e}")))?;
        Ok(Self {
            auth_header: basic_auth(account_id, secret_key),
            redirect_url: redirect_url.into(),
            http,
        })
    }

    async fn read_json(resp: reqwest::Response, what: &str) -> Result<serde_json::Value> {
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Gateway(format!(
                "yookassa {what} failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }
        resp.json()
            .await
            .map_err(|e| Error::Gateway(format!("yookassa {what} json error: {e}")))
    }
}

#[async_trait]
impl PaymentGatewayPort for YookassaGateway {
    async fn create_payment(&self, request: &PaymentRequest) -> Result<CreatedPayment> {
        let amount = json!({ "value": format_amount(request.amount), "currency": "RUB" });
        let body = json!({
            "amount": amount,
            "capture": true,
            "confirmation": { "type": "redirect", "return_url": self.redirect_url },
            "description": request.description,
            "receipt": {
                "customer": { "email": request.receipt_email },
                "items": [{
                    "description": request.description,
                    "quantity": "1",
                    "amount": amount,
                    "vat_code": 1,
                    "payment_subject": "service",
                    "payment_mode": "full_payment",
                }],
            },
        });

        let resp = self
            .http
            .post(format!("{API_BASE}/payments"))
            .header("Authorization", &self.auth_header)
            .header("Idempotence-Key", Uuid::new_v4().to_string())
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Gateway(format!("yookassa request error: {e}")))?;

        let v = Self::read_json(resp, "payment creation").await?;
        parse_created(&v)
    }

    async fn get_payment(&self, payment_id: &str) -> Result<GatewayPayment> {
        let resp = self
            .http
            .get(format!("{API_BASE}/payments/{payment_id}"))
            .header("Authorization", &self.auth_header)
            .send()
            .await
            .map_err(|e| Error::Gateway(format!("yookassa request error: {e}")))?;

        let v = Self::read_json(resp, "payment lookup").await?;
        parse_payment(&v)
    }

    async fn list_succeeded(&self, limit: usize) -> Result<Vec<GatewayPayment>> {
        let resp = self
            .http
            .get(format!("{API_BASE}/payments"))
            .query(&[("limit", limit.to_string()), ("status", "succeeded".to_string())])
            .header("Authorization", &self.auth_header)
            .send()
            .await
            .map_err(|e| Error::Gateway(format!("yookassa request error: {e}")))?;

        let v = Self::read_json(resp, "payment listing").await?;
        Ok(parse_listing(&v))
    }

    async fn cancel_payment(&self, payment_id: &str) -> Result<()> {
        let resp = self
            .http
            .post(format!("{API_BASE}/payments/{payment_id}/cancel"))
            .header("Authorization", &self.auth_header)
            .header("Idempotence-Key", Uuid::new_v4().to_string())
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| Error::Gateway(format!("yookassa request error: {e}")))?;

        Self::read_json(resp, "payment cancellation").await?;
        Ok(())
    }
}

fn basic_auth(account_id: &str, secret_key: &str) -> String {
    let credentials =
        base64::engine::general_purpose::STANDARD.encode(format!("{account_id}:{secret_key}"));
    format!("Basic {credentials}")
}

/// YooKassa amounts are decimal strings with exactly two fraction digits.
fn format_amount(amount: f64) -> String {
    format!("{amount:.2}")
}

fn parse_status(s: &str) -> Option<PaymentStatus> {
    match s {
        "pending" => Some(PaymentStatus::Pending),
        "succeeded" => Some(PaymentStatus::Succeeded),
        "canceled" => Some(PaymentStatus::Canceled),
        "waiting_for_capture" => Some(PaymentStatus::WaitingForCapture),
        _ => None,
    }
}

fn parse_created(v: &serde_json::Value) -> Result<CreatedPayment> {
    let payment_id = v
        .get("id")
        .and_then(|id| id.as_str())
        .ok_or_else(|| Error::Gateway("yookassa payment without an id".to_string()))?
        .to_string();
    let confirmation_url = v
        .pointer("/confirmation/confirmation_url")
        .and_then(|u| u.as_str())
        .ok_or_else(|| Error::Gateway("yookassa payment without a confirmation url".to_string()))?
        .to_string();
    Ok(CreatedPayment {
        payment_id,
        confirmation_url,
    })
}

fn parse_payment(v: &serde_json::Value) -> Result<GatewayPayment> {
    let payment_id = v
        .get("id")
        .and_then(|id| id.as_str())
        .ok_or_else(|| Error::Gateway("yookassa payment without an id".to_string()))?
        .to_string();
    let raw_status = v
        .get("status")
        .and_then(|s| s.as_str())
        .ok_or_else(|| Error::Gateway("yookassa payment without a status".to_string()))?;
    let status = parse_status(raw_status)
        .ok_or_else(|| Error::Gateway(format!("unknown payment status '{raw_status}'")))?;
    Ok(GatewayPayment { payment_id, status })
}

fn parse_listing(v: &serde_json::Value) -> Vec<GatewayPayment> {
    let Some(items) = v.get("items").and_then(|i| i.as_array()) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let payment_id = item.get("id").and_then(|id| id.as_str())?.to_string();
            let raw_status = item.get("status").and_then(|s| s.as_str())?;
            let Some(status) = parse_status(raw_status) else {
                tracing::warn!(payment = %payment_id, status = raw_status, "unknown payment status");
                return None;
            };
            Some(GatewayPayment { payment_id, status })
        })
        .collect()
}
