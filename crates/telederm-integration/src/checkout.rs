//! 托管收银台HTTP客户端
//!
//! 对接真实支付服务商的REST接口。瞬时故障按指数退避重试，
//! 最多5次，耗尽后归一为 `PaymentUnavailable`。

use crate::gateway::{PaymentGateway, PaymentSession, SessionLookup, SessionRequest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use telederm_core::{PaymentStatus, Result, TeledermError};
use tracing::{debug, warn};

/// 会话创建的最大尝试次数
const MAX_ATTEMPTS: u32 = 5;

/// 首次重试的退避基数
const BACKOFF_BASE_MS: u64 = 200;

/// 托管收银台客户端
pub struct CheckoutClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct CreateSessionBody<'a> {
    amount: i64,
    description: &'a str,
    return_url: &'a str,
    cancel_url: &'a str,
    expiry_seconds: i64,
}

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    order_code: String,
    checkout_url: String,
    expires_at: i64,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    status: String,
    amount: i64,
    paid_at: Option<i64>,
}

impl CheckoutClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
        }
    }

    async fn try_create(&self, request: &SessionRequest) -> std::result::Result<CreateSessionResponse, reqwest::Error> {
        let body = CreateSessionBody {
            amount: request.amount,
            description: &request.description,
            return_url: &request.return_url,
            cancel_url: &request.cancel_url,
            expiry_seconds: request.expiry_seconds,
        };
        self.client
            .post(format!("{}/v1/checkout-sessions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<CreateSessionResponse>()
            .await
    }
}

#[async_trait]
impl PaymentGateway for CheckoutClient {
    async fn create_session(&self, request: SessionRequest) -> Result<PaymentSession> {
        let mut last_error = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            match self.try_create(&request).await {
                Ok(response) => {
                    debug!("Checkout session {} created on attempt {}", response.order_code, attempt);
                    return Ok(PaymentSession {
                        order_code: response.order_code,
                        checkout_url: response.checkout_url,
                        expires_at: response.expires_at,
                    });
                }
                Err(e) => {
                    warn!("Checkout session attempt {}/{} failed: {}", attempt, MAX_ATTEMPTS, e);
                    last_error = e.to_string();
                    if attempt < MAX_ATTEMPTS {
                        let backoff = BACKOFF_BASE_MS * (1 << (attempt - 1));
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }
        Err(TeledermError::PaymentUnavailable(last_error))
    }

    async fn lookup(&self, order_code: &str) -> Result<SessionLookup> {
        let response = self
            .client
            .get(format!("{}/v1/checkout-sessions/{}", self.base_url, order_code))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| TeledermError::PaymentUnavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(TeledermError::PaymentContentInvalid(order_code.to_string()));
        }
        let body: LookupResponse = response
            .error_for_status()
            .map_err(|e| TeledermError::PaymentUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| TeledermError::PaymentUnavailable(e.to_string()))?;

        let status = PaymentStatus::try_from(body.status.as_str())
            .map_err(TeledermError::PaymentContentInvalid)?;
        Ok(SessionLookup { status, amount: body.amount, paid_at: body.paid_at })
    }
}
