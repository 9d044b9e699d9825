//! Webhook事件通知模块
//!
//! 核心只发出事件信号，投递给外部订阅方：
//! - 事件订阅管理
//! - 安全的Webhook签名验证
//! - 有界重试
//! 通知之外的语义（如退款执行）不属于核心。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use telederm_core::Result;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 核心事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoreEvent {
    AppointmentConfirmed,
    AppointmentRejected,
    RefundRequested,
}

impl CoreEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AppointmentConfirmed => "appointment.confirmed",
            Self::AppointmentRejected => "appointment.rejected",
            Self::RefundRequested => "refund.requested",
        }
    }
}

impl TryFrom<&str> for CoreEvent {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        match value {
            "appointment.confirmed" => Ok(Self::AppointmentConfirmed),
            "appointment.rejected" => Ok(Self::AppointmentRejected),
            "refund.requested" => Ok(Self::RefundRequested),
            _ => Err(anyhow::anyhow!("Unknown event type: {}", value)),
        }
    }
}

/// 事件数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    pub id: String,
    pub event_type: CoreEvent,
    pub timestamp: i64,
    pub data: serde_json::Value,
    pub source: String,
}

impl EventPayload {
    pub fn new(event_type: CoreEvent, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            timestamp: chrono::Utc::now().timestamp(),
            data,
            source: "telederm".to_string(),
        }
    }
}

/// 事件发射器契约
///
/// 组合根注入；投递失败只记录日志，绝不让请求失败。
#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit(&self, event: EventPayload) -> Result<()>;
}

/// Webhook订阅配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: String,
    pub url: String,
    pub events: Vec<CoreEvent>,
    pub secret: Option<String>,
    pub active: bool,
    pub created_at: i64,
}

impl WebhookSubscription {
    pub fn new(url: String, events: Vec<CoreEvent>, secret: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url,
            events,
            secret,
            active: true,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// 检查是否对指定事件感兴趣
    pub fn is_interested_in(&self, event_type: &CoreEvent) -> bool {
        self.active && self.events.contains(event_type)
    }

    /// 生成签名
    pub fn generate_signature(&self, payload: &str) -> Option<String> {
        use sha2::{Digest, Sha256};

        if let Some(secret) = &self.secret {
            let mut hasher = Sha256::new();
            hasher.update(payload);
            hasher.update(secret);
            Some(format!("sha256={:x}", hasher.finalize()))
        } else {
            None
        }
    }
}

/// 每个订阅方的最大投递尝试次数
const MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// Webhook管理器
pub struct WebhookManager {
    subscriptions: RwLock<HashMap<String, WebhookSubscription>>,
    client: reqwest::Client,
}

impl WebhookManager {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            client: reqwest::Client::new(),
        }
    }

    /// 订阅事件
    pub async fn subscribe(&self, url: String, events: Vec<CoreEvent>, secret: Option<String>) -> String {
        let subscription = WebhookSubscription::new(url, events, secret);
        let id = subscription.id.clone();
        self.subscriptions.write().await.insert(id.clone(), subscription);
        info!("Created webhook subscription: {}", id);
        id
    }

    /// 取消订阅
    pub async fn unsubscribe(&self, subscription_id: &str) -> bool {
        let removed = self.subscriptions.write().await.remove(subscription_id).is_some();
        if removed {
            info!("Removed webhook subscription: {}", subscription_id);
        }
        removed
    }

    async fn deliver(&self, subscription: &WebhookSubscription, event: &EventPayload) {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to serialize event {}: {}", event.id, e);
                return;
            }
        };

        for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
            let mut request = self
                .client
                .post(&subscription.url)
                .header("Content-Type", "application/json")
                .header("X-TeleDerm-Event", event.event_type.as_str())
                .body(payload.clone());
            if let Some(signature) = subscription.generate_signature(&payload) {
                request = request.header("X-TeleDerm-Signature", signature);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("Delivered event {} to {}", event.id, subscription.url);
                    return;
                }
                Ok(response) => {
                    warn!(
                        "Webhook delivery to {} returned {} (attempt {}/{})",
                        subscription.url, response.status(), attempt, MAX_DELIVERY_ATTEMPTS
                    );
                }
                Err(e) => {
                    warn!(
                        "Webhook delivery to {} failed: {} (attempt {}/{})",
                        subscription.url, e, attempt, MAX_DELIVERY_ATTEMPTS
                    );
                }
            }
        }
    }
}

impl Default for WebhookManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventEmitter for WebhookManager {
    async fn emit(&self, event: EventPayload) -> Result<()> {
        let subscriptions: Vec<WebhookSubscription> = {
            let guard = self.subscriptions.read().await;
            guard
                .values()
                .filter(|s| s.is_interested_in(&event.event_type))
                .cloned()
                .collect()
        };

        debug!("Emitting {} to {} subscribers", event.event_type.as_str(), subscriptions.len());
        for subscription in subscriptions {
            self.deliver(&subscription, &event).await;
        }
        Ok(())
    }
}

/// 内存事件记录器（测试用）
#[derive(Default)]
pub struct MemoryEmitter {
    events: RwLock<Vec<EventPayload>>,
}

impl MemoryEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<EventPayload> {
        self.events.read().await.clone()
    }

    pub async fn events_of(&self, event_type: CoreEvent) -> Vec<EventPayload> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventEmitter for MemoryEmitter {
    async fn emit(&self, event: EventPayload) -> Result<()> {
        self.events.write().await.push(event);
        Ok(())
    }
}
