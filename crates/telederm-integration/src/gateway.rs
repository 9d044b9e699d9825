//! 支付网关适配层
//!
//! 把外部托管收银台抽象为不透明的预言机：创建支付会话、按订单号
//! 查询结果。重试与错误归一在适配层内完成，业务逻辑一概不在这里。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use telederm_core::{utils, PaymentStatus, Result, TeledermError};
use tokio::sync::RwLock;

/// 支付会话创建请求
#[derive(Debug, Clone, Serialize)]
pub struct SessionRequest {
    /// 金额（最小货币单位）
    pub amount: i64,
    pub description: String,
    pub return_url: String,
    pub cancel_url: String,
    pub expiry_seconds: i64,
}

/// 支付会话
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSession {
    pub order_code: String,
    pub checkout_url: String,
    pub expires_at: i64,
}

/// 订单查询结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLookup {
    pub status: PaymentStatus,
    pub amount: i64,
    pub paid_at: Option<i64>,
}

/// 支付网关契约
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// 创建托管支付会话；重试耗尽后返回 `PaymentUnavailable`
    async fn create_session(&self, request: SessionRequest) -> Result<PaymentSession>;

    /// 按订单号查询会话状态
    async fn lookup(&self, order_code: &str) -> Result<SessionLookup>;
}

/// 内存模拟网关
///
/// 测试与演示部署用：会话保存在内存里，测试通过 `resolve` 驱动
/// 支付结果。
#[derive(Default)]
pub struct MockGateway {
    sessions: RwLock<HashMap<String, (SessionRequest, PaymentStatus)>>,
    fail_sessions: RwLock<bool>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让后续的会话创建全部失败（模拟网关不可用）
    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.fail_sessions.write().await = unavailable;
    }

    /// 测试驱动：把某个会话推进到给定终态
    pub async fn resolve(&self, order_code: &str, status: PaymentStatus) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(order_code) {
            entry.1 = status;
        }
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_session(&self, request: SessionRequest) -> Result<PaymentSession> {
        if *self.fail_sessions.read().await {
            return Err(TeledermError::PaymentUnavailable("mock gateway unavailable".into()));
        }
        let order_code = utils::generate_order_code();
        let expires_at = utils::now_ts() + request.expiry_seconds;
        let session = PaymentSession {
            order_code: order_code.clone(),
            checkout_url: format!("https://checkout.mock.example/{}", order_code),
            expires_at,
        };
        self.sessions
            .write()
            .await
            .insert(order_code, (request, PaymentStatus::Pending));
        Ok(session)
    }

    async fn lookup(&self, order_code: &str) -> Result<SessionLookup> {
        let sessions = self.sessions.read().await;
        let (request, status) = sessions
            .get(order_code)
            .ok_or_else(|| TeledermError::PaymentContentInvalid(order_code.to_string()))?;
        Ok(SessionLookup {
            status: *status,
            amount: request.amount,
            paid_at: if *status == PaymentStatus::Paid { Some(utils::now_ts()) } else { None },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SessionRequest {
        SessionRequest {
            amount: 600,
            description: "APT#1000001".into(),
            return_url: "https://app.example/return".into(),
            cancel_url: "https://app.example/return?code=cancel".into(),
            expiry_seconds: 300,
        }
    }

    #[tokio::test]
    async fn test_mock_session_lifecycle() {
        let gateway = MockGateway::new();
        let session = gateway.create_session(request()).await.unwrap();
        assert!(session.checkout_url.contains(&session.order_code));

        let lookup = gateway.lookup(&session.order_code).await.unwrap();
        assert_eq!(lookup.status, PaymentStatus::Pending);
        assert_eq!(lookup.amount, 600);

        gateway.resolve(&session.order_code, PaymentStatus::Paid).await;
        let lookup = gateway.lookup(&session.order_code).await.unwrap();
        assert_eq!(lookup.status, PaymentStatus::Paid);
        assert!(lookup.paid_at.is_some());
    }

    #[tokio::test]
    async fn test_mock_unavailable() {
        let gateway = MockGateway::new();
        gateway.set_unavailable(true).await;
        let err = gateway.create_session(request()).await.unwrap_err();
        assert!(matches!(err, TeledermError::PaymentUnavailable(_)));
    }

    #[tokio::test]
    async fn test_lookup_unknown_order() {
        let gateway = MockGateway::new();
        let err = gateway.lookup("no-such-order").await.unwrap_err();
        assert!(matches!(err, TeledermError::PaymentContentInvalid(_)));
    }
}
