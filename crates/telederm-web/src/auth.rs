//! 会话认证层
//!
//! 会话由外部认证组件签发：它持共享密钥调用签发接口换取bearer
//! token，业务路由经中间件解析token得到调用方身份。会话表驻留
//! 内存，带TTL。

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use telederm_core::{utils, Result, Role, TeledermError};
use telederm_workflow::Caller;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// 会话
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub token: String,
    pub user_id: Uuid,
    pub role: Role,
    pub expires_at: i64,
}

/// 签发请求（由外部认证组件发起）
#[derive(Debug, Deserialize)]
pub struct IssueRequest {
    pub user_id: Uuid,
    pub role: Role,
    pub secret: String,
}

/// 会话服务
#[derive(Clone)]
pub struct AuthService {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    issue_secret: String,
    ttl_secs: i64,
}

impl AuthService {
    pub fn new(issue_secret: String, ttl_secs: i64) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            issue_secret,
            ttl_secs,
        }
    }

    /// 校验共享密钥后签发会话
    pub async fn issue(&self, request: IssueRequest) -> Result<Session> {
        if request.secret != self.issue_secret {
            return Err(TeledermError::Unauthorized("invalid issuer secret".into()));
        }
        let session = Session {
            token: Uuid::new_v4().simple().to_string(),
            user_id: request.user_id,
            role: request.role,
            expires_at: utils::now_ts() + self.ttl_secs,
        };
        self.sessions
            .write()
            .await
            .insert(session.token.clone(), session.clone());
        info!("Session issued for {} ({})", session.user_id, session.role.as_str());
        Ok(session)
    }

    /// 解析bearer token，过期会话即时剔除
    pub async fn verify(&self, token: &str) -> Result<Caller> {
        let now = utils::now_ts();
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(token) {
                if session.expires_at > now {
                    return Ok(Caller { user_id: session.user_id, role: session.role });
                }
            } else {
                return Err(TeledermError::Unauthorized("unknown session token".into()));
            }
        }
        self.sessions.write().await.remove(token);
        Err(TeledermError::Unauthorized("session expired".into()))
    }

    /// 注销会话
    pub async fn revoke(&self, token: &str) -> bool {
        self.sessions.write().await.remove(token).is_some()
    }
}

/// 认证中间件：解析 `Authorization: Bearer <token>`，把调用方身份
/// 放进请求扩展
pub async fn auth_middleware(
    State(auth): State<Arc<AuthService>>,
    mut request: Request,
    next: Next,
) -> std::result::Result<Response, crate::error::ApiError> {
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());
    let token = match header_value {
        Some(h) if h.starts_with("Bearer ") => &h[7..],
        _ => {
            return Err(TeledermError::Unauthorized("missing bearer token".into()).into());
        }
    };

    let caller = auth.verify(token).await?;
    request.extensions_mut().insert(caller);
    Ok(next.run(request).await)
}
