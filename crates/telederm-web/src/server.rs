//! Web服务器
//!
//! 路由编排：`/health`、`/payment-callback` 与会话签发免认证，
//! 其余业务路由全部挂在bearer认证中间件之后。

use crate::auth::{auth_middleware, AuthService, IssueRequest};
use crate::error::ApiResult;
use crate::handlers::{self, AppState};
use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use telederm_core::Result;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

pub struct WebServer {
    addr: SocketAddr,
    app: Router,
}

impl WebServer {
    pub fn new(addr: SocketAddr, state: AppState, auth: Arc<AuthService>) -> Self {
        Self { addr, app: create_app(state, auth) }
    }

    pub async fn run(self) -> Result<()> {
        info!("Starting web server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, self.app).await?;
        Ok(())
    }
}

/// 会话签发（由外部认证组件持共享密钥调用）
async fn issue_session(
    State(auth): State<Arc<AuthService>>,
    Json(request): Json<IssueRequest>,
) -> ApiResult<impl IntoResponse> {
    let session = auth.issue(request).await?;
    Ok(Json(session))
}

pub fn create_app(state: AppState, auth: Arc<AuthService>) -> Router {
    let protected = Router::new()
        // 预约
        .route(
            "/appointment",
            post(handlers::book_appointment)
                .get(handlers::list_appointments)
                .delete(handlers::cancel_appointment),
        )
        .route("/appointment/:id", get(handlers::get_appointment))
        .route("/appointment/:id/payment-link", post(handlers::retry_payment_link))
        // 病历
        .route(
            "/medical-record",
            post(handlers::create_medical_record).put(handlers::update_medical_record),
        )
        .route("/appointment/:id/medical-record", get(handlers::get_medical_record))
        // 排班
        .route(
            "/doctor/working-time",
            post(handlers::create_working_time).get(handlers::list_working_time),
        )
        .route("/doctor/empty-working-hours", get(handlers::list_empty_working_hours))
        // 统计
        .route("/statistical/monthly", get(handlers::monthly_statistics))
        .route("/statistical/doctor-revenue", get(handlers::doctor_revenue))
        .route("/statistical/patient-spending", get(handlers::patient_spending))
        // 档案管理
        .route("/doctor", post(handlers::upsert_doctor))
        .route("/doctor/:id/verify-status", put(handlers::set_verify_status))
        .route("/doctor/:id/price", post(handlers::set_price_table))
        .route("/patient", post(handlers::upsert_patient))
        .layer(axum::middleware::from_fn_with_state(auth.clone(), auth_middleware))
        .with_state(state.clone());

    // 免认证路由：健康检查、网关回调、会话签发
    let public = Router::new()
        .route("/health", get(handlers::health))
        .route("/payment-callback", post(handlers::payment_callback))
        .with_state(state);
    let session = Router::new()
        .route("/auth/session", post(issue_session))
        .with_state(auth);

    Router::new()
        .merge(public)
        .merge(session)
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
}
