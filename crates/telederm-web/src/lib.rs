//! # TeleDerm Web
//!
//! axum HTTP表层：会话认证中间件、请求整形处理器与错误到状态码
//! 的映射。业务语义全部委托给workflow与reporting层。

pub mod auth;
pub mod error;
pub mod handlers;
pub mod server;

pub use auth::{AuthService, Session};
pub use error::{ApiError, ApiResult};
pub use handlers::AppState;
pub use server::{create_app, WebServer};
