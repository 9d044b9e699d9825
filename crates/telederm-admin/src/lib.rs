//! # TeleDerm Admin
//!
//! 配置管理（文件+环境变量分层、校验）与日志初始化。

pub mod config;
pub mod logging;

pub use config::{
    CoreConfig, DatabaseConfig, LoggingConfig, PaymentConfig, ServerConfig, TeledermConfig,
    WebhookConfig, WebhookSubscriberConfig,
};
