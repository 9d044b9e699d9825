//! 配置管理
//!
//! 配置来源分层：内置默认值、可选的配置文件、`TELEDERM_`前缀的
//! 环境变量（节与键之间用双下划线）。加载后过一遍校验。

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use telederm_workflow::CorePolicy;
use tracing::info;

/// 问诊平台完整配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TeledermConfig {
    /// 服务器配置
    pub server: ServerConfig,
    /// 数据库配置
    pub database: DatabaseConfig,
    /// 预约核心策略
    pub core: CoreConfig,
    /// 支付网关配置
    pub payment: PaymentConfig,
    /// Webhook订阅配置
    pub webhook: WebhookConfig,
    /// 日志配置
    pub logging: LoggingConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 监听主机
    pub host: String,
    /// 监听端口
    pub port: u16,
    /// 会话有效期（小时）
    pub session_ttl_hours: i64,
    /// 会话签发共享密钥
    pub session_issue_secret: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            session_ttl_hours: 24,
            session_issue_secret: "change-me".to_string(),
        }
    }
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// 使用内存存储（开发与测试）
    pub in_memory: bool,
    /// Postgres连接字符串
    pub url: String,
    /// 最大连接数
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            in_memory: true,
            url: String::new(),
            max_connections: 10,
        }
    }
}

/// 预约核心策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// 支付会话有效期（秒）
    pub payment_expiry_seconds: i64,
    /// 患者取消的最小提前量（小时）
    pub cancellation_window_hours: i64,
    /// 患者串行预约规则
    pub patient_serial_booking: bool,
    /// 允许补录过去日期的号源
    pub allow_past_slots: bool,
    /// 号源最短时长（分钟）
    pub min_slot_minutes: i64,
    /// 过期支付清扫间隔（秒）
    pub sweep_interval_seconds: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            payment_expiry_seconds: 300,
            cancellation_window_hours: 48,
            patient_serial_booking: true,
            allow_past_slots: false,
            min_slot_minutes: 30,
            sweep_interval_seconds: 60,
        }
    }
}

impl CoreConfig {
    /// 转换为workflow层策略
    pub fn policy(&self) -> CorePolicy {
        CorePolicy {
            payment_expiry_seconds: self.payment_expiry_seconds,
            cancellation_window_hours: self.cancellation_window_hours,
            patient_serial_booking: self.patient_serial_booking,
            allow_past_slots: self.allow_past_slots,
            min_slot_minutes: self.min_slot_minutes,
        }
    }
}

/// 支付网关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentConfig {
    /// 网关类型：mock 或 checkout
    pub provider: String,
    /// 托管收银台基地址
    pub base_url: String,
    /// API密钥
    pub api_key: String,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            base_url: String::new(),
            api_key: String::new(),
        }
    }
}

/// Webhook订阅
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscriberConfig {
    pub url: String,
    pub secret: String,
}

/// Webhook配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WebhookConfig {
    pub subscribers: Vec<WebhookSubscriberConfig>,
}

/// 日志配置
///
/// 命令行给了 `--log-level` 时以命令行为准
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别过滤串
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl TeledermConfig {
    /// 加载配置：默认值 < 配置文件 < 环境变量
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path));
        }
        let settings = builder
            .add_source(Environment::with_prefix("TELEDERM").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let config: TeledermConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;

        if let Some(path) = config_path {
            info!("Configuration loaded from {}", path);
        } else {
            info!("Configuration loaded from defaults and environment");
        }
        Ok(config)
    }

    /// 配置校验
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port cannot be 0");
        }
        if self.core.payment_expiry_seconds <= 0 {
            anyhow::bail!("core.payment_expiry_seconds must be positive");
        }
        if self.core.cancellation_window_hours < 0 {
            anyhow::bail!("core.cancellation_window_hours cannot be negative");
        }
        if self.core.min_slot_minutes <= 0 {
            anyhow::bail!("core.min_slot_minutes must be positive");
        }
        if !self.database.in_memory && self.database.url.is_empty() {
            anyhow::bail!("database.url is required when in_memory is off");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("database.max_connections cannot be 0");
        }
        match self.payment.provider.as_str() {
            "mock" => {}
            "checkout" => {
                if self.payment.base_url.is_empty() || self.payment.api_key.is_empty() {
                    anyhow::bail!("payment.base_url and payment.api_key are required for checkout");
                }
            }
            other => anyhow::bail!("unknown payment provider: {}", other),
        }
        for subscriber in &self.webhook.subscribers {
            if subscriber.url.is_empty() {
                anyhow::bail!("webhook subscriber url cannot be empty");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = TeledermConfig::default();
        config.validate().unwrap();
        assert_eq!(config.core.payment_expiry_seconds, 300);
        assert_eq!(config.core.cancellation_window_hours, 48);
        assert!(config.core.patient_serial_booking);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_policy_conversion() {
        let mut config = TeledermConfig::default();
        config.core.payment_expiry_seconds = 120;
        config.core.allow_past_slots = true;

        let policy = config.core.policy();
        assert_eq!(policy.payment_expiry_seconds, 120);
        assert!(policy.allow_past_slots);
        assert_eq!(policy.cancellation_window_secs(), 48 * 3600);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = TeledermConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = TeledermConfig::default();
        config.database.in_memory = false;
        assert!(config.validate().is_err());

        let mut config = TeledermConfig::default();
        config.payment.provider = "checkout".into();
        assert!(config.validate().is_err());
    }
}
