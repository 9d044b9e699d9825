//! 错误定义模块

use thiserror::Error;

/// 问诊平台统一错误类型
#[derive(Error, Debug)]
pub enum TeledermError {
    #[error("未登录或会话无效: {0}")]
    Unauthorized(String),

    #[error("无权访问: {0}")]
    Forbidden(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("号源已被预约: {0}")]
    SlotTaken(i64),

    #[error("号源不存在或已失效: {0}")]
    SlotGone(i64),

    #[error("患者已有未完成的预约")]
    PatientBusy,

    #[error("距离就诊时间不足，无法取消")]
    CancellationWindowClosed,

    #[error("预约已结束，无法再变更")]
    AlreadyFinished,

    #[error("该预约已存在病历")]
    RecordExists,

    #[error("支付渠道暂不可用: {0}")]
    PaymentUnavailable(String),

    #[error("支付回调内容无效: {0}")]
    PaymentContentInvalid(String),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("数据冲突: {0}")]
    Conflict(String),

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("网络错误: {0}")]
    Network(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("系统内部错误: {0}")]
    Internal(String),

    #[error("无效状态转换: 从 {from} 经 {event}")]
    InvalidStateTransition { from: String, event: String },
}

impl TeledermError {
    /// 对外暴露的错误码，随错误响应体返回
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::SlotTaken(_) => "slot_taken",
            Self::SlotGone(_) => "slot_gone",
            Self::PatientBusy => "patient_busy",
            Self::CancellationWindowClosed => "cancellation_window_closed",
            Self::AlreadyFinished => "already_finished",
            Self::RecordExists => "record_exists",
            Self::PaymentUnavailable(_) => "payment_unavailable",
            Self::PaymentContentInvalid(_) => "payment_content_invalid",
            Self::Validation(_) => "validation_error",
            Self::Conflict(_) => "conflict",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            _ => "server_error",
        }
    }

    /// 映射到HTTP状态码
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthorized(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) | Self::SlotGone(_) => 404,
            Self::SlotTaken(_) | Self::PatientBusy | Self::RecordExists | Self::Conflict(_) => 409,
            Self::CancellationWindowClosed
            | Self::AlreadyFinished
            | Self::Validation(_)
            | Self::InvalidStateTransition { .. } => 400,
            _ => 500,
        }
    }
}

/// 问诊平台统一结果类型
pub type Result<T> = std::result::Result<T, TeledermError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(TeledermError::SlotTaken(1).status_code(), 409);
        assert_eq!(TeledermError::PatientBusy.status_code(), 409);
        assert_eq!(TeledermError::RecordExists.status_code(), 409);
        assert_eq!(TeledermError::CancellationWindowClosed.status_code(), 400);
        assert_eq!(TeledermError::SlotGone(1).status_code(), 404);
        assert_eq!(TeledermError::Unauthorized("no token".into()).status_code(), 401);
        assert_eq!(TeledermError::Internal("boom".into()).status_code(), 500);
    }

    #[test]
    fn test_error_code_strings() {
        assert_eq!(TeledermError::PatientBusy.error_code(), "patient_busy");
        assert_eq!(TeledermError::Database("x".into()).error_code(), "server_error");
    }
}
