//! 核心策略参数

use serde::{Deserialize, Serialize};

/// 预约核心的策略配置
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CorePolicy {
    /// 支付会话有效期（秒）
    pub payment_expiry_seconds: i64,
    /// 非管理员取消所需的最小提前小时数
    pub cancellation_window_hours: i64,
    /// 患者串行预约规则开关
    pub patient_serial_booking: bool,
    /// 是否允许在过去的日期上开号源（演示/补录用）
    pub allow_past_slots: bool,
    /// 号源最短时长（分钟）
    pub min_slot_minutes: i64,
}

impl Default for CorePolicy {
    fn default() -> Self {
        Self {
            payment_expiry_seconds: 300,
            cancellation_window_hours: 48,
            patient_serial_booking: true,
            allow_past_slots: false,
            min_slot_minutes: 30,
        }
    }
}

impl CorePolicy {
    pub fn cancellation_window_secs(&self) -> i64 {
        self.cancellation_window_hours * 3600
    }
}
