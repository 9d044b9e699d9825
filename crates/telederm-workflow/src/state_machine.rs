//! 预约状态机
//!
//! 管理预约的完整生命周期状态转换。线下预约创建即 Approved；
//! 线上需支付的预约从 Processing 起步，支付成功进入 Approved，
//! 病历写入后进入 Completed。Rejected 与 Completed 为终态。

use std::collections::HashMap;
use telederm_core::{AppointmentStatus, Result, TeledermError};

/// 预约状态转换事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppointmentEvent {
    /// 医生人工确认（保留的待确认流程）
    DoctorApproved,
    /// 支付成功回调
    PaymentPaid,
    /// 支付取消回调
    PaymentCancelled,
    /// 支付会话过期
    PaymentExpired,
    /// 患者或管理员取消
    Cancelled,
    /// 病历写入
    RecordWritten,
}

impl AppointmentEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DoctorApproved => "doctor.approved",
            Self::PaymentPaid => "payment.paid",
            Self::PaymentCancelled => "payment.cancelled",
            Self::PaymentExpired => "payment.expired",
            Self::Cancelled => "cancelled",
            Self::RecordWritten => "record.written",
        }
    }
}

/// 预约状态机
#[derive(Debug)]
pub struct AppointmentStateMachine {
    transitions: HashMap<(AppointmentStatus, AppointmentEvent), AppointmentStatus>,
}

impl AppointmentStateMachine {
    /// 创建新的状态机实例
    pub fn new() -> Self {
        use AppointmentEvent::*;
        use AppointmentStatus::*;

        let mut transitions = HashMap::new();

        // 定义状态转换规则
        transitions.insert((Pending, DoctorApproved), Approved);
        transitions.insert((Pending, Cancelled), Rejected);
        transitions.insert((Processing, PaymentPaid), Approved);
        transitions.insert((Processing, PaymentCancelled), Rejected);
        transitions.insert((Processing, PaymentExpired), Rejected);
        transitions.insert((Processing, Cancelled), Rejected);
        transitions.insert((Approved, Cancelled), Rejected);
        transitions.insert((Approved, RecordWritten), Completed);

        Self { transitions }
    }

    /// 检查状态转换是否有效
    pub fn can_transition(&self, from: AppointmentStatus, event: AppointmentEvent) -> bool {
        self.transitions.contains_key(&(from, event))
    }

    /// 执行状态转换
    pub fn transition(&self, from: AppointmentStatus, event: AppointmentEvent) -> Result<AppointmentStatus> {
        match self.transitions.get(&(from, event)) {
            Some(to) => Ok(*to),
            None => Err(TeledermError::InvalidStateTransition {
                from: from.as_str().to_string(),
                event: event.as_str().to_string(),
            }),
        }
    }
}

impl Default for AppointmentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AppointmentEvent::*;
    use AppointmentStatus::*;

    #[test]
    fn test_valid_transitions() {
        let sm = AppointmentStateMachine::new();

        assert_eq!(sm.transition(Processing, PaymentPaid).unwrap(), Approved);
        assert_eq!(sm.transition(Processing, PaymentCancelled).unwrap(), Rejected);
        assert_eq!(sm.transition(Processing, PaymentExpired).unwrap(), Rejected);
        assert_eq!(sm.transition(Approved, RecordWritten).unwrap(), Completed);
        assert_eq!(sm.transition(Approved, Cancelled).unwrap(), Rejected);
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        let sm = AppointmentStateMachine::new();

        for event in [DoctorApproved, PaymentPaid, PaymentCancelled, PaymentExpired, Cancelled, RecordWritten] {
            assert!(!sm.can_transition(Completed, event));
            assert!(!sm.can_transition(Rejected, event));
        }
    }

    #[test]
    fn test_record_requires_approved() {
        let sm = AppointmentStateMachine::new();

        assert!(!sm.can_transition(Processing, RecordWritten));
        assert!(!sm.can_transition(Pending, RecordWritten));
        let err = sm.transition(Processing, RecordWritten).unwrap_err();
        assert!(matches!(err, TeledermError::InvalidStateTransition { .. }));
    }
}
