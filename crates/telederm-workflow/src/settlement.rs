//! 支付结算协议
//!
//! 网关回调与过期清扫器共用同一入口。状态解析在锁外完成，存储层
//! 的结算原子区负责幂等判定；只有真正发生状态变化的那次调用才会
//! 发出事件。

use crate::state_machine::{AppointmentEvent, AppointmentStateMachine};
use serde_json::json;
use std::sync::Arc;
use telederm_core::{utils, Result, TeledermError};
use telederm_database::{CoreStore, SettleOutcome, SettleResult};
use telederm_integration::{CoreEvent, EventEmitter, EventPayload};
use tracing::{info, warn};

/// 支付结算服务
pub struct SettlementService {
    store: Arc<dyn CoreStore>,
    emitter: Arc<dyn EventEmitter>,
    state_machine: AppointmentStateMachine,
}

impl SettlementService {
    pub fn new(store: Arc<dyn CoreStore>, emitter: Arc<dyn EventEmitter>) -> Self {
        Self { store, emitter, state_machine: AppointmentStateMachine::new() }
    }

    /// 解析网关回调里的状态码
    pub fn parse_status_code(code: &str) -> Result<SettleOutcome> {
        match code.to_ascii_lowercase().as_str() {
            "success" | "paid" => Ok(SettleOutcome::Paid),
            "cancel" | "cancelled" => Ok(SettleOutcome::Cancelled),
            "expired" => Ok(SettleOutcome::Expired),
            other => Err(TeledermError::PaymentContentInvalid(format!(
                "unknown status code {:?}",
                other
            ))),
        }
    }

    /// 按网关回调结算
    pub async fn settle_callback(&self, order_code: &str, status_code: &str) -> Result<SettleResult> {
        let outcome = Self::parse_status_code(status_code)?;
        self.settle(order_code, outcome).await
    }

    /// 结算一笔支付单（幂等）
    pub async fn settle(&self, order_code: &str, outcome: SettleOutcome) -> Result<SettleResult> {
        let payment = self
            .store
            .get_payment_by_order_code(order_code)
            .await?
            .ok_or_else(|| TeledermError::NotFound(format!("payment order {}", order_code)))?;

        // 支付成功的线上预约在结算原子区内拿到会议链接
        let meeting_link = match outcome {
            SettleOutcome::Paid => Some(utils::generate_meeting_link(payment.appointment_id)),
            _ => None,
        };

        let event = match outcome {
            SettleOutcome::Paid => AppointmentEvent::PaymentPaid,
            SettleOutcome::Cancelled => AppointmentEvent::PaymentCancelled,
            SettleOutcome::Expired => AppointmentEvent::PaymentExpired,
        };

        let result = self
            .store
            .settle(order_code, outcome, utils::now_ts(), meeting_link)
            .await?;

        if !result.changed {
            info!(
                "Settle for order {} ignored, appointment {} already {}",
                order_code,
                result.appointment.id,
                result.appointment.status.as_str()
            );
            return Ok(result);
        }

        // 存储层已提交；这里只比对协议并记录异常转换
        match self.state_machine.transition(result.previous_status, event) {
            Ok(expected) if expected == result.appointment.status => {}
            _ => warn!(
                "Settle applied out-of-protocol transition {} from {} on appointment {}",
                event.as_str(),
                result.previous_status.as_str(),
                result.appointment.id
            ),
        }

        info!(
            "Payment {} settled as {} for appointment {} (now {})",
            order_code,
            result.payment.provider_status.as_str(),
            result.appointment.id,
            result.appointment.status.as_str()
        );

        let (core_event, reason) = match outcome {
            SettleOutcome::Paid => (CoreEvent::AppointmentConfirmed, "payment.paid"),
            SettleOutcome::Cancelled => (CoreEvent::AppointmentRejected, "payment.cancelled"),
            SettleOutcome::Expired => (CoreEvent::AppointmentRejected, "payment.expired"),
        };
        let payload = EventPayload::new(
            core_event,
            json!({
                "appointment_id": result.appointment.id,
                "patient_id": result.appointment.patient_id,
                "status": result.appointment.status.as_str(),
                "order_code": order_code,
                "reason": reason,
            }),
        );
        if let Err(e) = self.emitter.emit(payload).await {
            warn!("Failed to emit {} for order {}: {}", core_event.as_str(), order_code, e);
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking::{BookingRequest, BookingService};
    use crate::policy::CorePolicy;
    use crate::slots::{DayWindows, SlotService, SlotWindow};
    use crate::testutil::{at, fixture, future_date, Fixture};
    use crate::Caller;
    use telederm_core::{AppointmentStatus, ExaminationType, PaymentStatus};
    use telederm_integration::{MemoryEmitter, MockGateway};

    struct Setup {
        f: Fixture,
        settlement: SettlementService,
        emitter: Arc<MemoryEmitter>,
        appointment_id: i64,
        order_code: String,
    }

    /// 铺到已有在线支付单待结算的状态
    async fn setup() -> Setup {
        let f = fixture().await;
        let slots = SlotService::new(f.store.clone(), CorePolicy::default());
        let ids = slots
            .create_slots(
                f.doctor_id,
                vec![DayWindows {
                    date: future_date(),
                    windows: vec![SlotWindow {
                        start: at(19, 0),
                        end: at(19, 30),
                        examination_type: ExaminationType::Online,
                    }],
                }],
            )
            .await
            .unwrap();
        let emitter = Arc::new(MemoryEmitter::new());
        let booking = BookingService::new(
            f.store.clone(),
            Arc::new(MockGateway::new()),
            emitter.clone(),
            CorePolicy::default(),
        );
        let outcome = booking
            .create(
                Caller::patient(f.patient_id),
                BookingRequest {
                    patient_id: f.patient_id,
                    doctor_id: f.doctor_id,
                    work_slot_id: ids[0],
                    name: "follow-up".into(),
                    pre_examination_notes: None,
                    is_payment: true,
                    return_url: Some("https://app.example/return".into()),
                    admin_override: false,
                },
            )
            .await
            .unwrap();
        let payment = f
            .store
            .get_payment_by_appointment(outcome.appointment.id)
            .await
            .unwrap()
            .unwrap();
        let settlement = SettlementService::new(f.store.clone(), emitter.clone());
        Setup {
            f,
            settlement,
            emitter,
            appointment_id: outcome.appointment.id,
            order_code: payment.provider_order_code,
        }
    }

    #[tokio::test]
    async fn test_paid_settles_to_approved_with_meeting_link() {
        let s = setup().await;

        let result = s.settlement.settle_callback(&s.order_code, "success").await.unwrap();
        assert!(result.changed);
        assert_eq!(result.previous_status, AppointmentStatus::Processing);
        assert_eq!(result.appointment.status, AppointmentStatus::Approved);
        assert_eq!(result.payment.provider_status, PaymentStatus::Paid);
        assert!(result.appointment.link_appointment.is_some());
        assert_eq!(s.emitter.events_of(CoreEvent::AppointmentConfirmed).await.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_callback_is_idempotent() {
        let s = setup().await;

        s.settlement.settle_callback(&s.order_code, "success").await.unwrap();
        let second = s.settlement.settle_callback(&s.order_code, "success").await.unwrap();
        assert!(!second.changed);
        assert_eq!(second.previous_status, AppointmentStatus::Approved);
        assert_eq!(second.appointment.status, AppointmentStatus::Approved);
        // 第二次回调不再发事件
        assert_eq!(s.emitter.events_of(CoreEvent::AppointmentConfirmed).await.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_after_paid_keeps_approved() {
        let s = setup().await;

        s.settlement.settle_callback(&s.order_code, "success").await.unwrap();
        let result = s.settlement.settle_callback(&s.order_code, "cancel").await.unwrap();
        assert!(!result.changed);
        assert_eq!(result.appointment.status, AppointmentStatus::Approved);
        assert_eq!(result.payment.provider_status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn test_cancel_rejects_and_releases_slot() {
        let s = setup().await;

        let result = s.settlement.settle_callback(&s.order_code, "cancel").await.unwrap();
        assert!(result.changed);
        assert_eq!(result.appointment.status, AppointmentStatus::Rejected);

        let slot = s.f.store.get_slot(result.appointment.work_slot_id).await.unwrap().unwrap();
        assert!(!slot.ordered, "rejected appointment must release its slot");
        assert_eq!(s.emitter.events_of(CoreEvent::AppointmentRejected).await.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_rejects() {
        let s = setup().await;

        let result = s.settlement.settle_callback(&s.order_code, "expired").await.unwrap();
        assert!(result.changed);
        assert_eq!(result.appointment.status, AppointmentStatus::Rejected);
        assert_eq!(result.payment.provider_status, PaymentStatus::Expired);
    }

    #[tokio::test]
    async fn test_unknown_status_code_rejected() {
        let s = setup().await;

        let err = s.settlement.settle_callback(&s.order_code, "mystery").await.unwrap_err();
        assert!(matches!(err, TeledermError::PaymentContentInvalid(_)));
        // 预约保持原状
        let appointment = s.f.store.get_appointment(s.appointment_id).await.unwrap().unwrap();
        assert_eq!(appointment.status, AppointmentStatus::Processing);
    }
}
