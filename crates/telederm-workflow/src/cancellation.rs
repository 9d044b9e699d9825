//! 预约取消协议
//!
//! 患者本人受提前量窗口约束，管理员不受；已支付的预约取消后发出
//! 退款事件，实际退款由对账侧处理。

use crate::policy::CorePolicy;
use crate::Caller;
use serde_json::json;
use std::sync::Arc;
use telederm_core::{utils, Result, TeledermError};
use telederm_database::{CancelPolicy, CancelResult, CoreStore};
use telederm_integration::{CoreEvent, EventEmitter, EventPayload};
use tracing::{info, warn};

/// 预约取消服务
pub struct CancellationService {
    store: Arc<dyn CoreStore>,
    emitter: Arc<dyn EventEmitter>,
    policy: CorePolicy,
}

impl CancellationService {
    pub fn new(store: Arc<dyn CoreStore>, emitter: Arc<dyn EventEmitter>, policy: CorePolicy) -> Self {
        Self { store, emitter, policy }
    }

    /// 取消预约
    pub async fn cancel(&self, caller: Caller, appointment_id: i64) -> Result<CancelResult> {
        let appointment = self
            .store
            .get_appointment(appointment_id)
            .await?
            .ok_or_else(|| TeledermError::NotFound(format!("appointment {}", appointment_id)))?;
        if !caller.is_admin() && caller.user_id != appointment.patient_id {
            return Err(TeledermError::Forbidden("not your appointment".into()));
        }

        // 管理员取消不受提前量约束
        let min_lead_secs = if caller.is_admin() {
            None
        } else {
            Some(self.policy.cancellation_window_secs())
        };

        let result = self
            .store
            .cancel_appointment(appointment_id, CancelPolicy { min_lead_secs, now_ts: utils::now_ts() })
            .await?;

        if !result.changed {
            return Ok(result);
        }
        info!(
            "Appointment {} cancelled by {} (refund_requested={})",
            appointment_id,
            caller.role.as_str(),
            result.refund_requested
        );

        self.emit(EventPayload::new(
            CoreEvent::AppointmentRejected,
            json!({
                "appointment_id": result.appointment.id,
                "patient_id": result.appointment.patient_id,
                "status": result.appointment.status.as_str(),
                "reason": "cancelled",
            }),
        ))
        .await;
        if result.refund_requested {
            self.emit(EventPayload::new(
                CoreEvent::RefundRequested,
                json!({
                    "appointment_id": result.appointment.id,
                    "patient_id": result.appointment.patient_id,
                    "amount": result.appointment.total_amount,
                }),
            ))
            .await;
        }

        Ok(result)
    }

    async fn emit(&self, payload: EventPayload) {
        let event = payload.event_type;
        if let Err(e) = self.emitter.emit(payload).await {
            warn!("Failed to emit {}: {}", event.as_str(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking::{BookingRequest, BookingService};
    use crate::settlement::SettlementService;
    use crate::slots::{DayWindows, SlotService, SlotWindow};
    use crate::testutil::{at, fixture, future_date, Fixture};
    use chrono::Duration;
    use telederm_core::AppointmentStatus;
    use telederm_integration::{MemoryEmitter, MockGateway};
    use uuid::Uuid;

    struct Setup {
        f: Fixture,
        cancellation: CancellationService,
        emitter: Arc<MemoryEmitter>,
        booking: BookingService,
        slots: SlotService,
    }

    async fn setup() -> Setup {
        let f = fixture().await;
        let emitter = Arc::new(MemoryEmitter::new());
        // 同一份策略值传给三个服务
        let policy = CorePolicy::default();
        Setup {
            cancellation: CancellationService::new(f.store.clone(), emitter.clone(), policy),
            booking: BookingService::new(
                f.store.clone(),
                Arc::new(MockGateway::new()),
                emitter.clone(),
                policy,
            ),
            slots: SlotService::new(f.store.clone(), policy),
            emitter,
            f,
        }
    }

    async fn book(s: &Setup, date: chrono::NaiveDate, paid: bool) -> i64 {
        let ids = s.slots
            .create_slots(
                s.f.doctor_id,
                vec![DayWindows {
                    date,
                    windows: vec![SlotWindow {
                        start: at(10, 0),
                        end: at(10, 30),
                        examination_type: telederm_core::ExaminationType::Online,
                    }],
                }],
            )
            .await
            .unwrap();
        let outcome = s.booking
            .create(
                Caller::patient(s.f.patient_id),
                BookingRequest {
                    patient_id: s.f.patient_id,
                    doctor_id: s.f.doctor_id,
                    work_slot_id: ids[0],
                    name: "consult".into(),
                    pre_examination_notes: None,
                    is_payment: paid,
                    return_url: paid.then(|| "https://app.example/return".to_string()),
                    admin_override: false,
                },
            )
            .await
            .unwrap();
        if paid {
            let payment = s.f.store
                .get_payment_by_appointment(outcome.appointment.id)
                .await
                .unwrap()
                .unwrap();
            SettlementService::new(s.f.store.clone(), s.emitter.clone())
                .settle_callback(&payment.provider_order_code, "success")
                .await
                .unwrap();
        }
        outcome.appointment.id
    }

    #[tokio::test]
    async fn test_patient_cancel_inside_window() {
        let s = setup().await;
        let id = book(&s, future_date(), false).await;

        let result = s.cancellation.cancel(Caller::patient(s.f.patient_id), id).await.unwrap();
        assert!(result.changed);
        assert_eq!(result.appointment.status, AppointmentStatus::Rejected);
        assert!(!result.refund_requested);
        let slot = s.f.store.get_slot(result.appointment.work_slot_id).await.unwrap().unwrap();
        assert!(!slot.ordered);
        assert_eq!(s.emitter.events_of(CoreEvent::AppointmentRejected).await.len(), 1);
    }

    #[tokio::test]
    async fn test_window_closed_for_patient_but_open_for_admin() {
        let s = setup().await;
        // 明天的号在48小时窗口之内
        let tomorrow = utils::local_date_of(utils::now_ts()) + Duration::days(1);
        let id = book(&s, tomorrow, false).await;

        let err = s.cancellation.cancel(Caller::patient(s.f.patient_id), id).await.unwrap_err();
        assert!(matches!(err, TeledermError::CancellationWindowClosed));

        let result = s.cancellation.cancel(Caller::admin(Uuid::new_v4()), id).await.unwrap();
        assert!(result.changed);
        assert_eq!(result.appointment.status, AppointmentStatus::Rejected);
    }

    #[tokio::test]
    async fn test_paid_cancellation_requests_refund() {
        let s = setup().await;
        let id = book(&s, future_date(), true).await;

        let result = s.cancellation.cancel(Caller::patient(s.f.patient_id), id).await.unwrap();
        assert!(result.changed);
        assert!(result.refund_requested);
        assert_eq!(s.emitter.events_of(CoreEvent::RefundRequested).await.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let s = setup().await;
        let id = book(&s, future_date(), false).await;

        s.cancellation.cancel(Caller::patient(s.f.patient_id), id).await.unwrap();
        let second = s.cancellation.cancel(Caller::patient(s.f.patient_id), id).await.unwrap();
        assert!(!second.changed);
        // 重复取消不再发事件
        assert_eq!(s.emitter.events_of(CoreEvent::AppointmentRejected).await.len(), 1);
    }

    #[tokio::test]
    async fn test_stranger_cannot_cancel() {
        let s = setup().await;
        let id = book(&s, future_date(), false).await;

        let err = s.cancellation.cancel(Caller::patient(Uuid::new_v4()), id).await.unwrap_err();
        assert!(matches!(err, TeledermError::Forbidden(_)));
    }
}
