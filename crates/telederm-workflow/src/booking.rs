//! 预约创建协议
//!
//! 策略校验在前，存储层原子区承担占用与插入，支付会话在预约
//! 提交之后创建——任何锁都不会跨越外部调用。会话创建失败时预约
//! 停留在 Processing，可通过补发接口重试。

use crate::policy::CorePolicy;
use crate::Caller;
use serde_json::json;
use std::sync::Arc;
use telederm_core::{
    utils, Appointment, AppointmentStatus, ExaminationType, Result, Role, TeledermError,
};
use telederm_database::{ClaimRequest, CoreStore, NewPayment};
use telederm_integration::{CoreEvent, EventEmitter, EventPayload, PaymentGateway, SessionRequest};
use tracing::{info, warn};
use uuid::Uuid;

/// 预约请求
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub work_slot_id: i64,
    pub name: String,
    pub pre_examination_notes: Option<String>,
    /// 是否走在线支付
    pub is_payment: bool,
    /// 支付完成后的跳转地址（需要支付时必填）
    pub return_url: Option<String>,
    /// 管理员代订过去时段的放行标志
    pub admin_override: bool,
}

/// 预约结果
#[derive(Debug, Clone, serde::Serialize)]
pub struct BookingOutcome {
    pub appointment: Appointment,
    pub payment_url: Option<String>,
    pub expires_at: Option<i64>,
}

/// 预约创建服务
pub struct BookingService {
    store: Arc<dyn CoreStore>,
    gateway: Arc<dyn PaymentGateway>,
    emitter: Arc<dyn EventEmitter>,
    policy: CorePolicy,
}

impl BookingService {
    pub fn new(
        store: Arc<dyn CoreStore>,
        gateway: Arc<dyn PaymentGateway>,
        emitter: Arc<dyn EventEmitter>,
        policy: CorePolicy,
    ) -> Self {
        Self { store, gateway, emitter, policy }
    }

    /// 创建预约
    pub async fn create(&self, caller: Caller, request: BookingRequest) -> Result<BookingOutcome> {
        // 患者只能为本人预约；管理员可代订
        match caller.role {
            Role::Patient if caller.user_id != request.patient_id => {
                return Err(TeledermError::Forbidden("patients may only book for themselves".into()));
            }
            Role::Doctor => {
                return Err(TeledermError::Forbidden("doctors cannot book appointments".into()));
            }
            _ => {}
        }
        let admin_override = request.admin_override && caller.is_admin();

        let slot = self
            .store
            .get_slot(request.work_slot_id)
            .await?
            .ok_or(TeledermError::SlotGone(request.work_slot_id))?;
        if slot.doctor_id != request.doctor_id {
            return Err(TeledermError::Validation("slot does not belong to the given doctor".into()));
        }
        // 预检；权威判定在存储原子区内复核
        if slot.ordered {
            return Err(TeledermError::SlotTaken(slot.id));
        }
        let now = utils::now_ts();
        if utils::slot_start_ts(slot.date, slot.start_time) <= now && !admin_override {
            return Err(TeledermError::Validation("slot is in the past".into()));
        }

        let requires_payment = request.is_payment && slot.examination_type == ExaminationType::Online;
        let status = if requires_payment {
            AppointmentStatus::Processing
        } else {
            AppointmentStatus::Approved
        };
        if requires_payment && request.return_url.is_none() {
            return Err(TeledermError::Validation("return_url is required for online payment".into()));
        }

        let appointment = self
            .store
            .claim_slot_and_insert(ClaimRequest {
                patient_id: request.patient_id,
                doctor_id: request.doctor_id,
                work_slot_id: slot.id,
                name: request.name.clone(),
                status,
                pre_examination_notes: request.pre_examination_notes.clone(),
                link_appointment: None,
                enforce_serial: self.policy.patient_serial_booking,
            })
            .await?;
        info!(
            "Appointment {} created for patient {} (status={})",
            appointment.id, appointment.patient_id, appointment.status.as_str()
        );

        if !requires_payment {
            // 直接确认：线上免支付的预约在这里拿到会议链接
            let appointment = if slot.examination_type == ExaminationType::Online {
                self.attach_meeting_link(&appointment).await?
            } else {
                appointment
            };
            self.emit_confirmed(&appointment).await;
            return Ok(BookingOutcome { appointment, payment_url: None, expires_at: None });
        }

        // 预约已提交，支付会话在事务之外创建
        match self.request_session(&appointment, request.return_url.as_deref().unwrap_or_default()).await {
            Ok((payment_url, expires_at)) => Ok(BookingOutcome {
                appointment,
                payment_url: Some(payment_url),
                expires_at: Some(expires_at),
            }),
            Err(e) => {
                // 预约保持 Processing，等待补发支付链接
                warn!("Payment session for appointment {} failed: {}", appointment.id, e);
                Ok(BookingOutcome { appointment, payment_url: None, expires_at: None })
            }
        }
    }

    /// 为停留在 Processing 的预约补发支付链接
    pub async fn retry_payment_link(&self, caller: Caller, appointment_id: i64, return_url: &str) -> Result<BookingOutcome> {
        let appointment = self
            .store
            .get_appointment(appointment_id)
            .await?
            .ok_or_else(|| TeledermError::NotFound(format!("appointment {}", appointment_id)))?;
        if !caller.is_admin() && caller.user_id != appointment.patient_id {
            return Err(TeledermError::Forbidden("not your appointment".into()));
        }
        if appointment.status != AppointmentStatus::Processing {
            return Err(TeledermError::InvalidStateTransition {
                from: appointment.status.as_str().to_string(),
                event: "payment.retry".to_string(),
            });
        }

        // 仍在有效期内的会话直接复用
        if let Some(payment) = self.store.get_payment_by_appointment(appointment_id).await? {
            if !payment.provider_status.is_terminal() {
                if payment.expires_at > utils::now_ts() {
                    return Ok(BookingOutcome {
                        appointment,
                        payment_url: payment.payment_url,
                        expires_at: Some(payment.expires_at),
                    });
                }
                // 已过期的会话先作废，否则清扫器会拿旧单否决整个预约
                self.store
                    .void_pending_payment(&payment.provider_order_code, utils::now_ts())
                    .await?;
                info!(
                    "Stale payment session {} voided for appointment {}",
                    payment.provider_order_code, appointment_id
                );
            }
        }

        let (payment_url, expires_at) = self.request_session(&appointment, return_url).await?;
        Ok(BookingOutcome { appointment, payment_url: Some(payment_url), expires_at: Some(expires_at) })
    }

    async fn request_session(&self, appointment: &Appointment, return_url: &str) -> Result<(String, i64)> {
        let session = self
            .gateway
            .create_session(SessionRequest {
                amount: appointment.total_amount,
                description: format!("APT#{}", appointment.id),
                return_url: return_url.to_string(),
                cancel_url: format!("{}?code=cancel", return_url),
                expiry_seconds: self.policy.payment_expiry_seconds,
            })
            .await?;

        let payment = self
            .store
            .insert_payment(NewPayment {
                appointment_id: appointment.id,
                amount: appointment.total_amount,
                provider_order_code: session.order_code.clone(),
                payment_url: Some(session.checkout_url.clone()),
                expires_at: session.expires_at,
            })
            .await?;
        info!(
            "Payment session {} created for appointment {} (expires_at={})",
            payment.provider_order_code, appointment.id, payment.expires_at
        );
        Ok((session.checkout_url, session.expires_at))
    }

    async fn attach_meeting_link(&self, appointment: &Appointment) -> Result<Appointment> {
        // 链接需要预约号，只能在插入之后补写
        self.store
            .set_meeting_link(appointment.id, utils::generate_meeting_link(appointment.id))
            .await
    }

    async fn emit_confirmed(&self, appointment: &Appointment) {
        let event = EventPayload::new(
            CoreEvent::AppointmentConfirmed,
            json!({
                "appointment_id": appointment.id,
                "patient_id": appointment.patient_id,
                "doctor_id": appointment.doctor_id,
            }),
        );
        if let Err(e) = self.emitter.emit(event).await {
            warn!("Failed to emit appointment.confirmed for {}: {}", appointment.id, e);
        }
    }
}
