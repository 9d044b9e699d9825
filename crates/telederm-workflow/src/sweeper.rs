//! 过期支付清扫器
//!
//! 周期性把超过有效期仍未结算的支付单按 Expired 结算。结算入口与
//! 网关回调相同，乱序到达时以先提交者为准。

use crate::settlement::SettlementService;
use std::sync::Arc;
use std::time::Duration;
use telederm_core::utils;
use telederm_database::{CoreStore, SettleOutcome};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// 过期支付清扫器
pub struct PaymentSweeper {
    store: Arc<dyn CoreStore>,
    settlement: Arc<SettlementService>,
    interval: Duration,
}

impl PaymentSweeper {
    pub fn new(store: Arc<dyn CoreStore>, settlement: Arc<SettlementService>, interval_secs: u64) -> Self {
        Self { store, settlement, interval: Duration::from_secs(interval_secs) }
    }

    /// 启动后台清扫任务
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_once().await {
                    error!("Payment sweep failed: {}", e);
                }
            }
        })
    }

    /// 扫一轮：把已到期的pending支付单按Expired结算
    pub async fn sweep_once(&self) -> telederm_core::Result<usize> {
        let expired = self
            .store
            .pending_payments_expiring_before(utils::now_ts())
            .await?;
        let mut settled = 0;
        for payment in expired {
            match self
                .settlement
                .settle(&payment.provider_order_code, SettleOutcome::Expired)
                .await
            {
                Ok(result) if result.changed => settled += 1,
                // 回调赶在清扫前到达时这里自然落空
                Ok(_) => {}
                Err(e) => error!("Expiring payment {} failed: {}", payment.provider_order_code, e),
            }
        }
        if settled > 0 {
            info!("Payment sweep expired {} stale payments", settled);
        }
        Ok(settled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking::{BookingRequest, BookingService};
    use crate::policy::CorePolicy;
    use crate::slots::{DayWindows, SlotService, SlotWindow};
    use crate::testutil::{at, fixture, future_date};
    use crate::Caller;
    use telederm_core::{AppointmentStatus, ExaminationType};
    use telederm_integration::{CoreEvent, MemoryEmitter, MockGateway};

    #[tokio::test]
    async fn test_sweep_expires_stale_payment() {
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

        // 有效期为零的策略让支付单立即过期
        let policy = CorePolicy { payment_expiry_seconds: 0, ..Default::default() };
        let emitter = Arc::new(MemoryEmitter::new());
        let booking = BookingService::new(
            f.store.clone(),
            Arc::new(MockGateway::new()),
            emitter.clone(),
            policy,
        );
        let outcome = booking
            .create(
                Caller::patient(f.patient_id),
                BookingRequest {
                    patient_id: f.patient_id,
                    doctor_id: f.doctor_id,
                    work_slot_id: ids[0],
                    name: "consult".into(),
                    pre_examination_notes: None,
                    is_payment: true,
                    return_url: Some("https://app.example/return".into()),
                    admin_override: false,
                },
            )
            .await
            .unwrap();

        let settlement = Arc::new(SettlementService::new(f.store.clone(), emitter.clone()));
        let sweeper = PaymentSweeper::new(f.store.clone(), settlement, 60);

        assert_eq!(sweeper.sweep_once().await.unwrap(), 1);
        let appointment = f.store.get_appointment(outcome.appointment.id).await.unwrap().unwrap();
        assert_eq!(appointment.status, AppointmentStatus::Rejected);
        assert_eq!(emitter.events_of(CoreEvent::AppointmentRejected).await.len(), 1);

        // 第二轮没有可清扫的支付单
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retry_supersedes_stale_session_before_sweep() {
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
        let gateway = Arc::new(MockGateway::new());

        // 首次会话立即过期
        let expired_policy = CorePolicy { payment_expiry_seconds: 0, ..Default::default() };
        let booking = BookingService::new(f.store.clone(), gateway.clone(), emitter.clone(), expired_policy);
        let outcome = booking
            .create(
                Caller::patient(f.patient_id),
                BookingRequest {
                    patient_id: f.patient_id,
                    doctor_id: f.doctor_id,
                    work_slot_id: ids[0],
                    name: "consult".into(),
                    pre_examination_notes: None,
                    is_payment: true,
                    return_url: Some("https://app.example/return".into()),
                    admin_override: false,
                },
            )
            .await
            .unwrap();
        let stale = f
            .store
            .get_payment_by_appointment(outcome.appointment.id)
            .await
            .unwrap()
            .unwrap();

        // 补发走正常有效期
        let booking = BookingService::new(f.store.clone(), gateway, emitter.clone(), CorePolicy::default());
        let retried = booking
            .retry_payment_link(Caller::patient(f.patient_id), outcome.appointment.id, "https://app.example/return")
            .await
            .unwrap();
        assert!(retried.payment_url.is_some());
        assert_ne!(retried.payment_url, stale.payment_url);

        // 旧单已被补发作废，清扫器不再触碰该预约
        let settlement = Arc::new(SettlementService::new(f.store.clone(), emitter.clone()));
        let sweeper = PaymentSweeper::new(f.store.clone(), settlement.clone(), 60);
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);

        // 新会话支付成功，预约正常确认
        let live = f
            .store
            .get_payment_by_appointment(outcome.appointment.id)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(live.provider_order_code, stale.provider_order_code);
        let result = settlement
            .settle(&live.provider_order_code, SettleOutcome::Paid)
            .await
            .unwrap();
        assert!(result.changed);
        assert_eq!(result.appointment.status, AppointmentStatus::Approved);
        assert!(f.store.get_slot(ids[0]).await.unwrap().unwrap().ordered);

        // 迟到的旧单回调落空
        let late = settlement
            .settle(&stale.provider_order_code, SettleOutcome::Paid)
            .await
            .unwrap();
        assert!(!late.changed);
        assert_eq!(late.appointment.status, AppointmentStatus::Approved);
    }
}
