//! # TeleDerm Workflow
//!
//! 预约与排班核心：号源注册、预约创建、支付结算、取消与病历写入
//! 的协议实现。持久化临界区由存储层的原子操作承担，这里持有业务
//! 策略，并保证外部调用永远发生在事务提交之后。

pub mod booking;
pub mod cancellation;
pub mod medical_record;
pub mod policy;
pub mod slots;
pub mod settlement;
pub mod state_machine;
pub mod sweeper;

pub use booking::{BookingOutcome, BookingRequest, BookingService};
pub use cancellation::CancellationService;
pub use medical_record::{MedicalRecordService, RecordRequest};
pub use policy::CorePolicy;
pub use settlement::SettlementService;
pub use slots::{DayWindows, SlotService, SlotWindow};
pub use state_machine::{AppointmentEvent, AppointmentStateMachine};
pub use sweeper::PaymentSweeper;

use telederm_core::Role;
use uuid::Uuid;

/// 调用方身份（由外部认证组件签发的会话解析而来）
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub user_id: Uuid,
    pub role: Role,
}

impl Caller {
    pub fn admin(user_id: Uuid) -> Self {
        Self { user_id, role: Role::Admin }
    }

    pub fn doctor(user_id: Uuid) -> Self {
        Self { user_id, role: Role::Doctor }
    }

    pub fn patient(user_id: Uuid) -> Self {
        Self { user_id, role: Role::Patient }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use chrono::{NaiveDate, NaiveTime};
    use std::sync::Arc;
    use telederm_core::{Doctor, Patient, ServiceScope, VerifyStatus};
    use telederm_database::{CoreStore, MemoryStore};
    use uuid::Uuid;

    /// 测试夹具：一位准入医生（线上300/线下200、加班倍率2）与一位患者
    pub struct Fixture {
        pub store: Arc<MemoryStore>,
        pub doctor_id: Uuid,
        pub patient_id: Uuid,
    }

    pub async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let doctor_id = Uuid::new_v4();
        let patient_id = Uuid::new_v4();
        store
            .upsert_doctor(Doctor {
                id: doctor_id,
                name: "Dr. Lan".into(),
                verify_status: VerifyStatus::Admitted,
                service_scope: ServiceScope::Both,
                deleted: false,
                created_at: 0,
            })
            .await
            .unwrap();
        store
            .upsert_patient(Patient { id: patient_id, name: "Minh".into(), created_at: 0 })
            .await
            .unwrap();
        store.insert_price_table(doctor_id, 200, 300, 2.0).await.unwrap();
        Fixture { store, doctor_id, patient_id }
    }

    pub fn future_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 6, 2).unwrap()
    }

    pub fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }
}
