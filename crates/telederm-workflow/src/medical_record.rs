//! 病历写入与读取
//!
//! 写入只允许接诊医生本人，成功写入即完成就诊；读取面向患者本人、
//! 接诊医生与管理员。

use crate::Caller;
use std::sync::Arc;
use telederm_core::{
    Appointment, MedicalRecord, MedicalRecordPatch, RecordContent, Result, Role, TeledermError,
};
use telederm_database::{CoreStore, NewMedicalRecord};
use tracing::info;
use uuid::Uuid;

/// 病历写入请求
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RecordRequest {
    pub appointment_id: i64,
    pub diagnosis: String,
    pub treatment_plan: String,
    #[serde(default)]
    pub medications: Vec<RecordContent>,
    pub follow_up: Option<String>,
    pub additional_notes: Option<String>,
}

/// 病历服务
pub struct MedicalRecordService {
    store: Arc<dyn CoreStore>,
}

impl MedicalRecordService {
    pub fn new(store: Arc<dyn CoreStore>) -> Self {
        Self { store }
    }

    /// 写入病历并完成就诊
    pub async fn create(&self, caller: Caller, request: RecordRequest) -> Result<(MedicalRecord, Appointment)> {
        if caller.role != Role::Doctor {
            return Err(TeledermError::Forbidden("only doctors write medical records".into()));
        }
        if request.diagnosis.trim().is_empty() {
            return Err(TeledermError::Validation("diagnosis must not be empty".into()));
        }
        if request.treatment_plan.trim().is_empty() {
            return Err(TeledermError::Validation("treatment plan must not be empty".into()));
        }

        let (record, appointment) = self
            .store
            .insert_medical_record(NewMedicalRecord {
                appointment_id: request.appointment_id,
                doctor_create_id: caller.user_id,
                diagnosis: request.diagnosis,
                treatment_plan: request.treatment_plan,
                medications: request.medications,
                follow_up: request.follow_up,
                additional_notes: request.additional_notes,
            })
            .await?;
        info!(
            "Medical record {} written for appointment {}, visit completed",
            record.id, appointment.id
        );
        Ok((record, appointment))
    }

    /// 修订病历（仅创建者）
    pub async fn update(&self, caller: Caller, record_id: i64, patch: MedicalRecordPatch) -> Result<MedicalRecord> {
        if caller.role != Role::Doctor {
            return Err(TeledermError::Forbidden("only doctors write medical records".into()));
        }
        self.store.update_medical_record(record_id, caller.user_id, patch).await
    }

    /// 按预约读病历
    pub async fn read(&self, caller: Caller, appointment_id: i64) -> Result<MedicalRecord> {
        let appointment = self
            .store
            .get_appointment(appointment_id)
            .await?
            .ok_or_else(|| TeledermError::NotFound(format!("appointment {}", appointment_id)))?;
        self.authorize_viewer(&caller, appointment.patient_id, appointment.doctor_id)?;

        self.store
            .get_medical_record_by_appointment(appointment_id)
            .await?
            .ok_or_else(|| TeledermError::NotFound(format!("medical record for appointment {}", appointment_id)))
    }

    fn authorize_viewer(&self, caller: &Caller, patient_id: Uuid, doctor_id: Uuid) -> Result<()> {
        let allowed = match caller.role {
            Role::Admin => true,
            Role::Patient => caller.user_id == patient_id,
            Role::Doctor => caller.user_id == doctor_id,
        };
        if allowed {
            Ok(())
        } else {
            Err(TeledermError::Forbidden("no access to this medical record".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking::{BookingRequest, BookingService};
    use crate::policy::CorePolicy;
    use crate::slots::{DayWindows, SlotService, SlotWindow};
    use crate::testutil::{at, fixture, future_date, Fixture};
    use telederm_core::AppointmentStatus;
    use telederm_integration::{MemoryEmitter, MockGateway};

    struct Setup {
        f: Fixture,
        records: MedicalRecordService,
        appointment_id: i64,
    }

    /// 铺到已确认(Approved)的线下预约
    async fn setup() -> Setup {
        let f = fixture().await;
        let slots = SlotService::new(f.store.clone(), CorePolicy::default());
        let ids = slots
            .create_slots(
                f.doctor_id,
                vec![DayWindows {
                    date: future_date(),
                    windows: vec![SlotWindow {
                        start: at(9, 0),
                        end: at(9, 30),
                        examination_type: telederm_core::ExaminationType::Offline,
                    }],
                }],
            )
            .await
            .unwrap();
        let booking = BookingService::new(
            f.store.clone(),
            Arc::new(MockGateway::new()),
            Arc::new(MemoryEmitter::new()),
            CorePolicy::default(),
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
                    is_payment: false,
                    return_url: None,
                    admin_override: false,
                },
            )
            .await
            .unwrap();
        Setup {
            records: MedicalRecordService::new(f.store.clone()),
            appointment_id: outcome.appointment.id,
            f,
        }
    }

    fn request(appointment_id: i64) -> RecordRequest {
        RecordRequest {
            appointment_id,
            diagnosis: "atopic dermatitis".into(),
            treatment_plan: "topical corticosteroid, twice daily".into(),
            medications: vec![RecordContent::Text { body: "hydrocortisone 1%".into() }],
            follow_up: Some("review in two weeks".into()),
            additional_notes: None,
        }
    }

    #[tokio::test]
    async fn test_record_completes_appointment() {
        let s = setup().await;
        let doctor = Caller::doctor(s.f.doctor_id);

        let (record, appointment) = s.records.create(doctor, request(s.appointment_id)).await.unwrap();
        assert_eq!(record.appointment_id, s.appointment_id);
        assert_eq!(appointment.status, AppointmentStatus::Completed);
    }

    #[tokio::test]
    async fn test_one_record_per_appointment() {
        let s = setup().await;
        let doctor = Caller::doctor(s.f.doctor_id);

        s.records.create(doctor, request(s.appointment_id)).await.unwrap();
        let err = s.records.create(doctor, request(s.appointment_id)).await.unwrap_err();
        assert!(matches!(err, TeledermError::RecordExists));
    }

    #[tokio::test]
    async fn test_only_attending_doctor_writes() {
        let s = setup().await;

        let other = Caller::doctor(Uuid::new_v4());
        let err = s.records.create(other, request(s.appointment_id)).await.unwrap_err();
        assert!(matches!(err, TeledermError::Forbidden(_)));

        let patient = Caller::patient(s.f.patient_id);
        let err = s.records.create(patient, request(s.appointment_id)).await.unwrap_err();
        assert!(matches!(err, TeledermError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_read_authorization() {
        let s = setup().await;
        let doctor = Caller::doctor(s.f.doctor_id);
        s.records.create(doctor, request(s.appointment_id)).await.unwrap();

        s.records.read(Caller::patient(s.f.patient_id), s.appointment_id).await.unwrap();
        s.records.read(doctor, s.appointment_id).await.unwrap();
        s.records.read(Caller::admin(Uuid::new_v4()), s.appointment_id).await.unwrap();

        let err = s.records
            .read(Caller::patient(Uuid::new_v4()), s.appointment_id)
            .await
            .unwrap_err();
        assert!(matches!(err, TeledermError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_update_only_by_author() {
        let s = setup().await;
        let doctor = Caller::doctor(s.f.doctor_id);
        let (record, _) = s.records.create(doctor, request(s.appointment_id)).await.unwrap();

        let patch = MedicalRecordPatch {
            diagnosis: Some("contact dermatitis".into()),
            ..Default::default()
        };
        let updated = s.records.update(doctor, record.id, patch.clone()).await.unwrap();
        assert_eq!(updated.diagnosis, "contact dermatitis");

        let err = s.records.update(Caller::doctor(Uuid::new_v4()), record.id, patch).await.unwrap_err();
        assert!(matches!(err, TeledermError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_empty_diagnosis_rejected() {
        let s = setup().await;
        let mut req = request(s.appointment_id);
        req.diagnosis = "  ".into();

        let err = s.records.create(Caller::doctor(s.f.doctor_id), req).await.unwrap_err();
        assert!(matches!(err, TeledermError::Validation(_)));
    }
}
