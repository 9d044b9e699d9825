//! 内存存储实现
//!
//! 单进程内存实现：每个原子操作整体持有写锁，写锁即临界区，
//! 天然满足号源互斥与结算幂等的线性化要求。用于测试与演示部署。

use crate::store::*;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;
use telederm_core::{
    utils, Appointment, AppointmentStatus, Doctor, ExaminationType, MedicalRecord,
    MedicalRecordPatch, Patient, PaymentStatus, PriceTable, Result, TeledermError, VerifyStatus,
    WorkSlot,
};
use telederm_core::Payment;
use tokio::sync::RwLock;
use uuid::Uuid;

/// 默认预约号起始值（对客户可见的编号策略）
pub const DEFAULT_APPOINTMENT_ID_BASE: i64 = 1_000_000;

#[derive(Debug, Default)]
struct Inner {
    doctors: HashMap<Uuid, Doctor>,
    patients: HashMap<Uuid, Patient>,
    price_tables: Vec<PriceTable>,
    slots: HashMap<i64, WorkSlot>,
    appointments: HashMap<i64, Appointment>,
    payments: HashMap<i64, Payment>,
    records: HashMap<i64, MedicalRecord>,
    next_slot_id: i64,
    next_appointment_id: i64,
    next_payment_id: i64,
    next_price_id: i64,
    next_record_id: i64,
}

/// 内存存储
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_appointment_base(DEFAULT_APPOINTMENT_ID_BASE)
    }

    pub fn with_appointment_base(base: i64) -> Self {
        let inner = Inner {
            next_slot_id: 1,
            next_appointment_id: base,
            next_payment_id: 1,
            next_price_id: 1,
            next_record_id: 1,
            ..Default::default()
        };
        Self { inner: Arc::new(RwLock::new(inner)) }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// 判断两个同日时段是否重叠（半开区间，严格判定）
fn windows_overlap(a: &WorkSlot, b: &NewWorkSlot) -> bool {
    a.date == b.date && a.start_time < b.end_time && b.start_time < a.end_time
}

fn view_of(inner: &Inner, appointment: &Appointment) -> Result<AppointmentView> {
    let slot = inner
        .slots
        .get(&appointment.work_slot_id)
        .ok_or_else(|| TeledermError::Internal(format!("slot {} missing", appointment.work_slot_id)))?;
    let doctor_name = inner
        .doctors
        .get(&appointment.doctor_id)
        .map(|d| d.name.clone())
        .unwrap_or_default();
    let patient_name = inner
        .patients
        .get(&appointment.patient_id)
        .map(|p| p.name.clone())
        .unwrap_or_default();
    Ok(AppointmentView {
        appointment: appointment.clone(),
        examination_type: slot.examination_type,
        slot_date: slot.date,
        slot_start: slot.start_time,
        doctor_name,
        patient_name,
    })
}

#[async_trait]
impl CoreStore for MemoryStore {
    async fn upsert_doctor(&self, doctor: Doctor) -> Result<()> {
        self.inner.write().await.doctors.insert(doctor.id, doctor);
        Ok(())
    }

    async fn get_doctor(&self, doctor_id: Uuid) -> Result<Option<Doctor>> {
        Ok(self.inner.read().await.doctors.get(&doctor_id).cloned())
    }

    async fn upsert_patient(&self, patient: Patient) -> Result<()> {
        self.inner.write().await.patients.insert(patient.id, patient);
        Ok(())
    }

    async fn get_patient(&self, patient_id: Uuid) -> Result<Option<Patient>> {
        Ok(self.inner.read().await.patients.get(&patient_id).cloned())
    }

    async fn set_verify_status(&self, doctor_id: Uuid, status: VerifyStatus) -> Result<()> {
        let mut inner = self.inner.write().await;
        let doctor = inner
            .doctors
            .get_mut(&doctor_id)
            .ok_or_else(|| TeledermError::NotFound(format!("doctor {}", doctor_id)))?;
        doctor.verify_status = status;
        Ok(())
    }

    async fn insert_price_table(
        &self,
        doctor_id: Uuid,
        offline_price: i64,
        online_price: i64,
        ot_multiplier: f64,
    ) -> Result<PriceTable> {
        if offline_price < 0 || online_price < 0 {
            return Err(TeledermError::Validation("prices must be non-negative".into()));
        }
        if ot_multiplier <= 1.0 {
            return Err(TeledermError::Validation("ot_multiplier must be greater than 1".into()));
        }
        let mut inner = self.inner.write().await;
        for row in inner.price_tables.iter_mut().filter(|p| p.doctor_id == doctor_id) {
            row.is_active = false;
        }
        let id = inner.next_price_id;
        inner.next_price_id += 1;
        let table = PriceTable {
            id,
            doctor_id,
            offline_price,
            online_price,
            ot_multiplier,
            is_active: true,
            created_at: utils::now_ts(),
        };
        inner.price_tables.push(table.clone());
        Ok(table)
    }

    async fn active_price_table(&self, doctor_id: Uuid) -> Result<Option<PriceTable>> {
        let inner = self.inner.read().await;
        Ok(inner
            .price_tables
            .iter()
            .filter(|p| p.doctor_id == doctor_id && p.is_active)
            .max_by_key(|p| (p.created_at, p.id))
            .cloned())
    }

    async fn insert_slots(&self, slots: Vec<NewWorkSlot>) -> Result<Vec<i64>> {
        let mut inner = self.inner.write().await;
        // 与既有号源冲突则整体失败
        for new_slot in &slots {
            let conflict = inner.slots.values().any(|existing| {
                existing.doctor_id == new_slot.doctor_id && windows_overlap(existing, new_slot)
            });
            if conflict {
                return Err(TeledermError::Conflict(format!(
                    "slot overlaps existing schedule on {} at {}",
                    new_slot.date, new_slot.start_time
                )));
            }
        }
        let mut ids = Vec::with_capacity(slots.len());
        let now = utils::now_ts();
        for new_slot in slots {
            let id = inner.next_slot_id;
            inner.next_slot_id += 1;
            inner.slots.insert(
                id,
                WorkSlot {
                    id,
                    doctor_id: new_slot.doctor_id,
                    date: new_slot.date,
                    start_time: new_slot.start_time,
                    end_time: new_slot.end_time,
                    examination_type: new_slot.examination_type,
                    ordered: false,
                    fee: new_slot.fee,
                    created_at: now,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    async fn get_slot(&self, slot_id: i64) -> Result<Option<WorkSlot>> {
        Ok(self.inner.read().await.slots.get(&slot_id).cloned())
    }

    async fn list_slots(
        &self,
        doctor_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
        examination_type: Option<ExaminationType>,
        only_free: bool,
    ) -> Result<Vec<WorkSlot>> {
        let inner = self.inner.read().await;
        let mut slots: Vec<WorkSlot> = inner
            .slots
            .values()
            .filter(|s| s.doctor_id == doctor_id && s.date >= from && s.date <= to)
            .filter(|s| examination_type.map_or(true, |t| s.examination_type == t))
            .filter(|s| !only_free || !s.ordered)
            .cloned()
            .collect();
        slots.sort_by_key(|s| (s.date, s.start_time));
        Ok(slots)
    }

    async fn claim_slot_and_insert(&self, request: ClaimRequest) -> Result<Appointment> {
        let mut inner = self.inner.write().await;

        let slot = inner
            .slots
            .get(&request.work_slot_id)
            .cloned()
            .ok_or(TeledermError::SlotGone(request.work_slot_id))?;
        if slot.ordered {
            return Err(TeledermError::SlotTaken(slot.id));
        }
        if request.enforce_serial {
            let busy = inner
                .appointments
                .values()
                .any(|a| a.patient_id == request.patient_id && a.status.is_open());
            if busy {
                return Err(TeledermError::PatientBusy);
            }
        }

        let id = inner.next_appointment_id;
        inner.next_appointment_id += 1;
        let appointment = Appointment {
            id,
            patient_id: request.patient_id,
            doctor_id: request.doctor_id,
            work_slot_id: slot.id,
            name: request.name,
            status: request.status,
            pre_examination_notes: request.pre_examination_notes,
            total_amount: slot.fee,
            link_appointment: request.link_appointment,
            created_at: utils::now_ts(),
        };
        inner.appointments.insert(id, appointment.clone());
        if let Some(slot) = inner.slots.get_mut(&request.work_slot_id) {
            slot.ordered = true;
        }
        Ok(appointment)
    }

    async fn get_appointment(&self, appointment_id: i64) -> Result<Option<Appointment>> {
        Ok(self.inner.read().await.appointments.get(&appointment_id).cloned())
    }

    async fn set_meeting_link(&self, appointment_id: i64, link: String) -> Result<Appointment> {
        let mut inner = self.inner.write().await;
        let appointment = inner
            .appointments
            .get_mut(&appointment_id)
            .ok_or_else(|| TeledermError::NotFound(format!("appointment {}", appointment_id)))?;
        if appointment.link_appointment.is_none() {
            appointment.link_appointment = Some(link);
        }
        Ok(appointment.clone())
    }

    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment> {
        let mut inner = self.inner.write().await;
        if !inner.appointments.contains_key(&payment.appointment_id) {
            return Err(TeledermError::NotFound(format!("appointment {}", payment.appointment_id)));
        }
        let id = inner.next_payment_id;
        inner.next_payment_id += 1;
        let row = Payment {
            id,
            appointment_id: payment.appointment_id,
            amount: payment.amount,
            provider_order_code: payment.provider_order_code,
            provider_status: PaymentStatus::Pending,
            payment_url: payment.payment_url,
            expires_at: payment.expires_at,
            settled_at: None,
            created_at: utils::now_ts(),
        };
        inner.payments.insert(id, row.clone());
        Ok(row)
    }

    async fn get_payment_by_order_code(&self, order_code: &str) -> Result<Option<Payment>> {
        let inner = self.inner.read().await;
        Ok(inner.payments.values().find(|p| p.provider_order_code == order_code).cloned())
    }

    async fn get_payment_by_appointment(&self, appointment_id: i64) -> Result<Option<Payment>> {
        let inner = self.inner.read().await;
        Ok(inner
            .payments
            .values()
            .filter(|p| p.appointment_id == appointment_id)
            .max_by_key(|p| p.id)
            .cloned())
    }

    async fn void_pending_payment(&self, order_code: &str, now_ts: i64) -> Result<Payment> {
        let mut inner = self.inner.write().await;
        let payment_id = inner
            .payments
            .values()
            .find(|p| p.provider_order_code == order_code)
            .map(|p| p.id)
            .ok_or_else(|| TeledermError::NotFound(format!("payment order {}", order_code)))?;
        let payment = inner
            .payments
            .get_mut(&payment_id)
            .ok_or_else(|| TeledermError::NotFound(format!("payment order {}", order_code)))?;
        if payment.provider_status == PaymentStatus::Pending {
            payment.provider_status = PaymentStatus::Cancelled;
            payment.settled_at = Some(now_ts);
        }
        Ok(payment.clone())
    }

    async fn settle(
        &self,
        order_code: &str,
        outcome: SettleOutcome,
        now_ts: i64,
        meeting_link: Option<String>,
    ) -> Result<SettleResult> {
        let mut inner = self.inner.write().await;

        let payment_id = inner
            .payments
            .values()
            .find(|p| p.provider_order_code == order_code)
            .map(|p| p.id)
            .ok_or_else(|| TeledermError::PaymentContentInvalid(order_code.to_string()))?;
        let payment = inner.payments[&payment_id].clone();
        let appointment = inner
            .appointments
            .get(&payment.appointment_id)
            .cloned()
            .ok_or_else(|| TeledermError::Internal(format!("appointment {} missing", payment.appointment_id)))?;
        let previous_status = appointment.status;

        // 幂等：支付单或预约已到终态时原样返回
        if payment.provider_status.is_terminal() || appointment.status.is_terminal() {
            return Ok(SettleResult { appointment, payment, previous_status, changed: false });
        }

        let mut payment = payment;
        let mut appointment = appointment;
        payment.provider_status = outcome.payment_status();
        payment.settled_at = Some(now_ts);

        match outcome {
            SettleOutcome::Paid => {
                if appointment.status == AppointmentStatus::Processing {
                    appointment.status = AppointmentStatus::Approved;
                    let online = inner
                        .slots
                        .get(&appointment.work_slot_id)
                        .map(|s| s.examination_type == ExaminationType::Online)
                        .unwrap_or(false);
                    if online && appointment.link_appointment.is_none() {
                        appointment.link_appointment = meeting_link;
                    }
                }
            }
            SettleOutcome::Cancelled | SettleOutcome::Expired => {
                if appointment.status == AppointmentStatus::Processing {
                    appointment.status = AppointmentStatus::Rejected;
                    if let Some(slot) = inner.slots.get_mut(&appointment.work_slot_id) {
                        slot.ordered = false;
                    }
                }
            }
        }

        inner.payments.insert(payment.id, payment.clone());
        inner.appointments.insert(appointment.id, appointment.clone());
        Ok(SettleResult { appointment, payment, previous_status, changed: true })
    }

    async fn cancel_appointment(&self, appointment_id: i64, policy: CancelPolicy) -> Result<CancelResult> {
        let mut inner = self.inner.write().await;

        let mut appointment = inner
            .appointments
            .get(&appointment_id)
            .cloned()
            .ok_or_else(|| TeledermError::NotFound(format!("appointment {}", appointment_id)))?;

        match appointment.status {
            AppointmentStatus::Completed => return Err(TeledermError::AlreadyFinished),
            AppointmentStatus::Rejected => {
                return Ok(CancelResult { appointment, refund_requested: false, changed: false })
            }
            _ => {}
        }

        if let Some(min_lead) = policy.min_lead_secs {
            let slot = inner
                .slots
                .get(&appointment.work_slot_id)
                .ok_or_else(|| TeledermError::Internal(format!("slot {} missing", appointment.work_slot_id)))?;
            let start_ts = utils::slot_start_ts(slot.date, slot.start_time);
            if start_ts - policy.now_ts < min_lead {
                return Err(TeledermError::CancellationWindowClosed);
            }
        }

        appointment.status = AppointmentStatus::Rejected;
        if let Some(slot) = inner.slots.get_mut(&appointment.work_slot_id) {
            slot.ordered = false;
        }

        // 已支付的支付单保持paid并上报退款请求；未结算的直接作废
        let mut refund_requested = false;
        let payment_ids: Vec<i64> = inner
            .payments
            .values()
            .filter(|p| p.appointment_id == appointment_id)
            .map(|p| p.id)
            .collect();
        for pid in payment_ids {
            if let Some(payment) = inner.payments.get_mut(&pid) {
                match payment.provider_status {
                    PaymentStatus::Paid => refund_requested = true,
                    PaymentStatus::Pending => payment.provider_status = PaymentStatus::Cancelled,
                    _ => {}
                }
            }
        }

        inner.appointments.insert(appointment.id, appointment.clone());
        Ok(CancelResult { appointment, refund_requested, changed: true })
    }

    async fn pending_payments_expiring_before(&self, ts: i64) -> Result<Vec<Payment>> {
        let inner = self.inner.read().await;
        Ok(inner
            .payments
            .values()
            .filter(|p| p.provider_status == PaymentStatus::Pending && p.expires_at <= ts)
            .cloned()
            .collect())
    }

    async fn insert_medical_record(&self, record: NewMedicalRecord) -> Result<(MedicalRecord, Appointment)> {
        let mut inner = self.inner.write().await;

        let mut appointment = inner
            .appointments
            .get(&record.appointment_id)
            .cloned()
            .ok_or_else(|| TeledermError::NotFound(format!("appointment {}", record.appointment_id)))?;

        if inner.records.values().any(|r| r.appointment_id == record.appointment_id) {
            return Err(TeledermError::RecordExists);
        }
        if appointment.status != AppointmentStatus::Approved {
            return Err(TeledermError::InvalidStateTransition {
                from: appointment.status.as_str().to_string(),
                event: "medical_record.create".to_string(),
            });
        }
        if appointment.doctor_id != record.doctor_create_id {
            return Err(TeledermError::Forbidden("only the assigned doctor may close the appointment".into()));
        }

        let id = inner.next_record_id;
        inner.next_record_id += 1;
        let now = utils::now_ts();
        let row = MedicalRecord {
            id,
            appointment_id: record.appointment_id,
            doctor_create_id: record.doctor_create_id,
            patient_id: appointment.patient_id,
            diagnosis: record.diagnosis,
            treatment_plan: record.treatment_plan,
            medications: record.medications,
            follow_up: record.follow_up,
            additional_notes: record.additional_notes,
            created_at: now,
            updated_at: now,
        };
        inner.records.insert(id, row.clone());

        appointment.status = AppointmentStatus::Completed;
        inner.appointments.insert(appointment.id, appointment.clone());
        Ok((row, appointment))
    }

    async fn update_medical_record(
        &self,
        record_id: i64,
        author_doctor_id: Uuid,
        patch: MedicalRecordPatch,
    ) -> Result<MedicalRecord> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(&record_id)
            .ok_or_else(|| TeledermError::NotFound(format!("medical record {}", record_id)))?;
        if record.doctor_create_id != author_doctor_id {
            return Err(TeledermError::Forbidden("only the creating doctor may update the record".into()));
        }
        if let Some(diagnosis) = patch.diagnosis {
            record.diagnosis = diagnosis;
        }
        if let Some(treatment_plan) = patch.treatment_plan {
            record.treatment_plan = treatment_plan;
        }
        if let Some(medications) = patch.medications {
            record.medications = medications;
        }
        if let Some(follow_up) = patch.follow_up {
            record.follow_up = Some(follow_up);
        }
        if let Some(additional_notes) = patch.additional_notes {
            record.additional_notes = Some(additional_notes);
        }
        record.updated_at = utils::now_ts();
        Ok(record.clone())
    }

    async fn get_medical_record_by_appointment(&self, appointment_id: i64) -> Result<Option<MedicalRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.records.values().find(|r| r.appointment_id == appointment_id).cloned())
    }

    async fn list_appointments(&self, filter: AppointmentFilter) -> Result<AppointmentPage> {
        let inner = self.inner.read().await;

        let mut views = Vec::new();
        for appointment in inner.appointments.values() {
            let view = view_of(&inner, appointment)?;
            if let Some(status) = filter.status {
                if view.appointment.status != status {
                    continue;
                }
            }
            if let Some(from) = filter.from_date {
                if view.slot_date < from {
                    continue;
                }
            }
            if let Some(to) = filter.to_date {
                if view.slot_date > to {
                    continue;
                }
            }
            if let Some(t) = filter.examination_type {
                if view.examination_type != t {
                    continue;
                }
            }
            if let Some(doctor_id) = filter.doctor_id {
                if view.appointment.doctor_id != doctor_id {
                    continue;
                }
            }
            if let Some(patient_id) = filter.patient_id {
                if view.appointment.patient_id != patient_id {
                    continue;
                }
            }
            if let Some(ref name) = filter.doctor_name {
                if !view.doctor_name.to_lowercase().contains(&name.to_lowercase()) {
                    continue;
                }
            }
            if let Some(ref name) = filter.patient_name {
                if !view.patient_name.to_lowercase().contains(&name.to_lowercase()) {
                    continue;
                }
            }
            views.push(view);
        }

        views.sort_by_key(|v| std::cmp::Reverse(v.appointment.id));
        let total = views.len() as u64;
        let page = filter.page.max(1);
        let page_size = filter.page_size.max(1);
        let offset = ((page - 1) * page_size) as usize;
        let items = views.into_iter().skip(offset).take(page_size as usize).collect();

        Ok(AppointmentPage { items, total, page, page_size })
    }

    async fn appointment_views_in_range(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AppointmentView>> {
        let inner = self.inner.read().await;
        let mut views = Vec::new();
        for appointment in inner.appointments.values() {
            let view = view_of(&inner, appointment)?;
            if view.slot_date >= from && view.slot_date <= to {
                views.push(view);
            }
        }
        views.sort_by_key(|v| v.appointment.id);
        Ok(views)
    }

    async fn paid_payments_in_range(&self, from_ts: i64, to_ts: i64) -> Result<Vec<Payment>> {
        let inner = self.inner.read().await;
        Ok(inner
            .payments
            .values()
            .filter(|p| p.provider_status == PaymentStatus::Paid)
            .filter(|p| p.settled_at.map_or(false, |ts| ts >= from_ts && ts < to_ts))
            .cloned()
            .collect())
    }
}
