//! PostgreSQL存储实现
//!
//! 号源占用用 `SELECT … FOR UPDATE` 加条件更新的受影响行数作为
//! 线性化见证；结算与取消在预约行的独占锁内执行。任何外部调用
//! 都发生在事务提交之后。

use crate::connection::DatabasePool;
use crate::store::*;
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::PgRow;
use sqlx::Row;
use telederm_core::{
    utils, Appointment, AppointmentStatus, Doctor, ExaminationType, MedicalRecord,
    MedicalRecordPatch, Patient, Payment, PaymentStatus, PriceTable, Result, ServiceScope,
    TeledermError, VerifyStatus, WorkSlot,
};
use uuid::Uuid;

/// PostgreSQL存储
#[derive(Clone)]
pub struct PostgresStore {
    pool: DatabasePool,
}

fn db_err<E: std::fmt::Display>(e: E) -> TeledermError {
    TeledermError::Database(e.to_string())
}

fn map_doctor(row: &PgRow) -> Result<Doctor> {
    let verify_raw: i16 = row.try_get("verify_status").map_err(db_err)?;
    let scope_raw: String = row.try_get("service_scope").map_err(db_err)?;
    Ok(Doctor {
        id: row.try_get("id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        verify_status: VerifyStatus::from_i16(verify_raw)
            .ok_or_else(|| TeledermError::Database(format!("bad verify_status {}", verify_raw)))?,
        service_scope: ServiceScope::try_from(scope_raw.as_str()).map_err(TeledermError::Database)?,
        deleted: row.try_get("deleted").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn map_price_table(row: &PgRow) -> Result<PriceTable> {
    Ok(PriceTable {
        id: row.try_get("id").map_err(db_err)?,
        doctor_id: row.try_get("doctor_id").map_err(db_err)?,
        offline_price: row.try_get("offline_price").map_err(db_err)?,
        online_price: row.try_get("online_price").map_err(db_err)?,
        ot_multiplier: row.try_get("ot_multiplier").map_err(db_err)?,
        is_active: row.try_get("is_active").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn map_slot(row: &PgRow) -> Result<WorkSlot> {
    let exam_raw: String = row.try_get("examination_type").map_err(db_err)?;
    Ok(WorkSlot {
        id: row.try_get("id").map_err(db_err)?,
        doctor_id: row.try_get("doctor_id").map_err(db_err)?,
        date: row.try_get("date").map_err(db_err)?,
        start_time: row.try_get("start_time").map_err(db_err)?,
        end_time: row.try_get("end_time").map_err(db_err)?,
        examination_type: ExaminationType::try_from(exam_raw.as_str()).map_err(TeledermError::Database)?,
        ordered: row.try_get("ordered").map_err(db_err)?,
        fee: row.try_get("fee").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn map_appointment(row: &PgRow) -> Result<Appointment> {
    let status_raw: String = row.try_get("status").map_err(db_err)?;
    Ok(Appointment {
        id: row.try_get("id").map_err(db_err)?,
        patient_id: row.try_get("patient_id").map_err(db_err)?,
        doctor_id: row.try_get("doctor_id").map_err(db_err)?,
        work_slot_id: row.try_get("work_slot_id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        status: AppointmentStatus::try_from(status_raw.as_str()).map_err(TeledermError::Database)?,
        pre_examination_notes: row.try_get("pre_examination_notes").map_err(db_err)?,
        total_amount: row.try_get("total_amount").map_err(db_err)?,
        link_appointment: row.try_get("link_appointment").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn map_payment(row: &PgRow) -> Result<Payment> {
    let status_raw: String = row.try_get("provider_status").map_err(db_err)?;
    Ok(Payment {
        id: row.try_get("id").map_err(db_err)?,
        appointment_id: row.try_get("appointment_id").map_err(db_err)?,
        amount: row.try_get("amount").map_err(db_err)?,
        provider_order_code: row.try_get("provider_order_code").map_err(db_err)?,
        provider_status: PaymentStatus::try_from(status_raw.as_str()).map_err(TeledermError::Database)?,
        payment_url: row.try_get("payment_url").map_err(db_err)?,
        expires_at: row.try_get("expires_at").map_err(db_err)?,
        settled_at: row.try_get("settled_at").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn map_record(row: &PgRow) -> Result<MedicalRecord> {
    let medications_raw: String = row.try_get("medications").map_err(db_err)?;
    Ok(MedicalRecord {
        id: row.try_get("id").map_err(db_err)?,
        appointment_id: row.try_get("appointment_id").map_err(db_err)?,
        doctor_create_id: row.try_get("doctor_create_id").map_err(db_err)?,
        patient_id: row.try_get("patient_id").map_err(db_err)?,
        diagnosis: row.try_get("diagnosis").map_err(db_err)?,
        treatment_plan: row.try_get("treatment_plan").map_err(db_err)?,
        medications: serde_json::from_str(&medications_raw)?,
        follow_up: row.try_get("follow_up").map_err(db_err)?,
        additional_notes: row.try_get("additional_notes").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn map_view(row: &PgRow) -> Result<AppointmentView> {
    let exam_raw: String = row.try_get("examination_type").map_err(db_err)?;
    Ok(AppointmentView {
        appointment: map_appointment(row)?,
        examination_type: ExaminationType::try_from(exam_raw.as_str()).map_err(TeledermError::Database)?,
        slot_date: row.try_get("slot_date").map_err(db_err)?,
        slot_start: row.try_get("slot_start").map_err(db_err)?,
        doctor_name: row.try_get("doctor_name").map_err(db_err)?,
        patient_name: row.try_get("patient_name").map_err(db_err)?,
    })
}

const VIEW_SELECT: &str = r#"
    SELECT a.id, a.patient_id, a.doctor_id, a.work_slot_id, a.name, a.status,
           a.pre_examination_notes, a.total_amount, a.link_appointment, a.created_at,
           s.examination_type, s.date AS slot_date, s.start_time AS slot_start,
           d.name AS doctor_name, p.name AS patient_name
    FROM appointments a
    JOIN work_slots s ON s.id = a.work_slot_id
    JOIN doctors d ON d.id = a.doctor_id
    JOIN patients p ON p.id = a.patient_id
"#;

impl PostgresStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// 初始化表结构
    pub async fn migrate(&self) -> Result<()> {
        crate::schema::create_tables(self.pool.pool()).await
    }
}

#[async_trait]
impl CoreStore for PostgresStore {
    async fn upsert_doctor(&self, doctor: Doctor) -> Result<()> {
        sqlx::query(r#"
            INSERT INTO doctors (id, name, verify_status, service_scope, deleted, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                verify_status = EXCLUDED.verify_status,
                service_scope = EXCLUDED.service_scope,
                deleted = EXCLUDED.deleted
        "#)
        .bind(doctor.id)
        .bind(&doctor.name)
        .bind(doctor.verify_status.as_i16())
        .bind(doctor.service_scope.as_str())
        .bind(doctor.deleted)
        .bind(doctor.created_at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_doctor(&self, doctor_id: Uuid) -> Result<Option<Doctor>> {
        let row = sqlx::query("SELECT * FROM doctors WHERE id = $1")
            .bind(doctor_id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)?;
        row.map(|r| map_doctor(&r)).transpose()
    }

    async fn upsert_patient(&self, patient: Patient) -> Result<()> {
        sqlx::query(r#"
            INSERT INTO patients (id, name, created_at) VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name
        "#)
        .bind(patient.id)
        .bind(&patient.name)
        .bind(patient.created_at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_patient(&self, patient_id: Uuid) -> Result<Option<Patient>> {
        let row = sqlx::query("SELECT * FROM patients WHERE id = $1")
            .bind(patient_id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| {
            Ok::<_, TeledermError>(Patient {
                id: r.try_get("id").map_err(db_err)?,
                name: r.try_get("name").map_err(db_err)?,
                created_at: r.try_get("created_at").map_err(db_err)?,
            })
        })
        .transpose()?)
    }

    async fn set_verify_status(&self, doctor_id: Uuid, status: VerifyStatus) -> Result<()> {
        let result = sqlx::query("UPDATE doctors SET verify_status = $1 WHERE id = $2")
            .bind(status.as_i16())
            .bind(doctor_id)
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(TeledermError::NotFound(format!("doctor {}", doctor_id)));
        }
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
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;
        sqlx::query("UPDATE price_tables SET is_active = FALSE WHERE doctor_id = $1 AND is_active")
            .bind(doctor_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let row = sqlx::query(r#"
            INSERT INTO price_tables (doctor_id, offline_price, online_price, ot_multiplier, is_active, created_at)
            VALUES ($1, $2, $3, $4, TRUE, $5)
            RETURNING *
        "#)
        .bind(doctor_id)
        .bind(offline_price)
        .bind(online_price)
        .bind(ot_multiplier)
        .bind(utils::now_ts())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        map_price_table(&row)
    }

    async fn active_price_table(&self, doctor_id: Uuid) -> Result<Option<PriceTable>> {
        let row = sqlx::query(r#"
            SELECT * FROM price_tables
            WHERE doctor_id = $1 AND is_active
            ORDER BY created_at DESC, id DESC
            LIMIT 1
        "#)
        .bind(doctor_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)?;
        row.map(|r| map_price_table(&r)).transpose()
    }

    async fn insert_slots(&self, slots: Vec<NewWorkSlot>) -> Result<Vec<i64>> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;
        let now = utils::now_ts();
        let mut ids = Vec::with_capacity(slots.len());
        for slot in &slots {
            // 半开区间的严格重叠判定
            let conflict = sqlx::query(r#"
                SELECT 1 AS one FROM work_slots
                WHERE doctor_id = $1 AND date = $2
                  AND start_time < $4 AND $3 < end_time
                LIMIT 1
            "#)
            .bind(slot.doctor_id)
            .bind(slot.date)
            .bind(slot.start_time)
            .bind(slot.end_time)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
            if conflict.is_some() {
                return Err(TeledermError::Conflict(format!(
                    "slot overlaps existing schedule on {} at {}",
                    slot.date, slot.start_time
                )));
            }
            let row = sqlx::query(r#"
                INSERT INTO work_slots (doctor_id, date, start_time, end_time, examination_type, ordered, fee, created_at)
                VALUES ($1, $2, $3, $4, $5, FALSE, $6, $7)
                RETURNING id
            "#)
            .bind(slot.doctor_id)
            .bind(slot.date)
            .bind(slot.start_time)
            .bind(slot.end_time)
            .bind(slot.examination_type.as_str())
            .bind(slot.fee)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            ids.push(row.try_get("id").map_err(db_err)?);
        }
        tx.commit().await.map_err(db_err)?;
        Ok(ids)
    }

    async fn get_slot(&self, slot_id: i64) -> Result<Option<WorkSlot>> {
        let row = sqlx::query("SELECT * FROM work_slots WHERE id = $1")
            .bind(slot_id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)?;
        row.map(|r| map_slot(&r)).transpose()
    }

    async fn list_slots(
        &self,
        doctor_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
        examination_type: Option<ExaminationType>,
        only_free: bool,
    ) -> Result<Vec<WorkSlot>> {
        let rows = sqlx::query(r#"
            SELECT * FROM work_slots
            WHERE doctor_id = $1 AND date BETWEEN $2 AND $3
              AND ($4::text IS NULL OR examination_type = $4)
              AND (NOT $5 OR NOT ordered)
            ORDER BY date, start_time
        "#)
        .bind(doctor_id)
        .bind(from)
        .bind(to)
        .bind(examination_type.map(|t| t.as_str()))
        .bind(only_free)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?;
        rows.iter().map(map_slot).collect()
    }

    async fn claim_slot_and_insert(&self, request: ClaimRequest) -> Result<Appointment> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        // 号源行独占锁
        let slot_row = sqlx::query("SELECT * FROM work_slots WHERE id = $1 FOR UPDATE")
            .bind(request.work_slot_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(TeledermError::SlotGone(request.work_slot_id))?;
        let slot = map_slot(&slot_row)?;
        if slot.ordered {
            return Err(TeledermError::SlotTaken(slot.id));
        }

        if request.enforce_serial {
            let busy = sqlx::query(r#"
                SELECT 1 AS one FROM appointments
                WHERE patient_id = $1 AND status IN ('pending', 'processing', 'approved')
                LIMIT 1
            "#)
            .bind(request.patient_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
            if busy.is_some() {
                return Err(TeledermError::PatientBusy);
            }
        }

        // 条件更新的受影响行数即占用见证
        let claimed = sqlx::query("UPDATE work_slots SET ordered = TRUE WHERE id = $1 AND NOT ordered")
            .bind(slot.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if claimed.rows_affected() == 0 {
            return Err(TeledermError::SlotTaken(slot.id));
        }

        let row = sqlx::query(r#"
            INSERT INTO appointments
                (patient_id, doctor_id, work_slot_id, name, status, pre_examination_notes,
                 total_amount, link_appointment, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
        "#)
        .bind(request.patient_id)
        .bind(request.doctor_id)
        .bind(slot.id)
        .bind(&request.name)
        .bind(request.status.as_str())
        .bind(&request.pre_examination_notes)
        .bind(slot.fee)
        .bind(&request.link_appointment)
        .bind(utils::now_ts())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        map_appointment(&row)
    }

    async fn get_appointment(&self, appointment_id: i64) -> Result<Option<Appointment>> {
        let row = sqlx::query("SELECT * FROM appointments WHERE id = $1")
            .bind(appointment_id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)?;
        row.map(|r| map_appointment(&r)).transpose()
    }

    async fn set_meeting_link(&self, appointment_id: i64, link: String) -> Result<Appointment> {
        let row = sqlx::query(r#"
            UPDATE appointments
            SET link_appointment = COALESCE(link_appointment, $1)
            WHERE id = $2
            RETURNING *
        "#)
        .bind(&link)
        .bind(appointment_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)?
        .ok_or_else(|| TeledermError::NotFound(format!("appointment {}", appointment_id)))?;
        map_appointment(&row)
    }

    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment> {
        let row = sqlx::query(r#"
            INSERT INTO payments
                (appointment_id, amount, provider_order_code, provider_status, payment_url, expires_at, created_at)
            VALUES ($1, $2, $3, 'pending', $4, $5, $6)
            RETURNING *
        "#)
        .bind(payment.appointment_id)
        .bind(payment.amount)
        .bind(&payment.provider_order_code)
        .bind(&payment.payment_url)
        .bind(payment.expires_at)
        .bind(utils::now_ts())
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)?;
        map_payment(&row)
    }

    async fn get_payment_by_order_code(&self, order_code: &str) -> Result<Option<Payment>> {
        let row = sqlx::query("SELECT * FROM payments WHERE provider_order_code = $1")
            .bind(order_code)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)?;
        row.map(|r| map_payment(&r)).transpose()
    }

    async fn get_payment_by_appointment(&self, appointment_id: i64) -> Result<Option<Payment>> {
        let row = sqlx::query("SELECT * FROM payments WHERE appointment_id = $1 ORDER BY id DESC LIMIT 1")
            .bind(appointment_id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)?;
        row.map(|r| map_payment(&r)).transpose()
    }

    async fn void_pending_payment(&self, order_code: &str, now_ts: i64) -> Result<Payment> {
        let row = sqlx::query(r#"
            UPDATE payments
            SET provider_status = 'cancelled', settled_at = $2
            WHERE provider_order_code = $1 AND provider_status = 'pending'
            RETURNING *
        "#)
        .bind(order_code)
        .bind(now_ts)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)?;
        if let Some(row) = row {
            return map_payment(&row);
        }
        // 已到终态（或并发结算抢先）：原样返回
        let row = sqlx::query("SELECT * FROM payments WHERE provider_order_code = $1")
            .bind(order_code)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)?
            .ok_or_else(|| TeledermError::NotFound(format!("payment order {}", order_code)))?;
        map_payment(&row)
    }

    async fn settle(
        &self,
        order_code: &str,
        outcome: SettleOutcome,
        now_ts: i64,
        meeting_link: Option<String>,
    ) -> Result<SettleResult> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        let payment_row = sqlx::query("SELECT * FROM payments WHERE provider_order_code = $1 FOR UPDATE")
            .bind(order_code)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| TeledermError::PaymentContentInvalid(order_code.to_string()))?;
        let mut payment = map_payment(&payment_row)?;

        // 预约行独占锁：并发回调在此串行化
        let appointment_row = sqlx::query("SELECT * FROM appointments WHERE id = $1 FOR UPDATE")
            .bind(payment.appointment_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        let mut appointment = map_appointment(&appointment_row)?;
        let previous_status = appointment.status;

        if payment.provider_status.is_terminal() || appointment.status.is_terminal() {
            tx.commit().await.map_err(db_err)?;
            return Ok(SettleResult { appointment, payment, previous_status, changed: false });
        }

        payment.provider_status = outcome.payment_status();
        payment.settled_at = Some(now_ts);
        sqlx::query("UPDATE payments SET provider_status = $1, settled_at = $2 WHERE id = $3")
            .bind(payment.provider_status.as_str())
            .bind(now_ts)
            .bind(payment.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        match outcome {
            SettleOutcome::Paid => {
                if appointment.status == AppointmentStatus::Processing {
                    appointment.status = AppointmentStatus::Approved;
                    let online: Option<PgRow> = sqlx::query(
                        "SELECT 1 AS one FROM work_slots WHERE id = $1 AND examination_type = 'online'",
                    )
                    .bind(appointment.work_slot_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(db_err)?;
                    if online.is_some() && appointment.link_appointment.is_none() {
                        appointment.link_appointment = meeting_link;
                    }
                    sqlx::query("UPDATE appointments SET status = 'approved', link_appointment = $1 WHERE id = $2")
                        .bind(&appointment.link_appointment)
                        .bind(appointment.id)
                        .execute(&mut *tx)
                        .await
                        .map_err(db_err)?;
                }
            }
            SettleOutcome::Cancelled | SettleOutcome::Expired => {
                if appointment.status == AppointmentStatus::Processing {
                    appointment.status = AppointmentStatus::Rejected;
                    sqlx::query("UPDATE appointments SET status = 'rejected' WHERE id = $1")
                        .bind(appointment.id)
                        .execute(&mut *tx)
                        .await
                        .map_err(db_err)?;
                    sqlx::query("UPDATE work_slots SET ordered = FALSE WHERE id = $1")
                        .bind(appointment.work_slot_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(db_err)?;
                }
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(SettleResult { appointment, payment, previous_status, changed: true })
    }

    async fn cancel_appointment(&self, appointment_id: i64, policy: CancelPolicy) -> Result<CancelResult> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        let appointment_row = sqlx::query("SELECT * FROM appointments WHERE id = $1 FOR UPDATE")
            .bind(appointment_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| TeledermError::NotFound(format!("appointment {}", appointment_id)))?;
        let mut appointment = map_appointment(&appointment_row)?;

        match appointment.status {
            AppointmentStatus::Completed => return Err(TeledermError::AlreadyFinished),
            AppointmentStatus::Rejected => {
                tx.commit().await.map_err(db_err)?;
                return Ok(CancelResult { appointment, refund_requested: false, changed: false });
            }
            _ => {}
        }

        let slot_row = sqlx::query("SELECT * FROM work_slots WHERE id = $1 FOR UPDATE")
            .bind(appointment.work_slot_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        let slot = map_slot(&slot_row)?;

        if let Some(min_lead) = policy.min_lead_secs {
            let start_ts = utils::slot_start_ts(slot.date, slot.start_time);
            if start_ts - policy.now_ts < min_lead {
                return Err(TeledermError::CancellationWindowClosed);
            }
        }

        appointment.status = AppointmentStatus::Rejected;
        sqlx::query("UPDATE appointments SET status = 'rejected' WHERE id = $1")
            .bind(appointment.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("UPDATE work_slots SET ordered = FALSE WHERE id = $1")
            .bind(slot.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let refund_row = sqlx::query(
            "SELECT 1 AS one FROM payments WHERE appointment_id = $1 AND provider_status = 'paid' LIMIT 1",
        )
        .bind(appointment.id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query(
            "UPDATE payments SET provider_status = 'cancelled' WHERE appointment_id = $1 AND provider_status = 'pending'",
        )
        .bind(appointment.id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(CancelResult { appointment, refund_requested: refund_row.is_some(), changed: true })
    }

    async fn pending_payments_expiring_before(&self, ts: i64) -> Result<Vec<Payment>> {
        let rows = sqlx::query("SELECT * FROM payments WHERE provider_status = 'pending' AND expires_at <= $1")
            .bind(ts)
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_err)?;
        rows.iter().map(map_payment).collect()
    }

    async fn insert_medical_record(&self, record: NewMedicalRecord) -> Result<(MedicalRecord, Appointment)> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        let appointment_row = sqlx::query("SELECT * FROM appointments WHERE id = $1 FOR UPDATE")
            .bind(record.appointment_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| TeledermError::NotFound(format!("appointment {}", record.appointment_id)))?;
        let mut appointment = map_appointment(&appointment_row)?;

        let existing = sqlx::query("SELECT 1 AS one FROM medical_records WHERE appointment_id = $1")
            .bind(record.appointment_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if existing.is_some() {
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

        let now = utils::now_ts();
        let medications = serde_json::to_string(&record.medications)?;
        let row = sqlx::query(r#"
            INSERT INTO medical_records
                (appointment_id, doctor_create_id, patient_id, diagnosis, treatment_plan,
                 medications, follow_up, additional_notes, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            RETURNING *
        "#)
        .bind(record.appointment_id)
        .bind(record.doctor_create_id)
        .bind(appointment.patient_id)
        .bind(&record.diagnosis)
        .bind(&record.treatment_plan)
        .bind(&medications)
        .bind(&record.follow_up)
        .bind(&record.additional_notes)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        appointment.status = AppointmentStatus::Completed;
        sqlx::query("UPDATE appointments SET status = 'completed' WHERE id = $1")
            .bind(appointment.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok((map_record(&row)?, appointment))
    }

    async fn update_medical_record(
        &self,
        record_id: i64,
        author_doctor_id: Uuid,
        patch: MedicalRecordPatch,
    ) -> Result<MedicalRecord> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM medical_records WHERE id = $1 FOR UPDATE")
            .bind(record_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| TeledermError::NotFound(format!("medical record {}", record_id)))?;
        let mut record = map_record(&row)?;
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

        let medications = serde_json::to_string(&record.medications)?;
        sqlx::query(r#"
            UPDATE medical_records
            SET diagnosis = $1, treatment_plan = $2, medications = $3,
                follow_up = $4, additional_notes = $5, updated_at = $6
            WHERE id = $7
        "#)
        .bind(&record.diagnosis)
        .bind(&record.treatment_plan)
        .bind(&medications)
        .bind(&record.follow_up)
        .bind(&record.additional_notes)
        .bind(record.updated_at)
        .bind(record.id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(record)
    }

    async fn get_medical_record_by_appointment(&self, appointment_id: i64) -> Result<Option<MedicalRecord>> {
        let row = sqlx::query("SELECT * FROM medical_records WHERE appointment_id = $1")
            .bind(appointment_id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)?;
        row.map(|r| map_record(&r)).transpose()
    }

    async fn list_appointments(&self, filter: AppointmentFilter) -> Result<AppointmentPage> {
        let where_clause = r#"
            WHERE ($1::text IS NULL OR a.status = $1)
              AND ($2::date IS NULL OR s.date >= $2)
              AND ($3::date IS NULL OR s.date <= $3)
              AND ($4::text IS NULL OR s.examination_type = $4)
              AND ($5::uuid IS NULL OR a.doctor_id = $5)
              AND ($6::uuid IS NULL OR a.patient_id = $6)
              AND ($7::text IS NULL OR d.name ILIKE '%' || $7 || '%')
              AND ($8::text IS NULL OR p.name ILIKE '%' || $8 || '%')
        "#;

        let page = filter.page.max(1);
        let page_size = filter.page_size.max(1);
        let status = filter.status.map(|s| s.as_str());
        let examination_type = filter.examination_type.map(|t| t.as_str());

        let count_sql = format!(
            r#"SELECT COUNT(*) AS total
               FROM appointments a
               JOIN work_slots s ON s.id = a.work_slot_id
               JOIN doctors d ON d.id = a.doctor_id
               JOIN patients p ON p.id = a.patient_id
               {}"#,
            where_clause
        );
        let count_row = sqlx::query(&count_sql)
        .bind(status)
        .bind(filter.from_date)
        .bind(filter.to_date)
        .bind(examination_type)
        .bind(filter.doctor_id)
        .bind(filter.patient_id)
        .bind(&filter.doctor_name)
        .bind(&filter.patient_name)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)?;
        let total: i64 = count_row.try_get("total").map_err(db_err)?;

        let page_sql = format!("{} {} ORDER BY a.id DESC LIMIT $9 OFFSET $10", VIEW_SELECT, where_clause);
        let rows = sqlx::query(&page_sql)
        .bind(status)
        .bind(filter.from_date)
        .bind(filter.to_date)
        .bind(examination_type)
        .bind(filter.doctor_id)
        .bind(filter.patient_id)
        .bind(&filter.doctor_name)
        .bind(&filter.patient_name)
        .bind(page_size as i64)
        .bind(((page - 1) * page_size) as i64)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?;

        let items = rows.iter().map(map_view).collect::<Result<Vec<_>>>()?;
        Ok(AppointmentPage { items, total: total as u64, page, page_size })
    }

    async fn appointment_views_in_range(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AppointmentView>> {
        let sql = format!("{} WHERE s.date BETWEEN $1 AND $2 ORDER BY a.id", VIEW_SELECT);
        let rows = sqlx::query(&sql)
        .bind(from)
        .bind(to)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?;
        rows.iter().map(map_view).collect()
    }

    async fn paid_payments_in_range(&self, from_ts: i64, to_ts: i64) -> Result<Vec<Payment>> {
        let rows = sqlx::query(r#"
            SELECT * FROM payments
            WHERE provider_status = 'paid' AND settled_at >= $1 AND settled_at < $2
        "#)
        .bind(from_ts)
        .bind(to_ts)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?;
        rows.iter().map(map_payment).collect()
    }
}
