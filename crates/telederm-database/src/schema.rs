//! 数据库表结构
//!
//! 时间戳统一存UTC整数秒；号源时间存本地日期+时间（UTC+7解释）；
//! 预约号序列从 1_000_000 起（对客户可见的编号策略）。

use sqlx::PgPool;
use telederm_core::{Result, TeledermError};

/// 创建全部数据库表
pub async fn create_tables(pool: &PgPool) -> Result<()> {
    // 创建医生表
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS doctors (
            id UUID PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            verify_status SMALLINT NOT NULL DEFAULT 0,
            service_scope VARCHAR(10) NOT NULL DEFAULT 'both',
            deleted BOOLEAN NOT NULL DEFAULT FALSE,
            created_at BIGINT NOT NULL
        )
    "#).execute(pool).await.map_err(|e| TeledermError::Database(e.to_string()))?;

    // 创建患者表
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS patients (
            id UUID PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            created_at BIGINT NOT NULL
        )
    "#).execute(pool).await.map_err(|e| TeledermError::Database(e.to_string()))?;

    // 创建价格表（每次调价插入新行，最新生效行获胜）
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS price_tables (
            id BIGSERIAL PRIMARY KEY,
            doctor_id UUID NOT NULL REFERENCES doctors(id),
            offline_price BIGINT NOT NULL CHECK (offline_price >= 0),
            online_price BIGINT NOT NULL CHECK (online_price >= 0),
            ot_multiplier DOUBLE PRECISION NOT NULL CHECK (ot_multiplier > 1),
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at BIGINT NOT NULL
        )
    "#).execute(pool).await.map_err(|e| TeledermError::Database(e.to_string()))?;

    // 创建号源表
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS work_slots (
            id BIGSERIAL PRIMARY KEY,
            doctor_id UUID NOT NULL REFERENCES doctors(id),
            date DATE NOT NULL,
            start_time TIME NOT NULL,
            end_time TIME NOT NULL,
            examination_type VARCHAR(10) NOT NULL,
            ordered BOOLEAN NOT NULL DEFAULT FALSE,
            fee BIGINT NOT NULL,
            created_at BIGINT NOT NULL,
            UNIQUE (doctor_id, date, start_time)
        )
    "#).execute(pool).await.map_err(|e| TeledermError::Database(e.to_string()))?;

    // 预约号序列
    sqlx::query(r#"
        CREATE SEQUENCE IF NOT EXISTS appointment_id_seq START WITH 1000000
    "#).execute(pool).await.map_err(|e| TeledermError::Database(e.to_string()))?;

    // 创建预约表
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS appointments (
            id BIGINT PRIMARY KEY DEFAULT nextval('appointment_id_seq'),
            patient_id UUID NOT NULL REFERENCES patients(id),
            doctor_id UUID NOT NULL REFERENCES doctors(id),
            work_slot_id BIGINT NOT NULL REFERENCES work_slots(id),
            name VARCHAR(255) NOT NULL,
            status VARCHAR(20) NOT NULL,
            pre_examination_notes TEXT,
            total_amount BIGINT NOT NULL,
            link_appointment TEXT,
            created_at BIGINT NOT NULL
        )
    "#).execute(pool).await.map_err(|e| TeledermError::Database(e.to_string()))?;

    // 创建支付表
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS payments (
            id BIGSERIAL PRIMARY KEY,
            appointment_id BIGINT NOT NULL REFERENCES appointments(id),
            amount BIGINT NOT NULL,
            provider_order_code VARCHAR(64) UNIQUE NOT NULL,
            provider_status VARCHAR(10) NOT NULL DEFAULT 'pending',
            payment_url TEXT,
            expires_at BIGINT NOT NULL,
            settled_at BIGINT,
            created_at BIGINT NOT NULL
        )
    "#).execute(pool).await.map_err(|e| TeledermError::Database(e.to_string()))?;

    // 创建病历表（每预约至多一份）
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS medical_records (
            id BIGSERIAL PRIMARY KEY,
            appointment_id BIGINT UNIQUE NOT NULL REFERENCES appointments(id),
            doctor_create_id UUID NOT NULL REFERENCES doctors(id),
            patient_id UUID NOT NULL REFERENCES patients(id),
            diagnosis TEXT NOT NULL,
            treatment_plan TEXT NOT NULL,
            medications TEXT NOT NULL,
            follow_up TEXT,
            additional_notes TEXT,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        )
    "#).execute(pool).await.map_err(|e| TeledermError::Database(e.to_string()))?;

    // 创建索引以优化查询性能
    create_indexes(pool).await?;

    tracing::info!("Database tables created successfully");
    Ok(())
}

/// 创建数据库索引
async fn create_indexes(pool: &PgPool) -> Result<()> {
    let indexes = vec![
        "CREATE INDEX IF NOT EXISTS idx_price_tables_doctor_active ON price_tables(doctor_id, is_active)",
        "CREATE INDEX IF NOT EXISTS idx_work_slots_doctor_date ON work_slots(doctor_id, date)",
        "CREATE INDEX IF NOT EXISTS idx_work_slots_ordered ON work_slots(ordered)",
        "CREATE INDEX IF NOT EXISTS idx_appointments_patient_id ON appointments(patient_id)",
        "CREATE INDEX IF NOT EXISTS idx_appointments_doctor_id ON appointments(doctor_id)",
        "CREATE INDEX IF NOT EXISTS idx_appointments_status ON appointments(status)",
        "CREATE INDEX IF NOT EXISTS idx_payments_order_code ON payments(provider_order_code)",
        "CREATE INDEX IF NOT EXISTS idx_payments_status_expires ON payments(provider_status, expires_at)",
        "CREATE INDEX IF NOT EXISTS idx_medical_records_appointment ON medical_records(appointment_id)",
    ];

    for index_sql in indexes {
        sqlx::query(index_sql)
            .execute(pool)
            .await
            .map_err(|e| TeledermError::Database(e.to_string()))?;
    }

    tracing::info!("Database indexes created successfully");
    Ok(())
}
