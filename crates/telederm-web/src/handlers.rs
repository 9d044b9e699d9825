//! HTTP处理器
//!
//! 处理器只做身份提取、请求体整形和服务调用；业务规则全部在
//! workflow/reporting层。错误统一走 `ApiError` 映射。

use crate::error::{ApiError, ApiResult};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use telederm_core::{
    utils, AppointmentStatus, Doctor, ExaminationType, MedicalRecordPatch, Patient, ServiceScope,
    TeledermError, VerifyStatus,
};
use telederm_database::{AppointmentFilter, CoreStore};
use telederm_reporting::{ListingService, StatisticsService};
use telederm_workflow::{
    BookingRequest, BookingService, Caller, CancellationService, DayWindows, MedicalRecordService,
    RecordRequest, SettlementService, SlotService,
};
use tracing::info;
use uuid::Uuid;

/// 路由共享状态
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CoreStore>,
    pub slots: Arc<SlotService>,
    pub booking: Arc<BookingService>,
    pub cancellation: Arc<CancellationService>,
    pub settlement: Arc<SettlementService>,
    pub records: Arc<MedicalRecordService>,
    pub listing: Arc<ListingService>,
    pub statistics: Arc<StatisticsService>,
}

/// 健康检查
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": utils::now_ts(),
    }))
}

// ========== 预约 ==========

#[derive(Debug, Deserialize)]
pub struct BookBody {
    /// 管理员可代填；患者必须留空或填本人
    pub patient_id: Option<Uuid>,
    pub name: String,
    pub doctor_id: Uuid,
    pub work_schedule_id: i64,
    pub pre_examination_notes: Option<String>,
    pub is_payment: bool,
    pub return_url: Option<String>,
    #[serde(default)]
    pub admin_override: bool,
}

pub async fn book_appointment(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<BookBody>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state
        .booking
        .create(
            caller,
            BookingRequest {
                patient_id: body.patient_id.unwrap_or(caller.user_id),
                doctor_id: body.doctor_id,
                work_slot_id: body.work_schedule_id,
                name: body.name,
                pre_examination_notes: body.pre_examination_notes,
                is_payment: body.is_payment,
                return_url: body.return_url,
                admin_override: body.admin_override,
            },
        )
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<AppointmentStatus>,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    pub examination_type: Option<ExaminationType>,
    pub doctor_id: Option<Uuid>,
    pub patient_id: Option<Uuid>,
    pub doctor_name: Option<String>,
    pub patient_name: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

pub async fn list_appointments(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let filter = AppointmentFilter {
        status: query.status,
        from_date: query.from_date,
        to_date: query.to_date,
        examination_type: query.examination_type,
        doctor_id: query.doctor_id,
        patient_id: query.patient_id,
        doctor_name: query.doctor_name,
        patient_name: query.patient_name,
        page: query.page.unwrap_or(1),
        page_size: query.page_size.unwrap_or(50),
    };
    let page = state.listing.list(caller, filter).await?;
    Ok(Json(page))
}

pub async fn get_appointment(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(appointment_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let view = state.listing.get(caller, appointment_id).await?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    pub appointment_id: i64,
}

pub async fn cancel_appointment(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<CancelBody>,
) -> ApiResult<impl IntoResponse> {
    let result = state.cancellation.cancel(caller, body.appointment_id).await?;
    Ok(Json(json!({
        "appointment": result.appointment,
        "refund_requested": result.refund_requested,
    })))
}

#[derive(Debug, Deserialize)]
pub struct RetryPaymentBody {
    pub return_url: String,
}

pub async fn retry_payment_link(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(appointment_id): Path<i64>,
    Json(body): Json<RetryPaymentBody>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state
        .booking
        .retry_payment_link(caller, appointment_id, &body.return_url)
        .await?;
    Ok(Json(outcome))
}

// ========== 支付回调（网关侧，免认证） ==========

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    /// 网关侧订单号
    pub id: String,
    /// 网关侧状态码
    pub code: String,
}

pub async fn payment_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> ApiResult<impl IntoResponse> {
    info!("Payment callback for order {} (code={})", query.id, query.code);
    let result = state.settlement.settle_callback(&query.id, &query.code).await?;
    Ok(Json(json!({
        "appointment_id": result.appointment.id,
        "status": result.appointment.status,
        "changed": result.changed,
    })))
}

// ========== 病历 ==========

pub async fn create_medical_record(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<RecordRequest>,
) -> ApiResult<impl IntoResponse> {
    let (record, appointment) = state.records.create(caller, body).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "medical_record": record, "appointment": appointment })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct UpdateRecordBody {
    pub medical_record_id: i64,
    #[serde(flatten)]
    pub patch: MedicalRecordPatch,
}

pub async fn update_medical_record(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<UpdateRecordBody>,
) -> ApiResult<impl IntoResponse> {
    let record = state
        .records
        .update(caller, body.medical_record_id, body.patch)
        .await?;
    Ok(Json(record))
}

pub async fn get_medical_record(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(appointment_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let record = state.records.read(caller, appointment_id).await?;
    Ok(Json(record))
}

// ========== 排班 ==========

#[derive(Debug, Deserialize)]
pub struct WorkingTimeBody {
    /// 管理员可代填；医生必须留空或填本人
    pub doctor_id: Option<Uuid>,
    pub days: Vec<DayWindows>,
}

pub async fn create_working_time(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<WorkingTimeBody>,
) -> ApiResult<impl IntoResponse> {
    let doctor_id = match caller.role {
        telederm_core::Role::Doctor => {
            if body.doctor_id.is_some_and(|id| id != caller.user_id) {
                return Err(TeledermError::Forbidden(
                    "doctors may only publish their own working time".into(),
                )
                .into());
            }
            caller.user_id
        }
        telederm_core::Role::Admin => body.doctor_id.ok_or_else(|| {
            ApiError(TeledermError::Validation("doctor_id is required".into()))
        })?,
        telederm_core::Role::Patient => {
            return Err(TeledermError::Forbidden("patients cannot publish working time".into()).into());
        }
    };
    let slot_ids = state.slots.create_slots(doctor_id, body.days).await?;
    Ok((StatusCode::CREATED, Json(json!({ "slot_ids": slot_ids }))))
}

#[derive(Debug, Deserialize)]
pub struct SlotQuery {
    pub doctor_id: Uuid,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub examination_type: Option<ExaminationType>,
}

pub async fn list_working_time(
    State(state): State<AppState>,
    Query(query): Query<SlotQuery>,
) -> ApiResult<impl IntoResponse> {
    let slots = state
        .slots
        .list(query.doctor_id, query.from, query.to, query.examination_type)
        .await?;
    Ok(Json(slots))
}

pub async fn list_empty_working_hours(
    State(state): State<AppState>,
    Query(query): Query<SlotQuery>,
) -> ApiResult<impl IntoResponse> {
    let slots = state
        .slots
        .find_free(query.doctor_id, query.from, query.to, query.examination_type)
        .await?;
    Ok(Json(slots))
}

// ========== 统计（仅管理员） ==========

fn require_admin(caller: &Caller) -> ApiResult<()> {
    if caller.is_admin() {
        Ok(())
    } else {
        Err(TeledermError::Forbidden("admin access required".into()).into())
    }
}

#[derive(Debug, Deserialize)]
pub struct MonthQuery {
    pub year: i32,
    pub month: u32,
}

/// 日期区间查询：给 from/to 用区间，给 year/month 用自然月
#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub year: Option<i32>,
    pub month: Option<u32>,
}

fn resolve_range(query: &RangeQuery) -> ApiResult<(NaiveDate, NaiveDate)> {
    let (from, to) = match (query.from, query.to, query.year, query.month) {
        (Some(from), Some(to), _, _) => (from, to),
        (None, None, Some(year), Some(month)) => telederm_reporting::month_range(year, month)?,
        _ => {
            return Err(TeledermError::Validation(
                "provide either from/to or year/month".into(),
            )
            .into());
        }
    };
    if from > to {
        return Err(TeledermError::Validation("from must not be after to".into()).into());
    }
    Ok((from, to))
}

pub async fn monthly_statistics(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<MonthQuery>,
) -> ApiResult<impl IntoResponse> {
    require_admin(&caller)?;
    let stats = state.statistics.monthly(query.year, query.month).await?;
    Ok(Json(stats))
}

pub async fn doctor_revenue(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<impl IntoResponse> {
    require_admin(&caller)?;
    let (from, to) = resolve_range(&query)?;
    let rows = state.statistics.revenue_by_doctor(from, to).await?;
    Ok(Json(rows))
}

pub async fn patient_spending(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<impl IntoResponse> {
    require_admin(&caller)?;
    let (from, to) = resolve_range(&query)?;
    let rows = state.statistics.spending_by_patient(from, to).await?;
    Ok(Json(rows))
}

// ========== 档案管理（仅管理员；档案主数据来自外部用户组件） ==========

#[derive(Debug, Deserialize)]
pub struct DoctorBody {
    pub id: Uuid,
    pub name: String,
    pub service_scope: ServiceScope,
}

pub async fn upsert_doctor(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<DoctorBody>,
) -> ApiResult<impl IntoResponse> {
    require_admin(&caller)?;
    let existing = state.store.get_doctor(body.id).await?;
    let doctor = Doctor {
        id: body.id,
        name: body.name,
        // 已有认证状态在资料同步时保留
        verify_status: existing
            .as_ref()
            .map(|d| d.verify_status)
            .unwrap_or(VerifyStatus::Unverified),
        service_scope: body.service_scope,
        deleted: false,
        created_at: existing.map(|d| d.created_at).unwrap_or_else(utils::now_ts),
    };
    state.store.upsert_doctor(doctor.clone()).await?;
    Ok(Json(doctor))
}

#[derive(Debug, Deserialize)]
pub struct VerifyStatusBody {
    pub verify_status: i16,
}

pub async fn set_verify_status(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(doctor_id): Path<Uuid>,
    Json(body): Json<VerifyStatusBody>,
) -> ApiResult<impl IntoResponse> {
    require_admin(&caller)?;
    let status = VerifyStatus::from_i16(body.verify_status).ok_or_else(|| {
        ApiError(TeledermError::Validation(format!(
            "unknown verify status {}",
            body.verify_status
        )))
    })?;
    state.store.set_verify_status(doctor_id, status).await?;
    Ok(Json(json!({ "doctor_id": doctor_id, "verify_status": status })))
}

#[derive(Debug, Deserialize)]
pub struct PriceBody {
    pub offline_price: i64,
    pub online_price: i64,
    pub ot_multiplier: f64,
}

pub async fn set_price_table(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(doctor_id): Path<Uuid>,
    Json(body): Json<PriceBody>,
) -> ApiResult<impl IntoResponse> {
    require_admin(&caller)?;
    if body.offline_price < 0 || body.online_price < 0 || body.ot_multiplier <= 1.0 {
        return Err(TeledermError::Validation(
            "prices must be non-negative and ot_multiplier > 1".into(),
        )
        .into());
    }
    let table = state
        .store
        .insert_price_table(doctor_id, body.offline_price, body.online_price, body.ot_multiplier)
        .await?;
    Ok((StatusCode::CREATED, Json(table)))
}

#[derive(Debug, Deserialize)]
pub struct PatientBody {
    pub id: Uuid,
    pub name: String,
}

pub async fn upsert_patient(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<PatientBody>,
) -> ApiResult<impl IntoResponse> {
    require_admin(&caller)?;
    let patient = Patient { id: body.id, name: body.name, created_at: utils::now_ts() };
    state.store.upsert_patient(patient.clone()).await?;
    Ok(Json(patient))
}
