//! 统一存储接口
//!
//! 预约核心的全部可写共享状态都在关系存储中；这里定义的trait把
//! 各协议的临界区收敛为单个原子操作（独占行锁或条件更新见证），
//! 业务策略留在workflow层。

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use telederm_core::{
    Appointment, AppointmentStatus, Doctor, ExaminationType, MedicalRecord, MedicalRecordPatch,
    Patient, Payment, PaymentStatus, PriceTable, RecordContent, Result, VerifyStatus, WorkSlot,
};
use uuid::Uuid;

/// 待插入的号源行（费用已由调用方冻结）
#[derive(Debug, Clone)]
pub struct NewWorkSlot {
    pub doctor_id: Uuid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub examination_type: ExaminationType,
    pub fee: i64,
}

/// 预约占用请求
///
/// 由workflow层在策略校验之后发起；存储实现必须在同一原子区内
/// 复核号源空闲与患者串行规则。
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub work_slot_id: i64,
    pub name: String,
    pub status: AppointmentStatus,
    pub pre_examination_notes: Option<String>,
    pub link_appointment: Option<String>,
    /// 患者串行预约规则开关
    pub enforce_serial: bool,
}

/// 待插入的支付单
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub appointment_id: i64,
    pub amount: i64,
    pub provider_order_code: String,
    pub payment_url: Option<String>,
    pub expires_at: i64,
}

/// 结算结论（由支付网关回调或过期清扫器给出）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettleOutcome {
    Paid,
    Cancelled,
    Expired,
}

impl SettleOutcome {
    pub fn payment_status(&self) -> PaymentStatus {
        match self {
            Self::Paid => PaymentStatus::Paid,
            Self::Cancelled => PaymentStatus::Cancelled,
            Self::Expired => PaymentStatus::Expired,
        }
    }
}

/// 结算结果
#[derive(Debug, Clone)]
pub struct SettleResult {
    pub appointment: Appointment,
    pub payment: Payment,
    /// 结算前的预约状态（协议异常时用于告警）
    pub previous_status: AppointmentStatus,
    /// 本次调用是否产生了状态变化（幂等去重的判定依据）
    pub changed: bool,
}

/// 取消策略
#[derive(Debug, Clone, Copy)]
pub struct CancelPolicy {
    /// 距号源开始的最小提前秒数；管理员取消时为None
    pub min_lead_secs: Option<i64>,
    pub now_ts: i64,
}

/// 取消结果
#[derive(Debug, Clone)]
pub struct CancelResult {
    pub appointment: Appointment,
    /// 已支付的支付单被取消时置位，触发refund.requested事件
    pub refund_requested: bool,
    pub changed: bool,
}

/// 待插入的病历
#[derive(Debug, Clone)]
pub struct NewMedicalRecord {
    pub appointment_id: i64,
    pub doctor_create_id: Uuid,
    pub diagnosis: String,
    pub treatment_plan: String,
    pub medications: Vec<RecordContent>,
    pub follow_up: Option<String>,
    pub additional_notes: Option<String>,
}

/// 预约列表过滤器
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppointmentFilter {
    pub status: Option<AppointmentStatus>,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    pub examination_type: Option<ExaminationType>,
    pub doctor_id: Option<Uuid>,
    pub patient_id: Option<Uuid>,
    pub doctor_name: Option<String>,
    pub patient_name: Option<String>,
    pub page: u32,
    pub page_size: u32,
}

impl Default for AppointmentFilter {
    fn default() -> Self {
        Self {
            status: None,
            from_date: None,
            to_date: None,
            examination_type: None,
            doctor_id: None,
            patient_id: None,
            doctor_name: None,
            patient_name: None,
            page: 1,
            page_size: 50,
        }
    }
}

/// 预约联查视图
///
/// 列表与统计用的只读投影：预约加上号源信息与双方称谓。
#[derive(Debug, Clone, Serialize)]
pub struct AppointmentView {
    #[serde(flatten)]
    pub appointment: Appointment,
    pub examination_type: ExaminationType,
    pub slot_date: NaiveDate,
    pub slot_start: NaiveTime,
    pub doctor_name: String,
    pub patient_name: String,
}

/// 预约列表页
#[derive(Debug, Clone, Serialize)]
pub struct AppointmentPage {
    pub items: Vec<AppointmentView>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

/// 统一存储接口
///
/// 所有实现必须保证：号源占用与预约插入原子；结算/取消/病历写入
/// 在预约行的独占临界区内执行且幂等语义符合注释约定。
#[async_trait]
pub trait CoreStore: Send + Sync {
    // ========== 医生与价格表 ==========

    async fn upsert_doctor(&self, doctor: Doctor) -> Result<()>;

    async fn get_doctor(&self, doctor_id: Uuid) -> Result<Option<Doctor>>;

    async fn upsert_patient(&self, patient: Patient) -> Result<()>;

    async fn get_patient(&self, patient_id: Uuid) -> Result<Option<Patient>>;

    /// 管理员推进医生认证状态
    async fn set_verify_status(&self, doctor_id: Uuid, status: VerifyStatus) -> Result<()>;

    /// 插入新的生效价格行；旧行失活，最新生效行获胜
    async fn insert_price_table(
        &self,
        doctor_id: Uuid,
        offline_price: i64,
        online_price: i64,
        ot_multiplier: f64,
    ) -> Result<PriceTable>;

    async fn active_price_table(&self, doctor_id: Uuid) -> Result<Option<PriceTable>>;

    // ========== 号源 ==========

    /// 批量插入号源；与既有号源重叠或 (doctor, date, start) 重复时整体失败
    async fn insert_slots(&self, slots: Vec<NewWorkSlot>) -> Result<Vec<i64>>;

    async fn get_slot(&self, slot_id: i64) -> Result<Option<WorkSlot>>;

    async fn list_slots(
        &self,
        doctor_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
        examination_type: Option<ExaminationType>,
        only_free: bool,
    ) -> Result<Vec<WorkSlot>>;

    // ========== 预约协议 ==========

    /// 预约创建的原子区：复核号源空闲、复核串行规则、分配预约号、
    /// 置 ordered = true、冻结 total_amount = slot.fee，一并提交
    async fn claim_slot_and_insert(&self, request: ClaimRequest) -> Result<Appointment>;

    async fn get_appointment(&self, appointment_id: i64) -> Result<Option<Appointment>>;

    /// 为已确认的线上预约补写会议链接（已有链接时保持不变）
    async fn set_meeting_link(&self, appointment_id: i64, link: String) -> Result<Appointment>;

    /// 支付会话创建成功后登记支付单（发生在预约提交之后，不持有任何锁）
    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment>;

    async fn get_payment_by_order_code(&self, order_code: &str) -> Result<Option<Payment>>;

    async fn get_payment_by_appointment(&self, appointment_id: i64) -> Result<Option<Payment>>;

    /// 补发新支付会话前作废已过期但仍pending的旧支付单，防止清扫器
    /// 拿旧单否决整个预约；已到终态的支付单原样返回
    async fn void_pending_payment(&self, order_code: &str, now_ts: i64) -> Result<Payment>;

    /// 结算协议的原子区；幂等：预约已终态时原样返回 changed = false。
    /// `meeting_link` 仅在 Processing → Approved 且号源为线上时落库。
    async fn settle(
        &self,
        order_code: &str,
        outcome: SettleOutcome,
        now_ts: i64,
        meeting_link: Option<String>,
    ) -> Result<SettleResult>;

    /// 取消协议的原子区：窗口校验、置 Rejected、释放号源
    async fn cancel_appointment(&self, appointment_id: i64, policy: CancelPolicy) -> Result<CancelResult>;

    /// 清扫器用：给定时间之前到期且仍pending的支付单
    async fn pending_payments_expiring_before(&self, ts: i64) -> Result<Vec<Payment>>;

    // ========== 病历 ==========

    /// 病历写入的原子区：预约必须Approved、作者必须是接诊医生、
    /// 每预约至多一份；成功时同一原子区内预约转Completed
    async fn insert_medical_record(&self, record: NewMedicalRecord) -> Result<(MedicalRecord, Appointment)>;

    /// 仅创建病历的医生可更新；不发生状态转换
    async fn update_medical_record(
        &self,
        record_id: i64,
        author_doctor_id: Uuid,
        patch: MedicalRecordPatch,
    ) -> Result<MedicalRecord>;

    async fn get_medical_record_by_appointment(&self, appointment_id: i64) -> Result<Option<MedicalRecord>>;

    // ========== 查询 ==========

    async fn list_appointments(&self, filter: AppointmentFilter) -> Result<AppointmentPage>;

    /// 统计投影用：按号源日期范围取预约联查视图（只读）
    async fn appointment_views_in_range(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AppointmentView>>;

    /// 统计投影用：按结算时间范围取已支付支付单（只读）
    async fn paid_payments_in_range(&self, from_ts: i64, to_ts: i64) -> Result<Vec<Payment>>;
}
