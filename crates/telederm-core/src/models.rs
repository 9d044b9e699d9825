//! 核心数据模型定义

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 用户角色
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// 管理员 - 完全访问权限
    Admin,
    /// 医生 - 排班、病历与本人预约
    Doctor,
    /// 患者 - 预约与本人记录
    Patient,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Doctor => "doctor",
            Self::Patient => "patient",
        }
    }
}

/// 医生认证状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum VerifyStatus {
    /// 未认证
    Unverified,
    /// 初审通过
    FirstPass,
    /// 准入（可开设线下号源）
    Admitted,
    /// 已驳回
    Rejected,
}

impl VerifyStatus {
    /// 数据库存储使用的数值编码
    pub fn as_i16(&self) -> i16 {
        match self {
            Self::Unverified => 0,
            Self::FirstPass => 1,
            Self::Admitted => 2,
            Self::Rejected => 3,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(Self::Unverified),
            1 => Some(Self::FirstPass),
            2 => Some(Self::Admitted),
            3 => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// 医生出诊范围
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceScope {
    Online,
    Offline,
    Both,
}

impl ServiceScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Both => "both",
        }
    }

    /// 是否允许开设指定类型的号源
    pub fn allows(&self, examination_type: ExaminationType) -> bool {
        match (self, examination_type) {
            (Self::Both, _) => true,
            (Self::Online, ExaminationType::Online) => true,
            (Self::Offline, ExaminationType::Offline) => true,
            _ => false,
        }
    }
}

impl TryFrom<&str> for ServiceScope {
    type Error = String;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        match value {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "both" => Ok(Self::Both),
            _ => Err(format!("unknown service scope: {}", value)),
        }
    }
}

/// 问诊方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExaminationType {
    Online,
    Offline,
}

impl ExaminationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

impl TryFrom<&str> for ExaminationType {
    type Error = String;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        match value {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            _ => Err(format!("unknown examination type: {}", value)),
        }
    }
}

/// 医生信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Doctor {
    pub id: Uuid,
    pub name: String,
    pub verify_status: VerifyStatus,
    pub service_scope: ServiceScope,
    pub deleted: bool,
    pub created_at: i64,
}

/// 患者档案（核心只保留列表联查所需的最小轮廓）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub id: Uuid,
    pub name: String,
    pub created_at: i64,
}

/// 医生价格表
///
/// 价格以最小货币单位的整数计。每次调价插入新行，最新的生效行获胜；
/// 号源费用在创建时计算并冻结，调价不回溯。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTable {
    pub id: i64,
    pub doctor_id: Uuid,
    pub offline_price: i64,
    pub online_price: i64,
    pub ot_multiplier: f64,
    pub is_active: bool,
    pub created_at: i64,
}

impl PriceTable {
    pub fn base_price(&self, examination_type: ExaminationType) -> i64 {
        match examination_type {
            ExaminationType::Online => self.online_price,
            ExaminationType::Offline => self.offline_price,
        }
    }
}

/// 号源（医生工作时段）
///
/// 同一医生同一天的时段不重叠；`fee` 在插入时按当时生效价格表冻结。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkSlot {
    pub id: i64,
    pub doctor_id: Uuid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub examination_type: ExaminationType,
    pub ordered: bool,
    pub fee: i64,
    pub created_at: i64,
}

/// 预约状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    /// 待医生确认（保留状态，核心预约路径不产生）
    Pending,
    /// 待支付
    Processing,
    /// 已确认
    Approved,
    /// 已取消/已拒绝
    Rejected,
    /// 已完成（病历已写入）
    Completed,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Completed)
    }

    /// 是否占用号源（串行预约规则也按此集合判定）
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing | Self::Approved | Self::Completed)
    }

    /// 是否计入患者"进行中"预约
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing | Self::Approved)
    }
}

impl TryFrom<&str> for AppointmentStatus {
    type Error = String;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        match value {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("unknown appointment status: {}", value)),
        }
    }
}

/// 预约
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    /// 对客户可见的预约号，从 1_000_000 起
    pub id: i64,
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub work_slot_id: i64,
    pub name: String,
    pub status: AppointmentStatus,
    pub pre_examination_notes: Option<String>,
    /// 创建时按号源冻结费用计，不再变更
    pub total_amount: i64,
    /// 线上问诊的会议链接，确认后生成
    pub link_appointment: Option<String>,
    pub created_at: i64,
}

/// 支付状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Cancelled,
    Expired,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl TryFrom<&str> for PaymentStatus {
    type Error = String;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        match value {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("unknown payment status: {}", value)),
        }
    }
}

/// 支付单
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    pub appointment_id: i64,
    pub amount: i64,
    /// 支付网关侧的订单号
    pub provider_order_code: String,
    pub provider_status: PaymentStatus,
    pub payment_url: Option<String>,
    pub expires_at: i64,
    pub settled_at: Option<i64>,
    pub created_at: i64,
}

/// 病历内容条目
///
/// 自由格式内容收敛为封闭的带判别字段的变体集合，边界处校验后以
/// 结构化JSON存储。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordContent {
    Text { body: String },
    Image { url: String, caption: Option<String> },
    Media { url: String, mime_type: String },
}

/// 病历
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MedicalRecord {
    pub id: i64,
    /// 每个预约至多一份病历
    pub appointment_id: i64,
    pub doctor_create_id: Uuid,
    pub patient_id: Uuid,
    pub diagnosis: String,
    pub treatment_plan: String,
    pub medications: Vec<RecordContent>,
    pub follow_up: Option<String>,
    pub additional_notes: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// 病历更新补丁
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MedicalRecordPatch {
    pub diagnosis: Option<String>,
    pub treatment_plan: Option<String>,
    pub medications: Option<Vec<RecordContent>>,
    pub follow_up: Option<String>,
    pub additional_notes: Option<String>,
}
