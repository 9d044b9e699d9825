//! 统计投影
//!
//! 聚合对象是预约联查视图（按号源日期归入区间）与已支付支付单
//! （按结算时间归月）。营收口径：已确认或已完成预约的冻结费用
//! 之和；实收口径：结算成功的支付单金额之和。医生营收与患者
//! 消费接受任意日期区间，月度总览仍按自然月取数。

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use telederm_core::{utils, AppointmentStatus, Result, TeledermError};
use telederm_database::{AppointmentView, CoreStore};
use uuid::Uuid;

/// 某个月的预约统计
#[derive(Debug, Clone, Serialize)]
pub struct MonthlyStatistics {
    pub year: i32,
    pub month: u32,
    pub total_appointments: u64,
    /// 按预约状态计数
    pub by_status: BTreeMap<String, u64>,
    /// 按问诊类型计数（只计已确认与已完成）
    pub consultations_by_type: BTreeMap<String, u64>,
    /// 已确认与已完成预约的冻结费用之和
    pub booked_revenue: i64,
    /// 当月结算成功的支付单金额之和
    pub collected_revenue: i64,
}

/// 医生在统计区间内的营收
#[derive(Debug, Clone, Serialize)]
pub struct DoctorRevenue {
    pub doctor_id: Uuid,
    pub doctor_name: String,
    pub appointments: u64,
    /// 按问诊类型细分的接诊次数
    pub consultations_by_type: BTreeMap<String, u64>,
    pub revenue: i64,
}

/// 患者在统计区间内的消费
#[derive(Debug, Clone, Serialize)]
pub struct PatientSpending {
    pub patient_id: Uuid,
    pub patient_name: String,
    pub appointments: u64,
    pub spent: i64,
}

/// 统计服务
pub struct StatisticsService {
    store: Arc<dyn CoreStore>,
}

/// 营收口径：已确认或已完成
fn counts_as_revenue(status: AppointmentStatus) -> bool {
    matches!(status, AppointmentStatus::Approved | AppointmentStatus::Completed)
}

/// 某月的号源日期区间（闭区间）
pub fn month_range(year: i32, month: u32) -> Result<(NaiveDate, NaiveDate)> {
    let from = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| TeledermError::Validation(format!("invalid month {}-{}", year, month)))?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    let to = next
        .and_then(|d| d.pred_opt())
        .ok_or_else(|| TeledermError::Validation(format!("invalid month {}-{}", year, month)))?;
    Ok((from, to))
}

impl StatisticsService {
    pub fn new(store: Arc<dyn CoreStore>) -> Self {
        Self { store }
    }

    /// 月度总览
    pub async fn monthly(&self, year: i32, month: u32) -> Result<MonthlyStatistics> {
        let (from, to) = month_range(year, month)?;
        let views = self.store.appointment_views_in_range(from, to).await?;

        let mut by_status: BTreeMap<String, u64> = BTreeMap::new();
        let mut consultations_by_type: BTreeMap<String, u64> = BTreeMap::new();
        let mut booked_revenue = 0i64;
        for view in &views {
            *by_status.entry(view.appointment.status.as_str().to_string()).or_default() += 1;
            if counts_as_revenue(view.appointment.status) {
                *consultations_by_type
                    .entry(view.examination_type.as_str().to_string())
                    .or_default() += 1;
                booked_revenue += view.appointment.total_amount;
            }
        }

        // 实收按结算时间归月（本地日历）
        let from_ts = utils::slot_start_ts(from, chrono::NaiveTime::MIN);
        let to_ts = to
            .succ_opt()
            .map(|d| utils::slot_start_ts(d, chrono::NaiveTime::MIN))
            .unwrap_or(i64::MAX);
        let collected_revenue = self
            .store
            .paid_payments_in_range(from_ts, to_ts)
            .await?
            .iter()
            .map(|p| p.amount)
            .sum();

        Ok(MonthlyStatistics {
            year,
            month,
            total_appointments: views.len() as u64,
            by_status,
            consultations_by_type,
            booked_revenue,
            collected_revenue,
        })
    }

    /// 按医生聚合的日期区间营收，营收降序
    pub async fn revenue_by_doctor(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<DoctorRevenue>> {
        let views = self.store.appointment_views_in_range(from, to).await?;

        let mut by_doctor: BTreeMap<Uuid, DoctorRevenue> = BTreeMap::new();
        for view in views {
            if !counts_as_revenue(view.appointment.status) {
                continue;
            }
            let entry = by_doctor.entry(view.appointment.doctor_id).or_insert_with(|| DoctorRevenue {
                doctor_id: view.appointment.doctor_id,
                doctor_name: view.doctor_name.clone(),
                appointments: 0,
                consultations_by_type: BTreeMap::new(),
                revenue: 0,
            });
            entry.appointments += 1;
            *entry
                .consultations_by_type
                .entry(view.examination_type.as_str().to_string())
                .or_default() += 1;
            entry.revenue += view.appointment.total_amount;
        }

        let mut rows: Vec<DoctorRevenue> = by_doctor.into_values().collect();
        rows.sort_by(|a, b| b.revenue.cmp(&a.revenue));
        Ok(rows)
    }

    /// 按患者聚合的日期区间消费，消费降序
    pub async fn spending_by_patient(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<PatientSpending>> {
        let views = self.store.appointment_views_in_range(from, to).await?;

        let mut by_patient: BTreeMap<Uuid, PatientSpending> = BTreeMap::new();
        for view in views {
            if !counts_as_revenue(view.appointment.status) {
                continue;
            }
            let entry = by_patient.entry(view.appointment.patient_id).or_insert_with(|| PatientSpending {
                patient_id: view.appointment.patient_id,
                patient_name: view.patient_name.clone(),
                appointments: 0,
                spent: 0,
            });
            entry.appointments += 1;
            entry.spent += view.appointment.total_amount;
        }

        let mut rows: Vec<PatientSpending> = by_patient.into_values().collect();
        rows.sort_by(|a, b| b.spent.cmp(&a.spent));
        Ok(rows)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::NaiveTime;
    use telederm_core::{Doctor, ExaminationType, Patient, ServiceScope, VerifyStatus};
    use telederm_database::{CancelPolicy, ClaimRequest, MemoryStore, NewWorkSlot};

    pub(crate) struct Seeded {
        pub store: Arc<MemoryStore>,
        pub doctor_a: Uuid,
        pub doctor_b: Uuid,
        pub patient_a: Uuid,
        pub patient_b: Uuid,
        pub appointment_a: i64,
    }

    fn t(h: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, 0, 0).unwrap()
    }

    async fn seed_doctor(store: &MemoryStore, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        store
            .upsert_doctor(Doctor {
                id,
                name: name.into(),
                verify_status: VerifyStatus::Admitted,
                service_scope: ServiceScope::Both,
                deleted: false,
                created_at: 0,
            })
            .await
            .unwrap();
        id
    }

    async fn book(
        store: &MemoryStore,
        doctor_id: Uuid,
        patient_id: Uuid,
        date: NaiveDate,
        hour: u32,
        fee: i64,
    ) -> i64 {
        let slot_ids = store
            .insert_slots(vec![NewWorkSlot {
                doctor_id,
                date,
                start_time: t(hour),
                end_time: t(hour + 1),
                examination_type: ExaminationType::Online,
                fee,
            }])
            .await
            .unwrap();
        store
            .claim_slot_and_insert(ClaimRequest {
                patient_id,
                doctor_id,
                work_slot_id: slot_ids[0],
                name: "consult".into(),
                status: AppointmentStatus::Approved,
                pre_examination_notes: None,
                link_appointment: None,
                enforce_serial: false,
            })
            .await
            .unwrap()
            .id
    }

    /// 2030年6月：doctor_a接两单（300+500），doctor_b接一单（200，
    /// 随后被取消），患者a/b各有消费
    pub(crate) async fn seed_two_doctors() -> Seeded {
        let store = Arc::new(MemoryStore::new());
        let doctor_a = seed_doctor(&store, "Dr. Lan").await;
        let doctor_b = seed_doctor(&store, "Dr. Chi").await;
        let patient_a = Uuid::new_v4();
        let patient_b = Uuid::new_v4();
        store
            .upsert_patient(Patient { id: patient_a, name: "Minh".into(), created_at: 0 })
            .await
            .unwrap();
        store
            .upsert_patient(Patient { id: patient_b, name: "Anh".into(), created_at: 0 })
            .await
            .unwrap();

        let june = NaiveDate::from_ymd_opt(2030, 6, 10).unwrap();
        let appointment_a = book(&store, doctor_a, patient_a, june, 9, 300).await;
        book(&store, doctor_a, patient_b, june, 10, 500).await;
        let cancelled = book(&store, doctor_b, patient_a, june, 11, 200).await;
        store
            .cancel_appointment(cancelled, CancelPolicy { min_lead_secs: None, now_ts: 0 })
            .await
            .unwrap();

        Seeded { store, doctor_a, doctor_b, patient_a, patient_b, appointment_a }
    }

    #[tokio::test]
    async fn test_monthly_counts_and_revenue() {
        let seeded = seed_two_doctors().await;
        let stats = StatisticsService::new(seeded.store.clone());

        let monthly = stats.monthly(2030, 6).await.unwrap();
        assert_eq!(monthly.total_appointments, 3);
        assert_eq!(monthly.by_status.get("approved"), Some(&2));
        assert_eq!(monthly.by_status.get("rejected"), Some(&1));
        // 被取消的预约不进营收
        assert_eq!(monthly.booked_revenue, 800);
        assert_eq!(monthly.consultations_by_type.get("online"), Some(&2));

        // 相邻月份为空
        let july = stats.monthly(2030, 7).await.unwrap();
        assert_eq!(july.total_appointments, 0);
        assert_eq!(july.booked_revenue, 0);
    }

    #[tokio::test]
    async fn test_revenue_by_doctor_sorted() {
        let seeded = seed_two_doctors().await;
        let stats = StatisticsService::new(seeded.store.clone());

        let (from, to) = month_range(2030, 6).unwrap();
        let rows = stats.revenue_by_doctor(from, to).await.unwrap();
        assert_eq!(rows.len(), 1, "cancelled-only doctors drop out");
        assert_eq!(rows[0].doctor_id, seeded.doctor_a);
        assert_eq!(rows[0].revenue, 800);
        assert_eq!(rows[0].appointments, 2);
        assert_eq!(rows[0].consultations_by_type.get("online"), Some(&2));
    }

    #[tokio::test]
    async fn test_spending_by_patient() {
        let seeded = seed_two_doctors().await;
        let stats = StatisticsService::new(seeded.store.clone());

        let (from, to) = month_range(2030, 6).unwrap();
        let rows = stats.spending_by_patient(from, to).await.unwrap();
        assert_eq!(rows.len(), 2);
        // 消费降序：patient_b 500 在前
        assert_eq!(rows[0].patient_id, seeded.patient_b);
        assert_eq!(rows[0].spent, 500);
        assert_eq!(rows[1].patient_id, seeded.patient_a);
        assert_eq!(rows[1].spent, 300);
    }

    #[tokio::test]
    async fn test_aggregations_respect_date_range() {
        let seeded = seed_two_doctors().await;
        let stats = StatisticsService::new(seeded.store.clone());

        // 所有预约都落在6月10日：之前的区间为空
        let before = NaiveDate::from_ymd_opt(2030, 6, 1).unwrap();
        let cutoff = NaiveDate::from_ymd_opt(2030, 6, 9).unwrap();
        assert!(stats.revenue_by_doctor(before, cutoff).await.unwrap().is_empty());
        assert!(stats.spending_by_patient(before, cutoff).await.unwrap().is_empty());

        // 单日区间（闭区间）拿到全部
        let day = NaiveDate::from_ymd_opt(2030, 6, 10).unwrap();
        let rows = stats.revenue_by_doctor(day, day).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].revenue, 800);
        let rows = stats.spending_by_patient(day, day).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_month_rejected() {
        let seeded = seed_two_doctors().await;
        let stats = StatisticsService::new(seeded.store.clone());

        let err = stats.monthly(2030, 13).await.unwrap_err();
        assert!(matches!(err, TeledermError::Validation(_)));
    }

    #[test]
    fn test_month_range_boundaries() {
        let (from, to) = month_range(2030, 6).unwrap();
        assert_eq!(from, NaiveDate::from_ymd_opt(2030, 6, 1).unwrap());
        assert_eq!(to, NaiveDate::from_ymd_opt(2030, 6, 30).unwrap());

        let (from, to) = month_range(2030, 12).unwrap();
        assert_eq!(from, NaiveDate::from_ymd_opt(2030, 12, 1).unwrap());
        assert_eq!(to, NaiveDate::from_ymd_opt(2030, 12, 31).unwrap());
    }
}
