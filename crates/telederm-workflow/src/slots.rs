//! 号源注册服务
//!
//! 记录医生出诊时段并提供空闲查询。费用在插入时按医生当时生效的
//! 价格表计算并冻结在号源行上；占用/释放只发生在存储层的预约
//! 原子区内，这里不暴露。

use crate::policy::CorePolicy;
use chrono::{NaiveDate, NaiveTime};
use std::sync::Arc;
use telederm_core::{
    fee, utils, ExaminationType, Result, TeledermError, VerifyStatus, WorkSlot,
};
use telederm_database::{CoreStore, NewWorkSlot};
use tracing::info;
use uuid::Uuid;

/// 单个出诊时段
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SlotWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub examination_type: ExaminationType,
}

/// 某一天的出诊时段集合
#[derive(Debug, Clone, serde::Deserialize)]
pub struct DayWindows {
    pub date: NaiveDate,
    pub windows: Vec<SlotWindow>,
}

/// 号源注册服务
pub struct SlotService {
    store: Arc<dyn CoreStore>,
    policy: CorePolicy,
}

impl SlotService {
    pub fn new(store: Arc<dyn CoreStore>, policy: CorePolicy) -> Self {
        Self { store, policy }
    }

    /// 批量创建号源
    ///
    /// 校验：时段不短于策略下限；同日时段严格不重叠（半开区间）；
    /// 日期不在过去（策略可放开）；线下号源要求医生已准入。
    pub async fn create_slots(&self, doctor_id: Uuid, days: Vec<DayWindows>) -> Result<Vec<i64>> {
        let doctor = self
            .store
            .get_doctor(doctor_id)
            .await?
            .ok_or_else(|| TeledermError::NotFound(format!("doctor {}", doctor_id)))?;
        if doctor.deleted {
            return Err(TeledermError::NotFound(format!("doctor {}", doctor_id)));
        }

        let prices = self
            .store
            .active_price_table(doctor_id)
            .await?
            .ok_or_else(|| TeledermError::Validation("doctor has no active price table".into()))?;

        let today = utils::local_date_of(utils::now_ts());
        let min_duration = chrono::Duration::minutes(self.policy.min_slot_minutes);
        let mut new_slots = Vec::new();

        for day in &days {
            if day.date < today && !self.policy.allow_past_slots {
                return Err(TeledermError::Validation(format!("date {} is in the past", day.date)));
            }
            for (i, window) in day.windows.iter().enumerate() {
                if window.end <= window.start || window.end - window.start < min_duration {
                    return Err(TeledermError::Validation(format!(
                        "window {}-{} is shorter than {} minutes",
                        window.start, window.end, self.policy.min_slot_minutes
                    )));
                }
                if window.examination_type == ExaminationType::Offline
                    && doctor.verify_status != VerifyStatus::Admitted
                {
                    return Err(TeledermError::Forbidden(
                        "offline slots require an admitted doctor".into(),
                    ));
                }
                if !doctor.service_scope.allows(window.examination_type) {
                    return Err(TeledermError::Validation(format!(
                        "doctor does not serve {} examinations",
                        window.examination_type.as_str()
                    )));
                }
                // 同一批请求内的同日严格重叠判定（半开区间）
                for other in &day.windows[..i] {
                    if window.start < other.end && other.start < window.end {
                        return Err(TeledermError::Validation(format!(
                            "windows {}-{} and {}-{} overlap",
                            other.start, other.end, window.start, window.end
                        )));
                    }
                }

                new_slots.push(NewWorkSlot {
                    doctor_id,
                    date: day.date,
                    start_time: window.start,
                    end_time: window.end,
                    examination_type: window.examination_type,
                    // 费用按当前生效价格表冻结
                    fee: fee::fee(window.start, window.examination_type, &prices),
                });
            }
        }

        if new_slots.is_empty() {
            return Err(TeledermError::Validation("no slot windows given".into()));
        }

        let ids = self.store.insert_slots(new_slots).await?;
        info!("Doctor {} published {} work slots", doctor_id, ids.len());
        Ok(ids)
    }

    /// 查询空闲号源
    pub async fn find_free(
        &self,
        doctor_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
        examination_type: Option<ExaminationType>,
    ) -> Result<Vec<WorkSlot>> {
        self.store.list_slots(doctor_id, from, to, examination_type, true).await
    }

    /// 查询全部号源（含已占用）
    pub async fn list(
        &self,
        doctor_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
        examination_type: Option<ExaminationType>,
    ) -> Result<Vec<WorkSlot>> {
        self.store.list_slots(doctor_id, from, to, examination_type, false).await
    }

    /// 取单个号源（含冻结费用）
    pub async fn get(&self, slot_id: i64) -> Result<WorkSlot> {
        self.store
            .get_slot(slot_id)
            .await?
            .ok_or(TeledermError::SlotGone(slot_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{at, fixture, future_date};
    use telederm_core::{Doctor, ServiceScope};

    fn day(windows: Vec<SlotWindow>) -> DayWindows {
        DayWindows { date: future_date(), windows }
    }

    fn window(start: NaiveTime, end: NaiveTime, t: ExaminationType) -> SlotWindow {
        SlotWindow { start, end, examination_type: t }
    }

    #[tokio::test]
    async fn test_create_slots_freezes_fee() {
        let f = fixture().await;
        let service = SlotService::new(f.store.clone(), CorePolicy::default());

        let ids = service
            .create_slots(
                f.doctor_id,
                vec![day(vec![
                    window(at(9, 0), at(9, 30), ExaminationType::Offline),
                    window(at(19, 0), at(19, 30), ExaminationType::Online),
                ])],
            )
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        // 正常时段线下：200；加班线上：300 * 2
        assert_eq!(service.get(ids[0]).await.unwrap().fee, 200);
        assert_eq!(service.get(ids[1]).await.unwrap().fee, 600);

        // 调价不回溯
        f.store.insert_price_table(f.doctor_id, 500, 900, 3.0).await.unwrap();
        assert_eq!(service.get(ids[0]).await.unwrap().fee, 200);
    }

    #[tokio::test]
    async fn test_short_window_rejected() {
        let f = fixture().await;
        let service = SlotService::new(f.store.clone(), CorePolicy::default());

        let err = service
            .create_slots(
                f.doctor_id,
                vec![day(vec![window(at(9, 0), at(9, 20), ExaminationType::Online)])],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TeledermError::Validation(_)));
    }

    #[tokio::test]
    async fn test_overlapping_windows_rejected() {
        let f = fixture().await;
        let service = SlotService::new(f.store.clone(), CorePolicy::default());

        let err = service
            .create_slots(
                f.doctor_id,
                vec![day(vec![
                    window(at(9, 0), at(10, 0), ExaminationType::Online),
                    window(at(9, 30), at(10, 30), ExaminationType::Online),
                ])],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TeledermError::Validation(_)));

        // 首尾相接的半开区间不算重叠
        service
            .create_slots(
                f.doctor_id,
                vec![day(vec![
                    window(at(9, 0), at(10, 0), ExaminationType::Online),
                    window(at(10, 0), at(11, 0), ExaminationType::Online),
                ])],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_past_date_rejected() {
        let f = fixture().await;
        let service = SlotService::new(f.store.clone(), CorePolicy::default());

        let err = service
            .create_slots(
                f.doctor_id,
                vec![DayWindows {
                    date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
                    windows: vec![window(at(9, 0), at(9, 30), ExaminationType::Online)],
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TeledermError::Validation(_)));

        // 策略放开后允许补录
        let relaxed = CorePolicy { allow_past_slots: true, ..Default::default() };
        let service = SlotService::new(f.store.clone(), relaxed);
        service
            .create_slots(
                f.doctor_id,
                vec![DayWindows {
                    date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
                    windows: vec![window(at(9, 0), at(9, 30), ExaminationType::Online)],
                }],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_offline_requires_admitted_doctor() {
        let f = fixture().await;
        let service = SlotService::new(f.store.clone(), CorePolicy::default());

        let unverified = Uuid::new_v4();
        f.store
            .upsert_doctor(Doctor {
                id: unverified,
                name: "Dr. New".into(),
                verify_status: telederm_core::VerifyStatus::FirstPass,
                service_scope: ServiceScope::Both,
                deleted: false,
                created_at: 0,
            })
            .await
            .unwrap();
        f.store.insert_price_table(unverified, 200, 300, 2.0).await.unwrap();

        let err = service
            .create_slots(
                unverified,
                vec![day(vec![window(at(9, 0), at(9, 30), ExaminationType::Offline)])],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TeledermError::Forbidden(_)));

        // 线上号源不受认证门槛限制
        service
            .create_slots(
                unverified,
                vec![day(vec![window(at(9, 0), at(9, 30), ExaminationType::Online)])],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_find_free_excludes_ordered() {
        let f = fixture().await;
        let service = SlotService::new(f.store.clone(), CorePolicy::default());
        let ids = service
            .create_slots(
                f.doctor_id,
                vec![day(vec![
                    window(at(9, 0), at(9, 30), ExaminationType::Online),
                    window(at(10, 0), at(10, 30), ExaminationType::Online),
                ])],
            )
            .await
            .unwrap();

        f.store
            .claim_slot_and_insert(telederm_database::ClaimRequest {
                patient_id: f.patient_id,
                doctor_id: f.doctor_id,
                work_slot_id: ids[0],
                name: "consult".into(),
                status: telederm_core::AppointmentStatus::Approved,
                pre_examination_notes: None,
                link_appointment: None,
                enforce_serial: false,
            })
            .await
            .unwrap();

        let free = service
            .find_free(f.doctor_id, future_date(), future_date(), None)
            .await
            .unwrap();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].id, ids[1]);
    }
}
