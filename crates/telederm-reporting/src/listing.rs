//! 预约列表查询
//!
//! 过滤条件来自外部请求，但可见范围由调用方身份强制决定：患者
//! 只能看到自己的预约，医生只能看到自己接诊的预约，请求里伪造的
//! scoping 字段会被覆盖。

use std::sync::Arc;
use telederm_core::{Result, Role, TeledermError};
use telederm_database::{AppointmentFilter, AppointmentPage, AppointmentView, CoreStore};
use telederm_workflow::Caller;

const MAX_PAGE_SIZE: u32 = 200;

/// 预约列表服务
pub struct ListingService {
    store: Arc<dyn CoreStore>,
}

impl ListingService {
    pub fn new(store: Arc<dyn CoreStore>) -> Self {
        Self { store }
    }

    /// 分页查询预约
    pub async fn list(&self, caller: Caller, mut filter: AppointmentFilter) -> Result<AppointmentPage> {
        match caller.role {
            Role::Patient => filter.patient_id = Some(caller.user_id),
            Role::Doctor => filter.doctor_id = Some(caller.user_id),
            Role::Admin => {}
        }
        if filter.page == 0 {
            filter.page = 1;
        }
        filter.page_size = filter.page_size.clamp(1, MAX_PAGE_SIZE);

        self.store.list_appointments(filter).await
    }

    /// 查单个预约详情
    pub async fn get(&self, caller: Caller, appointment_id: i64) -> Result<AppointmentView> {
        let not_found = || TeledermError::NotFound(format!("appointment {}", appointment_id));
        let appointment = self
            .store
            .get_appointment(appointment_id)
            .await?
            .ok_or_else(not_found)?;
        // 越权访问统一报不存在，不暴露预约是否存在
        let visible = match caller.role {
            Role::Admin => true,
            Role::Patient => appointment.patient_id == caller.user_id,
            Role::Doctor => appointment.doctor_id == caller.user_id,
        };
        if !visible {
            return Err(not_found());
        }

        let mut filter = AppointmentFilter::default();
        filter.patient_id = Some(appointment.patient_id);
        filter.doctor_id = Some(appointment.doctor_id);
        filter.page_size = MAX_PAGE_SIZE;
        let page = self.store.list_appointments(filter).await?;
        page.items
            .into_iter()
            .find(|v| v.appointment.id == appointment_id)
            .ok_or_else(not_found)
    }
}
