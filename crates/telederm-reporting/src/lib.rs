//! # TeleDerm Reporting
//!
//! 预约列表查询与统计投影。全部只读：列表按调用方身份强制收窄
//! 可见范围，统计按月聚合预约联查视图与已支付支付单。

pub mod listing;
pub mod statistics;

pub use listing::ListingService;
pub use statistics::{month_range, DoctorRevenue, MonthlyStatistics, PatientSpending, StatisticsService};
