//! 号源费用计算
//!
//! 纯函数：给定号源起始时间与价格表即可得出费用，无任何可变状态。
//! 诊所本地时区固定为 UTC+7（Asia/Ho_Chi_Minh）；08:00 前或 17:00 后
//! 开始的号源按加班倍率计费，08:00 与 17:00 整点本身属于正常时段。

use crate::models::{ExaminationType, PriceTable};
use chrono::{NaiveTime, Timelike};

/// 正常出诊时段开始（本地时间，含），自午夜起的秒数
pub const REGULAR_HOURS_START_SECS: u32 = 8 * 3600;

/// 正常出诊时段结束（本地时间，含），自午夜起的秒数
pub const REGULAR_HOURS_END_SECS: u32 = 17 * 3600;

/// 诊所本地时区相对UTC的秒偏移（UTC+7）
pub const CLINIC_UTC_OFFSET_SECS: i32 = 7 * 3600;

/// 判断本地开始时间是否落在加班时段
pub fn is_overtime(local_start: NaiveTime) -> bool {
    let secs = local_start.num_seconds_from_midnight();
    secs < REGULAR_HOURS_START_SECS || secs > REGULAR_HOURS_END_SECS
}

/// 计算号源费用
///
/// 费用按最小货币单位取整到最近的整数。
pub fn fee(local_start: NaiveTime, examination_type: ExaminationType, prices: &PriceTable) -> i64 {
    let base = prices.base_price(examination_type);
    if is_overtime(local_start) {
        (base as f64 * prices.ot_multiplier).round() as i64
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn prices(online: i64, offline: i64, ot: f64) -> PriceTable {
        PriceTable {
            id: 1,
            doctor_id: Uuid::new_v4(),
            offline_price: offline,
            online_price: online,
            ot_multiplier: ot,
            is_active: true,
            created_at: 0,
        }
    }

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_regular_hours_no_surcharge() {
        let p = prices(300, 200, 2.0);
        assert_eq!(fee(at(9, 0), ExaminationType::Offline, &p), 200);
        assert_eq!(fee(at(12, 30), ExaminationType::Online, &p), 300);
    }

    #[test]
    fn test_overtime_surcharge() {
        let p = prices(300, 200, 2.0);
        // 19:00 开始的线上问诊，基价300，倍率2
        assert_eq!(fee(at(19, 0), ExaminationType::Online, &p), 600);
        assert_eq!(fee(at(7, 59), ExaminationType::Offline, &p), 400);
    }

    #[test]
    fn test_boundaries_are_regular() {
        // 08:00 与 17:00 整点不算加班
        let p = prices(300, 200, 2.0);
        assert!(!is_overtime(at(8, 0)));
        assert!(!is_overtime(at(17, 0)));
        assert!(is_overtime(at(17, 1)));
        assert!(is_overtime(at(7, 59)));
        assert_eq!(fee(at(8, 0), ExaminationType::Online, &p), 300);
        assert_eq!(fee(at(17, 0), ExaminationType::Offline, &p), 200);
    }

    #[test]
    fn test_rounding_to_nearest_unit() {
        let p = prices(101, 0, 1.5);
        // 101 * 1.5 = 151.5，四舍五入到152
        assert_eq!(fee(at(20, 0), ExaminationType::Online, &p), 152);
    }
}
