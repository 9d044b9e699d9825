//! 通用工具函数

use crate::fee::CLINIC_UTC_OFFSET_SECS;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use uuid::Uuid;

/// 当前UTC时间的整数秒时间戳
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// 诊所本地时区（UTC+7）
pub fn clinic_offset() -> FixedOffset {
    // 偏移为合法常量，构造不会失败
    match FixedOffset::east_opt(CLINIC_UTC_OFFSET_SECS) {
        Some(offset) => offset,
        None => Utc.fix(),
    }
}

/// 将号源的本地日期+时间换算为UTC时间戳（秒）
pub fn slot_start_ts(date: NaiveDate, start_time: NaiveTime) -> i64 {
    match clinic_offset().from_local_datetime(&date.and_time(start_time)) {
        chrono::LocalResult::Single(dt) => dt.timestamp(),
        // 固定偏移时区不存在歧义或空洞，仅为穷尽匹配
        chrono::LocalResult::Ambiguous(dt, _) => dt.timestamp(),
        chrono::LocalResult::None => date.and_time(start_time).and_utc().timestamp(),
    }
}

/// UTC时间戳对应的诊所本地日期
pub fn local_date_of(ts: i64) -> NaiveDate {
    ts_to_local(ts).date_naive()
}

fn ts_to_local(ts: i64) -> DateTime<FixedOffset> {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .with_timezone(&clinic_offset())
}

/// 生成支付网关订单号
pub fn generate_order_code() -> String {
    format!("TD{}{}", Utc::now().timestamp(), Uuid::new_v4().simple())
}

/// 生成线上问诊会议链接
pub fn generate_meeting_link(appointment_id: i64) -> String {
    format!("https://meet.telederm.example/apt/{}-{}", appointment_id, Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_start_ts_applies_offset() {
        let date = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        let time = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        // 本地09:00即UTC 02:00
        let ts = slot_start_ts(date, time);
        let utc = DateTime::from_timestamp(ts, 0).unwrap();
        assert_eq!(utc.format("%H:%M").to_string(), "02:00");
    }

    #[test]
    fn test_order_code_unique() {
        assert_ne!(generate_order_code(), generate_order_code());
    }

    #[test]
    fn test_local_date_round_trip() {
        let date = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        let time = NaiveTime::from_hms_opt(0, 30, 0).unwrap();
        let ts = slot_start_ts(date, time);
        assert_eq!(local_date_of(ts), date);
    }
}
