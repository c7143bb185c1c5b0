//! 时间工具
//!
//! 同步核心内部所有时间字段都是 UTC 毫秒时间戳（i64）。

use std::time::SystemTime;

/// 当前 UTC 毫秒时间戳
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 文件系统时间转毫秒；早于 UNIX 纪元的时间按 0 处理
pub fn system_time_millis(time: SystemTime) -> i64 {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_system_time_millis() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        assert_eq!(system_time_millis(t), 1_700_000_000_123);
        assert_eq!(system_time_millis(SystemTime::UNIX_EPOCH), 0);
    }

    #[test]
    fn test_now_is_recent() {
        assert!(now_millis() > 1_600_000_000_000);
    }
}
