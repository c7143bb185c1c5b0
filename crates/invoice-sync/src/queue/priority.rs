use serde::{Deserialize, Serialize};
use std::fmt;

use crate::queue::change_record::ChangeOperation;

/// 同步优先级
///
/// 优先级决定了变更记录在同步队列中的出队顺序（高优先级先出队，同一优先级内先进先出）：
/// - High: 用户刚刚完成的关键操作（删除、开票后立即分享等）
/// - Normal: 普通编辑
/// - Low: 可延迟的后台整理（批量导入、模板调整等）
///
/// 数值越小优先级越高，派生的 `Ord` 与出队顺序一致。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SyncPriority {
    High = 0,
    Normal = 1,
    Low = 2,
}

impl SyncPriority {
    /// 根据操作类型给出建议优先级
    pub fn from_operation(operation: ChangeOperation) -> Self {
        match operation {
            ChangeOperation::Delete => SyncPriority::High,
            ChangeOperation::Create | ChangeOperation::Update => SyncPriority::Normal,
        }
    }

    pub fn value(&self) -> u8 {
        *self as u8
    }

    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            0 => Some(SyncPriority::High),
            1 => Some(SyncPriority::Normal),
            2 => Some(SyncPriority::Low),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SyncPriority::High => "high",
            SyncPriority::Normal => "normal",
            SyncPriority::Low => "low",
        }
    }

    /// 返回两者中较高的优先级（合并记录时使用）
    pub fn higher(self, other: SyncPriority) -> SyncPriority {
        if self <= other {
            self
        } else {
            other
        }
    }

    pub fn is_higher_than(&self, other: SyncPriority) -> bool {
        self.value() < other.value()
    }

    pub fn all() -> [SyncPriority; 3] {
        [SyncPriority::High, SyncPriority::Normal, SyncPriority::Low]
    }
}

impl fmt::Display for SyncPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Default for SyncPriority {
    fn default() -> Self {
        SyncPriority::Normal
    }
}

impl From<u8> for SyncPriority {
    fn from(value: u8) -> Self {
        SyncPriority::from_value(value).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(SyncPriority::High < SyncPriority::Normal);
        assert!(SyncPriority::Normal < SyncPriority::Low);

        let mut priorities = vec![SyncPriority::Low, SyncPriority::High, SyncPriority::Normal];
        priorities.sort();
        assert_eq!(priorities, SyncPriority::all().to_vec());
    }

    #[test]
    fn test_higher() {
        assert_eq!(SyncPriority::Normal.higher(SyncPriority::High), SyncPriority::High);
        assert_eq!(SyncPriority::High.higher(SyncPriority::Low), SyncPriority::High);
        assert_eq!(SyncPriority::Low.higher(SyncPriority::Low), SyncPriority::Low);
        assert!(SyncPriority::High.is_higher_than(SyncPriority::Normal));
        assert!(!SyncPriority::Low.is_higher_than(SyncPriority::Normal));
    }

    #[test]
    fn test_from_operation() {
        assert_eq!(SyncPriority::from_operation(ChangeOperation::Delete), SyncPriority::High);
        assert_eq!(SyncPriority::from_operation(ChangeOperation::Update), SyncPriority::Normal);
    }

    #[test]
    fn test_value_round_trip_fallback() {
        assert_eq!(SyncPriority::from(0), SyncPriority::High);
        assert_eq!(SyncPriority::from(9), SyncPriority::Normal);
    }
}
