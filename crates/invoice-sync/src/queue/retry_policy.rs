use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// 同步失败分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureClass {
    /// 可重试 - 保留在队列，下个周期再试（受死信阈值限制）
    Retryable,
    /// 不可重试 - 直接确认移出队列，并上报给观察者
    Fatal,
    /// 认证失败 - 停止本周期的 Provider 调用，上报“需要重新认证”
    Authentication,
}

impl FailureClass {
    pub fn classify(error: &ProviderError) -> Self {
        if error.is_auth_error() {
            FailureClass::Authentication
        } else if error.is_retryable() {
            FailureClass::Retryable
        } else {
            FailureClass::Fatal
        }
    }
}

/// 一次失败尝试记账后的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// 仍在正常轮转中
    WillRetry { attempts: u32 },
    /// 本次失败后达到阈值，进入死信
    DeadLettered { attempts: u32 },
    /// 已经是死信，计数不再变化
    AlreadyDeadLettered { attempts: u32 },
    /// 记录不存在（已被确认或被合并替换）
    NotFound,
}

impl AttemptOutcome {
    pub fn is_dead_lettered(&self) -> bool {
        matches!(
            self,
            AttemptOutcome::DeadLettered { .. } | AttemptOutcome::AlreadyDeadLettered { .. }
        )
    }

    pub fn attempts(&self) -> Option<u32> {
        match self {
            AttemptOutcome::WillRetry { attempts }
            | AttemptOutcome::DeadLettered { attempts }
            | AttemptOutcome::AlreadyDeadLettered { attempts } => Some(*attempts),
            AttemptOutcome::NotFound => None,
        }
    }
}

/// 重试策略配置
///
/// 失败次数达到 `max_attempts` 的记录移出正常出队轮转（死信），之后的失败不再修改它。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 死信阈值
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// 计数递增后是否应进入死信
    pub fn is_exhausted(&self, attempt_count: u32) -> bool {
        attempt_count >= self.max_attempts
    }

    /// 还剩多少次机会
    pub fn remaining(&self, attempt_count: u32) -> u32 {
        self.max_attempts.saturating_sub(attempt_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(FailureClass::classify(&ProviderError::NetworkUnavailable), FailureClass::Retryable);
        assert_eq!(FailureClass::classify(&ProviderError::RateLimited), FailureClass::Retryable);
        assert_eq!(FailureClass::classify(&ProviderError::QuotaExceeded), FailureClass::Fatal);
        assert_eq!(FailureClass::classify(&ProviderError::InvalidData("x".into())), FailureClass::Fatal);
        assert_eq!(FailureClass::classify(&ProviderError::NotAuthenticated), FailureClass::Authentication);
    }

    #[test]
    fn test_policy_threshold() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
        assert!(policy.is_exhausted(6));
        assert_eq!(policy.remaining(3), 2);
        assert_eq!(policy.remaining(9), 0);
    }

    #[test]
    fn test_outcome_helpers() {
        assert!(AttemptOutcome::DeadLettered { attempts: 5 }.is_dead_lettered());
        assert!(!AttemptOutcome::WillRetry { attempts: 1 }.is_dead_lettered());
        assert_eq!(AttemptOutcome::NotFound.attempts(), None);
        assert_eq!(AttemptOutcome::AlreadyDeadLettered { attempts: 5 }.attempts(), Some(5));
    }
}
