use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProviderError;
use crate::utils::now_millis;

/// 单个同步周期内的状态
///
/// `Idle → CheckingNetwork → Draining → (Uploading | Downloading | ResolvingConflict)* → Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CycleState {
    Idle,
    CheckingNetwork,
    Draining,
    Uploading,
    Downloading,
    ResolvingConflict,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CycleState::Idle => "idle",
            CycleState::CheckingNetwork => "checking_network",
            CycleState::Draining => "draining",
            CycleState::Uploading => "uploading",
            CycleState::Downloading => "downloading",
            CycleState::ResolvingConflict => "resolving_conflict",
        };
        write!(f, "{}", name)
    }
}

/// 对外呈现的整体同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Idle => write!(f, "idle"),
            SyncStatus::Syncing => write!(f, "syncing"),
            SyncStatus::Error => write!(f, "error"),
        }
    }
}

/// 周期没有联系 Provider 就结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    Offline,
    NoProvider,
    /// 上次认证失败后尚未重新认证
    AuthenticationRequired,
    ShuttingDown,
}

/// 一次同步周期的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    /// 依次经过的状态，首尾都是 Idle
    pub transitions: Vec<CycleState>,
    pub skipped: Option<SkipReason>,
    pub batches: usize,
    /// 发起的 Provider 调用次数（含认证、list、download）
    pub provider_calls: usize,
    pub synced: usize,
    pub retryable_failures: usize,
    pub fatal_failures: usize,
    pub dead_lettered: usize,
    pub downloaded: usize,
    pub conflicts_detected: usize,
    pub authentication_required: bool,
    pub cancelled: bool,
    /// 本周期遇到的 Provider 错误：(实体, 错误)
    pub errors: Vec<(String, ProviderError)>,
}

impl CycleReport {
    pub(crate) fn new() -> Self {
        Self {
            cycle_id: uuid::Uuid::new_v4().to_string(),
            started_at: now_millis(),
            finished_at: None,
            transitions: vec![CycleState::Idle],
            skipped: None,
            batches: 0,
            provider_calls: 0,
            synced: 0,
            retryable_failures: 0,
            fatal_failures: 0,
            dead_lettered: 0,
            downloaded: 0,
            conflicts_detected: 0,
            authentication_required: false,
            cancelled: false,
            errors: Vec::new(),
        }
    }

    pub fn was_skipped(&self) -> bool {
        self.skipped.is_some()
    }

    /// 本周期是否有需要呈现给用户的错误
    pub fn has_surfaced_errors(&self) -> bool {
        self.fatal_failures > 0 || self.authentication_required
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at.map(|end| end - self.started_at)
    }
}

/// 累计同步指标
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetrics {
    pub cycles_started: u64,
    pub cycles_completed: u64,
    pub cycles_skipped: u64,
    pub provider_calls: u64,
    pub records_synced: u64,
    pub retryable_failures: u64,
    pub fatal_failures: u64,
    pub dead_lettered: u64,
    pub downloads: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub last_cycle_at: Option<i64>,
}

impl SyncMetrics {
    pub(crate) fn absorb(&mut self, report: &CycleReport) {
        self.cycles_completed += 1;
        if report.was_skipped() {
            self.cycles_skipped += 1;
        }
        self.provider_calls += report.provider_calls as u64;
        self.records_synced += report.synced as u64;
        self.retryable_failures += report.retryable_failures as u64;
        self.fatal_failures += report.fatal_failures as u64;
        self.dead_lettered += report.dead_lettered as u64;
        self.downloads += report.downloaded as u64;
        self.conflicts_detected += report.conflicts_detected as u64;
        self.last_cycle_at = report.finished_at.or(Some(report.started_at));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_defaults() {
        let report = CycleReport::new();
        assert_eq!(report.transitions, vec![CycleState::Idle]);
        assert!(!report.was_skipped());
        assert!(!report.has_surfaced_errors());
        assert_eq!(report.duration_ms(), None);
    }

    #[test]
    fn test_metrics_absorb() {
        let mut report = CycleReport::new();
        report.synced = 3;
        report.fatal_failures = 1;
        report.finished_at = Some(report.started_at + 5);

        let mut metrics = SyncMetrics::default();
        metrics.absorb(&report);
        assert_eq!(metrics.cycles_completed, 1);
        assert_eq!(metrics.records_synced, 3);
        assert_eq!(metrics.fatal_failures, 1);
        assert_eq!(metrics.last_cycle_at, report.finished_at);
        assert!(report.has_surfaced_errors());
    }
}
