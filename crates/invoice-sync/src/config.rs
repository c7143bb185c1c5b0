//! 同步配置
//!
//! 容差窗口、死信阈值等数值都是可调默认值，不是业务常量。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncError};

/// 同步核心配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// 同步状态数据库目录；None 时使用临时数据库（进程退出即丢弃）
    pub data_dir: Option<PathBuf>,
    /// 死信阈值
    pub max_attempts: u32,
    /// 冲突容差窗口（毫秒）
    pub conflict_tolerance_ms: u64,
    /// 定时同步间隔（秒）
    pub sync_interval_secs: u64,
    /// 单次 Provider 调用超时（秒），超时按 networkUnavailable 处理
    pub provider_timeout_secs: u64,
    /// 一轮排空中最多同时在途的 Provider 调用
    pub max_concurrent_operations: usize,
    /// 每次 dequeue 的记录数
    pub batch_size: usize,
    /// 远端对象根目录
    pub remote_root: String,
    /// 每个周期是否扫描远端变更
    pub detect_remote_changes: bool,
    /// 事件广播通道容量
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_attempts: 5,
            conflict_tolerance_ms: 1000,
            sync_interval_secs: 60,
            provider_timeout_secs: 30,
            max_concurrent_operations: 4,
            batch_size: 20,
            remote_root: "records".to_string(),
            detect_remote_changes: true,
            event_capacity: 100,
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        let zero_checks: [(&str, bool); 6] = [
            ("max_attempts", self.max_attempts == 0),
            ("sync_interval_secs", self.sync_interval_secs == 0),
            ("provider_timeout_secs", self.provider_timeout_secs == 0),
            ("max_concurrent_operations", self.max_concurrent_operations == 0),
            ("batch_size", self.batch_size == 0),
            ("event_capacity", self.event_capacity == 0),
        ];
        if let Some((field, _)) = zero_checks.iter().find(|(_, is_zero)| *is_zero) {
            return Err(SyncError::InvalidArgument(format!("{} must be greater than zero", field)));
        }
        if self.remote_root.contains("..") || self.remote_root.contains('\\') {
            return Err(SyncError::InvalidArgument(format!(
                "invalid remote_root: {}",
                self.remote_root
            )));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.max_attempts = max_attempts;
        self
    }

    pub fn conflict_tolerance(mut self, tolerance: Duration) -> Self {
        self.config.conflict_tolerance_ms = u64::try_from(tolerance.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.config.sync_interval_secs = interval.as_secs();
        self
    }

    pub fn provider_timeout(mut self, timeout: Duration) -> Self {
        self.config.provider_timeout_secs = timeout.as_secs();
        self
    }

    pub fn max_concurrent_operations(mut self, max: usize) -> Self {
        self.config.max_concurrent_operations = max;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    pub fn remote_root<S: Into<String>>(mut self, root: S) -> Self {
        self.config.remote_root = root.into();
        self
    }

    pub fn detect_remote_changes(mut self, enabled: bool) -> Self {
        self.config.detect_remote_changes = enabled;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<SyncConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.conflict_tolerance_ms, 1000);
        assert_eq!(config.provider_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_concurrent_operations, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_rejects_zero() {
        let err = SyncConfig::builder().batch_size(0).build().unwrap_err();
        assert_eq!(
            err,
            SyncError::InvalidArgument("batch_size must be greater than zero".to_string())
        );
        assert!(SyncConfig::builder().remote_root("../up").build().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"max_attempts": 3}"#).unwrap();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.remote_root, "records");
        assert_eq!(config.sync_interval_secs, 60);
    }
}
