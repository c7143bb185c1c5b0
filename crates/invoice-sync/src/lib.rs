//! Invoice Sync - 离线优先的发票数据同步核心
//!
//! 本地修改立即生效并写入持久化队列，网络可用时由后台编排器推送到云端：
//! - 持久化同步队列：合并、优先级、死信
//! - 可插拔云存储后端（`CloudProvider`），自带本地目录与内存实现
//! - 远端变更检测与基于时间戳 + 校验和的冲突识别
//! - 网络状态监控、事件广播、前后台生命周期
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use invoice_sync::{
//!     ContainerProvider, LocalStore, NetworkMonitor, NetworkStatus, SyncConfig, SyncOrchestrator,
//! };
//!
//! async fn run(store: Arc<dyn LocalStore>) -> invoice_sync::Result<()> {
//!     let config = SyncConfig::builder()
//!         .data_dir("/path/to/sync-state")
//!         .build()?;
//!     let network = Arc::new(NetworkMonitor::manual(NetworkStatus::Online));
//!
//!     let orchestrator = SyncOrchestrator::new(config, store, network).await?;
//!     orchestrator
//!         .set_provider(Arc::new(ContainerProvider::new("/path/to/icloud/container")))
//!         .await;
//!     orchestrator.start().await?;
//!
//!     let report = orchestrator.sync_now().wait().await?;
//!     println!("synced {} records", report.synced);
//!
//!     orchestrator.shutdown().await
//! }
//! ```

pub mod config;
pub mod conflict;
pub mod entity;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod network;
pub mod orchestrator;
pub mod provider;
pub mod queue;
pub mod storage;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{SyncConfig, SyncConfigBuilder};
pub use conflict::{
    ConflictDetector, ConflictPolicy, ConflictResolution, MergeRegistry, PreferLocal, PreferRemote, SyncConflict,
};
pub use entity::{EntitySnapshot, EntitySyncStatus, LocalStore, SyncableEntity};
pub use error::{ProviderError, Result, SyncError};
pub use events::{EventManager, EventStats, SyncEvent};
pub use lifecycle::{LifecycleHook, LifecycleManager, SyncLifecycleHook};
pub use network::{ManualNetworkListener, NetworkMonitor, NetworkStatus, NetworkStatusEvent, NetworkStatusListener};
pub use orchestrator::{CycleReport, CycleState, SkipReason, SyncHandle, SyncMetrics, SyncOrchestrator, SyncStatus};
pub use provider::{
    AccountStatus, CloudProvider, ContainerProvider, FileInfo, MemoryProvider, ProviderResult, RemoteChange,
    RemoteChangeKind,
};
pub use queue::{ChangeOperation, ChangeRecord, EntityKey, SyncPriority, SyncQueue};
