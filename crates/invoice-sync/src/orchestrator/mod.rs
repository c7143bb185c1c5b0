//! 同步编排器
//!
//! 把同步队列、当前 Provider、冲突检测和本地存储串起来：
//! - 本地写入只入队，从不等待网络（离线优先）
//! - 同一时间最多一个同步周期；周期进行中的 `sync_now()` 合并到正在运行的那个周期
//! - 后台驱动任务（`start()` 之后）在定时器、网络恢复、入队信号和远端推送时触发周期
//! - 冲突被标记后冻结该实体，直到调用方显式解决

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::conflict::{
    ConflictDetector, ConflictPolicy, ConflictResolution, ConflictStore, MergeRegistry, PreferRemote,
    SyncConflict,
};
use crate::entity::{EntitySyncStatus, LocalStore, SyncableEntity};
use crate::error::{ProviderError, Result, SyncError};
use crate::events::{EventManager, SyncEvent};
use crate::network::NetworkMonitor;
use crate::provider::{CloudProvider, ProviderResult};
use crate::queue::{
    ChangeOperation, ChangeRecord, EnqueueOutcome, EntityKey, RetryPolicy, SyncPriority, SyncQueue,
};
use crate::storage::KvStore;
use crate::utils::now_millis;

mod cycle;
mod driver;
pub mod handle;
pub mod state;

pub use handle::SyncHandle;
pub use state::{CycleReport, CycleState, SkipReason, SyncMetrics, SyncStatus};

#[derive(Debug)]
struct ObserverState {
    status: SyncStatus,
    cycle_state: CycleState,
    last_error: Option<String>,
}

struct InFlightCycle {
    generation: u64,
    handle: SyncHandle,
}

/// 编排器共享状态，由调用方句柄和后台任务共同持有
pub(crate) struct Inner {
    config: SyncConfig,
    kv: KvStore,
    queue: SyncQueue,
    conflicts: ConflictStore,
    detector: ConflictDetector,
    merges: MergeRegistry,
    policy: RwLock<Arc<dyn ConflictPolicy>>,
    store: Arc<dyn LocalStore>,
    network: Arc<NetworkMonitor>,
    provider: RwLock<Option<Arc<dyn CloudProvider>>>,
    events: Arc<EventManager>,
    observer: RwLock<ObserverState>,
    metrics: RwLock<SyncMetrics>,
    in_flight: Mutex<Option<InFlightCycle>>,
    cycle_generation: AtomicU64,
    needs_reauth: AtomicBool,
    paused: AtomicBool,
    started: AtomicBool,
    /// 本地有新的入队记录
    change_signal: Notify,
    /// Provider 切换或认证完成，驱动任务需要重新订阅推送
    provider_signal: Notify,
    shutdown: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// 同步编排器
///
/// 进程启动时构造一次，以克隆句柄的方式注入到各个使用方。
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("status", &self.inner.observer.read().status)
            .field("has_provider", &self.has_provider())
            .field("conflicts", &self.inner.conflicts.len())
            .finish()
    }
}

impl SyncOrchestrator {
    /// 打开同步状态数据库并恢复上次遗留的队列与冲突
    pub async fn new(
        config: SyncConfig,
        store: Arc<dyn LocalStore>,
        network: Arc<NetworkMonitor>,
    ) -> Result<Self> {
        config.validate()?;
        let kv = match &config.data_dir {
            Some(dir) => KvStore::open(dir).await?,
            None => KvStore::temporary()?,
        };
        let queue = SyncQueue::open(kv.clone(), RetryPolicy::new(config.max_attempts)).await?;
        let conflicts = ConflictStore::open(kv.clone())?;

        info!(
            "Sync orchestrator ready: {} queued records, {} open conflicts",
            queue.len().await,
            conflicts.len()
        );

        let inner = Inner {
            detector: ConflictDetector::from_millis(config.conflict_tolerance_ms),
            events: Arc::new(EventManager::new(config.event_capacity)),
            config,
            kv,
            queue,
            conflicts,
            merges: MergeRegistry::new(),
            policy: RwLock::new(Arc::new(PreferRemote)),
            store,
            network,
            provider: RwLock::new(None),
            observer: RwLock::new(ObserverState {
                status: SyncStatus::Idle,
                cycle_state: CycleState::Idle,
                last_error: None,
            }),
            metrics: RwLock::new(SyncMetrics::default()),
            in_flight: Mutex::new(None),
            cycle_generation: AtomicU64::new(0),
            needs_reauth: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            started: AtomicBool::new(false),
            change_signal: Notify::new(),
            provider_signal: Notify::new(),
            shutdown: CancellationToken::new(),
            driver: Mutex::new(None),
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    // ========== Provider ==========

    /// 设置（或切换）当前 Provider；切换会清除“需要重新认证”状态
    pub async fn set_provider(&self, provider: Arc<dyn CloudProvider>) {
        let name = provider.provider_name().to_string();
        let previous = self.inner.provider.write().replace(provider);
        if let Some(previous) = previous {
            self.inner.unsubscribe(previous.as_ref()).await;
            info!("Cloud provider switched: {} -> {}", previous.provider_name(), name);
        } else {
            info!("Cloud provider set: {}", name);
        }

        self.inner.needs_reauth.store(false, Ordering::SeqCst);
        self.inner
            .emit(SyncEvent::ProviderChanged {
                provider: Some(name),
                timestamp: now_millis(),
            })
            .await;
        self.inner.provider_signal.notify_one();
    }

    pub async fn clear_provider(&self) {
        let previous = self.inner.provider.write().take();
        if let Some(previous) = previous {
            self.inner.unsubscribe(previous.as_ref()).await;
            info!("Cloud provider cleared: {}", previous.provider_name());
            self.inner
                .emit(SyncEvent::ProviderChanged {
                    provider: None,
                    timestamp: now_millis(),
                })
                .await;
            self.inner.provider_signal.notify_one();
        }
    }

    pub fn has_provider(&self) -> bool {
        self.inner.provider.read().is_some()
    }

    /// 认证失败后由用户操作触发的重新认证
    pub async fn reauthenticate(&self) -> Result<()> {
        let provider = self.inner.current_provider().ok_or(SyncError::NoProvider)?;
        self.inner.call(provider.authenticate()).await?;

        self.inner.needs_reauth.store(false, Ordering::SeqCst);
        let was_error = {
            let mut observer = self.inner.observer.write();
            observer.last_error = None;
            observer.status == SyncStatus::Error
        };
        if was_error {
            self.inner.set_status(SyncStatus::Idle).await;
        }
        info!("Re-authenticated with {}", provider.provider_name());
        self.inner.provider_signal.notify_one();
        self.inner.change_signal.notify_one();
        Ok(())
    }

    pub fn needs_reauthentication(&self) -> bool {
        self.inner.needs_reauth.load(Ordering::SeqCst)
    }

    // ========== 本地变更 ==========

    /// 记录一次本地修改：快照入队并把实体标记为 pending，不访问网络
    pub async fn record_change<E>(
        &self,
        entity: &E,
        operation: ChangeOperation,
        priority: SyncPriority,
    ) -> Result<EnqueueOutcome>
    where
        E: SyncableEntity + ?Sized,
    {
        let record = match operation {
            ChangeOperation::Delete => {
                ChangeRecord::delete(entity.entity_type(), entity.entity_id(), priority)
            }
            _ => ChangeRecord::new(
                entity.entity_type(),
                entity.entity_id(),
                operation,
                entity.to_payload()?,
                priority,
            ),
        };
        self.inner.enqueue_local(record).await
    }

    /// 记录一次本地删除（实体本身可能已不存在）
    pub async fn record_delete(
        &self,
        entity_type: &str,
        entity_id: &str,
        priority: SyncPriority,
    ) -> Result<EnqueueOutcome> {
        self.inner
            .enqueue_local(ChangeRecord::delete(entity_type, entity_id, priority))
            .await
    }

    /// 把本地处于 pending/error、但队列里没有记录的实体重新入队
    pub async fn requeue_pending(&self, entity_type: &str) -> Result<usize> {
        let pending = self.inner.store.fetch_pending(entity_type).await?;
        let mut requeued = 0;
        for snapshot in pending {
            let key = snapshot.key();
            if self.inner.conflicts.contains_key(&key) || self.inner.queue.contains_entity(&key).await {
                continue;
            }
            let record = ChangeRecord::new(
                snapshot.entity_type.clone(),
                snapshot.entity_id.clone(),
                ChangeOperation::Update,
                snapshot.payload,
                SyncPriority::Normal,
            );
            self.inner.enqueue_local(record).await?;
            requeued += 1;
        }
        if requeued > 0 {
            info!("Requeued {} pending {} entities", requeued, entity_type);
        }
        Ok(requeued)
    }

    pub async fn dead_letters(&self) -> Result<Vec<ChangeRecord>> {
        self.inner.queue.dead_letters().await
    }

    pub async fn requeue_dead_letter(&self, record_id: &str) -> Result<bool> {
        let requeued = self.inner.queue.requeue_dead_letter(record_id).await?;
        if requeued {
            self.inner.change_signal.notify_one();
        }
        Ok(requeued)
    }

    // ========== 同步周期 ==========

    /// 立即触发一次同步
    ///
    /// 已有周期在运行时返回该周期的句柄，不会启动第二个周期。
    /// 必须在 tokio 运行时内调用。
    pub fn sync_now(&self) -> SyncHandle {
        self.inner.trigger_cycle()
    }

    /// 启动后台驱动任务
    pub async fn start(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SyncError::ShuttingDown("orchestrator already shut down".to_string()));
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.inner.network.start().await {
            self.inner.started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        let handle = tokio::spawn(driver::run(self.inner.clone()));
        *self.inner.driver.lock() = Some(handle);
        Ok(())
    }

    /// 停止后台任务，等待在途周期结束并把同步状态刷盘
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down sync orchestrator");
        self.inner.shutdown.cancel();

        let in_flight = self.inner.in_flight.lock().as_ref().map(|c| c.handle.clone());
        if let Some(handle) = in_flight {
            let _ = handle.wait().await;
        }

        let driver = self.inner.driver.lock().take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                warn!("Sync driver task ended abnormally: {}", e);
            }
        }

        if let Some(provider) = self.inner.current_provider() {
            self.inner.unsubscribe(provider.as_ref()).await;
        }
        self.inner.network.stop().await;
        self.inner.kv.flush().await?;
        info!("Sync state flushed, orchestrator stopped");
        Ok(())
    }

    // ========== 冲突 ==========

    pub fn set_conflict_policy(&self, policy: Arc<dyn ConflictPolicy>) {
        *self.inner.policy.write() = policy;
    }

    pub fn register_merge<F>(&self, entity_type: impl Into<String>, merge: F)
    where
        F: Fn(&[u8], &[u8]) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.inner.merges.register(entity_type, merge);
    }

    /// 显式解决冲突
    ///
    /// - `UseRemote`：远端载荷写回本地，丢弃该实体排队中的记录，状态 → synced
    /// - `UseLocal`：本地快照以高优先级重新入队，状态 → pending（上传成功后 synced）
    /// - `Merge`：调用注册的合并函数，结果写回本地并入队上传，状态 → pending
    pub async fn resolve_conflict(&self, conflict_id: &str, resolution: ConflictResolution) -> Result<()> {
        let inner = &self.inner;
        let conflict = inner
            .conflicts
            .get(conflict_id)
            .ok_or_else(|| SyncError::NotFound(format!("conflict {}", conflict_id)))?;
        let key = conflict.key();

        match resolution {
            ConflictResolution::UseRemote => {
                inner
                    .store
                    .apply_remote_payload(&key.entity_type, &key.entity_id, &conflict.remote_payload)
                    .await?;
                let dropped = inner.queue.remove_entity(&key).await?;
                if !dropped.is_empty() {
                    debug!("Dropped {} queued records for {} in favour of remote", dropped.len(), key);
                }
                inner.conflicts.clear_override(&key)?;
                inner
                    .store
                    .mark_status(&key.entity_type, &key.entity_id, EntitySyncStatus::Synced)
                    .await?;
            }
            ConflictResolution::UseLocal => {
                match inner.store.fetch_entity(&key.entity_type, &key.entity_id).await? {
                    Some(local) => {
                        inner.conflicts.record_override(&key, &conflict.remote_checksum)?;
                        inner
                            .queue
                            .enqueue(ChangeRecord::new(
                                key.entity_type.clone(),
                                key.entity_id.clone(),
                                ChangeOperation::Update,
                                local.payload,
                                SyncPriority::High,
                            ))
                            .await?;
                        inner
                            .store
                            .mark_status(&key.entity_type, &key.entity_id, EntitySyncStatus::Pending)
                            .await?;
                    }
                    None => debug!("Local copy of {} is gone, queued delete stands", key),
                }
            }
            ConflictResolution::Merge => {
                let local = inner
                    .store
                    .fetch_entity(&key.entity_type, &key.entity_id)
                    .await?
                    .ok_or_else(|| SyncError::NotFound(format!("local entity {}", key)))?;
                let merged = inner
                    .merges
                    .merge(&key.entity_type, &local.payload, &conflict.remote_payload)?;
                inner
                    .store
                    .apply_remote_payload(&key.entity_type, &key.entity_id, &merged)
                    .await?;
                inner.conflicts.record_override(&key, &conflict.remote_checksum)?;
                inner
                    .queue
                    .enqueue(ChangeRecord::new(
                        key.entity_type.clone(),
                        key.entity_id.clone(),
                        ChangeOperation::Update,
                        merged,
                        SyncPriority::High,
                    ))
                    .await?;
                inner
                    .store
                    .mark_status(&key.entity_type, &key.entity_id, EntitySyncStatus::Pending)
                    .await?;
            }
        }

        inner.conflicts.remove(conflict_id)?;
        inner.metrics.write().conflicts_resolved += 1;
        info!("Resolved conflict {} for {} with {}", conflict_id, key, resolution);
        inner
            .emit(SyncEvent::ConflictResolved {
                conflict_id: conflict_id.to_string(),
                entity_type: key.entity_type.clone(),
                entity_id: key.entity_id.clone(),
                resolution,
                timestamp: now_millis(),
            })
            .await;
        inner.change_signal.notify_one();
        Ok(())
    }

    /// 用当前配置的策略解决一条冲突
    pub async fn resolve_with_policy(&self, conflict_id: &str) -> Result<ConflictResolution> {
        let conflict = self
            .inner
            .conflicts
            .get(conflict_id)
            .ok_or_else(|| SyncError::NotFound(format!("conflict {}", conflict_id)))?;
        let policy = self.inner.policy.read().clone();
        let resolution = policy.choose(&conflict);
        self.resolve_conflict(conflict_id, resolution).await?;
        Ok(resolution)
    }

    // ========== 观察者接口 ==========

    pub fn current_status(&self) -> SyncStatus {
        self.inner.observer.read().status
    }

    pub fn cycle_state(&self) -> CycleState {
        self.inner.observer.read().cycle_state
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.observer.read().last_error.clone()
    }

    pub fn conflict_items(&self) -> Vec<SyncConflict> {
        self.inner.conflicts.list()
    }

    pub async fn queued_items_count(&self) -> usize {
        self.inner.queue.len().await
    }

    pub fn metrics(&self) -> SyncMetrics {
        self.inner.metrics.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> Arc<EventManager> {
        self.inner.events.clone()
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.inner.queue
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub(crate) fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    pub(crate) fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
    }

    pub(crate) async fn flush(&self) -> Result<()> {
        self.inner.kv.flush().await
    }
}

impl Inner {
    fn current_provider(&self) -> Option<Arc<dyn CloudProvider>> {
        self.provider.read().clone()
    }

    async fn emit(&self, event: SyncEvent) {
        self.events.emit(event).await;
    }

    /// 带超时的 Provider 调用；超时按 networkUnavailable 处理
    async fn call<T, F>(&self, operation: F) -> ProviderResult<T>
    where
        F: std::future::Future<Output = ProviderResult<T>>,
    {
        match tokio::time::timeout(self.config.provider_timeout(), operation).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Provider call timed out after {}s",
                    self.config.provider_timeout_secs
                );
                Err(ProviderError::NetworkUnavailable)
            }
        }
    }

    /// 取消推送订阅；失败只记日志
    async fn unsubscribe(&self, provider: &dyn CloudProvider) {
        if let Err(e) = self.call(provider.unsubscribe_from_changes()).await {
            debug!("Failed to unsubscribe from {}: {}", provider.provider_name(), e);
        }
    }

    async fn enqueue_local(&self, record: ChangeRecord) -> Result<EnqueueOutcome> {
        let key = record.key();
        let operation = record.operation;
        let outcome = self.queue.enqueue(record).await?;

        // 冲突中的实体保持冻结状态
        if operation.is_upload() && !self.conflicts.contains_key(&key) {
            self.store
                .mark_status(&key.entity_type, &key.entity_id, EntitySyncStatus::Pending)
                .await?;
        }
        debug!("Recorded local {} for {}: {:?}", operation, key, outcome);
        self.change_signal.notify_one();
        Ok(outcome)
    }

    /// 更新整体状态，返回旧状态
    async fn set_status(&self, new_status: SyncStatus) -> SyncStatus {
        let old_status = std::mem::replace(&mut self.observer.write().status, new_status);
        if old_status != new_status {
            debug!("Sync status {} -> {}", old_status, new_status);
            self.emit(SyncEvent::StatusChanged {
                old_status,
                new_status,
                timestamp: now_millis(),
            })
            .await;
        }
        old_status
    }

    /// 启动周期或加入正在运行的周期
    fn trigger_cycle(self: &Arc<Self>) -> SyncHandle {
        let mut slot = self.in_flight.lock();
        if let Some(current) = slot.as_ref() {
            if !current.handle.is_finished() {
                debug!("Sync cycle {} already running, joining it", current.handle.cycle_id());
                return current.handle.clone();
            }
        }

        let report = CycleReport::new();
        let (tx, rx) = watch::channel(None);
        let cancel = self.shutdown.child_token();
        let handle = SyncHandle::new(report.cycle_id.clone(), rx, cancel.clone());
        let generation = self.cycle_generation.fetch_add(1, Ordering::SeqCst) + 1;
        *slot = Some(InFlightCycle {
            generation,
            handle: handle.clone(),
        });
        drop(slot);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = inner.run_cycle(report, &cancel).await;
            let _ = tx.send(Some(outcome));
            let mut slot = inner.in_flight.lock();
            if slot.as_ref().map(|c| c.generation) == Some(generation) {
                *slot = None;
            }
        });
        handle
    }
}
