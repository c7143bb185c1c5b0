//! 测试辅助：内存本地存储、可编排失败的 Provider、测试用发票实体

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::config::SyncConfig;
use crate::entity::{from_json_payload, json_payload, EntitySnapshot, EntitySyncStatus, LocalStore, SyncableEntity};
use crate::error::{ProviderError, Result};
use crate::network::{NetworkMonitor, NetworkStatus};
use crate::orchestrator::SyncOrchestrator;
use crate::provider::{AccountStatus, CloudProvider, FileInfo, MemoryProvider, ProviderResult, RemoteChange};
use crate::queue::EntityKey;
use crate::utils::now_millis;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct TestInvoice {
    pub id: String,
    pub number: String,
    pub total_cents: i64,
    pub updated_at: i64,
}

impl TestInvoice {
    pub fn new(id: &str, total_cents: i64, updated_at: i64) -> Self {
        Self {
            id: id.to_string(),
            number: format!("INV-{}", id),
            total_cents,
            updated_at,
        }
    }
}

impl SyncableEntity for TestInvoice {
    fn entity_type(&self) -> &str {
        "Invoice"
    }

    fn entity_id(&self) -> String {
        self.id.clone()
    }

    fn last_modified(&self) -> i64 {
        self.updated_at
    }

    fn sync_status(&self) -> EntitySyncStatus {
        EntitySyncStatus::Pending
    }

    fn to_payload(&self) -> Result<Vec<u8>> {
        json_payload(self)
    }

    fn from_payload(bytes: &[u8]) -> Result<Self> {
        from_json_payload(bytes)
    }
}

/// 内存版本地存储，记录每次状态变化
#[derive(Debug, Default)]
pub(crate) struct MemoryLocalStore {
    entities: Mutex<HashMap<EntityKey, EntitySnapshot>>,
    history: Mutex<Vec<(EntityKey, EntitySyncStatus)>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 保存实体（模拟用户在本地修改），状态置为 pending
    pub fn insert<E: SyncableEntity>(&self, entity: &E) -> EntitySnapshot {
        let mut snapshot = entity.snapshot().expect("snapshot");
        snapshot.sync_status = EntitySyncStatus::Pending;
        self.entities.lock().insert(snapshot.key(), snapshot.clone());
        snapshot
    }

    pub fn remove(&self, entity_type: &str, entity_id: &str) {
        self.entities.lock().remove(&EntityKey::new(entity_type, entity_id));
    }

    pub fn get(&self, entity_type: &str, entity_id: &str) -> Option<EntitySnapshot> {
        self.entities.lock().get(&EntityKey::new(entity_type, entity_id)).cloned()
    }

    pub fn status(&self, entity_type: &str, entity_id: &str) -> Option<EntitySyncStatus> {
        self.get(entity_type, entity_id).map(|s| s.sync_status)
    }

    pub fn invoice(&self, entity_id: &str) -> Option<TestInvoice> {
        self.get("Invoice", entity_id)
            .map(|s| TestInvoice::from_payload(&s.payload).expect("decode invoice"))
    }

    pub fn history(&self, entity_type: &str, entity_id: &str) -> Vec<EntitySyncStatus> {
        let key = EntityKey::new(entity_type, entity_id);
        self.history
            .lock()
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, status)| *status)
            .collect()
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn fetch_pending(&self, entity_type: &str) -> Result<Vec<EntitySnapshot>> {
        Ok(self
            .entities
            .lock()
            .values()
            .filter(|s| s.entity_type == entity_type && s.sync_status.needs_sync())
            .cloned()
            .collect())
    }

    async fn fetch_entity(&self, entity_type: &str, entity_id: &str) -> Result<Option<EntitySnapshot>> {
        Ok(self.get(entity_type, entity_id))
    }

    async fn apply_remote_payload(&self, entity_type: &str, entity_id: &str, payload: &[u8]) -> Result<()> {
        let key = EntityKey::new(entity_type, entity_id);
        let mut entities = self.entities.lock();
        let entry = entities.entry(key).or_insert_with(|| EntitySnapshot {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            last_modified: 0,
            sync_status: EntitySyncStatus::Synced,
            payload: Vec::new(),
        });
        entry.payload = payload.to_vec();
        entry.last_modified = now_millis();
        Ok(())
    }

    async fn mark_status(&self, entity_type: &str, entity_id: &str, status: EntitySyncStatus) -> Result<()> {
        let key = EntityKey::new(entity_type, entity_id);
        if let Some(entity) = self.entities.lock().get_mut(&key) {
            entity.sync_status = status;
            self.history.lock().push((key, status));
        }
        Ok(())
    }
}

/// 包装 `MemoryProvider`，可以注入上传失败与延迟
#[derive(Debug)]
pub(crate) struct ScriptedProvider {
    remote: Arc<MemoryProvider>,
    queued_failures: Mutex<VecDeque<ProviderError>>,
    persistent_failure: Mutex<Option<ProviderError>>,
    upload_delay: Mutex<Duration>,
    subscribe_failure: Mutex<Option<ProviderError>>,
    /// 订阅/取消订阅永不返回
    hang_subscriptions: AtomicBool,
    call_count: AtomicUsize,
    upload_count: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::wrap(Arc::new(MemoryProvider::new()))
    }

    pub fn with_account_status(status: AccountStatus) -> Self {
        Self::wrap(Arc::new(MemoryProvider::with_account_status(status)))
    }

    /// 与其他编排器共享同一个远端
    pub fn wrap(remote: Arc<MemoryProvider>) -> Self {
        Self {
            remote,
            queued_failures: Mutex::new(VecDeque::new()),
            persistent_failure: Mutex::new(None),
            upload_delay: Mutex::new(Duration::ZERO),
            subscribe_failure: Mutex::new(None),
            hang_subscriptions: AtomicBool::new(false),
            call_count: AtomicUsize::new(0),
            upload_count: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn remote(&self) -> &Arc<MemoryProvider> {
        &self.remote
    }

    /// 接下来的上传依次失败
    pub fn fail_next_uploads(&self, errors: impl IntoIterator<Item = ProviderError>) {
        self.queued_failures.lock().extend(errors);
    }

    /// 每次上传都失败，直到传入 None
    pub fn fail_all_uploads(&self, error: Option<ProviderError>) {
        *self.persistent_failure.lock() = error;
    }

    pub fn set_upload_delay(&self, delay: Duration) {
        *self.upload_delay.lock() = delay;
    }

    pub fn fail_subscriptions(&self, error: Option<ProviderError>) {
        *self.subscribe_failure.lock() = error;
    }

    pub fn hang_subscriptions(&self) {
        self.hang_subscriptions.store(true, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn upload_count(&self) -> usize {
        self.upload_count.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn count_call(&self) {
        self.call_count.fetch_add(1, Ordering::SeqCst);
    }

    fn scripted_failure(&self) -> Option<ProviderError> {
        if let Some(error) = self.queued_failures.lock().pop_front() {
            return Some(error);
        }
        self.persistent_failure.lock().clone()
    }
}

#[async_trait]
impl CloudProvider for ScriptedProvider {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    async fn account_status(&self) -> AccountStatus {
        self.remote.account_status().await
    }

    fn is_authenticated(&self) -> bool {
        self.remote.is_authenticated()
    }

    async fn authenticate(&self) -> ProviderResult<()> {
        self.count_call();
        self.remote.authenticate().await
    }

    async fn upload(&self, path: &str, data: &[u8]) -> ProviderResult<()> {
        self.count_call();
        self.upload_count.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(&self.in_flight);
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = *self.upload_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.scripted_failure() {
            return Err(error);
        }
        self.remote.upload(path, data).await
    }

    async fn download(&self, path: &str) -> ProviderResult<Vec<u8>> {
        self.count_call();
        self.remote.download(path).await
    }

    async fn delete(&self, path: &str) -> ProviderResult<()> {
        self.count_call();
        self.remote.delete(path).await
    }

    async fn list(&self, prefix: &str) -> ProviderResult<Vec<FileInfo>> {
        self.count_call();
        self.remote.list(prefix).await
    }

    async fn subscribe_to_changes(&self) -> ProviderResult<Option<broadcast::Receiver<RemoteChange>>> {
        if self.hang_subscriptions.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        let failure = self.subscribe_failure.lock().clone();
        if let Some(error) = failure {
            return Err(error);
        }
        self.remote.subscribe_to_changes().await
    }

    async fn unsubscribe_from_changes(&self) -> ProviderResult<()> {
        if self.hang_subscriptions.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        self.remote.unsubscribe_from_changes().await
    }
}

pub(crate) struct Harness {
    pub orchestrator: SyncOrchestrator,
    pub store: Arc<MemoryLocalStore>,
    pub provider: Arc<ScriptedProvider>,
    pub network: Arc<NetworkMonitor>,
}

/// 测试日志输出到 test writer，重复调用无副作用
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// 在线、已设置 Provider、未启动后台任务的编排器
pub(crate) async fn harness(config: SyncConfig) -> Harness {
    harness_with(config, Arc::new(ScriptedProvider::new()), NetworkStatus::Online).await
}

pub(crate) async fn harness_with(
    config: SyncConfig,
    provider: Arc<ScriptedProvider>,
    network_status: NetworkStatus,
) -> Harness {
    init_tracing();
    let store = Arc::new(MemoryLocalStore::new());
    let network = Arc::new(NetworkMonitor::manual(network_status));
    let orchestrator = SyncOrchestrator::new(config, store.clone(), network.clone())
        .await
        .expect("orchestrator");
    orchestrator.set_provider(provider.clone()).await;
    Harness {
        orchestrator,
        store,
        provider,
        network,
    }
}

/// 测试默认配置：周期性触发足够慢，不干扰手动触发
pub(crate) fn test_config() -> SyncConfig {
    SyncConfig::builder()
        .sync_interval(Duration::from_secs(3600))
        .build()
        .expect("config")
}
