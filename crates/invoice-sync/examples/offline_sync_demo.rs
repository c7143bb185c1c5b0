//! 离线优先同步演示
//!
//! 两台“设备”共享同一个本地目录作为云容器：
//! 设备 A 离线时修改发票，恢复网络后上传；设备 B 同步后拿到同一份数据。

use async_trait::async_trait;
use invoice_sync::entity::{from_json_payload, json_payload};
use invoice_sync::{
    ChangeOperation, ContainerProvider, EntitySnapshot, EntitySyncStatus, LocalStore, NetworkMonitor, NetworkStatus,
    SyncConfig, SyncEvent, SyncOrchestrator, SyncPriority, SyncableEntity,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Invoice {
    id: String,
    customer: String,
    total_cents: i64,
    updated_at: i64,
}

impl SyncableEntity for Invoice {
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

    fn to_payload(&self) -> invoice_sync::Result<Vec<u8>> {
        json_payload(self)
    }

    fn from_payload(bytes: &[u8]) -> invoice_sync::Result<Self> {
        from_json_payload(bytes)
    }
}

/// 演示用的内存数据库
#[derive(Default)]
struct DemoStore {
    rows: Mutex<HashMap<(String, String), EntitySnapshot>>,
}

impl DemoStore {
    fn save(&self, invoice: &Invoice) -> invoice_sync::Result<()> {
        let snapshot = invoice.snapshot()?;
        self.rows
            .lock()
            .insert((snapshot.entity_type.clone(), snapshot.entity_id.clone()), snapshot);
        Ok(())
    }
}

#[async_trait]
impl LocalStore for DemoStore {
    async fn fetch_pending(&self, entity_type: &str) -> invoice_sync::Result<Vec<EntitySnapshot>> {
        Ok(self
            .rows
            .lock()
            .values()
            .filter(|s| s.entity_type == entity_type && s.sync_status.needs_sync())
            .cloned()
            .collect())
    }

    async fn fetch_entity(&self, entity_type: &str, entity_id: &str) -> invoice_sync::Result<Option<EntitySnapshot>> {
        Ok(self
            .rows
            .lock()
            .get(&(entity_type.to_string(), entity_id.to_string()))
            .cloned())
    }

    async fn apply_remote_payload(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: &[u8],
    ) -> invoice_sync::Result<()> {
        let invoice: Invoice = from_json_payload(payload)?;
        let mut snapshot = invoice.snapshot()?;
        snapshot.sync_status = EntitySyncStatus::Synced;
        self.rows
            .lock()
            .insert((entity_type.to_string(), entity_id.to_string()), snapshot);
        Ok(())
    }

    async fn mark_status(&self, entity_type: &str, entity_id: &str, status: EntitySyncStatus) -> invoice_sync::Result<()> {
        if let Some(row) = self
            .rows
            .lock()
            .get_mut(&(entity_type.to_string(), entity_id.to_string()))
        {
            row.sync_status = status;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let workspace = tempfile::tempdir()?;
    let container = workspace.path().join("cloud-container");
    let config = SyncConfig::builder()
        .sync_interval(Duration::from_secs(30))
        .build()?;

    // === 设备 A：离线记账 ===
    let store_a = Arc::new(DemoStore::default());
    let network_a = Arc::new(NetworkMonitor::manual(NetworkStatus::Offline));
    let device_a = SyncOrchestrator::new(config.clone(), store_a.clone(), network_a.clone()).await?;
    device_a
        .set_provider(Arc::new(ContainerProvider::new(&container)))
        .await;
    device_a
        .events()
        .add_listener("*", |event: &SyncEvent| println!("[device A] {}", event.event_type()))
        .await;

    let invoice = Invoice {
        id: "2024-0042".to_string(),
        customer: "ACME GmbH".to_string(),
        total_cents: 129_900,
        updated_at: chrono::Utc::now().timestamp_millis(),
    };
    store_a.save(&invoice)?;
    device_a
        .record_change(&invoice, ChangeOperation::Create, SyncPriority::High)
        .await?;
    println!("queued while offline: {}", device_a.queued_items_count().await);

    let report = device_a.sync_now().wait().await?;
    println!("offline cycle skipped: {:?}", report.skipped);

    // === 网络恢复 ===
    network_a.set_status(NetworkStatus::Online).await;
    let report = device_a.sync_now().wait().await?;
    println!("device A synced {} record(s)", report.synced);

    // === 设备 B：拉取 ===
    let store_b = Arc::new(DemoStore::default());
    let network_b = Arc::new(NetworkMonitor::manual(NetworkStatus::Online));
    let device_b = SyncOrchestrator::new(config, store_b.clone(), network_b).await?;
    device_b
        .set_provider(Arc::new(ContainerProvider::new(&container)))
        .await;
    let report = device_b.sync_now().wait().await?;
    println!("device B downloaded {} record(s)", report.downloaded);

    if let Some(row) = store_b.fetch_entity("Invoice", &invoice.id).await? {
        let copy: Invoice = from_json_payload(&row.payload)?;
        println!("device B sees {} for {} ({} cents)", copy.id, copy.customer, copy.total_cents);
    }

    device_a.shutdown().await?;
    device_b.shutdown().await?;
    Ok(())
}
