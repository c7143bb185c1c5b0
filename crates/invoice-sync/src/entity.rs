//! 可同步实体与本地存储接口
//!
//! 业务实体（发票、客户、收付款记录……）实现 `SyncableEntity`；
//! 应用的本地数据库实现 `LocalStore`。同步核心不关心实体结构，只搬运序列化后的载荷。

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;
use crate::queue::EntityKey;
use crate::utils::payload_checksum;

/// 实体同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntitySyncStatus {
    /// 与远端一致
    Synced,
    /// 有本地修改等待上传
    Pending,
    /// 正在上传
    Uploading,
    /// 正在下载远端版本
    Downloading,
    /// 存在未解决的冲突
    Conflicted,
    /// 最近一次同步失败
    Error,
}

impl EntitySyncStatus {
    /// 是否还有本地修改没有到达远端
    pub fn needs_sync(&self) -> bool {
        matches!(self, EntitySyncStatus::Pending | EntitySyncStatus::Error)
    }

    pub fn name(&self) -> &'static str {
        match self {
            EntitySyncStatus::Synced => "synced",
            EntitySyncStatus::Pending => "pending",
            EntitySyncStatus::Uploading => "uploading",
            EntitySyncStatus::Downloading => "downloading",
            EntitySyncStatus::Conflicted => "conflicted",
            EntitySyncStatus::Error => "error",
        }
    }
}

impl fmt::Display for EntitySyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// 可同步实体
pub trait SyncableEntity: Send + Sync {
    fn entity_type(&self) -> &str;

    fn entity_id(&self) -> String;

    /// 最后修改时间（UTC 毫秒）
    fn last_modified(&self) -> i64;

    fn sync_status(&self) -> EntitySyncStatus;

    fn to_payload(&self) -> Result<Vec<u8>>;

    fn from_payload(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized;

    fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type(), self.entity_id())
    }

    /// 当前状态的快照，入队时使用
    fn snapshot(&self) -> Result<EntitySnapshot> {
        Ok(EntitySnapshot {
            entity_type: self.entity_type().to_string(),
            entity_id: self.entity_id(),
            last_modified: self.last_modified(),
            sync_status: self.sync_status(),
            payload: self.to_payload()?,
        })
    }
}

/// JSON 载荷编码，供 serde 实体实现 `to_payload` 使用
pub fn json_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// JSON 载荷解码
pub fn from_json_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// 实体在某一时刻的类型无关视图
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_type: String,
    pub entity_id: String,
    pub last_modified: i64,
    pub sync_status: EntitySyncStatus,
    pub payload: Vec<u8>,
}

impl EntitySnapshot {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }

    pub fn checksum(&self) -> String {
        payload_checksum(&self.payload)
    }
}

/// 应用本地存储
///
/// 对不存在的实体调用 `mark_status` 应当静默成功（实体可能已在本地删除）。
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// 某个类型下需要同步的实体（`needs_sync()` 为真）
    async fn fetch_pending(&self, entity_type: &str) -> Result<Vec<EntitySnapshot>>;

    async fn fetch_entity(&self, entity_type: &str, entity_id: &str) -> Result<Option<EntitySnapshot>>;

    /// 用远端载荷覆盖（或创建）本地实体
    async fn apply_remote_payload(&self, entity_type: &str, entity_id: &str, payload: &[u8]) -> Result<()>;

    async fn mark_status(&self, entity_type: &str, entity_id: &str, status: EntitySyncStatus) -> Result<()>;
}
