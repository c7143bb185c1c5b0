use crate::queue::priority::SyncPriority;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 变更操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn name(&self) -> &'static str {
        match self {
            ChangeOperation::Create => "create",
            ChangeOperation::Update => "update",
            ChangeOperation::Delete => "delete",
        }
    }

    /// create/update 都映射为 Provider 的 upload
    pub fn is_upload(&self) -> bool {
        matches!(self, ChangeOperation::Create | ChangeOperation::Update)
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// 实体键：(entity_type, entity_id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    /// 远端对象路径：`<root>/<entity_type>/<entity_id>`
    pub fn remote_path(&self, root: &str) -> String {
        let root = root.trim_matches('/');
        if root.is_empty() {
            format!("{}/{}", self.entity_type, self.entity_id)
        } else {
            format!("{}/{}/{}", root, self.entity_type, self.entity_id)
        }
    }

    /// 从远端路径解析实体键，路径不属于 `root` 或层级不对时返回 None
    pub fn from_remote_path(root: &str, path: &str) -> Option<Self> {
        let root = root.trim_matches('/');
        let rest = if root.is_empty() {
            path.trim_start_matches('/')
        } else {
            path.trim_start_matches('/')
                .strip_prefix(root)?
                .strip_prefix('/')?
        };

        let mut parts = rest.splitn(2, '/');
        let entity_type = parts.next().filter(|s| !s.is_empty())?;
        let entity_id = parts.next().filter(|s| !s.is_empty() && !s.contains('/'))?;
        Some(Self::new(entity_type, entity_id))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// 记录状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordState {
    /// 等待同步
    Pending,
    /// 超过重试上限，等待人工重新入队
    DeadLettered,
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordState::Pending => write!(f, "pending"),
            RecordState::DeadLettered => write!(f, "dead_lettered"),
        }
    }
}

/// 变更记录：一次待同步的本地修改
///
/// 除 `attempt_count`（以及随之而来的死信状态）外，记录创建后不可变；
/// 被 Provider 确认后从队列删除，不再修改。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: ChangeOperation,
    /// 入队时的实体快照，对队列来说是不透明字节
    pub payload: Vec<u8>,
    pub priority: SyncPriority,
    /// 入队时间（UTC 毫秒）
    pub created_at: i64,
    pub(crate) attempt_count: u32,
    pub(crate) state: RecordState,
    /// 入队序号，同一毫秒内保持先进先出；由队列分配
    pub(crate) seq: u64,
}

impl ChangeRecord {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        operation: ChangeOperation,
        payload: Vec<u8>,
        priority: SyncPriority,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation,
            payload,
            priority,
            created_at: chrono::Utc::now().timestamp_millis(),
            attempt_count: 0,
            state: RecordState::Pending,
            seq: 0,
        }
    }

    /// 创建删除记录（无载荷）
    pub fn delete(entity_type: impl Into<String>, entity_id: impl Into<String>, priority: SyncPriority) -> Self {
        Self::new(entity_type, entity_id, ChangeOperation::Delete, Vec::new(), priority)
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }

    pub fn matches_key(&self, key: &EntityKey) -> bool {
        self.entity_type == key.entity_type && self.entity_id == key.entity_id
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_dead_lettered(&self) -> bool {
        self.state == RecordState::DeadLettered
    }

    /// 出队排序键：优先级（高在前）→ 入队时间 → 序号
    pub fn dequeue_order(&self) -> (SyncPriority, i64, u64) {
        (self.priority, self.created_at, self.seq)
    }

    pub fn details(&self) -> String {
        format!(
            "ChangeRecord(id={}, entity={}/{}, op={}, priority={}, state={}, attempts={}, bytes={})",
            self.id,
            self.entity_type,
            self.entity_id,
            self.operation,
            self.priority,
            self.state,
            self.attempt_count,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_creation() {
        let record = ChangeRecord::new("Invoice", "inv-1", ChangeOperation::Create, b"{}".to_vec(), SyncPriority::Normal);
        assert_eq!(record.entity_type, "Invoice");
        assert_eq!(record.attempt_count(), 0);
        assert_eq!(record.state(), RecordState::Pending);
        assert!(!record.id.is_empty());
        assert_eq!(record.key(), EntityKey::new("Invoice", "inv-1"));
    }

    #[test]
    fn test_record_ids_unique() {
        let a = ChangeRecord::delete("Client", "c-1", SyncPriority::High);
        let b = ChangeRecord::delete("Client", "c-1", SyncPriority::High);
        assert_ne!(a.id, b.id);
        assert!(a.payload.is_empty());
        assert_eq!(a.operation, ChangeOperation::Delete);
    }

    #[test]
    fn test_dequeue_order() {
        let mut high = ChangeRecord::new("Invoice", "a", ChangeOperation::Update, vec![], SyncPriority::High);
        let mut normal = ChangeRecord::new("Invoice", "b", ChangeOperation::Update, vec![], SyncPriority::Normal);
        normal.created_at = high.created_at - 10_000;
        high.seq = 2;
        normal.seq = 1;
        assert!(high.dequeue_order() < normal.dequeue_order());
    }

    #[test]
    fn test_remote_path() {
        let key = EntityKey::new("Invoice", "inv-42");
        assert_eq!(key.remote_path("records"), "records/Invoice/inv-42");
        assert_eq!(key.remote_path("/records/"), "records/Invoice/inv-42");
        assert_eq!(key.remote_path(""), "Invoice/inv-42");
    }

    #[test]
    fn test_from_remote_path() {
        assert_eq!(
            EntityKey::from_remote_path("records", "records/Client/c-7"),
            Some(EntityKey::new("Client", "c-7"))
        );
        assert_eq!(EntityKey::from_remote_path("records", "other/Client/c-7"), None);
        assert_eq!(EntityKey::from_remote_path("records", "records/Client"), None);
        assert_eq!(EntityKey::from_remote_path("records", "records/Client/a/b"), None);
    }

    #[test]
    fn test_operation_mapping() {
        assert!(ChangeOperation::Create.is_upload());
        assert!(ChangeOperation::Update.is_upload());
        assert!(!ChangeOperation::Delete.is_upload());
    }
}
