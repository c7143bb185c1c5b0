//! 冲突检测与解决
//!
//! - `ConflictDetector`：时间戳差超过容差窗口且内容校验和不同才算冲突
//! - `SyncConflict`：被标记的冲突，持久化到 `sync_conflicts` tree，直到显式解决
//! - `ConflictPolicy`：可插拔的解决策略（默认远端优先），只在调用方要求时应用
//! - `MergeRegistry`：按实体类型注入的合并函数

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::queue::EntityKey;
use crate::storage::{trees, KvStore};
use crate::utils::now_millis;

/// 冲突检测器
#[derive(Debug, Clone, Copy)]
pub struct ConflictDetector {
    tolerance_ms: i64,
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl ConflictDetector {
    pub fn new(tolerance: Duration) -> Self {
        Self {
            tolerance_ms: i64::try_from(tolerance.as_millis()).unwrap_or(i64::MAX),
        }
    }

    pub fn from_millis(tolerance_ms: u64) -> Self {
        Self::new(Duration::from_millis(tolerance_ms))
    }

    pub fn tolerance_ms(&self) -> i64 {
        self.tolerance_ms
    }

    /// 时间戳差是否超出容差
    pub fn timestamps_diverge(&self, local_modified: i64, remote_modified: i64) -> bool {
        local_modified.abs_diff(remote_modified) > self.tolerance_ms.unsigned_abs()
    }

    /// 内容相同的时间偏差不算冲突
    pub fn has_conflict(
        &self,
        local_modified: i64,
        remote_modified: i64,
        local_checksum: &str,
        remote_checksum: &str,
    ) -> bool {
        local_checksum != remote_checksum && self.timestamps_diverge(local_modified, remote_modified)
    }
}

/// 冲突解决方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictResolution {
    /// 保留本地版本并重新上传
    UseLocal,
    /// 采用远端版本覆盖本地
    UseRemote,
    /// 调用该实体类型注册的合并函数
    Merge,
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictResolution::UseLocal => "use_local",
            ConflictResolution::UseRemote => "use_remote",
            ConflictResolution::Merge => "merge",
        };
        write!(f, "{}", name)
    }
}

/// 一条未解决的冲突
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub local_modified: i64,
    pub remote_modified: i64,
    pub local_checksum: String,
    pub remote_checksum: String,
    /// 检测时下载的远端版本，解决时使用
    pub remote_payload: Vec<u8>,
    pub remote_path: String,
    pub detected_at: i64,
}

impl SyncConflict {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: &EntityKey,
        local_modified: i64,
        remote_modified: i64,
        local_checksum: String,
        remote_checksum: String,
        remote_payload: Vec<u8>,
        remote_path: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type: key.entity_type.clone(),
            entity_id: key.entity_id.clone(),
            local_modified,
            remote_modified,
            local_checksum,
            remote_checksum,
            remote_payload,
            remote_path,
            detected_at: now_millis(),
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }
}

/// 冲突解决策略
pub trait ConflictPolicy: Send + Sync {
    fn choose(&self, conflict: &SyncConflict) -> ConflictResolution;
}

/// 默认策略：远端优先
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferRemote;

impl ConflictPolicy for PreferRemote {
    fn choose(&self, _conflict: &SyncConflict) -> ConflictResolution {
        ConflictResolution::UseRemote
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PreferLocal;

impl ConflictPolicy for PreferLocal {
    fn choose(&self, _conflict: &SyncConflict) -> ConflictResolution {
        ConflictResolution::UseLocal
    }
}

impl<F> ConflictPolicy for F
where
    F: Fn(&SyncConflict) -> ConflictResolution + Send + Sync,
{
    fn choose(&self, conflict: &SyncConflict) -> ConflictResolution {
        self(conflict)
    }
}

/// 合并函数：(本地载荷, 远端载荷) -> 合并后的载荷
pub type MergeFn = Arc<dyn Fn(&[u8], &[u8]) -> Result<Vec<u8>> + Send + Sync>;

/// 按实体类型注册的合并函数
#[derive(Default)]
pub struct MergeRegistry {
    merges: RwLock<HashMap<String, MergeFn>>,
}

impl fmt::Debug for MergeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<String> = self.merges.read().keys().cloned().collect();
        types.sort();
        f.debug_struct("MergeRegistry").field("entity_types", &types).finish()
    }
}

impl MergeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, entity_type: impl Into<String>, merge: F)
    where
        F: Fn(&[u8], &[u8]) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        let entity_type = entity_type.into();
        info!("Registered merge function for {}", entity_type);
        self.merges.write().insert(entity_type, Arc::new(merge));
    }

    pub fn contains(&self, entity_type: &str) -> bool {
        self.merges.read().contains_key(entity_type)
    }

    pub fn merge(&self, entity_type: &str, local: &[u8], remote: &[u8]) -> Result<Vec<u8>> {
        let merge = self
            .merges
            .read()
            .get(entity_type)
            .cloned()
            .ok_or_else(|| SyncError::MergeUnavailable(entity_type.to_string()))?;
        merge(local, remote)
    }
}

/// 持久化的冲突集合
///
/// 每个实体最多一条未解决冲突；内存索引与 sled 同步写入。
///
/// 以本地版本（或合并结果）解决的冲突会留下一条覆盖标记：远端那个版本已经被处理过，
/// 在本地版本上传成功之前再次看到它时不再判为冲突。
#[derive(Debug)]
pub struct ConflictStore {
    kv: KvStore,
    conflicts: RwLock<BTreeMap<String, SyncConflict>>,
    /// 实体键 -> 已被本地版本覆盖的远端校验和
    overrides: RwLock<BTreeMap<String, String>>,
}

impl ConflictStore {
    pub fn open(kv: KvStore) -> Result<Self> {
        let conflicts: BTreeMap<String, SyncConflict> =
            kv.scan::<SyncConflict>(trees::SYNC_CONFLICTS)?.into_iter().collect();
        let overrides: BTreeMap<String, String> =
            kv.scan::<String>(trees::CONFLICT_OVERRIDES)?.into_iter().collect();
        if !conflicts.is_empty() {
            info!("Restored {} unresolved sync conflicts", conflicts.len());
        }
        Ok(Self {
            kv,
            conflicts: RwLock::new(conflicts),
            overrides: RwLock::new(overrides),
        })
    }

    /// 记录该远端版本已由本地版本覆盖
    pub fn record_override(&self, key: &EntityKey, remote_checksum: &str) -> Result<()> {
        let id = key.to_string();
        self.kv.put(trees::CONFLICT_OVERRIDES, &id, &remote_checksum.to_string())?;
        self.overrides.write().insert(id, remote_checksum.to_string());
        Ok(())
    }

    pub fn is_overridden(&self, key: &EntityKey, remote_checksum: &str) -> bool {
        self.overrides
            .read()
            .get(&key.to_string())
            .map(|checksum| checksum == remote_checksum)
            .unwrap_or(false)
    }

    /// 本地版本上传成功后清除覆盖标记
    pub fn clear_override(&self, key: &EntityKey) -> Result<()> {
        let id = key.to_string();
        if self.overrides.read().contains_key(&id) {
            self.kv.remove(trees::CONFLICT_OVERRIDES, &id)?;
            self.overrides.write().remove(&id);
        }
        Ok(())
    }

    /// 记录冲突；同一实体已有冲突时用新冲突替换旧的
    pub fn insert(&self, conflict: SyncConflict) -> Result<()> {
        let key = conflict.key();
        let previous = self.find_by_key(&key);
        if let Some(previous) = &previous {
            self.kv.remove(trees::SYNC_CONFLICTS, &previous.id)?;
        }
        self.kv.put(trees::SYNC_CONFLICTS, &conflict.id, &conflict)?;

        let mut conflicts = self.conflicts.write();
        if let Some(previous) = previous {
            conflicts.remove(&previous.id);
        }
        debug!("Stored conflict {} for {}", conflict.id, key);
        conflicts.insert(conflict.id.clone(), conflict);
        Ok(())
    }

    pub fn remove(&self, conflict_id: &str) -> Result<Option<SyncConflict>> {
        self.kv.remove(trees::SYNC_CONFLICTS, conflict_id)?;
        Ok(self.conflicts.write().remove(conflict_id))
    }

    pub fn get(&self, conflict_id: &str) -> Option<SyncConflict> {
        self.conflicts.read().get(conflict_id).cloned()
    }

    pub fn find_by_key(&self, key: &EntityKey) -> Option<SyncConflict> {
        self.conflicts
            .read()
            .values()
            .find(|c| c.entity_type == key.entity_type && c.entity_id == key.entity_id)
            .cloned()
    }

    pub fn contains_key(&self, key: &EntityKey) -> bool {
        self.find_by_key(key).is_some()
    }

    /// 按检测时间排序
    pub fn list(&self) -> Vec<SyncConflict> {
        let mut all: Vec<SyncConflict> = self.conflicts.read().values().cloned().collect();
        all.sort_by_key(|c| c.detected_at);
        all
    }

    pub fn keys(&self) -> Vec<EntityKey> {
        self.conflicts.read().values().map(|c| c.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.conflicts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_equal_timestamps_never_conflict() {
        let detector = ConflictDetector::default();
        for t in [0_i64, 1, 1_700_000_000_000, -5] {
            assert!(!detector.has_conflict(t, t, "a", "b"));
        }
    }

    #[test]
    fn test_beyond_tolerance_with_different_content() {
        let detector = ConflictDetector::from_millis(1000);
        let t = 1_700_000_000_000;
        assert!(detector.has_conflict(t, t + 1001, "a", "b"));
        assert!(detector.has_conflict(t + 1001, t, "a", "b"));
        assert!(!detector.has_conflict(t, t + 1000, "a", "b"));
    }

    #[test]
    fn test_equal_checksums_never_conflict() {
        let detector = ConflictDetector::from_millis(1000);
        assert!(!detector.has_conflict(0, 10_000_000, "same", "same"));
    }

    #[test]
    fn test_policies() {
        let key = EntityKey::new("Invoice", "1");
        let conflict = SyncConflict::new(&key, 1, 5000, "a".into(), "b".into(), vec![], "records/Invoice/1".into());

        assert_eq!(PreferRemote.choose(&conflict), ConflictResolution::UseRemote);
        assert_eq!(PreferLocal.choose(&conflict), ConflictResolution::UseLocal);

        let newest_wins = |c: &SyncConflict| {
            if c.local_modified > c.remote_modified {
                ConflictResolution::UseLocal
            } else {
                ConflictResolution::UseRemote
            }
        };
        assert_eq!(newest_wins.choose(&conflict), ConflictResolution::UseRemote);
    }

    #[test]
    fn test_merge_registry() {
        let registry = MergeRegistry::new();
        assert!(matches!(
            registry.merge("Invoice", b"a", b"b"),
            Err(SyncError::MergeUnavailable(_))
        ));

        registry.register("Invoice", |local: &[u8], remote: &[u8]| {
            let mut merged = local.to_vec();
            merged.extend_from_slice(remote);
            Ok(merged)
        });
        assert!(registry.contains("Invoice"));
        assert_eq!(registry.merge("Invoice", b"a", b"b").unwrap(), b"ab".to_vec());
    }

    #[tokio::test]
    async fn test_conflict_store_one_per_entity_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let key = EntityKey::new("Client", "7");
        let second_id;
        {
            let kv = KvStore::open(temp_dir.path()).await.unwrap();
            let store = ConflictStore::open(kv.clone()).unwrap();

            let first = SyncConflict::new(&key, 1, 5000, "a".into(), "b".into(), b"r1".to_vec(), "p".into());
            let second = SyncConflict::new(&key, 1, 9000, "a".into(), "c".into(), b"r2".to_vec(), "p".into());
            second_id = second.id.clone();
            store.insert(first).unwrap();
            store.insert(second).unwrap();

            assert_eq!(store.len(), 1);
            assert_eq!(store.find_by_key(&key).map(|c| c.remote_payload), Some(b"r2".to_vec()));
            kv.flush().await.unwrap();
        }

        let kv = KvStore::open(temp_dir.path()).await.unwrap();
        let store = ConflictStore::open(kv).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get(&second_id).is_some());

        store.record_override(&key, "c").unwrap();
        assert!(store.is_overridden(&key, "c"));
        assert!(!store.is_overridden(&key, "d"));

        assert!(store.remove(&second_id).unwrap().is_some());
        assert!(store.remove(&second_id).unwrap().is_none());
        assert!(store.is_empty());

        store.clear_override(&key).unwrap();
        assert!(!store.is_overridden(&key, "c"));
    }
}
