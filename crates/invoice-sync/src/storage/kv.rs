//! KV 存储模块 - 基于 sled 的同步状态持久化
//!
//! 本模块提供：
//! - 按名称划分的 Tree（同步队列、冲突记录各占一个）
//! - bincode 编码的值
//! - 原子批量写入（合并记录时删除旧记录 + 写入新记录）
//!
//! 所有写操作在返回前落到 sled；进程退出时不会丢失只存在于内存里的同步状态。

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use std::path::Path;
use tracing::{debug, info};

use crate::error::{Result, SyncError};

/// KV 存储组件
#[derive(Debug, Clone)]
pub struct KvStore {
    db: Db,
}

impl KvStore {
    /// 打开（或创建）持久化数据库
    ///
    /// 同一目录的旧实例刚释放文件锁时 sled 会短暂打开失败，这里带退避重试。
    pub async fn open(base_path: &Path) -> Result<Self> {
        let path = base_path.join("sync_state");
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| SyncError::Storage(format!("failed to create sync state dir: {}", e)))?;

        const MAX_OPEN_RETRIES: u32 = 5;
        const RETRY_DELAY_MS: u64 = 100;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&path) {
                Ok(db) => {
                    info!("Opened sync state db at {}", path.display());
                    return Ok(Self { db });
                }
                Err(e) => {
                    let msg = e.to_string();
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    last_err = Some(e);
                    if !is_lock || attempt + 1 == MAX_OPEN_RETRIES {
                        break;
                    }
                    let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                    debug!("sync state db locked, retrying in {}ms", delay_ms);
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                }
            }
        }

        Err(SyncError::Storage(
            last_err
                .map(|e| format!("failed to open sync state db: {}", e))
                .unwrap_or_else(|| "failed to open sync state db".to_string()),
        ))
    }

    /// 临时数据库（进程结束即删除），用于测试和无 data_dir 的场景
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn tree(&self, name: &str) -> Result<Tree> {
        Ok(self.db.open_tree(name)?)
    }

    pub fn encode<V: Serialize>(value: &V) -> Result<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    pub fn decode<V: DeserializeOwned>(bytes: &[u8]) -> Result<V> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn put<V: Serialize>(&self, tree: &str, key: &str, value: &V) -> Result<()> {
        let bytes = Self::encode(value)?;
        self.tree(tree)?.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    /// 删除键，返回键之前是否存在
    pub fn remove(&self, tree: &str, key: &str) -> Result<bool> {
        Ok(self.tree(tree)?.remove(key.as_bytes())?.is_some())
    }

    /// 读取 Tree 中的全部值；无法解码的值视为数据损坏直接报错
    pub fn scan<V: DeserializeOwned>(&self, tree: &str) -> Result<Vec<(String, V)>> {
        let tree = self.tree(tree)?;
        let mut results = Vec::with_capacity(tree.len());
        for item in tree.iter() {
            let (key, bytes) = item?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| SyncError::Storage(format!("invalid key in sync state db: {}", e)))?;
            results.push((key, Self::decode(&bytes)?));
        }
        Ok(results)
    }

    /// 原子地应用一组写入与删除
    pub fn apply_batch(&self, tree: &str, batch: KvBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.tree(tree)?.apply_batch(batch.inner)?;
        Ok(())
    }

    /// 刷盘
    pub async fn flush(&self) -> Result<()> {
        let bytes = self.db.flush_async().await?;
        debug!("Flushed {} bytes of sync state", bytes);
        Ok(())
    }
}

/// 批量写入
#[derive(Default)]
pub struct KvBatch {
    inner: sled::Batch,
    ops: usize,
}

impl KvBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<V: Serialize>(&mut self, key: &str, value: &V) -> Result<()> {
        let bytes = KvStore::encode(value)?;
        self.inner.insert(key.as_bytes(), bytes);
        self.ops += 1;
        Ok(())
    }

    pub fn remove(&mut self, key: &str) {
        self.inner.remove(key.as_bytes());
        self.ops += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.ops == 0
    }
}

/// Tree 名称常量
pub mod trees {
    /// 同步队列
    pub const SYNC_QUEUE: &str = "sync_queue";
    /// 未解决的冲突
    pub const SYNC_CONFLICTS: &str = "sync_conflicts";
    /// 以本地版本解决、尚未上传的冲突
    pub const CONFLICT_OVERRIDES: &str = "conflict_overrides";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        bytes: Vec<u8>,
    }

    #[tokio::test]
    async fn test_put_scan_remove() {
        let store = KvStore::temporary().unwrap();
        let value = Sample { name: "a".into(), bytes: vec![1, 2, 3] };

        store.put("t", "k1", &value).unwrap();
        assert_eq!(store.scan::<Sample>("t").unwrap(), vec![("k1".to_string(), value)]);
        assert!(store.remove("t", "k1").unwrap());
        assert!(!store.remove("t", "k1").unwrap());
        assert!(store.scan::<Sample>("t").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_is_atomic_unit() {
        let store = KvStore::temporary().unwrap();
        store.put("t", "old", &Sample { name: "old".into(), bytes: vec![] }).unwrap();

        let mut batch = KvBatch::new();
        batch.remove("old");
        batch.put("new", &Sample { name: "new".into(), bytes: vec![9] }).unwrap();
        store.apply_batch("t", batch).unwrap();

        let all: Vec<(String, Sample)> = store.scan("t").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "new");
    }

    #[tokio::test]
    async fn test_reopen_persists() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = KvStore::open(temp_dir.path()).await.unwrap();
            store.put(trees::SYNC_QUEUE, "r1", &Sample { name: "r1".into(), bytes: vec![7] }).unwrap();
            store.flush().await.unwrap();
        }

        let store = KvStore::open(temp_dir.path()).await.unwrap();
        let values: Vec<(String, Sample)> = store.scan(trees::SYNC_QUEUE).unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].1.bytes, vec![7]);
    }
}
