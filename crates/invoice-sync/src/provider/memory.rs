//! 内存 Provider
//!
//! 进程内的远端存储，带推送通知。多个编排器共享同一个 `Arc<MemoryProvider>`
//! 即可模拟多台设备同步同一个账户。

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::debug;

use super::{
    normalize_remote_path, sort_newest_first, AccountStatus, CloudProvider, FileInfo, ProviderResult,
    ProviderSession, RemoteChange, RemoteChangeKind,
};
use crate::error::ProviderError;
use crate::utils::{now_millis, payload_checksum};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    modified_at: i64,
    checksum: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: BTreeMap<String, StoredObject>,
    /// 修改时间单调递增，同一毫秒内的两次写入也能区分先后
    last_modified_at: i64,
}

impl MemoryState {
    fn next_timestamp(&mut self) -> i64 {
        let ts = now_millis().max(self.last_modified_at + 1);
        self.last_modified_at = ts;
        ts
    }
}

/// 内存 Provider
#[derive(Debug)]
pub struct MemoryProvider {
    state: RwLock<MemoryState>,
    session: RwLock<ProviderSession>,
    changes: broadcast::Sender<RemoteChange>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::with_account_status(AccountStatus::Available)
    }

    pub fn with_account_status(status: AccountStatus) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            state: RwLock::new(MemoryState::default()),
            session: RwLock::new(ProviderSession::new(status)),
            changes,
        }
    }

    /// 模拟账户状态变化（登出、被限制等）
    pub fn set_account_status(&self, status: AccountStatus) {
        self.session.write().account_status = status;
    }

    /// 以指定修改时间直接写入远端，模拟其他设备的写入
    pub fn put_remote(&self, path: &str, data: &[u8], modified_at: i64) -> ProviderResult<()> {
        let path = normalize_remote_path(path)?;
        {
            let mut state = self.state.write();
            state.last_modified_at = state.last_modified_at.max(modified_at);
            state.objects.insert(
                path.clone(),
                StoredObject {
                    data: data.to_vec(),
                    modified_at,
                    checksum: payload_checksum(data),
                },
            );
        }
        self.notify(path, RemoteChangeKind::Upserted, modified_at);
        Ok(())
    }

    /// 当前远端内容（不检查会话）
    pub fn get_remote(&self, path: &str) -> Option<Vec<u8>> {
        self.state.read().objects.get(path).map(|o| o.data.clone())
    }

    pub fn object_count(&self) -> usize {
        self.state.read().objects.len()
    }

    fn notify(&self, path: String, kind: RemoteChangeKind, modified_at: i64) {
        // 没有订阅者时发送失败是正常情况
        let _ = self.changes.send(RemoteChange { path, kind, modified_at });
    }

    fn require_session(&self) -> ProviderResult<()> {
        self.session.write().require()
    }
}

#[async_trait]
impl CloudProvider for MemoryProvider {
    fn provider_name(&self) -> &str {
        "memory"
    }

    async fn account_status(&self) -> AccountStatus {
        self.session.read().account_status
    }

    fn is_authenticated(&self) -> bool {
        self.session.read().is_authenticated()
    }

    async fn authenticate(&self) -> ProviderResult<()> {
        let mut session = self.session.write();
        if let Some(err) = session.account_status.to_error() {
            session.authenticated = false;
            return Err(err);
        }
        session.authenticated = true;
        Ok(())
    }

    async fn upload(&self, path: &str, data: &[u8]) -> ProviderResult<()> {
        self.require_session()?;
        let path = normalize_remote_path(path)?;
        let modified_at = {
            let mut state = self.state.write();
            let modified_at = state.next_timestamp();
            state.objects.insert(
                path.clone(),
                StoredObject {
                    data: data.to_vec(),
                    modified_at,
                    checksum: payload_checksum(data),
                },
            );
            modified_at
        };
        debug!("Memory provider stored {} ({} bytes)", path, data.len());
        self.notify(path, RemoteChangeKind::Upserted, modified_at);
        Ok(())
    }

    async fn download(&self, path: &str) -> ProviderResult<Vec<u8>> {
        self.require_session()?;
        let path = normalize_remote_path(path)?;
        self.state
            .read()
            .objects
            .get(&path)
            .map(|o| o.data.clone())
            .ok_or(ProviderError::NotFound(path))
    }

    async fn delete(&self, path: &str) -> ProviderResult<()> {
        self.require_session()?;
        let path = normalize_remote_path(path)?;
        let removed = {
            let mut state = self.state.write();
            let removed = state.objects.remove(&path).is_some();
            removed.then(|| state.next_timestamp())
        };
        if let Some(modified_at) = removed {
            self.notify(path, RemoteChangeKind::Deleted, modified_at);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> ProviderResult<Vec<FileInfo>> {
        self.require_session()?;
        let prefix = prefix.trim_start_matches('/');
        let mut listing: Vec<FileInfo> = self
            .state
            .read()
            .objects
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, o)| FileInfo {
                path: path.clone(),
                size: o.data.len() as u64,
                modified_at: o.modified_at,
                checksum: o.checksum.clone(),
            })
            .collect();
        sort_newest_first(&mut listing);
        Ok(listing)
    }

    async fn subscribe_to_changes(&self) -> ProviderResult<Option<broadcast::Receiver<RemoteChange>>> {
        self.require_session()?;
        Ok(Some(self.changes.subscribe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_and_listing_order() {
        let provider = MemoryProvider::new();
        provider.authenticate().await.unwrap();

        provider.upload("records/Invoice/1", b"first").await.unwrap();
        provider.upload("records/Invoice/2", b"second").await.unwrap();
        provider.upload("records/Invoice/1", b"third").await.unwrap();

        assert_eq!(provider.download("records/Invoice/1").await.unwrap(), b"third".to_vec());
        let listing = provider.list("records/").await.unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].path, "records/Invoice/1");
        assert!(listing[0].modified_at > listing[1].modified_at);
    }

    #[tokio::test]
    async fn test_account_unavailable() {
        let provider = MemoryProvider::with_account_status(AccountStatus::NoAccount);
        assert_eq!(provider.authenticate().await, Err(ProviderError::NotAuthenticated));
        assert!(!provider.is_authenticated());

        provider.set_account_status(AccountStatus::Available);
        provider.authenticate().await.unwrap();
        assert!(provider.is_authenticated());

        provider.set_account_status(AccountStatus::Restricted);
        assert!(!provider.is_authenticated());
        assert_eq!(provider.download("records/x/1").await, Err(ProviderError::NotAuthenticated));
    }

    #[tokio::test]
    async fn test_push_notifications() {
        let provider = MemoryProvider::new();
        provider.authenticate().await.unwrap();
        let mut rx = provider.subscribe_to_changes().await.unwrap().unwrap();

        provider.put_remote("records/Client/9", b"remote", 1_000).unwrap();
        let change = rx.recv().await.unwrap();
        assert_eq!(change.path, "records/Client/9");
        assert_eq!(change.kind, RemoteChangeKind::Upserted);
        assert_eq!(change.modified_at, 1_000);

        provider.delete("records/Client/9").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, RemoteChangeKind::Deleted);

        // 删除不存在的对象不产生通知
        provider.delete("records/Client/9").await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
