//! 目录容器 Provider
//!
//! 把一个本地目录当作云容器使用（iCloud Drive 的 ubiquity container、
//! 挂载的网盘目录等）。系统负责目录与云端之间的传输，这里只做文件读写。
//!
//! - 写入先落临时文件再 rename，读者不会看到写了一半的对象
//! - 以 `.` 开头的文件和目录（临时文件、探针文件）不出现在 list 结果里

use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{
    normalize_remote_path, sort_newest_first, AccountStatus, CloudProvider, FileInfo, ProviderResult,
    ProviderSession,
};
use crate::error::ProviderError;
use crate::utils::{payload_checksum, time::system_time_millis};

const PROBE_FILE: &str = ".container-probe";

/// 基于目录的 Provider
#[derive(Debug)]
pub struct ContainerProvider {
    root: PathBuf,
    session: RwLock<ProviderSession>,
}

impl ContainerProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            session: RwLock::new(ProviderSession::new(AccountStatus::CouldNotDetermine)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> ProviderResult<PathBuf> {
        let relative = normalize_remote_path(path)?;
        Ok(self.root.join(relative))
    }

    fn require_session(&self) -> ProviderResult<()> {
        self.session.write().require()
    }

    async fn detect_account_status(&self) -> AccountStatus {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => {
                if meta.permissions().readonly() {
                    AccountStatus::Restricted
                } else {
                    AccountStatus::Available
                }
            }
            Ok(_) => AccountStatus::Restricted,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // 容器目录还没建好，但上级目录存在时可以在认证时创建
                match self.root.parent() {
                    Some(parent) if tokio::fs::metadata(parent).await.is_ok() => AccountStatus::Available,
                    _ => AccountStatus::NoAccount,
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => AccountStatus::Restricted,
            Err(_) => AccountStatus::CouldNotDetermine,
        }
    }
}

#[async_trait]
impl CloudProvider for ContainerProvider {
    fn provider_name(&self) -> &str {
        "container"
    }

    async fn account_status(&self) -> AccountStatus {
        let status = self.detect_account_status().await;
        self.session.write().account_status = status;
        status
    }

    fn is_authenticated(&self) -> bool {
        self.session.read().is_authenticated()
    }

    async fn authenticate(&self) -> ProviderResult<()> {
        let status = self.account_status().await;
        if let Some(err) = status.to_error() {
            warn!("Container {} unavailable: {}", self.root.display(), status);
            self.session.write().authenticated = false;
            return Err(err);
        }

        tokio::fs::create_dir_all(&self.root).await?;
        // 探针写入确认容器可写
        let probe = self.root.join(PROBE_FILE);
        tokio::fs::write(&probe, b"ok").await?;
        let _ = tokio::fs::remove_file(&probe).await;

        self.session.write().authenticated = true;
        info!("Container provider authenticated at {}", self.root.display());
        Ok(())
    }

    async fn upload(&self, path: &str, data: &[u8]) -> ProviderResult<()> {
        self.require_session()?;
        let target = self.resolve(path)?;
        let parent = target
            .parent()
            .ok_or_else(|| ProviderError::InvalidData(format!("no parent for path: {}", path)))?
            .to_path_buf();
        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ProviderError::InvalidData(format!("invalid file name: {}", path)))?;

        tokio::fs::create_dir_all(&parent).await?;
        let temp = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
        tokio::fs::write(&temp, data).await?;
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }

        debug!("Uploaded {} ({} bytes)", path, data.len());
        Ok(())
    }

    async fn download(&self, path: &str) -> ProviderResult<Vec<u8>> {
        self.require_session()?;
        let target = self.resolve(path)?;
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ProviderError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, path: &str) -> ProviderResult<()> {
        self.require_session()?;
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => {
                debug!("Deleted {}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> ProviderResult<Vec<FileInfo>> {
        self.require_session()?;
        let root = self.root.clone();
        let prefix = prefix.trim_start_matches('/').to_string();

        let listing = tokio::task::spawn_blocking(move || scan_container(&root, &prefix))
            .await
            .map_err(|e| ProviderError::Unknown(format!("list task failed: {}", e)))??;
        Ok(listing)
    }

    async fn stat(&self, path: &str) -> ProviderResult<Option<FileInfo>> {
        self.require_session()?;
        let target = self.resolve(path)?;
        let meta = match tokio::fs::metadata(&target).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let bytes = tokio::fs::read(&target).await?;
        Ok(Some(FileInfo {
            path: normalize_remote_path(path)?,
            size: meta.len(),
            modified_at: meta.modified().map(system_time_millis).unwrap_or(0),
            checksum: payload_checksum(&bytes),
        }))
    }
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

fn scan_container(root: &Path, prefix: &str) -> ProviderResult<Vec<FileInfo>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut listing = Vec::new();
    let walker = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e));
    for entry in walker {
        let entry = entry.map_err(|e| ProviderError::Unknown(format!("walk failed: {}", e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = match entry.path().strip_prefix(root) {
            Ok(rel) => rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/"),
            Err(_) => continue,
        };
        if !relative.starts_with(prefix) {
            continue;
        }

        let meta = entry
            .metadata()
            .map_err(|e| ProviderError::Unknown(format!("metadata failed: {}", e)))?;
        let bytes = std::fs::read(entry.path())?;
        listing.push(FileInfo {
            path: relative,
            size: meta.len(),
            modified_at: meta.modified().map(system_time_millis).unwrap_or(0),
            checksum: payload_checksum(&bytes),
        });
    }

    sort_newest_first(&mut listing);
    Ok(listing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn authenticated_provider(temp_dir: &TempDir) -> ContainerProvider {
        let provider = ContainerProvider::new(temp_dir.path().join("container"));
        provider.authenticate().await.unwrap();
        provider
    }

    #[tokio::test]
    async fn test_requires_authentication() {
        let temp_dir = TempDir::new().unwrap();
        let provider = ContainerProvider::new(temp_dir.path().join("container"));
        assert!(!provider.is_authenticated());
        assert_eq!(
            provider.upload("records/Invoice/1", b"x").await,
            Err(ProviderError::NotAuthenticated)
        );
    }

    #[tokio::test]
    async fn test_missing_parent_is_no_account() {
        let temp_dir = TempDir::new().unwrap();
        let provider = ContainerProvider::new(temp_dir.path().join("missing").join("container"));
        assert_eq!(provider.account_status().await, AccountStatus::NoAccount);
        assert_eq!(provider.authenticate().await, Err(ProviderError::NotAuthenticated));
    }

    #[tokio::test]
    async fn test_upload_download_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let provider = authenticated_provider(&temp_dir).await;

        provider.upload("records/Invoice/1", b"v1").await.unwrap();
        provider.upload("records/Invoice/1", b"v2").await.unwrap();
        assert_eq!(provider.download("records/Invoice/1").await.unwrap(), b"v2".to_vec());

        let info = provider.stat("records/Invoice/1").await.unwrap().unwrap();
        assert_eq!(info.size, 2);
        assert_eq!(info.checksum, payload_checksum(b"v2"));
    }

    #[tokio::test]
    async fn test_download_missing_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let provider = authenticated_provider(&temp_dir).await;
        assert!(matches!(
            provider.download("records/Invoice/404").await,
            Err(ProviderError::NotFound(_))
        ));
        assert_eq!(provider.stat("records/Invoice/404").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let provider = authenticated_provider(&temp_dir).await;

        provider.upload("records/Client/7", b"c").await.unwrap();
        provider.delete("records/Client/7").await.unwrap();
        provider.delete("records/Client/7").await.unwrap();
        assert_eq!(provider.stat("records/Client/7").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let temp_dir = TempDir::new().unwrap();
        let provider = authenticated_provider(&temp_dir).await;
        assert!(matches!(
            provider.upload("../outside", b"x").await,
            Err(ProviderError::InvalidData(_))
        ));
        assert!(matches!(
            provider.download("/etc/hosts").await,
            Err(ProviderError::InvalidData(_))
        ));
    }

    #[tokio::test]
    async fn test_list_filters_prefix_and_hidden_files() {
        let temp_dir = TempDir::new().unwrap();
        let provider = authenticated_provider(&temp_dir).await;

        provider.upload("records/Invoice/1", b"a").await.unwrap();
        provider.upload("records/Client/2", b"b").await.unwrap();
        provider.upload("other/x", b"c").await.unwrap();
        tokio::fs::write(provider.root().join("records").join(".stray.tmp"), b"tmp")
            .await
            .unwrap();

        let listing = provider.list("records").await.unwrap();
        let mut paths: Vec<_> = listing.iter().map(|i| i.path.clone()).collect();
        paths.sort();
        assert_eq!(paths, vec!["records/Client/2", "records/Invoice/1"]);

        for pair in listing.windows(2) {
            assert!(pair[0].modified_at >= pair[1].modified_at);
        }
    }
}
