//! Cloud Provider 抽象
//!
//! 同步核心只通过 `CloudProvider` 访问远端存储；具体后端（iCloud 容器目录、
//! 内存实现、将来的其他云存储）都实现同一个 trait，编排器在运行时切换。
//!
//! 远端对象路径规则：`<remote_root>/<entity_type>/<entity_id>`，见 `EntityKey::remote_path`。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

use crate::error::ProviderError;

pub mod container;
pub mod memory;

pub use container::ContainerProvider;
pub use memory::MemoryProvider;

/// Provider 操作结果
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// 远端对象元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// 相对 Provider 根目录的路径，`/` 分隔
    pub path: String,
    pub size: u64,
    /// 远端最后修改时间（UTC 毫秒）
    pub modified_at: i64,
    /// 内容 SHA-256（十六进制）
    pub checksum: String,
}

/// 云账户状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountStatus {
    /// 可用
    Available,
    /// 设备未登录云账户
    NoAccount,
    /// 被家长控制或管理策略限制
    Restricted,
    /// 无法判断
    CouldNotDetermine,
    /// 暂时不可用（例如账户切换中）
    TemporarilyUnavailable,
}

impl AccountStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, AccountStatus::Available)
    }

    /// 账户不可用时对应的 Provider 错误
    pub fn to_error(&self) -> Option<ProviderError> {
        match self {
            AccountStatus::Available => None,
            AccountStatus::NoAccount => Some(ProviderError::NotAuthenticated),
            AccountStatus::Restricted => Some(ProviderError::PermissionDenied),
            AccountStatus::CouldNotDetermine | AccountStatus::TemporarilyUnavailable => {
                Some(ProviderError::ServiceUnavailable)
            }
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccountStatus::Available => "available",
            AccountStatus::NoAccount => "no_account",
            AccountStatus::Restricted => "restricted",
            AccountStatus::CouldNotDetermine => "could_not_determine",
            AccountStatus::TemporarilyUnavailable => "temporarily_unavailable",
        };
        write!(f, "{}", name)
    }
}

/// 远端变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteChangeKind {
    Upserted,
    Deleted,
}

/// 远端推送的变更通知
///
/// 通知只是触发一次同步的信号；真正的变更内容仍通过 `list`/`download` 获取。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub path: String,
    pub kind: RemoteChangeKind,
    pub modified_at: i64,
}

/// 云存储后端
///
/// 实现要求：
/// - `upload` 覆盖同路径已有对象
/// - `delete` 幂等，对象不存在时返回成功
/// - `list` 按修改时间倒序（最新在前）
/// - 错误必须映射到 `ProviderError`，编排器依赖其可重试语义
#[async_trait]
pub trait CloudProvider: Send + Sync + fmt::Debug {
    /// 后端名称，用于日志和事件
    fn provider_name(&self) -> &str;

    /// 查询云账户状态
    async fn account_status(&self) -> AccountStatus;

    fn is_authenticated(&self) -> bool;

    /// 建立会话；账户不可用时返回对应错误
    async fn authenticate(&self) -> ProviderResult<()>;

    async fn upload(&self, path: &str, data: &[u8]) -> ProviderResult<()>;

    async fn download(&self, path: &str) -> ProviderResult<Vec<u8>>;

    async fn delete(&self, path: &str) -> ProviderResult<()>;

    async fn list(&self, prefix: &str) -> ProviderResult<Vec<FileInfo>>;

    /// 单个对象的元数据，不存在时返回 None
    async fn stat(&self, path: &str) -> ProviderResult<Option<FileInfo>> {
        let listing = self.list(path).await?;
        Ok(listing.into_iter().find(|info| info.path == path))
    }

    /// 订阅远端推送；后端不支持推送时返回 None，编排器退化为定时轮询
    async fn subscribe_to_changes(&self) -> ProviderResult<Option<broadcast::Receiver<RemoteChange>>> {
        Ok(None)
    }

    async fn unsubscribe_from_changes(&self) -> ProviderResult<()> {
        Ok(())
    }
}

/// 账户与会话状态，供各 Provider 实现复用
#[derive(Debug, Clone)]
pub(crate) struct ProviderSession {
    pub account_status: AccountStatus,
    pub authenticated: bool,
}

impl ProviderSession {
    pub fn new(account_status: AccountStatus) -> Self {
        Self {
            account_status,
            authenticated: false,
        }
    }

    /// 已认证且账户仍可用
    pub fn is_authenticated(&self) -> bool {
        self.authenticated && self.account_status.is_available()
    }

    /// 操作前检查；账户失效时同时清除会话
    pub fn require(&mut self) -> ProviderResult<()> {
        if !self.account_status.is_available() {
            self.authenticated = false;
        }
        if self.authenticated {
            Ok(())
        } else {
            Err(ProviderError::NotAuthenticated)
        }
    }
}

/// 校验并规范化远端路径
///
/// 拒绝空路径、绝对路径、`.`/`..` 段以及反斜杠，返回去掉首尾 `/` 的相对路径。
pub fn normalize_remote_path(path: &str) -> ProviderResult<String> {
    if path.starts_with('/') {
        return Err(ProviderError::InvalidData(format!("absolute path not allowed: {}", path)));
    }
    if path.contains('\\') || path.contains('\0') {
        return Err(ProviderError::InvalidData(format!("invalid character in path: {}", path)));
    }

    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ProviderError::InvalidData("empty path".to_string()));
    }
    for segment in trimmed.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(ProviderError::InvalidData(format!("invalid path segment in: {}", path)));
        }
    }
    Ok(trimmed.to_string())
}

/// list 结果按修改时间倒序，时间相同按路径排序保证稳定
pub(crate) fn sort_newest_first(listing: &mut [FileInfo]) {
    listing.sort_by(|a, b| b.modified_at.cmp(&a.modified_at).then_with(|| a.path.cmp(&b.path)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_remote_path() {
        assert_eq!(normalize_remote_path("records/Invoice/1").unwrap(), "records/Invoice/1");
        assert_eq!(normalize_remote_path("records/Invoice/").unwrap(), "records/Invoice");

        assert!(normalize_remote_path("").is_err());
        assert!(normalize_remote_path("/etc/passwd").is_err());
        assert!(normalize_remote_path("records/../secret").is_err());
        assert!(normalize_remote_path("records/./x").is_err());
        assert!(normalize_remote_path("records//x").is_err());
        assert!(normalize_remote_path("records\\x").is_err());
    }

    #[test]
    fn test_account_status_errors() {
        assert_eq!(AccountStatus::Available.to_error(), None);
        assert_eq!(AccountStatus::NoAccount.to_error(), Some(ProviderError::NotAuthenticated));
        assert_eq!(AccountStatus::Restricted.to_error(), Some(ProviderError::PermissionDenied));
        assert!(AccountStatus::TemporarilyUnavailable
            .to_error()
            .map(|e| e.is_retryable())
            .unwrap_or(false));
    }

    #[test]
    fn test_session_require() {
        let mut session = ProviderSession::new(AccountStatus::Available);
        assert_eq!(session.require(), Err(ProviderError::NotAuthenticated));

        session.authenticated = true;
        assert!(session.require().is_ok());
        assert!(session.is_authenticated());

        session.account_status = AccountStatus::NoAccount;
        assert_eq!(session.require(), Err(ProviderError::NotAuthenticated));
        assert!(!session.authenticated);
    }

    #[test]
    fn test_sort_newest_first() {
        let info = |path: &str, modified_at| FileInfo {
            path: path.to_string(),
            size: 0,
            modified_at,
            checksum: String::new(),
        };
        let mut listing = vec![info("a", 1), info("c", 3), info("b", 3)];
        sort_newest_first(&mut listing);
        let paths: Vec<_> = listing.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, vec!["b", "c", "a"]);
    }
}
