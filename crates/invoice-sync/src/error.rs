use serde::{Deserialize, Serialize};

/// Cloud Provider 返回的错误
///
/// 每个错误都带有是否可重试的语义：
/// - 可重试：网络不可用、服务不可用、限流、未知错误（下一个同步周期再试）
/// - 不可重试：未认证、配额超限、权限不足、数据无效、对象不存在
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ProviderError {
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("network unavailable")]
    NetworkUnavailable,
    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("service unavailable")]
    ServiceUnavailable,
    #[error("rate limited")]
    RateLimited,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("permission denied")]
    PermissionDenied,
    #[error("unknown provider error: {0}")]
    Unknown(String),
}

impl ProviderError {
    /// 判断是否可以在下一个周期重试
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::NetworkUnavailable => true,
            ProviderError::ServiceUnavailable => true,
            ProviderError::RateLimited => true,
            ProviderError::Unknown(_) => true,
            ProviderError::NotAuthenticated => false,
            ProviderError::QuotaExceeded => false,
            ProviderError::PermissionDenied => false,
            ProviderError::InvalidData(_) => false,
            ProviderError::NotFound(_) => false,
        }
    }

    /// 认证错误需要单独上报（“需要重新登录”），不能在循环里反复重试
    pub fn is_auth_error(&self) -> bool {
        matches!(self, ProviderError::NotAuthenticated)
    }

    /// 错误分类名称，用于事件和日志
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::NotAuthenticated => "not_authenticated",
            ProviderError::NetworkUnavailable => "network_unavailable",
            ProviderError::QuotaExceeded => "quota_exceeded",
            ProviderError::ServiceUnavailable => "service_unavailable",
            ProviderError::RateLimited => "rate_limited",
            ProviderError::NotFound(_) => "not_found",
            ProviderError::InvalidData(_) => "invalid_data",
            ProviderError::PermissionDenied => "permission_denied",
            ProviderError::Unknown(_) => "unknown",
        }
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match error.kind() {
            ErrorKind::NotFound => ProviderError::NotFound(error.to_string()),
            ErrorKind::PermissionDenied => ProviderError::PermissionDenied,
            ErrorKind::TimedOut | ErrorKind::Interrupted => ProviderError::NetworkUnavailable,
            ErrorKind::InvalidInput | ErrorKind::InvalidData => {
                ProviderError::InvalidData(error.to_string())
            }
            _ => ProviderError::Unknown(error.to_string()),
        }
    }
}

/// 同步核心的错误类型
///
/// 队列本地错误（持久化 I/O）是致命的，直接返回给调用方，不做重试。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("No cloud provider configured")]
    NoProvider,
    #[error("Local store error: {0}")]
    LocalStore(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("No merge function registered for entity type: {0}")]
    MergeUnavailable(String),
    #[error("Shutting down: {0}")]
    ShuttingDown(String),
    #[error("Sync cycle cancelled")]
    Cancelled,
}

impl From<sled::Error> for SyncError {
    fn from(error: sled::Error) -> Self {
        SyncError::Storage(error.to_string())
    }
}

impl From<bincode::Error> for SyncError {
    fn from(error: bincode::Error) -> Self {
        SyncError::Serialization(error.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        SyncError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(error: std::io::Error) -> Self {
        SyncError::Storage(error.to_string())
    }
}

impl SyncError {
    /// 获取 Provider 错误（如果这是一个 Provider 错误）
    pub fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            SyncError::Provider(e) => Some(e),
            _ => None,
        }
    }

    /// 判断是否是致命的本地存储错误
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Storage(_) | SyncError::Serialization(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
