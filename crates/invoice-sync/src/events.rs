//! 事件系统模块 - 同步核心对外发布的状态变化
//!
//! 功能包括：
//! - 同步周期状态、整体同步状态变化
//! - 单条记录同步成功 / 失败 / 进入死信
//! - 冲突检测与解决
//! - 需要重新认证、Provider 切换
//! - 广播订阅 + 按事件类型注册的监听器

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::conflict::ConflictResolution;
use crate::error::ProviderError;
use crate::orchestrator::{CycleState, SyncStatus};
use crate::queue::ChangeOperation;
use crate::utils::now_millis;

/// 同步事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    CycleStateChanged {
        cycle_id: String,
        old_state: CycleState,
        new_state: CycleState,
        timestamp: i64,
    },
    StatusChanged {
        old_status: SyncStatus,
        new_status: SyncStatus,
        timestamp: i64,
    },
    RecordSynced {
        record_id: String,
        entity_type: String,
        entity_id: String,
        operation: ChangeOperation,
        timestamp: i64,
    },
    /// 失败的记录；`retryable == false` 表示已移出队列
    RecordFailed {
        record_id: String,
        entity_type: String,
        entity_id: String,
        error: ProviderError,
        retryable: bool,
        attempts: u32,
        timestamp: i64,
    },
    RecordDeadLettered {
        record_id: String,
        entity_type: String,
        entity_id: String,
        attempts: u32,
        timestamp: i64,
    },
    ConflictDetected {
        conflict_id: String,
        entity_type: String,
        entity_id: String,
        timestamp: i64,
    },
    ConflictResolved {
        conflict_id: String,
        entity_type: String,
        entity_id: String,
        resolution: ConflictResolution,
        timestamp: i64,
    },
    RemoteChangeApplied {
        entity_type: String,
        entity_id: String,
        timestamp: i64,
    },
    ReauthenticationRequired {
        provider: String,
        reason: ProviderError,
        timestamp: i64,
    },
    ProviderChanged {
        provider: Option<String>,
        timestamp: i64,
    },
    /// 推送订阅失败，退化为定时轮询
    PushUnavailable {
        provider: String,
        reason: String,
        timestamp: i64,
    },
}

impl SyncEvent {
    /// 获取事件类型名称
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::CycleStateChanged { .. } => "cycle_state_changed",
            SyncEvent::StatusChanged { .. } => "status_changed",
            SyncEvent::RecordSynced { .. } => "record_synced",
            SyncEvent::RecordFailed { .. } => "record_failed",
            SyncEvent::RecordDeadLettered { .. } => "record_dead_lettered",
            SyncEvent::ConflictDetected { .. } => "conflict_detected",
            SyncEvent::ConflictResolved { .. } => "conflict_resolved",
            SyncEvent::RemoteChangeApplied { .. } => "remote_change_applied",
            SyncEvent::ReauthenticationRequired { .. } => "reauthentication_required",
            SyncEvent::ProviderChanged { .. } => "provider_changed",
            SyncEvent::PushUnavailable { .. } => "push_unavailable",
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            SyncEvent::CycleStateChanged { timestamp, .. }
            | SyncEvent::StatusChanged { timestamp, .. }
            | SyncEvent::RecordSynced { timestamp, .. }
            | SyncEvent::RecordFailed { timestamp, .. }
            | SyncEvent::RecordDeadLettered { timestamp, .. }
            | SyncEvent::ConflictDetected { timestamp, .. }
            | SyncEvent::ConflictResolved { timestamp, .. }
            | SyncEvent::RemoteChangeApplied { timestamp, .. }
            | SyncEvent::ReauthenticationRequired { timestamp, .. }
            | SyncEvent::ProviderChanged { timestamp, .. }
            | SyncEvent::PushUnavailable { timestamp, .. } => *timestamp,
        }
    }

    /// 事件涉及的实体（entity_type, entity_id）
    pub fn entity(&self) -> Option<(&str, &str)> {
        match self {
            SyncEvent::RecordSynced { entity_type, entity_id, .. }
            | SyncEvent::RecordFailed { entity_type, entity_id, .. }
            | SyncEvent::RecordDeadLettered { entity_type, entity_id, .. }
            | SyncEvent::ConflictDetected { entity_type, entity_id, .. }
            | SyncEvent::ConflictResolved { entity_type, entity_id, .. }
            | SyncEvent::RemoteChangeApplied { entity_type, entity_id, .. } => {
                Some((entity_type.as_str(), entity_id.as_str()))
            }
            _ => None,
        }
    }

    /// 需要呈现给用户的错误类事件
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            SyncEvent::RecordFailed { retryable: false, .. }
                | SyncEvent::RecordDeadLettered { .. }
                | SyncEvent::ReauthenticationRequired { .. }
        )
    }

    pub(crate) fn record_failed(
        record_id: &str,
        entity_type: &str,
        entity_id: &str,
        error: ProviderError,
        retryable: bool,
        attempts: u32,
    ) -> Self {
        SyncEvent::RecordFailed {
            record_id: record_id.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            error,
            retryable,
            attempts,
            timestamp: now_millis(),
        }
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 监听器数量
    pub listener_count: usize,
    /// 最后事件时间
    pub last_event_time: Option<i64>,
}

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    listeners: Arc<RwLock<HashMap<String, Vec<EventListener>>>>,
    stats: Arc<RwLock<EventStats>>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: SyncEvent) {
        debug!("Emitting sync event: {}", event.event_type());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 没有 UI 订阅时 send 会失败，属正常情况
        if self.sender.send(event.clone()).is_err() {
            debug!("No active receivers for {}", event.event_type());
        }

        let listeners = self.listeners.read().await;
        if let Some(typed) = listeners.get(event.event_type()) {
            for listener in typed {
                listener(&event);
            }
        }
        if let Some(general) = listeners.get("*") {
            for listener in general {
                listener(&event);
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 添加事件监听器，`"*"` 监听全部事件
    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners.entry(event_type.to_string()).or_default().push(Box::new(listener));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added sync event listener for: {}", event_type);
    }

    pub async fn clear_listeners(&self) {
        self.listeners.write().await.clear();
        self.stats.write().await.listener_count = 0;
    }

    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }
}
