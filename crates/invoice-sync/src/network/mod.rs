use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::Result;
use crate::utils::now_millis;

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
    /// 连接中
    Connecting,
    /// 网络受限（蜂窝数据受限、低数据模式等，仍可同步）
    Limited,
}

impl NetworkStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, NetworkStatus::Online | NetworkStatus::Limited)
    }
}

/// 网络状态变化事件
#[derive(Debug, Clone)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: i64,
}

impl NetworkStatusEvent {
    /// 从断开变为连通
    pub fn became_connected(&self) -> bool {
        !self.old_status.is_connected() && self.new_status.is_connected()
    }
}

/// 网络状态监听器 trait（由平台层实现，如 iOS NWPathMonitor）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn get_current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 网络监控管理器
#[derive(Debug)]
pub struct NetworkMonitor {
    listener: Option<Arc<dyn NetworkStatusListener>>,
    status_sender: broadcast::Sender<NetworkStatusEvent>,
    current_status: Arc<RwLock<NetworkStatus>>,
}

impl NetworkMonitor {
    pub fn new(listener: Arc<dyn NetworkStatusListener>) -> Self {
        Self::build(Some(listener), NetworkStatus::Offline)
    }

    /// 不接平台监听器，状态完全由 `set_status` 驱动
    pub fn manual(initial: NetworkStatus) -> Self {
        Self::build(None, initial)
    }

    fn build(listener: Option<Arc<dyn NetworkStatusListener>>, initial: NetworkStatus) -> Self {
        let (status_sender, _) = broadcast::channel(100);
        Self {
            listener,
            status_sender,
            current_status: Arc::new(RwLock::new(initial)),
        }
    }

    /// 启动网络监控
    ///
    /// 先读取平台当前状态，再转发后续变化。
    pub async fn start(&self) -> Result<()> {
        let Some(listener) = self.listener.clone() else {
            return Ok(());
        };

        let initial = listener.get_current_status().await;
        self.set_status(initial).await;

        let mut receiver = listener.start_monitoring().await?;
        let status_sender = self.status_sender.clone();
        let current_status = self.current_status.clone();

        tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                {
                    let mut status = current_status.write().await;
                    *status = event.new_status;
                }
                debug!("Network status {:?} -> {:?}", event.old_status, event.new_status);
                let _ = status_sender.send(event);
            }
        });

        info!("Network monitor started, initial status {:?}", initial);
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(listener) = &self.listener {
            listener.stop_monitoring().await;
        }
    }

    /// 获取当前网络状态
    pub async fn get_status(&self) -> NetworkStatus {
        *self.current_status.read().await
    }

    /// 手动设置网络状态；状态未变化时不广播
    pub async fn set_status(&self, new_status: NetworkStatus) {
        let old_status = {
            let mut status = self.current_status.write().await;
            std::mem::replace(&mut *status, new_status)
        };
        if old_status == new_status {
            return;
        }

        let event = NetworkStatusEvent {
            old_status,
            new_status,
            timestamp: now_millis(),
        };
        let _ = self.status_sender.send(event);
    }

    /// 订阅网络状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.status_sender.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        self.get_status().await.is_connected()
    }

    /// 注册状态变化回调，返回转发任务的句柄（abort 即取消注册）
    pub fn on_change<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(&NetworkStatusEvent) + Send + Sync + 'static,
    {
        let mut receiver = self.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => callback(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Network callback lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// 由平台层推送状态的监听器
///
/// 平台回调里调用 `update`，监控器即可收到变化。
#[derive(Debug)]
pub struct ManualNetworkListener {
    status: RwLock<NetworkStatus>,
    sender: broadcast::Sender<NetworkStatusEvent>,
}

impl ManualNetworkListener {
    pub fn new(initial: NetworkStatus) -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            status: RwLock::new(initial),
            sender,
        }
    }

    pub async fn update(&self, new_status: NetworkStatus) {
        let old_status = {
            let mut status = self.status.write().await;
            std::mem::replace(&mut *status, new_status)
        };
        if old_status != new_status {
            let _ = self.sender.send(NetworkStatusEvent {
                old_status,
                new_status,
                timestamp: now_millis(),
            });
        }
    }
}

#[async_trait]
impl NetworkStatusListener for ManualNetworkListener {
    async fn get_current_status(&self) -> NetworkStatus {
        *self.status.read().await
    }

    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>> {
        Ok(self.sender.subscribe())
    }

    async fn stop_monitoring(&self) {}
}
