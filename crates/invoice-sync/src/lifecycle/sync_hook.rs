//! 同步模块生命周期 Hook
//!
//! 后台：暂停自动触发并把队列刷盘；前台：恢复并立即同步一次。

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::Result;
use crate::lifecycle::LifecycleHook;
use crate::orchestrator::SyncOrchestrator;

pub struct SyncLifecycleHook {
    orchestrator: SyncOrchestrator,
}

impl SyncLifecycleHook {
    pub fn new(orchestrator: SyncOrchestrator) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl LifecycleHook for SyncLifecycleHook {
    async fn on_background(&self) -> Result<()> {
        // 在途周期照常完成，只是不再自动触发新周期
        self.orchestrator.pause();
        self.orchestrator.flush().await?;
        info!(
            "Sync paused for background, {} records queued",
            self.orchestrator.queued_items_count().await
        );
        Ok(())
    }

    async fn on_foreground(&self) -> Result<()> {
        self.orchestrator.resume();
        let handle = self.orchestrator.sync_now();
        debug!("Sync resumed for foreground, cycle {}", handle.cycle_id());
        Ok(())
    }
}
