//! 生命周期管理
//!
//! App 前后台切换时统一通知各模块；同步编排器通过 `SyncLifecycleHook` 接入。

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::Result;

/// 生命周期回调 Hook
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// App 切换到后台时调用
    async fn on_background(&self) -> Result<()>;

    /// App 切换到前台时调用
    async fn on_foreground(&self) -> Result<()>;
}

/// 生命周期管理器
#[derive(Default)]
pub struct LifecycleManager {
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    pub fn register_hook(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push(hook);
        info!("Lifecycle hook registered: {} total", self.hooks.len());
    }

    /// 通知所有 Hook：App 切换到后台
    ///
    /// 按注册顺序执行；某个 Hook 失败不影响后续 Hook，最后返回第一个错误
    pub async fn notify_background(&self) -> Result<()> {
        info!("App entering background");
        let mut errors = Vec::new();
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_background().await {
                warn!("Lifecycle hook #{} failed on background: {}", index, e);
                errors.push(e);
            }
        }
        Self::first_error(errors)
    }

    /// 通知所有 Hook：App 切换到前台
    pub async fn notify_foreground(&self) -> Result<()> {
        info!("App entering foreground");
        let mut errors = Vec::new();
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_foreground().await {
                warn!("Lifecycle hook #{} failed on foreground: {}", index, e);
                errors.push(e);
            }
        }
        Self::first_error(errors)
    }

    fn first_error(errors: Vec<crate::error::SyncError>) -> Result<()> {
        if errors.len() > 1 {
            warn!("{} lifecycle hooks failed", errors.len());
        }
        match errors.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(()),
        }
    }
}

mod sync_hook;
pub use sync_hook::SyncLifecycleHook;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHook {
        background: AtomicUsize,
        foreground: AtomicUsize,
        fail_with: Option<SyncError>,
    }

    #[async_trait]
    impl LifecycleHook for CountingHook {
        async fn on_background(&self) -> Result<()> {
            self.background.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }

        async fn on_foreground(&self) -> Result<()> {
            self.foreground.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_all_hooks_run_despite_failure() {
        let failing = Arc::new(CountingHook {
            fail_with: Some(SyncError::Storage("disk full".into())),
            ..Default::default()
        });
        let healthy = Arc::new(CountingHook::default());

        let mut manager = LifecycleManager::new();
        manager.register_hook(failing.clone());
        manager.register_hook(healthy.clone());
        assert_eq!(manager.hook_count(), 2);

        let result = manager.notify_background().await;
        assert_eq!(result, Err(SyncError::Storage("disk full".into())));
        assert_eq!(failing.background.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.background.load(Ordering::SeqCst), 1);

        manager.notify_foreground().await.unwrap();
        assert_eq!(healthy.foreground.load(Ordering::SeqCst), 1);
    }
}
