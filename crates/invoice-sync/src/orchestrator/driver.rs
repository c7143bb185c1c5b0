//! 后台驱动任务：定时、本地变更、网络恢复与远端推送都会触发同步周期

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::Inner;
use crate::events::SyncEvent;
use crate::provider::RemoteChange;
use crate::utils::now_millis;

enum PushSignal {
    Changed(Option<RemoteChange>),
    Closed,
}

pub(super) async fn run(inner: Arc<Inner>) {
    info!(
        "Sync driver started (interval {}s)",
        inner.config.sync_interval_secs
    );

    let mut ticker = interval(inner.config.sync_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut network_events = inner.network.subscribe();
    let mut push = subscribe_push(&inner).await;

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if !inner.paused.load(Ordering::SeqCst) {
                    inner.trigger_cycle();
                }
            }
            _ = inner.change_signal.notified() => {
                if !inner.paused.load(Ordering::SeqCst) && inner.network.is_connected().await {
                    inner.trigger_cycle();
                }
            }
            event = network_events.recv() => match event {
                Ok(event) => {
                    if event.became_connected()
                        && !inner.paused.load(Ordering::SeqCst)
                        && inner.queue.active_len().await > 0
                    {
                        info!("Network restored ({:?}), draining sync queue", event.new_status);
                        inner.trigger_cycle();
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Sync driver lagged {} network events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            signal = next_push(&mut push) => match signal {
                PushSignal::Changed(change) => {
                    if let Some(change) = change {
                        debug!("Remote change pushed for {}", change.path);
                    }
                    if !inner.paused.load(Ordering::SeqCst) {
                        inner.trigger_cycle();
                    }
                }
                PushSignal::Closed => {
                    debug!("Remote change subscription closed, falling back to polling");
                    push = None;
                }
            },
            _ = inner.provider_signal.notified() => {
                push = subscribe_push(&inner).await;
            }
        }
    }

    info!("Sync driver stopped");
}

/// 订阅当前 Provider 的远端变更推送；不支持、失败或超时都退回轮询
async fn subscribe_push(inner: &Inner) -> Option<broadcast::Receiver<RemoteChange>> {
    let provider = inner.current_provider()?;
    // 认证完成后 provider_signal 会再次通知
    if !provider.is_authenticated() {
        return None;
    }

    let subscribed = tokio::select! {
        _ = inner.shutdown.cancelled() => return None,
        result = inner.call(provider.subscribe_to_changes()) => result,
    };
    match subscribed {
        Ok(Some(rx)) => {
            debug!("Subscribed to remote changes from {}", provider.provider_name());
            Some(rx)
        }
        Ok(None) => None,
        Err(e) => {
            warn!(
                "Push notifications unavailable from {}: {}, polling every {}s",
                provider.provider_name(),
                e,
                inner.config.sync_interval_secs
            );
            inner
                .emit(SyncEvent::PushUnavailable {
                    provider: provider.provider_name().to_string(),
                    reason: e.to_string(),
                    timestamp: now_millis(),
                })
                .await;
            None
        }
    }
}

async fn next_push(push: &mut Option<broadcast::Receiver<RemoteChange>>) -> PushSignal {
    let Some(rx) = push.as_mut() else {
        return std::future::pending().await;
    };
    match rx.recv().await {
        Ok(change) => PushSignal::Changed(Some(change)),
        // 丢失的通知合并成一次同步
        Err(RecvError::Lagged(_)) => PushSignal::Changed(None),
        Err(RecvError::Closed) => PushSignal::Closed,
    }
}
