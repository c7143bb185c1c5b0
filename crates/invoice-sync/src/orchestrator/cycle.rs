//! 单个同步周期的执行
//!
//! 顺序：检查网络 → 确认认证 → 扫描远端变更 → 排空队列。
//! 远端扫描放在排空之前，避免把冲突的本地记录直接覆盖到更新的远端版本上。

use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::state::{CycleReport, CycleState, SkipReason, SyncStatus};
use super::Inner;
use crate::conflict::SyncConflict;
use crate::entity::{EntitySnapshot, EntitySyncStatus};
use crate::error::{ProviderError, Result};
use crate::events::SyncEvent;
use crate::provider::{CloudProvider, FileInfo};
use crate::queue::{AttemptOutcome, ChangeRecord, EntityKey, FailureClass, SyncBatch};
use crate::utils::{now_millis, payload_checksum};

/// 远端扫描单个对象后的走向
enum RemoteStep {
    Continue,
    /// 认证失败，停止本周期的 Provider 调用
    Halt,
}

/// 单条记录的投递结果
enum DeliveryOutcome {
    Delivered,
    /// 周期已取消或已停止，没有发起调用
    Skipped,
    RetryScheduled { error: ProviderError, attempts: u32 },
    DeadLettered { error: ProviderError, attempts: u32 },
    Rejected(ProviderError),
    AuthFailed(ProviderError),
}

struct Delivery {
    key: EntityKey,
    called_provider: bool,
    outcome: DeliveryOutcome,
}

impl Inner {
    #[instrument(skip(self, report, cancel), fields(cycle_id = %report.cycle_id))]
    pub(super) async fn run_cycle(&self, mut report: CycleReport, cancel: &CancellationToken) -> Result<CycleReport> {
        self.metrics.write().cycles_started += 1;
        let previous_status = self.set_status(SyncStatus::Syncing).await;
        debug!("Sync cycle started");

        let result = self.execute_cycle(&mut report, cancel).await;
        self.transition(&mut report, CycleState::Idle).await;
        report.finished_at = Some(now_millis());

        let final_status = match &result {
            Err(e) => {
                error!("Sync cycle aborted: {}", e);
                self.observer.write().last_error = Some(e.to_string());
                SyncStatus::Error
            }
            Ok(()) if report.has_surfaced_errors() => SyncStatus::Error,
            Ok(()) if report.was_skipped() || report.cancelled => match previous_status {
                SyncStatus::Syncing => SyncStatus::Idle,
                other => other,
            },
            Ok(()) => {
                self.observer.write().last_error = None;
                SyncStatus::Idle
            }
        };
        self.set_status(final_status).await;
        self.metrics.write().absorb(&report);

        info!(
            "Sync cycle finished: synced={} downloaded={} conflicts={} retryable={} fatal={} skipped={:?}",
            report.synced,
            report.downloaded,
            report.conflicts_detected,
            report.retryable_failures,
            report.fatal_failures,
            report.skipped
        );
        result.map(|()| report)
    }

    async fn transition(&self, report: &mut CycleReport, new_state: CycleState) {
        let old_state = {
            let mut observer = self.observer.write();
            if observer.cycle_state == new_state {
                return;
            }
            std::mem::replace(&mut observer.cycle_state, new_state)
        };
        report.transitions.push(new_state);
        debug!("Cycle state {} -> {}", old_state, new_state);
        self.emit(SyncEvent::CycleStateChanged {
            cycle_id: report.cycle_id.clone(),
            old_state,
            new_state,
            timestamp: now_millis(),
        })
        .await;
    }

    async fn execute_cycle(&self, report: &mut CycleReport, cancel: &CancellationToken) -> Result<()> {
        self.transition(report, CycleState::CheckingNetwork).await;

        if cancel.is_cancelled() {
            report.cancelled = true;
            if self.shutdown.is_cancelled() {
                report.skipped = Some(SkipReason::ShuttingDown);
            }
            return Ok(());
        }
        if !self.network.is_connected().await {
            info!("Network unavailable, skipping sync cycle");
            report.skipped = Some(SkipReason::Offline);
            return Ok(());
        }
        let Some(provider) = self.current_provider() else {
            debug!("No cloud provider configured, skipping sync cycle");
            report.skipped = Some(SkipReason::NoProvider);
            return Ok(());
        };
        if self.needs_reauth.load(Ordering::SeqCst) {
            debug!("Waiting for re-authentication, skipping sync cycle");
            report.skipped = Some(SkipReason::AuthenticationRequired);
            report.authentication_required = true;
            return Ok(());
        }
        if !self.ensure_authenticated(&provider, report).await {
            return Ok(());
        }

        self.transition(report, CycleState::Draining).await;
        let halted = AtomicBool::new(false);
        if self.config.detect_remote_changes {
            self.scan_remote(&provider, report, cancel, &halted).await?;
        }
        if !halted.load(Ordering::SeqCst) {
            self.drain_queue(&provider, report, cancel, &halted).await?;
        }
        Ok(())
    }

    async fn ensure_authenticated(&self, provider: &Arc<dyn CloudProvider>, report: &mut CycleReport) -> bool {
        if provider.is_authenticated() {
            return true;
        }
        report.provider_calls += 1;
        match self.call(provider.authenticate()).await {
            Ok(()) => {
                info!("Authenticated with {}", provider.provider_name());
                // 认证完成后驱动任务才能订阅推送
                self.provider_signal.notify_one();
                true
            }
            Err(e) if e.is_retryable() => {
                warn!("Authentication with {} failed, will retry: {}", provider.provider_name(), e);
                report.errors.push(("authenticate".to_string(), e));
                false
            }
            Err(e) => {
                self.require_reauthentication(provider.as_ref(), e, report).await;
                false
            }
        }
    }

    async fn require_reauthentication(&self, provider: &dyn CloudProvider, error: ProviderError, report: &mut CycleReport) {
        report.authentication_required = true;
        report.errors.push(("authenticate".to_string(), error.clone()));
        self.observer.write().last_error = Some(format!("{} requires sign-in: {}", provider.provider_name(), error));

        if !self.needs_reauth.swap(true, Ordering::SeqCst) {
            warn!("{} rejected credentials ({}), halting sync until re-authentication", provider.provider_name(), error);
            self.emit(SyncEvent::ReauthenticationRequired {
                provider: provider.provider_name().to_string(),
                reason: error,
                timestamp: now_millis(),
            })
            .await;
        }
    }

    // ========== 远端变更 ==========

    async fn scan_remote(
        &self,
        provider: &Arc<dyn CloudProvider>,
        report: &mut CycleReport,
        cancel: &CancellationToken,
        halted: &AtomicBool,
    ) -> Result<()> {
        let root = self.config.remote_root.trim_matches('/');
        report.provider_calls += 1;
        let listing = match self.call(provider.list(root)).await {
            Ok(listing) => listing,
            Err(e) if e.is_auth_error() => {
                halted.store(true, Ordering::SeqCst);
                self.require_reauthentication(provider.as_ref(), e, report).await;
                return Ok(());
            }
            Err(e) => {
                warn!("Listing remote changes failed: {}", e);
                report.errors.push(("list".to_string(), e));
                return Ok(());
            }
        };

        for info in listing {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let Some(key) = EntityKey::from_remote_path(&self.config.remote_root, &info.path) else {
                continue;
            };
            if let RemoteStep::Halt = self.examine_remote(provider, &key, &info, report).await? {
                halted.store(true, Ordering::SeqCst);
                break;
            }
        }
        Ok(())
    }

    async fn examine_remote(
        &self,
        provider: &Arc<dyn CloudProvider>,
        key: &EntityKey,
        info: &FileInfo,
        report: &mut CycleReport,
    ) -> Result<RemoteStep> {
        if self.conflicts.contains_key(key) {
            return Ok(RemoteStep::Continue);
        }

        let local = self.store.fetch_entity(&key.entity_type, &key.entity_id).await?;
        let queued = self.queue.contains_entity(key).await;
        let Some(local) = local else {
            if queued {
                debug!("Local delete for {} still queued, ignoring remote copy", key);
                return Ok(RemoteStep::Continue);
            }
            return self.apply_remote(provider, key, info, None, report).await;
        };

        let local_checksum = local.checksum();
        if local_checksum == info.checksum {
            if !queued && local.sync_status != EntitySyncStatus::Synced {
                self.store
                    .mark_status(&key.entity_type, &key.entity_id, EntitySyncStatus::Synced)
                    .await?;
            }
            return Ok(RemoteStep::Continue);
        }
        if info.modified_at <= local.last_modified {
            return Ok(RemoteStep::Continue);
        }

        let has_local_changes =
            queued || local.sync_status.needs_sync() || local.sync_status == EntitySyncStatus::Uploading;
        if !has_local_changes {
            return self.apply_remote(provider, key, info, Some(local.sync_status), report).await;
        }
        if self.conflicts.is_overridden(key, &info.checksum) {
            debug!("Remote version of {} already resolved in favour of local", key);
            return Ok(RemoteStep::Continue);
        }
        if !self
            .detector
            .has_conflict(local.last_modified, info.modified_at, &local_checksum, &info.checksum)
        {
            debug!("Remote change for {} within tolerance, local version wins", key);
            return Ok(RemoteStep::Continue);
        }

        self.flag_conflict(provider, key, info, &local, local_checksum, report).await
    }

    async fn apply_remote(
        &self,
        provider: &Arc<dyn CloudProvider>,
        key: &EntityKey,
        info: &FileInfo,
        prior_status: Option<EntitySyncStatus>,
        report: &mut CycleReport,
    ) -> Result<RemoteStep> {
        self.transition(report, CycleState::Downloading).await;
        if prior_status.is_some() {
            self.store
                .mark_status(&key.entity_type, &key.entity_id, EntitySyncStatus::Downloading)
                .await?;
        }

        report.provider_calls += 1;
        let data = match self.call(provider.download(&info.path)).await {
            Ok(data) => data,
            Err(e) => {
                if let Some(status) = prior_status {
                    self.store.mark_status(&key.entity_type, &key.entity_id, status).await?;
                }
                return Ok(self.remote_failure(provider, key, e, report).await);
            }
        };

        self.store
            .apply_remote_payload(&key.entity_type, &key.entity_id, &data)
            .await?;
        self.store
            .mark_status(&key.entity_type, &key.entity_id, EntitySyncStatus::Synced)
            .await?;
        report.downloaded += 1;
        debug!("Applied remote version of {} ({} bytes)", key, data.len());
        self.emit(SyncEvent::RemoteChangeApplied {
            entity_type: key.entity_type.clone(),
            entity_id: key.entity_id.clone(),
            timestamp: now_millis(),
        })
        .await;
        Ok(RemoteStep::Continue)
    }

    async fn flag_conflict(
        &self,
        provider: &Arc<dyn CloudProvider>,
        key: &EntityKey,
        info: &FileInfo,
        local: &EntitySnapshot,
        local_checksum: String,
        report: &mut CycleReport,
    ) -> Result<RemoteStep> {
        self.transition(report, CycleState::ResolvingConflict).await;

        report.provider_calls += 1;
        let remote_payload = match self.call(provider.download(&info.path)).await {
            Ok(data) => data,
            Err(e) => return Ok(self.remote_failure(provider, key, e, report).await),
        };
        let remote_checksum = payload_checksum(&remote_payload);
        if remote_checksum == local_checksum {
            return Ok(RemoteStep::Continue);
        }

        let conflict = SyncConflict::new(
            key,
            local.last_modified,
            info.modified_at,
            local_checksum,
            remote_checksum,
            remote_payload,
            info.path.clone(),
        );
        let conflict_id = conflict.id.clone();
        self.conflicts.insert(conflict)?;
        self.store
            .mark_status(&key.entity_type, &key.entity_id, EntitySyncStatus::Conflicted)
            .await?;
        report.conflicts_detected += 1;

        warn!(
            "Conflict detected for {}: local modified {} vs remote {}",
            key, local.last_modified, info.modified_at
        );
        self.emit(SyncEvent::ConflictDetected {
            conflict_id,
            entity_type: key.entity_type.clone(),
            entity_id: key.entity_id.clone(),
            timestamp: now_millis(),
        })
        .await;
        Ok(RemoteStep::Continue)
    }

    async fn remote_failure(
        &self,
        provider: &Arc<dyn CloudProvider>,
        key: &EntityKey,
        error: ProviderError,
        report: &mut CycleReport,
    ) -> RemoteStep {
        match error {
            ProviderError::NotFound(_) => {
                debug!("Remote copy of {} vanished before download", key);
                RemoteStep::Continue
            }
            e if e.is_auth_error() => {
                self.require_reauthentication(provider.as_ref(), e, report).await;
                RemoteStep::Halt
            }
            e => {
                warn!("Downloading {} failed: {}", key, e);
                report.errors.push((key.to_string(), e));
                RemoteStep::Continue
            }
        }
    }

    // ========== 排空队列 ==========

    async fn drain_queue(
        &self,
        provider: &Arc<dyn CloudProvider>,
        report: &mut CycleReport,
        cancel: &CancellationToken,
        halted: &AtomicBool,
    ) -> Result<()> {
        // 冲突中的实体冻结；本周期失败或跳过的实体不再重复出队
        let mut excluded: HashSet<EntityKey> = self.conflicts.keys().into_iter().collect();

        loop {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if halted.load(Ordering::SeqCst) {
                break;
            }

            let records = self
                .queue
                .dequeue_batch_excluding(self.config.batch_size, &excluded)
                .await?;
            if records.is_empty() {
                break;
            }

            let batch = SyncBatch::new(records);
            report.batches += 1;
            self.transition(report, CycleState::Uploading).await;
            debug!(
                "Draining batch {}: {} records, {} bytes",
                batch.id,
                batch.len(),
                batch.total_payload_bytes()
            );

            let deliveries: Vec<_> = batch
                .records
                .into_iter()
                .map(|record| self.deliver(provider, record, cancel, halted))
                .collect();
            let results: Vec<Result<Delivery>> = stream::iter(deliveries)
                .buffer_unordered(self.config.max_concurrent_operations)
                .collect()
                .await;

            let mut first_error = None;
            for result in results {
                let delivery = match result {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        first_error.get_or_insert(e);
                        continue;
                    }
                };
                if delivery.called_provider {
                    report.provider_calls += 1;
                }
                match delivery.outcome {
                    DeliveryOutcome::Delivered => report.synced += 1,
                    DeliveryOutcome::Skipped => {
                        excluded.insert(delivery.key);
                    }
                    DeliveryOutcome::RetryScheduled { error, attempts } => {
                        debug!("{} will retry (attempt {})", delivery.key, attempts);
                        report.retryable_failures += 1;
                        report.errors.push((delivery.key.to_string(), error));
                        excluded.insert(delivery.key);
                    }
                    DeliveryOutcome::DeadLettered { error, attempts } => {
                        debug!("{} dead-lettered after {} attempts", delivery.key, attempts);
                        report.retryable_failures += 1;
                        report.dead_lettered += 1;
                        report.errors.push((delivery.key.to_string(), error));
                        excluded.insert(delivery.key);
                    }
                    DeliveryOutcome::Rejected(error) => {
                        report.fatal_failures += 1;
                        self.observer.write().last_error = Some(format!("{}: {}", delivery.key, error));
                        report.errors.push((delivery.key.to_string(), error));
                    }
                    DeliveryOutcome::AuthFailed(error) => {
                        self.require_reauthentication(provider.as_ref(), error, report).await;
                        excluded.insert(delivery.key);
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        Ok(())
    }

    async fn deliver(
        &self,
        provider: &Arc<dyn CloudProvider>,
        record: ChangeRecord,
        cancel: &CancellationToken,
        halted: &AtomicBool,
    ) -> Result<Delivery> {
        let key = record.key();
        if cancel.is_cancelled() || halted.load(Ordering::SeqCst) {
            return Ok(Delivery {
                key,
                called_provider: false,
                outcome: DeliveryOutcome::Skipped,
            });
        }

        let path = key.remote_path(&self.config.remote_root);
        let is_upload = record.operation.is_upload();
        if is_upload {
            self.store
                .mark_status(&record.entity_type, &record.entity_id, EntitySyncStatus::Uploading)
                .await?;
        }
        let result = if is_upload {
            self.call(provider.upload(&path, &record.payload)).await
        } else {
            self.call(provider.delete(&path)).await
        };

        let outcome = match result {
            Ok(()) => self.on_delivered(&record, &key, is_upload).await?,
            Err(error) => self.on_delivery_failed(&record, &key, is_upload, error, halted).await?,
        };
        Ok(Delivery {
            key,
            called_provider: true,
            outcome,
        })
    }

    async fn on_delivered(&self, record: &ChangeRecord, key: &EntityKey, is_upload: bool) -> Result<DeliveryOutcome> {
        self.queue.acknowledge(&record.id).await?;
        self.conflicts.clear_override(key)?;
        if is_upload {
            // 上传期间又有新的本地修改时保持 pending
            let status = if self.queue.contains_entity(key).await {
                EntitySyncStatus::Pending
            } else {
                EntitySyncStatus::Synced
            };
            self.store.mark_status(&key.entity_type, &key.entity_id, status).await?;
        }

        debug!("Synced {}", record.details());
        self.emit(SyncEvent::RecordSynced {
            record_id: record.id.clone(),
            entity_type: record.entity_type.clone(),
            entity_id: record.entity_id.clone(),
            operation: record.operation,
            timestamp: now_millis(),
        })
        .await;
        Ok(DeliveryOutcome::Delivered)
    }

    async fn on_delivery_failed(
        &self,
        record: &ChangeRecord,
        key: &EntityKey,
        is_upload: bool,
        error: ProviderError,
        halted: &AtomicBool,
    ) -> Result<DeliveryOutcome> {
        match FailureClass::classify(&error) {
            FailureClass::Retryable => {
                let outcome = self.queue.mark_attempt_failed(&record.id).await?;
                self.store
                    .mark_status(&key.entity_type, &key.entity_id, EntitySyncStatus::Error)
                    .await?;
                let attempts = outcome.attempts().unwrap_or(record.attempt_count());
                warn!("Retryable failure syncing {}: {} (attempt {})", key, error, attempts);
                self.emit(SyncEvent::record_failed(
                    &record.id,
                    &record.entity_type,
                    &record.entity_id,
                    error.clone(),
                    true,
                    attempts,
                ))
                .await;

                if let AttemptOutcome::DeadLettered { attempts } = outcome {
                    self.emit(SyncEvent::RecordDeadLettered {
                        record_id: record.id.clone(),
                        entity_type: record.entity_type.clone(),
                        entity_id: record.entity_id.clone(),
                        attempts,
                        timestamp: now_millis(),
                    })
                    .await;
                    Ok(DeliveryOutcome::DeadLettered { error, attempts })
                } else {
                    Ok(DeliveryOutcome::RetryScheduled { error, attempts })
                }
            }
            FailureClass::Fatal => {
                self.queue.acknowledge(&record.id).await?;
                self.store
                    .mark_status(&key.entity_type, &key.entity_id, EntitySyncStatus::Error)
                    .await?;
                error!("Non-retryable failure syncing {}: {}, record dropped", key, error);
                self.emit(SyncEvent::record_failed(
                    &record.id,
                    &record.entity_type,
                    &record.entity_id,
                    error.clone(),
                    false,
                    record.attempt_count() + 1,
                ))
                .await;
                Ok(DeliveryOutcome::Rejected(error))
            }
            FailureClass::Authentication => {
                halted.store(true, Ordering::SeqCst);
                // 记录留在队列，不计入重试次数
                if is_upload {
                    self.store
                        .mark_status(&key.entity_type, &key.entity_id, EntitySyncStatus::Pending)
                        .await?;
                }
                Ok(DeliveryOutcome::AuthFailed(error))
            }
        }
    }
}
