//! 同步队列
//!
//! 有序、持久化的待同步变更记录集合：
//! - 入队时合并同一实体的连续 update，delete 取消该实体之前所有未同步的记录
//! - 出队是“窥视”语义，只有 Provider 确认后才删除
//! - 每个实体每次最多出一条（最早入队的那条），保证同一实体按入队顺序同步
//! - 失败次数达到阈值进入死信，不再参与出队，直到人工重新入队
//!
//! 所有修改都在同一把锁内串行执行（UI 写入路径与后台同步循环会并发调用）。

use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::storage::{trees, KvBatch, KvStore};

pub mod batch;
pub mod change_record;
pub mod priority;
pub mod retry_policy;

pub use batch::SyncBatch;
pub use change_record::{ChangeOperation, ChangeRecord, EntityKey, RecordState};
pub use priority::SyncPriority;
pub use retry_policy::{AttemptOutcome, FailureClass, RetryPolicy};

/// 入队结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// 作为新记录追加
    Appended { record_id: String },
    /// 替换了同一实体上一条未同步的 create/update
    Coalesced { record_id: String, replaced_id: String },
    /// delete 取消了该实体之前的记录
    DeleteSuperseded { record_id: String, removed_ids: Vec<String> },
}

impl EnqueueOutcome {
    pub fn record_id(&self) -> &str {
        match self {
            EnqueueOutcome::Appended { record_id }
            | EnqueueOutcome::Coalesced { record_id, .. }
            | EnqueueOutcome::DeleteSuperseded { record_id, .. } => record_id,
        }
    }
}

/// 队列统计信息
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub total_records: usize,
    pub pending_records: usize,
    pub dead_lettered_records: usize,
    pub entity_count: usize,
    pub priority_distribution: HashMap<SyncPriority, usize>,
    pub oldest_created_at: Option<i64>,
}

#[derive(Debug, Default)]
struct QueueInner {
    /// 按 seq 升序
    records: Vec<ChangeRecord>,
    next_seq: u64,
}

impl QueueInner {
    fn position(&self, record_id: &str) -> Option<usize> {
        self.records.iter().position(|r| r.id == record_id)
    }

    fn last_for_key(&self, record: &ChangeRecord) -> Option<usize> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.entity_type == record.entity_type && r.entity_id == record.entity_id)
            .max_by_key(|(_, r)| r.seq)
            .map(|(i, _)| i)
    }

    /// 每个实体的队首记录（seq 最小的一条）
    fn heads(&self) -> Vec<&ChangeRecord> {
        let mut heads: HashMap<(&str, &str), &ChangeRecord> = HashMap::new();
        for record in &self.records {
            heads
                .entry((record.entity_type.as_str(), record.entity_id.as_str()))
                .and_modify(|head| {
                    if record.seq < head.seq {
                        *head = record;
                    }
                })
                .or_insert(record);
        }
        heads.into_values().collect()
    }
}

/// 持久化同步队列
#[derive(Debug)]
pub struct SyncQueue {
    inner: Mutex<QueueInner>,
    kv: KvStore,
    policy: RetryPolicy,
}

impl SyncQueue {
    /// 基于已打开的 KV 存储创建队列，并加载上次进程遗留的记录
    pub async fn open(kv: KvStore, policy: RetryPolicy) -> Result<Self> {
        let mut records: Vec<ChangeRecord> = kv
            .scan::<ChangeRecord>(trees::SYNC_QUEUE)?
            .into_iter()
            .map(|(_, record)| record)
            .collect();
        records.sort_by_key(|r| r.seq);
        let next_seq = records.last().map(|r| r.seq + 1).unwrap_or(1);

        if !records.is_empty() {
            let dead = records.iter().filter(|r| r.is_dead_lettered()).count();
            info!(
                "Restored {} queued change records ({} dead-lettered)",
                records.len(),
                dead
            );
        }

        Ok(Self {
            inner: Mutex::new(QueueInner { records, next_seq }),
            kv,
            policy,
        })
    }

    /// 临时队列（数据库随进程删除）
    pub async fn temporary(policy: RetryPolicy) -> Result<Self> {
        Self::open(KvStore::temporary()?, policy).await
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 入队
    ///
    /// - delete：删除该实体所有排队记录（含死信），只留下这一条 delete
    /// - create/update：若该实体最后一条记录是未同步的 create/update，则用新记录替换它。
    ///   新记录继承被替换记录的位置（seq、入队时间）和较高的优先级，重试计数清零；
    ///   被替换的是 create 时保留 create 语义
    pub async fn enqueue(&self, mut record: ChangeRecord) -> Result<EnqueueOutcome> {
        let mut inner = self.inner.lock().await;
        record.attempt_count = 0;
        record.state = RecordState::Pending;

        match record.operation {
            ChangeOperation::Delete => {
                let removed_ids: Vec<String> = inner
                    .records
                    .iter()
                    .filter(|r| r.entity_type == record.entity_type && r.entity_id == record.entity_id)
                    .map(|r| r.id.clone())
                    .collect();

                record.seq = inner.next_seq;
                let mut batch = KvBatch::new();
                for id in &removed_ids {
                    batch.remove(id);
                }
                batch.put(&record.id, &record)?;
                self.kv.apply_batch(trees::SYNC_QUEUE, batch)?;

                inner.next_seq += 1;
                inner.records.retain(|r| !removed_ids.contains(&r.id));
                let record_id = record.id.clone();
                debug!("Enqueued {}", record.details());
                inner.records.push(record);

                if removed_ids.is_empty() {
                    Ok(EnqueueOutcome::Appended { record_id })
                } else {
                    info!(
                        "Delete for {} superseded {} queued record(s)",
                        record_id,
                        removed_ids.len()
                    );
                    Ok(EnqueueOutcome::DeleteSuperseded { record_id, removed_ids })
                }
            }
            ChangeOperation::Create | ChangeOperation::Update => {
                let coalesce_index = inner
                    .last_for_key(&record)
                    .filter(|&i| inner.records[i].operation.is_upload());

                match coalesce_index {
                    Some(index) => {
                        let previous = &inner.records[index];
                        let replaced_id = previous.id.clone();
                        record.seq = previous.seq;
                        record.created_at = previous.created_at;
                        record.priority = previous.priority.higher(record.priority);
                        if previous.operation == ChangeOperation::Create {
                            record.operation = ChangeOperation::Create;
                        }

                        let mut batch = KvBatch::new();
                        batch.remove(&replaced_id);
                        batch.put(&record.id, &record)?;
                        self.kv.apply_batch(trees::SYNC_QUEUE, batch)?;

                        let record_id = record.id.clone();
                        debug!("Coalesced {} into {}", replaced_id, record.details());
                        inner.records[index] = record;
                        Ok(EnqueueOutcome::Coalesced { record_id, replaced_id })
                    }
                    None => {
                        record.seq = inner.next_seq;
                        self.kv.put(trees::SYNC_QUEUE, &record.id, &record)?;
                        inner.next_seq += 1;
                        let record_id = record.id.clone();
                        debug!("Enqueued {}", record.details());
                        inner.records.push(record);
                        Ok(EnqueueOutcome::Appended { record_id })
                    }
                }
            }
        }
    }

    /// 按优先级（高在前）、入队时间升序返回最多 `max_count` 条记录，不删除
    pub async fn dequeue_batch(&self, max_count: usize) -> Result<Vec<ChangeRecord>> {
        self.dequeue_batch_excluding(max_count, &HashSet::new()).await
    }

    /// 同 `dequeue_batch`，但跳过 `excluded` 中的实体
    pub async fn dequeue_batch_excluding(
        &self,
        max_count: usize,
        excluded: &HashSet<EntityKey>,
    ) -> Result<Vec<ChangeRecord>> {
        let inner = self.inner.lock().await;
        let mut heads: Vec<&ChangeRecord> = inner
            .heads()
            .into_iter()
            .filter(|r| !r.is_dead_lettered())
            .filter(|r| excluded.is_empty() || !excluded.contains(&r.key()))
            .collect();
        heads.sort_by_key(|r| r.dequeue_order());
        Ok(heads.into_iter().take(max_count).cloned().collect())
    }

    /// 确认（删除）记录；记录不存在时什么也不做
    pub async fn acknowledge(&self, record_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.position(record_id) {
            Some(index) => {
                self.kv.remove(trees::SYNC_QUEUE, record_id)?;
                let record = inner.records.remove(index);
                debug!("Acknowledged {}", record.details());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// 记一次失败；达到阈值的记录进入死信，死信记录不再变化
    pub async fn mark_attempt_failed(&self, record_id: &str) -> Result<AttemptOutcome> {
        let mut inner = self.inner.lock().await;
        let Some(index) = inner.position(record_id) else {
            return Ok(AttemptOutcome::NotFound);
        };

        let current = &inner.records[index];
        if current.is_dead_lettered() {
            return Ok(AttemptOutcome::AlreadyDeadLettered {
                attempts: current.attempt_count,
            });
        }

        let mut updated = current.clone();
        updated.attempt_count += 1;
        let exhausted = self.policy.is_exhausted(updated.attempt_count);
        if exhausted {
            updated.state = RecordState::DeadLettered;
        }
        self.kv.put(trees::SYNC_QUEUE, &updated.id, &updated)?;

        let attempts = updated.attempt_count;
        if exhausted {
            warn!("Record dead-lettered after {} attempts: {}", attempts, updated.details());
        }
        inner.records[index] = updated;

        Ok(if exhausted {
            AttemptOutcome::DeadLettered { attempts }
        } else {
            AttemptOutcome::WillRetry { attempts }
        })
    }

    /// 死信记录
    pub async fn dead_letters(&self) -> Result<Vec<ChangeRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.records.iter().filter(|r| r.is_dead_lettered()).cloned().collect())
    }

    /// 把死信记录放回正常轮转，重试计数清零
    pub async fn requeue_dead_letter(&self, record_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(index) = inner.position(record_id) else {
            return Ok(false);
        };
        if !inner.records[index].is_dead_lettered() {
            return Ok(false);
        }

        let mut updated = inner.records[index].clone();
        updated.attempt_count = 0;
        updated.state = RecordState::Pending;
        self.kv.put(trees::SYNC_QUEUE, &updated.id, &updated)?;
        info!("Requeued dead-lettered record {}", updated.id);
        inner.records[index] = updated;
        Ok(true)
    }

    /// 删除某个实体的全部记录（冲突以远端为准时丢弃本地修改）
    pub async fn remove_entity(&self, key: &EntityKey) -> Result<Vec<ChangeRecord>> {
        let mut inner = self.inner.lock().await;
        let (removed, kept): (Vec<ChangeRecord>, Vec<ChangeRecord>) =
            std::mem::take(&mut inner.records).into_iter().partition(|r| r.matches_key(key));

        let mut batch = KvBatch::new();
        for record in &removed {
            batch.remove(&record.id);
        }
        if let Err(e) = self.kv.apply_batch(trees::SYNC_QUEUE, batch) {
            inner.records = kept.into_iter().chain(removed).collect();
            inner.records.sort_by_key(|r| r.seq);
            return Err(e);
        }

        inner.records = kept;
        Ok(removed)
    }

    /// 某个实体的排队记录（按入队顺序）
    pub async fn pending_for(&self, key: &EntityKey) -> Result<Vec<ChangeRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.records.iter().filter(|r| r.matches_key(key)).cloned().collect())
    }

    pub async fn contains_entity(&self, key: &EntityKey) -> bool {
        let inner = self.inner.lock().await;
        inner.records.iter().any(|r| r.matches_key(key))
    }

    pub async fn get(&self, record_id: &str) -> Option<ChangeRecord> {
        let inner = self.inner.lock().await;
        inner.position(record_id).map(|i| inner.records[i].clone())
    }

    /// 队列中的记录总数（含死信）
    pub async fn len(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.records.is_empty()
    }

    /// 仍在正常轮转中的记录数
    pub async fn active_len(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.records.iter().filter(|r| !r.is_dead_lettered()).count()
    }

    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().await;
        let mut stats = QueueStats {
            total_records: inner.records.len(),
            ..QueueStats::default()
        };

        let mut entities = HashSet::new();
        for record in &inner.records {
            match record.state {
                RecordState::Pending => stats.pending_records += 1,
                RecordState::DeadLettered => stats.dead_lettered_records += 1,
            }
            *stats.priority_distribution.entry(record.priority).or_insert(0) += 1;
            entities.insert((record.entity_type.as_str(), record.entity_id.as_str()));
            stats.oldest_created_at = Some(match stats.oldest_created_at {
                Some(oldest) => oldest.min(record.created_at),
                None => record.created_at,
            });
        }
        stats.entity_count = entities.len();
        stats
    }

    /// 刷盘（进程退出或切到后台时调用）
    pub async fn flush(&self) -> Result<()> {
        let _inner = self.inner.lock().await;
        self.kv.flush().await
    }
}
