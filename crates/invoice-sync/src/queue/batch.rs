use serde::{Deserialize, Serialize};

use crate::queue::change_record::ChangeRecord;

/// 同步批次：把多条变更记录打包成一次 Provider 往返
///
/// 只是批量上传的优化手段，正确性不依赖它。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncBatch {
    pub id: String,
    pub created_at: i64,
    pub records: Vec<ChangeRecord>,
}

impl SyncBatch {
    pub fn new(records: Vec<ChangeRecord>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_payload_bytes(&self) -> usize {
        self.records.iter().map(|r| r.payload.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::change_record::ChangeOperation;
    use crate::queue::priority::SyncPriority;

    #[test]
    fn test_batch_payload_size() {
        let batch = SyncBatch::new(vec![
            ChangeRecord::new("Invoice", "1", ChangeOperation::Create, vec![1, 2], SyncPriority::Normal),
            ChangeRecord::delete("Invoice", "2", SyncPriority::High),
            ChangeRecord::new("Client", "3", ChangeOperation::Update, vec![3], SyncPriority::Low),
        ]);
        assert_eq!(batch.len(), 3);
        assert!(!batch.is_empty());
        // 删除记录不带载荷
        assert_eq!(batch.total_payload_bytes(), 3);
        assert!(SyncBatch::new(Vec::new()).is_empty());
    }
}
