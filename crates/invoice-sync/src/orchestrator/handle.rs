//! Handle for an in-flight sync cycle
//!
//! Every `sync_now()` caller receives one of these. Callers that arrive while
//! a cycle is running get a handle to that same cycle, so all of them resolve
//! with the same report.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::state::CycleReport;
use crate::error::{Result, SyncError};

pub(crate) type CycleOutcome = Option<Result<CycleReport>>;

/// A handle to a running (or finished) sync cycle
#[derive(Debug, Clone)]
pub struct SyncHandle {
    cycle_id: String,
    done: watch::Receiver<CycleOutcome>,
    cancel: CancellationToken,
}

impl SyncHandle {
    pub(crate) fn new(cycle_id: String, done: watch::Receiver<CycleOutcome>, cancel: CancellationToken) -> Self {
        Self { cycle_id, done, cancel }
    }

    pub fn cycle_id(&self) -> &str {
        &self.cycle_id
    }

    /// Stop issuing new provider calls.
    ///
    /// Calls already in flight complete and their results are applied; the
    /// cycle then finishes with `cancelled == true` in its report.
    pub fn cancel(&self) {
        debug!("Cancelling sync cycle {}", self.cycle_id);
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True once the report is in, or once the cycle task is gone (it panicked)
    pub fn is_finished(&self) -> bool {
        self.done.borrow().is_some() || self.done.has_changed().is_err()
    }

    /// Wait for the cycle to finish
    pub async fn wait(mut self) -> Result<CycleReport> {
        loop {
            let current = self.done.borrow().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if self.done.changed().await.is_err() {
                // 发送端在写入结果前被丢弃（任务被中止）
                let current = self.done.borrow().clone();
                return current.unwrap_or(Err(SyncError::Cancelled));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handles_share_outcome() {
        let (tx, rx) = watch::channel(None);
        let token = CancellationToken::new();
        let first = SyncHandle::new("c1".into(), rx.clone(), token.clone());
        let second = SyncHandle::new("c1".into(), rx, token);

        assert!(!first.is_finished());
        let waiter = tokio::spawn(first.clone().wait());

        let report = CycleReport::new();
        tx.send(Some(Ok(report.clone()))).unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), report);
        assert!(second.is_finished());
        assert_eq!(second.wait().await.unwrap(), report);
    }

    #[tokio::test]
    async fn test_dropped_sender_is_cancelled() {
        let (tx, rx) = watch::channel(None);
        let handle = SyncHandle::new("c2".into(), rx, CancellationToken::new());
        assert!(!handle.is_finished());
        drop(tx);
        assert!(handle.is_finished());
        assert_eq!(handle.wait().await, Err(SyncError::Cancelled));
    }

    #[test]
    fn test_cancel_flag() {
        let (_tx, rx) = watch::channel(None);
        let handle = SyncHandle::new("c3".into(), rx, CancellationToken::new());
        assert!(!handle.is_cancelled());
        handle.cancel();
        assert!(handle.is_cancelled());
    }
}
