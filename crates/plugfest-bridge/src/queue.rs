//! Per-device write queue
//!
//! Writes run one at a time, in submission order. The owner drives the
//! queue: [`WriteQueue::start_next`] hands out the next payload only when
//! nothing is running, and [`WriteQueue::finish`] completes the running
//! item's waiters before anything else may start.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::oneshot;

use crate::error::{BridgeError, Result};

/// Receives the outcome of one queued write
pub type Completion = oneshot::Receiver<Result<()>>;

/// How queued writes sharing a key are treated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Every write runs
    #[default]
    KeepAll,
    /// A newer write replaces a pending one with the same key; the
    /// replaced write completes when its replacement does
    LastValueWins,
}

struct Item<T> {
    payload: T,
    key: Option<String>,
    waiters: Vec<oneshot::Sender<Result<()>>>,
}

/// Single-flight FIFO of pending writes
pub struct WriteQueue<T> {
    policy: QueuePolicy,
    pending: VecDeque<Item<T>>,
    running: Option<Vec<oneshot::Sender<Result<()>>>>,
}

impl<T> WriteQueue<T> {
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            policy,
            pending: VecDeque::new(),
            running: None,
        }
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    /// Append a write; the returned receiver resolves once it has run
    pub fn enqueue(&mut self, payload: T, key: Option<String>) -> Completion {
        let (tx, rx) = oneshot::channel();
        self.push(payload, key, tx);
        rx
    }

    /// Append a write whose outcome goes to an existing waiter
    pub fn push(&mut self, payload: T, key: Option<String>, waiter: oneshot::Sender<Result<()>>) {
        let mut waiters = vec![waiter];

        if self.policy == QueuePolicy::LastValueWins {
            if let Some(key) = &key {
                if let Some(idx) = self
                    .pending
                    .iter()
                    .position(|item| item.key.as_ref() == Some(key))
                {
                    if let Some(mut superseded) = self.pending.remove(idx) {
                        superseded.waiters.append(&mut waiters);
                        waiters = superseded.waiters;
                    }
                }
            }
        }

        self.pending.push_back(Item {
            payload,
            key,
            waiters,
        });
    }

    /// Take the next payload to run, unless a write is already running
    pub fn start_next(&mut self) -> Option<T> {
        if self.running.is_some() {
            return None;
        }
        let item = self.pending.pop_front()?;
        self.running = Some(item.waiters);
        Some(item.payload)
    }

    /// Complete the running write
    pub fn finish(&mut self, result: Result<()>) {
        if let Some(waiters) = self.running.take() {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    /// Fail the running write and everything pending
    pub fn fail_all(&mut self, error: BridgeError) {
        self.finish(Err(error.clone()));
        for item in self.pending.drain(..) {
            for waiter in item.waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Writes waiting to run
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Nothing pending and nothing running
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.running.is_none()
    }
}

impl<T> Default for WriteQueue<T> {
    fn default() -> Self {
        Self::new(QueuePolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot::error::TryRecvError;

    #[test]
    fn test_fifo_single_flight() {
        let mut queue = WriteQueue::default();
        let mut first = queue.enqueue(1, None);
        let mut second = queue.enqueue(2, None);

        assert_eq!(queue.start_next(), Some(1));
        // Nothing else starts while the first write runs
        assert_eq!(queue.start_next(), None);
        assert!(queue.is_running());

        queue.finish(Ok(()));
        assert_eq!(first.try_recv(), Ok(Ok(())));
        assert_eq!(second.try_recv(), Err(TryRecvError::Empty));

        assert_eq!(queue.start_next(), Some(2));
        queue.finish(Err(BridgeError::NotConnected));
        assert_eq!(second.try_recv(), Ok(Err(BridgeError::NotConnected)));

        assert_eq!(queue.start_next(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_keep_all_runs_every_write() {
        let mut queue = WriteQueue::new(QueuePolicy::KeepAll);
        queue.enqueue("a", Some("on".to_string()));
        queue.enqueue("b", Some("on".to_string()));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_last_value_wins() {
        let mut queue = WriteQueue::new(QueuePolicy::LastValueWins);
        let mut old = queue.enqueue("old", Some("on".to_string()));
        let mut other = queue.enqueue("other", Some("hue".to_string()));
        let mut new = queue.enqueue("new", Some("on".to_string()));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.start_next(), Some("other"));
        queue.finish(Ok(()));
        assert_eq!(other.try_recv(), Ok(Ok(())));
        assert_eq!(old.try_recv(), Err(TryRecvError::Empty));

        assert_eq!(queue.start_next(), Some("new"));
        queue.finish(Ok(()));
        assert_eq!(old.try_recv(), Ok(Ok(())));
        assert_eq!(new.try_recv(), Ok(Ok(())));
    }

    #[test]
    fn test_running_write_is_not_superseded() {
        let mut queue = WriteQueue::new(QueuePolicy::LastValueWins);
        queue.enqueue(1, Some("k".to_string()));
        assert_eq!(queue.start_next(), Some(1));
        queue.enqueue(2, Some("k".to_string()));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_fail_all() {
        let mut queue = WriteQueue::default();
        let mut running = queue.enqueue(1, None);
        let mut pending = queue.enqueue(2, None);
        queue.start_next();

        queue.fail_all(BridgeError::NotConnected);
        assert_eq!(running.try_recv(), Ok(Err(BridgeError::NotConnected)));
        assert_eq!(pending.try_recv(), Ok(Err(BridgeError::NotConnected)));
        assert!(queue.is_empty());
    }
}
