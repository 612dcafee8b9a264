//! Bounded, strictly-prioritized in-process request queue.
//!
//! Generalizes the SQL `UPDATE ... RETURNING` atomic-dequeue pattern this
//! crate used for its persisted job queue into an in-memory structure:
//! dispatch order is the same (`critical > high > normal > low`, FIFO
//! within a priority) but there is no backing table, since the relational
//! store is outside this crate's scope.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{Notify, oneshot};
use tokio::time::timeout;
use tracing::instrument;

use crate::error::QueueError;

/// Dispatch priority. Derives `Ord` so that `Critical > High > Normal >
/// Low`, matching the strict-priority contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    const ALL_DESCENDING: [Priority; 4] =
        [Priority::Critical, Priority::High, Priority::Normal, Priority::Low];
}

struct Entry<T> {
    value: T,
    completion: oneshot::Sender<Result<(), QueueError>>,
}

struct Lanes<T> {
    lanes: [VecDeque<Entry<T>>; 4],
    size: usize,
    accepting: bool,
}

impl<T> Lanes<T> {
    fn new() -> Self {
        Self {
            lanes: [
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ],
            size: 0,
            accepting: true,
        }
    }

    fn lane_index(priority: Priority) -> usize {
        match priority {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    fn pop_highest(&mut self) -> Option<Entry<T>> {
        for priority in Priority::ALL_DESCENDING {
            let idx = Self::lane_index(priority);
            if let Some(entry) = self.lanes[idx].pop_front() {
                self.size -= 1;
                return Some(entry);
            }
        }
        None
    }
}

/// A bounded, priority-ordered in-process queue.
///
/// `T` is the unit of work; callers get back a handle that resolves once
/// the entry is dispatched (or fails with [`QueueError`]).
pub struct PriorityQueue<T> {
    lanes: Mutex<Lanes<T>>,
    max_size: usize,
    notify: Notify,
}

/// Handle returned by [`PriorityQueue::enqueue`]. Awaiting it resolves once
/// the entry is taken by a worker via [`PriorityQueue::dequeue`], or fails
/// if the entry timed out or the queue shut down first.
pub struct EnqueueHandle {
    receiver: oneshot::Receiver<Result<(), QueueError>>,
}

impl EnqueueHandle {
    /// Waits, up to `per_request_timeout`, for this entry to be dispatched.
    ///
    /// # Errors
    /// Returns [`QueueError::Timeout`] if the deadline elapses first, or
    /// whatever error the queue completed the entry with (e.g. on
    /// shutdown).
    pub async fn wait(self, per_request_timeout: Duration) -> Result<(), QueueError> {
        match timeout(per_request_timeout, self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_canceled)) => Err(QueueError::Unavailable),
            Err(_elapsed) => Err(QueueError::timeout(per_request_timeout)),
        }
    }
}

impl<T> PriorityQueue<T> {
    /// Creates an empty queue bounded at `max_size` total entries across
    /// all priority lanes.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            lanes: Mutex::new(Lanes::new()),
            max_size,
            notify: Notify::new(),
        }
    }

    /// Enqueues `value` at `priority`.
    ///
    /// # Errors
    /// Returns [`QueueError::Full`] if the queue is at `max_size`, or
    /// [`QueueError::Unavailable`] if the queue has been shut down.
    #[instrument(skip(self, value))]
    pub fn enqueue(&self, value: T, priority: Priority) -> Result<EnqueueHandle, QueueError>
    where
        T: std::fmt::Debug,
    {
        let (tx, rx) = oneshot::channel();
        let mut lanes = self.lanes.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if !lanes.accepting {
            return Err(QueueError::Unavailable);
        }
        if lanes.size >= self.max_size {
            return Err(QueueError::full(self.max_size));
        }
        let idx = Lanes::<T>::lane_index(priority);
        lanes.lanes[idx].push_back(Entry {
            value,
            completion: tx,
        });
        lanes.size += 1;
        drop(lanes);
        self.notify.notify_one();
        Ok(EnqueueHandle { receiver: rx })
    }

    /// Pops the highest-priority, oldest-enqueued entry, if any, marking
    /// its [`EnqueueHandle`] as successfully dispatched.
    pub fn try_dequeue(&self) -> Option<T> {
        let mut lanes = self.lanes.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = lanes.pop_highest()?;
        drop(lanes);
        let _ = entry.completion.send(Ok(()));
        Some(entry.value)
    }

    /// Waits until an entry is available and pops it, or returns `None`
    /// once the queue has been shut down and drained.
    pub async fn dequeue(&self) -> Option<T> {
        loop {
            if let Some(value) = self.try_dequeue() {
                return Some(value);
            }
            let accepting = {
                let lanes = self.lanes.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                lanes.accepting || lanes.size > 0
            };
            if !accepting {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Total entries currently queued across all priorities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lanes.lock().unwrap_or_else(std::sync::PoisonError::into_inner).size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting new entries and fails every still-queued entry with
    /// [`QueueError::Unavailable`]. In-flight (already dequeued) work is
    /// the caller's responsibility to drain within its own
    /// `shutdownTimeout`.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        let mut lanes = self.lanes.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        lanes.accepting = false;
        for priority in Priority::ALL_DESCENDING {
            let idx = Lanes::<T>::lane_index(priority);
            while let Some(entry) = lanes.lanes[idx].pop_front() {
                lanes.size -= 1;
                let _ = entry.completion.send(Err(QueueError::Unavailable));
            }
        }
        drop(lanes);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn strict_priority_then_fifo_within_priority() {
        let queue: PriorityQueue<i32> = PriorityQueue::new(100);
        for v in [1, 2, 3] {
            queue.enqueue(v, Priority::Low).unwrap();
        }
        for v in [4, 5, 6] {
            queue.enqueue(v, Priority::Normal).unwrap();
        }
        for v in [7, 8, 9] {
            queue.enqueue(v, Priority::High).unwrap();
        }

        let mut order = Vec::new();
        while let Some(v) = queue.try_dequeue() {
            order.push(v);
        }
        assert_eq!(order, vec![7, 8, 9, 4, 5, 6, 1, 2, 3]);
    }

    #[tokio::test]
    async fn enqueue_fails_when_full() {
        let queue: PriorityQueue<i32> = PriorityQueue::new(1);
        queue.enqueue(1, Priority::Low).unwrap();
        let err = queue.enqueue(2, Priority::Low).unwrap_err();
        assert!(matches!(err, QueueError::Full { max_size: 1 }));
    }

    #[tokio::test]
    async fn enqueue_handle_resolves_on_dequeue() {
        let queue: PriorityQueue<i32> = PriorityQueue::new(10);
        let handle = queue.enqueue(42, Priority::Critical).unwrap();
        assert_eq!(queue.try_dequeue(), Some(42));
        handle.wait(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_fails_pending_entries() {
        let queue: PriorityQueue<i32> = PriorityQueue::new(10);
        let handle = queue.enqueue(1, Priority::Low).unwrap();
        queue.shutdown();
        let err = handle.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, QueueError::Unavailable));
        assert!(matches!(
            queue.enqueue(2, Priority::Low).unwrap_err(),
            QueueError::Unavailable
        ));
    }

    #[tokio::test]
    async fn dequeue_awaits_until_entry_arrives() {
        let queue = std::sync::Arc::new(PriorityQueue::<i32>::new(10));
        let q2 = queue.clone();
        let task = tokio::spawn(async move { q2.dequeue().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(7, Priority::Normal).unwrap();
        let got = task.await.unwrap();
        assert_eq!(got, Some(7));
    }
}
