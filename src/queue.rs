//! Bounded queue of requests waiting on a shared asynchronous event.
//!
//! Used by the auth interceptors to park requests while a token refresh is
//! in flight. Every operation mutates the list under a short synchronous
//! lock, so enqueue and drain never interleave.

use std::{
    collections::VecDeque,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use tokio::{sync::oneshot, task::JoinHandle};

use crate::{HttpError, Result};

/// Capacity and per-entry timeout of a [`PendingQueue`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct QueueOptions {
    pub max_size: usize,
    /// `0` disables the per-entry timer.
    pub timeout_ms: u64,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_size: 100,
            timeout_ms: 30_000,
        }
    }
}

struct Entry<T> {
    id: u64,
    request: T,
    settle: oneshot::Sender<Result<T>>,
    timer: Option<JoinHandle<()>>,
}

struct Entries<T> {
    items: VecDeque<Entry<T>>,
    next_id: u64,
}

pub struct PendingQueue<T> {
    entries: Arc<Mutex<Entries<T>>>,
    options: QueueOptions,
}

impl<T> std::fmt::Debug for PendingQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingQueue")
            .field("size", &self.size())
            .field("options", &self.options)
            .finish()
    }
}

fn lock<T>(entries: &Mutex<Entries<T>>) -> MutexGuard<'_, Entries<T>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T> PendingQueue<T> {
    pub fn size(&self) -> usize {
        lock(&self.entries).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn drain(&self) -> Vec<Entry<T>> {
        lock(&self.entries).items.drain(..).collect()
    }
}

impl<T: Send + 'static> PendingQueue<T> {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries {
                items: VecDeque::new(),
                next_id: 0,
            })),
            options,
        }
    }

    /// Parks `request` until [`resolve_all`](Self::resolve_all) or
    /// [`reject_all`](Self::reject_all) settles it.
    ///
    /// Registration happens before this call returns. A full queue yields
    /// [`HttpError::QueueOverflow`] without adding an entry.
    pub fn enqueue(&self, request: T) -> impl Future<Output = Result<T>> + Send + 'static {
        let registered = self.register(request);
        async move {
            match registered {
                Ok(receiver) => receiver.await.unwrap_or(Err(HttpError::QueueClosed)),
                Err(err) => Err(err),
            }
        }
    }

    fn register(&self, request: T) -> Result<oneshot::Receiver<Result<T>>> {
        let mut entries = lock(&self.entries);
        if entries.items.len() >= self.options.max_size {
            #[cfg(feature = "tracing")]
            tracing::warn!(max_size = self.options.max_size, "pending queue overflow");
            return Err(HttpError::QueueOverflow {
                max_size: self.options.max_size,
            });
        }

        let id = entries.next_id;
        entries.next_id += 1;
        let (settle, receiver) = oneshot::channel();
        let timer = (self.options.timeout_ms > 0).then(|| self.spawn_timer(id));
        entries.items.push_back(Entry {
            id,
            request,
            settle,
            timer,
        });
        Ok(receiver)
    }

    /// The timer holds only a weak handle, so dropping the queue still closes
    /// its waiters right away.
    fn spawn_timer(&self, id: u64) -> JoinHandle<()> {
        let entries: Weak<Mutex<Entries<T>>> = Arc::downgrade(&self.entries);
        let timeout_ms = self.options.timeout_ms;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            let Some(entries) = entries.upgrade() else {
                return;
            };
            let expired = {
                let mut entries = lock(&entries);
                let position = entries.items.iter().position(|entry| entry.id == id);
                position.and_then(|index| entries.items.remove(index))
            };
            if let Some(entry) = expired {
                #[cfg(feature = "tracing")]
                tracing::debug!(timeout_ms, "pending request timed out");
                let _ = entry.settle.send(Err(HttpError::QueueTimeout { timeout_ms }));
            }
        })
    }

    /// Drains the queue and resolves every entry with `map(original)`.
    pub fn resolve_all<F>(&self, mut map: F)
    where
        F: FnMut(T) -> T,
    {
        for entry in self.drain() {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            let _ = entry.settle.send(Ok(map(entry.request)));
        }
    }

    /// Drains the queue and rejects every entry with `error`.
    pub fn reject_all(&self, error: HttpError) {
        for entry in self.drain() {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            let _ = entry.settle.send(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{PendingQueue, QueueOptions};
    use crate::HttpError;

    fn queue(max_size: usize, timeout_ms: u64) -> PendingQueue<u32> {
        PendingQueue::new(QueueOptions {
            max_size,
            timeout_ms,
        })
    }

    #[tokio::test]
    async fn overflow_rejects_without_adding_entry() {
        let queue = queue(2, 0);
        let _first = queue.enqueue(1);
        let _second = queue.enqueue(2);
        assert_eq!(queue.size(), 2);

        let err = queue.enqueue(3).await.expect_err("queue is full");
        assert!(matches!(err, HttpError::QueueOverflow { max_size: 2 }));
        assert_eq!(queue.size(), 2);
    }

    #[tokio::test]
    async fn resolve_all_maps_every_entry_and_empties_queue() {
        let queue = queue(10, 0);
        let first = queue.enqueue(1);
        let second = queue.enqueue(2);

        queue.resolve_all(|value| value * 10);
        assert!(queue.is_empty());

        assert_eq!(first.await.expect("resolved"), 10);
        assert_eq!(second.await.expect("resolved"), 20);
    }

    #[tokio::test]
    async fn reject_all_settles_every_entry_with_error() {
        let queue = queue(10, 0);
        let first = queue.enqueue(1);
        let second = queue.enqueue(2);

        queue.reject_all(HttpError::SessionExpired);
        assert_eq!(queue.size(), 0);

        assert!(matches!(first.await, Err(HttpError::SessionExpired)));
        assert!(matches!(second.await, Err(HttpError::SessionExpired)));
    }

    #[tokio::test]
    async fn timed_out_entry_is_removed_and_untouched_by_resolve_all() {
        let queue = queue(10, 20);
        let waiter = queue.enqueue(7);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.size(), 0);

        let mut mapped = 0;
        queue.resolve_all(|value| {
            mapped += 1;
            value
        });
        assert_eq!(mapped, 0);
        assert!(matches!(
            waiter.await,
            Err(HttpError::QueueTimeout { timeout_ms: 20 })
        ));
    }

    #[tokio::test]
    async fn resolved_entry_is_not_rejected_by_its_timer() {
        let queue = queue(10, 30);
        let waiter = queue.enqueue(1);
        queue.resolve_all(|value| value + 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(waiter.await.expect("resolved before timeout"), 2);
    }

    #[tokio::test]
    async fn dropped_queue_closes_waiters() {
        let queue = queue(10, 0);
        let waiter = queue.enqueue(1);
        drop(queue);
        assert!(matches!(waiter.await, Err(HttpError::QueueClosed)));
    }

    #[tokio::test]
    async fn dropped_queue_closes_waiters_with_pending_timers() {
        let queue = queue(10, 30_000);
        let waiter = queue.enqueue(1);
        drop(queue);

        let settled = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("waiter settles without waiting for its timer");
        assert!(matches!(settled, Err(HttpError::QueueClosed)));
    }
}
