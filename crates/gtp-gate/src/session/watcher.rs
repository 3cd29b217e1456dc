//! Watcher fan-out.
//!
//! Each watcher is its own task fed by its own bounded channel, so watchers
//! see every item independently and a slow one cannot stall the others. A
//! watcher ends when its handle stops it, when the caller's token fires, or
//! when the owner (session or gate) is cancelled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Items buffered per watcher before new ones are dropped.
pub const WATCHER_BUFFER: usize = 256;

type Entries<T> = Arc<Mutex<Vec<(u64, mpsc::Sender<T>)>>>;

pub struct WatcherList<T> {
    entries: Entries<T>,
    next_id: AtomicU64,
}

impl<T: Clone + Send + 'static> WatcherList<T> {
    pub fn new() -> Self {
        Self { entries: Arc::new(Mutex::new(Vec::new())), next_id: AtomicU64::new(0) }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Register `handler` and spawn its task on `tracker`.
    ///
    /// `owner` is the lifetime of the watched object; `ctx` is the caller's.
    pub fn watch<F>(&self, owner: &CancellationToken, ctx: CancellationToken, tracker: &TaskTracker, mut handler: F) -> Watcher
    where
        F: FnMut(T) + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel::<T>(WATCHER_BUFFER);
        self.entries.lock().push((id, tx));

        let stop = owner.child_token();
        let done = CancellationToken::new();
        let handle = Watcher { stop: stop.clone(), done: done.clone() };

        let entries = Arc::clone(&self.entries);
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = ctx.cancelled() => break,
                    item = rx.recv() => match item {
                        Some(item) => handler(item),
                        None => break,
                    },
                }
            }
            entries.lock().retain(|(i, _)| *i != id);
            tracing::trace!(watcher = id, "watcher stopped");
            done.cancel();
        });

        handle
    }

    /// Deliver a copy of `item` to every watcher. Full buffers drop the item
    /// for that watcher only.
    pub fn notify(&self, item: &T) {
        let entries = self.entries.lock();
        for (id, tx) in entries.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(item.clone()) {
                tracing::warn!(watcher = id, "watcher lagging, item dropped");
            }
        }
    }
}

impl<T: Clone + Send + 'static> Default for WatcherList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running watcher.
#[derive(Debug, Clone)]
pub struct Watcher {
    stop: CancellationToken,
    done: CancellationToken,
}

impl Watcher {
    /// Ask the watcher to stop without waiting for it.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Stop the watcher and wait until its task has exited.
    pub async fn terminate(&self) {
        self.stop.cancel();
        self.done.cancelled().await;
    }

    /// Resolves once the watcher has ended for any reason.
    pub async fn stopped(&self) {
        self.done.cancelled().await;
    }
}
