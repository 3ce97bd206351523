//! Execution contexts for listener callbacks.
//!
//! Fetches complete on transport worker threads, but consumers usually want their callbacks on
//! one specific thread, for example the thread that owns the UI. A [`Dispatch`] implementation
//! decides where a callback runs. Every dispatcher in this module runs tasks in the order they
//! were handed in, except [`RuntimeDispatch`] which gives no ordering across tasks.

use std::fmt;

use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// A unit of work handed to a [`Dispatch`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Decides on which execution context a callback runs.
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch(&self, task: Task);
}

/// Runs every task right away on the calling thread.
///
/// Cache hits are then delivered before [`request`](super::RequestCoalescingCache::request)
/// returns, and fetch results on the thread that completed the fetch.
#[derive(Debug, Default, Clone, Copy)]
pub struct Inline;

impl Dispatch for Inline {
    fn dispatch(&self, task: Task) {
        task()
    }
}

/// Spawns every task onto a tokio runtime.
#[derive(Debug, Clone)]
pub struct RuntimeDispatch {
    handle: Handle,
}

impl RuntimeDispatch {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Dispatches onto the runtime this is called from.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Dispatch for RuntimeDispatch {
    fn dispatch(&self, task: Task) {
        self.handle.spawn_blocking(task);
    }
}

/// Queues tasks for a dedicated callback loop, see [`CallbackQueue`].
#[derive(Clone)]
pub struct QueueDispatch {
    sender: mpsc::UnboundedSender<Task>,
}

impl fmt::Debug for QueueDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueDispatch")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl Dispatch for QueueDispatch {
    fn dispatch(&self, task: Task) {
        if self.sender.send(task).is_err() {
            tracing::debug!("Callback loop is gone, dropping callback");
        }
    }
}

/// The receiving end of a [`QueueDispatch`].
///
/// This models a thread with its own event loop: whoever owns the queue decides when the
/// queued callbacks run, and they run in FIFO order.
pub struct CallbackQueue {
    receiver: mpsc::UnboundedReceiver<Task>,
}

impl fmt::Debug for CallbackQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackQueue")
            .field("queued", &self.receiver.len())
            .finish()
    }
}

impl CallbackQueue {
    /// Creates a new queue along with the dispatcher feeding it.
    pub fn new() -> (QueueDispatch, CallbackQueue) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (QueueDispatch { sender }, CallbackQueue { receiver })
    }

    /// Runs all callbacks that are queued right now, returning how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.receiver.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Waits for the next callback and runs it.
    ///
    /// Returns `false` once every [`QueueDispatch`] is dropped and the queue is drained.
    pub async fn run_next(&mut self) -> bool {
        match self.receiver.recv().await {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Runs callbacks until every [`QueueDispatch`] is dropped.
    pub async fn run(mut self) {
        while self.run_next().await {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn test_inline_runs_immediately() {
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        Inline.dispatch(Box::new(move || *flag.lock() = true));
        assert!(*ran.lock());
    }

    #[test]
    fn test_queue_is_fifo() {
        let (dispatch, mut queue) = CallbackQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = Arc::clone(&order);
            dispatch.dispatch(Box::new(move || order.lock().push(i)));
        }
        assert!(order.lock().is_empty());

        assert_eq!(queue.run_pending(), 5);
        assert_eq!(*order.lock(), [0, 1, 2, 3, 4]);
        assert_eq!(queue.run_pending(), 0);
    }

    #[tokio::test]
    async fn test_queue_run_ends_with_dispatchers() {
        let (dispatch, queue) = CallbackQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let task_order = Arc::clone(&order);
        dispatch.dispatch(Box::new(move || task_order.lock().push("a")));
        drop(dispatch);

        queue.run().await;
        assert_eq!(*order.lock(), ["a"]);
    }

    #[tokio::test]
    async fn test_runtime_dispatch() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        RuntimeDispatch::current().dispatch(Box::new(move || {
            let _ = tx.send(42);
        }));
        assert_eq!(rx.await.unwrap(), 42);
    }
}
