//! Thread-safe hand-off from backend threads to the coordinator's task.
//!
//! Producers on arbitrary threads enqueue boxed calls; the single consumer
//! task owning the context drains them in order and runs each one with
//! `&mut` access. Nothing downstream of the queue needs a lock.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::error::TrySendError;

use super::error::BridgeError;

/// A call scheduled onto the consumer's context.
pub type Job<T> = Box<dyn FnOnce(&mut T) + Send + 'static>;

/// Producer half. Cheap to clone, usable from any thread.
pub struct Bridge<T> {
    tx: mpsc::Sender<Job<T>>,
    capacity: usize,
}

impl<T> Clone for Bridge<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> std::fmt::Debug for Bridge<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("capacity", &self.capacity)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Consumer half, owned by the task that owns the context.
pub struct BridgeReceiver<T> {
    rx: mpsc::Receiver<Job<T>>,
}

/// Create a bridge with a bounded queue of `capacity` pending calls.
///
/// A capacity of zero is raised to one.
pub fn channel<T: 'static>(capacity: usize) -> (Bridge<T>, BridgeReceiver<T>) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    (Bridge { tx, capacity }, BridgeReceiver { rx })
}

impl<T: 'static> Bridge<T> {
    /// Schedule `callback(ctx, args)` on the consumer's context.
    ///
    /// Never waits for the call to run. Fails with [`BridgeError::Full`] if
    /// the queue is saturated and [`BridgeError::Closed`] once the consumer
    /// has been torn down.
    pub fn submit<A, F>(&self, callback: F, args: A) -> Result<(), BridgeError>
    where
        A: Send + 'static,
        F: FnOnce(&mut T, A) + Send + 'static,
    {
        let job: Job<T> = Box::new(move |ctx: &mut T| callback(ctx, args));
        self.tx.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => BridgeError::Full {
                capacity: self.capacity,
            },
            TrySendError::Closed(_) => BridgeError::Closed,
        })
    }

    /// Like [`Bridge::submit`], but waits for queue capacity instead of
    /// failing when the queue is full.
    ///
    /// For dedicated producer threads only: this panics if called from
    /// within an async execution context.
    pub fn submit_blocking<A, F>(&self, callback: F, args: A) -> Result<(), BridgeError>
    where
        A: Send + 'static,
        F: FnOnce(&mut T, A) + Send + 'static,
    {
        let job: Job<T> = Box::new(move |ctx: &mut T| callback(ctx, args));
        self.tx.blocking_send(job).map_err(|_| BridgeError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: 'static> BridgeReceiver<T> {
    /// Wait for the next call. Returns `None` once every producer is gone
    /// (or the receiver was closed) and the queue is drained.
    pub async fn recv(&mut self) -> Option<Job<T>> {
        self.rx.recv().await
    }

    /// Take the next queued call without waiting.
    pub fn try_recv(&mut self) -> Option<Job<T>> {
        match self.rx.try_recv() {
            Ok(job) => Some(job),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Reject all further submissions. Calls already queued stay receivable.
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Number of calls waiting in the queue.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_preserves_args_and_order() {
        let (bridge, mut rx) = channel::<Vec<u32>>(8);
        for i in 0..5 {
            bridge.submit(|log, n| log.push(n), i).unwrap();
        }

        let mut log = Vec::new();
        while let Some(job) = rx.try_recv() {
            job(&mut log);
        }
        assert_eq!(log, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_submit_fails_when_full() {
        let (bridge, _rx) = channel::<Vec<u32>>(2);
        bridge.submit(|log, n| log.push(n), 1).unwrap();
        bridge.submit(|log, n| log.push(n), 2).unwrap();

        let err = bridge.submit(|log, n| log.push(n), 3).unwrap_err();
        assert_eq!(err, BridgeError::Full { capacity: 2 });
    }

    #[test]
    fn test_submit_after_receiver_dropped_is_closed() {
        let (bridge, rx) = channel::<Vec<u32>>(2);
        drop(rx);

        assert!(bridge.is_closed());
        assert_eq!(
            bridge.submit(|log, n| log.push(n), 1),
            Err(BridgeError::Closed)
        );
    }

    #[test]
    fn test_close_keeps_queued_calls() {
        let (bridge, mut rx) = channel::<Vec<u32>>(4);
        bridge.submit(|log, n| log.push(n), 7).unwrap();
        rx.close();

        assert_eq!(
            bridge.submit(|log, n| log.push(n), 8),
            Err(BridgeError::Closed)
        );

        let mut log = Vec::new();
        while let Some(job) = rx.try_recv() {
            job(&mut log);
        }
        assert_eq!(log, vec![7]);
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let (bridge, _rx) = channel::<Vec<u32>>(0);
        assert_eq!(bridge.capacity(), 1);
        bridge.submit(|log, n| log.push(n), 1).unwrap();
    }

    #[test]
    fn test_submit_blocking_from_thread() {
        let (bridge, mut rx) = channel::<Vec<u32>>(1);

        let producer = std::thread::spawn(move || {
            for i in 0..3 {
                bridge.submit_blocking(|log, n| log.push(n), i).unwrap();
            }
        });

        let mut log = Vec::new();
        while log.len() < 3 {
            if let Some(job) = rx.try_recv() {
                job(&mut log);
            } else {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();
        assert_eq!(log, vec![0, 1, 2]);
    }
}
