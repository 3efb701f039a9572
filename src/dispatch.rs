//! Event delivery on a caller-chosen thread.
//!
//! By default events fire inline on the I/O task that produced them. Hosts
//! that must see callbacks on one designated thread construct a
//! [`Dispatcher`], pass `EventDelivery::Queued(dispatcher)` to a builder,
//! and call `drain_events()` from that thread on every tick.
//!
//! # Example
//!
//! ```
//! use hybrid_transport::Dispatcher;
//!
//! let dispatcher = Dispatcher::new();
//! let queue = dispatcher.register();
//! dispatcher.enqueue(queue, || println!("runs on the draining thread")).unwrap();
//! assert_eq!(dispatcher.pending(queue), 1);
//! assert_eq!(dispatcher.drain_once(queue), 1);
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::{Result, TransportError};
use crate::sync::lock;

/// Default maximum number of queued events per queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Identifier of one registered queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatcherId(u64);

struct Queues {
    next_id: u64,
    queues: HashMap<DispatcherId, VecDeque<Task>>,
}

/// Set of bounded FIFO task queues, drained explicitly by their owner.
///
/// Cloning shares the queues.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Mutex<Queues>>,
    capacity: usize,
}

impl Dispatcher {
    /// Dispatcher whose queues hold at most [`DEFAULT_QUEUE_CAPACITY`] tasks.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Dispatcher whose queues hold at most `capacity` tasks.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Queues {
                next_id: 1,
                queues: HashMap::new(),
            })),
            capacity,
        }
    }

    /// Per-queue capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Create a new empty queue.
    pub fn register(&self) -> DispatcherId {
        let mut inner = lock(&self.inner);
        let id = DispatcherId(inner.next_id);
        inner.next_id += 1;
        inner.queues.insert(id, VecDeque::new());
        id
    }

    /// Remove a queue, discarding anything still pending.
    ///
    /// Returns `false` if the queue was not registered.
    pub fn unregister(&self, id: DispatcherId) -> bool {
        let removed = lock(&self.inner).queues.remove(&id);
        match removed {
            Some(pending) => {
                if !pending.is_empty() {
                    tracing::debug!("Discarding {} pending events on unregister", pending.len());
                }
                true
            }
            None => false,
        }
    }

    /// Queue a task on `id`.
    ///
    /// # Errors
    ///
    /// `QueueFull` if the queue is at capacity, `Usage` if `id` is not
    /// registered.
    pub fn enqueue<F>(&self, id: DispatcherId, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = lock(&self.inner);
        let queue = inner.queues.get_mut(&id).ok_or_else(|| {
            TransportError::Usage(format!("dispatcher queue {:?} is not registered", id))
        })?;
        if queue.len() >= self.capacity {
            return Err(TransportError::QueueFull);
        }
        queue.push_back(Box::new(task));
        Ok(())
    }

    /// Run every task queued on `id` so far, in FIFO order.
    ///
    /// Tasks run on the calling thread without the queue lock held; tasks
    /// they enqueue wait for the next drain. Returns the number run.
    pub fn drain_once(&self, id: DispatcherId) -> usize {
        let batch = match lock(&self.inner).queues.get_mut(&id) {
            Some(queue) => std::mem::take(queue),
            None => return 0,
        };

        let count = batch.len();
        for task in batch {
            task();
        }
        count
    }

    /// Number of tasks waiting on `id`.
    pub fn pending(&self, id: DispatcherId) -> usize {
        lock(&self.inner)
            .queues
            .get(&id)
            .map_or(0, VecDeque::len)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("capacity", &self.capacity)
            .field("queues", &lock(&self.inner).queues.len())
            .finish()
    }
}

/// Where transport events run.
#[derive(Debug, Clone, Default)]
pub enum EventDelivery {
    /// On the I/O task that observed the event.
    #[default]
    Inline,
    /// On whichever thread calls `drain_events()`.
    Queued(Dispatcher),
}

/// A facade's private queue on the chosen delivery route.
pub(crate) struct EventSink {
    route: Option<(Dispatcher, DispatcherId)>,
}

impl EventSink {
    pub(crate) fn new(delivery: &EventDelivery) -> Self {
        let route = match delivery {
            EventDelivery::Inline => None,
            EventDelivery::Queued(dispatcher) => Some((dispatcher.clone(), dispatcher.register())),
        };
        Self { route }
    }

    /// Run `event` now, or queue it for the next drain.
    pub(crate) fn emit<F>(&self, event: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.route {
            None => event(),
            Some((dispatcher, id)) => {
                if let Err(e) = dispatcher.enqueue(*id, event) {
                    tracing::warn!("Dropping transport event: {}", e);
                }
            }
        }
    }

    /// Run queued events. Always 0 for inline delivery.
    pub(crate) fn drain(&self) -> usize {
        match &self.route {
            None => 0,
            Some((dispatcher, id)) => dispatcher.drain_once(*id),
        }
    }
}

impl Drop for EventSink {
    fn drop(&mut self) {
        if let Some((dispatcher, id)) = &self.route {
            dispatcher.unregister(*id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_drain_runs_in_fifo_order() {
        let dispatcher = Dispatcher::new();
        let queue = dispatcher.register();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let seen = seen.clone();
            dispatcher
                .enqueue(queue, move || seen.lock().unwrap().push(i))
                .unwrap();
        }

        assert_eq!(dispatcher.pending(queue), 5);
        assert!(seen.lock().unwrap().is_empty());

        assert_eq!(dispatcher.drain_once(queue), 5);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(dispatcher.pending(queue), 0);
    }

    #[test]
    fn test_queue_full() {
        let dispatcher = Dispatcher::with_capacity(2);
        let queue = dispatcher.register();

        dispatcher.enqueue(queue, || {}).unwrap();
        dispatcher.enqueue(queue, || {}).unwrap();
        assert!(matches!(
            dispatcher.enqueue(queue, || {}),
            Err(TransportError::QueueFull)
        ));

        dispatcher.drain_once(queue);
        assert!(dispatcher.enqueue(queue, || {}).is_ok());
    }

    #[test]
    fn test_queues_are_independent() {
        let dispatcher = Dispatcher::new();
        let a = dispatcher.register();
        let b = dispatcher.register();
        assert_ne!(a, b);

        dispatcher.enqueue(a, || {}).unwrap();
        assert_eq!(dispatcher.drain_once(b), 0);
        assert_eq!(dispatcher.pending(a), 1);
    }

    #[test]
    fn test_unregister_discards_and_rejects() {
        let dispatcher = Dispatcher::new();
        let queue = dispatcher.register();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        dispatcher
            .enqueue(queue, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(dispatcher.unregister(queue));
        assert!(!dispatcher.unregister(queue));
        assert_eq!(dispatcher.drain_once(queue), 0);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(matches!(
            dispatcher.enqueue(queue, || {}),
            Err(TransportError::Usage(_))
        ));
    }

    #[test]
    fn test_tasks_enqueued_during_drain_wait_for_next_drain() {
        let dispatcher = Dispatcher::new();
        let queue = dispatcher.register();

        let inner = dispatcher.clone();
        dispatcher
            .enqueue(queue, move || {
                inner.enqueue(queue, || {}).unwrap();
            })
            .unwrap();

        assert_eq!(dispatcher.drain_once(queue), 1);
        assert_eq!(dispatcher.pending(queue), 1);
        assert_eq!(dispatcher.drain_once(queue), 1);
    }

    #[test]
    fn test_inline_sink_runs_immediately() {
        let sink = EventSink::new(&EventDelivery::Inline);
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        sink.emit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(sink.drain(), 0);
    }

    #[test]
    fn test_queued_sink_defers_until_drain() {
        let dispatcher = Dispatcher::new();
        let sink = EventSink::new(&EventDelivery::Queued(dispatcher.clone()));
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        sink.emit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(sink.drain(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropping_sink_unregisters_queue() {
        let dispatcher = Dispatcher::new();
        let sink = EventSink::new(&EventDelivery::Queued(dispatcher.clone()));
        let id = sink.route.as_ref().map(|(_, id)| *id).unwrap();

        drop(sink);
        assert!(!dispatcher.unregister(id));
    }
}
