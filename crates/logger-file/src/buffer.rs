//! Bounded multi-producer, single-consumer queue of pending log actions

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::warn;

/// Something that must be finalized exactly once if it is never delivered.
pub trait Obligation: Send {
    /// Consumes an item that will not be processed. `undelivered` is true when
    /// the item was evicted or never reached the consumer.
    fn on_dropped(self, undelivered: bool);
}

/// What a full [`LogBuffer`] does with a new item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Overflow {
    /// The producer waits for space. With capacity 0 every send waits until
    /// the consumer has taken the item.
    #[default]
    Block,
    /// The oldest queued item is evicted to make room.
    DropOldest,
}

/// Returned by [`LogBuffer::send`] once the buffer is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("log buffer is closed")]
pub struct Closed;

enum Poll<T> {
    Item(T),
    Empty,
    Closed,
}

struct State<T> {
    // Items tagged with their send sequence number.
    queue: VecDeque<(u64, T)>,
    closed: bool,
    sent: u64,
    // Sequence number of the last item the consumer took.
    taken: u64,
}

/// A bounded queue with a configurable overflow policy and a drop obligation
/// for every item that is not delivered.
pub struct LogBuffer<T: Obligation> {
    state: Mutex<State<T>>,
    space: Condvar,
    ready: Notify,
    capacity: Option<usize>,
    overflow: Overflow,
    dropped: Arc<AtomicU64>,
}

impl<T: Obligation> LogBuffer<T> {
    /// Creates a buffer. `capacity` of `None` is unbounded.
    #[must_use]
    pub fn new(capacity: Option<usize>, overflow: Overflow) -> Self {
        Self::with_dropped_counter(capacity, overflow, Arc::default())
    }

    /// Creates a buffer that adds every dropped item to `dropped`, which
    /// may be shared with other buffers.
    #[must_use]
    pub fn with_dropped_counter(
        capacity: Option<usize>,
        overflow: Overflow,
        dropped: Arc<AtomicU64>,
    ) -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                closed: false,
                sent: 0,
                taken: 0,
            }),
            space: Condvar::new(),
            ready: Notify::new(),
            capacity,
            overflow,
            dropped,
        }
    }

    /// Creates an unbounded buffer.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(None, Overflow::Block)
    }

    /// Enqueues `item`.
    ///
    /// Under [`Overflow::Block`] this blocks the calling thread while the
    /// buffer is full. If the buffer is or becomes closed before the item is
    /// queued, the item's obligation is fulfilled here.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] if the item was not delivered.
    pub fn send(&self, item: T) -> Result<(), Closed> {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            self.drop_item(item);
            return Err(Closed);
        }

        let Some(capacity) = self.capacity else {
            self.push(&mut state, item);
            return Ok(());
        };

        match self.overflow {
            Overflow::DropOldest => {
                let limit = capacity.max(1);
                let mut evicted = Vec::new();
                while state.queue.len() >= limit {
                    match state.queue.pop_front() {
                        Some((_, oldest)) => evicted.push(oldest),
                        None => break,
                    }
                }
                self.push(&mut state, item);
                drop(state);

                for oldest in evicted {
                    self.drop_item(oldest);
                    warn!("LogBuffer[capacity={capacity}] exceeded. Oldest log has been dropped.");
                }
                Ok(())
            }
            Overflow::Block if capacity == 0 => {
                let ticket = self.push(&mut state, item);
                while state.taken < ticket && !state.closed {
                    self.space.wait(&mut state);
                }
                if state.taken >= ticket {
                    return Ok(());
                }
                // Closed before the handoff. Take the item back unless a
                // draining close already dropped it.
                let position = state.queue.iter().position(|(seq, _)| *seq == ticket);
                let item = position.and_then(|position| state.queue.remove(position));
                drop(state);
                if let Some((_, item)) = item {
                    self.drop_item(item);
                }
                Err(Closed)
            }
            Overflow::Block => {
                while state.queue.len() >= capacity && !state.closed {
                    self.space.wait(&mut state);
                }
                if state.closed {
                    drop(state);
                    self.drop_item(item);
                    return Err(Closed);
                }
                self.push(&mut state, item);
                Ok(())
            }
        }
    }

    fn push(&self, state: &mut State<T>, item: T) -> u64 {
        state.sent += 1;
        state.queue.push_back((state.sent, item));
        self.ready.notify_one();
        state.sent
    }

    fn drop_item(&self, item: T) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        item.on_dropped(true);
    }

    fn poll(&self) -> Poll<T> {
        let mut state = self.state.lock();
        if let Some((seq, item)) = state.queue.pop_front() {
            state.taken = seq;
            self.space.notify_all();
            Poll::Item(item)
        } else if state.closed {
            Poll::Closed
        } else {
            Poll::Empty
        }
    }

    /// Takes the next item without waiting.
    pub fn try_recv(&self) -> Option<T> {
        match self.poll() {
            Poll::Item(item) => Some(item),
            Poll::Empty | Poll::Closed => None,
        }
    }

    /// Waits for the next item. Returns `None` once the buffer is closed and
    /// empty. Must only be awaited by a single consumer.
    pub async fn recv(&self) -> Option<T> {
        loop {
            match self.poll() {
                Poll::Item(item) => return Some(item),
                Poll::Closed => return None,
                Poll::Empty => self.ready.notified().await,
            }
        }
    }

    /// Closes the buffer. Queued items stay available to the consumer.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.space.notify_all();
        self.ready.notify_one();
    }

    /// Closes the buffer and drops every queued item, returning how many
    /// were dropped.
    pub fn close_and_drain(&self) -> u64 {
        let remaining: Vec<T> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.queue.drain(..).map(|(_, item)| item).collect()
        };
        self.space.notify_all();
        self.ready.notify_one();

        let count = remaining.len() as u64;
        for item in remaining {
            self.drop_item(item);
        }
        count
    }

    /// Whether [`LogBuffer::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total items dropped through eviction, closure or draining, as read
    /// from the (possibly shared) counter.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T: Obligation> fmt::Debug for LogBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogBuffer")
            .field("capacity", &self.capacity)
            .field("overflow", &self.overflow)
            .field("len", &self.len())
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[derive(Debug)]
    struct Item {
        id: u32,
        dropped: Arc<AtomicU64>,
    }

    impl Obligation for Item {
        fn on_dropped(self, undelivered: bool) {
            assert!(undelivered);
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn items(dropped: &Arc<AtomicU64>, n: u32) -> impl Iterator<Item = Item> + '_ {
        (0..n).map(move |id| Item {
            id,
            dropped: Arc::clone(dropped),
        })
    }

    #[test]
    fn test_drain_completeness() {
        for n in [0, 1, 7, 64] {
            let dropped = Arc::new(AtomicU64::new(0));
            let buffer = LogBuffer::unbounded();
            for item in items(&dropped, n) {
                buffer.send(item).unwrap();
            }

            let mut received = 0;
            for _ in 0..n / 2 {
                assert!(buffer.try_recv().is_some());
                received += 1;
            }

            let drained = buffer.close_and_drain();
            assert_eq!(received + drained, u64::from(n));
            assert_eq!(dropped.load(Ordering::SeqCst), drained);
            assert!(buffer.try_recv().is_none());
        }
    }

    #[test]
    fn test_send_after_close_drops_once() {
        let dropped = Arc::new(AtomicU64::new(0));
        let buffer = LogBuffer::unbounded();
        buffer.close();
        let mut it = items(&dropped, 1);
        assert_eq!(buffer.send(it.next().unwrap()), Err(Closed));
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(buffer.dropped(), 1);
    }

    #[test]
    #[traced_test]
    fn test_drop_oldest() {
        let dropped = Arc::new(AtomicU64::new(0));
        let buffer = LogBuffer::new(Some(2), Overflow::DropOldest);
        for item in items(&dropped, 5) {
            buffer.send(item).unwrap();
        }

        assert_eq!(dropped.load(Ordering::SeqCst), 3);
        assert_eq!(buffer.try_recv().map(|i| i.id), Some(3));
        assert_eq!(buffer.try_recv().map(|i| i.id), Some(4));
        assert!(buffer.try_recv().is_none());
        assert!(logs_contain("Oldest log has been dropped."));
    }

    #[test]
    fn test_drop_oldest_zero_capacity_keeps_latest() {
        let dropped = Arc::new(AtomicU64::new(0));
        let buffer = LogBuffer::new(Some(0), Overflow::DropOldest);
        for item in items(&dropped, 3) {
            buffer.send(item).unwrap();
        }
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
        assert_eq!(buffer.try_recv().map(|i| i.id), Some(2));
    }

    #[test]
    fn test_block_waits_for_space() {
        let dropped = Arc::new(AtomicU64::new(0));
        let buffer = Arc::new(LogBuffer::new(Some(1), Overflow::Block));
        let mut it = items(&dropped, 2);
        buffer.send(it.next().unwrap()).unwrap();

        let second = it.next().unwrap();
        let producer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || buffer.send(second))
        };

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.try_recv().map(|i| i.id), Some(0));
        producer.join().unwrap().unwrap();
        assert_eq!(buffer.try_recv().map(|i| i.id), Some(1));
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_block_close_wakes_producer() {
        let dropped = Arc::new(AtomicU64::new(0));
        let buffer = Arc::new(LogBuffer::new(Some(1), Overflow::Block));
        let mut it = items(&dropped, 2);
        buffer.send(it.next().unwrap()).unwrap();

        let second = it.next().unwrap();
        let producer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || buffer.send(second))
        };

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(buffer.close_and_drain(), 1);
        assert_eq!(producer.join().unwrap(), Err(Closed));
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_rendezvous_close_takes_item_back() {
        let dropped = Arc::new(AtomicU64::new(0));
        let buffer = Arc::new(LogBuffer::new(Some(0), Overflow::Block));
        let mut it = items(&dropped, 2);
        let (first, second) = (it.next().unwrap(), it.next().unwrap());

        let producers = [first, second].map(|item| {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || buffer.send(item))
        });
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(buffer.len(), 2);

        buffer.close();
        for producer in producers {
            assert_eq!(producer.join().unwrap(), Err(Closed));
        }

        // Each refused item was dropped once and never reaches the consumer.
        assert!(buffer.try_recv().is_none());
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(buffer.close_and_drain(), 0);
    }

    #[test]
    fn test_rendezvous_close_after_handoff() {
        let dropped = Arc::new(AtomicU64::new(0));
        let buffer = Arc::new(LogBuffer::new(Some(0), Overflow::Block));
        let mut it = items(&dropped, 2);
        let (first, second) = (it.next().unwrap(), it.next().unwrap());

        let producers = [first, second].map(|item| {
            let buffer = Arc::clone(&buffer);
            let producer = std::thread::spawn(move || buffer.send(item));
            std::thread::sleep(Duration::from_millis(30));
            producer
        });

        // The first item is handed off, the second is refused by the close.
        assert_eq!(buffer.try_recv().map(|i| i.id), Some(0));
        buffer.close();
        let [first, second] = producers;
        assert_eq!(first.join().unwrap(), Ok(()));
        assert_eq!(second.join().unwrap(), Err(Closed));
        assert!(buffer.try_recv().is_none());
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rendezvous() {
        let dropped = Arc::new(AtomicU64::new(0));
        let buffer = Arc::new(LogBuffer::new(Some(0), Overflow::Block));
        let mut it = items(&dropped, 1);
        let item = it.next().unwrap();

        let producer = {
            let buffer = Arc::clone(&buffer);
            tokio::task::spawn_blocking(move || buffer.send(item))
        };

        let received = buffer.recv().await.unwrap();
        assert_eq!(received.id, 0);
        producer.await.unwrap().unwrap();

        buffer.close();
        assert!(buffer.recv().await.is_none());
    }
}
