//! Reference-counted lazy allocation with debounced teardown
//!
//! The first reference allocates the resource. When the last reference is
//! released the resource is deallocated after a delay, unless it was
//! referenced again in the meantime. This keeps a burst of install and
//! uninstall calls from churning through expensive resources such as thread
//! pools.

use crate::error::Result;
use parking_lot::Mutex;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Delay between the last release and deallocation.
pub const DEALLOCATION_DELAY: Duration = Duration::from_millis(250);

/// Creates and destroys a shared resource.
pub trait Allocate: Send + Sync + 'static {
    /// The shared resource.
    type Resource: Clone + Send + 'static;

    /// Creates the resource. Called with the allocator's lock held.
    ///
    /// # Errors
    ///
    /// Any failure; the allocator stays unallocated.
    fn allocate(&self) -> Result<Self::Resource>;

    /// Destroys the resource. Never called with the allocator's lock held,
    /// and never from within an async runtime.
    fn deallocate(&self, resource: Self::Resource);
}

enum State<R> {
    Unallocated,
    Allocated { resource: R, count: usize },
    Deallocating { resource: R, token: u64 },
}

struct Inner<A: Allocate> {
    allocator: A,
    state: Mutex<State<A::Resource>>,
    next_token: Mutex<u64>,
    delay: Duration,
}

/// Shares one lazily allocated resource between any number of holders.
pub struct SharedResourceAllocator<A: Allocate> {
    inner: Arc<Inner<A>>,
}

impl<A: Allocate> Clone for SharedResourceAllocator<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Allocate> SharedResourceAllocator<A> {
    /// Creates an allocator that tears down [`DEALLOCATION_DELAY`] after the
    /// last release.
    #[must_use]
    pub fn new(allocator: A) -> Self {
        Self::with_delay(allocator, DEALLOCATION_DELAY)
    }

    /// Creates an allocator with a custom teardown delay.
    #[must_use]
    pub fn with_delay(allocator: A, delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                allocator,
                state: Mutex::new(State::Unallocated),
                next_token: Mutex::new(0),
                delay,
            }),
        }
    }

    /// The wrapped allocator.
    #[must_use]
    pub fn allocator(&self) -> &A {
        &self.inner.allocator
    }

    /// Takes a reference, allocating on the first one. A pending teardown
    /// is cancelled and its resource reused.
    ///
    /// # Errors
    ///
    /// Any error from [`Allocate::allocate`].
    pub fn get_or_allocate(&self) -> Result<(A::Resource, DerefHandle<A>)> {
        let mut allocated = false;
        let resource = {
            let mut state = self.inner.state.lock();
            let (resource, count) = match mem::replace(&mut *state, State::Unallocated) {
                State::Unallocated => {
                    allocated = true;
                    (self.inner.allocator.allocate()?, 1)
                }
                State::Allocated { resource, count } => (resource, count + 1),
                State::Deallocating { resource, .. } => (resource, 1),
            };
            *state = State::Allocated {
                resource: resource.clone(),
                count,
            };
            resource
        };

        if allocated {
            debug!("shared resource allocated");
        }

        Ok((
            resource,
            DerefHandle {
                inner: Arc::clone(&self.inner),
                released: AtomicBool::new(false),
            },
        ))
    }

    /// Number of live references.
    #[must_use]
    pub fn count(&self) -> usize {
        match &*self.inner.state.lock() {
            State::Allocated { count, .. } => *count,
            State::Unallocated | State::Deallocating { .. } => 0,
        }
    }

    /// Whether a resource currently exists, including one awaiting teardown.
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        !matches!(*self.inner.state.lock(), State::Unallocated)
    }
}

impl<A: Allocate> fmt::Debug for SharedResourceAllocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.state.lock() {
            State::Unallocated => "unallocated",
            State::Allocated { .. } => "allocated",
            State::Deallocating { .. } => "deallocating",
        };
        f.debug_struct("SharedResourceAllocator")
            .field("state", &state)
            .field("count", &self.count())
            .field("delay", &self.inner.delay)
            .finish()
    }
}

impl<A: Allocate> Inner<A> {
    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock();
        match mem::replace(&mut *state, State::Unallocated) {
            State::Allocated { resource, count } if count > 1 => {
                *state = State::Allocated {
                    resource,
                    count: count - 1,
                };
            }
            State::Allocated { resource, .. } => {
                let token = {
                    let mut next = self.next_token.lock();
                    *next += 1;
                    *next
                };
                *state = State::Deallocating { resource, token };
                drop(state);
                self.schedule_deallocation(token);
            }
            other => {
                *state = other;
                drop(state);
                warn!("shared resource released more times than it was referenced");
            }
        }
    }

    fn schedule_deallocation(self: &Arc<Self>, token: u64) {
        let inner = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("spool-filelog-dealloc".to_string())
            .spawn(move || {
                std::thread::sleep(inner.delay);
                inner.deallocate_if_current(token);
            });

        if let Err(e) = spawned {
            warn!("failed to spawn deallocation thread, deallocating now: {e}");
            self.deallocate_if_current(token);
        }
    }

    fn deallocate_if_current(&self, token: u64) {
        let resource = {
            let mut state = self.state.lock();
            match mem::replace(&mut *state, State::Unallocated) {
                State::Deallocating { resource, token: t } if t == token => Some(resource),
                other => {
                    *state = other;
                    None
                }
            }
        };

        if let Some(resource) = resource {
            self.allocator.deallocate(resource);
            debug!("shared resource deallocated");
        }
    }
}

/// A reference obtained from [`SharedResourceAllocator::get_or_allocate`].
/// Released on drop.
pub struct DerefHandle<A: Allocate> {
    inner: Arc<Inner<A>>,
    released: AtomicBool,
}

impl<A: Allocate> DerefHandle<A> {
    /// Gives up the reference. Releasing twice is a no-op.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.inner.release();
        }
    }

    /// Whether [`DerefHandle::release`] has run.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl<A: Allocate> Drop for DerefHandle<A> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<A: Allocate> fmt::Debug for DerefHandle<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerefHandle")
            .field("released", &self.is_released())
            .finish()
    }
}
