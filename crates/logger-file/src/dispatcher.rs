//! Background runtimes that run write loops

use crate::allocator::{Allocate, DerefHandle, SharedResourceAllocator};
use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

/// Worker threads of the process-wide default pool.
pub const DEFAULT_POOL_THREADS: usize = 2;

static DEFAULT_POOL: Lazy<ThreadPool> = Lazy::new(|| ThreadPool {
    allocator: SharedResourceAllocator::new(RuntimeAllocator {
        threads: DEFAULT_POOL_THREADS,
    }),
});

static POOL_ID: AtomicU64 = AtomicU64::new(0);

pub(crate) struct RuntimeAllocator {
    threads: usize,
}

impl Allocate for RuntimeAllocator {
    type Resource = Arc<Runtime>;

    fn allocate(&self) -> Result<Arc<Runtime>> {
        let id = POOL_ID.fetch_add(1, Ordering::Relaxed);
        let runtime = Builder::new_multi_thread()
            .worker_threads(self.threads)
            .thread_name(format!("spool-filelog-pool-{id}"))
            .enable_all()
            .build()
            .map_err(|e| Error::Allocation(e.to_string()))?;
        debug!(id, threads = self.threads, "log dispatcher started");
        Ok(Arc::new(runtime))
    }

    fn deallocate(&self, runtime: Arc<Runtime>) {
        match Arc::try_unwrap(runtime) {
            Ok(runtime) => runtime.shutdown_background(),
            Err(_) => debug!("log dispatcher still referenced, leaving shutdown to the last owner"),
        }
    }
}

/// A lazily started, shared set of threads on which [`crate::FileLog`]
/// write loops run.
///
/// The runtime starts when the first log using the pool is installed and
/// stops shortly after the last one is uninstalled. Clones share the pool.
#[derive(Clone)]
pub struct ThreadPool {
    allocator: SharedResourceAllocator<RuntimeAllocator>,
}

impl ThreadPool {
    /// Creates a pool with `threads` worker threads.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `threads` is 0.
    pub fn new(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(Error::Validation("thread pool needs at least 1 thread".to_string()));
        }
        Ok(Self {
            allocator: SharedResourceAllocator::new(RuntimeAllocator { threads }),
        })
    }

    /// The process-wide pool used when none is configured.
    #[must_use]
    pub fn shared() -> Self {
        DEFAULT_POOL.clone()
    }

    /// Number of worker threads.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.allocator.allocator().threads
    }

    /// Whether the runtime is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.allocator.is_allocated()
    }

    /// Number of installed logs using the pool.
    #[must_use]
    pub fn references(&self) -> usize {
        self.allocator.count()
    }

    pub(crate) fn acquire(&self) -> Result<(Handle, DerefHandle<RuntimeAllocator>)> {
        let (runtime, handle) = self.allocator.get_or_allocate()?;
        Ok((runtime.handle().clone(), handle))
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::shared()
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("threads", &self.threads())
            .field("allocator", &self.allocator)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_zero_threads_rejected() {
        assert!(matches!(ThreadPool::new(0), Err(Error::Validation(_))));
    }

    #[test]
    fn test_runs_and_tears_down() {
        let pool = ThreadPool::new(1).unwrap();
        assert!(!pool.is_running());

        let (handle, reference) = pool.acquire().unwrap();
        let name = handle
            .block_on(async {
                tokio::spawn(async { std::thread::current().name().map(str::to_string) }).await
            })
            .unwrap();
        assert!(name.unwrap().starts_with("spool-filelog-pool-"));
        assert_eq!(pool.references(), 1);

        drop(reference);
        assert!(pool.is_running());
        std::thread::sleep(Duration::from_secs(1));
        assert!(!pool.is_running());
    }
}
