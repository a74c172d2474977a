//! Bounded pools of asynchronous workers
//!
//! A [`WorkerPool`] does not own any threads. Instead, every submitted task is spawned onto
//! the tokio runtime and has to acquire a permit from the pool before it starts executing.
//! This bounds the number of concurrently running tasks per pool while still allowing
//! pools to be cheaply cloned and shared between multiple consumers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{trace, Instrument};

/// Name of the pool that is used when nothing else has been requested
pub const DEFAULT_POOL_NAME: &str = "default";

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Decrements the in-flight counter when a task finishes, even if it panicked
struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Cloneable handle to a bounded set of concurrently running tasks
#[derive(Clone, Debug)]
pub struct WorkerPool {
    name: Arc<str>,
    size: usize,
    permits: Arc<Semaphore>,
    in_flight: Arc<InFlight>,
}

impl WorkerPool {
    /// Creates a new pool which runs at most `size` tasks at once (at least one)
    pub fn new(name: &str, size: usize) -> Self {
        let size = size.max(1);

        Self {
            name: name.into(),
            size,
            permits: Arc::new(Semaphore::new(size)),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Identifier of the pool used in log messages
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum number of concurrently executing tasks
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of tasks that are currently executing
    pub fn busy(&self) -> usize {
        self.size - self.permits.available_permits()
    }

    /// Number of tasks that have been submitted but not yet finished, including waiting ones
    pub fn pending(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    /// Schedules a task for execution
    ///
    /// The task is spawned immediately but does not start running until a worker slot becomes available.
    pub fn submit<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        self.in_flight.count.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard(self.in_flight.clone());
        let span = tracing::trace_span!("worker", pool = %self.name);

        tokio::spawn(
            async move {
                let _guard = guard;
                // The semaphore is never closed, thus the permit is always granted eventually
                let _permit = permits.acquire_owned().await.ok();
                trace!("Acquired worker slot");
                task.await;
            }
            .instrument(span),
        )
    }

    /// Waits until every submitted task has finished
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.in_flight.idle.notified();

            if self.pending() == 0 {
                return;
            }

            idle.await;
        }
    }
}

/// Registry of worker pools available to routes
///
/// It is assembled once at startup and contains a default pool as well as any number of
/// named, dedicated pools for subscribers that should not compete with others for workers.
#[derive(Clone, Debug)]
pub struct WorkerPools {
    default: WorkerPool,
    named: HashMap<String, WorkerPool>,
}

impl WorkerPools {
    /// Creates a new registry with a default pool of the given size
    pub fn new(default_size: usize) -> Self {
        Self {
            default: WorkerPool::new(DEFAULT_POOL_NAME, default_size),
            named: HashMap::new(),
        }
    }

    /// Pool used by routes which do not request a dedicated one
    pub fn default_pool(&self) -> &WorkerPool {
        &self.default
    }

    /// Creates a new dedicated pool, replacing any previous pool with the same name
    pub fn new_pool(&mut self, name: &str, size: usize) -> WorkerPool {
        let pool = WorkerPool::new(name, size);
        self.named.insert(name.to_owned(), pool.clone());
        pool
    }

    /// Looks up a pool by name, falling back to the default pool for [`DEFAULT_POOL_NAME`]
    pub fn pool(&self, name: &str) -> Option<&WorkerPool> {
        if name == DEFAULT_POOL_NAME {
            Some(&self.default)
        } else {
            self.named.get(name)
        }
    }

    /// Iterator over all pools including the default one
    pub fn iter(&self) -> impl Iterator<Item = &WorkerPool> {
        std::iter::once(&self.default).chain(self.named.values())
    }
}
