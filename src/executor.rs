//! Worker pool shared by publishers and subscribers.
//!
//! An [`Executor`] owns a multi-threaded tokio runtime. Every socket
//! operation, timer and session task of the publishers and subscribers
//! created from it runs on its worker threads. One executor may back any
//! number of publishers and subscribers.
//!
//! [`SerialContext`] is an ordered job queue on top of the pool: jobs posted
//! to one context run one after another, in post order, even though the
//! pool itself is multi-threaded.
//!
//! # Example
//!
//! ```
//! use tcp_pubsub::Executor;
//!
//! let executor = Executor::new(4).unwrap();
//! let answer = executor.handle().block_on(executor.spawn(async { 21 * 2 })).unwrap();
//! assert_eq!(answer, 42);
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{PubSubError, Result};

/// Boxed future for queued jobs.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Worker thread name prefix.
const WORKER_THREAD_NAME: &str = "tcp-pubsub-worker";

struct ExecutorInner {
    /// `None` when wrapping a runtime owned by someone else.
    runtime: Option<Runtime>,
    handle: Handle,
    worker_threads: usize,
}

impl Drop for ExecutorInner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            // Never blocks, so the last reference may go away on a worker.
            runtime.shutdown_background();
        }
    }
}

/// Shared handle to a worker pool. Cloning is cheap.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl Executor {
    /// Start a worker pool with `thread_count` threads (at least one).
    ///
    /// # Errors
    ///
    /// Returns `Runtime` if the OS refuses to create the runtime.
    pub fn new(thread_count: usize) -> Result<Self> {
        let worker_threads = thread_count.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name(WORKER_THREAD_NAME)
            .enable_all()
            .build()
            .map_err(PubSubError::Runtime)?;

        tracing::debug!("Executor started with {} worker threads", worker_threads);

        let handle = runtime.handle().clone();
        Ok(Self {
            inner: Arc::new(ExecutorInner {
                runtime: Some(runtime),
                handle,
                worker_threads,
            }),
        })
    }

    /// Run on an existing tokio runtime instead of owning one.
    ///
    /// The runtime must have IO and time drivers enabled.
    pub fn from_handle(handle: Handle) -> Self {
        let worker_threads = handle.metrics().num_workers();
        Self {
            inner: Arc::new(ExecutorInner {
                runtime: None,
                handle,
                worker_threads,
            }),
        }
    }

    /// Runtime handle, for entering the runtime or blocking on a future.
    #[inline]
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Number of worker threads.
    pub fn worker_threads(&self) -> usize {
        self.inner.worker_threads
    }

    /// Submit a task to the pool.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.handle.spawn(future)
    }

    /// Create a new ordered job queue running on this pool.
    pub fn serial_context(&self, name: impl Into<String>) -> SerialContext {
        SerialContext::new(&self.inner.handle, name)
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("worker_threads", &self.inner.worker_threads)
            .field("owns_runtime", &self.inner.runtime.is_some())
            .finish()
    }
}

/// Ordered job queue.
///
/// Each posted job is awaited to completion before the next one starts.
/// The consumer task ends once every clone of the context is dropped and the
/// queue has drained.
#[derive(Clone)]
pub struct SerialContext {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

impl SerialContext {
    /// Start a context whose consumer task runs on `handle`.
    pub(crate) fn new(handle: &Handle, name: impl Into<String>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        let name: String = name.into();
        let name: Arc<str> = Arc::from(name);

        let task_name = name.clone();
        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            tracing::trace!("Serial context {} drained", task_name);
        });

        Self { name, tx }
    }

    /// Queue a job. Never blocks.
    ///
    /// Returns `false` if the runtime is gone and the job was dropped.
    pub fn post<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tx.send(Box::pin(job)).is_ok()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for SerialContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialContext")
            .field("name", &self.name)
            .finish()
    }
}
