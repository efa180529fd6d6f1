//! Serialized execution contexts.
//!
//! Every service runs its lifecycle hooks and slots as jobs on a [`Worker`]: a
//! tokio task draining a FIFO queue, so at most one job runs at a time per
//! worker. Services may share a named worker, in which case they are
//! serialized together.
//!
//! A task-local call chain records which workers and services the current
//! synchronous call path has passed through. A job posted to a worker that is
//! already on the chain runs inline (its queue is blocked on us), and callers
//! use [`in_chain`] to refuse re-entering a busy service. The chain also
//! carries the resolver's "resolving" flag across worker hops.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::SvcError;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        WorkerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// One step of the synchronous call chain.
#[derive(Debug, Clone)]
pub struct Frame {
    pub worker: WorkerId,
    pub service: String,
}

/// Workers and services the current synchronous call path went through, plus
/// whether it runs inside a resolver pass.
#[derive(Debug, Clone, Default)]
pub struct CallChain {
    frames: Vec<Frame>,
    resolving: bool,
}

impl CallChain {
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_resolving(&self) -> bool {
        self.resolving
    }

    fn pushed(&self, frame: Frame) -> Self {
        let mut frames = Vec::with_capacity(self.frames.len() + 1);
        frames.extend(self.frames.iter().cloned());
        frames.push(frame);
        Self {
            frames,
            resolving: self.resolving,
        }
    }
}

tokio::task_local! {
    static CALL_CHAIN: Arc<CallChain>;
}

/// The chain of the current task (empty outside any job).
pub fn current_chain() -> Arc<CallChain> {
    CALL_CHAIN.try_with(Arc::clone).unwrap_or_default()
}

/// True if `service` is currently running a job somewhere up the call chain.
pub fn in_chain(service: &str) -> bool {
    CALL_CHAIN
        .try_with(|chain| chain.frames.iter().any(|f| f.service == service))
        .unwrap_or(false)
}

/// True while the current call path belongs to a resolver pass.
pub fn is_resolving() -> bool {
    CALL_CHAIN.try_with(|chain| chain.resolving).unwrap_or(false)
}

/// Runs `fut` with an explicit call chain, e.g. inside a spawned child task.
pub fn with_chain<F: Future>(chain: Arc<CallChain>, fut: F) -> impl Future<Output = F::Output> {
    CALL_CHAIN.scope(chain, fut)
}

/// Runs `fut` outside of any call chain.
pub fn detached<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    with_chain(Arc::default(), fut)
}

/// Runs `fut` on the current chain with the resolving flag set.
pub fn resolving<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    let mut chain = (*current_chain()).clone();
    chain.resolving = true;
    with_chain(Arc::new(chain), fut)
}

pub struct Worker {
    id: WorkerId,
    name: String,
    tx: mpsc::UnboundedSender<Job>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl Worker {
    /// Spawns the worker task on the current tokio runtime. The task ends when
    /// the last handle is dropped and the queue is drained.
    pub fn spawn(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let task_name = name.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            tracing::trace!(worker = %task_name, "Worker drained");
        });
        Arc::new(Self {
            id: WorkerId::next(),
            name,
            tx,
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `fut` as a job for `service` and waits for its result.
    pub async fn run<F, T>(&self, service: &str, fut: F) -> Result<T, SvcError>
    where
        F: Future<Output = Result<T, SvcError>> + Send + 'static,
        T: Send + 'static,
    {
        let chain = current_chain();
        let inline = chain.frames.iter().any(|f| f.worker == self.id);
        let scoped = CALL_CHAIN.scope(
            Arc::new(chain.pushed(Frame {
                worker: self.id,
                service: service.to_string(),
            })),
            fut,
        );

        if inline {
            return scoped.await;
        }

        let (tx, rx) = oneshot::channel();
        let worker = self.name.clone();
        let job: Job = Box::pin(async move {
            match AssertUnwindSafe(scoped).catch_unwind().await {
                Ok(out) => {
                    let _ = tx.send(out);
                }
                Err(_) => tracing::error!(worker = %worker, "Job panicked"),
            }
        });
        self.tx
            .send(job)
            .map_err(|_| SvcError::JobAborted(self.name.clone()))?;
        rx.await
            .map_err(|_| SvcError::JobAborted(self.name.clone()))?
    }

    /// Queues `fut` as a job for `service` without waiting for it. The job
    /// runs on a fresh call chain, not the caller's.
    pub fn post<F>(&self, service: &str, fut: F) -> Result<(), SvcError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let chain = CallChain::default().pushed(Frame {
            worker: self.id,
            service: service.to_string(),
        });
        let scoped = CALL_CHAIN.scope(Arc::new(chain), fut);
        let worker = self.name.clone();
        let job: Job = Box::pin(async move {
            if AssertUnwindSafe(scoped).catch_unwind().await.is_err() {
                tracing::error!(worker = %worker, "Job panicked");
            }
        });
        self.tx
            .send(job)
            .map_err(|_| SvcError::JobAborted(self.name.clone()))
    }
}

/// Named workers shared between services.
#[derive(Debug, Default)]
pub struct WorkerPool {
    named: Mutex<HashMap<String, Weak<Worker>>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live worker called `name`, spawning it if needed.
    pub fn named(&self, name: &str) -> Arc<Worker> {
        let mut named = self.named.lock();
        named.retain(|_, w| w.strong_count() > 0);
        if let Some(w) = named.get(name).and_then(Weak::upgrade) {
            return w;
        }
        let w = Worker::spawn(name);
        named.insert(name.to_string(), Arc::downgrade(&w));
        w
    }

    pub fn live_count(&self) -> usize {
        self.named
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}
