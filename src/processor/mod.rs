//! The processor façade.
//!
//! # Overview
//!
//! A [`Processor`] owns a fixed [`SlotPool`], an [`IntakeQueue`] shared with caller
//! threads and a single worker thread that drives a [`TransportEngine`].
//!
//! Submitting a request is entirely non-blocking for the caller:
//!
//! 1. the caller leases the slot (one compare-and-swap; busy slots fail fast),
//! 2. copies the request into the slot's bounded buffers and installs its handler,
//! 3. pushes the lease onto the intake queue and wakes the worker.
//!
//! The worker registers queued transfers with the engine, keeps their leases in an
//! [`InFlightRegistry`] and, when the engine reports a transfer finished, calls
//! exactly one of the handler's methods before dropping the lease. The slot is Free
//! again from that point on.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::mpsc;
//!
//! use reqpool::{Outcome, Processor, ProcessorConfig, RequestData};
//!
//! let processor = Processor::new(ProcessorConfig::default().with_capacity(4))?;
//! processor.start()?;
//!
//! let (tx, rx) = mpsc::channel();
//! processor.get(0, &RequestData::new("http://127.0.0.1:8080/ping"), tx)?;
//!
//! if let Outcome::Success { status, body, .. } = rx.recv()? {
//!     println!("{status}: {}", String::from_utf8_lossy(&body));
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # See Also
//!
//! - [`slot`](crate::slot): leasing and the per-slot buffers.
//! - [`transport`](crate::transport): the engine boundary.
use std::{
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use log::{debug, error, info, warn};
use thiserror::Error;

mod queue;
mod registry;
mod worker;

pub use queue::IntakeQueue;
pub use registry::InFlightRegistry;

use worker::{Worker, WorkerLoop, deliver};

use crate::{
    config::{ConfigError, ProcessorConfig},
    slot::{Lease, Method, RequestData, ResponseHandler, SlotError, SlotPool},
    transport::{HandleId, HttpEngine, TransferError, TransportEngine, TransportError, Wake},
};

/// Identifies a submitted transaction; the id of the slot's easy handle.
pub type TransactionId = HandleId;

/// Coarse result of a processor call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorStatus {
    Ok,
    ObjectBusy,
    UnknownObject,
    NotEnoughMemory,
    UnknownError,
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("slot {0} is busy")]
    ObjectBusy(usize),

    #[error("no slot at index {0}")]
    UnknownObject(usize),

    #[error("cannot build {requested} slots, the pool holds between 1 and {ceiling}")]
    NotEnoughMemory { requested: usize, ceiling: usize },

    #[error("slot {0} was never prepared")]
    NotPrepared(usize),

    #[error("intake queue refused slot {0}")]
    QueueFull(usize),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(io::Error),

    #[error("worker is still shutting down")]
    Stopping,

    #[error("worker state was lost after a panic")]
    WorkerUnavailable,
}

impl ProcessorError {
    pub fn status(&self) -> ProcessorStatus {
        match self {
            ProcessorError::ObjectBusy(_) => ProcessorStatus::ObjectBusy,
            ProcessorError::UnknownObject(_) => ProcessorStatus::UnknownObject,
            ProcessorError::NotEnoughMemory { .. } => ProcessorStatus::NotEnoughMemory,
            _ => ProcessorStatus::UnknownError,
        }
    }
}

impl From<SlotError> for ProcessorError {
    fn from(value: SlotError) -> Self {
        match value {
            SlotError::Capacity { requested, ceiling } => {
                ProcessorError::NotEnoughMemory { requested, ceiling }
            }
            SlotError::UnknownObject(index) => ProcessorError::UnknownObject(index),
            SlotError::Busy(index) => ProcessorError::ObjectBusy(index),
            SlotError::Engine(e) => ProcessorError::Transport(e),
        }
    }
}

impl<T> From<&Result<T, ProcessorError>> for ProcessorStatus {
    fn from(value: &Result<T, ProcessorError>) -> Self {
        match value {
            Ok(_) => ProcessorStatus::Ok,
            Err(e) => e.status(),
        }
    }
}

/// Lock `mutex`, carrying on with the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fixed-slot asynchronous HTTP transaction processor.
///
/// Every method takes `&self`; share the processor between threads with an `Arc`.
pub struct Processor<E: TransportEngine = HttpEngine> {
    pool: Arc<SlotPool<E::Easy>>,
    intake: Arc<Mutex<IntakeQueue<E::Easy>>>,
    waker: Arc<dyn Wake>,
    worker: Worker<E>,
}

impl Processor<HttpEngine> {
    /// Build a processor on the shipped HTTP/1.1 engine. The worker is not started.
    pub fn new(config: ProcessorConfig) -> Result<Self, ProcessorError> {
        config.validate()?;
        let engine = HttpEngine::with_limits(config.transfer_limits())?;
        Self::with_engine(config, engine)
    }
}

impl<E: TransportEngine> Processor<E> {
    pub fn with_engine(config: ProcessorConfig, mut engine: E) -> Result<Self, ProcessorError> {
        config.validate()?;

        let pool = SlotPool::create(config.capacity, &mut engine).map_err(|e| {
            error!("failed to build slot pool: {e}");
            ProcessorError::from(e)
        })?;
        let pool = Arc::new(pool);
        let intake = Arc::new(Mutex::new(IntakeQueue::new(pool.size())));
        let waker = engine.waker();

        let worker_loop = WorkerLoop::new(
            engine,
            Arc::clone(&intake),
            pool.size(),
            config.poll_timeout,
            config.fail_on_http_error,
        );
        debug!("processor created with {} slots", pool.size());

        Ok(Self {
            pool,
            intake,
            waker,
            worker: Worker::new(worker_loop),
        })
    }

    /// Start the worker thread. Calling it while running is a no-op; calling it
    /// while another thread is inside [`Processor::stop`] fails with
    /// [`ProcessorError::Stopping`].
    pub fn start(&self) -> Result<(), ProcessorError> {
        self.worker.start()
    }

    /// Stop the worker and wait for it. In-flight transactions receive
    /// [`TransferError::Cancelled`]; queued ones stay queued until the next start.
    ///
    /// Handlers may call back into the processor while it stops. From a handler
    /// this only asks the worker to exit and returns without waiting.
    pub fn stop(&self) {
        self.worker.stop();
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    pub fn number_of_slots(&self) -> usize {
        self.pool.size()
    }

    pub fn transaction_id(&self, index: usize) -> Result<TransactionId, ProcessorError> {
        Ok(self.pool.get(index)?.handle())
    }

    /// Snapshot only: the slot may change state right after.
    pub fn is_busy(&self, index: usize) -> Result<bool, ProcessorError> {
        Ok(self.pool.get(index)?.is_busy())
    }

    pub fn get(
        &self,
        index: usize,
        data: &RequestData,
        handler: impl ResponseHandler,
    ) -> Result<TransactionId, ProcessorError> {
        self.submit(index, Method::Get, data, handler)
    }

    pub fn post(
        &self,
        index: usize,
        data: &RequestData,
        handler: impl ResponseHandler,
    ) -> Result<TransactionId, ProcessorError> {
        self.submit(index, Method::Post, data, handler)
    }

    pub fn put(
        &self,
        index: usize,
        data: &RequestData,
        handler: impl ResponseHandler,
    ) -> Result<TransactionId, ProcessorError> {
        self.submit(index, Method::Put, data, handler)
    }

    pub fn delete(
        &self,
        index: usize,
        data: &RequestData,
        handler: impl ResponseHandler,
    ) -> Result<TransactionId, ProcessorError> {
        self.submit(index, Method::Delete, data, handler)
    }

    /// Queue a request on slot `index`. `handler` runs on the worker thread once
    /// the transaction finishes, fails or is cancelled.
    pub fn submit(
        &self,
        index: usize,
        method: Method,
        data: &RequestData,
        handler: impl ResponseHandler,
    ) -> Result<TransactionId, ProcessorError> {
        let mut lease = self.lease(index)?;
        lease.configure(method, data, Box::new(handler));

        let transaction = lease.handle();
        self.enqueue(lease)?;
        debug!("slot {index} queued {method} {transaction}");
        Ok(transaction)
    }

    /// Configure slot `index` without queueing it. See [`Processor::make_request`].
    pub fn prepare_request(
        &self,
        index: usize,
        method: Method,
        data: &RequestData,
        handler: impl ResponseHandler,
    ) -> Result<(), ProcessorError> {
        let mut lease = self.lease(index)?;
        lease.configure(method, data, Box::new(handler));
        debug!("slot {index} prepared for {method}");
        Ok(())
    }

    /// Queue whatever slot `index` was last prepared or submitted with.
    pub fn make_request(&self, index: usize) -> Result<TransactionId, ProcessorError> {
        if self.pool.get(index)?.is_busy() {
            debug!("slot {index} busy, not making request");
            return Err(ProcessorError::ObjectBusy(index));
        }

        let mut lease = self.lease(index)?;
        if !lease.is_prepared() {
            warn!("slot {index} has no prepared request");
            return Err(ProcessorError::NotPrepared(index));
        }
        lease.rearm();

        let transaction = lease.handle();
        self.enqueue(lease)?;
        debug!("slot {index} queued prepared {transaction}");
        Ok(transaction)
    }

    fn lease(&self, index: usize) -> Result<Lease<E::Easy>, ProcessorError> {
        SlotPool::lease(&self.pool, index).map_err(|e| {
            match &e {
                SlotError::Busy(_) => debug!("{e}"),
                _ => warn!("{e}"),
            }
            ProcessorError::from(e)
        })
    }

    fn enqueue(&self, lease: Lease<E::Easy>) -> Result<(), ProcessorError> {
        let index = lease.index();
        let pushed = lock(&self.intake).push(lease);
        if pushed.is_err() {
            error!("intake queue full, releasing slot {index}");
            return Err(ProcessorError::QueueFull(index));
        }

        if let Err(e) = self.waker.wake() {
            warn!("failed to wake worker: {e}");
        }
        Ok(())
    }
}

impl<E: TransportEngine> Drop for Processor<E> {
    fn drop(&mut self) {
        self.worker.stop();

        let mut queue = lock(&self.intake);
        if !queue.is_empty() {
            info!("cancelling {} queued transactions", queue.len());
        }
        while let Some(mut lease) = queue.pop() {
            deliver(&mut lease, |lease| lease.fail(TransferError::Cancelled));
        }
    }
}
