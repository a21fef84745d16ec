use std::{
    mem,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, TryLockError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, info, trace, warn};

use super::{ProcessorError, lock, queue::IntakeQueue, registry::InFlightRegistry};
use crate::{
    slot::Lease,
    transport::{Completion, TransferError, TransportEngine, Wake},
};

const THREAD_NAME: &str = "reqpool-worker";

/// Upper bound on the back-off after a failed poll.
const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Run `f` against the lease, surviving a panicking handler.
pub(crate) fn deliver<H>(lease: &mut Lease<H>, f: impl FnOnce(&mut Lease<H>)) {
    let index = lease.index();
    if panic::catch_unwind(AssertUnwindSafe(|| f(lease))).is_err() {
        error!("handler for slot {index} panicked, releasing the slot");
    }
}

/// State of the event loop. Owned by exactly one thread at a time: the worker
/// thread while it runs, the parking spot in [`Worker`] between runs.
pub(crate) struct WorkerLoop<E: TransportEngine> {
    engine: E,
    registry: InFlightRegistry<E::Easy>,
    intake: Arc<Mutex<IntakeQueue<E::Easy>>>,
    pending: Vec<Lease<E::Easy>>,
    completions: Vec<Completion>,
    poll_timeout: Duration,
    fail_on_http_error: bool,
}

impl<E: TransportEngine> WorkerLoop<E> {
    pub(crate) fn new(
        engine: E,
        intake: Arc<Mutex<IntakeQueue<E::Easy>>>,
        capacity: usize,
        poll_timeout: Duration,
        fail_on_http_error: bool,
    ) -> Self {
        Self {
            engine,
            registry: InFlightRegistry::new(capacity),
            intake,
            pending: Vec::with_capacity(capacity),
            completions: Vec::with_capacity(capacity),
            poll_timeout,
            fail_on_http_error,
        }
    }

    pub(crate) fn waker(&self) -> Arc<dyn Wake> {
        self.engine.waker()
    }

    /// Loop until `terminate` is seen at the end of an iteration, then cancel
    /// whatever is still in flight.
    ///
    /// A panic inside the engine fails every in-flight transfer with
    /// [`TransferError::EngineFailure`] and the loop carries on.
    pub(crate) fn run(&mut self, terminate: &AtomicBool) {
        loop {
            self.drain_intake();

            let progressed = panic::catch_unwind(AssertUnwindSafe(|| {
                self.advance();
                self.wait();
            }));
            if progressed.is_err() {
                error!(
                    "transport engine panicked, failing {} in-flight transfers",
                    self.registry.len()
                );
                self.fail_in_flight(TransferError::EngineFailure("engine panicked".into()));
                thread::sleep(self.poll_timeout.min(POLL_ERROR_BACKOFF));
            }

            if terminate.load(Ordering::Acquire) {
                break;
            }
        }

        if !self.registry.is_empty() {
            info!("cancelling {} in-flight transfers", self.registry.len());
        }
        self.fail_in_flight(TransferError::Cancelled);
    }

    fn drain_intake(&mut self) {
        let mut queue = match self.intake.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            // a producer holds it and will wake us once it lets go
            Err(TryLockError::WouldBlock) => return,
        };
        while let Some(lease) = queue.pop() {
            self.pending.push(lease);
        }
        drop(queue);

        let mut pending = mem::take(&mut self.pending);
        for lease in pending.drain(..) {
            self.register(lease);
        }
        self.pending = pending;
    }

    fn register(&mut self, mut lease: Lease<E::Easy>) {
        let handle = lease.handle();
        let index = lease.index();

        let added = panic::catch_unwind(AssertUnwindSafe(|| self.engine.add_handle(lease.easy())));
        let refused = match added {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                error!("failed to register slot {index} transfer {handle}: {e}");
                Some(TransferError::Registration(e.to_string()))
            }
            Err(_) => {
                error!("transport engine panicked registering slot {index} transfer {handle}");
                Some(TransferError::EngineFailure(
                    "engine panicked adding the transfer".into(),
                ))
            }
        };
        if let Some(error) = refused {
            deliver(&mut lease, |lease| lease.fail(error));
            return;
        }

        if let Err(mut lease) = self.registry.add(handle, lease) {
            error!("transfer {handle} is already in flight");
            deliver(&mut lease, |lease| {
                lease.fail(TransferError::Registration(format!(
                    "transfer {handle} already in flight"
                )))
            });
            return;
        }
        trace!("transfer {handle} registered");
    }

    fn advance(&mut self) {
        match self.engine.perform() {
            Ok(running) => trace!("{running} transfers running"),
            Err(e) => error!("engine failed to make progress: {e}"),
        }

        self.engine.read_completions(&mut self.completions);
        let mut completions = mem::take(&mut self.completions);
        for completion in completions.drain(..) {
            self.dispatch(completion);
        }
        self.completions = completions;
    }

    fn dispatch(&mut self, completion: Completion) {
        let Completion { handle, result } = completion;
        let fail_on_http_error = self.fail_on_http_error;

        let Some(lease) = self.registry.find(handle) else {
            warn!("completion for unknown transfer {handle}");
            return;
        };
        debug!("slot {} transfer {handle} finished", lease.index());
        deliver(lease, |lease| lease.complete(result, fail_on_http_error));

        // the lease leaves the registry before the engine is touched again, so a
        // failing engine can never see it delivered twice
        let lease = self.registry.remove(handle);
        if let Err(e) = self.engine.remove_handle(handle) {
            error!("failed to remove transfer {handle}: {e}");
        }
        // dropping the lease frees the slot
        drop(lease);
    }

    fn wait(&mut self) {
        if let Err(e) = self.engine.poll(self.poll_timeout) {
            error!("engine poll failed: {e}");
            thread::sleep(self.poll_timeout.min(POLL_ERROR_BACKOFF));
        }
    }

    /// Remove every in-flight transfer from the engine and report `error` to it.
    fn fail_in_flight(&mut self, error: TransferError) {
        let failed: Vec<_> = self.registry.drain().collect();
        for (handle, mut lease) in failed {
            let removed = panic::catch_unwind(AssertUnwindSafe(|| self.engine.remove_handle(handle)));
            match removed {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("failed to remove transfer {handle}: {e}"),
                Err(_) => error!("transport engine panicked removing transfer {handle}"),
            }
            let error = error.clone();
            deliver(&mut lease, |lease| lease.fail(error));
        }
    }
}

enum Lifecycle {
    Idle,
    Running(JoinHandle<()>),
    /// `stop` is joining the thread.
    Stopping,
}

/// Lifecycle of the single worker thread.
///
/// The lifecycle lock is never held while joining, so handlers running on the
/// worker thread may call back into the processor at any time.
pub(crate) struct Worker<E: TransportEngine> {
    terminate: Arc<AtomicBool>,
    parked: Arc<Mutex<Option<WorkerLoop<E>>>>,
    waker: Arc<dyn Wake>,
    lifecycle: Mutex<Lifecycle>,
}

impl<E: TransportEngine> Worker<E> {
    pub(crate) fn new(worker_loop: WorkerLoop<E>) -> Self {
        Self {
            terminate: Arc::new(AtomicBool::new(false)),
            waker: worker_loop.waker(),
            parked: Arc::new(Mutex::new(Some(worker_loop))),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        matches!(&*lock(&self.lifecycle), Lifecycle::Running(handle) if !handle.is_finished())
    }

    /// Spawn the worker thread unless it already runs.
    pub(crate) fn start(&self) -> Result<(), ProcessorError> {
        let mut lifecycle = lock(&self.lifecycle);
        match &*lifecycle {
            Lifecycle::Running(handle) if !handle.is_finished() => {
                warn!("worker already running");
                return Ok(());
            }
            Lifecycle::Stopping => return Err(ProcessorError::Stopping),
            _ => {}
        }

        // a thread that exited on its own is reaped before the next one starts
        if let Lifecycle::Running(handle) = mem::replace(&mut *lifecycle, Lifecycle::Idle) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
        if lock(&self.parked).is_none() {
            return Err(ProcessorError::WorkerUnavailable);
        }

        self.terminate.store(false, Ordering::Release);
        let terminate = Arc::clone(&self.terminate);
        let parked = Arc::clone(&self.parked);

        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                let Some(mut worker_loop) = lock(&parked).take() else {
                    error!("worker started without a loop to run");
                    return;
                };
                info!("worker started");
                if panic::catch_unwind(AssertUnwindSafe(|| worker_loop.run(&terminate))).is_err() {
                    error!("worker loop panicked");
                }
                *lock(&parked) = Some(worker_loop);
                info!("worker stopped");
            })
            .map_err(ProcessorError::Spawn)?;

        *lifecycle = Lifecycle::Running(handle);
        Ok(())
    }

    /// Signal the loop, wake it out of its poll and wait for it to exit.
    ///
    /// Called from the worker thread itself (a handler stopping its processor),
    /// this only signals: the loop exits at the end of the current iteration.
    pub(crate) fn stop(&self) {
        let handle = {
            let mut lifecycle = lock(&self.lifecycle);
            match mem::replace(&mut *lifecycle, Lifecycle::Stopping) {
                Lifecycle::Running(handle) if handle.thread().id() == thread::current().id() => {
                    debug!("stop requested from the worker thread");
                    self.terminate.store(true, Ordering::Release);
                    *lifecycle = Lifecycle::Running(handle);
                    return;
                }
                Lifecycle::Running(handle) => handle,
                other => {
                    *lifecycle = other;
                    return;
                }
            }
        };

        self.terminate.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!("failed to wake worker: {e}");
        }
        if handle.join().is_err() {
            error!("worker thread panicked");
        }
        *lock(&self.lifecycle) = Lifecycle::Idle;
    }
}

impl<E: TransportEngine> Drop for Worker<E> {
    fn drop(&mut self) {
        self.stop();
    }
}
