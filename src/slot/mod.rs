//! Fixed pool of reusable request/response slots.
//!
//! # Overview
//!
//! A [`SlotPool`] is built once with a fixed number of [`Slot`]s. Each slot owns
//! bounded request and response buffers, the engine's easy handle for that slot and
//! the [`ResponseHandler`] of the transaction currently using it.
//!
//! # Leasing
//!
//! A slot is either Free or Locked. A caller moves it to Locked with a single
//! compare-and-swap ([`Slot::try_lock`]); the winner receives a [`Lease`], which is
//! the only way to reach the slot's contents. The lease travels with the work: from
//! the submitting thread, through the intake queue, into the worker's in-flight
//! registry. Dropping it stores Free with `Release` ordering, so everything the
//! holder wrote is visible to whichever thread wins the slot next.
//!
//! # See Also
//!
//! - [`processor`](crate::processor): moves leases between caller and worker threads.
//! - [`transport`](crate::transport): the engine that creates the easy handles.
use std::{
    cell::UnsafeCell,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{trace, warn};
use thiserror::Error;

use crate::transport::{
    EasyHandle, HandleId, ResponseParts, TransferError, TransportEngine, TransportError,
};

mod handler;
mod request;
mod response;

pub use handler::{Callbacks, Completed, Failed, Outcome, ResponseHandler};
pub use request::{HeaderEntry, Method, RequestData, UnknownMethod};
pub use response::ResponseBuffer;

pub(crate) use request::HeaderList;
use request::RequestBuffer;

/// Fixed maxima. Request input above them is truncated; responses above them fail.
pub mod limits {
    /// Most slots a pool may be built with.
    pub const MAX_SLOTS: usize = 25;
    pub const MAX_URL_LEN: usize = 4095;
    pub const MAX_REQUEST_BODY: usize = 65535;
    pub const MAX_RESPONSE_BODY: usize = 4096 * 64;
    pub const MAX_HEADERS: usize = 256;
    pub const MAX_HEADER_NAME_LEN: usize = 256;
    pub const MAX_HEADER_VALUE_LEN: usize = 3840;
}

use limits::MAX_SLOTS;

#[derive(Debug, Error)]
pub enum SlotError {
    #[error("cannot build {requested} slots, the pool holds between 1 and {ceiling}")]
    Capacity { requested: usize, ceiling: usize },

    #[error("no slot at index {0}")]
    UnknownObject(usize),

    #[error("slot {0} is busy")]
    Busy(usize),

    #[error(transparent)]
    Engine(#[from] TransportError),
}

struct SlotContents<H> {
    easy: H,
    request: RequestBuffer,
    response: ResponseBuffer,
    handler: Option<Box<dyn ResponseHandler>>,
}

/// One request/response pair and its exclusive-use flag.
pub struct Slot<H> {
    index: usize,
    handle: HandleId,
    locked: AtomicBool,
    contents: UnsafeCell<SlotContents<H>>,
}

// SAFETY: `contents` is only reached through a `Lease`, and a lease only exists for
// the thread whose `try_lock` won the flag. The Acquire CAS and the Release store in
// `unlock` order every access between consecutive holders.
unsafe impl<H: Send> Sync for Slot<H> {}

impl<H: EasyHandle> Slot<H> {
    fn new(index: usize, easy: H) -> Self {
        Self {
            index,
            handle: easy.id(),
            locked: AtomicBool::new(false),
            contents: UnsafeCell::new(SlotContents {
                easy,
                request: RequestBuffer::new(),
                response: ResponseBuffer::new(),
                handler: None,
            }),
        }
    }
}

impl<H> Slot<H> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Id of the slot's easy handle. Fixed for the life of the pool.
    pub fn handle(&self) -> HandleId {
        self.handle
    }

    /// Snapshot of the flag. Another thread may change it right after.
    pub fn is_busy(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub(crate) fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl<H> fmt::Debug for Slot<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("index", &self.index)
            .field("handle", &self.handle)
            .field("busy", &self.is_busy())
            .finish()
    }
}

#[derive(Debug)]
pub struct SlotPool<H> {
    slots: Box<[Slot<H>]>,
}

impl<H: EasyHandle> SlotPool<H> {
    /// Build `capacity` slots with one easy handle each.
    ///
    /// Nothing is kept if the engine fails part way; handles created so far are dropped.
    pub fn create<E>(capacity: usize, engine: &mut E) -> Result<Self, SlotError>
    where
        E: TransportEngine<Easy = H>,
    {
        if capacity == 0 || capacity > MAX_SLOTS {
            return Err(SlotError::Capacity {
                requested: capacity,
                ceiling: MAX_SLOTS,
            });
        }

        let slots = (0..capacity)
            .map(|index| -> Result<Slot<H>, SlotError> {
                Ok(Slot::new(index, engine.create_easy()?))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            slots: slots.into_boxed_slice(),
        })
    }
}

impl<H> SlotPool<H> {
    pub fn get(&self, index: usize) -> Result<&Slot<H>, SlotError> {
        self.slots.get(index).ok_or(SlotError::UnknownObject(index))
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot<H>> {
        self.slots.iter()
    }

    /// Take exclusive use of slot `index`.
    pub fn lease(pool: &Arc<Self>, index: usize) -> Result<Lease<H>, SlotError> {
        if !pool.get(index)?.try_lock() {
            return Err(SlotError::Busy(index));
        }
        trace!("leased slot {index}");

        Ok(Lease {
            pool: Arc::clone(pool),
            index,
        })
    }
}

/// Exclusive use of one slot. The slot returns to Free when the lease is dropped.
pub struct Lease<H> {
    pool: Arc<SlotPool<H>>,
    index: usize,
}

impl<H> Lease<H> {
    fn slot(&self) -> &Slot<H> {
        &self.pool.slots[self.index]
    }

    fn contents(&self) -> &SlotContents<H> {
        // SAFETY: holding the lease means this thread won the slot's flag.
        unsafe { &*self.slot().contents.get() }
    }

    fn contents_mut(&mut self) -> &mut SlotContents<H> {
        // SAFETY: as in `contents`, and `&mut self` rules out other borrows through this lease.
        unsafe { &mut *self.slot().contents.get() }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn handle(&self) -> HandleId {
        self.slot().handle
    }

    pub fn easy(&self) -> &H {
        &self.contents().easy
    }

    pub fn response(&self) -> &ResponseBuffer {
        &self.contents().response
    }

    /// Whether the slot holds a request and a handler from an earlier `configure`.
    pub(crate) fn is_prepared(&self) -> bool {
        let contents = self.contents();
        contents.request.method.is_some() && contents.handler.is_some()
    }

    /// Clear the previous response before the slot is submitted again.
    pub(crate) fn rearm(&mut self) {
        self.contents_mut().response.reset();
    }

    /// Deliver `error` to the slot's handler.
    pub(crate) fn fail(&mut self, error: TransferError) {
        self.complete(Err(error), false);
    }

    /// Record a finished transfer and invoke exactly one handler method.
    pub(crate) fn complete(
        &mut self,
        result: Result<ResponseParts, TransferError>,
        fail_on_http_error: bool,
    ) {
        let slot = self.index;
        let transaction = self.handle();
        let SlotContents {
            response, handler, ..
        } = self.contents_mut();

        let outcome = result.and_then(|parts| {
            let status = parts.status;
            response.record(parts)?;
            if fail_on_http_error && !(200..=299).contains(&status) {
                return Err(TransferError::HttpStatus(status));
            }
            Ok(status)
        });

        let Some(handler) = handler.as_mut() else {
            warn!("slot {slot} finished {transaction} without a handler");
            return;
        };

        match outcome {
            Ok(status) => handler.on_success(&Completed {
                slot,
                transaction,
                status,
                headers: response.headers(),
                body: response.body(),
            }),
            Err(error) => handler.on_error(&Failed {
                slot,
                transaction,
                error: &error,
            }),
        }
    }
}

impl<H: EasyHandle> Lease<H> {
    /// Copy the request into the slot, point the easy handle at it and install `handler`.
    pub(crate) fn configure(
        &mut self,
        method: Method,
        data: &RequestData,
        handler: Box<dyn ResponseHandler>,
    ) {
        let index = self.index;
        let SlotContents {
            easy,
            request,
            response,
            handler: slot_handler,
        } = self.contents_mut();

        if request.copy_from(method, data) {
            warn!("slot {index}: request truncated to the fixed buffer limits");
        }

        easy.set_method(method);
        easy.set_url(&request.url);
        easy.set_headers(request.headers.as_slice());
        easy.set_body(&request.body);

        response.reset();
        *slot_handler = Some(handler);
    }
}

impl<H> Drop for Lease<H> {
    fn drop(&mut self) {
        self.slot().unlock();
        trace!("released slot {}", self.index);
    }
}

impl<H> fmt::Debug for Lease<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("index", &self.index)
            .field("handle", &self.handle())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Barrier, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
    };

    use super::*;
    use crate::transport::scripted::{Script, ScriptedEasy, ScriptedEngine};

    fn pool(capacity: usize) -> Arc<SlotPool<ScriptedEasy>> {
        let mut engine = ScriptedEngine::new(Script::default());
        Arc::new(SlotPool::create(capacity, &mut engine).unwrap())
    }

    fn recorder() -> (Box<dyn ResponseHandler>, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (ok, err) = (Arc::clone(&seen), Arc::clone(&seen));
        let handler = Callbacks::new(
            move |r: &Completed<'_>| {
                ok.lock()
                    .unwrap()
                    .push(format!("{} {}", r.status, String::from_utf8_lossy(r.body)))
            },
            move |f: &Failed<'_>| err.lock().unwrap().push(format!("error {}", f.code())),
        );
        (Box::new(handler), seen)
    }

    fn pong() -> ResponseParts {
        ResponseParts {
            status: 200,
            headers: Vec::new(),
            body: b"pong".to_vec(),
        }
    }

    #[test]
    fn capacity_bounds() {
        let mut engine = ScriptedEngine::new(Script::default());
        assert!(matches!(
            SlotPool::create(0, &mut engine),
            Err(SlotError::Capacity { requested: 0, .. })
        ));
        assert!(matches!(
            SlotPool::create(MAX_SLOTS + 1, &mut engine),
            Err(SlotError::Capacity { ceiling: MAX_SLOTS, .. })
        ));
        assert_eq!(SlotPool::create(MAX_SLOTS, &mut engine).unwrap().size(), MAX_SLOTS);
    }

    #[test]
    fn engine_failure_during_create() {
        let script = Script::default();
        script.fail_create_after(2);
        let mut engine = ScriptedEngine::new(script);

        assert!(matches!(
            SlotPool::create(3, &mut engine),
            Err(SlotError::Engine(TransportError::Rejected { .. }))
        ));
    }

    #[test]
    fn handles_are_distinct_and_stable() {
        let pool = pool(4);
        let mut handles: Vec<_> = pool.iter().map(Slot::handle).collect();
        handles.dedup();
        assert_eq!(handles.len(), 4);

        let lease = SlotPool::lease(&pool, 2).unwrap();
        assert_eq!(lease.handle(), pool.get(2).unwrap().handle());
        assert_eq!(lease.easy().id(), lease.handle());
    }

    #[test]
    fn lookup_out_of_bounds() {
        let pool = pool(2);
        assert!(matches!(pool.get(2), Err(SlotError::UnknownObject(2))));
        assert!(matches!(
            SlotPool::lease(&pool, 7),
            Err(SlotError::UnknownObject(7))
        ));
        assert_eq!(pool.get(1).unwrap().index(), 1);
    }

    #[test]
    fn lease_is_exclusive_until_dropped() {
        let pool = pool(1);
        let lease = SlotPool::lease(&pool, 0).unwrap();
        assert!(pool.get(0).unwrap().is_busy());
        assert!(matches!(SlotPool::lease(&pool, 0), Err(SlotError::Busy(0))));

        drop(lease);
        assert!(!pool.get(0).unwrap().is_busy());
        assert!(SlotPool::lease(&pool, 0).is_ok());
    }

    #[test]
    fn only_one_thread_wins_a_slot() {
        const THREADS: usize = 8;
        let pool = pool(1);
        let barrier = Arc::new(Barrier::new(THREADS));
        let winners = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = std::sync::mpsc::channel();

        let threads: Vec<_> = (0..THREADS)
            .map(|_| {
                let (pool, barrier, winners) =
                    (Arc::clone(&pool), Arc::clone(&barrier), Arc::clone(&winners));
                let tx = tx.clone();
                thread::spawn(move || {
                    barrier.wait();
                    if let Ok(lease) = SlotPool::lease(&pool, 0) {
                        winners.fetch_add(1, Ordering::SeqCst);
                        // keep the slot locked until every thread has tried
                        tx.send(lease).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        drop(tx);

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(rx.iter().count(), 1);
        assert!(!pool.get(0).unwrap().is_busy());
    }

    #[test]
    fn configure_sets_up_easy_handle() {
        let pool = pool(1);
        let mut lease = SlotPool::lease(&pool, 0).unwrap();
        let (handler, _) = recorder();
        assert!(!lease.is_prepared());

        lease.configure(
            Method::Post,
            &RequestData::new("http://localhost/x")
                .header("A", "b")
                .body("{}"),
            handler,
        );

        assert!(lease.is_prepared());
        let easy = lease.easy();
        assert_eq!(easy.url, "http://localhost/x");
        assert_eq!(easy.method, Some(Method::Post));
        assert_eq!(easy.body, b"{}");
        assert_eq!(easy.headers, vec![HeaderEntry::new("A", "b")]);
    }

    #[test]
    fn complete_invokes_exactly_one_callback() {
        let pool = pool(1);
        let mut lease = SlotPool::lease(&pool, 0).unwrap();
        let (handler, seen) = recorder();
        lease.configure(Method::Get, &RequestData::new("http://h/"), handler);

        lease.complete(Ok(pong()), true);
        assert_eq!(*seen.lock().unwrap(), vec!["200 pong"]);
        assert_eq!(lease.response().body(), b"pong");

        lease.fail(TransferError::Cancelled);
        assert_eq!(*seen.lock().unwrap(), vec!["200 pong", "error 42"]);
    }

    #[test]
    fn http_errors_follow_the_flag() {
        let pool = pool(1);
        let mut lease = SlotPool::lease(&pool, 0).unwrap();
        let (handler, seen) = recorder();
        lease.configure(Method::Get, &RequestData::new("http://h/"), handler);
        let not_found = ResponseParts {
            status: 404,
            ..Default::default()
        };

        lease.complete(Ok(not_found.clone()), true);
        assert_eq!(lease.response().status_code(), Some(404));
        lease.complete(Ok(not_found), false);

        assert_eq!(*seen.lock().unwrap(), vec!["error 22", "404 "]);
    }

    #[test]
    fn oversized_response_fails_the_transaction() {
        let pool = pool(1);
        let mut lease = SlotPool::lease(&pool, 0).unwrap();
        let (handler, seen) = recorder();
        lease.configure(Method::Get, &RequestData::new("http://h/"), handler);

        lease.complete(
            Ok(ResponseParts {
                status: 200,
                headers: Vec::new(),
                body: vec![0; limits::MAX_RESPONSE_BODY + 1],
            }),
            true,
        );

        assert_eq!(*seen.lock().unwrap(), vec!["error 23"]);
        assert_eq!(lease.response().status_code(), None);
    }

    #[test]
    fn rearm_clears_the_previous_response() {
        let pool = pool(1);
        let mut lease = SlotPool::lease(&pool, 0).unwrap();
        let (handler, _) = recorder();
        lease.configure(Method::Get, &RequestData::new("http://h/"), handler);
        lease.complete(Ok(pong()), true);

        lease.rearm();
        assert!(lease.response().body().is_empty());
        assert!(lease.is_prepared());
    }
}
