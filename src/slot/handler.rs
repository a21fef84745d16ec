//! Typed completion callbacks.
//!
//! A handler is stored in the slot together with whatever context it captured and
//! is invoked on the worker thread, exactly once per transaction: either
//! [`ResponseHandler::on_success`] or [`ResponseHandler::on_error`]. Handlers run
//! inside the shared event loop, so they must not block.
use std::sync::mpsc;

use log::debug;

use super::request::HeaderEntry;
use crate::transport::{HandleId, TransferError};

/// A transaction that produced a response.
#[derive(Debug)]
pub struct Completed<'a> {
    pub slot: usize,
    pub transaction: HandleId,
    pub status: u16,
    pub headers: &'a [HeaderEntry],
    pub body: &'a [u8],
}

/// A transaction that failed, was refused by the engine, or was cancelled.
#[derive(Debug)]
pub struct Failed<'a> {
    pub slot: usize,
    pub transaction: HandleId,
    pub error: &'a TransferError,
}

impl Failed<'_> {
    /// curl-compatible error code.
    pub fn code(&self) -> u32 {
        self.error.code()
    }
}

pub trait ResponseHandler: Send + 'static {
    fn on_success(&mut self, response: &Completed<'_>);

    fn on_error(&mut self, failure: &Failed<'_>);
}

impl<T: ResponseHandler + ?Sized> ResponseHandler for Box<T> {
    fn on_success(&mut self, response: &Completed<'_>) {
        (**self).on_success(response)
    }

    fn on_error(&mut self, failure: &Failed<'_>) {
        (**self).on_error(failure)
    }
}

/// A handler built from a pair of closures.
///
/// ```rust
/// use reqpool::Callbacks;
///
/// let handler = Callbacks::new(
///     |response| println!("{} bytes", response.body.len()),
///     |failure| eprintln!("failed: {}", failure.error),
/// );
/// # let _ = handler;
/// ```
pub struct Callbacks<S, E> {
    on_success: S,
    on_error: E,
}

impl<S, E> Callbacks<S, E>
where
    S: FnMut(&Completed<'_>) + Send + 'static,
    E: FnMut(&Failed<'_>) + Send + 'static,
{
    pub fn new(on_success: S, on_error: E) -> Self {
        Self {
            on_success,
            on_error,
        }
    }
}

impl<S, E> ResponseHandler for Callbacks<S, E>
where
    S: FnMut(&Completed<'_>) + Send + 'static,
    E: FnMut(&Failed<'_>) + Send + 'static,
{
    fn on_success(&mut self, response: &Completed<'_>) {
        (self.on_success)(response)
    }

    fn on_error(&mut self, failure: &Failed<'_>) {
        (self.on_error)(failure)
    }
}

/// Owned copy of a completion, for handing results to another thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success {
        slot: usize,
        transaction: HandleId,
        status: u16,
        headers: Vec<HeaderEntry>,
        body: Vec<u8>,
    },
    Error {
        slot: usize,
        transaction: HandleId,
        error: TransferError,
    },
}

impl Outcome {
    pub fn slot(&self) -> usize {
        match self {
            Outcome::Success { slot, .. } | Outcome::Error { slot, .. } => *slot,
        }
    }

    pub fn transaction(&self) -> HandleId {
        match self {
            Outcome::Success { transaction, .. } | Outcome::Error { transaction, .. } => {
                *transaction
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

impl From<&Completed<'_>> for Outcome {
    fn from(value: &Completed<'_>) -> Self {
        Outcome::Success {
            slot: value.slot,
            transaction: value.transaction,
            status: value.status,
            headers: value.headers.to_vec(),
            body: value.body.to_vec(),
        }
    }
}

impl From<&Failed<'_>> for Outcome {
    fn from(value: &Failed<'_>) -> Self {
        Outcome::Error {
            slot: value.slot,
            transaction: value.transaction,
            error: value.error.clone(),
        }
    }
}

/// Forward every completion over a channel. A dropped receiver is not an error.
impl ResponseHandler for mpsc::Sender<Outcome> {
    fn on_success(&mut self, response: &Completed<'_>) {
        if self.send(response.into()).is_err() {
            debug!("receiver gone, dropping response for slot {}", response.slot);
        }
    }

    fn on_error(&mut self, failure: &Failed<'_>) {
        if self.send(failure.into()).is_err() {
            debug!("receiver gone, dropping failure for slot {}", failure.slot);
        }
    }
}
