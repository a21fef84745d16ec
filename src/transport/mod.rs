//! Transport engine boundary.
//!
//! The processor never speaks HTTP itself. Everything that touches a socket sits
//! behind the [`TransportEngine`] trait (the "multi" handle that multiplexes many
//! transfers) and the [`EasyHandle`] trait (one reusable request object per slot).
//!
//! # Overview
//!
//! An engine is created once per processor and moved into the worker thread while
//! the processor runs. Caller threads only ever touch:
//!
//! - their slot's [`EasyHandle`], while they hold the slot's lease;
//! - the engine's [`Wake`] handle, to interrupt a blocking [`TransportEngine::poll`].
//!
//! Transfers are identified by the [`HandleId`] of the easy handle that started them.
//! When a transfer finishes, the engine queues a [`Completion`] carrying that id and
//! either the [`ResponseParts`] or a [`TransferError`].
//!
//! # Error codes
//!
//! [`TransferError::code`] maps every failure onto the numeric code libcurl uses for
//! the same condition, so callers that already switch on curl codes keep working.
//!
//! # See Also
//!
//! - [`HttpEngine`]: the shipped engine, plain HTTP/1.1 over `mio`.
//! - [`processor`](crate::processor): the only consumer of this module.
use std::{fmt, io, sync::Arc, time::Duration};

use thiserror::Error;

mod easy;
mod engine;
pub mod h1;
pub mod url;

#[cfg(test)]
pub(crate) mod scripted;

pub use easy::HttpEasy;
pub use engine::{HttpEngine, TransferLimits};

use crate::slot::{HeaderEntry, Method};

/// Stable identity of an easy handle, and therefore of every transfer it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Engine-level failures: the multi handle itself misbehaved.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport io error: {0}")]
    Io(#[from] io::Error),

    #[error("handle {0} is already registered")]
    AlreadyAdded(HandleId),

    #[error("handle {0} is not registered")]
    UnknownHandle(HandleId),

    #[error("engine refused handle {handle}: {reason}")]
    Rejected { handle: HandleId, reason: String },
}

/// Per-transfer failures, delivered through a handler's error callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("unsupported protocol '{0}'")]
    UnsupportedProtocol(String),

    #[error("failed to register transfer: {0}")]
    Registration(String),

    #[error("transport engine failed: {0}")]
    EngineFailure(String),

    #[error("malformed url: {0}")]
    MalformedUrl(String),

    #[error("could not resolve host '{0}'")]
    CouldntResolveHost(String),

    #[error("could not connect: {0}")]
    CouldntConnect(String),

    #[error("weird server reply: {0}")]
    WeirdServerReply(String),

    #[error("transfer closed with {missing} bytes remaining")]
    PartialFile { missing: usize },

    #[error("http status {0}")]
    HttpStatus(u16),

    #[error("response exceeds {limit} bytes")]
    ResponseTooLarge { limit: usize },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("empty reply from server")]
    GotNothing,

    #[error("failed sending data: {0}")]
    Send(String),

    #[error("failed receiving data: {0}")]
    Recv(String),
}

impl TransferError {
    /// Numeric code of the equivalent libcurl `CURLcode`.
    pub fn code(&self) -> u32 {
        match self {
            TransferError::UnsupportedProtocol(_) => 1,
            TransferError::Registration(_) | TransferError::EngineFailure(_) => 2,
            TransferError::MalformedUrl(_) => 3,
            TransferError::CouldntResolveHost(_) => 6,
            TransferError::CouldntConnect(_) => 7,
            TransferError::WeirdServerReply(_) => 8,
            TransferError::PartialFile { .. } => 18,
            TransferError::HttpStatus(_) => 22,
            TransferError::ResponseTooLarge { .. } => 23,
            TransferError::Timeout(_) => 28,
            TransferError::Cancelled => 42,
            TransferError::GotNothing => 52,
            TransferError::Send(_) => 55,
            TransferError::Recv(_) => 56,
        }
    }
}

/// Everything a finished HTTP exchange produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseParts {
    pub status: u16,
    pub headers: Vec<HeaderEntry>,
    pub body: Vec<u8>,
}

/// A finished transfer as reported by [`TransportEngine::read_completions`].
#[derive(Debug)]
pub struct Completion {
    pub handle: HandleId,
    pub result: Result<ResponseParts, TransferError>,
}

/// Interrupts a blocking [`TransportEngine::poll`] from any thread.
pub trait Wake: Send + Sync {
    fn wake(&self) -> Result<(), TransportError>;
}

impl Wake for mio::Waker {
    fn wake(&self) -> Result<(), TransportError> {
        mio::Waker::wake(self)?;
        Ok(())
    }
}

/// A reusable request object. One lives in every slot for the whole life of the pool.
pub trait EasyHandle: Send + 'static {
    fn id(&self) -> HandleId;

    fn set_url(&mut self, url: &str);

    fn set_method(&mut self, method: Method);

    fn set_headers(&mut self, headers: &[HeaderEntry]);

    fn set_body(&mut self, body: &[u8]);

    /// Run the configured request to completion on the calling thread.
    fn perform(&mut self) -> Result<ResponseParts, TransferError>;
}

/// The multiplexer driving many easy handles from a single thread.
///
/// Creating the engine is the paired "init" and dropping it the paired "cleanup";
/// engines hold no process-global state.
pub trait TransportEngine: Send + 'static {
    type Easy: EasyHandle;

    /// Allocate a new easy handle with a fresh [`HandleId`].
    fn create_easy(&mut self) -> Result<Self::Easy, TransportError>;

    /// Start a transfer for the handle's current configuration.
    fn add_handle(&mut self, easy: &Self::Easy) -> Result<(), TransportError>;

    /// Forget a transfer, finished or not. Pending completions for it are dropped.
    fn remove_handle(&mut self, handle: HandleId) -> Result<(), TransportError>;

    /// Make as much non-blocking progress as possible; returns the number of
    /// transfers still running.
    fn perform(&mut self) -> Result<usize, TransportError>;

    /// Block until there is socket activity, a wake-up, or `timeout` elapses.
    fn poll(&mut self, timeout: Duration) -> Result<(), TransportError>;

    fn waker(&self) -> Arc<dyn Wake>;

    /// Move every finished transfer into `out`.
    fn read_completions(&mut self, out: &mut Vec<Completion>);
}
