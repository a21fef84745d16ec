//! Fixed-slot asynchronous HTTP transaction processor.
//!
//! A [`Processor`] owns a fixed pool of reusable request/response slots and one
//! background worker thread. Any number of caller threads submit requests into
//! slots; the worker drives every transfer through a [`TransportEngine`] and reports
//! each completion exactly once through the slot's [`ResponseHandler`].
pub mod cli;
pub mod config;
pub mod processor;
pub mod slot;
pub mod transport;

pub use config::{ConfigError, ProcessorConfig};
pub use processor::{Processor, ProcessorError, ProcessorStatus, TransactionId};
pub use slot::{
    Callbacks, Completed, Failed, HeaderEntry, Method, Outcome, RequestData, ResponseHandler,
};
pub use transport::{
    EasyHandle, HandleId, HttpEasy, HttpEngine, TransferError, TransportEngine, TransportError,
};
