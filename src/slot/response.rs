use log::warn;

use super::{
    limits::{MAX_HEADER_NAME_LEN, MAX_HEADER_VALUE_LEN, MAX_HEADERS, MAX_RESPONSE_BODY},
    request::{HeaderEntry, HeaderList},
};
use crate::transport::{ResponseParts, TransferError};

/// The response half of a slot.
///
/// The body storage is allocated once when the pool is built; a response that
/// does not fit fails the transaction rather than growing the buffer.
#[derive(Debug)]
pub struct ResponseBuffer {
    status: Option<u16>,
    headers: HeaderList,
    body: Box<[u8]>,
    len: usize,
}

impl ResponseBuffer {
    pub(crate) fn new() -> Self {
        Self::with_capacity(MAX_RESPONSE_BODY)
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            status: None,
            headers: HeaderList::bounded(MAX_HEADERS, MAX_HEADER_NAME_LEN, MAX_HEADER_VALUE_LEN),
            body: vec![0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// `None` until a response was recorded.
    pub fn status_code(&self) -> Option<u16> {
        self.status
    }

    pub fn headers(&self) -> &[HeaderEntry] {
        self.headers.as_slice()
    }

    pub fn body(&self) -> &[u8] {
        &self.body[..self.len]
    }

    pub fn capacity(&self) -> usize {
        self.body.len()
    }

    pub(crate) fn reset(&mut self) {
        self.status = None;
        self.headers.clear();
        self.len = 0;
    }

    pub(crate) fn record(&mut self, parts: ResponseParts) -> Result<(), TransferError> {
        self.reset();
        if parts.body.len() > self.body.len() {
            return Err(TransferError::ResponseTooLarge {
                limit: self.body.len(),
            });
        }

        self.status = Some(parts.status);
        self.body[..parts.body.len()].copy_from_slice(&parts.body);
        self.len = parts.body.len();

        if parts.headers.len() > MAX_HEADERS {
            warn!(
                "dropping {} response headers over the limit of {MAX_HEADERS}",
                parts.headers.len() - MAX_HEADERS
            );
        }
        let kept = parts.headers.len().min(MAX_HEADERS);
        self.headers.assign(&parts.headers[..kept]);

        Ok(())
    }
}
