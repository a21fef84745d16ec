use crate::slot::Lease;

/// Leases waiting for the worker to register them with the engine.
///
/// Bounded by the pool size, so a push can only fail if a slot were leased twice.
/// Entries come back out in LIFO order.
#[derive(Debug)]
pub struct IntakeQueue<H> {
    entries: Vec<Lease<H>>,
    capacity: usize,
}

impl<H> IntakeQueue<H> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Hands the lease back if the queue is full.
    pub fn push(&mut self, lease: Lease<H>) -> Result<(), Lease<H>> {
        if self.entries.len() >= self.capacity {
            return Err(lease);
        }
        self.entries.push(lease);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Lease<H>> {
        self.entries.pop()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
