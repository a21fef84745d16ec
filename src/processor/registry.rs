use std::{cell::Cell, collections::HashMap, marker::PhantomData};

use crate::{slot::Lease, transport::HandleId};

/// Transfers the engine currently owns, keyed by easy handle.
///
/// Lives inside the worker loop and is never shared; `!Sync` keeps it that way.
#[derive(Debug)]
pub struct InFlightRegistry<H> {
    entries: HashMap<HandleId, Lease<H>>,
    _not_sync: PhantomData<Cell<()>>,
}

impl<H> InFlightRegistry<H> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            _not_sync: PhantomData,
        }
    }

    /// Refuses, and hands back the lease, if `handle` is already registered.
    pub fn add(&mut self, handle: HandleId, lease: Lease<H>) -> Result<(), Lease<H>> {
        if self.entries.contains_key(&handle) {
            return Err(lease);
        }
        self.entries.insert(handle, lease);
        Ok(())
    }

    pub fn remove(&mut self, handle: HandleId) -> Option<Lease<H>> {
        self.entries.remove(&handle)
    }

    pub fn find(&mut self, handle: HandleId) -> Option<&mut Lease<H>> {
        self.entries.get_mut(&handle)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (HandleId, Lease<H>)> + '_ {
        self.entries.drain()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
