//! Core slot pool
//!
//! Every core of a worker gets one slot at startup: a request record plus
//! its preallocated buffers. Slots are never freed while the worker lives;
//! teardown resets them in place for the next request.

use crate::error::{CoreError, CoreResult};
use crate::id::AsyncId;
use crate::request::{CoreBuffers, Request};

/// One core: its buffers and its request record
pub struct CoreSlot {
    pub buffers: CoreBuffers,
    pub request: Request,
}

impl CoreSlot {
    pub fn new(id: AsyncId, buffer_size: usize, hvec_slots: usize, post_buffering: usize) -> Self {
        Self {
            buffers: CoreBuffers::new(buffer_size, hvec_slots, post_buffering),
            request: Request::new(id),
        }
    }

    #[inline]
    pub fn id(&self) -> AsyncId {
        self.request.async_id()
    }
}

/// Fixed set of core slots for one worker
pub struct CorePool {
    slots: Vec<CoreSlot>,
}

impl CorePool {
    /// Allocate `cores` slots up front
    pub fn new(cores: usize, buffer_size: usize, hvec_slots: usize, post_buffering: usize) -> Self {
        let slots = (0..cores)
            .map(|i| CoreSlot::new(AsyncId::new(i as u32), buffer_size, hvec_slots, post_buffering))
            .collect();
        Self { slots }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, id: AsyncId) -> CoreResult<&CoreSlot> {
        self.slots.get(id.as_usize()).ok_or(CoreError::SlotOutOfRange(id))
    }

    pub fn get_mut(&mut self, id: AsyncId) -> CoreResult<&mut CoreSlot> {
        self.slots.get_mut(id.as_usize()).ok_or(CoreError::SlotOutOfRange(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &CoreSlot> {
        self.slots.iter()
    }

    /// Hand each slot to its own thread
    pub fn into_slots(self) -> Vec<CoreSlot> {
        self.slots
    }
}
