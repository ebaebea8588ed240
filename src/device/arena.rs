//! Per-step bump allocation of device buffers.

use std::ops::{Deref, DerefMut};
use thunderdome as td;

use super::DeviceContext;
use crate::DeviceError;

/// Bookkeeping for one live allocation.
#[derive(Clone, Debug)]
pub struct Allocation {
    pub label: &'static str,
    pub bytes: usize,
}

/// Identifies a buffer and the step it was allocated in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferHandle {
    index: td::Index,
    epoch: u64,
}

/// A device-resident buffer handed out by a [`DeviceArena`].
///
/// Sized exactly to the count it was requested with.
#[derive(Debug)]
pub struct DeviceVec<T> {
    handle: BufferHandle,
    data: Vec<T>,
}

impl<T> DeviceVec<T> {
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }
}

impl<T> Deref for DeviceVec<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.data
    }
}

impl<T> DerefMut for DeviceVec<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.data
    }
}

/// Bump allocator for the buffers of a single step.
///
/// There is no way to free a single buffer.
/// Instead the whole arena is retired at the start of the next step's upload,
/// which invalidates every handle it gave out.
/// The high-water mark keeps the largest total ever allocated in one step.
#[derive(Debug)]
pub struct DeviceArena {
    ctx: DeviceContext,
    capacity: usize,
    allocated: usize,
    high_water: usize,
    epoch: u64,
    allocations: td::Arena<Allocation>,
}

impl DeviceArena {
    pub fn new(ctx: DeviceContext, capacity: usize) -> Self {
        Self {
            ctx,
            capacity,
            allocated: 0,
            high_water: 0,
            epoch: 0,
            allocations: td::Arena::new(),
        }
    }

    /// Forget every allocation and start a new step.
    pub fn retire(&mut self) {
        self.allocations.clear();
        self.allocated = 0;
        self.epoch += 1;
    }

    /// Allocate a buffer of `count` elements all set to `value`.
    pub fn alloc_filled<T: Clone>(
        &mut self,
        label: &'static str,
        count: usize,
        value: T,
    ) -> Result<DeviceVec<T>, DeviceError> {
        let handle = self.reserve::<T>(label, count)?;
        Ok(DeviceVec {
            handle,
            data: vec![value; count],
        })
    }

    /// Allocate a buffer of `count` default (zeroed) elements.
    pub fn alloc_zeroed<T: Clone + Default>(
        &mut self,
        label: &'static str,
        count: usize,
    ) -> Result<DeviceVec<T>, DeviceError> {
        self.alloc_filled(label, count, T::default())
    }

    /// Allocate a buffer and copy host data into it.
    pub fn upload<T: Clone>(
        &mut self,
        label: &'static str,
        host: &[T],
    ) -> Result<DeviceVec<T>, DeviceError> {
        let handle = self.reserve::<T>(label, host.len())?;
        Ok(DeviceVec {
            handle,
            data: host.to_vec(),
        })
    }

    fn reserve<T>(
        &mut self,
        label: &'static str,
        count: usize,
    ) -> Result<BufferHandle, DeviceError> {
        let bytes = count * std::mem::size_of::<T>();
        let available = self.capacity - self.allocated;
        if bytes > available {
            let err = DeviceError::OutOfMemory {
                label,
                requested: bytes,
                available,
            };
            self.ctx.report(err.clone());
            return Err(err);
        }
        self.allocated += bytes;
        self.high_water = self.high_water.max(self.allocated);
        let index = self.allocations.insert(Allocation { label, bytes });
        Ok(BufferHandle {
            index,
            epoch: self.epoch,
        })
    }

    /// Whether the buffer was allocated in the current step.
    pub fn is_live(&self, handle: BufferHandle) -> bool {
        handle.epoch == self.epoch && self.allocations.contains(handle.index)
    }

    pub fn allocation(&self, handle: BufferHandle) -> Option<&Allocation> {
        if handle.epoch != self.epoch {
            return None;
        }
        self.allocations.get(handle.index)
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated
    }

    pub fn high_water_bytes(&self) -> usize {
        self.high_water
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }
}
