//! Device memory manager
//!
//! Tracks every allocation in two capacity-bounded scopes. Allocations are
//! plain byte vectors keyed by handle; capacity is accounted per scope and
//! an exhausted scope fails immediately rather than borrowing from the other.

use std::collections::HashMap;

use crate::error::{DeviceError, Result};
use crate::types::{BufferHandle, MemoryScope};

struct Allocation {
    scope: MemoryScope,
    size: usize,
    bytes: Vec<u8>,
    /// Set while a kernel holds the bytes as its output operand.
    checked_out: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ScopeUsage {
    capacity: usize,
    used: usize,
}

impl ScopeUsage {
    fn available(&self) -> usize {
        self.capacity - self.used
    }
}

/// Memory manager for the simulated device
pub struct MemoryManager {
    allocations: HashMap<u64, Allocation>,
    default: ScopeUsage,
    scratch: ScopeUsage,
    next_buffer_id: u64,
}

impl MemoryManager {
    pub fn new(default_capacity: usize, scratch_capacity: usize) -> Self {
        Self {
            allocations: HashMap::new(),
            default: ScopeUsage {
                capacity: default_capacity,
                used: 0,
            },
            scratch: ScopeUsage {
                capacity: scratch_capacity,
                used: 0,
            },
            next_buffer_id: 1,
        }
    }

    fn usage(&self, scope: MemoryScope) -> &ScopeUsage {
        match scope {
            MemoryScope::Default => &self.default,
            MemoryScope::Scratch => &self.scratch,
        }
    }

    fn usage_mut(&mut self, scope: MemoryScope) -> &mut ScopeUsage {
        match scope {
            MemoryScope::Default => &mut self.default,
            MemoryScope::Scratch => &mut self.scratch,
        }
    }

    pub fn capacity(&self, scope: MemoryScope) -> usize {
        self.usage(scope).capacity
    }

    pub fn available(&self, scope: MemoryScope) -> usize {
        self.usage(scope).available()
    }

    pub fn used(&self, scope: MemoryScope) -> usize {
        self.usage(scope).used
    }

    pub fn live_allocations(&self) -> usize {
        self.allocations.len()
    }

    /// Reserve `size` zeroed bytes in `scope`.
    pub fn allocate(&mut self, size: usize, scope: MemoryScope) -> Result<BufferHandle> {
        let usage = self.usage_mut(scope);
        if size > usage.available() {
            return Err(DeviceError::OutOfMemory {
                scope,
                requested: size,
                available: usage.available(),
            });
        }
        usage.used += size;

        let handle = BufferHandle(self.next_buffer_id);
        self.next_buffer_id += 1;
        self.allocations.insert(
            handle.0,
            Allocation {
                scope,
                size,
                bytes: vec![0; size],
                checked_out: false,
            },
        );

        tracing::trace!(handle = %handle, size, scope = %scope, "device_alloc");
        Ok(handle)
    }

    pub fn free(&mut self, handle: BufferHandle) -> Result<()> {
        let allocation = self
            .allocations
            .remove(&handle.0)
            .ok_or(DeviceError::InvalidBuffer(handle))?;
        self.usage_mut(allocation.scope).used -= allocation.size;
        Ok(())
    }

    /// Release every allocation, as when a client disconnects.
    pub fn clear(&mut self) {
        self.allocations.clear();
        self.default.used = 0;
        self.scratch.used = 0;
    }

    fn allocation(&self, handle: BufferHandle) -> Result<&Allocation> {
        self.allocations.get(&handle.0).ok_or(DeviceError::InvalidBuffer(handle))
    }

    pub fn size_of(&self, handle: BufferHandle) -> Result<usize> {
        Ok(self.allocation(handle)?.size)
    }

    pub fn scope_of(&self, handle: BufferHandle) -> Result<MemoryScope> {
        Ok(self.allocation(handle)?.scope)
    }

    /// Overwrite the whole allocation.
    pub fn write(&mut self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        let allocation = self
            .allocations
            .get_mut(&handle.0)
            .ok_or(DeviceError::InvalidBuffer(handle))?;
        if allocation.size != data.len() {
            return Err(DeviceError::SizeMismatch {
                handle,
                expected: allocation.size,
                actual: data.len(),
            });
        }
        allocation.bytes.copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, handle: BufferHandle) -> Result<Vec<u8>> {
        Ok(self.bytes(handle)?.to_vec())
    }

    /// Borrow the contents of an allocation.
    pub fn bytes(&self, handle: BufferHandle) -> Result<&[u8]> {
        let allocation = self.allocation(handle)?;
        if allocation.checked_out {
            return Err(DeviceError::InvalidBuffer(handle));
        }
        Ok(&allocation.bytes)
    }

    /// Move the bytes out so a kernel can write them while other
    /// allocations stay readable. Must be paired with [`check_in`].
    ///
    /// [`check_in`]: MemoryManager::check_in
    pub fn check_out(&mut self, handle: BufferHandle) -> Result<Vec<u8>> {
        let allocation = self
            .allocations
            .get_mut(&handle.0)
            .ok_or(DeviceError::InvalidBuffer(handle))?;
        if allocation.checked_out {
            return Err(DeviceError::InvalidBuffer(handle));
        }
        allocation.checked_out = true;
        Ok(std::mem::take(&mut allocation.bytes))
    }

    pub fn check_in(&mut self, handle: BufferHandle, bytes: Vec<u8>) -> Result<()> {
        let allocation = self
            .allocations
            .get_mut(&handle.0)
            .ok_or(DeviceError::InvalidBuffer(handle))?;
        debug_assert_eq!(bytes.len(), allocation.size);
        allocation.bytes = bytes;
        allocation.checked_out = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_write_read() {
        let mut memory = MemoryManager::new(1024, 64);
        let handle = memory.allocate(4, MemoryScope::Default).unwrap();
        memory.write(handle, &[1, 2, 3, 4]).unwrap();
        assert_eq!(memory.read(handle).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(memory.used(MemoryScope::Default), 4);

        memory.free(handle).unwrap();
        assert_eq!(memory.used(MemoryScope::Default), 0);
        assert!(matches!(memory.read(handle), Err(DeviceError::InvalidBuffer(_))));
    }

    #[test]
    fn test_scratch_exhaustion_does_not_spill() {
        let mut memory = MemoryManager::new(1024, 64);
        memory.allocate(48, MemoryScope::Scratch).unwrap();
        let err = memory.allocate(32, MemoryScope::Scratch).unwrap_err();
        assert_eq!(
            err,
            DeviceError::OutOfMemory {
                scope: MemoryScope::Scratch,
                requested: 32,
                available: 16,
            }
        );
        assert_eq!(memory.used(MemoryScope::Default), 0);
        assert!(memory.allocate(32, MemoryScope::Default).is_ok());
    }

    #[test]
    fn test_zero_sized_allocation() {
        let mut memory = MemoryManager::new(0, 0);
        let handle = memory.allocate(0, MemoryScope::Scratch).unwrap();
        memory.write(handle, &[]).unwrap();
        assert!(memory.read(handle).unwrap().is_empty());
    }

    #[test]
    fn test_write_size_mismatch() {
        let mut memory = MemoryManager::new(64, 0);
        let handle = memory.allocate(8, MemoryScope::Default).unwrap();
        assert!(matches!(
            memory.write(handle, &[0; 4]),
            Err(DeviceError::SizeMismatch { expected: 8, actual: 4, .. })
        ));
    }

    #[test]
    fn test_checked_out_buffer_is_not_readable() {
        let mut memory = MemoryManager::new(64, 0);
        let handle = memory.allocate(8, MemoryScope::Default).unwrap();
        let bytes = memory.check_out(handle).unwrap();
        assert!(memory.bytes(handle).is_err());
        assert!(memory.check_out(handle).is_err());
        memory.check_in(handle, bytes).unwrap();
        assert_eq!(memory.bytes(handle).unwrap().len(), 8);
    }

    #[test]
    fn test_clear_releases_everything() {
        let mut memory = MemoryManager::new(64, 16);
        memory.allocate(8, MemoryScope::Default).unwrap();
        memory.allocate(8, MemoryScope::Scratch).unwrap();
        memory.clear();
        assert_eq!(memory.live_allocations(), 0);
        assert_eq!(memory.available(MemoryScope::Scratch), 16);
    }
}
