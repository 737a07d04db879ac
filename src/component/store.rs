//! Per-instance store data and guest memory access through it.

use crate::abi::{GuestMemory, LiftContext};
use crate::concurrent::{ComponentInstanceIndex, Concurrent};
use crate::error::AbiError;
use anyhow::Result;
use wasmtime::{Memory, StoreContextMut, StoreLimits, TypedFunc};

/// Data held by the store of one component instance.
pub struct HostState {
    pub(crate) concurrent: Concurrent,
    pub(crate) instance: ComponentInstanceIndex,
    /// Recorded once the main module is instantiated.
    pub(crate) memory: Option<Memory>,
    pub(crate) realloc: Option<TypedFunc<(u32, u32, u32, u32), u32>>,
    pub(crate) limits: StoreLimits,
}

impl HostState {
    pub(crate) fn new(
        concurrent: Concurrent,
        instance: ComponentInstanceIndex,
        limits: StoreLimits,
    ) -> HostState {
        HostState {
            concurrent,
            instance,
            memory: None,
            realloc: None,
            limits,
        }
    }
}

/// [`GuestMemory`] over the memory and realloc recorded in a store.
pub(crate) struct StoreMemory<'a> {
    store: StoreContextMut<'a, HostState>,
}

impl<'a> StoreMemory<'a> {
    pub fn new(store: StoreContextMut<'a, HostState>) -> StoreMemory<'a> {
        StoreMemory { store }
    }

    /// A lift context over the current memory contents, or over no memory
    /// if none has been recorded yet.
    pub fn lift_context(&self) -> LiftContext<'_> {
        let memory = self.store.data().memory;
        LiftContext::new(memory.map(|m| m.data(&self.store)))
    }
}

impl GuestMemory for StoreMemory<'_> {
    fn data(&self) -> Result<&[u8]> {
        let memory = self.store.data().memory.ok_or(AbiError::MissingMemory)?;
        Ok(memory.data(&self.store))
    }

    fn data_mut(&mut self) -> Result<&mut [u8]> {
        let memory = self.store.data().memory.ok_or(AbiError::MissingMemory)?;
        Ok(memory.data_mut(&mut self.store))
    }

    fn realloc(&mut self, old_ptr: u32, old_size: u32, align: u32, new_size: u32) -> Result<u32> {
        let realloc = self
            .store
            .data()
            .realloc
            .clone()
            .ok_or(AbiError::MissingRealloc)?;
        realloc.call(&mut self.store, (old_ptr, old_size, align, new_size))
    }
}
