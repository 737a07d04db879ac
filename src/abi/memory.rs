//! Access to a guest's linear memory while lifting and lowering values.

use crate::error::AbiError;
use anyhow::Result;

/// A guest linear memory together with its `realloc` export.
///
/// Implemented over a live store for real instances; the marshalling code
/// only ever sees this trait.
pub trait GuestMemory {
    /// The current contents of linear memory.
    fn data(&self) -> Result<&[u8]>;

    fn data_mut(&mut self) -> Result<&mut [u8]>;

    /// Invokes the guest's `realloc(old_ptr, old_size, align, new_size)`.
    ///
    /// Callers should go through [`LowerContext::realloc`] which validates
    /// the returned pointer.
    fn realloc(&mut self, old_ptr: u32, old_size: u32, align: u32, new_size: u32) -> Result<u32>;
}

/// Context used when reading values out of guest memory.
#[derive(Clone, Copy)]
pub struct LiftContext<'a> {
    memory: Option<&'a [u8]>,
}

impl<'a> LiftContext<'a> {
    /// Creates a context over `memory`, or over no memory at all for
    /// functions whose types never touch it.
    pub fn new(memory: Option<&'a [u8]>) -> LiftContext<'a> {
        LiftContext { memory }
    }

    pub fn memory(&self) -> Result<&'a [u8]> {
        Ok(self.memory.ok_or(AbiError::MissingMemory)?)
    }

    /// Returns `len` bytes at `ptr`, checking bounds and that `ptr` is a
    /// multiple of `align`.
    pub fn slice(&self, what: &'static str, ptr: u32, len: u32, align: u32) -> Result<&'a [u8]> {
        let memory = self.memory()?;
        if ptr % align != 0 {
            return Err(AbiError::Misaligned { what, ptr, align }.into());
        }
        let start = ptr as usize;
        match start.checked_add(len as usize) {
            Some(end) if end <= memory.len() => Ok(&memory[start..end]),
            _ => Err(AbiError::OutOfBounds { what }.into()),
        }
    }
}

/// Context used when writing values into guest memory.
pub struct LowerContext<'a> {
    memory: &'a mut dyn GuestMemory,
}

impl<'a> LowerContext<'a> {
    pub fn new(memory: &'a mut dyn GuestMemory) -> LowerContext<'a> {
        LowerContext { memory }
    }

    /// Allocates `new_size` bytes aligned to `align` in guest memory.
    pub fn realloc(&mut self, old_ptr: u32, old_size: u32, align: u32, new_size: u32) -> Result<u32> {
        let ptr = self.memory.realloc(old_ptr, old_size, align, new_size)?;
        if ptr % align != 0 {
            return Err(AbiError::Misaligned {
                what: "realloc return",
                ptr,
                align,
            }
            .into());
        }
        let end = u64::from(ptr) + u64::from(new_size);
        if end > self.memory.data()?.len() as u64 {
            return Err(AbiError::OutOfBounds {
                what: "realloc return",
            }
            .into());
        }
        Ok(ptr)
    }

    /// Returns a mutable view of `N` bytes at `offset`.
    pub fn get<const N: usize>(&mut self, offset: u32) -> Result<&mut [u8; N]> {
        let bytes = self.bytes_mut(offset, N as u32)?;
        Ok(bytes.try_into()?)
    }

    pub fn bytes_mut(&mut self, offset: u32, len: u32) -> Result<&mut [u8]> {
        let memory = self.memory.data_mut()?;
        let start = offset as usize;
        match start.checked_add(len as usize) {
            Some(end) if end <= memory.len() => Ok(&mut memory[start..end]),
            _ => Err(AbiError::OutOfBounds { what: "store" }.into()),
        }
    }

    /// A read-only view of memory, used to lift what was just lowered.
    pub fn data(&self) -> Result<&[u8]> {
        self.memory.data()
    }
}

/// A standalone memory with a bump allocator, standing in for a guest.
#[cfg(test)]
pub(crate) struct VecMemory {
    pub bytes: Vec<u8>,
    pub next: u32,
    pub allocations: Vec<(u32, u32, u32)>,
}

#[cfg(test)]
impl VecMemory {
    pub fn new(size: usize) -> VecMemory {
        VecMemory {
            bytes: vec![0; size],
            // Keep address 0 unused so that null pointers stand out.
            next: 8,
            allocations: Vec::new(),
        }
    }
}

#[cfg(test)]
impl GuestMemory for VecMemory {
    fn data(&self) -> Result<&[u8]> {
        Ok(&self.bytes)
    }

    fn data_mut(&mut self) -> Result<&mut [u8]> {
        Ok(&mut self.bytes)
    }

    fn realloc(&mut self, old_ptr: u32, old_size: u32, align: u32, new_size: u32) -> Result<u32> {
        anyhow::ensure!(old_ptr == 0 && old_size == 0, "bump allocator cannot grow");
        let ptr = crate::abi::align_to(self.next, align);
        self.next = ptr + new_size;
        self.allocations.push((ptr, align, new_size));
        Ok(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BadAlloc(Vec<u8>, u32);

    impl GuestMemory for BadAlloc {
        fn data(&self) -> Result<&[u8]> {
            Ok(&self.0)
        }
        fn data_mut(&mut self) -> Result<&mut [u8]> {
            Ok(&mut self.0)
        }
        fn realloc(&mut self, _: u32, _: u32, _: u32, _: u32) -> Result<u32> {
            Ok(self.1)
        }
    }

    #[test]
    fn realloc_result_is_validated() {
        let mut mem = BadAlloc(vec![0; 64], 3);
        let mut cx = LowerContext::new(&mut mem);
        let err = cx.realloc(0, 0, 4, 8).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AbiError>(),
            Some(AbiError::Misaligned { ptr: 3, .. })
        ));

        let mut mem = BadAlloc(vec![0; 64], 60);
        let mut cx = LowerContext::new(&mut mem);
        let err = cx.realloc(0, 0, 4, 8).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AbiError>(),
            Some(AbiError::OutOfBounds { .. })
        ));
        assert_eq!(cx.realloc(0, 0, 4, 4).unwrap(), 60);
    }

    #[test]
    fn slices_are_checked() {
        let bytes = [0u8; 16];
        let cx = LiftContext::new(Some(&bytes));
        assert_eq!(cx.slice("list", 8, 8, 4).unwrap().len(), 8);
        assert!(cx.slice("list", 12, 8, 4).is_err());
        assert!(cx.slice("list", 2, 4, 4).is_err());
        assert!(LiftContext::new(None).memory().is_err());
    }
}
