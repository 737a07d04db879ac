//! The canonical ABI: layout of component values in linear memory and as
//! flat core wasm values.
//!
//! Values cross the boundary in two shapes. Small signatures pass values as
//! flat core parameters and results ([`lift_flat`] / [`lower_flat`]), while
//! larger ones go through linear memory ([`load`] / [`store`]), with memory
//! for strings and lists obtained from the guest's `realloc` export.

mod lift;
mod lower;
mod memory;
mod types;
mod values;

pub use self::memory::{GuestMemory, LiftContext, LowerContext};
pub use self::types::*;
pub use self::values::Val;

#[cfg(test)]
pub(crate) use self::memory::VecMemory;

use anyhow::{Result, bail};

/// Lifts a sequence of values with types `types` from flat core values,
/// which must be consumed exactly.
pub fn lift_flat(
    cx: &LiftContext<'_>,
    types: &[InterfaceType],
    src: &[wasmtime::Val],
) -> Result<Vec<Val>> {
    let mut iter = lift::FlatIter::new(src);
    let vals = types
        .iter()
        .map(|ty| Val::lift(cx, ty, &mut iter))
        .collect::<Result<Vec<_>>>()?;
    if iter.remaining() != 0 {
        bail!("{} core value(s) left over after lifting", iter.remaining());
    }
    Ok(vals)
}

/// Lowers `vals` with types `types` into flat core values.
pub fn lower_flat(
    cx: &mut LowerContext<'_>,
    types: &[InterfaceType],
    vals: &[Val],
) -> Result<Vec<wasmtime::Val>> {
    if types.len() != vals.len() {
        bail!("expected {} values, got {}", types.len(), vals.len());
    }
    let mut dst = Vec::new();
    for (val, ty) in vals.iter().zip(types) {
        val.lower(cx, ty, &mut dst)?;
    }
    Ok(dst)
}

/// Loads a value of type `ty` stored at `ptr`, checking alignment and bounds.
pub fn load(cx: &LiftContext<'_>, ty: &InterfaceType, ptr: u32) -> Result<Val> {
    let abi = ty.abi();
    let bytes = cx.slice(ty.desc(), ptr, abi.size, abi.align)?;
    Val::load(cx, ty, bytes)
}

/// Stores `val` as type `ty` at `ptr`, which must be suitably aligned.
pub fn store(cx: &mut LowerContext<'_>, ty: &InterfaceType, val: &Val, ptr: u32) -> Result<()> {
    let align = ty.align();
    if ptr % align != 0 {
        return Err(crate::error::AbiError::Misaligned {
            what: ty.desc(),
            ptr,
            align,
        }
        .into());
    }
    val.store(cx, ty, ptr)
}

/// Allocates space for a value of type `ty` with `realloc` and stores `val`
/// there, returning the address.
pub fn store_new(cx: &mut LowerContext<'_>, ty: &InterfaceType, val: &Val) -> Result<u32> {
    let abi = ty.abi();
    let ptr = cx.realloc(0, 0, abi.align, abi.size)?;
    val.store(cx, ty, ptr)?;
    Ok(ptr)
}
