//! Lowering: encoding [`Val`]s into flat core values and linear memory.

use crate::abi::values::{GenericVariant, flags_to_storage, unexpected};
use crate::abi::{DiscriminantSize, FlagsSize, FlatType, InterfaceType, LowerContext, Val, align_to};
use anyhow::{Result, bail};

impl Val {
    /// Lowers this value as type `ty`, appending its flat core values to `dst`.
    pub(crate) fn lower(
        &self,
        cx: &mut LowerContext<'_>,
        ty: &InterfaceType,
        dst: &mut Vec<wasmtime::Val>,
    ) -> Result<()> {
        match (ty, self) {
            (InterfaceType::Bool, Val::Bool(b)) => dst.push(wasmtime::Val::I32(i32::from(*b))),
            (InterfaceType::S8, Val::S8(v)) => dst.push(wasmtime::Val::I32(i32::from(*v))),
            (InterfaceType::U8, Val::U8(v)) => dst.push(wasmtime::Val::I32(i32::from(*v))),
            (InterfaceType::S16, Val::S16(v)) => dst.push(wasmtime::Val::I32(i32::from(*v))),
            (InterfaceType::U16, Val::U16(v)) => dst.push(wasmtime::Val::I32(i32::from(*v))),
            (InterfaceType::S32, Val::S32(v)) => dst.push(wasmtime::Val::I32(*v)),
            (InterfaceType::U32, Val::U32(v)) => dst.push(wasmtime::Val::I32(*v as i32)),
            (InterfaceType::S64, Val::S64(v)) => dst.push(wasmtime::Val::I64(*v)),
            (InterfaceType::U64, Val::U64(v)) => dst.push(wasmtime::Val::I64(*v as i64)),
            (InterfaceType::Float32, Val::Float32(v)) => dst.push(wasmtime::Val::F32(v.to_bits())),
            (InterfaceType::Float64, Val::Float64(v)) => dst.push(wasmtime::Val::F64(v.to_bits())),
            (InterfaceType::Char, Val::Char(c)) => dst.push(wasmtime::Val::I32(u32::from(*c) as i32)),
            (InterfaceType::String, Val::String(s)) => {
                let (ptr, len) = lower_string(cx, s)?;
                dst.push(wasmtime::Val::I32(ptr as i32));
                dst.push(wasmtime::Val::I32(len as i32));
            }
            (InterfaceType::List(element), Val::List(items)) => {
                let (ptr, len) = lower_list(cx, element, items)?;
                dst.push(wasmtime::Val::I32(ptr as i32));
                dst.push(wasmtime::Val::I32(len as i32));
            }
            (InterfaceType::Record(fields), Val::Record(values)) => {
                if fields.len() != values.len() {
                    bail!("expected {} fields, got {}", fields.len(), values.len());
                }
                for ((name, value), field) in values.iter().zip(fields.iter()) {
                    if *name != field.name {
                        bail!("expected field `{}`, got `{name}`", field.name);
                    }
                    value.lower(cx, &field.ty, dst)?;
                }
            }
            (InterfaceType::Tuple(types), Val::Tuple(values)) => {
                if types.len() != values.len() {
                    bail!("expected {} types, got {}", types.len(), values.len());
                }
                for (value, ty) in values.iter().zip(types.iter()) {
                    value.lower(cx, ty, dst)?;
                }
            }
            (InterfaceType::Flags(names), Val::Flags(flags)) => {
                for word in flags_to_storage(names, flags)? {
                    dst.push(wasmtime::Val::I32(word as i32));
                }
            }
            (
                InterfaceType::Variant(_)
                | InterfaceType::Enum(_)
                | InterfaceType::Option(_)
                | InterfaceType::Result(_),
                _,
            ) => lower_variant(cx, ty, &GenericVariant::new(ty, self)?, dst)?,
            _ => return unexpected(ty, self),
        }
        Ok(())
    }

    /// Stores this value as type `ty` at `offset` in linear memory.
    pub(crate) fn store(&self, cx: &mut LowerContext<'_>, ty: &InterfaceType, offset: u32) -> Result<()> {
        debug_assert!(offset % ty.align() == 0);
        match (ty, self) {
            (InterfaceType::Bool, Val::Bool(b)) => *cx.get::<1>(offset)? = [u8::from(*b)],
            (InterfaceType::S8, Val::S8(v)) => *cx.get(offset)? = v.to_le_bytes(),
            (InterfaceType::U8, Val::U8(v)) => *cx.get(offset)? = v.to_le_bytes(),
            (InterfaceType::S16, Val::S16(v)) => *cx.get(offset)? = v.to_le_bytes(),
            (InterfaceType::U16, Val::U16(v)) => *cx.get(offset)? = v.to_le_bytes(),
            (InterfaceType::S32, Val::S32(v)) => *cx.get(offset)? = v.to_le_bytes(),
            (InterfaceType::U32, Val::U32(v)) => *cx.get(offset)? = v.to_le_bytes(),
            (InterfaceType::S64, Val::S64(v)) => *cx.get(offset)? = v.to_le_bytes(),
            (InterfaceType::U64, Val::U64(v)) => *cx.get(offset)? = v.to_le_bytes(),
            (InterfaceType::Float32, Val::Float32(v)) => *cx.get(offset)? = v.to_le_bytes(),
            (InterfaceType::Float64, Val::Float64(v)) => *cx.get(offset)? = v.to_le_bytes(),
            (InterfaceType::Char, Val::Char(c)) => *cx.get(offset)? = u32::from(*c).to_le_bytes(),
            (InterfaceType::String, Val::String(s)) => {
                let (ptr, len) = lower_string(cx, s)?;
                store_pointer_pair(cx, offset, ptr, len)?;
            }
            (InterfaceType::List(element), Val::List(items)) => {
                let (ptr, len) = lower_list(cx, element, items)?;
                store_pointer_pair(cx, offset, ptr, len)?;
            }
            (InterfaceType::Record(fields), Val::Record(values)) => {
                if fields.len() != values.len() {
                    bail!("expected {} fields, got {}", fields.len(), values.len());
                }
                let mut field_offset = 0;
                for ((name, value), field) in values.iter().zip(fields.iter()) {
                    if *name != field.name {
                        bail!("expected field `{}`, got `{name}`", field.name);
                    }
                    let at = next_field(&field.ty, &mut field_offset);
                    value.store(cx, &field.ty, offset + at)?;
                }
            }
            (InterfaceType::Tuple(types), Val::Tuple(values)) => {
                if types.len() != values.len() {
                    bail!("expected {} types, got {}", types.len(), values.len());
                }
                let mut field_offset = 0;
                for (value, ty) in values.iter().zip(types.iter()) {
                    let at = next_field(ty, &mut field_offset);
                    value.store(cx, ty, offset + at)?;
                }
            }
            (InterfaceType::Flags(names), Val::Flags(flags)) => {
                let storage = flags_to_storage(names, flags)?;
                match FlagsSize::from_count(names.len()) {
                    FlagsSize::Size0 => {}
                    FlagsSize::Size1 => *cx.get(offset)? = (storage[0] as u8).to_le_bytes(),
                    FlagsSize::Size2 => *cx.get(offset)? = (storage[0] as u16).to_le_bytes(),
                    FlagsSize::Size4Plus(_) => {
                        for (i, word) in storage.iter().enumerate() {
                            *cx.get(offset + 4 * i as u32)? = word.to_le_bytes();
                        }
                    }
                }
            }
            (
                InterfaceType::Variant(_)
                | InterfaceType::Enum(_)
                | InterfaceType::Option(_)
                | InterfaceType::Result(_),
                _,
            ) => store_variant(cx, ty, &GenericVariant::new(ty, self)?, offset)?,
            _ => return unexpected(ty, self),
        }
        Ok(())
    }
}

fn next_field(ty: &InterfaceType, offset: &mut u32) -> u32 {
    let abi = ty.abi();
    let start = align_to(*offset, abi.align);
    *offset = start + abi.size;
    start
}

fn store_pointer_pair(cx: &mut LowerContext<'_>, offset: u32, ptr: u32, len: u32) -> Result<()> {
    *cx.get(offset)? = ptr.to_le_bytes();
    *cx.get(offset + 4)? = len.to_le_bytes();
    Ok(())
}

/// Copies `s` into guest memory. The empty string is encoded as pointer `1`
/// with length `0` and does not allocate.
fn lower_string(cx: &mut LowerContext<'_>, s: &str) -> Result<(u32, u32)> {
    if s.is_empty() {
        return Ok((1, 0));
    }
    let len = u32::try_from(s.len())?;
    let ptr = cx.realloc(0, 0, 1, len)?;
    cx.bytes_mut(ptr, len)?.copy_from_slice(s.as_bytes());
    Ok((ptr, len))
}

fn lower_list(cx: &mut LowerContext<'_>, element: &InterfaceType, items: &[Val]) -> Result<(u32, u32)> {
    let abi = element.abi();
    let len = u32::try_from(items.len())?;
    let size = len
        .checked_mul(abi.size)
        .ok_or_else(|| anyhow::anyhow!("size overflow copying a list"))?;
    let ptr = cx.realloc(0, 0, abi.align, size)?;
    let mut element_ptr = ptr;
    for item in items {
        item.store(cx, element, element_ptr)?;
        element_ptr += abi.size;
    }
    Ok((ptr, len))
}

fn store_variant(
    cx: &mut LowerContext<'_>,
    ty: &InterfaceType,
    variant: &GenericVariant<'_>,
    offset: u32,
) -> Result<()> {
    let layout = ty.variant_layout();
    match layout.discriminant {
        DiscriminantSize::Size1 => *cx.get(offset)? = (variant.discriminant as u8).to_le_bytes(),
        DiscriminantSize::Size2 => *cx.get(offset)? = (variant.discriminant as u16).to_le_bytes(),
        DiscriminantSize::Size4 => *cx.get(offset)? = variant.discriminant.to_le_bytes(),
    }
    if let Some((value, case_ty)) = variant.payload {
        value.store(cx, case_ty, offset + layout.payload_offset)?;
    }
    Ok(())
}

fn lower_variant(
    cx: &mut LowerContext<'_>,
    ty: &InterfaceType,
    variant: &GenericVariant<'_>,
    dst: &mut Vec<wasmtime::Val>,
) -> Result<()> {
    dst.push(wasmtime::Val::I32(variant.discriminant as i32));
    let joined = ty.flat_variant_payload();
    let mut payload = Vec::new();
    if let Some((value, case_ty)) = variant.payload {
        value.lower(cx, case_ty, &mut payload)?;
    }
    // Widen each payload value to the joined slot type, then zero-fill the
    // slots this case does not use.
    for (i, want) in joined.iter().enumerate() {
        let val = match payload.get(i) {
            Some(val) => coerce(val, *want),
            None => zero(*want),
        };
        dst.push(val);
    }
    Ok(())
}

fn coerce(val: &wasmtime::Val, want: FlatType) -> wasmtime::Val {
    match (val, want) {
        (wasmtime::Val::F32(bits), FlatType::I32) => wasmtime::Val::I32(*bits as i32),
        (wasmtime::Val::I32(i), FlatType::I64) => wasmtime::Val::I64(i64::from(*i as u32)),
        (wasmtime::Val::F32(bits), FlatType::I64) => wasmtime::Val::I64(i64::from(*bits)),
        (wasmtime::Val::F64(bits), FlatType::I64) => wasmtime::Val::I64(*bits as i64),
        (val, _) => val.clone(),
    }
}

fn zero(ty: FlatType) -> wasmtime::Val {
    match ty {
        FlatType::I32 => wasmtime::Val::I32(0),
        FlatType::I64 => wasmtime::Val::I64(0),
        FlatType::F32 => wasmtime::Val::F32(0),
        FlatType::F64 => wasmtime::Val::F64(0),
    }
}
