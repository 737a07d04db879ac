//! Lifting: decoding flat core values and linear memory into [`Val`]s.

use crate::abi::values::{case_type, check_flags, make_variant, push_flags};
use crate::abi::{DiscriminantSize, FlagsSize, FlatType, InterfaceType, LiftContext, Val};
use crate::error::AbiError;
use anyhow::{Result, anyhow, bail};

/// A source of flat core values, consumed in order.
pub(crate) trait FlatSource {
    /// Returns the next value, which is expected to have type `want`.
    fn next(&mut self, want: FlatType) -> Result<wasmtime::Val>;
}

/// Flat values coming straight from a core call.
pub(crate) struct FlatIter<'a> {
    vals: std::slice::Iter<'a, wasmtime::Val>,
}

impl<'a> FlatIter<'a> {
    pub fn new(vals: &'a [wasmtime::Val]) -> FlatIter<'a> {
        FlatIter { vals: vals.iter() }
    }

    pub fn remaining(&self) -> usize {
        self.vals.len()
    }
}

impl FlatSource for FlatIter<'_> {
    fn next(&mut self, want: FlatType) -> Result<wasmtime::Val> {
        let val = self
            .vals
            .next()
            .ok_or_else(|| anyhow!("too few core values"))?;
        let ok = matches!(
            (want, val),
            (FlatType::I32, wasmtime::Val::I32(_))
                | (FlatType::I64, wasmtime::Val::I64(_))
                | (FlatType::F32, wasmtime::Val::F32(_))
                | (FlatType::F64, wasmtime::Val::F64(_))
        );
        if !ok {
            bail!("expected core value of type {want:?}, found {val:?}");
        }
        Ok(val.clone())
    }
}

/// Reads a variant case payload out of the joined flat slots of its variant,
/// converting each slot back to the type the case itself flattens to.
struct CoerceSource<'a> {
    inner: &'a mut dyn FlatSource,
    joined: std::vec::IntoIter<FlatType>,
}

impl FlatSource for CoerceSource<'_> {
    fn next(&mut self, want: FlatType) -> Result<wasmtime::Val> {
        let have = self
            .joined
            .next()
            .ok_or_else(|| anyhow!("variant payload exceeds its flat representation"))?;
        let val = self.inner.next(have)?;
        Ok(match (have, want, val) {
            (FlatType::I32, FlatType::F32, wasmtime::Val::I32(i)) => wasmtime::Val::F32(i as u32),
            (FlatType::I64, FlatType::I32, wasmtime::Val::I64(i)) => wasmtime::Val::I32(i as i32),
            (FlatType::I64, FlatType::F32, wasmtime::Val::I64(i)) => wasmtime::Val::F32(i as u32),
            (FlatType::I64, FlatType::F64, wasmtime::Val::I64(i)) => wasmtime::Val::F64(i as u64),
            (_, _, val) => val,
        })
    }
}

fn next_i32(src: &mut dyn FlatSource) -> Result<i32> {
    match src.next(FlatType::I32)? {
        wasmtime::Val::I32(i) => Ok(i),
        _ => unreachable!(),
    }
}

fn next_i64(src: &mut dyn FlatSource) -> Result<i64> {
    match src.next(FlatType::I64)? {
        wasmtime::Val::I64(i) => Ok(i),
        _ => unreachable!(),
    }
}

fn lift_bool(value: u32) -> Result<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        n => Err(AbiError::InvalidBool(n).into()),
    }
}

fn lift_char(value: u32) -> Result<char> {
    Ok(char::from_u32(value).ok_or(AbiError::InvalidChar(value))?)
}

impl Val {
    /// Lifts a value of type `ty` from flat core values.
    pub(crate) fn lift(cx: &LiftContext<'_>, ty: &InterfaceType, src: &mut dyn FlatSource) -> Result<Val> {
        Ok(match ty {
            InterfaceType::Bool => Val::Bool(lift_bool(next_i32(src)? as u32)?),
            InterfaceType::S8 => Val::S8(next_i32(src)? as i8),
            InterfaceType::U8 => Val::U8(next_i32(src)? as u8),
            InterfaceType::S16 => Val::S16(next_i32(src)? as i16),
            InterfaceType::U16 => Val::U16(next_i32(src)? as u16),
            InterfaceType::S32 => Val::S32(next_i32(src)?),
            InterfaceType::U32 => Val::U32(next_i32(src)? as u32),
            InterfaceType::S64 => Val::S64(next_i64(src)?),
            InterfaceType::U64 => Val::U64(next_i64(src)? as u64),
            InterfaceType::Float32 => match src.next(FlatType::F32)? {
                wasmtime::Val::F32(bits) => Val::Float32(f32::from_bits(bits)),
                _ => unreachable!(),
            },
            InterfaceType::Float64 => match src.next(FlatType::F64)? {
                wasmtime::Val::F64(bits) => Val::Float64(f64::from_bits(bits)),
                _ => unreachable!(),
            },
            InterfaceType::Char => Val::Char(lift_char(next_i32(src)? as u32)?),
            InterfaceType::String => {
                let ptr = next_i32(src)? as u32;
                let len = next_i32(src)? as u32;
                Val::String(load_string(cx, ptr, len)?)
            }
            InterfaceType::List(element) => {
                let ptr = next_i32(src)? as u32;
                let len = next_i32(src)? as u32;
                load_list(cx, element, ptr, len)?
            }
            InterfaceType::Record(fields) => Val::Record(
                fields
                    .iter()
                    .map(|field| Ok((field.name.clone(), Val::lift(cx, &field.ty, src)?)))
                    .collect::<Result<_>>()?,
            ),
            InterfaceType::Tuple(types) => Val::Tuple(
                types
                    .iter()
                    .map(|ty| Val::lift(cx, ty, src))
                    .collect::<Result<_>>()?,
            ),
            InterfaceType::Flags(names) => {
                check_flags(names)?;
                let mut flags = Vec::new();
                for i in 0..names.len().div_ceil(32) {
                    let bits = next_i32(src)? as u32;
                    push_flags(names, &mut flags, (i as u32) * 32, bits);
                }
                Val::Flags(flags)
            }
            InterfaceType::Variant(_)
            | InterfaceType::Enum(_)
            | InterfaceType::Option(_)
            | InterfaceType::Result(_) => lift_variant(cx, ty, src)?,
        })
    }

    /// Loads a value of type `ty` from `bytes`, which must be exactly
    /// `ty.size()` bytes of linear memory.
    pub(crate) fn load(cx: &LiftContext<'_>, ty: &InterfaceType, bytes: &[u8]) -> Result<Val> {
        debug_assert_eq!(bytes.len(), ty.size() as usize);
        Ok(match ty {
            InterfaceType::Bool => Val::Bool(lift_bool(u32::from(bytes[0]))?),
            InterfaceType::S8 => Val::S8(bytes[0] as i8),
            InterfaceType::U8 => Val::U8(bytes[0]),
            InterfaceType::S16 => Val::S16(i16::from_le_bytes(bytes.try_into()?)),
            InterfaceType::U16 => Val::U16(u16::from_le_bytes(bytes.try_into()?)),
            InterfaceType::S32 => Val::S32(i32::from_le_bytes(bytes.try_into()?)),
            InterfaceType::U32 => Val::U32(u32::from_le_bytes(bytes.try_into()?)),
            InterfaceType::S64 => Val::S64(i64::from_le_bytes(bytes.try_into()?)),
            InterfaceType::U64 => Val::U64(u64::from_le_bytes(bytes.try_into()?)),
            InterfaceType::Float32 => Val::Float32(f32::from_le_bytes(bytes.try_into()?)),
            InterfaceType::Float64 => Val::Float64(f64::from_le_bytes(bytes.try_into()?)),
            InterfaceType::Char => Val::Char(lift_char(u32::from_le_bytes(bytes.try_into()?))?),
            InterfaceType::String => {
                let (ptr, len) = load_pointer_pair(bytes)?;
                Val::String(load_string(cx, ptr, len)?)
            }
            InterfaceType::List(element) => {
                let (ptr, len) = load_pointer_pair(bytes)?;
                load_list(cx, element, ptr, len)?
            }
            InterfaceType::Record(fields) => {
                let mut offset = 0;
                let mut values = Vec::with_capacity(fields.len());
                for field in fields.iter() {
                    let field_bytes = next_field(&field.ty, &mut offset, bytes);
                    values.push((field.name.clone(), Val::load(cx, &field.ty, field_bytes)?));
                }
                Val::Record(values)
            }
            InterfaceType::Tuple(types) => {
                let mut offset = 0;
                let mut values = Vec::with_capacity(types.len());
                for ty in types.iter() {
                    values.push(Val::load(cx, ty, next_field(ty, &mut offset, bytes))?);
                }
                Val::Tuple(values)
            }
            InterfaceType::Flags(names) => {
                check_flags(names)?;
                let mut flags = Vec::new();
                match FlagsSize::from_count(names.len()) {
                    FlagsSize::Size0 => {}
                    FlagsSize::Size1 => push_flags(names, &mut flags, 0, u32::from(bytes[0])),
                    FlagsSize::Size2 => push_flags(
                        names,
                        &mut flags,
                        0,
                        u32::from(u16::from_le_bytes(bytes.try_into()?)),
                    ),
                    FlagsSize::Size4Plus(n) => {
                        for i in 0..usize::from(n) {
                            let bits = u32::from_le_bytes(bytes[i * 4..][..4].try_into()?);
                            push_flags(names, &mut flags, (i as u32) * 32, bits);
                        }
                    }
                }
                Val::Flags(flags)
            }
            InterfaceType::Variant(_)
            | InterfaceType::Enum(_)
            | InterfaceType::Option(_)
            | InterfaceType::Result(_) => load_variant(cx, ty, bytes)?,
        })
    }
}

fn next_field<'a>(ty: &InterfaceType, offset: &mut u32, bytes: &'a [u8]) -> &'a [u8] {
    let abi = ty.abi();
    let start = crate::abi::align_to(*offset, abi.align);
    *offset = start + abi.size;
    &bytes[start as usize..][..abi.size as usize]
}

fn load_pointer_pair(bytes: &[u8]) -> Result<(u32, u32)> {
    let ptr = u32::from_le_bytes(bytes[..4].try_into()?);
    let len = u32::from_le_bytes(bytes[4..8].try_into()?);
    Ok((ptr, len))
}

fn load_string(cx: &LiftContext<'_>, ptr: u32, len: u32) -> Result<String> {
    if len == 0 {
        return Ok(String::new());
    }
    let bytes = cx.slice("string", ptr, len, 1)?;
    match std::str::from_utf8(bytes) {
        Ok(s) => Ok(s.to_string()),
        Err(_) => Err(AbiError::InvalidUtf8.into()),
    }
}

fn load_list(cx: &LiftContext<'_>, element: &InterfaceType, ptr: u32, len: u32) -> Result<Val> {
    let abi = element.abi();
    let byte_len = len
        .checked_mul(abi.size)
        .ok_or(AbiError::OutOfBounds { what: "list" })?;
    let bytes = cx.slice("list", ptr, byte_len, abi.align)?;
    let size = abi.size as usize;
    Ok(Val::List(
        (0..len as usize)
            .map(|index| Val::load(cx, element, &bytes[index * size..][..size]))
            .collect::<Result<_>>()?,
    ))
}

fn load_variant(cx: &LiftContext<'_>, ty: &InterfaceType, bytes: &[u8]) -> Result<Val> {
    let layout = ty.variant_layout();
    let discriminant = match layout.discriminant {
        DiscriminantSize::Size1 => u32::from(bytes[0]),
        DiscriminantSize::Size2 => u32::from(u16::from_le_bytes(bytes[..2].try_into()?)),
        DiscriminantSize::Size4 => u32::from_le_bytes(bytes[..4].try_into()?),
    };
    let payload = match case_type(ty, discriminant)? {
        Some(case_ty) => {
            let size = case_ty.size() as usize;
            let offset = layout.payload_offset as usize;
            Some(Val::load(cx, case_ty, &bytes[offset..][..size])?)
        }
        None => None,
    };
    Ok(make_variant(ty, discriminant, payload))
}

fn lift_variant(cx: &LiftContext<'_>, ty: &InterfaceType, src: &mut dyn FlatSource) -> Result<Val> {
    let discriminant = next_i32(src)? as u32;
    let case_ty = case_type(ty, discriminant)?;
    let joined = ty.flat_variant_payload();
    let mut payload_src = CoerceSource {
        inner: src,
        joined: joined.into_iter(),
    };
    let payload = match case_ty {
        Some(case_ty) => Some(Val::lift(cx, case_ty, &mut payload_src)?),
        None => None,
    };
    // Skip the slots used only by other, wider cases.
    let CoerceSource { inner, joined } = payload_src;
    for have in joined {
        inner.next(have)?;
    }
    Ok(make_variant(ty, discriminant, payload))
}
