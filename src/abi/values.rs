use crate::abi::{InterfaceType, MAX_FLAGS};
use crate::error::AbiError;
use anyhow::{Result, bail};

/// A dynamically typed component value.
///
/// This is what host functions receive and return, and what callers of
/// exported functions pass in and get back. The shape of a `Val` must match
/// the [`InterfaceType`] it is lowered with.
#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    Bool(bool),
    S8(i8),
    U8(u8),
    S16(i16),
    U16(u16),
    S32(i32),
    U32(u32),
    S64(i64),
    U64(u64),
    Float32(f32),
    Float64(f64),
    Char(char),
    String(String),
    List(Vec<Val>),
    Record(Vec<(String, Val)>),
    Tuple(Vec<Val>),
    Variant(String, Option<Box<Val>>),
    Enum(String),
    Option(Option<Box<Val>>),
    Result(Result<Option<Box<Val>>, Option<Box<Val>>>),
    Flags(Vec<String>),
}

impl Val {
    pub fn desc(&self) -> &'static str {
        match self {
            Val::Bool(_) => "bool",
            Val::U8(_) => "u8",
            Val::S8(_) => "s8",
            Val::U16(_) => "u16",
            Val::S16(_) => "s16",
            Val::U32(_) => "u32",
            Val::S32(_) => "s32",
            Val::U64(_) => "u64",
            Val::S64(_) => "s64",
            Val::Float32(_) => "f32",
            Val::Float64(_) => "f64",
            Val::Char(_) => "char",
            Val::List(_) => "list",
            Val::String(_) => "string",
            Val::Record(_) => "record",
            Val::Enum(_) => "enum",
            Val::Variant(..) => "variant",
            Val::Tuple(_) => "tuple",
            Val::Option(_) => "option",
            Val::Result(_) => "result",
            Val::Flags(_) => "flags",
        }
    }

    /// Shorthand for `Val::Variant` with a payload.
    pub fn variant(case: &str, payload: Val) -> Val {
        Val::Variant(case.to_string(), Some(Box::new(payload)))
    }

    pub fn string(s: impl Into<String>) -> Val {
        Val::String(s.into())
    }

    /// Converts into the guest payload of a `result` value, or `None` if this
    /// is not a result.
    pub fn into_result(self) -> Option<Result<Option<Val>, Option<Val>>> {
        match self {
            Val::Result(Ok(v)) => Some(Ok(v.map(|v| *v))),
            Val::Result(Err(v)) => Some(Err(v.map(|v| *v))),
            _ => None,
        }
    }
}

/// A variant-shaped value resolved against its type: the discriminant and the
/// payload together with the payload's type.
pub(crate) struct GenericVariant<'a> {
    pub discriminant: u32,
    pub payload: Option<(&'a Val, &'a InterfaceType)>,
}

impl<'a> GenericVariant<'a> {
    /// Resolves `val` against the variant-shaped type `ty`.
    pub fn new(ty: &'a InterfaceType, val: &'a Val) -> Result<GenericVariant<'a>> {
        match (ty, val) {
            (InterfaceType::Variant(cases), Val::Variant(name, payload)) => {
                let (i, case) = cases
                    .iter()
                    .enumerate()
                    .find(|(_, c)| c.name == *name)
                    .ok_or_else(|| anyhow::anyhow!("unknown variant case: `{name}`"))?;
                GenericVariant::with_payload(i, case.ty.as_ref(), payload.as_deref())
            }
            (InterfaceType::Enum(names), Val::Enum(name)) => {
                let i = names
                    .iter()
                    .position(|n| n == name)
                    .ok_or_else(|| anyhow::anyhow!("enum variant name `{name}` is not valid"))?;
                GenericVariant::with_payload(i, None, None)
            }
            (InterfaceType::Option(payload_ty), Val::Option(payload)) => match payload {
                None => GenericVariant::with_payload(0, None, None),
                Some(v) => GenericVariant::with_payload(1, Some(&**payload_ty), Some(&**v)),
            },
            (InterfaceType::Result(r), Val::Result(result)) => match result {
                Ok(v) => GenericVariant::with_payload(0, r.ok.as_ref(), v.as_deref()),
                Err(v) => GenericVariant::with_payload(1, r.err.as_ref(), v.as_deref()),
            },
            _ => unexpected(ty, val),
        }
    }

    fn with_payload(
        index: usize,
        ty: Option<&'a InterfaceType>,
        payload: Option<&'a Val>,
    ) -> Result<GenericVariant<'a>> {
        let payload = match (ty, payload) {
            (Some(ty), Some(val)) => Some((val, ty)),
            (None, None) => None,
            (Some(_), None) => bail!("expected a payload for case {index}"),
            (None, Some(_)) => bail!("unexpected payload for case {index}"),
        };
        Ok(GenericVariant {
            discriminant: u32::try_from(index)?,
            payload,
        })
    }
}

/// Builds the `Val` for case `discriminant` of the variant-shaped type `ty`.
pub(crate) fn make_variant(
    ty: &InterfaceType,
    discriminant: u32,
    payload: Option<Val>,
) -> Val {
    let payload = payload.map(Box::new);
    match ty {
        InterfaceType::Variant(cases) => {
            Val::Variant(cases[discriminant as usize].name.clone(), payload)
        }
        InterfaceType::Enum(names) => Val::Enum(names[discriminant as usize].clone()),
        InterfaceType::Option(_) => Val::Option(payload),
        InterfaceType::Result(_) => Val::Result(if discriminant == 0 {
            Ok(payload)
        } else {
            Err(payload)
        }),
        _ => unreachable!("not a variant-shaped type"),
    }
}

/// Looks up the payload type of case `discriminant`, failing if the
/// discriminant is out of range.
pub(crate) fn case_type<'a>(
    ty: &'a InterfaceType,
    discriminant: u32,
) -> Result<Option<&'a InterfaceType>> {
    let cases = ty.cases().ok_or_else(|| anyhow::anyhow!("{ty} has no cases"))?;
    let count = cases.len();
    match cases.get(discriminant as usize) {
        Some(case) => Ok(*case),
        None => Err(AbiError::InvalidDiscriminant {
            ty: ty.desc(),
            value: discriminant,
            cases: u32::try_from(count)?,
        }
        .into()),
    }
}

pub(crate) fn push_flags(names: &[String], flags: &mut Vec<String>, mut offset: u32, mut bits: u32) {
    while bits > 0 {
        if bits & 1 != 0 {
            if let Some(name) = names.get(offset as usize) {
                flags.push(name.clone());
            }
        }
        bits >>= 1;
        offset += 1;
    }
}

pub(crate) fn check_flags(names: &[String]) -> Result<()> {
    if names.len() > MAX_FLAGS {
        return Err(AbiError::TooManyFlags(names.len()).into());
    }
    Ok(())
}

pub(crate) fn flags_to_storage(names: &[String], flags: &[String]) -> Result<Vec<u32>> {
    check_flags(names)?;
    let mut storage = vec![0u32; names.len().div_ceil(32)];
    for flag in flags {
        let bit = names
            .iter()
            .position(|n| n == flag)
            .ok_or_else(|| AbiError::UnknownFlag(flag.clone()))?;
        storage[bit / 32] |= 1 << (bit % 32);
    }
    Ok(storage)
}

#[cold]
pub(crate) fn unexpected<T>(ty: &InterfaceType, val: &Val) -> Result<T> {
    Err(AbiError::TypeMismatch {
        expected: ty.to_string(),
        found: val.desc(),
    }
    .into())
}
