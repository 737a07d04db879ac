//! Component-level interface types and their canonical ABI layout.

use crate::error::AbiError;
use std::fmt;

/// Maximum number of flat core parameters before parameters are passed
/// indirectly through linear memory.
pub const MAX_FLAT_PARAMS: usize = 16;

/// Maximum number of flat core results before results are returned through a
/// return area.
pub const MAX_FLAT_RESULTS: usize = 1;

/// Maximum number of names in a `flags` type: 255 words of 32 bits.
pub const MAX_FLAGS: usize = 32 * 255;

/// A component model value type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InterfaceType {
    Bool,
    S8,
    U8,
    S16,
    U16,
    S32,
    U32,
    S64,
    U64,
    Float32,
    Float64,
    Char,
    String,
    List(Box<InterfaceType>),
    Record(Box<[Field]>),
    Tuple(Box<[InterfaceType]>),
    Variant(Box<[Case]>),
    Enum(Box<[String]>),
    Option(Box<InterfaceType>),
    Result(Box<ResultType>),
    Flags(Box<[String]>),
}

/// A named field of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    pub name: String,
    pub ty: InterfaceType,
}

/// A case of a variant, with an optional payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Case {
    pub name: String,
    pub ty: Option<InterfaceType>,
}

/// The `ok` and `err` payloads of a `result`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResultType {
    pub ok: Option<InterfaceType>,
    pub err: Option<InterfaceType>,
}

impl InterfaceType {
    pub fn list(element: InterfaceType) -> InterfaceType {
        InterfaceType::List(Box::new(element))
    }

    pub fn option(payload: InterfaceType) -> InterfaceType {
        InterfaceType::Option(Box::new(payload))
    }

    pub fn result(ok: Option<InterfaceType>, err: Option<InterfaceType>) -> InterfaceType {
        InterfaceType::Result(Box::new(ResultType { ok, err }))
    }

    pub fn record<'a>(fields: impl IntoIterator<Item = (&'a str, InterfaceType)>) -> InterfaceType {
        InterfaceType::Record(
            fields
                .into_iter()
                .map(|(name, ty)| Field {
                    name: name.to_string(),
                    ty,
                })
                .collect(),
        )
    }

    pub fn tuple(types: impl IntoIterator<Item = InterfaceType>) -> InterfaceType {
        InterfaceType::Tuple(types.into_iter().collect())
    }

    pub fn variant<'a>(
        cases: impl IntoIterator<Item = (&'a str, Option<InterfaceType>)>,
    ) -> InterfaceType {
        InterfaceType::Variant(
            cases
                .into_iter()
                .map(|(name, ty)| Case {
                    name: name.to_string(),
                    ty,
                })
                .collect(),
        )
    }

    pub fn enum_<'a>(names: impl IntoIterator<Item = &'a str>) -> InterfaceType {
        InterfaceType::Enum(names.into_iter().map(str::to_string).collect())
    }

    pub fn flags<'a>(names: impl IntoIterator<Item = &'a str>) -> InterfaceType {
        InterfaceType::Flags(names.into_iter().map(str::to_string).collect())
    }

    /// Checks that this type, and every type nested in it, has a canonical
    /// layout.
    pub fn validate(&self) -> Result<(), AbiError> {
        match self {
            InterfaceType::Flags(names) if names.len() > MAX_FLAGS => {
                Err(AbiError::TooManyFlags(names.len()))
            }
            InterfaceType::List(ty) | InterfaceType::Option(ty) => ty.validate(),
            InterfaceType::Record(fields) => fields.iter().try_for_each(|f| f.ty.validate()),
            InterfaceType::Tuple(types) => types.iter().try_for_each(InterfaceType::validate),
            InterfaceType::Variant(cases) => cases
                .iter()
                .filter_map(|c| c.ty.as_ref())
                .try_for_each(InterfaceType::validate),
            InterfaceType::Result(r) => r
                .ok
                .iter()
                .chain(r.err.iter())
                .try_for_each(InterfaceType::validate),
            _ => Ok(()),
        }
    }

    /// A short name for the kind of this type, used in error messages.
    pub fn desc(&self) -> &'static str {
        match self {
            InterfaceType::Bool => "bool",
            InterfaceType::S8 => "s8",
            InterfaceType::U8 => "u8",
            InterfaceType::S16 => "s16",
            InterfaceType::U16 => "u16",
            InterfaceType::S32 => "s32",
            InterfaceType::U32 => "u32",
            InterfaceType::S64 => "s64",
            InterfaceType::U64 => "u64",
            InterfaceType::Float32 => "f32",
            InterfaceType::Float64 => "f64",
            InterfaceType::Char => "char",
            InterfaceType::String => "string",
            InterfaceType::List(_) => "list",
            InterfaceType::Record(_) => "record",
            InterfaceType::Tuple(_) => "tuple",
            InterfaceType::Variant(_) => "variant",
            InterfaceType::Enum(_) => "enum",
            InterfaceType::Option(_) => "option",
            InterfaceType::Result(_) => "result",
            InterfaceType::Flags(_) => "flags",
        }
    }

    /// Returns the size and alignment of this type in linear memory.
    pub fn abi(&self) -> CanonicalAbiInfo {
        match self {
            InterfaceType::Bool | InterfaceType::S8 | InterfaceType::U8 => {
                CanonicalAbiInfo::scalar(1)
            }
            InterfaceType::S16 | InterfaceType::U16 => CanonicalAbiInfo::scalar(2),
            InterfaceType::S32
            | InterfaceType::U32
            | InterfaceType::Float32
            | InterfaceType::Char => CanonicalAbiInfo::scalar(4),
            InterfaceType::S64 | InterfaceType::U64 | InterfaceType::Float64 => {
                CanonicalAbiInfo::scalar(8)
            }
            InterfaceType::String | InterfaceType::List(_) => CanonicalAbiInfo { size: 8, align: 4 },
            InterfaceType::Record(fields) => {
                CanonicalAbiInfo::record(fields.iter().map(|f| f.ty.abi()))
            }
            InterfaceType::Tuple(types) => CanonicalAbiInfo::record(types.iter().map(|t| t.abi())),
            InterfaceType::Flags(names) => match FlagsSize::from_count(names.len()) {
                FlagsSize::Size0 => CanonicalAbiInfo { size: 0, align: 1 },
                FlagsSize::Size1 => CanonicalAbiInfo::scalar(1),
                FlagsSize::Size2 => CanonicalAbiInfo::scalar(2),
                FlagsSize::Size4Plus(n) => CanonicalAbiInfo {
                    size: 4 * u32::from(n),
                    align: 4,
                },
            },
            _ => self.variant_layout().info,
        }
    }

    pub fn size(&self) -> u32 {
        self.abi().size
    }

    pub fn align(&self) -> u32 {
        self.abi().align
    }

    /// Returns the payload type of each case for variant-shaped types
    /// (`variant`, `enum`, `option` and `result`), or `None` otherwise.
    pub(crate) fn cases(&self) -> Option<Vec<Option<&InterfaceType>>> {
        Some(match self {
            InterfaceType::Variant(cases) => cases.iter().map(|c| c.ty.as_ref()).collect(),
            InterfaceType::Enum(names) => names.iter().map(|_| None).collect(),
            InterfaceType::Option(payload) => vec![None, Some(&**payload)],
            InterfaceType::Result(r) => vec![r.ok.as_ref(), r.err.as_ref()],
            _ => return None,
        })
    }

    /// Layout of a variant-shaped type: discriminant width and payload offset.
    ///
    /// # Panics
    ///
    /// Panics if `self` is not variant-shaped.
    pub(crate) fn variant_layout(&self) -> VariantLayout {
        let cases = self.cases().expect("not a variant-shaped type");
        let discriminant = DiscriminantSize::from_count(cases.len());
        let disc_bytes = discriminant.byte_size();
        let mut max_size = 0;
        let mut max_align = disc_bytes;
        for ty in cases.iter().flatten() {
            let info = ty.abi();
            max_size = max_size.max(info.size);
            max_align = max_align.max(info.align);
        }
        let payload_offset = align_to(disc_bytes, max_align);
        VariantLayout {
            discriminant,
            payload_offset,
            info: CanonicalAbiInfo {
                size: align_to(payload_offset + max_size, max_align),
                align: max_align,
            },
        }
    }

    /// Appends the flattened core representation of this type to `dst`.
    pub fn push_flat(&self, dst: &mut Vec<FlatType>) {
        match self {
            InterfaceType::Bool
            | InterfaceType::S8
            | InterfaceType::U8
            | InterfaceType::S16
            | InterfaceType::U16
            | InterfaceType::S32
            | InterfaceType::U32
            | InterfaceType::Char => dst.push(FlatType::I32),
            InterfaceType::S64 | InterfaceType::U64 => dst.push(FlatType::I64),
            InterfaceType::Float32 => dst.push(FlatType::F32),
            InterfaceType::Float64 => dst.push(FlatType::F64),
            InterfaceType::String | InterfaceType::List(_) => {
                dst.push(FlatType::I32);
                dst.push(FlatType::I32);
            }
            InterfaceType::Record(fields) => {
                for field in fields.iter() {
                    field.ty.push_flat(dst);
                }
            }
            InterfaceType::Tuple(types) => {
                for ty in types.iter() {
                    ty.push_flat(dst);
                }
            }
            InterfaceType::Flags(names) => {
                let words = names.len().div_ceil(32);
                dst.extend((0..words).map(|_| FlatType::I32));
            }
            _ => {
                dst.push(FlatType::I32);
                dst.extend(self.flat_variant_payload());
            }
        }
    }

    /// The joined flat representation of all case payloads of a
    /// variant-shaped type, not including the discriminant.
    pub(crate) fn flat_variant_payload(&self) -> Vec<FlatType> {
        let mut joined: Vec<FlatType> = Vec::new();
        let mut tmp = Vec::new();
        for ty in self.cases().into_iter().flatten().flatten() {
            tmp.clear();
            ty.push_flat(&mut tmp);
            for (i, a) in tmp.iter().enumerate() {
                match joined.get_mut(i) {
                    Some(b) => *b = FlatType::join(*a, *b),
                    None => joined.push(*a),
                }
            }
        }
        joined
    }

    /// Returns the flattened core representation of this type.
    pub fn flat(&self) -> Vec<FlatType> {
        let mut dst = Vec::new();
        self.push_flat(&mut dst);
        dst
    }
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.desc())
    }
}

/// A flattened core wasm value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlatType {
    I32,
    I64,
    F32,
    F64,
}

impl FlatType {
    fn join(a: FlatType, b: FlatType) -> FlatType {
        if a == b {
            return a;
        }
        match (a, b) {
            (FlatType::I32, FlatType::F32) | (FlatType::F32, FlatType::I32) => FlatType::I32,
            _ => FlatType::I64,
        }
    }

    pub fn to_val_type(self) -> wasmtime::ValType {
        match self {
            FlatType::I32 => wasmtime::ValType::I32,
            FlatType::I64 => wasmtime::ValType::I64,
            FlatType::F32 => wasmtime::ValType::F32,
            FlatType::F64 => wasmtime::ValType::F64,
        }
    }
}

/// Size and alignment of a type in linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonicalAbiInfo {
    pub size: u32,
    pub align: u32,
}

impl CanonicalAbiInfo {
    const fn scalar(size: u32) -> CanonicalAbiInfo {
        CanonicalAbiInfo { size, align: size }
    }

    fn record(fields: impl Iterator<Item = CanonicalAbiInfo>) -> CanonicalAbiInfo {
        let mut size = 0;
        let mut align = 1;
        for field in fields {
            size = align_to(size, field.align) + field.size;
            align = align.max(field.align);
        }
        CanonicalAbiInfo {
            size: align_to(size, align),
            align,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct VariantLayout {
    pub discriminant: DiscriminantSize,
    pub payload_offset: u32,
    pub info: CanonicalAbiInfo,
}

/// Width of a variant's discriminant in linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscriminantSize {
    Size1,
    Size2,
    Size4,
}

impl DiscriminantSize {
    pub fn from_count(count: usize) -> DiscriminantSize {
        if count <= 1 << 8 {
            DiscriminantSize::Size1
        } else if count <= 1 << 16 {
            DiscriminantSize::Size2
        } else {
            DiscriminantSize::Size4
        }
    }

    pub fn byte_size(self) -> u32 {
        match self {
            DiscriminantSize::Size1 => 1,
            DiscriminantSize::Size2 => 2,
            DiscriminantSize::Size4 => 4,
        }
    }
}

/// Width of a `flags` value in linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagsSize {
    Size0,
    Size1,
    Size2,
    /// Number of `u32` words.
    Size4Plus(u8),
}

impl FlagsSize {
    pub fn from_count(count: usize) -> FlagsSize {
        if count == 0 {
            FlagsSize::Size0
        } else if count <= 8 {
            FlagsSize::Size1
        } else if count <= 16 {
            FlagsSize::Size2
        } else {
            // Counts above MAX_FLAGS are rejected by `InterfaceType::validate`
            // and by lifting and lowering, so this fits in a u8.
            let words = count.div_ceil(32);
            FlagsSize::Size4Plus(u8::try_from(words).unwrap_or(u8::MAX))
        }
    }
}

/// Rounds `n` up to a multiple of `align`, which must be a power of two.
pub const fn align_to(n: u32, align: u32) -> u32 {
    assert!(align.is_power_of_two());
    (n + (align - 1)) & !(align - 1)
}

/// A component function signature: named parameters and an optional result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncSignature {
    pub params: Vec<(String, InterfaceType)>,
    pub result: Option<InterfaceType>,
}

/// Direction in which a component function is adapted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    /// A guest export lifted into a host-callable function.
    Lift,
    /// A host function lowered into a guest import.
    Lower,
}

/// The core wasm signature of a component function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreSignature {
    pub params: Vec<FlatType>,
    pub results: Vec<FlatType>,
    /// Whether all parameters are passed through a single pointer.
    pub params_indirect: bool,
    /// Whether results are passed through memory. For [`Context::Lift`] the
    /// callee returns the pointer, for [`Context::Lower`] the caller passes it
    /// as the last parameter.
    pub results_indirect: bool,
}

impl FuncSignature {
    pub fn new<'a>(
        params: impl IntoIterator<Item = (&'a str, InterfaceType)>,
        result: Option<InterfaceType>,
    ) -> FuncSignature {
        FuncSignature {
            params: params
                .into_iter()
                .map(|(name, ty)| (name.to_string(), ty))
                .collect(),
            result,
        }
    }

    /// Validates every parameter and result type.
    pub fn validate(&self) -> Result<(), AbiError> {
        self.params
            .iter()
            .map(|(_, ty)| ty)
            .chain(self.result.iter())
            .try_for_each(InterfaceType::validate)
    }

    /// The parameters as a single tuple type, used when they are passed
    /// indirectly.
    pub fn params_tuple(&self) -> InterfaceType {
        InterfaceType::tuple(self.params.iter().map(|(_, ty)| ty.clone()))
    }

    pub fn core(&self, context: Context) -> CoreSignature {
        let mut params = Vec::new();
        for (_, ty) in self.params.iter() {
            ty.push_flat(&mut params);
        }
        let mut params_indirect = false;
        if params.len() > MAX_FLAT_PARAMS {
            params = vec![FlatType::I32];
            params_indirect = true;
        }

        let mut results = Vec::new();
        if let Some(ty) = &self.result {
            ty.push_flat(&mut results);
        }
        let mut results_indirect = false;
        if results.len() > MAX_FLAT_RESULTS {
            results_indirect = true;
            match context {
                Context::Lift => results = vec![FlatType::I32],
                Context::Lower => {
                    results.truncate(0);
                    params.push(FlatType::I32);
                }
            }
        }
        CoreSignature {
            params,
            results,
            params_indirect,
            results_indirect,
        }
    }
}

impl CoreSignature {
    pub fn func_type(&self, engine: &wasmtime::Engine) -> wasmtime::FuncType {
        wasmtime::FuncType::new(
            engine,
            self.params.iter().map(|t| t.to_val_type()),
            self.results.iter().map(|t| t.to_val_type()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout() {
        let ty = InterfaceType::record([
            ("a", InterfaceType::U8),
            ("b", InterfaceType::U32),
            ("c", InterfaceType::U16),
        ]);
        assert_eq!(ty.abi(), CanonicalAbiInfo { size: 12, align: 4 });
        assert_eq!(
            InterfaceType::tuple([]).abi(),
            CanonicalAbiInfo { size: 0, align: 1 }
        );
    }

    #[test]
    fn variant_layout() {
        let ty = InterfaceType::result(Some(InterfaceType::U32), Some(InterfaceType::String));
        let layout = ty.variant_layout();
        assert_eq!(layout.discriminant, DiscriminantSize::Size1);
        assert_eq!(layout.payload_offset, 4);
        assert_eq!(layout.info, CanonicalAbiInfo { size: 12, align: 4 });

        let ty = InterfaceType::option(InterfaceType::U64);
        assert_eq!(ty.abi(), CanonicalAbiInfo { size: 16, align: 8 });

        let ty = InterfaceType::enum_(["a", "b", "c"]);
        assert_eq!(ty.abi(), CanonicalAbiInfo { size: 1, align: 1 });

        let names = (0..300).map(|i| format!("c{i}")).collect::<Vec<_>>();
        let ty = InterfaceType::enum_(names.iter().map(|s| s.as_str()));
        assert_eq!(ty.abi(), CanonicalAbiInfo { size: 2, align: 2 });
    }

    #[test]
    fn flags_layout() {
        let names = (0..40).map(|i| format!("f{i}")).collect::<Vec<_>>();
        let ty = InterfaceType::flags(names.iter().map(|s| s.as_str()));
        assert_eq!(ty.abi(), CanonicalAbiInfo { size: 8, align: 4 });
        assert_eq!(ty.flat(), [FlatType::I32, FlatType::I32]);
        assert_eq!(InterfaceType::flags(["a"]).size(), 1);
        assert_eq!(InterfaceType::flags(["a"; 9]).size(), 2);
    }

    #[test]
    fn oversized_flags_are_invalid() {
        let names = (0..=MAX_FLAGS).map(|i| format!("f{i}")).collect::<Vec<_>>();
        let big = InterfaceType::flags(names.iter().map(|s| s.as_str()));
        assert_eq!(big.validate(), Err(AbiError::TooManyFlags(MAX_FLAGS + 1)));

        let limit = InterfaceType::flags(names[..MAX_FLAGS].iter().map(|s| s.as_str()));
        assert_eq!(limit.validate(), Ok(()));
        assert_eq!(limit.size(), 4 * 255);

        let nested = FuncSignature::new(
            [("ok", InterfaceType::U8)],
            Some(InterfaceType::option(InterfaceType::list(big))),
        );
        assert_eq!(nested.validate(), Err(AbiError::TooManyFlags(MAX_FLAGS + 1)));
    }

    #[test]
    fn variant_flattening_joins_payloads() {
        let ty = InterfaceType::variant([
            ("a", Some(InterfaceType::Float32)),
            ("b", Some(InterfaceType::U32)),
            ("c", None),
        ]);
        assert_eq!(ty.flat(), [FlatType::I32, FlatType::I32]);

        let ty = InterfaceType::variant([
            ("a", Some(InterfaceType::Float32)),
            ("b", Some(InterfaceType::Float64)),
            ("c", Some(InterfaceType::String)),
        ]);
        assert_eq!(ty.flat(), [FlatType::I32, FlatType::I64, FlatType::I32]);
    }

    #[test]
    fn core_signatures() {
        let sig = FuncSignature::new(
            [("s", InterfaceType::String)],
            Some(InterfaceType::String),
        );
        let lift = sig.core(Context::Lift);
        assert_eq!(lift.params, [FlatType::I32, FlatType::I32]);
        assert_eq!(lift.results, [FlatType::I32]);
        assert!(lift.results_indirect);

        let lower = sig.core(Context::Lower);
        assert_eq!(lower.params, [FlatType::I32; 3]);
        assert!(lower.results.is_empty());

        let many = FuncSignature::new(
            (0..9).map(|_| ("s", InterfaceType::String)),
            Some(InterfaceType::U32),
        );
        let core = many.core(Context::Lift);
        assert!(core.params_indirect);
        assert_eq!(core.params, [FlatType::I32]);
        assert_eq!(core.results, [FlatType::I32]);
        assert!(!core.results_indirect);
    }
}
