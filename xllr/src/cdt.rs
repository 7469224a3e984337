//! The cross-domain tagged value.
//!
//! A [`Cdt`] carries exactly one value of one [`CdtType`]. Strings and arrays
//! are owned by the cell: on the parameter side the host owns them for the
//! duration of the call, on the return side the guest hands ownership to the
//! host by writing the slot.

use std::fmt;

use crate::{Callable, Handle, XllrError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CdtType {
    Null,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Char8,
    Char16,
    Char32,
    String8,
    String16,
    String32,
    Handle,
    Callable,
    Array,
    /// Only meaningful in type descriptors: any concrete kind is accepted and
    /// checked when the call happens.
    Any,
    /// A rank-1 array of one primitive kind, stored contiguously.
    Packed,
}

impl CdtType {
    pub const ALL: [Self; 23] = [
        Self::Null,
        Self::Bool,
        Self::Int8,
        Self::Int16,
        Self::Int32,
        Self::Int64,
        Self::UInt8,
        Self::UInt16,
        Self::UInt32,
        Self::UInt64,
        Self::Float32,
        Self::Float64,
        Self::Char8,
        Self::Char16,
        Self::Char32,
        Self::String8,
        Self::String16,
        Self::String32,
        Self::Handle,
        Self::Callable,
        Self::Array,
        Self::Any,
        Self::Packed,
    ];

    /// Stable numeric tag used at the native boundary.
    pub const fn code(self) -> u32 {
        match self {
            Self::Null => 0,
            Self::Bool => 1,
            Self::Int8 => 2,
            Self::Int16 => 3,
            Self::Int32 => 4,
            Self::Int64 => 5,
            Self::UInt8 => 6,
            Self::UInt16 => 7,
            Self::UInt32 => 8,
            Self::UInt64 => 9,
            Self::Float32 => 10,
            Self::Float64 => 11,
            Self::Char8 => 12,
            Self::Char16 => 13,
            Self::Char32 => 14,
            Self::String8 => 15,
            Self::String16 => 16,
            Self::String32 => 17,
            Self::Handle => 18,
            Self::Callable => 19,
            Self::Array => 20,
            Self::Any => 21,
            Self::Packed => 22,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::UInt8 => "uint8",
            Self::UInt16 => "uint16",
            Self::UInt32 => "uint32",
            Self::UInt64 => "uint64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Char8 => "char8",
            Self::Char16 => "char16",
            Self::Char32 => "char32",
            Self::String8 => "string8",
            Self::String16 => "string16",
            Self::String32 => "string32",
            Self::Handle => "handle",
            Self::Callable => "callable",
            Self::Array => "array",
            Self::Any => "any",
            Self::Packed => "packed",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.name() == name)
    }

    /// Kinds an array may hold as leaf elements.
    pub const fn is_element(self) -> bool {
        !matches!(self, Self::Null | Self::Array | Self::Packed)
    }
}

impl fmt::Display for CdtType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cdt {
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Char8(u8),
    Char16(u16),
    Char32(char),
    String8(String),
    /// UTF-16 code units, length carried by the vector.
    String16(Vec<u16>),
    /// UTF-32 code units.
    String32(Vec<u32>),
    Handle(Handle),
    Callable(Callable),
    Array(CdtArray),
    Packed(PackedArray),
}

impl Cdt {
    pub fn cdt_type(&self) -> CdtType {
        match self {
            Self::Null => CdtType::Null,
            Self::Bool(_) => CdtType::Bool,
            Self::Int8(_) => CdtType::Int8,
            Self::Int16(_) => CdtType::Int16,
            Self::Int32(_) => CdtType::Int32,
            Self::Int64(_) => CdtType::Int64,
            Self::UInt8(_) => CdtType::UInt8,
            Self::UInt16(_) => CdtType::UInt16,
            Self::UInt32(_) => CdtType::UInt32,
            Self::UInt64(_) => CdtType::UInt64,
            Self::Float32(_) => CdtType::Float32,
            Self::Float64(_) => CdtType::Float64,
            Self::Char8(_) => CdtType::Char8,
            Self::Char16(_) => CdtType::Char16,
            Self::Char32(_) => CdtType::Char32,
            Self::String8(_) => CdtType::String8,
            Self::String16(_) => CdtType::String16,
            Self::String32(_) => CdtType::String32,
            Self::Handle(_) => CdtType::Handle,
            Self::Callable(_) => CdtType::Callable,
            Self::Array(_) => CdtType::Array,
            Self::Packed(_) => CdtType::Packed,
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Handle(handle) => handle.is_null(),
            _ => false,
        }
    }

    pub fn as_array(&self) -> Option<&CdtArray> {
        match self {
            Self::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_packed(&self) -> Option<&PackedArray> {
        match self {
            Self::Packed(packed) => Some(packed),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<Handle> {
        match self {
            Self::Handle(handle) => Some(*handle),
            _ => None,
        }
    }

    pub fn as_callable(&self) -> Option<&Callable> {
        match self {
            Self::Callable(callable) => Some(callable),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String8(s) => Some(s),
            _ => None,
        }
    }

    /// Typed extraction, failing with the actual kind on mismatch.
    pub fn get<T: FromCdt>(&self) -> Result<T, XllrError> {
        T::from_cdt(self)
    }

    /// Visits this value and, for arrays, every nested element.
    pub fn walk(&self, visit: &mut dyn FnMut(&Cdt)) {
        visit(self);
        if let Self::Array(array) = self {
            for item in array.items() {
                item.walk(visit);
            }
        }
    }

    pub fn string16(s: &str) -> Self {
        Self::String16(s.encode_utf16().collect())
    }

    pub fn string32(s: &str) -> Self {
        Self::String32(s.chars().map(u32::from).collect())
    }
}

/// Rank, element type and (possibly ragged) items of an array value.
///
/// A rank-1 array holds leaf elements; a rank-`n` array holds rank-`n - 1`
/// arrays of the same element type, each with its own length.
#[derive(Debug, Clone, PartialEq)]
pub struct CdtArray {
    element_type: CdtType,
    dimensions: u32,
    items: Vec<Cdt>,
}

impl CdtArray {
    pub fn new(
        element_type: CdtType,
        dimensions: u32,
        items: Vec<Cdt>,
    ) -> Result<Self, XllrError> {
        let array = Self {
            element_type,
            dimensions,
            items,
        };
        array.validate()?;
        Ok(array)
    }

    /// A rank-1 `any` array, which takes items of every kind.
    pub fn any(items: Vec<Cdt>) -> Self {
        Self {
            element_type: CdtType::Any,
            dimensions: 1,
            items,
        }
    }

    /// A rank-2 `any` array built from rows of items.
    pub fn any_rows(rows: impl IntoIterator<Item = Vec<Cdt>>) -> Self {
        Self {
            element_type: CdtType::Any,
            dimensions: 2,
            items: rows.into_iter().map(|row| Cdt::Array(Self::any(row))).collect(),
        }
    }

    pub fn from_1d<T: Into<Cdt>>(
        element_type: CdtType,
        items: impl IntoIterator<Item = T>,
    ) -> Result<Self, XllrError> {
        Self::new(element_type, 1, items.into_iter().map(Into::into).collect())
    }

    pub fn from_2d<T: Into<Cdt>, R: IntoIterator<Item = T>>(
        element_type: CdtType,
        rows: impl IntoIterator<Item = R>,
    ) -> Result<Self, XllrError> {
        let rows = rows
            .into_iter()
            .map(|row| Self::from_1d(element_type, row).map(Cdt::Array))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(element_type, 2, rows)
    }

    pub fn from_3d<T, R, P>(
        element_type: CdtType,
        planes: impl IntoIterator<Item = P>,
    ) -> Result<Self, XllrError>
    where
        T: Into<Cdt>,
        R: IntoIterator<Item = T>,
        P: IntoIterator<Item = R>,
    {
        let planes = planes
            .into_iter()
            .map(|plane| Self::from_2d(element_type, plane).map(Cdt::Array))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(element_type, 3, planes)
    }

    pub fn element_type(&self) -> CdtType {
        self.element_type
    }

    pub fn dimensions(&self) -> u32 {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[Cdt] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Cdt> {
        self.items
    }

    pub fn get(&self, index: usize) -> Option<&Cdt> {
        self.items.get(index)
    }

    /// Lengths of the sub-arrays of a rank >= 2 array. Empty for rank 1.
    pub fn row_lengths(&self) -> Vec<usize> {
        if self.dimensions < 2 {
            return Vec::new();
        }
        self.items
            .iter()
            .map(|item| item.as_array().map_or(0, CdtArray::len))
            .collect()
    }

    /// Leaf elements in row-major order, regardless of raggedness.
    pub fn leaves(&self) -> Vec<&Cdt> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Cdt>) {
        for item in &self.items {
            match item {
                Cdt::Array(inner) if self.dimensions > 1 => inner.collect_leaves(out),
                leaf => out.push(leaf),
            }
        }
    }

    pub fn validate(&self) -> Result<(), XllrError> {
        if self.dimensions == 0 {
            return Err(XllrError::InvalidValue(
                "array must have at least one dimension".into(),
            ));
        }
        if !self.element_type.is_element() {
            return Err(XllrError::InvalidValue(format!(
                "{} is not a valid array element type",
                self.element_type
            )));
        }
        for (index, item) in self.items.iter().enumerate() {
            if self.dimensions > 1 {
                let Cdt::Array(inner) = item else {
                    return Err(XllrError::InvalidValue(format!(
                        "item {index} of a rank {} array is {}, expected a rank {} array",
                        self.dimensions,
                        item.cdt_type(),
                        self.dimensions - 1
                    )));
                };
                if inner.dimensions != self.dimensions - 1
                    || inner.element_type != self.element_type
                {
                    return Err(XllrError::InvalidValue(format!(
                        "item {index} is a rank {} {} array, expected rank {} {}",
                        inner.dimensions,
                        inner.element_type,
                        self.dimensions - 1,
                        self.element_type
                    )));
                }
                inner.validate()?;
            } else if self.element_type != CdtType::Any
                && item.cdt_type() != self.element_type
                // null handles and absent callables may appear in handle arrays
                && !(item.is_null()
                    && matches!(self.element_type, CdtType::Handle | CdtType::Callable))
            {
                return Err(XllrError::InvalidValue(format!(
                    "item {index} is {}, expected {}",
                    item.cdt_type(),
                    self.element_type
                )));
            }
        }
        Ok(())
    }
}

/// Primitive kinds a [`PackedArray`] can hold.
pub trait PackedElement: Copy + Sized {
    const TYPE: CdtType;

    fn pack(values: Vec<Self>) -> PackedArray;

    fn unpack(packed: &PackedArray) -> Option<&[Self]>;
}

macro_rules! packed_arrays {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        /// A rank-1 array of one primitive kind under a single cell. The
        /// elements cross the native boundary as one contiguous block
        /// instead of one cell each.
        #[derive(Debug, Clone, PartialEq)]
        pub enum PackedArray {
            $($variant(Vec<$ty>),)*
        }

        impl PackedArray {
            pub fn element_type(&self) -> CdtType {
                match self {
                    $(Self::$variant(_) => CdtType::$variant,)*
                }
            }

            pub fn len(&self) -> usize {
                match self {
                    $(Self::$variant(values) => values.len(),)*
                }
            }

            /// One cell per element.
            pub fn to_cdts(&self) -> Vec<Cdt> {
                match self {
                    $(Self::$variant(values) => {
                        values.iter().map(|&value| Cdt::$variant(value)).collect()
                    })*
                }
            }

            pub const fn is_packable(ty: CdtType) -> bool {
                matches!(ty, $(CdtType::$variant)|*)
            }

            pub(crate) fn raw_parts(&self) -> (*const std::ffi::c_void, usize) {
                match self {
                    $(Self::$variant(values) => (values.as_ptr().cast(), values.len()),)*
                }
            }
        }

        $(
            impl PackedElement for $ty {
                const TYPE: CdtType = CdtType::$variant;

                fn pack(values: Vec<Self>) -> PackedArray {
                    PackedArray::$variant(values)
                }

                fn unpack(packed: &PackedArray) -> Option<&[Self]> {
                    match packed {
                        PackedArray::$variant(values) => Some(values),
                        _ => None,
                    }
                }
            }

            impl From<Vec<$ty>> for PackedArray {
                fn from(values: Vec<$ty>) -> Self {
                    Self::$variant(values)
                }
            }
        )*
    };
}

packed_arrays! {
    bool => Bool,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
}

impl PackedArray {
    pub fn new<T: PackedElement>(values: Vec<T>) -> Self {
        T::pack(values)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice<T: PackedElement>(&self) -> Option<&[T]> {
        T::unpack(self)
    }

    /// The same elements as an ordinary rank-1 array.
    pub fn to_array(&self) -> CdtArray {
        CdtArray {
            element_type: self.element_type(),
            dimensions: 1,
            items: self.to_cdts(),
        }
    }
}

/// Typed extraction out of a [`Cdt`].
pub trait FromCdt: Sized {
    fn from_cdt(cdt: &Cdt) -> Result<Self, XllrError>;
}

fn mismatch(expected: CdtType, cdt: &Cdt) -> XllrError {
    XllrError::InvalidValue(format!("expected {expected}, found {}", cdt.cdt_type()))
}

macro_rules! scalar_conversions {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Cdt {
                fn from(value: $ty) -> Self {
                    Cdt::$variant(value)
                }
            }

            impl FromCdt for $ty {
                fn from_cdt(cdt: &Cdt) -> Result<Self, XllrError> {
                    match cdt {
                        Cdt::$variant(value) => Ok(*value),
                        other => Err(mismatch(CdtType::$variant, other)),
                    }
                }
            }
        )*
    };
}

scalar_conversions! {
    bool => Bool,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
    char => Char32,
    Handle => Handle,
}

impl From<()> for Cdt {
    fn from(_: ()) -> Self {
        Cdt::Null
    }
}

impl From<String> for Cdt {
    fn from(value: String) -> Self {
        Cdt::String8(value)
    }
}

impl From<&str> for Cdt {
    fn from(value: &str) -> Self {
        Cdt::String8(value.to_string())
    }
}

impl From<Callable> for Cdt {
    fn from(value: Callable) -> Self {
        Cdt::Callable(value)
    }
}

impl From<CdtArray> for Cdt {
    fn from(value: CdtArray) -> Self {
        Cdt::Array(value)
    }
}

impl From<PackedArray> for Cdt {
    fn from(value: PackedArray) -> Self {
        Cdt::Packed(value)
    }
}

impl<T: Into<Cdt>> From<Option<T>> for Cdt {
    fn from(value: Option<T>) -> Self {
        value.map_or(Cdt::Null, Into::into)
    }
}

impl FromCdt for String {
    fn from_cdt(cdt: &Cdt) -> Result<Self, XllrError> {
        match cdt {
            Cdt::String8(s) => Ok(s.clone()),
            Cdt::String16(units) => String::from_utf16(units)
                .map_err(|err| XllrError::InvalidValue(err.to_string())),
            Cdt::String32(units) => units
                .iter()
                .map(|&unit| {
                    char::from_u32(unit).ok_or_else(|| {
                        XllrError::InvalidValue(format!(
                            "invalid UTF-32 code unit {unit:#x}"
                        ))
                    })
                })
                .collect(),
            other => Err(mismatch(CdtType::String8, other)),
        }
    }
}

impl FromCdt for Callable {
    fn from_cdt(cdt: &Cdt) -> Result<Self, XllrError> {
        match cdt {
            Cdt::Callable(callable) => Ok(callable.clone()),
            other => Err(mismatch(CdtType::Callable, other)),
        }
    }
}

impl FromCdt for CdtArray {
    fn from_cdt(cdt: &Cdt) -> Result<Self, XllrError> {
        match cdt {
            Cdt::Array(array) => Ok(array.clone()),
            other => Err(mismatch(CdtType::Array, other)),
        }
    }
}

impl FromCdt for PackedArray {
    fn from_cdt(cdt: &Cdt) -> Result<Self, XllrError> {
        match cdt {
            Cdt::Packed(packed) => Ok(packed.clone()),
            other => Err(mismatch(CdtType::Packed, other)),
        }
    }
}

impl<T: FromCdt> FromCdt for Option<T> {
    fn from_cdt(cdt: &Cdt) -> Result<Self, XllrError> {
        match cdt {
            Cdt::Null => Ok(None),
            other => T::from_cdt(other).map(Some),
        }
    }
}

impl<T: FromCdt> FromCdt for Vec<T> {
    fn from_cdt(cdt: &Cdt) -> Result<Self, XllrError> {
        match cdt {
            Cdt::Array(array) => array.items().iter().map(T::from_cdt).collect(),
            Cdt::Packed(packed) => packed.to_cdts().iter().map(T::from_cdt).collect(),
            other => Err(mismatch(CdtType::Array, other)),
        }
    }
}
