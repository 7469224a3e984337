//! Type descriptors and entity signatures.
//!
//! Descriptors are consulted when an entity is resolved, so the plugin can
//! bind the right overload. Slots the guest cannot type statically are
//! declared `any`; for those the resolver records a per-call check instead of
//! failing or guessing.

use std::fmt;
use std::str::FromStr;

use crate::{Cdt, CdtType, Cdts, PackedArray, XllrError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeDescriptor {
    pub base: CdtType,
    /// `0` for scalars; otherwise the rank of an array of `base`.
    pub dimensions: u32,
    /// Guest class or interface a handle/callable must bind to.
    pub alias: Option<String>,
    /// A rank-1 array of `base` stored as one contiguous block.
    pub packed: bool,
}

macro_rules! descriptor_consts {
    ($($name:ident => $ty:ident),* $(,)?) => {
        $(pub const $name: Self = Self::new(CdtType::$ty);)*
    };
}

impl TypeDescriptor {
    descriptor_consts! {
        NULL => Null,
        BOOL => Bool,
        INT8 => Int8,
        INT16 => Int16,
        INT32 => Int32,
        INT64 => Int64,
        UINT8 => UInt8,
        UINT16 => UInt16,
        UINT32 => UInt32,
        UINT64 => UInt64,
        FLOAT32 => Float32,
        FLOAT64 => Float64,
        CHAR8 => Char8,
        CHAR16 => Char16,
        CHAR32 => Char32,
        STRING8 => String8,
        STRING16 => String16,
        STRING32 => String32,
        HANDLE => Handle,
        CALLABLE => Callable,
        ANY => Any,
    }

    /// Variadic positional arguments, see [`PositionalArgs`](crate::PositionalArgs).
    pub const POSITIONAL_ARGS: Self = Self::array(CdtType::Any, 1);
    /// Keyword arguments, see [`KeywordArgs`](crate::KeywordArgs).
    pub const KEYWORD_ARGS: Self = Self::array(CdtType::Any, 2);

    pub const fn new(base: CdtType) -> Self {
        Self {
            base,
            dimensions: 0,
            alias: None,
            packed: false,
        }
    }

    pub const fn array(base: CdtType, dimensions: u32) -> Self {
        Self {
            base,
            dimensions,
            alias: None,
            packed: false,
        }
    }

    /// A packed rank-1 array of `base`, e.g. `uint8[packed]`.
    pub const fn packed(base: CdtType) -> Self {
        Self {
            base,
            dimensions: 1,
            alias: None,
            packed: true,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn is_array(&self) -> bool {
        self.dimensions > 0
    }

    /// True when the slot's kind is only known once a value arrives.
    pub fn is_dynamic(&self) -> bool {
        self.base == CdtType::Any
    }

    pub fn validate(&self) -> Result<(), XllrError> {
        if self.base == CdtType::Array {
            return Err(XllrError::TypeResolutionFailed(
                "`array` is not a descriptor base; use an element type with dimensions"
                    .into(),
            ));
        }
        if self.base == CdtType::Packed {
            return Err(XllrError::TypeResolutionFailed(
                "`packed` is not a descriptor base; use an element type, e.g. int32[packed]"
                    .into(),
            ));
        }
        if self.packed && (self.dimensions != 1 || !PackedArray::is_packable(self.base)) {
            return Err(XllrError::TypeResolutionFailed(format!(
                "{} cannot be packed; packed arrays are rank 1 of a numeric or bool kind",
                Self::array(self.base, self.dimensions)
            )));
        }
        if self.dimensions > 0 && !self.base.is_element() {
            return Err(XllrError::TypeResolutionFailed(format!(
                "{} cannot be an array element type",
                self.base
            )));
        }
        if let Some(alias) = &self.alias {
            if !matches!(self.base, CdtType::Handle | CdtType::Callable) {
                return Err(XllrError::TypeResolutionFailed(format!(
                    "alias `{alias}` given for non-handle type {}",
                    self.base
                )));
            }
            if alias.trim().is_empty() {
                return Err(XllrError::TypeResolutionFailed(
                    "empty type alias".into(),
                ));
            }
        }
        Ok(())
    }

    /// Whether `cdt` is a value of this type. `any` accepts every value of
    /// matching rank.
    pub fn accepts(&self, cdt: &Cdt) -> bool {
        if self.packed {
            return cdt
                .as_packed()
                .is_some_and(|packed| packed.element_type() == self.base);
        }
        if self.dimensions == 0 {
            return match self.base {
                CdtType::Any => true,
                base => cdt.cdt_type() == base,
            };
        }
        let Cdt::Array(array) = cdt else {
            return false;
        };
        array.dimensions() == self.dimensions
            && (self.base == CdtType::Any
                || array.element_type() == self.base
                || array.element_type() == CdtType::Any && array.is_empty())
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base)?;
        if let Some(alias) = &self.alias {
            write!(f, "<{alias}>")?;
        }
        if self.packed {
            return f.write_str("[packed]");
        }
        for _ in 0..self.dimensions {
            f.write_str("[]")?;
        }
        Ok(())
    }
}

/// Parses the [`Display`](fmt::Display) form, e.g. `int64`, `string8[][]`,
/// `handle<java.util.List>`, `uint8[packed]`.
impl FromStr for TypeDescriptor {
    type Err = XllrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut dimensions = 0;
        let mut rest = s;
        let packed = match rest.strip_suffix("[packed]") {
            Some(stripped) => {
                dimensions = 1;
                rest = stripped;
                true
            }
            None => false,
        };
        while let Some(stripped) = rest.strip_suffix("[]").filter(|_| !packed) {
            dimensions += 1;
            rest = stripped;
        }
        let (base, alias) = match rest.split_once('<') {
            Some((base, alias)) => {
                let alias = alias.strip_suffix('>').ok_or_else(|| {
                    XllrError::TypeResolutionFailed(format!("unterminated alias in `{s}`"))
                })?;
                (base, Some(alias.to_string()))
            }
            None => (rest, None),
        };
        let base = CdtType::from_name(base).ok_or_else(|| {
            XllrError::TypeResolutionFailed(format!("unknown type `{base}`"))
        })?;
        let descriptor = Self {
            base,
            dimensions,
            alias,
            packed,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Signature {
    pub params: Vec<TypeDescriptor>,
    pub retvals: Vec<TypeDescriptor>,
}

impl Signature {
    pub fn new(
        params: impl IntoIterator<Item = TypeDescriptor>,
        retvals: impl IntoIterator<Item = TypeDescriptor>,
    ) -> Self {
        Self {
            params: params.into_iter().collect(),
            retvals: retvals.into_iter().collect(),
        }
    }

    pub fn validate(&self) -> Result<(), XllrError> {
        for descriptor in self.params.iter().chain(&self.retvals) {
            descriptor.validate()?;
        }
        Ok(())
    }

    pub fn check_params(&self, params: &Cdts) -> Result<(), XllrError> {
        check_slots("parameter", &self.params, params)
    }

    pub fn check_retvals(&self, retvals: &Cdts) -> Result<(), XllrError> {
        check_slots("return value", &self.retvals, retvals)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{p}")?;
        }
        f.write_str(") -> (")?;
        for (i, r) in self.retvals.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{r}")?;
        }
        f.write_str(")")
    }
}

fn check_slots(
    what: &str,
    expected: &[TypeDescriptor],
    actual: &Cdts,
) -> Result<(), XllrError> {
    if expected.len() != actual.len() {
        return Err(XllrError::invocation(format!(
            "expected {} {what}s, found {}",
            expected.len(),
            actual.len()
        )));
    }
    for (index, (descriptor, cdt)) in expected.iter().zip(actual).enumerate() {
        if !descriptor.accepts(cdt) {
            return Err(XllrError::invocation(format!(
                "{what} {index}: expected {descriptor}, found {}",
                describe(cdt)
            )));
        }
    }
    Ok(())
}

fn describe(cdt: &Cdt) -> String {
    match cdt {
        Cdt::Array(array) => {
            format!("{}{}", array.element_type(), "[]".repeat(array.dimensions() as usize))
        }
        Cdt::Packed(packed) => format!("{}[packed]", packed.element_type()),
        other => other.cdt_type().to_string(),
    }
}

/// What has to happen for one slot when the call is made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotCheck {
    /// Fully checked at resolution.
    Static,
    /// The value must satisfy this descriptor; checked per call.
    Dynamic(TypeDescriptor),
}

/// Result of matching the caller's requested signature against the one the
/// guest declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Static,
    Dynamic {
        params: Vec<SlotCheck>,
        retvals: Vec<SlotCheck>,
    },
}

impl Binding {
    /// First phase: bind statically where both sides are concrete, otherwise
    /// tag the slot for a runtime check. Concrete disagreements fail here.
    pub fn bind(declared: &Signature, requested: &Signature) -> Result<Self, XllrError> {
        declared.validate()?;
        requested.validate()?;
        if declared.params.len() != requested.params.len() {
            return Err(XllrError::SignatureMismatch(format!(
                "entity takes {} parameters, caller declared {}",
                declared.params.len(),
                requested.params.len()
            )));
        }
        if declared.retvals.len() != requested.retvals.len() {
            return Err(XllrError::SignatureMismatch(format!(
                "entity returns {} values, caller declared {}",
                declared.retvals.len(),
                requested.retvals.len()
            )));
        }
        let params = bind_slots("parameter", &declared.params, &requested.params)?;
        let retvals = bind_slots("return value", &declared.retvals, &requested.retvals)?;

        let all_static = params
            .iter()
            .chain(&retvals)
            .all(|check| *check == SlotCheck::Static);
        if all_static {
            return Ok(Self::Static);
        }
        Ok(Self::Dynamic { params, retvals })
    }

    pub fn is_static(&self) -> bool {
        matches!(self, Self::Static)
    }

    /// Second phase, run by the plugin before it enters guest code.
    pub fn check_params(&self, params: &Cdts) -> Result<(), XllrError> {
        match self {
            Self::Static => Ok(()),
            Self::Dynamic { params: checks, .. } => run_checks("parameter", checks, params),
        }
    }

    /// Run by the plugin on what the guest produced.
    pub fn check_retvals(&self, retvals: &Cdts) -> Result<(), XllrError> {
        match self {
            Self::Static => Ok(()),
            Self::Dynamic { retvals: checks, .. } => {
                run_checks("return value", checks, retvals)
            }
        }
    }
}

fn bind_slots(
    what: &str,
    declared: &[TypeDescriptor],
    requested: &[TypeDescriptor],
) -> Result<Vec<SlotCheck>, XllrError> {
    declared
        .iter()
        .zip(requested)
        .enumerate()
        .map(|(index, (d, r))| bind_slot(d, r).map_err(|reason| {
            XllrError::SignatureMismatch(format!("{what} {index}: {reason}"))
        }))
        .collect()
}

fn bind_slot(declared: &TypeDescriptor, requested: &TypeDescriptor) -> Result<SlotCheck, String> {
    let rank_free = |d: &TypeDescriptor| d.is_dynamic() && d.dimensions == 0;

    match (declared.is_dynamic(), requested.is_dynamic()) {
        (false, false) => {
            if declared.base != requested.base
                || declared.dimensions != requested.dimensions
                || declared.packed != requested.packed
            {
                return Err(format!("entity declares {declared}, caller requested {requested}"));
            }
            if let (Some(a), Some(b)) = (&declared.alias, &requested.alias) {
                if a != b {
                    return Err(format!("entity binds to `{a}`, caller requested `{b}`"));
                }
            }
            Ok(SlotCheck::Static)
        }
        // the guest takes anything of this rank; the caller's concrete type
        // is enforced when the buffer is checked against the request
        (true, false) => {
            if rank_free(declared) || declared.dimensions == requested.dimensions {
                Ok(SlotCheck::Static)
            } else {
                Err(format!("entity declares {declared}, caller requested {requested}"))
            }
        }
        (false, true) => {
            if !rank_free(requested) && declared.dimensions != requested.dimensions {
                return Err(format!("entity declares {declared}, caller requested {requested}"));
            }
            Ok(SlotCheck::Dynamic(declared.clone()))
        }
        (true, true) => {
            if rank_free(declared) {
                return Ok(SlotCheck::Static);
            }
            if !rank_free(requested) && declared.dimensions != requested.dimensions {
                return Err(format!("entity declares {declared}, caller requested {requested}"));
            }
            Ok(SlotCheck::Dynamic(declared.clone()))
        }
    }
}

fn run_checks(what: &str, checks: &[SlotCheck], values: &Cdts) -> Result<(), XllrError> {
    for (index, (check, cdt)) in checks.iter().zip(values).enumerate() {
        if let SlotCheck::Dynamic(descriptor) = check {
            if !descriptor.accepts(cdt) {
                return Err(XllrError::invocation(format!(
                    "{what} {index}: expected {descriptor}, found {}",
                    describe(cdt)
                )));
            }
        }
    }
    Ok(())
}
