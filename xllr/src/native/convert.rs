//! Moving values between [`Cdt`] and the C layouts.

use std::ffi::{CStr, CString, c_char, c_void};
use std::ptr;

use super::abi::{PACKED_FLAG, RawCdt, RawCdts, RawSignature, RawTypeInfo};
use crate::handle::RuntimeId;
use crate::{
    Callable, Cdt, CdtArray, CdtType, Cdts, Handle, PackedArray, Signature, TypeDescriptor, Xllr,
    XllrError,
};

/// Raw views of host-owned values. The views borrow the values' heap
/// buffers, so the values must outlive this.
pub(crate) struct Lowered {
    items: Vec<RawCdt>,
    _nested: Vec<Vec<RawCdt>>,
}

impl Lowered {
    pub(crate) fn new(values: &[Cdt]) -> Self {
        let mut nested = Vec::new();
        let items = values.iter().map(|value| lower(value, &mut nested)).collect();
        Self {
            items,
            _nested: nested,
        }
    }

    pub(crate) fn as_raw(&self) -> RawCdts {
        RawCdts {
            items: self.items.as_ptr(),
            len: self.items.len(),
            owner: ptr::null_mut(),
        }
    }
}

fn lower(value: &Cdt, nested: &mut Vec<Vec<RawCdt>>) -> RawCdt {
    let kind = value.cdt_type().code();
    let view = |ptr: *const c_void, len: usize| RawCdt {
        ptr,
        len,
        ..RawCdt::scalar(kind, 0)
    };
    match value {
        Cdt::Null => RawCdt::scalar(kind, 0),
        Cdt::Bool(v) => RawCdt::scalar(kind, u64::from(*v)),
        Cdt::Int8(v) => RawCdt::scalar(kind, i64::from(*v) as u64),
        Cdt::Int16(v) => RawCdt::scalar(kind, i64::from(*v) as u64),
        Cdt::Int32(v) => RawCdt::scalar(kind, i64::from(*v) as u64),
        Cdt::Int64(v) => RawCdt::scalar(kind, *v as u64),
        Cdt::UInt8(v) => RawCdt::scalar(kind, u64::from(*v)),
        Cdt::UInt16(v) => RawCdt::scalar(kind, u64::from(*v)),
        Cdt::UInt32(v) => RawCdt::scalar(kind, u64::from(*v)),
        Cdt::UInt64(v) => RawCdt::scalar(kind, *v),
        Cdt::Float32(v) => RawCdt::scalar(kind, u64::from(v.to_bits())),
        Cdt::Float64(v) => RawCdt::scalar(kind, v.to_bits()),
        Cdt::Char8(v) => RawCdt::scalar(kind, u64::from(*v)),
        Cdt::Char16(v) => RawCdt::scalar(kind, u64::from(*v)),
        Cdt::Char32(v) => RawCdt::scalar(kind, u64::from(u32::from(*v))),
        Cdt::String8(s) => view(s.as_ptr().cast(), s.len()),
        Cdt::String16(units) => view(units.as_ptr().cast(), units.len()),
        Cdt::String32(units) => view(units.as_ptr().cast(), units.len()),
        Cdt::Handle(handle) => RawCdt::scalar(kind, handle.to_bits()),
        Cdt::Callable(callable) => RawCdt::scalar(kind, callable.to_bits()),
        Cdt::Array(array) => {
            let items: Vec<RawCdt> = array.items().iter().map(|item| lower(item, nested)).collect();
            let raw = RawCdt {
                element: array.element_type().code(),
                dimensions: array.dimensions(),
                ..view(items.as_ptr().cast(), items.len())
            };
            nested.push(items);
            raw
        }
        Cdt::Packed(packed) => {
            let (ptr, len) = packed.raw_parts();
            RawCdt {
                element: packed.element_type().code(),
                dimensions: 1,
                ..view(ptr, len)
            }
        }
    }
}

/// A buffer the host fills for a plugin (results of a callback). Freed with
/// [`HostCdts::free`] through the host's `free_cdts`.
pub(crate) struct HostCdts {
    _values: Cdts,
    lowered: Lowered,
}

impl HostCdts {
    pub(crate) fn into_raw(values: Cdts) -> RawCdts {
        let lowered = Lowered::new(values.as_slice());
        let owned = Box::new(Self {
            _values: values,
            lowered,
        });
        let mut raw = owned.lowered.as_raw();
        raw.owner = Box::into_raw(owned).cast();
        raw
    }

    /// # Safety
    /// `raw` must have been produced by [`HostCdts::into_raw`] and not freed.
    pub(crate) unsafe fn free(raw: &mut RawCdts) {
        if !raw.owner.is_null() {
            drop(unsafe { Box::from_raw(raw.owner.cast::<Self>()) });
        }
        *raw = RawCdts::empty();
    }
}

/// Turns plugin-produced views into owned values.
pub(crate) struct Lift<'a> {
    xllr: &'a Xllr,
    runtime: RuntimeId,
}

impl<'a> Lift<'a> {
    pub(crate) fn new(xllr: &'a Xllr, runtime: RuntimeId) -> Self {
        Self { xllr, runtime }
    }

    pub(crate) fn handle(&self, bits: u64) -> Handle {
        Handle::from_bits(self.runtime, bits)
    }

    pub(crate) fn callable(&self, bits: u64) -> Result<Callable, XllrError> {
        self.xllr
            .inner
            .callbacks
            .lookup(bits)
            .ok_or_else(|| XllrError::UnknownFunction(format!("callable {bits:#x}")))
    }

    /// # Safety
    /// `raw` must describe `len` valid values, each valid per its `kind`.
    pub(crate) unsafe fn values(&self, raw: *const RawCdts) -> Result<Vec<Cdt>, XllrError> {
        if raw.is_null() {
            return Ok(Vec::new());
        }
        let items = unsafe { (*raw).as_slice() };
        items.iter().map(|item| unsafe { self.value(item) }).collect()
    }

    /// # Safety
    /// See [`Lift::values`].
    pub(crate) unsafe fn value(&self, raw: &RawCdt) -> Result<Cdt, XllrError> {
        let kind = CdtType::from_code(raw.kind)
            .ok_or_else(|| XllrError::InvalidValue(format!("unknown type code {}", raw.kind)))?;
        let bits = raw.bits;
        let value = match kind {
            CdtType::Null => Cdt::Null,
            CdtType::Bool => Cdt::Bool(bits != 0),
            CdtType::Int8 => Cdt::Int8(bits as i8),
            CdtType::Int16 => Cdt::Int16(bits as i16),
            CdtType::Int32 => Cdt::Int32(bits as i32),
            CdtType::Int64 => Cdt::Int64(bits as i64),
            CdtType::UInt8 => Cdt::UInt8(bits as u8),
            CdtType::UInt16 => Cdt::UInt16(bits as u16),
            CdtType::UInt32 => Cdt::UInt32(bits as u32),
            CdtType::UInt64 => Cdt::UInt64(bits),
            CdtType::Float32 => Cdt::Float32(f32::from_bits(bits as u32)),
            CdtType::Float64 => Cdt::Float64(f64::from_bits(bits)),
            CdtType::Char8 => Cdt::Char8(bits as u8),
            CdtType::Char16 => Cdt::Char16(bits as u16),
            CdtType::Char32 => Cdt::Char32(
                char::from_u32(bits as u32)
                    .ok_or_else(|| XllrError::InvalidValue(format!("{bits:#x} is not a char")))?,
            ),
            CdtType::String8 => {
                let bytes = unsafe { units::<u8>(raw) };
                let s = std::str::from_utf8(bytes)
                    .map_err(|err| XllrError::InvalidValue(format!("string8: {err}")))?;
                Cdt::String8(s.to_string())
            }
            CdtType::String16 => Cdt::String16(unsafe { units::<u16>(raw) }.to_vec()),
            CdtType::String32 => Cdt::String32(unsafe { units::<u32>(raw) }.to_vec()),
            CdtType::Handle => Cdt::Handle(self.handle(bits)),
            CdtType::Callable => Cdt::Callable(self.callable(bits)?),
            CdtType::Array => {
                let element = element_type(raw)?;
                let items = unsafe { units::<RawCdt>(raw) }
                    .iter()
                    .map(|item| unsafe { self.value(item) })
                    .collect::<Result<Vec<_>, _>>()?;
                Cdt::Array(CdtArray::new(element, raw.dimensions, items)?)
            }
            CdtType::Packed => Cdt::Packed(unsafe { lift_packed(raw) }?),
            CdtType::Any => {
                return Err(XllrError::InvalidValue("`any` is not a value kind".into()));
            }
        };
        Ok(value)
    }
}

fn element_type(raw: &RawCdt) -> Result<CdtType, XllrError> {
    CdtType::from_code(raw.element).ok_or_else(|| {
        XllrError::InvalidValue(format!("unknown element type code {}", raw.element))
    })
}

/// # Safety
/// `raw.ptr` must point to `raw.len` elements of the element kind.
unsafe fn lift_packed(raw: &RawCdt) -> Result<PackedArray, XllrError> {
    let packed = match element_type(raw)? {
        // bytes, never `bool`: the plugin may hand over any value
        CdtType::Bool => {
            let bytes = unsafe { units::<u8>(raw) };
            PackedArray::Bool(bytes.iter().map(|&byte| byte != 0).collect())
        }
        CdtType::Int8 => PackedArray::Int8(unsafe { units(raw) }.to_vec()),
        CdtType::Int16 => PackedArray::Int16(unsafe { units(raw) }.to_vec()),
        CdtType::Int32 => PackedArray::Int32(unsafe { units(raw) }.to_vec()),
        CdtType::Int64 => PackedArray::Int64(unsafe { units(raw) }.to_vec()),
        CdtType::UInt8 => PackedArray::UInt8(unsafe { units(raw) }.to_vec()),
        CdtType::UInt16 => PackedArray::UInt16(unsafe { units(raw) }.to_vec()),
        CdtType::UInt32 => PackedArray::UInt32(unsafe { units(raw) }.to_vec()),
        CdtType::UInt64 => PackedArray::UInt64(unsafe { units(raw) }.to_vec()),
        CdtType::Float32 => PackedArray::Float32(unsafe { units(raw) }.to_vec()),
        CdtType::Float64 => PackedArray::Float64(unsafe { units(raw) }.to_vec()),
        other => {
            return Err(XllrError::InvalidValue(format!("{other} elements cannot be packed")));
        }
    };
    Ok(packed)
}

unsafe fn units<'a, T>(raw: &RawCdt) -> &'a [T] {
    if raw.ptr.is_null() || raw.len == 0 {
        return &[];
    }
    unsafe { std::slice::from_raw_parts(raw.ptr.cast::<T>(), raw.len) }
}

pub(crate) fn c_string(what: &str, value: &str) -> Result<CString, XllrError> {
    CString::new(value).map_err(|_| XllrError::InvalidValue(format!("{what} contains a nul byte")))
}

/// Type infos plus the alias strings they point into.
pub(crate) struct LoweredSignature {
    params: Vec<RawTypeInfo>,
    retvals: Vec<RawTypeInfo>,
    _aliases: Vec<CString>,
}

impl LoweredSignature {
    pub(crate) fn new(signature: &Signature) -> Result<Self, XllrError> {
        let mut aliases = Vec::new();
        let mut lower_all = |slots: &[TypeDescriptor]| {
            slots
                .iter()
                .map(|slot| -> Result<RawTypeInfo, XllrError> {
                    let alias = match &slot.alias {
                        Some(alias) => {
                            let alias = c_string("type alias", alias)?;
                            let ptr = alias.as_ptr();
                            aliases.push(alias);
                            ptr
                        }
                        None => ptr::null(),
                    };
                    let packed = if slot.packed { PACKED_FLAG } else { 0 };
                    Ok(RawTypeInfo {
                        kind: slot.base.code() | packed,
                        dimensions: slot.dimensions,
                        alias,
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        };
        let params = lower_all(&signature.params)?;
        let retvals = lower_all(&signature.retvals)?;
        Ok(Self {
            params,
            retvals,
            _aliases: aliases,
        })
    }

    pub(crate) fn as_raw(&self) -> RawSignature {
        RawSignature {
            params: self.params.as_ptr(),
            params_len: self.params.len(),
            retvals: self.retvals.as_ptr(),
            retvals_len: self.retvals.len(),
        }
    }
}

/// # Safety
/// Every pointer in `raw` must be valid for its stated length, and aliases
/// nul-terminated.
pub(crate) unsafe fn lift_signature(raw: *const RawSignature) -> Result<Signature, XllrError> {
    if raw.is_null() {
        return Ok(Signature::default());
    }
    let raw = unsafe { &*raw };
    let lift_all = |ptr: *const RawTypeInfo, len: usize| {
        let infos: &[RawTypeInfo] = if ptr.is_null() || len == 0 {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(ptr, len) }
        };
        infos
            .iter()
            .map(|info| -> Result<TypeDescriptor, XllrError> {
                let code = info.kind & !PACKED_FLAG;
                let base = CdtType::from_code(code).ok_or_else(|| {
                    XllrError::TypeResolutionFailed(format!("unknown type code {code}"))
                })?;
                let mut descriptor = if info.kind & PACKED_FLAG == 0 {
                    TypeDescriptor::array(base, info.dimensions)
                } else if info.dimensions == 1 {
                    TypeDescriptor::packed(base)
                } else {
                    return Err(XllrError::TypeResolutionFailed(format!(
                        "packed {base} slot of rank {}",
                        info.dimensions
                    )));
                };
                if !info.alias.is_null() {
                    let alias = unsafe { CStr::from_ptr(info.alias) };
                    descriptor = descriptor.with_alias(alias.to_string_lossy());
                }
                Ok(descriptor)
            })
            .collect::<Result<Vec<_>, _>>()
    };
    let signature = Signature {
        params: lift_all(raw.params, raw.params_len)?,
        retvals: lift_all(raw.retvals, raw.retvals_len)?,
    };
    signature.validate()?;
    Ok(signature)
}

/// A message the host hands to a plugin; released with `host_free_string`.
pub(crate) fn host_string(message: &str) -> *mut c_char {
    CString::new(message.replace('\0', " "))
        .map(CString::into_raw)
        .unwrap_or(ptr::null_mut())
}
