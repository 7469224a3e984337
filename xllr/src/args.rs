//! Argument packs for guests with variadic and keyword parameters.
//!
//! A duck-typed guest may take `*args` or `**kwargs` style parameters that no
//! fixed signature can spell out. They cross as plain values: positional
//! extras as an `any[]`, keyword arguments as an `any[][]` of
//! `[string8 name, value]` rows. Both are ordinary arrays, so handles and
//! callables inside them are checked and counted like any others.

use crate::{Cdt, CdtArray, CdtType, FromCdt, XllrError};

/// Extra positional arguments, in order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PositionalArgs(Vec<Cdt>);

impl PositionalArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, value: impl Into<Cdt>) -> Self {
        self.push(value);
        self
    }

    pub fn push(&mut self, value: impl Into<Cdt>) {
        self.0.push(value.into());
    }

    pub fn get(&self, index: usize) -> Option<&Cdt> {
        self.0.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cdt> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<Cdt> {
        self.0
    }
}

impl From<PositionalArgs> for Cdt {
    fn from(args: PositionalArgs) -> Self {
        Cdt::Array(CdtArray::any(args.0))
    }
}

/// `null` stands for no extra arguments.
impl FromCdt for PositionalArgs {
    fn from_cdt(cdt: &Cdt) -> Result<Self, XllrError> {
        match cdt {
            Cdt::Null => Ok(Self::default()),
            Cdt::Array(array) if array.dimensions() == 1 => Ok(Self(array.items().to_vec())),
            other => Err(XllrError::InvalidValue(format!(
                "positional arguments must be an any[], found {}",
                other.cdt_type()
            ))),
        }
    }
}

/// Named arguments. Names are unique; setting one again replaces its value
/// and keeps its position.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeywordArgs(Vec<(String, Cdt)>);

impl KeywordArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Cdt>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Cdt>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Cdt> {
        self.0
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Cdt)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<KeywordArgs> for Cdt {
    fn from(args: KeywordArgs) -> Self {
        let rows = args
            .0
            .into_iter()
            .map(|(name, value)| vec![Cdt::String8(name), value]);
        Cdt::Array(CdtArray::any_rows(rows))
    }
}

/// `null` stands for no keyword arguments.
impl FromCdt for KeywordArgs {
    fn from_cdt(cdt: &Cdt) -> Result<Self, XllrError> {
        let array = match cdt {
            Cdt::Null => return Ok(Self::default()),
            Cdt::Array(array) if array.dimensions() == 2 => array,
            other => {
                return Err(XllrError::InvalidValue(format!(
                    "keyword arguments must be an any[][], found {}",
                    other.cdt_type()
                )));
            }
        };
        let mut args = Self::default();
        for (index, row) in array.items().iter().enumerate() {
            let entry = row.as_array().map(CdtArray::items).unwrap_or_default();
            let [name, value] = entry else {
                return Err(XllrError::InvalidValue(format!(
                    "keyword argument {index}: expected a [name, value] row"
                )));
            };
            let name = name.as_str().ok_or_else(|| {
                XllrError::InvalidValue(format!(
                    "keyword argument {index}: name is {}, expected {}",
                    name.cdt_type(),
                    CdtType::String8
                ))
            })?;
            args.set(name, value.clone());
        }
        Ok(args)
    }
}
