use std::ops::Index;

use crate::{Cdt, XllrError};

/// A fixed-capacity list of [`Cdt`] used as one call's parameters or return
/// values. Writes past the capacity fail instead of truncating.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Cdts {
    items: Vec<Cdt>,
    capacity: usize,
}

impl Cdts {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// A full buffer whose capacity is exactly its length.
    pub fn from_vec(items: Vec<Cdt>) -> Self {
        let capacity = items.len();
        Self { items, capacity }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    pub fn push(&mut self, cdt: impl Into<Cdt>) -> Result<(), XllrError> {
        if self.items.len() >= self.capacity {
            return Err(XllrError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        self.items.push(cdt.into());
        Ok(())
    }

    /// Overwrites slot `index`, or appends when `index` is the next free slot.
    pub fn set(&mut self, index: usize, cdt: impl Into<Cdt>) -> Result<(), XllrError> {
        if index >= self.capacity {
            return Err(XllrError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        if index < self.items.len() {
            self.items[index] = cdt.into();
            return Ok(());
        }
        if index == self.items.len() {
            self.items.push(cdt.into());
            return Ok(());
        }
        Err(XllrError::InvalidValue(format!(
            "slot {index} written before slot {}",
            self.items.len()
        )))
    }

    pub fn get(&self, index: usize) -> Option<&Cdt> {
        self.items.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Cdt> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[Cdt] {
        &self.items
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Empties the buffer and sets a new capacity.
    pub fn reset(&mut self, capacity: usize) {
        self.items.clear();
        self.capacity = capacity;
        self.items.reserve(capacity);
    }

    pub fn into_vec(self) -> Vec<Cdt> {
        self.items
    }
}

impl Index<usize> for Cdts {
    type Output = Cdt;

    fn index(&self, index: usize) -> &Self::Output {
        &self.items[index]
    }
}

impl<'a> IntoIterator for &'a Cdts {
    type Item = &'a Cdt;
    type IntoIter = std::slice::Iter<'a, Cdt>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl FromIterator<Cdt> for Cdts {
    fn from_iter<T: IntoIterator<Item = Cdt>>(iter: T) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}

impl From<Vec<Cdt>> for Cdts {
    fn from(items: Vec<Cdt>) -> Self {
        Self::from_vec(items)
    }
}

/// The two independent buffers of one call.
#[derive(Debug, Clone, Default)]
pub struct CdtsPair {
    pub params: Cdts,
    pub retvals: Cdts,
}

impl CdtsPair {
    pub fn new(params: usize, retvals: usize) -> Self {
        Self {
            params: Cdts::with_capacity(params),
            retvals: Cdts::with_capacity(retvals),
        }
    }
}
