//! Generation-tagged slab storage.
//!
//! Slots are recycled after removal, but every reuse bumps the slot's
//! generation, so an id captured before the removal never validates again.

/// Index plus generation. Generation `0` is never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId {
    pub index: u32,
    pub generation: u32,
}

impl SlotId {
    pub const NULL: Self = Self {
        index: 0,
        generation: 0,
    };

    pub const fn is_null(self) -> bool {
        self.generation == 0
    }

    /// Packs the id into one word, generation in the high half.
    pub const fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

#[derive(Debug)]
enum Entry<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32, next_free: Option<u32> },
}

#[derive(Debug)]
pub struct Slab<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Slab<T> {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, value: T) -> SlotId {
        self.len += 1;
        if let Some(index) = self.free_head {
            let entry = &mut self.entries[index as usize];
            let Entry::Vacant {
                generation,
                next_free,
            } = *entry
            else {
                unreachable!("free list points at an occupied slot");
            };
            // generation 0 is reserved for null ids
            let generation = generation.wrapping_add(1).max(1);
            self.free_head = next_free;
            *entry = Entry::Occupied { generation, value };
            return SlotId { index, generation };
        }

        assert!(
            self.entries.len() < u32::MAX as usize,
            "slab index space exhausted"
        );
        let index = self.entries.len() as u32;
        self.entries.push(Entry::Occupied {
            generation: 1,
            value,
        });
        SlotId {
            index,
            generation: 1,
        }
    }

    pub fn get(&self, id: SlotId) -> Option<&T> {
        match self.entries.get(id.index as usize)? {
            Entry::Occupied { generation, value } if *generation == id.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        match self.entries.get_mut(id.index as usize)? {
            Entry::Occupied { generation, value } if *generation == id.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn contains(&self, id: SlotId) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        let entry = self.entries.get_mut(id.index as usize)?;
        match entry {
            Entry::Occupied { generation, .. } if *generation == id.generation => {}
            _ => return None,
        }
        let vacant = Entry::Vacant {
            generation: id.generation,
            next_free: self.free_head,
        };
        let Entry::Occupied { value, .. } = std::mem::replace(entry, vacant) else {
            unreachable!("checked above");
        };
        self.free_head = Some(id.index);
        self.len -= 1;
        Some(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                Entry::Occupied { generation, value } => Some((
                    SlotId {
                        index: index as u32,
                        generation: *generation,
                    },
                    value,
                )),
                Entry::Vacant { .. } => None,
            })
    }

    /// Removes every value, keeping generations so old ids stay invalid.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        for index in 0..self.entries.len() {
            if let Entry::Occupied { generation, .. } = self.entries[index] {
                let id = SlotId {
                    index: index as u32,
                    generation,
                };
                if let Some(value) = self.remove(id) {
                    out.push(value);
                }
            }
        }
        out
    }
}
