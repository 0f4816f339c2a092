//! Slot registry for host objects that are destroyed from inside a deferred callback.
//!
//! Callbacks never own the objects they act on. They hold a [`SlotKey`] and look
//! the object up when they run; removing the slot destroys it. A key whose slot
//! was removed (or reused) simply fails to resolve.

/// Index plus generation. Keys are plain data, so they can cross threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    index: u32,
    generation: u32,
}

impl SlotKey {
    /// Packs the key into one integer, for carrying it through the engine
    pub fn to_bits(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32, next_free: Option<u32> },
}

pub struct LifetimeRegistry<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> LifetimeRegistry<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> SlotKey {
        self.len += 1;

        if let Some(index) = self.free_head {
            let slot = &mut self.slots[index as usize];
            let (generation, next_free) = match slot {
                Slot::Vacant {
                    generation,
                    next_free,
                } => (generation.wrapping_add(1), *next_free),
                // The free list only ever links vacant slots
                Slot::Occupied { .. } => unreachable!("occupied slot on the free list"),
            };
            *slot = Slot::Occupied { generation, value };
            self.free_head = next_free;
            return SlotKey { index, generation };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied {
            generation: 0,
            value,
        });
        SlotKey {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, key: SlotKey) -> Option<&T> {
        match self.slots.get(key.index as usize)? {
            Slot::Occupied { generation, value } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: SlotKey) -> Option<&mut T> {
        match self.slots.get_mut(key.index as usize)? {
            Slot::Occupied { generation, value } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, key: SlotKey) -> bool {
        self.get(key).is_some()
    }

    /// Destroys the object behind `key`, returning it to the caller.
    /// Stale keys return `None` and leave the registry untouched.
    pub fn remove(&mut self, key: SlotKey) -> Option<T> {
        if !self.contains(key) {
            return None;
        }

        let vacant = Slot::Vacant {
            generation: key.generation,
            next_free: self.free_head,
        };
        let previous = std::mem::replace(&mut self.slots[key.index as usize], vacant);
        self.free_head = Some(key.index);
        self.len -= 1;

        match previous {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drops every live object. Outstanding keys become stale.
    pub fn clear(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.len);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Slot::Occupied { generation, .. } = slot {
                let vacant = Slot::Vacant {
                    generation: *generation,
                    next_free: self.free_head,
                };
                if let Slot::Occupied { value, .. } = std::mem::replace(slot, vacant) {
                    drained.push(value);
                }
                self.free_head = Some(index as u32);
            }
        }
        self.len = 0;
        drained
    }
}

impl<T> Default for LifetimeRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
