//! Generational slot storage.
//!
//! An [`Arena`] hands out handles that pack a slot *index* together with a
//! *generation*. The generation is bumped every time a slot is released,
//! so a handle kept across a removal can never reach the value that later
//! reuses its slot. Entity nodes and reference slots both live in arenas.

use std::collections::VecDeque;
use std::fmt;

// ---------------------------------------------------------------------------
// ArenaKey
// ---------------------------------------------------------------------------

/// A handle type that can address an [`Arena`] slot.
pub trait ArenaKey: Copy + Eq + fmt::Debug {
    /// Build a handle from its parts.
    fn from_parts(index: u32, generation: u32) -> Self;
    /// Slot index.
    fn index(self) -> u32;
    /// Slot generation at the time the handle was issued.
    fn generation(self) -> u32;
}

// ---------------------------------------------------------------------------
// Slot
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum SlotState<T> {
    Free,
    /// Handed out by [`Arena::reserve`] but not filled yet.
    Reserved,
    Occupied(T),
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    state: SlotState<T>,
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

/// Generational storage keyed by `K`.
///
/// Free indices are recycled in FIFO order so that generations are spread
/// across slots instead of piling up on one hot index.
#[derive(Debug)]
pub struct Arena<K, T> {
    slots: Vec<Slot<T>>,
    free: VecDeque<u32>,
    len: usize,
    _key: std::marker::PhantomData<fn() -> K>,
}

impl<K: ArenaKey, T> Arena<K, T> {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: VecDeque::new(),
            len: 0,
            _key: std::marker::PhantomData,
        }
    }

    fn claim(&mut self, state: SlotState<T>) -> K {
        if let Some(index) = self.free.pop_front() {
            let slot = &mut self.slots[index as usize];
            slot.state = state;
            K::from_parts(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                state,
            });
            K::from_parts(index, 0)
        }
    }

    /// Store `value` and return its handle.
    pub fn insert(&mut self, value: T) -> K {
        self.len += 1;
        self.claim(SlotState::Occupied(value))
    }

    /// Hand out a handle now and supply its value later with [`Arena::fill`].
    pub fn reserve(&mut self) -> K {
        self.claim(SlotState::Reserved)
    }

    /// Fill a slot obtained from [`Arena::reserve`].
    ///
    /// Returns the value back if `key` is stale or was not reserved.
    pub fn fill(&mut self, key: K, value: T) -> Result<(), T> {
        match self.slot_mut(key) {
            Some(slot) if matches!(slot.state, SlotState::Reserved) => {
                slot.state = SlotState::Occupied(value);
                self.len += 1;
                Ok(())
            }
            _ => Err(value),
        }
    }

    /// Whether `key` is a live reservation that has not been filled.
    pub fn is_reserved(&self, key: K) -> bool {
        matches!(self.slot(key).map(|s| &s.state), Some(SlotState::Reserved))
    }

    /// Release a slot (occupied or reserved), bumping its generation.
    ///
    /// Returns the stored value if there was one.
    pub fn remove(&mut self, key: K) -> Option<T> {
        let slot = self.slot_mut(key)?;
        let previous = std::mem::replace(&mut slot.state, SlotState::Free);
        if matches!(previous, SlotState::Free) {
            return None;
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push_back(key.index());
        match previous {
            SlotState::Occupied(value) => {
                self.len -= 1;
                Some(value)
            }
            _ => None,
        }
    }

    /// Shared access to a live value.
    pub fn get(&self, key: K) -> Option<&T> {
        match &self.slot(key)?.state {
            SlotState::Occupied(value) => Some(value),
            _ => None,
        }
    }

    /// Mutable access to a live value.
    pub fn get_mut(&mut self, key: K) -> Option<&mut T> {
        match &mut self.slot_mut(key)?.state {
            SlotState::Occupied(value) => Some(value),
            _ => None,
        }
    }

    /// Whether `key` addresses a live value.
    pub fn contains(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the arena holds no live values.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate live values with their handles, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match &slot.state {
                SlotState::Occupied(value) => {
                    Some((K::from_parts(index as u32, slot.generation), value))
                }
                _ => None,
            })
    }

    /// Release every slot. Outstanding handles all become stale.
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if !matches!(slot.state, SlotState::Free) {
                slot.state = SlotState::Free;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push_back(index as u32);
            }
        }
        self.len = 0;
    }

    fn slot(&self, key: K) -> Option<&Slot<T>> {
        self.slots
            .get(key.index() as usize)
            .filter(|slot| slot.generation == key.generation())
    }

    fn slot_mut(&mut self, key: K) -> Option<&mut Slot<T>> {
        self.slots
            .get_mut(key.index() as usize)
            .filter(|slot| slot.generation == key.generation())
    }
}

impl<K: ArenaKey, T> Default for Arena<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
