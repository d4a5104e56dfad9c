//! Generation-checked handle registry.
//!
//! A [`Handle`] packs a kind tag, a slot generation and a slot index into one
//! `u64`:
//!
//! ```text
//!  63      56 55            32 31                 0
//! +----------+----------------+--------------------+
//! |   kind   |   generation   |     slot index     |
//! +----------+----------------+--------------------+
//! ```
//!
//! Generations start at 1, so no live handle is ever `0`. Releasing a handle
//! bumps its slot's generation; a stale copy therefore fails to resolve even
//! after the slot is reused. A slot whose generation is exhausted is retired.

use std::fmt;

use parking_lot::Mutex;

use crate::error::{Error, Result};

const INDEX_BITS: u32 = 32;
const GENERATION_BITS: u32 = 24;
const GENERATION_MAX: u32 = (1 << GENERATION_BITS) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HandleKind {
    Runtime = 1,
    Channel = 2,
}

impl HandleKind {
    const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Runtime),
            2 => Some(Self::Channel),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Runtime => "runtime",
            Self::Channel => "channel",
        }
    }
}

/// Opaque identifier of an object registered in a [`HandleTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    /// The sentinel returned across the C boundary when no object was created.
    pub const NULL: Self = Self(0);

    const fn new(kind: HandleKind, generation: u32, index: u32) -> Self {
        Self(
            ((kind as u64) << (INDEX_BITS + GENERATION_BITS))
                | ((generation as u64) << INDEX_BITS)
                | index as u64,
        )
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn into_raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn kind(self) -> Option<HandleKind> {
        HandleKind::from_tag((self.0 >> (INDEX_BITS + GENERATION_BITS)) as u8)
    }

    const fn generation(self) -> u32 {
        ((self.0 >> INDEX_BITS) as u32) & GENERATION_MAX
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn index(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(kind) => write!(
                f,
                "{}:{}.{}",
                kind.as_str(),
                self.index(),
                self.generation()
            ),
            None => write!(f, "{:#018x}", self.0),
        }
    }
}

enum Entry<T> {
    Vacant,
    /// Handed out by [`HandleTable::reserve`], not resolvable yet.
    Reserved,
    Occupied(T),
}

struct Slot<T> {
    generation: u32,
    entry: Entry<T>,
}

struct Slots<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
    reserved: usize,
}

impl<T> Slots<T> {
    fn get(&self, handle: Handle) -> Option<&T> {
        let slot = self.slots.get(handle.index() as usize)?;
        match &slot.entry {
            Entry::Occupied(value) if slot.generation == handle.generation() => Some(value),
            _ => None,
        }
    }

    /// Empties a slot and makes it reusable under the next generation.
    fn vacate(&mut self, index: u32) -> Entry<T> {
        let slot = &mut self.slots[index as usize];
        let entry = std::mem::replace(&mut slot.entry, Entry::Vacant);
        if slot.generation < GENERATION_MAX {
            slot.generation += 1;
            self.free.push(index);
        }
        entry
    }
}

/// Table of live objects addressed by [`Handle`].
///
/// Every operation takes the table-wide lock, so allocate/resolve/release are
/// linearizable with respect to each other.
pub struct HandleTable<T> {
    kind: HandleKind,
    capacity: Option<usize>,
    inner: Mutex<Slots<T>>,
}

/// A slot claimed by [`HandleTable::reserve`]. Dropping it without calling
/// [`Reservation::commit`] gives the slot back.
pub struct Reservation<'a, T> {
    table: &'a HandleTable<T>,
    handle: Handle,
    committed: bool,
}

impl<T> Reservation<'_, T> {
    /// The handle the object will be reachable under once committed.
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.handle
    }

    /// Publishes `value`; from now on the handle resolves.
    pub fn commit(mut self, value: T) -> Handle {
        let mut inner = self.table.inner.lock();
        inner.slots[self.handle.index() as usize].entry = Entry::Occupied(value);
        inner.reserved -= 1;
        inner.live += 1;
        self.committed = true;
        self.handle
    }
}

impl<T> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut inner = self.table.inner.lock();
        inner.vacate(self.handle.index());
        inner.reserved -= 1;
    }
}

impl<T> HandleTable<T> {
    #[must_use]
    pub const fn new(kind: HandleKind) -> Self {
        Self::with_capacity_limit(kind, None)
    }

    /// A table that refuses to hold more than `capacity` live objects.
    #[must_use]
    pub const fn with_capacity_limit(kind: HandleKind, capacity: Option<usize>) -> Self {
        Self {
            kind,
            capacity,
            inner: Mutex::new(Slots {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
                reserved: 0,
            }),
        }
    }

    pub fn allocate(&self, value: T) -> Result<Handle> {
        Ok(self.reserve()?.commit(value))
    }

    /// Claims a slot without publishing anything in it. Reserved slots count
    /// against the capacity but do not resolve.
    pub fn reserve(&self) -> Result<Reservation<'_, T>> {
        let mut inner = self.inner.lock();
        if let Some(capacity) = self.capacity
            && inner.live + inner.reserved >= capacity
        {
            return Err(Error::Initialization(format!(
                "{} table is full ({capacity} live handles)",
                self.kind.as_str()
            )));
        }

        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(inner.slots.len()).map_err(|_| {
                    Error::Initialization(format!(
                        "{} table index space exhausted",
                        self.kind.as_str()
                    ))
                })?;
                inner.slots.push(Slot {
                    generation: 1,
                    entry: Entry::Vacant,
                });
                index
            }
        };
        let slot = &mut inner.slots[index as usize];
        slot.entry = Entry::Reserved;
        let handle = Handle::new(self.kind, slot.generation, index);
        inner.reserved += 1;
        Ok(Reservation {
            table: self,
            handle,
            committed: false,
        })
    }

    /// Allocates a slot and builds its object from the handle it will be
    /// reachable under. `build` runs without the table lock held; if it
    /// fails, the slot is given back.
    pub fn allocate_with(&self, build: impl FnOnce(Handle) -> Result<T>) -> Result<Handle> {
        let reservation = self.reserve()?;
        let value = build(reservation.handle())?;
        Ok(reservation.commit(value))
    }

    /// Returns a clone of the object behind `handle`.
    pub fn resolve(&self, handle: Handle) -> Result<T>
    where
        T: Clone,
    {
        if handle.kind() != Some(self.kind) {
            return Err(Error::NotFound(handle));
        }
        self.inner
            .lock()
            .get(handle)
            .cloned()
            .ok_or(Error::NotFound(handle))
    }

    #[must_use]
    pub fn contains(&self, handle: Handle) -> bool {
        handle.kind() == Some(self.kind) && self.inner.lock().get(handle).is_some()
    }

    /// Removes the object behind `handle` and invalidates every copy of it.
    pub fn release(&self, handle: Handle) -> Result<T> {
        if handle.kind() != Some(self.kind) {
            return Err(Error::NotFound(handle));
        }
        let mut inner = self.inner.lock();
        if inner.get(handle).is_none() {
            return Err(Error::NotFound(handle));
        }
        let Entry::Occupied(value) = inner.vacate(handle.index()) else {
            return Err(Error::NotFound(handle));
        };
        inner.live -= 1;
        Ok(value)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().live
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the currently live handles.
    #[must_use]
    pub fn handles(&self) -> Vec<Handle> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .zip(0u32..)
            .filter(|(slot, _)| matches!(slot.entry, Entry::Occupied(_)))
            .map(|(slot, index)| Handle::new(self.kind, slot.generation, index))
            .collect()
    }

    /// Releases every live object.
    pub fn drain(&self) -> Vec<(Handle, T)> {
        self.handles()
            .into_iter()
            .filter_map(|handle| self.release(handle).ok().map(|value| (handle, value)))
            .collect()
    }
}
