//! Fixed-capacity register cache.
//!
//! The set of cached addresses is closed: it is fixed when the cache is
//! built and an [`AddressMap`] translates an address into a [`Slot`] with a
//! single array index. Every slot has its own lock, so a reader copies one
//! entry without contending with writers of other addresses.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::config::MAX_REGISTERS;

/// Cache errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("Register {0} is not in the configured address list")]
    UnknownAddress(u16),
    #[error("Register {0} has not been fetched from the upstream device yet")]
    NoDataYet(u16),
    #[error("Address list is empty")]
    Empty,
    #[error("{count} registers configured, capacity is {max}")]
    TooManyRegisters { count: usize, max: usize },
}

/// Position of an address inside a [`RegisterCache`].
///
/// Only obtainable from an [`AddressMap`]. A slot taken from a different
/// map resolves to nothing instead of panicking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slot(u16);

impl Slot {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Address to slot table, built once from the configured address list.
#[derive(Debug, Clone)]
pub struct AddressMap {
    /// Lowest configured address.
    base: u16,
    /// `index[address - base]` is the slot for `address`, if configured.
    index: Box<[Option<Slot>]>,
    /// Configured addresses in slot order (ascending).
    addresses: Box<[u16]>,
}

impl AddressMap {
    /// Build the table. Duplicates collapse; the list need not be sorted.
    pub fn new(addresses: &[u16]) -> Result<Self, CacheError> {
        let mut sorted = addresses.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        if sorted.len() > MAX_REGISTERS {
            return Err(CacheError::TooManyRegisters {
                count: sorted.len(),
                max: MAX_REGISTERS,
            });
        }
        let (Some(&base), Some(&last)) = (sorted.first(), sorted.last()) else {
            return Err(CacheError::Empty);
        };

        let mut index = vec![None; (last - base) as usize + 1].into_boxed_slice();
        for (slot, &address) in sorted.iter().enumerate() {
            index[(address - base) as usize] = Some(Slot(slot as u16));
        }

        Ok(Self {
            base,
            index,
            addresses: sorted.into_boxed_slice(),
        })
    }

    /// Resolve an address in constant time.
    pub fn slot(&self, address: u16) -> Option<Slot> {
        let offset = address.checked_sub(self.base)? as usize;
        self.index.get(offset).copied().flatten()
    }

    /// Address stored in `slot`.
    pub fn address(&self, slot: Slot) -> Option<u16> {
        self.addresses.get(slot.index()).copied()
    }

    pub fn contains(&self, address: u16) -> bool {
        self.slot(address).is_some()
    }

    /// Configured addresses in ascending order.
    pub fn addresses(&self) -> &[u16] {
        &self.addresses
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Resolve every address of `start..start + count`.
    ///
    /// Fails with the first address that is not configured (or that would
    /// wrap past 65535).
    pub fn resolve_range(&self, start: u16, count: u16) -> Result<Vec<Slot>, CacheError> {
        (0..count)
            .map(|offset| {
                let address = start
                    .checked_add(offset)
                    .ok_or(CacheError::UnknownAddress(u16::MAX))?;
                self.slot(address).ok_or(CacheError::UnknownAddress(address))
            })
            .collect()
    }
}

/// Copy of one cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterEntry {
    pub address: u16,
    pub value: u16,
    /// Time the value landed in the cache, `None` before the first one.
    pub last_updated: Option<Instant>,
    /// Time the value was observed. For upstream data this is when the
    /// read was issued, which orders out-of-order completions.
    pub observed_at: Option<Instant>,
    /// False only until the first value lands.
    pub valid: bool,
    /// True once the upstream device has answered for this address.
    /// Downstream writes never set it.
    pub fetched: bool,
}

impl RegisterEntry {
    /// Elapsed time since the last refresh.
    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.last_updated
            .map(|at| now.saturating_duration_since(at))
    }

    /// True when the entry is invalid or older than `threshold`.
    pub fn is_stale(&self, now: Instant, threshold: Duration) -> bool {
        self.age(now).is_none_or(|age| age > threshold)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SlotState {
    value: u16,
    last_updated: Option<Instant>,
    observed_at: Option<Instant>,
    fetched: bool,
}

fn lock(slot: &Mutex<SlotState>) -> MutexGuard<'_, SlotState> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Register cache shared by the poller, the completion path and every
/// downstream server role.
#[derive(Debug)]
pub struct RegisterCache {
    map: AddressMap,
    slots: Box<[Mutex<SlotState>]>,
}

impl RegisterCache {
    /// Build an empty (all invalid) cache for the given address list.
    pub fn new(addresses: &[u16]) -> Result<Self, CacheError> {
        let map = AddressMap::new(addresses)?;
        let slots = (0..map.len())
            .map(|_| Mutex::new(SlotState::default()))
            .collect();
        Ok(Self { map, slots })
    }

    pub fn address_map(&self) -> &AddressMap {
        &self.map
    }

    /// Resolve an address to its slot.
    pub fn slot(&self, address: u16) -> Option<Slot> {
        self.map.slot(address)
    }

    /// Read one entry. `None` for a slot of another cache.
    pub fn get(&self, slot: Slot) -> Option<RegisterEntry> {
        let address = self.map.address(slot)?;
        let state = *lock(self.slots.get(slot.index())?);
        Some(RegisterEntry {
            address,
            value: state.value,
            last_updated: state.last_updated,
            observed_at: state.observed_at,
            valid: state.last_updated.is_some(),
            fetched: state.fetched,
        })
    }

    /// Store a value refreshed now.
    pub fn set(&self, slot: Slot, value: u16) {
        self.set_at(slot, value, Instant::now());
    }

    /// Store a value observed at `at`.
    ///
    /// A write stamped older than the current entry is discarded, so two
    /// completions landing out of order cannot roll a register back.
    /// Returns whether the write was applied.
    pub fn set_at(&self, slot: Slot, value: u16, at: Instant) -> bool {
        self.store(slot, value, at, false)
    }

    fn store(&self, slot: Slot, value: u16, at: Instant, from_upstream: bool) -> bool {
        let Some(slot) = self.slots.get(slot.index()) else {
            return false;
        };
        let mut state = lock(slot);
        // An upstream answer counts as fetched even when a newer local
        // write wins the value.
        state.fetched |= from_upstream;
        if state.observed_at.is_some_and(|current| at < current) {
            return false;
        }
        state.value = value;
        state.observed_at = Some(at);
        state.last_updated = Some(Instant::now());
        true
    }

    /// Write a contiguous run of upstream values starting at `start`,
    /// observed at `at`, and mark those entries as fetched.
    ///
    /// Addresses inside the run that are not configured are skipped.
    /// Returns the number of entries updated.
    pub fn write_run(&self, start: u16, values: &[u16], at: Instant) -> usize {
        values
            .iter()
            .enumerate()
            .filter_map(|(offset, &value)| {
                let address = start.checked_add(u16::try_from(offset).ok()?)?;
                Some((self.slot(address)?, value))
            })
            .filter(|&(slot, value)| self.store(slot, value, at, true))
            .count()
    }

    /// Read `count` values starting at `start` for a downstream client.
    pub fn read_run(&self, start: u16, count: u16) -> Result<Vec<u16>, CacheError> {
        let slots = self.map.resolve_range(start, count)?;
        slots
            .into_iter()
            .map(|slot| {
                let entry = self.get(slot).ok_or(CacheError::UnknownAddress(start))?;
                if entry.valid {
                    Ok(entry.value)
                } else {
                    Err(CacheError::NoDataYet(entry.address))
                }
            })
            .collect()
    }

    /// Look up the entry for an address.
    pub fn lookup(&self, address: u16) -> Result<RegisterEntry, CacheError> {
        self.slot(address)
            .and_then(|slot| self.get(slot))
            .ok_or(CacheError::UnknownAddress(address))
    }

    /// Last known value of `address`.
    pub fn get_register_value(&self, address: u16) -> Result<u16, CacheError> {
        let entry = self.lookup(address)?;
        if entry.valid {
            Ok(entry.value)
        } else {
            Err(CacheError::NoDataYet(address))
        }
    }

    /// Overwrite the value of `address`.
    pub fn set_register_value(&self, address: u16, value: u16) -> Result<(), CacheError> {
        let slot = self
            .slot(address)
            .ok_or(CacheError::UnknownAddress(address))?;
        self.set(slot, value);
        Ok(())
    }

    /// True when the upstream device has answered for every address in
    /// `addresses`.
    pub fn all_fetched(&self, addresses: &[u16]) -> bool {
        addresses
            .iter()
            .all(|&address| self.lookup(address).is_ok_and(|entry| entry.fetched))
    }

    /// Copy of every entry, in address order.
    pub fn entries(&self) -> Vec<RegisterEntry> {
        (0..self.map.len())
            .filter_map(|index| self.get(Slot(index as u16)))
            .collect()
    }

    /// Number of entries that hold a fetched value.
    pub fn valid_count(&self) -> usize {
        self.slots.iter().filter(|slot| lock(slot).last_updated.is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
