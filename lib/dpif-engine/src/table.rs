// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The bounded, ordered table underlying the port and flow tables.
//!
//! Ordering is what makes dumps work without holding a lock across
//! round trips: a dump request carries the key of the last entry it
//! saw and the table answers with the first key strictly greater.
//! Entries that stay in the table for the whole dump are therefore
//! visited exactly once, no matter what else is inserted or removed
//! in between.

use dpif_api::DpifError;
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::ops::Bound;

type Result<T> = core::result::Result<T, DpifError>;

#[derive(Debug)]
pub struct Table<K, V> {
    limit: NonZeroU32,
    map: BTreeMap<K, V>,
}

impl<K: Ord, V> Table<K, V> {
    pub fn new(limit: NonZeroU32) -> Self {
        Self { limit, map: BTreeMap::new() }
    }

    /// Add a new entry.
    ///
    /// # Errors
    ///
    /// If the table is at max capacity an error is returned and the
    /// table is unchanged. The caller is expected to have checked for
    /// an existing entry; one is overwritten.
    pub fn add(&mut self, key: K, val: V) -> Result<()> {
        if !self.map.contains_key(&key) && self.is_full() {
            return Err(DpifError::TableFull(self.limit.get()));
        }

        self.map.insert(key, val);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.map.clear()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.map.get_mut(key)
    }

    pub fn get_limit(&self) -> NonZeroU32 {
        self.limit
    }

    pub fn is_full(&self) -> bool {
        self.map.len() >= self.limit.get() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.map.iter()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// The dump step: the first entry after `cursor`, or the first
    /// entry overall when there is no cursor.
    pub fn next_after(&self, cursor: Option<&K>) -> Option<(&K, &V)> {
        match cursor {
            Some(key) => {
                self.map.range((Bound::Excluded(key), Bound::Unbounded)).next()
            }
            None => self.map.iter().next(),
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key)
    }
}
