// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2025 Tobias Sarnowski <tobias@sarnowski.cloud>

//! Open-addressed hash table with linear probing and tombstones.
//!
//! Used both for the VM's globals/field tables (keyed by interned
//! string references) and for the string-interning table itself
//! (which additionally probes by content, see [`Table::find_string`]).

use crate::object::ObjRef;
use crate::value::Value;

const MAX_LOAD: f64 = 0.75;

#[derive(Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    value: Value,
}

/// An open-addressed hash map from interned strings to values.
pub struct Table {
    entries: Vec<Entry>,
    count: usize, // live entries + tombstones, for load-factor accounting
}

impl Table {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            count: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn key_hash(key: ObjRef) -> u32 {
        key.get().as_string().map_or(0, |s| s.hash)
    }

    /// Reference equality on interned strings, valid because two
    /// content-equal strings are always the same object.
    fn same_key(a: ObjRef, b: ObjRef) -> bool {
        a == b
    }

    fn find_entry(entries: &[Entry], capacity: usize, key: ObjRef) -> usize {
        let mut index = (Self::key_hash(key) as usize) % capacity;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if matches!(entry.value, Value::Bool(false)) {
                        // Empty, non-tombstone slot.
                        return tombstone.unwrap_or(index);
                    }
                    // Tombstone: remember the first one seen, keep probing.
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(k) if Self::same_key(k, key) => return index,
                Some(_) => {}
            }
            index = (index + 1) % capacity;
        }
    }

    fn grow(&mut self, new_capacity: usize) {
        let mut new_entries = vec![
            Entry {
                key: None,
                value: Value::Bool(false),
            };
            new_capacity
        ];
        let mut live = 0;
        for entry in &self.entries {
            let Some(key) = entry.key else { continue };
            let index = Self::find_entry(&new_entries, new_capacity, key);
            new_entries[index] = Entry {
                key: Some(key),
                value: entry.value,
            };
            live += 1;
        }
        self.entries = new_entries;
        self.count = live;
    }

    /// Insert or overwrite `key`'s value. Returns `true` if this added
    /// a brand-new key (as opposed to overwriting an existing one).
    pub fn set(&mut self, key: ObjRef, value: Value) -> bool {
        if self.entries.is_empty()
            || (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD
        {
            let new_capacity = if self.capacity() == 0 {
                8
            } else {
                self.capacity() * 2
            };
            self.grow(new_capacity);
        }

        let index = Self::find_entry(&self.entries, self.capacity(), key);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_none();
        // A fresh tombstone reuse does not grow `count` (it already
        // counted toward the load factor as a tombstone).
        if is_new_key && matches!(entry.value, Value::Bool(false)) {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        is_new_key
    }

    #[must_use]
    pub fn get(&self, key: ObjRef) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let index = Self::find_entry(&self.entries, self.capacity(), key);
        self.entries[index].key.map(|_| self.entries[index].value)
    }

    #[must_use]
    pub fn contains(&self, key: ObjRef) -> bool {
        self.get(key).is_some()
    }

    /// Remove `key`, leaving a tombstone (`key = None`, `value = true`)
    /// so probe chains through this slot remain intact.
    pub fn delete(&mut self, key: ObjRef) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = Self::find_entry(&self.entries, self.capacity(), key);
        if self.entries[index].key.is_none() {
            return false;
        }
        self.entries[index] = Entry {
            key: None,
            value: Value::Bool(true),
        };
        true
    }

    /// Probe by hash and content rather than by reference — the one
    /// place the table compares string bytes instead of pointers, used
    /// to decide whether a literal or concatenation result is already
    /// interned.
    #[must_use]
    pub fn find_string(&self, s: &str, hash: u32) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.capacity();
        let mut index = (hash as usize) % capacity;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if matches!(entry.value, Value::Bool(false)) {
                        return None;
                    }
                }
                Some(key) => {
                    if let Some(owned) = key.get().as_string() {
                        if owned.hash == hash && owned.as_str() == s {
                            return Some(key);
                        }
                    }
                }
            }
            index = (index + 1) % capacity;
        }
    }

    /// Remove every entry whose key is not marked, used by the GC
    /// sweep phase to drop weak references from the intern table
    /// before their backing objects are freed.
    pub fn remove_unmarked(&mut self) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !key.get().marked {
                    entry.key = None;
                    entry.value = Value::Bool(true); // tombstone
                }
            }
        }
    }

    /// Iterate live `(key, value)` pairs, used by the GC to mark every
    /// root reachable through this table (globals) and by instance
    /// fields that must be walked during marking.
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value)))
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash an arbitrary string the same way interned `ObjString`s are
/// hashed, so lookups by fresh source text match existing entries.
#[must_use]
pub fn hash_str(s: &str) -> u32 {
    crate::object::fnv1a(s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::Heap;

    #[test]
    fn set_get_delete_roundtrip() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let key_a = heap.intern("a");
        let key_b = heap.intern("b");

        assert!(table.set(key_a, Value::Number(1.0)));
        assert!(table.set(key_b, Value::Number(2.0)));
        assert!(!table.set(key_a, Value::Number(3.0)));

        assert_eq!(table.get(key_a).unwrap().as_number(), Some(3.0));
        assert_eq!(table.get(key_b).unwrap().as_number(), Some(2.0));

        assert!(table.delete(key_a));
        assert!(table.get(key_a).is_none());
        assert!(table.get(key_b).is_some());
    }

    #[test]
    fn grows_past_load_factor() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        for i in 0..100 {
            let key = heap.intern(&format!("key{i}"));
            table.set(key, Value::Number(f64::from(i)));
        }
        assert_eq!(table.len(), 100);
        for i in 0..100 {
            let key = heap.intern(&format!("key{i}"));
            assert_eq!(table.get(key).unwrap().as_number(), Some(f64::from(i)));
        }
    }
}
