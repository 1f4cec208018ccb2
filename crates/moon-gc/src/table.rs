//! Script tables: an array part for keys `1..=n` plus a hash part.

use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;

use crate::value::{GcRef, TableKey, Value};

/// How a table's references are treated by the collector, as declared by the
/// `__mode` field of its metatable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeakMode {
    Strong,
    /// `__mode = "v"`: values do not keep their referents alive.
    WeakValues,
    /// `__mode = "k"`: an ephemeron table.
    WeakKeys,
    /// `__mode = "kv"`.
    AllWeak,
}

impl WeakMode {
    /// Parses a `__mode` string.
    #[must_use]
    pub fn from_mode_bytes(mode: &[u8]) -> Self {
        match (mode.contains(&b'k'), mode.contains(&b'v')) {
            (false, false) => Self::Strong,
            (false, true) => Self::WeakValues,
            (true, false) => Self::WeakKeys,
            (true, true) => Self::AllWeak,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Table {
    /// Values for keys `1..=array.len()`. May hold `Nil` holes but never ends
    /// with one.
    pub array: Vec<Value>,
    pub hash: IndexMap<TableKey, Value, FxBuildHasher>,
    pub metatable: Option<GcRef>,
}

impl Table {
    pub(crate) fn get(&self, key: &TableKey) -> Value {
        if let Some(slot) = self.array_slot(key) {
            return self.array[slot];
        }
        self.hash.get(key).copied().unwrap_or(Value::Nil)
    }

    pub(crate) fn get_str(&self, key: GcRef) -> Value {
        self.hash.get(&TableKey::Object(key)).copied().unwrap_or(Value::Nil)
    }

    /// Stores `value` under `key`. Storing `nil` removes the entry.
    pub(crate) fn set(&mut self, key: TableKey, value: Value) {
        if let Some(slot) = self.array_slot(&key) {
            self.array[slot] = value;
            if value.is_nil() && slot + 1 == self.array.len() {
                while self.array.last().is_some_and(|v| v.is_nil()) {
                    self.array.pop();
                }
            }
            return;
        }
        if value.is_nil() {
            self.hash.shift_remove(&key);
            return;
        }
        if key == TableKey::Integer(self.next_array_key()) {
            self.array.push(value);
            self.hash.shift_remove(&key);
            self.migrate_from_hash();
        } else {
            self.hash.insert(key, value);
        }
    }

    /// A border: `n` such that `t[n]` is non-nil and `t[n + 1]` is nil, or 0.
    ///
    /// The array part never ends in `nil`, so its length is a border unless
    /// the hash part continues the sequence.
    pub(crate) fn len(&self) -> usize {
        let mut n = self.array.len();
        while self.hash.contains_key(&TableKey::Integer(Self::key_for(n + 1))) {
            n += 1;
        }
        n
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (TableKey, Value)> + '_ {
        let array = self
            .array
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nil())
            .map(|(i, v)| (TableKey::Integer(Self::key_for(i + 1)), *v));
        array.chain(self.hash.iter().map(|(k, v)| (*k, *v)))
    }

    pub(crate) fn estimated_size(&self) -> usize {
        const VALUE: usize = std::mem::size_of::<Value>();
        56 + VALUE * self.array.len() + 2 * VALUE * self.hash.len()
    }

    /// Clears array and hash entries whose value fails `keep`.
    pub(crate) fn retain_values(&mut self, mut keep: impl FnMut(&Value) -> bool) {
        for v in &mut self.array {
            if !keep(v) {
                *v = Value::Nil;
            }
        }
        while self.array.last().is_some_and(|v| v.is_nil()) {
            self.array.pop();
        }
        self.hash.retain(|_, v| keep(v));
    }

    /// Drops hash entries whose key fails `keep`.
    pub(crate) fn retain_keys(&mut self, mut keep: impl FnMut(&TableKey) -> bool) {
        self.hash.retain(|k, _| keep(k));
    }

    fn array_slot(&self, key: &TableKey) -> Option<usize> {
        match *key {
            TableKey::Integer(i) if i >= 1 => {
                let slot = usize::try_from(i - 1).ok()?;
                (slot < self.array.len()).then_some(slot)
            }
            _ => None,
        }
    }

    fn next_array_key(&self) -> i64 {
        Self::key_for(self.array.len() + 1)
    }

    fn migrate_from_hash(&mut self) {
        while let Some(v) = self.hash.shift_remove(&TableKey::Integer(self.next_array_key())) {
            self.array.push(v);
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    const fn key_for(n: usize) -> i64 {
        n as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(i: i64) -> TableKey {
        TableKey::Integer(i)
    }

    #[test]
    fn test_sequential_keys_use_array_part() {
        let mut t = Table::default();
        for i in 1..=5 {
            t.set(int(i), Value::Integer(i * 10));
        }
        assert_eq!(t.array.len(), 5);
        assert!(t.hash.is_empty());
        assert_eq!(t.get(&int(3)), Value::Integer(30));
        assert_eq!(t.len(), 5);
    }

    #[test]
    fn test_hash_keys_migrate_into_array() {
        let mut t = Table::default();
        t.set(int(3), Value::Integer(3));
        t.set(int(2), Value::Integer(2));
        assert_eq!(t.array.len(), 0);
        t.set(int(1), Value::Integer(1));
        assert_eq!(t.array.len(), 3);
        assert!(t.hash.is_empty());
    }

    #[test]
    fn test_nil_removes_and_trims() {
        let mut t = Table::default();
        t.set(int(1), Value::Boolean(true));
        t.set(int(2), Value::Boolean(true));
        t.set(TableKey::Boolean(false), Value::Integer(1));
        t.set(int(2), Value::Nil);
        t.set(TableKey::Boolean(false), Value::Nil);
        assert_eq!(t.array.len(), 1);
        assert!(t.hash.is_empty());
        assert_eq!(t.get(&int(2)), Value::Nil);
    }

    #[test]
    fn test_border_with_holes() {
        let mut t = Table::default();
        for i in 1..=4 {
            t.set(int(i), Value::Integer(i));
        }
        t.set(int(2), Value::Nil);
        let n = t.len();
        assert!(n == 1 || n == 4, "border {n}");
        t.set(int(4), Value::Nil);
        t.set(int(3), Value::Nil);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_weak_mode_parsing() {
        assert_eq!(WeakMode::from_mode_bytes(b""), WeakMode::Strong);
        assert_eq!(WeakMode::from_mode_bytes(b"v"), WeakMode::WeakValues);
        assert_eq!(WeakMode::from_mode_bytes(b"k"), WeakMode::WeakKeys);
        assert_eq!(WeakMode::from_mode_bytes(b"vk"), WeakMode::AllWeak);
    }
}
