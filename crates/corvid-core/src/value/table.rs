//! Tables: an array part for dense integer keys plus an insertion-ordered hash part

use std::hash::{Hash, Hasher};

use rustc_hash::FxHashMap;
use thiserror::Error;

use super::number::as_exact_integer;
use super::{Value, Vector};
use crate::gc::Handle;

/// Errors raised by raw table operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("table index is nil")]
    NilKey,
    #[error("table index is NaN")]
    NaNKey,
    #[error("invalid key to 'next'")]
    InvalidNextKey,
}

/// A normalized hash key.
///
/// Integer variants become `Number`, `-0` becomes `0` and NaN is rejected,
/// so keys that compare equal as values hash identically.
#[derive(Debug, Clone, Copy)]
pub struct TableKey(Value);

impl TableKey {
    pub fn new(value: Value) -> Result<Self, TableError> {
        let normalized = match value {
            Value::Nil => return Err(TableError::NilKey),
            Value::Number(n) if n.is_nan() => return Err(TableError::NaNKey),
            Value::Number(n) => Value::Number(if n == 0.0 { 0.0 } else { n }),
            Value::Integer(i) => Value::Number(f64::from(i)),
            Value::UnsignedInteger(u) => Value::Number(f64::from(u)),
            Value::Vector(v) => Value::Vector(v.map(|c| if c == 0.0 { 0.0 } else { c })),
            other => other,
        };
        Ok(TableKey(normalized))
    }

    fn int(i: usize) -> Self {
        TableKey(Value::Number(i as f64))
    }

    #[must_use]
    pub const fn value(&self) -> Value {
        self.0
    }
}

fn vector_bits(v: Vector) -> [u32; 3] {
    [v.x.to_bits(), v.y.to_bits(), v.z.to_bits()]
}

impl PartialEq for TableKey {
    fn eq(&self, other: &Self) -> bool {
        match (self.0, other.0) {
            (Value::Number(a), Value::Number(b)) => a.to_bits() == b.to_bits(),
            (Value::Vector(a), Value::Vector(b)) => vector_bits(a) == vector_bits(b),
            (a, b) => a.raw_equal(&b),
        }
    }
}

impl Eq for TableKey {}

impl Hash for TableKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.0).hash(state);
        match self.0 {
            Value::Nil => {}
            Value::Boolean(b) => b.hash(state),
            Value::LightUserdata(p) => p.hash(state),
            Value::Number(n) => n.to_bits().hash(state),
            Value::Integer(i) => i.hash(state),
            Value::UnsignedInteger(u) => u.hash(state),
            Value::Vector(v) => vector_bits(v).hash(state),
            Value::String(h)
            | Value::Table(h)
            | Value::Function(h)
            | Value::Userdata(h)
            | Value::Thread(h)
            | Value::Buffer(h) => h.hash(state),
        }
    }
}

/// 1-based array position for keys that are positive integral numbers
fn array_index(key: &Value) -> Option<usize> {
    let i = as_exact_integer(key.as_number()?)?;
    if i >= 1 {
        usize::try_from(i).ok()
    } else {
        None
    }
}

/// A script table.
///
/// Removing a hash entry leaves a tombstone (nil value) in place so that
/// `next` stays valid while a traversal clears fields. Tombstones are
/// dropped when the entry list is compacted during an insertion.
#[derive(Debug, Default)]
pub struct Table {
    array: Vec<Value>,
    entries: Vec<(TableKey, Value)>,
    index: FxHashMap<TableKey, usize>,
    live: usize,
    pub metatable: Option<Handle>,
    pub readonly: bool,
}

impl Table {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(array: usize, hash: usize) -> Self {
        Self {
            array: Vec::with_capacity(array),
            entries: Vec::with_capacity(hash),
            index: FxHashMap::with_capacity_and_hasher(hash, Default::default()),
            ..Self::default()
        }
    }

    /// Raw lookup; missing keys (including nil and NaN) read as nil
    #[must_use]
    pub fn get(&self, key: &Value) -> Value {
        if let Some(i) = array_index(key) {
            if i <= self.array.len() {
                return self.array[i - 1];
            }
        }
        if self.live == 0 {
            return Value::Nil;
        }
        match TableKey::new(*key) {
            Ok(key) => self.get_key(&key),
            Err(_) => Value::Nil,
        }
    }

    #[must_use]
    pub fn get_int(&self, i: i64) -> Value {
        match usize::try_from(i) {
            Ok(index) if index >= 1 && index <= self.array.len() => self.array[index - 1],
            _ => self.get(&Value::Number(i as f64)),
        }
    }

    fn get_key(&self, key: &TableKey) -> Value {
        self.index
            .get(key)
            .map_or(Value::Nil, |&pos| self.entries[pos].1)
    }

    /// Raw store; assigning nil removes the key
    pub fn set(&mut self, key: Value, value: Value) -> Result<(), TableError> {
        if let Some(i) = array_index(&key) {
            self.set_int(i, value);
            return Ok(());
        }
        let key = TableKey::new(key)?;
        self.set_hash(key, value);
        Ok(())
    }

    /// Raw store at a 1-based integer index
    pub fn set_int(&mut self, i: usize, value: Value) {
        let len = self.array.len();
        if i >= 1 && i <= len {
            self.array[i - 1] = value;
        } else if i == len + 1 && !value.is_nil() {
            self.array.push(value);
            if !self.index.is_empty() {
                self.set_hash(TableKey::int(i), Value::Nil);
                self.migrate_from_hash();
            }
        } else {
            self.set_hash(TableKey::int(i), value);
        }
    }

    fn set_hash(&mut self, key: TableKey, value: Value) {
        if let Some(&pos) = self.index.get(&key) {
            let slot = &mut self.entries[pos].1;
            match (slot.is_nil(), value.is_nil()) {
                (true, false) => self.live += 1,
                (false, true) => self.live -= 1,
                _ => {}
            }
            *slot = value;
        } else if !value.is_nil() {
            if self.entries.len() >= 8 && self.live * 2 < self.entries.len() {
                self.compact();
            }
            self.index.insert(key, self.entries.len());
            self.entries.push((key, value));
            self.live += 1;
        }
    }

    /// Move keys `len+1, len+2, ...` from the hash part into the array part
    fn migrate_from_hash(&mut self) {
        loop {
            let key = TableKey::int(self.array.len() + 1);
            let Some(&pos) = self.index.get(&key) else {
                break;
            };
            let value = std::mem::take(&mut self.entries[pos].1);
            if value.is_nil() {
                break;
            }
            self.live -= 1;
            self.array.push(value);
        }
    }

    fn compact(&mut self) {
        self.entries.retain(|(_, v)| !v.is_nil());
        self.index.clear();
        for (pos, (key, _)) in self.entries.iter().enumerate() {
            self.index.insert(*key, pos);
        }
    }

    /// Store constructor values starting at a 1-based index
    pub fn set_list(&mut self, start: usize, values: &[Value]) {
        if values.is_empty() {
            return;
        }
        if start == 0 || start > self.array.len() + 1 {
            for (offset, &value) in values.iter().enumerate() {
                self.set_int(start + offset, value);
            }
            return;
        }
        let end = start + values.len() - 1;
        if end > self.array.len() {
            self.array.resize(end, Value::Nil);
        }
        self.array[start - 1..end].copy_from_slice(values);
        if self.live > 0 {
            for i in start..=end {
                self.set_hash(TableKey::int(i), Value::Nil);
            }
        }
        if !self.index.is_empty() {
            self.migrate_from_hash();
        }
    }

    /// A border: `t[n] ~= nil and t[n + 1] == nil` (or 0)
    #[must_use]
    pub fn len(&self) -> usize {
        let n = self.array.len();
        if n > 0 {
            if !self.array[n - 1].is_nil() {
                return n;
            }
            let (mut lo, mut hi) = (0, n);
            while hi - lo > 1 {
                let mid = (lo + hi) / 2;
                if self.array[mid - 1].is_nil() {
                    hi = mid;
                } else {
                    lo = mid;
                }
            }
            return lo;
        }
        if self.live == 0 {
            return 0;
        }

        // Unbounded search over the hash part
        let present = |i: usize| !self.get_key(&TableKey::int(i)).is_nil();
        let (mut lo, mut hi) = (0usize, 1usize);
        while present(hi) {
            lo = hi;
            match hi.checked_mul(2) {
                Some(next) => hi = next,
                None => {
                    let mut i = 1;
                    while present(i) {
                        i += 1;
                    }
                    return i - 1;
                }
            }
        }
        while hi - lo > 1 {
            let mid = (lo + hi) / 2;
            if present(mid) {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        lo
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0 && self.array.iter().all(Value::is_nil)
    }

    /// The entry following `key` in traversal order; `None` at the end
    pub fn next(&self, key: &Value) -> Result<Option<(Value, Value)>, TableError> {
        let hash_start = if key.is_nil() {
            if let Some(found) = self.next_in_array(0) {
                return Ok(Some(found));
            }
            0
        } else if let Some(i) = array_index(key).filter(|&i| i <= self.array.len()) {
            if let Some(found) = self.next_in_array(i) {
                return Ok(Some(found));
            }
            0
        } else {
            let key = TableKey::new(*key).map_err(|_| TableError::InvalidNextKey)?;
            let pos = *self.index.get(&key).ok_or(TableError::InvalidNextKey)?;
            pos + 1
        };

        Ok(self.entries[hash_start.min(self.entries.len())..]
            .iter()
            .find(|(_, v)| !v.is_nil())
            .map(|(k, v)| (k.value(), *v)))
    }

    fn next_in_array(&self, from: usize) -> Option<(Value, Value)> {
        (from..self.array.len())
            .find(|&i| !self.array[i].is_nil())
            .map(|i| (Value::Number((i + 1) as f64), self.array[i]))
    }

    /// Live entries in traversal order
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        let array = self
            .array
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nil())
            .map(|(i, v)| (Value::Number((i + 1) as f64), *v));
        let hash = self
            .entries
            .iter()
            .filter(|(_, v)| !v.is_nil())
            .map(|(k, v)| (k.value(), *v));
        array.chain(hash)
    }

    pub fn clear(&mut self) {
        self.array.clear();
        self.entries.clear();
        self.index.clear();
        self.live = 0;
    }

    /// Heap handles this table keeps alive. Tombstoned keys are skipped.
    pub fn references(&self, out: &mut Vec<Handle>) {
        out.extend(self.metatable);
        out.extend(self.array.iter().filter_map(Value::handle));
        for (key, value) in &self.entries {
            if !value.is_nil() {
                out.extend(key.value().handle());
                out.extend(value.handle());
            }
        }
    }

    /// Approximate heap footprint, used for collector pacing
    #[must_use]
    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<Table>()
            + self.array.capacity() * std::mem::size_of::<Value>()
            + self.entries.capacity() * std::mem::size_of::<(TableKey, Value)>()
            + self.index.capacity() * (std::mem::size_of::<(TableKey, usize)>() + 1)
    }
}
