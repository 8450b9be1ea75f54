//! The object arena

use std::rc::Rc;

use rustc_hash::FxHashMap;

use super::{GcConfig, GcPhase, GcStats};
use crate::value::{
    Buffer, Function, LoadedProto, LuaString, Object, Table, TableError, ThreadObject, Upvalue,
    Userdata, Value,
};

/// A generation-checked reference to a heap object.
///
/// Freeing a slot bumps its generation, so a handle that outlives its
/// object is detectably stale rather than silently aliasing a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Color {
    White0,
    White1,
    Gray,
    Black,
}

impl Color {
    pub(super) fn other_white(self) -> Color {
        match self {
            Color::White0 => Color::White1,
            _ => Color::White0,
        }
    }
}

#[derive(Debug)]
pub(super) struct Slot {
    pub(super) generation: u32,
    pub(super) color: Color,
    pub(super) size: usize,
    pub(super) object: Option<Object>,
}

/// Owner of every heap object, plus the collector's bookkeeping
#[derive(Debug)]
pub struct Heap {
    pub(super) slots: Vec<Slot>,
    pub(super) free: Vec<u32>,
    /// Weak intern table: entries for unmarked strings are purged atomically
    pub(super) strings: FxHashMap<Box<[u8]>, Handle>,
    pub(super) threads: Vec<Handle>,
    pub(super) config: GcConfig,
    pub(super) phase: GcPhase,
    pub(super) white: Color,
    pub(super) gray: Vec<Handle>,
    pub(super) sweep_cursor: usize,
    pub(super) bytes: usize,
    pub(super) debt: usize,
    pub(super) threshold: usize,
    pub(super) memory_limit: Option<usize>,
    pub(super) cycles: usize,
    pub(super) total_allocated: usize,
    pub(super) objects_freed: usize,
    pub(super) scratch: Vec<Handle>,
}

impl Heap {
    #[must_use]
    pub fn new(config: GcConfig, memory_limit: Option<usize>) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            strings: FxHashMap::default(),
            threads: Vec::new(),
            config,
            phase: GcPhase::Idle,
            white: Color::White0,
            gray: Vec::new(),
            sweep_cursor: 0,
            bytes: 0,
            debt: 0,
            threshold: config.min_threshold_bytes,
            memory_limit,
            cycles: 0,
            total_allocated: 0,
            objects_freed: 0,
            scratch: Vec::new(),
        }
    }

    /// Move an object into the arena.
    ///
    /// Allocation never runs the collector; steps happen at safe points
    /// chosen by the VM.
    pub fn alloc(&mut self, object: Object) -> Handle {
        let size = object.byte_size();
        let is_thread = matches!(object, Object::Thread(_));
        let color = self.white;

        let handle = if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.color = color;
            slot.size = size;
            slot.object = Some(object);
            Handle {
                index,
                generation: slot.generation,
            }
        } else {
            let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
            self.slots.push(Slot {
                generation: 0,
                color,
                size,
                object: Some(object),
            });
            Handle {
                index,
                generation: 0,
            }
        };

        if is_thread {
            self.threads.push(handle);
        }
        self.bytes += size;
        self.debt += size;
        self.total_allocated += size;
        handle
    }

    /// Return the unique string object for `bytes`, allocating it if needed
    pub fn intern(&mut self, bytes: &[u8]) -> Handle {
        if let Some(&handle) = self.strings.get(bytes) {
            return handle;
        }
        let handle = self.alloc(Object::String(LuaString::new(bytes)));
        self.strings.insert(bytes.into(), handle);
        handle
    }

    pub fn new_table(&mut self, array: usize, hash: usize) -> Handle {
        self.alloc(Object::Table(Table::with_capacity(array, hash)))
    }

    /// Release a slot, running any userdata destructor
    pub(super) fn free_slot(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        let Some(mut object) = slot.object.take() else {
            return;
        };
        let handle = Handle {
            index: index as u32,
            generation: slot.generation,
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.bytes = self.bytes.saturating_sub(slot.size);
        slot.size = 0;
        self.free.push(index as u32);
        self.objects_freed += 1;

        match &mut object {
            Object::Userdata(userdata) => userdata.finalize(),
            Object::String(s) => {
                if self.strings.get(s.as_bytes()) == Some(&handle) {
                    self.strings.remove(s.as_bytes());
                }
            }
            _ => {}
        }
    }

    // ===== Access =====

    #[must_use]
    pub fn is_live(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    #[must_use]
    pub fn get(&self, handle: Handle) -> Option<&Object> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.object.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut Object> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.object.as_mut())
    }

    /// Live object behind a handle taken from a reachable value.
    ///
    /// # Panics
    /// On a stale handle, which means a value escaped the collector's roots.
    #[must_use]
    pub fn object(&self, handle: Handle) -> &Object {
        match self.get(handle) {
            Some(object) => object,
            None => panic!("dangling heap handle {handle:?}"),
        }
    }

    pub fn object_mut(&mut self, handle: Handle) -> &mut Object {
        match self.get_mut(handle) {
            Some(object) => object,
            None => panic!("dangling heap handle {handle:?}"),
        }
    }

    #[must_use]
    pub fn string(&self, handle: Handle) -> &[u8] {
        match self.object(handle) {
            Object::String(s) => s.as_bytes(),
            other => panic!("expected string object, found {}", other.tag()),
        }
    }

    #[must_use]
    pub fn table(&self, handle: Handle) -> &Table {
        match self.object(handle) {
            Object::Table(t) => t,
            other => panic!("expected table object, found {}", other.tag()),
        }
    }

    /// Mutable table access. Callers storing references must also call
    /// [`Heap::barrier`] and [`Heap::resize`].
    pub fn table_mut(&mut self, handle: Handle) -> &mut Table {
        match self.object_mut(handle) {
            Object::Table(t) => t,
            other => panic!("expected table object, found {}", other.tag()),
        }
    }

    #[must_use]
    pub fn function(&self, handle: Handle) -> &Function {
        match self.object(handle) {
            Object::Function(f) => f,
            other => panic!("expected function object, found {}", other.tag()),
        }
    }

    pub fn function_mut(&mut self, handle: Handle) -> &mut Function {
        match self.object_mut(handle) {
            Object::Function(f) => f,
            other => panic!("expected function object, found {}", other.tag()),
        }
    }

    #[must_use]
    pub fn upvalue(&self, handle: Handle) -> Upvalue {
        match self.object(handle) {
            Object::Upvalue(u) => *u,
            other => panic!("expected upvalue object, found {}", other.tag()),
        }
    }

    pub fn set_upvalue(&mut self, handle: Handle, upvalue: Upvalue) {
        match self.object_mut(handle) {
            Object::Upvalue(u) => *u = upvalue,
            other => panic!("expected upvalue object, found {}", other.tag()),
        }
        if let Upvalue::Closed(value) = upvalue {
            self.barrier(handle, value);
        }
    }

    #[must_use]
    pub fn proto(&self, handle: Handle) -> &Rc<LoadedProto> {
        match self.object(handle) {
            Object::Proto(p) => p,
            other => panic!("expected proto object, found {}", other.tag()),
        }
    }

    #[must_use]
    pub fn userdata(&self, handle: Handle) -> &Userdata {
        match self.object(handle) {
            Object::Userdata(u) => u,
            other => panic!("expected userdata object, found {}", other.tag()),
        }
    }

    pub fn userdata_mut(&mut self, handle: Handle) -> &mut Userdata {
        match self.object_mut(handle) {
            Object::Userdata(u) => u,
            other => panic!("expected userdata object, found {}", other.tag()),
        }
    }

    #[must_use]
    pub fn thread(&self, handle: Handle) -> &ThreadObject {
        match self.object(handle) {
            Object::Thread(t) => t,
            other => panic!("expected thread object, found {}", other.tag()),
        }
    }

    pub fn thread_mut(&mut self, handle: Handle) -> &mut ThreadObject {
        match self.object_mut(handle) {
            Object::Thread(t) => t,
            other => panic!("expected thread object, found {}", other.tag()),
        }
    }

    #[must_use]
    pub fn buffer(&self, handle: Handle) -> &Buffer {
        match self.object(handle) {
            Object::Buffer(b) => b,
            other => panic!("expected buffer object, found {}", other.tag()),
        }
    }

    pub fn buffer_mut(&mut self, handle: Handle) -> &mut Buffer {
        match self.object_mut(handle) {
            Object::Buffer(b) => b,
            other => panic!("expected buffer object, found {}", other.tag()),
        }
    }

    // ===== Mutation helpers =====

    /// Raw table store with write barrier and size accounting
    pub fn table_set(&mut self, table: Handle, key: Value, value: Value) -> Result<(), TableError> {
        self.table_mut(table).set(key, value)?;
        self.barrier(table, key);
        self.barrier(table, value);
        self.resize(table);
        Ok(())
    }

    pub fn table_set_int(&mut self, table: Handle, index: usize, value: Value) {
        self.table_mut(table).set_int(index, value);
        self.barrier(table, value);
        self.resize(table);
    }

    pub fn table_set_list(&mut self, table: Handle, start: usize, values: &[Value]) {
        self.table_mut(table).set_list(start, values);
        for &value in values {
            self.barrier(table, value);
        }
        self.resize(table);
    }

    /// Recompute an object's size after it grew or shrank
    pub fn resize(&mut self, handle: Handle) {
        let Some(slot) = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
        else {
            return;
        };
        let new_size = slot.object.as_ref().map_or(0, Object::byte_size);
        let old_size = std::mem::replace(&mut slot.size, new_size);
        if new_size > old_size {
            let grown = new_size - old_size;
            self.bytes += grown;
            self.debt += grown;
            self.total_allocated += grown;
        } else {
            self.bytes = self.bytes.saturating_sub(old_size - new_size);
        }
    }

    // ===== Limits and statistics =====

    #[must_use]
    pub fn config(&self) -> GcConfig {
        self.config
    }

    pub fn set_config(&mut self, config: GcConfig) {
        self.config = config;
        self.threshold = self.threshold.max(config.min_threshold_bytes);
    }

    #[must_use]
    pub fn memory_limit(&self) -> Option<usize> {
        self.memory_limit
    }

    pub fn set_memory_limit(&mut self, limit: Option<usize>) {
        self.memory_limit = limit;
    }

    /// Whether the heap currently exceeds its memory limit
    #[must_use]
    pub fn over_limit(&self) -> bool {
        self.memory_limit.is_some_and(|limit| self.bytes > limit)
    }

    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    #[must_use]
    pub fn phase(&self) -> GcPhase {
        self.phase
    }

    #[must_use]
    pub fn stats(&self) -> GcStats {
        GcStats {
            cycles: self.cycles,
            bytes_allocated: self.total_allocated,
            live_bytes: self.bytes,
            objects_freed: self.objects_freed,
            objects: self.slots.len() - self.free.len(),
            threshold: self.threshold,
            phase: self.phase,
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if let Some(Object::Userdata(userdata)) = &mut slot.object {
                userdata.finalize();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_dedups() {
        let mut heap = Heap::new(GcConfig::default(), None);
        let a = heap.intern(b"hello");
        let b = heap.intern(b"hello");
        let c = heap.intern(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.string(a), b"hello");
    }

    #[test]
    fn test_freed_slot_is_reused_with_new_generation() {
        let mut heap = Heap::new(GcConfig::default(), None);
        let t = heap.new_table(0, 0);
        heap.free_slot(t.index() as usize);
        assert!(!heap.is_live(t));
        let u = heap.new_table(0, 0);
        assert_eq!(u.index(), t.index());
        assert_ne!(u.generation(), t.generation());
        assert!(heap.get(t).is_none());
        assert!(heap.is_live(u));
    }

    #[test]
    fn test_table_growth_is_accounted() {
        let mut heap = Heap::new(GcConfig::default(), None);
        let t = heap.new_table(0, 0);
        let before = heap.bytes();
        for i in 1..=100 {
            heap.table_set_int(t, i, Value::Number(i as f64));
        }
        assert!(heap.bytes() > before);
    }

    #[test]
    fn test_memory_limit() {
        let mut heap = Heap::new(GcConfig::default(), Some(1024));
        assert!(!heap.over_limit());
        heap.alloc(Object::Buffer(vec![0; 4096]));
        assert!(heap.over_limit());
    }

    #[test]
    fn test_destructor_runs_on_drop() {
        use std::cell::Cell;
        let ran = Rc::new(Cell::new(0));
        {
            let mut heap = Heap::new(GcConfig::default(), None);
            let flag = ran.clone();
            heap.alloc(Object::Userdata(Userdata {
                tag: 1,
                data: vec![1, 2, 3],
                destructor: Some(Box::new(move |data| {
                    assert_eq!(data, &[1, 2, 3]);
                    flag.set(flag.get() + 1);
                })),
                metatable: None,
            }));
        }
        assert_eq!(ran.get(), 1);
    }
}
