//! Incremental tri-color marking and sweeping over the arena

use tracing::trace;

use super::heap::{Color, Heap};
use super::{GcPhase, Handle};
use crate::value::Value;

/// Work units charged per swept slot
const SWEEP_COST: usize = 16;

/// Minimum work charged for traversing one object
const TRAVERSE_COST: usize = 32;

impl Heap {
    /// Whether enough allocation debt has accumulated to run a step
    #[must_use]
    pub fn should_step(&self) -> bool {
        self.debt >= self.config.step_size_bytes
            && (self.phase != GcPhase::Idle || self.bytes >= self.threshold)
    }

    /// Run one bounded increment of collection work.
    ///
    /// `roots` must contain every handle held outside the heap. Returns
    /// `true` when this step finished a cycle.
    pub fn step(&mut self, roots: &[Handle]) -> bool {
        let budget = (self.debt.saturating_mul(self.config.step_multiplier_percent) / 100)
            .max(self.config.step_size_bytes);
        self.debt = 0;

        let mut work = 0;
        while work < budget {
            match self.phase {
                GcPhase::Idle => {
                    if self.bytes < self.threshold {
                        return false;
                    }
                    self.start_cycle(roots);
                }
                GcPhase::Marking => match self.gray.pop() {
                    Some(handle) => work += self.traverse(handle),
                    None => self.atomic(roots),
                },
                GcPhase::Atomic => self.atomic(roots),
                GcPhase::Sweeping => {
                    let batch = ((budget - work) / SWEEP_COST).max(1);
                    work += self.sweep(batch);
                    if self.phase == GcPhase::Idle {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Finish any cycle in progress, then run a complete one
    pub fn full_collect(&mut self, roots: &[Handle]) {
        if self.phase != GcPhase::Idle {
            self.run_to_idle(roots);
        }
        self.start_cycle(roots);
        self.run_to_idle(roots);
        self.debt = 0;
    }

    fn run_to_idle(&mut self, roots: &[Handle]) {
        loop {
            match self.phase {
                GcPhase::Idle => return,
                GcPhase::Marking => {
                    while let Some(handle) = self.gray.pop() {
                        self.traverse(handle);
                    }
                    self.atomic(roots);
                }
                GcPhase::Atomic => self.atomic(roots),
                GcPhase::Sweeping => {
                    self.sweep(usize::MAX);
                }
            }
        }
    }

    fn start_cycle(&mut self, roots: &[Handle]) {
        trace!(bytes = self.bytes, threshold = self.threshold, "gc: begin marking");
        self.phase = GcPhase::Marking;
        self.gray.clear();
        for &root in roots {
            self.mark_handle(root);
        }
    }

    /// Gray a white object; leaves go straight to black
    pub(super) fn mark_handle(&mut self, handle: Handle) {
        let Some(slot) = self.slots.get_mut(handle.index() as usize) else {
            return;
        };
        if slot.generation != handle.generation() {
            return;
        }
        let Some(object) = &slot.object else {
            return;
        };
        if !matches!(slot.color, Color::White0 | Color::White1) {
            return;
        }
        if object.is_leaf() {
            slot.color = Color::Black;
        } else {
            slot.color = Color::Gray;
            self.gray.push(handle);
        }
    }

    /// Blacken an object and gray everything it references
    fn traverse(&mut self, handle: Handle) -> usize {
        let mut refs = std::mem::take(&mut self.scratch);
        let size = {
            let Some(slot) = self.slots.get_mut(handle.index() as usize) else {
                self.scratch = refs;
                return 0;
            };
            slot.color = Color::Black;
            if let Some(object) = &slot.object {
                object.references(&mut refs);
            }
            slot.size
        };
        for target in refs.drain(..) {
            self.mark_handle(target);
        }
        self.scratch = refs;
        size.max(TRAVERSE_COST)
    }

    fn atomic(&mut self, roots: &[Handle]) {
        self.phase = GcPhase::Atomic;
        for &root in roots {
            self.mark_handle(root);
        }
        self.propagate_all();

        // Thread stacks change without barriers, so blackened threads are
        // traversed again now that the mutator is paused.
        let threads = std::mem::take(&mut self.threads);
        for &thread in &threads {
            let black = self
                .slots
                .get(thread.index() as usize)
                .is_some_and(|slot| slot.generation == thread.generation() && slot.color == Color::Black);
            if black {
                self.traverse(thread);
            }
        }
        self.threads = threads;
        self.propagate_all();

        let white = self.white;
        let slots = &self.slots;
        self.strings
            .retain(|_, handle| slots[handle.index() as usize].color != white);

        self.white = white.other_white();
        self.phase = GcPhase::Sweeping;
        self.sweep_cursor = 0;
        trace!(live_strings = self.strings.len(), "gc: atomic phase done, sweeping");
    }

    fn propagate_all(&mut self) {
        while let Some(handle) = self.gray.pop() {
            self.traverse(handle);
        }
    }

    /// Sweep up to `max_slots` slots, returning work done
    fn sweep(&mut self, max_slots: usize) -> usize {
        let dead = self.white.other_white();
        let current = self.white;
        let end = self.sweep_cursor.saturating_add(max_slots).min(self.slots.len());
        let start = self.sweep_cursor;

        for index in start..end {
            let slot = &mut self.slots[index];
            if slot.object.is_none() {
                continue;
            }
            if slot.color == dead {
                self.free_slot(index);
            } else {
                slot.color = current;
            }
        }
        self.sweep_cursor = end;

        if self.sweep_cursor >= self.slots.len() {
            self.finish_cycle();
        }
        (end - start) * SWEEP_COST
    }

    fn finish_cycle(&mut self) {
        let slots = &self.slots;
        self.threads.retain(|thread| {
            slots
                .get(thread.index() as usize)
                .is_some_and(|slot| slot.generation == thread.generation() && slot.object.is_some())
        });
        let target = self.bytes / 100 * self.config.pause_percent;
        self.threshold = target.max(self.config.min_threshold_bytes);
        self.phase = GcPhase::Idle;
        self.cycles += 1;
        trace!(
            live = self.bytes,
            threshold = self.threshold,
            cycles = self.cycles,
            "gc: cycle complete"
        );
    }

    /// Forward barrier: storing `value` into a black `container` while
    /// marking grays the value so it cannot be missed.
    pub fn barrier(&mut self, container: Handle, value: Value) {
        if let Some(target) = value.handle() {
            self.barrier_handle(container, target);
        }
    }

    pub fn barrier_handle(&mut self, container: Handle, target: Handle) {
        if !matches!(self.phase, GcPhase::Marking | GcPhase::Atomic) {
            return;
        }
        let black = self
            .slots
            .get(container.index() as usize)
            .is_some_and(|slot| slot.color == Color::Black);
        if black {
            self.mark_handle(target);
        }
    }

    /// Whether an object survived marking so far; used by tests and stats
    #[must_use]
    pub fn is_marked(&self, handle: Handle) -> bool {
        self.slots
            .get(handle.index() as usize)
            .is_some_and(|slot| matches!(slot.color, Color::Gray | Color::Black))
    }
}

#[cfg(test)]
mod tests {
    use crate::gc::{GcConfig, GcPhase, Heap};
    use crate::value::{Object, Upvalue, Value};

    fn heap() -> Heap {
        Heap::new(
            GcConfig {
                min_threshold_bytes: 0,
                ..GcConfig::default()
            },
            None,
        )
    }

    #[test]
    fn test_unreachable_objects_are_freed() {
        let mut heap = heap();
        let kept = heap.new_table(0, 0);
        let dropped = heap.new_table(0, 0);
        let child = heap.intern(b"child");
        heap.table_set(kept, Value::Number(1.0), Value::String(child)).unwrap();

        heap.full_collect(&[kept]);
        assert!(heap.is_live(kept));
        assert!(heap.is_live(child));
        assert!(!heap.is_live(dropped));
        assert_eq!(heap.stats().cycles, 1);
    }

    #[test]
    fn test_cycles_are_collected() {
        let mut heap = heap();
        let a = heap.new_table(0, 0);
        let b = heap.new_table(0, 0);
        heap.table_set(a, Value::Number(1.0), Value::Table(b)).unwrap();
        heap.table_set(b, Value::Number(1.0), Value::Table(a)).unwrap();
        heap.full_collect(&[]);
        assert!(!heap.is_live(a));
        assert!(!heap.is_live(b));
    }

    #[test]
    fn test_dead_strings_leave_intern_table() {
        let mut heap = heap();
        let s = heap.intern(b"temp");
        heap.full_collect(&[]);
        assert!(!heap.is_live(s));
        let again = heap.intern(b"temp");
        assert!(heap.is_live(again));
        assert_eq!(heap.string(again), b"temp");
    }

    #[test]
    fn test_barrier_keeps_value_stored_into_black_table() {
        let mut heap = heap();
        let root = heap.new_table(0, 0);
        heap.table_set(root, Value::Number(1.0), Value::Boolean(true)).unwrap();

        // Begin a cycle and blacken the root without finishing
        heap.start_cycle(&[root]);
        while let Some(h) = heap.gray.pop() {
            heap.traverse(h);
        }
        assert_eq!(heap.phase(), GcPhase::Marking);

        let late = heap.new_table(0, 0);
        heap.table_set(root, Value::Number(2.0), Value::Table(late)).unwrap();
        heap.full_collect(&[root]);
        assert!(heap.is_live(late));
    }

    #[test]
    fn test_objects_allocated_while_sweeping_survive() {
        let mut heap = heap();
        let root = heap.new_table(0, 0);
        for _ in 0..64 {
            heap.new_table(4, 4);
        }
        heap.start_cycle(&[root]);
        heap.run_marking_for_test(&[root]);
        assert_eq!(heap.phase(), GcPhase::Sweeping);
        let fresh = heap.new_table(0, 0);
        while heap.phase() != GcPhase::Idle {
            heap.sweep(8);
        }
        assert!(heap.is_live(fresh));
        assert!(heap.is_live(root));
    }

    #[test]
    fn test_closed_upvalue_keeps_value() {
        let mut heap = heap();
        let s = heap.intern(b"captured");
        let cell = heap.alloc(Object::Upvalue(Upvalue::Closed(Value::String(s))));
        heap.full_collect(&[cell]);
        assert!(heap.is_live(s));
    }

    #[test]
    fn test_incremental_steps_finish_a_cycle() {
        let mut heap = heap();
        let root = heap.new_table(0, 0);
        for i in 0..1000 {
            let t = heap.new_table(0, 0);
            if i % 2 == 0 {
                heap.table_set_int(root, i / 2 + 1, Value::Table(t));
            }
        }
        let mut finished = false;
        for _ in 0..10_000 {
            heap.debt = heap.config.step_size_bytes;
            if heap.step(&[root]) {
                finished = true;
                break;
            }
        }
        assert!(finished);
        assert_eq!(heap.stats().objects, 501);
    }

    impl Heap {
        fn run_marking_for_test(&mut self, roots: &[crate::gc::Handle]) {
            self.propagate_all();
            self.atomic(roots);
        }
    }
}
