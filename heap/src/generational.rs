use std::collections::HashSet;
use std::ptr;
use std::time::Instant;

use object::{ObjectHeader, RawObject, Value, HASH_MASK};

use crate::semispace::{
    move_object, scan_copied, Buffer, BumpRegion, RootRegistry, ACTIVE_POISON,
    OLD_POISON,
};
use crate::{
    CollectorStats, HeapConfig, HeapError, MemoryManager, RootProvider,
};

/// Generational refinement of the two-space collector.
///
/// The lower half holds the young generation and takes every allocation;
/// the upper half accumulates promoted survivors. Old→young edges live in
/// the crossgen set, maintained by the write barrier, so a young collection
/// traces only roots plus that set.
///
/// A young collection (`left-to-right`) promotes survivors into the old
/// half. When old free space drops under an eighth of the heap, a full
/// collection (`right-to-left` plus a full-traced refill) compacts the old
/// generation and leaves the young half empty again.
pub struct GenerationalHeap {
    buffer: Buffer,
    half: usize,
    young_cursor: *mut u8,
    old_cursor: *mut u8,
    roots: RootRegistry,
    crossgen: HashSet<*mut Value>,
    stats: CollectorStats,
    hash_counter: u32,
}

impl GenerationalHeap {
    pub fn new(config: HeapConfig) -> Result<Self, HeapError> {
        config.validate()?;
        let buffer = Buffer::new(config.heap_size)?;
        let half = config.heap_size / 2;
        let young_cursor = buffer.base();
        let old_cursor = buffer.base().wrapping_add(half);
        Ok(Self {
            buffer,
            half,
            young_cursor,
            old_cursor,
            roots: RootRegistry::new(),
            crossgen: HashSet::new(),
            stats: CollectorStats::default(),
            hash_counter: 0,
        })
    }

    #[inline(always)]
    fn young_base(&self) -> *mut u8 {
        self.buffer.base()
    }

    #[inline(always)]
    fn old_base(&self) -> *mut u8 {
        self.buffer.base().wrapping_add(self.half)
    }

    #[inline(always)]
    fn heap_end(&self) -> *mut u8 {
        self.buffer.base().wrapping_add(self.buffer.len())
    }

    #[inline(always)]
    fn in_young_half(&self, addr: usize) -> bool {
        addr >= self.young_base() as usize && addr < self.old_base() as usize
    }

    #[inline(always)]
    fn in_heap(&self, addr: usize) -> bool {
        addr >= self.buffer.base() as usize && addr < self.heap_end() as usize
    }

    /// Free bytes remaining in the young half.
    pub fn young_free(&self) -> usize {
        self.old_base() as usize - self.young_cursor as usize
    }

    /// Free bytes remaining in the old half.
    pub fn old_free(&self) -> usize {
        self.heap_end() as usize - self.old_cursor as usize
    }

    /// Whether `value` currently lives in the young generation.
    pub fn is_young(&self, value: Value) -> bool {
        value.is_ref() && self.in_young_half(value.raw() as usize)
    }

    /// Whether `value` currently lives in the old generation.
    pub fn is_old(&self, value: Value) -> bool {
        value.is_ref() && {
            let addr = value.raw() as usize;
            self.in_heap(addr) && !self.in_young_half(addr)
        }
    }

    /// Whether the crossgen set holds `slot`.
    pub fn crossgen_contains(&self, slot: *mut Value) -> bool {
        self.crossgen.contains(&slot)
    }

    pub fn crossgen_len(&self) -> usize {
        self.crossgen.len()
    }

    fn next_hash(&mut self) -> u32 {
        self.hash_counter = self.hash_counter.wrapping_add(1) & HASH_MASK;
        self.hash_counter
    }

    fn try_reserve(&mut self, total: usize) -> Option<*mut u8> {
        if self.young_free() >= total {
            let taken = self.young_cursor;
            self.young_cursor = self.young_cursor.wrapping_add(total);
            Some(taken)
        } else {
            None
        }
    }

    fn allocate(
        &mut self,
        class: Value,
        size: usize,
        binary: bool,
        roots: &mut dyn RootProvider,
    ) -> Result<Value, HeapError> {
        let payload = if binary {
            (size + 7) & !7
        } else {
            size * size_of::<Value>()
        };
        let total = size_of::<ObjectHeader>() + payload;

        let mut class = class;
        let mut reserved = self.try_reserve(total);
        if reserved.is_none() {
            self.roots.stack.push(class);
            self.collect_garbage(roots);
            class = self.pop_root();
            reserved = self.try_reserve(total);
        }
        let Some(target) = reserved else {
            return Err(HeapError::Exhausted { requested: total });
        };

        // SAFETY: `target` is a fresh in-bounds reservation of `total` bytes.
        unsafe {
            ptr::write_bytes(target, 0, total);
            let obj = target as *mut RawObject;
            (*obj).header =
                ObjectHeader::new(class, size, binary, self.next_hash());
            Ok(Value::from_ptr(obj))
        }
    }

    /// Young pass: evacuate survivors of the young half into the old half.
    ///
    /// With `full_trace` every registered root is a starting point (used by
    /// the refill after a right-to-left pass); otherwise young survivors are
    /// found through the crossgen set plus the root sets. Either way the
    /// young half ends empty and poisoned, and the crossgen set is cleared —
    /// the surviving old→young edges now point at promoted objects.
    fn collect_left_to_right(
        &mut self,
        roots: &mut dyn RootProvider,
        full_trace: bool,
    ) {
        let young_base = self.young_base();
        let from = young_base as usize..self.young_cursor as usize;
        let scan_start = self.old_cursor;
        let mut dst = BumpRegion::new(self.old_cursor, self.heap_end());

        // SAFETY: registered slots are live; the from-range holds only
        // valid young objects.
        unsafe {
            {
                let mut mover = |slot: &mut Value| {
                    *slot = move_object(*slot, &from, &mut dst);
                };
                if !full_trace {
                    for &slot in &self.crossgen {
                        mover(&mut *slot);
                    }
                }
                self.roots.visit(&mut mover);
                roots.visit_roots(&mut mover);
            }
            scan_copied(scan_start, &from, &mut dst);
            self.old_cursor = dst.cursor;
            self.crossgen.clear();
            ptr::write_bytes(young_base, ACTIVE_POISON, self.half);
            self.young_cursor = young_base;
        }

        self.stats.left_to_right += 1;
    }

    /// Full pass: evacuate the old half into the (empty) young half, then
    /// immediately refill the old half with a full-traced left-to-right
    /// pass. Compacts the old generation and leaves the young half free.
    fn collect_right_to_left(&mut self, roots: &mut dyn RootProvider) {
        let started = Instant::now();

        let young_base = self.young_base();
        let old_base = self.old_base();
        let from = old_base as usize..self.old_cursor as usize;
        let mut dst = BumpRegion::new(young_base, old_base);

        // SAFETY: as in collect_left_to_right; the young half is empty at
        // this point, so it can serve as the destination.
        unsafe {
            {
                let mut mover = |slot: &mut Value| {
                    *slot = move_object(*slot, &from, &mut dst);
                };
                self.roots.visit(&mut mover);
                roots.visit_roots(&mut mover);
            }
            scan_copied(young_base, &from, &mut dst);
            ptr::write_bytes(old_base, OLD_POISON, self.half);
            self.old_cursor = old_base;
            // Survivors are parked in the young half until the refill.
            self.young_cursor = dst.cursor;
        }

        self.collect_left_to_right(roots, true);

        self.stats.right_to_left += 1;
        self.stats.right_delay += started.elapsed();
    }
}

impl MemoryManager for GenerationalHeap {
    fn allocate_ordinary(
        &mut self,
        class: Value,
        slot_count: usize,
        roots: &mut dyn RootProvider,
    ) -> Result<Value, HeapError> {
        self.allocate(class, slot_count, false, roots)
    }

    fn allocate_binary(
        &mut self,
        class: Value,
        byte_count: usize,
        roots: &mut dyn RootProvider,
    ) -> Result<Value, HeapError> {
        self.allocate(class, byte_count, true, roots)
    }

    fn collect_garbage(&mut self, roots: &mut dyn RootProvider) {
        let started = Instant::now();

        self.collect_left_to_right(roots, false);
        if self.old_free() < self.buffer.len() / 8 {
            self.collect_right_to_left(roots);
        }

        self.stats.collections += 1;
        self.stats.total_delay += started.elapsed();
        tracing::debug!(
            target: "heap",
            collections = self.stats.collections,
            left_to_right = self.stats.left_to_right,
            right_to_left = self.stats.right_to_left,
            old_used = self.half - self.old_free(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "generational collection"
        );
    }

    unsafe fn check_root(&mut self, value: Value, slot: *mut Value) {
        let addr = slot as usize;
        if self.in_young_half(addr) {
            // Young slots are traced by every young pass regardless.
            return;
        }
        if !self.in_heap(addr) {
            // Static root or external handle territory; always traced.
            return;
        }

        let previous = *slot;
        let value_young = self.is_young(value);
        let previous_young = self.is_young(previous);
        if value_young && !previous_young {
            self.crossgen.insert(slot);
        } else if !value_young && previous_young {
            self.crossgen.remove(&slot);
        }
    }

    unsafe fn store_slot(&mut self, mut object: Value, index: usize, value: Value) {
        let slot = object.as_obj_mut::<RawObject>().slot_ptr(index);
        self.check_root(value, slot);
        *slot = value;
    }

    unsafe fn store_class(&mut self, mut object: Value, class: Value) {
        let slot = object.as_obj_mut::<RawObject>().header.class_slot_ptr();
        self.check_root(class, slot);
        *slot = class;
    }

    fn root_count(&self) -> usize {
        self.roots.stack.len()
    }

    fn push_root(&mut self, value: Value) {
        self.roots.stack.push(value);
    }

    fn pop_root(&mut self) -> Value {
        match self.roots.stack.pop() {
            Some(value) => value,
            None => panic!("root stack underflow"),
        }
    }

    unsafe fn register_static_root(&mut self, slot: *mut Value) {
        self.roots.static_slots.push(slot);
    }

    unsafe fn unregister_static_root(&mut self, slot: *mut Value) {
        self.roots.remove_static(slot);
    }

    unsafe fn register_external_pointer(&mut self, slot: *mut Value) {
        self.roots.external_slots.push(slot);
    }

    unsafe fn unregister_external_pointer(&mut self, slot: *mut Value) {
        self.roots.remove_external(slot);
    }

    fn collections(&self) -> u64 {
        self.stats.collections
    }

    fn stats(&self) -> &CollectorStats {
        &self.stats
    }

    fn contains(&self, value: Value) -> bool {
        value.is_ref() && self.in_heap(value.raw() as usize)
    }
}
