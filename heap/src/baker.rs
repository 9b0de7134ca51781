use std::ptr;
use std::time::Instant;

use object::{ObjectHeader, RawObject, Value, HASH_MASK};

use crate::semispace::{
    move_object, scan_copied, Buffer, BumpRegion, RootRegistry, ACTIVE_POISON,
};
use crate::{
    CollectorStats, HeapConfig, HeapError, MemoryManager, RootProvider,
};

/// A two-space stop-the-world copying collector.
///
/// Exactly one half is active at a time; allocation bumps a cursor through
/// it. When space runs out the halves flip, every registered root is
/// rewritten through `move_object`, and a Cheney scan drags the rest of the
/// live graph across. The vacated half is poisoned.
pub struct BakerHeap {
    buffer: Buffer,
    half: usize,
    active_is_lower: bool,
    cursor: *mut u8,
    roots: RootRegistry,
    stats: CollectorStats,
    hash_counter: u32,
}

impl BakerHeap {
    pub fn new(config: HeapConfig) -> Result<Self, HeapError> {
        config.validate()?;
        let buffer = Buffer::new(config.heap_size)?;
        let cursor = buffer.base();
        Ok(Self {
            buffer,
            half: config.heap_size / 2,
            active_is_lower: true,
            cursor,
            roots: RootRegistry::new(),
            stats: CollectorStats::default(),
            hash_counter: 0,
        })
    }

    #[inline(always)]
    fn active_base(&self) -> *mut u8 {
        if self.active_is_lower {
            self.buffer.base()
        } else {
            self.buffer.base().wrapping_add(self.half)
        }
    }

    #[inline(always)]
    fn active_end(&self) -> *mut u8 {
        self.active_base().wrapping_add(self.half)
    }

    /// Free bytes remaining in the active half.
    pub fn free_bytes(&self) -> usize {
        self.active_end() as usize - self.cursor as usize
    }

    fn next_hash(&mut self) -> u32 {
        self.hash_counter = self.hash_counter.wrapping_add(1) & HASH_MASK;
        self.hash_counter
    }

    fn try_reserve(&mut self, total: usize) -> Option<*mut u8> {
        if self.free_bytes() >= total {
            let taken = self.cursor;
            self.cursor = self.cursor.wrapping_add(total);
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
}

impl MemoryManager for BakerHeap {
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

        let from_base = self.active_base();
        let from = from_base as usize..self.cursor as usize;

        // Flip: the other half becomes active and empty.
        self.active_is_lower = !self.active_is_lower;
        let to_base = self.active_base();
        let mut dst = BumpRegion::new(to_base, self.active_end());

        // SAFETY: registered slots are live by the registration contract;
        // the from-range holds only valid objects.
        unsafe {
            {
                let mut mover = |slot: &mut Value| {
                    *slot = move_object(*slot, &from, &mut dst);
                };
                self.roots.visit(&mut mover);
                roots.visit_roots(&mut mover);
            }
            scan_copied(to_base, &from, &mut dst);
            self.cursor = dst.cursor;
            ptr::write_bytes(from_base, ACTIVE_POISON, self.half);
        }

        self.stats.collections += 1;
        self.stats.total_delay += started.elapsed();
        tracing::debug!(
            target: "heap",
            collections = self.stats.collections,
            live_bytes = self.cursor as usize - to_base as usize,
            elapsed_us = started.elapsed().as_micros() as u64,
            "baker collection"
        );
    }

    unsafe fn check_root(&mut self, _value: Value, _slot: *mut Value) {
        // One generation; tracing covers every edge.
    }

    unsafe fn store_slot(&mut self, mut object: Value, index: usize, value: Value) {
        let obj = object.as_obj_mut::<RawObject>();
        *obj.slot_ptr(index) = value;
    }

    unsafe fn store_class(&mut self, mut object: Value, class: Value) {
        object.as_obj_mut::<RawObject>().header.set_class(class);
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
        if !value.is_ref() {
            return false;
        }
        let addr = value.raw() as usize;
        let base = self.buffer.base() as usize;
        addr >= base && addr < base + self.buffer.len()
    }
}

impl BakerHeap {
    /// Whether `value` points into the currently active half.
    pub fn in_active_half(&self, value: Value) -> bool {
        if !value.is_ref() {
            return false;
        }
        let addr = value.raw() as usize;
        addr >= self.active_base() as usize && addr < self.active_end() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NoRoots;

    fn small_heap() -> BakerHeap {
        BakerHeap::new(HeapConfig { heap_size: 64 * 1024 }).expect("heap")
    }

    fn alloc(heap: &mut BakerHeap, slots: usize) -> Value {
        heap.allocate_ordinary(Value::NULL, slots, &mut NoRoots)
            .expect("allocation")
    }

    #[test]
    fn allocation_is_zeroed_and_sized() {
        let mut heap = small_heap();
        let obj = alloc(&mut heap, 4);
        let raw = unsafe { obj.as_obj::<RawObject>() };
        assert_eq!(raw.header.size(), 4);
        assert!(!raw.header.is_binary());
        for slot in unsafe { raw.slots() } {
            assert!(slot.is_null());
        }
    }

    #[test]
    fn allocations_do_not_overlap() {
        let mut heap = small_heap();
        let a = alloc(&mut heap, 3);
        let b = alloc(&mut heap, 3);
        let a_end = a.raw() as usize
            + unsafe { a.as_obj::<RawObject>() }.header.total_bytes();
        assert!(b.raw() as usize >= a_end);
    }

    #[test]
    fn collection_moves_static_roots_and_preserves_contents() {
        let mut heap = small_heap();
        let mut root = alloc(&mut heap, 2);
        unsafe {
            heap.store_slot(root, 0, Value::from_i32(17));
            heap.store_slot(root, 1, Value::from_i32(-4));
            heap.register_static_root(&mut root);
        }

        let before = root.raw();
        heap.collect_garbage(&mut NoRoots);
        assert_ne!(root.raw(), before, "flip must relocate the survivor");
        assert!(heap.in_active_half(root));

        let raw = unsafe { root.as_obj::<RawObject>() };
        unsafe {
            assert_eq!(raw.slot(0), Value::from_i32(17));
            assert_eq!(raw.slot(1), Value::from_i32(-4));
        }
        unsafe { heap.unregister_static_root(&mut root) };
    }

    #[test]
    fn aliasing_roots_still_alias_after_collection() {
        let mut heap = small_heap();
        let obj = alloc(&mut heap, 1);
        let mut a = obj;
        let mut b = obj;
        unsafe {
            heap.register_static_root(&mut a);
            heap.register_static_root(&mut b);
        }
        heap.collect_garbage(&mut NoRoots);
        assert_eq!(a, b, "move_object must be idempotent per object");
        unsafe {
            heap.unregister_static_root(&mut a);
            heap.unregister_static_root(&mut b);
        }
    }

    #[test]
    fn unreferenced_objects_are_dropped() {
        let mut heap = small_heap();
        let _garbage = alloc(&mut heap, 64);
        let mut kept = alloc(&mut heap, 1);
        unsafe { heap.register_static_root(&mut kept) };

        let used_before = heap.half - heap.free_bytes();
        heap.collect_garbage(&mut NoRoots);
        let used_after = heap.half - heap.free_bytes();
        assert!(used_after < used_before);
        unsafe { heap.unregister_static_root(&mut kept) };
    }

    #[test]
    fn interior_references_are_rewritten() {
        let mut heap = small_heap();
        let inner = alloc(&mut heap, 1);
        let mut outer = alloc(&mut heap, 1);
        unsafe {
            heap.store_slot(outer, 0, inner);
            heap.register_static_root(&mut outer);
        }

        heap.collect_garbage(&mut NoRoots);
        let moved_inner = unsafe { outer.as_obj::<RawObject>().slot(0) };
        assert!(moved_inner.is_ref());
        assert!(heap.in_active_half(moved_inner));
        unsafe { heap.unregister_static_root(&mut outer) };
    }

    #[test]
    fn root_stack_values_survive() {
        let mut heap = small_heap();
        let obj = alloc(&mut heap, 1);
        heap.push_root(obj);
        heap.collect_garbage(&mut NoRoots);
        let moved = heap.pop_root();
        assert!(heap.in_active_half(moved));
    }

    #[test]
    fn exhaustion_is_an_error_not_a_panic() {
        let mut heap = small_heap();
        // Keep everything alive so collection cannot reclaim.
        let mut live = 0usize;
        loop {
            match heap.allocate_ordinary(Value::NULL, 512, &mut NoRoots) {
                Ok(obj) => {
                    heap.push_root(obj);
                    live += 1;
                }
                Err(HeapError::Exhausted { .. }) => break,
                Err(other) => panic!("unexpected error: {other}"),
            }
            assert!(live < 100_000, "allocation never failed");
        }
    }

    #[test]
    fn allocation_triggers_collection_and_retries() {
        let mut heap = small_heap();
        let mut kept = alloc(&mut heap, 1);
        unsafe { heap.register_static_root(&mut kept) };

        // Fill the active half with garbage, then allocate past the brim.
        while heap.free_bytes() > 600 {
            let _ = alloc(&mut heap, 8);
        }
        let obj = heap
            .allocate_ordinary(Value::NULL, 128, &mut NoRoots)
            .expect("collection should free the garbage");
        assert!(heap.in_active_half(obj));
        assert_eq!(heap.collections(), 1);
        unsafe { heap.unregister_static_root(&mut kept) };
    }
}
