use heap::MemoryManager;
use object::{Class, Dictionary, Value};

use crate::Vm;

pub const LOOKUP_CACHE_SIZE: usize = 4096;

#[derive(Clone, Copy)]
struct CacheEntry {
    selector: Value,
    class: Value,
    method: Value,
}

const EMPTY_ENTRY: CacheEntry = CacheEntry {
    selector: Value::NULL,
    class: Value::NULL,
    method: Value::NULL,
};

/// Direct-mapped cache over `(selector, receiver class)` resolutions.
///
/// Entries are raw object identities, which a copying collection invalidates
/// wholesale; the cache remembers the collection count it was filled under
/// and flushes itself when that moves. Dictionary mutation must flush
/// explicitly through [`Vm::flush_method_cache`].
pub struct LookupCache {
    entries: Box<[CacheEntry]>,
    epoch: u64,
    hits: u64,
    misses: u64,
}

impl LookupCache {
    pub fn new() -> Self {
        Self {
            entries: vec![EMPTY_ENTRY; LOOKUP_CACHE_SIZE].into_boxed_slice(),
            epoch: 0,
            hits: 0,
            misses: 0,
        }
    }

    pub fn flush(&mut self) {
        self.entries.fill(EMPTY_ENTRY);
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    #[inline(always)]
    fn index(selector: Value, class: Value) -> usize {
        let mix = (selector.raw() ^ class.raw()) >> 3;
        mix as usize & (LOOKUP_CACHE_SIZE - 1)
    }
}

impl Default for LookupCache {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: MemoryManager> Vm<M> {
    /// Walk the class chain for `selector`, starting at `class`.
    pub fn lookup_method(&self, selector: Value, class: Value) -> Option<Value> {
        let mut current = class;
        loop {
            if !current.is_ref() || self.globals.is_nil(current) {
                return None;
            }
            // SAFETY: the chain consists of live class objects.
            let cls = unsafe { current.as_obj::<Class>() };
            if cls.methods.is_ref() {
                let dict = unsafe { cls.methods.as_obj::<Dictionary>() };
                if let Some(method) = unsafe { dict.find(selector) } {
                    return Some(method);
                }
            }
            current = cls.parent;
        }
    }

    /// Cache-accelerated lookup; misses fall back to the chain walk and
    /// install the resolution.
    pub fn lookup_method_in_cache(
        &mut self,
        selector: Value,
        class: Value,
    ) -> Option<Value> {
        let collections = self.heap.collections();
        if self.cache.epoch != collections {
            // Every cached identity predates the last flip.
            self.cache.flush();
            self.cache.epoch = collections;
        }

        let index = LookupCache::index(selector, class);
        let entry = self.cache.entries[index];
        if entry.selector == selector && entry.class == class {
            self.cache.hits += 1;
            return Some(entry.method);
        }

        self.cache.misses += 1;
        let method = self.lookup_method(selector, class)?;
        self.cache.entries[index] = CacheEntry {
            selector,
            class,
            method,
        };
        Some(method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap;
    use heap::{GenerationalHeap, HeapConfig, NoRoots};

    fn test_vm() -> Vm<GenerationalHeap> {
        let heap = GenerationalHeap::new(HeapConfig {
            heap_size: 512 * 1024,
        })
        .expect("heap");
        bootstrap::bootstrap(heap).expect("bootstrap")
    }

    #[test]
    fn lookup_walks_the_parent_chain() {
        let mut vm = test_vm();
        let parent = vm.globals().array_class;
        let child = bootstrap::make_class(&mut vm, "Sorted", parent).unwrap();

        let selector = bootstrap::make_symbol(&mut vm, "sum").unwrap();
        let method = bootstrap::make_method(
            &mut vm,
            selector,
            &[0x21, 0xF2],
            &[],
            4,
            0,
            parent,
        )
        .unwrap();
        bootstrap::install_method(&mut vm, parent, selector, method).unwrap();

        assert_eq!(vm.lookup_method(selector, child), Some(method));
        assert_eq!(vm.lookup_method(selector, parent), Some(method));

        let missing = bootstrap::make_symbol(&mut vm, "absent").unwrap();
        assert_eq!(vm.lookup_method(missing, child), None);
    }

    #[test]
    fn cache_agrees_with_the_chain_walk() {
        let mut vm = test_vm();
        let class = vm.globals().array_class;
        let selector = bootstrap::make_symbol(&mut vm, "first").unwrap();
        let method = bootstrap::make_method(
            &mut vm,
            selector,
            &[0x21, 0xF2],
            &[],
            4,
            0,
            class,
        )
        .unwrap();
        bootstrap::install_method(&mut vm, class, selector, method).unwrap();

        let walked = vm.lookup_method(selector, class);
        let cached = vm.lookup_method_in_cache(selector, class);
        assert_eq!(walked, cached);
        // Second consult must hit.
        let hits_before = vm.cache.hits();
        let _ = vm.lookup_method_in_cache(selector, class);
        assert_eq!(vm.cache.hits(), hits_before + 1);
    }

    #[test]
    fn collection_invalidates_cached_identities() {
        let mut vm = test_vm();
        let class = vm.globals().array_class;
        let selector = bootstrap::make_symbol(&mut vm, "last").unwrap();
        let method = bootstrap::make_method(
            &mut vm,
            selector,
            &[0x21, 0xF2],
            &[],
            4,
            0,
            class,
        )
        .unwrap();
        bootstrap::install_method(&mut vm, class, selector, method).unwrap();

        let before = vm.lookup_method_in_cache(selector, class).unwrap();
        vm.heap.collect_garbage(&mut NoRoots);

        // The globals were rewritten in place; recover the relocated
        // selector through the class's own dictionary.
        let class = vm.globals().array_class;
        let selector = unsafe {
            let cls = class.as_obj::<Class>();
            let dict = cls.methods.as_obj::<Dictionary>();
            dict.keys.as_obj::<object::RawObject>().slot(0)
        };
        let after = vm
            .lookup_method_in_cache(selector, class)
            .expect("method still installed");
        assert!(vm.heap.contains(after));
        assert_ne!(after, before, "stale identity must not survive the flip");
    }
}
