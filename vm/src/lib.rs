//! The interpreter half of the runtime contract.
//!
//! [`Vm`] ties a [`MemoryManager`] to the image globals and drives bytecoded
//! methods through [`Vm::execute`]. The collector side of the contract lives
//! in the `heap` crate; the code here is what keeps it honest — every live
//! pointer the interpreter holds across an allocation is either a visited
//! root or sitting on the collector's root stack.

pub mod bootstrap;
mod handles;
mod image;
mod interpreter;
mod lookup;
mod primitives;

pub use handles::{Handle, HandleScope};
pub use image::{load_image, parse_image, ImageError};
pub use interpreter::RuntimeError;
pub use lookup::{LookupCache, LOOKUP_CACHE_SIZE};

use heap::{GenerationalHeap, HeapConfig, MemoryManager};
use object::{Globals, Value};

/// Exit conditions of [`Vm::execute`], numbered per the external contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecuteResult {
    Error = 2,
    BadMethod = 3,
    Returned = 4,
    TimeExpired = 5,
    Break = 6,
    NoReturn = 255,
}

/// The virtual machine: a memory manager, the image globals, and the method
/// lookup cache.
///
/// Globals sit behind a `Box` so their slot addresses stay put for
/// static-root registration; the collector rewrites them in place on every
/// flip.
pub struct Vm<M: MemoryManager = GenerationalHeap> {
    pub heap: M,
    globals: Box<Globals>,
    pub(crate) cache: LookupCache,
}

impl Vm<GenerationalHeap> {
    /// Load an image file into a fresh generational heap.
    pub fn from_image_file(
        config: HeapConfig,
        path: &std::path::Path,
    ) -> Result<Self, ImageError> {
        let mut heap = GenerationalHeap::new(config).map_err(ImageError::Heap)?;
        let globals = image::load_image(&mut heap, path)?;
        Ok(Self::new(heap, globals))
    }
}

impl<M: MemoryManager> Vm<M> {
    /// Wrap an already-populated heap, registering every globals slot as a
    /// static root.
    pub fn new(mut heap: M, mut globals: Box<Globals>) -> Self {
        globals.visit_slots(&mut |slot| {
            // SAFETY: the box gives the slot a stable address, and the Drop
            // impl unregisters before the box dies.
            unsafe { heap.register_static_root(slot) }
        });
        Self {
            heap,
            globals,
            cache: LookupCache::new(),
        }
    }

    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    /// Forget every cached method resolution. Must be called whenever any
    /// class's method dictionary changes.
    pub fn flush_method_cache(&mut self) {
        self.cache.flush();
    }

    /// The class of any value, small integers included.
    pub fn class_of(&self, value: Value) -> Value {
        if value.is_small_integer() {
            self.globals.small_int_class
        } else if value.is_ref() {
            // SAFETY: references handed to the interpreter are live objects.
            unsafe { value.as_obj::<object::RawObject>() }.header.class()
        } else {
            self.globals.nil
        }
    }
}

impl<M: MemoryManager> Drop for Vm<M> {
    fn drop(&mut self) {
        let heap = &mut self.heap;
        self.globals.visit_slots(&mut |slot| {
            // SAFETY: registered in `new` and still live.
            unsafe { heap.unregister_static_root(slot) }
        });
    }
}
