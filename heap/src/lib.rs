//! Moving memory managers for the VM.
//!
//! Two collectors share the same semispace machinery: [`BakerHeap`], a
//! classic two-space stop-the-world copying collector, and
//! [`GenerationalHeap`], which dedicates the lower half to a young
//! generation, promotes survivors into the upper half, and tracks old→young
//! edges through a write barrier.
//!
//! The interpreter reaches both through the [`MemoryManager`] trait. The
//! contract that makes a moving collector safe here: every live pointer is
//! either inside a heap object (traced), in one of the registered root sets
//! (static slots, external pointers, the root stack), or visited by the
//! [`RootProvider`] the caller passes into every allocation.

mod baker;
mod generational;
mod semispace;

pub use baker::BakerHeap;
pub use generational::GenerationalHeap;

use core::fmt;
use std::time::Duration;

use object::Value;

// ── Roots ─────────────────────────────────────────────────────────────

/// Consumers implement this to expose the roots they hold in locals.
///
/// Called at the allocation safepoint; the visitor receives `&mut Value` so
/// the collector can rewrite relocated roots in place.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value));
}

/// Provider for callers that hold no roots of their own.
pub struct NoRoots;

impl RootProvider for NoRoots {
    fn visit_roots(&mut self, _visitor: &mut dyn FnMut(&mut Value)) {}
}

// ── Errors and configuration ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// Allocation still failed after one collection; fatal to the process.
    Exhausted { requested: usize },
    /// The configuration or the underlying reservation was rejected.
    InvalidConfig(&'static str),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { requested } => {
                write!(f, "heap exhausted allocating {requested} bytes")
            }
            Self::InvalidConfig(reason) => {
                write!(f, "invalid heap configuration: {reason}")
            }
        }
    }
}

/// Heap sizing. The buffer is split into two equal halves.
#[derive(Debug, Clone, Copy)]
pub struct HeapConfig {
    /// Total size of both semispaces together, in bytes.
    pub heap_size: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            heap_size: 8 * 1024 * 1024,
        }
    }
}

impl HeapConfig {
    pub fn validate(&self) -> Result<(), HeapError> {
        if self.heap_size < 64 * 1024 {
            return Err(HeapError::InvalidConfig("heap smaller than 64 KiB"));
        }
        if self.heap_size % 16 != 0 {
            return Err(HeapError::InvalidConfig(
                "heap size must be a multiple of 16",
            ));
        }
        Ok(())
    }
}

/// Collection telemetry, cumulative since heap creation.
#[derive(Debug, Clone, Default)]
pub struct CollectorStats {
    pub collections: u64,
    pub left_to_right: u64,
    pub right_to_left: u64,
    pub total_delay: Duration,
    pub right_delay: Duration,
}

// ── The collector seam ────────────────────────────────────────────────

/// The interface the interpreter holds the collector through.
pub trait MemoryManager {
    /// Allocate an ordinary object with `slot_count` zeroed reference slots.
    /// May collect; `class` is kept rooted across the collection.
    fn allocate_ordinary(
        &mut self,
        class: Value,
        slot_count: usize,
        roots: &mut dyn RootProvider,
    ) -> Result<Value, HeapError>;

    /// Allocate a binary object with `byte_count` zeroed payload bytes.
    fn allocate_binary(
        &mut self,
        class: Value,
        byte_count: usize,
        roots: &mut dyn RootProvider,
    ) -> Result<Value, HeapError>;

    /// Stop-the-world collection over every registered root plus `roots`.
    fn collect_garbage(&mut self, roots: &mut dyn RootProvider);

    /// Barrier bookkeeping for an imminent store of `value` into `slot`.
    /// Reads the slot's previous value; call before writing.
    ///
    /// # Safety
    ///
    /// `slot` must be a valid, live reference slot.
    unsafe fn check_root(&mut self, value: Value, slot: *mut Value);

    /// Store `value` into slot `index` of `object`, barrier included.
    ///
    /// # Safety
    ///
    /// `object` must be a valid ordinary heap object with `index` in range.
    unsafe fn store_slot(&mut self, object: Value, index: usize, value: Value);

    /// Rewrite `object`'s class word, barrier included. The class word is a
    /// reference slot like any other as far as generations are concerned.
    ///
    /// # Safety
    ///
    /// `object` must be a valid heap object.
    unsafe fn store_class(&mut self, object: Value, class: Value);

    /// Current depth of the root stack; lets callers restore balance after
    /// an error unwinds a partially rooted operation.
    fn root_count(&self) -> usize;

    /// Push an intermediate onto the root stack around an allocation.
    fn push_root(&mut self, value: Value);

    /// Pop the most recent root, relocated if a collection intervened.
    fn pop_root(&mut self) -> Value;

    /// Keep a persistent out-of-heap slot valid across flips.
    ///
    /// # Safety
    ///
    /// `slot` must stay valid until unregistered (or the heap is dropped).
    unsafe fn register_static_root(&mut self, slot: *mut Value);

    /// # Safety
    ///
    /// `slot` must have been registered.
    unsafe fn unregister_static_root(&mut self, slot: *mut Value);

    /// Register an on-stack handle slot; scope-guarded by the caller.
    ///
    /// # Safety
    ///
    /// `slot` must stay valid until unregistered.
    unsafe fn register_external_pointer(&mut self, slot: *mut Value);

    /// # Safety
    ///
    /// `slot` must have been registered.
    unsafe fn unregister_external_pointer(&mut self, slot: *mut Value);

    /// Monotone count of finished collections. Anyone caching object
    /// identities (the method cache) compares against this.
    fn collections(&self) -> u64;

    fn stats(&self) -> &CollectorStats;

    /// Whether `value` is a reference into this heap's buffer.
    fn contains(&self, value: Value) -> bool;
}
