use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::Range;
use std::ptr::{self, NonNull};

use object::{RawObject, Value};

use crate::HeapError;

/// Fill pattern for a just-vacated young/active half.
pub(crate) const ACTIVE_POISON: u8 = 0xAA;
/// Fill pattern for a vacated old half during a full collection.
pub(crate) const OLD_POISON: u8 = 0xBB;

// ── Buffer ────────────────────────────────────────────────────────────

/// The single owned byte buffer both semispaces live in.
pub(crate) struct Buffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl Buffer {
    pub fn new(size: usize) -> Result<Self, HeapError> {
        let layout = Layout::from_size_align(size, 16)
            .map_err(|_| HeapError::InvalidConfig("heap size rejected"))?;
        // SAFETY: layout has non-zero size (validated by HeapConfig).
        let raw = unsafe { alloc_zeroed(layout) };
        match NonNull::new(raw) {
            Some(ptr) => Ok(Self { ptr, layout }),
            None => Err(HeapError::InvalidConfig("heap reservation failed")),
        }
    }

    #[inline(always)]
    pub fn base(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // SAFETY: allocated with this layout in `new`.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// ── Copying machinery ─────────────────────────────────────────────────

/// The occupied byte range of the half being evacuated.
pub(crate) type FromRange = Range<usize>;

/// Destination cursor for one copying pass.
pub(crate) struct BumpRegion {
    pub cursor: *mut u8,
    end: *mut u8,
}

impl BumpRegion {
    pub fn new(cursor: *mut u8, end: *mut u8) -> Self {
        Self { cursor, end }
    }

    /// Reserve `bytes` at the cursor.
    ///
    /// Panics when survivors outgrow the destination half — a copying pass
    /// cannot be unwound midway.
    #[inline(always)]
    pub fn reserve(&mut self, bytes: usize) -> *mut u8 {
        let taken = self.cursor;
        let next = self.cursor as usize + bytes;
        if next > self.end as usize {
            panic!("semispace overflow while copying live objects");
        }
        self.cursor = next as *mut u8;
        taken
    }
}

/// Relocate one reference.
///
/// Small integers, null slots and pointers outside the from-range pass
/// through unchanged; an already-forwarded object yields its forwarding
/// address, so repeated moves agree — object identity is preserved.
///
/// # Safety
///
/// Every reference into `from` must point at a valid object, and `dst` must
/// be disjoint from `from`.
pub(crate) unsafe fn move_object(
    value: Value,
    from: &FromRange,
    dst: &mut BumpRegion,
) -> Value {
    if !value.is_ref() {
        return value;
    }
    let addr = value.raw() as usize;
    if !from.contains(&addr) {
        return value;
    }

    let source = &mut *(addr as *mut RawObject);
    if source.header.is_relocated() {
        return source.header.forwarded();
    }

    let total = source.header.total_bytes();
    let target = dst.reserve(total);
    ptr::copy_nonoverlapping(addr as *const u8, target, total);
    let moved = Value::from_ptr(target as *mut RawObject);
    source.header.forward_to(moved);
    moved
}

/// Cheney walk: chase the destination cursor from `scan`, relocating the
/// class word and every reference slot of each copied object. Terminates
/// when the scan pointer catches the bump pointer.
///
/// # Safety
///
/// `scan` must be the start of the region filled by this pass's
/// [`move_object`] calls into `dst`.
pub(crate) unsafe fn scan_copied(
    mut scan: *mut u8,
    from: &FromRange,
    dst: &mut BumpRegion,
) {
    while scan < dst.cursor {
        let obj = &mut *(scan as *mut RawObject);
        let total = obj.header.total_bytes();

        let class = obj.header.class();
        obj.header.set_class(move_object(class, from, dst));
        if !obj.header.is_binary() {
            for slot in obj.slots_mut() {
                *slot = move_object(*slot, from, dst);
            }
        }

        scan = scan.add(total);
    }
}

// ── Root registry ─────────────────────────────────────────────────────

/// The three externally maintained root sets: registered static slots,
/// scope-guarded external pointers, and the interpreter's root stack.
pub(crate) struct RootRegistry {
    pub static_slots: Vec<*mut Value>,
    pub external_slots: Vec<*mut Value>,
    pub stack: Vec<Value>,
}

impl RootRegistry {
    pub fn new() -> Self {
        Self {
            static_slots: Vec::new(),
            external_slots: Vec::new(),
            stack: Vec::with_capacity(32),
        }
    }

    /// Visit every registered slot and stacked value.
    ///
    /// # Safety
    ///
    /// Every registered slot must still be live.
    pub unsafe fn visit(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for &slot in &self.static_slots {
            visitor(&mut *slot);
        }
        for &slot in &self.external_slots {
            visitor(&mut *slot);
        }
        for value in &mut self.stack {
            visitor(value);
        }
    }

    pub fn remove_static(&mut self, slot: *mut Value) {
        self.static_slots.retain(|&s| s != slot);
    }

    pub fn remove_external(&mut self, slot: *mut Value) {
        self.external_slots.retain(|&s| s != slot);
    }
}
