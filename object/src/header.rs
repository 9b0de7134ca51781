use crate::Value;

const SIZE_BITS: u32 = 32;
const SIZE_MASK: u64 = (1 << SIZE_BITS) - 1;
const BINARY_BIT: u64 = 1 << 32;
const RELOCATED_BIT: u64 = 1 << 33;
const HASH_SHIFT: u32 = 34;

/// Maximum value of the 30-bit identity hash field.
pub const HASH_MASK: u32 = (1 << 30) - 1;

/// The two-word header at the start of every heap object.
///
/// ```text
/// word 0:  [hash:30] [relocated:1] [binary:1] [size:32]
/// word 1:  class — tagged reference, or the forwarding address once
///          the relocated bit is set
/// ```
///
/// `size` counts slots for ordinary objects and bytes for binary objects.
/// The payload follows the header inline.
#[repr(C)]
pub struct ObjectHeader {
    size_and_flags: u64,
    class: Value,
}

const _: () = assert!(size_of::<ObjectHeader>() == 16);

impl ObjectHeader {
    pub fn new(class: Value, size: usize, binary: bool, hash: u32) -> Self {
        debug_assert!(size as u64 <= SIZE_MASK, "object too large: {size}");
        let mut word = size as u64;
        if binary {
            word |= BINARY_BIT;
        }
        word |= ((hash & HASH_MASK) as u64) << HASH_SHIFT;
        Self {
            size_and_flags: word,
            class,
        }
    }

    /// Slot count (ordinary) or byte count (binary).
    #[inline(always)]
    pub fn size(&self) -> usize {
        (self.size_and_flags & SIZE_MASK) as usize
    }

    #[inline(always)]
    pub fn is_binary(&self) -> bool {
        self.size_and_flags & BINARY_BIT != 0
    }

    #[inline(always)]
    pub fn hash(&self) -> u32 {
        (self.size_and_flags >> HASH_SHIFT) as u32 & HASH_MASK
    }

    #[inline(always)]
    pub fn class(&self) -> Value {
        debug_assert!(!self.is_relocated());
        self.class
    }

    #[inline(always)]
    pub fn set_class(&mut self, class: Value) {
        self.class = class;
    }

    /// Address of the class word, for barriered stores. The word doubles as
    /// the forwarding address, so only store while not relocated.
    #[inline(always)]
    pub fn class_slot_ptr(&mut self) -> *mut Value {
        debug_assert!(!self.is_relocated());
        &mut self.class
    }

    // ── Forwarding ─────────────────────────────────────────────────

    #[inline(always)]
    pub fn is_relocated(&self) -> bool {
        self.size_and_flags & RELOCATED_BIT != 0
    }

    /// Turn this header into a forwarding record. The class word now holds
    /// the new address; the old payload is dead.
    #[inline(always)]
    pub fn forward_to(&mut self, target: Value) {
        debug_assert!(!self.is_relocated(), "object forwarded twice");
        self.size_and_flags |= RELOCATED_BIT;
        self.class = target;
    }

    /// The forwarding address written by [`forward_to`](Self::forward_to).
    #[inline(always)]
    pub fn forwarded(&self) -> Value {
        debug_assert!(self.is_relocated());
        self.class
    }

    // ── Layout ─────────────────────────────────────────────────────

    /// Payload bytes following the header, rounded so the allocator's bump
    /// pointer stays 8-byte aligned.
    #[inline(always)]
    pub fn payload_bytes(&self) -> usize {
        if self.is_binary() {
            (self.size() + 7) & !7
        } else {
            self.size() * size_of::<Value>()
        }
    }

    /// Total allocation size of the object, header included.
    #[inline(always)]
    pub fn total_bytes(&self) -> usize {
        size_of::<ObjectHeader>() + self.payload_bytes()
    }
}

impl core::fmt::Debug for ObjectHeader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ObjectHeader")
            .field("size", &self.size())
            .field("binary", &self.is_binary())
            .field("relocated", &self.is_relocated())
            .field("hash", &self.hash())
            .field("class", &self.class)
            .finish()
    }
}
