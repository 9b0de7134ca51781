use core::cell::Cell;
use core::marker::PhantomData;

use heap::MemoryManager;
use object::Value;

/// Slots per scope. Enough for any single operation in this VM; pinning
/// past the capacity is a programming error.
pub const HANDLE_CAPACITY: usize = 16;

/// A scope of rooted on-stack handles.
///
/// Each pinned slot's address is registered with the collector as an
/// external pointer on entry and unregistered when the scope drops, so the
/// collector rewrites the slot in place whenever the referent moves. The
/// slots live in a box, keeping their addresses stable even if the scope
/// value itself moves.
pub struct HandleScope<M: MemoryManager> {
    heap: *mut M,
    slots: Box<[Cell<Value>; HANDLE_CAPACITY]>,
    used: Cell<usize>,
}

impl<M: MemoryManager> HandleScope<M> {
    /// # Safety
    ///
    /// The scope must be dropped before `heap` is.
    pub unsafe fn new(heap: &mut M) -> Self {
        Self {
            heap,
            slots: Box::new([const { Cell::new(Value::NULL) }; HANDLE_CAPACITY]),
            used: Cell::new(0),
        }
    }

    /// Root `value` for the lifetime of this scope.
    pub fn pin(&self, value: Value) -> Handle<'_> {
        let used = self.used.get();
        if used == HANDLE_CAPACITY {
            panic!("handle scope overflow");
        }
        let slot = self.slots[used].as_ptr();
        self.used.set(used + 1);
        // SAFETY: the boxed slot outlives the registration, which the Drop
        // impl removes; the heap pointer is live per the `new` contract.
        unsafe {
            *slot = value;
            (*self.heap).register_external_pointer(slot);
        }
        Handle {
            slot,
            _scope: PhantomData,
        }
    }
}

impl<M: MemoryManager> Drop for HandleScope<M> {
    fn drop(&mut self) {
        for index in 0..self.used.get() {
            let slot = self.slots[index].as_ptr();
            // SAFETY: registered in `pin`; the heap outlives the scope.
            unsafe { (*self.heap).unregister_external_pointer(slot) };
        }
    }
}

/// A copyable view of one pinned slot. Reads always observe the slot's
/// current (possibly relocated) value.
#[derive(Clone, Copy)]
pub struct Handle<'scope> {
    slot: *mut Value,
    _scope: PhantomData<&'scope ()>,
}

impl Handle<'_> {
    #[inline(always)]
    pub fn get(&self) -> Value {
        // SAFETY: the slot lives as long as the scope this handle borrows.
        unsafe { *self.slot }
    }

    #[inline(always)]
    pub fn set(&self, value: Value) {
        // SAFETY: as above.
        unsafe { *self.slot = value }
    }
}
