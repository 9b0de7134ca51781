//! Numbered built-in primitives dispatched from the `doPrimitive` opcode.
//!
//! A primitive either succeeds with a value (answered from the current
//! context), switches to a fabricated block context, or fails — in which
//! case the interpreter falls through to the failure bytecodes that follow
//! the primitive instruction.

use std::io::{Read, Write};

use heap::MemoryManager;
use object::{Block, Context, RawObject, Value};

use crate::interpreter::{ExecState, RuntimeError};
use crate::Vm;

pub(crate) enum PrimitiveOutcome {
    Success(Value),
    ContextSwitch(Value),
    Failure,
}

use PrimitiveOutcome::{ContextSwitch, Failure, Success};

/// Read argument `index` of the pending primitive without popping it; the
/// operands stay on the rooted operand stack, so they survive collections
/// triggered by allocating primitives.
fn primitive_arg(
    state: &ExecState,
    argument_count: u8,
    index: u8,
) -> Result<Value, RuntimeError> {
    let context = state.context;
    if !context.is_ref() {
        return Err(RuntimeError::NotAnObject { what: "context" });
    }
    // SAFETY: the context chain is rooted and live.
    let ctx = unsafe { context.as_obj::<Context>() };
    let top = match ctx.stack_top.is_small_integer() {
        // SAFETY: just checked.
        true => (unsafe { ctx.stack_top.as_i32() }) as usize,
        false => {
            return Err(RuntimeError::ExpectedInteger { what: "stack top" })
        }
    };
    let wanted = argument_count as usize;
    if index as usize >= wanted {
        return Err(RuntimeError::OutOfRange {
            what: "primitive argument",
            index: index as usize,
        });
    }
    if top < wanted {
        return Err(RuntimeError::StackUnderflow);
    }
    let stack = ctx.stack;
    if !stack.is_ref() {
        return Err(RuntimeError::NotAnObject { what: "operand stack" });
    }
    let raw = unsafe { stack.as_obj::<RawObject>() };
    let slot = top - wanted + index as usize;
    if slot >= raw.header.size() {
        return Err(RuntimeError::OutOfRange {
            what: "operand stack",
            index: slot,
        });
    }
    // SAFETY: bounds checked above.
    Ok(unsafe { raw.slot(slot) })
}

fn as_small(value: Value) -> Option<i32> {
    if value.is_small_integer() {
        // SAFETY: just checked.
        Some(unsafe { value.as_i32() })
    } else {
        None
    }
}

fn both_small(a: Value, b: Value) -> Option<(i64, i64)> {
    Some((as_small(a)? as i64, as_small(b)? as i64))
}

impl<M: MemoryManager> Vm<M> {
    pub(crate) fn call_primitive(
        &mut self,
        state: &mut ExecState,
        number: u8,
        argument_count: u8,
    ) -> Result<PrimitiveOutcome, RuntimeError> {
        let required: u8 = match number {
            9 => 0,
            2 | 3 | 4 | 8 => 1,
            5 => 3,
            _ => 2,
        };
        if argument_count < required {
            return Ok(Failure);
        }

        let arg = |index: u8| primitive_arg(state, argument_count, index);

        let outcome = match number {
            // identity equality
            1 => Success(self.boolean_value(arg(0)? == arg(1)?)),

            // class of receiver
            2 => Success(self.class_of(arg(0)?)),

            // put character
            3 => match as_small(arg(0)?) {
                Some(code) if (0..=255).contains(&code) => {
                    let byte = [code as u8];
                    match std::io::stdout().write_all(&byte) {
                        Ok(()) => Success(arg(0)?),
                        Err(_) => Failure,
                    }
                }
                _ => Failure,
            },

            // object size
            4 => {
                let receiver = arg(0)?;
                if receiver.is_ref() {
                    // SAFETY: live object.
                    let size = unsafe { receiver.as_obj::<RawObject>() }
                        .header
                        .size();
                    Success(Value::from_i32(size as i32))
                } else {
                    Failure
                }
            }

            // array at:put: (1-based)
            5 => {
                let array = arg(0)?;
                let index = arg(1)?;
                let value = arg(2)?;
                match checked_slot(array, index) {
                    Some(slot) => {
                        // SAFETY: bounds checked; the store is barriered.
                        unsafe { self.heap.store_slot(array, slot, value) };
                        Success(value)
                    }
                    None => Failure,
                }
            }

            // fresh ordinary instance
            7 => {
                let class = arg(0)?;
                match as_small(arg(1)?) {
                    Some(size) if size >= 0 => {
                        let mut instance = self.alloc_ordinary(
                            state,
                            class,
                            size as usize,
                        )?;
                        let nil = self.globals().nil;
                        // SAFETY: fresh object, slots filled before any
                        // further allocation.
                        unsafe {
                            for slot in instance
                                .as_obj_mut::<RawObject>()
                                .slots_mut()
                            {
                                *slot = nil;
                            }
                        }
                        Success(instance)
                    }
                    _ => Failure,
                }
            }

            // block invocation
            8 => self.invoke_block(state, argument_count)?,

            // get character
            9 => {
                let mut byte = [0u8; 1];
                match std::io::stdin().read(&mut byte) {
                    Ok(1) => Success(Value::from_i32(byte[0] as i32)),
                    _ => Success(self.globals().nil),
                }
            }

            // small integer quotient
            10 => match both_small(arg(0)?, arg(1)?) {
                Some((_, 0)) => Failure,
                Some((l, r)) => Success(Value::from_i32((l / r) as i32)),
                None => Failure,
            },

            // small integer remainder
            11 => match both_small(arg(0)?, arg(1)?) {
                Some((_, 0)) => Failure,
                Some((l, r)) => Success(Value::from_i32((l % r) as i32)),
                None => Failure,
            },

            // small integer difference
            12 => match both_small(arg(0)?, arg(1)?) {
                Some((l, r)) if Value::fits_small_integer(l - r) => {
                    Success(Value::from_i32((l - r) as i32))
                }
                _ => Failure,
            },

            // small integer product
            13 => match both_small(arg(0)?, arg(1)?) {
                Some((l, r)) if Value::fits_small_integer(l * r) => {
                    Success(Value::from_i32((l * r) as i32))
                }
                _ => Failure,
            },

            // bit and / bit or
            14 => match both_small(arg(0)?, arg(1)?) {
                Some((l, r)) => Success(Value::from_i32((l & r) as i32)),
                None => Failure,
            },
            15 => match both_small(arg(0)?, arg(1)?) {
                Some((l, r)) => Success(Value::from_i32((l | r) as i32)),
                None => Failure,
            },

            // bit shift, negative shifts right
            16 => match both_small(arg(0)?, arg(1)?) {
                Some((l, r)) if (-31..=31).contains(&r) => {
                    let shifted = if r >= 0 { l << r } else { l >> (-r) };
                    if Value::fits_small_integer(shifted) {
                        Success(Value::from_i32(shifted as i32))
                    } else {
                        Failure
                    }
                }
                _ => Failure,
            },

            // array at: (1-based)
            17 => {
                let array = arg(0)?;
                match checked_slot(array, arg(1)?) {
                    // SAFETY: bounds checked by checked_slot.
                    Some(slot) => Success(unsafe {
                        array.as_obj::<RawObject>().slot(slot)
                    }),
                    None => Failure,
                }
            }

            // byte object at: (1-based)
            18 => {
                let receiver = arg(0)?;
                match (receiver.is_ref(), as_small(arg(1)?)) {
                    (true, Some(index)) if index >= 1 => {
                        // SAFETY: live object.
                        let raw = unsafe { receiver.as_obj::<RawObject>() };
                        let slot = (index - 1) as usize;
                        if raw.header.is_binary()
                            && slot < raw.header.size()
                        {
                            // SAFETY: bounds checked.
                            let byte = unsafe { raw.bytes()[slot] };
                            Success(Value::from_i32(byte as i32))
                        } else {
                            Failure
                        }
                    }
                    _ => Failure,
                }
            }

            // fresh binary instance
            20 => {
                let class = arg(0)?;
                match as_small(arg(1)?) {
                    Some(size) if size >= 0 => Success(self.alloc_binary(
                        state,
                        class,
                        size as usize,
                    )?),
                    _ => Failure,
                }
            }

            // byte object content equality
            21 => {
                let left = arg(0)?;
                let right = arg(1)?;
                if !left.is_ref() || !right.is_ref() {
                    Failure
                } else {
                    // SAFETY: live objects.
                    let l = unsafe { left.as_obj::<RawObject>() };
                    let r = unsafe { right.as_obj::<RawObject>() };
                    if l.header.is_binary() && r.header.is_binary() {
                        let equal = left == right
                            || unsafe { l.bytes() == r.bytes() };
                        Success(self.boolean_value(equal))
                    } else {
                        Failure
                    }
                }
            }

            number => {
                tracing::warn!(target: "interpreter", number, "unknown primitive");
                Failure
            }
        };
        Ok(outcome)
    }

    fn boolean_value(&self, value: bool) -> Value {
        if value {
            self.globals().true_obj
        } else {
            self.globals().false_obj
        }
    }

    /// Fabricate a running context for a block and switch to it.
    ///
    /// The fabricated context shares the creating method's arguments and
    /// temporaries (closure capture is by reference), gets a fresh operand
    /// stack, and answers past the invoking `value` method: its `previous`
    /// is the invoking context's `previous`.
    fn invoke_block(
        &mut self,
        state: &mut ExecState,
        argument_count: u8,
    ) -> Result<PrimitiveOutcome, RuntimeError> {
        let block = primitive_arg(state, argument_count, 0)?;
        if self.class_of(block) != self.globals().block_class {
            return Ok(Failure);
        }
        // SAFETY: class checked; blocks are ordinary objects of full size.
        let raw = unsafe { block.as_obj::<RawObject>() };
        if raw.header.is_binary() || raw.header.size() < Block::SLOT_COUNT {
            return Ok(Failure);
        }

        let stack_size = {
            // SAFETY: size checked above.
            let b = unsafe { block.as_obj::<Block>() };
            if !b.method.is_ref() {
                return Ok(Failure);
            }
            // SAFETY: live method object.
            let method = unsafe { b.method.as_obj::<object::Method>() };
            match as_small(method.stack_size) {
                Some(size) if size >= 0 => size as usize,
                _ => return Ok(Failure),
            }
        };

        let new_stack = self.alloc_array_of_nil(state, stack_size)?;
        self.heap.push_root(new_stack);
        let block_class = self.globals().block_class;
        let mut running =
            self.alloc_ordinary(state, block_class, Block::SLOT_COUNT)?;
        let new_stack = self.heap.pop_root();

        // Both allocations are behind us; re-fetch everything that may
        // have moved.
        let block = primitive_arg(state, argument_count, 0)?;
        let (argument_location, temporaries) = {
            // SAFETY: still a valid block.
            let source = unsafe { block.as_obj::<Block>() };
            // SAFETY: the invoking context is rooted and live.
            let invoking = unsafe { state.context.as_obj::<Context>() };
            // SAFETY: `running` is fresh; filled before the next allocation.
            let b = unsafe { running.as_obj_mut::<Block>() };
            b.previous = invoking.previous;
            b.method = source.method;
            b.arguments = source.arguments;
            b.temporaries = source.temporaries;
            b.stack = new_stack;
            b.stack_top = Value::from_i32(0);
            b.bytecode_pointer = source.block_bytecode_pointer;
            b.argument_location = source.argument_location;
            b.creating_context = source.creating_context;
            b.block_bytecode_pointer = source.block_bytecode_pointer;

            let location = match as_small(source.argument_location) {
                Some(location) if location >= 0 => location as usize,
                _ => return Ok(Failure),
            };
            (location, source.temporaries)
        };

        // Block parameters land in the shared temporaries, which may be in
        // the old generation — the stores must be barriered.
        if !temporaries.is_ref() {
            return Ok(Failure);
        }
        // SAFETY: live array object.
        let temps_len =
            unsafe { temporaries.as_obj::<RawObject>() }.header.size();
        let block_args = argument_count as usize - 1;
        if argument_location + block_args > temps_len {
            return Ok(Failure);
        }
        for i in 0..block_args {
            let value =
                primitive_arg(state, argument_count, (i + 1) as u8)?;
            // SAFETY: bounds checked against the temporaries length.
            unsafe {
                self.heap.store_slot(
                    temporaries,
                    argument_location + i,
                    value,
                )
            };
        }

        Ok(ContextSwitch(running))
    }
}

fn checked_slot(array: Value, index: Value) -> Option<usize> {
    if !array.is_ref() {
        return None;
    }
    let index = as_small(index)?;
    if index < 1 {
        return None;
    }
    // SAFETY: live object.
    let raw = unsafe { array.as_obj::<RawObject>() };
    let slot = (index - 1) as usize;
    if raw.header.is_binary() || slot >= raw.header.size() {
        return None;
    }
    Some(slot)
}
