use core::fmt;

use bytecode::{BinaryOp, DecodeError, Instruction, UnaryOp};
use heap::{HeapError, MemoryManager, RootProvider};
use object::{
    Block, Context, Method, Process, RawObject, Symbol, Value,
};

use crate::primitives::PrimitiveOutcome;
use crate::{ExecuteResult, Vm};

// ── Errors ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum RuntimeError {
    /// Lookup failed and `doesNotUnderstand:` is unavailable too.
    MethodNotFound { selector: String },
    /// A non-local return whose creating context already returned.
    NonLocalReturnTargetGone,
    BadOpcode(DecodeError),
    InvalidConstant { constant: u8 },
    HeapExhausted(HeapError),
    StackOverflow,
    StackUnderflow,
    OutOfRange { what: &'static str, index: usize },
    NotAnObject { what: &'static str },
    ExpectedInteger { what: &'static str },
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MethodNotFound { selector } => {
                write!(f, "message not understood: #{selector}")
            }
            Self::NonLocalReturnTargetGone => {
                write!(f, "non-local return target already returned")
            }
            Self::BadOpcode(err) => write!(f, "{err}"),
            Self::InvalidConstant { constant } => {
                write!(f, "push of unknown constant {constant}")
            }
            Self::HeapExhausted(err) => write!(f, "{err}"),
            Self::StackOverflow => write!(f, "operand stack overflow"),
            Self::StackUnderflow => write!(f, "operand stack underflow"),
            Self::OutOfRange { what, index } => {
                write!(f, "{what} index {index} out of range")
            }
            Self::NotAnObject { what } => {
                write!(f, "{what} is not a heap object")
            }
            Self::ExpectedInteger { what } => {
                write!(f, "{what} is not a small integer")
            }
        }
    }
}

impl From<DecodeError> for RuntimeError {
    fn from(err: DecodeError) -> Self {
        Self::BadOpcode(err)
    }
}

impl From<HeapError> for RuntimeError {
    fn from(err: HeapError) -> Self {
        Self::HeapExhausted(err)
    }
}

// ── Interpreter state ─────────────────────────────────────────────────

pub(crate) enum Flow {
    Continue,
    Returned,
    Break,
}

/// The two values the interpreter keeps across an instruction. Everything
/// else is re-derived from the context, so a collection at any allocation
/// point can never leave a stale pointer live.
pub(crate) struct ExecState {
    pub process: Value,
    pub context: Value,
}

pub(crate) struct ExecRoots<'a> {
    process: &'a mut Value,
    context: &'a mut Value,
}

impl RootProvider for ExecRoots<'_> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        visitor(self.process);
        visitor(self.context);
    }
}

// ── Small helpers ─────────────────────────────────────────────────────

fn expect_small(value: Value, what: &'static str) -> Result<i32, RuntimeError> {
    if value.is_small_integer() {
        // SAFETY: just checked.
        Ok(unsafe { value.as_i32() })
    } else {
        Err(RuntimeError::ExpectedInteger { what })
    }
}

/// Checked read of slot `index` of an ordinary object.
fn load_indexed(
    object: Value,
    index: usize,
    what: &'static str,
) -> Result<Value, RuntimeError> {
    if !object.is_ref() {
        return Err(RuntimeError::NotAnObject { what });
    }
    // SAFETY: references reaching the interpreter are live objects.
    let raw = unsafe { object.as_obj::<RawObject>() };
    if raw.header.is_binary() || index >= raw.header.size() {
        return Err(RuntimeError::OutOfRange { what, index });
    }
    // SAFETY: bounds checked above.
    Ok(unsafe { raw.slot(index) })
}

/// Human-readable selector for spans and errors.
pub(crate) fn selector_text(selector: Value) -> String {
    if selector.is_ref() {
        // SAFETY: selectors are binary symbols in well-formed images; a
        // non-binary value falls through to the Debug rendering below.
        let raw = unsafe { selector.as_obj::<RawObject>() };
        if raw.header.is_binary() {
            let sym = unsafe { selector.as_obj::<Symbol>() };
            return String::from_utf8_lossy(unsafe { sym.text() }).into_owned();
        }
    }
    format!("{selector:?}")
}

unsafe fn set_bytecode_pointer(mut context: Value, pc: usize) {
    context.as_obj_mut::<Context>().bytecode_pointer =
        Value::from_i32(pc as i32);
}

pub(crate) unsafe fn push_stack<M: MemoryManager>(
    heap: &mut M,
    mut context: Value,
    value: Value,
) -> Result<(), RuntimeError> {
    let ctx = context.as_obj::<Context>();
    let top = expect_small(ctx.stack_top, "stack top")? as usize;
    let stack = ctx.stack;
    if !stack.is_ref() {
        return Err(RuntimeError::NotAnObject { what: "operand stack" });
    }
    if top >= stack.as_obj::<RawObject>().header.size() {
        return Err(RuntimeError::StackOverflow);
    }
    heap.store_slot(stack, top, value);
    context.as_obj_mut::<Context>().stack_top =
        Value::from_i32(top as i32 + 1);
    Ok(())
}

pub(crate) unsafe fn pop_stack(
    mut context: Value,
) -> Result<Value, RuntimeError> {
    let ctx = context.as_obj::<Context>();
    let top = expect_small(ctx.stack_top, "stack top")? as usize;
    if top == 0 {
        return Err(RuntimeError::StackUnderflow);
    }
    let value = load_indexed(ctx.stack, top - 1, "operand stack")?;
    context.as_obj_mut::<Context>().stack_top =
        Value::from_i32(top as i32 - 1);
    Ok(value)
}

unsafe fn top_stack(context: Value) -> Result<Value, RuntimeError> {
    let ctx = context.as_obj::<Context>();
    let top = expect_small(ctx.stack_top, "stack top")? as usize;
    if top == 0 {
        return Err(RuntimeError::StackUnderflow);
    }
    load_indexed(ctx.stack, top - 1, "operand stack")
}

// ── The interpreter ───────────────────────────────────────────────────

impl<M: MemoryManager> Vm<M> {
    /// Run `process` for at most `ticks` bytecodes.
    ///
    /// A zero budget suspends immediately; suspension keeps the bytecode
    /// pointer and stack top current in the context chain, so a later call
    /// resumes exactly where this one stopped.
    pub fn execute(&mut self, process: Value, mut ticks: u32) -> ExecuteResult {
        if !process.is_ref() {
            return ExecuteResult::Error;
        }
        // SAFETY: the caller hands in a live process object.
        let raw = unsafe { process.as_obj::<RawObject>() };
        if raw.header.is_binary() || raw.header.size() < Process::SLOT_COUNT {
            return ExecuteResult::Error;
        }
        let context = unsafe { process.as_obj::<Process>() }.context;
        if !context.is_ref() || self.globals.is_nil(context) {
            return ExecuteResult::NoReturn;
        }

        let mut state = ExecState { process, context };
        let result = loop {
            if ticks == 0 {
                break ExecuteResult::TimeExpired;
            }
            ticks -= 1;
            match self.step(&mut state) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Returned) => break ExecuteResult::Returned,
                Ok(Flow::Break) => break ExecuteResult::Break,
                Err(err) => {
                    tracing::error!(target: "interpreter", %err, "process aborted");
                    break match err {
                        RuntimeError::MethodNotFound { .. } => {
                            ExecuteResult::BadMethod
                        }
                        _ => ExecuteResult::Error,
                    };
                }
            }
        };

        self.park(&mut state, result);
        result
    }

    /// Record the suspension point (or the terminal state) in the process.
    fn park(&mut self, state: &mut ExecState, result: ExecuteResult) {
        // SAFETY: process and context stayed rooted through the run.
        unsafe {
            if result != ExecuteResult::Returned {
                self.heap.store_slot(
                    state.process,
                    Process::CONTEXT_INDEX,
                    state.context,
                );
            }
            self.heap.store_slot(
                state.process,
                Process::STATE_INDEX,
                Value::from_i32(result as i32),
            );
        }
    }

    fn step(&mut self, state: &mut ExecState) -> Result<Flow, RuntimeError> {
        let context = state.context;
        let (instruction, next_pc) = {
            // SAFETY: the context chain is rooted and live.
            let ctx = unsafe { context.as_obj::<Context>() };
            if !ctx.method.is_ref() {
                return Err(RuntimeError::NotAnObject { what: "method" });
            }
            let method = unsafe { ctx.method.as_obj::<Method>() };
            if !method.byte_codes.is_ref() {
                return Err(RuntimeError::NotAnObject { what: "bytecodes" });
            }
            let code = unsafe { method.byte_codes.as_obj::<RawObject>() };
            if !code.header.is_binary() {
                return Err(RuntimeError::NotAnObject { what: "bytecodes" });
            }
            let pc = expect_small(ctx.bytecode_pointer, "bytecode pointer")?
                as usize;
            bytecode::decode(unsafe { code.bytes() }, pc)?
        };
        // Committed eagerly: the context alone carries the resume point.
        unsafe { set_bytecode_pointer(context, next_pc) };

        match instruction {
            Instruction::PushInstance { index } => {
                let ctx = unsafe { context.as_obj::<Context>() };
                let receiver = load_indexed(ctx.arguments, 0, "argument")?;
                let value =
                    load_indexed(receiver, index as usize, "instance variable")?;
                unsafe { push_stack(&mut self.heap, context, value)? };
            }

            Instruction::PushArgument { index } => {
                let ctx = unsafe { context.as_obj::<Context>() };
                let value =
                    load_indexed(ctx.arguments, index as usize, "argument")?;
                unsafe { push_stack(&mut self.heap, context, value)? };
            }

            Instruction::PushTemporary { index } => {
                let ctx = unsafe { context.as_obj::<Context>() };
                let value = load_indexed(
                    ctx.temporaries,
                    index as usize,
                    "temporary",
                )?;
                unsafe { push_stack(&mut self.heap, context, value)? };
            }

            Instruction::PushLiteral { index } => {
                let ctx = unsafe { context.as_obj::<Context>() };
                let method = unsafe { ctx.method.as_obj::<Method>() };
                let value =
                    load_indexed(method.literals, index as usize, "literal")?;
                unsafe { push_stack(&mut self.heap, context, value)? };
            }

            Instruction::PushConstant { constant } => {
                let value = match constant {
                    0..=9 => Value::from_i32(constant as i32),
                    bytecode::NIL_CONST => self.globals.nil,
                    bytecode::TRUE_CONST => self.globals.true_obj,
                    bytecode::FALSE_CONST => self.globals.false_obj,
                    constant => {
                        return Err(RuntimeError::InvalidConstant { constant })
                    }
                };
                unsafe { push_stack(&mut self.heap, context, value)? };
            }

            Instruction::AssignInstance { index } => {
                let value = unsafe { top_stack(context)? };
                let ctx = unsafe { context.as_obj::<Context>() };
                let receiver = load_indexed(ctx.arguments, 0, "argument")?;
                // Bounds first; the store goes through the write barrier.
                load_indexed(receiver, index as usize, "instance variable")?;
                unsafe {
                    self.heap.store_slot(receiver, index as usize, value)
                };
            }

            Instruction::AssignTemporary { index } => {
                let value = unsafe { top_stack(context)? };
                let ctx = unsafe { context.as_obj::<Context>() };
                let temporaries = ctx.temporaries;
                load_indexed(temporaries, index as usize, "temporary")?;
                unsafe {
                    self.heap.store_slot(temporaries, index as usize, value)
                };
            }

            Instruction::MarkArguments { count } => {
                self.mark_arguments(state, count as usize)?;
            }

            Instruction::SendMessage { selector_literal } => {
                let ctx = unsafe { context.as_obj::<Context>() };
                let method = unsafe { ctx.method.as_obj::<Method>() };
                let selector = load_indexed(
                    method.literals,
                    selector_literal as usize,
                    "literal",
                )?;
                let arguments = unsafe { pop_stack(context)? };
                self.do_send(state, selector, arguments, None)?;
            }

            Instruction::SendUnary { op } => {
                let value = unsafe { pop_stack(context)? };
                let is_nil = self.globals.is_nil(value);
                let result = match op {
                    UnaryOp::IsNil => self.boolean(is_nil),
                    UnaryOp::NotNil => self.boolean(!is_nil),
                };
                unsafe { push_stack(&mut self.heap, context, result)? };
            }

            Instruction::SendBinary { op } => {
                self.send_binary(state, op)?;
            }

            Instruction::PushBlock {
                argument_location,
                target,
            } => {
                self.push_block(
                    state,
                    argument_location,
                    target as usize,
                    next_pc,
                )?;
            }

            Instruction::DoPrimitive {
                argument_count,
                number,
            } => {
                return self.do_primitive(state, number, argument_count);
            }

            Instruction::SelfReturn => {
                let ctx = unsafe { context.as_obj::<Context>() };
                let receiver = load_indexed(ctx.arguments, 0, "argument")?;
                return self.do_return(state, receiver);
            }

            Instruction::StackReturn => {
                let value = unsafe { pop_stack(context)? };
                return self.do_return(state, value);
            }

            Instruction::BlockReturn => {
                let value = unsafe { pop_stack(context)? };
                return self.block_return(state, value);
            }

            Instruction::Duplicate => {
                let value = unsafe { top_stack(context)? };
                unsafe { push_stack(&mut self.heap, context, value)? };
            }

            Instruction::PopTop => {
                unsafe { pop_stack(context)? };
            }

            Instruction::Branch { target } => {
                unsafe { set_bytecode_pointer(context, target as usize) };
            }

            Instruction::BranchIfTrue { target } => {
                let condition = unsafe { pop_stack(context)? };
                if condition == self.globals.true_obj {
                    unsafe { set_bytecode_pointer(context, target as usize) };
                }
            }

            Instruction::BranchIfFalse { target } => {
                let condition = unsafe { pop_stack(context)? };
                if condition == self.globals.false_obj {
                    unsafe { set_bytecode_pointer(context, target as usize) };
                }
            }

            Instruction::SendToSuper { selector_literal } => {
                let ctx = unsafe { context.as_obj::<Context>() };
                let method = unsafe { ctx.method.as_obj::<Method>() };
                let selector = load_indexed(
                    method.literals,
                    selector_literal as usize,
                    "literal",
                )?;
                // Lookup starts above the class that owns the running method.
                let owner = method.klass;
                if !owner.is_ref() {
                    return Err(RuntimeError::NotAnObject {
                        what: "method owner",
                    });
                }
                let parent =
                    unsafe { owner.as_obj::<object::Class>() }.parent;
                let arguments = unsafe { pop_stack(context)? };
                self.do_send(state, selector, arguments, Some(parent))?;
            }

            Instruction::Breakpoint => return Ok(Flow::Break),
        }

        Ok(Flow::Continue)
    }

    fn boolean(&self, value: bool) -> Value {
        if value {
            self.globals.true_obj
        } else {
            self.globals.false_obj
        }
    }

    // ── Allocation helpers (rooted through ExecRoots) ─────────────────

    pub(crate) fn alloc_ordinary(
        &mut self,
        state: &mut ExecState,
        class: Value,
        slots: usize,
    ) -> Result<Value, RuntimeError> {
        let mut roots = ExecRoots {
            process: &mut state.process,
            context: &mut state.context,
        };
        Ok(self.heap.allocate_ordinary(class, slots, &mut roots)?)
    }

    pub(crate) fn alloc_binary(
        &mut self,
        state: &mut ExecState,
        class: Value,
        bytes: usize,
    ) -> Result<Value, RuntimeError> {
        let mut roots = ExecRoots {
            process: &mut state.process,
            context: &mut state.context,
        };
        Ok(self.heap.allocate_binary(class, bytes, &mut roots)?)
    }

    /// Fresh array with every slot set to nil.
    pub(crate) fn alloc_array_of_nil(
        &mut self,
        state: &mut ExecState,
        length: usize,
    ) -> Result<Value, RuntimeError> {
        let array_class = self.globals.array_class;
        let mut array = self.alloc_ordinary(state, array_class, length)?;
        let nil = self.globals.nil;
        // SAFETY: freshly allocated, still untouched by any collection.
        unsafe {
            for slot in array.as_obj_mut::<RawObject>().slots_mut() {
                *slot = nil;
            }
        }
        Ok(array)
    }

    fn unwind_roots(&mut self, depth: usize) {
        while self.heap.root_count() > depth {
            self.heap.pop_root();
        }
    }

    // ── Compound opcodes ──────────────────────────────────────────────

    fn mark_arguments(
        &mut self,
        state: &mut ExecState,
        count: usize,
    ) -> Result<(), RuntimeError> {
        let array_class = self.globals.array_class;
        let mut array = self.alloc_ordinary(state, array_class, count)?;

        // Re-derive after the allocation; the chain may have moved.
        let context = state.context;
        let ctx = unsafe { context.as_obj::<Context>() };
        let top = expect_small(ctx.stack_top, "stack top")? as usize;
        if top < count {
            return Err(RuntimeError::StackUnderflow);
        }
        let stack = ctx.stack;
        for i in 0..count {
            let value = load_indexed(stack, top - count + i, "operand stack")?;
            // SAFETY: the array is fresh; index < count by construction.
            unsafe { array.as_obj_mut::<RawObject>().slots_mut()[i] = value };
        }
        // Pop the packed values, then push the array in their place.
        self.drop_stack_values(context, count)?;
        unsafe { push_stack(&mut self.heap, context, array)? };
        Ok(())
    }

    fn send_binary(
        &mut self,
        state: &mut ExecState,
        op: BinaryOp,
    ) -> Result<(), RuntimeError> {
        let context = state.context;
        let right = unsafe { pop_stack(context)? };
        let left = unsafe { pop_stack(context)? };

        if left.is_small_integer() && right.is_small_integer() {
            // SAFETY: both just checked.
            let l = unsafe { left.as_i32() } as i64;
            let r = unsafe { right.as_i32() } as i64;
            let result = match op {
                BinaryOp::Less => Some(self.boolean(l < r)),
                BinaryOp::LessOrEqual => Some(self.boolean(l <= r)),
                BinaryOp::Add => {
                    let sum = l + r;
                    if Value::fits_small_integer(sum) {
                        Some(Value::from_i32(sum as i32))
                    } else {
                        // Overflow promotes to a full send.
                        None
                    }
                }
            };
            if let Some(result) = result {
                unsafe { push_stack(&mut self.heap, context, result)? };
                return Ok(());
            }
        }

        // The slow path sends the equivalent selector.
        let depth = self.heap.root_count();
        let result = self.send_binary_slow(state, op, left, right);
        if result.is_err() {
            self.unwind_roots(depth);
        }
        result
    }

    fn send_binary_slow(
        &mut self,
        state: &mut ExecState,
        op: BinaryOp,
        left: Value,
        right: Value,
    ) -> Result<(), RuntimeError> {
        self.heap.push_root(left);
        self.heap.push_root(right);
        let array_class = self.globals.array_class;
        let mut arguments = self.alloc_ordinary(state, array_class, 2)?;
        let right = self.heap.pop_root();
        let left = self.heap.pop_root();
        // SAFETY: fresh array, both slots in range.
        unsafe {
            let slots = arguments.as_obj_mut::<RawObject>().slots_mut();
            slots[0] = left;
            slots[1] = right;
        }
        let selector = self.globals.binary_selectors[op as usize];
        self.do_send(state, selector, arguments, None)
    }

    fn push_block(
        &mut self,
        state: &mut ExecState,
        argument_location: u8,
        target: usize,
        body_start: usize,
    ) -> Result<(), RuntimeError> {
        let block_class = self.globals.block_class;
        let mut block =
            self.alloc_ordinary(state, block_class, Block::SLOT_COUNT)?;

        let context = state.context;
        let ctx = unsafe { context.as_obj::<Context>() };
        let nil = self.globals.nil;
        // SAFETY: the block is fresh; no collection until the next
        // allocation point.
        unsafe {
            let b = block.as_obj_mut::<Block>();
            b.previous = nil;
            b.method = ctx.method;
            b.arguments = ctx.arguments;
            b.temporaries = ctx.temporaries;
            b.stack = nil;
            b.stack_top = Value::from_i32(0);
            b.bytecode_pointer = Value::from_i32(0);
            b.argument_location = Value::from_i32(argument_location as i32);
            b.creating_context = context;
            b.block_bytecode_pointer = Value::from_i32(body_start as i32);
        }

        // Skip the body in the enclosing method, then push the closure.
        unsafe {
            set_bytecode_pointer(context, target);
            push_stack(&mut self.heap, context, block)?;
        }
        Ok(())
    }

    fn do_primitive(
        &mut self,
        state: &mut ExecState,
        number: u8,
        argument_count: u8,
    ) -> Result<Flow, RuntimeError> {
        let depth = self.heap.root_count();
        let outcome = self.call_primitive(state, number, argument_count);
        if outcome.is_err() {
            self.unwind_roots(depth);
        }
        match outcome? {
            PrimitiveOutcome::Success(value) => {
                self.drop_stack_values(state.context, argument_count as usize)?;
                // A successful primitive answers from the current context;
                // the trailing bytecodes are the failure sequence.
                self.do_return(state, value)
            }
            PrimitiveOutcome::ContextSwitch(new_context) => {
                state.context = new_context;
                Ok(Flow::Continue)
            }
            PrimitiveOutcome::Failure => {
                self.drop_stack_values(state.context, argument_count as usize)?;
                let nil = self.globals.nil;
                unsafe { push_stack(&mut self.heap, state.context, nil)? };
                Ok(Flow::Continue)
            }
        }
    }

    fn drop_stack_values(
        &mut self,
        context: Value,
        count: usize,
    ) -> Result<(), RuntimeError> {
        let mut context = context;
        // SAFETY: the context is rooted and live.
        let ctx = unsafe { context.as_obj::<Context>() };
        let top = expect_small(ctx.stack_top, "stack top")? as usize;
        if top < count {
            return Err(RuntimeError::StackUnderflow);
        }
        unsafe {
            context.as_obj_mut::<Context>().stack_top =
                Value::from_i32((top - count) as i32);
        }
        Ok(())
    }

    // ── Sends and returns ─────────────────────────────────────────────

    pub(crate) fn do_send(
        &mut self,
        state: &mut ExecState,
        selector: Value,
        arguments: Value,
        lookup_class: Option<Value>,
    ) -> Result<(), RuntimeError> {
        let depth = self.heap.root_count();
        let result = self.send_inner(state, selector, arguments, lookup_class);
        if result.is_err() {
            self.unwind_roots(depth);
        }
        result
    }

    fn send_inner(
        &mut self,
        state: &mut ExecState,
        selector: Value,
        arguments: Value,
        lookup_class: Option<Value>,
    ) -> Result<(), RuntimeError> {
        let receiver = load_indexed(arguments, 0, "argument")?;
        let class = match lookup_class {
            Some(class) => class,
            None => self.class_of(receiver),
        };

        let mut arguments = arguments;
        let method = match self.lookup_method_in_cache(selector, class) {
            Some(method) => method,
            None => {
                tracing::trace!(
                    target: "interpreter",
                    selector = %selector_text(selector),
                    "lookup failed, trying doesNotUnderstand:"
                );
                let (dnu_method, dnu_arguments) =
                    self.build_does_not_understand(
                        state, selector, arguments,
                    )?;
                arguments = dnu_arguments;
                dnu_method
            }
        };

        self.activate_method(state, method, arguments)
    }

    /// Build the `doesNotUnderstand:` resend: same receiver, the original
    /// selector and argument array packed into a two-element array.
    fn build_does_not_understand(
        &mut self,
        state: &mut ExecState,
        selector: Value,
        arguments: Value,
    ) -> Result<(Value, Value), RuntimeError> {
        let array_class = self.globals.array_class;

        self.heap.push_root(selector);
        self.heap.push_root(arguments);
        let mut pair = self.alloc_ordinary(state, array_class, 2)?;
        let arguments = self.heap.pop_root();
        let selector = self.heap.pop_root();
        // SAFETY: fresh pair.
        unsafe {
            let slots = pair.as_obj_mut::<RawObject>().slots_mut();
            slots[0] = selector;
            slots[1] = arguments;
        }

        let receiver = load_indexed(arguments, 0, "argument")?;
        self.heap.push_root(receiver);
        self.heap.push_root(pair);
        let mut dnu_arguments = self.alloc_ordinary(state, array_class, 2)?;
        let pair = self.heap.pop_root();
        let receiver = self.heap.pop_root();
        // SAFETY: fresh array.
        unsafe {
            let slots = dnu_arguments.as_obj_mut::<RawObject>().slots_mut();
            slots[0] = receiver;
            slots[1] = pair;
        }

        let dnu_selector = self.globals.bad_method_symbol;
        let class = self.class_of(receiver);
        match self.lookup_method_in_cache(dnu_selector, class) {
            Some(method) => Ok((method, dnu_arguments)),
            None => Err(RuntimeError::MethodNotFound {
                selector: selector_text(selector),
            }),
        }
    }

    /// Allocate and enter a fresh activation for `method`.
    fn activate_method(
        &mut self,
        state: &mut ExecState,
        method: Value,
        arguments: Value,
    ) -> Result<(), RuntimeError> {
        let (stack_size, temporary_size) = {
            if !method.is_ref() {
                return Err(RuntimeError::NotAnObject { what: "method" });
            }
            // SAFETY: looked-up methods are live objects.
            let m = unsafe { method.as_obj::<Method>() };
            (
                expect_small(m.stack_size, "method stack size")? as usize,
                expect_small(m.temporary_size, "method temporary size")?
                    as usize,
            )
        };

        self.heap.push_root(method);
        self.heap.push_root(arguments);
        let stack = self.alloc_array_of_nil(state, stack_size)?;
        self.heap.push_root(stack);
        let temporaries = self.alloc_array_of_nil(state, temporary_size)?;
        self.heap.push_root(temporaries);
        let context_class = self.globals.context_class;
        let mut new_context =
            self.alloc_ordinary(state, context_class, Context::SLOT_COUNT)?;
        let temporaries = self.heap.pop_root();
        let stack = self.heap.pop_root();
        let arguments = self.heap.pop_root();
        let method = self.heap.pop_root();

        // SAFETY: the context is fresh; fields are filled before the next
        // allocation point.
        unsafe {
            let c = new_context.as_obj_mut::<Context>();
            c.previous = state.context;
            c.method = method;
            c.arguments = arguments;
            c.temporaries = temporaries;
            c.stack = stack;
            c.stack_top = Value::from_i32(0);
            c.bytecode_pointer = Value::from_i32(0);
        }
        state.context = new_context;
        Ok(())
    }

    /// Return `value` from the current context to its caller.
    pub(crate) fn do_return(
        &mut self,
        state: &mut ExecState,
        value: Value,
    ) -> Result<Flow, RuntimeError> {
        let context = state.context;
        // SAFETY: rooted and live.
        let previous = unsafe { context.as_obj::<Context>() }.previous;
        self.return_into(state, previous, value)
    }

    /// Non-local return: unwind to the creating context's caller.
    fn block_return(
        &mut self,
        state: &mut ExecState,
        value: Value,
    ) -> Result<Flow, RuntimeError> {
        let creating = load_indexed(
            state.context,
            Block::CREATING_CONTEXT_INDEX,
            "block context",
        )?;
        if !creating.is_ref() || self.globals.is_nil(creating) {
            return Err(RuntimeError::NonLocalReturnTargetGone);
        }

        // The target must still be on the active chain; otherwise the send
        // that invoked the block has already returned.
        let mut walker = state.context;
        loop {
            if walker == creating {
                break;
            }
            if !walker.is_ref() || self.globals.is_nil(walker) {
                return Err(RuntimeError::NonLocalReturnTargetGone);
            }
            // SAFETY: chain members are live contexts.
            walker = unsafe { walker.as_obj::<Context>() }.previous;
        }

        // SAFETY: found on the chain, hence live.
        let target = unsafe { creating.as_obj::<Context>() }.previous;
        self.return_into(state, target, value)
    }

    fn return_into(
        &mut self,
        state: &mut ExecState,
        target: Value,
        value: Value,
    ) -> Result<Flow, RuntimeError> {
        if !target.is_ref() || self.globals.is_nil(target) {
            // The bottom context returned: record the result and finish.
            let nil = self.globals.nil;
            // SAFETY: the process stayed rooted through the run.
            unsafe {
                self.heap.store_slot(
                    state.process,
                    Process::RESULT_INDEX,
                    value,
                );
                self.heap.store_slot(
                    state.process,
                    Process::CONTEXT_INDEX,
                    nil,
                );
            }
            state.context = nil;
            return Ok(Flow::Returned);
        }

        state.context = target;
        unsafe { push_stack(&mut self.heap, target, value)? };
        Ok(Flow::Continue)
    }
}
