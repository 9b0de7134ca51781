//! Programmatic construction of a minimal core world.
//!
//! Images carry the real class library; this module builds just enough of
//! one in a bare heap for tests, benchmarks, and running hand-assembled
//! methods: the metaclass, the core classes with empty sorted method
//! dictionaries, the singletons, and the selector symbols the inlined
//! binary sends fall back to.

use heap::{HeapError, MemoryManager, NoRoots, RootProvider};
use object::{
    Class, Context, Dictionary, Globals, Method, Process, RawObject, Value,
};

use crate::Vm;

/// Roots held while the core world is wired together. Entries are
/// referenced by index; the collector rewrites the values in place.
struct Seed {
    values: Vec<Value>,
}

impl RootProvider for Seed {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for value in &mut self.values {
            visitor(value);
        }
    }
}

impl Seed {
    fn keep(&mut self, value: Value) -> usize {
        self.values.push(value);
        self.values.len() - 1
    }

    fn get(&self, index: usize) -> Value {
        self.values[index]
    }
}

fn new_object<M: MemoryManager>(
    heap: &mut M,
    seed: &mut Seed,
    class: Option<usize>,
    slots: usize,
) -> Result<usize, HeapError> {
    let class_value = match class {
        Some(index) => seed.get(index),
        None => Value::NULL,
    };
    let object = heap.allocate_ordinary(class_value, slots, seed)?;
    Ok(seed.keep(object))
}

fn new_symbol<M: MemoryManager>(
    heap: &mut M,
    seed: &mut Seed,
    class: usize,
    text: &str,
) -> Result<usize, HeapError> {
    let object = heap.allocate_binary(seed.get(class), text.len(), seed)?;
    let index = seed.keep(object);
    // SAFETY: fresh binary object of exactly `text.len()` bytes.
    unsafe {
        let mut value = seed.get(index);
        value
            .as_obj_mut::<RawObject>()
            .bytes_mut()
            .copy_from_slice(text.as_bytes());
    }
    Ok(index)
}

unsafe fn wire<M: MemoryManager>(
    heap: &mut M,
    seed: &Seed,
    object: usize,
    slot: usize,
    value: usize,
) {
    heap.store_slot(seed.get(object), slot, seed.get(value));
}

/// Build the globals bundle in a bare heap.
pub fn core_globals<M: MemoryManager>(
    heap: &mut M,
) -> Result<Box<Globals>, HeapError> {
    let seed = &mut Seed { values: Vec::new() };

    // The metaclass comes first; every class object, itself included, is an
    // instance of it. The self-reference must land before the next
    // allocation can move anything.
    let class_class = new_object(heap, seed, None, Class::SLOT_COUNT)?;
    // SAFETY: just allocated, not yet movable by anything below.
    unsafe {
        let mut value = seed.get(class_class);
        value
            .as_obj_mut::<RawObject>()
            .header
            .set_class(seed.get(class_class));
    }

    let object_class = new_object(heap, seed, Some(class_class), Class::SLOT_COUNT)?;
    let undefined_class = new_object(heap, seed, Some(class_class), Class::SLOT_COUNT)?;
    let boolean_class = new_object(heap, seed, Some(class_class), Class::SLOT_COUNT)?;
    let integer_class = new_object(heap, seed, Some(class_class), Class::SLOT_COUNT)?;
    let small_int_class = new_object(heap, seed, Some(class_class), Class::SLOT_COUNT)?;
    let array_class = new_object(heap, seed, Some(class_class), Class::SLOT_COUNT)?;
    let string_class = new_object(heap, seed, Some(class_class), Class::SLOT_COUNT)?;
    let block_class = new_object(heap, seed, Some(class_class), Class::SLOT_COUNT)?;
    let context_class = new_object(heap, seed, Some(class_class), Class::SLOT_COUNT)?;
    let method_class = new_object(heap, seed, Some(class_class), Class::SLOT_COUNT)?;
    let dictionary_class = new_object(heap, seed, Some(class_class), Class::SLOT_COUNT)?;
    let process_class = new_object(heap, seed, Some(class_class), Class::SLOT_COUNT)?;

    let nil = new_object(heap, seed, Some(undefined_class), 0)?;
    let true_obj = new_object(heap, seed, Some(boolean_class), 0)?;
    let false_obj = new_object(heap, seed, Some(boolean_class), 0)?;

    // One shared empty array seeds every fresh dictionary; method
    // installation replaces rather than mutates it.
    let empty_array = new_object(heap, seed, Some(array_class), 0)?;

    let wiring = [
        (class_class, "Class", object_class),
        (object_class, "Object", nil),
        (undefined_class, "UndefinedObject", object_class),
        (boolean_class, "Boolean", object_class),
        (integer_class, "Integer", object_class),
        (small_int_class, "SmallInt", integer_class),
        (array_class, "Array", object_class),
        (string_class, "String", object_class),
        (block_class, "Block", object_class),
        (context_class, "Context", object_class),
        (method_class, "Method", object_class),
        (dictionary_class, "Dictionary", object_class),
        (process_class, "Process", object_class),
    ];
    for (class, name, parent) in wiring {
        let name_symbol = new_symbol(heap, seed, string_class, name)?;
        let dictionary =
            new_object(heap, seed, Some(dictionary_class), Dictionary::SLOT_COUNT)?;
        // SAFETY: all operands are rooted through the seed; stores are
        // barriered.
        unsafe {
            wire(heap, seed, dictionary, Dictionary::KEYS_INDEX, empty_array);
            wire(heap, seed, dictionary, Dictionary::VALUES_INDEX, empty_array);
            wire(heap, seed, class, Class::NAME_INDEX, name_symbol);
            wire(heap, seed, class, Class::PARENT_INDEX, parent);
            wire(heap, seed, class, Class::METHODS_INDEX, dictionary);
            heap.store_slot(
                seed.get(class),
                Class::INSTANCE_SIZE_INDEX,
                Value::from_i32(0),
            );
            wire(heap, seed, class, Class::VARIABLES_INDEX, empty_array);
        }
    }

    let less = new_symbol(heap, seed, string_class, "<")?;
    let less_or_equal = new_symbol(heap, seed, string_class, "<=")?;
    let plus = new_symbol(heap, seed, string_class, "+")?;
    let bad_method = new_symbol(heap, seed, string_class, "doesNotUnderstand:")?;

    // A globals dictionary carrying the classes that have no dedicated
    // globals slot.
    let globals_dictionary =
        new_object(heap, seed, Some(dictionary_class), Dictionary::SLOT_COUNT)?;
    // SAFETY: as in the wiring loop above.
    unsafe {
        wire(heap, seed, globals_dictionary, Dictionary::KEYS_INDEX, empty_array);
        wire(heap, seed, globals_dictionary, Dictionary::VALUES_INDEX, empty_array);
    }
    let named = [
        ("Class", class_class),
        ("Dictionary", dictionary_class),
        ("Method", method_class),
        ("Object", object_class),
        ("Process", process_class),
    ];
    for (name, class) in named {
        let name_symbol = new_symbol(heap, seed, string_class, name)?;
        let globals_dictionary_value = seed.get(globals_dictionary);
        let name_symbol_value = seed.get(name_symbol);
        let class_value = seed.get(class);
        dictionary_insert_raw(
            heap,
            seed,
            globals_dictionary_value,
            name_symbol_value,
            class_value,
        )?;
    }

    Ok(Box::new(Globals {
        nil: seed.get(nil),
        true_obj: seed.get(true_obj),
        false_obj: seed.get(false_obj),
        small_int_class: seed.get(small_int_class),
        array_class: seed.get(array_class),
        block_class: seed.get(block_class),
        context_class: seed.get(context_class),
        string_class: seed.get(string_class),
        integer_class: seed.get(integer_class),
        globals_dictionary: seed.get(globals_dictionary),
        initial_method: seed.get(nil),
        binary_selectors: [
            seed.get(less),
            seed.get(less_or_equal),
            seed.get(plus),
        ],
        bad_method_symbol: seed.get(bad_method),
    }))
}

/// Bootstrap a VM over `heap`.
pub fn bootstrap<M: MemoryManager>(mut heap: M) -> Result<Vm<M>, HeapError> {
    let globals = core_globals(&mut heap)?;
    Ok(Vm::new(heap, globals))
}

/// Sorted insert-or-replace into a dictionary's parallel arrays.
///
/// Replacement stores into the existing values array; growth builds new
/// key/value arrays around the insertion point. All operands are kept on
/// the collector's root stack across the allocations, and `extra_roots` is
/// additionally traced.
pub fn dictionary_insert_raw<M: MemoryManager>(
    heap: &mut M,
    extra_roots: &mut dyn RootProvider,
    dictionary: Value,
    key: Value,
    value: Value,
) -> Result<(), HeapError> {
    // The insertion point is an index; it stays valid across relocation.
    let (position, found) = unsafe {
        let dict = dictionary.as_obj::<Dictionary>();
        dict.insertion_point(key)
    };

    if found {
        // SAFETY: `position` indexes the existing values array.
        unsafe {
            let values = dictionary.as_obj::<Dictionary>().values;
            heap.store_slot(values, position, value);
        }
        return Ok(());
    }

    let length = unsafe {
        dictionary
            .as_obj::<Dictionary>()
            .keys
            .as_obj::<RawObject>()
            .header
            .size()
    };

    heap.push_root(dictionary);
    heap.push_root(key);
    heap.push_root(value);
    let new_keys = heap.allocate_ordinary(Value::NULL, length + 1, extra_roots)?;
    heap.push_root(new_keys);
    let new_values =
        heap.allocate_ordinary(Value::NULL, length + 1, extra_roots)?;
    let new_keys = heap.pop_root();
    let value = heap.pop_root();
    let key = heap.pop_root();
    let dictionary = heap.pop_root();

    // SAFETY: every index below is bounded by `length + 1`; the source
    // arrays are re-read after the allocations above.
    unsafe {
        let dict = dictionary.as_obj::<Dictionary>();
        let keys = dict.keys;
        let values = dict.values;
        let array_class = keys.as_obj::<RawObject>().header.class();
        heap.store_class(new_keys, array_class);
        heap.store_class(new_values, array_class);

        for i in 0..position {
            heap.store_slot(new_keys, i, keys.as_obj::<RawObject>().slot(i));
            heap.store_slot(new_values, i, values.as_obj::<RawObject>().slot(i));
        }
        heap.store_slot(new_keys, position, key);
        heap.store_slot(new_values, position, value);
        for i in position..length {
            heap.store_slot(
                new_keys,
                i + 1,
                keys.as_obj::<RawObject>().slot(i),
            );
            heap.store_slot(
                new_values,
                i + 1,
                values.as_obj::<RawObject>().slot(i),
            );
        }

        heap.store_slot(dictionary, Dictionary::KEYS_INDEX, new_keys);
        heap.store_slot(dictionary, Dictionary::VALUES_INDEX, new_values);
    }
    Ok(())
}

/// Allocate a selector symbol. Symbols from this path are compared by text
/// in dictionaries, so interning is not required for lookup correctness.
pub fn make_symbol<M: MemoryManager>(
    vm: &mut Vm<M>,
    text: &str,
) -> Result<Value, HeapError> {
    let class = vm.globals().string_class;
    let mut symbol = vm.heap.allocate_binary(class, text.len(), &mut NoRoots)?;
    // SAFETY: fresh binary object of exactly `text.len()` bytes.
    unsafe {
        symbol
            .as_obj_mut::<RawObject>()
            .bytes_mut()
            .copy_from_slice(text.as_bytes());
    }
    Ok(symbol)
}

/// Look up a class stashed in the globals dictionary by name.
pub fn global_named<M: MemoryManager>(
    vm: &mut Vm<M>,
    name: &str,
) -> Result<Option<Value>, HeapError> {
    let probe = make_symbol(vm, name)?;
    let dictionary = vm.globals().globals_dictionary;
    // SAFETY: the globals dictionary is a live, sorted dictionary.
    Ok(unsafe { dictionary.as_obj::<Dictionary>().find(probe) })
}

/// Fresh array with every slot set to nil.
fn nil_array<M: MemoryManager>(
    vm: &mut Vm<M>,
    length: usize,
) -> Result<Value, HeapError> {
    let array_class = vm.globals().array_class;
    let mut array = vm.heap.allocate_ordinary(array_class, length, &mut NoRoots)?;
    let nil = vm.globals().nil;
    // SAFETY: freshly allocated, untouched by any collection yet.
    unsafe {
        for slot in array.as_obj_mut::<RawObject>().slots_mut() {
            *slot = nil;
        }
    }
    Ok(array)
}

/// Create a class with an empty method dictionary under `parent`.
pub fn make_class<M: MemoryManager>(
    vm: &mut Vm<M>,
    name: &str,
    parent: Value,
) -> Result<Value, HeapError> {
    // SAFETY: the scope drops at the end of this function, well before the
    // heap does.
    let scope = unsafe { crate::HandleScope::new(&mut vm.heap) };
    let parent = scope.pin(parent);

    let name_symbol = make_symbol(vm, name)?;
    let name_symbol = scope.pin(name_symbol);

    let array_class = vm.globals().array_class;
    let empty = vm.heap.allocate_ordinary(array_class, 0, &mut NoRoots)?;
    let empty = scope.pin(empty);

    // The parent's method dictionary tells us the dictionary class.
    let dictionary_class = unsafe {
        let methods = parent.get().as_obj::<Class>().methods;
        methods.as_obj::<RawObject>().header.class()
    };
    let dictionary = vm.heap.allocate_ordinary(
        dictionary_class,
        Dictionary::SLOT_COUNT,
        &mut NoRoots,
    )?;
    let dictionary = scope.pin(dictionary);
    // SAFETY: both operands are pinned; the dictionary slots are in range.
    unsafe {
        vm.heap
            .store_slot(dictionary.get(), Dictionary::KEYS_INDEX, empty.get());
        vm.heap.store_slot(
            dictionary.get(),
            Dictionary::VALUES_INDEX,
            empty.get(),
        );
    }

    let metaclass = vm.class_of(parent.get());
    let class =
        vm.heap
            .allocate_ordinary(metaclass, Class::SLOT_COUNT, &mut NoRoots)?;
    // SAFETY: `class` is fresh; every pinned operand is current.
    unsafe {
        vm.heap
            .store_slot(class, Class::NAME_INDEX, name_symbol.get());
        vm.heap.store_slot(class, Class::PARENT_INDEX, parent.get());
        vm.heap
            .store_slot(class, Class::METHODS_INDEX, dictionary.get());
        vm.heap.store_slot(
            class,
            Class::INSTANCE_SIZE_INDEX,
            Value::from_i32(0),
        );
        vm.heap.store_slot(class, Class::VARIABLES_INDEX, empty.get());
    }
    Ok(class)
}

/// Assemble a method object from raw bytecodes and literals.
pub fn make_method<M: MemoryManager>(
    vm: &mut Vm<M>,
    selector: Value,
    bytecodes: &[u8],
    literals: &[Value],
    stack_size: i32,
    temporary_size: i32,
    klass: Value,
) -> Result<Value, HeapError> {
    // SAFETY: dropped before the heap.
    let scope = unsafe { crate::HandleScope::new(&mut vm.heap) };
    let selector = scope.pin(selector);
    let klass = scope.pin(klass);
    let mut pinned_literals = Vec::with_capacity(literals.len());
    for &literal in literals {
        pinned_literals.push(scope.pin(literal));
    }

    let array_class = vm.globals().array_class;
    let mut literal_array =
        vm.heap
            .allocate_ordinary(array_class, literals.len(), &mut NoRoots)?;
    // SAFETY: fresh array; the handles read current values.
    unsafe {
        let slots = literal_array.as_obj_mut::<RawObject>().slots_mut();
        for (slot, handle) in slots.iter_mut().zip(&pinned_literals) {
            *slot = handle.get();
        }
    }
    let literal_array = scope.pin(literal_array);

    let string_class = vm.globals().string_class;
    let mut code =
        vm.heap
            .allocate_binary(string_class, bytecodes.len(), &mut NoRoots)?;
    // SAFETY: fresh binary object of exactly the right size.
    unsafe {
        code.as_obj_mut::<RawObject>()
            .bytes_mut()
            .copy_from_slice(bytecodes);
    }
    let code = scope.pin(code);

    let method_class =
        global_named(vm, "Method")?.unwrap_or(vm.globals().nil);
    let method = vm.heap.allocate_ordinary(
        method_class,
        Method::SLOT_COUNT,
        &mut NoRoots,
    )?;
    // SAFETY: `method` is fresh; pinned operands are current.
    unsafe {
        vm.heap
            .store_slot(method, Method::NAME_INDEX, selector.get());
        vm.heap
            .store_slot(method, Method::BYTE_CODES_INDEX, code.get());
        vm.heap
            .store_slot(method, Method::LITERALS_INDEX, literal_array.get());
        vm.heap.store_slot(
            method,
            Method::STACK_SIZE_INDEX,
            Value::from_i32(stack_size),
        );
        vm.heap.store_slot(
            method,
            Method::TEMPORARY_SIZE_INDEX,
            Value::from_i32(temporary_size),
        );
        vm.heap.store_slot(method, Method::KLASS_INDEX, klass.get());
    }
    Ok(method)
}

/// Install `method` under `selector` in `class`'s dictionary, keeping the
/// keys sorted and flushing the lookup cache.
pub fn install_method<M: MemoryManager>(
    vm: &mut Vm<M>,
    class: Value,
    selector: Value,
    method: Value,
) -> Result<(), HeapError> {
    // SAFETY: `class` is a live class object.
    let methods = unsafe { class.as_obj::<Class>() }.methods;
    dictionary_insert_raw(&mut vm.heap, &mut NoRoots, methods, selector, method)?;
    vm.flush_method_cache();
    Ok(())
}

/// Build a runnable process whose bottom context activates `method` with
/// `receiver` as argument zero.
pub fn make_process<M: MemoryManager>(
    vm: &mut Vm<M>,
    method: Value,
    receiver: Value,
    args: &[Value],
) -> Result<Value, HeapError> {
    // SAFETY: dropped before the heap.
    let scope = unsafe { crate::HandleScope::new(&mut vm.heap) };
    let method = scope.pin(method);

    // The activation sizes are inline integers; read them up front.
    let (stack_size, temporary_size) = {
        // SAFETY: `method` is a live method object.
        let method_value = method.get();
        let m = unsafe { method_value.as_obj::<Method>() };
        let read = |value: Value| {
            if value.is_small_integer() {
                // SAFETY: just checked.
                (unsafe { value.as_i32() }).max(0) as usize
            } else {
                0
            }
        };
        (read(m.stack_size), read(m.temporary_size))
    };

    let receiver = scope.pin(receiver);
    let mut pinned_args = Vec::with_capacity(args.len());
    for &arg in args {
        pinned_args.push(scope.pin(arg));
    }

    let array_class = vm.globals().array_class;
    let mut arguments = vm.heap.allocate_ordinary(
        array_class,
        1 + args.len(),
        &mut NoRoots,
    )?;
    // SAFETY: fresh array; handles read current values.
    unsafe {
        let slots = arguments.as_obj_mut::<RawObject>().slots_mut();
        slots[0] = receiver.get();
        for (slot, handle) in slots[1..].iter_mut().zip(&pinned_args) {
            *slot = handle.get();
        }
    }
    let arguments = scope.pin(arguments);

    let stack = nil_array(vm, stack_size)?;
    let stack = scope.pin(stack);
    let temporaries = nil_array(vm, temporary_size)?;
    let temporaries = scope.pin(temporaries);

    let context_class = vm.globals().context_class;
    let mut context = vm.heap.allocate_ordinary(
        context_class,
        Context::SLOT_COUNT,
        &mut NoRoots,
    )?;
    // SAFETY: fresh context; pinned operands are current.
    unsafe {
        let c = context.as_obj_mut::<Context>();
        c.previous = vm.globals().nil;
        c.method = method.get();
        c.arguments = arguments.get();
        c.temporaries = temporaries.get();
        c.stack = stack.get();
        c.stack_top = Value::from_i32(0);
        c.bytecode_pointer = Value::from_i32(0);
    }
    let context = scope.pin(context);

    let process_class =
        global_named(vm, "Process")?.unwrap_or(vm.globals().nil);
    let mut process = vm.heap.allocate_ordinary(
        process_class,
        Process::SLOT_COUNT,
        &mut NoRoots,
    )?;
    // SAFETY: fresh process.
    unsafe {
        let p = process.as_obj_mut::<Process>();
        p.context = context.get();
        p.state = Value::from_i32(0);
        p.result = vm.globals().nil;
    }
    Ok(process)
}

#[cfg(test)]
mod tests {
    use super::*;
    use heap::{BakerHeap, GenerationalHeap, HeapConfig};
    use object::Symbol;

    fn test_vm() -> Vm<GenerationalHeap> {
        let heap = GenerationalHeap::new(HeapConfig {
            heap_size: 512 * 1024,
        })
        .expect("heap");
        bootstrap(heap).expect("bootstrap")
    }

    #[test]
    fn core_world_is_wired() {
        let vm = test_vm();
        let globals = vm.globals();
        assert!(globals.nil.is_ref());
        assert_ne!(globals.nil, globals.true_obj);
        assert_ne!(globals.true_obj, globals.false_obj);

        // Small integers answer the SmallInt class, whose chain reaches
        // Integer and then Object.
        let small = vm.class_of(Value::from_i32(3));
        assert_eq!(small, globals.small_int_class);
        let integer = unsafe { small.as_obj::<Class>() }.parent;
        assert_eq!(integer, globals.integer_class);
        let object = unsafe { integer.as_obj::<Class>() }.parent;
        let top = unsafe { object.as_obj::<Class>() }.parent;
        assert_eq!(top, globals.nil);
    }

    #[test]
    fn selector_symbols_carry_their_text() {
        let vm = test_vm();
        let plus = vm.globals().binary_selectors[2];
        let sym = unsafe { plus.as_obj::<Symbol>() };
        assert_eq!(unsafe { sym.text() }, b"+");
        let dnu = vm.globals().bad_method_symbol;
        let sym = unsafe { dnu.as_obj::<Symbol>() };
        assert_eq!(unsafe { sym.text() }, b"doesNotUnderstand:");
    }

    #[test]
    fn globals_dictionary_resolves_names() {
        let mut vm = test_vm();
        let found = global_named(&mut vm, "Method").unwrap();
        assert!(found.is_some());
        assert!(global_named(&mut vm, "NoSuchClass").unwrap().is_none());
    }

    #[test]
    fn installed_methods_keep_dictionary_sorted() {
        let mut vm = test_vm();
        let class = vm.globals().array_class;
        for name in ["zebra", "alpha", "middle", "beta"] {
            let selector = make_symbol(&mut vm, name).unwrap();
            let method = make_method(
                &mut vm,
                selector,
                &[0x21, 0xF2],
                &[],
                4,
                0,
                class,
            )
            .unwrap();
            install_method(&mut vm, class, selector, method).unwrap();
        }

        let dict =
            unsafe { class.as_obj::<Class>().methods.as_obj::<Dictionary>() };
        let keys = unsafe { dict.keys.as_obj::<RawObject>() };
        assert_eq!(keys.header.size(), 4);
        let mut texts = Vec::new();
        for i in 0..4 {
            let key = unsafe { keys.slot(i) };
            let sym = unsafe { key.as_obj::<Symbol>() };
            texts.push(unsafe { sym.text() }.to_vec());
        }
        let mut sorted = texts.clone();
        sorted.sort();
        assert_eq!(texts, sorted, "keys must stay ordered for binary search");

        // Every installed selector resolves.
        for name in ["zebra", "alpha", "middle", "beta"] {
            let probe = make_symbol(&mut vm, name).unwrap();
            assert!(vm.lookup_method(probe, class).is_some());
        }
    }

    #[test]
    fn reinstalling_a_selector_replaces_the_method() {
        let mut vm = test_vm();
        let class = vm.globals().array_class;
        let selector = make_symbol(&mut vm, "size").unwrap();
        let first =
            make_method(&mut vm, selector, &[0x21, 0xF2], &[], 4, 0, class)
                .unwrap();
        install_method(&mut vm, class, selector, first).unwrap();
        let second =
            make_method(&mut vm, selector, &[0x20, 0xF2], &[], 4, 0, class)
                .unwrap();
        install_method(&mut vm, class, selector, second).unwrap();

        assert_eq!(vm.lookup_method(selector, class), Some(second));
        let dict =
            unsafe { class.as_obj::<Class>().methods.as_obj::<Dictionary>() };
        let keys = unsafe { dict.keys.as_obj::<RawObject>() };
        assert_eq!(keys.header.size(), 1, "replacement must not grow");
    }

    #[test]
    fn bootstrap_works_over_the_plain_baker_collector() {
        let heap = BakerHeap::new(HeapConfig {
            heap_size: 512 * 1024,
        })
        .expect("heap");
        let vm = bootstrap(heap).expect("bootstrap");
        assert!(vm.globals().nil.is_ref());
    }

    #[test]
    fn bootstrapped_world_survives_collections() {
        let heap = GenerationalHeap::new(HeapConfig {
            heap_size: 64 * 1024,
        })
        .expect("heap");
        let mut vm = bootstrap(heap).expect("bootstrap");

        // Churn the young space until several collections have moved the
        // whole world through both halves.
        while vm.heap.collections() < 4 {
            let _ = vm
                .heap
                .allocate_ordinary(Value::NULL, 256, &mut heap::NoRoots)
                .expect("churn allocation");
        }

        let small = vm.class_of(Value::from_i32(1));
        assert_eq!(small, vm.globals().small_int_class);
        let integer = unsafe { small.as_obj::<Class>() }.parent;
        assert_eq!(integer, vm.globals().integer_class);
        assert!(global_named(&mut vm, "Method").unwrap().is_some());
    }
}
