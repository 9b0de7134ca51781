use criterion::{black_box, criterion_group, criterion_main, Criterion};

use heap::{GenerationalHeap, HeapConfig};
use vm::bootstrap::{self, make_method, make_process, make_symbol};
use vm::{ExecuteResult, HandleScope, Vm};

fn bench_vm() -> Vm<GenerationalHeap> {
    let heap = GenerationalHeap::new(HeapConfig {
        heap_size: 16 * 1024 * 1024,
    })
    .expect("heap");
    bootstrap::bootstrap(heap).expect("bootstrap")
}

fn arithmetic_loop(c: &mut Criterion) {
    let mut vm = bench_vm();
    let selector = make_symbol(&mut vm, "spin").expect("symbol");
    let klass = vm.globals().array_class;
    // push 0, push 1, +, popTop, branch -> 0: pure dispatch pressure.
    let method = make_method(
        &mut vm,
        selector,
        &[0x50, 0x51, 0xB2, 0xF5, 0xF6, 0x00, 0x00],
        &[],
        8,
        0,
        klass,
    )
    .expect("method");
    let nil = vm.globals().nil;
    let process = make_process(&mut vm, method, nil, &[]).expect("process");

    // SAFETY: the scope drops at the end of this function.
    let mut scope = unsafe { HandleScope::new(&mut vm.heap) };
    let process = scope.pin(process);

    c.bench_function("dispatch_100k_bytecodes", |b| {
        b.iter(|| {
            let result = vm.execute(black_box(process.get()), 100_000);
            assert_eq!(result, ExecuteResult::TimeExpired);
        })
    });
}

criterion_group!(benches, arithmetic_loop);
criterion_main!(benches);
