#![allow(unused)]
extern crate dexopt;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use dexopt::{
    compiler::{Config, PassManager, PassRegistry},
    ir::{CodeBuilder, IROpcode},
    lowering::lower_program,
    model::{AccessFlags, DexClass, DexMethod, Program},
    pool::{DexMethodRef, DexType},
};
use std::hint::black_box;

const CLASSES: usize = 200;
const METHODS_PER_CLASS: usize = 8;

/// A method with dead arithmetic, a StringBuilder chain, a redundant cast and a loop.
fn synthetic_method(class: usize, index: usize) -> DexMethod {
    let sig = format!("LBench{class};.m{index}:(I)Ljava/lang/String;");
    let mut b = CodeBuilder::new(6);
    let head = b.label();
    let done = b.label();
    b.load_param(5)
        .const_int(0, 0)
        .bind(head)
        .if_cmp(IROpcode::IfGe, 0, 5, done)
        .add_lit(IROpcode::AddIntLit, 0, 0, 1)
        .binop(IROpcode::MulInt, 1, 0, 0)
        .goto(head)
        .bind(done)
        .new_instance(2, "Ljava/lang/StringBuilder;")
        .invoke_direct("Ljava/lang/StringBuilder;.<init>:()V", &[2])
        .const_string(3, "bench ")
        .invoke_virtual(
            "Ljava/lang/StringBuilder;.append:(Ljava/lang/String;)Ljava/lang/StringBuilder;",
            &[2, 3],
        )
        .const_string(3, "string")
        .invoke_virtual(
            "Ljava/lang/StringBuilder;.append:(Ljava/lang/String;)Ljava/lang/StringBuilder;",
            &[2, 3],
        )
        .invoke_virtual("Ljava/lang/StringBuilder;.toString:()Ljava/lang/String;", &[2])
        .move_result(IROpcode::MoveResultObject, 4)
        .check_cast(4, 4, "Ljava/lang/String;")
        .ret_object(4);
    DexMethod::new(
        DexMethodRef::parse(&sig).unwrap(),
        AccessFlags::PUBLIC | AccessFlags::STATIC,
    )
    .with_code(b.build())
}

fn synthetic_program() -> Program {
    let classes = (0..CLASSES)
        .map(|c| {
            let mut class = DexClass::new(
                DexType::make(&format!("LBench{c};")),
                Some(DexType::object()),
                AccessFlags::PUBLIC,
            );
            for m in 0..METHODS_PER_CLASS {
                class.add_method(synthetic_method(c, m));
            }
            class
        })
        .collect();
    Program::from_classes(classes)
}

/// Benchmark the default optimization pipeline over a synthetic program
///
/// Every iteration starts from a fresh program so each pass sees unoptimized input.
fn bench_pipeline(c: &mut Criterion) {
    let registry = PassRegistry::with_defaults();
    let passes = [
        "LocalDcePass",
        "PeepholePass",
        "StringSimplificationPass",
        "RemoveRedundantCheckCastsPass",
        "CopyPropagationPass",
        "LocalDcePass",
        "InterDexPass",
    ];

    let mut group = c.benchmark_group("pipeline");
    group.throughput(Throughput::Elements((CLASSES * METHODS_PER_CLASS) as u64));
    group.bench_function("optimize", |b| {
        b.iter_batched(
            synthetic_program,
            |mut program| {
                let mut manager =
                    PassManager::new(&registry, Config::with_passes(&passes)).unwrap();
                manager.run(&mut program).unwrap();
                black_box(program)
            },
            BatchSize::LargeInput,
        );
    });
    group.finish();
}

/// Benchmark building and linearizing the editable CFG of one method body
fn bench_cfg(c: &mut Criterion) {
    let code = synthetic_method(0, 0).code().cloned().unwrap();

    let mut group = c.benchmark_group("cfg");
    group.bench_function("build_clear", |b| {
        b.iter_batched(
            || code.clone(),
            |mut code| {
                code.build_cfg();
                code.clear_cfg();
                black_box(code)
            },
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

/// Benchmark instruction lowering of every method body
fn bench_lowering(c: &mut Criterion) {
    let program = synthetic_program();

    let mut group = c.benchmark_group("lowering");
    group.throughput(Throughput::Elements((CLASSES * METHODS_PER_CLASS) as u64));
    group.bench_function("lower_program", |b| {
        b.iter(|| {
            let lowered = lower_program(black_box(&program)).unwrap();
            black_box(lowered)
        });
    });
    group.finish();
}

criterion_group!(benches, bench_cfg, bench_pipeline, bench_lowering);
criterion_main!(benches);
