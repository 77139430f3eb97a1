//! Builders for small programs used across unit tests.

use crate::{
    compiler::{Config, ConfigFiles, EventLog, Metrics, Pass, PassContext, ReservedRefs},
    ir::CodeBuilder,
    model::{AccessFlags, DexClass, DexMethod, Program},
    pool::{DexMethodRef, DexType},
};

/// A method named by `sig` (`LFoo;.bar:(I)V`) whose body is assembled by `body`.
pub(crate) fn method(
    sig: &str,
    access: AccessFlags,
    registers: u32,
    body: impl FnOnce(&mut CodeBuilder),
) -> DexMethod {
    let mut b = CodeBuilder::new(registers);
    body(&mut b);
    DexMethod::new(DexMethodRef::parse(sig).unwrap(), access).with_code(b.build())
}

/// A public static method.
pub(crate) fn static_method(
    sig: &str,
    registers: u32,
    body: impl FnOnce(&mut CodeBuilder),
) -> DexMethod {
    method(sig, AccessFlags::PUBLIC | AccessFlags::STATIC, registers, body)
}

/// A public class extending `java.lang.Object`.
pub(crate) fn class(descriptor: &str) -> DexClass {
    DexClass::new(
        DexType::make(descriptor),
        Some(DexType::object()),
        AccessFlags::PUBLIC,
    )
}

/// A public class holding `methods`.
pub(crate) fn class_with_methods(descriptor: &str, methods: Vec<DexMethod>) -> DexClass {
    let mut c = class(descriptor);
    for m in methods {
        c.add_method(m);
    }
    c
}

/// A single-dex program of one class holding `methods`.
pub(crate) fn program_of(methods: Vec<DexMethod>) -> Program {
    let owner = methods
        .first()
        .map_or_else(|| "LFoo;".to_string(), |m| m.class().descriptor().to_string());
    Program::from_classes(vec![class_with_methods(&owner, methods)])
}

/// Opcode names of `method`'s instructions in order.
pub(crate) fn opcodes_of(method: &DexMethod) -> Vec<String> {
    method
        .code()
        .map(|c| {
            c.instructions()
                .iter()
                .map(|i| i.opcode().to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Runs `pass` once on `program` with default configuration and returns its metrics.
pub(crate) fn run_pass(pass: &mut dyn Pass, program: &mut Program) -> Metrics {
    run_pass_with(pass, program, &ConfigFiles::default())
}

/// [`run_pass`] with explicit input files.
pub(crate) fn run_pass_with(pass: &mut dyn Pass, program: &mut Program, files: &ConfigFiles) -> Metrics {
    let config = Config::default();
    let metrics = Metrics::new();
    let events = EventLog::new();
    let reserved = ReservedRefs::default();
    let ctx = PassContext {
        config: &config,
        files,
        metrics: &metrics,
        events: &events,
        reserved: &reserved,
        index: 0,
        occurrence: 0,
    };
    pass.run_pass(program, &ctx).unwrap();
    metrics
}
