//! Lowering integration tests.
//!
//! Lowered code is lifted back into the IR and run through the type checker: a method the
//! checker accepts must still be accepted after `lower` + `lift`, and a rejected method
//! must stay rejected. The corpus covers parameters in and out of place, wide values,
//! literal forms, ranges, switches, array payloads and try regions.

use std::sync::Arc;

use dexopt::{
    compiler::{Config, Metrics, PassManager, PassRegistry},
    ir::{ArrayData, CodeBuilder, IRInstruction, IROpcode, Operand},
    lowering::{lift, lower, lower_method, lower_program, DexOpcode, DEX_035, DEX_037},
    model::{AccessFlags, DexClass, DexMethod, Program},
    pool::{DexMethodRef, DexType},
    typecheck::IRTypeChecker,
    Result,
};

fn method(sig: &str, access: AccessFlags, registers: u32, body: impl FnOnce(&mut CodeBuilder)) -> DexMethod {
    let mut b = CodeBuilder::new(registers);
    body(&mut b);
    DexMethod::new(DexMethodRef::parse(sig).unwrap(), access).with_code(b.build())
}

fn static_method(sig: &str, registers: u32, body: impl FnOnce(&mut CodeBuilder)) -> DexMethod {
    method(sig, AccessFlags::PUBLIC | AccessFlags::STATIC, registers, body)
}

fn accepts(method: &DexMethod) -> bool {
    IRTypeChecker::new(method).check().is_ok()
}

/// Lowers, lifts and re-checks `method`.
fn accepts_after_round_trip(method: &DexMethod) -> Result<bool> {
    let lowered = lower(method.code().unwrap())?;
    let lifted = lift(&lowered, method.reference(), method.is_static())?;
    let relifted = DexMethod::new(method.reference().clone(), method.access()).with_code(lifted);
    Ok(accepts(&relifted))
}

fn corpus() -> Vec<DexMethod> {
    let data = Arc::new(ArrayData {
        element_width: 4,
        data: vec![1, 0, 0, 0, 2, 0, 0, 0],
    });
    vec![
        static_method("LCorpus;.params:(IJLjava/lang/Object;)J", 8, |b| {
            b.load_param(0)
                .load_param_wide(1)
                .load_param_object(3)
                .unop(IROpcode::IntToLong, 4, 0)
                .binop(IROpcode::AddLong, 4, 4, 1)
                .ret_wide(4);
        }),
        method(
            "LCorpus;.virt:(I)I",
            AccessFlags::PUBLIC,
            3,
            |b| {
                b.load_param_object(1)
                    .load_param(2)
                    .add_lit(IROpcode::AddIntLit, 0, 2, 100_000)
                    .add_lit(IROpcode::RsubIntLit, 0, 0, 3)
                    .ret(0);
            },
        ),
        static_method("LCorpus;.range:()V", 24, |b| {
            b.const_int(20, 1)
                .const_int(3, 2)
                .const_wide(5, 7)
                .invoke_static("LCorpus;.sink:(IIJ)V", &[20, 3, 5])
                .return_void();
        }),
        static_method("LCorpus;.pick:(I)I", 2, |b| {
            let (one, two, far) = (b.label(), b.label(), b.label());
            b.load_param(1)
                .switch(1, &[(1, one), (2, two), (500, far)])
                .const_int(0, 0)
                .ret(0)
                .bind(one)
                .const_int(0, 10)
                .ret(0)
                .bind(two)
                .const_int(0, 20)
                .ret(0)
                .bind(far)
                .const_int(0, 0x10000)
                .ret(0);
        }),
        static_method("LCorpus;.array:()[I", 2, |b| {
            b.const_int(1, 2)
                .new_array(0, 1, "[I")
                .insn(
                    IRInstruction::new(IROpcode::FillArrayData)
                        .with_srcs(&[0])
                        .with_operand(Operand::Data(data.clone())),
                )
                .ret_object(0);
        }),
        static_method("LCorpus;.guarded:()I", 2, |b| {
            let handler = b.catch_label();
            let fallback = b.catch_label();
            b.try_start(handler)
                .invoke_static("LCorpus;.risky:()I", &[])
                .move_result(IROpcode::MoveResult, 0)
                .try_end(handler)
                .ret(0)
                .bind_catch(handler, Some(DexType::make("Ljava/lang/IllegalStateException;")))
                .catch_next(handler, fallback)
                .const_int(0, -1)
                .ret(0)
                .bind_catch(fallback, None)
                .move_exception(1)
                .throw(1);
        }),
        static_method("LCorpus;.cast:(Ljava/lang/Object;)Ljava/lang/String;", 2, |b| {
            b.load_param_object(1)
                .check_cast(0, 1, "Ljava/lang/String;")
                .ret_object(0);
        }),
        // Rejected: long read from an int register.
        static_method("LCorpus;.badWide:()J", 2, |b| {
            b.const_int(0, 1).ret_wide(0);
        }),
        // Rejected: returns an undefined register.
        static_method("LCorpus;.badUndef:()I", 3, |b| {
            b.ret(2);
        }),
        // Rejected: int used as an object.
        static_method("LCorpus;.badRef:()V", 2, |b| {
            b.const_int(0, 5)
                .invoke_virtual("Ljava/lang/Object;.hashCode:()I", &[0])
                .return_void();
        }),
    ]
}

#[test]
fn round_trip_preserves_checker_verdict() -> Result<()> {
    let mut accepted = 0;
    for method in corpus() {
        let before = accepts(&method);
        accepted += usize::from(before);
        assert_eq!(before, accepts_after_round_trip(&method)?, "{}", method.show());
    }
    assert_eq!(accepted, 7);
    Ok(())
}

#[test]
fn optimized_program_lowers_and_still_checks() -> Result<()> {
    let mut class = DexClass::new(
        DexType::make("LCorpus;"),
        Some(DexType::object()),
        AccessFlags::PUBLIC,
    );
    for m in corpus().into_iter().filter(accepts) {
        class.add_method(m);
    }
    let mut program = Program::from_classes(vec![class]);

    let mut config = Config::with_passes(&[
        "LocalDcePass",
        "PeepholePass",
        "RemoveRedundantCheckCastsPass",
        "CopyPropagationPass",
        "LocalDcePass",
    ]);
    config.ir_type_checker.run_after_each_pass = true;
    PassManager::new(&PassRegistry::with_defaults(), config)?.run(&mut program)?;

    let lowered = lower_program(&program)?;
    assert_eq!(lowered.methods.len(), 7);
    for m in program.methods() {
        assert!(accepts_after_round_trip(m)?, "{}", m.show());
    }

    let metrics = Metrics::new();
    lowered.stats.report(&metrics);
    assert!(metrics.get("range_invokes") >= 1);
    assert_eq!(lowered.min_dex_version, DEX_035);
    Ok(())
}

#[test]
fn lowered_encodings() -> Result<()> {
    let methods = corpus();
    let find = |name: &str| methods.iter().find(|m| m.name().as_str() == name).unwrap();

    let range = lower(find("range").code().unwrap())?;
    let invoke = range
        .instructions()
        .iter()
        .find(|i| i.opcode() == DexOpcode::InvokeStaticRange)
        .unwrap();
    assert_eq!(invoke.regs().len(), 4);
    assert_eq!(range.outs_size(), 4);

    let cast = lower(find("cast").code().unwrap())?;
    assert_eq!(cast.stats().move_for_check_cast, 1);

    let pick = lower(find("pick").code().unwrap())?;
    assert_eq!(pick.instructions()[0].opcode(), DexOpcode::SparseSwitch);
    assert_eq!(pick.payloads().len(), 1);
    assert_eq!(pick.payloads()[0].address % 2, 0);

    let guarded = lower(find("guarded").code().unwrap())?;
    assert_eq!(guarded.tries().len(), 1);
    let handler = &guarded.handlers()[guarded.tries()[0].handler];
    assert_eq!(handler.catches.len(), 1);
    assert!(handler.catch_all.is_some());

    let listing = guarded.to_string();
    assert!(listing.contains("invoke-static"));
    assert!(listing.contains("try "));
    Ok(())
}

#[test]
fn interface_bodies_need_dex_037() -> Result<()> {
    let mut iface = DexClass::new(
        DexType::make("LShape;"),
        Some(DexType::object()),
        AccessFlags::PUBLIC | AccessFlags::INTERFACE | AccessFlags::ABSTRACT,
    );
    iface.add_method(static_method("LShape;.unit:()I", 1, |b| {
        b.const_int(0, 1).ret(0);
    }));
    iface.add_method(method(
        "LShape;.<clinit>:()V",
        AccessFlags::STATIC | AccessFlags::CONSTRUCTOR,
        1,
        |b| {
            b.return_void();
        },
    ));
    let program = Program::from_classes(vec![iface]);
    let hierarchy = program.hierarchy();

    for m in program.methods() {
        let lowered = lower_method(m, &hierarchy)?;
        let expected = if m.reference().is_clinit() { DEX_035 } else { DEX_037 };
        assert_eq!(lowered.min_dex_version(), expected, "{}", m.show());
    }
    assert_eq!(lower_program(&program)?.min_dex_version, DEX_037);
    Ok(())
}
