//! End-to-end optimization scenarios.
//!
//! Each test builds a small program through the public API, runs one pass through the
//! [`PassManager`] exactly as a frontend would, and checks the rewritten method bodies:
//! 1. Dead code removal keeps try regions that still bracket live code
//! 2. Peephole fuses `StringBuilder` construction with the first append
//! 3. String simplification folds constant builder chains
//! 4. Redundant check-cast removal after `new-instance`
//! 5. Inlining a trivial static callee, including debug positions
//! 6. Interdex layout driven by a coldstart betamap

use std::sync::Arc;

use dexopt::{
    compiler::{Config, ConfigFiles, PassManager, PassRegistry},
    ir::{CodeBuilder, DexPosition, IRCode, IROpcode},
    model::{AccessFlags, ClassHierarchy, DexClass, DexMethod, DexUnit, Program},
    passes::{
        copy_prop::propagate_copies,
        inliner::{inline_at, InlineContext},
        interdex::limits::MAX_TYPE_REFS_PRE_26,
        LocalDce,
    },
    pool::{DexMethodRef, DexType},
    Result,
};
use serde_json::json;

const SB: &str = "Ljava/lang/StringBuilder;";
const SB_INIT: &str = "Ljava/lang/StringBuilder;.<init>:()V";
const SB_APPEND: &str =
    "Ljava/lang/StringBuilder;.append:(Ljava/lang/String;)Ljava/lang/StringBuilder;";
const SB_TO_STRING: &str = "Ljava/lang/StringBuilder;.toString:()Ljava/lang/String;";

fn class(descriptor: &str, super_class: &str) -> DexClass {
    DexClass::new(
        DexType::make(descriptor),
        Some(DexType::make(super_class)),
        AccessFlags::PUBLIC,
    )
}

fn static_method(sig: &str, registers: u32, body: impl FnOnce(&mut CodeBuilder)) -> DexMethod {
    let mut b = CodeBuilder::new(registers);
    body(&mut b);
    DexMethod::new(
        DexMethodRef::parse(sig).unwrap(),
        AccessFlags::PUBLIC | AccessFlags::STATIC,
    )
    .with_code(b.build())
}

/// Wraps `method` into a single-class program.
fn program_with(method: DexMethod, extra: Vec<DexClass>) -> Program {
    let mut owner = class(&method.class().to_string(), "Ljava/lang/Object;");
    owner.add_method(method);
    let mut classes = extra;
    classes.push(owner);
    Program::from_classes(classes)
}

fn run(program: &mut Program, passes: &[&str]) -> Result<PassManager> {
    let registry = PassRegistry::with_defaults();
    let mut manager = PassManager::new(&registry, Config::with_passes(passes))?;
    manager.run(program)?;
    Ok(manager)
}

fn code_of<'a>(program: &'a Program, name: &str) -> &'a IRCode {
    program
        .methods()
        .find(|m| m.name().as_str() == name)
        .and_then(DexMethod::code)
        .unwrap()
}

fn opcodes(code: &IRCode) -> Vec<IROpcode> {
    code.instructions().iter().map(|i| i.opcode()).collect()
}

#[test]
fn dce_preserves_trailing_try() -> Result<()> {
    let method = static_method("LFoo;.run:()V", 1, |b| {
        let t0 = b.catch_label();
        let l1 = b.label();
        b.try_start(t0)
            .invoke_static("LFoo;.a:()V", &[])
            .goto(l1)
            .invoke_static("LFoo;.a:()V", &[])
            .bind(l1)
            .try_end(t0)
            .return_void()
            .bind_catch(t0, None)
            .return_void();
    });
    let mut program = program_with(method, Vec::new());
    let manager = run(&mut program, &["LocalDcePass"])?;

    let code = code_of(&program, "run");
    let invokes = opcodes(code)
        .into_iter()
        .filter(|op| *op == IROpcode::InvokeStatic)
        .count();
    assert_eq!(invokes, 1);
    assert!(code.has_try_regions());
    // The catch block survives next to the normal exit.
    let returns = opcodes(code)
        .into_iter()
        .filter(|op| *op == IROpcode::ReturnVoid)
        .count();
    assert_eq!(returns, 2);
    assert!(manager.metrics_of("LocalDcePass", 0).is_some());
    Ok(())
}

#[test]
fn peephole_fuses_string_builder_init() -> Result<()> {
    let method = static_method("LFoo;.build:()V", 2, |b| {
        b.new_instance(0, SB)
            .invoke_direct(SB_INIT, &[0])
            .const_string(1, "foo")
            .invoke_virtual(SB_APPEND, &[0, 1])
            .return_void();
    });
    let mut program = program_with(method, Vec::new());
    run(&mut program, &["PeepholePass"])?;

    let code = code_of(&program, "build");
    assert_eq!(
        opcodes(code),
        vec![
            IROpcode::NewInstance,
            IROpcode::MoveResultPseudoObject,
            IROpcode::ConstString,
            IROpcode::MoveResultPseudoObject,
            IROpcode::InvokeDirect,
            IROpcode::ReturnVoid,
        ]
    );
    let init = code.instructions()[4];
    assert_eq!(init.srcs(), [0, 1]);
    assert_eq!(
        init.method().map(ToString::to_string).as_deref(),
        Some("Ljava/lang/StringBuilder;.<init>:(Ljava/lang/String;)V")
    );
    Ok(())
}

#[test]
fn string_simplification_concatenates_literals() -> Result<()> {
    let method = static_method("LFoo;.greet:()Ljava/lang/String;", 3, |b| {
        b.new_instance(1, SB)
            .invoke_direct(SB_INIT, &[1])
            .const_string(2, "Hello ")
            .invoke_virtual(SB_APPEND, &[1, 2])
            .move_result(IROpcode::MoveResultObject, 1)
            .const_string(2, "world")
            .invoke_virtual(SB_APPEND, &[1, 2])
            .invoke_virtual(SB_TO_STRING, &[1])
            .move_result(IROpcode::MoveResultObject, 0)
            .ret_object(0);
    });
    let mut program = program_with(method, Vec::new());
    run(&mut program, &["StringSimplificationPass", "LocalDcePass"])?;

    let code = code_of(&program, "greet");
    assert!(!code
        .instructions()
        .iter()
        .any(|i| i.method().is_some_and(|m| m.class() == &DexType::make(SB))));
    let text: Vec<String> = code.instructions().iter().map(|i| i.to_string()).collect();
    assert!(text.ends_with(&[
        "const-string \"Hello world\"".to_string(),
        "move-result-pseudo-object v0".to_string(),
        "return-object v0".to_string(),
    ]));
    Ok(())
}

#[test]
fn check_cast_after_new_instance() -> Result<()> {
    let hierarchy_classes = || {
        vec![
            class("LB;", "Ljava/lang/Object;"),
            class("LC;", "LB;"),
            class("LD;", "LC;"),
        ]
    };
    for (target, removed) in [("LC;", true), ("LB;", true), ("LD;", false)] {
        let method = static_method("LTest;.make:()Ljava/lang/Object;", 1, |b| {
            b.new_instance(0, "LC;").check_cast(0, 0, target).ret_object(0);
        });
        let mut program = program_with(method, hierarchy_classes());
        run(&mut program, &["RemoveRedundantCheckCastsPass"])?;
        let has_cast = opcodes(code_of(&program, "make")).contains(&IROpcode::CheckCast);
        assert_eq!(has_cast, !removed, "cast to {target}");
    }
    Ok(())
}

#[test]
fn inlining_trivial_callee() {
    let caller_ref = DexMethodRef::parse("LFoo;.run:()I").unwrap();
    let callee_ref = DexMethodRef::parse("LFoo;.bar:(I)I").unwrap();
    let call_site = DexPosition::new(Some(caller_ref.clone()), None, 7);

    let mut b = CodeBuilder::new(2);
    b.position(call_site.clone())
        .const_int(0, 1)
        .invoke_static("LFoo;.bar:(I)I", &[0])
        .move_result(IROpcode::MoveResult, 1)
        .ret(1);
    let mut cfg = b.build_cfg();

    let callee = static_method("LFoo;.bar:(I)I", 1, |b| {
        b.load_param(0)
            .position(DexPosition::new(Some(callee_ref.clone()), None, 42))
            .add_lit(IROpcode::AddIntLit, 0, 0, 1)
            .ret(0);
    });

    let hierarchy = ClassHierarchy::default();
    let ctx = InlineContext {
        hierarchy: &hierarchy,
        caller: &caller_ref,
        allow_promotion: true,
    };
    let site = cfg
        .instructions()
        .into_iter()
        .find(|(_, i)| i.opcode().is_invoke())
        .map(|(p, _)| p)
        .unwrap();
    inline_at(&mut cfg, site, &callee, &ctx).unwrap();
    propagate_copies(&mut cfg);
    LocalDce::new().run(&mut cfg);

    let list = cfg.linearize();
    let insns: Vec<_> = list.instructions().map(|(_, i)| i.clone()).collect();
    let ops: Vec<IROpcode> = insns.iter().map(|i| i.opcode()).collect();
    assert_eq!(
        ops,
        vec![IROpcode::Const, IROpcode::AddIntLit, IROpcode::Move, IROpcode::Return]
    );
    // The callee result lands in a fresh register and is moved into the caller's dest.
    let add = &insns[1];
    assert_eq!(add.srcs(), [0]);
    assert_eq!(add.literal(), Some(1));
    assert_eq!(insns[2].dest(), Some(1));
    assert_eq!(insns[2].srcs(), [add.dest().unwrap()]);

    let positions: Vec<Arc<DexPosition>> = list
        .iter()
        .filter_map(|(_, item)| item.position().cloned())
        .collect();
    let inlined = positions.iter().find(|p| p.line == 42).unwrap();
    assert_eq!(inlined.parent.as_deref(), Some(&*call_site));
}

#[test]
fn interdex_coldstart_ordering() -> Result<()> {
    let plain = |name: &str| class(name, "Ljava/lang/Object;");
    let primary = DexUnit::new(
        vec![plain("LPrimary;"), plain("LC0;")],
        dexopt::model::DexInfo {
            primary: true,
            ..Default::default()
        },
    );
    let rest = DexUnit::new(
        (1..=12).map(|i| plain(&format!("LC{i};"))).collect(),
        dexopt::model::DexInfo::default(),
    );
    let mut program = Program::new(vec![primary, rest], 21);

    let mut betamap: Vec<String> =
        vec!["LPrimary;".into(), "LC0;".into(), "DexEndMarker0.class".into()];
    betamap.extend((1..=6).map(|i| format!("LC{i};")));
    betamap.push("ColdStart20PctEnd.class".into());
    betamap.extend((9..=12).map(|i| format!("LC{i};")));
    betamap.push("DexEndMarker0.class".into());

    let mut config = Config::with_passes(&["InterDexPass"]);
    // Leaves room for the canary, Object and two classes per dex.
    config.set_pass_options(
        "InterDexPass",
        json!({
            "reserved_trefs": MAX_TYPE_REFS_PRE_26 - 4,
            "minimize_cross_dex_refs": false,
        }),
    );
    let registry = PassRegistry::with_defaults();
    let mut manager =
        PassManager::new(&registry, config)?.with_files(ConfigFiles::with_coldstart(&betamap));
    manager.run(&mut program)?;

    let names = |dex: &DexUnit| -> Vec<String> {
        dex.classes.iter().map(|c| c.ty().to_string()).collect()
    };
    let dexes = program.dexes();
    assert_eq!(names(&dexes[0]), vec!["LPrimary;", "LC0;"]);
    assert_eq!(names(&dexes[1]), vec!["Lsecondary/dex01/Canary;", "LC1;", "LC2;"]);
    assert_eq!(names(&dexes[2])[1..], ["LC3;", "LC4;"]);
    assert!(dexes[1].info.coldstart && dexes[2].info.coldstart);
    for (ordinal, dex) in dexes.iter().enumerate().skip(1) {
        assert_eq!(
            dex.classes[0].ty().to_string(),
            format!("Lsecondary/dex{ordinal:02}/Canary;")
        );
    }

    let metrics = manager.metrics_of("InterDexPass", 0).unwrap();
    assert_eq!(metrics.get("num_dexes").copied(), Some(dexes.len() as i64));
    Ok(())
}
