//! Pass pipeline integration tests.
//!
//! These tests drive the whole pipeline the way a frontend does:
//! 1. Parse a JSON configuration
//! 2. Activate the passes through the registry
//! 3. Run them over a program with the type checker enabled
//! 4. Inspect the report, the rewritten bodies and the dex layout

use std::collections::BTreeSet;

use dexopt::{
    compiler::{Config, PassManager, PassRegistry},
    ir::{CodeBuilder, IRCode, IROpcode},
    model::{AccessFlags, DexClass, DexMethod, Program},
    pool::{DexMethodRef, DexType},
    Error, Result,
};

fn method(sig: &str, registers: u32, body: impl FnOnce(&mut CodeBuilder)) -> DexMethod {
    let mut b = CodeBuilder::new(registers);
    body(&mut b);
    DexMethod::new(
        DexMethodRef::parse(sig).unwrap(),
        AccessFlags::PUBLIC | AccessFlags::STATIC,
    )
    .with_code(b.build())
}

/// `count` classes with a handful of methods each, full of dead and foldable code.
fn app(count: usize) -> Program {
    let classes = (0..count)
        .map(|i| {
            let mut class = DexClass::new(
                DexType::make(&format!("Lcom/app/C{i};")),
                Some(DexType::object()),
                AccessFlags::PUBLIC,
            );
            class.add_method(method(&format!("Lcom/app/C{i};.dead:()I"), 3, |b| {
                b.const_int(0, 1)
                    .const_int(1, 2)
                    .binop(IROpcode::AddInt, 2, 0, 1)
                    .ret(1);
            }));
            class.add_method(method(&format!("Lcom/app/C{i};.greet:()Ljava/lang/String;"), 3, |b| {
                b.new_instance(1, "Ljava/lang/StringBuilder;")
                    .invoke_direct("Ljava/lang/StringBuilder;.<init>:()V", &[1])
                    .const_string(2, "C")
                    .invoke_virtual(
                        "Ljava/lang/StringBuilder;.append:(Ljava/lang/String;)Ljava/lang/StringBuilder;",
                        &[1, 2],
                    )
                    .invoke_virtual("Ljava/lang/StringBuilder;.toString:()Ljava/lang/String;", &[1])
                    .move_result(IROpcode::MoveResultObject, 0)
                    .ret_object(0);
            }));
            class.add_method(method(&format!("Lcom/app/C{i};.loop:(I)I"), 3, |b| {
                let head = b.label();
                let done = b.label();
                b.load_param(2)
                    .const_int(0, 0)
                    .bind(head)
                    .if_cmp(IROpcode::IfGe, 0, 2, done)
                    .add_lit(IROpcode::AddIntLit, 0, 0, 1)
                    .goto(head)
                    .bind(done)
                    .ret(0);
            }));
            class
        })
        .collect();
    Program::from_classes(classes)
}

fn bodies(program: &Program) -> Vec<(String, Vec<String>)> {
    let mut out: Vec<(String, Vec<String>)> = program
        .methods()
        .map(|m| {
            let text = m
                .code()
                .map(|c| c.instructions().iter().map(|i| i.to_string()).collect())
                .unwrap_or_default();
            (m.show(), text)
        })
        .collect();
    out.sort();
    out
}

fn manager(config: Config) -> PassManager {
    PassManager::new(&PassRegistry::with_defaults(), config).unwrap()
}

#[test]
fn json_config_drives_pipeline() -> Result<()> {
    let config = Config::from_json_str(
        r#"{
            "passes": ["LocalDcePass", "PeepholePass", "StringSimplificationPass",
                       "LocalDcePass", "InterDexPass"],
            "ir_type_checker": {"run_after_each_pass": true},
            "min_sdk": 21,
            "InterDexPass": {"minimize_cross_dex_refs": true}
        }"#,
    )?;
    assert_eq!(config.passes.len(), 5);
    assert_eq!(config.min_sdk, Some(21));

    let mut program = app(20);
    let mut manager = manager(config);
    manager.run(&mut program)?;

    let report = manager.report();
    let stats = report["pass_stats"].as_array().unwrap();
    let names: Vec<&str> = stats.iter().filter_map(|s| s["pass_name"].as_str()).collect();
    assert_eq!(
        names,
        vec![
            "LocalDcePass",
            "PeepholePass",
            "StringSimplificationPass",
            "LocalDcePass",
            "InterDexPass"
        ]
    );
    assert_eq!(stats[3]["occurrence"], 1);
    assert_eq!(stats[0]["metrics"]["pass_order"], 0);
    // The dead add and its only operand, per class.
    assert!(stats[0]["metrics"]["instructions_removed"].as_i64().unwrap() >= 40);
    assert!(report["total_wall_time_ms"].is_u64());
    Ok(())
}

#[test]
fn type_checker_rejects_bad_input_before_passes() {
    let mut config = Config::with_passes(&["LocalDcePass"]);
    config.ir_type_checker.run_after_passes = vec!["LocalDcePass".to_string()];
    let mut program = Program::from_classes(vec![{
        let mut class = DexClass::new(
            DexType::make("LBad;"),
            Some(DexType::object()),
            AccessFlags::PUBLIC,
        );
        class.add_method(method("LBad;.wide:()J", 2, |b| {
            b.const_int(0, 1).ret_wide(0);
        }));
        class
    }]);
    let mut manager = manager(config);
    assert!(matches!(
        manager.run(&mut program),
        Err(Error::TypeCheck { .. })
    ));
    assert!(manager.runs().is_empty());
}

#[test]
fn local_dce_is_idempotent() -> Result<()> {
    let mut program = app(5);
    manager(Config::with_passes(&["LocalDcePass"])).run(&mut program)?;
    let once = bodies(&program);
    manager(Config::with_passes(&["LocalDcePass"])).run(&mut program)?;
    assert_eq!(bodies(&program), once);
    Ok(())
}

#[test]
fn local_dce_settles_emptied_branch_in_one_run() -> Result<()> {
    let mut program = Program::from_classes(vec![{
        let mut class = DexClass::new(
            DexType::make("LBranchy;"),
            Some(DexType::object()),
            AccessFlags::PUBLIC,
        );
        class.add_method(method("LBranchy;.pick:(I)V", 2, |b| {
            let skip = b.label();
            b.load_param(1)
                .const_int(0, 5)
                .if_z(IROpcode::IfNez, 1, skip)
                .const_string(0, "dead")
                .bind(skip)
                .return_void();
        }));
        class
    }]);

    let mut first = manager(Config::with_passes(&["LocalDcePass"]));
    first.run(&mut program)?;
    let once = bodies(&program);
    let stats = first.metrics_of("LocalDcePass", 0).unwrap();
    assert_eq!(stats.get("branches_removed").copied(), Some(1));
    assert_eq!(
        once[0].1,
        vec!["load-param v1".to_string(), "return-void".to_string()]
    );

    let mut second = manager(Config::with_passes(&["LocalDcePass"]));
    second.run(&mut program)?;
    assert_eq!(bodies(&program), once);
    let stats = second.metrics_of("LocalDcePass", 0).unwrap();
    for key in ["instructions_removed", "blocks_removed", "branches_removed"] {
        assert_eq!(stats.get(key).copied(), Some(0), "{key}");
    }
    Ok(())
}

#[test]
fn peephole_without_patterns_is_no_op() -> Result<()> {
    let mut program = Program::from_classes(vec![{
        let mut class = DexClass::new(
            DexType::make("LPlain;"),
            Some(DexType::object()),
            AccessFlags::PUBLIC,
        );
        class.add_method(method("LPlain;.sum:(II)I", 3, |b| {
            b.load_param(1)
                .load_param(2)
                .binop(IROpcode::AddInt, 0, 1, 2)
                .ret(0);
        }));
        class
    }]);
    let before = bodies(&program);
    let mut manager = manager(Config::with_passes(&["PeepholePass"]));
    manager.run(&mut program)?;
    assert_eq!(bodies(&program), before);
    let metrics = manager.metrics_of("PeepholePass", 0).unwrap();
    assert!(metrics
        .iter()
        .filter(|(k, _)| k.as_str() != "pass_order")
        .all(|(_, v)| *v == 0));
    Ok(())
}

#[test]
fn interdex_preserves_class_set() -> Result<()> {
    let mut program = app(50);
    let before: BTreeSet<String> = program.classes().map(|c| c.ty().to_string()).collect();
    manager(Config::with_passes(&["InterDexPass"])).run(&mut program)?;

    let after: BTreeSet<String> = program
        .classes()
        .map(|c| c.ty().to_string())
        .filter(|name| !name.starts_with("Lsecondary/dex"))
        .collect();
    assert_eq!(before, after);

    for dex in program.dexes().iter().filter(|d| !d.info.primary) {
        assert!(dex.has_canary());
        assert!(dex.classes[0].ty().to_string().ends_with("/Canary;"));
    }
    Ok(())
}

#[test]
fn loop_survives_full_pipeline() -> Result<()> {
    let mut program = app(1);
    let mut config = Config::with_passes(&[
        "LocalDcePass",
        "CopyPropagationPass",
        "RemoveRedundantCheckCastsPass",
        "RegAllocPass",
        "LocalDcePass",
    ]);
    config.ir_type_checker.run_after_each_pass = true;
    manager(config).run(&mut program)?;

    let code: &IRCode = program
        .methods()
        .find(|m| m.name().as_str() == "loop")
        .and_then(DexMethod::code)
        .unwrap();
    let ops: Vec<IROpcode> = code.instructions().iter().map(|i| i.opcode()).collect();
    assert!(ops.contains(&IROpcode::IfGe));
    assert!(ops.contains(&IROpcode::AddIntLit));
    Ok(())
}
