//! Splicing a callee's body into a caller at an `invoke-*` site.
//!
//! The inliner works on the caller's editable CFG and a copy of the callee's body:
//!
//! 1. Callee registers are shifted above the caller's frame.
//! 2. Each `load-param*` becomes a move from the invoke's argument register.
//! 3. Each `return*` becomes a move into the call's `move-result` destination (when the
//!    call has one) and a `goto` to the code after the call.
//! 4. Callee positions are re-parented onto the call site's position, and the call site's
//!    position is re-emitted where the caller resumes.
//! 5. May-throw callee instructions keep their own handlers and additionally inherit the
//!    handlers of the call site.
//!
//! References the caller's class cannot see are reported as [`Promotion`]s; the caller
//! applies them with [`apply_promotions`] once it holds the whole program mutably.
//! Refusals are not errors: the call site is left untouched.

use std::{collections::HashMap, fmt, sync::Arc};

use log::trace;

use crate::{
    ir::{
        cfg::{BlockId, CfgPosition, ControlFlowGraph, EdgeKind},
        DexPosition, IRCode, IRInstruction, IROpcode, MethodItem, Operand, Reg,
    },
    model::{AccessFlags, ClassHierarchy, DexMethod, MethodSearch, Program},
    pool::{DexFieldRef, DexMethodRef, DexType},
};

/// Largest register count a method frame may have.
pub const MAX_REGISTERS: u32 = 65535;

/// Why a call site was not inlined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InlineRefusal {
    /// The call site or the callee uses `invoke-super`.
    InvokeSuper,
    /// The callee has no body.
    NoCode,
    /// The callee is the caller.
    Recursive,
    /// The instruction at the site is not an invoke of the callee.
    NotACallSite,
    /// The merged frame would exceed [`MAX_REGISTERS`].
    TooManyRegisters(u32),
    /// The callee references a member that cannot be made visible to the caller.
    Inaccessible(String),
}

impl fmt::Display for InlineRefusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvokeSuper => f.write_str("invoke-super"),
            Self::NoCode => f.write_str("callee has no code"),
            Self::Recursive => f.write_str("recursive call"),
            Self::NotACallSite => f.write_str("not a call site"),
            Self::TooManyRegisters(n) => write!(f, "{n} registers needed"),
            Self::Inaccessible(what) => write!(f, "{what} is not accessible"),
        }
    }
}

/// A visibility change needed for inlined code to verify in its new class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Promotion {
    /// Make a class public.
    Class(DexType),
    /// Make a field public.
    Field(DexFieldRef),
    /// Make a method public.
    Method(DexMethodRef),
}

/// What an accepted inline did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inlined {
    /// Visibility changes the caller must apply.
    pub promotions: Vec<Promotion>,
    /// Callee instructions copied into the caller.
    pub instructions: usize,
}

/// Caller-side facts the inliner needs.
#[derive(Debug, Clone, Copy)]
pub struct InlineContext<'a> {
    /// Hierarchy snapshot used for member resolution.
    pub hierarchy: &'a ClassHierarchy,
    /// The method being inlined into.
    pub caller: &'a DexMethodRef,
    /// When `false`, any needed promotion refuses the inline.
    pub allow_promotion: bool,
}

/// Inlines `callee` at the invoke at `site` in `caller`.
///
/// # Arguments
///
/// * `caller` - The caller's CFG
/// * `site` - Position of the `invoke-*` instruction
/// * `callee` - The invoked method's definition
/// * `ctx` - Hierarchy and caller identity
///
/// # Errors
///
/// Returns an [`InlineRefusal`] and leaves `caller` untouched when the inline is not
/// possible.
pub fn inline_at(
    caller: &mut ControlFlowGraph,
    site: CfgPosition,
    callee: &DexMethod,
    ctx: &InlineContext<'_>,
) -> Result<Inlined, InlineRefusal> {
    let invoke = caller
        .insn_at(site)
        .filter(|i| i.opcode().is_invoke())
        .ok_or(InlineRefusal::NotACallSite)?
        .clone();
    if invoke.opcode() == IROpcode::InvokeSuper {
        return Err(InlineRefusal::InvokeSuper);
    }
    let targets_callee = invoke.method().is_some_and(|m| {
        m == callee.reference()
            || search_for(invoke.opcode())
                .and_then(|search| ctx.hierarchy.resolve_method(m, search))
                .is_some_and(|resolved| &resolved.reference == callee.reference())
    });
    if !targets_callee {
        return Err(InlineRefusal::NotACallSite);
    }
    if callee.reference() == ctx.caller {
        return Err(InlineRefusal::Recursive);
    }
    let code = callee.code().ok_or(InlineRefusal::NoCode)?;
    let body = callee_cfg(code);

    let offset = caller.registers_size();
    let needed = offset + body.registers_size();
    if needed > MAX_REGISTERS {
        return Err(InlineRefusal::TooManyRegisters(needed));
    }
    let promotions = check_accessibility(&body, ctx)?;

    let result = caller
        .move_result_of(site)
        .and_then(|p| caller.insn_at(p).map(|i| (p, i.dest())))
        .map(|(p, dest)| (p, dest.unwrap_or_default()));
    let handlers = caller.handlers(site.block);
    let call_position = position_before(caller, site);

    let cont = caller.split_block_after(site);
    if let Some((pos, _)) = result {
        caller.remove_insn(pos);
    }
    caller.remove_insn(site);

    let mut splice = Splice {
        offset,
        args: invoke.srcs().to_vec(),
        result: result.map(|(_, dest)| dest),
        call_position: call_position.clone(),
        copied: 0,
        saw_position: false,
    };
    let entry = splice.copy_body(caller, &body, cont, &handlers);
    caller.set_goto_target(site.block, entry);
    caller.set_registers_size(needed);

    if let Some(position) = call_position.filter(|_| splice.saw_position) {
        caller
            .block_mut(cont)
            .items_mut()
            .insert(0, MethodItem::Position(position));
    }
    caller.simplify();

    trace!(
        "inlined {} into {} ({} instructions)",
        callee.reference(),
        ctx.caller,
        splice.copied
    );
    Ok(Inlined {
        promotions,
        instructions: splice.copied,
    })
}

fn callee_cfg(code: &IRCode) -> ControlFlowGraph {
    let mut code = code.clone();
    if code.cfg_built() {
        code.clear_cfg();
    }
    ControlFlowGraph::build(code.list().clone(), code.registers_size())
}

/// The last position at or before `site`, following single-predecessor chains.
fn position_before(cfg: &ControlFlowGraph, site: CfgPosition) -> Option<Arc<DexPosition>> {
    let mut block = site.block;
    let mut end = site.index;
    let mut seen = 0;
    loop {
        let found = cfg.block(block).items()[..end]
            .iter()
            .rev()
            .find_map(|item| item.position().cloned());
        if found.is_some() {
            return found;
        }
        let preds = cfg.predecessors_of(block);
        seen += 1;
        match preds.as_slice() {
            [single] if seen <= cfg.num_blocks() => {
                block = *single;
                end = cfg.block(block).items().len();
            }
            _ => return None,
        }
    }
}

fn search_for(op: IROpcode) -> Option<MethodSearch> {
    match op {
        IROpcode::InvokeDirect => Some(MethodSearch::Direct),
        IROpcode::InvokeStatic => Some(MethodSearch::Static),
        IROpcode::InvokeVirtual => Some(MethodSearch::Virtual),
        IROpcode::InvokeInterface => Some(MethodSearch::Interface),
        IROpcode::InvokeSuper => Some(MethodSearch::Super),
        _ => None,
    }
}

/// Collects the promotions needed for the callee's references to verify in the caller's
/// class, or refuses.
fn check_accessibility(
    body: &ControlFlowGraph,
    ctx: &InlineContext<'_>,
) -> Result<Vec<Promotion>, InlineRefusal> {
    let from = ctx.caller.class();
    let hierarchy = ctx.hierarchy;
    let mut promotions = Vec::new();
    let need_class = |ty: &DexType, promotions: &mut Vec<Promotion>| {
        let mut base = ty.clone();
        while let Some(component) = base.component_type() {
            base = component;
        }
        if !hierarchy.is_accessible(from, &base, AccessFlags::PUBLIC) {
            promotions.push(Promotion::Class(base));
        }
    };

    for (_, insn) in body.instructions() {
        match insn.operand() {
            Operand::Type(ty) => need_class(ty, &mut promotions),
            Operand::Field(field) => {
                let Some(resolved) = hierarchy.resolve_field(field) else {
                    continue;
                };
                let owner = resolved.reference.class().clone();
                need_class(&owner, &mut promotions);
                if !hierarchy.is_accessible(from, &owner, resolved.access) {
                    promotions.push(Promotion::Field(resolved.reference));
                }
            }
            Operand::Method(method) => {
                let Some(search) = search_for(insn.opcode()) else {
                    continue;
                };
                if search == MethodSearch::Super {
                    return Err(InlineRefusal::InvokeSuper);
                }
                let Some(resolved) = hierarchy.resolve_method(method, search) else {
                    continue;
                };
                let owner = resolved.reference.class().clone();
                need_class(&owner, &mut promotions);
                if hierarchy.is_accessible(from, &owner, resolved.access) {
                    continue;
                }
                // A private instance method made public would become virtual.
                if resolved.access.contains(AccessFlags::PRIVATE)
                    && !resolved.access.contains(AccessFlags::STATIC)
                    && !resolved.reference.is_init()
                {
                    return Err(InlineRefusal::Inaccessible(resolved.reference.to_string()));
                }
                promotions.push(Promotion::Method(resolved.reference));
            }
            _ => {}
        }
    }
    promotions.sort();
    promotions.dedup();
    if !promotions.is_empty() && !ctx.allow_promotion {
        let first = promotions[0].clone();
        return Err(InlineRefusal::Inaccessible(format!("{first:?}")));
    }
    Ok(promotions)
}

struct Splice {
    offset: u32,
    args: Vec<Reg>,
    result: Option<Reg>,
    call_position: Option<Arc<DexPosition>>,
    copied: usize,
    saw_position: bool,
}

impl Splice {
    /// Copies every callee block into `caller` and returns the copy of the callee entry.
    fn copy_body(
        &mut self,
        caller: &mut ControlFlowGraph,
        body: &ControlFlowGraph,
        cont: BlockId,
        handlers: &[(Option<DexType>, BlockId)],
    ) -> BlockId {
        let mut blocks: HashMap<BlockId, BlockId> = HashMap::new();
        for b in body.blocks() {
            blocks.insert(b, caller.create_block());
        }

        let mut param = 0;
        for b in body.blocks() {
            let copy = blocks[&b];
            let mut returns = false;
            let mut items = Vec::with_capacity(body.block(b).items().len());
            for item in body.block(b).items() {
                match item {
                    MethodItem::Insn(insn) => {
                        if insn.opcode().is_return() {
                            returns = true;
                            if let Some(mv) = self.return_move(insn) {
                                items.push(MethodItem::Insn(mv));
                            }
                            continue;
                        }
                        let copied = if insn.opcode().is_load_param() {
                            let mv = self.param_move(insn, param);
                            param += 1;
                            mv
                        } else {
                            let mut copy = insn.clone();
                            copy.remap_registers(|r| r + self.offset);
                            copy
                        };
                        self.copied += 1;
                        items.push(MethodItem::Insn(copied));
                    }
                    MethodItem::Position(pos) => {
                        self.saw_position = true;
                        let pos = match &self.call_position {
                            Some(caller_pos) => pos.reparented(caller_pos),
                            None => pos.clone(),
                        };
                        items.push(MethodItem::Position(pos));
                    }
                    other => items.push(other.clone()),
                }
            }
            *caller.block_mut(copy).items_mut() = items;

            for (_, edge) in body.succ_edges(b) {
                if edge.kind == EdgeKind::Ghost {
                    continue;
                }
                caller.add_edge(copy, blocks[&edge.target], edge.kind.clone());
            }
            if returns {
                caller.add_edge(copy, cont, EdgeKind::Goto);
            }
            if caller.block(copy).may_throw() {
                caller.append_handlers(copy, handlers);
            }
        }
        blocks[&body.entry()]
    }

    fn param_move(&self, load: &IRInstruction, index: usize) -> IRInstruction {
        let op = match load.opcode() {
            IROpcode::LoadParamWide => IROpcode::MoveWide,
            IROpcode::LoadParamObject => IROpcode::MoveObject,
            _ => IROpcode::Move,
        };
        let dest = load.dest().unwrap_or_default() + self.offset;
        let src = self.args.get(index).copied().unwrap_or_default();
        IRInstruction::new(op).with_dest(dest).with_srcs(&[src])
    }

    fn return_move(&self, ret: &IRInstruction) -> Option<IRInstruction> {
        let dest = self.result?;
        let src = *ret.srcs().first()? + self.offset;
        let op = match ret.opcode() {
            IROpcode::ReturnWide => IROpcode::MoveWide,
            IROpcode::ReturnObject => IROpcode::MoveObject,
            _ => IROpcode::Move,
        };
        Some(IRInstruction::new(op).with_dest(dest).with_srcs(&[src]))
    }
}

/// Applies visibility promotions to `program`, marking each touched class as opened.
///
/// # Returns
///
/// The number of promotions that found their definition.
pub fn apply_promotions(program: &mut Program, promotions: &[Promotion]) -> usize {
    let mut applied = 0;
    for promotion in promotions {
        let owner = match promotion {
            Promotion::Class(ty) => ty,
            Promotion::Field(f) => f.class(),
            Promotion::Method(m) => m.class(),
        };
        let Some(class) = program.class_mut(owner) else {
            continue;
        };
        let found = match promotion {
            Promotion::Class(_) => {
                class.set_access(class.access().made_public());
                true
            }
            Promotion::Field(f) => class
                .find_field_mut(f)
                .map(|field| field.set_access(field.access().made_public()))
                .is_some(),
            Promotion::Method(m) => class
                .find_method_mut(m)
                .map(|method| method.set_access(method.access().made_public()))
                .is_some(),
        };
        if found {
            class.state_mut().opened = true;
            applied += 1;
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ir::CodeBuilder,
        model::{DexClass, DexField},
        passes::{copy_prop::propagate_copies, LocalDce},
        pool::DexProto,
    };

    fn method(text: &str, access: AccessFlags, code: IRCode) -> DexMethod {
        let reference = DexMethodRef::parse(text).expect("valid method");
        DexMethod::new(reference, access).with_code(code)
    }

    fn caller_ref() -> DexMethodRef {
        DexMethodRef::parse("LCaller;.run:()I").expect("valid method")
    }

    fn ctx<'a>(hierarchy: &'a ClassHierarchy, caller: &'a DexMethodRef) -> InlineContext<'a> {
        InlineContext {
            hierarchy,
            caller,
            allow_promotion: true,
        }
    }

    fn first_invoke(cfg: &ControlFlowGraph) -> CfgPosition {
        cfg.instructions()
            .into_iter()
            .find(|(_, i)| i.opcode().is_invoke())
            .map(|(p, _)| p)
            .expect("has an invoke")
    }

    fn add_one() -> DexMethod {
        let mut b = CodeBuilder::new(2);
        b.load_param(0).add_lit(IROpcode::AddIntLit, 1, 0, 1).ret(1);
        method("LCallee;.addOne:(I)I", AccessFlags::PUBLIC | AccessFlags::STATIC, b.build())
    }

    #[test]
    fn test_inline_then_cleanup_leaves_callee_arithmetic() {
        let mut b = CodeBuilder::new(2);
        b.const_int(0, 1)
            .invoke_static("LCallee;.addOne:(I)I", &[0])
            .move_result(IROpcode::MoveResult, 1)
            .ret(1);
        let mut cfg = b.build_cfg();
        let hierarchy = ClassHierarchy::default();
        let caller = caller_ref();
        let site = first_invoke(&cfg);

        let inlined = inline_at(&mut cfg, site, &add_one(), &ctx(&hierarchy, &caller))
            .expect("inlined");
        assert!(inlined.promotions.is_empty());
        assert_eq!(cfg.registers_size(), 4);

        propagate_copies(&mut cfg);
        LocalDce::new().run(&mut cfg);
        let text: Vec<String> = cfg
            .linearize()
            .instructions()
            .map(|(_, i)| i.to_string())
            .collect();
        assert_eq!(
            text,
            vec!["const v0, 1", "add-int/lit v3, v0, 1", "move v1, v3", "return v1"]
        );
    }

    #[test]
    fn test_invoke_super_refused() {
        let mut b = CodeBuilder::new(1);
        b.load_param_object(0)
            .invoke(IROpcode::InvokeSuper, "LCallee;.addOne:(I)I", &[0])
            .return_void();
        let mut cfg = b.build_cfg();
        let before = cfg.show();
        let hierarchy = ClassHierarchy::default();
        let caller = caller_ref();
        let site = first_invoke(&cfg);
        let refused = inline_at(&mut cfg, site, &add_one(), &ctx(&hierarchy, &caller));
        assert_eq!(refused, Err(InlineRefusal::InvokeSuper));
        assert_eq!(cfg.show(), before);
    }

    #[test]
    fn test_recursive_and_bodiless_refused() {
        let mut b = CodeBuilder::new(1);
        b.const_int(0, 1)
            .invoke_static("LCallee;.addOne:(I)I", &[0])
            .return_void();
        let mut cfg = b.build_cfg();
        let hierarchy = ClassHierarchy::default();
        let site = first_invoke(&cfg);
        let callee = add_one();
        let same = callee.reference().clone();
        assert_eq!(
            inline_at(&mut cfg, site, &callee, &ctx(&hierarchy, &same)),
            Err(InlineRefusal::Recursive)
        );
        let bodiless = DexMethod::new(same, AccessFlags::PUBLIC | AccessFlags::STATIC);
        let caller = caller_ref();
        assert_eq!(
            inline_at(&mut cfg, site, &bodiless, &ctx(&hierarchy, &caller)),
            Err(InlineRefusal::NoCode)
        );
    }

    #[test]
    fn test_inlined_throwers_inherit_call_site_handlers() {
        let mut b = CodeBuilder::new(2);
        let handler = b.catch_label();
        b.const_int(0, 1)
            .try_start(handler)
            .invoke_static("LCallee;.touch:()V", &[])
            .try_end(handler)
            .return_void()
            .bind_catch(handler, Some(DexType::throwable()))
            .move_exception(1)
            .throw(1);
        let mut cfg = b.build_cfg();

        let mut cb = CodeBuilder::new(1);
        cb.sget("LOther;.f:I", 0).return_void();
        let callee = method("LCallee;.touch:()V", AccessFlags::PUBLIC | AccessFlags::STATIC, cb.build());

        let hierarchy = ClassHierarchy::default();
        let caller = caller_ref();
        let site = first_invoke(&cfg);
        inline_at(&mut cfg, site, &callee, &ctx(&hierarchy, &caller)).expect("inlined");

        let (pos, _) = cfg
            .instructions()
            .into_iter()
            .find(|(_, i)| i.opcode() == IROpcode::Sget)
            .expect("sget copied");
        let handlers = cfg.handlers(pos.block);
        assert_eq!(handlers.len(), 1);
        assert_eq!(handlers[0].0, Some(DexType::throwable()));
    }

    #[test]
    fn test_positions_reparented_and_caller_position_restored() {
        let call_pos = DexPosition::new(Some(caller_ref()), None, 10);
        let mut b = CodeBuilder::new(1);
        b.position(call_pos.clone())
            .const_int(0, 1)
            .invoke_static("LCallee;.addOne:(I)I", &[0])
            .const_int(0, 2)
            .ret(0);
        let mut cfg = b.build_cfg();

        let callee_ref = DexMethodRef::parse("LCallee;.addOne:(I)I").expect("valid method");
        let mut cb = CodeBuilder::new(2);
        cb.load_param(0)
            .position(DexPosition::new(Some(callee_ref.clone()), None, 42))
            .add_lit(IROpcode::AddIntLit, 1, 0, 1)
            .ret(1);
        let callee = method("LCallee;.addOne:(I)I", AccessFlags::PUBLIC | AccessFlags::STATIC, cb.build());

        let hierarchy = ClassHierarchy::default();
        let caller = caller_ref();
        let site = first_invoke(&cfg);
        inline_at(&mut cfg, site, &callee, &ctx(&hierarchy, &caller)).expect("inlined");

        let positions: Vec<Arc<DexPosition>> = cfg
            .linearize()
            .iter()
            .filter_map(|(_, item)| item.position().cloned())
            .collect();
        assert_eq!(positions.len(), 3);
        assert_eq!(positions[1].line, 42);
        assert_eq!(positions[1].parent.as_deref(), Some(&*call_pos));
        assert_eq!(positions[2], call_pos);
    }

    #[test]
    fn test_private_field_promoted_private_method_refused() {
        let owner = DexType::make("Lp/Callee;");
        let field = DexFieldRef::make(owner.clone(), "secret", DexType::int());
        let helper = DexMethodRef::make(owner.clone(), "helper", DexProto::make(DexType::void(), vec![]));
        let mut class = DexClass::new(owner.clone(), Some(DexType::object()), AccessFlags::PUBLIC);
        class.add_field(DexField::new(field.clone(), AccessFlags::PRIVATE | AccessFlags::STATIC));
        class.add_method(DexMethod::new(helper.clone(), AccessFlags::PRIVATE));
        let mut program = Program::from_classes(vec![class]);
        let hierarchy = program.hierarchy();

        let mut b = CodeBuilder::new(1);
        b.invoke_static("Lp/Callee;.read:()V", &[]).return_void();
        let mut cfg = b.build_cfg();
        let caller = DexMethodRef::parse("Lq/Caller;.run:()V").expect("valid method");

        let mut cb = CodeBuilder::new(1);
        cb.sget("Lp/Callee;.secret:I", 0).return_void();
        let reader = method("Lp/Callee;.read:()V", AccessFlags::PUBLIC | AccessFlags::STATIC, cb.build());
        let site = first_invoke(&cfg);
        let inlined = inline_at(&mut cfg, site, &reader, &ctx(&hierarchy, &caller)).expect("inlined");
        assert_eq!(inlined.promotions, vec![Promotion::Field(field.clone())]);

        assert_eq!(apply_promotions(&mut program, &inlined.promotions), 1);
        let class = program.class(&owner).expect("class kept");
        assert!(class.state().opened);
        assert!(class
            .find_field(&field)
            .is_some_and(|f| f.access().contains(AccessFlags::PUBLIC)));

        let mut b = CodeBuilder::new(1);
        b.load_param_object(0)
            .invoke_virtual("Lp/Callee;.callHelper:()V", &[0])
            .return_void();
        let mut cfg = b.build_cfg();
        let mut cb = CodeBuilder::new(1);
        cb.load_param_object(0)
            .invoke_direct("Lp/Callee;.helper:()V", &[0])
            .return_void();
        let calls_helper = method("Lp/Callee;.callHelper:()V", AccessFlags::PUBLIC, cb.build());
        let site = first_invoke(&cfg);
        assert!(matches!(
            inline_at(&mut cfg, site, &calls_helper, &ctx(&hierarchy, &caller)),
            Err(InlineRefusal::Inaccessible(_))
        ));
    }

    #[test]
    fn test_call_site_must_resolve_to_callee() {
        let mut callee_class = DexClass::new(
            DexType::make("LCallee;"),
            Some(DexType::object()),
            AccessFlags::PUBLIC,
        );
        callee_class.add_method(add_one());
        let sub = DexClass::new(
            DexType::make("LSub;"),
            Some(DexType::make("LCallee;")),
            AccessFlags::PUBLIC,
        );
        let other = DexClass::new(
            DexType::make("LOther;"),
            Some(DexType::object()),
            AccessFlags::PUBLIC,
        );
        let program = Program::from_classes(vec![callee_class, sub, other]);
        let hierarchy = ClassHierarchy::from_program(&program);
        let caller = caller_ref();

        let call = |target: &str| {
            let mut b = CodeBuilder::new(2);
            b.const_int(0, 1)
                .invoke_static(target, &[0])
                .move_result(IROpcode::MoveResult, 1)
                .ret(1);
            b.build_cfg()
        };

        let mut unrelated = call("LOther;.addOne:(I)I");
        let before = unrelated.show();
        let site = first_invoke(&unrelated);
        assert_eq!(
            inline_at(&mut unrelated, site, &add_one(), &ctx(&hierarchy, &caller)),
            Err(InlineRefusal::NotACallSite)
        );
        assert_eq!(unrelated.show(), before);

        let mut inherited = call("LSub;.addOne:(I)I");
        let site = first_invoke(&inherited);
        assert!(inline_at(&mut inherited, site, &add_one(), &ctx(&hierarchy, &caller)).is_ok());
        assert!(inherited
            .instructions()
            .iter()
            .all(|(_, i)| !i.opcode().is_invoke()));
    }

    #[test]
    fn test_register_limit_refused() {
        let mut b = CodeBuilder::new(1);
        b.const_int(0, 1)
            .invoke_static("LCallee;.addOne:(I)I", &[0])
            .return_void();
        let mut cfg = b.build_cfg();
        cfg.set_registers_size(MAX_REGISTERS - 1);
        let hierarchy = ClassHierarchy::default();
        let caller = caller_ref();
        let site = first_invoke(&cfg);
        assert_eq!(
            inline_at(&mut cfg, site, &add_one(), &ctx(&hierarchy, &caller)),
            Err(InlineRefusal::TooManyRegisters(MAX_REGISTERS + 1))
        );
    }
}
