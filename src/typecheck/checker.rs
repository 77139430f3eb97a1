use log::error;
use serde::{Deserialize, Serialize};

use crate::{
    analysis::{AbstractDomain, ClassDomain, FixpointAnalysis, MonotonicFixpointIterator},
    ir::{
        cfg::{BlockId, ControlFlowGraph, EdgeId, EdgeKind},
        IRInstruction, IROpcode, NumKind, Reg,
    },
    model::{ClassHierarchy, DexMethod},
    pool::DexType,
    typecheck::{IRType, TypeState},
    Error, Result,
};

/// Options of the type checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeCheckerOptions {
    /// Type non-zero 32-bit literals as `CONST` (int or float) and wide literals as
    /// `CONST1`/`CONST2`, instead of committing them to int and long.
    pub polymorphic_constants: bool,
    /// Check that `move`, `move-object` and `move-wide` copy values of their own flavour.
    pub verify_moves: bool,
}

impl Default for TypeCheckerOptions {
    fn default() -> Self {
        Self {
            polymorphic_constants: true,
            verify_moves: false,
        }
    }
}

/// Checks a method's IR against the verifier's typing rules.
///
/// The checker infers a [`TypeState`] at every program point with the fixpoint iterator,
/// then replays each reachable block and validates every instruction against the state
/// before it. It never modifies the method: list-form bodies are checked on a private CFG.
///
/// # Examples
///
/// ```rust
/// use dexopt::ir::{CodeBuilder, IROpcode};
/// use dexopt::model::{AccessFlags, DexMethod};
/// use dexopt::pool::DexMethodRef;
/// use dexopt::typecheck::IRTypeChecker;
///
/// let mut b = CodeBuilder::new(2);
/// b.load_param(1).add_lit(IROpcode::AddIntLit, 0, 1, 1).ret(0);
/// let method = DexMethod::new(
///     DexMethodRef::parse("LFoo;.inc:(I)I").unwrap(),
///     AccessFlags::PUBLIC | AccessFlags::STATIC,
/// )
/// .with_code(b.build());
///
/// assert!(IRTypeChecker::new(&method).check().is_ok());
/// ```
pub struct IRTypeChecker<'a> {
    method: &'a DexMethod,
    hierarchy: Option<&'a ClassHierarchy>,
    options: TypeCheckerOptions,
}

impl<'a> IRTypeChecker<'a> {
    /// Creates a checker with default options.
    #[must_use]
    pub fn new(method: &'a DexMethod) -> Self {
        Self {
            method,
            hierarchy: None,
            options: TypeCheckerOptions::default(),
        }
    }

    /// Enables class-level checks of reference arguments, returns and stores.
    #[must_use]
    pub fn with_hierarchy(mut self, hierarchy: &'a ClassHierarchy) -> Self {
        self.hierarchy = Some(hierarchy);
        self
    }

    /// Replaces the options.
    #[must_use]
    pub fn with_options(mut self, options: TypeCheckerOptions) -> Self {
        self.options = options;
        self
    }

    /// Runs the checker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeCheck`] naming the first offending instruction, with the
    /// method's printed IR attached.
    pub fn check(&self) -> Result<()> {
        let Some(code) = self.method.code() else {
            return Ok(());
        };
        let cfg = if code.cfg_built() {
            code.cfg().clone()
        } else {
            ControlFlowGraph::build(code.list().clone(), code.registers_size())
        };
        let interpreter = Interpreter::new(self.method, self.hierarchy, self.options, &cfg);
        let mut fp = MonotonicFixpointIterator::new(&cfg, interpreter);
        fp.run(TypeState::top());

        for block in cfg.blocks() {
            let mut state = fp.entry_state_at(block);
            if state.is_bottom() {
                continue;
            }
            if let Some(message) = fp.analysis().walk(&cfg, block, &mut state, None) {
                error!("{}: {}", self.method.reference(), message);
                return Err(Error::TypeCheck {
                    method: self.method.reference().to_string(),
                    message,
                    ir: self.method.show(),
                });
            }
        }
        Ok(())
    }
}

/// Transfer and validation rules, shared by inference and checking.
struct Interpreter<'a> {
    method: &'a DexMethod,
    hierarchy: Option<&'a ClassHierarchy>,
    options: TypeCheckerOptions,
    params: Vec<DexType>,
    empty: ClassHierarchy,
    catch_blocks: Vec<(BlockId, DexType)>,
}

type Check = std::result::Result<(), String>;

impl<'a> Interpreter<'a> {
    fn new(
        method: &'a DexMethod,
        hierarchy: Option<&'a ClassHierarchy>,
        options: TypeCheckerOptions,
        cfg: &ControlFlowGraph,
    ) -> Self {
        let mut params = Vec::new();
        if !method.is_static() {
            params.push(method.class().clone());
        }
        params.extend(method.proto().args().iter().cloned());

        let mut catch_blocks = Vec::new();
        for b in cfg.block_ids() {
            let types: Vec<Option<DexType>> = cfg
                .pred_edges(b)
                .filter_map(|(_, e)| match &e.kind {
                    EdgeKind::Throw { catch_type, .. } => Some(catch_type.clone()),
                    _ => None,
                })
                .collect();
            if let Some(first) = types.first() {
                let ty = match first {
                    Some(t) if types.iter().all(|x| x.as_ref() == Some(t)) => t.clone(),
                    _ => DexType::throwable(),
                };
                catch_blocks.push((b, ty));
            }
        }

        Self {
            method,
            hierarchy,
            options,
            params,
            empty: ClassHierarchy::default(),
            catch_blocks,
        }
    }

    fn hierarchy(&self) -> &ClassHierarchy {
        self.hierarchy.unwrap_or(&self.empty)
    }

    fn class(&self, ty: &DexType) -> ClassDomain {
        ClassDomain::of(ty, self.hierarchy())
    }

    /// Walks `block` from `state`, up to (excluding) item index `limit`, and returns the
    /// first violation found. The state is always advanced through every instruction.
    fn walk(
        &self,
        cfg: &ControlFlowGraph,
        block: BlockId,
        state: &mut TypeState,
        limit: Option<usize>,
    ) -> Option<String> {
        let mut first_error = None;
        let mut prev: Option<&IRInstruction> = None;
        let is_entry = block == cfg.entry();
        let mut param_index = 0;
        let mut params_done = !is_entry;
        let catch_type = self
            .catch_blocks
            .iter()
            .find(|(b, _)| *b == block)
            .map(|(_, t)| t.clone());

        for (n, (idx, insn)) in cfg.block(block).instructions().enumerate() {
            if limit.is_some_and(|l| idx >= l) {
                break;
            }
            let op = insn.opcode();
            let mut verdict = Ok(());
            if op.is_load_param() {
                if params_done {
                    verdict = Err(format!("load-param {insn} after the method prologue"));
                } else {
                    verdict = self.check_param(insn, param_index);
                    param_index += 1;
                }
            } else if !params_done {
                params_done = true;
                if param_index != self.params.len() {
                    verdict = Err(format!(
                        "expected {} load-param instructions, found {param_index}",
                        self.params.len()
                    ));
                }
            }
            if verdict.is_ok() {
                verdict = if op == IROpcode::MoveException {
                    if n == 0 && catch_type.is_some() {
                        Ok(())
                    } else {
                        Err("move-exception outside the start of a catch block".to_string())
                    }
                } else {
                    self.validate(state, insn, prev)
                };
            }
            if let Err(message) = verdict {
                first_error.get_or_insert(message);
            }
            self.apply(state, insn, prev, param_index, catch_type.as_ref());
            prev = Some(insn);
        }
        if is_entry && !params_done && param_index != self.params.len() && limit.is_none() {
            first_error.get_or_insert(format!(
                "expected {} load-param instructions, found {param_index}",
                self.params.len()
            ));
        }
        if first_error.is_none() && limit.is_none() {
            if let Some((_, last)) = cfg.block(block).last_insn() {
                if last.opcode().has_move_result_pseudo() {
                    first_error = Some(format!("{last} is not followed by its move-result-pseudo"));
                }
            }
        }
        first_error
    }

    fn mismatch(&self, insn: &IRInstruction, reg: Reg, expected: &str, found: IRType) -> String {
        format!(
            "Type error in method {} at instruction '{insn}' for register v{reg}: expected type {expected}, but found {found} instead",
            self.method.reference()
        )
    }

    fn expect(&self, state: &TypeState, insn: &IRInstruction, reg: Reg, expected: IRType) -> Check {
        let found = state.get(reg);
        if found.leq(&expected) {
            Ok(())
        } else {
            Err(self.mismatch(insn, reg, &expected.to_string(), found))
        }
    }

    fn expect_kind(&self, state: &TypeState, insn: &IRInstruction, reg: Reg, kind: NumKind) -> Check {
        match kind {
            NumKind::Int => self.expect(state, insn, reg, IRType::Int),
            NumKind::Float => self.expect(state, insn, reg, IRType::Float),
            NumKind::Long => {
                self.expect(state, insn, reg, IRType::Long1)?;
                self.expect(state, insn, reg + 1, IRType::Long2)
            }
            NumKind::Double => {
                self.expect(state, insn, reg, IRType::Double1)?;
                self.expect(state, insn, reg + 1, IRType::Double2)
            }
        }
    }

    /// A narrow non-reference value: int or float.
    fn expect_scalar(&self, state: &TypeState, insn: &IRInstruction, reg: Reg) -> Check {
        let found = state.get(reg);
        if found.leq(&IRType::Int) || found.leq(&IRType::Float) {
            Ok(())
        } else {
            Err(self.mismatch(insn, reg, "SCALAR", found))
        }
    }

    fn expect_wide_any(&self, state: &TypeState, insn: &IRInstruction, reg: Reg) -> Check {
        let (lo, hi) = (state.get(reg), state.get(reg + 1));
        let long = lo.leq(&IRType::Long1) && hi.leq(&IRType::Long2);
        let double = lo.leq(&IRType::Double1) && hi.leq(&IRType::Double2);
        if long || double {
            Ok(())
        } else {
            Err(self.mismatch(insn, reg, "WIDE", lo))
        }
    }

    /// A value of declared type `ty`.
    fn expect_value(&self, state: &TypeState, insn: &IRInstruction, reg: Reg, ty: &DexType) -> Check {
        match IRType::of(ty) {
            (IRType::Long1, _) => self.expect_kind(state, insn, reg, NumKind::Long),
            (IRType::Double1, _) => self.expect_kind(state, insn, reg, NumKind::Double),
            (IRType::Reference, _) => {
                self.expect(state, insn, reg, IRType::Reference)?;
                self.expect_class(state, insn, reg, ty)
            }
            (t, _) => self.expect(state, insn, reg, t),
        }
    }

    fn expect_class(&self, state: &TypeState, insn: &IRInstruction, reg: Reg, ty: &DexType) -> Check {
        let Some(h) = self.hierarchy else {
            return Ok(());
        };
        let ClassDomain::Class(value) = state.class_of(reg) else {
            return Ok(());
        };
        let checkable = h.contains(ty) && !h.is_interface(ty) && h.contains(value.ty());
        if checkable && !value.is_subtype_of(ty) {
            return Err(format!(
                "Type error in method {} at instruction '{insn}' for register v{reg}: expected {ty}, but found {} instead",
                self.method.reference(),
                value.ty()
            ));
        }
        Ok(())
    }

    fn check_param(&self, insn: &IRInstruction, index: usize) -> Check {
        let Some(ty) = self.params.get(index) else {
            return Err(format!("too many load-param instructions at '{insn}'"));
        };
        let expected = if ty.is_wide() {
            IROpcode::LoadParamWide
        } else if ty.is_reference() {
            IROpcode::LoadParamObject
        } else {
            IROpcode::LoadParam
        };
        if insn.opcode() == expected {
            Ok(())
        } else {
            Err(format!("'{insn}' binds parameter {index} of type {ty} with {expected}"))
        }
    }

    fn validate(&self, state: &TypeState, insn: &IRInstruction, prev: Option<&IRInstruction>) -> Check {
        use IROpcode as Op;

        let op = insn.opcode();
        let src = |i: usize| insn.src(i);
        match op {
            Op::Nop | Op::Goto | Op::Const | Op::ConstWide | Op::ConstString | Op::ConstClass => Ok(()),
            Op::ConstMethodHandle | Op::ConstMethodType | Op::NewInstance | Op::MoveException => Ok(()),
            op if op.is_load_param() || op.is_sget() => Ok(()),
            Op::Move => {
                if self.options.verify_moves {
                    self.expect_scalar(state, insn, src(0))
                } else {
                    Ok(())
                }
            }
            Op::MoveObject => {
                if self.options.verify_moves {
                    self.expect(state, insn, src(0), IRType::Reference)
                } else {
                    Ok(())
                }
            }
            Op::MoveWide => {
                if self.options.verify_moves {
                    self.expect_wide_any(state, insn, src(0))
                } else {
                    Ok(())
                }
            }
            Op::MoveResult | Op::MoveResultWide | Op::MoveResultObject => {
                let Some(p) = prev.filter(|p| p.opcode().has_move_result()) else {
                    return Err(format!("'{insn}' does not follow an invoke or filled-new-array"));
                };
                let produced = if p.opcode() == Op::FilledNewArray {
                    Some(IRType::Reference)
                } else {
                    p.method()
                        .map(|m| IRType::of(m.proto().rtype()).0)
                        .filter(|t| *t != IRType::Top)
                };
                let wanted = match op {
                    Op::MoveResultWide => matches!(produced, Some(IRType::Long1 | IRType::Double1)),
                    Op::MoveResultObject => produced == Some(IRType::Reference),
                    _ => matches!(produced, Some(IRType::Int | IRType::Float)),
                };
                if wanted {
                    Ok(())
                } else {
                    Err(format!("'{insn}' does not match the result of '{p}'"))
                }
            }
            op if op.is_move_result_pseudo() => match prev {
                Some(p) if p.opcode().pseudo_for_result() == Some(op) => Ok(()),
                _ => Err(format!("'{insn}' does not follow a matching primary instruction")),
            },
            Op::ReturnVoid => {
                if self.method.proto().rtype().is_void() {
                    Ok(())
                } else {
                    Err(format!("'{insn}' in a method returning {}", self.method.proto().rtype()))
                }
            }
            Op::Return | Op::ReturnWide | Op::ReturnObject => {
                let rtype = self.method.proto().rtype();
                let flavour_ok = match op {
                    Op::ReturnWide => rtype.is_wide(),
                    Op::ReturnObject => rtype.is_reference(),
                    _ => rtype.is_primitive() && !rtype.is_wide(),
                };
                if !flavour_ok {
                    return Err(format!("'{insn}' in a method returning {rtype}"));
                }
                self.expect_value(state, insn, src(0), rtype)
            }
            Op::MonitorEnter | Op::MonitorExit | Op::Throw | Op::FillArrayData => {
                self.expect(state, insn, src(0), IRType::Reference)
            }
            Op::CheckCast | Op::InstanceOf | Op::ArrayLength => {
                self.expect(state, insn, src(0), IRType::Reference)
            }
            Op::NewArray | Op::Switch => self.expect(state, insn, src(0), IRType::Int),
            Op::FilledNewArray => {
                let component = insn.type_ref().and_then(DexType::component_type);
                for i in 0..insn.srcs().len() {
                    match &component {
                        Some(c) => self.expect_value(state, insn, src(i), c)?,
                        None => self.expect_scalar(state, insn, src(i))?,
                    }
                }
                Ok(())
            }
            op if op.cmp_kind().is_some() => {
                let kind = op.cmp_kind().unwrap_or(NumKind::Int);
                self.expect_kind(state, insn, src(0), kind)?;
                self.expect_kind(state, insn, src(1), kind)
            }
            Op::IfEqz | Op::IfNez => {
                let found = state.get(src(0));
                if found.leq(&IRType::Int) || found.leq(&IRType::Reference) {
                    Ok(())
                } else {
                    Err(self.mismatch(insn, src(0), "INT or REFERENCE", found))
                }
            }
            op if op.is_testz() => self.expect(state, insn, src(0), IRType::Int),
            Op::IfEq | Op::IfNe => {
                let (a, b) = (state.get(src(0)), state.get(src(1)));
                let ints = a.leq(&IRType::Int) && b.leq(&IRType::Int);
                let refs = a.leq(&IRType::Reference) && b.leq(&IRType::Reference);
                if ints || refs {
                    Ok(())
                } else {
                    Err(self.mismatch(insn, src(1), &a.to_string(), b))
                }
            }
            op if op.is_conditional_branch() => {
                self.expect(state, insn, src(0), IRType::Int)?;
                self.expect(state, insn, src(1), IRType::Int)
            }
            op if op.is_aget() => {
                self.expect(state, insn, src(0), IRType::Reference)?;
                self.expect(state, insn, src(1), IRType::Int)
            }
            op if op.is_aput() => {
                match op {
                    Op::Aput => self.expect_scalar(state, insn, src(0))?,
                    Op::AputWide => self.expect_wide_any(state, insn, src(0))?,
                    Op::AputObject => self.expect(state, insn, src(0), IRType::Reference)?,
                    _ => self.expect(state, insn, src(0), IRType::Int)?,
                }
                self.expect(state, insn, src(1), IRType::Reference)?;
                self.expect(state, insn, src(2), IRType::Int)
            }
            op if op.is_iget() => self.expect(state, insn, src(0), IRType::Reference),
            op if op.is_iput() || op.is_sput() => {
                if let Some(field) = insn.field() {
                    self.expect_value(state, insn, src(0), field.ty())?;
                }
                if op.is_iput() {
                    self.expect(state, insn, src(1), IRType::Reference)?;
                }
                Ok(())
            }
            Op::InvokePolymorphic | Op::InvokeCustom => Ok(()),
            op if op.is_invoke() => {
                for i in 0..insn.srcs().len() {
                    let Some(ty) = insn.invoke_arg_type(i) else {
                        return Err(format!("'{insn}' passes more arguments than declared"));
                    };
                    let receiver = i == 0 && op != Op::InvokeStatic;
                    if receiver {
                        // Receivers of constructors are not initialized yet.
                        self.expect(state, insn, src(i), IRType::Reference)?;
                    } else {
                        self.expect_value(state, insn, src(i), &ty)?;
                    }
                }
                Ok(())
            }
            op if op.is_literal_op() => self.expect(state, insn, src(0), IRType::Int),
            op if op.is_binop() => {
                let kind = op.num_kind().unwrap_or(NumKind::Int);
                self.expect_kind(state, insn, src(0), kind)?;
                let second = if op.is_shift() { NumKind::Int } else { kind };
                self.expect_kind(state, insn, src(1), second)
            }
            op if op.is_unop() => {
                let (from, _) = op.unop_kinds().unwrap_or((NumKind::Int, NumKind::Int));
                self.expect_kind(state, insn, src(0), from)
            }
            _ => Ok(()),
        }
    }

    fn set_kind(state: &mut TypeState, reg: Reg, kind: NumKind) {
        match kind {
            NumKind::Int => state.set(reg, IRType::Int, ClassDomain::Top),
            NumKind::Float => state.set(reg, IRType::Float, ClassDomain::Top),
            NumKind::Long => state.set_wide(reg, IRType::Long1, IRType::Long2),
            NumKind::Double => state.set_wide(reg, IRType::Double1, IRType::Double2),
        }
    }

    fn set_value(&self, state: &mut TypeState, reg: Reg, ty: &DexType) {
        match IRType::of(ty) {
            (lo, Some(hi)) => state.set_wide(reg, lo, hi),
            (IRType::Reference, None) => state.set(reg, IRType::Reference, self.class(ty)),
            (t, None) => state.set(reg, t, ClassDomain::Top),
        }
    }

    fn apply(
        &self,
        state: &mut TypeState,
        insn: &IRInstruction,
        prev: Option<&IRInstruction>,
        param_index: usize,
        catch_type: Option<&DexType>,
    ) {
        use IROpcode as Op;

        if state.is_bottom() {
            return;
        }
        let Some(dest) = insn.dest() else {
            return;
        };
        let op = insn.opcode();
        match op {
            op if op.is_load_param() => match param_index
                .checked_sub(1)
                .and_then(|i| self.params.get(i))
            {
                Some(ty) => self.set_value(state, dest, ty),
                None => state.set(dest, IRType::Top, ClassDomain::Top),
            },
            Op::Move | Op::MoveObject => {
                let (t, c) = (state.get(insn.src(0)), state.class_of(insn.src(0)));
                state.set(dest, t, c);
            }
            Op::MoveWide => {
                let (lo, hi) = (state.get(insn.src(0)), state.get(insn.src(0) + 1));
                state.set_wide(dest, lo, hi);
            }
            Op::Const => {
                let ty = match insn.literal() {
                    Some(0) => IRType::Zero,
                    _ if self.options.polymorphic_constants => IRType::Const,
                    _ => IRType::Int,
                };
                let class = if ty == IRType::Zero {
                    ClassDomain::Bottom
                } else {
                    ClassDomain::Top
                };
                state.set(dest, ty, class);
            }
            Op::ConstWide => {
                if self.options.polymorphic_constants {
                    state.set_wide(dest, IRType::Const1, IRType::Const2);
                } else {
                    state.set_wide(dest, IRType::Long1, IRType::Long2);
                }
            }
            Op::MoveException => {
                let ty = catch_type.cloned().unwrap_or_else(DexType::throwable);
                state.set(dest, IRType::Reference, self.class(&ty));
            }
            Op::MoveResult | Op::MoveResultWide | Op::MoveResultObject => {
                let ty = prev.and_then(|p| {
                    if p.opcode() == Op::FilledNewArray {
                        p.type_ref().cloned()
                    } else {
                        p.method().map(|m| m.proto().rtype().clone())
                    }
                });
                match ty {
                    Some(t) if !t.is_void() => self.set_value(state, dest, &t),
                    _ => self.set_unknown(state, insn, dest),
                }
            }
            op if op.is_move_result_pseudo() => {
                let Some(p) = prev else {
                    self.set_unknown(state, insn, dest);
                    return;
                };
                self.apply_pseudo(state, p, insn, dest);
            }
            op if op.cmp_kind().is_some() => state.set(dest, IRType::Int, ClassDomain::Top),
            op if op.num_kind().is_some() => {
                Self::set_kind(state, dest, op.num_kind().unwrap_or(NumKind::Int));
            }
            op if op.unop_kinds().is_some() => {
                let (_, to) = op.unop_kinds().unwrap_or((NumKind::Int, NumKind::Int));
                Self::set_kind(state, dest, to);
            }
            _ => self.set_unknown(state, insn, dest),
        }
    }

    fn set_unknown(&self, state: &mut TypeState, insn: &IRInstruction, dest: Reg) {
        if insn.dest_is_wide() {
            state.set_wide(dest, IRType::Top, IRType::Top);
        } else {
            state.set(dest, IRType::Top, ClassDomain::Top);
        }
    }

    fn apply_pseudo(&self, state: &mut TypeState, primary: &IRInstruction, insn: &IRInstruction, dest: Reg) {
        use IROpcode as Op;

        match primary.opcode() {
            Op::ConstString => state.set(dest, IRType::Reference, self.class(&DexType::string())),
            Op::ConstClass => state.set(dest, IRType::Reference, self.class(&DexType::class())),
            Op::ConstMethodHandle | Op::ConstMethodType => {
                state.set(dest, IRType::Reference, ClassDomain::Top);
            }
            Op::CheckCast | Op::NewInstance | Op::NewArray => match primary.type_ref() {
                Some(t) => state.set(dest, IRType::Reference, self.class(t)),
                None => state.set(dest, IRType::Reference, ClassDomain::Top),
            },
            Op::InstanceOf | Op::ArrayLength => state.set(dest, IRType::Int, ClassDomain::Top),
            op if op.is_iget() || op.is_sget() => match primary.field() {
                Some(f) => self.set_value(state, dest, f.ty()),
                None => self.set_unknown(state, insn, dest),
            },
            op if op.is_aget() => {
                let component = state
                    .class_of(primary.src(0))
                    .ty()
                    .and_then(DexType::component_type);
                match (op, component) {
                    (Op::AgetObject, Some(c)) if c.is_reference() => {
                        state.set(dest, IRType::Reference, self.class(&c));
                    }
                    (Op::AgetObject, _) => state.set(dest, IRType::Reference, ClassDomain::Top),
                    (Op::Aget | Op::AgetWide, Some(c)) => self.set_value(state, dest, &c),
                    (Op::AgetWide, None) => state.set_wide(dest, IRType::Long1, IRType::Long2),
                    _ => state.set(dest, IRType::Int, ClassDomain::Top),
                }
            }
            _ => self.set_unknown(state, insn, dest),
        }
    }
}

impl FixpointAnalysis<ControlFlowGraph> for Interpreter<'_> {
    type Domain = TypeState;

    fn analyze_node(&self, graph: &ControlFlowGraph, node: BlockId, state: &mut TypeState) {
        if state.is_bottom() {
            return;
        }
        let _ = self.walk(graph, node, state, None);
    }

    fn analyze_edge(
        &self,
        graph: &ControlFlowGraph,
        edge: EdgeId,
        entry: &TypeState,
        exit: &TypeState,
    ) -> TypeState {
        let e = graph.edge(edge);
        if !e.is_throw() || entry.is_bottom() {
            return exit.clone();
        }
        // Control leaves at the throwing instruction, before it writes anything.
        let mut state = entry.clone();
        let limit = graph.block(e.src).last_throwing_index();
        let _ = self.walk(graph, e.src, &mut state, limit);
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ir::{CodeBuilder, IRCode},
        model::{AccessFlags, DexMethod},
        pool::DexMethodRef,
    };

    fn method(sig: &str, is_static: bool, code: IRCode) -> DexMethod {
        let mut access = AccessFlags::PUBLIC;
        if is_static {
            access |= AccessFlags::STATIC;
        }
        DexMethod::new(DexMethodRef::parse(sig).unwrap(), access).with_code(code)
    }

    #[test]
    fn test_accepts_simple_arithmetic() {
        let mut b = CodeBuilder::new(3);
        b.load_param(2)
            .const_int(0, 1)
            .binop(IROpcode::AddInt, 1, 0, 2)
            .ret(1);
        let m = method("LFoo;.f:(I)I", true, b.build());
        assert!(IRTypeChecker::new(&m).check().is_ok());
    }

    #[test]
    fn test_rejects_int_used_as_reference() {
        let mut b = CodeBuilder::new(1);
        b.const_int(0, 5).ret_object(0);
        let m = method("LFoo;.f:()Ljava/lang/Object;", true, b.build());
        let err = IRTypeChecker::new(&m).check().unwrap_err();
        assert!(matches!(err, Error::TypeCheck { .. }));
    }

    #[test]
    fn test_zero_is_null_and_int() {
        let mut b = CodeBuilder::new(1);
        b.const_int(0, 0).ret_object(0);
        let m = method("LFoo;.f:()Ljava/lang/Object;", true, b.build());
        assert!(IRTypeChecker::new(&m).check().is_ok());

        let mut b = CodeBuilder::new(1);
        b.const_int(0, 0).ret(0);
        let m = method("LFoo;.g:()I", true, b.build());
        assert!(IRTypeChecker::new(&m).check().is_ok());
    }

    #[test]
    fn test_merge_conflict_rejected_only_when_read() {
        let mut b = CodeBuilder::new(2);
        let other = b.label();
        let join = b.label();
        b.load_param(1)
            .if_z(IROpcode::IfEqz, 1, other)
            .const_string(0, "s")
            .goto(join)
            .bind(other)
            .const_int(0, 7)
            .bind(join)
            .return_void();
        let m = method("LFoo;.f:(I)V", true, b.build());
        assert!(IRTypeChecker::new(&m).check().is_ok());

        let mut b = CodeBuilder::new(2);
        let other = b.label();
        let join = b.label();
        b.load_param(1)
            .if_z(IROpcode::IfEqz, 1, other)
            .const_string(0, "s")
            .goto(join)
            .bind(other)
            .const_int(0, 7)
            .bind(join)
            .ret(0);
        let m = method("LFoo;.g:(I)I", true, b.build());
        assert!(IRTypeChecker::new(&m).check().is_err());
    }

    #[test]
    fn test_wide_halves() {
        let mut b = CodeBuilder::new(3);
        b.const_wide(0, 1).const_int(1, 2).ret_wide(0);
        let m = method("LFoo;.f:()J", true, b.build());
        assert!(IRTypeChecker::new(&m).check().is_err());

        let mut b = CodeBuilder::new(2);
        b.const_wide(0, 1).ret_wide(0);
        let m = method("LFoo;.g:()J", true, b.build());
        assert!(IRTypeChecker::new(&m).check().is_ok());
    }

    #[test]
    fn test_move_result_must_follow_invoke() {
        let mut b = CodeBuilder::new(1);
        b.invoke_static("LFoo;.v:()I", &[])
            .const_int(0, 1)
            .move_result(IROpcode::MoveResult, 0)
            .return_void();
        let m = method("LFoo;.f:()V", true, b.build());
        assert!(IRTypeChecker::new(&m).check().is_err());
    }

    #[test]
    fn test_param_count_checked() {
        let mut b = CodeBuilder::new(2);
        b.load_param_object(0).return_void();
        let m = method("LFoo;.f:(I)V", false, b.build());
        let err = IRTypeChecker::new(&m).check().unwrap_err();
        assert!(err.to_string().contains("load-param"));
    }

    #[test]
    fn test_polymorphic_constant_as_float() {
        let mut b = CodeBuilder::new(2);
        b.const_int(0, 0x3f80_0000)
            .binop(IROpcode::AddFloat, 1, 0, 0)
            .ret(1);
        let m = method("LFoo;.f:()F", true, b.build());
        assert!(IRTypeChecker::new(&m).check().is_ok());
        let strict = TypeCheckerOptions {
            polymorphic_constants: false,
            verify_moves: false,
        };
        assert!(IRTypeChecker::new(&m).with_options(strict).check().is_err());
    }

    #[test]
    fn test_exception_handler_sees_pre_throw_state() {
        let mut b = CodeBuilder::new(2);
        let handler = b.catch_label();
        b.const_string(0, "x")
            .try_start(handler)
            .invoke_static("LFoo;.v:()I", &[])
            .move_result(IROpcode::MoveResult, 0)
            .try_end(handler)
            .ret_object(1)
            .bind_catch(handler, None)
            .ret_object(0);
        let m = method("LFoo;.f:()Ljava/lang/Object;", true, b.build());
        // The normal path returns an uninitialized register.
        assert!(IRTypeChecker::new(&m).check().is_err());

        let mut b = CodeBuilder::new(2);
        let handler = b.catch_label();
        b.const_string(0, "x")
            .try_start(handler)
            .invoke_static("LFoo;.v:()I", &[])
            .move_result(IROpcode::MoveResult, 0)
            .try_end(handler)
            .return_void()
            .bind_catch(handler, None)
            .ret_object(0);
        let m = method("LFoo;.g:()Ljava/lang/Object;", true, b.build());
        // Handler: v0 still holds the string; the normal path returns void in a method
        // declared to return an object.
        let err = IRTypeChecker::new(&m).check().unwrap_err();
        assert!(err.to_string().contains("return-void"));
    }
}
