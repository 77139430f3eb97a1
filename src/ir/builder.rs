//! Builder pattern for programmatic IR construction.
//!
//! This module provides a fluent API for writing IR lists without managing item ids,
//! branch targets or catch chains by hand. It's used for:
//!
//! - Writing unit tests for passes and analyses
//! - Generating small method bodies (canary classes, recursion guards, barriers)
//!
//! # Design
//!
//! Labels are declared up front and bound where the code they name begins. Branches may
//! refer to labels bound later; every reference is resolved when the list is built:
//!
//! ```rust,ignore
//! let mut b = CodeBuilder::new(2);
//! let (else_l, join) = (b.label(), b.label());
//! b.load_param(0)
//!     .if_z(IROpcode::IfEqz, 0, else_l)
//!     .const_int(1, 1)
//!     .goto(join)
//!     .bind(else_l)
//!     .const_int(1, 2)
//!     .bind(join)
//!     .ret(1);
//! let code = b.build();
//! ```
//!
//! Try regions reference a catch label; the handler code starts where the catch label is
//! bound. Multi-handler regions chain catch labels with [`CodeBuilder::catch_next`].
//!
//! Member references are given as text (`LFoo;.bar:(I)V`, `LFoo;.f:I`). Malformed text is
//! a programming error and aborts.

use std::{collections::HashMap, sync::Arc};

use crate::{
    ir::{
        cfg::ControlFlowGraph, BranchTarget, CatchEntry, DexPosition, IRCode, IRInstruction,
        IRList, IROpcode, ItemId, MethodItem, Operand, Reg, SourceBlock, TargetKind, TryKind,
        TryMarker,
    },
    pool::{DexFieldRef, DexMethodRef, DexString, DexType, TypeCategory},
};

/// A branch destination handed out by [`CodeBuilder::label`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// A catch handler handed out by [`CodeBuilder::catch_label`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CatchLabel(usize);

#[derive(Debug)]
enum Pending {
    Item(MethodItem),
    Branch(IRInstruction, Vec<(Label, TargetKind)>),
    Bind(Label),
    Try(TryKind, CatchLabel),
    Catch(CatchLabel, Option<DexType>),
}

/// Fluent builder for [`IRCode`].
#[derive(Debug)]
pub struct CodeBuilder {
    registers_size: u32,
    items: Vec<Pending>,
    labels: usize,
    catch_labels: usize,
    catch_next: HashMap<CatchLabel, CatchLabel>,
}

impl CodeBuilder {
    /// Creates a builder for a body using `registers_size` registers.
    #[must_use]
    pub fn new(registers_size: u32) -> Self {
        Self {
            registers_size,
            items: Vec::new(),
            labels: 0,
            catch_labels: 0,
            catch_next: HashMap::new(),
        }
    }

    /// Declares a new branch label.
    pub fn label(&mut self) -> Label {
        self.labels += 1;
        Label(self.labels - 1)
    }

    /// Declares a new catch label.
    pub fn catch_label(&mut self) -> CatchLabel {
        self.catch_labels += 1;
        CatchLabel(self.catch_labels - 1)
    }

    /// Binds `label` to the current position.
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.items.push(Pending::Bind(label));
        self
    }

    /// Binds a catch handler of type `catch_type` (`None` catches everything) here.
    pub fn bind_catch(&mut self, label: CatchLabel, catch_type: Option<DexType>) -> &mut Self {
        self.items.push(Pending::Catch(label, catch_type));
        self
    }

    /// Makes `next` the handler tried after `label`.
    pub fn catch_next(&mut self, label: CatchLabel, next: CatchLabel) -> &mut Self {
        self.catch_next.insert(label, next);
        self
    }

    /// Opens a try region handled by `label`'s chain.
    pub fn try_start(&mut self, label: CatchLabel) -> &mut Self {
        self.items.push(Pending::Try(TryKind::Start, label));
        self
    }

    /// Closes the try region handled by `label`'s chain.
    pub fn try_end(&mut self, label: CatchLabel) -> &mut Self {
        self.items.push(Pending::Try(TryKind::End, label));
        self
    }

    /// Appends any method item.
    pub fn item(&mut self, item: MethodItem) -> &mut Self {
        self.items.push(Pending::Item(item));
        self
    }

    /// Appends an instruction as-is.
    pub fn insn(&mut self, insn: IRInstruction) -> &mut Self {
        self.item(MethodItem::Insn(insn))
    }

    /// Appends a debug position.
    pub fn position(&mut self, position: Arc<DexPosition>) -> &mut Self {
        self.item(MethodItem::Position(position))
    }

    /// Appends a source block marker.
    pub fn source_block(&mut self, src: DexMethodRef, id: u32) -> &mut Self {
        self.item(MethodItem::SourceBlock(SourceBlock { src, id }))
    }

    fn op(&mut self, opcode: IROpcode, dest: Option<Reg>, srcs: &[Reg], operand: Operand) -> &mut Self {
        let mut insn = IRInstruction::new(opcode).with_srcs(srcs).with_operand(operand);
        if let Some(d) = dest {
            insn = insn.with_dest(d);
        }
        self.insn(insn)
    }

    fn with_pseudo(&mut self, insn: IRInstruction, dest: Reg) -> &mut Self {
        let pseudo = insn.opcode().pseudo_for_result();
        self.insn(insn);
        match pseudo {
            Some(op) => self.insn(IRInstruction::new(op).with_dest(dest)),
            None => invariant_failed!("opcode has no result pseudo"),
        }
    }

    /// `load-param vN`
    pub fn load_param(&mut self, reg: Reg) -> &mut Self {
        self.op(IROpcode::LoadParam, Some(reg), &[], Operand::None)
    }

    /// `load-param-object vN`
    pub fn load_param_object(&mut self, reg: Reg) -> &mut Self {
        self.op(IROpcode::LoadParamObject, Some(reg), &[], Operand::None)
    }

    /// `load-param-wide vN`
    pub fn load_param_wide(&mut self, reg: Reg) -> &mut Self {
        self.op(IROpcode::LoadParamWide, Some(reg), &[], Operand::None)
    }

    /// `const vN, value`
    pub fn const_int(&mut self, reg: Reg, value: i64) -> &mut Self {
        self.op(IROpcode::Const, Some(reg), &[], Operand::Literal(value))
    }

    /// `const-wide vN, value`
    pub fn const_wide(&mut self, reg: Reg, value: i64) -> &mut Self {
        self.op(IROpcode::ConstWide, Some(reg), &[], Operand::Literal(value))
    }

    /// `const-string` into `reg`.
    pub fn const_string(&mut self, reg: Reg, value: &str) -> &mut Self {
        let insn = IRInstruction::new(IROpcode::ConstString)
            .with_operand(Operand::String(DexString::make(value)));
        self.with_pseudo(insn, reg)
    }

    /// `const-class` into `reg`.
    pub fn const_class(&mut self, reg: Reg, ty: &str) -> &mut Self {
        let insn =
            IRInstruction::new(IROpcode::ConstClass).with_operand(Operand::Type(DexType::make(ty)));
        self.with_pseudo(insn, reg)
    }

    /// `new-instance` of `ty` into `reg`.
    pub fn new_instance(&mut self, reg: Reg, ty: &str) -> &mut Self {
        let insn = IRInstruction::new(IROpcode::NewInstance)
            .with_operand(Operand::Type(DexType::make(ty)));
        self.with_pseudo(insn, reg)
    }

    /// `new-array` of `ty` with length `len` into `reg`.
    pub fn new_array(&mut self, reg: Reg, len: Reg, ty: &str) -> &mut Self {
        let insn = IRInstruction::new(IROpcode::NewArray)
            .with_srcs(&[len])
            .with_operand(Operand::Type(DexType::make(ty)));
        self.with_pseudo(insn, reg)
    }

    /// `check-cast` of `src` to `ty`, result in `dest`.
    pub fn check_cast(&mut self, dest: Reg, src: Reg, ty: &str) -> &mut Self {
        let insn = IRInstruction::new(IROpcode::CheckCast)
            .with_srcs(&[src])
            .with_operand(Operand::Type(DexType::make(ty)));
        self.with_pseudo(insn, dest)
    }

    /// `instance-of` of `src` against `ty`, result in `dest`.
    pub fn instance_of(&mut self, dest: Reg, src: Reg, ty: &str) -> &mut Self {
        let insn = IRInstruction::new(IROpcode::InstanceOf)
            .with_srcs(&[src])
            .with_operand(Operand::Type(DexType::make(ty)));
        self.with_pseudo(insn, dest)
    }

    /// `array-length` of `array` into `dest`.
    pub fn array_length(&mut self, dest: Reg, array: Reg) -> &mut Self {
        let insn = IRInstruction::new(IROpcode::ArrayLength).with_srcs(&[array]);
        self.with_pseudo(insn, dest)
    }

    /// A register move (`move`, `move-wide`, `move-object`).
    pub fn mov(&mut self, opcode: IROpcode, dest: Reg, src: Reg) -> &mut Self {
        self.op(opcode, Some(dest), &[src], Operand::None)
    }

    /// `move-result*` into `dest`.
    pub fn move_result(&mut self, opcode: IROpcode, dest: Reg) -> &mut Self {
        self.op(opcode, Some(dest), &[], Operand::None)
    }

    /// `move-exception vN`
    pub fn move_exception(&mut self, dest: Reg) -> &mut Self {
        self.op(IROpcode::MoveException, Some(dest), &[], Operand::None)
    }

    /// An invoke of the method given as text.
    ///
    /// # Panics
    ///
    /// Aborts if `method` is not a valid method reference.
    pub fn invoke(&mut self, opcode: IROpcode, method: &str, args: &[Reg]) -> &mut Self {
        let method = parse_method(method);
        self.invoke_method(opcode, method, args)
    }

    /// An invoke of an existing method reference.
    pub fn invoke_method(&mut self, opcode: IROpcode, method: DexMethodRef, args: &[Reg]) -> &mut Self {
        self.op(opcode, None, args, Operand::Method(method))
    }

    /// `invoke-static`
    pub fn invoke_static(&mut self, method: &str, args: &[Reg]) -> &mut Self {
        self.invoke(IROpcode::InvokeStatic, method, args)
    }

    /// `invoke-virtual`
    pub fn invoke_virtual(&mut self, method: &str, args: &[Reg]) -> &mut Self {
        self.invoke(IROpcode::InvokeVirtual, method, args)
    }

    /// `invoke-direct`
    pub fn invoke_direct(&mut self, method: &str, args: &[Reg]) -> &mut Self {
        self.invoke(IROpcode::InvokeDirect, method, args)
    }

    /// `sget*` of `field` into `dest`; the opcode follows the field type.
    pub fn sget(&mut self, field: &str, dest: Reg) -> &mut Self {
        let field = parse_field(field);
        let insn = IRInstruction::new(field_opcodes(field.ty()).0)
            .with_operand(Operand::Field(field));
        self.with_pseudo(insn, dest)
    }

    /// `sput*` of `src` into `field`.
    pub fn sput(&mut self, field: &str, src: Reg) -> &mut Self {
        let field = parse_field(field);
        let op = field_opcodes(field.ty()).1;
        self.op(op, None, &[src], Operand::Field(field))
    }

    /// `iget*` of `field` on `obj` into `dest`.
    pub fn iget(&mut self, field: &str, dest: Reg, obj: Reg) -> &mut Self {
        let field = parse_field(field);
        let insn = IRInstruction::new(field_opcodes(field.ty()).2)
            .with_srcs(&[obj])
            .with_operand(Operand::Field(field));
        self.with_pseudo(insn, dest)
    }

    /// `iput*` of `src` into `field` on `obj`.
    pub fn iput(&mut self, field: &str, src: Reg, obj: Reg) -> &mut Self {
        let field = parse_field(field);
        let op = field_opcodes(field.ty()).3;
        self.op(op, None, &[src, obj], Operand::Field(field))
    }

    /// `aget*` of `array[index]` into `dest`.
    pub fn aget(&mut self, opcode: IROpcode, dest: Reg, array: Reg, index: Reg) -> &mut Self {
        let insn = IRInstruction::new(opcode).with_srcs(&[array, index]);
        self.with_pseudo(insn, dest)
    }

    /// `aput*` of `src` into `array[index]`.
    pub fn aput(&mut self, opcode: IROpcode, src: Reg, array: Reg, index: Reg) -> &mut Self {
        self.op(opcode, None, &[src, array, index], Operand::None)
    }

    /// A three-register binary operation.
    pub fn binop(&mut self, opcode: IROpcode, dest: Reg, a: Reg, b: Reg) -> &mut Self {
        self.op(opcode, Some(dest), &[a, b], Operand::None)
    }

    /// A binary operation with a literal operand.
    pub fn add_lit(&mut self, opcode: IROpcode, dest: Reg, src: Reg, literal: i64) -> &mut Self {
        self.op(opcode, Some(dest), &[src], Operand::Literal(literal))
    }

    /// A unary operation or conversion.
    pub fn unop(&mut self, opcode: IROpcode, dest: Reg, src: Reg) -> &mut Self {
        self.op(opcode, Some(dest), &[src], Operand::None)
    }

    /// `if-*z vN, label`
    pub fn if_z(&mut self, opcode: IROpcode, reg: Reg, target: Label) -> &mut Self {
        let insn = IRInstruction::new(opcode).with_srcs(&[reg]);
        self.items
            .push(Pending::Branch(insn, vec![(target, TargetKind::Simple)]));
        self
    }

    /// `if-* vA, vB, label`
    pub fn if_cmp(&mut self, opcode: IROpcode, a: Reg, b: Reg, target: Label) -> &mut Self {
        let insn = IRInstruction::new(opcode).with_srcs(&[a, b]);
        self.items
            .push(Pending::Branch(insn, vec![(target, TargetKind::Simple)]));
        self
    }

    /// `goto label`
    pub fn goto(&mut self, target: Label) -> &mut Self {
        let insn = IRInstruction::new(IROpcode::Goto);
        self.items
            .push(Pending::Branch(insn, vec![(target, TargetKind::Simple)]));
        self
    }

    /// `switch vN` over `cases`; control falls through when no key matches.
    pub fn switch(&mut self, reg: Reg, cases: &[(i32, Label)]) -> &mut Self {
        let insn = IRInstruction::new(IROpcode::Switch).with_srcs(&[reg]);
        let targets = cases
            .iter()
            .map(|&(k, l)| (l, TargetKind::Case(k)))
            .collect();
        self.items.push(Pending::Branch(insn, targets));
        self
    }

    /// `return vN`
    pub fn ret(&mut self, reg: Reg) -> &mut Self {
        self.op(IROpcode::Return, None, &[reg], Operand::None)
    }

    /// `return-object vN`
    pub fn ret_object(&mut self, reg: Reg) -> &mut Self {
        self.op(IROpcode::ReturnObject, None, &[reg], Operand::None)
    }

    /// `return-wide vN`
    pub fn ret_wide(&mut self, reg: Reg) -> &mut Self {
        self.op(IROpcode::ReturnWide, None, &[reg], Operand::None)
    }

    /// `return-void`
    pub fn return_void(&mut self) -> &mut Self {
        self.op(IROpcode::ReturnVoid, None, &[], Operand::None)
    }

    /// `throw vN`
    pub fn throw(&mut self, reg: Reg) -> &mut Self {
        self.op(IROpcode::Throw, None, &[reg], Operand::None)
    }

    /// Resolves labels and produces the list.
    ///
    /// # Panics
    ///
    /// Aborts if a used label was never bound.
    #[must_use]
    pub fn build_list(&self) -> IRList {
        // Number of targets each label produces where it is bound.
        let mut uses: HashMap<Label, Vec<(usize, TargetKind)>> = HashMap::new();
        for (i, p) in self.items.iter().enumerate() {
            if let Pending::Branch(_, targets) = p {
                for &(label, kind) in targets {
                    uses.entry(label).or_default().push((i, kind));
                }
            }
        }

        // Item ids are assigned sequentially by a fresh list.
        let mut next = 0u32;
        let mut branch_ids: HashMap<usize, ItemId> = HashMap::new();
        let mut catch_ids: HashMap<CatchLabel, ItemId> = HashMap::new();
        let mut bound: Vec<Label> = Vec::new();
        for (i, p) in self.items.iter().enumerate() {
            match p {
                Pending::Bind(label) => {
                    bound.push(*label);
                    next += uses.get(label).map_or(0, Vec::len) as u32;
                }
                Pending::Branch(..) => {
                    branch_ids.insert(i, ItemId(next));
                    next += 1;
                }
                Pending::Catch(label, _) => {
                    catch_ids.insert(*label, ItemId(next));
                    next += 1;
                }
                _ => next += 1,
            }
        }
        for label in uses.keys() {
            invariant!(bound.contains(label), "label {:?} is never bound", label);
        }

        let mut list = IRList::new();
        for p in &self.items {
            match p {
                Pending::Item(item) => {
                    list.push_back(item.clone());
                }
                Pending::Branch(insn, _) => {
                    list.push_back(insn.clone());
                }
                Pending::Bind(label) => {
                    for &(branch, kind) in uses.get(label).into_iter().flatten() {
                        list.push_back(MethodItem::Target(BranchTarget {
                            src: branch_ids[&branch],
                            kind,
                        }));
                    }
                }
                Pending::Try(kind, label) => {
                    let Some(&catch_start) = catch_ids.get(label) else {
                        invariant_failed!("catch label {:?} is never bound", label);
                    };
                    list.push_back(MethodItem::Try(TryMarker {
                        kind: *kind,
                        catch_start,
                    }));
                }
                Pending::Catch(label, catch_type) => {
                    let next = self
                        .catch_next
                        .get(label)
                        .and_then(|n| catch_ids.get(n).copied());
                    list.push_back(MethodItem::Catch(CatchEntry {
                        catch_type: catch_type.clone(),
                        next,
                    }));
                }
            }
        }
        list
    }

    /// Produces the method body.
    #[must_use]
    pub fn build(&self) -> IRCode {
        IRCode::new(self.build_list(), self.registers_size)
    }

    /// Produces the body and builds its CFG.
    #[must_use]
    pub fn build_cfg(&self) -> ControlFlowGraph {
        ControlFlowGraph::build(self.build_list(), self.registers_size)
    }
}

fn parse_method(text: &str) -> DexMethodRef {
    match DexMethodRef::parse(text) {
        Ok(m) => m,
        Err(e) => invariant_failed!("bad method reference {}: {}", text, e),
    }
}

fn parse_field(text: &str) -> DexFieldRef {
    match DexFieldRef::parse(text) {
        Ok(f) => f,
        Err(e) => invariant_failed!("bad field reference {}: {}", text, e),
    }
}

/// `(sget, sput, iget, iput)` opcodes for a field type.
#[must_use]
pub fn field_opcodes(ty: &DexType) -> (IROpcode, IROpcode, IROpcode, IROpcode) {
    use IROpcode as Op;
    match ty.category() {
        TypeCategory::Long | TypeCategory::Double => {
            (Op::SgetWide, Op::SputWide, Op::IgetWide, Op::IputWide)
        }
        TypeCategory::Reference => (Op::SgetObject, Op::SputObject, Op::IgetObject, Op::IputObject),
        TypeCategory::Boolean => (Op::SgetBoolean, Op::SputBoolean, Op::IgetBoolean, Op::IputBoolean),
        TypeCategory::Byte => (Op::SgetByte, Op::SputByte, Op::IgetByte, Op::IputByte),
        TypeCategory::Char => (Op::SgetChar, Op::SputChar, Op::IgetChar, Op::IputChar),
        TypeCategory::Short => (Op::SgetShort, Op::SputShort, Op::IgetShort, Op::IputShort),
        _ => (Op::Sget, Op::Sput, Op::Iget, Op::Iput),
    }
}
