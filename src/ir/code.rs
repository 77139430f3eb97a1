//! A method body.

use std::fmt;

use crate::{
    ir::{cfg::ControlFlowGraph, IRInstruction, IRList, MethodItem},
    pool::DexString,
};

/// Debug information that is not expressed through position items.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DebugItem {
    /// Parameter names, one per declared parameter (not counting `this`).
    pub param_names: Vec<Option<DexString>>,
}

#[derive(Debug, Clone)]
enum Body {
    List(IRList),
    Cfg(ControlFlowGraph),
}

/// The code of a method.
///
/// Exactly one of the IR list and the editable CFG is authoritative at a time.
/// [`IRCode::build_cfg`] turns the list into a CFG and [`IRCode::clear_cfg`] linearizes it
/// back. While the CFG is built, [`IRCode::list`] aborts.
#[derive(Debug, Clone)]
pub struct IRCode {
    registers_size: u32,
    body: Body,
    debug: Option<DebugItem>,
}

impl IRCode {
    /// Wraps a list.
    #[must_use]
    pub fn new(list: IRList, registers_size: u32) -> Self {
        Self {
            registers_size,
            body: Body::List(list),
            debug: None,
        }
    }

    /// Number of registers.
    #[must_use]
    pub fn registers_size(&self) -> u32 {
        match &self.body {
            Body::List(_) => self.registers_size,
            Body::Cfg(cfg) => cfg.registers_size(),
        }
    }

    /// Sets the register count.
    pub fn set_registers_size(&mut self, size: u32) {
        self.registers_size = size;
        if let Body::Cfg(cfg) = &mut self.body {
            cfg.set_registers_size(size);
        }
    }

    /// The debug item.
    #[must_use]
    pub fn debug(&self) -> Option<&DebugItem> {
        self.debug.as_ref()
    }

    /// Attaches a debug item.
    pub fn set_debug(&mut self, debug: Option<DebugItem>) {
        self.debug = debug;
    }

    /// `true` while the CFG is authoritative.
    #[must_use]
    pub fn cfg_built(&self) -> bool {
        matches!(self.body, Body::Cfg(_))
    }

    /// Builds the editable CFG. Does nothing if it is already built.
    pub fn build_cfg(&mut self) {
        if let Body::List(list) = &mut self.body {
            let list = std::mem::take(list);
            self.body = Body::Cfg(ControlFlowGraph::build(list, self.registers_size));
        }
    }

    /// Linearizes the CFG back into a list. Does nothing if no CFG is built.
    pub fn clear_cfg(&mut self) {
        if let Body::Cfg(cfg) = &mut self.body {
            let cfg = std::mem::replace(cfg, ControlFlowGraph::empty(0));
            self.registers_size = cfg.registers_size();
            self.body = Body::List(cfg.linearize());
        }
    }

    /// The IR list.
    ///
    /// # Panics
    ///
    /// Aborts while the CFG is authoritative.
    #[must_use]
    pub fn list(&self) -> &IRList {
        match &self.body {
            Body::List(list) => list,
            Body::Cfg(_) => invariant_failed!("list access while the CFG is authoritative"),
        }
    }

    /// Mutable IR list.
    ///
    /// # Panics
    ///
    /// Aborts while the CFG is authoritative.
    pub fn list_mut(&mut self) -> &mut IRList {
        match &mut self.body {
            Body::List(list) => list,
            Body::Cfg(_) => invariant_failed!("list access while the CFG is authoritative"),
        }
    }

    /// The CFG.
    ///
    /// # Panics
    ///
    /// Aborts if no CFG is built.
    #[must_use]
    pub fn cfg(&self) -> &ControlFlowGraph {
        match &self.body {
            Body::Cfg(cfg) => cfg,
            Body::List(_) => invariant_failed!("CFG access before build_cfg"),
        }
    }

    /// Mutable CFG.
    ///
    /// # Panics
    ///
    /// Aborts if no CFG is built.
    pub fn cfg_mut(&mut self) -> &mut ControlFlowGraph {
        match &mut self.body {
            Body::Cfg(cfg) => cfg,
            Body::List(_) => invariant_failed!("CFG access before build_cfg"),
        }
    }

    /// All instructions, in list order or CFG block order.
    #[must_use]
    pub fn instructions(&self) -> Vec<&IRInstruction> {
        match &self.body {
            Body::List(list) => list.instructions().map(|(_, i)| i).collect(),
            Body::Cfg(cfg) => cfg.instructions().into_iter().map(|(_, i)| i).collect(),
        }
    }

    /// Number of instructions, not counting `load-param*` and result pseudos.
    #[must_use]
    pub fn count_opcodes(&self) -> usize {
        match &self.body {
            Body::List(list) => list.count_opcodes(),
            Body::Cfg(cfg) => cfg.num_opcodes(),
        }
    }

    /// Estimated size in code units.
    #[must_use]
    pub fn sum_opcode_sizes(&self) -> u32 {
        match &self.body {
            Body::List(list) => list.sum_opcode_sizes(),
            Body::Cfg(cfg) => cfg.sum_opcode_sizes(),
        }
    }

    /// The `load-param*` instructions in order.
    #[must_use]
    pub fn params(&self) -> Vec<&IRInstruction> {
        self.instructions()
            .into_iter()
            .take_while(|i| i.opcode().is_load_param())
            .collect()
    }

    /// `true` if the body contains try regions (list form) or throw edges (CFG form).
    #[must_use]
    pub fn has_try_regions(&self) -> bool {
        match &self.body {
            Body::List(list) => list.iter().any(|(_, i)| matches!(i, MethodItem::Try(_))),
            Body::Cfg(cfg) => cfg.block_ids().any(|b| !cfg.throw_edges(b).is_empty()),
        }
    }
}

impl fmt::Display for IRCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "registers: {}", self.registers_size())?;
        match &self.body {
            Body::List(list) => {
                for (id, item) in list.iter() {
                    writeln!(f, "{id:>5}  {item}")?;
                }
                Ok(())
            }
            Body::Cfg(cfg) => write!(f, "{cfg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::{CodeBuilder, IROpcode};

    #[test]
    fn test_build_and_clear() {
        let mut b = CodeBuilder::new(2);
        b.load_param(0).add_lit(IROpcode::AddIntLit, 1, 0, 1).ret(1);
        let mut code = b.build();
        assert_eq!(code.count_opcodes(), 2);
        code.build_cfg();
        assert!(code.cfg_built());
        assert_eq!(code.count_opcodes(), 2);
        code.clear_cfg();
        assert!(!code.cfg_built());
        assert_eq!(code.params().len(), 1);
        assert_eq!(code.registers_size(), 2);
    }

    #[test]
    #[should_panic(expected = "CFG is authoritative")]
    fn test_list_access_while_cfg_built() {
        let mut b = CodeBuilder::new(0);
        b.return_void();
        let mut code = b.build();
        code.build_cfg();
        let _ = code.list();
    }
}
