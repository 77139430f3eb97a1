//! Helpers shared by the CFG-based passes.

use crate::{
    ir::{cfg::ControlFlowGraph, IRCode},
    model::DexMethod,
};

/// Runs `f` on the CFG of `method`'s body and linearizes the result.
///
/// When `f` reports no change the body is restored byte for byte, so passes that find
/// nothing to do cause no layout churn. Methods without a body are skipped.
pub(crate) fn with_cfg<R: Changed>(method: &mut DexMethod, f: impl FnOnce(&mut ControlFlowGraph) -> R) -> R {
    let Some(code) = method.code_mut() else {
        return R::unchanged();
    };
    with_code_cfg(code, f)
}

/// [`with_cfg`] on a bare body.
pub(crate) fn with_code_cfg<R: Changed>(code: &mut IRCode, f: impl FnOnce(&mut ControlFlowGraph) -> R) -> R {
    if code.cfg_built() {
        return f(code.cfg_mut());
    }
    let snapshot = code.clone();
    code.build_cfg();
    let result = f(code.cfg_mut());
    if result.changed() {
        code.clear_cfg();
    } else {
        *code = snapshot;
    }
    result
}

/// Result of a per-method transformation.
pub(crate) trait Changed {
    /// The result reported for skipped methods.
    fn unchanged() -> Self;
    /// `true` if the code was modified.
    fn changed(&self) -> bool;
}

impl Changed for bool {
    fn unchanged() -> Self {
        false
    }

    fn changed(&self) -> bool {
        *self
    }
}

impl Changed for usize {
    fn unchanged() -> Self {
        0
    }

    fn changed(&self) -> bool {
        *self > 0
    }
}
