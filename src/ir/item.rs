//! Method items: the nodes of an IR list.

use std::{fmt, sync::Arc};

use crate::{
    ir::IRInstruction,
    pool::{DexMethodRef, DexString, DexType},
};

/// Stable identifier of an item inside one [`crate::ir::IRList`].
///
/// Identifiers are never reused while the list lives, so branch targets and catch chains can
/// refer to other items by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(pub(crate) u32);

impl ItemId {
    /// The raw index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which edge of a branch a target stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    /// The destination of a `goto` or the taken edge of an `if-*`.
    Simple,
    /// A switch case with the given key.
    Case(i32),
}

/// A label: the destination of exactly one branch edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BranchTarget {
    /// The branch instruction jumping here.
    pub src: ItemId,
    /// Which of the branch's edges this is.
    pub kind: TargetKind,
}

/// Start or end of a try region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TryKind {
    /// Opens the region.
    Start,
    /// Closes the region.
    End,
}

/// A try-region marker. Both markers of a region name the head of its catch chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TryMarker {
    /// Start or end.
    pub kind: TryKind,
    /// The first `Catch` item of the region's handler chain.
    pub catch_start: ItemId,
}

/// A catch handler entry. Entries form a chain tried in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CatchEntry {
    /// Exception type caught; `None` catches everything.
    pub catch_type: Option<DexType>,
    /// The next handler of the chain.
    pub next: Option<ItemId>,
}

/// A source position. Inlined code carries the call site as its parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DexPosition {
    /// Method the position belongs to.
    pub method: Option<DexMethodRef>,
    /// Source file.
    pub file: Option<DexString>,
    /// Line number.
    pub line: u32,
    /// Enclosing frame for inlined code.
    pub parent: Option<Arc<DexPosition>>,
}

impl DexPosition {
    /// Creates a root position.
    #[must_use]
    pub fn new(method: Option<DexMethodRef>, file: Option<DexString>, line: u32) -> Arc<Self> {
        Arc::new(Self {
            method,
            file,
            line,
            parent: None,
        })
    }

    /// Number of frames in the parent chain, counting this one.
    #[must_use]
    pub fn depth(&self) -> usize {
        1 + self.parent.as_ref().map_or(0, |p| p.depth())
    }

    /// Returns a copy of this position whose outermost frame is re-parented onto `caller`.
    ///
    /// Used by the inliner: a callee position `bar:12` inlined at `foo:3` becomes
    /// `bar:12 <- foo:3`, and an already inlined chain keeps its inner frames.
    #[must_use]
    pub fn reparented(&self, caller: &Arc<DexPosition>) -> Arc<DexPosition> {
        let parent = match &self.parent {
            Some(p) => p.reparented(caller),
            None => caller.clone(),
        };
        Arc::new(DexPosition {
            method: self.method.clone(),
            file: self.file.clone(),
            line: self.line,
            parent: Some(parent),
        })
    }
}

impl fmt::Display for DexPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.method {
            Some(m) => write!(f, "{m}")?,
            None => f.write_str("<unknown>")?,
        }
        match &self.file {
            Some(file) => write!(f, "({}:{})", file, self.line)?,
            None => write!(f, "(:{})", self.line)?,
        }
        if let Some(p) = &self.parent {
            write!(f, " <- {p}")?;
        }
        Ok(())
    }
}

/// Provenance marker left by passes and profile-guided tooling.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceBlock {
    /// Method the block originally belonged to.
    pub src: DexMethodRef,
    /// Block identifier within that method.
    pub id: u32,
}

/// A node of the IR list.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodItem {
    /// An instruction.
    Insn(IRInstruction),
    /// A branch destination.
    Target(BranchTarget),
    /// A try-region marker.
    Try(TryMarker),
    /// A catch handler entry; the handler code follows it.
    Catch(CatchEntry),
    /// A debug position applying to the following instructions.
    Position(Arc<DexPosition>),
    /// A provenance marker.
    SourceBlock(SourceBlock),
}

impl MethodItem {
    /// The instruction, if this is one.
    #[must_use]
    pub fn insn(&self) -> Option<&IRInstruction> {
        match self {
            MethodItem::Insn(i) => Some(i),
            _ => None,
        }
    }

    /// Mutable access to the instruction, if this is one.
    pub fn insn_mut(&mut self) -> Option<&mut IRInstruction> {
        match self {
            MethodItem::Insn(i) => Some(i),
            _ => None,
        }
    }

    /// `true` for instructions.
    #[must_use]
    pub fn is_insn(&self) -> bool {
        matches!(self, MethodItem::Insn(_))
    }

    /// The position, if this is one.
    #[must_use]
    pub fn position(&self) -> Option<&Arc<DexPosition>> {
        match self {
            MethodItem::Position(p) => Some(p),
            _ => None,
        }
    }
}

impl From<IRInstruction> for MethodItem {
    fn from(insn: IRInstruction) -> Self {
        MethodItem::Insn(insn)
    }
}

impl fmt::Display for MethodItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodItem::Insn(i) => write!(f, "{i}"),
            MethodItem::Target(t) => match t.kind {
                TargetKind::Simple => write!(f, "TARGET {}", t.src),
                TargetKind::Case(k) => write!(f, "TARGET {} case {k}", t.src),
            },
            MethodItem::Try(t) => match t.kind {
                TryKind::Start => write!(f, "TRY_START {}", t.catch_start),
                TryKind::End => write!(f, "TRY_END {}", t.catch_start),
            },
            MethodItem::Catch(c) => {
                match &c.catch_type {
                    Some(t) => write!(f, "CATCH {t}")?,
                    None => f.write_str("CATCH <any>")?,
                }
                if let Some(n) = c.next {
                    write!(f, " next {n}")?;
                }
                Ok(())
            }
            MethodItem::Position(p) => write!(f, "POSITION {p}"),
            MethodItem::SourceBlock(s) => write!(f, "SOURCE_BLOCK {}@{}", s.src, s.id),
        }
    }
}
