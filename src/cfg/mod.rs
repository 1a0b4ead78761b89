//! Control-flow graph for one compilation
//!
//! Blocks and instructions live in `Vec` arenas inside a
//! [`CompilationUnit`] and are addressed by [`BlockId`] / [`MirId`] handles,
//! so predecessor, dominator and loop-membership sets can be plain bit sets
//! over block indices.

use std::collections::VecDeque;

use rustc_hash::FxHashSet;

use crate::config::JitConfig;
use crate::loops::LoopInformation;
use crate::mir::{DecodedInsn, Mir};

pub mod ssa;

// ==================== Handles and bit sets ====================

/// Handle of a basic block in the unit arena
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle of an instruction in the unit arena
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MirId(pub u32);

impl MirId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A growable bit set over small integer handles
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, idx: usize) {
        let word = idx / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (idx % 64);
    }

    pub fn clear_bit(&mut self, idx: usize) {
        let word = idx / 64;
        if word < self.words.len() {
            self.words[word] &= !(1 << (idx % 64));
        }
    }

    pub fn contains(&self, idx: usize) -> bool {
        let word = idx / 64;
        word < self.words.len() && self.words[word] & (1 << (idx % 64)) != 0
    }

    pub fn clear_all(&mut self) {
        self.words.clear();
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Lowest set bit, if any
    pub fn first(&self) -> Option<usize> {
        self.iter().next()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, w)| {
            (0..64).filter_map(move |b| {
                if w & (1u64 << b) != 0 {
                    Some(wi * 64 + b)
                } else {
                    None
                }
            })
        })
    }

    /// Intersect in place, keeping only bits present in both sets
    pub fn intersect_with(&mut self, other: &BitSet) -> bool {
        let mut changed = false;
        for (wi, word) in self.words.iter_mut().enumerate() {
            let other_word = other.words.get(wi).copied().unwrap_or(0);
            let new = *word & other_word;
            if new != *word {
                *word = new;
                changed = true;
            }
        }
        changed
    }

    /// Union in place
    pub fn union_with(&mut self, other: &BitSet) -> bool {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        let mut changed = false;
        for (wi, other_word) in other.words.iter().enumerate() {
            let new = self.words[wi] | other_word;
            if new != self.words[wi] {
                self.words[wi] = new;
                changed = true;
            }
        }
        changed
    }

    /// A set with bits `0..n` all set
    pub fn all(n: usize) -> Self {
        let mut set = Self::new();
        for i in 0..n {
            set.set(i);
        }
        set
    }
}

// ==================== Blocks ====================

/// What a basic block represents in the translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    /// Trace entry
    Entry,
    /// Trace exit
    Exit,
    /// Straight-line bytecode
    Code,
    /// Punt to the interpreter on exception
    ExceptionHandler,
    /// Chaining cell: branch back to a not-yet-compiled target
    ChainingCellNormal,
    /// Chaining cell for a hot target
    ChainingCellHot,
    /// Chaining cell for a monomorphic invoke
    ChainingCellInvokeSingleton,
    /// Chaining cell for a polymorphic invoke, patched at runtime
    ChainingCellInvokePredicted,
    /// Chaining cell on a loop backward branch
    ChainingCellBackwardBranch,
}

impl BlockType {
    pub fn is_chaining_cell(self) -> bool {
        matches!(
            self,
            BlockType::ChainingCellNormal
                | BlockType::ChainingCellHot
                | BlockType::ChainingCellInvokeSingleton
                | BlockType::ChainingCellInvokePredicted
                | BlockType::ChainingCellBackwardBranch
        )
    }
}

/// Compilation shape of the current request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitMode {
    /// Straight-line hot trace
    Trace,
    /// Trace forming a loop; loop passes apply
    Loop,
    /// Whole-method compile
    Method,
}

/// One basic block
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BlockId,
    pub block_type: BlockType,
    /// Bytecode offset of the first instruction
    pub start_offset: u32,
    pub taken: Option<BlockId>,
    pub fall_through: Option<BlockId>,
    /// Instructions in layout order
    pub mirs: Vec<MirId>,
    pub predecessors: BitSet,
    /// Blocks dominating this one, including itself
    pub dominators: BitSet,
    /// Unlinked from the CFG but still in the arena
    pub hidden: bool,
}

impl BasicBlock {
    fn new(id: BlockId, block_type: BlockType) -> Self {
        Self {
            id,
            block_type,
            start_offset: 0,
            taken: None,
            fall_through: None,
            mirs: Vec::new(),
            predecessors: BitSet::new(),
            dominators: BitSet::new(),
            hidden: false,
        }
    }

    /// Successor blocks, taken edge first
    pub fn successors(&self) -> impl Iterator<Item = BlockId> {
        [self.taken, self.fall_through].into_iter().flatten()
    }

    pub fn last_mir(&self) -> Option<MirId> {
        self.mirs.last().copied()
    }
}

// ==================== Compilation unit ====================

/// All state for compiling one trace
#[derive(Debug, Clone)]
pub struct CompilationUnit {
    /// Method the trace belongs to, for diagnostics
    pub method: String,
    pub start_offset: u32,
    pub config: JitConfig,
    pub jit_mode: JitMode,
    pub blocks: Vec<BasicBlock>,
    pub mirs: Vec<Mir>,
    pub entry_block: BlockId,
    pub exit_block: BlockId,
    /// Virtual registers of the method frame; scratch registers are
    /// allocated above this number
    pub num_vregs: u32,
    scratch_allocated: u32,
    /// Loop-mode compilation must be abandoned; fall back to a plain trace
    pub quit_loop_mode: bool,
    /// Verbose diagnostics for the currently running pass
    pub print_pass: bool,
    /// Top-level loops of the CFG, rebuilt by the driver bookkeeping
    pub loops: Vec<LoopInformation>,
    /// Reference-pool indices that failed resolution
    pub unresolved_refs: FxHashSet<u32>,
    next_offset: u32,
}

impl CompilationUnit {
    pub fn new(method: impl Into<String>, num_vregs: u32, config: JitConfig) -> Self {
        let mut unit = Self {
            method: method.into(),
            start_offset: 0,
            config,
            jit_mode: JitMode::Trace,
            blocks: Vec::new(),
            mirs: Vec::new(),
            entry_block: BlockId(0),
            exit_block: BlockId(0),
            num_vregs,
            scratch_allocated: 0,
            quit_loop_mode: false,
            print_pass: false,
            loops: Vec::new(),
            unresolved_refs: FxHashSet::default(),
            next_offset: 0,
        };
        unit.entry_block = unit.new_block(BlockType::Entry);
        unit.exit_block = unit.new_block(BlockType::Exit);
        unit
    }

    pub fn new_block(&mut self, block_type: BlockType) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::new(id, block_type));
        id
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.index()]
    }

    pub fn mir(&self, id: MirId) -> &Mir {
        &self.mirs[id.index()]
    }

    pub fn mir_mut(&mut self, id: MirId) -> &mut Mir {
        &mut self.mirs[id.index()]
    }

    pub fn new_mir(&mut self, insn: DecodedInsn) -> MirId {
        let id = MirId(self.mirs.len() as u32);
        let offset = self.next_offset;
        self.next_offset += 1;
        self.mirs.push(Mir::new(insn, offset));
        id
    }

    /// Create an instruction and append it to `block`
    pub fn push_insn(&mut self, block: BlockId, insn: DecodedInsn) -> MirId {
        let id = self.new_mir(insn);
        self.block_mut(block).mirs.push(id);
        id
    }

    pub fn append_mir(&mut self, block: BlockId, mir: MirId) {
        self.block_mut(block).mirs.push(mir);
    }

    pub fn prepend_mir(&mut self, block: BlockId, mir: MirId) {
        self.block_mut(block).mirs.insert(0, mir);
    }

    /// Insert `mir` right before `anchor` inside `block`
    pub fn insert_mir_before(&mut self, block: BlockId, anchor: MirId, mir: MirId) {
        let bb = self.block_mut(block);
        let pos = bb.mirs.iter().position(|m| *m == anchor).unwrap_or(0);
        bb.mirs.insert(pos, mir);
    }

    pub fn remove_mir(&mut self, block: BlockId, mir: MirId) -> bool {
        let bb = self.block_mut(block);
        match bb.mirs.iter().position(|m| *m == mir) {
            Some(pos) => {
                bb.mirs.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Duplicate an instruction, remembering its origin
    pub fn copy_mir(&mut self, src: MirId) -> MirId {
        let mut mir = self.mir(src).clone();
        mir.ssa = None;
        mir.copied_from = Some(src);
        let id = MirId(self.mirs.len() as u32);
        self.mirs.push(mir);
        id
    }

    /// Duplicate a block and its instructions; edges are copied as-is and
    /// must be rewired by the caller
    pub fn copy_block(&mut self, src: BlockId) -> BlockId {
        let (block_type, start_offset, taken, fall_through, src_mirs) = {
            let bb = self.block(src);
            (
                bb.block_type,
                bb.start_offset,
                bb.taken,
                bb.fall_through,
                bb.mirs.clone(),
            )
        };
        let id = self.new_block(block_type);
        let copies: Vec<MirId> = src_mirs.iter().map(|m| self.copy_mir(*m)).collect();
        let bb = self.block_mut(id);
        bb.start_offset = start_offset;
        bb.taken = taken;
        bb.fall_through = fall_through;
        bb.mirs = copies;
        id
    }

    /// Allocate a scratch virtual register above the frame registers
    pub fn get_free_scratch_register(&mut self) -> Option<u32> {
        if self.scratch_allocated < self.config.max_scratch_registers {
            let reg = self.num_vregs + self.scratch_allocated;
            self.scratch_allocated += 1;
            Some(reg)
        } else {
            None
        }
    }

    /// Highest virtual register number in use, frame plus scratch
    pub fn vreg_capacity(&self) -> u32 {
        // Leave headroom for the placeholder registers the vectorizer
        // fabricates above the scratch range.
        self.num_vregs + self.config.max_scratch_registers + 4
    }

    /// The block currently holding `mir`, if any
    pub fn block_of(&self, mir: MirId) -> Option<BlockId> {
        self.blocks
            .iter()
            .find(|bb| bb.mirs.contains(&mir))
            .map(|bb| bb.id)
    }

    // ==================== CFG bookkeeping ====================

    pub fn compute_predecessors(&mut self) {
        for i in 0..self.blocks.len() {
            self.blocks[i].predecessors.clear_all();
        }
        for i in 0..self.blocks.len() {
            if self.blocks[i].hidden {
                continue;
            }
            let succs: Vec<BlockId> = self.blocks[i].successors().collect();
            for s in succs {
                self.blocks[s.index()].predecessors.set(i);
            }
        }
    }

    /// Iterative dominator computation over the predecessor sets
    pub fn compute_dominators(&mut self) {
        let n = self.blocks.len();
        let full = BitSet::all(n);
        for b in &mut self.blocks {
            b.dominators = full.clone();
        }
        let entry = self.entry_block.index();
        self.blocks[entry].dominators = {
            let mut only = BitSet::new();
            only.set(entry);
            only
        };

        let order = self.preorder();
        let mut changed = true;
        while changed {
            changed = false;
            for &id in &order {
                if id == self.entry_block {
                    continue;
                }
                let preds: Vec<usize> = self.blocks[id.index()].predecessors.iter().collect();
                let mut new = full.clone();
                for p in &preds {
                    new.intersect_with(&self.blocks[*p].dominators);
                }
                new.set(id.index());
                if new != self.blocks[id.index()].dominators {
                    self.blocks[id.index()].dominators = new;
                    changed = true;
                }
            }
        }
    }

    /// Does `a` dominate `b`?
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        self.block(b).dominators.contains(a.index())
    }

    /// Reachable blocks in depth-first preorder
    pub fn preorder(&self) -> Vec<BlockId> {
        let mut order = Vec::new();
        let mut seen = BitSet::new();
        let mut stack = vec![self.entry_block];
        while let Some(id) = stack.pop() {
            if seen.contains(id.index()) || self.block(id).hidden {
                continue;
            }
            seen.set(id.index());
            order.push(id);
            // Push fall-through last so it is visited first.
            if let Some(t) = self.block(id).taken {
                stack.push(t);
            }
            if let Some(f) = self.block(id).fall_through {
                stack.push(f);
            }
        }
        order
    }

    /// Reachable blocks in breadth-first order
    pub fn breadth_first(&self) -> Vec<BlockId> {
        let mut order = Vec::new();
        let mut seen = BitSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(self.entry_block);
        while let Some(id) = queue.pop_front() {
            if seen.contains(id.index()) || self.block(id).hidden {
                continue;
            }
            seen.set(id.index());
            order.push(id);
            for s in self.block(id).successors() {
                queue.push_back(s);
            }
        }
        order
    }

    /// Reachable blocks ordered so every block follows its forward-edge
    /// predecessors (reverse postorder; backedges are the only exception)
    pub fn predecessors_first(&self) -> Vec<BlockId> {
        let mut order = self.postorder();
        order.reverse();
        order
    }

    /// Reachable blocks in depth-first postorder
    pub fn postorder(&self) -> Vec<BlockId> {
        let mut order = Vec::new();
        let mut seen = BitSet::new();
        self.postorder_visit(self.entry_block, &mut seen, &mut order);
        order
    }

    fn postorder_visit(&self, id: BlockId, seen: &mut BitSet, order: &mut Vec<BlockId>) {
        if seen.contains(id.index()) || self.block(id).hidden {
            return;
        }
        seen.set(id.index());
        for s in self.block(id).successors() {
            self.postorder_visit(s, seen, order);
        }
        order.push(id);
    }

    /// Immediate dominator of every reachable block
    pub fn immediate_dominators(&self) -> Vec<Option<BlockId>> {
        let n = self.blocks.len();
        let mut idom = vec![None; n];
        for b in 0..n {
            if BlockId(b as u32) == self.entry_block || self.blocks[b].hidden {
                continue;
            }
            let doms = &self.blocks[b].dominators;
            // The immediate dominator is the strict dominator with the
            // largest dominator set of its own.
            let mut best: Option<usize> = None;
            for d in doms.iter() {
                if d == b {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some(cur) => {
                        self.blocks[d].dominators.count() > self.blocks[cur].dominators.count()
                    }
                };
                if better {
                    best = Some(d);
                }
            }
            idom[b] = best.map(|d| BlockId(d as u32));
        }
        idom
    }

    /// Reachable blocks ordered so every block follows all blocks it
    /// dominates
    pub fn dom_postorder(&self) -> Vec<BlockId> {
        let idom = self.immediate_dominators();
        let n = self.blocks.len();
        let mut children: Vec<Vec<BlockId>> = vec![Vec::new(); n];
        for (b, parent) in idom.iter().enumerate() {
            if let Some(p) = parent {
                children[p.index()].push(BlockId(b as u32));
            }
        }
        let mut order = Vec::new();
        let mut stack = vec![(self.entry_block, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            stack.push((id, true));
            for c in &children[id.index()] {
                stack.push((*c, false));
            }
        }
        order
    }

    /// Recompute predecessors, dominators and SSA; optionally rebuild the
    /// loop information as well
    pub fn compute_basic_block_information(&mut self, rebuild_loops: bool) {
        self.compute_predecessors();
        self.compute_dominators();
        ssa::compute_ssa(self);
        if rebuild_loops {
            self.loops = LoopInformation::build(self);
        }
    }
}
