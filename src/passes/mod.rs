//! Optimization pass driver
//!
//! A [`Pass`] bundles a gate, optional start/end handlers, an optional
//! per-block work function, a traversal order and a set of invalidation
//! flags. The driver walks a [`PassList`], runs each pass whose gate accepts
//! the unit, and recomputes CFG bookkeeping afterwards according to the
//! flags. The list is terminated by an unnamed sentinel and can be mutated
//! by name, so embedders can splice their own passes into the pipeline.

use bitflags::bitflags;
use tracing::{debug, info, warn};

use crate::cfg::{BlockId, CompilationUnit, JitMode};
use crate::config::JitConfig;
use crate::{loops, sinking, vectorize};

bitflags! {
    /// What a pass may have invalidated
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PassFlags: u32 {
        /// Blocks or edges changed
        const BASIC_BLOCK_CHANGE = 1 << 0;
        /// Loop structure changed
        const LOOP_STRUCTURE_CHANGE = 1 << 1;
        /// Def-use information changed
        const DEF_USE_CHANGE = 1 << 2;
        /// Repeat the traversal until no work function reports a change
        const NEED_ITERATIVE = 1 << 3;
    }
}

/// Block visit order for a pass's work function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traversal {
    /// Every block in the arena, including unreachable ones
    AllNodes,
    /// Blocks reachable from the entry
    ReachableNodes,
    /// Depth-first preorder
    PreOrderDfs,
    /// Depth-first postorder
    PostOrderDfs,
    /// Breadth-first from the entry
    BreadthFirst,
    /// Reverse postorder, so forward-edge predecessors come first
    PredecessorsFirst,
    /// Postorder over the dominator tree
    PostOrderDom,
    /// Every block, including blocks the pass itself creates while running
    AllNodesAndNew,
    /// The pass only uses its start/end handlers
    NoNodes,
}

/// Decides whether a pass applies to this unit
pub type GateFn = fn(&CompilationUnit) -> bool;
/// Runs once before or after the traversal, with mutable access
pub type HandlerFn = fn(&mut CompilationUnit);
/// Per-block work; returns true when it changed something
pub type WorkFn = fn(&mut CompilationUnit, BlockId) -> bool;

/// One optimization pass
#[derive(Debug, Clone, Copy)]
pub struct Pass {
    pub name: &'static str,
    pub traversal: Traversal,
    pub gate: Option<GateFn>,
    pub start: Option<HandlerFn>,
    pub end: Option<HandlerFn>,
    pub work: Option<WorkFn>,
    /// Releases pass-local scratch state once bookkeeping is done
    pub free: Option<HandlerFn>,
    pub flags: PassFlags,
}

impl Pass {
    pub fn new(name: &'static str, traversal: Traversal, flags: PassFlags) -> Self {
        Self {
            name,
            traversal,
            gate: None,
            start: None,
            end: None,
            work: None,
            free: None,
            flags,
        }
    }

    pub fn with_gate(mut self, gate: GateFn) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_start(mut self, start: HandlerFn) -> Self {
        self.start = Some(start);
        self
    }

    pub fn with_end(mut self, end: HandlerFn) -> Self {
        self.end = Some(end);
        self
    }

    pub fn with_work(mut self, work: WorkFn) -> Self {
        self.work = Some(work);
        self
    }

    pub fn with_free(mut self, free: HandlerFn) -> Self {
        self.free = Some(free);
        self
    }

    fn sentinel() -> Self {
        Self::new("", Traversal::NoNodes, PassFlags::empty())
    }

    fn is_sentinel(&self) -> bool {
        self.name.is_empty()
    }
}

// ==================== Pass list ====================

/// Ordered pass pipeline, terminated by an unnamed sentinel
#[derive(Debug, Clone)]
pub struct PassList {
    passes: Vec<Pass>,
    /// Consulted before every pass's own gate
    general_gate: Option<GateFn>,
}

impl Default for PassList {
    fn default() -> Self {
        Self::default_pipeline()
    }
}

impl PassList {
    /// An empty pipeline holding only the sentinel
    pub fn new() -> Self {
        Self {
            passes: vec![Pass::sentinel()],
            general_gate: None,
        }
    }

    /// Install a gate applied to every pass, ahead of the per-pass gates
    pub fn set_general_gate(&mut self, gate: Option<GateFn>) {
        self.general_gate = gate;
    }

    /// The built-in loop optimization pipeline
    pub fn default_pipeline() -> Self {
        let mut list = Self::new();
        list.push(
            Pass::new("Reject_Loops", Traversal::NoNodes, PassFlags::empty())
                .with_gate(gate_loop_mode)
                .with_start(loops::reject_loops_start),
        );
        list.push(
            Pass::new(
                "Form_Loop",
                Traversal::NoNodes,
                PassFlags::BASIC_BLOCK_CHANGE | PassFlags::LOOP_STRUCTURE_CHANGE,
            )
            .with_gate(gate_loop_mode)
            .with_start(loops::form_loop_start),
        );
        list.push(
            Pass::new("Check_References", Traversal::AllNodes, PassFlags::empty())
                .with_work(loops::check_references_work),
        );
        list.push(
            Pass::new(
                "Accumulation_Sinking",
                Traversal::NoNodes,
                PassFlags::BASIC_BLOCK_CHANGE,
            )
            .with_gate(sinking::sink_accumulations_gate)
            .with_end(sinking::sink_accumulations_end),
        );
        list.push(
            Pass::new(
                "Vectorization",
                Traversal::NoNodes,
                PassFlags::BASIC_BLOCK_CHANGE | PassFlags::LOOP_STRUCTURE_CHANGE,
            )
            .with_gate(gate_loop_mode)
            .with_start(vectorize::vectorize_start),
        );
        list
    }

    /// Append a pass right before the sentinel
    pub fn push(&mut self, pass: Pass) {
        let at = self.passes.len() - 1;
        self.passes.insert(at, pass);
    }

    fn position(&self, name: &str) -> Option<usize> {
        if name.is_empty() {
            return None;
        }
        self.passes.iter().position(|p| p.name == name)
    }

    fn report_missing(&self, name: &str) {
        let available: Vec<&str> = self
            .passes
            .iter()
            .filter(|p| !p.is_sentinel())
            .map(|p| p.name)
            .collect();
        warn!(pass = name, ?available, "pass not found in pipeline");
    }

    /// Insert `pass` before the pass called `name`
    pub fn insert_before(&mut self, name: &str, pass: Pass) -> bool {
        match self.position(name) {
            Some(at) => {
                self.passes.insert(at, pass);
                true
            }
            None => {
                self.report_missing(name);
                false
            }
        }
    }

    /// Insert `pass` after the pass called `name`
    pub fn insert_after(&mut self, name: &str, pass: Pass) -> bool {
        match self.position(name) {
            Some(at) => {
                self.passes.insert(at + 1, pass);
                true
            }
            None => {
                self.report_missing(name);
                false
            }
        }
    }

    /// Swap out the pass called `name` wholesale
    pub fn replace(&mut self, name: &str, pass: Pass) -> bool {
        match self.position(name) {
            Some(at) => {
                self.passes[at] = pass;
                true
            }
            None => {
                self.report_missing(name);
                false
            }
        }
    }

    /// Unlink the pass called `name`
    pub fn remove(&mut self, name: &str) -> bool {
        match self.position(name) {
            Some(at) => {
                self.passes.remove(at);
                true
            }
            None => {
                self.report_missing(name);
                false
            }
        }
    }

    /// Replace only the gate of the pass called `name`
    pub fn replace_gate(&mut self, name: &str, gate: Option<GateFn>) -> bool {
        match self.position(name) {
            Some(at) => {
                self.passes[at].gate = gate;
                true
            }
            None => {
                self.report_missing(name);
                false
            }
        }
    }

    /// Replace only the end handler of the pass called `name`
    pub fn replace_end(&mut self, name: &str, end: Option<HandlerFn>) -> bool {
        match self.position(name) {
            Some(at) => {
                self.passes[at].end = end;
                true
            }
            None => {
                self.report_missing(name);
                false
            }
        }
    }

    /// Passes up to, and excluding, the sentinel
    pub fn iter(&self) -> impl Iterator<Item = &Pass> {
        self.passes.iter().take_while(|p| !p.is_sentinel())
    }

    /// The sentinel is present and terminates the list
    pub fn is_well_formed(&self) -> bool {
        self.passes.last().is_some_and(|p| p.is_sentinel())
            && self.passes.iter().filter(|p| p.is_sentinel()).count() == 1
    }

    /// Log the pipeline in execution order
    pub fn print_pass_names(&self) {
        let names: Vec<&str> = self.iter().map(|p| p.name).collect();
        info!(?names, "pass pipeline");
    }

    /// Log which configured ignore entries match a pass, and which are stale
    pub fn print_ignored_passes(&self, config: &JitConfig) {
        for name in &config.ignore_passes {
            if self.position(name).is_some() {
                info!(pass = %name, "pass disabled by configuration");
            } else {
                warn!(pass = %name, "ignore entry matches no pass");
            }
        }
    }
}

/// Loop passes only apply to loop-mode units that have not bailed out
fn gate_loop_mode(unit: &CompilationUnit) -> bool {
    unit.jit_mode == JitMode::Loop && !unit.quit_loop_mode
}

// ==================== Driver ====================

/// Run the whole pipeline over one unit
///
/// In loop mode the driver stops as soon as a pass requests a bail-out, and
/// the caller falls back to compiling the request as a plain trace.
pub fn launch_pass_driver(unit: &mut CompilationUnit, list: &PassList) {
    for pass in list.iter() {
        if let Some(gate) = list.general_gate {
            if !gate(unit) {
                debug!(pass = pass.name, "general gate rejected unit");
                continue;
            }
        }
        run_pass(unit, pass);
        if unit.jit_mode == JitMode::Loop && unit.quit_loop_mode {
            debug!(pass = pass.name, "loop mode abandoned, stopping pipeline");
            break;
        }
    }
}

/// Run a single pass; returns false when the gate rejected the unit or the
/// pass is configured off
pub fn run_pass(unit: &mut CompilationUnit, pass: &Pass) -> bool {
    if unit.config.pass_is_ignored(pass.name) {
        debug!(pass = pass.name, "pass disabled by configuration");
        return false;
    }
    if let Some(gate) = pass.gate {
        if !gate(unit) {
            debug!(pass = pass.name, "gate rejected unit");
            return false;
        }
    }

    unit.print_pass = unit.config.pass_is_verbose(pass.name);
    debug!(pass = pass.name, "running pass");

    if let Some(start) = pass.start {
        start(unit);
    }
    traverse(unit, pass);
    if let Some(end) = pass.end {
        end(unit);
    }
    unit.print_pass = false;

    let invalidating = PassFlags::BASIC_BLOCK_CHANGE
        | PassFlags::LOOP_STRUCTURE_CHANGE
        | PassFlags::DEF_USE_CHANGE;
    if pass.flags.intersects(invalidating) {
        let rebuild_loops = pass.flags.contains(PassFlags::LOOP_STRUCTURE_CHANGE);
        unit.compute_basic_block_information(rebuild_loops);
    }
    if let Some(free) = pass.free {
        free(unit);
    }
    true
}

fn traverse(unit: &mut CompilationUnit, pass: &Pass) {
    let Some(work) = pass.work else { return };
    loop {
        let mut changed = false;
        match pass.traversal {
            Traversal::NoNodes => {}
            Traversal::AllNodes => {
                let n = unit.blocks.len();
                for i in 0..n {
                    changed |= work(unit, BlockId(i as u32));
                }
            }
            Traversal::AllNodesAndNew => {
                let mut i = 0;
                while i < unit.blocks.len() {
                    changed |= work(unit, BlockId(i as u32));
                    i += 1;
                }
            }
            Traversal::ReachableNodes | Traversal::PreOrderDfs => {
                for id in unit.preorder() {
                    changed |= work(unit, id);
                }
            }
            Traversal::PostOrderDfs => {
                for id in unit.postorder() {
                    changed |= work(unit, id);
                }
            }
            Traversal::BreadthFirst => {
                for id in unit.breadth_first() {
                    changed |= work(unit, id);
                }
            }
            Traversal::PredecessorsFirst => {
                for id in unit.predecessors_first() {
                    changed |= work(unit, id);
                }
            }
            Traversal::PostOrderDom => {
                for id in unit.dom_postorder() {
                    changed |= work(unit, id);
                }
            }
        }
        if !changed || !pass.flags.contains(PassFlags::NEED_ITERATIVE) {
            break;
        }
    }
}
