//! Work-order intake and the compile driver
//!
//! Profiling threads hand the compiler [`WorkOrder`]s. A trace order carries
//! a [`TraceDescriptor`]: the recorded instruction fragments plus enough
//! method context to build a [`CompilationUnit`]. The driver first attempts
//! loop mode; when any pass bails out it falls back to compiling the same
//! trace as a straight-line translation. Emitted translations are tracked in
//! a table so the whole cache can be unchained or flushed at a safepoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use crate::cache::{self, patcher::InlineCachePatcher, CodeCache};
use crate::cfg::{BlockType, CompilationUnit, JitMode};
use crate::config::JitConfig;
use crate::error::{CompileError, Result};
use crate::mir::DecodedInsn;
use crate::passes::{launch_pass_driver, Pass, PassList};

// ==================== Work orders ====================

/// How trace entry counters behave while profiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileMode {
    Off,
    Periodic,
    Continuous,
}

/// A unit of work for the compiler thread
#[derive(Debug)]
pub enum WorkOrder {
    CompileTrace(TraceDescriptor),
    /// Same as `CompileTrace` but with verbose pass diagnostics
    CompileTraceDebug(TraceDescriptor),
    CompileMethod { method: String },
    ChangeProfileMode(ProfileMode),
}

/// One straight-line run of recorded instructions
#[derive(Debug, Clone)]
pub struct TraceFragment {
    pub start_offset: u32,
    pub insns: Vec<DecodedInsn>,
}

/// A recorded trace: the loop body first, then its exit path
#[derive(Debug, Clone)]
pub struct TraceDescriptor {
    pub method: String,
    pub start_offset: u32,
    pub fragments: Vec<TraceFragment>,
    /// Field and method reference indices still unresolved in this class
    pub unresolved_refs: Vec<u32>,
    pub num_vregs: u32,
}

/// Target architecture of an emitted translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionSet {
    X86,
}

/// Outcome of one work order
#[derive(Debug, Clone)]
pub struct TranslationInfo {
    pub code_address: Option<usize>,
    pub instruction_set: InstructionSet,
    /// The order produced nothing the requester should install
    pub discard: bool,
}

impl TranslationInfo {
    fn discarded() -> Self {
        Self {
            code_address: None,
            instruction_set: InstructionSet::X86,
            discard: true,
        }
    }
}

/// One installed translation
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub method: String,
    pub start_offset: u32,
    pub code_address: Option<usize>,
    pub is_method_entry: bool,
}

// ==================== The context ====================

/// Everything the compiler thread shares with executing threads
pub struct JitContext {
    pub config: JitConfig,
    pub pass_list: PassList,
    pub code_cache: CodeCache,
    pub data_cache: CodeCache,
    pub patcher: InlineCachePatcher,
    trace_table: Mutex<Vec<TraceEntry>>,
    code_cache_full: AtomicBool,
    data_cache_full: AtomicBool,
}

impl JitContext {
    pub fn new(config: JitConfig) -> Self {
        let pass_list = PassList::default_pipeline();
        if config.print_all_passes {
            pass_list.print_pass_names();
        }
        pass_list.print_ignored_passes(&config);
        Self {
            pass_list,
            code_cache: CodeCache::new(config.code_cache_size),
            data_cache: CodeCache::new(config.data_cache_size),
            patcher: InlineCachePatcher::new(config.ic_patch_queue_size),
            trace_table: Mutex::new(Vec::new()),
            code_cache_full: AtomicBool::new(false),
            data_cache_full: AtomicBool::new(false),
            config,
        }
    }

    /// Splice an externally supplied pass in after the pass called `anchor`
    ///
    /// A missing anchor is logged and skipped, or becomes an error when the
    /// configuration marks registration failures fatal.
    pub fn register_pass(&mut self, anchor: &str, pass: Pass) -> Result<()> {
        let name = pass.name;
        if self.pass_list.insert_after(anchor, pass) {
            return Ok(());
        }
        if self.config.plugin_failure_fatal {
            return Err(CompileError::PassRegistration {
                pass: name,
                anchor: anchor.to_string(),
            });
        }
        Ok(())
    }

    pub fn is_code_cache_full(&self) -> bool {
        self.code_cache_full.load(Ordering::Relaxed)
    }

    pub fn is_data_cache_full(&self) -> bool {
        self.data_cache_full.load(Ordering::Relaxed)
    }

    /// Dispatch one work order
    pub fn compile_work_order(&self, order: WorkOrder) -> Result<TranslationInfo> {
        match order {
            WorkOrder::CompileTrace(desc) => self.compile_trace(&desc, false),
            WorkOrder::CompileTraceDebug(desc) => self.compile_trace(&desc, true),
            WorkOrder::CompileMethod { method } => {
                warn!(method = %method, "whole-method compilation not supported, discarding");
                Ok(TranslationInfo::discarded())
            }
            WorkOrder::ChangeProfileMode(mode) => {
                debug!(?mode, "profile mode change");
                Ok(TranslationInfo::discarded())
            }
        }
    }

    fn compile_trace(&self, desc: &TraceDescriptor, verbose: bool) -> Result<TranslationInfo> {
        if self.is_code_cache_full() || self.is_data_cache_full() {
            // Once full, stay full; orders are drained without compiling
            // until somebody flushes.
            debug!(method = %desc.method, "cache full, draining work order");
            return Ok(TranslationInfo::discarded());
        }

        let mut unit = self.build_unit(desc, JitMode::Loop, verbose)?;
        launch_pass_driver(&mut unit, &self.pass_list);
        if unit.quit_loop_mode {
            debug!(method = %desc.method, "loop mode abandoned, compiling straight trace");
            unit = self.build_unit(desc, JitMode::Trace, verbose)?;
            launch_pass_driver(&mut unit, &self.pass_list);
        }

        let entry = match cache::emit_translation(&self.code_cache, &self.data_cache, &unit) {
            Ok(entry) => entry,
            Err(e @ CompileError::CodeCacheFull { .. }) => {
                self.code_cache_full.store(true, Ordering::Relaxed);
                warn!(method = %desc.method, "code cache full");
                return Err(e);
            }
            Err(e @ CompileError::DataCacheFull { .. }) => {
                self.data_cache_full.store(true, Ordering::Relaxed);
                warn!(method = %desc.method, "data cache full");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        self.trace_table.lock().unwrap().push(TraceEntry {
            method: desc.method.clone(),
            start_offset: desc.start_offset,
            code_address: Some(entry),
            is_method_entry: false,
        });
        Ok(TranslationInfo {
            code_address: Some(entry),
            instruction_set: InstructionSet::X86,
            discard: false,
        })
    }

    /// Build the raw trace CFG the optimizer expects: the body with a
    /// self edge for the loop-back, the exit path on the taken side, and a
    /// chaining cell at the resume point
    fn build_unit(
        &self,
        desc: &TraceDescriptor,
        mode: JitMode,
        verbose: bool,
    ) -> Result<CompilationUnit> {
        let body_frag = desc
            .fragments
            .first()
            .filter(|f| !f.insns.is_empty())
            .ok_or_else(|| {
                CompileError::MalformedTrace(format!("{}: trace has no instructions", desc.method))
            })?;

        let mut unit = CompilationUnit::new(&desc.method, desc.num_vregs, self.config.clone());
        unit.start_offset = desc.start_offset;
        unit.jit_mode = mode;
        if verbose {
            // Debug orders promote every pass, whatever the global config.
            unit.config.print_all_passes = true;
        }
        unit.unresolved_refs = desc.unresolved_refs.iter().copied().collect::<FxHashSet<_>>();

        let body = unit.new_block(BlockType::Code);
        unit.block_mut(body).start_offset = body_frag.start_offset;
        fill_block(&mut unit, body, body_frag);

        let exit_code = unit.new_block(BlockType::Code);
        let mut resume_pc = body_frag.start_offset + body_frag.insns.len() as u32;
        if let Some(exit_frag) = desc.fragments.get(1) {
            unit.block_mut(exit_code).start_offset = exit_frag.start_offset;
            fill_block(&mut unit, exit_code, exit_frag);
            resume_pc = exit_frag.start_offset + exit_frag.insns.len() as u32;
        } else {
            unit.block_mut(exit_code).start_offset = resume_pc;
        }

        let cell = unit.new_block(BlockType::ChainingCellNormal);
        unit.block_mut(cell).start_offset = resume_pc;

        let entry = unit.entry_block;
        let exit = unit.exit_block;
        unit.block_mut(entry).fall_through = Some(body);
        unit.block_mut(body).taken = Some(exit_code);
        unit.block_mut(body).fall_through = Some(body);
        unit.block_mut(exit_code).fall_through = Some(exit);
        unit.block_mut(exit_code).taken = Some(cell);
        unit.compute_basic_block_information(false);
        Ok(unit)
    }

    /// Find the translation covering a trace head, if any
    pub fn lookup_translation(&self, method: &str, start_offset: u32) -> Option<usize> {
        self.trace_table
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.method == method && e.start_offset == start_offset)
            .and_then(|e| e.code_address)
    }

    /// Return every installed translation to its unchained state; runs at a
    /// safepoint, so executing threads cannot be mid-translation
    pub fn unchain_all(&self) -> usize {
        let table = self.trace_table.lock().unwrap();
        // Lock order: trace table, then code cache, then data cache.
        let guard = self.code_cache.unprotect();
        let _data_guard = self.data_cache.unprotect();
        let mut unchained = 0;
        for entry in table.iter() {
            if entry.is_method_entry {
                continue;
            }
            if let Some(addr) = entry.code_address {
                cache::unchain_translation(&guard, &self.code_cache, addr);
                unchained += 1;
            }
        }
        debug!(translations = unchained, "unchained all translations");
        unchained
    }

    /// Throw away every translation and start over with empty caches
    pub fn flush(&self) {
        let mut table = self.trace_table.lock().unwrap();
        {
            let guard = self.code_cache.unprotect();
            self.code_cache.reset(&guard);
        }
        {
            let guard = self.data_cache.unprotect();
            self.data_cache.reset(&guard);
        }
        table.clear();
        self.code_cache_full.store(false, Ordering::Relaxed);
        self.data_cache_full.store(false, Ordering::Relaxed);
        info!("code cache flushed");
    }
}

fn fill_block(unit: &mut CompilationUnit, block: crate::cfg::BlockId, frag: &TraceFragment) {
    for (i, insn) in frag.insns.iter().enumerate() {
        let id = unit.push_insn(block, insn.clone());
        unit.mir_mut(id).offset = frag.start_offset + i as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::Opcode;

    fn counted_loop_trace() -> TraceDescriptor {
        // v1 += v2; v0 += 1; if (v0 >= v3) exit
        let mut body = vec![DecodedInsn::with_ops(Opcode::AddInt, 1, 1, 2)];
        body.push(DecodedInsn::with_ops(Opcode::AddIntLit, 0, 0, 1));
        body.push(DecodedInsn::with_ops(Opcode::IfGe, 0, 3, 0));
        TraceDescriptor {
            method: "LFoo;.sum".to_string(),
            start_offset: 0x20,
            fragments: vec![
                TraceFragment {
                    start_offset: 0x20,
                    insns: body,
                },
                TraceFragment {
                    start_offset: 0x30,
                    insns: vec![DecodedInsn::with_ops(Opcode::Move, 4, 1, 0)],
                },
            ],
            unresolved_refs: Vec::new(),
            num_vregs: 5,
        }
    }

    #[test]
    fn test_build_unit_raw_shape() {
        let ctx = JitContext::new(JitConfig::default());
        let desc = counted_loop_trace();
        let unit = ctx.build_unit(&desc, JitMode::Loop, false).unwrap();

        let body = unit.block(unit.block(unit.entry_block).fall_through.unwrap());
        assert_eq!(body.block_type, BlockType::Code);
        assert_eq!(body.fall_through, Some(body.id));
        let exit_code = unit.block(body.taken.unwrap());
        assert_eq!(exit_code.fall_through, Some(unit.exit_block));
        let cell = unit.block(exit_code.taken.unwrap());
        assert_eq!(cell.block_type, BlockType::ChainingCellNormal);
        assert_eq!(cell.start_offset, 0x31);
    }

    #[test]
    fn test_register_pass_honors_fatal_config() {
        use crate::passes::{PassFlags, Traversal};

        let noop = Pass::new("Plugin", Traversal::NoNodes, PassFlags::empty());
        let mut ctx = JitContext::new(JitConfig::default());
        assert!(ctx.register_pass("Vectorization", noop).is_ok());
        // Missing anchor is tolerated by default.
        assert!(ctx.register_pass("No_Such_Pass", noop).is_ok());

        let mut config = JitConfig::default();
        config.plugin_failure_fatal = true;
        let mut ctx = JitContext::new(config);
        match ctx.register_pass("No_Such_Pass", noop) {
            Err(CompileError::PassRegistration { pass, anchor }) => {
                assert_eq!(pass, "Plugin");
                assert_eq!(anchor, "No_Such_Pass");
            }
            other => panic!("expected PassRegistration, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_trace_is_malformed() {
        let ctx = JitContext::new(JitConfig::default());
        let desc = TraceDescriptor {
            method: "LFoo;.bar".to_string(),
            start_offset: 0,
            fragments: Vec::new(),
            unresolved_refs: Vec::new(),
            num_vregs: 2,
        };
        match ctx.build_unit(&desc, JitMode::Trace, false) {
            Err(CompileError::MalformedTrace(msg)) => assert!(msg.contains("LFoo;.bar")),
            other => panic!("expected MalformedTrace, got {other:?}"),
        }
    }

    #[test]
    fn test_compile_trace_records_translation() {
        let ctx = JitContext::new(JitConfig::default());
        let info = ctx
            .compile_work_order(WorkOrder::CompileTrace(counted_loop_trace()))
            .unwrap();
        assert!(!info.discard);
        let entry = info.code_address.unwrap();
        assert_eq!(ctx.lookup_translation("LFoo;.sum", 0x20), Some(entry));
        // The translation carries a readable header.
        assert!(ctx.code_cache.read_u16(entry - 2) > 0);
    }

    #[test]
    fn test_straight_trace_falls_back_from_loop_mode() {
        let ctx = JitContext::new(JitConfig::default());
        let mut desc = counted_loop_trace();
        // A reference the resolver has not seen forces the loop bail-out.
        desc.fragments[0]
            .insns
            .insert(0, DecodedInsn::with_ops(Opcode::Iget, 2, 1, 9));
        desc.unresolved_refs.push(9);
        let info = ctx
            .compile_work_order(WorkOrder::CompileTrace(desc))
            .unwrap();
        // Still compiled, just not as a loop.
        assert!(!info.discard);
        assert!(info.code_address.is_some());
    }

    #[test]
    fn test_cache_full_is_sticky() {
        let mut config = JitConfig::default();
        config.code_cache_size = 16;
        let ctx = JitContext::new(config);
        let err = ctx
            .compile_work_order(WorkOrder::CompileTrace(counted_loop_trace()))
            .unwrap_err();
        assert!(matches!(err, CompileError::CodeCacheFull { .. }));
        assert!(ctx.is_code_cache_full());

        // Later orders drain without compiling.
        let info = ctx
            .compile_work_order(WorkOrder::CompileTrace(counted_loop_trace()))
            .unwrap();
        assert!(info.discard);

        ctx.flush();
        assert!(!ctx.is_code_cache_full());
        assert_eq!(ctx.code_cache.used(), 0);
        // The tiny cache fills again, but only because compilation was
        // actually retried.
        let err = ctx
            .compile_work_order(WorkOrder::CompileTrace(counted_loop_trace()))
            .unwrap_err();
        assert!(matches!(err, CompileError::CodeCacheFull { .. }));
    }

    #[test]
    fn test_method_orders_are_discarded() {
        let ctx = JitContext::new(JitConfig::default());
        let info = ctx
            .compile_work_order(WorkOrder::CompileMethod {
                method: "LFoo;.whole".to_string(),
            })
            .unwrap();
        assert!(info.discard);
        let info = ctx
            .compile_work_order(WorkOrder::ChangeProfileMode(ProfileMode::Continuous))
            .unwrap();
        assert!(info.discard);
    }

    #[test]
    fn test_unchain_all_walks_every_entry() {
        let ctx = JitContext::new(JitConfig::default());
        ctx.compile_work_order(WorkOrder::CompileTrace(counted_loop_trace()))
            .unwrap();
        let mut second = counted_loop_trace();
        second.method = "LFoo;.sum2".to_string();
        ctx.compile_work_order(WorkOrder::CompileTrace(second))
            .unwrap();
        assert_eq!(ctx.unchain_all(), 2);
    }
}
