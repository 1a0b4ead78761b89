//! Runtime chaining behavior: cell patching, unchaining, and the
//! predicted-cell publication protocol under concurrency

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use tracelet::cache::patcher::{
    ClassHandle, MethodDesc, PredictedCell, ThreadState, PREDICTED_CHAIN_CLAZZ_INIT,
};
use tracelet::cache::{chain_cell, CellKind};
use tracelet::driver::{TraceDescriptor, TraceFragment, WorkOrder};
use tracelet::mir::{DecodedInsn, Opcode};
use tracelet::{CodeCache, InlineCachePatcher, JitConfig, JitContext};

/// Route patch diagnostics through the test harness
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn simple_trace(method: &str) -> TraceDescriptor {
    TraceDescriptor {
        method: method.to_string(),
        start_offset: 0x10,
        fragments: vec![TraceFragment {
            start_offset: 0x10,
            insns: vec![
                DecodedInsn::with_ops(Opcode::AddIntLit, 0, 0, 1),
                DecodedInsn::with_ops(Opcode::IfGe, 0, 3, 0),
            ],
        }],
        unresolved_refs: Vec::new(),
        num_vregs: 4,
    }
}

fn first_cell_addr(ctx: &JitContext, entry: usize) -> usize {
    entry + ctx.code_cache.read_u16(entry - 2) as usize
}

#[test]
fn test_chained_translation_unchains_cleanly() {
    init_tracing();
    let ctx = JitContext::new(JitConfig::default());
    let a = ctx
        .compile_work_order(WorkOrder::CompileTrace(simple_trace("LA;.m")))
        .unwrap()
        .code_address
        .unwrap();
    let b = ctx
        .compile_work_order(WorkOrder::CompileTrace(simple_trace("LB;.m")))
        .unwrap()
        .code_address
        .unwrap();

    // Chain A's first exit to B, as the runtime would on a chain request.
    let cell = first_cell_addr(&ctx, a);
    let patch = ctx.code_cache.read_u32(cell + 9) as usize;
    let unchained_rel = ctx.code_cache.read_u32(patch);
    {
        let guard = ctx.code_cache.unprotect();
        chain_cell(&guard, &ctx.code_cache, cell, b);
    }
    assert_ne!(ctx.code_cache.read_u32(patch), unchained_rel);

    assert_eq!(ctx.unchain_all(), 2);
    assert_eq!(ctx.code_cache.read_u32(patch), unchained_rel);
}

#[test]
fn test_predicted_class_publishes_last() {
    // A reader that acquires a non-null class must observe the method and
    // branch words written with it.
    let cache = Arc::new(CodeCache::new(256));
    let patcher = Arc::new(InlineCachePatcher::new(8));
    let cell_addr = 0usize;

    let reader = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || loop {
            let cell = PredictedCell::read(&cache, cell_addr);
            if cell.clazz != PREDICTED_CHAIN_CLAZZ_INIT {
                return cell;
            }
            thread::yield_now();
        })
    };

    let content = PredictedCell::for_target(cell_addr, 0x80, 31, 77);
    patcher.enqueue(&cache, cell_addr, content, "LRecv;", 1);

    let seen = reader.join().unwrap();
    assert_eq!(seen.clazz, 31);
    assert_eq!(seen.method, 77);
    assert_eq!(seen.branch & 0xFF, 0xE9);
    assert_eq!(patcher.ic_patch_init.load(Ordering::Relaxed), 1);
}

#[test]
fn test_rechain_backoff_through_public_api() {
    let ctx = JitContext::new(JitConfig::default());
    ctx.compile_work_order(WorkOrder::CompileTrace(simple_trace("LA;.m")))
        .unwrap();
    let mut thread_state = ThreadState::default();
    let clazz = ClassHandle {
        id: 9,
        serial: 1,
        descriptor: "LRecv;".to_string(),
    };
    let callee = MethodDesc {
        id: 4,
        is_native: false,
        trace_addr: ctx.lookup_translation("LA;.m", 0x10),
    };

    // Use untouched cache space past the translation as a predicted cell.
    let cell_addr = ctx.code_cache.used() + 16;
    let count = ctx.patcher.patch_predicted_chain(
        &ctx.code_cache,
        &ctx.config,
        &mut thread_state,
        cell_addr,
        &clazz,
        &callee,
    );
    // First population keeps the thread's counter.
    assert_eq!(count, 0);
    let cell = PredictedCell::read(&ctx.code_cache, cell_addr);
    assert_eq!(cell.clazz, 9);
    assert_eq!(cell.method, 4);

    // Rechaining an occupied cell pays the full backoff.
    let other = ClassHandle {
        id: 10,
        serial: 1,
        descriptor: "LOther;".to_string(),
    };
    let count = ctx.patcher.patch_predicted_chain(
        &ctx.code_cache,
        &ctx.config,
        &mut thread_state,
        cell_addr,
        &other,
        &callee,
    );
    assert_eq!(count, ctx.config.rechain_backoff);
}

#[test]
fn test_unchain_resets_predicted_cells_too() {
    let cache = CodeCache::new(64);
    let patcher = InlineCachePatcher::new(4);

    let content = PredictedCell::for_target(0, 0x80, 11, 22);
    patcher.enqueue(&cache, 0, content, "LRecv;", 1);
    assert_eq!(PredictedCell::read(&cache, 0).clazz, 11);

    // Emulate what unchain_all does for a predicted cell: clear the class
    // word and nothing else.
    {
        let guard = cache.unprotect();
        guard.store_release_u32(8, PREDICTED_CHAIN_CLAZZ_INIT);
    }
    let cell = PredictedCell::read(&cache, 0);
    assert_eq!(cell.clazz, PREDICTED_CHAIN_CLAZZ_INIT);
    assert_eq!(cell.method, 22);
}

#[test]
fn test_cell_kinds_walk_in_layout_order() {
    // The emitted cell block is ordered by kind, so the unchain walk can
    // rely on the counts table alone.
    let kinds = CellKind::ALL;
    for pair in kinds.windows(2) {
        assert!(pair[0] < pair[1]);
    }
    assert_eq!(kinds[CellKind::BackwardBranch as usize], CellKind::BackwardBranch);
}
