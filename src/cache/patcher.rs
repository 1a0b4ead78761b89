//! Predicted chaining-cell patching
//!
//! A predicted cell caches the receiver class and method of a polymorphic
//! invoke. Executing threads race the compiler and each other over these
//! cells, so every mutation funnels through a single patch lock, and the
//! class word is always published last with release ordering; a reader that
//! acquire-loads a non-null class is guaranteed to see the matching branch
//! and method words. Patches that cannot be applied in place are queued and
//! drained when all threads are suspended.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use tracing::debug;

use super::{CodeCache, ScopedUnprotect};
use crate::config::JitConfig;

/// Class word of a cell that predicts nothing yet
pub const PREDICTED_CHAIN_CLAZZ_INIT: u32 = 0;
/// Poison class that never compares equal to a real receiver; installed for
/// native callees so the prediction always falls through
pub const PREDICTED_CHAIN_FAKE_CLAZZ: u32 = 0xdead_c001;
/// Initial value of the two branch words
pub const PREDICTED_CHAIN_BRANCH_INIT: u32 = 0;

const OFFSET_OF_BRANCH: usize = 0;
const OFFSET_OF_BRANCH2: usize = 4;
const OFFSET_OF_CLAZZ: usize = 8;
const OFFSET_OF_METHOD: usize = 12;
const OFFSET_OF_STAGED_CLAZZ: usize = 16;

// ==================== Cell image ====================

/// In-memory image of one predicted cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredictedCell {
    pub branch: u32,
    pub branch2: u32,
    pub clazz: u32,
    pub method: u32,
    pub staged_clazz: u32,
}

impl PredictedCell {
    /// Snapshot a cell; the class word is acquire-loaded so a non-null
    /// class implies the other words are the ones published with it
    pub fn read(cache: &CodeCache, addr: usize) -> Self {
        let clazz = cache.load_acquire_u32(addr + OFFSET_OF_CLAZZ);
        Self {
            branch: cache.read_u32(addr + OFFSET_OF_BRANCH),
            branch2: cache.read_u32(addr + OFFSET_OF_BRANCH2),
            clazz,
            method: cache.read_u32(addr + OFFSET_OF_METHOD),
            staged_clazz: cache.read_u32(addr + OFFSET_OF_STAGED_CLAZZ),
        }
    }

    /// Content predicting `clazz`/`method`, branching to the translation
    /// at `target`
    pub fn for_target(cell_addr: usize, target: usize, clazz: u32, method: u32) -> Self {
        // jmp rel32 spanning the two branch words, nop-padded.
        let rel = (target as i64 - (cell_addr as i64 + 5)) as u32;
        Self {
            branch: 0xE9 | (rel << 8),
            branch2: (rel >> 24) | 0x9090_9000,
            clazz,
            method,
            staged_clazz: clazz,
        }
    }

    fn is_pristine(&self) -> bool {
        self.clazz == PREDICTED_CHAIN_CLAZZ_INIT && self.branch == PREDICTED_CHAIN_BRANCH_INIT
    }

    /// Write everything but the class word, then publish the class
    fn install(&self, guard: &ScopedUnprotect, addr: usize) {
        guard.write_u32(addr + OFFSET_OF_BRANCH, self.branch);
        guard.write_u32(addr + OFFSET_OF_BRANCH2, self.branch2);
        guard.write_u32(addr + OFFSET_OF_METHOD, self.method);
        guard.write_u32(addr + OFFSET_OF_STAGED_CLAZZ, self.staged_clazz);
        guard.store_release_u32(addr + OFFSET_OF_CLAZZ, self.clazz);
    }
}

/// Receiver class identity as the patcher sees it
#[derive(Debug, Clone)]
pub struct ClassHandle {
    pub id: u32,
    pub serial: u32,
    pub descriptor: String,
}

/// Callee identity plus its translation, if one exists
#[derive(Debug, Clone)]
pub struct MethodDesc {
    pub id: u32,
    pub is_native: bool,
    pub trace_addr: Option<usize>,
}

/// Per-thread rechaining backoff state
#[derive(Debug, Default)]
pub struct ThreadState {
    pub ic_rechain_count: u32,
}

/// A patch that must wait for a safepoint
#[derive(Debug)]
pub struct IcPatchRequest {
    pub cell_addr: usize,
    pub content: PredictedCell,
    pub class_descriptor: String,
    pub class_serial: u32,
}

/// How an enqueue attempt was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchResult {
    /// Pristine cell initialized in place
    Initialized,
    /// Competing prediction staged, nothing else changed
    Rejected,
    /// Same method already installed, only the class word moved
    LockFree,
    /// Deferred to the next safepoint
    Queued,
    /// Queue full, patch discarded
    Dropped,
}

// ==================== The patcher ====================

/// Serializes all predicted-cell mutations and owns the deferred queue
pub struct InlineCachePatcher {
    queue: Mutex<Vec<IcPatchRequest>>,
    queue_capacity: usize,
    pub ic_patch_init: AtomicU32,
    pub ic_patch_rejected: AtomicU32,
    pub ic_patch_lock_free: AtomicU32,
    pub ic_patch_queued: AtomicU32,
    pub ic_patch_dropped: AtomicU32,
}

impl InlineCachePatcher {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            queue_capacity,
            ic_patch_init: AtomicU32::new(0),
            ic_patch_rejected: AtomicU32::new(0),
            ic_patch_lock_free: AtomicU32::new(0),
            ic_patch_queued: AtomicU32::new(0),
            ic_patch_dropped: AtomicU32::new(0),
        }
    }

    /// Apply `content` to the cell now if that is safe, otherwise stage or
    /// queue it
    pub fn enqueue(
        &self,
        cache: &CodeCache,
        cell_addr: usize,
        content: PredictedCell,
        class_descriptor: &str,
        class_serial: u32,
    ) -> PatchResult {
        // The queue mutex doubles as the patch lock.
        let mut queue = self.queue.lock().unwrap();
        let current = PredictedCell::read(cache, cell_addr);

        if current.is_pristine() {
            // Nobody can execute through a pristine cell, so the full
            // rewrite is safe as long as the class word goes last.
            let guard = cache.unprotect();
            content.install(&guard, cell_addr);
            self.ic_patch_init.fetch_add(1, Ordering::Relaxed);
            return PatchResult::Initialized;
        }
        if current.staged_clazz != content.clazz {
            // A different receiver got here first; record ours as the
            // candidate and let the backoff decide later.
            let guard = cache.unprotect();
            guard.write_u32(cell_addr + OFFSET_OF_STAGED_CLAZZ, content.clazz);
            self.ic_patch_rejected.fetch_add(1, Ordering::Relaxed);
            return PatchResult::Rejected;
        }
        if current.method == content.method {
            // Branch target already correct, flipping the class word is
            // enough and safe against concurrent readers.
            let guard = cache.unprotect();
            guard.store_release_u32(cell_addr + OFFSET_OF_CLAZZ, content.clazz);
            self.ic_patch_lock_free.fetch_add(1, Ordering::Relaxed);
            return PatchResult::LockFree;
        }
        if queue.len() < self.queue_capacity {
            queue.push(IcPatchRequest {
                cell_addr,
                content,
                class_descriptor: class_descriptor.to_owned(),
                class_serial,
            });
            self.ic_patch_queued.fetch_add(1, Ordering::Relaxed);
            PatchResult::Queued
        } else {
            self.ic_patch_dropped.fetch_add(1, Ordering::Relaxed);
            PatchResult::Dropped
        }
    }

    /// Rechain a predicted cell toward `method` on `clazz`, returning the
    /// thread's new rechain backoff count
    pub fn patch_predicted_chain(
        &self,
        cache: &CodeCache,
        config: &JitConfig,
        thread: &mut ThreadState,
        cell_addr: usize,
        clazz: &ClassHandle,
        method: &MethodDesc,
    ) -> u32 {
        let mut new_count = config.rechain_backoff;

        if method.is_native {
            // A native callee never benefits from chaining; poison the
            // prediction so the cell permanently misses.
            let guard = cache.unprotect();
            guard.store_release_u32(cell_addr + OFFSET_OF_CLAZZ, PREDICTED_CHAIN_FAKE_CLAZZ);
            thread.ic_rechain_count = new_count;
            return new_count;
        }
        let Some(target) = method.trace_addr else {
            // No translation to chain to yet; retry sooner than the full
            // backoff.
            thread.ic_rechain_count = config.rechain_retry;
            return config.rechain_retry;
        };

        let current = PredictedCell::read(cache, cell_addr);
        if current.clazz == PREDICTED_CHAIN_CLAZZ_INIT {
            // First population of this cell does not consume the backoff.
            new_count = thread.ic_rechain_count;
        }
        let content = PredictedCell::for_target(cell_addr, target, clazz.id, method.id);
        let result = self.enqueue(cache, cell_addr, content, &clazz.descriptor, clazz.serial);
        debug!(cell_addr, target, ?result, "predicted chain patch");
        thread.ic_rechain_count = new_count;
        new_count
    }

    /// Drain the deferred queue; callers must guarantee no thread is
    /// executing cached code. `class_alive` filters out patches whose class
    /// has been unloaded since they were queued.
    pub fn patch_queued_cells<F>(&self, cache: &CodeCache, class_alive: F) -> usize
    where
        F: Fn(&str, u32) -> bool,
    {
        let mut queue = self.queue.lock().unwrap();
        let guard = cache.unprotect();
        let mut applied = 0;
        for request in queue.drain(..) {
            if !class_alive(&request.class_descriptor, request.class_serial) {
                continue;
            }
            request.content.install(&guard, request.cell_addr);
            applied += 1;
        }
        applied
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}
