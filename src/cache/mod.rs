//! Code cache and chaining-cell back end
//!
//! Translations live in a shared byte cache that is normally write
//! protected; every mutation goes through a [`ScopedUnprotect`] guard that
//! holds the protection lock for its lifetime, so the type system rules out
//! unguarded writes. A translation ends in a block of chaining cells, one
//! per exit, that other code patches at runtime; this module emits the
//! layout and knows how to walk it back for unchaining.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::cfg::{BlockType, CompilationUnit};
use crate::error::{CompileError, Result};
use crate::mir::Opcode;

pub mod patcher;

/// Bytes of one `jmp rel32` stub in the translation body
pub const STUB_SIZE: usize = 5;
/// Bytes of the per-translation header in front of the entry point
pub const HEADER_SIZE: usize = 4;

/// Byte written over freed cache space; encodes a breakpoint trap
const TRAP_FILL: u8 = 0xCC;

/// Byte offset of the patch-site address inside a cell
const OFFSET_OF_PATCH_ADDR: usize = 9;
/// Byte offset of the switch/move flag word inside a cell
const OFFSET_OF_FLAG_WORD: usize = 13;

// ==================== Cell kinds ====================

/// Chaining cell categories, in their on-cache layout order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CellKind {
    /// Plain branch to not-yet-compiled code
    Normal = 0,
    /// Branch to a hot target, chained eagerly
    Hot = 1,
    /// Monomorphic invoke
    InvokeSingleton = 2,
    /// Polymorphic invoke, patched through the inline-cache queue
    InvokePredicted = 3,
    /// Loop backedge with register write-back
    BackwardBranch = 4,
}

impl CellKind {
    pub const ALL: [CellKind; 5] = [
        CellKind::Normal,
        CellKind::Hot,
        CellKind::InvokeSingleton,
        CellKind::InvokePredicted,
        CellKind::BackwardBranch,
    ];

    /// On-cache size in bytes, padding excluded
    pub fn size(self) -> usize {
        match self {
            CellKind::Normal | CellKind::Hot | CellKind::InvokeSingleton => 17,
            CellKind::InvokePredicted => 20,
            CellKind::BackwardBranch => 25,
        }
    }

    /// Does this cell get a patchable jump stub in the translation body?
    pub fn has_stub(self) -> bool {
        self != CellKind::InvokePredicted
    }

    fn of_block(block_type: BlockType) -> Option<CellKind> {
        match block_type {
            BlockType::ChainingCellNormal => Some(CellKind::Normal),
            BlockType::ChainingCellHot => Some(CellKind::Hot),
            BlockType::ChainingCellInvokeSingleton => Some(CellKind::InvokeSingleton),
            BlockType::ChainingCellInvokePredicted => Some(CellKind::InvokePredicted),
            BlockType::ChainingCellBackwardBranch => Some(CellKind::BackwardBranch),
            _ => None,
        }
    }
}

// ==================== The cache ====================

/// A write-protected byte cache with a bump allocator
///
/// Reads are always allowed; writes require the [`ScopedUnprotect`] guard.
/// Individual bytes are backed by atomic words so concurrent readers racing
/// a patch observe either the old or the new byte, never garbage.
pub struct CodeCache {
    words: Vec<AtomicU32>,
    size: usize,
    used: AtomicUsize,
    protect_lock: Mutex<()>,
}

impl CodeCache {
    pub fn new(size: usize) -> Self {
        let size = (size + 3) & !3;
        Self {
            words: (0..size / 4).map(|_| AtomicU32::new(0)).collect(),
            size,
            used: AtomicUsize::new(0),
            protect_lock: Mutex::new(()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn available(&self) -> usize {
        self.size - self.used()
    }

    /// Carve out `bytes`, returning the 4-aligned base offset
    pub fn reserve(&self, bytes: usize) -> Option<usize> {
        let bytes = (bytes + 3) & !3;
        let mut base = self.used.load(Ordering::Relaxed);
        loop {
            if base + bytes > self.size {
                return None;
            }
            match self.used.compare_exchange_weak(
                base,
                base + bytes,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(base),
                Err(cur) => base = cur,
            }
        }
    }

    /// Drop every translation; only meaningful while unchained
    ///
    /// The region is filled with a trapping byte pattern so a stale jump
    /// into freed code faults instead of executing garbage.
    pub fn reset(&self, _guard: &ScopedUnprotect) {
        self.used.store(0, Ordering::Relaxed);
        for w in &self.words {
            w.store(u32::from_ne_bytes([TRAP_FILL; 4]), Ordering::Relaxed);
        }
    }

    /// Lift write protection for the guard's lifetime
    pub fn unprotect(&self) -> ScopedUnprotect<'_> {
        ScopedUnprotect {
            cache: self,
            _guard: self.protect_lock.lock().unwrap(),
        }
    }

    pub fn read_u8(&self, addr: usize) -> u8 {
        let word = self.words[addr / 4].load(Ordering::Relaxed);
        (word >> ((addr % 4) * 8)) as u8
    }

    pub fn read_u16(&self, addr: usize) -> u16 {
        u16::from(self.read_u8(addr)) | (u16::from(self.read_u8(addr + 1)) << 8)
    }

    pub fn read_u32(&self, addr: usize) -> u32 {
        u32::from(self.read_u16(addr)) | (u32::from(self.read_u16(addr + 2)) << 16)
    }

    /// Acquire-load of a naturally aligned word; pairs with
    /// [`ScopedUnprotect::store_release_u32`] for the predicted-cell class
    /// word
    pub fn load_acquire_u32(&self, addr: usize) -> u32 {
        debug_assert_eq!(addr % 4, 0);
        self.words[addr / 4].load(Ordering::Acquire)
    }
}

/// Proof that the cache is writable; writes go through this guard
pub struct ScopedUnprotect<'a> {
    cache: &'a CodeCache,
    _guard: MutexGuard<'a, ()>,
}

impl ScopedUnprotect<'_> {
    pub fn write_u8(&self, addr: usize, value: u8) {
        let word = &self.cache.words[addr / 4];
        let shift = (addr % 4) * 8;
        let mut cur = word.load(Ordering::Relaxed);
        loop {
            let new = (cur & !(0xFF << shift)) | (u32::from(value) << shift);
            match word.compare_exchange_weak(cur, new, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return,
                Err(c) => cur = c,
            }
        }
    }

    pub fn write_u16(&self, addr: usize, value: u16) {
        self.write_u8(addr, value as u8);
        self.write_u8(addr + 1, (value >> 8) as u8);
    }

    pub fn write_u32(&self, addr: usize, value: u32) {
        self.write_u16(addr, value as u16);
        self.write_u16(addr + 2, (value >> 16) as u16);
    }

    /// Release-store of a naturally aligned word; the publishing side of
    /// the predicted-cell protocol
    pub fn store_release_u32(&self, addr: usize, value: u32) {
        debug_assert_eq!(addr % 4, 0);
        self.cache.words[addr / 4].store(value, Ordering::Release);
    }
}

// ==================== Emission ====================

fn align4(addr: usize) -> usize {
    (addr + 3) & !3
}

struct PendingCell {
    kind: CellKind,
    next_pc: u32,
}

/// Lay out and write one translation; returns its entry address
///
/// Layout, from the reserved base:
/// `[header][stubs][pad][chaining cells][pad][cell counts]`. The header's
/// two half-words, read at `entry - 4` and `entry - 2`, give the offsets
/// from the entry to the counts table and to the cell block. The 128-bit
/// literals of packed instructions go to the data cache.
pub fn emit_translation(
    code_cache: &CodeCache,
    data_cache: &CodeCache,
    unit: &CompilationUnit,
) -> Result<usize> {
    let mut cells: Vec<PendingCell> = unit
        .blocks
        .iter()
        .filter(|bb| !bb.hidden)
        .filter_map(|bb| {
            CellKind::of_block(bb.block_type).map(|kind| PendingCell {
                kind,
                next_pc: bb.start_offset,
            })
        })
        .collect();
    cells.sort_by_key(|c| c.kind);

    // Dry layout pass, relative to the base. The base is 4-aligned, so
    // alignment decisions hold once it is real.
    let entry_rel = HEADER_SIZE;
    let stubs = cells.iter().filter(|c| c.kind.has_stub()).count();
    let mut offset = align4(entry_rel + stubs * STUB_SIZE);
    let cell_block_rel = offset;
    let mut cell_offsets = Vec::with_capacity(cells.len());
    for cell in &cells {
        if cell.kind == CellKind::InvokePredicted {
            offset = align4(offset);
        }
        cell_offsets.push(offset);
        offset += cell.kind.size();
    }
    let counts_rel = align4(offset);
    let total = counts_rel + CellKind::ALL.len() * 2;

    let Some(base) = code_cache.reserve(total) else {
        return Err(CompileError::CodeCacheFull {
            needed: total,
            available: code_cache.available(),
        });
    };
    let entry = base + entry_rel;

    // Literal pool for packed constants. Literals live in the data cache
    // when it has room, and spill to the code cache otherwise.
    for mir in &unit.mirs {
        if mir.insn.opcode != Opcode::Const128 {
            continue;
        }
        let (pool_cache, pool) = match data_cache.reserve(16) {
            Some(pool) => (data_cache, pool),
            None => {
                debug!(method = %unit.method, "data cache full, literal spilled to code cache");
                match code_cache.reserve(16) {
                    Some(pool) => (code_cache, pool),
                    None => {
                        return Err(CompileError::CodeCacheFull {
                            needed: 16,
                            available: code_cache.available(),
                        });
                    }
                }
            }
        };
        let guard = pool_cache.unprotect();
        for (i, word) in mir.insn.args.iter().enumerate() {
            guard.write_u32(pool + i * 4, *word);
        }
    }

    let guard = code_cache.unprotect();
    guard.write_u16(entry - 4, (counts_rel - entry_rel) as u16);
    guard.write_u16(entry - 2, (cell_block_rel - entry_rel) as u16);

    let mut counts = [0u16; 5];
    let mut stub_index = 0;
    for (cell, rel) in cells.iter().zip(&cell_offsets) {
        counts[cell.kind as usize] += 1;
        let cell_addr = base + rel;
        let patch_addr = if cell.kind.has_stub() {
            let stub_addr = entry + stub_index * STUB_SIZE;
            stub_index += 1;
            // jmp rel32 to the cell: the unchained state.
            guard.write_u8(stub_addr, 0xE9);
            guard.write_u32(
                stub_addr + 1,
                (cell_addr as i64 - (stub_addr + STUB_SIZE) as i64) as u32,
            );
            stub_addr + 1
        } else {
            0
        };
        write_cell(&guard, cell, cell_addr, patch_addr, entry);
    }
    for (k, count) in counts.iter().enumerate() {
        guard.write_u16(base + counts_rel + k * 2, *count);
    }

    debug!(
        method = %unit.method,
        entry,
        bytes = total,
        cells = cells.len(),
        "translation emitted"
    );
    Ok(entry)
}

fn write_cell(
    guard: &ScopedUnprotect,
    cell: &PendingCell,
    addr: usize,
    patch_addr: usize,
    entry: usize,
) {
    match cell.kind {
        CellKind::Normal | CellKind::Hot | CellKind::InvokeSingleton => {
            // call rel32 into the interpreter punt routine.
            guard.write_u8(addr, 0xE8);
            guard.write_u32(addr + 1, 0);
            guard.write_u32(addr + 5, cell.next_pc);
            guard.write_u32(addr + OFFSET_OF_PATCH_ADDR, patch_addr as u32);
            guard.write_u32(addr + OFFSET_OF_FLAG_WORD, 0);
        }
        CellKind::InvokePredicted => {
            // branch, branch2, clazz, method, stagedClazz.
            guard.write_u32(addr, patcher::PREDICTED_CHAIN_BRANCH_INIT);
            guard.write_u32(addr + 4, patcher::PREDICTED_CHAIN_BRANCH_INIT);
            guard.write_u32(addr + 8, patcher::PREDICTED_CHAIN_CLAZZ_INIT);
            guard.write_u32(addr + 12, 0);
            guard.write_u32(addr + 16, 0);
        }
        CellKind::BackwardBranch => {
            guard.write_u8(addr, 0xE8);
            guard.write_u32(addr + 1, 0);
            guard.write_u32(addr + 5, cell.next_pc);
            guard.write_u32(addr + OFFSET_OF_PATCH_ADDR, patch_addr as u32);
            guard.write_u32(addr + 13, entry as u32);
            guard.write_u32(addr + 17, addr as u32);
            guard.write_u32(addr + 21, entry as u32);
        }
    }
}

// ==================== Chaining and unchaining ====================

/// Point a patchable cell's jump at a freshly compiled target
pub fn chain_cell(guard: &ScopedUnprotect, cache: &CodeCache, cell_addr: usize, target: usize) {
    let patch = cache.read_u32(cell_addr + OFFSET_OF_PATCH_ADDR) as usize;
    if patch != 0 {
        guard.write_u32(patch, (target as i64 - (patch + 4) as i64) as u32);
    }
}

/// Restore every chaining cell of the translation at `entry` to its
/// unchained state
///
/// Panics when the walk runs past the cache: a corrupt cell block means the
/// cache contents can no longer be trusted.
pub fn unchain_translation(guard: &ScopedUnprotect, cache: &CodeCache, entry: usize) {
    let counts_addr = entry + cache.read_u16(entry - 4) as usize;
    let mut addr = entry + cache.read_u16(entry - 2) as usize;
    for kind in CellKind::ALL {
        let count = cache.read_u16(counts_addr + (kind as usize) * 2);
        for _ in 0..count {
            if kind == CellKind::InvokePredicted {
                addr = align4(addr);
            }
            assert!(
                addr + kind.size() <= cache.size(),
                "chaining cell walk past end of code cache"
            );
            unchain_cell(guard, cache, kind, addr);
            addr += kind.size();
        }
    }
}

fn unchain_cell(guard: &ScopedUnprotect, cache: &CodeCache, kind: CellKind, addr: usize) {
    match kind {
        CellKind::Normal => {
            let patch = cache.read_u32(addr + OFFSET_OF_PATCH_ADDR) as usize;
            if patch != 0 {
                let is_switch = cache.read_u32(addr + OFFSET_OF_FLAG_WORD) != 0;
                if is_switch {
                    // Switch tables hold absolute cell addresses.
                    guard.write_u32(patch, addr as u32);
                } else {
                    guard.write_u32(patch, (addr as i64 - (patch + 4) as i64) as u32);
                }
            }
        }
        CellKind::Hot => {
            let patch = cache.read_u32(addr + OFFSET_OF_PATCH_ADDR) as usize;
            if patch != 0 {
                let is_move = cache.read_u32(addr + OFFSET_OF_FLAG_WORD) != 0;
                if is_move {
                    guard.write_u32(patch, (addr as i64 - (patch + 4) as i64) as u32);
                } else {
                    guard.write_u32(patch, addr as u32);
                }
            }
        }
        CellKind::InvokeSingleton => {
            let patch = cache.read_u32(addr + OFFSET_OF_PATCH_ADDR) as usize;
            if patch != 0 {
                guard.write_u32(patch, addr as u32);
            }
        }
        CellKind::InvokePredicted => {
            // Clearing the class word alone invalidates the prediction;
            // the rest of the cell may be repopulated later.
            guard.store_release_u32(addr + 8, patcher::PREDICTED_CHAIN_CLAZZ_INIT);
        }
        CellKind::BackwardBranch => {
            let code_ptr = cache.read_u32(addr + OFFSET_OF_PATCH_ADDR) as usize;
            let write_back = cache.read_u32(addr + 17);
            guard.write_u32(code_ptr, (write_back as i64 - (code_ptr + 4) as i64) as u32);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JitConfig;
    use crate::mir::DecodedInsn;

    fn unit_with_cells(types: &[BlockType]) -> CompilationUnit {
        let mut unit = CompilationUnit::new("emit", 4, JitConfig::default());
        for (i, bt) in types.iter().enumerate() {
            let id = unit.new_block(*bt);
            unit.block_mut(id).start_offset = 0x100 + i as u32;
        }
        unit
    }

    #[test]
    fn test_cell_sizes_and_order() {
        assert_eq!(CellKind::Normal.size(), 17);
        assert_eq!(CellKind::InvokePredicted.size(), 20);
        assert_eq!(CellKind::BackwardBranch.size(), 25);
        assert!(CellKind::Normal < CellKind::BackwardBranch);
        assert!(!CellKind::InvokePredicted.has_stub());
    }

    #[test]
    fn test_cache_byte_access() {
        let cache = CodeCache::new(64);
        let guard = cache.unprotect();
        guard.write_u32(3, 0xAABBCCDD);
        drop(guard);
        assert_eq!(cache.read_u8(3), 0xDD);
        assert_eq!(cache.read_u8(6), 0xAA);
        assert_eq!(cache.read_u32(3), 0xAABBCCDD);
    }

    #[test]
    fn test_reserve_exhaustion() {
        let cache = CodeCache::new(32);
        // 13 rounds up to a 4-aligned 16.
        assert_eq!(cache.reserve(13), Some(0));
        assert_eq!(cache.used(), 16);
        // A rounded request past the end fails without moving the cursor.
        assert_eq!(cache.reserve(20), None);
        assert_eq!(cache.reserve(16), Some(16));
        assert_eq!(cache.reserve(4), None);
    }

    #[test]
    fn test_emit_header_and_counts() {
        let unit = unit_with_cells(&[
            BlockType::ChainingCellBackwardBranch,
            BlockType::ChainingCellNormal,
            BlockType::ChainingCellNormal,
            BlockType::ChainingCellInvokePredicted,
        ]);
        let code = CodeCache::new(4096);
        let data = CodeCache::new(256);
        let entry = emit_translation(&code, &data, &unit).unwrap();

        let counts_addr = entry + code.read_u16(entry - 4) as usize;
        assert_eq!(code.read_u16(counts_addr + 2 * CellKind::Normal as usize), 2);
        assert_eq!(
            code.read_u16(counts_addr + 2 * CellKind::InvokePredicted as usize),
            1
        );
        assert_eq!(
            code.read_u16(counts_addr + 2 * CellKind::BackwardBranch as usize),
            1
        );
        assert_eq!(code.read_u16(counts_addr + 2 * CellKind::Hot as usize), 0);
    }

    #[test]
    fn test_emitted_cells_record_patch_sites() {
        let unit = unit_with_cells(&[BlockType::ChainingCellNormal]);
        let code = CodeCache::new(4096);
        let data = CodeCache::new(256);
        let entry = emit_translation(&code, &data, &unit).unwrap();

        let cell_addr = entry + code.read_u16(entry - 2) as usize;
        // The cell records the stub's rel32 slot, right after the jmp
        // opcode at the entry.
        let patch = code.read_u32(cell_addr + OFFSET_OF_PATCH_ADDR) as usize;
        assert_eq!(patch, entry + 1);
        assert_eq!(code.read_u8(entry), 0xE9);
        // Unchained: the stub jumps to the cell.
        let rel = code.read_u32(patch) as i32;
        assert_eq!(entry as i64 + STUB_SIZE as i64 + rel as i64, cell_addr as i64);
        // Cell body: punt call, then the next bytecode PC.
        assert_eq!(code.read_u8(cell_addr), 0xE8);
        assert_eq!(code.read_u32(cell_addr + 5), 0x100);
    }

    #[test]
    fn test_chain_then_unchain_round_trip() {
        let unit = unit_with_cells(&[BlockType::ChainingCellNormal]);
        let code = CodeCache::new(4096);
        let data = CodeCache::new(256);
        let entry = emit_translation(&code, &data, &unit).unwrap();
        let cell_addr = entry + code.read_u16(entry - 2) as usize;
        let patch = code.read_u32(cell_addr + OFFSET_OF_PATCH_ADDR) as usize;
        let unchained_rel = code.read_u32(patch);

        let guard = code.unprotect();
        chain_cell(&guard, &code, cell_addr, 0x800);
        assert_ne!(code.read_u32(patch), unchained_rel);

        unchain_translation(&guard, &code, entry);
        assert_eq!(code.read_u32(patch), unchained_rel);
    }

    #[test]
    fn test_unchain_clears_predicted_class() {
        let unit = unit_with_cells(&[BlockType::ChainingCellInvokePredicted]);
        let code = CodeCache::new(4096);
        let data = CodeCache::new(256);
        let entry = emit_translation(&code, &data, &unit).unwrap();
        let cell_addr = align4(entry + code.read_u16(entry - 2) as usize);

        let guard = code.unprotect();
        guard.write_u32(cell_addr + 12, 77);
        guard.store_release_u32(cell_addr + 8, 42);
        unchain_translation(&guard, &code, entry);
        drop(guard);

        assert_eq!(
            code.load_acquire_u32(cell_addr + 8),
            patcher::PREDICTED_CHAIN_CLAZZ_INIT
        );
        // Only the class word is touched.
        assert_eq!(code.read_u32(cell_addr + 12), 77);
    }

    #[test]
    fn test_code_cache_full_is_reported() {
        let unit = unit_with_cells(&[BlockType::ChainingCellNormal]);
        let code = CodeCache::new(16);
        let data = CodeCache::new(256);
        match emit_translation(&code, &data, &unit) {
            Err(CompileError::CodeCacheFull { needed, available }) => {
                assert!(needed > available);
            }
            other => panic!("expected CodeCacheFull, got {other:?}"),
        }
    }

    #[test]
    fn test_data_cache_holds_packed_literals() {
        let mut unit = unit_with_cells(&[BlockType::ChainingCellNormal]);
        let block = unit.new_block(BlockType::Code);
        let mut c = DecodedInsn::new(Opcode::Const128);
        c.args = [1, 2, 3, 4];
        unit.push_insn(block, c);

        let code = CodeCache::new(4096);
        let data = CodeCache::new(64);
        emit_translation(&code, &data, &unit).unwrap();
        assert_eq!(data.read_u32(0), 1);
        assert_eq!(data.read_u32(12), 4);
        assert_eq!(data.used(), 16);
    }

    #[test]
    fn test_full_data_cache_spills_literals_to_code_cache() {
        let mut unit = unit_with_cells(&[BlockType::ChainingCellNormal]);
        let block = unit.new_block(BlockType::Code);
        let mut c = DecodedInsn::new(Opcode::Const128);
        c.args = [5, 6, 7, 8];
        unit.push_insn(block, c);

        let code = CodeCache::new(4096);
        let data = CodeCache::new(4);
        data.reserve(4).unwrap();
        emit_translation(&code, &data, &unit).unwrap();
        // The literal landed after the translation in the code cache.
        let pool = code.used() - 16;
        assert_eq!(code.read_u32(pool), 5);
        assert_eq!(code.read_u32(pool + 12), 8);
        assert_eq!(data.used(), 4);
    }

    #[test]
    fn test_reset_requires_guard() {
        let cache = CodeCache::new(64);
        cache.reserve(32).unwrap();
        let guard = cache.unprotect();
        guard.write_u32(0, 0xFFFF_FFFF);
        cache.reset(&guard);
        drop(guard);
        assert_eq!(cache.used(), 0);
        // Freed space traps rather than reading as valid code.
        assert_eq!(cache.read_u32(0), 0xCCCC_CCCC);
    }
}
