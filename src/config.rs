//! Configuration for the JIT middle-end and back-end
//!
//! All tunables live in one plain struct so embedders can load them from a
//! configuration file. There is deliberately no global state: a [`JitConfig`]
//! is carried by the compile context and copied into each compilation unit.

use serde::{Deserialize, Serialize};

/// Configuration for the trace JIT
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JitConfig {
    /// Accept loops containing nested loops
    pub nested_loops: bool,
    /// Accept loops with more than one backward branch
    pub branch_loops: bool,
    /// Minimum statically-known iteration count before vectorizing a loop
    pub min_vectorized_iterations: i32,
    /// Number of vector registers the back-end exposes
    pub vector_registers: u32,
    /// Wide (4-byte lane) packed arithmetic is available on this target
    pub packed_int_support: bool,
    /// Scratch virtual registers a compilation may allocate
    pub max_scratch_registers: u32,
    /// Size of the executable code cache in bytes
    pub code_cache_size: usize,
    /// Size of the read-only data cache in bytes
    pub data_cache_size: usize,
    /// Bounded length of the inline-cache patch queue
    pub ic_patch_queue_size: usize,
    /// Counter a thread gets after a predicted-chain attempt completes
    pub rechain_backoff: u32,
    /// Counter a thread gets when a chain attempt must be retried soon
    pub rechain_retry: u32,
    /// Promote every pass to verbose diagnostics
    pub print_all_passes: bool,
    /// Passes promoted to verbose diagnostics by name
    pub debug_passes: Vec<String>,
    /// Passes skipped by the driver
    pub ignore_passes: Vec<String>,
    /// Whether a pass plugin that fails to register aborts the JIT
    pub plugin_failure_fatal: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            nested_loops: false,
            branch_loops: false,
            min_vectorized_iterations: 10,
            vector_registers: 8,
            packed_int_support: true,
            max_scratch_registers: 2,
            code_cache_size: 512 * 1024,
            data_cache_size: 64 * 1024,
            ic_patch_queue_size: 16,
            rechain_backoff: 16384,
            rechain_retry: 1024,
            print_all_passes: false,
            debug_passes: Vec::new(),
            ignore_passes: Vec::new(),
            plugin_failure_fatal: false,
        }
    }
}

impl JitConfig {
    /// Should this pass run with verbose diagnostics?
    pub fn pass_is_verbose(&self, name: &str) -> bool {
        self.print_all_passes || self.debug_passes.iter().any(|p| p == name)
    }

    /// Should the driver skip this pass?
    pub fn pass_is_ignored(&self, name: &str) -> bool {
        self.ignore_passes.iter().any(|p| p == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = JitConfig::default();
        assert!(!config.nested_loops);
        assert!(config.vector_registers >= 4);
        assert!(config.ic_patch_queue_size > 0);
    }

    #[test]
    fn test_pass_promotion_and_ignore() {
        let mut config = JitConfig::default();
        config.debug_passes.push("Vectorization".to_string());
        config.ignore_passes.push("Check_References".to_string());

        assert!(config.pass_is_verbose("Vectorization"));
        assert!(!config.pass_is_verbose("Form_Loop"));
        assert!(config.pass_is_ignored("Check_References"));

        config.print_all_passes = true;
        assert!(config.pass_is_verbose("Form_Loop"));
    }
}
