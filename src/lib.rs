//! Tracelet: an optimizing middle-end and native back-end for a trace JIT
//!
//! Tracelet compiles hot traces recorded over a register-based bytecode into
//! native translations. Straight-line traces get a baseline translation;
//! traces that close a loop are promoted to a canonical loop region and run
//! through an optimizing pipeline that sinks loop-invariant accumulations
//! and vectorizes counted loops onto packed registers. Emitted translations
//! end in chaining cells that executing threads patch at runtime to jump
//! directly between translations.
//!
//! # Quick Start
//!
//! ```no_run
//! use tracelet::{JitConfig, JitContext, TraceDescriptor, TraceFragment, WorkOrder};
//! use tracelet::mir::{DecodedInsn, Opcode};
//!
//! fn main() -> tracelet::Result<()> {
//!     let ctx = JitContext::new(JitConfig::default());
//!     let trace = TraceDescriptor {
//!         method: "LDemo;.sum".to_string(),
//!         start_offset: 0x10,
//!         fragments: vec![TraceFragment {
//!             start_offset: 0x10,
//!             insns: vec![
//!                 DecodedInsn::with_ops(Opcode::AddInt, 1, 1, 2),
//!                 DecodedInsn::with_ops(Opcode::AddIntLit, 0, 0, 1),
//!                 DecodedInsn::with_ops(Opcode::IfGe, 0, 3, 0),
//!             ],
//!         }],
//!         unresolved_refs: Vec::new(),
//!         num_vregs: 4,
//!     };
//!     let info = ctx.compile_work_order(WorkOrder::CompileTrace(trace))?;
//!     println!("translation at {:?}", info.code_address);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! A work order flows: trace → [`driver`] → [`cfg`] → [`passes`] → [`cache`]
//!
//! | Category | Modules |
//! |----------|---------|
//! | **IR** | [`mir`], [`cfg`], [`expr`] |
//! | **Pipeline** | [`passes`], [`driver`], [`config`], [`error`](Error) |
//! | **Loop optimization** | [`loops`], [`sinking`], [`vectorize`] |
//! | **Back end** | [`cache`], [`cache::patcher`] |

pub mod cache;
pub mod cfg;
pub mod config;
pub mod driver;
pub mod expr;
pub mod loops;
pub mod mir;
pub mod passes;
pub mod sinking;
pub mod vectorize;

mod error;

pub use cache::patcher::InlineCachePatcher;
pub use cache::{CellKind, CodeCache};
pub use cfg::{CompilationUnit, JitMode};
pub use config::JitConfig;
pub use driver::{
    JitContext, TraceDescriptor, TraceFragment, TranslationInfo, WorkOrder,
};
pub use error::{CompileError, Result};
pub use passes::{Pass, PassList};

/// Tracelet version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
