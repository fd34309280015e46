//! Process management utilities
//!
//! - [`unix`]: spawning with optional session detachment, and
//!   signal delivery by process group or PID
//! - [`table`]: process-table snapshots for pattern sweeps and liveness
//!
//! Only Unix is supported for spawning and signalling; the process table
//! is portable.

pub mod table;
#[cfg(unix)]
pub mod unix;

pub use table::{ProcessMatch, ProcessTable};
