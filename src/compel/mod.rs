//! Compel - driving code that runs inside the dumped task
//!
//! Commands are issued through [`ParasiteAgent`]; ptrace keeps the task
//! still while they run.

pub mod parasite;
pub mod proc_mem;
pub mod ptrace;

pub use parasite::{DumpPagesArgs, ParasiteAgent, ParasiteCmd, ParasiteVmaEntry};
pub use proc_mem::ProcMemAgent;
pub use ptrace::{ptrace_detach, ptrace_interrupt, ptrace_seize, SeizedTask};
