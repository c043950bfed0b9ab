use std::fmt;
use std::io;

use thiserror::Error;

use crate::compel::parasite::ParasiteCmd;

#[derive(Error, Debug)]
pub enum MemError {
    #[error("Can't read pagemap at offset {offset:#x}: {source}")]
    ResidencyRead {
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("Page pipe is out of iovecs ({nr_iovs} available)")]
    CapacityExceeded { nr_iovs: usize },

    #[error("Parasite command {cmd} failed: {source}")]
    AgentCall {
        cmd: ParasiteCmd,
        #[source]
        source: io::Error,
    },

    #[error("Short page transfer at {vaddr:#x}: {done}/{expected} bytes")]
    TransferShortWrite {
        vaddr: u64,
        done: usize,
        expected: usize,
    },

    #[error("Can't rollback unprotected vmas: {0}")]
    ProtectionRestore(#[source] Box<MemError>),

    #[error("Invalid vma {start:#x}-{end:#x}: {reason}")]
    InvalidVma { start: u64, end: u64, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Step of the page dump a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpStage {
    /// Checks done before the parasite is asked for anything
    Prepare,
    Unprotect,
    Scan,
    Transfer,
    Restore,
}

impl fmt::Display for DumpStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DumpStage::Prepare => "prepare",
            DumpStage::Unprotect => "unprotect",
            DumpStage::Scan => "scan",
            DumpStage::Transfer => "transfer",
            DumpStage::Restore => "restore",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
#[error("Page dump failed at {stage} stage: {source}")]
pub struct DumpError {
    pub stage: DumpStage,
    #[source]
    pub source: MemError,
}

impl DumpError {
    pub fn new(stage: DumpStage, source: MemError) -> Self {
        Self { stage, source }
    }
}

pub type Result<T> = std::result::Result<T, MemError>;
