//! Parasite command interface
//!
//! The dumper never touches target memory itself. Everything that needs
//! ordinary access to the victim's address space goes through an agent
//! living inside it, driven by the commands below.

use std::fmt;
use std::io;
use std::os::fd::BorrowedFd;

use crate::criu::page_pipe::PageRange;

/// Commands understood by the in-target agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ParasiteCmd {
    /// Change protections of a batch of vmas
    MprotectVmas = 1,
    /// Receive a descriptor over the transport socket
    SendFd = 2,
    /// Write pages into the last received pipe
    DumpPages = 3,
}

impl fmt::Display for ParasiteCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParasiteCmd::MprotectVmas => "mprotect_vmas",
            ParasiteCmd::SendFd => "send_fd",
            ParasiteCmd::DumpPages => "dump_pages",
        };
        f.write_str(name)
    }
}

/// One entry of a batched mprotect request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParasiteVmaEntry {
    pub start: u64,
    pub len: u64,
    pub prot: u32,
}

/// Arguments of a [`ParasiteCmd::DumpPages`] call
#[derive(Debug, Clone, Copy)]
pub struct DumpPagesArgs<'a> {
    /// Pages to write into the pipe, in order
    pub iovs: &'a [PageRange],
    /// Number of iovecs in `iovs`
    pub nr_segs: usize,
    /// Total page count across `iovs`
    pub nr_pages: usize,
    /// Index of the first iovec among all iovecs of the dump
    pub off: usize,
}

/// Remote procedure interface of the code injected into the victim.
///
/// Calls are synchronous: each one returns once the agent has reported
/// back. Any error leaves the victim untouched from the caller's point of
/// view; it is up to the caller to roll back earlier commands.
pub trait ParasiteAgent {
    fn mprotect_vmas(&mut self, vmas: &[ParasiteVmaEntry]) -> io::Result<()>;

    /// Hand a descriptor over to the agent. The agent keeps its own copy.
    fn send_fd(&mut self, fd: BorrowedFd<'_>) -> io::Result<()>;

    /// Write the pages named by `args` into the descriptor received last.
    fn dump_pages(&mut self, args: &DumpPagesArgs<'_>) -> io::Result<()>;
}
