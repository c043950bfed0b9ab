//! Scripted parasite and in-memory destination shared by the dump tests
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::{self, Cursor};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::rc::Rc;

use crust_dump::compel::{DumpPagesArgs, ParasiteAgent, ParasiteVmaEntry};
use crust_dump::criu::page_pipe::PageRange;
use crust_dump::criu::util::{read_all, write_all, PAGE_SIZE};
use crust_dump::criu::vma::{VmAreaList, VmaArea, VmaKind};
use crust_dump::criu::stats::DumpStats;
use crust_dump::{parasite_dump_pages_seized, Destination, DumpError, DumpOpts, PageXfer};

pub const P: u64 = PAGE_SIZE as u64;
pub const PID: libc::pid_t = 1000;

pub fn rw() -> u32 {
    (libc::PROT_READ | libc::PROT_WRITE) as u32
}

pub fn vma(start_pfn: u64, nr: u64, prot: u32, kind: VmaKind) -> VmaArea {
    VmaArea::new(start_pfn * P, (start_pfn + nr) * P, prot, kind)
}

/// Pagemap covering pfns [0, len) with the given entries
pub fn pagemap(entries: &[(u64, u64)], len: u64) -> Cursor<Vec<u8>> {
    let mut raw = vec![0u8; len as usize * 8];
    for &(pfn, pme) in entries {
        let at = pfn as usize * 8;
        raw[at..at + 8].copy_from_slice(&pme.to_ne_bytes());
    }
    Cursor::new(raw)
}

/// Content the fake task holds at `addr`
pub fn page_of(addr: u64) -> Vec<u8> {
    vec![(addr / P) as u8; PAGE_SIZE]
}

pub fn opts(pages_per_pipe: usize) -> DumpOpts {
    DumpOpts::default().with_pages_per_pipe(pages_per_pipe)
}

/// Dump `vmas` of the fake task through `agent`, reading `pm` as its pagemap
pub fn dump_scripted<D: Destination>(
    agent: &mut ScriptedAgent,
    vmas: &VmAreaList,
    pm: Cursor<Vec<u8>>,
    dest: &D,
    pages_per_pipe: usize,
) -> Result<DumpStats, DumpError> {
    parasite_dump_pages_seized(agent, PID, vmas, move || Ok(pm), dest, &opts(pages_per_pipe))
}

pub fn tmp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join(format!("crust-dump-it-{}-{}", std::process::id(), name));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// In-memory stand-in for the parasite
#[derive(Default)]
pub struct ScriptedAgent {
    /// Current protections, by vma start
    pub prots: BTreeMap<u64, u32>,
    pub mprotect_calls: Vec<Vec<ParasiteVmaEntry>>,
    /// (pages, segs, first iov index) of every dump_pages call
    pub dump_calls: Vec<(usize, usize, usize)>,
    pipe: Option<OwnedFd>,
    /// Fail the mprotect call with this index
    pub fail_mprotect: Option<usize>,
    pub fail_dump_pages: bool,
    /// Pages actually written per dump_pages call, when set
    pub short_dump: Option<usize>,
}

impl ScriptedAgent {
    pub fn new(vmas: &VmAreaList) -> Self {
        Self {
            prots: vmas.entries.iter().map(|v| (v.start, v.prot)).collect(),
            ..Default::default()
        }
    }
}

impl ParasiteAgent for ScriptedAgent {
    fn mprotect_vmas(&mut self, vmas: &[ParasiteVmaEntry]) -> io::Result<()> {
        let nr = self.mprotect_calls.len();
        self.mprotect_calls.push(vmas.to_vec());
        if self.fail_mprotect == Some(nr) {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        for v in vmas {
            self.prots.insert(v.start, v.prot);
        }
        Ok(())
    }

    fn send_fd(&mut self, fd: BorrowedFd<'_>) -> io::Result<()> {
        self.pipe = Some(fd.try_clone_to_owned()?);
        Ok(())
    }

    fn dump_pages(&mut self, args: &DumpPagesArgs<'_>) -> io::Result<()> {
        self.dump_calls.push((args.nr_pages, args.nr_segs, args.off));
        if self.fail_dump_pages {
            return Err(io::Error::from_raw_os_error(libc::EFAULT));
        }

        let pipe = self.pipe.take().expect("pipe sent before dump");
        let mut budget = self.short_dump.unwrap_or(usize::MAX);
        for iov in args.iovs {
            for pfn in 0..iov.nr_pages {
                if budget == 0 {
                    return Ok(());
                }
                write_all(pipe.as_raw_fd(), &page_of(iov.start + pfn * P))?;
                budget -= 1;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct Recorded {
    /// (vaddr, nr_pages, page offset) of every pagemap entry
    pub entries: Vec<(u64, u64, u64)>,
    pub pages: Vec<u8>,
    pub opened: usize,
    pub closed: usize,
}

/// Destination keeping everything in memory
#[derive(Default, Clone)]
pub struct MemDest {
    pub rec: Rc<RefCell<Recorded>>,
    pub fail_write_pages: bool,
}

pub struct MemXfer {
    rec: Rc<RefCell<Recorded>>,
    fail_write_pages: bool,
}

impl Destination for MemDest {
    type Xfer = MemXfer;

    fn open(&self, _pid: libc::pid_t) -> io::Result<MemXfer> {
        self.rec.borrow_mut().opened += 1;
        Ok(MemXfer {
            rec: Rc::clone(&self.rec),
            fail_write_pages: self.fail_write_pages,
        })
    }
}

impl PageXfer for MemXfer {
    fn write_pagemap(&mut self, iov: &PageRange, off: u64) -> io::Result<()> {
        self.rec.borrow_mut().entries.push((iov.start, iov.nr_pages, off));
        Ok(())
    }

    fn write_pages(&mut self, pipe: BorrowedFd<'_>, len: usize) -> io::Result<usize> {
        if self.fail_write_pages {
            return Err(io::Error::from_raw_os_error(libc::ENOSPC));
        }
        let mut buf = vec![0u8; len];
        let n = read_all(pipe.as_raw_fd(), &mut buf)?;
        self.rec.borrow_mut().pages.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn close(self) -> io::Result<()> {
        self.rec.borrow_mut().closed += 1;
        Ok(())
    }
}
