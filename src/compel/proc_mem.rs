//! Agent serving parasite commands from outside the task
//!
//! Reads go through /proc/<pid>/mem, which the kernel services with
//! FOLL_FORCE: pages are readable whatever their protection, so protection
//! requests only need to be acknowledged. The caller must be allowed to
//! ptrace the task.
//!
//! Unlike the in-task parasite, which vmsplices pages straight into the
//! pipe, this agent copies every page through a dumper-side buffer before
//! writing it to the pipe. Only the drain side stays zero-copy.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::FileExt;

use crate::compel::parasite::{DumpPagesArgs, ParasiteAgent, ParasiteVmaEntry};
use crate::criu::util::{proc_path, write_all, PAGE_SIZE};

#[derive(Debug)]
pub struct ProcMemAgent {
    pid: libc::pid_t,
    mem: File,
    /// Pipe received by the last send_fd
    pipe: Option<OwnedFd>,
    /// Protection batches seen so far, in call order
    prot_requests: Vec<Vec<ParasiteVmaEntry>>,
}

impl ProcMemAgent {
    pub fn open(pid: libc::pid_t) -> io::Result<Self> {
        let path = proc_path(pid, "mem");
        let mem = File::open(&path)
            .map_err(|e| io::Error::new(e.kind(), format!("Can't open {}: {}", path, e)))?;

        Ok(Self {
            pid,
            mem,
            pipe: None,
            prot_requests: Vec::new(),
        })
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn prot_requests(&self) -> &[Vec<ParasiteVmaEntry>] {
        &self.prot_requests
    }
}

impl ParasiteAgent for ProcMemAgent {
    fn mprotect_vmas(&mut self, vmas: &[ParasiteVmaEntry]) -> io::Result<()> {
        for vma in vmas {
            log::debug!(
                "\tmprotect {:#x}-{:#x} to {:#x}",
                vma.start,
                vma.start + vma.len,
                vma.prot
            );
        }
        self.prot_requests.push(vmas.to_vec());
        Ok(())
    }

    fn send_fd(&mut self, fd: BorrowedFd<'_>) -> io::Result<()> {
        self.pipe = Some(fd.try_clone_to_owned()?);
        Ok(())
    }

    fn dump_pages(&mut self, args: &DumpPagesArgs<'_>) -> io::Result<()> {
        // The pipe is consumed by one dump, like a received descriptor would be
        let pipe = self.pipe.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "No pipe received for dump_pages")
        })?;

        let mut page = vec![0u8; PAGE_SIZE];
        for iov in args.iovs {
            for pfn in 0..iov.nr_pages {
                let addr = iov.start + pfn * PAGE_SIZE as u64;
                self.mem.read_exact_at(&mut page, addr).map_err(|e| {
                    io::Error::new(
                        e.kind(),
                        format!("Can't read {:#x} of {}: {}", addr, self.pid, e),
                    )
                })?;
                write_all(pipe.as_raw_fd(), &page)?;
            }
        }

        log::debug!("Dumped {} pages of {} via /proc", args.nr_pages, self.pid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criu::page_pipe::PageRange;
    use crate::criu::util::{make_pipe, read_all};
    use std::os::fd::AsFd;

    #[test]
    fn test_dump_own_page() {
        let data = vec![0x5au8; 2 * PAGE_SIZE];
        let aligned = (data.as_ptr() as u64 + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);

        let mut agent = ProcMemAgent::open(std::process::id() as libc::pid_t).unwrap();
        let (rd, wr) = make_pipe().unwrap();
        agent.send_fd(wr.as_fd()).unwrap();
        drop(wr);

        let iovs = [PageRange::new(aligned, 1)];
        agent
            .dump_pages(&DumpPagesArgs {
                iovs: &iovs,
                nr_segs: 1,
                nr_pages: 1,
                off: 0,
            })
            .unwrap();

        let mut buf = vec![0u8; PAGE_SIZE];
        assert_eq!(read_all(rd.as_raw_fd(), &mut buf).unwrap(), PAGE_SIZE);
        assert!(buf.iter().all(|&b| b == 0x5a));
    }

    #[test]
    fn test_dump_without_pipe() {
        let mut agent = ProcMemAgent::open(std::process::id() as libc::pid_t).unwrap();
        let err = agent
            .dump_pages(&DumpPagesArgs {
                iovs: &[],
                nr_segs: 0,
                nr_pages: 0,
                off: 0,
            })
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_mprotect_is_recorded() {
        let mut agent = ProcMemAgent::open(std::process::id() as libc::pid_t).unwrap();
        let req = [ParasiteVmaEntry { start: 0x1000, len: 0x2000, prot: 1 }];
        agent.mprotect_vmas(&req).unwrap();
        assert_eq!(agent.prot_requests(), &[req.to_vec()]);
    }
}
