//! Dumping private memory of a seized task
//!
//! The flow for one task is:
//!
//! 1. ask the parasite to add PROT_READ to private vmas lacking it,
//! 2. walk /proc/pid/pagemap for every private vma and collect the pages
//!    worth dumping into a page pipe,
//! 3. for every page pipe buffer let the parasite fill the pipe and splice
//!    it into the page transfer,
//! 4. ask the parasite to put the original protections back.
//!
//! Step 4 runs whenever step 1 succeeded, no matter how 2 and 3 went.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::mem;

use byteorder::{ByteOrder, NativeEndian};

use crate::compel::parasite::{
    DumpPagesArgs, ParasiteAgent, ParasiteCmd, ParasiteVmaEntry,
};
use crate::criu::options::DumpOpts;
use crate::criu::page_pipe::{PagePipe, PagePipeBuf};
use crate::criu::page_xfer::{page_xfer_dump_buf, Destination, PageXfer};
use crate::criu::stats::{DumpCnt, DumpStats, DumpTime};
use crate::criu::util::{proc_path, PAGE_SIZE};
use crate::criu::vma::{privately_dump_vma, VmAreaList, VmaArea, VmaKind};
use crate::error::{DumpError, DumpStage, MemError, Result};

pub const PME_PRESENT: u64 = 1 << 63;
pub const PME_SWAP: u64 = 1 << 62;
pub const PME_FILE: u64 = 1 << 61;

/// Size of one pagemap entry
pub const PME_SIZE: usize = mem::size_of::<u64>();

#[inline]
pub fn should_dump_page(vma: &VmaArea, pme: u64) -> bool {
    if vma.is(VmaKind::Vdso) {
        return true;
    }
    // Private file pages that haven't been COW-ed yet are restored from
    // the file itself
    if vma.is(VmaKind::FilePrivate) && (pme & PME_FILE) != 0 {
        return false;
    }

    (pme & (PME_PRESENT | PME_SWAP)) != 0
}

/// Walks the pagemap of one task, vma by vma.
pub struct PagemapScanner<R> {
    pagemap: R,
    /// Raw entries of the vma being scanned, sized for the longest one
    map: Vec<u8>,
}

/// Zeroed entry buffer for `nr_pages` pages. Runs with relaxed
/// protections in place, so failing to allocate must not abort.
fn alloc_map(nr_pages: u64) -> Result<Vec<u8>> {
    let oom = || {
        MemError::Io(io::Error::new(
            io::ErrorKind::OutOfMemory,
            format!("Can't allocate pagemap buffer for {} pages", nr_pages),
        ))
    };

    let len = usize::try_from(nr_pages)
        .ok()
        .and_then(|nr| nr.checked_mul(PME_SIZE))
        .ok_or_else(oom)?;

    let mut map = Vec::new();
    map.try_reserve_exact(len).map_err(|_| oom())?;
    map.resize(len, 0);
    Ok(map)
}

impl<R: Read + Seek> PagemapScanner<R> {
    pub fn new(pagemap: R, longest: u64) -> Result<Self> {
        Ok(Self {
            pagemap,
            map: alloc_map(longest)?,
        })
    }

    /// Add the pages of `vma` worth dumping to `pp`, returning how many
    /// were added.
    pub fn generate_iovs(&mut self, vma: &VmaArea, pp: &mut PagePipe) -> Result<u64> {
        let offset = vma.start / PAGE_SIZE as u64 * PME_SIZE as u64;

        match self.pagemap.seek(SeekFrom::Start(offset)) {
            Ok(pos) if pos == offset => {}
            Ok(pos) => {
                return Err(MemError::ResidencyRead {
                    offset,
                    source: io::Error::new(
                        io::ErrorKind::Other,
                        format!("Can't rewind pagemap file, at {:#x}", pos),
                    ),
                })
            }
            Err(source) => return Err(MemError::ResidencyRead { offset, source }),
        }

        if (self.map.len() / PME_SIZE) < vma.nr_pages() as usize {
            // Only happens when the vma list summary is stale
            log::warn!("Pagemap buffer too small for {:#x}, growing", vma.start);
            self.map = alloc_map(vma.nr_pages())?;
        }

        let len = vma.nr_pages() as usize * PME_SIZE;
        let map = &mut self.map[..len];
        self.pagemap
            .read_exact(map)
            .map_err(|source| MemError::ResidencyRead { offset, source })?;

        let mut nr_dumped = 0u64;
        for (pfn, raw) in map.chunks_exact(PME_SIZE).enumerate() {
            let pme = NativeEndian::read_u64(raw);
            if !should_dump_page(vma, pme) {
                continue;
            }

            pp.add_page(vma.start + (pfn * PAGE_SIZE) as u64)?;
            nr_dumped += 1;
        }

        Ok(nr_dumped)
    }

    /// Drop the entry buffer and hand the pagemap back.
    pub fn finish(self) -> R {
        self.pagemap
    }
}

/// Add or remove PROT_READ on every private vma that lacks it, in one
/// parasite call.
pub fn parasite_mprotect_seized<A: ParasiteAgent>(
    agent: &mut A,
    vmas: &VmAreaList,
    unprotect: bool,
) -> Result<()> {
    let args: Vec<ParasiteVmaEntry> = vmas
        .entries
        .iter()
        .filter(|vma| privately_dump_vma(vma) && !vma.is_readable())
        .map(|vma| {
            let mut prot = vma.prot;
            if unprotect {
                prot |= libc::PROT_READ as u32;
            }
            ParasiteVmaEntry {
                start: vma.start,
                len: vma.len(),
                prot,
            }
        })
        .collect();

    if args.is_empty() {
        return Ok(());
    }

    log::debug!(
        "{} {} vmas with parasite",
        if unprotect { "Unprotect" } else { "Protect" },
        args.len()
    );

    agent
        .mprotect_vmas(&args)
        .map_err(|source| MemError::AgentCall {
            cmd: ParasiteCmd::MprotectVmas,
            source,
        })
}

fn parasite_dump_buf<A: ParasiteAgent>(
    agent: &mut A,
    ppb: &mut PagePipeBuf,
    off: usize,
) -> Result<()> {
    let pipe = ppb.open_pipe()?;
    let pipe_size = pipe.size;
    agent
        .send_fd(pipe.write_end())
        .map_err(|source| MemError::AgentCall {
            cmd: ParasiteCmd::SendFd,
            source,
        })?;

    let args = DumpPagesArgs {
        iovs: &ppb.iovs,
        nr_segs: ppb.nr_segs(),
        nr_pages: ppb.pages_in,
        off,
    };

    log::debug!(
        "PPB: {} pages {} segs {} pipe {} off",
        args.nr_pages,
        args.nr_segs,
        pipe_size,
        args.off
    );

    agent
        .dump_pages(&args)
        .map_err(|source| MemError::AgentCall {
            cmd: ParasiteCmd::DumpPages,
            source,
        })
}

fn scan_vmas<R: Read + Seek>(
    pagemap: R,
    vmas: &VmAreaList,
    opts: &DumpOpts,
    stats: &mut DumpStats,
) -> Result<PagePipe> {
    // A run crossing a buffer boundary takes one more iovec per buffer
    let nr_bufs = (vmas.priv_size as usize).div_ceil(opts.pages_per_pipe);
    let mut pp = PagePipe::new(vmas.max_iovs() + nr_bufs, opts.pages_per_pipe);
    let mut scanner = PagemapScanner::new(pagemap, vmas.longest)?;

    for vma in vmas.entries.iter().filter(|v| privately_dump_vma(v)) {
        let nr_dumped = scanner.generate_iovs(vma, &mut pp)?;
        stats.cnt_add(DumpCnt::PagesScanned, vma.nr_pages());
        stats.cnt_add(DumpCnt::PagesSkipped, vma.nr_pages() - nr_dumped);
    }

    drop(scanner.finish());

    stats.cnt_add(DumpCnt::PagePipeBufs, pp.nr_bufs() as u64);
    stats.cnt_add(DumpCnt::PagePipeIovs, pp.nr_iovs_used() as u64);
    Ok(pp)
}

fn transfer_pages<A, X>(
    agent: &mut A,
    pp: PagePipe,
    xfer: &mut X,
    stats: &mut DumpStats,
) -> Result<()>
where
    A: ParasiteAgent,
    X: PageXfer,
{
    let mut iov_off = 0usize;
    let mut page_off = 0u64;

    // Buffers are filled and drained one by one, so only one pipe is
    // open at any time
    for mut ppb in pp.into_bufs() {
        stats.timing_start(DumpTime::Memdump);
        let ret = parasite_dump_buf(agent, &mut ppb, iov_off);
        stats.timing_stop(DumpTime::Memdump);
        ret?;

        stats.timing_start(DumpTime::Memwrite);
        let ret = page_xfer_dump_buf(xfer, &ppb, &mut page_off);
        stats.timing_stop(DumpTime::Memwrite);
        ret?;

        iov_off += ppb.nr_segs();
        stats.cnt_add(DumpCnt::PagesWritten, ppb.pages_in as u64);
    }

    Ok(())
}

/// Steps of a page dump
enum DumpState<F> {
    Idle(F),
    Unprotected(F),
    Scanned(PagePipe),
    Transferred,
    RollingBack(Option<DumpError>),
    Restored(Option<DumpError>),
}

/// Dump the private pages of a seized task.
///
/// `open_pagemap` yields the task's pagemap; it is called once protections
/// have been relaxed. On success the dump statistics are returned, on
/// failure the error names the step that failed. Protections are put back
/// on every path once they have been changed.
///
/// Options are checked before anything is asked of the parasite; bad ones
/// fail the [`DumpStage::Prepare`] stage.
pub fn parasite_dump_pages_seized<A, D, R, F>(
    agent: &mut A,
    pid: libc::pid_t,
    vmas: &VmAreaList,
    open_pagemap: F,
    dest: &D,
    opts: &DumpOpts,
) -> std::result::Result<DumpStats, DumpError>
where
    A: ParasiteAgent,
    D: Destination,
    R: Read + Seek,
    F: FnOnce() -> io::Result<R>,
{
    opts.validate().map_err(|e| DumpError::new(DumpStage::Prepare, e))?;

    let mut stats = DumpStats::new();
    let mut state = DumpState::Idle(open_pagemap);

    log::info!("Dumping pages (pid: {})", pid);
    log::info!("----------------------------------------");
    log::debug!("   Private vmas {}/{} pages", vmas.longest, vmas.priv_size);

    loop {
        state = match state {
            DumpState::Idle(open_pagemap) => {
                match parasite_mprotect_seized(agent, vmas, true) {
                    Ok(()) => DumpState::Unprotected(open_pagemap),
                    Err(e) => {
                        log::error!("Can't dump unprotect vmas with parasite");
                        return Err(DumpError::new(DumpStage::Unprotect, e));
                    }
                }
            }

            DumpState::Unprotected(open_pagemap) => {
                let ret = open_pagemap()
                    .map_err(|source| MemError::ResidencyRead { offset: 0, source })
                    .and_then(|pagemap| scan_vmas(pagemap, vmas, opts, &mut stats));

                match ret {
                    Ok(pp) => DumpState::Scanned(pp),
                    Err(e) => {
                        DumpState::RollingBack(Some(DumpError::new(DumpStage::Scan, e)))
                    }
                }
            }

            DumpState::Scanned(pp) => {
                let ret = match dest.open(pid) {
                    Ok(mut xfer) => {
                        let ret = transfer_pages(agent, pp, &mut xfer, &mut stats);
                        let closed = xfer.close().map_err(MemError::from);
                        ret.and(closed)
                    }
                    Err(e) => {
                        pp.destroy();
                        Err(MemError::from(e))
                    }
                };

                match ret {
                    Ok(()) => DumpState::Transferred,
                    Err(e) => {
                        log::error!("Can't dump page with parasite");
                        DumpState::RollingBack(Some(DumpError::new(DumpStage::Transfer, e)))
                    }
                }
            }

            DumpState::Transferred => DumpState::RollingBack(None),

            DumpState::RollingBack(err) => match parasite_mprotect_seized(agent, vmas, false) {
                Ok(()) => DumpState::Restored(err),
                Err(e) => {
                    log::error!("Can't rollback unprotected vmas with parasite");
                    let restore_err = DumpError::new(
                        DumpStage::Restore,
                        MemError::ProtectionRestore(Box::new(e)),
                    );
                    match err {
                        Some(first) => {
                            log::error!("{}", restore_err);
                            DumpState::Restored(Some(first))
                        }
                        None => DumpState::Restored(Some(restore_err)),
                    }
                }
            },

            DumpState::Restored(err) => {
                log::info!("----------------------------------------");
                return match err {
                    Some(e) => Err(e),
                    None => {
                        stats.display();
                        Ok(stats)
                    }
                };
            }
        };
    }
}

/// Dump the private pages of seized task `pid` through its parasite.
pub fn dump<A, D>(
    pid: libc::pid_t,
    vmas: &VmAreaList,
    dest: &D,
    agent: &mut A,
    opts: &DumpOpts,
) -> std::result::Result<DumpStats, DumpError>
where
    A: ParasiteAgent,
    D: Destination,
{
    parasite_dump_pages_seized(
        agent,
        pid,
        vmas,
        || File::open(proc_path(pid, "pagemap")),
        dest,
        opts,
    )
}
