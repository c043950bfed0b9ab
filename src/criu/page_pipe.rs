//! Page pipe: batches of page ranges, each batch bound to its own pipe
//!
//! Only addresses are kept here. Page contents are written into the pipes
//! by the parasite and spliced out by the page transfer, so they never
//! land in dumper memory.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use crate::criu::util::{make_pipe, set_pipe_size, PAGE_SIZE};
use crate::error::{MemError, Result};

/// Contiguous run of pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    pub start: u64,
    pub nr_pages: u64,
}

impl PageRange {
    pub fn new(start: u64, nr_pages: u64) -> Self {
        Self { start, nr_pages }
    }

    pub fn end(&self) -> u64 {
        self.start + self.nr_pages * PAGE_SIZE as u64
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.nr_pages as usize * PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.nr_pages == 0
    }
}

/// Pipe a buffer's pages travel through
#[derive(Debug)]
pub struct BufPipe {
    rd: OwnedFd,
    wr: OwnedFd,
    /// Capacity in bytes
    pub size: usize,
}

impl BufPipe {
    fn new(nr_pages: usize) -> Result<Self> {
        let (rd, wr) = make_pipe()?;
        let size = set_pipe_size(wr.as_fd(), nr_pages * PAGE_SIZE)?;
        Ok(Self { rd, wr, size })
    }

    /// End the parasite writes to
    pub fn write_end(&self) -> BorrowedFd<'_> {
        self.wr.as_fd()
    }

    /// End the page transfer drains
    pub fn read_end(&self) -> BorrowedFd<'_> {
        self.rd.as_fd()
    }
}

/// One pipe worth of pages
///
/// The pipe itself is only opened when the buffer is about to be filled,
/// so a dump holds one pipe at a time however many buffers it has.
#[derive(Debug)]
pub struct PagePipeBuf {
    pipe: Option<BufPipe>,
    /// Pages described by `iovs`
    pub pages_in: usize,
    pub iovs: Vec<PageRange>,
}

impl PagePipeBuf {
    pub fn nr_segs(&self) -> usize {
        self.iovs.len()
    }

    /// Open the pipe, big enough for every page of the buffer, unless it
    /// is open already.
    pub fn open_pipe(&mut self) -> Result<&BufPipe> {
        let pipe = match self.pipe.take() {
            Some(pipe) => pipe,
            None => BufPipe::new(self.pages_in)?,
        };
        Ok(&*self.pipe.insert(pipe))
    }

    pub fn pipe(&self) -> Option<&BufPipe> {
        self.pipe.as_ref()
    }
}

#[derive(Debug)]
pub struct PagePipe {
    bufs: Vec<PagePipeBuf>,
    /// Page budget of a single buffer
    max_pages_per_buf: usize,
    /// Iovecs allowed across all buffers
    nr_iovs: usize,
    /// Iovecs handed out so far
    free_iov: usize,
}

impl PagePipe {
    pub fn new(nr_iovs: usize, max_pages_per_buf: usize) -> Self {
        assert!(max_pages_per_buf > 0, "page pipe buffers must hold at least one page");

        log::debug!(
            "Create page pipe for {} iovs, {} pages per buf",
            nr_iovs,
            max_pages_per_buf
        );

        Self {
            bufs: Vec::new(),
            max_pages_per_buf,
            nr_iovs,
            free_iov: 0,
        }
    }

    fn take_iov(&mut self) -> Result<()> {
        if self.free_iov >= self.nr_iovs {
            log::error!("Page pipe is out of iovs ({})", self.nr_iovs);
            return Err(MemError::CapacityExceeded { nr_iovs: self.nr_iovs });
        }
        self.free_iov += 1;
        Ok(())
    }

    pub fn add_page(&mut self, addr: u64) -> Result<()> {
        debug_assert_eq!(addr % PAGE_SIZE as u64, 0);

        let budget = self.max_pages_per_buf;
        let needs_buf = match self.bufs.last() {
            Some(ppb) => ppb.pages_in >= budget,
            None => true,
        };

        if needs_buf {
            self.take_iov()?;
            self.bufs.push(PagePipeBuf {
                pipe: None,
                pages_in: 1,
                iovs: vec![PageRange::new(addr, 1)],
            });
            return Ok(());
        }

        let extends = self
            .bufs
            .last()
            .and_then(|ppb| ppb.iovs.last())
            .map_or(false, |iov| iov.end() == addr);

        if !extends {
            self.take_iov()?;
        }

        // needs_buf is false, so there is a trailing buffer
        if let Some(ppb) = self.bufs.last_mut() {
            match ppb.iovs.last_mut() {
                Some(iov) if extends => iov.nr_pages += 1,
                _ => ppb.iovs.push(PageRange::new(addr, 1)),
            }
            ppb.pages_in += 1;
        }

        Ok(())
    }

    pub fn bufs(&self) -> &[PagePipeBuf] {
        &self.bufs
    }

    pub fn nr_bufs(&self) -> usize {
        self.bufs.len()
    }

    pub fn nr_iovs_used(&self) -> usize {
        self.free_iov
    }

    pub fn nr_pages(&self) -> usize {
        self.bufs.iter().map(|ppb| ppb.pages_in).sum()
    }

    /// Give up the buffers, in address order. A buffer's pipe is closed
    /// once the buffer is dropped.
    pub fn into_bufs(self) -> std::vec::IntoIter<PagePipeBuf> {
        self.bufs.into_iter()
    }

    pub fn destroy(self) {
        log::debug!("Destroy page pipe with {} bufs", self.bufs.len());
        drop(self.bufs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::os::fd::AsRawFd;

    const P: u64 = PAGE_SIZE as u64;

    fn ranges(pp: &PagePipe) -> Vec<Vec<(u64, u64)>> {
        pp.bufs()
            .iter()
            .map(|b| b.iovs.iter().map(|i| (i.start / P, i.nr_pages)).collect())
            .collect()
    }

    #[test]
    fn test_contiguous_pages_merge() {
        let mut pp = PagePipe::new(4, 16);
        for pfn in 10..15 {
            pp.add_page(pfn * P).unwrap();
        }
        assert_eq!(ranges(&pp), vec![vec![(10, 5)]]);
        assert_eq!(pp.nr_iovs_used(), 1);
    }

    #[test]
    fn test_gap_opens_new_iov() {
        let mut pp = PagePipe::new(4, 16);
        pp.add_page(0).unwrap();
        pp.add_page(2 * P).unwrap();
        pp.add_page(3 * P).unwrap();
        assert_eq!(ranges(&pp), vec![vec![(0, 1), (2, 2)]]);
    }

    #[test]
    fn test_full_buf_splits_contiguous_run() {
        let mut pp = PagePipe::new(4, 2);
        for pfn in 0..5 {
            pp.add_page(pfn * P).unwrap();
        }
        assert_eq!(ranges(&pp), vec![vec![(0, 2)], vec![(2, 2)], vec![(4, 1)]]);
        assert_eq!(pp.nr_bufs(), 3);
    }

    #[test]
    fn test_alternating_pages() {
        let mut pp = PagePipe::new(5, 4);
        for pfn in (0..10).step_by(2) {
            pp.add_page(pfn * P).unwrap();
        }
        assert_eq!(
            ranges(&pp),
            vec![vec![(0, 1), (2, 1), (4, 1), (6, 1)], vec![(8, 1)]]
        );
        assert_eq!(pp.bufs()[0].pages_in, 4);
        assert_eq!(pp.bufs()[1].pages_in, 1);
    }

    #[test]
    fn test_out_of_iovs() {
        let mut pp = PagePipe::new(2, 16);
        pp.add_page(0).unwrap();
        pp.add_page(2 * P).unwrap();
        // Contiguous pages don't need a new iov
        pp.add_page(3 * P).unwrap();

        let err = pp.add_page(5 * P).unwrap_err();
        assert!(matches!(err, MemError::CapacityExceeded { nr_iovs: 2 }));
    }

    #[test]
    fn test_pipe_holds_whole_buffer() {
        let mut pp = PagePipe::new(1, 32);
        for pfn in 0..32 {
            pp.add_page(pfn * P).unwrap();
        }

        let mut ppb = pp.into_bufs().next().unwrap();
        assert!(ppb.pipe().is_none());
        let size = ppb.open_pipe().unwrap().size;
        assert!(size >= 32 * PAGE_SIZE);
        // Opening twice keeps the same pipe
        let fd = ppb.pipe().unwrap().read_end().as_raw_fd();
        assert_eq!(ppb.open_pipe().unwrap().read_end().as_raw_fd(), fd);
    }

    #[test]
    fn test_buffers_hold_no_pipes() {
        // More buffers than a 1024 descriptor limit could hold pipes for
        let mut pp = PagePipe::new(600, 4);
        for pfn in 0..600 * 4 {
            pp.add_page(pfn * P).unwrap();
        }
        assert_eq!(pp.nr_bufs(), 600);
        assert!(pp.bufs().iter().all(|ppb| ppb.pipe().is_none()));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn replay_matches_input(
            pfns in prop::collection::btree_set(0u64..512, 0..128),
            budget in 1usize..9,
        ) {
            let pfns: Vec<u64> = pfns.into_iter().collect();
            let mut pp = PagePipe::new(pfns.len(), budget);
            for &pfn in &pfns {
                pp.add_page(pfn * P).unwrap();
            }

            let mut replay = Vec::new();
            for ppb in pp.bufs() {
                prop_assert!(ppb.pages_in <= budget);
                prop_assert!(ppb.pages_in > 0);

                let in_iovs: u64 = ppb.iovs.iter().map(|i| i.nr_pages).sum();
                prop_assert_eq!(in_iovs as usize, ppb.pages_in);

                for iov in &ppb.iovs {
                    for n in 0..iov.nr_pages {
                        replay.push(iov.start / P + n);
                    }
                }
            }

            prop_assert_eq!(replay, pfns);
        }
    }
}
