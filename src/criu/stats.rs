use std::time::{Duration, Instant};

#[repr(usize)]
#[derive(Debug, Clone, Copy)]
pub enum DumpTime {
    Memdump = 0,
    Memwrite,
}

pub const DUMP_TIME_NR_STATS: usize = 2;

#[repr(usize)]
#[derive(Debug, Clone, Copy)]
pub enum DumpCnt {
    PagesScanned = 0,
    PagesSkipped,
    PagesWritten,
    PagePipeBufs,
    PagePipeIovs,
}

pub const DUMP_CNT_NR_STATS: usize = 5;

#[derive(Debug, Clone, Copy, Default)]
pub struct Timing {
    pub start: Option<Instant>,
    pub total: Duration,
}

/// Counters and timings of one page dump
#[derive(Debug, Clone, Default)]
pub struct DumpStats {
    pub timings: [Timing; DUMP_TIME_NR_STATS],
    pub counts: [u64; DUMP_CNT_NR_STATS],
}

impl DumpStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timing_start(&mut self, t: DumpTime) {
        self.timings[t as usize].start = Some(Instant::now());
    }

    pub fn timing_stop(&mut self, t: DumpTime) {
        let tm = &mut self.timings[t as usize];
        if let Some(start) = tm.start.take() {
            tm.total += start.elapsed();
        }
    }

    pub fn cnt_add(&mut self, c: DumpCnt, val: u64) {
        self.counts[c as usize] += val;
    }

    pub fn cnt(&self, c: DumpCnt) -> u64 {
        self.counts[c as usize]
    }

    pub fn time(&self, t: DumpTime) -> Duration {
        self.timings[t as usize].total
    }

    pub fn display(&self) {
        log::info!(
            "Pages scanned {} skipped {} written {} ({} bufs, {} iovs)",
            self.cnt(DumpCnt::PagesScanned),
            self.cnt(DumpCnt::PagesSkipped),
            self.cnt(DumpCnt::PagesWritten),
            self.cnt(DumpCnt::PagePipeBufs),
            self.cnt(DumpCnt::PagePipeIovs)
        );
        log::info!(
            "Memdump {:?}, memwrite {:?}",
            self.time(DumpTime::Memdump),
            self.time(DumpTime::Memwrite)
        );
    }
}
