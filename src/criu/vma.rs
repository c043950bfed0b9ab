use crate::criu::util::PAGE_SIZE;
use crate::error::{MemError, Result};

/// Backing of a vma, as far as page dumping is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaKind {
    AnonPrivate,
    FilePrivate,
    FileShared,
    Vdso,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmaArea {
    pub start: u64,
    pub end: u64,
    pub prot: u32,
    pub kind: VmaKind,
}

impl VmaArea {
    pub fn new(start: u64, end: u64, prot: u32, kind: VmaKind) -> Self {
        Self { start, end, prot, kind }
    }

    pub fn is(&self, kind: VmaKind) -> bool {
        self.kind == kind
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn nr_pages(&self) -> u64 {
        self.len() / PAGE_SIZE as u64
    }

    pub fn is_readable(&self) -> bool {
        (self.prot & libc::PROT_READ as u32) != 0
    }
}

/// Whether the contents of the vma go to the pages image.
///
/// Shared mappings are dumped through their backing object, specials
/// other than the vdso are recreated by the kernel on restore.
pub fn privately_dump_vma(vma: &VmaArea) -> bool {
    matches!(
        vma.kind,
        VmaKind::AnonPrivate | VmaKind::FilePrivate | VmaKind::Vdso
    )
}

/// Ordered vma list of one task together with its sizing summary
#[derive(Debug, Default, Clone)]
pub struct VmAreaList {
    pub entries: Vec<VmaArea>,
    /// Pages in privately dumped vmas
    pub priv_size: u64,
    /// Pages in the longest privately dumped vma
    pub longest: u64,
    /// Number of privately dumped vmas
    pub nr_priv: u64,
}

impl VmAreaList {
    /// Build the list, checking alignment and ordering of every entry.
    pub fn new(entries: Vec<VmaArea>) -> Result<Self> {
        let mut prev_end = 0u64;

        for vma in &entries {
            let invalid = |reason: &str| MemError::InvalidVma {
                start: vma.start,
                end: vma.end,
                reason: reason.to_string(),
            };

            if vma.start % PAGE_SIZE as u64 != 0 || vma.end % PAGE_SIZE as u64 != 0 {
                return Err(invalid("not page aligned"));
            }
            if vma.end <= vma.start {
                return Err(invalid("empty"));
            }
            if vma.start < prev_end {
                return Err(invalid("overlaps or precedes previous vma"));
            }
            prev_end = vma.end;
        }

        let mut list = Self {
            entries,
            ..Default::default()
        };
        list.update_summary();
        Ok(list)
    }

    fn update_summary(&mut self) {
        self.priv_size = 0;
        self.longest = 0;
        self.nr_priv = 0;

        for vma in self.entries.iter().filter(|v| privately_dump_vma(v)) {
            let pages = vma.nr_pages();
            self.priv_size += pages;
            self.longest = self.longest.max(pages);
            self.nr_priv += 1;
        }
    }

    /// Upper bound of iovecs needed to describe any subset of private pages.
    ///
    /// The worst case is every other page of each vma being dumped, which
    /// takes ceil(n / 2) iovecs for an n-page vma.
    pub fn max_iovs(&self) -> usize {
        ((self.priv_size + self.nr_priv) / 2) as usize
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
