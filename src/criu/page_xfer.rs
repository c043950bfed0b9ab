//! Page transfer: where dumped pages go
//!
//! Pages arrive in page pipe buffers. For every iovec of a buffer the
//! transfer records a pagemap entry and then splices the page bytes out of
//! the buffer's pipe, either into the pages image or onto a page server
//! socket.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};

use crate::criu::image::{
    magic, open_image_w, open_raw_image_w, pages_image_name, pagemap_image_name,
};
use crate::criu::page_pipe::{PagePipeBuf, PageRange};
use crate::criu::protobuf::pb_write_one;
use crate::criu::util::splice_all;
use crate::error::{MemError, Result};
use crate::proto::{PagemapEntry, PagemapHead};

pub const PE_PRESENT: u32 = 1 << 2;

/// Sink for the pages of one task
pub trait PageXfer {
    /// Announce `iov`; its pages start `off` pages into the page stream.
    fn write_pagemap(&mut self, iov: &PageRange, off: u64) -> io::Result<()>;

    /// Move `len` bytes of page data out of `pipe`, returning how many
    /// were actually moved.
    fn write_pages(&mut self, pipe: BorrowedFd<'_>, len: usize) -> io::Result<usize>;

    fn close(self) -> io::Result<()>
    where
        Self: Sized;
}

/// Something a page transfer can be opened against
pub trait Destination {
    type Xfer: PageXfer;

    fn open(&self, pid: libc::pid_t) -> io::Result<Self::Xfer>;
}

/// Drain one page pipe buffer into `xfer`, advancing the page offset.
pub fn page_xfer_dump_buf<X: PageXfer>(
    xfer: &mut X,
    ppb: &PagePipeBuf,
    off: &mut u64,
) -> Result<()> {
    let pipe = ppb.pipe().ok_or_else(|| {
        MemError::Io(io::Error::new(
            io::ErrorKind::NotConnected,
            "Page pipe buffer has no pipe to drain",
        ))
    })?;

    for iov in &ppb.iovs {
        log::debug!(
            "\tp {:#x} [{}] at page offset {}",
            iov.start,
            iov.nr_pages,
            *off
        );

        xfer.write_pagemap(iov, *off)?;

        let expected = iov.len();
        let done = xfer.write_pages(pipe.read_end(), expected)?;
        if done != expected {
            log::error!("Spliced {} of {} bytes at {:#x}", done, expected, iov.start);
            return Err(MemError::TransferShortWrite {
                vaddr: iov.start,
                done,
                expected,
            });
        }

        *off += iov.nr_pages;
    }

    Ok(())
}

/// Directory the pagemap and pages images are written to
#[derive(Debug, Clone)]
pub struct ImageDir {
    path: PathBuf,
}

impl ImageDir {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Image directory {} not found", path.display()),
            ));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Destination for ImageDir {
    type Xfer = ImageXfer;

    fn open(&self, pid: libc::pid_t) -> io::Result<ImageXfer> {
        // One pages image per task, so dumps of several tasks can share
        // a directory
        let pages_id = pid as u32;

        let mut pmi = open_image_w(&self.path, &pagemap_image_name(pid), magic::PAGEMAP_MAGIC)?;
        let pi = open_raw_image_w(&self.path, &pages_image_name(pages_id))?;

        pb_write_one(&mut pmi, &PagemapHead { pages_id })?;

        log::debug!("Open page xfer to pagemap-{} / pages-{}", pid, pages_id);
        Ok(ImageXfer { pmi, pi, pages_id })
    }
}

/// Local image pair: pagemap entries and raw page bytes
#[derive(Debug)]
pub struct ImageXfer {
    pmi: BufWriter<File>,
    pi: File,
    pages_id: u32,
}

impl PageXfer for ImageXfer {
    fn write_pagemap(&mut self, iov: &PageRange, _off: u64) -> io::Result<()> {
        let pe = PagemapEntry {
            vaddr: iov.start,
            nr_pages: iov.nr_pages as u32,
            in_parent: None,
            flags: Some(PE_PRESENT),
        };
        pb_write_one(&mut self.pmi, &pe)
    }

    fn write_pages(&mut self, pipe: BorrowedFd<'_>, len: usize) -> io::Result<usize> {
        splice_all(pipe, self.pi.as_fd(), len)
    }

    fn close(mut self) -> io::Result<()> {
        self.pmi.flush()?;
        self.pi.flush()?;
        log::debug!("Closed page xfer to pages-{}", self.pages_id);
        Ok(())
    }
}

pub const PS_IOV_ADD: u32 = 1;
pub const PS_IOV_OPEN: u32 = 3;
pub const PS_IOV_FLUSH_N_CLOSE: u32 = 0x1024;

pub const PS_TYPE_BITS: u32 = 8;
pub const PS_TYPE_PID: u64 = 1;

/// Page server destination id of a task's pagemap
pub fn encode_pm(pid: libc::pid_t) -> u64 {
    ((pid as u64) << PS_TYPE_BITS) | PS_TYPE_PID
}

/// Header of every page server command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageServerIov {
    pub cmd: u32,
    pub nr_pages: u32,
    pub vaddr: u64,
    pub dst_id: u64,
}

impl PageServerIov {
    pub const SIZE: usize = 24;

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u32::<NativeEndian>(self.cmd)?;
        buf.write_u32::<NativeEndian>(self.nr_pages)?;
        buf.write_u64::<NativeEndian>(self.vaddr)?;
        buf.write_u64::<NativeEndian>(self.dst_id)?;
        w.write_all(&buf)
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            cmd: r.read_u32::<NativeEndian>()?,
            nr_pages: r.read_u32::<NativeEndian>()?,
            vaddr: r.read_u64::<NativeEndian>()?,
            dst_id: r.read_u64::<NativeEndian>()?,
        })
    }
}

/// Remote page server reachable over TCP
#[derive(Debug, Clone, Copy)]
pub struct PageServer {
    pub addr: SocketAddr,
}

impl PageServer {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl Destination for PageServer {
    type Xfer = PageServerXfer;

    fn open(&self, pid: libc::pid_t) -> io::Result<PageServerXfer> {
        let sk = TcpStream::connect(self.addr).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("Can't connect to page server {}: {}", self.addr, e),
            )
        })?;
        sk.set_nodelay(true)?;

        let mut xfer = PageServerXfer {
            sk,
            dst_id: encode_pm(pid),
        };

        let pi = PageServerIov {
            cmd: PS_IOV_OPEN,
            dst_id: xfer.dst_id,
            ..Default::default()
        };
        pi.write_to(&mut xfer.sk)?;

        log::debug!("Open page server xfer {:#x} to {}", xfer.dst_id, self.addr);
        Ok(xfer)
    }
}

#[derive(Debug)]
pub struct PageServerXfer {
    sk: TcpStream,
    dst_id: u64,
}

impl PageXfer for PageServerXfer {
    fn write_pagemap(&mut self, iov: &PageRange, _off: u64) -> io::Result<()> {
        let pi = PageServerIov {
            cmd: PS_IOV_ADD,
            nr_pages: iov.nr_pages as u32,
            vaddr: iov.start,
            dst_id: self.dst_id,
        };
        pi.write_to(&mut self.sk)
    }

    fn write_pages(&mut self, pipe: BorrowedFd<'_>, len: usize) -> io::Result<usize> {
        splice_all(pipe, self.sk.as_fd(), len)
    }

    fn close(mut self) -> io::Result<()> {
        let pi = PageServerIov {
            cmd: PS_IOV_FLUSH_N_CLOSE,
            dst_id: self.dst_id,
            ..Default::default()
        };
        pi.write_to(&mut self.sk)?;

        let status = self.sk.read_i32::<NativeEndian>().map_err(|e| {
            io::Error::new(e.kind(), format!("Can't get page server reply: {}", e))
        })?;
        if status != 0 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("Page server failed to flush: {}", status),
            ));
        }

        Ok(())
    }
}
