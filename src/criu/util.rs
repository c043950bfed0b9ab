use std::fs;
use std::io::{self, Error, ErrorKind};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::ptr;

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Fallback when /proc/sys/fs/pipe-max-size can't be read
pub const DEFAULT_PIPE_MAX_SIZE: usize = 1024 * 1024;

pub fn write_all(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0usize;
    let mut remaining = buf;

    while !remaining.is_empty() {
        let ret = unsafe {
            libc::write(fd, remaining.as_ptr() as *const libc::c_void, remaining.len())
        };

        if ret == -1 {
            let err = Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }

        let n = ret as usize;
        written += n;
        remaining = &remaining[n..];
    }

    Ok(written)
}

pub fn read_all(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0usize;
    let mut remaining = buf;

    while !remaining.is_empty() {
        let ret = unsafe {
            libc::read(fd, remaining.as_mut_ptr() as *mut libc::c_void, remaining.len())
        };

        if ret == -1 {
            let err = Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }

        if ret == 0 {
            break;
        }

        let n = ret as usize;
        total += n;
        remaining = &mut remaining[n..];
    }

    Ok(total)
}

/// Move up to `len` bytes from a pipe into `to` without copying them
/// through user memory.
///
/// Returns the number of bytes moved, which is short only if the pipe ran
/// dry.
pub fn splice_all(from: BorrowedFd<'_>, to: BorrowedFd<'_>, len: usize) -> io::Result<usize> {
    let mut moved = 0usize;

    while moved < len {
        let ret = unsafe {
            libc::splice(
                from.as_raw_fd(),
                ptr::null_mut(),
                to.as_raw_fd(),
                ptr::null_mut(),
                len - moved,
                libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK,
            )
        };

        if ret == -1 {
            let err = Error::last_os_error();
            match err.kind() {
                ErrorKind::Interrupted => continue,
                // Empty pipe, the writer has nothing more for us
                ErrorKind::WouldBlock => break,
                _ => return Err(err),
            }
        }

        if ret == 0 {
            break;
        }

        moved += ret as usize;
    }

    Ok(moved)
}

/// Create a pipe, returning (read end, write end).
pub fn make_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [-1 as RawFd; 2];

    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if ret < 0 {
        return Err(Error::last_os_error());
    }

    let rd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let wr = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((rd, wr))
}

/// Resize a pipe to hold at least `size` bytes, returning the new size.
pub fn set_pipe_size(fd: BorrowedFd<'_>, size: usize) -> io::Result<usize> {
    let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETPIPE_SZ, size as libc::c_int) };
    if ret < 0 {
        let err = Error::last_os_error();
        return Err(Error::new(
            err.kind(),
            format!("Can't set pipe size to {}: {}", size, err),
        ));
    }

    Ok(ret as usize)
}

pub fn pipe_max_size() -> usize {
    fs::read_to_string("/proc/sys/fs/pipe-max-size")
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(DEFAULT_PIPE_MAX_SIZE)
}

pub fn proc_path(pid: libc::pid_t, subpath: &str) -> String {
    format!("/proc/{}/{}", pid, subpath)
}
