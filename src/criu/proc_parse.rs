use std::fs;
use std::io;

use crate::criu::util::proc_path;
use crate::criu::vma::{VmAreaList, VmaArea, VmaKind};
use crate::error::{MemError, Result};

fn bad_line(line: &str, what: &str) -> MemError {
    MemError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("Can't parse maps line ({}): {}", what, line),
    ))
}

fn parse_prot(perms: &[u8]) -> u32 {
    let mut prot = 0;
    if perms[0] == b'r' {
        prot |= libc::PROT_READ;
    }
    if perms[1] == b'w' {
        prot |= libc::PROT_WRITE;
    }
    if perms[2] == b'x' {
        prot |= libc::PROT_EXEC;
    }
    prot as u32
}

/// Parses one line of /proc/<pid>/maps.
///
/// Format: `start-end perms offset dev inode [path]`
pub fn parse_maps_line(line: &str) -> Result<VmaArea> {
    let mut fields = line.split_ascii_whitespace();

    let range = fields.next().ok_or_else(|| bad_line(line, "range"))?;
    let perms = fields.next().ok_or_else(|| bad_line(line, "perms"))?;
    let _pgoff = fields.next().ok_or_else(|| bad_line(line, "offset"))?;
    let _dev = fields.next().ok_or_else(|| bad_line(line, "dev"))?;
    let ino = fields.next().ok_or_else(|| bad_line(line, "inode"))?;
    let path = fields.next();

    let (start, end) = range.split_once('-').ok_or_else(|| bad_line(line, "range"))?;
    let start = u64::from_str_radix(start, 16).map_err(|_| bad_line(line, "start"))?;
    let end = u64::from_str_radix(end, 16).map_err(|_| bad_line(line, "end"))?;
    let ino: u64 = ino.parse().map_err(|_| bad_line(line, "inode"))?;

    let perms = perms.as_bytes();
    if perms.len() != 4 {
        return Err(bad_line(line, "perms"));
    }
    let prot = parse_prot(perms);
    let shared = perms[3] == b's';

    let kind = match path {
        Some("[vdso]") => VmaKind::Vdso,
        // vvar and vsyscall are not backed by pages of the task
        Some("[vvar]") | Some("[vvar_vclock]") | Some("[vsyscall]") => VmaKind::Other,
        _ if shared => VmaKind::FileShared,
        _ if ino == 0 => VmaKind::AnonPrivate,
        _ => VmaKind::FilePrivate,
    };

    Ok(VmaArea::new(start, end, prot, kind))
}

/// Collects the address space of `pid`.
pub fn parse_pid_maps(pid: libc::pid_t) -> Result<VmAreaList> {
    let path = proc_path(pid, "maps");
    let maps = fs::read_to_string(&path).map_err(|e| {
        MemError::Io(io::Error::new(e.kind(), format!("Can't open {}: {}", path, e)))
    })?;

    let entries = maps
        .lines()
        .filter(|l| !l.is_empty())
        .map(parse_maps_line)
        .collect::<Result<Vec<_>>>()?;

    log::debug!("Parsed {} vmas of {}", entries.len(), pid);
    VmAreaList::new(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_anon() {
        let vma = parse_maps_line("7f1c2a000000-7f1c2a021000 rw-p 00000000 00:00 0 ").unwrap();
        assert_eq!(vma.start, 0x7f1c2a000000);
        assert_eq!(vma.end, 0x7f1c2a021000);
        assert_eq!(vma.prot, (libc::PROT_READ | libc::PROT_WRITE) as u32);
        assert_eq!(vma.kind, VmaKind::AnonPrivate);
    }

    #[test]
    fn test_parse_heap_and_stack() {
        let heap =
            parse_maps_line("55d0c4a3e000-55d0c4a5f000 rw-p 00000000 00:00 0  [heap]").unwrap();
        assert_eq!(heap.kind, VmaKind::AnonPrivate);

        let stack =
            parse_maps_line("7ffd1b7f0000-7ffd1b811000 rw-p 00000000 00:00 0  [stack]").unwrap();
        assert_eq!(stack.kind, VmaKind::AnonPrivate);
    }

    #[test]
    fn test_parse_file_mappings() {
        let text = parse_maps_line(
            "55d0c2a00000-55d0c2a28000 r-xp 00002000 fd:01 1835023   /usr/bin/cat",
        )
        .unwrap();
        assert_eq!(text.kind, VmaKind::FilePrivate);
        assert_eq!(text.prot, (libc::PROT_READ | libc::PROT_EXEC) as u32);

        let shm = parse_maps_line(
            "7f00aa000000-7f00aa001000 rw-s 00000000 00:01 2048  /dev/zero (deleted)",
        )
        .unwrap();
        assert_eq!(shm.kind, VmaKind::FileShared);
    }

    #[test]
    fn test_parse_special() {
        let vdso =
            parse_maps_line("7ffd1b9e4000-7ffd1b9e6000 r-xp 00000000 00:00 0  [vdso]").unwrap();
        assert_eq!(vdso.kind, VmaKind::Vdso);

        let vvar =
            parse_maps_line("7ffd1b9e0000-7ffd1b9e4000 r--p 00000000 00:00 0  [vvar]").unwrap();
        assert_eq!(vvar.kind, VmaKind::Other);

        let guard = parse_maps_line("7f1c29fff000-7f1c2a000000 ---p 00000000 00:00 0").unwrap();
        assert_eq!(guard.prot, 0);
        assert_eq!(guard.kind, VmaKind::AnonPrivate);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_maps_line("").is_err());
        assert!(parse_maps_line("zzzz-1000 rw-p 0 00:00 0").is_err());
        assert!(parse_maps_line("1000-2000 rw 0 00:00 0").is_err());
        assert!(parse_maps_line("1000-2000 rw-p 0 00:00").is_err());
    }

    #[test]
    fn test_parse_self() {
        let vmas = parse_pid_maps(std::process::id() as libc::pid_t).unwrap();
        assert!(!vmas.is_empty());
        assert!(vmas.priv_size > 0);
    }
}
