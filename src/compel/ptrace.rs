//! Ptrace wrapper functions

use std::io;
use std::ptr;

use libc::{c_void, pid_t, ptrace};

/// PTRACE_SEIZE request
pub const PTRACE_SEIZE: u32 = 0x4206;

/// PTRACE_INTERRUPT request
pub const PTRACE_INTERRUPT: u32 = 0x4207;

/// PTRACE_DETACH request
pub const PTRACE_DETACH: u32 = 17;

/// PTRACE_O_TRACESYSGOOD option - set bit 7 in signal number on syscall stops
pub const PTRACE_O_TRACESYSGOOD: u32 = 1;

/// PTRACE_EVENT_STOP - group-stop / interrupt event in the status
pub const PTRACE_EVENT_STOP: i32 = 128;

fn ptrace_req(req: u32, pid: pid_t, data: *mut c_void, what: &str) -> io::Result<()> {
    let ret = unsafe { ptrace(req as _, pid, ptr::null_mut::<c_void>(), data) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        return Err(io::Error::new(err.kind(), format!("{} {} failed: {}", what, pid, err)));
    }
    Ok(())
}

/// Attach to `pid` without stopping it.
pub fn ptrace_seize(pid: pid_t) -> io::Result<()> {
    ptrace_req(
        PTRACE_SEIZE,
        pid,
        PTRACE_O_TRACESYSGOOD as usize as *mut c_void,
        "Seizing",
    )
}

/// Stop a seized task and wait until it reports the stop.
pub fn ptrace_interrupt(pid: pid_t) -> io::Result<()> {
    ptrace_req(PTRACE_INTERRUPT, pid, ptr::null_mut(), "Interrupting")?;

    let mut status = 0;
    loop {
        let ret = unsafe { libc::waitpid(pid, &mut status, libc::__WALL) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        break;
    }

    if !libc::WIFSTOPPED(status) {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("Task {} not stopped after interrupt (status {:#x})", pid, status),
        ));
    }

    let event = status >> 16;
    if event == PTRACE_EVENT_STOP {
        log::debug!("Task {} stopped, sig {}", pid, libc::WSTOPSIG(status));
    } else {
        // A pending signal got there before the interrupt; the task is
        // stopped all the same
        log::warn!(
            "Task {} stopped with sig {} event {}",
            pid,
            libc::WSTOPSIG(status),
            event
        );
    }
    Ok(())
}

/// Let the task go.
pub fn ptrace_detach(pid: pid_t) -> io::Result<()> {
    ptrace_req(PTRACE_DETACH, pid, ptr::null_mut(), "Detaching")
}

/// A task seized for the duration of a dump; detached on drop.
#[derive(Debug)]
pub struct SeizedTask {
    pid: pid_t,
}

impl SeizedTask {
    pub fn seize(pid: pid_t) -> io::Result<Self> {
        ptrace_seize(pid)?;
        let task = Self { pid };
        ptrace_interrupt(pid)?;
        log::info!("Seized task {}", pid);
        Ok(task)
    }

    pub fn pid(&self) -> pid_t {
        self.pid
    }
}

impl Drop for SeizedTask {
    fn drop(&mut self) {
        match ptrace_detach(self.pid) {
            Ok(()) => log::debug!("Detached from {}", self.pid),
            Err(e) => log::error!("{}", e),
        }
    }
}
