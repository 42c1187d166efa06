//! Spawning a command under the monitor (`perftop -- cmd args`).
//!
//! The point of spawning ourselves is attaching counters *before* the
//! command starts executing. The child is forked immediately but blocks
//! on a pipe before `exec`; one discovery pass then finds it and attaches
//! counters, and [`SpawnedChild::start`] releases it. A SIGCHLD handler
//! interrupts the inter-tick wait so the exit shows up promptly.

use std::fs::File;
use std::io::{self, Write};
use std::os::unix::io::FromRawFd;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};

use libc::pid_t;

/// A command forked by the monitor, gated before `exec`.
pub struct SpawnedChild {
    child: Child,
    gate: Option<File>,
}

/// Fork `argv`, leaving the child blocked until [`SpawnedChild::start`].
pub fn spawn(argv: &[String]) -> io::Result<SpawnedChild> {
    let mut fds = [0_i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    unsafe {
        cmd.pre_exec(move || {
            // If the monitor is set-uid root, the command must not be.
            if libc::geteuid() == 0 && libc::getuid() != 0 {
                if libc::setuid(libc::getuid()) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            // Our copy of the parent's end is useless.
            libc::close(write_fd);
            // Block until the parent has attached our counters.
            let mut byte = 0_u8;
            let n = libc::read(read_fd, &mut byte as *mut u8 as *mut libc::c_void, 1);
            libc::close(read_fd);
            if n != 1 {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "spawn gate closed early",
                ));
            }
            Ok(())
        });
    }

    let child = cmd.spawn();
    unsafe {
        libc::close(read_fd);
    }
    let child = match child {
        Ok(c) => c,
        Err(e) => {
            unsafe {
                libc::close(write_fd);
            }
            return Err(e);
        }
    };

    Ok(SpawnedChild {
        child,
        gate: Some(unsafe { File::from_raw_fd(write_fd) }),
    })
}

impl SpawnedChild {
    pub fn pid(&self) -> pid_t {
        self.child.id() as pid_t
    }

    /// Release the child to `exec`. Idempotent.
    pub fn start(&mut self) -> io::Result<()> {
        if let Some(mut gate) = self.gate.take() {
            gate.write_all(b"!")?;
        }
        Ok(())
    }

    /// If `tid` is our child, collect its exit status and report true.
    pub fn reap(&mut self, tid: pid_t) -> bool {
        if tid != self.pid() {
            return false;
        }
        let _ = self.child.wait();
        true
    }
}

/// Install a do-nothing SIGCHLD handler. Its only purpose is delivery:
/// the signal interrupts the `select` sleep in the main loop and forces
/// an immediate refresh.
pub fn install_sigchld_handler() {
    extern "C" fn noop(_sig: libc::c_int) {}

    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        let handler: extern "C" fn(libc::c_int) = noop;
        action.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;
        libc::sigaction(libc::SIGCHLD, &action, std::ptr::null_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gated_child_runs_only_after_start() {
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), "exit 0".to_string()];
        let mut child = spawn(&argv).unwrap();
        let pid = child.pid();
        assert!(pid > 0);

        // Still gated: the process exists, blocked before exec.
        let stat = crate::procfs::read_task_stat(pid, pid);
        assert!(stat.is_ok());

        child.start().unwrap();
        child.start().unwrap(); // idempotent
        assert!(child.reap(pid));
        assert!(!child.reap(pid + 1));
    }
}
