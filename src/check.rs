//! Startup requisite check.
//!
//! Before anything else, attach a canary cycle counter to ourselves. If
//! that fails the host cannot run us at all, and we exit with a message
//! that tries to say why: not Linux, a kernel from before the
//! performance-events interface, or a paranoia setting that locks
//! unprivileged users out.

use anyhow::{anyhow, Result};
use perf_event_open_sys::bindings;

use crate::counter::PerfCounter;
use crate::procfs;

/// Lowest kernel release with the performance-events interface.
const MIN_KERNEL: &str = "2.6.31";

pub fn check() -> Result<()> {
    let paranoia = match procfs::paranoid_level() {
        Some(level) => level,
        None => {
            return Err(anyhow!(
                "System does not support performance events.\n\
                 File '/proc/sys/kernel/perf_*_paranoid' is missing."
            ));
        }
    };

    // Try the basic event: cycles, on ourselves.
    let canary = PerfCounter::attach(
        bindings::PERF_TYPE_HARDWARE,
        bindings::PERF_COUNT_HW_CPU_CYCLES as u64,
        0,
        false,
    );
    match canary {
        Ok(_) => Ok(()),
        Err(err) => {
            let (sysname, release) = uname_strings();
            let why = if sysname != "Linux" {
                format!("Is this OS a Linux? (OS identifies itself as '{}')", sysname)
            } else if release.as_str() < MIN_KERNEL {
                format!(
                    "Linux {}+ is required, OS reports '{}'.",
                    MIN_KERNEL, release
                )
            } else if paranoia >= 3 {
                format!(
                    "Your kernel is set with an event paranoia value of {}.\n\
                     Either run this program as root, or set a lower value at\n\
                     '/proc/sys/kernel/perf_event_paranoid'.",
                    paranoia
                )
            } else {
                "Don't know why...".to_string()
            };
            Err(anyhow!("Could not attach a basic cycle counter: {}\n{}", err, why))
        }
    }
}

fn uname_strings() -> (String, String) {
    let mut info: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut info) } != 0 {
        return (String::new(), String::new());
    }
    (cstr_field(&info.sysname), cstr_field(&info.release))
}

fn cstr_field(field: &[libc::c_char]) -> String {
    let bytes: Vec<u8> = field
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}
