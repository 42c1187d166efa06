//! Owned perf-event file descriptors and the process-wide descriptor budget.
//!
//! Each monitored thread owns up to [`MAX_EVENTS`](crate::MAX_EVENTS)
//! counters. A [`PerfCounter`] is just a wrapper around the event file
//! descriptor returned by `perf_event_open`; dropping it closes the
//! descriptor and frees the kernel resources with it.
//!
//! Descriptors are the scarcest resource here: every (thread × counter)
//! pair costs one, so a busy host with a five-counter screen can exhaust
//! the open-file limit in a single discovery pass. [`FdBudget`] counts
//! descriptors as they are attached and released and refuses new attaches
//! past the ceiling, so the sampler degrades to invalid counter slots
//! instead of failing unrelated `open(2)` calls.

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::FromRawFd;

use libc::pid_t;
use perf_event_open_sys as sys;
use sys::bindings::perf_event_attr;

use crate::procfs;

/// A counting performance counter attached to a single thread.
///
/// The counter is created enabled and pinned, observes one thread on any
/// CPU, and counts kernel activity only when asked to. Reading it returns
/// the accumulated event count as a `u64`.
pub struct PerfCounter {
    file: File,
}

impl PerfCounter {
    /// Attach a counter for the event `(kind, config)` to thread `tid`.
    ///
    /// The attr bits mirror what a per-task monitor needs: `disabled = 0`
    /// so counting starts immediately, `pinned = 1` so a counter that
    /// cannot get a hardware slot reads as failed rather than silently
    /// timesharing, `exclude_hv = 1`, and `exclude_kernel` unless kernel
    /// activity was requested.
    pub fn attach(kind: u32, config: u64, tid: pid_t, show_kernel: bool) -> io::Result<PerfCounter> {
        let mut attrs = perf_event_attr {
            size: std::mem::size_of::<perf_event_attr>() as u32,
            ..perf_event_attr::default()
        };
        attrs.type_ = kind;
        attrs.config = config;
        attrs.set_disabled(0);
        attrs.set_pinned(1);
        attrs.set_exclude_hv(1);
        attrs.set_exclude_kernel(if show_kernel { 0 } else { 1 });

        let fd = check_errno_syscall(|| unsafe {
            sys::perf_event_open(&mut attrs, tid, -1, -1, 0)
        })?;

        // Safe: the kernel just handed us sole ownership of this fd.
        Ok(PerfCounter {
            file: unsafe { File::from_raw_fd(fd) },
        })
    }

    #[cfg(test)]
    pub(crate) fn from_file(file: File) -> PerfCounter {
        PerfCounter { file }
    }

    /// Read the current accumulated count.
    ///
    /// A short read means the kernel has no data for the counter yet; it
    /// is reported as zero, which downstream deltas treat as benign.
    pub fn read_value(&mut self) -> io::Result<u64> {
        let mut buf = [0_u8; 8];
        let n = self.file.read(&mut buf)?;
        if n == buf.len() {
            Ok(u64::from_ne_bytes(buf))
        } else {
            Ok(0)
        }
    }
}

/// Accounting for open counter descriptors across the whole process.
///
/// The ceiling is the soft open-file limit minus a little slack for the
/// descriptors the monitor itself needs (`/proc` reads, the output file).
#[derive(Debug)]
pub struct FdBudget {
    open: usize,
    limit: usize,
}

/// Slack kept below the open-file limit.
const LIMIT_SLACK: usize = 10;

/// Ceiling when the open-file limit cannot be determined.
const DEFAULT_LIMIT: usize = 200;

impl FdBudget {
    pub fn new(limit: usize) -> FdBudget {
        FdBudget { open: 0, limit }
    }

    /// Derive the ceiling from `/proc/self/limits`.
    pub fn from_limits() -> FdBudget {
        let limit = match procfs::max_open_files() {
            Some(n) if n > LIMIT_SLACK => n - LIMIT_SLACK,
            _ => DEFAULT_LIMIT,
        };
        FdBudget::new(limit)
    }

    /// True once no further counters may be attached.
    pub fn exhausted(&self) -> bool {
        self.open >= self.limit
    }

    /// Record one successful attach.
    pub fn acquired(&mut self) {
        self.open += 1;
    }

    /// Record `n` descriptors closed.
    pub fn released(&mut self, n: usize) {
        debug_assert!(n <= self.open, "releasing more descriptors than open");
        self.open = self.open.saturating_sub(n);
    }

    /// Number of counter descriptors currently open.
    pub fn in_use(&self) -> usize {
        self.open
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

fn check_errno_syscall<F, R>(f: F) -> io::Result<R>
where
    F: FnOnce() -> R,
    R: PartialOrd + Default,
{
    let result = f();
    if result < R::default() {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}
