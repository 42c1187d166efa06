//! Readers for the handful of `/proc` files the monitor depends on.
//!
//! Everything here is a thin parse over a pseudo-file; failures are
//! reported to the caller, which decides whether a missing file means "the
//! task just died" (normal) or "this kernel cannot run us" (fatal).

use std::ffi::CStr;
use std::fs;
use std::io;

use libc::pid_t;

/// Basic information from `/proc/<pid>/status`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub name: String,
    pub uid: u32,
    pub threads: u32,
}

/// Why `/proc/<pid>/status` could not be turned into a [`Status`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusError {
    /// The file could not be opened; the process is gone or inaccessible.
    Unreadable,
    /// The file opened but lacked one of the required fields, which
    /// usually means the process vanished mid-read.
    Incomplete,
}

/// Fields 3, 14, 15 and 39 of `/proc/<pid>/task/<tid>/stat`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TaskStat {
    pub state: char,
    /// User CPU time, in clock ticks.
    pub utime: u64,
    /// System CPU time, in clock ticks.
    pub stime: u64,
    /// Processor last run on; `None` when the field could not be parsed.
    pub processor: Option<i32>,
}

/// The PID of the most recently created process on the host, from the
/// last field of `/proc/loadavg`. Comparing it across ticks is a cheap
/// way to skip the full `/proc` scan when the task set is stable.
pub fn most_recent_pid() -> Option<pid_t> {
    let text = fs::read_to_string("/proc/loadavg").ok()?;
    text.split_whitespace().last()?.parse().ok()
}

/// The three load averages from `/proc/loadavg`.
pub fn loadavg() -> Option<(f64, f64, f64)> {
    let text = fs::read_to_string("/proc/loadavg").ok()?;
    let mut it = text.split_whitespace();
    let a = it.next()?.parse().ok()?;
    let b = it.next()?.parse().ok()?;
    let c = it.next()?.parse().ok()?;
    Some((a, b, c))
}

/// Host uptime in seconds, from `/proc/uptime`.
pub fn uptime() -> Option<f64> {
    let text = fs::read_to_string("/proc/uptime").ok()?;
    text.split_whitespace().next()?.parse().ok()
}

/// Read `Name`, `Uid` and `Threads` from `/proc/<pid>/status`.
pub fn read_status(pid: pid_t) -> Result<Status, StatusError> {
    let text = fs::read_to_string(format!("/proc/{}/status", pid))
        .map_err(|_| StatusError::Unreadable)?;

    let mut name = None;
    let mut uid = None;
    let mut threads = None;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("Name:") {
            name = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("Uid:") {
            uid = rest.split_whitespace().next().and_then(|t| t.parse().ok());
        } else if let Some(rest) = line.strip_prefix("Threads:") {
            threads = rest.split_whitespace().next().and_then(|t| t.parse().ok());
        }
        if name.is_some() && uid.is_some() && threads.is_some() {
            break;
        }
    }
    match (name, uid, threads) {
        (Some(name), Some(uid), Some(threads)) => Ok(Status { name, uid, threads }),
        _ => Err(StatusError::Incomplete),
    }
}

/// The command line of a process, arguments separated by spaces.
///
/// In `/proc/<pid>/cmdline` arguments are NUL-separated and the whole
/// thing ends at a double NUL; kernel threads and zombies have none, and
/// render as `[null]`.
pub fn read_cmdline(pid: pid_t) -> String {
    match fs::read(format!("/proc/{}/cmdline", pid)) {
        Ok(bytes) if !bytes.is_empty() && bytes[0] != 0 => {
            let end = bytes
                .windows(2)
                .position(|w| w == [0, 0])
                .map(|i| i + 1)
                .unwrap_or(bytes.len());
            let mut s: String = bytes[..end]
                .iter()
                .map(|b| if *b == 0 { ' ' } else { *b as char })
                .collect();
            while s.ends_with(' ') {
                s.pop();
            }
            s
        }
        _ => "[null]".to_string(),
    }
}

/// Read and parse `/proc/<pid>/task/<tid>/stat`. An I/O error means the
/// task is gone.
pub fn read_task_stat(pid: pid_t, tid: pid_t) -> io::Result<TaskStat> {
    let text = fs::read_to_string(format!("/proc/{}/task/{}/stat", pid, tid))?;
    parse_stat_line(&text)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed stat line"))
}

/// Parse one stat line. The command name (field 2) is parenthesised and
/// may itself contain spaces or parentheses, so fields are counted from
/// the *last* closing parenthesis.
pub fn parse_stat_line(line: &str) -> Option<TaskStat> {
    let after = &line[line.rfind(')')? + 1..];
    let fields: Vec<&str> = after.split_whitespace().collect();
    // fields[0] is stat field 3 (state).
    let state = fields.first()?.chars().next()?;
    let utime = fields.get(11).and_then(|t| t.parse().ok()).unwrap_or(0);
    let stime = fields.get(12).and_then(|t| t.parse().ok()).unwrap_or(0);
    let processor = fields.get(36).and_then(|t| t.parse().ok());
    Some(TaskStat {
        state,
        utime,
        stime,
        processor,
    })
}

/// The soft "Max open files" limit from `/proc/self/limits`.
pub fn max_open_files() -> Option<usize> {
    let text = fs::read_to_string("/proc/self/limits").ok()?;
    for line in text.lines() {
        if line.starts_with("Max open files") {
            return line.split_whitespace().nth(3).and_then(|t| t.parse().ok());
        }
    }
    None
}

/// The kernel's perf-event paranoia level, trying the pre-2.6.32 file
/// name first. `None` when neither file exists, i.e. the kernel has no
/// performance-event support at all.
pub fn paranoid_level() -> Option<i32> {
    for path in [
        "/proc/sys/kernel/perf_counter_paranoid",
        "/proc/sys/kernel/perf_event_paranoid",
    ] {
        if let Ok(text) = fs::read_to_string(path) {
            return text.trim().parse().ok();
        }
    }
    None
}

/// Clock ticks per second, for scaling `utime`/`stime`.
pub fn clock_ticks() -> f64 {
    let t = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if t > 0 {
        t as f64
    } else {
        100.0
    }
}

/// Resolve a user id to a name via the passwd database.
pub fn username(uid: u32) -> Option<String> {
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = [0_i8; 1024];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe {
        libc::getpwuid_r(
            uid,
            &mut pwd,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return None;
    }
    let name = unsafe { CStr::from_ptr(pwd.pw_name) };
    name.to_str().ok().map(str::to_string)
}

/// Resolve a user name to a uid via the passwd database.
pub fn uid_for_name(name: &str) -> Option<u32> {
    let cname = std::ffi::CString::new(name).ok()?;
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = [0_i8; 1024];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe {
        libc::getpwnam_r(
            cname.as_ptr(),
            &mut pwd,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return None;
    }
    Some(pwd.pw_uid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_stat_line() {
        // Abbreviated but positionally faithful: 52 fields, utime=777,
        // stime=88, processor=3.
        let line = "1234 (cat) R 1 1234 1234 0 -1 4194304 95 0 0 0 \
                    777 88 0 0 20 0 1 0 12345 1000000 100 18446744073709551615 \
                    1 1 0 0 0 0 0 0 0 0 0 0 17 3 0 0 0 0 0 0 0 0 0 0 0 0 0";
        let st = parse_stat_line(line).unwrap();
        assert_eq!(st.state, 'R');
        assert_eq!(st.utime, 777);
        assert_eq!(st.stime, 88);
        assert_eq!(st.processor, Some(3));
    }

    #[test]
    fn stat_name_may_contain_parens_and_spaces() {
        let line = "42 (weird) name)) Z 1 42 42 0 -1 4194304 0 0 0 0 \
                    5 6 0 0 20 0 1 0 1 0 0 18446744073709551615 \
                    0 0 0 0 0 0 0 0 0 0 0 0 17 1 0 0 0 0 0 0 0 0 0 0 0 0 0";
        let st = parse_stat_line(line).unwrap();
        assert_eq!(st.state, 'Z');
        assert_eq!(st.utime, 5);
        assert_eq!(st.stime, 6);
        assert_eq!(st.processor, Some(1));
    }

    #[test]
    fn short_stat_line_has_no_processor() {
        let st = parse_stat_line("9 (x) S 1 9 9 0 -1 0 0 0 0 0 1 2").unwrap();
        assert_eq!(st.state, 'S');
        assert_eq!(st.utime, 1);
        assert_eq!(st.stime, 2);
        assert_eq!(st.processor, None);
    }

    #[test]
    fn reads_own_status() {
        let st = read_status(std::process::id() as pid_t).unwrap();
        assert!(!st.name.is_empty());
        assert!(st.threads >= 1);
    }

    #[test]
    fn reads_own_stat() {
        let pid = std::process::id() as pid_t;
        let st = read_task_stat(pid, pid).unwrap();
        assert!(st.state.is_ascii_alphabetic());
    }

    #[test]
    fn missing_task_is_unreadable() {
        assert_eq!(read_status(-1), Err(StatusError::Unreadable));
        assert!(read_task_stat(-1, -1).is_err());
    }

    #[test]
    fn own_cmdline_is_not_null() {
        let cmd = read_cmdline(std::process::id() as pid_t);
        assert_ne!(cmd, "[null]");
        assert!(!cmd.ends_with(' '));
    }

    #[test]
    fn loadavg_and_uptime_parse() {
        assert!(most_recent_pid().is_some());
        assert!(loadavg().is_some());
        assert!(uptime().unwrap() > 0.0);
        assert!(max_open_files().is_some());
    }
}
