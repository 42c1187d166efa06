//! The append-only diagnostic sink.
//!
//! Anything that goes wrong during configuration or a tick (a rejected
//! column, a failed attach, a vanished task) lands here as one line and
//! never aborts the tick. Lines are kept in a bounded in-memory ring for
//! later display, and mirrored to stderr or to a user-chosen file once a
//! sink is attached. The total count keeps increasing even after the ring
//! starts dropping old lines, so "N errors" stays truthful.

use std::collections::VecDeque;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// How many lines the ring retains.
const RING_CAP: usize = 1000;

enum Sink {
    /// Ring only; nothing is mirrored.
    None,
    Stderr,
    File(File),
}

pub struct ErrorLog {
    ring: VecDeque<String>,
    total: usize,
    sink: Sink,
}

impl Default for ErrorLog {
    fn default() -> ErrorLog {
        ErrorLog::new()
    }
}

impl ErrorLog {
    /// A ring-only log; used until the output mode is known.
    pub fn new() -> ErrorLog {
        ErrorLog {
            ring: VecDeque::new(),
            total: 0,
            sink: Sink::None,
        }
    }

    /// Attach the mirror sink once options are settled: the given file if
    /// any, else stderr in batch mode, else ring-only. Lines recorded
    /// before the sink existed are flushed to it.
    pub fn attach_sink(&mut self, batch: bool, path: Option<&Path>) {
        self.sink = match path {
            Some(p) => match File::create(p) {
                Ok(f) => Sink::File(f),
                Err(e) => {
                    eprintln!("Could not open file '{}': {}", p.display(), e);
                    if batch {
                        Sink::Stderr
                    } else {
                        Sink::None
                    }
                }
            },
            None if batch => Sink::Stderr,
            None => Sink::None,
        };
        let backlog: Vec<String> = self.ring.iter().cloned().collect();
        for line in backlog {
            self.mirror(&line);
        }
    }

    /// Append one diagnostic line (without trailing newline).
    pub fn record(&mut self, line: impl Into<String>) {
        let line = line.into();
        self.total += 1;
        self.mirror(&line);
        if self.ring.len() == RING_CAP {
            self.ring.pop_front();
        }
        self.ring.push_back(line);
    }

    fn mirror(&mut self, line: &str) {
        match &mut self.sink {
            Sink::None => {}
            Sink::Stderr => eprintln!("{}", line),
            Sink::File(f) => {
                let _ = writeln!(f, "{}", line);
            }
        }
    }

    /// Number of lines ever recorded.
    pub fn count(&self) -> usize {
        self.total
    }

    /// The retained lines, oldest first.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.ring.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_every_append() {
        let mut log = ErrorLog::new();
        assert_eq!(log.count(), 0);
        log.record("one");
        log.record("two".to_string());
        assert_eq!(log.count(), 2);
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[test]
    fn ring_is_bounded_but_count_is_not() {
        let mut log = ErrorLog::new();
        for i in 0..(RING_CAP + 10) {
            log.record(format!("line {}", i));
        }
        assert_eq!(log.count(), RING_CAP + 10);
        assert_eq!(log.lines().count(), RING_CAP);
        assert_eq!(log.lines().next(), Some("line 10"));
    }

    #[test]
    fn file_sink_receives_backlog_and_new_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.log");
        let mut log = ErrorLog::new();
        log.record("early");
        log.attach_sink(true, Some(&path));
        log.record("late");
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "early\nlate\n");
    }
}
