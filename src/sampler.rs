//! The per-tick sampling pipeline.
//!
//! Every tick runs three phases in order: discover threads that appeared
//! since the last tick and attach counters to them, update every live
//! record (CPU times, then counter values), and optionally fold thread
//! statistics into their owning process when threads are not displayed.
//! Dead records are compacted away afterwards unless sticky mode keeps
//! them around.

use std::fs;
use std::time::Instant;

use libc::pid_t;
use log::debug;

use crate::counter::PerfCounter;
use crate::procfs::{self, StatusError};
use crate::screen::Screen;
use crate::spawn::SpawnedChild;
use crate::task::{TaskRecord, TaskTable};
use crate::{Session, VALUE_SENTINEL};

pub struct Sampler {
    clk_tck: f64,
    /// Most recently created PID on the host, as of the last discovery.
    most_recent_pid: Option<pid_t>,
}

impl Default for Sampler {
    fn default() -> Sampler {
        Sampler::new()
    }
}

/// Whether a process owned by `uid` qualifies for monitoring: a regular
/// user monitors only their own tasks, root monitors everything except
/// root's own (there are too many of those).
pub fn admit_uid(euid: u32, uid: u32) -> bool {
    if euid != 0 {
        uid == euid
    } else {
        uid != 0
    }
}

impl Sampler {
    pub fn new() -> Sampler {
        Sampler {
            clk_tck: procfs::clock_ticks(),
            most_recent_pid: None,
        }
    }

    /// Run discovery plus per-task update. Returns the number of dead
    /// records, which the caller uses to decide on compaction.
    pub fn sample(
        &mut self,
        table: &mut TaskTable,
        screen: &Screen,
        sess: &mut Session,
        mut child: Option<&mut SpawnedChild>,
    ) -> usize {
        self.discover(table, screen, sess);
        self.update(table, sess, &mut child)
    }

    /// Phase A: find threads that appeared since the previous tick.
    ///
    /// The last field of `/proc/loadavg` is the most recently created PID
    /// on the host; when it has not moved there is nothing new and the
    /// full `/proc` scan is skipped.
    pub fn discover(&mut self, table: &mut TaskTable, screen: &Screen, sess: &mut Session) {
        if let Some(recent) = procfs::most_recent_pid() {
            if self.most_recent_pid == Some(recent) {
                return;
            }
            self.most_recent_pid = Some(recent);
        }

        let entries = match fs::read_dir("/proc") {
            Ok(e) => e,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let pid: pid_t = match entry.file_name().to_str().and_then(|s| s.parse().ok()) {
                Some(p) => p,
                None => continue,
            };

            let status = match procfs::read_status(pid) {
                Ok(s) => s,
                Err(StatusError::Unreadable) => continue,
                Err(StatusError::Incomplete) => {
                    sess.errlog.record(format!(
                        "Could not read info for process {} (gone already?)",
                        pid
                    ));
                    continue;
                }
            };

            if let Some(only) = sess.options.only_pid {
                if pid != only {
                    continue;
                }
            }
            let mut cmdline: Option<String> = None;
            if let Some(pat) = &sess.options.only_name {
                let hay = if sess.options.show_cmdline {
                    cmdline.get_or_insert_with(|| procfs::read_cmdline(pid)).as_str()
                } else {
                    status.name.as_str()
                };
                if !hay.contains(pat.as_str()) {
                    continue;
                }
            }
            if !admit_uid(sess.options.euid, status.uid) {
                continue;
            }

            // Died just now? It will be marked dead next tick anyway.
            let task_dir = match fs::read_dir(format!("/proc/{}/task", pid)) {
                Ok(d) => d,
                Err(_) => continue,
            };
            for tentry in task_dir.flatten() {
                let tid: pid_t = match tentry.file_name().to_str().and_then(|s| s.parse().ok()) {
                    Some(t) => t,
                    None => continue,
                };
                if table.get_tid(tid).is_some() {
                    continue;
                }

                let mut rec = TaskRecord::new(tid, pid, screen.counters.len());
                rec.num_threads = status.threads;
                rec.name = status.name.clone();
                rec.username = procfs::username(status.uid);
                rec.cmdline = cmdline
                    .get_or_insert_with(|| procfs::read_cmdline(pid))
                    .clone();

                self.attach_counters(&mut rec, screen, sess);
                debug!("new task {} ({}) of process {}", tid, rec.name, pid);
                table.add(rec);
            }
        }
    }

    fn attach_counters(&self, rec: &mut TaskRecord, screen: &Screen, sess: &mut Session) {
        for (i, c) in screen.counters.iter().enumerate() {
            if sess.budget.exhausted() {
                sess.errlog.record(format!(
                    "Files limit reached for PID {} ({})",
                    rec.tid, rec.name
                ));
                continue;
            }
            match PerfCounter::attach(c.kind, c.config, rec.tid, sess.options.show_kernel) {
                Ok(pc) => {
                    rec.counters[i] = Some(pc);
                    sess.budget.acquired();
                }
                Err(e) => {
                    sess.errlog.record(format!(
                        "Could not attach counter '{}' to PID {} ({}): {}",
                        c.alias, rec.tid, rec.name, e
                    ));
                }
            }
        }
    }

    /// Phase B: refresh CPU accounting and counter values for every
    /// record, marking vanished and zombie tasks dead.
    fn update(
        &mut self,
        table: &mut TaskTable,
        sess: &mut Session,
        child: &mut Option<&mut SpawnedChild>,
    ) -> usize {
        let mut num_dead = 0;

        for id in table.ids() {
            let rec = match table.get_mut(id) {
                Some(r) => r,
                None => continue,
            };
            if rec.dead {
                num_dead += 1;
                continue;
            }

            let st = match procfs::read_task_stat(rec.pid, rec.tid) {
                Ok(st) => st,
                Err(_) => {
                    // The task disappeared between ticks.
                    rec.dead = true;
                    num_dead += 1;
                    rec.release_counters(&mut sess.budget);
                    continue;
                }
            };

            let zombie = st.state == 'Z';
            if !zombie {
                // A zombie's CPU times are no longer meaningful; keep the
                // previous figures rather than deriving garbage.
                let now = Instant::now();
                if let Some(prev_ts) = rec.timestamp {
                    let elapsed = now.duration_since(prev_ts).as_secs_f64() * self.clk_tck;
                    if elapsed > 0.0 {
                        let prev_total = rec.prev_cpu_time_s + rec.prev_cpu_time_u;
                        let curr_total = st.stime + st.utime;
                        rec.cpu_percent =
                            100.0 * curr_total.saturating_sub(prev_total) as f64 / elapsed;
                        rec.cpu_percent_s =
                            100.0 * st.stime.saturating_sub(rec.prev_cpu_time_s) as f64 / elapsed;
                        rec.cpu_percent_u =
                            100.0 * st.utime.saturating_sub(rec.prev_cpu_time_u) as f64 / elapsed;
                    }
                }
                rec.timestamp = Some(now);
                rec.prev_cpu_time_s = st.stime;
                rec.prev_cpu_time_u = st.utime;
            }
            rec.proc_id = st.processor.unwrap_or(-1);

            // Previous values must be saved for every counter before any
            // counter is read, so delta() spans exactly one tick.
            rec.prev_values.copy_from_slice(&rec.values);
            for i in 0..rec.counters.len() {
                rec.values[i] = match rec.counters[i].as_mut() {
                    Some(c) => c.read_value().unwrap_or(0),
                    None => VALUE_SENTINEL,
                };
            }

            if zombie {
                rec.dead = true;
                num_dead += 1;
                let tid = rec.tid;
                rec.release_counters(&mut sess.budget);
                if let Some(c) = child.as_deref_mut() {
                    if c.reap(tid) {
                        sess.options.command_done = true;
                    }
                }
            }
        }

        num_dead
    }
}

/// Phase C: when threads are not displayed, fold each live thread's %CPU
/// and counter values into its owning process. One sentinel value on any
/// thread poisons the owner's value for that counter.
pub fn accumulate_stats(table: &mut TaskTable) {
    let children: Vec<_> = table
        .iter()
        .filter(|(_, r)| r.pid != r.tid && !r.dead)
        .map(|(id, _)| id)
        .collect();

    for id in children {
        let (pid, cpu, values) = {
            let r = table.get(id).unwrap();
            (r.pid, r.cpu_percent, r.values.clone())
        };
        let owner = match table.get_tid_mut(pid) {
            Some(o) => o,
            None => continue,
        };
        owner.cpu_percent += cpu;
        for (i, v) in values.iter().enumerate() {
            if i >= owner.values.len() {
                break;
            }
            if *v == VALUE_SENTINEL {
                owner.values[i] = VALUE_SENTINEL;
                break;
            }
            owner.values[i] = owner.values[i].wrapping_add(*v);
        }
    }
}

/// Zero the accumulated statistics of every main process. Needed when
/// thread display is toggled back on: the owners hold sums, much larger
/// than any per-thread value, and would display as transient garbage.
pub fn reset_values(table: &mut TaskTable) {
    for (_, rec) in table.iter_mut() {
        if rec.dead || rec.tid != rec.pid {
            continue;
        }
        rec.cpu_percent = 0.0;
        for v in rec.values.iter_mut() {
            *v = 0;
        }
    }
}

/// Refresh the name (and optionally command line) of a freshly spawned
/// process: right after the fork they are still the monitor's own, and
/// only settle once the child has exec'd.
pub fn update_name_cmdline(table: &mut TaskTable, pid: pid_t, name_only: bool) {
    let Some(rec) = table.get_tid_mut(pid) else {
        return;
    };
    if let Ok(status) = procfs::read_status(pid) {
        rec.name = status.name;
    }
    if !name_only {
        rec.cmdline = procfs::read_cmdline(pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::FdBudget;
    use crate::errlog::ErrorLog;
    use crate::options::Options;

    fn session() -> Session {
        Session {
            options: Options::default(),
            errlog: ErrorLog::new(),
            budget: FdBudget::new(100),
        }
    }

    fn own_pid() -> pid_t {
        std::process::id() as pid_t
    }

    #[test]
    fn uid_filter_rules() {
        // A regular user sees only their own tasks.
        assert!(admit_uid(1000, 1000));
        assert!(!admit_uid(1000, 1001));
        assert!(!admit_uid(1000, 0));
        // Root sees everything that is not root's.
        assert!(admit_uid(0, 1000));
        assert!(!admit_uid(0, 0));
    }

    #[test]
    fn update_fills_cpu_bookkeeping() {
        let mut sess = session();
        let mut sampler = Sampler::new();
        let mut table = TaskTable::new();
        let pid = own_pid();
        table.add(TaskRecord::new(pid, pid, 0));

        let mut none = None;
        let dead = sampler.update(&mut table, &mut sess, &mut none);
        assert_eq!(dead, 0);
        let rec = table.get_tid(pid).unwrap();
        assert!(rec.timestamp.is_some());
        assert!(!rec.dead);

        // Burn a little CPU, then check the delta-based figures stay sane.
        let mut x = 0_u64;
        for i in 0..2_000_000_u64 {
            x = x.wrapping_add(i ^ x);
        }
        assert!(x != 1);
        let dead = sampler.update(&mut table, &mut sess, &mut none);
        assert_eq!(dead, 0);
        let rec = table.get_tid(pid).unwrap();
        assert!(rec.cpu_percent >= 0.0);
        assert!(rec.cpu_percent_s >= 0.0);
        assert!(rec.cpu_percent_u >= 0.0);
    }

    #[test]
    fn vanished_task_is_marked_dead_and_releases_fds() {
        let mut sess = session();
        let mut sampler = Sampler::new();
        let mut table = TaskTable::new();

        // A tid that cannot exist.
        let mut rec = TaskRecord::new(0x3fff_fff0, 0x3fff_fff0, 2);
        for slot in rec.counters.iter_mut() {
            *slot = Some(PerfCounter::from_file(
                std::fs::File::open("/dev/null").unwrap(),
            ));
            sess.budget.acquired();
        }
        table.add(rec);
        assert_eq!(sess.budget.in_use(), 2);

        let mut none = None;
        let dead = sampler.update(&mut table, &mut sess, &mut none);
        assert_eq!(dead, 1);
        let rec = table.get_tid(0x3fff_fff0).unwrap();
        assert!(rec.dead);
        assert_eq!(rec.live_handles(), 0);
        assert_eq!(sess.budget.in_use(), 0);

        // The handle account matches the table (all released).
        let total: usize = table.iter().map(|(_, r)| r.live_handles()).sum();
        assert_eq!(sess.budget.in_use(), total);

        table.compact(&mut sess.budget);
        assert!(table.is_empty());
    }

    #[test]
    fn invalid_slots_read_as_sentinel() {
        let mut sess = session();
        let mut sampler = Sampler::new();
        let mut table = TaskTable::new();
        let pid = own_pid();
        // Two counter slots, neither attached: both read as the sentinel.
        table.add(TaskRecord::new(pid, pid, 2));
        let mut none = None;
        sampler.update(&mut table, &mut sess, &mut none);
        let rec = table.get_tid(pid).unwrap();
        assert_eq!(rec.values, vec![VALUE_SENTINEL, VALUE_SENTINEL]);
    }

    #[test]
    fn exhausted_budget_refuses_attaches_with_diagnostics() {
        use crate::screen::ScreenSet;

        let mut sess = session();
        sess.budget = FdBudget::new(0);
        let sampler = Sampler::new();

        let mut set = ScreenSet::new();
        let idx = set.new_screen("t", None, false);
        let s = set.get_mut(idx).unwrap();
        s.add_counter_by_value("A", 0, 0, &mut sess.errlog);
        s.add_counter_by_value("B", 1, 0, &mut sess.errlog);
        let screen = set.get(idx).unwrap().clone();

        let mut rec = TaskRecord::new(42, 42, screen.counters.len());
        rec.name = "victim".into();
        sampler.attach_counters(&mut rec, &screen, &mut sess);

        assert_eq!(rec.live_handles(), 0);
        assert_eq!(sess.errlog.count(), 2);
        assert!(sess
            .errlog
            .lines()
            .all(|l| l.contains("Files limit reached for PID 42")));
    }

    #[test]
    fn deltas_span_exactly_one_tick() {
        use std::io::{Seek, SeekFrom, Write};

        // A fake counter whose backing file yields two increasing
        // readings, one per tick.
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&100_u64.to_ne_bytes()).unwrap();
        file.write_all(&250_u64.to_ne_bytes()).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let mut sess = session();
        let mut sampler = Sampler::new();
        let mut table = TaskTable::new();
        let pid = own_pid();
        let mut rec = TaskRecord::new(pid, pid, 1);
        rec.counters[0] = Some(PerfCounter::from_file(file));
        sess.budget.acquired();
        table.add(rec);

        let mut none = None;
        sampler.update(&mut table, &mut sess, &mut none);
        {
            let rec = table.get_tid(pid).unwrap();
            assert_eq!(rec.values[0], 100);
            assert_eq!(rec.prev_values[0], 0);
        }
        sampler.update(&mut table, &mut sess, &mut none);
        let rec = table.get_tid(pid).unwrap();
        assert_eq!(rec.values[0], 250);
        assert_eq!(rec.prev_values[0], 100);
        assert!(rec.values[0] >= rec.prev_values[0]);
    }

    #[test]
    fn accumulation_adds_and_poisons() {
        let mut table = TaskTable::new();
        let mut owner = TaskRecord::new(100, 100, 3);
        owner.values = vec![10, 10, 10];
        owner.cpu_percent = 1.0;
        table.add(owner);

        let mut t1 = TaskRecord::new(101, 100, 3);
        t1.values = vec![1, 2, 3];
        t1.cpu_percent = 2.0;
        table.add(t1);

        let mut t2 = TaskRecord::new(102, 100, 3);
        t2.values = vec![1, VALUE_SENTINEL, 5];
        t2.cpu_percent = 3.0;
        table.add(t2);

        accumulate_stats(&mut table);
        let owner = table.get_tid(100).unwrap();
        assert_eq!(owner.cpu_percent, 6.0);
        assert_eq!(owner.values[0], 12);
        // Poisoned by t2; the remaining counters of t2 are not applied.
        assert_eq!(owner.values[1], VALUE_SENTINEL);
        assert_eq!(owner.values[2], 13);
    }

    #[test]
    fn dead_threads_do_not_accumulate() {
        let mut table = TaskTable::new();
        let mut owner = TaskRecord::new(100, 100, 1);
        owner.values = vec![0];
        table.add(owner);
        let mut t = TaskRecord::new(101, 100, 1);
        t.values = vec![7];
        t.dead = true;
        table.add(t);
        accumulate_stats(&mut table);
        assert_eq!(table.get_tid(100).unwrap().values[0], 0);
    }

    #[test]
    fn reset_values_zeroes_main_processes_only() {
        let mut table = TaskTable::new();
        let mut owner = TaskRecord::new(100, 100, 2);
        owner.values = vec![5, 6];
        owner.cpu_percent = 12.0;
        table.add(owner);
        let mut t = TaskRecord::new(101, 100, 2);
        t.values = vec![7, 8];
        t.cpu_percent = 3.0;
        table.add(t);

        reset_values(&mut table);
        let owner = table.get_tid(100).unwrap();
        assert_eq!(owner.values, vec![0, 0]);
        assert_eq!(owner.cpu_percent, 0.0);
        let t = table.get_tid(101).unwrap();
        assert_eq!(t.values, vec![7, 8]);
        assert_eq!(t.cpu_percent, 3.0);
    }

    #[test]
    fn accumulate_then_reset_round_trips() {
        // Toggling thread display off and on must leave per-task state
        // unchanged once the accumulated values are reset.
        let mut table = TaskTable::new();
        let mut owner = TaskRecord::new(100, 100, 1);
        owner.values = vec![0];
        table.add(owner);
        let mut t = TaskRecord::new(101, 100, 1);
        t.values = vec![4];
        table.add(t);

        accumulate_stats(&mut table);
        assert_eq!(table.get_tid(100).unwrap().values[0], 4);
        reset_values(&mut table);
        assert_eq!(table.get_tid(100).unwrap().values[0], 0);
        assert_eq!(table.get_tid(101).unwrap().values[0], 4);
    }
}
