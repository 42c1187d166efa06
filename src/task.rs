//! Task records and the table that owns them.
//!
//! A *task* is a single kernel schedulable entity, identified by its thread
//! id; a process is the task whose thread id equals its process id. The
//! table keeps one record per observed task in a slotted arena indexed by a
//! stable [`TaskId`], plus a thread-id map for O(1) lookup during
//! discovery, plus a display-order vector that the sorter rearranges in
//! place. Records never move once inserted, so handles stay valid until
//! the record is removed.

use std::collections::HashMap;
use std::time::Instant;

use libc::pid_t;

use crate::counter::{FdBudget, PerfCounter};

/// Stable handle to a record in the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(usize);

/// The key the active column contributes to the sort.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SortKey {
    /// A computed column value.
    Double(f64),
    /// The thread id.
    Int(i64),
    /// Compare by process name or command line.
    Str,
}

/// Everything known about one monitored thread.
pub struct TaskRecord {
    pub tid: pid_t,
    /// Owning process; equals `tid` for the main thread.
    pub pid: pid_t,
    /// Processor the task was last seen on, -1 when unknown.
    pub proc_id: i32,
    /// Thread count of the owning process at discovery time.
    pub num_threads: u32,

    /// One slot per screen counter; `None` is the invalid sentinel left by
    /// a failed or budget-refused attach.
    pub counters: Vec<Option<PerfCounter>>,
    /// Counter readings from the current tick.
    pub values: Vec<u64>,
    /// Counter readings from the previous tick; `delta()` is the
    /// difference between the two.
    pub prev_values: Vec<u64>,

    /// When the CPU times below were captured; `None` before the first
    /// update.
    pub timestamp: Option<Instant>,
    /// User CPU time at the previous update, in clock ticks.
    pub prev_cpu_time_u: u64,
    /// System CPU time at the previous update, in clock ticks.
    pub prev_cpu_time_s: u64,
    pub cpu_percent: f64,
    pub cpu_percent_s: f64,
    pub cpu_percent_u: f64,

    pub username: Option<String>,
    pub name: String,
    pub cmdline: String,

    /// The task vanished from `/proc`; kept for one more tick (or until
    /// quit, in sticky mode) so it can be displayed once as DEAD.
    pub dead: bool,
    /// Not to be displayed this tick; recomputed by the row builder.
    pub skip: bool,

    pub sort_key: SortKey,
    /// Pre-rendered display row.
    pub row: String,

    /// Insertion recency, newest largest. Compaction rebuilds the display
    /// order newest-first from this.
    seq: u64,
}

impl TaskRecord {
    pub fn new(tid: pid_t, pid: pid_t, num_events: usize) -> TaskRecord {
        TaskRecord {
            tid,
            pid,
            proc_id: -1,
            num_threads: 1,
            counters: (0..num_events).map(|_| None).collect(),
            values: vec![0; num_events],
            prev_values: vec![0; num_events],
            timestamp: None,
            prev_cpu_time_u: 0,
            prev_cpu_time_s: 0,
            cpu_percent: 0.0,
            cpu_percent_s: 0.0,
            cpu_percent_u: 0.0,
            username: None,
            name: String::new(),
            cmdline: String::new(),
            dead: false,
            skip: false,
            sort_key: SortKey::Double(0.0),
            row: String::new(),
            seq: 0,
        }
    }

    pub fn num_events(&self) -> usize {
        self.counters.len()
    }

    /// Number of counter slots holding a live descriptor.
    pub fn live_handles(&self) -> usize {
        self.counters.iter().filter(|c| c.is_some()).count()
    }

    /// Close every open counter and settle the budget. Idempotent: slots
    /// are emptied as they are closed, so a second call releases nothing.
    pub fn release_counters(&mut self, budget: &mut FdBudget) {
        let mut closed = 0;
        for slot in &mut self.counters {
            if slot.take().is_some() {
                closed += 1;
            }
        }
        budget.released(closed);
    }
}

/// The collection of all observed tasks.
#[derive(Default)]
pub struct TaskTable {
    slots: Vec<Option<TaskRecord>>,
    free: Vec<usize>,
    by_tid: HashMap<pid_t, TaskId>,
    order: Vec<TaskId>,
    next_seq: u64,
}

impl TaskTable {
    pub fn new() -> TaskTable {
        TaskTable::default()
    }

    /// Number of records, dead ones included until compaction.
    pub fn len(&self) -> usize {
        self.by_tid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tid.is_empty()
    }

    /// Insert a record. If the thread id is already present this is a
    /// no-op and the first record wins.
    pub fn add(&mut self, rec: TaskRecord) -> Option<TaskId> {
        if self.by_tid.contains_key(&rec.tid) {
            return None;
        }
        let mut rec = rec;
        rec.seq = self.next_seq;
        self.next_seq += 1;

        let tid = rec.tid;
        let id = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(rec);
                TaskId(slot)
            }
            None => {
                self.slots.push(Some(rec));
                TaskId(self.slots.len() - 1)
            }
        };
        self.by_tid.insert(tid, id);
        self.order.push(id);
        Some(id)
    }

    /// Remove the record for `tid`. Removing an absent tid is a logic
    /// error.
    pub fn del(&mut self, tid: pid_t) -> Option<TaskRecord> {
        let id = self.by_tid.remove(&tid);
        debug_assert!(id.is_some(), "deleting unknown tid {}", tid);
        let id = id?;
        let rec = self.slots[id.0].take();
        self.free.push(id.0);
        self.order.retain(|o| *o != id);
        rec
    }

    pub fn get(&self, id: TaskId) -> Option<&TaskRecord> {
        self.slots.get(id.0).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut TaskRecord> {
        self.slots.get_mut(id.0).and_then(|s| s.as_mut())
    }

    pub fn id_for_tid(&self, tid: pid_t) -> Option<TaskId> {
        self.by_tid.get(&tid).copied()
    }

    pub fn get_tid(&self, tid: pid_t) -> Option<&TaskRecord> {
        self.id_for_tid(tid).and_then(|id| self.get(id))
    }

    pub fn get_tid_mut(&mut self, tid: pid_t) -> Option<&mut TaskRecord> {
        let id = self.id_for_tid(tid)?;
        self.get_mut(id)
    }

    /// Handles of all records, in slot order.
    pub fn ids(&self) -> Vec<TaskId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| TaskId(i))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TaskId, &TaskRecord)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|r| (TaskId(i), r)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (TaskId, &mut TaskRecord)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|r| (TaskId(i), r)))
    }

    /// The display order fed to the renderer; rearranged by the sorter,
    /// rebuilt by compaction.
    pub fn order(&self) -> &[TaskId] {
        &self.order
    }

    /// Stable-sort the display order with a record comparator. Ties keep
    /// their current relative order.
    pub fn sort_order_by<F>(&mut self, mut cmp: F)
    where
        F: FnMut(&TaskRecord, &TaskRecord) -> std::cmp::Ordering,
    {
        let mut order = std::mem::take(&mut self.order);
        order.sort_by(|a, b| {
            match (self.slots[a.0].as_ref(), self.slots[b.0].as_ref()) {
                (Some(ra), Some(rb)) => cmp(ra, rb),
                _ => std::cmp::Ordering::Equal,
            }
        });
        self.order = order;
    }

    /// Remove every dead record, closing any counters it still holds, and
    /// rebuild the display order newest-first from the survivors.
    pub fn compact(&mut self, budget: &mut FdBudget) {
        let dead: Vec<pid_t> = self
            .iter()
            .filter(|(_, r)| r.dead)
            .map(|(_, r)| r.tid)
            .collect();
        for tid in dead {
            if let Some(mut rec) = self.del(tid) {
                rec.release_counters(budget);
            }
        }

        let mut live: Vec<TaskId> = self.ids();
        live.sort_by(|a, b| {
            let sa = self.slots[a.0].as_ref().map(|r| r.seq).unwrap_or(0);
            let sb = self.slots[b.0].as_ref().map(|r| r.seq).unwrap_or(0);
            sb.cmp(&sa)
        });
        self.order = live;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tid: pid_t, pid: pid_t) -> TaskRecord {
        TaskRecord::new(tid, pid, 2)
    }

    #[test]
    fn first_insert_wins() {
        let mut t = TaskTable::new();
        let id = t.add(record(10, 10)).unwrap();
        t.get_mut(id).unwrap().name = "first".into();
        assert!(t.add(record(10, 10)).is_none());
        assert_eq!(t.len(), 1);
        assert_eq!(t.get_tid(10).unwrap().name, "first");
    }

    #[test]
    fn del_returns_the_record() {
        let mut t = TaskTable::new();
        t.add(record(1, 1));
        t.add(record(2, 1));
        let rec = t.del(1).unwrap();
        assert_eq!(rec.tid, 1);
        assert_eq!(t.len(), 1);
        assert!(t.get_tid(1).is_none());
        assert!(!t.order().iter().any(|id| t.get(*id).unwrap().tid == 1));
    }

    #[test]
    fn handles_stay_valid_across_growth() {
        let mut t = TaskTable::new();
        let first = t.add(record(1, 1)).unwrap();
        for tid in 2..100 {
            t.add(record(tid, 1));
        }
        assert_eq!(t.get(first).unwrap().tid, 1);
    }

    #[test]
    fn map_and_slots_agree_after_compact() {
        let mut budget = FdBudget::new(100);
        let mut t = TaskTable::new();
        for tid in 1..=8 {
            t.add(record(tid, 1));
        }
        for tid in [2, 5, 8] {
            t.get_tid_mut(tid).unwrap().dead = true;
        }
        t.compact(&mut budget);

        assert_eq!(t.len(), 5);
        let from_slots: Vec<pid_t> = t.iter().map(|(_, r)| r.tid).collect();
        for tid in &from_slots {
            let rec = t.get_tid(*tid).expect("map entry for live record");
            assert_eq!(rec.tid, *tid);
            assert!(!rec.dead);
        }
        assert_eq!(from_slots.len(), t.order().len());
    }

    #[test]
    fn compact_orders_newest_first() {
        let mut budget = FdBudget::new(100);
        let mut t = TaskTable::new();
        for tid in 1..=4 {
            t.add(record(tid, 1));
        }
        t.get_tid_mut(2).unwrap().dead = true;
        t.compact(&mut budget);
        let tids: Vec<pid_t> = t
            .order()
            .iter()
            .map(|id| t.get(*id).unwrap().tid)
            .collect();
        assert_eq!(tids, vec![4, 3, 1]);
    }

    #[test]
    fn release_counters_settles_the_budget_once() {
        let mut budget = FdBudget::new(100);
        let mut rec = record(1, 1);
        for slot in rec.counters.iter_mut() {
            let file = std::fs::File::open("/dev/null").unwrap();
            *slot = Some(PerfCounter::from_file(file));
            budget.acquired();
        }
        assert_eq!(budget.in_use(), 2);
        assert_eq!(rec.live_handles(), 2);
        rec.release_counters(&mut budget);
        assert_eq!(budget.in_use(), 0);
        assert_eq!(rec.live_handles(), 0);
        rec.release_counters(&mut budget);
        assert_eq!(budget.in_use(), 0);
    }

    #[test]
    fn stable_sort_preserves_tie_order() {
        let mut t = TaskTable::new();
        for tid in [3, 1, 2] {
            t.add(record(tid, 1));
        }
        // All keys equal: order must be untouched.
        t.sort_order_by(|_, _| std::cmp::Ordering::Equal);
        let tids: Vec<pid_t> = t
            .order()
            .iter()
            .map(|id| t.get(*id).unwrap().tid)
            .collect();
        assert_eq!(tids, vec![3, 1, 2]);
    }
}
