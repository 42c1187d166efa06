//! Screens: named sets of counters and derived display columns.
//!
//! A screen declares which kernel events to attach to every task (the
//! *counters*, each with a short alias) and which *columns* to display,
//! each column being a formatted expression over those aliases. Users
//! define screens in the configuration file; two target-independent
//! screens are built in.

use perf_event_open_sys::bindings;

use crate::errlog::ErrorLog;
use crate::expr::{self, Expr};
use crate::options::Options;
use crate::MAX_EVENTS;

/// One kernel event a screen attaches to every task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CounterDef {
    /// Name the columns refer to this counter by; unique within a screen.
    pub alias: String,
    /// Kernel event class (`PERF_TYPE_*`).
    pub kind: u32,
    /// Kernel event code within the class.
    pub config: u64,
    /// How many column expressions mention this alias. Counters left at
    /// zero after every column is registered are pruned.
    pub used: u32,
}

/// One displayed column.
#[derive(Clone, Debug)]
pub struct Column {
    /// Header text; its length fixes the column width.
    pub header: String,
    /// printf-style format producing a single floating-point field.
    pub format: String,
    /// Free text for help output.
    pub description: String,
    pub expr: Expr,
    /// Filler shown when the expression divides by zero, sized to the
    /// header and ending in `-`.
    pub empty_field: String,
    /// Filler shown when the expression cannot be computed, sized to the
    /// header and ending in `?`.
    pub error_field: String,
}

/// A named set of counters and columns.
#[derive(Clone, Debug, Default)]
pub struct Screen {
    pub name: String,
    pub desc: String,
    pub counters: Vec<CounterDef>,
    pub columns: Vec<Column>,
}

impl Screen {
    fn new(name: &str, desc: Option<&str>) -> Screen {
        let desc = match desc {
            Some(d) if !d.is_empty() => d.to_string(),
            _ => "(no desc)".to_string(),
        };
        Screen {
            name: name.to_string(),
            desc,
            counters: Vec::new(),
            columns: Vec::new(),
        }
    }

    /// Register a counter with textual `config` and `kind` attributes, as
    /// they appear in the configuration file. Returns the counter index,
    /// or `None` when the counter was rejected (with a diagnostic).
    pub fn add_counter(
        &mut self,
        alias: &str,
        config: &str,
        kind: Option<&str>,
        errlog: &mut ErrorLog,
    ) -> Option<usize> {
        if self.counters.len() >= MAX_EVENTS {
            errlog.record(format!(
                "Too many counters (max {}) in screen '{}', ignoring '{}'",
                MAX_EVENTS, self.name, alias
            ));
            return None;
        }
        let kind = match resolve_counter_kind(kind) {
            Some(k) => k,
            None => {
                errlog.record(format!(
                    "Bad type '{}': ignoring counter '{}'",
                    kind.unwrap_or(""),
                    alias
                ));
                return None;
            }
        };
        let config_val = match resolve_counter_config(config) {
            Some(v) => v,
            None => {
                errlog.record(format!(
                    "Bad config '{}': ignoring counter '{}'",
                    config, alias
                ));
                return None;
            }
        };
        self.push_counter(alias, config_val, kind)
    }

    /// Register a counter with already-resolved numeric attributes, used
    /// by the built-in screens.
    pub fn add_counter_by_value(
        &mut self,
        alias: &str,
        config: u64,
        kind: u32,
        errlog: &mut ErrorLog,
    ) -> Option<usize> {
        if self.counters.len() >= MAX_EVENTS {
            errlog.record(format!(
                "Too many counters (max {}) in screen '{}', ignoring '{}'",
                MAX_EVENTS, self.name, alias
            ));
            return None;
        }
        self.push_counter(alias, config, kind)
    }

    fn push_counter(&mut self, alias: &str, config: u64, kind: u32) -> Option<usize> {
        self.counters.push(CounterDef {
            alias: alias.to_string(),
            kind,
            config,
            used: 0,
        });
        Some(self.counters.len() - 1)
    }

    /// Register a column. The expression is parsed and statically checked
    /// against this screen's counters; on any failure the column is
    /// dropped, a diagnostic is emitted, and no use counts change.
    pub fn add_column(
        &mut self,
        header: &str,
        format: &str,
        desc: Option<&str>,
        expr_text: &str,
        errlog: &mut ErrorLog,
    ) -> Option<usize> {
        let e = match expr::parse(expr_text) {
            Ok(e) => e,
            Err(_) => {
                errlog.record(format!(
                    "Invalid expression in column '{}', screen '{}': column ignored",
                    header, self.name
                ));
                return None;
            }
        };

        if !self.check_counters_used(&e, header, errlog) {
            return None;
        }

        let width = header.len();
        let mut empty_field = " ".repeat(width.saturating_sub(1));
        empty_field.push('-');
        let mut error_field = " ".repeat(width.saturating_sub(1));
        error_field.push('?');

        self.columns.push(Column {
            header: header.to_string(),
            format: format.to_string(),
            description: desc.unwrap_or("(unknown)").to_string(),
            expr: e,
            empty_field,
            error_field,
        });
        Some(self.columns.len() - 1)
    }

    /// Resolve every alias the expression mentions and bump the use count
    /// of the matching counters. When any alias is undeclared nothing is
    /// bumped and the column is rejected.
    fn check_counters_used(&mut self, e: &Expr, header: &str, errlog: &mut ErrorLog) -> bool {
        let mut aliases = Vec::new();
        collect_aliases(e, &mut aliases);

        let mut indices = Vec::with_capacity(aliases.len());
        for alias in &aliases {
            match self.counters.iter().position(|c| c.alias == **alias) {
                Some(i) => indices.push(i),
                None => {
                    errlog.record(format!(
                        "Undeclared counter '{}' in column '{}', screen '{}': column ignored",
                        alias, header, self.name
                    ));
                    return false;
                }
            }
        }
        for i in indices {
            self.counters[i].used += 1;
        }
        true
    }
}

/// Aliases that resolve to the task itself instead of a counter.
pub const RESERVED_ALIASES: [&str; 4] = ["CPU_TOT", "CPU_SYS", "CPU_USER", "PROC_ID"];

fn collect_aliases<'e>(e: &'e Expr, out: &mut Vec<&'e String>) {
    match e {
        Expr::Count { alias, .. } => {
            if !RESERVED_ALIASES.contains(&alias.as_str()) {
                out.push(alias);
            }
        }
        Expr::Const(_) => {}
        Expr::Binary { lhs, rhs, .. } => {
            collect_aliases(lhs, out);
            collect_aliases(rhs, out);
        }
    }
}

/// The ordered, process-wide collection of screens.
#[derive(Default)]
pub struct ScreenSet {
    screens: Vec<Screen>,
}

impl ScreenSet {
    pub fn new() -> ScreenSet {
        ScreenSet::default()
    }

    /// Create a screen and return its index. Built-in screens prepend so
    /// that the numeric ids of user-defined screens stay stable relative
    /// to them.
    pub fn new_screen(&mut self, name: &str, desc: Option<&str>, prepend: bool) -> usize {
        let s = Screen::new(name, desc);
        if prepend {
            self.screens.insert(0, s);
            0
        } else {
            self.screens.push(s);
            self.screens.len() - 1
        }
    }

    pub fn len(&self) -> usize {
        self.screens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.screens.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Screen> {
        self.screens.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Screen> {
        self.screens.get_mut(index)
    }

    /// First screen whose name contains `name`.
    pub fn get_by_name(&self, name: &str) -> Option<(usize, &Screen)> {
        self.screens
            .iter()
            .enumerate()
            .find(|(_, s)| s.name.contains(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Screen> {
        self.screens.iter()
    }

    /// Drop every counter no column refers to, logging each removal. Runs
    /// once all screens and overrides are in, and before any task is
    /// created, so per-task descriptor counts stay minimal.
    pub fn tamp_counters(&mut self, errlog: &mut ErrorLog) {
        for s in &mut self.screens {
            let screen_name = s.name.clone();
            s.counters.retain(|c| {
                if c.used == 0 {
                    errlog.record(format!(
                        "Unused counter '{}' in screen '{}'",
                        c.alias, screen_name
                    ));
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Print the screen list to stdout.
    pub fn list(&self) {
        println!("Available screens:");
        for (i, s) in self.screens.iter().enumerate() {
            println!("{:2}: '{}', {}", i, s.name, s.desc);
        }
    }
}

/// Build the header line for a screen, bracketing the column currently
/// selected for sorting. Column -1 is the PID, column `num_columns` the
/// task name. Truncated to `width` characters.
pub fn gen_header(s: &Screen, options: &Options, width: usize, active_col: i32) -> String {
    let mut hdr = String::new();

    if options.show_timestamp && options.batch {
        hdr.push_str("timest ");
    }
    if options.show_epoch && options.batch {
        hdr.push_str("     epoch ");
    }

    let (open, close) = if active_col == -1 { ('[', ']') } else { (' ', ' ') };
    if options.show_user {
        hdr.push_str(&format!(" {}PID{} user      ", open, close));
    } else {
        hdr.push_str(&format!(" {}PID{}", open, close));
    }

    let num_cols = s.columns.len() as i32;
    for (i, col) in s.columns.iter().enumerate() {
        let i = i as i32;
        let sep = if i == active_col {
            '['
        } else if i - 1 == active_col && i != 0 {
            ']'
        } else {
            ' '
        };
        hdr.push(sep);
        hdr.push_str(&col.header);
    }

    let open = if active_col == num_cols - 1 {
        ']'
    } else if active_col == num_cols {
        '['
    } else {
        ' '
    };
    let close = if active_col == num_cols { ']' } else { ' ' };
    hdr.push(open);
    hdr.push_str("COMMAND");
    hdr.push(close);

    hdr.truncate(width);
    hdr
}

/// Event-class names accepted for the `type` attribute.
const KIND_NAMES: [(u32, &str); 5] = [
    (bindings::PERF_TYPE_HARDWARE, "HARDWARE"),
    (bindings::PERF_TYPE_SOFTWARE, "SOFTWARE"),
    (bindings::PERF_TYPE_TRACEPOINT, "TRACEPOINT"),
    (bindings::PERF_TYPE_HW_CACHE, "HW_CACHE"),
    (bindings::PERF_TYPE_RAW, "RAW"),
];

/// Predefined event-code names accepted for the `config` attribute. The
/// generalized hardware events come first so that name resolution of the
/// overlapping cache-id codes prefers them, as the exporter does.
const EVENT_NAMES: [(u64, &str); 18] = [
    (bindings::PERF_COUNT_HW_CPU_CYCLES as u64, "CPU_CYCLES"),
    (bindings::PERF_COUNT_HW_INSTRUCTIONS as u64, "INSTRUCTIONS"),
    (
        bindings::PERF_COUNT_HW_CACHE_REFERENCES as u64,
        "CACHE_REFERENCES",
    ),
    (bindings::PERF_COUNT_HW_CACHE_MISSES as u64, "CACHE_MISSES"),
    (
        bindings::PERF_COUNT_HW_BRANCH_INSTRUCTIONS as u64,
        "BRANCH_INSTRUCTIONS",
    ),
    (bindings::PERF_COUNT_HW_BRANCH_MISSES as u64, "BRANCH_MISSES"),
    (bindings::PERF_COUNT_HW_BUS_CYCLES as u64, "BUS_CYCLES"),
    (bindings::PERF_COUNT_HW_CACHE_L1D as u64, "L1D"),
    (bindings::PERF_COUNT_HW_CACHE_L1I as u64, "L1I"),
    (bindings::PERF_COUNT_HW_CACHE_LL as u64, "LL"),
    (bindings::PERF_COUNT_HW_CACHE_DTLB as u64, "DTLB"),
    (bindings::PERF_COUNT_HW_CACHE_ITLB as u64, "ITLB"),
    (bindings::PERF_COUNT_HW_CACHE_BPU as u64, "BPU"),
    (bindings::PERF_COUNT_HW_CACHE_OP_READ as u64, "OP_READ"),
    (bindings::PERF_COUNT_HW_CACHE_OP_WRITE as u64, "OP_WRITE"),
    (
        bindings::PERF_COUNT_HW_CACHE_OP_PREFETCH as u64,
        "OP_PREFETCH",
    ),
    (
        bindings::PERF_COUNT_HW_CACHE_RESULT_ACCESS as u64,
        "RESULT_ACCESS",
    ),
    (
        bindings::PERF_COUNT_HW_CACHE_RESULT_MISS as u64,
        "RESULT_MISS",
    ),
];

/// The canonical name of an event class, if it has one.
pub fn counter_kind_name(kind: u32) -> Option<&'static str> {
    KIND_NAMES.iter().find(|(k, _)| *k == kind).map(|(_, n)| *n)
}

/// The canonical name of an event code, if it has one.
pub fn counter_config_name(config: u64) -> Option<&'static str> {
    EVENT_NAMES
        .iter()
        .find(|(c, _)| *c == config)
        .map(|(_, n)| *n)
}

/// Resolve a `type` attribute: absent means hardware, a leading digit
/// means a numeric literal, otherwise one of the known class names.
pub fn resolve_counter_kind(text: Option<&str>) -> Option<u32> {
    let text = match text {
        None => return Some(bindings::PERF_TYPE_HARDWARE),
        Some(t) => t.trim(),
    };
    if text.starts_with(|c: char| c.is_ascii_digit()) {
        return parse_int_literal(text).map(|v| v as u32);
    }
    KIND_NAMES
        .iter()
        .find(|(_, n)| *n == text)
        .map(|(k, _)| *k)
}

/// Resolve a `config` attribute: a predefined event name, a numeric
/// literal (decimal or `0x…`), or an arithmetic expression of numeric
/// literals.
pub fn resolve_counter_config(text: &str) -> Option<u64> {
    let text = text.trim();
    if let Some((c, _)) = EVENT_NAMES.iter().find(|(_, n)| *n == text) {
        return Some(*c);
    }
    if let Some(v) = parse_int_literal(text) {
        return Some(v);
    }
    let e = expr::parse(text).ok()?;
    let v = expr::constant(&e).ok()?;
    if v.is_finite() && v >= 0.0 {
        Some(v as u64)
    } else {
        None
    }
}

fn parse_int_literal(text: &str) -> Option<u64> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

/// The default screen: target-independent counters from the kernel
/// header, plus the usual derived rates.
fn default_screen(set: &mut ScreenSet, errlog: &mut ErrorLog) {
    let idx = set.new_screen("default", Some("Screen by default"), true);
    let s = set.get_mut(idx).unwrap();

    s.add_counter_by_value(
        "CYCLE",
        bindings::PERF_COUNT_HW_CPU_CYCLES as u64,
        bindings::PERF_TYPE_HARDWARE,
        errlog,
    );
    s.add_counter_by_value(
        "INSN",
        bindings::PERF_COUNT_HW_INSTRUCTIONS as u64,
        bindings::PERF_TYPE_HARDWARE,
        errlog,
    );
    s.add_counter_by_value(
        "MISS",
        bindings::PERF_COUNT_HW_CACHE_MISSES as u64,
        bindings::PERF_TYPE_HARDWARE,
        errlog,
    );
    s.add_counter_by_value(
        "BR",
        bindings::PERF_COUNT_HW_BRANCH_MISSES as u64,
        bindings::PERF_TYPE_HARDWARE,
        errlog,
    );
    s.add_counter_by_value(
        "BUS",
        bindings::PERF_COUNT_HW_BUS_CYCLES as u64,
        bindings::PERF_TYPE_HARDWARE,
        errlog,
    );

    s.add_column(" %CPU", "%5.1f", Some("Total CPU usage"), "CPU_TOT", errlog);
    s.add_column(" %SYS", "%5.1f", Some("System CPU usage"), "CPU_SYS", errlog);
    s.add_column(
        "   P",
        "  %2.0f",
        Some("Processor where last seen"),
        "PROC_ID",
        errlog,
    );
    s.add_column(
        "  Mcycle",
        "%8.2f",
        Some("Cycles (millions)"),
        "delta(CYCLE) / 1e6",
        errlog,
    );
    s.add_column(
        "  Minstr",
        "%8.2f",
        Some("Instructions (millions)"),
        "delta(INSN) / 1e6",
        errlog,
    );
    s.add_column(
        "  IPC",
        " %4.2f",
        Some("Executed instructions per cycle"),
        "delta(INSN)/delta(CYCLE)",
        errlog,
    );
    s.add_column(
        " %MISS",
        "%6.2f",
        Some("Cache miss per 100 instructions"),
        "100*delta(MISS)/delta(INSN)",
        errlog,
    );
    s.add_column(
        " %BMIS",
        "%6.2f",
        Some("Mispredicted branches per 100 instructions"),
        "100*delta(BR)/delta(INSN)",
        errlog,
    );
    s.add_column(
        " %BUS",
        "%5.1f",
        Some("Bus cycles per executed instruction"),
        "delta(BUS)/delta(INSN)",
        errlog,
    );
}

fn branch_pred_screen(set: &mut ScreenSet, errlog: &mut ErrorLog) {
    let idx = set.new_screen("branch", Some("Branch prediction statistics"), true);
    let s = set.get_mut(idx).unwrap();

    s.add_counter_by_value(
        "INSTR",
        bindings::PERF_COUNT_HW_INSTRUCTIONS as u64,
        bindings::PERF_TYPE_HARDWARE,
        errlog,
    );
    s.add_counter_by_value(
        "BR",
        bindings::PERF_COUNT_HW_BRANCH_INSTRUCTIONS as u64,
        bindings::PERF_TYPE_HARDWARE,
        errlog,
    );
    s.add_counter_by_value(
        "BMISS",
        bindings::PERF_COUNT_HW_BRANCH_MISSES as u64,
        bindings::PERF_TYPE_HARDWARE,
        errlog,
    );

    s.add_column("  %CPU", " %5.1f", Some("CPU usage"), "CPU_TOT", errlog);
    s.add_column(
        "   %MIS/I",
        "   %6.2f",
        Some("Mispredictions per 100 instructions"),
        "100 * delta(BMISS) / delta(INSTR)",
        errlog,
    );
    s.add_column(
        "   %MISP",
        "   %5.2f",
        Some("Mispredictions per 100 branch instructions"),
        "100 * delta(BMISS) / delta(BR)",
        errlog,
    );
    s.add_column(
        "  %BR/I",
        "  %5.1f",
        Some("Proportion of branch instructions"),
        "100 * delta(BR) / delta(INSTR)",
        errlog,
    );
}

/// Register the built-in screens, prepending so `default` ends up first.
pub fn builtin_screens(set: &mut ScreenSet, errlog: &mut ErrorLog) {
    branch_pred_screen(set, errlog);
    default_screen(set, errlog);
}
