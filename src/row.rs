//! Turning task records into display rows, and ordering them.
//!
//! Each tick, every record gets its `skip` flag recomputed and, when it
//! passes the display filters, its text row rebuilt from the active
//! screen's columns. The display order is then stable-sorted by the
//! active column: -1 sorts by PID, `num_columns` by name or command
//! line, anything in between by the column's computed value.

use std::cmp::Ordering;

use crate::expr::{self, FieldError};
use crate::options::Options;
use crate::screen::Screen;
use crate::task::{SortKey, TaskTable};
use crate::TXT_LEN;

/// Rebuild the rows of every displayable record.
///
/// `width` limits the row length (terminal width); rows are always capped
/// at [`TXT_LEN`]. The active column's value is captured as the record's
/// sort key while the row is built.
pub fn build_rows(
    table: &mut TaskTable,
    screen: &Screen,
    options: &Options,
    active_col: i32,
    width: Option<usize>,
) {
    let row_width = width.unwrap_or(TXT_LEN).min(TXT_LEN);
    let cap = row_width.saturating_sub(1);
    let num_columns = screen.columns.len() as i32;

    for (_, rec) in table.iter_mut() {
        rec.skip = true;

        if rec.dead && !options.sticky {
            // Not changing anymore: give the stale row one final showing
            // (tagged DEAD by the renderer); compaction then removes it.
            if !rec.row.is_empty() {
                rec.skip = false;
            }
            continue;
        }
        if !options.idle && rec.cpu_percent < options.cpu_threshold {
            continue;
        }
        if !options.only_filter_matches(rec.tid, &rec.name, &rec.cmdline) {
            continue;
        }

        if active_col == -1 {
            rec.sort_key = SortKey::Int(i64::from(rec.tid));
        } else if active_col == num_columns {
            rec.sort_key = SortKey::Str;
        }

        // Tag threads of multi-threaded processes: '+' marks the main
        // thread, '-' the subordinates.
        let thr = if rec.num_threads > 1 {
            if rec.tid == rec.pid {
                '+'
            } else {
                '-'
            }
        } else {
            ' '
        };

        let mut row = String::with_capacity(cap);
        row.push_str(&format!("{:5}{} ", rec.tid, thr));
        if options.show_user {
            row.push_str(&format!(
                "{:<10} ",
                rec.username.as_deref().unwrap_or("?")
            ));
        }

        let mut full = false;
        for (col, column) in screen.columns.iter().enumerate() {
            let res = expr::value(&column.expr, rec, &screen.counters);
            if active_col == col as i32 {
                rec.sort_key = SortKey::Double(res.unwrap_or(0.0));
            }
            let piece = match res {
                Ok(v) => render_format(&column.format, v),
                Err(FieldError::Error) => column.error_field.clone(),
                Err(FieldError::Empty) => column.empty_field.clone(),
            };
            if row.len() + piece.len() > cap {
                let remaining = cap - row.len();
                push_truncated(&mut row, &piece, remaining);
                full = true;
                break;
            }
            row.push_str(&piece);
            if row.len() < cap {
                row.push(' ');
            }
        }

        if !full {
            let tail = if options.show_cmdline {
                &rec.cmdline
            } else {
                &rec.name
            };
            let avail = cap.saturating_sub(row.len());
            push_truncated(&mut row, tail, avail);
        }

        rec.row = row;
        rec.skip = false;
    }
}

fn push_truncated(row: &mut String, s: &str, avail: usize) {
    if s.len() <= avail {
        row.push_str(s);
        return;
    }
    let mut end = avail;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    row.push_str(&s[..end]);
}

/// Stable-sort the display order by the active column. Descending puts
/// the largest value (or the byte-wise greatest name) first; ties keep
/// their previous relative order.
pub fn sort_rows(
    table: &mut TaskTable,
    active_col: i32,
    num_columns: usize,
    descending: bool,
    show_cmdline: bool,
) {
    table.sort_order_by(|a, b| {
        let ord = if active_col == -1 {
            a.tid.cmp(&b.tid)
        } else if active_col >= 0 && active_col as usize == num_columns {
            let (ka, kb) = if show_cmdline {
                (&a.cmdline, &b.cmdline)
            } else {
                (&a.name, &b.name)
            };
            ka.as_bytes().cmp(kb.as_bytes())
        } else {
            let ka = sort_value(&a.sort_key);
            let kb = sort_value(&b.sort_key);
            ka.partial_cmp(&kb).unwrap_or(Ordering::Equal)
        };
        if descending {
            ord.reverse()
        } else {
            ord
        }
    });
}

fn sort_value(key: &SortKey) -> f64 {
    match key {
        SortKey::Double(d) => *d,
        SortKey::Int(i) => *i as f64,
        SortKey::Str => 0.0,
    }
}

/// Render a printf-style format holding exactly one floating-point
/// conversion, e.g. `"%5.1f"` or `"  %2.0f"`. Literal text around the
/// conversion is preserved; `%%` escapes a percent sign.
pub fn render_format(fmt: &str, value: f64) -> String {
    let bytes = fmt.as_bytes();
    let mut out = String::with_capacity(fmt.len() + 8);
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'%' {
            out.push(bytes[i] as char);
            i += 1;
            continue;
        }
        i += 1;
        if i < bytes.len() && bytes[i] == b'%' {
            out.push('%');
            i += 1;
            continue;
        }

        let mut left = false;
        let mut zero = false;
        let mut plus = false;
        while i < bytes.len() {
            match bytes[i] {
                b'-' => left = true,
                b'0' => zero = true,
                b'+' => plus = true,
                b' ' => {}
                _ => break,
            }
            i += 1;
        }

        let mut width = 0_usize;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            width = width * 10 + usize::from(bytes[i] - b'0');
            i += 1;
        }

        let mut prec: Option<usize> = None;
        if i < bytes.len() && bytes[i] == b'.' {
            i += 1;
            let mut p = 0_usize;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                p = p * 10 + usize::from(bytes[i] - b'0');
                i += 1;
            }
            prec = Some(p);
        }

        let conv = if i < bytes.len() {
            let c = bytes[i];
            i += 1;
            c
        } else {
            b'f'
        };

        let mut rendered = match conv {
            b'd' | b'i' => format!("{}", value as i64),
            b'e' | b'E' => render_exponent(value, prec.unwrap_or(6), conv == b'E'),
            b'g' | b'G' => format!("{}", value),
            _ => format!("{:.*}", prec.unwrap_or(6), value),
        };
        if plus && !rendered.starts_with('-') {
            rendered.insert(0, '+');
        }

        let padded = if rendered.len() >= width {
            rendered
        } else if left {
            format!("{:<w$}", rendered, w = width)
        } else if zero {
            match rendered.strip_prefix('-') {
                Some(digits) => format!("-{:0>w$}", digits, w = width - 1),
                None => format!("{:0>w$}", rendered, w = width),
            }
        } else {
            format!("{:>w$}", rendered, w = width)
        };
        out.push_str(&padded);
    }
    out
}

/// `{:e}` prints `1.5e2`; printf prints `1.5e+02`.
fn render_exponent(value: f64, prec: usize, upper: bool) -> String {
    let s = format!("{:.*e}", prec, value);
    match s.find('e') {
        Some(pos) => {
            let mant = &s[..pos];
            let exp = &s[pos + 1..];
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(d) => ('-', d),
                None => ('+', exp),
            };
            let e = if upper { 'E' } else { 'e' };
            format!("{}{}{}{:0>2}", mant, e, sign, digits)
        }
        None => s,
    }
}
