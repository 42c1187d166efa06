//! The arithmetic formulas behind derived columns.
//!
//! A column such as `IPC` is defined by a small expression over counter
//! aliases, for example `delta(INSN)/delta(CYCLE)`. The grammar is the
//! usual one:
//!
//! ```text
//! expr   := term (('+'|'-') term)*
//! term   := factor (('*'|'/') factor)*
//! factor := number | identifier | 'delta' '(' identifier ')' | '(' expr ')'
//! ```
//!
//! Whitespace is insignificant, numbers are IEEE-754 doubles, operators are
//! left-associative with multiplicative precedence over additive.
//!
//! Three reserved aliases resolve to the task itself rather than to a
//! counter: `CPU_TOT`, `CPU_SYS` and `CPU_USER` are the task's %CPU
//! figures, and `PROC_ID` is the processor it was last seen on.

use std::fmt;

use thiserror::Error;

use crate::screen::CounterDef;
use crate::task::TaskRecord;
use crate::VALUE_SENTINEL;

/// A binary arithmetic operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

impl Op {
    fn symbol(self) -> char {
        match self {
            Op::Add => '+',
            Op::Sub => '-',
            Op::Mul => '*',
            Op::Div => '/',
        }
    }

    /// Multiplicative binds tighter than additive.
    fn precedence(self) -> u8 {
        match self {
            Op::Add | Op::Sub => 1,
            Op::Mul | Op::Div => 2,
        }
    }
}

/// A parsed column or counter-config expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    /// A counter alias, raw or under `delta(...)`.
    Count { alias: String, delta: bool },
    /// A numeric literal.
    Const(f64),
    /// A binary operation over two sub-expressions.
    Binary {
        op: Op,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

/// Why an expression failed to parse, or cannot be used where it appeared.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ExprError {
    #[error("empty expression")]
    Empty,
    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("malformed number '{0}'")]
    BadNumber(String),
    #[error("expected '{0}'")]
    Expected(char),
    #[error("counter aliases are not allowed in a constant expression")]
    CounterInConstant,
    #[error("constant expression does not evaluate to an event code")]
    BadConstant,
}

/// How a column renders when its expression cannot produce a number.
///
/// `Error` (unknown alias, failed counter) dominates `Empty` (division by
/// zero) when both occur in one expression.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FieldError {
    /// Render the column's empty field (`   -`).
    Empty,
    /// Render the column's error field (`   ?`).
    Error,
}

/// Parse `text` into an expression tree.
pub fn parse(text: &str) -> Result<Expr, ExprError> {
    let mut p = Parser {
        src: text.as_bytes(),
        pos: 0,
    };
    p.skip_ws();
    if p.at_end() {
        return Err(ExprError::Empty);
    }
    let e = p.expr()?;
    p.skip_ws();
    match p.peek() {
        None => Ok(e),
        Some(c) => Err(ExprError::UnexpectedChar(c as char, p.pos)),
    }
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_whitespace()) {
            self.bump();
        }
    }

    fn expect(&mut self, c: u8) -> Result<(), ExprError> {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.bump();
            Ok(())
        } else {
            Err(ExprError::Expected(c as char))
        }
    }

    fn expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.term()?;
        loop {
            self.skip_ws();
            let op = match self.peek() {
                Some(b'+') => Op::Add,
                Some(b'-') => Op::Sub,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn term(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.factor()?;
        loop {
            self.skip_ws();
            let op = match self.peek() {
                Some(b'*') => Op::Mul,
                Some(b'/') => Op::Div,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.factor()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn factor(&mut self) -> Result<Expr, ExprError> {
        self.skip_ws();
        match self.peek() {
            None => Err(ExprError::UnexpectedEnd),
            Some(b'(') => {
                self.bump();
                let e = self.expr()?;
                self.expect(b')')?;
                Ok(e)
            }
            Some(c) if c.is_ascii_digit() || c == b'.' => self.number(),
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => {
                let ident = self.identifier();
                self.skip_ws();
                if ident == "delta" && self.peek() == Some(b'(') {
                    self.bump();
                    self.skip_ws();
                    match self.peek() {
                        Some(c) if c.is_ascii_alphabetic() || c == b'_' => {}
                        Some(c) => {
                            return Err(ExprError::UnexpectedChar(c as char, self.pos))
                        }
                        None => return Err(ExprError::UnexpectedEnd),
                    }
                    let alias = self.identifier();
                    self.expect(b')')?;
                    Ok(Expr::Count { alias, delta: true })
                } else {
                    Ok(Expr::Count {
                        alias: ident,
                        delta: false,
                    })
                }
            }
            Some(c) => Err(ExprError::UnexpectedChar(c as char, self.pos)),
        }
    }

    fn identifier(&mut self) -> String {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
            self.bump();
        }
        String::from_utf8_lossy(&self.src[start..self.pos]).into_owned()
    }

    /// Decimal with optional fraction and exponent, e.g. `1e6` or `0.5`.
    fn number(&mut self) -> Result<Expr, ExprError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.bump();
        }
        if self.peek() == Some(b'.') {
            self.bump();
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.bump();
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            self.bump();
            if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                self.bump();
            }
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.bump();
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("");
        text.parse::<f64>()
            .map(Expr::Const)
            .map_err(|_| ExprError::BadNumber(text.to_string()))
    }
}

/// Evaluate a column expression against one task record.
///
/// The counter array is the hosting screen's, in declaration order; count
/// elements resolve by alias into the task's `values`/`prev_values` at the
/// matching index. A sentinel reading yields [`FieldError::Error`], a
/// division by exactly zero yields [`FieldError::Empty`], and the former
/// wins when both occur.
pub fn value(
    e: &Expr,
    task: &TaskRecord,
    counters: &[CounterDef],
) -> Result<f64, FieldError> {
    match e {
        Expr::Const(v) => Ok(*v),
        Expr::Count { alias, delta } => match alias.as_str() {
            "CPU_TOT" => Ok(task.cpu_percent),
            "CPU_SYS" => Ok(task.cpu_percent_s),
            "CPU_USER" => Ok(task.cpu_percent_u),
            "PROC_ID" => Ok(f64::from(task.proc_id)),
            _ => {
                let i = counters
                    .iter()
                    .position(|c| c.alias == *alias)
                    .ok_or(FieldError::Error)?;
                if i >= task.values.len() || task.values[i] == VALUE_SENTINEL {
                    return Err(FieldError::Error);
                }
                if *delta {
                    let prev = task.prev_values[i];
                    if prev == VALUE_SENTINEL {
                        return Err(FieldError::Error);
                    }
                    Ok(task.values[i].saturating_sub(prev) as f64)
                } else {
                    Ok(task.values[i] as f64)
                }
            }
        },
        Expr::Binary { op, lhs, rhs } => {
            let l = value(lhs, task, counters);
            let r = value(rhs, task, counters);
            combine(*op, l, r)
        }
    }
}

fn combine(
    op: Op,
    l: Result<f64, FieldError>,
    r: Result<f64, FieldError>,
) -> Result<f64, FieldError> {
    match (l, r) {
        (Ok(a), Ok(b)) => match op {
            Op::Add => Ok(a + b),
            Op::Sub => Ok(a - b),
            Op::Mul => Ok(a * b),
            Op::Div => {
                if b == 0.0 {
                    Err(FieldError::Empty)
                } else {
                    Ok(a / b)
                }
            }
        },
        (Err(a), Err(b)) => Err(a.max(b)),
        (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(e),
    }
}

/// Evaluate an expression that must contain only numeric literals, as used
/// for counter `config` attributes written as arithmetic (`0x10 * 2` is
/// resolved elsewhere; this sees `16 * 2`).
pub fn constant(e: &Expr) -> Result<f64, ExprError> {
    match e {
        Expr::Const(v) => Ok(*v),
        Expr::Count { .. } => Err(ExprError::CounterInConstant),
        Expr::Binary { op, lhs, rhs } => {
            let a = constant(lhs)?;
            let b = constant(rhs)?;
            match op {
                Op::Add => Ok(a + b),
                Op::Sub => Ok(a - b),
                Op::Mul => Ok(a * b),
                Op::Div => {
                    if b == 0.0 {
                        Err(ExprError::BadConstant)
                    } else {
                        Ok(a / b)
                    }
                }
            }
        }
    }
}

/// Render the expression back to source text, used by the configuration
/// exporter. Parentheses are emitted only where re-parsing would otherwise
/// change the tree.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(v) => write!(f, "{}", v),
            Expr::Count { alias, delta } => {
                if *delta {
                    write!(f, "delta({})", alias)
                } else {
                    write!(f, "{}", alias)
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                write_child(f, lhs, op.precedence(), false)?;
                write!(f, " {} ", op.symbol())?;
                write_child(f, rhs, op.precedence(), true)
            }
        }
    }
}

fn write_child(
    f: &mut fmt::Formatter<'_>,
    child: &Expr,
    parent_prec: u8,
    is_rhs: bool,
) -> fmt::Result {
    let needs_parens = match child {
        Expr::Binary { op, .. } => {
            let p = op.precedence();
            // The right operand of `-` and `/` must keep its grouping.
            p < parent_prec || (p == parent_prec && is_rhs)
        }
        _ => false,
    };
    if needs_parens {
        write!(f, "({})", child)
    } else {
        write!(f, "{}", child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskRecord;

    fn counters(aliases: &[&str]) -> Vec<CounterDef> {
        aliases
            .iter()
            .map(|a| CounterDef {
                alias: a.to_string(),
                kind: 0,
                config: 0,
                used: 0,
            })
            .collect()
    }

    fn task(values: &[u64], prev: &[u64]) -> TaskRecord {
        let mut t = TaskRecord::new(1, 1, values.len());
        t.values.copy_from_slice(values);
        t.prev_values.copy_from_slice(prev);
        t.cpu_percent = 50.0;
        t.cpu_percent_s = 10.0;
        t.cpu_percent_u = 40.0;
        t.proc_id = 3;
        t
    }

    #[test]
    fn parses_with_precedence() {
        let e = parse("1 + 2 * 3").unwrap();
        assert_eq!(constant(&e).unwrap(), 7.0);
        let e = parse("(1 + 2) * 3").unwrap();
        assert_eq!(constant(&e).unwrap(), 9.0);
    }

    #[test]
    fn additive_is_left_associative() {
        let e = parse("10 - 4 - 3").unwrap();
        assert_eq!(constant(&e).unwrap(), 3.0);
        let e = parse("100 / 10 / 5").unwrap();
        assert_eq!(constant(&e).unwrap(), 2.0);
    }

    #[test]
    fn parses_floats_and_exponents() {
        let e = parse("1e6").unwrap();
        assert_eq!(e, Expr::Const(1e6));
        let e = parse("0.5 * 2.5e-1").unwrap();
        assert_eq!(constant(&e).unwrap(), 0.125);
    }

    #[test]
    fn parses_delta_and_plain_aliases() {
        let e = parse("delta(INSN) / delta(CYCLE)").unwrap();
        match &e {
            Expr::Binary { op: Op::Div, lhs, rhs } => {
                assert_eq!(
                    **lhs,
                    Expr::Count {
                        alias: "INSN".into(),
                        delta: true
                    }
                );
                assert_eq!(
                    **rhs,
                    Expr::Count {
                        alias: "CYCLE".into(),
                        delta: true
                    }
                );
            }
            other => panic!("unexpected tree: {:?}", other),
        }
        assert_eq!(
            parse("CPU_TOT").unwrap(),
            Expr::Count {
                alias: "CPU_TOT".into(),
                delta: false
            }
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse(""), Err(ExprError::Empty));
        assert_eq!(parse("   "), Err(ExprError::Empty));
        assert!(parse("1 +").is_err());
        assert!(parse("delta(").is_err());
        assert!(parse("delta()").is_err());
        assert!(parse("(1 + 2").is_err());
        assert!(parse("1 2").is_err());
        assert!(parse("#").is_err());
    }

    #[test]
    fn evaluates_raw_and_delta_counts() {
        let cs = counters(&["CYCLE", "INSN"]);
        let t = task(&[3000, 900], &[1000, 400]);
        let e = parse("delta(INSN) / delta(CYCLE)").unwrap();
        assert_eq!(value(&e, &t, &cs), Ok(0.25));
        let e = parse("CYCLE").unwrap();
        assert_eq!(value(&e, &t, &cs), Ok(3000.0));
    }

    #[test]
    fn reserved_aliases_read_the_task() {
        let cs = counters(&[]);
        let t = task(&[], &[]);
        assert_eq!(value(&parse("CPU_TOT").unwrap(), &t, &cs), Ok(50.0));
        assert_eq!(value(&parse("CPU_SYS").unwrap(), &t, &cs), Ok(10.0));
        assert_eq!(value(&parse("CPU_USER").unwrap(), &t, &cs), Ok(40.0));
        assert_eq!(value(&parse("PROC_ID").unwrap(), &t, &cs), Ok(3.0));
    }

    #[test]
    fn sentinel_propagates_as_error_field() {
        let cs = counters(&["CYCLE", "INSN"]);
        let t = task(&[VALUE_SENTINEL, 900], &[0, 400]);
        for text in [
            "CYCLE",
            "delta(CYCLE)",
            "1 + delta(CYCLE)",
            "delta(INSN) / delta(CYCLE)",
        ] {
            let e = parse(text).unwrap();
            assert_eq!(value(&e, &t, &cs), Err(FieldError::Error), "{}", text);
        }
        // Untouched columns still evaluate.
        let e = parse("delta(INSN)").unwrap();
        assert_eq!(value(&e, &t, &cs), Ok(500.0));
    }

    #[test]
    fn division_by_zero_is_the_empty_field() {
        let cs = counters(&["A", "B"]);
        let t = task(&[10, 5], &[10, 5]);
        let e = parse("delta(A) / delta(B)").unwrap();
        assert_eq!(value(&e, &t, &cs), Err(FieldError::Empty));
        let e = parse("1 / 0").unwrap();
        assert_eq!(value(&e, &t, &cs), Err(FieldError::Empty));
    }

    #[test]
    fn error_field_beats_empty_field() {
        let cs = counters(&["A"]);
        let t = task(&[VALUE_SENTINEL], &[0]);
        // Left side divides by zero (empty), right side is a failed counter.
        let e = parse("1/0 + A").unwrap();
        assert_eq!(value(&e, &t, &cs), Err(FieldError::Error));
    }

    #[test]
    fn unknown_alias_is_an_error_field() {
        let cs = counters(&["A"]);
        let t = task(&[1], &[0]);
        let e = parse("NOPE * 2").unwrap();
        assert_eq!(value(&e, &t, &cs), Err(FieldError::Error));
    }

    #[test]
    fn constants_reject_aliases() {
        let e = parse("CYCLE + 1").unwrap();
        assert_eq!(constant(&e), Err(ExprError::CounterInConstant));
    }

    #[test]
    fn display_round_trips() {
        for text in [
            "delta(INSN) / delta(CYCLE)",
            "100 * delta(MISS) / delta(INSN)",
            "1 + 2 * 3",
            "(1 + 2) * 3",
            "10 - (4 - 3)",
            "CPU_TOT",
        ] {
            let e = parse(text).unwrap();
            let printed = e.to_string();
            let reparsed = parse(&printed).unwrap();
            assert_eq!(e, reparsed, "{} printed as {}", text, printed);
        }
    }
}
