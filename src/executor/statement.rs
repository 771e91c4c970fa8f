//! Lightweight lexical scan of SQL text.
//!
//! String literals, quoted identifiers and comments are skipped, so a `?` or `:name`
//! inside `'...'` is not a placeholder and a `;` inside a comment does not split
//! statements. This is not a parser: it only classifies what the executor needs.

use crate::error::ReplicaDbError;

#[derive(Clone, Copy)]
enum State {
    Normal,
    SingleQuoted,
    DoubleQuoted,
    Backticked,
    Bracketed,
    LineComment,
    BlockComment,
}

/// What a single statement does to the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Runs under the shared gate, alongside other statements.
    Read,
    /// Runs under the writer lock.
    Write,
    /// `BEGIN`, `COMMIT`, `ROLLBACK`, `SAVEPOINT`, `RELEASE`, `END`; owned by the handle.
    TransactionControl,
}

/// Placeholder style found in a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholders {
    None,
    /// `?` placeholders, by count.
    Anonymous(usize),
    /// `?N` placeholders, by highest index.
    Numbered(usize),
    /// `:name`, `@name` or `$name`, in order of first appearance, prefix included.
    Named(Vec<String>),
    /// More than one of the above in the same text.
    Mixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    kind: StatementKind,
    returning: bool,
    inserts: bool,
}

#[derive(Default)]
struct SegmentScan {
    first_word: Option<String>,
    /// First top-level `SELECT`/`VALUES`/DML keyword; for `WITH` this is the word after
    /// the CTE list, so `replace()` or a nested `DELETE` does not decide the kind.
    verb: Option<String>,
    content: bool,
    returning: bool,
    assignment: bool,
}

impl SegmentScan {
    fn word(&mut self, word: &str, depth: u32) {
        let upper = word.to_ascii_uppercase();
        if self.first_word.is_none() {
            self.first_word = Some(upper.clone());
        }
        if depth > 0 {
            return;
        }
        match upper.as_str() {
            "RETURNING" => self.returning = true,
            "SELECT" | "VALUES" | "INSERT" | "REPLACE" | "UPDATE" | "DELETE"
                if self.verb.is_none() =>
            {
                self.verb = Some(upper);
            }
            _ => {}
        }
    }

    fn inserts(&self) -> bool {
        matches!(self.verb.as_deref(), Some("INSERT" | "REPLACE"))
    }

    fn dml(&self) -> bool {
        self.inserts() || matches!(self.verb.as_deref(), Some("UPDATE" | "DELETE"))
    }

    fn finish(self) -> Option<Segment> {
        if !self.content {
            return None;
        }
        let inserts = self.inserts();
        let dml = self.dml();
        let first = self.first_word.unwrap_or_default();
        let kind = match first.as_str() {
            "SELECT" | "VALUES" | "EXPLAIN" => StatementKind::Read,
            "WITH" if !dml => StatementKind::Read,
            "PRAGMA" if !self.assignment => StatementKind::Read,
            "BEGIN" | "COMMIT" | "END" | "ROLLBACK" | "SAVEPOINT" | "RELEASE" => {
                StatementKind::TransactionControl
            }
            _ => StatementKind::Write,
        };
        Some(Segment {
            kind,
            returning: self.returning,
            inserts,
        })
    }
}

/// Classification of a piece of SQL text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementShape {
    segments: Vec<Segment>,
    placeholders: Placeholders,
}

impl StatementShape {
    #[must_use]
    pub fn scan(sql: &str) -> Self {
        let bytes = sql.as_bytes();
        let mut state = State::Normal;
        let mut depth: u32 = 0;
        let mut segment = SegmentScan::default();
        let mut segments = Vec::new();

        let mut anonymous = 0usize;
        let mut highest = 0usize;
        let mut named: Vec<String> = Vec::new();

        let mut idx = 0;
        while idx < bytes.len() {
            let b = bytes[idx];
            match state {
                State::Normal => match b {
                    b'\'' => {
                        segment.content = true;
                        state = State::SingleQuoted;
                    }
                    b'"' => {
                        segment.content = true;
                        state = State::DoubleQuoted;
                    }
                    b'`' => {
                        segment.content = true;
                        state = State::Backticked;
                    }
                    b'[' => {
                        segment.content = true;
                        state = State::Bracketed;
                    }
                    b'-' if bytes.get(idx + 1) == Some(&b'-') => state = State::LineComment,
                    b'/' if bytes.get(idx + 1) == Some(&b'*') => {
                        state = State::BlockComment;
                        idx += 1;
                    }
                    b';' => {
                        segments.extend(std::mem::take(&mut segment).finish());
                        depth = 0;
                    }
                    b'(' => {
                        segment.content = true;
                        depth += 1;
                    }
                    b')' => {
                        segment.content = true;
                        depth = depth.saturating_sub(1);
                    }
                    b'=' => {
                        segment.content = true;
                        if depth == 0 {
                            segment.assignment = true;
                        }
                    }
                    b'?' => {
                        segment.content = true;
                        if let Some((end, digits)) = scan_digits(bytes, idx + 1) {
                            highest = highest.max(digits.parse().unwrap_or(usize::MAX));
                            idx = end - 1;
                        } else {
                            anonymous += 1;
                        }
                    }
                    b':' | b'@' | b'$' if bytes.get(idx + 1).is_some_and(|n| is_word_start(*n)) => {
                        segment.content = true;
                        let end = scan_word(bytes, idx + 1);
                        let name = &sql[idx..end];
                        if !named.iter().any(|n| n == name) {
                            named.push(name.to_string());
                        }
                        idx = end - 1;
                    }
                    _ if is_word_start(b) && !follows_word(bytes, idx) => {
                        segment.content = true;
                        let end = scan_word(bytes, idx);
                        segment.word(&sql[idx..end], depth);
                        idx = end - 1;
                    }
                    _ if b.is_ascii_whitespace() => {}
                    _ => segment.content = true,
                },
                State::SingleQuoted => {
                    if b == b'\'' {
                        if bytes.get(idx + 1) == Some(&b'\'') {
                            idx += 1; // escaped quote
                        } else {
                            state = State::Normal;
                        }
                    }
                }
                State::DoubleQuoted => {
                    if b == b'"' {
                        if bytes.get(idx + 1) == Some(&b'"') {
                            idx += 1;
                        } else {
                            state = State::Normal;
                        }
                    }
                }
                State::Backticked => {
                    if b == b'`' {
                        state = State::Normal;
                    }
                }
                State::Bracketed => {
                    if b == b']' {
                        state = State::Normal;
                    }
                }
                State::LineComment => {
                    if b == b'\n' {
                        state = State::Normal;
                    }
                }
                State::BlockComment => {
                    if b == b'*' && bytes.get(idx + 1) == Some(&b'/') {
                        state = State::Normal;
                        idx += 1;
                    }
                }
            }
            idx += 1;
        }
        segments.extend(segment.finish());

        let styles = usize::from(anonymous > 0) + usize::from(highest > 0) + usize::from(!named.is_empty());
        let placeholders = if styles > 1 {
            Placeholders::Mixed
        } else if anonymous > 0 {
            Placeholders::Anonymous(anonymous)
        } else if highest > 0 {
            Placeholders::Numbered(highest)
        } else if !named.is_empty() {
            Placeholders::Named(named)
        } else {
            Placeholders::None
        };

        Self {
            segments,
            placeholders,
        }
    }

    /// Kind of the first statement; `None` for empty text.
    #[must_use]
    pub fn kind(&self) -> Option<StatementKind> {
        self.segments.first().map(|s| s.kind)
    }

    #[must_use]
    pub fn statement_count(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn placeholders(&self) -> &Placeholders {
        &self.placeholders
    }

    /// Whether running the first statement yields rows.
    #[must_use]
    pub fn returns_rows(&self) -> bool {
        self.segments
            .first()
            .is_some_and(|s| s.kind == StatementKind::Read || s.returning)
    }

    #[must_use]
    pub fn is_insert(&self) -> bool {
        self.segments.first().is_some_and(|s| s.inserts)
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        self.segments.iter().any(|s| s.kind == StatementKind::Write)
    }

    #[must_use]
    pub fn has_transaction_control(&self) -> bool {
        self.segments
            .iter()
            .any(|s| s.kind == StatementKind::TransactionControl)
    }

    /// Exactly one statement, and not a transaction-control one.
    pub(crate) fn check_single(&self, statement: &str) -> Result<(), ReplicaDbError> {
        match self.segments.as_slice() {
            [] => Err(ReplicaDbError::query(statement, "empty statement")),
            [one] if one.kind == StatementKind::TransactionControl => Err(ReplicaDbError::query(
                statement,
                "transaction control is managed by the connection handle; use commit() or rollback()",
            )),
            [_] => Ok(()),
            _ => Err(ReplicaDbError::query(
                statement,
                "multiple statements; use execute_batch",
            )),
        }
    }

    /// Positional bindings must cover every placeholder, and nothing more.
    pub(crate) fn check_positional(&self, supplied: usize) -> Result<(), ReplicaDbError> {
        let expected = match &self.placeholders {
            Placeholders::None => 0,
            Placeholders::Anonymous(n) | Placeholders::Numbered(n) => *n,
            Placeholders::Named(names) => {
                return Err(ReplicaDbError::ParameterError(format!(
                    "statement uses named placeholders ({}); bind them by name",
                    names.join(", ")
                )));
            }
            Placeholders::Mixed => {
                return Err(ReplicaDbError::ParameterError(
                    "statement mixes placeholder styles".into(),
                ));
            }
        };
        if expected == supplied {
            Ok(())
        } else {
            Err(ReplicaDbError::ParameterError(format!(
                "statement expects {expected} positional parameter(s), got {supplied}"
            )))
        }
    }

    /// Match supplied names (with or without the `:`/`@`/`$` prefix) to the statement's
    /// placeholders. Returns the placeholder names in the order supplied.
    pub(crate) fn check_named(&self, supplied: &[&str]) -> Result<Vec<String>, ReplicaDbError> {
        let placeholders: &[String] = match &self.placeholders {
            Placeholders::None => &[],
            Placeholders::Named(names) => names,
            Placeholders::Anonymous(_) | Placeholders::Numbered(_) => {
                return Err(ReplicaDbError::ParameterError(
                    "statement uses positional placeholders; bind them by position".into(),
                ));
            }
            Placeholders::Mixed => {
                return Err(ReplicaDbError::ParameterError(
                    "statement mixes placeholder styles".into(),
                ));
            }
        };

        let mut resolved: Vec<String> = Vec::with_capacity(supplied.len());
        for name in supplied {
            let found = placeholders
                .iter()
                .find(|p| p.as_str() == *name || &p[1..] == *name)
                .ok_or_else(|| {
                    ReplicaDbError::ParameterError(format!("no placeholder named `{name}`"))
                })?;
            if resolved.contains(found) {
                return Err(ReplicaDbError::ParameterError(format!(
                    "`{found}` bound more than once"
                )));
            }
            resolved.push(found.clone());
        }

        let missing: Vec<&str> = placeholders
            .iter()
            .filter(|p| !resolved.contains(p))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(resolved)
        } else {
            Err(ReplicaDbError::ParameterError(format!(
                "missing binding for {}",
                missing.join(", ")
            )))
        }
    }
}

fn is_word_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn follows_word(bytes: &[u8], idx: usize) -> bool {
    idx > 0 && is_word_byte(bytes[idx - 1])
}

fn scan_word(bytes: &[u8], start: usize) -> usize {
    let mut idx = start;
    while idx < bytes.len() && is_word_byte(bytes[idx]) {
        idx += 1;
    }
    idx
}

fn scan_digits(bytes: &[u8], start: usize) -> Option<(usize, &str)> {
    let mut idx = start;
    while idx < bytes.len() && bytes[idx].is_ascii_digit() {
        idx += 1;
    }
    if idx == start {
        None
    } else {
        std::str::from_utf8(&bytes[start..idx])
            .ok()
            .map(|digits| (idx, digits))
    }
}
