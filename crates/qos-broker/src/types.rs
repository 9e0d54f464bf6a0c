//! Foundational public types for the qos-broker library.
//!
//! This module defines the data structures shared across the crate:
//! - [`Status`] — the lifecycle state of a request, with stable string codes
//! - [`Value`] — the scalar type produced by rule-expression evaluation
//! - [`JobError`] — failure cause attached to an aborted request
//! - [`BrokerError`] — construction / reload errors surfaced by the facade

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::parser::ParseError;

// ── Status ────────────────────────────────────────────────────────────────────

/// Lifecycle state of a request.
///
/// Serializes to the six stable string codes (`"UNKNOWN"`, `"QUEUED"`,
/// `"SUBMITTED"`, `"ACTIVE"`, `"ABORTED"`, `"COMPLETE"`).
///
/// The broker itself drives `UNKNOWN → QUEUED → ACTIVE → COMPLETE | ABORTED`.
/// `SUBMITTED` is never set by the broker; it is reserved for embedders that
/// track hand-off of a request to an external system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Unknown,
    Queued,
    Submitted,
    Active,
    Aborted,
    Complete,
}

impl Status {
    /// The stable string code for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Unknown => "UNKNOWN",
            Status::Queued => "QUEUED",
            Status::Submitted => "SUBMITTED",
            Status::Active => "ACTIVE",
            Status::Aborted => "ABORTED",
            Status::Complete => "COMPLETE",
        }
    }

    /// `true` for the two terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Aborted | Status::Complete)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Value ─────────────────────────────────────────────────────────────────────

/// A scalar produced by evaluating a rule expression.
///
/// Coercions follow the rule language conventions: booleans coerce to 1/0 in
/// arithmetic and ordered comparison, `+` on two strings concatenates, and any
/// other mixed-type combination is an evaluation error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Str(String),
    Bool(bool),
}

impl Value {
    /// Truthiness: `false`, `0` and the empty string are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
        }
    }

    /// Numeric view: numbers as-is, booleans as 1/0, strings have none.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Str(_) => None,
        }
    }

    /// String view; `None` for non-strings (no implicit stringification).
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Formats a number the way the rule language prints it: integral values
/// without a fractional part, everything else via the default float format.
pub(crate) fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => f.write_str(&format_number(*n)),
            Value::Str(s) => f.write_str(s),
            Value::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failure cause recorded on an aborted request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The job's `execute` returned an error.
    #[error("{0}")]
    Failed(String),

    /// The job's `execute` panicked; the worker caught it and carried on.
    #[error("job panicked: {0}")]
    Panicked(String),

    /// A permission rule denied the request before it ran.
    #[error("denied: {0}")]
    Denied(String),
}

/// Errors surfaced by broker construction and rule reloading.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("cannot read rules file: {0}")]
    Io(#[from] std::io::Error),

    /// `reload_rules` was called on a broker built from an in-memory rule
    /// set. Use `replace_rules` for programmatic hot swaps.
    #[error("no rules file path configured")]
    NoRulesPath,
}
