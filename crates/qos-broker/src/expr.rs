//! Rule-expression AST and evaluator.
//!
//! ## Design
//!
//! Expressions are trees of three node kinds: number literals, string
//! literals (which remember their quote character so the canonical form
//! round-trips), and function calls. Every operator in the surface syntax is
//! parsed into its named function form (`+` → `add`, `~` → `match`, …), so
//! the evaluator only knows how to apply a [`Callable`] to pre-evaluated
//! arguments.
//!
//! A [`Callable`] is either a [`Builtin`] tag or a user closure installed via
//! [`FunctionRegistry::register`]. Names resolve to callables at parse time;
//! an unknown name is a parse error, not an evaluation error.
//!
//! ## Evaluation semantics
//!
//! Evaluation is strict, arguments first — always. `and`/`or` return the
//! value of the deciding operand (`a && b` yields `b` when `a` is truthy,
//! else `a`), and `if(cond, a, b)` evaluates all three arguments before
//! choosing. Rules downstream rely on condition expressions being
//! side-effect-free, so nothing is elided.
//!
//! Any failure (type mismatch, division by zero, invalid regex) becomes an
//! [`EvalError`] carrying the function name and the already-evaluated
//! arguments, and is logged at the failing call site before propagating.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use regex::Regex;
use thiserror::Error;

use crate::dispatcher::BrokerStats;
use crate::environment::Environment;
use crate::request::Request;
use crate::types::{format_number, Value};

// ── Evaluation context ────────────────────────────────────────────────────────

/// Everything an expression may consult: the request under inspection, the
/// shared environment of named resources, and a snapshot of dispatcher
/// statistics (for `numberOfWorkers`). Requests carry no broker back-pointer.
pub struct Context<'a> {
    pub request: &'a Request,
    pub environment: &'a Environment,
    pub stats: &'a BrokerStats,
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why an evaluation failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalErrorKind {
    #[error("type mismatch")]
    TypeMismatch,

    #[error("division by zero")]
    DivisionByZero,

    #[error("invalid regex: {0}")]
    BadRegex(String),

    #[error("expects {expected} argument(s), got {got}")]
    Arity { expected: usize, got: usize },

    #[error("{0}")]
    Other(String),
}

/// An evaluation failure, carrying the offending function name and the
/// arguments it was applied to.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{function}({}): {kind}", fmt_args(.args))]
pub struct EvalError {
    pub function: String,
    pub args: Vec<Value>,
    pub kind: EvalErrorKind,
}

impl EvalError {
    pub fn new(function: impl Into<String>, args: &[Value], kind: EvalErrorKind) -> Self {
        Self {
            function: function.into(),
            args: args.to_vec(),
            kind,
        }
    }

    /// Convenience for user-registered functions reporting a domain failure.
    pub fn other(function: impl Into<String>, args: &[Value], message: impl Into<String>) -> Self {
        Self::new(function, args, EvalErrorKind::Other(message.into()))
    }
}

fn fmt_args(args: &[Value]) -> String {
    args.iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

// ── Callables ─────────────────────────────────────────────────────────────────

/// Signature of a user-registered rule function: the evaluation context plus
/// the pre-evaluated argument values.
pub type UserFn = dyn Fn(&Context<'_>, &[Value]) -> Result<Value, EvalError> + Send + Sync;

/// A named function as resolved at parse time: a built-in tag or a
/// user-supplied closure.
#[derive(Clone)]
pub enum Callable {
    Builtin(Builtin),
    User(Arc<UserFn>),
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callable::Builtin(b) => write!(f, "Builtin({b:?})"),
            Callable::User(_) => f.write_str("User(..)"),
        }
    }
}

/// The built-in function set of the rule language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    True,
    False,
    Infinity,
    Not,
    Neg,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Match,
    If,
    Second,
    Minute,
    Hour,
    Day,
    Kb,
    Mb,
    Gb,
    Tb,
    NumberOfWorkers,
    User,
    Available,
    EstimatedSize,
    EstimatedTime,
    Request,
}

const BUILTINS: &[(&str, Builtin)] = &[
    ("true", Builtin::True),
    ("false", Builtin::False),
    ("infinity", Builtin::Infinity),
    ("not", Builtin::Not),
    ("neg", Builtin::Neg),
    ("and", Builtin::And),
    ("or", Builtin::Or),
    ("add", Builtin::Add),
    ("sub", Builtin::Sub),
    ("mul", Builtin::Mul),
    ("div", Builtin::Div),
    ("pow", Builtin::Pow),
    ("eq", Builtin::Eq),
    ("ne", Builtin::Ne),
    ("lt", Builtin::Lt),
    ("le", Builtin::Le),
    ("gt", Builtin::Gt),
    ("ge", Builtin::Ge),
    ("match", Builtin::Match),
    ("if", Builtin::If),
    ("second", Builtin::Second),
    ("minute", Builtin::Minute),
    ("hour", Builtin::Hour),
    ("day", Builtin::Day),
    ("Kb", Builtin::Kb),
    ("Mb", Builtin::Mb),
    ("Gb", Builtin::Gb),
    ("Tb", Builtin::Tb),
    ("numberOfWorkers", Builtin::NumberOfWorkers),
    ("user", Builtin::User),
    ("available", Builtin::Available),
    ("estimatedSize", Builtin::EstimatedSize),
    ("estimatedTime", Builtin::EstimatedTime),
    ("request", Builtin::Request),
];

// ── Function registry ─────────────────────────────────────────────────────────

/// Name → callable table used by the parser to resolve identifiers.
///
/// Cloning is cheap and clones share the same table, so a registry handed to
/// a broker keeps seeing functions registered later — but expressions already
/// parsed are unaffected (resolution happened at parse time).
#[derive(Clone)]
pub struct FunctionRegistry {
    inner: Arc<RwLock<HashMap<String, Callable>>>,
}

impl FunctionRegistry {
    /// A registry pre-populated with every built-in.
    pub fn new() -> Self {
        let mut table = HashMap::with_capacity(BUILTINS.len());
        for (name, builtin) in BUILTINS {
            table.insert((*name).to_string(), Callable::Builtin(*builtin));
        }
        Self {
            inner: Arc::new(RwLock::new(table)),
        }
    }

    /// Installs (or replaces) a user function usable in rule expressions.
    pub fn register<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&Context<'_>, &[Value]) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        self.inner
            .write()
            .expect("function registry lock poisoned")
            .insert(name.into(), Callable::User(Arc::new(f)));
    }

    pub fn lookup(&self, name: &str) -> Option<Callable> {
        self.inner
            .read()
            .expect("function registry lock poisoned")
            .get(name)
            .cloned()
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── AST ───────────────────────────────────────────────────────────────────────

/// A parsed rule expression.
#[derive(Debug, Clone)]
pub enum Expr {
    Number(f64),
    /// A string literal; the quote character is kept so the canonical form is
    /// faithful to the source.
    Str {
        value: String,
        quote: char,
    },
    Call {
        name: String,
        callable: Callable,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub(crate) fn call(name: impl Into<String>, callable: Callable, args: Vec<Expr>) -> Self {
        Expr::Call {
            name: name.into(),
            callable,
            args,
        }
    }

    /// Evaluates the expression. Strict: all arguments are evaluated before
    /// any function is applied.
    pub fn evaluate(&self, ctx: &Context<'_>) -> Result<Value, EvalError> {
        match self {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Str { value, .. } => Ok(Value::Str(value.clone())),
            Expr::Call {
                name,
                callable,
                args,
            } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(arg.evaluate(ctx)?);
                }
                let result = match callable {
                    Callable::Builtin(builtin) => apply_builtin(*builtin, name, &values, ctx),
                    Callable::User(f) => f(ctx, &values),
                };
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "expression evaluation failed");
                }
                result
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => f.write_str(&format_number(*n)),
            Expr::Str { value, quote } => write!(f, "{quote}{value}{quote}"),
            Expr::Call { name, args, .. } => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
        }
    }
}

// ── Built-in application ──────────────────────────────────────────────────────

fn apply_builtin(
    builtin: Builtin,
    name: &str,
    args: &[Value],
    ctx: &Context<'_>,
) -> Result<Value, EvalError> {
    let arity = |expected: usize| -> Result<(), EvalError> {
        if args.len() == expected {
            Ok(())
        } else {
            Err(EvalError::new(
                name,
                args,
                EvalErrorKind::Arity {
                    expected,
                    got: args.len(),
                },
            ))
        }
    };
    let number = |v: &Value| -> Result<f64, EvalError> {
        v.as_number()
            .ok_or_else(|| EvalError::new(name, args, EvalErrorKind::TypeMismatch))
    };
    let string = |v: &Value| -> Result<String, EvalError> {
        v.as_str()
            .map(str::to_string)
            .ok_or_else(|| EvalError::new(name, args, EvalErrorKind::TypeMismatch))
    };

    match builtin {
        Builtin::True => {
            arity(0)?;
            Ok(Value::Bool(true))
        }
        Builtin::False => {
            arity(0)?;
            Ok(Value::Bool(false))
        }
        Builtin::Infinity => {
            arity(0)?;
            Ok(Value::Number(f64::INFINITY))
        }
        Builtin::Not => {
            arity(1)?;
            Ok(Value::Bool(!args[0].is_truthy()))
        }
        Builtin::Neg => {
            arity(1)?;
            Ok(Value::Number(-number(&args[0])?))
        }
        // `and`/`or` return the deciding operand, after both arguments have
        // already been evaluated (strict semantics).
        Builtin::And => {
            arity(2)?;
            Ok(if args[0].is_truthy() {
                args[1].clone()
            } else {
                args[0].clone()
            })
        }
        Builtin::Or => {
            arity(2)?;
            Ok(if args[0].is_truthy() {
                args[0].clone()
            } else {
                args[1].clone()
            })
        }
        Builtin::Add => {
            arity(2)?;
            match (&args[0], &args[1]) {
                (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
                (a, b) => Ok(Value::Number(number(a)? + number(b)?)),
            }
        }
        Builtin::Sub => {
            arity(2)?;
            Ok(Value::Number(number(&args[0])? - number(&args[1])?))
        }
        Builtin::Mul => {
            arity(2)?;
            Ok(Value::Number(number(&args[0])? * number(&args[1])?))
        }
        Builtin::Div => {
            arity(2)?;
            let b = number(&args[1])?;
            if b == 0.0 {
                return Err(EvalError::new(name, args, EvalErrorKind::DivisionByZero));
            }
            Ok(Value::Number(number(&args[0])? / b))
        }
        Builtin::Pow => {
            arity(2)?;
            Ok(Value::Number(number(&args[0])?.powf(number(&args[1])?)))
        }
        Builtin::Eq => {
            arity(2)?;
            Ok(Value::Bool(values_equal(&args[0], &args[1])))
        }
        Builtin::Ne => {
            arity(2)?;
            Ok(Value::Bool(!values_equal(&args[0], &args[1])))
        }
        Builtin::Lt => ordered(name, args, |o| o == std::cmp::Ordering::Less),
        Builtin::Le => ordered(name, args, |o| o != std::cmp::Ordering::Greater),
        Builtin::Gt => ordered(name, args, |o| o == std::cmp::Ordering::Greater),
        Builtin::Ge => ordered(name, args, |o| o != std::cmp::Ordering::Less),
        Builtin::Match => {
            arity(2)?;
            let subject = string(&args[0])?;
            let pattern = string(&args[1])?;
            let re = Regex::new(&pattern)
                .map_err(|e| EvalError::new(name, args, EvalErrorKind::BadRegex(e.to_string())))?;
            // Anchored at the start of the subject, like the classic
            // match-vs-search distinction.
            Ok(Value::Bool(
                re.find(&subject).map_or(false, |m| m.start() == 0),
            ))
        }
        Builtin::If => {
            arity(3)?;
            Ok(if args[0].is_truthy() {
                args[1].clone()
            } else {
                args[2].clone()
            })
        }
        Builtin::Second => scaled(name, args, 1.0),
        Builtin::Minute => scaled(name, args, 60.0),
        Builtin::Hour => scaled(name, args, 3600.0),
        Builtin::Day => scaled(name, args, 86400.0),
        Builtin::Kb => scaled(name, args, 1024.0),
        Builtin::Mb => scaled(name, args, 1024.0 * 1024.0),
        Builtin::Gb => scaled(name, args, 1024.0 * 1024.0 * 1024.0),
        Builtin::Tb => scaled(name, args, 1024.0 * 1024.0 * 1024.0 * 1024.0),
        Builtin::NumberOfWorkers => {
            arity(0)?;
            Ok(Value::Number(ctx.stats.number_of_workers() as f64))
        }
        Builtin::User => {
            arity(0)?;
            Ok(Value::Str(ctx.request.user().to_string()))
        }
        Builtin::Available => {
            arity(1)?;
            let resource = string(&args[0])?;
            Ok(Value::Bool(ctx.environment.resource_enabled(&resource)))
        }
        Builtin::EstimatedSize => {
            arity(0)?;
            Ok(Value::Number(ctx.request.cost()[0]))
        }
        Builtin::EstimatedTime => {
            arity(0)?;
            Ok(Value::Number(ctx.request.cost()[1]))
        }
        Builtin::Request => {
            arity(0)?;
            Ok(Value::Number(ctx.request.id() as f64))
        }
    }
}

/// Cross-type equality: numbers (and booleans, which coerce) compare
/// numerically, strings compare as strings, anything else is unequal.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Str(_), _) | (_, Value::Str(_)) => false,
        (a, b) => match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

fn ordered(
    name: &str,
    args: &[Value],
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> Result<Value, EvalError> {
    if args.len() != 2 {
        return Err(EvalError::new(
            name,
            args,
            EvalErrorKind::Arity {
                expected: 2,
                got: args.len(),
            },
        ));
    }
    let ordering = match (&args[0], &args[1]) {
        (Value::Str(a), Value::Str(b)) => a.cmp(b),
        (Value::Str(_), _) | (_, Value::Str(_)) => {
            return Err(EvalError::new(name, args, EvalErrorKind::TypeMismatch))
        }
        (a, b) => {
            let (a, b) = (
                a.as_number().expect("non-string value is numeric"),
                b.as_number().expect("non-string value is numeric"),
            );
            a.partial_cmp(&b)
                .ok_or_else(|| EvalError::new(name, args, EvalErrorKind::TypeMismatch))?
        }
    };
    Ok(Value::Bool(accept(ordering)))
}

fn scaled(name: &str, args: &[Value], scale: f64) -> Result<Value, EvalError> {
    if args.len() != 1 {
        return Err(EvalError::new(
            name,
            args,
            EvalErrorKind::Arity {
                expected: 1,
                got: args.len(),
            },
        ));
    }
    let n = args[0]
        .as_number()
        .ok_or_else(|| EvalError::new(name, args, EvalErrorKind::TypeMismatch))?;
    Ok(Value::Number(n * scale))
}
