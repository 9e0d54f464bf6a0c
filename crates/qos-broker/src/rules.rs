//! Rule objects and the rule set.
//!
//! A rule has two expression parts: the `condition` matches requests, the
//! `conclusion` drives the action — a starting priority for priority rules, a
//! grant/deny boolean for permission rules, a concurrency capacity for limit
//! rules. The `info` string is itself an expression so it can be evaluated
//! against the denied request when producing a cancellation reason.
//!
//! Limit rules carry a live occupancy counter. Global limits are shared by
//! all users; user limits are cloned per distinct user (fresh counter) so
//! each user is throttled independently.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::expr::{Context, EvalError, EvalErrorKind, Expr};
use crate::types::Value;

/// Which statement kind a rule came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Priority,
    Permission,
    GlobalLimit,
    UserLimit,
}

impl RuleKind {
    /// The rules-file keyword for this kind.
    pub fn keyword(&self) -> &'static str {
        match self {
            RuleKind::Priority => "priority",
            RuleKind::Permission => "permission",
            RuleKind::GlobalLimit => "limit",
            RuleKind::UserLimit => "user",
        }
    }
}

/// A declarative statement `{kind, info, condition, conclusion}`.
#[derive(Debug, Clone)]
pub struct Rule {
    pub kind: RuleKind,
    pub info: Expr,
    pub condition: Expr,
    pub conclusion: Expr,
}

impl Rule {
    /// Does the condition hold for this request?
    pub fn matches(&self, ctx: &Context<'_>) -> Result<bool, EvalError> {
        Ok(self.condition.evaluate(ctx)?.is_truthy())
    }

    /// Evaluates the conclusion.
    pub fn evaluate(&self, ctx: &Context<'_>) -> Result<Value, EvalError> {
        self.conclusion.evaluate(ctx)
    }

    /// Evaluates the conclusion as a number (priorities, capacities).
    pub fn evaluate_number(&self, ctx: &Context<'_>) -> Result<f64, EvalError> {
        let value = self.evaluate(ctx)?;
        value.as_number().ok_or_else(|| {
            EvalError::new(self.kind.keyword(), &[value], EvalErrorKind::TypeMismatch)
        })
    }

    /// Evaluates the `info` expression to its display text.
    pub fn info_text(&self, ctx: &Context<'_>) -> Result<String, EvalError> {
        Ok(self.info.evaluate(ctx)?.to_string())
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} : {}",
            self.kind.keyword(),
            self.info,
            self.condition,
            self.conclusion
        )
    }
}

/// A limit rule plus its live occupancy counter.
///
/// The counter is only ever mutated under the QoS lock; the atomic is what
/// lets `Arc`-shared rules stay `Sync` without a per-rule mutex.
#[derive(Debug)]
pub struct LimitRule {
    pub rule: Rule,
    value: AtomicU64,
}

impl LimitRule {
    pub fn new(rule: Rule) -> Self {
        Self {
            rule,
            value: AtomicU64::new(0),
        }
    }

    /// Current occupancy.
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements, clamped at zero. Hitting the clamp means accounting went
    /// wrong somewhere; it is logged rather than allowed to underflow.
    pub fn decrement(&self) {
        let result = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        if result.is_err() {
            tracing::warn!(rule = %self.rule, "limit counter already zero on decrement");
        }
    }

    pub(crate) fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }

    /// The capacity this limit grants the given request.
    pub fn capacity(&self, ctx: &Context<'_>) -> Result<f64, EvalError> {
        self.rule.evaluate_number(ctx)
    }

    /// Is the limit saturated for this request? The occupancy may exceed the
    /// capacity after a rule reload shrank it; the limit then stays full
    /// until natural completions bring it back under.
    pub fn full(&self, ctx: &Context<'_>) -> Result<bool, EvalError> {
        Ok(self.value() as f64 >= self.capacity(ctx)?)
    }

    /// A copy of the rule with a fresh zero counter. Used to give each user
    /// an independent instance of a `user` limit.
    pub fn clone_fresh(&self) -> Self {
        Self::new(self.rule.clone())
    }
}

impl fmt::Display for LimitRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.rule.fmt(f)
    }
}

/// All rules of a configuration, in declaration order per kind.
#[derive(Debug, Default)]
pub struct RuleSet {
    pub priorities: Vec<Arc<Rule>>,
    pub global_limits: Vec<Arc<LimitRule>>,
    pub permissions: Vec<Arc<Rule>>,
    pub user_limits: Vec<Arc<LimitRule>>,
}

impl RuleSet {
    pub fn add_priority(&mut self, info: Expr, condition: Expr, conclusion: Expr) {
        self.priorities.push(Arc::new(Rule {
            kind: RuleKind::Priority,
            info,
            condition,
            conclusion,
        }));
    }

    pub fn add_permission(&mut self, info: Expr, condition: Expr, conclusion: Expr) {
        self.permissions.push(Arc::new(Rule {
            kind: RuleKind::Permission,
            info,
            condition,
            conclusion,
        }));
    }

    pub fn add_global_limit(&mut self, info: Expr, condition: Expr, conclusion: Expr) {
        self.global_limits.push(Arc::new(LimitRule::new(Rule {
            kind: RuleKind::GlobalLimit,
            info,
            condition,
            conclusion,
        })));
    }

    pub fn add_user_limit(&mut self, info: Expr, condition: Expr, conclusion: Expr) {
        self.user_limits.push(Arc::new(LimitRule::new(Rule {
            kind: RuleKind::UserLimit,
            info,
            condition,
            conclusion,
        })));
    }

    /// Total number of rules of all kinds.
    pub fn len(&self) -> usize {
        self.priorities.len()
            + self.global_limits.len()
            + self.permissions.len()
            + self.user_limits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Zeroes every limit counter. Called at the start of a reconfiguration
    /// before the running requests are re-registered, which is what makes
    /// `reconfigure` idempotent.
    pub(crate) fn reset_counters(&self) {
        for limit in &self.global_limits {
            limit.reset();
        }
        for limit in &self.user_limits {
            limit.reset();
        }
    }

    /// Writes the canonical dump of every rule.
    pub fn dump<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "# Permissions:")?;
        for rule in &self.permissions {
            writeln!(out, "{rule}")?;
        }
        writeln!(out, "# Global limits:")?;
        for rule in &self.global_limits {
            writeln!(out, "{rule}")?;
        }
        writeln!(out, "# Per-user limits:")?;
        for rule in &self.user_limits {
            writeln!(out, "{rule}")?;
        }
        writeln!(out, "# Priorities:")?;
        for rule in &self.priorities {
            writeln!(out, "{rule}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::BrokerStats;
    use crate::environment::Environment;
    use crate::expr::FunctionRegistry;
    use crate::parser::RulesParser;
    use crate::request::{Job, Request};
    use crate::types::JobError;

    struct UserJob(&'static str);

    impl Job for UserJob {
        fn user(&self) -> &str {
            self.0
        }

        fn execute(&self) -> Result<(), JobError> {
            Ok(())
        }
    }

    fn compile(text: &str) -> RuleSet {
        let registry = FunctionRegistry::new();
        let mut rules = RuleSet::default();
        RulesParser::new(text, &registry)
            .parse_rules(&mut rules)
            .expect("parse rules");
        rules
    }

    fn with_context<T>(user: &'static str, f: impl FnOnce(&Context<'_>) -> T) -> T {
        let request = Request::new(UserJob(user));
        let environment = Environment::new();
        let stats = BrokerStats::default();
        f(&Context {
            request: &request,
            environment: &environment,
            stats: &stats,
        })
    }

    #[test]
    fn test_limit_counter_increments_and_clamps() {
        let rules = compile("limit \"cap\" true : 2");
        let limit = &rules.global_limits[0];
        assert_eq!(limit.value(), 0);
        limit.increment();
        limit.increment();
        assert_eq!(limit.value(), 2);
        limit.decrement();
        limit.decrement();
        limit.decrement(); // clamped, no underflow
        assert_eq!(limit.value(), 0);
    }

    #[test]
    fn test_full_compares_occupancy_to_capacity() {
        let rules = compile("limit \"cap\" true : 2");
        let limit = &rules.global_limits[0];
        with_context("ada", |ctx| {
            assert_eq!(limit.capacity(ctx).expect("capacity"), 2.0);
            assert!(!limit.full(ctx).expect("full"));
            limit.increment();
            limit.increment();
            assert!(limit.full(ctx).expect("full"));
            // Over capacity (post-reload shape) is still just "full".
            limit.increment();
            assert!(limit.full(ctx).expect("full"));
        });
    }

    #[test]
    fn test_infinite_capacity_is_never_full() {
        let rules = compile("limit \"open\" true : infinity");
        let limit = &rules.global_limits[0];
        limit.increment();
        with_context("ada", |ctx| {
            assert!(!limit.full(ctx).expect("full"));
        });
    }

    #[test]
    fn test_clone_fresh_resets_the_counter() {
        let rules = compile("user \"per\" true : 1");
        let prototype = &rules.user_limits[0];
        prototype.increment();
        let clone = prototype.clone_fresh();
        assert_eq!(prototype.value(), 1);
        assert_eq!(clone.value(), 0);
    }

    #[test]
    fn test_rule_matching_and_conclusion() {
        let rules = compile("priority \"vip\" (user == \"ada\") : 100");
        let rule = &rules.priorities[0];
        with_context("ada", |ctx| {
            assert!(rule.matches(ctx).expect("match"));
            assert_eq!(rule.evaluate_number(ctx).expect("number"), 100.0);
            assert_eq!(rule.info_text(ctx).expect("info"), "vip");
        });
        with_context("bob", |ctx| {
            assert!(!rule.matches(ctx).expect("match"));
        });
    }

    #[test]
    fn test_display_matches_rules_file_syntax() {
        let rules = compile("permission \"no bob\" (user == \"bob\") : false");
        assert_eq!(
            rules.permissions[0].to_string(),
            "permission \"no bob\" eq(user(),\"bob\") : false()"
        );
    }

    #[test]
    fn test_reset_counters_zeroes_all_limits() {
        let rules = compile("limit \"a\" true : 2\nuser \"b\" true : 1");
        rules.global_limits[0].increment();
        rules.user_limits[0].increment();
        rules.reset_counters();
        assert_eq!(rules.global_limits[0].value(), 0);
        assert_eq!(rules.user_limits[0].value(), 0);
    }
}
