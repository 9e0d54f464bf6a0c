//! The QoS engine: the rules-driven scheduling policy.
//!
//! ## Roles
//!
//! The engine plays two roles for the dispatcher. As the **picker** it is
//! handed the queue (under the dispatcher lock) and selects the next runnable
//! request; as the **observer** it is told when requests start and end so it
//! can keep limit occupancy counters honest.
//!
//! ## Properties cache
//!
//! The first time a request is inspected, the engine walks the rule set once
//! and caches the result — the matching permissions, limits (including the
//! per-user limit clone) and priorities, plus the precomputed starting
//! priority. A permission rule that denies the request sets its cancellation
//! reason during this walk and stops the permission scan. The cache entry is
//! evicted at end of request.
//!
//! ## Hot reload
//!
//! `reload_rules` re-parses the rules file; `replace_rules` swaps in an
//! in-memory rule set. Both then reconfigure: per-user limits and cached
//! properties are discarded, every limit counter is zeroed, and each running
//! request re-registers against the new rule set. A limit's occupancy may
//! therefore exceed its new capacity; the limit simply stays full until
//! enough completions bring it back under. Because the counters are rebuilt
//! from the running set, `reconfigure` is idempotent while no request starts
//! or ends in between.
//!
//! ## Locking
//!
//! One non-reentrant mutex guards all engine state; public methods lock once
//! and delegate to helpers that take the guarded state explicitly. The
//! engine is called with the dispatcher lock held (lock order: dispatcher →
//! QoS → environment, never reversed).

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::dispatcher::{BrokerStats, QueueItem};
use crate::environment::Environment;
use crate::expr::{Context, EvalError, FunctionRegistry};
use crate::parser::RulesParser;
use crate::request::Request;
use crate::rules::{LimitRule, Rule, RuleSet};
use crate::types::{BrokerError, Status};

// ── Properties ────────────────────────────────────────────────────────────────

/// Per-request memoised view of the rule set: which rules match, and the
/// precomputed starting priority.
#[derive(Debug, Default, Clone)]
pub struct Properties {
    pub permissions: Vec<Arc<Rule>>,
    pub limits: Vec<Arc<LimitRule>>,
    pub priorities: Vec<Arc<Rule>>,
    pub starting_priority: f64,
}

// ── Status report ─────────────────────────────────────────────────────────────

/// Structured snapshot of the engine's view of a set of requests.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub requests: Vec<RequestReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestReport {
    pub id: u64,
    pub user: String,
    pub status: Status,
    /// Effective priority (starting priority + age), when it could be
    /// computed.
    pub priority: Option<f64>,
    /// The denial reason, if a permission rule canceled this request.
    pub canceled: Option<String>,
    /// Rule-evaluation failure that is currently keeping this request from
    /// being scheduled, if any.
    pub scheduling_error: Option<String>,
    pub limits: Vec<LimitReport>,
    pub priorities: Vec<String>,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimitReport {
    pub rule: String,
    pub value: u64,
    /// `None` when the capacity expression failed to evaluate.
    pub capacity: Option<f64>,
    pub full: bool,
}

// ── Engine ────────────────────────────────────────────────────────────────────

struct QosState {
    rules: RuleSet,
    path: Option<PathBuf>,
    running: Vec<Arc<Request>>,
    properties: HashMap<u64, Arc<Properties>>,
    per_user_limits: HashMap<String, Arc<LimitRule>>,
}

/// The rules-driven scheduling policy.
pub struct QoS {
    state: Mutex<QosState>,
    environment: Arc<Environment>,
    stats: Arc<BrokerStats>,
    registry: FunctionRegistry,
}

impl QoS {
    /// Builds an engine over an already-parsed rule set.
    pub fn new(
        rules: RuleSet,
        environment: Arc<Environment>,
        stats: Arc<BrokerStats>,
        registry: FunctionRegistry,
    ) -> Self {
        Self {
            state: Mutex::new(QosState {
                rules,
                path: None,
                running: Vec::new(),
                properties: HashMap::new(),
                per_user_limits: HashMap::new(),
            }),
            environment,
            stats,
            registry,
        }
    }

    /// Builds an engine by parsing the rules file at `path`; the path is kept
    /// so `reload_rules` can re-read it.
    pub fn from_path(
        path: impl AsRef<Path>,
        environment: Arc<Environment>,
        stats: Arc<BrokerStats>,
        registry: FunctionRegistry,
    ) -> Result<Self, BrokerError> {
        let path = path.as_ref().to_path_buf();
        let rules = read_rules(&path, &registry)?;
        let qos = Self::new(rules, environment, stats, registry);
        qos.lock().path = Some(path);
        Ok(qos)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QosState> {
        self.state.lock().expect("qos mutex poisoned")
    }

    fn context<'a>(&'a self, request: &'a Request) -> Context<'a> {
        Context {
            request,
            environment: &self.environment,
            stats: &self.stats,
        }
    }

    // ── Rule management ──────────────────────────────────────────────────────

    /// Re-parses the rules file this engine was built from, then
    /// reconfigures. Running-request accounting survives the swap.
    pub fn reload_rules(&self) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let path = state.path.clone().ok_or(BrokerError::NoRulesPath)?;
        state.rules = read_rules(&path, &self.registry)?;
        self.reconfigure_state(&mut state);
        Ok(())
    }

    /// Swaps in a new in-memory rule set, then reconfigures.
    pub fn replace_rules(&self, rules: RuleSet) {
        let mut state = self.lock();
        state.rules = rules;
        self.reconfigure_state(&mut state);
    }

    /// Resets engine state against the current rule set. Must be called after
    /// the rule set changed; harmless (idempotent) otherwise.
    pub fn reconfigure(&self) {
        let mut state = self.lock();
        self.reconfigure_state(&mut state);
    }

    fn reconfigure_state(&self, state: &mut QosState) {
        tracing::debug!(
            running = state.running.len(),
            rules = state.rules.len(),
            "reconfiguring qos engine"
        );
        state.per_user_limits.clear();
        state.properties.clear();
        state.rules.reset_counters();

        // Re-register the running requests against the (possibly new) rules.
        let running = state.running.clone();
        for request in &running {
            match self.properties_for(state, request) {
                Ok(props) => {
                    for limit in &props.limits {
                        limit.increment();
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        request = request.id(),
                        error = %e,
                        "cannot re-register running request after reconfigure"
                    );
                }
            }
        }
    }

    // ── Properties ───────────────────────────────────────────────────────────

    /// Returns the cached properties for `request`, building them on first
    /// inspection. Building checks permissions (and records a denial on the
    /// request), collects the matching global and per-user limits, and sums
    /// the matching priority conclusions.
    fn properties_for(
        &self,
        state: &mut QosState,
        request: &Arc<Request>,
    ) -> Result<Arc<Properties>, EvalError> {
        if let Some(props) = state.properties.get(&request.id()) {
            return Ok(Arc::clone(props));
        }

        let permissions = state.rules.permissions.clone();
        let global_limits = state.rules.global_limits.clone();
        let user_limits = state.rules.user_limits.clone();
        let priorities = state.rules.priorities.clone();

        let ctx = self.context(request);
        let mut props = Properties::default();

        for rule in &permissions {
            if rule.matches(&ctx)? {
                props.permissions.push(Arc::clone(rule));
                if !rule.evaluate(&ctx)?.is_truthy() {
                    request.set_canceled(rule.info_text(&ctx)?);
                    break;
                }
            }
        }

        for limit in &global_limits {
            if limit.rule.matches(&ctx)? {
                props.limits.push(Arc::clone(limit));
            }
        }

        // Per-user limit: each distinct user gets its own clone of the first
        // user-limit rule that matches, so users do not share the counter.
        let user = request.user().to_string();
        let per_user = match state.per_user_limits.get(&user) {
            Some(limit) => Some(Arc::clone(limit)),
            None => {
                let mut found = None;
                for limit in &user_limits {
                    if limit.rule.matches(&ctx)? {
                        let clone = Arc::new(limit.clone_fresh());
                        state.per_user_limits.insert(user, Arc::clone(&clone));
                        found = Some(clone);
                        break;
                    }
                }
                found
            }
        };
        if let Some(limit) = per_user {
            props.limits.push(limit);
        }

        let mut starting_priority = 0.0;
        for rule in &priorities {
            if rule.matches(&ctx)? {
                props.priorities.push(Arc::clone(rule));
                starting_priority += rule.evaluate_number(&ctx)?;
            }
        }
        props.starting_priority = starting_priority;

        let props = Arc::new(props);
        state.properties.insert(request.id(), Arc::clone(&props));
        Ok(props)
    }

    /// `Ok(Some(priority))` when every matching limit has headroom,
    /// `Ok(None)` when some limit is full.
    fn eligibility(
        &self,
        state: &mut QosState,
        request: &Arc<Request>,
    ) -> Result<Option<f64>, EvalError> {
        let props = self.properties_for(state, request)?;
        let ctx = self.context(request);
        for limit in &props.limits {
            if limit.full(&ctx)? {
                return Ok(None);
            }
        }
        // Priority increases with time in the queue, so low-priority work is
        // eventually scheduled rather than starved.
        Ok(Some(props.starting_priority + request.age()))
    }

    // ── Picker role ──────────────────────────────────────────────────────────

    /// Selects the next request to run, removing it from the queue.
    ///
    /// Canceled requests are returned first (the worker runs their abort
    /// path). Otherwise the eligible request with the highest priority wins;
    /// ties break in queue order. A request whose rules fail to evaluate is
    /// logged and skipped for this cycle.
    pub(crate) fn pick(&self, queue: &mut Vec<QueueItem>) -> Option<Arc<Request>> {
        let mut state = self.lock();

        if let Some(pos) = queue.iter().position(
            |item| matches!(item, QueueItem::Request(r) if r.canceled().is_some()),
        ) {
            match queue.remove(pos) {
                QueueItem::Request(request) => return Some(request),
                QueueItem::Stop => unreachable!("position matched a request item"),
            }
        }

        let mut best: Option<(usize, f64)> = None;
        for (index, item) in queue.iter().enumerate() {
            let QueueItem::Request(request) = item else {
                continue;
            };
            match self.eligibility(&mut state, request) {
                Ok(Some(priority)) => {
                    if best.map_or(true, |(_, top)| priority > top) {
                        best = Some((index, priority));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        request = request.id(),
                        error = %e,
                        "rule evaluation failed; request skipped this cycle"
                    );
                }
            }
        }

        let (pos, _) = best?;
        match queue.remove(pos) {
            QueueItem::Request(request) => Some(request),
            QueueItem::Stop => unreachable!("candidates are request items"),
        }
    }

    // ── Observer role ────────────────────────────────────────────────────────

    /// Registers a started request: every matching limit counts it once.
    pub(crate) fn notify_start_of_request(&self, request: &Arc<Request>) {
        let mut state = self.lock();
        match self.properties_for(&mut state, request) {
            Ok(props) => {
                for limit in &props.limits {
                    limit.increment();
                }
            }
            Err(e) => {
                tracing::warn!(
                    request = request.id(),
                    error = %e,
                    "cannot register limits at start of request"
                );
            }
        }
        state.running.push(Arc::clone(request));
    }

    /// Releases a finished request: limits are decremented (clamped at zero)
    /// and the cached properties are evicted.
    pub(crate) fn notify_end_of_request(&self, request: &Arc<Request>) {
        let mut state = self.lock();
        match self.properties_for(&mut state, request) {
            Ok(props) => {
                for limit in &props.limits {
                    limit.decrement();
                }
            }
            Err(e) => {
                tracing::warn!(
                    request = request.id(),
                    error = %e,
                    "cannot release limits at end of request"
                );
            }
        }
        state.running.retain(|r| r.id() != request.id());
        state.properties.remove(&request.id());
    }

    // ── Introspection ────────────────────────────────────────────────────────

    /// Effective priority of a request right now.
    pub fn priority(&self, request: &Arc<Request>) -> Result<f64, EvalError> {
        let mut state = self.lock();
        let props = self.properties_for(&mut state, request)?;
        Ok(props.starting_priority + request.age())
    }

    /// Builds the structured status report for the given requests.
    pub fn report(&self, requests: &[Arc<Request>]) -> StatusReport {
        let mut state = self.lock();
        let requests = requests
            .iter()
            .map(|request| self.request_report(&mut state, request))
            .collect();
        StatusReport { requests }
    }

    fn request_report(&self, state: &mut QosState, request: &Arc<Request>) -> RequestReport {
        let mut report = RequestReport {
            id: request.id(),
            user: request.user().to_string(),
            status: request.status(),
            priority: None,
            canceled: request.canceled(),
            scheduling_error: None,
            limits: Vec::new(),
            priorities: Vec::new(),
            permissions: Vec::new(),
        };
        let props = match self.properties_for(state, request) {
            Ok(props) => props,
            Err(e) => {
                report.scheduling_error = Some(e.to_string());
                return report;
            }
        };
        let ctx = self.context(request);
        report.priority = Some(props.starting_priority + request.age());
        report.canceled = request.canceled();
        for limit in &props.limits {
            let capacity = limit.capacity(&ctx).ok();
            let full = capacity.map_or(false, |c| limit.value() as f64 >= c);
            report.limits.push(LimitReport {
                rule: limit.to_string(),
                value: limit.value(),
                capacity,
                full,
            });
        }
        report.priorities = props.priorities.iter().map(|r| r.to_string()).collect();
        report.permissions = props.permissions.iter().map(|r| r.to_string()).collect();
        report
    }

    /// Writes a human-readable status dump for the given requests.
    pub fn status<W: io::Write>(
        &self,
        requests: &[Arc<Request>],
        out: &mut W,
    ) -> io::Result<()> {
        let report = self.report(requests);
        writeln!(out, "=== requests ===")?;
        for request in &report.requests {
            writeln!(
                out,
                "R-{} user={} status={}",
                request.id, request.user, request.status
            )?;
            match (&request.priority, &request.scheduling_error) {
                (Some(priority), _) => writeln!(out, "  priority: {priority:.1}")?,
                (None, Some(error)) => writeln!(out, "  scheduling error: {error}")?,
                (None, None) => {}
            }
            if let Some(reason) = &request.canceled {
                writeln!(out, "  canceled: {reason}")?;
            }
            for limit in &request.limits {
                writeln!(
                    out,
                    "  {} ({}/{}) {}",
                    limit.rule,
                    limit.value,
                    limit
                        .capacity
                        .map(crate::types::format_number)
                        .unwrap_or_else(|| "?".to_string()),
                    if limit.full { "** FULL **" } else { "-" }
                )?;
            }
            for rule in &request.priorities {
                writeln!(out, "  {rule}")?;
            }
            for rule in &request.permissions {
                writeln!(out, "  {rule}")?;
            }
        }
        Ok(())
    }

    /// Writes the canonical dump of the current rule set.
    pub fn dump_rules<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        self.lock().rules.dump(out)
    }
}

fn read_rules(path: &Path, registry: &FunctionRegistry) -> Result<RuleSet, BrokerError> {
    let mut parser = RulesParser::from_path(path, registry)?;
    let mut rules = RuleSet::default();
    parser.parse_rules(&mut rules)?;
    tracing::debug!(path = %path.display(), rules = rules.len(), "rules loaded");
    Ok(rules)
}
