//! The broker facade: wires the environment, the QoS engine and the
//! dispatcher together and exposes the public operations.

use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::dispatcher::{BrokerStats, Dispatcher};
use crate::environment::{Environment, EnvironmentObserver};
use crate::expr::FunctionRegistry;
use crate::qos::{QoS, StatusReport};
use crate::request::Request;
use crate::rules::RuleSet;
use crate::types::BrokerError;

/// A rules-driven work broker: a worker pool whose scheduling policy is the
/// QoS rule set, evaluated over the shared environment.
pub struct Broker {
    environment: Arc<Environment>,
    qos: Arc<QoS>,
    dispatcher: Dispatcher,
    wakeup: Arc<dyn EnvironmentObserver>,
}

impl Broker {
    /// Builds a broker over an already-parsed rule set.
    pub fn new(
        rules: RuleSet,
        number_of_workers: usize,
        environment: Arc<Environment>,
        registry: FunctionRegistry,
    ) -> Self {
        let stats = Arc::new(BrokerStats::default());
        let qos = Arc::new(QoS::new(
            rules,
            Arc::clone(&environment),
            Arc::clone(&stats),
            registry,
        ));
        Self::assemble(environment, qos, stats, number_of_workers)
    }

    /// Builds a broker from a rules file; the path is kept for
    /// [`reload_rules`](Self::reload_rules).
    pub fn from_rules_file(
        path: impl AsRef<Path>,
        number_of_workers: usize,
        environment: Arc<Environment>,
        registry: FunctionRegistry,
    ) -> Result<Self, BrokerError> {
        let stats = Arc::new(BrokerStats::default());
        let qos = Arc::new(QoS::from_path(
            path,
            Arc::clone(&environment),
            Arc::clone(&stats),
            registry,
        )?);
        Ok(Self::assemble(environment, qos, stats, number_of_workers))
    }

    fn assemble(
        environment: Arc<Environment>,
        qos: Arc<QoS>,
        stats: Arc<BrokerStats>,
        number_of_workers: usize,
    ) -> Self {
        let dispatcher = Dispatcher::new(number_of_workers, Arc::clone(&qos), stats);
        let wakeup = dispatcher.wakeup_handle();
        environment.add_observer(Arc::clone(&wakeup));
        Self {
            environment,
            qos,
            dispatcher,
            wakeup,
        }
    }

    /// Adds a request to the queue. Non-blocking.
    pub fn enqueue(&self, request: Arc<Request>) {
        self.dispatcher.enqueue(request);
    }

    pub fn set_number_of_workers(&self, number_of_workers: usize) {
        self.dispatcher.set_number_of_workers(number_of_workers);
    }

    pub fn number_of_workers(&self) -> usize {
        self.dispatcher.number_of_workers()
    }

    pub fn pause(&self) {
        self.dispatcher.pause();
    }

    pub fn resume(&self) {
        self.dispatcher.resume();
    }

    /// Blocks until every accepted request has finished.
    pub fn wait_for_all_requests(&self) {
        self.dispatcher.wait_for_all_requests();
    }

    /// Drains outstanding work, then retires the worker pool.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }

    /// Re-parses the rules file this broker was built from. Accounting for
    /// running requests survives the swap.
    pub fn reload_rules(&self) -> Result<(), BrokerError> {
        self.qos.reload_rules()?;
        // Eligibility may have widened; wake blocked workers to re-evaluate.
        self.dispatcher.notify_environment_changed();
        Ok(())
    }

    /// Swaps in a new in-memory rule set (programmatic hot reload).
    pub fn replace_rules(&self, rules: RuleSet) {
        self.qos.replace_rules(rules);
        self.dispatcher.notify_environment_changed();
    }

    /// Re-registers running requests against the current rule set.
    pub fn reconfigure(&self) {
        self.qos.reconfigure();
        self.dispatcher.notify_environment_changed();
    }

    /// Number of requests currently tracked (queued + active).
    pub fn known_requests(&self) -> usize {
        self.dispatcher.known_requests()
    }

    /// Writes a human-readable status dump of all tracked requests.
    pub fn status<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        self.qos.status(&self.dispatcher.known_snapshot(), out)
    }

    /// Structured status snapshot of all tracked requests.
    pub fn status_report(&self) -> StatusReport {
        self.qos.report(&self.dispatcher.known_snapshot())
    }

    /// Writes the canonical dump of the current rule set.
    pub fn dump_rules<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        self.qos.dump_rules(out)
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.environment
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.environment.remove_observer(&self.wakeup);
        // The dispatcher retires its workers in its own Drop.
    }
}
