// End-to-end scheduling scenarios: priority ordering, global and per-user
// concurrency limits, permission denial, pause/resume and worker-count
// boundaries, and environment-driven eligibility.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use qos_broker::{
    Broker, Environment, FunctionRegistry, Job, JobError, Request, RuleSet, RulesParser, Status,
};

// ── Test jobs ─────────────────────────────────────────────────────────────────

/// Tracks how many jobs run concurrently, and the high-water mark.
#[derive(Default)]
struct ConcurrencyProbe {
    current: AtomicUsize,
    high_water: AtomicUsize,
}

impl ConcurrencyProbe {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn high_water(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }
}

struct TestJob {
    user: String,
    sleep: Duration,
    executed: Arc<AtomicBool>,
    completions: Option<Arc<Mutex<Vec<String>>>>,
    probe: Option<Arc<ConcurrencyProbe>>,
}

impl TestJob {
    fn new(user: &str) -> Self {
        Self {
            user: user.to_string(),
            sleep: Duration::ZERO,
            executed: Arc::new(AtomicBool::new(false)),
            completions: None,
            probe: None,
        }
    }

    fn sleeping(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    fn recording(mut self, completions: &Arc<Mutex<Vec<String>>>) -> Self {
        self.completions = Some(Arc::clone(completions));
        self
    }

    fn probed(mut self, probe: &Arc<ConcurrencyProbe>) -> Self {
        self.probe = Some(Arc::clone(probe));
        self
    }
}

impl Job for TestJob {
    fn user(&self) -> &str {
        &self.user
    }

    fn execute(&self) -> Result<(), JobError> {
        if let Some(probe) = &self.probe {
            probe.enter();
        }
        self.executed.store(true, Ordering::SeqCst);
        if !self.sleep.is_zero() {
            std::thread::sleep(self.sleep);
        }
        if let Some(probe) = &self.probe {
            probe.exit();
        }
        if let Some(completions) = &self.completions {
            completions
                .lock()
                .expect("completions mutex poisoned")
                .push(self.user.clone());
        }
        Ok(())
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn compile(text: &str, registry: &FunctionRegistry) -> RuleSet {
    let mut rules = RuleSet::default();
    RulesParser::new(text, registry)
        .parse_rules(&mut rules)
        .expect("parse rules");
    rules
}

fn broker(rules_text: &str, workers: usize) -> Broker {
    let registry = FunctionRegistry::new();
    let rules = compile(rules_text, &registry);
    Broker::new(rules, workers, Arc::new(Environment::new()), registry)
}

fn wait_until(limit: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[test]
fn test_priority_ordering() {
    let broker = broker(
        r#"
priority "david" (user == "david") : 100
priority "frank" (user == "frank") : 10
priority "erin"  (user == "erin")  : 1
"#,
        1,
    );

    let completions = Arc::new(Mutex::new(Vec::new()));
    broker.pause();
    let erin = Request::new(TestJob::new("erin").recording(&completions));
    broker.enqueue(Arc::clone(&erin));
    let frank = Request::new(TestJob::new("frank").recording(&completions));
    broker.enqueue(Arc::clone(&frank));
    let david = Request::new(TestJob::new("david").recording(&completions));
    broker.enqueue(Arc::clone(&david));
    broker.resume();
    broker.shutdown();

    assert_eq!(erin.status(), Status::Complete);
    assert_eq!(frank.status(), Status::Complete);
    assert_eq!(david.status(), Status::Complete);

    let order = completions.lock().expect("completions mutex poisoned").clone();
    assert_eq!(order, vec!["david", "frank", "erin"]);
}

#[test]
fn test_global_limit_caps_concurrency() {
    let broker = broker("limit \"cap\" true : 2", 4);
    let probe = Arc::new(ConcurrencyProbe::default());

    let requests: Vec<_> = (0..6)
        .map(|_| {
            Request::new(
                TestJob::new("ada")
                    .sleeping(Duration::from_millis(80))
                    .probed(&probe),
            )
        })
        .collect();
    for request in &requests {
        broker.enqueue(Arc::clone(request));
    }
    broker.shutdown();

    for request in &requests {
        assert_eq!(request.status(), Status::Complete);
    }
    assert!(
        probe.high_water() <= 2,
        "cap 2 exceeded: {} concurrent",
        probe.high_water()
    );
}

/// A [`TestJob`] that also reports into a shared overall-concurrency probe.
struct DoubleProbe {
    inner: TestJob,
    overall: Arc<ConcurrencyProbe>,
}

impl Job for DoubleProbe {
    fn user(&self) -> &str {
        self.inner.user()
    }

    fn execute(&self) -> Result<(), JobError> {
        self.overall.enter();
        let result = self.inner.execute();
        self.overall.exit();
        result
    }
}

#[test]
fn test_user_limit_isolates_users() {
    let broker = broker("user \"per\" true : 1", 2);
    let alice_probe = Arc::new(ConcurrencyProbe::default());
    let bob_probe = Arc::new(ConcurrencyProbe::default());
    let overall = Arc::new(ConcurrencyProbe::default());

    let mut requests = Vec::new();
    for _ in 0..3 {
        for (user, probe) in [("alice", &alice_probe), ("bob", &bob_probe)] {
            let request = Request::new(DoubleProbe {
                inner: TestJob::new(user)
                    .sleeping(Duration::from_millis(120))
                    .probed(probe),
                overall: Arc::clone(&overall),
            });
            broker.enqueue(Arc::clone(&request));
            requests.push(request);
        }
    }
    broker.shutdown();

    for request in &requests {
        assert_eq!(request.status(), Status::Complete);
    }
    assert!(
        alice_probe.high_water() <= 1,
        "alice over her limit: {}",
        alice_probe.high_water()
    );
    assert!(
        bob_probe.high_water() <= 1,
        "bob over his limit: {}",
        bob_probe.high_water()
    );
    assert!(
        overall.high_water() >= 2,
        "two users should run in parallel, saw {}",
        overall.high_water()
    );
}

#[test]
fn test_permission_denial_aborts_without_running() {
    let broker = broker("permission \"no bob\" (user == \"bob\") : false", 1);

    let job = TestJob::new("bob");
    let executed = Arc::clone(&job.executed);
    let bob = Request::new(job);
    broker.enqueue(Arc::clone(&bob));
    broker.shutdown();

    assert_eq!(bob.status(), Status::Aborted);
    assert_eq!(bob.canceled().as_deref(), Some("no bob"));
    assert_eq!(bob.error(), Some(JobError::Denied("no bob".into())));
    assert!(!executed.load(Ordering::SeqCst), "denied body must not run");
}

#[test]
fn test_zero_workers_then_scale_up() {
    let broker = broker("", 0);
    let request = Request::new(TestJob::new("ada"));
    broker.enqueue(Arc::clone(&request));

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(request.status(), Status::Queued, "no workers, nothing starts");
    assert_eq!(broker.known_requests(), 1);

    broker.set_number_of_workers(2);
    broker.wait_for_all_requests();
    assert_eq!(request.status(), Status::Complete);
    assert_eq!(broker.known_requests(), 0);
    broker.shutdown();
}

#[test]
fn test_pause_keeps_running_work_and_defers_new() {
    let broker = broker("", 1);

    let long = Request::new(TestJob::new("ada").sleeping(Duration::from_millis(250)));
    broker.enqueue(Arc::clone(&long));
    assert!(
        wait_until(Duration::from_secs(5), || long.status() == Status::Active),
        "first request should start"
    );

    broker.pause();
    let deferred = Request::new(TestJob::new("ada"));
    broker.enqueue(Arc::clone(&deferred));

    // The active request finishes despite the pause.
    assert!(
        wait_until(Duration::from_secs(5), || long.status() == Status::Complete),
        "pause must not abort running work"
    );
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(deferred.status(), Status::Queued, "paused pool must not start work");

    broker.resume();
    broker.shutdown();
    assert_eq!(deferred.status(), Status::Complete);
}

#[test]
fn test_disabled_resource_blocks_without_aborting() {
    // The capacity collapses to zero while adaptor1 is down; the condition
    // stays true so the limit keeps matching and re-evaluates every cycle.
    let registry = FunctionRegistry::new();
    let rules = compile(
        "limit \"adaptor gate\" true : if(available('adaptor1'), 10, 0)",
        &registry,
    );
    let environment = Arc::new(Environment::new());
    let broker = Broker::new(rules, 1, Arc::clone(&environment), registry);

    environment.disable_resource("adaptor1");
    let request = Request::new(TestJob::new("ada"));
    broker.enqueue(Arc::clone(&request));

    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(
        request.status(),
        Status::Queued,
        "ineligible request must stay queued, not abort"
    );

    // Re-enabling the resource must wake the blocked worker on its own — no
    // enqueue or other broker call happens after this point.
    environment.enable_resource("adaptor1");
    assert!(
        wait_until(Duration::from_secs(5), || request.status() == Status::Complete),
        "environment change must wake the pool"
    );
    broker.shutdown();
}

#[test]
fn test_queued_priority_grows_with_age() {
    let broker = broker("priority \"base\" true : 5", 0);
    let request = Request::new(TestJob::new("ada"));
    broker.enqueue(Arc::clone(&request));

    let report = broker.status_report();
    let first = report.requests[0].priority.expect("priority");
    std::thread::sleep(Duration::from_millis(50));
    let report = broker.status_report();
    let second = report.requests[0].priority.expect("priority");
    assert!(
        second > first,
        "priority must grow with age: {first} then {second}"
    );
    assert!(first >= 5.0, "starting priority must be included: {first}");

    broker.set_number_of_workers(1);
    broker.shutdown();
}
