// Hot reconfiguration: limit accounting must survive a rule swap, shrunken
// capacities stay saturated until natural completions, and reconfigure is
// idempotent.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use qos_broker::{
    Broker, Environment, FunctionRegistry, Job, JobError, Request, RuleSet, RulesParser, Status,
};

/// A job that blocks until released, so tests can hold requests ACTIVE.
struct GateJob {
    started: Arc<AtomicUsize>,
    release: Arc<AtomicBool>,
}

impl GateJob {
    fn new(started: &Arc<AtomicUsize>, release: &Arc<AtomicBool>) -> Self {
        Self {
            started: Arc::clone(started),
            release: Arc::clone(release),
        }
    }
}

impl Job for GateJob {
    fn user(&self) -> &str {
        "ada"
    }

    fn execute(&self) -> Result<(), JobError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(10);
        while !self.release.load(Ordering::SeqCst) {
            if Instant::now() > deadline {
                return Err(JobError::Failed("gate never released".into()));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}

fn compile(text: &str, registry: &FunctionRegistry) -> RuleSet {
    let mut rules = RuleSet::default();
    RulesParser::new(text, registry)
        .parse_rules(&mut rules)
        .expect("parse rules");
    rules
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

#[test]
fn test_reload_preserves_running_accounting() {
    let registry = FunctionRegistry::new();
    let rules = compile("limit \"cap\" true : 5", &registry);
    let broker = Broker::new(rules, 3, Arc::new(Environment::new()), registry.clone());

    let started = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(AtomicBool::new(false));

    let running: Vec<_> = (0..3)
        .map(|_| Request::new(GateJob::new(&started, &release)))
        .collect();
    for request in &running {
        broker.enqueue(Arc::clone(request));
    }
    assert!(
        wait_until(Duration::from_secs(5), || started.load(Ordering::SeqCst) == 3),
        "three requests should be active under cap 5"
    );

    // Shrink the capacity under the feet of the running requests.
    broker.replace_rules(compile("limit \"cap\" true : 2", &registry));

    // The counter still reflects the three running requests.
    let report = broker.status_report();
    let limit = &report.requests[0].limits[0];
    assert_eq!(limit.value, 3, "occupancy must survive the reload");
    assert_eq!(limit.capacity, Some(2.0));
    assert!(limit.full, "over-capacity limit reads as full");

    // Nothing new starts while the limit is saturated.
    let blocked = Request::new(GateJob::new(&started, &release));
    broker.enqueue(Arc::clone(&blocked));
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(started.load(Ordering::SeqCst), 3, "no new start over capacity");
    assert_eq!(blocked.status(), Status::Queued);

    // Completions drain the counter below the new capacity; the queued
    // request then runs.
    release.store(true, Ordering::SeqCst);
    broker.shutdown();

    for request in &running {
        assert_eq!(request.status(), Status::Complete);
    }
    assert_eq!(blocked.status(), Status::Complete);
}

#[test]
fn test_reconfigure_is_idempotent_between_transitions() {
    let registry = FunctionRegistry::new();
    let rules = compile("limit \"cap\" true : 5\nuser \"per\" true : 3", &registry);
    let broker = Broker::new(rules, 2, Arc::new(Environment::new()), registry);

    let started = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(AtomicBool::new(false));
    let running: Vec<_> = (0..2)
        .map(|_| Request::new(GateJob::new(&started, &release)))
        .collect();
    for request in &running {
        broker.enqueue(Arc::clone(request));
    }
    assert!(wait_until(Duration::from_secs(5), || {
        started.load(Ordering::SeqCst) == 2
    }));

    let occupancies = |broker: &Broker| -> Vec<u64> {
        broker.status_report().requests[0]
            .limits
            .iter()
            .map(|l| l.value)
            .collect()
    };

    broker.reconfigure();
    let first = occupancies(&broker);
    broker.reconfigure();
    let second = occupancies(&broker);

    assert_eq!(first, vec![2, 2], "both limits count the two running requests");
    assert_eq!(first, second, "reconfigure must be idempotent");

    release.store(true, Ordering::SeqCst);
    broker.shutdown();
}

#[test]
fn test_reload_from_file_round_trip() {
    let dir = std::env::temp_dir();
    let path = dir.join(format!("qos-reload-{}.rules", std::process::id()));
    std::fs::write(&path, "limit \"cap\" true : 1\n").expect("write rules");

    let registry = FunctionRegistry::new();
    let environment = Arc::new(Environment::new());
    let broker = Broker::from_rules_file(&path, 2, environment, registry)
        .expect("construct from rules file");

    let started = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(AtomicBool::new(false));
    let first = Request::new(GateJob::new(&started, &release));
    let second = Request::new(GateJob::new(&started, &release));
    broker.enqueue(Arc::clone(&first));
    broker.enqueue(Arc::clone(&second));

    assert!(wait_until(Duration::from_secs(5), || {
        started.load(Ordering::SeqCst) == 1
    }));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(started.load(Ordering::SeqCst), 1, "cap 1 admits one request");

    // Raise the capacity on disk and hot-reload: the second request starts
    // without anything completing.
    std::fs::write(&path, "limit \"cap\" true : 2\n").expect("rewrite rules");
    broker.reload_rules().expect("reload");

    assert!(
        wait_until(Duration::from_secs(5), || started.load(Ordering::SeqCst) == 2),
        "raised capacity must admit the queued request"
    );

    release.store(true, Ordering::SeqCst);
    broker.shutdown();
    assert_eq!(first.status(), Status::Complete);
    assert_eq!(second.status(), Status::Complete);

    std::fs::remove_file(&path).ok();
}
