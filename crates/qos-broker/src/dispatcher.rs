//! Worker pool and shared queue.
//!
//! ## Design
//!
//! All dispatcher state (the queue, the set of known requests, the worker
//! and active counters, the pause flag) lives under a single mutex paired
//! with one condition variable. Workers are dedicated OS threads that loop:
//!
//! 1. Block in [`next_request`] until something is runnable.
//! 2. Mark the request started (the QoS engine registers its limits).
//! 3. Run `execute()` — or the abort path if a permission rule canceled it.
//! 4. Report completion or failure, which releases the limits.
//!
//! The queue holds tagged items: real requests, and `Stop` sentinels that
//! retire one worker each. Shrinking the pool enqueues sentinels; a worker
//! finishes its current request before it ever sees one. The picker (the QoS
//! engine) only sees request items — sentinels are serviced by
//! `next_request` itself, before the picker runs.
//!
//! ## Wakeups
//!
//! Every event that can change eligibility broadcasts the condition:
//! enqueue, request start, request end, worker count change, pause, resume,
//! and environment changes (via [`Dispatcher::notify_environment_changed`],
//! wired to the environment's observer list). A worker that found the queue
//! non-empty but nothing eligible waits for one of these broadcasts and
//! re-evaluates.
//!
//! ## Fault isolation
//!
//! A job that returns an error or panics aborts only its own request: the
//! panic is caught, recorded as the failure cause, and the worker loops on.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::environment::EnvironmentObserver;
use crate::qos::QoS;
use crate::request::Request;
use crate::types::{JobError, Status};

// ── Shared statistics ─────────────────────────────────────────────────────────

/// Dispatcher statistics snapshot, shared with the QoS engine so rule
/// expressions (`numberOfWorkers`) can read them without a back-pointer from
/// requests to the dispatcher.
#[derive(Debug, Default)]
pub struct BrokerStats {
    workers: AtomicUsize,
    active: AtomicUsize,
}

impl BrokerStats {
    pub fn number_of_workers(&self) -> usize {
        self.workers.load(Ordering::Relaxed)
    }

    pub fn number_of_active_requests(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub(crate) fn set_workers(&self, n: usize) {
        self.workers.store(n, Ordering::Relaxed);
    }

    pub(crate) fn set_active(&self, n: usize) {
        self.active.store(n, Ordering::Relaxed);
    }
}

// ── Queue items ───────────────────────────────────────────────────────────────

/// An entry in the dispatcher queue: a request, or a sentinel telling one
/// worker to terminate on receipt.
#[derive(Debug)]
pub(crate) enum QueueItem {
    Request(Arc<Request>),
    Stop,
}

#[derive(Default)]
struct DispatcherState {
    queue: Vec<QueueItem>,
    known: Vec<Arc<Request>>,
    number_of_workers: usize,
    number_of_active_requests: usize,
    paused: bool,
}

struct Core {
    state: Mutex<DispatcherState>,
    condvar: Condvar,
    qos: Arc<QoS>,
    stats: Arc<BrokerStats>,
    worker_seq: AtomicUsize,
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, DispatcherState> {
        self.state.lock().expect("dispatcher mutex poisoned")
    }
}

/// The worker pool cooperating with the QoS engine over a shared queue.
pub struct Dispatcher {
    core: Arc<Core>,
}

impl Dispatcher {
    pub(crate) fn new(number_of_workers: usize, qos: Arc<QoS>, stats: Arc<BrokerStats>) -> Self {
        let dispatcher = Self {
            core: Arc::new(Core {
                state: Mutex::new(DispatcherState::default()),
                condvar: Condvar::new(),
                qos,
                stats,
                worker_seq: AtomicUsize::new(0),
            }),
        };
        dispatcher.set_number_of_workers(number_of_workers);
        dispatcher
    }

    /// Appends a request to the queue in `QUEUED` state and wakes the pool.
    /// Non-blocking.
    pub fn enqueue(&self, request: Arc<Request>) {
        let mut state = self.core.lock();
        request.set_status(Status::Queued);
        state.known.push(Arc::clone(&request));
        state.queue.push(QueueItem::Request(request));
        self.core.condvar.notify_all();
    }

    /// Grows the pool by spawning workers, or shrinks it by enqueuing one
    /// stop sentinel per surplus worker. Workers finish their current
    /// request before honouring a sentinel, so shrinking takes effect
    /// gradually.
    pub fn set_number_of_workers(&self, number_of_workers: usize) {
        let mut state = self.core.lock();
        while state.number_of_workers < number_of_workers {
            let id = self.core.worker_seq.fetch_add(1, Ordering::Relaxed);
            spawn_worker(Arc::clone(&self.core), id);
            state.number_of_workers += 1;
        }
        while state.number_of_workers > number_of_workers {
            state.queue.push(QueueItem::Stop);
            state.number_of_workers -= 1;
        }
        self.core.stats.set_workers(state.number_of_workers);
        self.core.condvar.notify_all();
    }

    pub fn number_of_workers(&self) -> usize {
        self.core.lock().number_of_workers
    }

    /// Stops handing out new requests. Running requests are unaffected.
    pub fn pause(&self) {
        let mut state = self.core.lock();
        state.paused = true;
        self.core.condvar.notify_all();
    }

    pub fn resume(&self) {
        let mut state = self.core.lock();
        state.paused = false;
        self.core.condvar.notify_all();
    }

    /// Blocks the caller until every known request (queued or active) has
    /// reached a terminal state. At least one worker must stay configured
    /// (and the pool not left paused) while work is pending, or this never
    /// returns.
    pub fn wait_for_all_requests(&self) {
        let mut state = self.core.lock();
        while !state.known.is_empty() {
            state = self
                .core
                .condvar
                .wait(state)
                .expect("dispatcher condvar poisoned");
        }
    }

    /// Drains all outstanding work, then retires every worker.
    pub fn shutdown(&self) {
        self.wait_for_all_requests();
        self.set_number_of_workers(0);
    }

    /// Number of requests currently tracked (queued + active).
    pub fn known_requests(&self) -> usize {
        self.core.lock().known.len()
    }

    pub(crate) fn known_snapshot(&self) -> Vec<Arc<Request>> {
        self.core.lock().known.clone()
    }

    /// Environment-change entry point: wakes workers so they re-evaluate
    /// eligibility.
    pub fn notify_environment_changed(&self) {
        let _state = self.core.lock();
        self.core.condvar.notify_all();
    }

    /// An observer handle suitable for `Environment::add_observer`.
    pub(crate) fn wakeup_handle(&self) -> Arc<dyn EnvironmentObserver> {
        Arc::new(Wakeup(Arc::clone(&self.core)))
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Retire the pool; queued work is abandoned. Detached workers exit
        // once they drain their sentinel.
        self.set_number_of_workers(0);
    }
}

struct Wakeup(Arc<Core>);

impl EnvironmentObserver for Wakeup {
    fn on_environment_changed(&self) {
        let _state = self.0.lock();
        self.0.condvar.notify_all();
    }
}

// ── Worker threads ────────────────────────────────────────────────────────────

enum WorkerTask {
    Run(Arc<Request>),
    Exit,
}

fn spawn_worker(core: Arc<Core>, id: usize) {
    std::thread::Builder::new()
        .name(format!("qos-worker-{id}"))
        .spawn(move || worker_loop(core))
        .expect("failed to spawn worker thread");
}

fn worker_loop(core: Arc<Core>) {
    loop {
        let request = match next_request(&core) {
            WorkerTask::Exit => break,
            WorkerTask::Run(request) => request,
        };

        started(&core, &request);

        // A permission rule may have canceled the request while it was
        // queued; report the abort without running the body.
        if let Some(reason) = request.canceled() {
            failed(&core, &request, JobError::Denied(reason));
            continue;
        }

        match panic::catch_unwind(AssertUnwindSafe(|| request.execute())) {
            Ok(Ok(())) => complete(&core, &request),
            Ok(Err(error)) => {
                tracing::warn!(request = request.id(), error = %error, "request failed");
                failed(&core, &request, error);
            }
            Err(payload) => {
                let message = panic_message(payload);
                tracing::warn!(request = request.id(), panic = %message, "request panicked");
                failed(&core, &request, JobError::Panicked(message));
            }
        }
    }
    tracing::trace!("worker retired");
}

/// The scheduling gate. Blocks until there is either a stop sentinel (one
/// worker retires) or the picker selects a runnable request.
fn next_request(core: &Core) -> WorkerTask {
    let mut state = core.lock();
    loop {
        while state.queue.is_empty() || state.paused {
            state = core
                .condvar
                .wait(state)
                .expect("dispatcher condvar poisoned");
        }

        if let Some(pos) = state
            .queue
            .iter()
            .position(|item| matches!(item, QueueItem::Stop))
        {
            state.queue.remove(pos);
            core.condvar.notify_all();
            return WorkerTask::Exit;
        }

        if let Some(request) = core.qos.pick(&mut state.queue) {
            core.condvar.notify_all();
            return WorkerTask::Run(request);
        }

        // Queue is non-empty but nothing is eligible right now. Wait for an
        // enqueue, an end of request, an environment change or a resume.
        state = core
            .condvar
            .wait(state)
            .expect("dispatcher condvar poisoned");
    }
}

fn started(core: &Core, request: &Arc<Request>) {
    let mut state = core.lock();
    request.set_status(Status::Active);
    core.qos.notify_start_of_request(request);
    state.number_of_active_requests += 1;
    core.stats.set_active(state.number_of_active_requests);
    core.condvar.notify_all();
}

fn complete(core: &Core, request: &Arc<Request>) {
    finish(core, request, Status::Complete, None);
}

fn failed(core: &Core, request: &Arc<Request>, error: JobError) {
    finish(core, request, Status::Aborted, Some(error));
}

fn finish(core: &Core, request: &Arc<Request>, status: Status, error: Option<JobError>) {
    let mut state = core.lock();
    if let Some(error) = error {
        request.set_error(error);
    }
    request.set_status(status);
    core.qos.notify_end_of_request(request);
    state.number_of_active_requests -= 1;
    state.known.retain(|r| r.id() != request.id());
    core.stats.set_active(state.number_of_active_requests);
    core.condvar.notify_all();
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
