//! The unit of work tracked by the broker.
//!
//! Embedders implement [`Job`] — the work itself plus the attributes that rule
//! expressions read — and wrap it in a [`Request`], the broker-side handle that
//! carries identity, lifecycle status and failure state. Requests are shared
//! as `Arc<Request>` between the caller, the dispatcher queue and the QoS
//! engine; the mutable fields live behind one internal mutex.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use crate::types::{JobError, Status, Value};

/// The embedder contract: attributes consulted by rule expressions plus the
/// work itself, run synchronously on a worker thread.
pub trait Job: Send + Sync {
    /// The submitting user; consulted by the `user` builtin and by per-user
    /// limit rules.
    fn user(&self) -> &str;

    /// `[estimated_size_bytes, estimated_time_seconds]`, read by the
    /// `estimatedSize` / `estimatedTime` builtins.
    fn cost(&self) -> [f64; 2] {
        [0.0, 0.0]
    }

    /// Open-ended attributes (`dataset`, `adaptor`, …) read by user-registered
    /// rule functions.
    fn attribute(&self, _name: &str) -> Option<Value> {
        None
    }

    /// Performs the work. Runs on the worker thread that picked the request;
    /// an `Err` aborts the request without affecting the worker.
    fn execute(&self) -> Result<(), JobError>;
}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

struct RequestState {
    status: Status,
    canceled: Option<String>,
    error: Option<JobError>,
    start: SystemTime,
}

/// A tracked unit of work: a [`Job`] plus broker-side bookkeeping.
pub struct Request {
    id: u64,
    job: Box<dyn Job>,
    state: Mutex<RequestState>,
}

impl Request {
    /// Wraps `job` in a new request with a fresh monotonic id, status
    /// `UNKNOWN` and `start` set to now.
    pub fn new(job: impl Job + 'static) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            job: Box::new(job),
            state: Mutex::new(RequestState {
                status: Status::Unknown,
                canceled: None,
                error: None,
                start: SystemTime::now(),
            }),
        })
    }

    /// Stable monotonic request id, unique for the process lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> Status {
        self.lock().status
    }

    /// Sets the status directly. The broker drives the normal lifecycle; this
    /// is for embedders restoring persisted state (e.g. `SUBMITTED`).
    pub fn set_status(&self, status: Status) {
        self.lock().status = status;
    }

    /// The denial reason set by a permission rule, if any.
    pub fn canceled(&self) -> Option<String> {
        self.lock().canceled.clone()
    }

    pub(crate) fn set_canceled(&self, reason: String) {
        self.lock().canceled = Some(reason);
    }

    /// The failure cause, if the request aborted.
    pub fn error(&self) -> Option<JobError> {
        self.lock().error.clone()
    }

    pub(crate) fn set_error(&self, error: JobError) {
        self.lock().error = Some(error);
    }

    /// The enqueue-time timestamp that seeds the age-based priority boost.
    pub fn start(&self) -> SystemTime {
        self.lock().start
    }

    /// Overrides the start timestamp. For embedders re-populating a queue
    /// after a restart, so a request keeps the age it had already accrued.
    pub fn set_start(&self, start: SystemTime) {
        self.lock().start = start;
    }

    /// Seconds since `start`. Zero if the clock went backwards.
    pub fn age(&self) -> f64 {
        self.start()
            .elapsed()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    pub fn user(&self) -> &str {
        self.job.user()
    }

    pub fn cost(&self) -> [f64; 2] {
        self.job.cost()
    }

    pub fn attribute(&self, name: &str) -> Option<Value> {
        self.job.attribute(name)
    }

    pub(crate) fn execute(&self) -> Result<(), JobError> {
        self.job.execute()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RequestState> {
        self.state.lock().expect("request mutex poisoned")
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("user", &self.job.user())
            .field("status", &state.status)
            .field("canceled", &state.canceled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct NoopJob;

    impl Job for NoopJob {
        fn user(&self) -> &str {
            "test"
        }

        fn execute(&self) -> Result<(), JobError> {
            Ok(())
        }
    }

    #[test]
    fn test_ids_are_monotonic() {
        let a = Request::new(NoopJob);
        let b = Request::new(NoopJob);
        assert!(b.id() > a.id(), "ids must grow: {} then {}", a.id(), b.id());
    }

    #[test]
    fn test_new_request_defaults() {
        let r = Request::new(NoopJob);
        assert_eq!(r.status(), Status::Unknown);
        assert_eq!(r.canceled(), None);
        assert_eq!(r.error(), None);
        assert_eq!(r.cost(), [0.0, 0.0]);
        assert_eq!(r.attribute("dataset"), None);
    }

    #[test]
    fn test_age_grows_with_time() {
        let r = Request::new(NoopJob);
        let before = r.age();
        std::thread::sleep(Duration::from_millis(20));
        let after = r.age();
        assert!(after > before, "age must grow: {before} then {after}");
    }

    #[test]
    fn test_set_start_restores_age() {
        let r = Request::new(NoopJob);
        r.set_start(SystemTime::now() - Duration::from_secs(3600));
        assert!(
            r.age() >= 3600.0,
            "restored request should be an hour old, age={}",
            r.age()
        );
    }
}
