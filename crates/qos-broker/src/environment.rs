//! Shared environment of named resources.
//!
//! The environment maps resource names to an enabled flag (default: enabled)
//! and to opaque values, and notifies registered observers on every mutation.
//!
//! ## Notification delivery
//!
//! Observers must never be called while the environment lock is held — the
//! dispatcher re-acquires its own lock inside the callback and the reverse
//! lock order would deadlock. Delivery is therefore queued: each mutation
//! pushes a tick onto an internal channel drained by a dedicated notifier
//! thread, which snapshots the observer list and invokes the callbacks with
//! no environment lock held. Delivery is reliable for the lifetime of the
//! environment; a blocked pick re-checks eligibility on every
//! `enable_resource`/`disable_resource`.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};

use crate::types::Value;

/// Receives a callback after every environment mutation.
pub trait EnvironmentObserver: Send + Sync {
    fn on_environment_changed(&self);
}

#[derive(Default)]
struct EnvState {
    enabled: HashMap<String, bool>,
    values: HashMap<String, Value>,
}

type ObserverList = Arc<Mutex<Vec<Arc<dyn EnvironmentObserver>>>>;

/// Thread-safe store of named resource flags and values.
pub struct Environment {
    state: Mutex<EnvState>,
    observers: ObserverList,
    notify_tx: mpsc::Sender<()>,
}

impl Environment {
    pub fn new() -> Self {
        let observers: ObserverList = Arc::new(Mutex::new(Vec::new()));
        let (notify_tx, notify_rx) = mpsc::channel::<()>();

        let thread_observers = Arc::clone(&observers);
        std::thread::Builder::new()
            .name("qos-env-notify".to_string())
            .spawn(move || {
                // Exits when the Environment (the only sender) is dropped.
                while notify_rx.recv().is_ok() {
                    let snapshot: Vec<_> = thread_observers
                        .lock()
                        .expect("environment observers mutex poisoned")
                        .clone();
                    for observer in snapshot {
                        observer.on_environment_changed();
                    }
                }
            })
            .expect("failed to spawn environment notifier thread");

        Self {
            state: Mutex::new(EnvState::default()),
            observers,
            notify_tx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EnvState> {
        self.state.lock().expect("environment mutex poisoned")
    }

    fn notify(&self) {
        // Cannot fail while the notifier thread is alive, and the thread
        // outlives every sender.
        let _ = self.notify_tx.send(());
    }

    /// Stores a value for `resource` and notifies observers.
    pub fn set(&self, resource: &str, value: impl Into<Value>) {
        self.lock().values.insert(resource.to_string(), value.into());
        self.notify();
    }

    pub fn get(&self, resource: &str) -> Option<Value> {
        self.lock().values.get(resource).cloned()
    }

    pub fn get_or(&self, resource: &str, default: impl Into<Value>) -> Value {
        self.get(resource).unwrap_or_else(|| default.into())
    }

    /// A resource that was never mentioned is enabled.
    pub fn resource_enabled(&self, resource: &str) -> bool {
        self.lock().enabled.get(resource).copied().unwrap_or(true)
    }

    pub fn enable_resource(&self, resource: &str) {
        self.lock().enabled.insert(resource.to_string(), true);
        self.notify();
    }

    pub fn disable_resource(&self, resource: &str) {
        self.lock().enabled.insert(resource.to_string(), false);
        self.notify();
    }

    pub fn add_observer(&self, observer: Arc<dyn EnvironmentObserver>) {
        self.observers
            .lock()
            .expect("environment observers mutex poisoned")
            .push(observer);
    }

    /// Removes a previously-added observer, matched by pointer identity.
    pub fn remove_observer(&self, observer: &Arc<dyn EnvironmentObserver>) {
        self.observers
            .lock()
            .expect("environment observers mutex poisoned")
            .retain(|o| !Arc::ptr_eq(o, observer));
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}
