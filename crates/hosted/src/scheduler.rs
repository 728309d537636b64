//! Keyed operation scheduler.
//!
//! One worker function, many keys. Each key gets debounce, coalescing,
//! single-flight, and retry independently: an `add_operation` restarts the
//! key's debounce window; changes arriving during a run coalesce into
//! exactly one follow-up run; failures back off exponentially without
//! blocking other keys. A key's state lives only while something is
//! scheduled, running, or retrying for it.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify};
use tokio::time::Instant;
use tracing::warn;

/// Result of one worker invocation.
pub type OpResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// The worker function: runs one operation for one key.
pub type OpCallback = Box<dyn Fn(String) -> BoxFuture<'static, OpResult> + Send + Sync>;

/// Failure hook: `(key, failure_count, message)` on every failed run.
pub type ErrorHook = Box<dyn Fn(&str, u32, &str) + Send + Sync>;

/// A failed run observed through `expedite_operation_and_wait`.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct OpFailure(pub String);

/// Scheduler tuning.
#[derive(Clone, Debug)]
pub struct KeyedOpsOptions {
    /// Debounce window after the latest `add_operation` for a key.
    pub delay_before_operation: Duration,
    /// First retry delay after a failure; doubles per consecutive failure.
    pub initial_retry_delay: Duration,
    /// Retry backoff cap.
    pub max_retry_delay: Duration,
    /// Whether failed operations are retried at all.
    pub retry: bool,
}

impl Default for KeyedOpsOptions {
    fn default() -> Self {
        Self {
            delay_before_operation: Duration::from_secs(15),
            initial_retry_delay: Duration::from_secs(3),
            max_retry_delay: Duration::from_secs(300),
            retry: true,
        }
    }
}

enum Phase {
    Scheduled { deadline: Instant },
    Running,
    Retrying { deadline: Instant },
}

struct KeyState {
    phase: Phase,
    /// A change arrived while the worker was running; exactly one follow-up
    /// run is owed.
    dirty: bool,
    failures: u32,
    expedite: Arc<Notify>,
    waiters: Vec<oneshot::Sender<Result<(), OpFailure>>>,
}

struct Inner {
    callback: OpCallback,
    on_error: Option<ErrorHook>,
    options: KeyedOpsOptions,
    state: Mutex<HashMap<String, KeyState>>,
    pending: watch::Sender<usize>,
}

/// Per-key debounced, coalescing, retrying single-flight operation queue.
pub struct KeyedOps {
    inner: Arc<Inner>,
}

impl KeyedOps {
    pub fn new(options: KeyedOpsOptions, callback: OpCallback) -> Self {
        Self::with_error_hook(options, callback, None)
    }

    pub fn with_error_hook(
        options: KeyedOpsOptions,
        callback: OpCallback,
        on_error: Option<ErrorHook>,
    ) -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                callback,
                on_error,
                options,
                state: Mutex::new(HashMap::new()),
                pending,
            }),
        }
    }

    /// Mark a key dirty. The worker runs no sooner than the debounce window
    /// after the latest call for that key.
    pub fn add_operation(&self, key: &str) {
        let mut map = self.inner.state.lock().expect("scheduler poisoned");
        let deadline = Instant::now() + self.inner.options.delay_before_operation;
        match map.get_mut(key) {
            None => {
                map.insert(
                    key.to_string(),
                    KeyState {
                        phase: Phase::Scheduled { deadline },
                        dirty: false,
                        failures: 0,
                        expedite: Arc::new(Notify::new()),
                        waiters: Vec::new(),
                    },
                );
                self.inner.pending.send_replace(map.len());
                tokio::spawn(Self::drive(self.inner.clone(), key.to_string()));
            }
            Some(state) => match state.phase {
                // Restart the debounce window.
                Phase::Scheduled { .. } => state.phase = Phase::Scheduled { deadline },
                Phase::Running => state.dirty = true,
                // A retry is already owed; it coalesces the change.
                Phase::Retrying { .. } => {}
            },
        }
    }

    /// Collapse the remaining delay to zero for one key.
    pub fn expedite_operation(&self, key: &str) {
        let map = &mut *self.inner.state.lock().expect("scheduler poisoned");
        if let Some(state) = map.get_mut(key) {
            Self::expedite_state(state);
        }
    }

    /// Collapse the remaining delay to zero for every pending key.
    pub fn expedite_operations(&self) {
        let map = &mut *self.inner.state.lock().expect("scheduler poisoned");
        for state in map.values_mut() {
            Self::expedite_state(state);
        }
    }

    fn expedite_state(state: &mut KeyState) {
        let now = Instant::now();
        match &mut state.phase {
            Phase::Scheduled { deadline } | Phase::Retrying { deadline } => {
                *deadline = now;
                state.expedite.notify_one();
            }
            Phase::Running => {}
        }
    }

    /// Expedite a key and wait for its next run to finish, surfacing that
    /// run's result. Resolves immediately when nothing is pending.
    pub async fn expedite_operation_and_wait(&self, key: &str) -> Result<(), OpFailure> {
        let rx = {
            let map = &mut *self.inner.state.lock().expect("scheduler poisoned");
            match map.get_mut(key) {
                None => return Ok(()),
                Some(state) => {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push(tx);
                    Self::expedite_state(state);
                    rx
                }
            }
        };
        // A dropped sender means the key's driver went away; nothing is
        // pending anymore.
        rx.await.unwrap_or(Ok(()))
    }

    pub fn has_pending_operation(&self, key: &str) -> bool {
        self.inner
            .state
            .lock()
            .expect("scheduler poisoned")
            .contains_key(key)
    }

    pub fn has_pending_operations(&self) -> bool {
        !self
            .inner
            .state
            .lock()
            .expect("scheduler poisoned")
            .is_empty()
    }

    /// Resolve once nothing is scheduled or running. `notify` fires once if
    /// the wait is nontrivial.
    pub async fn wait(&self, notify: Option<&(dyn Fn() + Sync)>) {
        let mut rx = self.inner.pending.subscribe();
        if *rx.borrow_and_update() == 0 {
            return;
        }
        if let Some(cb) = notify {
            cb();
        }
        loop {
            if *rx.borrow_and_update() == 0 {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn retry_delay(options: &KeyedOpsOptions, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(16);
        let backoff = options.initial_retry_delay * (1u32 << shift);
        backoff.min(options.max_retry_delay)
    }

    /// Per-key driver task. Lives from the first `add_operation` for the
    /// key until a run completes with nothing further owed.
    async fn drive(inner: Arc<Inner>, key: String) {
        loop {
            // Debounce or backoff: sleep until the deadline settles. The
            // deadline may move while we sleep (further changes, expedite),
            // so re-read after every wakeup.
            loop {
                let (deadline, expedite) = {
                    let map = inner.state.lock().expect("scheduler poisoned");
                    let state = match map.get(&key) {
                        Some(state) => state,
                        None => return,
                    };
                    match &state.phase {
                        Phase::Scheduled { deadline } | Phase::Retrying { deadline } => {
                            (*deadline, state.expedite.clone())
                        }
                        Phase::Running => return,
                    }
                };
                if Instant::now() >= deadline {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = expedite.notified() => {}
                }
            }

            {
                let mut map = inner.state.lock().expect("scheduler poisoned");
                if let Some(state) = map.get_mut(&key) {
                    state.phase = Phase::Running;
                    state.dirty = false;
                } else {
                    return;
                }
            }

            let result = (inner.callback)(key.clone()).await;

            let done = {
                let mut map = inner.state.lock().expect("scheduler poisoned");
                let state = match map.get_mut(&key) {
                    Some(state) => state,
                    None => return,
                };
                let waiters = std::mem::take(&mut state.waiters);
                let mut done = false;
                match result {
                    Ok(()) => {
                        state.failures = 0;
                        for waiter in waiters {
                            let _ = waiter.send(Ok(()));
                        }
                        if state.dirty {
                            state.dirty = false;
                            state.phase = Phase::Scheduled {
                                deadline: Instant::now() + inner.options.delay_before_operation,
                            };
                        } else {
                            done = true;
                        }
                    }
                    Err(err) => {
                        state.failures += 1;
                        let message = err.to_string();
                        warn!(key = %key, failures = state.failures, error = %message,
                            "keyed operation failed");
                        if let Some(hook) = &inner.on_error {
                            hook(&key, state.failures, &message);
                        }
                        for waiter in waiters {
                            let _ = waiter.send(Err(OpFailure(message.clone())));
                        }
                        if inner.options.retry {
                            state.dirty = false;
                            state.phase = Phase::Retrying {
                                deadline: Instant::now()
                                    + Self::retry_delay(&inner.options, state.failures),
                            };
                        } else if state.dirty {
                            state.dirty = false;
                            state.phase = Phase::Scheduled {
                                deadline: Instant::now() + inner.options.delay_before_operation,
                            };
                        } else {
                            done = true;
                        }
                    }
                }
                if done {
                    map.remove(&key);
                    inner.pending.send_replace(map.len());
                }
                done
            };

            if done {
                return;
            }
        }
    }
}
