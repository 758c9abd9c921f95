//! Asynchronous stages with registration-time context capture
//!
//! A [`ManagedFuture`] is an asynchronous result whose chained continuations
//! each run under the context captured when the continuation was registered,
//! not whichever thread happens to drive the upstream completion. Completion
//! is terminal and idempotent: once a stage holds a value or a failure, any
//! later completion attempt is a no-op.

use crate::context::descriptor::ContextDescriptor;
use crate::executor::managed::ManagedExecutor;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

/// Failure carried by a stage.
///
/// Cheaply cloneable; every dependent stage observes the same underlying
/// error object, unchanged in type and content.
#[derive(Clone)]
pub struct Failure(Arc<anyhow::Error>);

impl Failure {
    /// Wrap an error as a stage failure.
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(error.into()))
    }

    /// Build a failure from a plain message.
    pub fn msg(message: impl std::fmt::Display) -> Self {
        Self(Arc::new(anyhow::anyhow!("{message}")))
    }

    pub(crate) fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked".to_string()
        };
        Self::msg(format!("task panicked: {message}"))
    }

    /// The underlying error.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Terminal result of a stage.
pub type Outcome<T> = Result<T, Failure>;

type Callback<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

enum StageState<T> {
    Pending(Vec<Callback<T>>),
    Done(Outcome<T>),
}

struct StageCore<T> {
    state: Mutex<StageState<T>>,
}

/// An asynchronous result with context-propagating continuations.
///
/// Cloning yields another handle to the same stage. Values and failures are
/// cloned out to each dependent, so `T: Clone`.
pub struct ManagedFuture<T> {
    core: Arc<StageCore<T>>,
    executor: Arc<ManagedExecutor>,
    /// Context for continuation chains, captured when this stage was bridged
    /// into a context domain. When absent, each chain registration captures
    /// fresh from the registering thread.
    capture_override: Option<Arc<ContextDescriptor>>,
    externally_completable: bool,
}

impl<T> Clone for ManagedFuture<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            executor: self.executor.clone(),
            capture_override: self.capture_override.clone(),
            externally_completable: self.externally_completable,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ManagedFuture<T> {
    /// Create a pending stage bound to an executor.
    pub fn pending(executor: Arc<ManagedExecutor>) -> Self {
        Self {
            core: Arc::new(StageCore {
                state: Mutex::new(StageState::Pending(Vec::new())),
            }),
            executor,
            capture_override: None,
            externally_completable: true,
        }
    }

    /// Create a pending stage whose chains reuse `capture` and which refuses
    /// completion through the public path.
    pub(crate) fn pending_bridged(
        executor: Arc<ManagedExecutor>,
        capture: Arc<ContextDescriptor>,
    ) -> Self {
        Self {
            core: Arc::new(StageCore {
                state: Mutex::new(StageState::Pending(Vec::new())),
            }),
            executor,
            capture_override: Some(capture),
            externally_completable: false,
        }
    }

    /// The executor continuations of this stage run on by default.
    pub fn executor(&self) -> &Arc<ManagedExecutor> {
        &self.executor
    }

    /// Whether the stage has reached a terminal state.
    pub fn is_done(&self) -> bool {
        matches!(*self.lock_state(), StageState::Done(_))
    }

    /// The terminal outcome, if the stage has completed.
    pub fn try_outcome(&self) -> Option<Outcome<T>> {
        match &*self.lock_state() {
            StageState::Done(outcome) => Some(outcome.clone()),
            StageState::Pending(_) => None,
        }
    }

    /// Wait for the terminal outcome.
    pub async fn outcome(&self) -> Outcome<T> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.on_outcome(move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await
            .unwrap_or_else(|_| Err(Failure::msg("stage abandoned before completion")))
    }

    /// Complete the stage with a value. Returns `false` if the stage was
    /// already terminal or does not permit external completion.
    pub fn complete(&self, value: T) -> bool {
        if !self.externally_completable {
            tracing::warn!("external completion refused; stage completes through its source");
            return false;
        }
        self.settle(Ok(value))
    }

    /// Complete the stage with a failure. Returns `false` if the stage was
    /// already terminal or does not permit external completion.
    pub fn fail(&self, error: impl Into<anyhow::Error>) -> bool {
        if !self.externally_completable {
            tracing::warn!("external completion refused; stage completes through its source");
            return false;
        }
        self.settle(Err(Failure::new(error)))
    }

    /// Completion path for the framework itself: task bodies, continuation
    /// scheduling, and cross-domain bridging land here, regardless of the
    /// stage's external-completion policy.
    pub(crate) fn settle(&self, outcome: Outcome<T>) -> bool {
        let callbacks = {
            let mut state = self.lock_state();
            match &mut *state {
                StageState::Done(_) => return false,
                StageState::Pending(_) => {
                    let previous =
                        std::mem::replace(&mut *state, StageState::Done(outcome.clone()));
                    match previous {
                        StageState::Pending(callbacks) => callbacks,
                        StageState::Done(_) => unreachable!("checked pending above"),
                    }
                }
            }
        };

        tracing::trace!(
            dependents = callbacks.len(),
            failed = outcome.is_err(),
            "stage completed"
        );
        for callback in callbacks {
            callback(outcome.clone());
        }
        true
    }

    /// Run `callback` with the outcome once the stage completes; immediately
    /// if it already has.
    pub(crate) fn on_outcome(&self, callback: impl FnOnce(Outcome<T>) + Send + 'static) {
        let ready = {
            let mut state = self.lock_state();
            match &mut *state {
                StageState::Pending(callbacks) => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                StageState::Done(outcome) => outcome.clone(),
            }
        };
        callback(ready);
    }

    /// Map a successful value; a failure passes through untouched.
    pub fn then_apply<U, F>(&self, f: F) -> ManagedFuture<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.then_apply_on(&self.executor, f)
    }

    /// As [`then_apply`](Self::then_apply), on an explicit executor.
    pub fn then_apply_on<U, F>(&self, executor: &Arc<ManagedExecutor>, f: F) -> ManagedFuture<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.chain(executor, move |outcome| outcome.map(f))
    }

    /// Consume a successful value; a failure passes through untouched.
    pub fn then_accept<F>(&self, f: F) -> ManagedFuture<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.then_accept_on(&self.executor, f)
    }

    /// As [`then_accept`](Self::then_accept), on an explicit executor.
    pub fn then_accept_on<F>(&self, executor: &Arc<ManagedExecutor>, f: F) -> ManagedFuture<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.chain(executor, move |outcome| outcome.map(f))
    }

    /// Map either outcome, success or failure, to a new value.
    pub fn handle<U, F>(&self, f: F) -> ManagedFuture<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(Outcome<T>) -> U + Send + 'static,
    {
        self.handle_on(&self.executor, f)
    }

    /// As [`handle`](Self::handle), on an explicit executor.
    pub fn handle_on<U, F>(&self, executor: &Arc<ManagedExecutor>, f: F) -> ManagedFuture<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(Outcome<T>) -> U + Send + 'static,
    {
        self.chain(executor, move |outcome| Ok(f(outcome)))
    }

    /// Observe the outcome; the original outcome passes through to the
    /// returned stage untouched.
    pub fn when_complete<F>(&self, f: F) -> ManagedFuture<T>
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        self.when_complete_on(&self.executor, f)
    }

    /// As [`when_complete`](Self::when_complete), on an explicit executor.
    pub fn when_complete_on<F>(&self, executor: &Arc<ManagedExecutor>, f: F) -> ManagedFuture<T>
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        self.chain(executor, move |outcome| {
            f(&outcome);
            outcome
        })
    }

    /// Register a continuation.
    ///
    /// Context is captured here, at registration, and stored inside the
    /// dependent stage; the upstream completion only schedules the body,
    /// which the worker runs under the stored descriptor. A failure inside
    /// the body, or a rejection from the executor's pool, fails the
    /// dependent stage rather than leaving it pending.
    fn chain<U, F>(&self, executor: &Arc<ManagedExecutor>, body: F) -> ManagedFuture<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(Outcome<T>) -> Outcome<U> + Send + 'static,
    {
        let descriptor = match &self.capture_override {
            Some(capture) => capture.clone(),
            None => executor.capture_current(),
        };

        let dependent = ManagedFuture::<U> {
            core: Arc::new(StageCore {
                state: Mutex::new(StageState::Pending(Vec::new())),
            }),
            executor: executor.clone(),
            capture_override: self.capture_override.clone(),
            externally_completable: true,
        };

        let target = dependent.clone();
        let schedule_on = executor.clone();
        self.on_outcome(move |outcome| {
            let completer = target.clone();
            let submitted = schedule_on.submit_raw(move || {
                let result = catch_unwind(AssertUnwindSafe(|| {
                    let _ctx = descriptor.establish();
                    body(outcome)
                }));
                match result {
                    Ok(out) => completer.settle(out),
                    Err(payload) => completer.settle(Err(Failure::from_panic(payload.as_ref()))),
                };
            });
            if let Err(e) = submitted {
                target.settle(Err(Failure::new(e)));
            }
        });

        dependent
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, StageState<T>> {
        // A panicking callback must not wedge the stage.
        self.core
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> std::fmt::Debug for ManagedFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.core.state.lock() {
            Ok(guard) => match &*guard {
                StageState::Pending(_) => "pending",
                StageState::Done(Ok(_)) => "completed",
                StageState::Done(Err(_)) => "failed",
            },
            Err(_) => "poisoned",
        };
        f.debug_struct("ManagedFuture")
            .field("state", &state)
            .field("executor", &self.executor.name())
            .finish()
    }
}
