//! The asynchronous outcome bound to one invocation.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

use crate::error::CallError;

type Outcome = Result<Value, CallError>;

/// A listener run once, synchronously, on whichever thread completes the
/// result.
pub type CompletionHook = Box<dyn FnOnce(&Outcome) + Send + 'static>;

enum State {
    Pending(Vec<CompletionHook>),
    Done(Outcome),
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

/// Asynchronous outcome bound to one invocation.
///
/// Starts `pending` and transitions to `completed-value` or
/// `completed-error` exactly once; [`RpcResult::when_complete`] registers a
/// hook that fires immediately if the result is already done, or is stored
/// and fired by whoever calls [`Completer::complete`].
#[derive(Clone)]
pub struct RpcResult {
    inner: Arc<Inner>,
}

/// The write side of a pending [`RpcResult`], handed to whatever will
/// eventually produce the outcome (a terminal invoker, a transport
/// callback, a test harness simulating out-of-band completion).
pub struct Completer {
    inner: Arc<Inner>,
}

impl RpcResult {
    /// An already-completed, successful result.
    #[must_use]
    pub fn completed_ok(value: Value) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Done(Ok(value))),
                notify: Notify::new(),
            }),
        }
    }

    /// An already-completed, failed result.
    #[must_use]
    pub fn completed_err(err: CallError) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Done(Err(err))),
                notify: Notify::new(),
            }),
        }
    }

    /// A not-yet-completed result, paired with the [`Completer`] that will
    /// resolve it.
    #[must_use]
    pub fn pending() -> (Self, Completer) {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::Pending(Vec::new())),
            notify: Notify::new(),
        });
        (
            Self {
                inner: Arc::clone(&inner),
            },
            Completer { inner },
        )
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Done(_))
    }

    /// Register a completion hook. Runs immediately (on the calling thread)
    /// if the result is already done; otherwise stored and run later on
    /// whichever thread calls [`Completer::complete`].
    pub fn when_complete(&self, hook: CompletionHook) {
        let mut state = self.inner.state.lock();
        match &mut *state {
            State::Done(outcome) => {
                let outcome = outcome.clone();
                drop(state);
                hook(&outcome);
            }
            State::Pending(hooks) => hooks.push(hook),
        }
    }

    /// Wait for completion and return the outcome. Used by callers that
    /// want to block on the final value rather than register a hook.
    pub async fn value(&self) -> Outcome {
        loop {
            {
                let state = self.inner.state.lock();
                if let State::Done(outcome) = &*state {
                    return outcome.clone();
                }
            }
            self.inner.notify.notified().await;
        }
    }
}

impl Completer {
    /// Resolve the paired `RpcResult`. A second call is a silent no-op —
    /// the state machine transitions pending → completed-* exactly once.
    pub fn complete(self, outcome: Outcome) {
        let hooks = {
            let mut state = self.inner.state.lock();
            if matches!(&*state, State::Done(_)) {
                return;
            }
            match std::mem::replace(&mut *state, State::Done(outcome.clone())) {
                State::Pending(hooks) => hooks,
                State::Done(_) => unreachable!("checked above"),
            }
        };
        for hook in hooks {
            hook(&outcome);
        }
        self.inner.notify.notify_waiters();
    }
}
