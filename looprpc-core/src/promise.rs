use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::status::RpcError;

/// Outcome of a settled promise.
pub type Settled<T> = std::result::Result<T, RpcError>;

type Reaction<T> = Box<dyn FnOnce(&Settled<T>) + Send + 'static>;

enum State<T> {
    Pending(Vec<Reaction<T>>),
    Settled(Arc<Settled<T>>),
}

struct Shared<T> {
    state: Mutex<State<T>>,
    cv: Condvar,
}

/// The script-visible half of an asynchronous result.
///
/// Reactions registered with [`Promise::on_settle`] run wherever settlement
/// happens; the engine's convention is that settlement is always performed
/// from a loop-submitted task, so reactions execute on the loop thread. The
/// one exception is the submit-failure path, where the worker settles
/// directly: the result is buffered here and observable via `wait`, matching
/// the "rejection is buffered inside the promise state machine" contract.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

/// The settling half. Thread-safe and first-settle-wins; later settles are
/// ignored, which is what makes it safe to invoke even when the runtime has
/// already gone away.
pub struct Completer<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Promise<T> {
    pub fn new() -> (Promise<T>, Completer<T>) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::Pending(Vec::new())),
            cv: Condvar::new(),
        });
        (
            Promise {
                shared: Arc::clone(&shared),
            },
            Completer { shared },
        )
    }

    /// Register a reaction. Runs immediately (on the caller's thread) when
    /// the promise is already settled.
    pub fn on_settle(&self, f: impl FnOnce(&Settled<T>) + Send + 'static) {
        let settled = {
            let mut state = self.shared.lock();
            match &mut *state {
                State::Pending(reactions) => {
                    reactions.push(Box::new(f));
                    return;
                }
                State::Settled(result) => Arc::clone(result),
            }
        };
        f(&settled);
    }

    /// Non-blocking check, for scripts polling a settled promise.
    pub fn try_result(&self) -> Option<Settled<T>>
    where
        T: Clone,
    {
        match &*self.shared.lock() {
            State::Pending(_) => None,
            State::Settled(result) => Some((**result).clone()),
        }
    }

    /// Block until settled or the timeout elapses. Test and embedder
    /// convenience; never call this from the loop thread.
    pub fn wait(&self, timeout: Duration) -> Option<Settled<T>>
    where
        T: Clone,
    {
        let mut state = self.shared.lock();
        loop {
            if let State::Settled(result) = &*state {
                return Some((**result).clone());
            }
            let (next, wait) = self
                .shared
                .cv
                .wait_timeout(state, timeout)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state = next;
            if wait.timed_out() {
                if let State::Settled(result) = &*state {
                    return Some((**result).clone());
                }
                return None;
            }
        }
    }
}

impl<T> Shared<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<T: Send + 'static> Completer<T> {
    pub fn resolve(&self, value: T) {
        self.settle(Ok(value));
    }

    pub fn reject(&self, error: RpcError) {
        self.settle(Err(error));
    }

    pub fn settle(&self, result: Settled<T>) {
        let result = Arc::new(result);
        let reactions = {
            let mut state = self.shared.lock();
            match &mut *state {
                State::Pending(reactions) => {
                    let reactions = std::mem::take(reactions);
                    *state = State::Settled(Arc::clone(&result));
                    reactions
                }
                State::Settled(_) => return,
            }
        };
        self.shared.cv.notify_all();
        for reaction in reactions {
            reaction(&result);
        }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Clone for Completer<T> {
    fn clone(&self) -> Self {
        Completer {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// One-shot latch: `first()` is true exactly once.
#[derive(Default)]
pub struct OnceGuard(AtomicBool);

impl OnceGuard {
    pub fn new() -> OnceGuard {
        OnceGuard(AtomicBool::new(false))
    }

    pub fn first(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }
}
