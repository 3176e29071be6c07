//! One-shot promise.
//!
//! A [`Fence`] is signalled exactly once and observed by any number of
//! waiters. The cache and the in-memory database use fences so that the
//! first demand for a key runs the work while every concurrent demand waits
//! for the same result.

use std::sync::Mutex;
use tokio::sync::oneshot;

enum FenceState<T> {
    Pending(Vec<oneshot::Sender<T>>),
    Done(T),
}

/// A single-assignment cell with async waiters.
pub struct Fence<T> {
    state: Mutex<FenceState<T>>,
}

impl<T: Clone> Fence<T> {
    /// Creates an unsignalled fence.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FenceState::Pending(Vec::new())),
        }
    }

    /// Returns the value without waiting, if already signalled.
    pub fn try_get(&self) -> Option<T> {
        match &*self.state.lock().expect("fence lock poisoned") {
            FenceState::Done(value) => Some(value.clone()),
            FenceState::Pending(_) => None,
        }
    }

    /// Resolves the fence, waking all current and future waiters.
    ///
    /// Signalling twice is a logic error; the second value is dropped.
    pub fn signal(&self, value: T) {
        let waiters = {
            let mut state = self.state.lock().expect("fence lock poisoned");
            match std::mem::replace(&mut *state, FenceState::Done(value.clone())) {
                FenceState::Pending(waiters) => waiters,
                FenceState::Done(old) => {
                    debug_assert!(false, "fence signalled twice");
                    *state = FenceState::Done(old);
                    return;
                }
            }
        };
        for tx in waiters {
            // A waiter that gave up is fine to ignore.
            let _ = tx.send(value.clone());
        }
    }

    /// Waits for the fence to be signalled.
    pub async fn wait(&self) -> T {
        let rx = {
            let mut state = self.state.lock().expect("fence lock poisoned");
            match &mut *state {
                FenceState::Done(value) => return value.clone(),
                FenceState::Pending(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
            }
        };
        rx.await.expect("fence dropped without being signalled")
    }
}

impl<T: Clone> Default for Fence<T> {
    fn default() -> Self {
        Self::new()
    }
}
