//! Completion barrier for fan-out work.
//!
//! A `CompletionBarrier` is a cloneable handle. Every unit of work holds a
//! clone; when the last clone is dropped the registered callbacks run once, in
//! registration order, on whichever thread dropped it.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
pub struct CompletionBarrier {
    inner: Arc<Inner>,
}

struct Inner {
    callbacks: Mutex<Vec<Callback>>,
}

impl CompletionBarrier {
    pub fn new<F>(on_complete: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let barrier = Self::empty();
        barrier.on_complete(on_complete);
        barrier
    }

    /// A barrier with no callbacks yet.
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(Inner {
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Barrier plus a receiver that resolves once every handle is dropped.
    pub fn with_signal() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let barrier = Self::new(move || {
            let _ = tx.send(());
        });
        (barrier, rx)
    }

    /// Run `f` once every holder has released the barrier.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut guard = match self.inner.callbacks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push(Box::new(f));
    }

    /// Number of live handles, including this one.
    pub fn pending(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let callbacks = match self.callbacks.get_mut() {
            Ok(callbacks) => std::mem::take(callbacks),
            Err(poisoned) => std::mem::take(poisoned.into_inner()),
        };
        for callback in callbacks {
            callback();
        }
    }
}

impl fmt::Debug for CompletionBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionBarrier")
            .field("pending", &self.pending())
            .finish()
    }
}
