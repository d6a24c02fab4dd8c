//! Job cancellation infrastructure
//!
//! A [`CancellationToken`] travels with every job submitted to the pool.
//! Cancelling it while the job is still queued removes the job from the
//! queue without it ever occupying a worker; once a job is running, the
//! routine observes the token through its [`JobContext`] and stops
//! cooperatively.
//!
//! Tokens can be organised hierarchically: cancelling a parent cancels all
//! of its children, which is how a whole dashboard request can abandon the
//! event logs it fanned out.
//!
//! # Example
//!
//! ```rust
//! use agent_log_workers::CancellationToken;
//!
//! let request = CancellationToken::new();
//! let first_log = request.child();
//! let second_log = request.child();
//!
//! request.cancel();
//!
//! assert!(first_log.is_cancelled());
//! assert!(second_log.is_cancelled());
//! ```
//!
//! [`JobContext`]: crate::core::JobContext

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

static NEXT_CALLBACK_ID: AtomicUsize = AtomicUsize::new(1);

fn next_callback_id() -> usize {
    NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Reason for cancellation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancellationReason {
    /// Explicitly cancelled via `cancel()`
    Manual,
    /// Cancelled because the parent token was cancelled
    ParentCancelled,
    /// Cancelled due to an error condition
    Error(String),
    /// Custom cancellation reason
    Custom(String),
}

impl std::fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancellationReason::Manual => write!(f, "manually cancelled"),
            CancellationReason::ParentCancelled => write!(f, "parent was cancelled"),
            CancellationReason::Error(msg) => write!(f, "error: {}", msg),
            CancellationReason::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

struct StoredCallback {
    id: usize,
    callback: Box<dyn FnOnce() + Send + Sync>,
}

struct CancellationTokenInner {
    cancelled: AtomicBool,
    /// Weak references so dropped children are not kept alive
    children: RwLock<Vec<Weak<CancellationTokenInner>>>,
    callbacks: Mutex<Vec<StoredCallback>>,
    reason: RwLock<Option<CancellationReason>>,
}

impl CancellationTokenInner {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            children: RwLock::new(Vec::new()),
            callbacks: Mutex::new(Vec::new()),
            reason: RwLock::new(None),
        }
    }
}

/// A thread-safe cancellation token shared between a job and its submitter
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<CancellationTokenInner>,
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

impl CancellationToken {
    /// Create a new cancellation token (not cancelled)
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancellationTokenInner::new()),
        }
    }

    /// Creates a child token linked to this parent
    ///
    /// If the parent is already cancelled the child starts cancelled.
    pub fn child(&self) -> Self {
        let child = CancellationToken {
            inner: Arc::new(CancellationTokenInner::new()),
        };

        {
            let mut children = self.inner.children.write();
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }

        if self.is_cancelled() {
            child.cancel_with_reason(CancellationReason::ParentCancelled);
        }

        child
    }

    /// Cancel this token with reason [`CancellationReason::Manual`]
    ///
    /// Idempotent; only the first call sets the reason.
    pub fn cancel(&self) {
        self.cancel_with_reason(CancellationReason::Manual);
    }

    /// Cancel this token with a specific reason
    ///
    /// Runs registered callbacks (outside of any internal lock), then
    /// cancels every live child.
    pub fn cancel_with_reason(&self, reason: CancellationReason) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        *self.inner.reason.write() = Some(reason);

        let callbacks: Vec<_> = self.inner.callbacks.lock().drain(..).collect();
        for stored in callbacks {
            (stored.callback)();
        }

        let children: Vec<_> = self
            .inner
            .children
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for child_inner in children {
            CancellationToken { inner: child_inner }
                .cancel_with_reason(CancellationReason::ParentCancelled);
        }
    }

    /// Check if this token has been cancelled
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Returns the cancellation reason (if cancelled)
    pub fn reason(&self) -> Option<CancellationReason> {
        self.inner.reason.read().clone()
    }

    /// `Err(reason)` once cancelled, for use with `?`
    pub fn check(&self) -> Result<(), CancellationReason> {
        if self.is_cancelled() {
            Err(self.reason().unwrap_or(CancellationReason::Manual))
        } else {
            Ok(())
        }
    }

    /// Registers a callback to run when cancelled
    ///
    /// Returns a guard that unregisters the callback when dropped. If the
    /// token is already cancelled the callback runs immediately.
    pub fn on_cancel<F>(&self, callback: F) -> CancellationCallbackGuard
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        let id = next_callback_id();

        if self.is_cancelled() {
            callback();
        } else {
            self.inner.callbacks.lock().push(StoredCallback {
                id,
                callback: Box::new(callback),
            });
            // cancel() may have drained the list between the check and the push
            if self.is_cancelled() {
                let late = {
                    let mut callbacks = self.inner.callbacks.lock();
                    callbacks
                        .iter()
                        .position(|c| c.id == id)
                        .map(|pos| callbacks.remove(pos))
                };
                if let Some(stored) = late {
                    (stored.callback)();
                }
            }
        }

        CancellationCallbackGuard {
            token: Some(self.clone()),
            callback_id: id,
        }
    }

    /// Registers a callback that stays registered until the token is cancelled
    pub fn on_cancel_always<F>(&self, callback: F)
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.on_cancel(callback).detach();
    }

    fn remove_callback(&self, callback_id: usize) {
        self.inner.callbacks.lock().retain(|c| c.id != callback_id);
    }

    #[cfg(test)]
    fn callback_count(&self) -> usize {
        self.inner.callbacks.lock().len()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that unregisters a callback when dropped
///
/// Returned by [`CancellationToken::on_cancel()`].
pub struct CancellationCallbackGuard {
    token: Option<CancellationToken>,
    callback_id: usize,
}

impl std::fmt::Debug for CancellationCallbackGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationCallbackGuard")
            .field("callback_id", &self.callback_id)
            .field("attached", &self.token.is_some())
            .finish()
    }
}

impl Drop for CancellationCallbackGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if !token.is_cancelled() {
                token.remove_callback(self.callback_id);
            }
        }
    }
}

impl CancellationCallbackGuard {
    /// Detaches the guard so the callback stays registered after drop
    pub fn detach(mut self) {
        self.token = None;
    }
}
