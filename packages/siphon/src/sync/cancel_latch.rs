//! Replace-or-cancel latch guarding a cancellation handle.

use std::sync::{
    atomic::{
        AtomicPtr,
        Ordering::{AcqRel, Acquire},
    },
    Arc,
};

/// Capability of being cancelled exactly once
///
/// Implementations must tolerate redundant `cancel` calls.
pub trait Cancel {
    fn cancel(&self);
}

// in-band discriminant for the cancelled terminal state. never dereferenced.
fn cancelled_ptr<T>() -> *mut T {
    1 as *mut T
}

/// Outcome of [`CancelLatch::replace`]
pub enum Replace<T> {
    /// The new handle was installed; the previously installed handle, if any, is returned to
    /// the caller (not cancelled by the latch)
    Installed(Option<Arc<T>>),
    /// The latch was already cancelled; the new handle has itself been cancelled
    Cancelled,
}

/// Atomic `empty | live handle | cancelled` cell
///
/// `replace` installs a new handle unless the latch has been cancelled, in which case the
/// incoming handle is cancelled immediately — the cancelled state is sticky and applies to
/// handles arriving during as well as after the transition. `cancel` swaps in the terminal
/// state and cancels the previously installed handle exactly once.
///
/// One task replaces, any task may cancel; concurrent replacers are not supported.
pub struct CancelLatch<T: Cancel> {
    state: AtomicPtr<T>,
}

impl<T: Cancel> CancelLatch<T> {
    /// Construct an empty, un-cancelled latch.
    pub fn new() -> Self {
        CancelLatch { state: AtomicPtr::new(std::ptr::null_mut()) }
    }

    /// Whether the latch has reached the cancelled terminal state.
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Acquire) == cancelled_ptr()
    }

    /// Install a new handle, or cancel it if the latch is already cancelled.
    pub fn replace(&self, handle: Arc<T>) -> Replace<T> {
        let raw = Arc::into_raw(handle) as *mut T;
        let mut cur = self.state.load(Acquire);
        loop {
            if cur == cancelled_ptr() {
                // safety: raw was produced by into_raw above and never published.
                let handle = unsafe { Arc::from_raw(raw) };
                handle.cancel();
                return Replace::Cancelled;
            }
            match self.state.compare_exchange(cur, raw, AcqRel, Acquire) {
                Ok(prev) => {
                    let prev = if prev.is_null() {
                        None
                    } else {
                        // safety: a non-null, non-sentinel state is always a pointer published
                        // by a prior into_raw, and the successful exchange transferred its
                        // ownership to us.
                        Some(unsafe { Arc::from_raw(prev) })
                    };
                    return Replace::Installed(prev);
                }
                // the only other writer is cancel(), so a failed exchange means the latch just
                // transitioned to cancelled.
                Err(observed) => cur = observed,
            }
        }
    }

    /// Transition to the cancelled terminal state, cancelling the installed handle if any.
    pub fn cancel(&self) {
        let prev = self.state.swap(cancelled_ptr(), AcqRel);
        if prev != cancelled_ptr() && !prev.is_null() {
            // safety: ownership of the published pointer transferred to us by the swap.
            let handle = unsafe { Arc::from_raw(prev) };
            handle.cancel();
        }
    }
}

impl<T: Cancel> Default for CancelLatch<T> {
    fn default() -> Self {
        CancelLatch::new()
    }
}

impl<T: Cancel> Drop for CancelLatch<T> {
    fn drop(&mut self) {
        // a latch dropped with a live handle cancels it, so teardown paths that forget an
        // explicit cancel still release the handle.
        self.cancel();
    }
}

unsafe impl<T: Cancel + Send + Sync> Send for CancelLatch<T> {}
unsafe impl<T: Cancel + Send + Sync> Sync for CancelLatch<T> {}
