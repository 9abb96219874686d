//! Single-waiter resumption signal.

use futures::task::AtomicWaker;
use std::{
    future::Future,
    pin::Pin,
    sync::atomic::{
        AtomicBool,
        Ordering::{AcqRel, Release},
    },
    task::{Context, Poll},
};

/// Single-waiter suspension point
///
/// At most one task may wait on a signal at a time; any number of tasks may raise it. Raising an
/// already-raised signal collapses into one resumption, and a signal raised while nobody is
/// waiting is consumed by the next waiter instead of being lost. A consumed signal re-arms: the
/// waiter is never resumed twice for a single `signal` call.
///
/// State machine: `notified` is the pending-resumption flag; the waker slot holds the current
/// waiter. `signal` sets the flag and wakes whatever waker is registered; `poll_wait` consumes
/// the flag if set, otherwise registers the caller's waker and re-checks the flag to close the
/// race with a concurrent `signal`.
#[derive(Default)]
pub struct ResumeSignal {
    notified: AtomicBool,
    waker: AtomicWaker,
}

impl ResumeSignal {
    /// Construct an un-raised signal with no waiter.
    pub fn new() -> Self {
        ResumeSignal {
            notified: AtomicBool::new(false),
            waker: AtomicWaker::new(),
        }
    }

    /// Raise the signal, resuming the current waiter if there is one.
    ///
    /// Safe to call redundantly and from any number of tasks.
    pub fn signal(&self) {
        self.notified.store(true, Release);
        self.waker.wake();
    }

    /// Poll-flavored wait: consume a pending resumption, or arm the caller's waker.
    pub fn poll_wait(&self, cx: &mut Context) -> Poll<()> {
        if self.notified.swap(false, AcqRel) {
            return Poll::Ready(());
        }
        self.waker.register(cx.waker());
        // a signal may have landed between the first check and registering the waker; re-check
        // so that resumption is not lost.
        if self.notified.swap(false, AcqRel) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }

    /// Future-flavored wait. See [`poll_wait`](Self::poll_wait).
    pub fn wait(&self) -> Wait<'_> {
        Wait(self)
    }
}

/// Future for [`ResumeSignal::wait`]
pub struct Wait<'a>(&'a ResumeSignal);

impl Future for Wait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        self.0.poll_wait(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    #[tokio::test]
    async fn signal_before_wait_resumes_immediately() {
        let signal = ResumeSignal::new();
        signal.signal();
        signal.wait().await;
    }

    #[tokio::test]
    async fn redundant_signals_collapse() {
        let signal = ResumeSignal::new();
        signal.signal();
        signal.signal();
        signal.signal();
        signal.wait().await;

        // the collapsed resumption was consumed above; a fresh wait must pend until re-raised.
        let signal = Arc::new(signal);
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.wait().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        signal.signal();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn waiter_is_resumed_across_tasks() {
        let signal = Arc::new(ResumeSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move {
                signal.wait().await;
                signal.wait().await;
            })
        };
        signal.signal();
        tokio::task::yield_now().await;
        signal.signal();
        waiter.await.unwrap();
    }
}
