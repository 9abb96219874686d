//! Lock-free multi-error accumulator with a terminal sealed state.

use crate::error::Error;
use smallvec::SmallVec;
use std::sync::atomic::{
    AtomicPtr,
    Ordering::{AcqRel, Acquire, Release},
};

// aggregate snapshot. published nodes are immutable; each node keeps a raw link to the node it
// replaced, and the whole chain is reclaimed only when the ledger is dropped, so a concurrent
// reader can never observe a freed node.
struct Node {
    errors: SmallVec<[Error; 1]>,
    prev: *mut Node,
}

// in-band discriminant for the sealed terminal state. never dereferenced.
fn sealed_ptr() -> *mut Node {
    1 as *mut Node
}

/// Outcome of [`ErrorLedger::seal`]
pub enum SealResult {
    /// This call sealed the ledger; the accumulated terminal error, if any
    Sealed(Option<Error>),
    /// The ledger was already sealed by an earlier call
    AlreadySealed,
}

/// Lock-free error accumulator
///
/// Holds `nothing | an aggregate of errors | sealed`. [`push`](Self::push) merges an error into
/// the aggregate via a CAS loop and reports whether the ledger still accepts errors;
/// [`seal`](Self::seal) irreversibly swaps in the sealed state and returns whatever was
/// accumulated, collapsed to the terminal error the consumer must surface.
///
/// A push racing a concurrent seal may lose its CAS, re-observe the sealed state, and return
/// false without the error having been merged. That narrow window is part of the contract:
/// whichever write wins the race decides the aggregate's final contents.
pub struct ErrorLedger {
    state: AtomicPtr<Node>,
    // chain head parked by the sealing thread for reclamation on drop.
    retired: AtomicPtr<Node>,
}

impl ErrorLedger {
    /// Construct an empty, unsealed ledger.
    pub fn new() -> Self {
        ErrorLedger {
            state: AtomicPtr::new(std::ptr::null_mut()),
            retired: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Whether the ledger has been sealed.
    pub fn is_sealed(&self) -> bool {
        self.state.load(Acquire) == sealed_ptr()
    }

    /// Whether any error has been accumulated so far (false once sealed).
    pub fn has_errors(&self) -> bool {
        let cur = self.state.load(Acquire);
        !cur.is_null() && cur != sealed_ptr()
    }

    /// Merge an error into the aggregate.
    ///
    /// Returns false if the ledger is sealed, in which case the error was not merged.
    pub fn push(&self, err: Error) -> bool {
        let mut cur = self.state.load(Acquire);
        loop {
            if cur == sealed_ptr() {
                return false;
            }
            let mut errors: SmallVec<[Error; 1]> = if cur.is_null() {
                SmallVec::new()
            } else {
                // safety: cur is a published node; published nodes are immutable and are only
                // reclaimed by Drop, which requires exclusive access to the ledger.
                unsafe { (*cur).errors.clone() }
            };
            errors.push(err.clone());
            let new = Box::into_raw(Box::new(Node { errors, prev: cur }));
            match self.state.compare_exchange(cur, new, AcqRel, Acquire) {
                Ok(_) => return true,
                Err(observed) => {
                    // the speculative node was never published, so it is exclusively ours.
                    drop(unsafe { Box::from_raw(new) });
                    cur = observed;
                }
            }
        }
    }

    /// Seal the ledger, returning the accumulated terminal error.
    pub fn seal(&self) -> SealResult {
        let prev = self.state.swap(sealed_ptr(), AcqRel);
        if prev == sealed_ptr() {
            return SealResult::AlreadySealed;
        }
        // park the superseded chain for drop-time reclamation. only the sealing thread reaches
        // this store.
        self.retired.store(prev, Release);
        if prev.is_null() {
            SealResult::Sealed(None)
        } else {
            // safety: published node, reclaimed only on drop.
            let errors = unsafe { (*prev).errors.clone() };
            SealResult::Sealed(Error::collapse(errors))
        }
    }
}

impl Default for ErrorLedger {
    fn default() -> Self {
        ErrorLedger::new()
    }
}

impl Drop for ErrorLedger {
    fn drop(&mut self) {
        let head = self.state.load(Acquire);
        let mut next = if head == sealed_ptr() { self.retired.load(Acquire) } else { head };
        while !next.is_null() {
            // safety: exclusive access; every published node is reachable exactly once through
            // the prev chain.
            let node = unsafe { Box::from_raw(next) };
            next = node.prev;
        }
    }
}

unsafe impl Send for ErrorLedger {}
unsafe impl Sync for ErrorLedger {}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{sync::Arc, thread};

    #[test]
    fn push_then_seal_returns_single_error() {
        let ledger = ErrorLedger::new();
        assert!(ledger.push(Error::Cancelled));
        match ledger.seal() {
            SealResult::Sealed(Some(Error::Cancelled)) => {}
            _ => panic!("expected the single pushed error"),
        }
    }

    #[test]
    fn multiple_pushes_collapse_to_aggregate() {
        let ledger = ErrorLedger::new();
        assert!(ledger.push(Error::Cancelled));
        assert!(ledger.push(Error::SingleConsumer));
        match ledger.seal() {
            SealResult::Sealed(Some(Error::Aggregate(errs))) => assert_eq!(errs.len(), 2),
            _ => panic!("expected an aggregate of two"),
        }
    }

    #[test]
    fn seal_empty_returns_none() {
        let ledger = ErrorLedger::new();
        match ledger.seal() {
            SealResult::Sealed(None) => {}
            _ => panic!("expected empty seal"),
        }
    }

    #[test]
    fn push_after_seal_is_refused_and_alters_nothing() {
        let ledger = ErrorLedger::new();
        assert!(ledger.push(Error::Cancelled));
        let first = match ledger.seal() {
            SealResult::Sealed(terminal) => terminal,
            SealResult::AlreadySealed => panic!("first seal"),
        };
        assert!(matches!(first, Some(Error::Cancelled)));
        assert!(!ledger.push(Error::SingleConsumer));
        assert!(matches!(ledger.seal(), SealResult::AlreadySealed));
    }

    #[test]
    fn seal_twice_reports_already_sealed() {
        let ledger = ErrorLedger::new();
        assert!(matches!(ledger.seal(), SealResult::Sealed(None)));
        assert!(matches!(ledger.seal(), SealResult::AlreadySealed));
        assert!(ledger.is_sealed());
    }

    #[test]
    fn concurrent_pushes_all_survive() {
        for _ in 0..50 {
            let ledger = Arc::new(ErrorLedger::new());
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let ledger = Arc::clone(&ledger);
                    thread::spawn(move || assert!(ledger.push(Error::Cancelled)))
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            match ledger.seal() {
                SealResult::Sealed(Some(Error::Aggregate(errs))) => assert_eq!(errs.len(), 4),
                _ => panic!("expected an aggregate of four"),
            }
        }
    }
}
