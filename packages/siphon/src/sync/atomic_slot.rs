//! Low-level concurrency utility.

use std::sync::atomic::{
    AtomicPtr,
    Ordering::{AcqRel, Acquire},
};

/// Like an atomic `Option<T>` supporting swap-in, take, and targeted take
///
/// Values live in their own heap cells, so arbitrary `T` can be exchanged with a single pointer
/// operation. The thread that swaps a cell out of the slot claims ownership of it.
pub struct AtomicSlot<T> {
    ptr: AtomicPtr<T>,
}

/// Identity of one value installed by [`AtomicSlot::put_tracked`]
///
/// Lets the holder later take exactly that value back out, and nothing else, via
/// [`AtomicSlot::take_exact`].
pub struct SlotToken<T>(*mut T);

impl<T> Clone for SlotToken<T> {
    fn clone(&self) -> Self {
        SlotToken(self.0)
    }
}

impl<T> Copy for SlotToken<T> {}

// tokens are only ever compared against the slot, never dereferenced.
unsafe impl<T> Send for SlotToken<T> {}

impl<T> AtomicSlot<T> {
    /// Construct without a value.
    pub fn empty() -> Self {
        AtomicSlot { ptr: AtomicPtr::new(std::ptr::null_mut()) }
    }

    /// Construct with a value.
    pub fn with(val: T) -> Self {
        AtomicSlot { ptr: AtomicPtr::new(Box::into_raw(Box::new(val))) }
    }

    /// Swap a value in, returning the displaced value if there was one.
    pub fn put(&self, val: T) -> Option<T> {
        let raw = Box::into_raw(Box::new(val));
        self.exchange(raw)
    }

    /// Swap a value in, returning its identity token alongside the displaced value.
    pub fn put_tracked(&self, val: T) -> (SlotToken<T>, Option<T>) {
        let raw = Box::into_raw(Box::new(val));
        let displaced = self.exchange(raw);
        (SlotToken(raw), displaced)
    }

    /// Atomically take the value, if any.
    pub fn take(&self) -> Option<T> {
        self.exchange(std::ptr::null_mut())
    }

    /// Whether the slot currently holds nothing.
    pub fn is_empty(&self) -> bool {
        self.ptr.load(Acquire).is_null()
    }

    /// Take the value only if it is still the exact one identified by `token`.
    ///
    /// Returns `None` if the slot holds nothing, or holds a value installed after the token's.
    /// The token is only compared, never dereferenced, so a stale token is harmless.
    pub fn take_exact(&self, token: SlotToken<T>) -> Option<T> {
        match self.ptr.compare_exchange(token.0, std::ptr::null_mut(), AcqRel, Acquire) {
            // safety: the exchange succeeded, so the slot held exactly the published cell the
            // token identifies, and ownership of it transferred to us.
            Ok(raw) => Some(*unsafe { Box::from_raw(raw) }),
            Err(_) => None,
        }
    }

    // swap raw in, box the displaced pointer back up.
    fn exchange(&self, raw: *mut T) -> Option<T> {
        let prev = self.ptr.swap(raw, AcqRel);
        if prev.is_null() {
            None
        } else {
            // safety: non-null slot contents are always pointers published by a prior
            // Box::into_raw, and the swap transferred ownership to us.
            Some(*unsafe { Box::from_raw(prev) })
        }
    }
}

impl<T> Drop for AtomicSlot<T> {
    fn drop(&mut self) {
        // make sure the value gets dropped if not yet taken
        drop(self.take());
    }
}

unsafe impl<T: Send> Send for AtomicSlot<T> {}
unsafe impl<T: Send> Sync for AtomicSlot<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    #[test]
    fn put_take_roundtrip() {
        let slot = AtomicSlot::empty();
        assert!(slot.take().is_none());
        assert!(slot.put(1).is_none());
        assert_eq!(slot.put(2), Some(1));
        assert_eq!(slot.take(), Some(2));
        assert!(slot.take().is_none());
    }

    #[test]
    fn take_exact_only_matches_its_own_value() {
        let slot = AtomicSlot::empty();
        let (token_a, _) = slot.put_tracked("a");
        let (token_b, displaced) = slot.put_tracked("b");
        assert_eq!(displaced, Some("a"));

        // token_a's value was displaced; its targeted take must miss and leave "b" in place.
        assert!(slot.take_exact(token_a).is_none());
        assert_eq!(slot.take_exact(token_b), Some("b"));
        assert!(slot.take_exact(token_b).is_none());
    }

    #[test]
    fn drop_releases_unclaimed_value() {
        let val = Arc::new(());
        {
            let slot = AtomicSlot::empty();
            slot.put(Arc::clone(&val));
            assert_eq!(Arc::strong_count(&val), 2);
        }
        assert_eq!(Arc::strong_count(&val), 1);
    }

    #[test]
    fn with_starts_occupied() {
        let slot = AtomicSlot::with(7u32);
        assert_eq!(slot.take(), Some(7));
    }
}
