//! Lock-free queue of tagged entries, many producers and one consumer.
//!
//! Exchange-based intrusive design: producers atomically swap themselves onto the tail and then
//! link the previous node forward, the single consumer chases the links from the head. A node
//! whose forward link has not been stored yet makes the queue look momentarily empty; callers
//! pair every push with a resumption signal raised after the link is complete, so the consumer
//! always gets another look.

use std::{
    cell::UnsafeCell,
    ptr::null_mut,
    sync::atomic::{
        AtomicPtr,
        Ordering::{AcqRel, Acquire, Release},
    },
};

struct QNode<T> {
    next: AtomicPtr<QNode<T>>,
    // None only for the stub node the head rests on.
    val: Option<T>,
}

/// Many-producer single-consumer queue
pub struct EntryQueue<T> {
    // producer end. always points at the most recently pushed node (or the stub).
    tail: AtomicPtr<QNode<T>>,
    // consumer end. only the single consumer touches this.
    head: UnsafeCell<*mut QNode<T>>,
}

impl<T> EntryQueue<T> {
    /// Construct empty.
    pub fn new() -> Self {
        let stub = Box::into_raw(Box::new(QNode { next: AtomicPtr::new(null_mut()), val: None }));
        EntryQueue {
            tail: AtomicPtr::new(stub),
            head: UnsafeCell::new(stub),
        }
    }

    /// Push to the back of the queue. Callable from any number of producers.
    pub fn push(&self, val: T) {
        let node = Box::into_raw(Box::new(QNode {
            next: AtomicPtr::new(null_mut()),
            val: Some(val),
        }));
        let prev = self.tail.swap(node, AcqRel);
        // safety: prev was published by a prior push (or is the stub) and nodes are only freed
        // by the consumer after it has advanced past them, which it cannot do before this link
        // is stored.
        unsafe { (*prev).next.store(node, Release) };
    }

    /// Pop from the front of the queue.
    ///
    /// UB if:
    ///
    /// - called concurrently from more than one thread.
    pub unsafe fn pop(&self) -> Option<T> {
        let head = *self.head.get();
        let next = (*head).next.load(Acquire);
        if next.is_null() {
            return None;
        }
        let val = (*next).val.take();
        debug_assert!(val.is_some(), "non-stub node without a value (internal bug)");
        drop(Box::from_raw(head));
        *self.head.get() = next;
        val
    }
}

impl<T> Default for EntryQueue<T> {
    fn default() -> Self {
        EntryQueue::new()
    }
}

impl<T> Drop for EntryQueue<T> {
    fn drop(&mut self) {
        unsafe {
            let mut next = *self.head.get();
            while !next.is_null() {
                let node = Box::from_raw(next);
                next = node.next.load(Acquire);
            }
        }
    }
}

unsafe impl<T: Send> Send for EntryQueue<T> {}
unsafe impl<T: Send> Sync for EntryQueue<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{collections::HashSet, sync::Arc, thread};

    #[test]
    fn fifo_single_thread() {
        let queue = EntryQueue::new();
        for i in 0..100 {
            queue.push(i);
        }
        for i in 0..100 {
            assert_eq!(unsafe { queue.pop() }, Some(i));
        }
        assert_eq!(unsafe { queue.pop() }, None);
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 25_000;

        let queue = Arc::new(EntryQueue::new());
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.push(p * PER_PRODUCER + i);
                    }
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut last_per_producer = vec![None; PRODUCERS as usize];
        while seen.len() < (PRODUCERS * PER_PRODUCER) as usize {
            if let Some(val) = unsafe { queue.pop() } {
                assert!(seen.insert(val), "duplicate entry {}", val);
                // per-producer order is preserved even though producers interleave.
                let p = (val / PER_PRODUCER) as usize;
                if let Some(prev) = last_per_producer[p] {
                    assert!(val > prev);
                }
                last_per_producer[p] = Some(val);
            } else {
                thread::yield_now();
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(unsafe { queue.pop() }, None);
    }

    #[test]
    fn unconsumed_entries_are_dropped_with_the_queue() {
        let val = Arc::new(());
        {
            let queue = EntryQueue::new();
            for _ in 0..10 {
                queue.push(Arc::clone(&val));
            }
            assert!(unsafe { queue.pop() }.is_some());
        }
        assert_eq!(Arc::strong_count(&val), 1);
    }
}
