//! Growable ring buffer for one producer and one consumer.
//!
//! A linked list of fixed-capacity segments: the producer fills slots towards the back and links
//! fresh segments as needed, the consumer drains from the front and recycles exhausted segments.
//! Push and pop are amortized O(1) and wait-free; a segment-sized pool of one spare segment
//! prevents repeated allocation when the queue length fluctuates around a segment boundary.

use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    ptr::null_mut,
    sync::{
        atomic::{
            AtomicBool, AtomicPtr,
            Ordering::{AcqRel, Acquire, Release},
        },
        Arc,
    },
};

// segment capacity in elems.
const SEG_CAP: usize = 32;

// storage for one elem. ready is the publication flag: the producer writes val then sets ready,
// the consumer observes ready then reads val and clears ready.
struct Slot<T> {
    ready: AtomicBool,
    val: UnsafeCell<MaybeUninit<T>>,
}

// heap allocated segment of the queue.
struct Seg<T> {
    slots: [Slot<T>; SEG_CAP],
    // next segment towards the back, linked by the producer.
    next: AtomicPtr<Seg<T>>,
}

impl<T> Seg<T> {
    fn alloc() -> *mut Seg<T> {
        Box::into_raw(Box::new(Seg {
            slots: std::array::from_fn(|_| Slot {
                ready: AtomicBool::new(false),
                val: UnsafeCell::new(MaybeUninit::uninit()),
            }),
            next: AtomicPtr::new(null_mut()),
        }))
    }

    // drop initialized slots and free the segment.
    //
    // UB if any handle can still reach the segment.
    unsafe fn dealloc(seg: *mut Seg<T>) {
        let boxed = Box::from_raw(seg);
        for slot in &boxed.slots {
            if slot.ready.load(Acquire) {
                (*slot.val.get()).assume_init_drop();
            }
        }
    }
}

// state reachable from both handles: the consumer's current segment (for drop-time reclamation
// of everything still linked) and the one-segment spare pool.
struct RingShared<T> {
    head: AtomicPtr<Seg<T>>,
    spare: AtomicPtr<Seg<T>>,
}

impl<T> Drop for RingShared<T> {
    fn drop(&mut self) {
        unsafe {
            let spare = self.spare.load(Acquire);
            if !spare.is_null() {
                Seg::dealloc(spare);
            }
            let mut next = self.head.load(Acquire);
            while !next.is_null() {
                let seg = next;
                next = (*seg).next.load(Acquire);
                Seg::dealloc(seg);
            }
        }
    }
}

unsafe impl<T: Send> Send for RingShared<T> {}
unsafe impl<T: Send> Sync for RingShared<T> {}

/// Producer handle of a [`spsc_ring`]
pub struct RingProducer<T> {
    shared: Arc<RingShared<T>>,
    tail: *mut Seg<T>,
    idx: usize,
}

/// Consumer handle of a [`spsc_ring`]
pub struct RingConsumer<T> {
    shared: Arc<RingShared<T>>,
    head: *mut Seg<T>,
    idx: usize,
}

unsafe impl<T: Send> Send for RingProducer<T> {}
unsafe impl<T: Send> Send for RingConsumer<T> {}

// all mutation goes through &mut self; a shared reference exposes nothing.
unsafe impl<T: Send> Sync for RingProducer<T> {}
unsafe impl<T: Send> Sync for RingConsumer<T> {}

/// Construct an empty ring, returning its two handles.
pub fn spsc_ring<T>() -> (RingProducer<T>, RingConsumer<T>) {
    let seg = Seg::alloc();
    let shared = Arc::new(RingShared {
        head: AtomicPtr::new(seg),
        spare: AtomicPtr::new(null_mut()),
    });
    (
        RingProducer { shared: Arc::clone(&shared), tail: seg, idx: 0 },
        RingConsumer { shared, head: seg, idx: 0 },
    )
}

impl<T> RingProducer<T> {
    /// Push to the back of the queue.
    pub fn push(&mut self, val: T) {
        unsafe {
            if self.idx == SEG_CAP {
                // current segment full: pull the spare or allocate, then link it. linking is the
                // producer's final access to the old segment; once the consumer observes the
                // link it may recycle the old segment at will.
                let new = self.shared.spare.swap(null_mut(), AcqRel);
                let new = if new.is_null() { Seg::alloc() } else { new };
                (*self.tail).next.store(new, Release);
                self.tail = new;
                self.idx = 0;
            }
            let slot = &(*self.tail).slots[self.idx];
            (*slot.val.get()).write(val);
            slot.ready.store(true, Release);
            self.idx += 1;
        }
    }
}

impl<T> RingConsumer<T> {
    /// Pop from the front of the queue.
    pub fn pop(&mut self) -> Option<T> {
        unsafe {
            loop {
                if self.idx == SEG_CAP {
                    // segment exhausted: advance to the next if the producer has linked one.
                    let next = (*self.head).next.load(Acquire);
                    if next.is_null() {
                        return None;
                    }
                    let old = self.head;
                    self.head = next;
                    self.idx = 0;
                    self.shared.head.store(next, Release);
                    // recycle the exhausted segment into the spare pool, or free it if the pool
                    // is occupied. every slot was consumed, so only the link needs resetting.
                    (*old).next.store(null_mut(), Release);
                    if self
                        .shared
                        .spare
                        .compare_exchange(null_mut(), old, AcqRel, Acquire)
                        .is_err()
                    {
                        Seg::dealloc(old);
                    }
                    continue;
                }
                let slot = &(*self.head).slots[self.idx];
                if !slot.ready.load(Acquire) {
                    return None;
                }
                let val = (*slot.val.get()).assume_init_read();
                slot.ready.store(false, Release);
                self.idx += 1;
                return Some(val);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::prelude::*;
    use rand_pcg::Pcg32;
    use std::{collections::VecDeque, thread};

    fn new_rng() -> impl Rng {
        Pcg32::from_seed(0xfeedfacefeedfacefeedfacefeedfaceu128.to_le_bytes())
    }

    #[test]
    fn vecdeque_equivalence() {
        let mut rng = new_rng();
        for _ in 0..50 {
            let mut model = VecDeque::new();
            let (mut tx, mut rx) = spsc_ring::<u32>();
            for i in 0u32..10_000 {
                if rng.gen_ratio(52, 100) {
                    model.push_back(i);
                    tx.push(i);
                } else {
                    assert_eq!(rx.pop(), model.pop_front());
                }
            }
            while let Some(expect) = model.pop_front() {
                assert_eq!(rx.pop(), Some(expect));
            }
            assert_eq!(rx.pop(), None);
        }
    }

    #[test]
    fn cross_thread_fifo() {
        const N: u64 = 100_000;
        let (mut tx, mut rx) = spsc_ring::<u64>();
        let producer = thread::spawn(move || {
            for i in 0..N {
                tx.push(i);
            }
        });
        let mut expect = 0;
        while expect < N {
            if let Some(got) = rx.pop() {
                assert_eq!(got, expect);
                expect += 1;
            } else {
                thread::yield_now();
            }
        }
        assert_eq!(rx.pop(), None);
        producer.join().unwrap();
    }

    #[test]
    fn unconsumed_elems_are_dropped_with_the_ring() {
        let val = Arc::new(());
        {
            let (mut tx, rx) = spsc_ring();
            for _ in 0..(SEG_CAP * 3) {
                tx.push(Arc::clone(&val));
            }
            drop(tx);
            drop(rx);
        }
        assert_eq!(Arc::strong_count(&val), 1);
    }

    #[test]
    fn consumer_drains_after_producer_drops() {
        let (mut tx, mut rx) = spsc_ring::<usize>();
        for i in 0..(SEG_CAP * 2 + 5) {
            tx.push(i);
        }
        drop(tx);
        for i in 0..(SEG_CAP * 2 + 5) {
            assert_eq!(rx.pop(), Some(i));
        }
        assert_eq!(rx.pop(), None);
    }
}
