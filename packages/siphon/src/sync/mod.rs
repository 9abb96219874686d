//! Shared concurrency primitives underlying the combinator engine.

mod atomic_slot;
mod cancel_latch;
mod entry_queue;
mod error_ledger;
mod resume_signal;
mod spsc_ring;

pub use self::{
    atomic_slot::{AtomicSlot, SlotToken},
    cancel_latch::{Cancel, CancelLatch, Replace},
    entry_queue::EntryQueue,
    error_ledger::{ErrorLedger, SealResult},
    resume_signal::{ResumeSignal, Wait},
    spsc_ring::{spsc_ring, RingConsumer, RingProducer},
};
