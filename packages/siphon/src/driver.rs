// the single-flight pull driver and the shared state every concurrent combinator hangs off.
//
// each upstream an operator consumes is wrapped by a handler: a spawned drive task that owns the
// upstream cursor outright, pulls it under a credit budget, and pushes tagged entries into the
// combinator's shared queue. the consumer-facing cursor drains that queue, applies the
// combinator's policy, and replenishes credits. disposal is requested through the driver and
// awaited through a reference count, so a combinator's dispose resolves only after every
// upstream it ever owned has been released.

use crate::{
    error::Error,
    seq::{Cursor, CursorExt, Step},
    sync::{Cancel, EntryQueue, ErrorLedger, ResumeSignal, SealResult},
};
use dashmap::DashMap;
use std::{
    sync::{
        atomic::{
            AtomicBool, AtomicUsize,
            Ordering::{AcqRel, Acquire, Relaxed, Release},
        },
        Arc,
    },
    task::{Context, Poll},
};

// ==== single-flight pull driver ====

// credit value meaning "pull forever, no replenishment needed".
const UNBOUNDED: usize = usize::MAX;

/// Outcome of [`PullDriver::try_claim`]
pub(crate) enum Claim {
    /// A credit was reserved and the cursor claimed: perform one pull
    Pull,
    /// No credits available: park until granted more
    Idle,
    /// Disposal has been requested: stop pulling and wind down
    Stop,
}

/// Coordinates one upstream cursor between its drive task and everyone else
///
/// Two counters with a documented state machine, instead of locks:
///
/// - `pulls` holds granted-but-unperformed pull credits. Any task may [`grant`](Self::grant)
///   more; the single drive task reserves one per pull. Storms of redundant grants collapse
///   into loop iterations of that one task, so the underlying pull operation is never invoked
///   twice concurrently.
/// - `guard` is zero exactly while the upstream cursor is idle. The drive task holds +1 around
///   each real pull; the first disposal request also adds +1 (latched by `stop`). A claim that
///   does not take `guard` from zero refuses to pull, and a release that does not return it to
///   zero reports that disposal arrived while the pull was outstanding — the two sides can
///   never disagree about who owns the cursor.
///
/// Only the drive task may claim and release; everything else is callable from anywhere.
pub(crate) struct PullDriver {
    pulls: AtomicUsize,
    guard: AtomicUsize,
    stop: AtomicBool,
    pub(crate) wake: ResumeSignal,
}

impl PullDriver {
    pub(crate) fn new() -> Self {
        PullDriver {
            pulls: AtomicUsize::new(0),
            guard: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            wake: ResumeSignal::new(),
        }
    }

    /// Grant `n` more pull credits and nudge the drive task.
    pub(crate) fn grant(&self, n: usize) {
        if n == 0 {
            return;
        }
        if self.pulls.load(Relaxed) != UNBOUNDED {
            self.pulls.fetch_add(n, AcqRel);
        }
        self.wake.signal();
    }

    /// Grant an inexhaustible credit budget.
    pub(crate) fn grant_unbounded(&self) {
        self.pulls.store(UNBOUNDED, Release);
        self.wake.signal();
    }

    /// Reserve a credit and claim the cursor for one pull.
    pub(crate) fn try_claim(&self) -> Claim {
        if self.stop.load(Acquire) {
            return Claim::Stop;
        }
        let mut cur = self.pulls.load(Acquire);
        loop {
            if cur == UNBOUNDED {
                break;
            }
            if cur == 0 {
                return Claim::Idle;
            }
            match self.pulls.compare_exchange_weak(cur, cur - 1, AcqRel, Acquire) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
        if self.guard.fetch_add(1, AcqRel) != 0 {
            // a disposal request claimed the cursor between the stop check and here.
            self.guard.fetch_sub(1, AcqRel);
            return Claim::Stop;
        }
        Claim::Pull
    }

    /// Release the cursor after a pull. True if disposal was requested while it was in flight.
    pub(crate) fn release(&self) -> bool {
        self.guard.fetch_sub(1, AcqRel) != 1
    }

    /// Request disposal of the upstream. Idempotent; never blocks.
    pub(crate) fn request_dispose(&self) {
        if !self.stop.swap(true, AcqRel) {
            self.guard.fetch_add(1, AcqRel);
        }
        self.wake.signal();
    }

    /// Whether disposal has been requested.
    pub(crate) fn stopping(&self) -> bool {
        self.stop.load(Acquire)
    }
}

impl Cancel for PullDriver {
    fn cancel(&self) {
        self.request_dispose();
    }
}

// ==== credit policy ====

/// Prefetch budget with low-water replenishment
///
/// A handler starts with `prefetch` credits; once the consumer has taken `prefetch -
/// prefetch / 4` items from its lane, that many credits are granted back in one batch, so the
/// producer is re-requested once per batch instead of once per item.
#[derive(Clone, Copy)]
pub(crate) struct CreditPolicy {
    prefetch: usize,
    limit: usize,
}

impl CreditPolicy {
    pub(crate) fn new(prefetch: usize) -> Self {
        debug_assert!(prefetch >= 1, "prefetch must be positive (validated by the caller)");
        CreditPolicy { prefetch, limit: (prefetch - (prefetch >> 2)).max(1) }
    }

    pub(crate) fn initial(&self, driver: &PullDriver) {
        driver.grant(self.prefetch);
    }

    /// Record one consumed item for a lane, replenishing at the low-water mark.
    pub(crate) fn consumed(&self, count: &mut usize, driver: &PullDriver) {
        *count += 1;
        if *count >= self.limit {
            *count = 0;
            driver.grant(self.limit);
        }
    }
}

// ==== tagged entries ====

/// One message from a handler to its combinator's consumer cursor
pub(crate) enum Entry<T> {
    /// A lane produced an item
    Item { lane: u64, item: T },
    /// A lane failed; no further entries will arrive from it
    Failed { lane: u64, error: Error },
    /// A lane completed; no further entries will arrive from it
    Done { lane: u64 },
    /// A structural boundary (a new lane came into existence, or a window rolled over)
    Boundary { lane: u64 },
}

// ==== shared combinator state ====

/// State shared between a combinator's consumer cursor and all of its handler tasks
pub(crate) struct Core<T> {
    /// tagged entries from every lane, in per-lane FIFO order.
    pub(crate) entries: EntryQueue<Entry<T>>,
    /// raised whenever an entry lands; waited on by the consumer cursor.
    pub(crate) consumer: ResumeSignal,
    /// pull-path failures, surfaced on the consumer's pull.
    pub(crate) errors: ErrorLedger,
    /// dispose-path failures, surfaced from the consumer's dispose.
    pub(crate) dispose_errors: ErrorLedger,
    /// upstreams that have not yet reported a terminal entry. policy-specific: combinators that
    /// track liveness differently leave it untouched.
    pub(crate) live: AtomicUsize,
    /// handlers that have not yet wound down. disposal resolves when this hits zero.
    open_refs: AtomicUsize,
    /// raised when open_refs hits zero; waited on by the disposing consumer.
    released: ResumeSignal,
    /// set once teardown begins; handlers registered after this are disposed immediately.
    torn_down: AtomicBool,
    /// drivers of the currently live handlers, by lane.
    pub(crate) lanes: DashMap<u64, Arc<PullDriver>>,
}

impl<T: Send + 'static> Core<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Core {
            entries: EntryQueue::new(),
            consumer: ResumeSignal::new(),
            errors: ErrorLedger::new(),
            dispose_errors: ErrorLedger::new(),
            live: AtomicUsize::new(0),
            open_refs: AtomicUsize::new(0),
            released: ResumeSignal::new(),
            torn_down: AtomicBool::new(false),
            lanes: DashMap::new(),
        })
    }

    /// Push an entry and wake the consumer.
    pub(crate) fn push_entry(&self, entry: Entry<T>) {
        self.entries.push(entry);
        self.consumer.signal();
    }

    /// Register a handler's driver under its lane and take a dispose reference for it.
    ///
    /// If teardown already began, the new handler is dispose-requested on the spot — its drive
    /// task will wind straight down.
    pub(crate) fn register(&self, lane: u64, driver: &Arc<PullDriver>) {
        self.open_refs.fetch_add(1, AcqRel);
        self.lanes.insert(lane, Arc::clone(driver));
        if self.torn_down.load(Acquire) {
            driver.request_dispose();
        }
    }

    /// Drop a handler's dispose reference, resuming a waiting disposer on the last one.
    pub(crate) fn release_handle(&self) {
        if self.open_refs.fetch_sub(1, AcqRel) == 1 {
            self.released.signal();
        }
    }

    /// Begin teardown: dispose-request every live handler, exactly once.
    pub(crate) fn request_teardown(&self) {
        if !self.torn_down.swap(true, AcqRel) {
            for entry in self.lanes.iter() {
                entry.value().request_dispose();
            }
        }
    }

    /// Dispose-path poll shared by the consumer cursors: resolves once every handler has wound
    /// down, raising the aggregated disposal failures if there were any.
    pub(crate) fn poll_released(&self, cx: &mut Context) -> Poll<Result<(), Error>> {
        loop {
            if self.open_refs.load(Acquire) == 0 {
                return Poll::Ready(match self.dispose_errors.seal() {
                    SealResult::Sealed(Some(err)) => Err(err),
                    SealResult::Sealed(None) | SealResult::AlreadySealed => Ok(()),
                });
            }
            match self.released.poll_wait(cx) {
                Poll::Ready(()) => continue,
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    /// Pull-path terminal: seal the error ledger and surface the aggregate, or completion.
    pub(crate) fn terminal<U>(&self) -> Result<Step<U>, Error> {
        match self.errors.seal() {
            SealResult::Sealed(Some(err)) => Err(err),
            SealResult::Sealed(None) | SealResult::AlreadySealed => Ok(Step::Done),
        }
    }

    /// Spawn the standard queue-feeding handler for an upstream cursor.
    pub(crate) fn spawn_handler<C>(self: &Arc<Self>, lane: u64, cursor: C) -> Arc<PullDriver>
    where
        C: Cursor<Item = T> + 'static,
    {
        let driver = Arc::new(PullDriver::new());
        self.register(lane, &driver);
        tokio::spawn(drive_into_queue(Arc::clone(self), lane, cursor, Arc::clone(&driver)));
        driver
    }
}

// ==== handler drive loop ====

/// Why a drive loop stopped pulling
pub(crate) enum Halt {
    /// The upstream reported completion or failure (already pushed as an entry)
    Terminal,
    /// Disposal was requested before the upstream finished
    Disposed,
}

/// The standard handler: pull under credits, push every step as an entry, wind down.
pub(crate) async fn drive_into_queue<C>(
    core: Arc<Core<C::Item>>,
    lane: u64,
    mut cursor: C,
    driver: Arc<PullDriver>,
) where
    C: Cursor + 'static,
    C::Item: Send + 'static,
{
    drive_pulls(&core, lane, &mut cursor, &driver).await;
    wind_down(&core, lane, cursor).await;
}

/// Core pull loop, reusable by handlers with custom preludes. Pushes items and the terminal
/// entry; does not dispose.
pub(crate) async fn drive_pulls<C>(
    core: &Core<C::Item>,
    lane: u64,
    cursor: &mut C,
    driver: &PullDriver,
) -> Halt
where
    C: Cursor,
    C::Item: Send + 'static,
{
    loop {
        loop {
            match driver.try_claim() {
                Claim::Stop => return Halt::Disposed,
                Claim::Idle => break,
                Claim::Pull => {}
            }
            let step = cursor.pull().await;
            let raced_dispose = driver.release();
            match step {
                Ok(Step::Value(item)) => core.push_entry(Entry::Item { lane, item }),
                Ok(Step::Done) => {
                    core.push_entry(Entry::Done { lane });
                    return Halt::Terminal;
                }
                Err(error) => {
                    core.push_entry(Entry::Failed { lane, error });
                    return Halt::Terminal;
                }
            }
            if raced_dispose {
                return Halt::Disposed;
            }
        }
        if driver.stopping() {
            return Halt::Disposed;
        }
        driver.wake.wait().await;
    }
}

/// Exactly-once handler epilogue: dispose the upstream, record any disposal failure, deregister
/// the lane, release the dispose reference.
pub(crate) async fn wind_down<T, C>(core: &Core<T>, lane: u64, mut cursor: C)
where
    T: Send + 'static,
    C: Cursor,
{
    if let Err(err) = cursor.dispose().await {
        trace!(lane, "upstream dispose failed");
        core.dispose_errors.push(err);
    }
    drop(cursor);
    core.lanes.remove(&lane);
    core.release_handle();
}
