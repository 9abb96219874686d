// concat map eager: inner sequences run concurrently, results emit in strict outer order.

use crate::{
    driver::{wind_down, Claim, Core, CreditPolicy, Entry, PullDriver},
    error::{Error, SourceError},
    seq::{Cursor, CursorExt, Source, Step},
    sync::{spsc_ring, RingConsumer, RingProducer},
};
use dashmap::DashMap;
use std::{
    collections::VecDeque,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, Ordering::{Acquire, Release}},
        Arc, OnceLock,
    },
    task::{Context, Poll},
};

// lane id of the outer source. inner lanes count up from zero.
const OUTER: u64 = u64::MAX;

/// Eagerly-started, strictly-ordered flattening
///
/// Up to `max_concurrency` inner sequences run at once for throughput, but results are emitted
/// in exact outer-arrival order: each inner buffers privately until it becomes head-of-line,
/// and only the head's buffer is drained. When the head completes and drains, the next inner in
/// outer order takes its place.
pub struct ConcatMapEager<S, F, Inner> {
    outer: S,
    mapper: Arc<F>,
    max_concurrency: usize,
    prefetch: usize,
    _inner: PhantomData<fn() -> Inner>,
}

/// Concatenate `mapper` applied to every item of `outer`, running inners eagerly.
///
/// Reached through validated calls: `max_concurrency` and `prefetch` must be at least 1.
pub fn concat_map_eager<S, F, Inner>(
    outer: S,
    mapper: F,
    max_concurrency: usize,
    prefetch: usize,
) -> ConcatMapEager<S, F, Inner>
where
    S: Source + 'static,
    Inner: Source + 'static,
    F: Fn(S::Item) -> Result<Inner, SourceError> + Send + Sync + 'static,
{
    debug_assert!(max_concurrency >= 1);
    debug_assert!(prefetch >= 1);
    ConcatMapEager {
        outer,
        mapper: Arc::new(mapper),
        max_concurrency,
        prefetch,
        _inner: PhantomData,
    }
}

// per-inner state handed from the outer handler to the consumer cursor via the pending map,
// keyed by lane, announced by a boundary entry.
struct Lane<T> {
    rx: RingConsumer<T>,
    driver: Arc<PullDriver>,
    done: Arc<AtomicBool>,
    error: Arc<OnceLock<Error>>,
    consumed: usize,
}

struct Shared<T: Send + 'static> {
    core: Arc<Core<T>>,
    pending: DashMap<u64, Lane<T>>,
}

impl<S, F, Inner> Source for ConcatMapEager<S, F, Inner>
where
    S: Source + 'static,
    Inner: Source + 'static,
    F: Fn(S::Item) -> Result<Inner, SourceError> + Send + Sync + 'static,
{
    type Item = Inner::Item;
    type Cursor = ConcatMapEagerCursor<S, F, Inner>;

    fn open(&self) -> Self::Cursor {
        ConcatMapEagerCursor {
            outer: Some(self.outer.open()),
            mapper: Arc::clone(&self.mapper),
            max_concurrency: self.max_concurrency,
            policy: CreditPolicy::new(self.prefetch),
            started: None,
            queue: VecDeque::new(),
            outer_done: false,
            finished: false,
        }
    }
}

struct Started<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    outer_driver: Arc<PullDriver>,
}

/// Cursor over [`ConcatMapEager`]
pub struct ConcatMapEagerCursor<S: Source, F, Inner: Source> {
    outer: Option<S::Cursor>,
    mapper: Arc<F>,
    max_concurrency: usize,
    policy: CreditPolicy,
    started: Option<Started<Inner::Item>>,
    // inners in outer-arrival order; the front is head-of-line.
    queue: VecDeque<Lane<Inner::Item>>,
    outer_done: bool,
    finished: bool,
}

impl<S, F, Inner> ConcatMapEagerCursor<S, F, Inner>
where
    S: Source + 'static,
    Inner: Source + 'static,
    F: Fn(S::Item) -> Result<Inner, SourceError> + Send + Sync + 'static,
{
    fn start(&mut self) -> &Started<Inner::Item> {
        let outer = &mut self.outer;
        let mapper = &self.mapper;
        let max_concurrency = self.max_concurrency;
        let policy = self.policy;
        self.started.get_or_insert_with(|| {
            let shared = Arc::new(Shared {
                core: Core::<Inner::Item>::new(),
                pending: DashMap::new(),
            });
            let outer_driver = Arc::new(PullDriver::new());
            shared.core.register(OUTER, &outer_driver);
            let cursor = outer.take().expect("concat map eager started twice (internal bug)");
            tokio::spawn(drive_outer::<S::Cursor, F, Inner>(
                Arc::clone(&shared),
                cursor,
                Arc::clone(mapper),
                Arc::clone(&outer_driver),
                policy,
            ));
            outer_driver.grant(max_concurrency);
            Started { shared, outer_driver }
        })
    }
}

// the outer handler: starts one buffering inner per item, announces each lane in outer order
// through a boundary entry.
async fn drive_outer<C, F, Inner>(
    shared: Arc<Shared<Inner::Item>>,
    mut outer: C,
    mapper: Arc<F>,
    driver: Arc<PullDriver>,
    policy: CreditPolicy,
) where
    C: Cursor + 'static,
    Inner: Source + 'static,
    F: Fn(C::Item) -> Result<Inner, SourceError> + Send + Sync + 'static,
{
    let mut next_lane = 0u64;
    'main: loop {
        loop {
            match driver.try_claim() {
                Claim::Stop => break 'main,
                Claim::Idle => break,
                Claim::Pull => {}
            }
            let step = outer.pull().await;
            let raced_dispose = driver.release();
            match step {
                Ok(Step::Value(item)) => match mapper(item) {
                    Ok(inner) => {
                        let lane = next_lane;
                        next_lane += 1;
                        let (tx, rx) = spsc_ring();
                        let done = Arc::new(AtomicBool::new(false));
                        let error = Arc::new(OnceLock::new());
                        let inner_driver = Arc::new(PullDriver::new());
                        shared.core.register(lane, &inner_driver);
                        tokio::spawn(drive_inner(
                            Arc::clone(&shared.core),
                            lane,
                            inner.open(),
                            Arc::clone(&inner_driver),
                            tx,
                            Arc::clone(&done),
                            Arc::clone(&error),
                        ));
                        shared.pending.insert(
                            lane,
                            Lane { rx, driver: Arc::clone(&inner_driver), done, error, consumed: 0 },
                        );
                        shared.core.push_entry(Entry::Boundary { lane });
                        policy.initial(&inner_driver);
                    }
                    Err(err) => {
                        shared.core.push_entry(Entry::Failed {
                            lane: OUTER,
                            error: Error::Structural(err),
                        });
                        break 'main;
                    }
                },
                Ok(Step::Done) => {
                    shared.core.push_entry(Entry::Done { lane: OUTER });
                    break 'main;
                }
                Err(error) => {
                    shared.core.push_entry(Entry::Failed { lane: OUTER, error });
                    break 'main;
                }
            }
            if raced_dispose {
                break 'main;
            }
        }
        if driver.stopping() {
            break;
        }
        driver.wake.wait().await;
    }
    wind_down(&shared.core, OUTER, outer).await;
}

// a buffering inner handler: items land in the lane's private ring, terminal state lands in
// the done flag (and error cell), and a done entry frees the outer's concurrency slot.
async fn drive_inner<C>(
    core: Arc<Core<C::Item>>,
    lane: u64,
    mut cursor: C,
    driver: Arc<PullDriver>,
    mut tx: RingProducer<C::Item>,
    done: Arc<AtomicBool>,
    error: Arc<OnceLock<Error>>,
) where
    C: Cursor + 'static,
    C::Item: Send + 'static,
{
    'main: loop {
        loop {
            match driver.try_claim() {
                Claim::Stop => break 'main,
                Claim::Idle => break,
                Claim::Pull => {}
            }
            let step = cursor.pull().await;
            let raced_dispose = driver.release();
            match step {
                Ok(Step::Value(item)) => {
                    tx.push(item);
                    core.consumer.signal();
                }
                Ok(Step::Done) => {
                    done.store(true, Release);
                    core.push_entry(Entry::Done { lane });
                    break 'main;
                }
                Err(err) => {
                    let _ = error.set(err);
                    done.store(true, Release);
                    core.push_entry(Entry::Done { lane });
                    break 'main;
                }
            }
            if raced_dispose {
                break 'main;
            }
        }
        if driver.stopping() {
            break;
        }
        driver.wake.wait().await;
    }
    wind_down(&core, lane, cursor).await;
}

impl<S, F, Inner> Cursor for ConcatMapEagerCursor<S, F, Inner>
where
    S: Source + 'static,
    Inner: Source + 'static,
    F: Fn(S::Item) -> Result<Inner, SourceError> + Send + Sync + 'static,
{
    type Item = Inner::Item;

    fn poll_pull(&mut self, cx: &mut Context) -> Poll<Result<Step<Inner::Item>, Error>> {
        if self.finished {
            return Poll::Ready(Ok(Step::Done));
        }
        let policy = self.policy;
        self.start();
        let started = self.started.as_ref().expect("just started");
        let shared = Arc::clone(&started.shared);
        let outer_driver = Arc::clone(&started.outer_driver);
        loop {
            // ingest bookkeeping entries first, so new lanes and terminal flags are visible
            // before the head-of-line decision.
            // safety: this cursor is the queue's only consumer.
            while let Some(entry) = unsafe { shared.core.entries.pop() } {
                match entry {
                    Entry::Boundary { lane } => {
                        if let Some((_, lane_state)) = shared.pending.remove(&lane) {
                            self.queue.push_back(lane_state);
                        }
                    }
                    Entry::Done { lane } if lane == OUTER => self.outer_done = true,
                    Entry::Done { .. } => outer_driver.grant(1),
                    Entry::Failed { lane, error } => {
                        debug_assert_eq!(lane, OUTER, "inner failures travel in-lane (internal bug)");
                        shared.core.errors.push(error);
                        self.outer_done = true;
                    }
                    Entry::Item { .. } => {
                        debug_assert!(false, "eager inners buffer privately (internal bug)");
                    }
                }
            }

            // drain the head-of-line inner only.
            while let Some(head) = self.queue.front_mut() {
                if let Some(item) = head.rx.pop() {
                    policy.consumed(&mut head.consumed, &head.driver);
                    return Poll::Ready(Ok(Step::Value(item)));
                }
                if head.done.load(Acquire) {
                    if let Some(err) = head.error.get() {
                        self.finished = true;
                        let err = err.clone();
                        shared.core.request_teardown();
                        return Poll::Ready(Err(err));
                    }
                    self.queue.pop_front();
                    continue;
                }
                break;
            }

            if self.queue.is_empty() && self.outer_done {
                self.finished = true;
                return Poll::Ready(shared.core.terminal());
            }
            match shared.core.consumer.poll_wait(cx) {
                Poll::Ready(()) => continue,
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn poll_dispose(&mut self, cx: &mut Context) -> Poll<Result<(), Error>> {
        match &self.started {
            None => {
                self.finished = true;
                Poll::Ready(Ok(()))
            }
            Some(started) => {
                self.finished = true;
                started.shared.core.request_teardown();
                started.shared.core.poll_released(cx)
            }
        }
    }
}

impl<S: Source, F, Inner: Source> Drop for ConcatMapEagerCursor<S, F, Inner> {
    fn drop(&mut self) {
        if let Some(started) = &self.started {
            started.shared.core.request_teardown();
        }
    }
}
