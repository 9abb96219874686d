// switch map: at most one active inner sequence, switching on every outer item.

use crate::{
    driver::{drive_into_queue, wind_down, Claim, Core, CreditPolicy, Entry, PullDriver},
    error::{Error, SourceError},
    seq::{Cursor, CursorExt, Source, Step},
    sync::{CancelLatch, Replace},
};
use std::{
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering::{AcqRel, Acquire}},
        Arc,
    },
    task::{Context, Poll},
};

// lane id of the outer source. inner lanes are generation numbers, counting up from one.
const OUTER: u64 = 0;

/// Maps each outer item to an inner sequence, keeping only the most recent one active
///
/// A new outer item cancels and disposes the previous inner before the replacement begins
/// producing. Items from replaced generations that are already queued are discarded at drain
/// time. The sequence completes once the outer source is done and the last inner (if any) is
/// done.
pub struct SwitchMap<S, F, Inner> {
    outer: S,
    mapper: Arc<F>,
    prefetch: usize,
    _inner: PhantomData<fn() -> Inner>,
}

/// Switch through `mapper` applied to every item of `outer`.
///
/// Reached through validated calls: `prefetch` must be at least 1.
pub fn switch_map<S, F, Inner>(outer: S, mapper: F, prefetch: usize) -> SwitchMap<S, F, Inner>
where
    S: Source + 'static,
    Inner: Source + 'static,
    F: Fn(S::Item) -> Result<Inner, SourceError> + Send + Sync + 'static,
{
    debug_assert!(prefetch >= 1);
    SwitchMap { outer, mapper: Arc::new(mapper), prefetch, _inner: PhantomData }
}

struct Shared<T: Send + 'static> {
    core: Arc<Core<T>>,
    // current generation. zero means no inner has ever been installed.
    gen: AtomicU64,
    // the current inner's driver. the cancelled sentinel distinguishes "torn down" from "no
    // current inner", so an inner created while teardown is racing in is cancelled on the spot
    // rather than installed.
    latch: CancelLatch<PullDriver>,
}

impl<S, F, Inner> Source for SwitchMap<S, F, Inner>
where
    S: Source + 'static,
    Inner: Source + 'static,
    F: Fn(S::Item) -> Result<Inner, SourceError> + Send + Sync + 'static,
{
    type Item = Inner::Item;
    type Cursor = SwitchMapCursor<S, F, Inner>;

    fn open(&self) -> Self::Cursor {
        SwitchMapCursor {
            outer: Some(self.outer.open()),
            mapper: Arc::clone(&self.mapper),
            policy: CreditPolicy::new(self.prefetch),
            started: None,
            outer_done: false,
            latest_done_gen: 0,
            consumed: (0, 0),
            finished: false,
        }
    }
}

/// Cursor over [`SwitchMap`]
pub struct SwitchMapCursor<S: Source, F, Inner: Source> {
    outer: Option<S::Cursor>,
    mapper: Arc<F>,
    policy: CreditPolicy,
    started: Option<Arc<Shared<Inner::Item>>>,
    outer_done: bool,
    // highest generation whose inner has completed.
    latest_done_gen: u64,
    // (generation, items consumed since last replenishment) for the current inner.
    consumed: (u64, usize),
    finished: bool,
}

impl<S, F, Inner> SwitchMapCursor<S, F, Inner>
where
    S: Source + 'static,
    Inner: Source + 'static,
    F: Fn(S::Item) -> Result<Inner, SourceError> + Send + Sync + 'static,
{
    fn start(&mut self) -> Arc<Shared<Inner::Item>> {
        let outer = &mut self.outer;
        let mapper = &self.mapper;
        let policy = self.policy;
        Arc::clone(self.started.get_or_insert_with(|| {
            let shared = Arc::new(Shared {
                core: Core::<Inner::Item>::new(),
                gen: AtomicU64::new(0),
                latch: CancelLatch::new(),
            });
            let outer_driver = Arc::new(PullDriver::new());
            shared.core.register(OUTER, &outer_driver);
            let cursor = outer.take().expect("switch map started twice (internal bug)");
            tokio::spawn(drive_outer::<S::Cursor, F, Inner>(
                Arc::clone(&shared),
                cursor,
                Arc::clone(mapper),
                Arc::clone(&outer_driver),
                policy,
            ));
            outer_driver.grant_unbounded();
            shared
        }))
    }
}

// the outer handler: each item bumps the generation, cancels the previous inner through the
// latch, and installs a fresh handler for the mapped inner.
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
                        let gen = shared.gen.fetch_add(1, AcqRel) + 1;
                        let inner_driver = Arc::new(PullDriver::new());
                        shared.core.register(gen, &inner_driver);
                        match shared.latch.replace(Arc::clone(&inner_driver)) {
                            Replace::Installed(Some(prev)) => prev.request_dispose(),
                            Replace::Installed(None) => {}
                            // teardown raced in: the latch already cancelled the new driver,
                            // and its handler will wind straight down.
                            Replace::Cancelled => {}
                        }
                        tokio::spawn(drive_into_queue(
                            Arc::clone(&shared.core),
                            gen,
                            inner.open(),
                            Arc::clone(&inner_driver),
                        ));
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

impl<S, F, Inner> Cursor for SwitchMapCursor<S, F, Inner>
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
        let shared = self.start();
        loop {
            let current_gen = shared.gen.load(Acquire);
            // safety: this cursor is the queue's only consumer.
            while let Some(entry) = unsafe { shared.core.entries.pop() } {
                match entry {
                    Entry::Item { lane, item } => {
                        if lane == shared.gen.load(Acquire) {
                            if self.consumed.0 != lane {
                                self.consumed = (lane, 0);
                            }
                            if let Some(driver) = shared.core.lanes.get(&lane) {
                                policy.consumed(&mut self.consumed.1, driver.value());
                            }
                            return Poll::Ready(Ok(Step::Value(item)));
                        }
                        trace!(lane, "discarding item from replaced inner");
                    }
                    Entry::Done { lane } if lane == OUTER => self.outer_done = true,
                    Entry::Done { lane } => {
                        if lane == shared.gen.load(Acquire) {
                            self.latest_done_gen = lane;
                        }
                    }
                    Entry::Failed { lane, error } => {
                        if lane == OUTER || lane == shared.gen.load(Acquire) {
                            shared.core.errors.push(error);
                            self.finished = true;
                            shared.latch.cancel();
                            shared.core.request_teardown();
                            return Poll::Ready(shared.core.terminal());
                        }
                        trace!(lane, "discarding failure from replaced inner");
                    }
                    Entry::Boundary { .. } => {}
                }
            }
            let gen_now = shared.gen.load(Acquire);
            if self.outer_done && (gen_now == 0 || self.latest_done_gen == gen_now) {
                self.finished = true;
                return Poll::Ready(shared.core.terminal());
            }
            // a switch that landed mid-drain re-runs the loop rather than parking.
            if gen_now != current_gen {
                continue;
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
            Some(shared) => {
                self.finished = true;
                shared.latch.cancel();
                shared.core.request_teardown();
                shared.core.poll_released(cx)
            }
        }
    }
}

impl<S: Source, F, Inner: Source> Drop for SwitchMapCursor<S, F, Inner> {
    fn drop(&mut self) {
        if let Some(shared) = &self.started {
            shared.latch.cancel();
            shared.core.request_teardown();
        }
    }
}
