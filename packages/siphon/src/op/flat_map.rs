// flat map: dynamic fan-in, one inner sequence per outer item, bounded concurrency.

use crate::{
    driver::{wind_down, Claim, Core, CreditPolicy, Entry, PullDriver},
    error::{Error, SourceError},
    seq::{Cursor, CursorExt, Source, Step},
};
use std::{
    collections::HashMap,
    marker::PhantomData,
    sync::{
        atomic::Ordering::{AcqRel, Acquire, Release},
        Arc,
    },
    task::{Context, Poll},
};

// lane id of the outer source. inner lanes count up from zero.
const OUTER: u64 = u64::MAX;

/// Maps each outer item to an inner sequence and merges the inner sequences
///
/// At most `max_concurrency` inner sequences run at once; each inner runs under a `prefetch`
/// credit budget with low-water replenishment. No ordering is guaranteed across inner
/// sequences — `max_concurrency == 1` degenerates to fully ordered flattening, since only one
/// inner is ever active.
pub struct FlatMap<S, F, Inner> {
    outer: S,
    mapper: Arc<F>,
    max_concurrency: usize,
    prefetch: usize,
    _inner: PhantomData<fn() -> Inner>,
}

/// Flatten `mapper` applied to every item of `outer`.
///
/// Reached through validated calls: `max_concurrency` and `prefetch` must be at least 1.
pub fn flat_map<S, F, Inner>(
    outer: S,
    mapper: F,
    max_concurrency: usize,
    prefetch: usize,
) -> FlatMap<S, F, Inner>
where
    S: Source + 'static,
    Inner: Source + 'static,
    F: Fn(S::Item) -> Result<Inner, SourceError> + Send + Sync + 'static,
{
    debug_assert!(max_concurrency >= 1);
    debug_assert!(prefetch >= 1);
    FlatMap {
        outer,
        mapper: Arc::new(mapper),
        max_concurrency,
        prefetch,
        _inner: PhantomData,
    }
}

impl<S, F, Inner> Source for FlatMap<S, F, Inner>
where
    S: Source + 'static,
    Inner: Source + 'static,
    F: Fn(S::Item) -> Result<Inner, SourceError> + Send + Sync + 'static,
{
    type Item = Inner::Item;
    type Cursor = FlatMapCursor<S, F, Inner>;

    fn open(&self) -> Self::Cursor {
        FlatMapCursor {
            outer: Some(self.outer.open()),
            mapper: Arc::clone(&self.mapper),
            max_concurrency: self.max_concurrency,
            policy: CreditPolicy::new(self.prefetch),
            started: None,
            finished: false,
        }
    }
}

struct Started<T: Send + 'static> {
    core: Arc<Core<T>>,
    outer_driver: Arc<PullDriver>,
    // items taken per inner lane since the last replenishment.
    consumed: HashMap<u64, usize>,
}

/// Cursor over [`FlatMap`]
pub struct FlatMapCursor<S: Source, F, Inner: Source> {
    outer: Option<S::Cursor>,
    mapper: Arc<F>,
    max_concurrency: usize,
    policy: CreditPolicy,
    started: Option<Started<Inner::Item>>,
    finished: bool,
}

impl<S, F, Inner> FlatMapCursor<S, F, Inner>
where
    S: Source + 'static,
    Inner: Source + 'static,
    F: Fn(S::Item) -> Result<Inner, SourceError> + Send + Sync + 'static,
{
    fn start(&mut self) -> (Arc<Core<Inner::Item>>, Arc<PullDriver>) {
        let outer = &mut self.outer;
        let mapper = &self.mapper;
        let max_concurrency = self.max_concurrency;
        let policy = self.policy;
        let started = self.started.get_or_insert_with(|| {
            let core = Core::<Inner::Item>::new();
            core.live.store(1, Release);
            let outer_driver = Arc::new(PullDriver::new());
            core.register(OUTER, &outer_driver);
            let cursor = outer.take().expect("flat map started twice (internal bug)");
            tokio::spawn(drive_outer::<S::Cursor, F, Inner>(
                Arc::clone(&core),
                cursor,
                Arc::clone(mapper),
                Arc::clone(&outer_driver),
                policy,
            ));
            outer_driver.grant(max_concurrency);
            Started { core, outer_driver, consumed: HashMap::new() }
        });
        (Arc::clone(&started.core), Arc::clone(&started.outer_driver))
    }
}

// the outer handler: every pulled item is mapped to an inner source whose handler then feeds
// the shared queue. outer credits are inner slots: one is granted back whenever an inner
// reaches a terminal state.
async fn drive_outer<C, F, Inner>(
    core: Arc<Core<Inner::Item>>,
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
                        core.live.fetch_add(1, AcqRel);
                        let inner_driver = core.spawn_handler(lane, inner.open());
                        policy.initial(&inner_driver);
                    }
                    Err(err) => {
                        core.push_entry(Entry::Failed {
                            lane: OUTER,
                            error: Error::Structural(err),
                        });
                        break 'main;
                    }
                },
                Ok(Step::Done) => {
                    core.push_entry(Entry::Done { lane: OUTER });
                    break 'main;
                }
                Err(error) => {
                    core.push_entry(Entry::Failed { lane: OUTER, error });
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
    wind_down(&core, OUTER, outer).await;
}

impl<S, F, Inner> Cursor for FlatMapCursor<S, F, Inner>
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
        let (core, outer_driver) = self.start();
        loop {
            // safety: this cursor is the queue's only consumer.
            while let Some(entry) = unsafe { core.entries.pop() } {
                match entry {
                    Entry::Item { lane, item } => {
                        if let Some(driver) = core.lanes.get(&lane) {
                            let started = self.started.as_mut().expect("started above");
                            policy.consumed(
                                started.consumed.entry(lane).or_insert(0),
                                driver.value(),
                            );
                        }
                        return Poll::Ready(Ok(Step::Value(item)));
                    }
                    Entry::Done { lane } => {
                        core.live.fetch_sub(1, AcqRel);
                        if lane != OUTER {
                            self.started.as_mut().expect("started above").consumed.remove(&lane);
                            outer_driver.grant(1);
                        }
                    }
                    Entry::Failed { lane, error } => {
                        core.errors.push(error);
                        core.live.fetch_sub(1, AcqRel);
                        if lane != OUTER {
                            self.started.as_mut().expect("started above").consumed.remove(&lane);
                            outer_driver.grant(1);
                        }
                    }
                    Entry::Boundary { .. } => {}
                }
            }
            if core.live.load(Acquire) == 0 {
                self.finished = true;
                return Poll::Ready(core.terminal());
            }
            match core.consumer.poll_wait(cx) {
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
                started.core.request_teardown();
                started.core.poll_released(cx)
            }
        }
    }
}

impl<S: Source, F, Inner: Source> Drop for FlatMapCursor<S, F, Inner> {
    fn drop(&mut self) {
        if let Some(started) = &self.started {
            started.core.request_teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::source_error,
        seq::{drain, sources::from_iter, CursorExt},
    };

    fn decade(i: u32) -> std::ops::Range<u32> {
        i * 10..(i + 1) * 10
    }

    #[tokio::test]
    async fn result_set_equals_the_flattening_for_all_tunings() {
        for max_concurrency in 1..=4 {
            for prefetch in 1..=4 {
                let source = flat_map(
                    from_iter(0u32..10),
                    |i| Ok(from_iter(decade(i))),
                    max_concurrency,
                    prefetch,
                );
                let drained = drain(source.open()).await;
                assert!(drained.error.is_none());

                let mut items = drained.items;
                items.sort_unstable();
                assert_eq!(
                    items,
                    (0..100).collect::<Vec<_>>(),
                    "max_concurrency {} prefetch {}",
                    max_concurrency,
                    prefetch,
                );
            }
        }
    }

    #[tokio::test]
    async fn single_concurrency_degenerates_to_ordered_flattening() {
        let source = flat_map(from_iter(0u32..8), |i| Ok(from_iter(decade(i))), 1, 3);
        let drained = drain(source.open()).await;
        assert!(drained.error.is_none());
        assert_eq!(drained.items, (0..80).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn empty_outer_completes() {
        let source = flat_map(from_iter(0u32..0), |i| Ok(from_iter(decade(i))), 2, 2);
        let drained = drain(source.open()).await;
        assert!(drained.items.is_empty());
        assert!(drained.error.is_none());
    }

    #[tokio::test]
    async fn mapper_failure_is_structural_and_drains_prior_inners() {
        let source = flat_map(
            from_iter(0u32..10),
            |i| {
                if i == 5 {
                    Err(source_error(std::io::Error::other("bad item")))
                } else {
                    Ok(from_iter(decade(i)))
                }
            },
            1,
            2,
        );
        let drained = drain(source.open()).await;
        assert!(matches!(drained.error, Some(Error::Structural(_))));
        // with one inner at a time, everything mapped before the failure arrives in order.
        assert_eq!(drained.items, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn early_dispose_releases_everything() {
        let source = flat_map(from_iter(0u32..100), |i| Ok(from_iter(i * 1000..(i + 1) * 1000)), 4, 8);
        let mut cursor = source.open();
        for _ in 0..5 {
            assert!(!cursor.pull().await.unwrap().is_done());
        }
        assert!(cursor.dispose().await.is_ok());
        assert!(cursor.dispose().await.is_ok());
    }
}
