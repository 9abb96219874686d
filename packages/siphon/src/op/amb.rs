// amb: race several sources, keep whichever reaches any outcome first.

use crate::{
    driver::{drive_pulls, wind_down, Claim, Core, CreditPolicy, Entry, PullDriver},
    error::Error,
    seq::{Cursor, CursorExt, Source, Step},
};
use std::{
    sync::{
        atomic::{
            AtomicUsize,
            Ordering::{AcqRel, Acquire, Release},
        },
        Arc,
    },
    task::{Context, Poll},
};

// winner slot value meaning "undecided". an in-band discriminant, not a marker object.
const UNDECIDED: usize = usize::MAX;

/// Races N sources; the first to produce any outcome becomes the sequence
///
/// Every source is raced with a single pull. Whichever resolves first — with a value, a
/// completion, or a failure — is declared winner by one compare-and-swap; every other source
/// is disposed immediately, and only the winner is ever pulled again.
pub struct Amb<S> {
    sources: Arc<Vec<S>>,
    prefetch: usize,
}

/// Race `sources` against each other.
///
/// Reached through validated calls: `prefetch` must be at least 1.
pub fn amb<S: Source + 'static>(sources: Vec<S>, prefetch: usize) -> Amb<S> {
    debug_assert!(prefetch >= 1);
    Amb { sources: Arc::new(sources), prefetch }
}

impl<S: Source + 'static> Source for Amb<S> {
    type Item = S::Item;
    type Cursor = AmbCursor<S>;

    fn open(&self) -> Self::Cursor {
        AmbCursor {
            sources: Arc::clone(&self.sources),
            policy: CreditPolicy::new(self.prefetch),
            prefetch: self.prefetch,
            started: None,
            consumed: 0,
            finished: false,
        }
    }
}

struct Started<T: Send + 'static> {
    core: Arc<Core<T>>,
    winner: Arc<AtomicUsize>,
}

/// Cursor over [`Amb`]
pub struct AmbCursor<S: Source> {
    sources: Arc<Vec<S>>,
    policy: CreditPolicy,
    prefetch: usize,
    started: Option<Started<S::Item>>,
    // items taken from the winner since the last replenishment.
    consumed: usize,
    finished: bool,
}

impl<S: Source + 'static> AmbCursor<S> {
    fn start(&mut self) -> &Started<S::Item> {
        let sources = &self.sources;
        let prefetch = self.prefetch;
        self.started.get_or_insert_with(|| {
            let core = Core::<S::Item>::new();
            core.live.store(usize::from(!sources.is_empty()), Release);
            let winner = Arc::new(AtomicUsize::new(UNDECIDED));
            let drivers: Arc<Vec<Arc<PullDriver>>> = Arc::new(
                (0..sources.len()).map(|_| Arc::new(PullDriver::new())).collect(),
            );
            for (lane, driver) in drivers.iter().enumerate() {
                core.register(lane as u64, driver);
            }
            for (lane, source) in sources.iter().enumerate() {
                tokio::spawn(race(
                    Arc::clone(&core),
                    Arc::clone(&winner),
                    Arc::clone(&drivers),
                    lane as u64,
                    source.open(),
                    Arc::clone(&drivers[lane]),
                    prefetch,
                ));
                drivers[lane].grant(1);
            }
            Started { core, winner }
        })
    }
}

// one contender: a single raced pull, a compare-and-swap for the win, then either a normal
// relaying drive loop (winner) or an immediate wind-down (loser).
async fn race<C>(
    core: Arc<Core<C::Item>>,
    winner: Arc<AtomicUsize>,
    drivers: Arc<Vec<Arc<PullDriver>>>,
    lane: u64,
    mut cursor: C,
    driver: Arc<PullDriver>,
    prefetch: usize,
) where
    C: Cursor + 'static,
    C::Item: Send + 'static,
{
    let (step, raced_dispose) = 'race: loop {
        loop {
            match driver.try_claim() {
                Claim::Stop => {
                    wind_down(&core, lane, cursor).await;
                    return;
                }
                Claim::Idle => break,
                Claim::Pull => {}
            }
            let step = cursor.pull().await;
            let raced_dispose = driver.release();
            break 'race (step, raced_dispose);
        }
        if driver.stopping() {
            wind_down(&core, lane, cursor).await;
            return;
        }
        driver.wake.wait().await;
    };

    if winner
        .compare_exchange(UNDECIDED, lane as usize, AcqRel, Acquire)
        .is_err()
    {
        // lost the race: the raced-in outcome is discarded with the source.
        trace!(lane, "amb loser disposed");
        wind_down(&core, lane, cursor).await;
        return;
    }
    for (rival, rival_driver) in drivers.iter().enumerate() {
        if rival as u64 != lane {
            rival_driver.request_dispose();
        }
    }
    match step {
        Ok(Step::Value(item)) => {
            core.push_entry(Entry::Item { lane, item });
            if !raced_dispose {
                driver.grant(prefetch);
                drive_pulls(&core, lane, &mut cursor, &driver).await;
            }
        }
        Ok(Step::Done) => core.push_entry(Entry::Done { lane }),
        Err(error) => core.push_entry(Entry::Failed { lane, error }),
    }
    wind_down(&core, lane, cursor).await;
}

impl<S: Source + 'static> Cursor for AmbCursor<S> {
    type Item = S::Item;

    fn poll_pull(&mut self, cx: &mut Context) -> Poll<Result<Step<S::Item>, Error>> {
        if self.finished {
            return Poll::Ready(Ok(Step::Done));
        }
        let policy = self.policy;
        self.start();
        let started = self.started.as_ref().expect("just started");
        let core = Arc::clone(&started.core);
        loop {
            // safety: this cursor is the queue's only consumer.
            while let Some(entry) = unsafe { core.entries.pop() } {
                match entry {
                    Entry::Item { lane, item } => {
                        if let Some(driver) = core.lanes.get(&lane) {
                            policy.consumed(&mut self.consumed, driver.value());
                        }
                        return Poll::Ready(Ok(Step::Value(item)));
                    }
                    Entry::Done { .. } => {
                        core.live.fetch_sub(1, AcqRel);
                    }
                    Entry::Failed { error, .. } => {
                        core.errors.push(error);
                        core.live.fetch_sub(1, AcqRel);
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

impl<S: Source> Drop for AmbCursor<S> {
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
        seq::{
            boxed, drain,
            sources::{empty, fail, from_iter},
            CursorExt,
        },
        testkit::{ticks, Probe},
    };
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn first_producer_wins_and_losers_are_disposed() {
        let probe = Probe::new();
        let stats = probe.stats();
        let sources = vec![
            boxed(probe.wrap(ticks(Duration::from_millis(10), vec![1u32, 2, 3]))),
            boxed(probe.wrap(ticks(Duration::from_millis(50), vec![100u32, 200]))),
        ];
        let drained = drain(amb(sources, 2).open()).await;
        assert!(drained.error.is_none());
        assert_eq!(drained.items, vec![1, 2, 3]);
        assert_eq!(stats.opened(), 2);
        assert_eq!(stats.disposed(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn an_instant_completion_beats_a_slow_producer() {
        let sources = vec![
            boxed(empty::<u32>()),
            boxed(ticks(Duration::from_millis(10), vec![1u32])),
        ];
        let drained = drain(amb(sources, 1).open()).await;
        assert!(drained.items.is_empty());
        assert!(drained.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn an_instant_failure_wins_the_race() {
        let sources = vec![
            boxed(fail::<u32>(source_error(std::io::Error::other("lost")))),
            boxed(ticks(Duration::from_millis(10), vec![1u32])),
        ];
        let drained = drain(amb(sources, 1).open()).await;
        assert!(drained.items.is_empty());
        assert!(matches!(drained.error, Some(Error::Upstream(_))));
    }

    #[tokio::test]
    async fn a_single_source_is_relayed_in_full() {
        let drained = drain(amb(vec![from_iter(0u32..100)], 4).open()).await;
        assert!(drained.error.is_none());
        assert_eq!(drained.items, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn zero_sources_complete_immediately() {
        let drained = drain(amb(Vec::<crate::seq::sources::Empty<u32>>::new(), 1).open()).await;
        assert!(drained.items.is_empty());
        assert!(drained.error.is_none());
    }

    #[tokio::test]
    async fn dispose_mid_race_completes() {
        let sources = vec![from_iter(0u32..1000), from_iter(1000u32..2000)];
        let mut cursor = amb(sources, 2).open();
        let _ = cursor.pull().await.unwrap();
        assert!(cursor.dispose().await.is_ok());
        assert!(cursor.dispose().await.is_ok());
    }
}
