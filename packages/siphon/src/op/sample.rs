// sample: periodic snapshot-and-clear of the upstream's latest value.

use super::TimerHandle;
use crate::{
    driver::{wind_down, Claim, Core, Entry, PullDriver},
    error::Error,
    seq::{Cursor, CursorExt, Source, Step},
    sync::{AtomicSlot, CancelLatch},
};
use std::{
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

// lane ids: the upstream handler and the sampler fires.
const UPSTREAM: u64 = 0;
const TIMER: u64 = 1;

/// Emits the upstream's most recent value once per `period`
///
/// A fixed-period timer loop swaps the pending-latest slot empty on every fire; a period in
/// which the upstream produced nothing new emits nothing. With `emit_last`, a pending value is
/// flushed when the upstream completes or fails; a captured failure is raised after the flush.
pub struct Sample<S> {
    source: S,
    period: Duration,
    emit_last: bool,
}

/// Sample `source` every `period`.
pub fn sample<S: Source + 'static>(source: S, period: Duration, emit_last: bool) -> Sample<S> {
    Sample { source, period, emit_last }
}

struct Shared<T: Send + 'static> {
    core: Arc<Core<T>>,
    // the latest not-yet-sampled item.
    slot: AtomicSlot<T>,
    timer: CancelLatch<TimerHandle>,
}

impl<S: Source + 'static> Source for Sample<S> {
    type Item = S::Item;
    type Cursor = SampleCursor<S>;

    fn open(&self) -> Self::Cursor {
        SampleCursor {
            upstream: Some(self.source.open()),
            period: self.period,
            emit_last: self.emit_last,
            started: None,
            finished: false,
        }
    }
}

/// Cursor over [`Sample`]
pub struct SampleCursor<S: Source> {
    upstream: Option<S::Cursor>,
    period: Duration,
    emit_last: bool,
    started: Option<Arc<Shared<S::Item>>>,
    finished: bool,
}

impl<S: Source + 'static> SampleCursor<S> {
    fn start(&mut self) -> Arc<Shared<S::Item>> {
        let upstream = &mut self.upstream;
        let period = self.period;
        let emit_last = self.emit_last;
        Arc::clone(self.started.get_or_insert_with(|| {
            let shared = Arc::new(Shared {
                core: Core::<S::Item>::new(),
                slot: AtomicSlot::empty(),
                timer: CancelLatch::new(),
            });
            let driver = Arc::new(PullDriver::new());
            shared.core.register(UPSTREAM, &driver);
            let cursor = upstream.take().expect("sample started twice (internal bug)");
            tokio::spawn(drive_upstream(Arc::clone(&shared), cursor, Arc::clone(&driver), emit_last));
            let handle = Arc::new(TimerHandle::spawn(sampler(Arc::clone(&shared), period)));
            let _ = shared.timer.replace(handle);
            driver.grant_unbounded();
            shared
        }))
    }
}

async fn drive_upstream<C>(
    shared: Arc<Shared<C::Item>>,
    mut cursor: C,
    driver: Arc<PullDriver>,
    emit_last: bool,
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
                    // the displaced item was never sampled: overwritten by a fresher one.
                    drop(shared.slot.put(item));
                }
                Ok(Step::Done) => {
                    shared.timer.cancel();
                    if emit_last {
                        if let Some(item) = shared.slot.take() {
                            shared.core.push_entry(Entry::Item { lane: UPSTREAM, item });
                        }
                    }
                    shared.core.push_entry(Entry::Done { lane: UPSTREAM });
                    break 'main;
                }
                Err(error) => {
                    shared.timer.cancel();
                    if emit_last {
                        if let Some(item) = shared.slot.take() {
                            shared.core.push_entry(Entry::Item { lane: UPSTREAM, item });
                        }
                    }
                    shared.core.push_entry(Entry::Failed { lane: UPSTREAM, error });
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
    shared.timer.cancel();
    wind_down(&shared.core, UPSTREAM, cursor).await;
}

// the independent fixed-period timer loop. lives until cancelled through the latch.
async fn sampler<T: Send + 'static>(shared: Arc<Shared<T>>, period: Duration) {
    loop {
        tokio::time::sleep(period).await;
        if let Some(item) = shared.slot.take() {
            shared.core.push_entry(Entry::Item { lane: TIMER, item });
        }
    }
}

impl<S: Source + 'static> Cursor for SampleCursor<S> {
    type Item = S::Item;

    fn poll_pull(&mut self, cx: &mut Context) -> Poll<Result<Step<S::Item>, Error>> {
        if self.finished {
            return Poll::Ready(Ok(Step::Done));
        }
        let shared = self.start();
        loop {
            // safety: this cursor is the queue's only consumer.
            while let Some(entry) = unsafe { shared.core.entries.pop() } {
                match entry {
                    Entry::Item { item, .. } => return Poll::Ready(Ok(Step::Value(item))),
                    Entry::Done { .. } => {
                        self.finished = true;
                        return Poll::Ready(shared.core.terminal());
                    }
                    Entry::Failed { error, .. } => {
                        shared.core.errors.push(error);
                        self.finished = true;
                        return Poll::Ready(shared.core.terminal());
                    }
                    Entry::Boundary { .. } => {}
                }
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
                shared.timer.cancel();
                shared.core.request_teardown();
                shared.core.poll_released(cx)
            }
        }
    }
}

impl<S: Source> Drop for SampleCursor<S> {
    fn drop(&mut self) {
        if let Some(shared) = &self.started {
            shared.timer.cancel();
            shared.core.request_teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        seq::drain,
        testkit::ticks,
    };

    #[tokio::test(start_paused = true)]
    async fn periodic_snapshots_take_the_latest_value() {
        // items 0..9 arrive every 30ms; samples at 100ms and 200ms catch 2 and 5; the
        // upstream finishes at 270ms before the third sample.
        let source = sample(ticks(Duration::from_millis(30), 0u32..9), Duration::from_millis(100), false);
        let drained = drain(source.open()).await;
        assert_eq!(drained.items, vec![2, 5]);
        assert!(drained.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn emit_last_flushes_the_unsampled_tail() {
        let source = sample(ticks(Duration::from_millis(30), 0u32..9), Duration::from_millis(100), true);
        let drained = drain(source.open()).await;
        assert_eq!(drained.items, vec![2, 5, 8]);
        assert!(drained.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_periods_emit_nothing() {
        use crate::testkit::script_tail;

        // a single early item, then 200ms of silence: only the first sample fires.
        let source = sample(
            script_tail(
                vec![(Duration::from_millis(10), Ok(7u32))],
                Duration::from_millis(200),
            ),
            Duration::from_millis(50),
            false,
        );
        let drained = drain(source.open()).await;
        assert_eq!(drained.items, vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_stops_the_sampler() {
        use crate::seq::CursorExt;

        let source = sample(ticks(Duration::from_millis(10), 0u32..1000), Duration::from_millis(100), false);
        let mut cursor = source.open();
        let first = cursor.pull().await.unwrap();
        assert!(!first.is_done());
        assert!(cursor.dispose().await.is_ok());
        assert!(cursor.dispose().await.is_ok());
    }
}
