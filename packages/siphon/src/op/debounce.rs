// debounce: emit an item only once its arrival has been followed by enough silence.

use super::TimerHandle;
use crate::{
    driver::{wind_down, Claim, Core, Entry, PullDriver},
    error::Error,
    seq::{Cursor, CursorExt, Source, Step},
    sync::{AtomicSlot, Cancel, CancelLatch, Replace, SlotToken},
};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering::{AcqRel, Acquire}},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

// lane ids: the upstream handler and the timer fires.
const UPSTREAM: u64 = 0;
const TIMER: u64 = 1;

/// Emits an item only after `window` of upstream silence
///
/// Every arrival stamps a fresh sequence number, parks the item in the pending slot, and
/// re-arms the timer, cancelling the previous one. A timer that fires checks that its stamp is
/// still the latest and then claims exactly the node it armed with — a stale fire that raced
/// past its cancellation takes nothing. With `emit_last`, the pending item is flushed when the
/// upstream completes or fails even though its window never elapsed; a captured failure is
/// raised after the flush.
pub struct Debounce<S> {
    source: S,
    window: Duration,
    emit_last: bool,
}

/// Debounce `source` by `window`.
pub fn debounce<S: Source + 'static>(source: S, window: Duration, emit_last: bool) -> Debounce<S> {
    Debounce { source, window, emit_last }
}

struct Shared<T: Send + 'static> {
    core: Arc<Core<T>>,
    // the latest not-yet-emitted item.
    slot: AtomicSlot<T>,
    // per-arrival stamp; a timer only fires for the stamp it was armed with.
    seq: AtomicU64,
    timer: CancelLatch<TimerHandle>,
}

impl<S: Source + 'static> Source for Debounce<S> {
    type Item = S::Item;
    type Cursor = DebounceCursor<S>;

    fn open(&self) -> Self::Cursor {
        DebounceCursor {
            upstream: Some(self.source.open()),
            window: self.window,
            emit_last: self.emit_last,
            started: None,
            finished: false,
        }
    }
}

/// Cursor over [`Debounce`]
pub struct DebounceCursor<S: Source> {
    upstream: Option<S::Cursor>,
    window: Duration,
    emit_last: bool,
    started: Option<Arc<Shared<S::Item>>>,
    finished: bool,
}

impl<S: Source + 'static> DebounceCursor<S> {
    fn start(&mut self) -> Arc<Shared<S::Item>> {
        let upstream = &mut self.upstream;
        let window = self.window;
        let emit_last = self.emit_last;
        Arc::clone(self.started.get_or_insert_with(|| {
            let shared = Arc::new(Shared {
                core: Core::<S::Item>::new(),
                slot: AtomicSlot::empty(),
                seq: AtomicU64::new(0),
                timer: CancelLatch::new(),
            });
            let driver = Arc::new(PullDriver::new());
            shared.core.register(UPSTREAM, &driver);
            let cursor = upstream.take().expect("debounce started twice (internal bug)");
            tokio::spawn(drive_upstream(
                Arc::clone(&shared),
                cursor,
                Arc::clone(&driver),
                window,
                emit_last,
            ));
            driver.grant_unbounded();
            shared
        }))
    }
}

async fn drive_upstream<C>(
    shared: Arc<Shared<C::Item>>,
    mut cursor: C,
    driver: Arc<PullDriver>,
    window: Duration,
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
                    let stamp = shared.seq.fetch_add(1, AcqRel) + 1;
                    let (token, displaced) = shared.slot.put_tracked(item);
                    // the displaced item never saw enough silence: debounced away.
                    drop(displaced);
                    let handle = Arc::new(TimerHandle::spawn(fire(
                        Arc::clone(&shared),
                        stamp,
                        token,
                        window,
                    )));
                    match shared.timer.replace(handle) {
                        Replace::Installed(Some(prev)) => prev.cancel(),
                        Replace::Installed(None) | Replace::Cancelled => {}
                    }
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

async fn fire<T: Send + 'static>(
    shared: Arc<Shared<T>>,
    stamp: u64,
    token: SlotToken<T>,
    window: Duration,
) {
    tokio::time::sleep(window).await;
    if shared.seq.load(Acquire) == stamp {
        if let Some(item) = shared.slot.take_exact(token) {
            shared.core.push_entry(Entry::Item { lane: TIMER, item });
            return;
        }
    }
    trace!(stamp, "stale debounce fire discarded");
}

impl<S: Source + 'static> Cursor for DebounceCursor<S> {
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

impl<S: Source> Drop for DebounceCursor<S> {
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
        error::source_error,
        seq::{drain, CursorExt},
        testkit::{script, ticks},
    };

    #[tokio::test(start_paused = true)]
    async fn source_faster_than_the_window_yields_nothing() {
        let source = debounce(ticks(Duration::from_millis(10), 0u32..5), Duration::from_millis(50), false);
        let drained = drain(source.open()).await;
        assert!(drained.items.is_empty());
        assert!(drained.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn emit_last_always_delivers_the_final_item() {
        let source = debounce(ticks(Duration::from_millis(10), 0u32..5), Duration::from_millis(50), true);
        let drained = drain(source.open()).await;
        assert_eq!(drained.items, vec![4]);
        assert!(drained.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn spaced_items_all_get_through() {
        use crate::testkit::script_tail;

        // items every 100ms with the upstream held open past the last window.
        let source = debounce(
            script_tail(
                (0u32..4).map(|v| (Duration::from_millis(100), Ok(v))).collect(),
                Duration::from_millis(200),
            ),
            Duration::from_millis(30),
            false,
        );
        let drained = drain(source.open()).await;
        assert_eq!(drained.items, vec![0, 1, 2, 3]);
        assert!(drained.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn completion_inside_the_window_drops_the_pending_item() {
        // the last item's window never elapses before completion and emit_last is off.
        let source = debounce(
            ticks(Duration::from_millis(100), 0u32..2),
            Duration::from_millis(30),
            false,
        );
        let drained = drain(source.open()).await;
        assert_eq!(drained.items, vec![0]);
        assert!(drained.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failure_does_not_suppress_the_trailing_flush() {
        let source = debounce(
            script(vec![
                (Duration::from_millis(10), Ok(1u32)),
                (Duration::from_millis(10), Ok(2)),
                (Duration::from_millis(5), Err(source_error(std::io::Error::other("boom")))),
            ]),
            Duration::from_millis(50),
            true,
        );
        let drained = drain(source.open()).await;
        assert_eq!(drained.items, vec![2]);
        assert!(matches!(drained.error, Some(Error::Upstream(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_mid_window_completes() {
        let source = debounce(ticks(Duration::from_millis(20), 0u32..100), Duration::from_millis(500), false);
        let mut cursor = source.open();
        let pull = cursor.pull();
        tokio::select! {
            _ = pull => panic!("nothing should be emitted inside the window"),
            _ = tokio::time::sleep(Duration::from_millis(110)) => {}
        }
        assert!(cursor.dispose().await.is_ok());
        assert!(cursor.dispose().await.is_ok());
    }
}
