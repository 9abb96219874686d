// multicast bridge: one driver pulls the upstream once, any number of consumers tap the
// forwarded items. replay mode retains the full history for late attachers.

use crate::{
    error::Error,
    seq::{Cursor, CursorExt, Source, Step},
    sync::{spsc_ring, AtomicSlot, ResumeSignal, RingConsumer, RingProducer},
};
use dashmap::DashMap;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering::AcqRel},
        Arc, OnceLock, RwLock, Weak,
    },
    task::{Context, Poll},
};

/// Shares one consumption of an upstream among any number of downstream consumers
///
/// A single dedicated driver pulls the upstream and forwards every item and the terminal
/// outcome into each attached tap. The driver starts lazily on the first downstream pull, so
/// consumers can be attached before upstream production begins. In replay mode the full
/// forwarded history is retained (unbounded) and late attachers catch up on it, gap and
/// duplicate free, before going live; in publish mode late attachers only see what arrives
/// after they attach. Terminal outcomes are sticky for every present and future consumer.
pub struct Hub<S: Source> {
    shared: Arc<HubShared<S>>,
}

/// Multicast `source` without retention: each consumer sees items from attach time on.
pub fn publish<S>(source: S) -> Hub<S>
where
    S: Source + 'static,
    S::Item: Clone + Sync,
{
    Hub::new(source, false)
}

/// Multicast `source` with full retention: every consumer sees the complete history.
pub fn replay<S>(source: S) -> Hub<S>
where
    S: Source + 'static,
    S::Item: Clone + Sync,
{
    Hub::new(source, true)
}

struct Tap<T> {
    tx: RingProducer<T>,
    signal: Arc<ResumeSignal>,
}

struct HubShared<S: Source> {
    // the upstream cursor, waiting for the driver to claim it exactly once.
    upstream: AtomicSlot<S::Cursor>,
    taps: DashMap<u64, Tap<S::Item>>,
    next_tap: AtomicU64,
    started: AtomicBool,
    // replay retention. attach and fan-out serialize on this lock so catch-up is gapless.
    history: Option<RwLock<Vec<S::Item>>>,
    // None = completed, Some = failed. sticky.
    terminal: OnceLock<Option<Error>>,
}

impl<S> Hub<S>
where
    S: Source + 'static,
    S::Item: Clone + Sync,
{
    fn new(source: S, retain: bool) -> Self {
        Hub {
            shared: Arc::new(HubShared {
                upstream: AtomicSlot::with(source.open()),
                taps: DashMap::new(),
                next_tap: AtomicU64::new(0),
                started: AtomicBool::new(false),
                history: retain.then(|| RwLock::new(Vec::new())),
                terminal: OnceLock::new(),
            }),
        }
    }
}

impl<S: Source> Clone for Hub<S> {
    fn clone(&self) -> Self {
        Hub { shared: Arc::clone(&self.shared) }
    }
}

impl<S> Source for Hub<S>
where
    S: Source + 'static,
    S::Item: Clone + Sync,
{
    type Item = S::Item;
    type Cursor = TapCursor<S>;

    fn open(&self) -> Self::Cursor {
        TapCursor {
            shared: Arc::clone(&self.shared),
            attached: None,
            finished: false,
        }
    }
}

struct Attached<T> {
    id: u64,
    rx: RingConsumer<T>,
    signal: Arc<ResumeSignal>,
}

/// Cursor over a [`Hub`]: one downstream consumer's tap
pub struct TapCursor<S: Source> {
    shared: Arc<HubShared<S>>,
    attached: Option<Attached<S::Item>>,
    finished: bool,
}

impl<S> TapCursor<S>
where
    S: Source + 'static,
    S::Item: Clone + Sync,
{
    fn attach(&mut self) -> &mut Attached<S::Item> {
        let shared = &self.shared;
        self.attached.get_or_insert_with(|| {
            let id = shared.next_tap.fetch_add(1, AcqRel);
            let (mut tx, rx) = spsc_ring();
            let signal = Arc::new(ResumeSignal::new());
            if let Some(history) = &shared.history {
                // holding the write lock across catch-up and registration keeps the driver's
                // append-and-fan-out from slipping an item between the two.
                let guard = history.write().unwrap();
                for item in guard.iter() {
                    tx.push(item.clone());
                }
                shared.taps.insert(id, Tap { tx, signal: Arc::clone(&signal) });
                drop(guard);
            } else {
                shared.taps.insert(id, Tap { tx, signal: Arc::clone(&signal) });
            }
            // first consumer starts the driver.
            if !shared.started.swap(true, AcqRel) {
                if let Some(cursor) = shared.upstream.take() {
                    tokio::spawn(drive_hub::<S>(Arc::downgrade(shared), cursor));
                }
            }
            Attached { id, rx, signal }
        })
    }
}

fn wake_taps<S: Source>(shared: &HubShared<S>) {
    for entry in shared.taps.iter() {
        entry.value().signal.signal();
    }
}

// the dedicated driver. holds the hub state only weakly: once every hub handle and consumer
// is gone there is nobody left to deliver to, and the driver winds down on its next step.
async fn drive_hub<S>(weak: Weak<HubShared<S>>, mut cursor: S::Cursor)
where
    S: Source + 'static,
    S::Item: Clone + Sync,
{
    loop {
        let Some(shared) = weak.upgrade() else { break };
        let step = cursor.pull().await;
        match step {
            Ok(Step::Value(item)) => {
                if let Some(history) = &shared.history {
                    let mut guard = history.write().unwrap();
                    guard.push(item.clone());
                    for mut entry in shared.taps.iter_mut() {
                        let tap = entry.value_mut();
                        tap.tx.push(item.clone());
                        tap.signal.signal();
                    }
                    drop(guard);
                } else {
                    for mut entry in shared.taps.iter_mut() {
                        let tap = entry.value_mut();
                        tap.tx.push(item.clone());
                        tap.signal.signal();
                    }
                }
            }
            Ok(Step::Done) => {
                let _ = shared.terminal.set(None);
                wake_taps(&*shared);
                break;
            }
            Err(err) => {
                let _ = shared.terminal.set(Some(err));
                wake_taps(&*shared);
                break;
            }
        }
    }
    if let Err(err) = cursor.dispose().await {
        match weak.upgrade() {
            Some(shared) => {
                if shared.terminal.set(Some(err.clone())).is_err() {
                    error!(%err, "multicast upstream dispose failed after terminal");
                }
                wake_taps(&*shared);
            }
            None => error!(%err, "multicast upstream dispose failed with no consumers left"),
        }
    }
}

impl<S> Cursor for TapCursor<S>
where
    S: Source + 'static,
    S::Item: Clone + Sync,
{
    type Item = S::Item;

    fn poll_pull(&mut self, cx: &mut Context) -> Poll<Result<Step<S::Item>, Error>> {
        if self.finished {
            return Poll::Ready(Ok(Step::Done));
        }
        self.attach();
        loop {
            let attached = self.attached.as_mut().expect("attached above");
            if let Some(item) = attached.rx.pop() {
                return Poll::Ready(Ok(Step::Value(item)));
            }
            if self.shared.terminal.get().is_some() {
                let id = attached.id;
                self.finished = true;
                self.shared.taps.remove(&id);
                return Poll::Ready(match self.shared.terminal.get().expect("just observed") {
                    Some(err) => Err(err.clone()),
                    None => Ok(Step::Done),
                });
            }
            match attached.signal.poll_wait(cx) {
                Poll::Ready(()) => continue,
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn poll_dispose(&mut self, _cx: &mut Context) -> Poll<Result<(), Error>> {
        self.finished = true;
        if let Some(attached) = self.attached.take() {
            self.shared.taps.remove(&attached.id);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: Source> Drop for TapCursor<S> {
    fn drop(&mut self) {
        if let Some(attached) = self.attached.take() {
            self.shared.taps.remove(&attached.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::source_error,
        seq::{
            drain,
            sources::{fail, from_iter},
        },
        testkit::{ticks, Probe},
    };
    use std::time::Duration;

    #[tokio::test]
    async fn replay_catches_up_late_consumers_in_full() {
        let hub = replay(from_iter(0u32..5));
        let first = drain(hub.open()).await;
        assert_eq!(first.items, vec![0, 1, 2, 3, 4]);

        // attached long after the upstream finished, yet sees the whole history.
        let late = drain(hub.open()).await;
        assert_eq!(late.items, vec![0, 1, 2, 3, 4]);
        assert!(late.error.is_none());
    }

    #[tokio::test]
    async fn publish_gives_late_consumers_nothing_after_terminal() {
        let hub = publish(from_iter(0u32..5));
        let first = drain(hub.open()).await;
        assert_eq!(first.items, vec![0, 1, 2, 3, 4]);

        let late = drain(hub.open()).await;
        assert!(late.items.is_empty());
        assert!(late.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_consumers_all_see_every_item() {
        let hub = replay(ticks(Duration::from_millis(10), 0u32..20));
        let a = tokio::spawn(drain(hub.open()));
        let b = tokio::spawn(drain(hub.open()));
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(a.items, (0..20).collect::<Vec<_>>());
        assert_eq!(b.items, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn the_driver_starts_only_on_the_first_pull() {
        let probe = Probe::new();
        let stats = probe.stats();
        let hub = publish(probe.wrap(from_iter(0u32..3)));

        let _idle = hub.open();
        tokio::task::yield_now().await;
        assert_eq!(stats.pulled(), 0);

        let drained = drain(hub.open()).await;
        assert_eq!(drained.items, vec![0, 1, 2]);
        assert!(stats.pulled() > 0);

        // the driver's dispose of the upstream runs in its own task.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(stats.disposed(), 1);
    }

    #[tokio::test]
    async fn a_failure_is_broadcast_to_every_consumer() {
        let hub = publish(fail::<u32>(source_error(std::io::Error::other("down"))));
        let a = drain(hub.open()).await;
        assert!(matches!(a.error, Some(Error::Upstream(_))));
        let b = drain(hub.open()).await;
        assert!(matches!(b.error, Some(Error::Upstream(_))));
    }
}
