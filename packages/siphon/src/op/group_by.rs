// group by: keyed partitioning into single-consumer group sequences with a one-item
// rendez-vous between the partitioner and each group's consumer.

use crate::{
    driver::{wind_down, Claim, Core, Entry, PullDriver},
    error::{Error, SourceError},
    seq::{Cursor, CursorExt, Source, Step},
    sync::{AtomicSlot, ResumeSignal},
};
use dashmap::DashMap;
use std::{
    hash::Hash,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, Ordering::{Acquire, Release}},
        Arc, OnceLock,
    },
    task::{Context, Poll},
};

// lane id of the upstream partitioner.
const UPSTREAM: u64 = 0;

/// Partitions an upstream by key into dynamically created group sequences
///
/// Each group is a single-consumer sub-sequence: a second consumption fails immediately.
/// Advancing the partitioner is gated on the targeted group's consumer having accepted the
/// previous item — a rendez-vous that bounds per-group buffering to one pending item, at the
/// price that an unconsumed group stalls the entire upstream. Disposing the main cursor does
/// not abandon the upstream mid-stream: remaining items are still routed to the live groups
/// until the upstream is naturally exhausted, because the upstream is shared by every group.
pub struct GroupBy<S, F, K> {
    source: S,
    key_fn: Arc<F>,
    _key: PhantomData<fn() -> K>,
}

/// Partition `source` by `key_fn`.
pub fn group_by<S, F, K>(source: S, key_fn: F) -> GroupBy<S, F, K>
where
    S: Source + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
    F: Fn(&S::Item) -> Result<K, SourceError> + Send + Sync + 'static,
{
    GroupBy { source, key_fn: Arc::new(key_fn), _key: PhantomData }
}

// per-group state shared between the partition driver and the group's consumer.
struct GroupShared<K, V> {
    key: K,
    // the single pending item.
    slot: AtomicSlot<V>,
    // raised by the driver when an item (or the terminal state) is available.
    ready: ResumeSignal,
    // raised by the consumer when the pending item has been accepted (or the group cancelled).
    consumed: ResumeSignal,
    done: AtomicBool,
    // set before done when the upstream failed: every group surfaces the failure.
    terminal_err: OnceLock<Error>,
    claimed: AtomicBool,
    cancelled: AtomicBool,
}

impl<K, V> GroupShared<K, V> {
    fn new(key: K) -> Self {
        GroupShared {
            key,
            slot: AtomicSlot::empty(),
            ready: ResumeSignal::new(),
            consumed: ResumeSignal::new(),
            done: AtomicBool::new(false),
            terminal_err: OnceLock::new(),
            claimed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }
}

/// One group of a [`GroupBy`], emitted to the main consumer as an item
pub struct GroupSource<K, V> {
    shared: Arc<GroupShared<K, V>>,
}

impl<K, V> GroupSource<K, V> {
    /// The key every item of this group mapped to.
    pub fn key(&self) -> &K {
        &self.shared.key
    }
}

impl<K, V> Source for GroupSource<K, V>
where
    K: Send + Sync + 'static,
    V: Send + 'static,
{
    type Item = V;
    type Cursor = GroupCursor<K, V>;

    fn open(&self) -> Self::Cursor {
        // single-consumer: the first open claims the group for good.
        let poisoned = self.shared.claimed.swap(true, Acquire);
        GroupCursor { shared: Arc::clone(&self.shared), poisoned, finished: false }
    }
}

/// Cursor over one group
pub struct GroupCursor<K, V> {
    shared: Arc<GroupShared<K, V>>,
    poisoned: bool,
    finished: bool,
}

impl<K, V> Cursor for GroupCursor<K, V>
where
    K: Send + Sync + 'static,
    V: Send + 'static,
{
    type Item = V;

    fn poll_pull(&mut self, cx: &mut Context) -> Poll<Result<Step<V>, Error>> {
        if self.finished {
            return Poll::Ready(Ok(Step::Done));
        }
        if self.poisoned {
            self.finished = true;
            return Poll::Ready(Err(Error::SingleConsumer));
        }
        loop {
            if let Some(item) = self.shared.slot.take() {
                self.shared.consumed.signal();
                return Poll::Ready(Ok(Step::Value(item)));
            }
            if self.shared.done.load(Acquire) {
                self.finished = true;
                return Poll::Ready(match self.shared.terminal_err.get() {
                    Some(err) => Err(err.clone()),
                    None => Ok(Step::Done),
                });
            }
            match self.shared.ready.poll_wait(cx) {
                Poll::Ready(()) => continue,
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn poll_dispose(&mut self, _cx: &mut Context) -> Poll<Result<(), Error>> {
        self.finished = true;
        if !self.poisoned {
            // cancel the group: the partitioner drops this group's items from now on.
            self.shared.cancelled.store(true, Release);
            self.shared.consumed.signal();
        }
        Poll::Ready(Ok(()))
    }
}

impl<K, V> Drop for GroupCursor<K, V> {
    fn drop(&mut self) {
        if !self.poisoned {
            self.shared.cancelled.store(true, Release);
            self.shared.consumed.signal();
        }
    }
}

struct Shared<K, V: Send + 'static> {
    core: Arc<Core<GroupSource<K, V>>>,
    groups: DashMap<K, Arc<GroupShared<K, V>>>,
    // set when the main cursor goes away: no new groups, but existing ones stay fed.
    main_closed: AtomicBool,
}

impl<S, F, K> Source for GroupBy<S, F, K>
where
    S: Source + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
    F: Fn(&S::Item) -> Result<K, SourceError> + Send + Sync + 'static,
{
    type Item = GroupSource<K, S::Item>;
    type Cursor = GroupByCursor<S, F, K>;

    fn open(&self) -> Self::Cursor {
        GroupByCursor {
            upstream: Some(self.source.open()),
            key_fn: Arc::clone(&self.key_fn),
            started: None,
            finished: false,
        }
    }
}

/// Cursor over [`GroupBy`]'s sequence of groups
pub struct GroupByCursor<S: Source, F, K: Send + Sync + 'static> {
    upstream: Option<S::Cursor>,
    key_fn: Arc<F>,
    started: Option<Arc<Shared<K, S::Item>>>,
    finished: bool,
}

impl<S, F, K> GroupByCursor<S, F, K>
where
    S: Source + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
    F: Fn(&S::Item) -> Result<K, SourceError> + Send + Sync + 'static,
{
    fn start(&mut self) -> Arc<Shared<K, S::Item>> {
        let upstream = &mut self.upstream;
        let key_fn = &self.key_fn;
        Arc::clone(self.started.get_or_insert_with(|| {
            let shared = Arc::new(Shared {
                core: Core::<GroupSource<K, S::Item>>::new(),
                groups: DashMap::new(),
                main_closed: AtomicBool::new(false),
            });
            let driver = Arc::new(PullDriver::new());
            shared.core.register(UPSTREAM, &driver);
            let cursor = upstream.take().expect("group by started twice (internal bug)");
            tokio::spawn(drive_partition(
                Arc::clone(&shared),
                cursor,
                Arc::clone(key_fn),
                Arc::clone(&driver),
            ));
            driver.grant_unbounded();
            shared
        }))
    }
}

// the partition driver: routes each upstream item to its group through the one-item
// rendez-vous, creating groups on first sight of a key.
async fn drive_partition<C, F, K>(
    shared: Arc<Shared<K, C::Item>>,
    mut cursor: C,
    key_fn: Arc<F>,
    driver: Arc<PullDriver>,
) where
    C: Cursor + 'static,
    C::Item: Send + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
    F: Fn(&C::Item) -> Result<K, SourceError> + Send + Sync + 'static,
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
                    let key = match key_fn(&item) {
                        Ok(key) => key,
                        Err(err) => {
                            let err = Error::Structural(err);
                            finish_groups(&shared, Some(&err));
                            shared.core.push_entry(Entry::Failed { lane: UPSTREAM, error: err });
                            break 'main;
                        }
                    };
                    let group = match shared.groups.get(&key) {
                        Some(group) => Arc::clone(group.value()),
                        None => {
                            if shared.main_closed.load(Acquire) {
                                // nobody can ever receive a new group's handle.
                                trace!("dropping item for unknown key after main cursor closed");
                                continue;
                            }
                            let group = Arc::new(GroupShared::new(key.clone()));
                            shared.groups.insert(key, Arc::clone(&group));
                            shared.core.push_entry(Entry::Item {
                                lane: UPSTREAM,
                                item: GroupSource { shared: Arc::clone(&group) },
                            });
                            group
                        }
                    };
                    deliver(&group, item).await;
                }
                Ok(Step::Done) => {
                    shared.core.push_entry(Entry::Done { lane: UPSTREAM });
                    finish_groups(&shared, None);
                    break 'main;
                }
                Err(error) => {
                    shared.core.push_entry(Entry::Failed { lane: UPSTREAM, error: error.clone() });
                    finish_groups(&shared, Some(&error));
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
    wind_down(&shared.core, UPSTREAM, cursor).await;
}

// the rendez-vous: publish the item, raise ready, and park until the group's consumer accepts
// it or the group is cancelled. this is what bounds per-group buffering to one item — and what
// lets an abandoned group stall the whole partition.
async fn deliver<K, V>(group: &GroupShared<K, V>, item: V) {
    if group.cancelled.load(Acquire) {
        return;
    }
    let displaced = group.slot.put(item);
    debug_assert!(displaced.is_none(), "rendez-vous overran its one-item bound (internal bug)");
    group.ready.signal();
    loop {
        group.consumed.wait().await;
        if group.cancelled.load(Acquire) {
            drop(group.slot.take());
            return;
        }
        if group.slot.is_empty() {
            return;
        }
    }
}

fn finish_groups<K: Eq + Hash, V: Send + 'static>(shared: &Shared<K, V>, err: Option<&Error>) {
    for entry in shared.groups.iter() {
        let group = entry.value();
        if let Some(err) = err {
            let _ = group.terminal_err.set(err.clone());
        }
        group.done.store(true, Release);
        group.ready.signal();
    }
}

impl<S, F, K> Cursor for GroupByCursor<S, F, K>
where
    S: Source + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
    F: Fn(&S::Item) -> Result<K, SourceError> + Send + Sync + 'static,
{
    type Item = GroupSource<K, S::Item>;

    fn poll_pull(&mut self, cx: &mut Context) -> Poll<Result<Step<Self::Item>, Error>> {
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
                // no teardown request: the shared upstream must drain to natural exhaustion,
                // feeding whichever groups still have consumers.
                shared.main_closed.store(true, Release);
                shared.core.poll_released(cx)
            }
        }
    }
}

impl<S: Source, F, K: Send + Sync + 'static> Drop for GroupByCursor<S, F, K> {
    fn drop(&mut self) {
        if let Some(shared) = &self.started {
            shared.main_closed.store(true, Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::source_error,
        seq::{drain, sources::from_iter},
    };
    use std::{collections::HashMap, time::Duration};

    async fn partition_fully<S>(source: S) -> HashMap<u32, Vec<u32>>
    where
        S: Source<Item = GroupSource<u32, u32>>,
    {
        let mut main = source.open();
        let mut tasks = Vec::new();
        loop {
            match main.pull().await.unwrap() {
                Step::Value(group) => {
                    let key = *group.key();
                    tasks.push(tokio::spawn(async move {
                        (key, drain(group.open()).await.items)
                    }));
                }
                Step::Done => break,
            }
        }
        main.dispose().await.unwrap();
        let mut out = HashMap::new();
        for task in tasks {
            let (key, items) = task.await.unwrap();
            out.insert(key, items);
        }
        out
    }

    #[tokio::test]
    async fn partitions_by_key_without_loss() {
        let partitions = partition_fully(group_by(from_iter(0u32..10), |v| Ok(v % 3))).await;
        assert_eq!(partitions[&0], vec![0, 3, 6, 9]);
        assert_eq!(partitions[&1], vec![1, 4, 7]);
        assert_eq!(partitions[&2], vec![2, 5, 8]);
    }

    #[tokio::test]
    async fn taking_one_item_per_group_corrupts_nothing() {
        let mut main = group_by(from_iter(0u32..12), |v| Ok(v % 3)).open();
        let mut firsts = Vec::new();
        loop {
            match main.pull().await.unwrap() {
                Step::Value(group) => {
                    let task = tokio::spawn(async move {
                        let mut cursor = group.open();
                        let first = cursor.pull().await.unwrap().value();
                        cursor.dispose().await.unwrap();
                        first
                    });
                    firsts.push(task.await.unwrap().unwrap());
                }
                Step::Done => break,
            }
        }
        main.dispose().await.unwrap();
        // each group saw exactly its own first item; closed groups swallowed the rest
        // without corrupting the open ones.
        assert_eq!(firsts, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn second_consumption_of_a_group_fails_immediately() {
        let mut main = group_by(from_iter(vec![1u32]), |_| Ok(0u32)).open();
        let group = match main.pull().await.unwrap() {
            Step::Value(group) => group,
            Step::Done => panic!("expected a group"),
        };

        let drainer = {
            let first = group.open();
            tokio::spawn(async move { drain(first).await })
        };
        // give the first consumer a moment to claim the group.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut second = group.open();
        match second.pull().await {
            Err(Error::SingleConsumer) => {}
            other => panic!("expected SingleConsumer, got {:?}", other.map(|_| ())),
        }

        assert_eq!(drainer.await.unwrap().items, vec![1]);
        assert!(main.pull().await.unwrap().is_done());
        main.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn upstream_failure_reaches_every_group_and_the_main_cursor() {
        let source = crate::testkit::script(vec![
            (Duration::ZERO, Ok(1u32)),
            (Duration::ZERO, Ok(2)),
            (Duration::ZERO, Err(source_error(std::io::Error::other("boom")))),
        ]);
        let mut main = group_by(source, |v| Ok(v % 2)).open();
        let mut group_tasks = Vec::new();
        let main_err = loop {
            match main.pull().await {
                Ok(Step::Value(group)) => group_tasks.push(tokio::spawn(async move {
                    drain(group.open()).await
                })),
                Ok(Step::Done) => panic!("expected failure"),
                Err(err) => break err,
            }
        };
        assert!(matches!(main_err, Error::Upstream(_)));
        for task in group_tasks {
            let drained = task.await.unwrap();
            assert_eq!(drained.items.len(), 1);
            assert!(matches!(drained.error, Some(Error::Upstream(_))));
        }
        main.dispose().await.unwrap();
    }
}
