// merge: fan-in of N static sources with no cross-source ordering.

use crate::{
    driver::{Core, CreditPolicy, Entry},
    error::Error,
    seq::{Cursor, Source, Step},
};
use std::{
    sync::{
        atomic::Ordering::{AcqRel, Acquire, Release},
        Arc,
    },
    task::{Context, Poll},
};

/// Fan-in of several sequences, emitting items in whatever order they arrive
///
/// Every source is subscribed as soon as the cursor is first pulled; each upstream runs under
/// its own `prefetch` credit budget. One source failing does not cut short the items already in
/// flight from its siblings: the failure is accumulated and raised only once every upstream has
/// reached a terminal state and the queued items have been drained.
pub struct Merge<S> {
    sources: Arc<Vec<S>>,
    prefetch: usize,
}

/// Merge `sources`, pulling up to `prefetch` items ahead per source.
///
/// Reached through validated calls: `prefetch` must be at least 1.
pub fn merge<S: Source + 'static>(sources: Vec<S>, prefetch: usize) -> Merge<S> {
    debug_assert!(prefetch >= 1);
    Merge { sources: Arc::new(sources), prefetch }
}

impl<S: Source + 'static> Source for Merge<S> {
    type Item = S::Item;
    type Cursor = MergeCursor<S>;

    fn open(&self) -> Self::Cursor {
        MergeCursor {
            sources: Arc::clone(&self.sources),
            policy: CreditPolicy::new(self.prefetch),
            started: None,
            finished: false,
        }
    }
}

struct Started<T: Send + 'static> {
    core: Arc<Core<T>>,
    // items taken per lane since the last replenishment.
    consumed: Vec<usize>,
}

/// Cursor over [`Merge`]
pub struct MergeCursor<S: Source> {
    sources: Arc<Vec<S>>,
    policy: CreditPolicy,
    started: Option<Started<S::Item>>,
    finished: bool,
}

impl<S: Source + 'static> MergeCursor<S> {
    fn start(&mut self) -> Arc<Core<S::Item>> {
        let sources = &self.sources;
        let policy = self.policy;
        let started = self.started.get_or_insert_with(|| {
            let core = Core::new();
            core.live.store(sources.len(), Release);
            for (lane, source) in sources.iter().enumerate() {
                let driver = core.spawn_handler(lane as u64, source.open());
                policy.initial(&driver);
            }
            Started { core, consumed: vec![0; sources.len()] }
        });
        Arc::clone(&started.core)
    }
}

impl<S: Source + 'static> Cursor for MergeCursor<S> {
    type Item = S::Item;

    fn poll_pull(&mut self, cx: &mut Context) -> Poll<Result<Step<S::Item>, Error>> {
        if self.finished {
            return Poll::Ready(Ok(Step::Done));
        }
        let policy = self.policy;
        let core = self.start();
        loop {
            // safety: this cursor is the queue's only consumer.
            while let Some(entry) = unsafe { core.entries.pop() } {
                match entry {
                    Entry::Item { lane, item } => {
                        if let Some(driver) = core.lanes.get(&lane) {
                            let started = self.started.as_mut().expect("started above");
                            policy.consumed(&mut started.consumed[lane as usize], driver.value());
                        }
                        return Poll::Ready(Ok(Step::Value(item)));
                    }
                    Entry::Failed { error, .. } => {
                        core.errors.push(error);
                        core.live.fetch_sub(1, AcqRel);
                    }
                    Entry::Done { .. } => {
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

impl<S: Source> Drop for MergeCursor<S> {
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
    };

    #[tokio::test]
    async fn result_set_is_the_union_of_all_sources() {
        let sources = vec![
            from_iter(0..100),
            from_iter(100..250),
            from_iter(250..300),
        ];
        let drained = drain(merge(sources, 4).open()).await;
        assert!(drained.error.is_none());

        let mut items = drained.items;
        items.sort_unstable();
        assert_eq!(items, (0..300).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn zero_sources_complete_immediately() {
        let drained = drain(merge(Vec::<crate::seq::sources::Empty<u32>>::new(), 1).open()).await;
        assert!(drained.items.is_empty());
        assert!(drained.error.is_none());
    }

    #[tokio::test]
    async fn prefetch_tuning_never_changes_the_result_set() {
        for prefetch in 1..=6 {
            let sources = vec![from_iter(0..40), from_iter(40..90)];
            let mut items = drain(merge(sources, prefetch).open()).await.items;
            items.sort_unstable();
            assert_eq!(items, (0..90).collect::<Vec<_>>(), "prefetch {}", prefetch);
        }
    }

    #[tokio::test]
    async fn sibling_items_survive_one_failing_source() {
        let drained = drain(
            merge(
                vec![
                    boxed(fail::<u32>(source_error(std::io::Error::other("down")))),
                    boxed(from_iter(1..=50)),
                ],
                4,
            )
            .open(),
        )
        .await;

        let mut items = drained.items;
        items.sort_unstable();
        assert_eq!(items, (1..=50).collect::<Vec<_>>());
        assert!(matches!(drained.error, Some(Error::Upstream(_))));
    }

    #[tokio::test]
    async fn merging_empties_completes_cleanly() {
        let drained = drain(merge(vec![empty::<u32>(), empty(), empty()], 2).open()).await;
        assert!(drained.items.is_empty());
        assert!(drained.error.is_none());
    }

    #[tokio::test]
    async fn dispose_twice_completes_without_double_release() {
        let mut cursor = merge(vec![from_iter(0..1000), from_iter(1000..2000)], 2).open();
        let first = cursor.pull().await.unwrap();
        assert!(!first.is_done());
        assert!(cursor.dispose().await.is_ok());
        assert!(cursor.dispose().await.is_ok());
    }

    #[tokio::test]
    async fn dispose_before_first_pull_is_a_no_op() {
        let mut cursor = merge(vec![from_iter(0..10)], 1).open();
        assert!(cursor.dispose().await.is_ok());
    }
}
