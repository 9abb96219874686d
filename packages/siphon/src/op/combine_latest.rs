// combine latest: one output per upstream update, built from every source's latest value.

use crate::{
    driver::{Core, Entry},
    error::{Error, SourceError},
    seq::{Cursor, Source, Step},
};
use std::{
    marker::PhantomData,
    sync::{
        atomic::Ordering::{AcqRel, Acquire, Release},
        Arc,
    },
    task::{Context, Poll},
};

/// Combines the most recent value of every source through a combining function
///
/// Nothing is emitted until every source has produced at least once; from then on any single
/// source update re-invokes the combiner on a private snapshot of the latest values. A source
/// that completes before ever producing ends the whole sequence immediately — no combination
/// is possible any more. A source that completes after producing leaves its last value in
/// place; the sequence completes once every source has.
pub struct CombineLatest<S, G, R> {
    sources: Arc<Vec<S>>,
    combiner: Arc<G>,
    _out: PhantomData<fn() -> R>,
}

/// Combine `sources` through `combiner`.
pub fn combine_latest<S, G, R>(sources: Vec<S>, combiner: G) -> CombineLatest<S, G, R>
where
    S: Source + 'static,
    S::Item: Clone,
    G: Fn(&[S::Item]) -> Result<R, SourceError> + Send + Sync + 'static,
    R: Send + 'static,
{
    CombineLatest { sources: Arc::new(sources), combiner: Arc::new(combiner), _out: PhantomData }
}

impl<S, G, R> Source for CombineLatest<S, G, R>
where
    S: Source + 'static,
    S::Item: Clone,
    G: Fn(&[S::Item]) -> Result<R, SourceError> + Send + Sync + 'static,
    R: Send + 'static,
{
    type Item = R;
    type Cursor = CombineLatestCursor<S, G, R>;

    fn open(&self) -> Self::Cursor {
        CombineLatestCursor {
            sources: Arc::clone(&self.sources),
            combiner: Arc::clone(&self.combiner),
            started: None,
            latest: vec![None; self.sources.len()],
            missing: self.sources.len(),
            finished: false,
            _out: PhantomData,
        }
    }
}

/// Cursor over [`CombineLatest`]
pub struct CombineLatestCursor<S: Source, G, R> {
    sources: Arc<Vec<S>>,
    combiner: Arc<G>,
    started: Option<Arc<Core<S::Item>>>,
    // most recent value per source. maintained by this cursor alone, so no concurrent writer
    // can tear a snapshot.
    latest: Vec<Option<S::Item>>,
    // sources that have never produced.
    missing: usize,
    finished: bool,
    _out: PhantomData<fn() -> R>,
}

impl<S, G, R> CombineLatestCursor<S, G, R>
where
    S: Source + 'static,
    S::Item: Clone,
{
    fn start(&mut self) -> Arc<Core<S::Item>> {
        let sources = &self.sources;
        Arc::clone(self.started.get_or_insert_with(|| {
            let core = Core::<S::Item>::new();
            core.live.store(sources.len(), Release);
            for (lane, source) in sources.iter().enumerate() {
                let driver = core.spawn_handler(lane as u64, source.open());
                // one value at a time per source: the next pull is granted when this cursor
                // has folded the previous one into the snapshot.
                driver.grant(1);
            }
            core
        }))
    }
}

impl<S, G, R> Cursor for CombineLatestCursor<S, G, R>
where
    S: Source + 'static,
    S::Item: Clone,
    G: Fn(&[S::Item]) -> Result<R, SourceError> + Send + Sync + 'static,
    R: Send + 'static,
{
    type Item = R;

    fn poll_pull(&mut self, cx: &mut Context) -> Poll<Result<Step<R>, Error>> {
        if self.finished {
            return Poll::Ready(Ok(Step::Done));
        }
        let core = self.start();
        loop {
            // safety: this cursor is the queue's only consumer.
            while let Some(entry) = unsafe { core.entries.pop() } {
                match entry {
                    Entry::Item { lane, item } => {
                        let lane_idx = lane as usize;
                        if self.latest[lane_idx].is_none() {
                            self.missing -= 1;
                        }
                        self.latest[lane_idx] = Some(item);
                        if let Some(driver) = core.lanes.get(&lane) {
                            driver.grant(1);
                        }
                        if self.missing == 0 {
                            let snapshot: Vec<S::Item> = self
                                .latest
                                .iter()
                                .map(|slot| slot.clone().expect("missing is zero (internal bug)"))
                                .collect();
                            match (self.combiner)(&snapshot) {
                                Ok(out) => return Poll::Ready(Ok(Step::Value(out))),
                                Err(err) => {
                                    core.errors.push(Error::Structural(err));
                                    self.finished = true;
                                    core.request_teardown();
                                    return Poll::Ready(core.terminal());
                                }
                            }
                        }
                    }
                    Entry::Done { lane } => {
                        if self.latest[lane as usize].is_none() {
                            // a source that never produced makes every future combination
                            // impossible: end the whole sequence now.
                            self.finished = true;
                            core.request_teardown();
                            return Poll::Ready(core.terminal());
                        }
                        core.live.fetch_sub(1, AcqRel);
                    }
                    Entry::Failed { error, .. } => {
                        core.errors.push(error);
                        self.finished = true;
                        core.request_teardown();
                        return Poll::Ready(core.terminal());
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
            Some(core) => {
                self.finished = true;
                core.request_teardown();
                core.poll_released(cx)
            }
        }
    }
}

impl<S: Source, G, R> Drop for CombineLatestCursor<S, G, R> {
    fn drop(&mut self) {
        if let Some(core) = &self.started {
            core.request_teardown();
        }
    }
}
