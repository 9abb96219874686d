// test-only sources: scripted timed producers and an open/dispose probe.

use crate::{
    error::{Error, SourceError},
    seq::{Cursor, Source, Step},
};
use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::{sleep, Sleep};

/// Source that replays a script of delayed outcomes
///
/// Each event resolves `delay` after the pull that reaches it. After the last event the source
/// completes, optionally after a trailing delay of silence.
pub(crate) struct ScriptSource<T> {
    events: Arc<Vec<(Duration, Result<T, SourceError>)>>,
    tail: Option<Duration>,
}

/// Script of delayed items and failures; completes right after the last event.
pub(crate) fn script<T>(events: Vec<(Duration, Result<T, SourceError>)>) -> ScriptSource<T>
where
    T: Clone + Send + Sync + 'static,
{
    ScriptSource { events: Arc::new(events), tail: None }
}

/// Like [`script`], but holds the sequence open for `tail` of silence before completing.
pub(crate) fn script_tail<T>(
    events: Vec<(Duration, Result<T, SourceError>)>,
    tail: Duration,
) -> ScriptSource<T>
where
    T: Clone + Send + Sync + 'static,
{
    ScriptSource { events: Arc::new(events), tail: Some(tail) }
}

/// One item per `period`, completing right after the last.
pub(crate) fn ticks<T, I>(period: Duration, items: I) -> ScriptSource<T>
where
    T: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = T>,
{
    ScriptSource {
        events: Arc::new(items.into_iter().map(|item| (period, Ok(item))).collect()),
        tail: None,
    }
}

impl<T: Clone + Send + Sync + 'static> Source for ScriptSource<T> {
    type Item = T;
    type Cursor = ScriptCursor<T>;

    fn open(&self) -> Self::Cursor {
        ScriptCursor {
            events: Arc::clone(&self.events),
            tail: self.tail,
            idx: 0,
            sleep: None,
            finished: false,
        }
    }
}

pub(crate) struct ScriptCursor<T> {
    events: Arc<Vec<(Duration, Result<T, SourceError>)>>,
    tail: Option<Duration>,
    idx: usize,
    sleep: Option<Pin<Box<Sleep>>>,
    finished: bool,
}

impl<T: Clone + Send + Sync + 'static> Cursor for ScriptCursor<T> {
    type Item = T;

    fn poll_pull(&mut self, cx: &mut Context) -> Poll<Result<Step<T>, Error>> {
        if self.finished {
            return Poll::Ready(Ok(Step::Done));
        }
        let delay = if self.idx < self.events.len() {
            Some(self.events[self.idx].0)
        } else {
            self.tail
        };
        if let Some(delay) = delay {
            let timer = self.sleep.get_or_insert_with(|| Box::pin(sleep(delay)));
            match timer.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(()) => self.sleep = None,
            }
        }
        if self.idx < self.events.len() {
            let event = self.events[self.idx].1.clone();
            self.idx += 1;
            Poll::Ready(match event {
                Ok(item) => Ok(Step::Value(item)),
                Err(err) => {
                    self.finished = true;
                    Err(Error::Upstream(err))
                }
            })
        } else {
            self.finished = true;
            Poll::Ready(Ok(Step::Done))
        }
    }

    fn poll_dispose(&mut self, _cx: &mut Context) -> Poll<Result<(), Error>> {
        self.finished = true;
        self.sleep = None;
        Poll::Ready(Ok(()))
    }
}

/// Counters observed by [`Probe`]-wrapped sources
#[derive(Default)]
pub(crate) struct ProbeStats {
    opened: AtomicUsize,
    pulled: AtomicUsize,
    disposed: AtomicUsize,
}

impl ProbeStats {
    pub(crate) fn opened(&self) -> usize {
        self.opened.load(Relaxed)
    }

    pub(crate) fn pulled(&self) -> usize {
        self.pulled.load(Relaxed)
    }

    pub(crate) fn disposed(&self) -> usize {
        self.disposed.load(Relaxed)
    }
}

/// Wraps sources to count opens, resolved pulls, and disposals
pub(crate) struct Probe {
    stats: Arc<ProbeStats>,
}

impl Probe {
    pub(crate) fn new() -> Self {
        Probe { stats: Arc::new(ProbeStats::default()) }
    }

    pub(crate) fn stats(&self) -> Arc<ProbeStats> {
        Arc::clone(&self.stats)
    }

    pub(crate) fn wrap<S: Source>(&self, inner: S) -> Probed<S> {
        Probed { inner, stats: Arc::clone(&self.stats) }
    }
}

pub(crate) struct Probed<S> {
    inner: S,
    stats: Arc<ProbeStats>,
}

impl<S: Source> Source for Probed<S> {
    type Item = S::Item;
    type Cursor = ProbedCursor<S::Cursor>;

    fn open(&self) -> Self::Cursor {
        self.stats.opened.fetch_add(1, Relaxed);
        ProbedCursor {
            inner: self.inner.open(),
            stats: Arc::clone(&self.stats),
            disposed: false,
        }
    }
}

pub(crate) struct ProbedCursor<C> {
    inner: C,
    stats: Arc<ProbeStats>,
    disposed: bool,
}

impl<C: Cursor> Cursor for ProbedCursor<C> {
    type Item = C::Item;

    fn poll_pull(&mut self, cx: &mut Context) -> Poll<Result<Step<C::Item>, Error>> {
        let step = self.inner.poll_pull(cx);
        if step.is_ready() {
            self.stats.pulled.fetch_add(1, Relaxed);
        }
        step
    }

    fn poll_dispose(&mut self, cx: &mut Context) -> Poll<Result<(), Error>> {
        match self.inner.poll_dispose(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(out) => {
                if !self.disposed {
                    self.disposed = true;
                    self.stats.disposed.fetch_add(1, Relaxed);
                }
                Poll::Ready(out)
            }
        }
    }
}
