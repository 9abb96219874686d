// leaf sources. collaborators of the combinator engine: just enough producers to feed and test
// the concurrent operators.

use super::{Cursor, Source, Step};
use crate::error::{Error, SourceError};
use std::{
    marker::PhantomData,
    task::{Context, Poll},
};

/// Sequence yielding the items of a cloneable iterable
pub struct FromIter<I>(I);

/// Sequence of the items of `iter`, in order.
pub fn from_iter<I>(iter: I) -> FromIter<I>
where
    I: IntoIterator + Clone + Send + Sync,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    FromIter(iter)
}

impl<I> Source for FromIter<I>
where
    I: IntoIterator + Clone + Send + Sync,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    type Item = I::Item;
    type Cursor = IterCursor<I::IntoIter>;

    fn open(&self) -> Self::Cursor {
        IterCursor(Some(self.0.clone().into_iter()))
    }
}

/// Cursor over [`FromIter`]
pub struct IterCursor<It>(Option<It>);

impl<It> Cursor for IterCursor<It>
where
    It: Iterator + Send,
    It::Item: Send,
{
    type Item = It::Item;

    fn poll_pull(&mut self, _cx: &mut Context) -> Poll<Result<Step<Self::Item>, Error>> {
        Poll::Ready(Ok(match self.0.as_mut().and_then(Iterator::next) {
            Some(item) => Step::Value(item),
            None => {
                self.0 = None;
                Step::Done
            }
        }))
    }

    fn poll_dispose(&mut self, _cx: &mut Context) -> Poll<Result<(), Error>> {
        self.0 = None;
        Poll::Ready(Ok(()))
    }
}

/// Sequence of exactly one item
pub struct Just<T>(T);

/// Sequence yielding `val` once.
pub fn just<T>(val: T) -> Just<T>
where
    T: Clone + Send + Sync + 'static,
{
    Just(val)
}

impl<T> Source for Just<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Item = T;
    type Cursor = IterCursor<std::option::IntoIter<T>>;

    fn open(&self) -> Self::Cursor {
        IterCursor(Some(Some(self.0.clone()).into_iter()))
    }
}

/// Sequence that completes without producing
pub struct Empty<T>(PhantomData<fn() -> T>);

/// Sequence yielding nothing.
pub fn empty<T: Send + 'static>() -> Empty<T> {
    Empty(PhantomData)
}

impl<T: Send + 'static> Source for Empty<T> {
    type Item = T;
    type Cursor = IterCursor<std::iter::Empty<T>>;

    fn open(&self) -> Self::Cursor {
        IterCursor(Some(std::iter::empty()))
    }
}

/// Sequence that never resolves a pull
pub struct Never<T>(PhantomData<fn() -> T>);

/// Sequence whose pulls suspend forever.
pub fn never<T: Send + 'static>() -> Never<T> {
    Never(PhantomData)
}

impl<T: Send + 'static> Source for Never<T> {
    type Item = T;
    type Cursor = NeverCursor<T>;

    fn open(&self) -> Self::Cursor {
        NeverCursor(PhantomData)
    }
}

/// Cursor over [`Never`]
pub struct NeverCursor<T>(PhantomData<fn() -> T>);

impl<T: Send + 'static> Cursor for NeverCursor<T> {
    type Item = T;

    fn poll_pull(&mut self, _cx: &mut Context) -> Poll<Result<Step<T>, Error>> {
        // intentionally registers no waker: nothing will ever resume this pull.
        Poll::Pending
    }

    fn poll_dispose(&mut self, _cx: &mut Context) -> Poll<Result<(), Error>> {
        Poll::Ready(Ok(()))
    }
}

/// Sequence that fails its first pull
pub struct Fail<T> {
    err: SourceError,
    _item: PhantomData<fn() -> T>,
}

/// Sequence raising `err` on the first pull.
pub fn fail<T: Send + 'static>(err: SourceError) -> Fail<T> {
    Fail { err, _item: PhantomData }
}

impl<T: Send + 'static> Source for Fail<T> {
    type Item = T;
    type Cursor = FailCursor<T>;

    fn open(&self) -> Self::Cursor {
        FailCursor { err: Some(self.err.clone()), _item: PhantomData }
    }
}

/// Cursor over [`Fail`]
pub struct FailCursor<T> {
    err: Option<SourceError>,
    _item: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> Cursor for FailCursor<T> {
    type Item = T;

    fn poll_pull(&mut self, _cx: &mut Context) -> Poll<Result<Step<T>, Error>> {
        Poll::Ready(match self.err.take() {
            Some(err) => Err(Error::Upstream(err)),
            None => Ok(Step::Done),
        })
    }

    fn poll_dispose(&mut self, _cx: &mut Context) -> Poll<Result<(), Error>> {
        Poll::Ready(Ok(()))
    }
}
