// the pull protocol: sources, cursors, and the futures that drive them.

pub mod sources;
#[cfg(feature = "futures-interop")]
pub mod stream;

use crate::error::Error;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// One successful resolution of a pull operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step<T> {
    /// The sequence produced its next item
    Value(T),
    /// The sequence completed; no further item will ever be produced
    Done,
}

impl<T> Step<T> {
    /// The produced item, if any
    pub fn value(self) -> Option<T> {
        match self {
            Step::Value(val) => Some(val),
            Step::Done => None,
        }
    }

    /// Whether this is the completion step
    pub fn is_done(&self) -> bool {
        matches!(self, Step::Done)
    }
}

/// A pull-based asynchronous sequence
///
/// Stateless description of a producer. Each [`open`](Self::open) creates an independent cursor
/// over a fresh consumption of the sequence; opening is pure and has no side effects until the
/// cursor is first pulled.
pub trait Source: Send + Sync {
    type Item: Send + 'static;
    type Cursor: Cursor<Item = Self::Item> + 'static;

    /// Create an independent cursor over this sequence.
    fn open(&self) -> Self::Cursor;
}

/// Stateful cursor over one consumption of a [`Source`]
///
/// At most one pull may be outstanding at a time; the combinators' drivers enforce this for
/// every upstream they own, and consumers get it for free from the `&mut self` receivers.
/// After [`poll_pull`](Self::poll_pull) resolves `Step::Done` or an error, the cursor must
/// still be disposed; [`poll_dispose`](Self::poll_dispose) is suspending, idempotent, releases
/// every resource transitively owned by the cursor, and may itself resolve to an aggregated
/// error if releasing an upstream failed.
pub trait Cursor: Send {
    type Item;

    fn poll_pull(&mut self, cx: &mut Context) -> Poll<Result<Step<Self::Item>, Error>>;

    fn poll_dispose(&mut self, cx: &mut Context) -> Poll<Result<(), Error>>;
}

impl<C: Cursor + ?Sized> Cursor for Box<C> {
    type Item = C::Item;

    fn poll_pull(&mut self, cx: &mut Context) -> Poll<Result<Step<Self::Item>, Error>> {
        (**self).poll_pull(cx)
    }

    fn poll_dispose(&mut self, cx: &mut Context) -> Poll<Result<(), Error>> {
        (**self).poll_dispose(cx)
    }
}

/// Cursor with its item type erased behind a box
pub type DynCursor<T> = Box<dyn Cursor<Item = T>>;

// object-safe shim behind BoxSource.
trait ErasedSource<T>: Send + Sync {
    fn open_erased(&self) -> DynCursor<T>;
}

impl<S: Source> ErasedSource<S::Item> for S {
    fn open_erased(&self) -> DynCursor<S::Item> {
        Box::new(self.open())
    }
}

/// Source with its concrete type erased behind a box
///
/// Lets sequences of different concrete types feed the same fan-in combinator.
pub struct BoxSource<T>(Box<dyn ErasedSource<T>>);

/// Erase a source's concrete type.
pub fn boxed<S: Source + 'static>(source: S) -> BoxSource<S::Item> {
    BoxSource(Box::new(source))
}

impl<T: Send + 'static> Source for BoxSource<T> {
    type Item = T;
    type Cursor = DynCursor<T>;

    fn open(&self) -> Self::Cursor {
        self.0.open_erased()
    }
}

/// Awaitable adapters over the poll protocol
pub trait CursorExt: Cursor {
    /// Future resolving to the next step of the sequence.
    fn pull(&mut self) -> PullFut<'_, Self> {
        PullFut(self)
    }

    /// Future resolving once every resource owned by this cursor is released.
    fn dispose(&mut self) -> DisposeFut<'_, Self> {
        DisposeFut(self)
    }

    /// Adapt this cursor into a `futures::Stream` of `Result` items.
    #[cfg(feature = "futures-interop")]
    fn into_stream(self) -> stream::IntoStream<Self>
    where
        Self: Sized,
    {
        stream::IntoStream::new(self)
    }
}

impl<C: Cursor + ?Sized> CursorExt for C {}

/// Future for [`CursorExt::pull`]
pub struct PullFut<'a, C: ?Sized>(&'a mut C);

impl<C: Cursor + ?Sized> Future for PullFut<'_, C> {
    type Output = Result<Step<C::Item>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        self.get_mut().0.poll_pull(cx)
    }
}

/// Future for [`CursorExt::dispose`]
pub struct DisposeFut<'a, C: ?Sized>(&'a mut C);

impl<C: Cursor + ?Sized> Future for DisposeFut<'_, C> {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        self.get_mut().0.poll_dispose(cx)
    }
}

/// Everything a finished consumption produced
///
/// The items that arrived before the terminal outcome, the pull-path terminal error if the
/// sequence failed, and the disposal error if releasing the sequence's resources failed.
#[derive(Debug)]
pub struct Drained<T> {
    pub items: Vec<T>,
    pub error: Option<Error>,
    pub dispose_error: Option<Error>,
}

/// Pull a cursor to its terminal outcome, then dispose it.
pub async fn drain<C: Cursor>(mut cursor: C) -> Drained<C::Item> {
    let mut items = Vec::new();
    let error = loop {
        match cursor.pull().await {
            Ok(Step::Value(item)) => items.push(item),
            Ok(Step::Done) => break None,
            Err(err) => break Some(err),
        }
    };
    let dispose_error = cursor.dispose().await.err();
    Drained { items, error, dispose_error }
}
