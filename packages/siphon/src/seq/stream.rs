// bridge from the pull protocol to futures::Stream.

use super::{Cursor, Step};
use crate::error::Error;
use futures::stream::{FusedStream, Stream};
use std::{
    pin::Pin,
    task::{Context, Poll},
};

/// A cursor exposed as a `futures::Stream` of `Result` items
///
/// The stream ends after the cursor completes or fails; a failure is yielded as the final
/// `Err` item. Dropping the stream drops the cursor, which requests (but does not await)
/// teardown of whatever the cursor owns — callers that need disposal errors should drive the
/// cursor directly instead.
pub struct IntoStream<C> {
    cursor: C,
    terminated: bool,
}

impl<C> IntoStream<C> {
    pub(crate) fn new(cursor: C) -> Self {
        IntoStream { cursor, terminated: false }
    }
}

impl<C: Cursor + Unpin> Stream for IntoStream<C> {
    type Item = Result<C::Item, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None);
        }
        match this.cursor.poll_pull(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(Step::Value(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Ok(Step::Done)) => {
                this.terminated = true;
                Poll::Ready(None)
            }
            Poll::Ready(Err(err)) => {
                this.terminated = true;
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}

impl<C: Cursor + Unpin> FusedStream for IntoStream<C> {
    fn is_terminated(&self) -> bool {
        self.terminated
    }
}
