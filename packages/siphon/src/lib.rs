//! Pull-based asynchronous sequences with concurrent combinators.
//!
//! A [`Source`] describes a sequence; [`open`](Source::open) yields a [`Cursor`] that is pulled
//! one item at a time and disposed with an awaitable release of everything it owns. On top of
//! that single protocol, the [`op`] module layers the concurrent combinators: fan-in
//! ([`merge`], [`flat_map`], [`amb`]), ordered-eager flattening ([`concat_map_eager`]),
//! switching ([`switch_map`]), latest-value composition ([`combine_latest`]), timing
//! ([`debounce`], [`sample`]), partitioning ([`group_by`]), and multicasting ([`publish`],
//! [`replay`]).
//!
//! The combinators spawn their upstream handlers on the ambient tokio runtime; a combinator
//! cursor must therefore be driven inside one.

#[macro_use]
extern crate tracing;

pub mod error;
pub mod op;
pub mod seq;
pub mod sync;
pub mod util;

mod driver;
#[cfg(test)]
pub(crate) mod testkit;

pub use crate::{
    error::{source_error, Error, SourceError},
    op::{
        amb, combine_latest, concat_map_eager, debounce, flat_map, group_by, merge, publish,
        replay, sample, switch_map,
    },
    seq::{boxed, drain, BoxSource, Cursor, CursorExt, Drained, DynCursor, Source, Step},
};
