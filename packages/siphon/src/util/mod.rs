//! Assorted utilities.

mod abort_on_drop;

pub use self::abort_on_drop::AbortOnDrop;
