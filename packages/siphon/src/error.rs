// error types for sequences and combinators.

use smallvec::SmallVec;
use std::{error::Error as StdError, sync::Arc};

/// Shared, cloneable payload for errors originating outside the engine (a failing upstream
/// producer, or a user-supplied mapping/combining function).
pub type SourceError = Arc<dyn StdError + Send + Sync + 'static>;

/// Wrap an arbitrary error value as a [`SourceError`]
pub fn source_error<E>(err: E) -> SourceError
where
    E: StdError + Send + Sync + 'static,
{
    Arc::new(err)
}

/// Terminal error of a sequence or of a dispose operation
///
/// Every sequence ends in exactly one of: natural completion, one raised `Error` (possibly an
/// aggregate of several concurrent causes), or successful disposal. Errors are cloneable so a
/// single failure can be surfaced to every consumer of a multicast hub.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// An upstream producer's pull operation failed
    #[error("upstream source failed: {0}")]
    Upstream(#[source] SourceError),
    /// A user-supplied mapping, keying, or combining function failed
    #[error("user-supplied function failed: {0}")]
    Structural(#[source] SourceError),
    /// A suspended operation was cancelled before it could complete
    #[error("operation cancelled before completion")]
    Cancelled,
    /// Releasing an upstream resource failed
    #[error("resource release failed: {0}")]
    Disposal(#[source] SourceError),
    /// A group sequence was consumed a second time
    #[error("group sequences support only a single consumer")]
    SingleConsumer,
    /// Several failures arrived concurrently and were merged
    #[error("{} concurrent failures", .0.len())]
    Aggregate(Vec<Error>),
}

impl Error {
    /// Shorthand for `Error::Upstream` around an arbitrary error value
    pub fn upstream<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Error::Upstream(source_error(err))
    }

    /// Shorthand for `Error::Structural` around an arbitrary error value
    pub fn structural<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Error::Structural(source_error(err))
    }

    // collapse an aggregate of accumulated errors into the terminal value the consumer sees:
    // nothing accumulated surfaces as None, a single cause surfaces bare, several causes
    // surface as one aggregate.
    pub(crate) fn collapse(mut errors: SmallVec<[Error; 1]>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => Some(errors.remove(0)),
            _ => Some(Error::Aggregate(errors.into_vec())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use smallvec::smallvec;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn collapse_shapes() {
        assert!(Error::collapse(smallvec![]).is_none());

        let one = Error::collapse(smallvec![Error::upstream(Boom)]).unwrap();
        assert!(matches!(one, Error::Upstream(_)));

        let many =
            Error::collapse(smallvec![Error::upstream(Boom), Error::Cancelled]).unwrap();
        match many {
            Error::Aggregate(errs) => assert_eq!(errs.len(), 2),
            other => panic!("expected aggregate, got {:?}", other),
        }
    }

    #[test]
    fn display_is_stable() {
        assert_eq!(
            Error::Cancelled.to_string(),
            "operation cancelled before completion",
        );
        assert_eq!(
            Error::Aggregate(vec![Error::Cancelled, Error::Cancelled]).to_string(),
            "2 concurrent failures",
        );
    }
}
