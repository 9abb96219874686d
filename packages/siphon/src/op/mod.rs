//! The concurrent combinators.

mod amb;
mod combine_latest;
mod concat_map_eager;
mod debounce;
mod flat_map;
mod group_by;
mod merge;
mod multicast;
mod sample;
mod switch_map;

pub use self::{
    amb::{amb, Amb, AmbCursor},
    combine_latest::{combine_latest, CombineLatest, CombineLatestCursor},
    concat_map_eager::{concat_map_eager, ConcatMapEager, ConcatMapEagerCursor},
    debounce::{debounce, Debounce, DebounceCursor},
    flat_map::{flat_map, FlatMap, FlatMapCursor},
    group_by::{group_by, GroupBy, GroupByCursor, GroupCursor, GroupSource},
    merge::{merge, Merge, MergeCursor},
    multicast::{publish, replay, Hub, TapCursor},
    sample::{sample, Sample, SampleCursor},
    switch_map::{switch_map, SwitchMap, SwitchMapCursor},
};

use crate::{sync::Cancel, util::AbortOnDrop};

// abortable timer task behind a cancel latch. aborting a sleeping timer is safe: the fire path
// has no await point between its staleness check and its emission, so an abort either stops
// the whole fire or none of it.
pub(crate) struct TimerHandle(AbortOnDrop);

impl TimerHandle {
    pub(crate) fn spawn<F>(fire: F) -> Self
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        TimerHandle(AbortOnDrop::spawn(fire))
    }
}

impl Cancel for TimerHandle {
    fn cancel(&self) {
        self.0.abort();
    }
}
