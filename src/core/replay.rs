//! State reconstruction by replaying events.
//!
//! Current state is never stored; it is derived by folding events in ledger
//! order into a [`Projection`].

use crate::domain::{Event, EventFilter, TimeIndex, TimeRange};
use crate::error::Result;

use super::codec::PayloadRegistry;
use super::reader::LedgerReader;

/// A fold over events.
pub trait Projection {
    fn apply(&mut self, event: &Event, registry: &PayloadRegistry) -> Result<()>;
}

/// How far a replay goes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReplayBound {
    /// Every matching event
    #[default]
    All,

    /// Events with `time_index <= t`
    UpTo(TimeIndex),

    /// Events up to and including the last one carrying this `snapshot_id`.
    /// Replays nothing if no event carries it.
    Snapshot(String),
}

/// Fold every event matching `filter` (within `bound`) into `projection`.
///
/// Returns the number of events applied.
pub async fn replay<P: Projection + ?Sized>(
    reader: &LedgerReader,
    filter: &EventFilter,
    bound: &ReplayBound,
    projection: &mut P,
) -> Result<usize> {
    let registry = reader.registry();
    let mut applied = 0;

    match bound {
        ReplayBound::All => {
            for event in reader.iterate(filter).await? {
                projection.apply(&event, registry)?;
                applied += 1;
            }
        }
        ReplayBound::UpTo(t) => {
            let bounded = filter.clone().time_range(narrow(&filter.time_range, t));
            for event in reader.iterate(&bounded).await? {
                projection.apply(&event, registry)?;
                applied += 1;
            }
        }
        ReplayBound::Snapshot(snapshot_id) => {
            let stream = reader.iterate(filter).await?;
            let cutoff = stream
                .as_slice()
                .iter()
                .rposition(|e| e.snapshot_id() == Some(snapshot_id.as_str()));
            if let Some(cutoff) = cutoff {
                for event in stream.take(cutoff + 1) {
                    projection.apply(&event, registry)?;
                    applied += 1;
                }
            }
        }
    }

    Ok(applied)
}

/// Intersect `range` with `t' <= t`.
fn narrow(range: &TimeRange, t: &TimeIndex) -> TimeRange {
    let end = match &range.end {
        std::ops::Bound::Included(e) | std::ops::Bound::Excluded(e) if e < t => range.end.clone(),
        std::ops::Bound::Excluded(e) if e == t => range.end.clone(),
        _ => std::ops::Bound::Included(t.clone()),
    };
    TimeRange {
        start: range.start.clone(),
        end,
    }
}
