//! Chunked processing for backfill steps.
//!
//! Each chunk is handed to the caller's `apply` in input order and may be
//! written and committed on its own. There is no atomicity across chunks: a
//! failure in chunk `n` leaves chunks `0..n` applied. Callers that need the
//! whole dataset to land or not at all must not split it.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BatchError, BoxError};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchSummary {
    pub batches: usize,
    pub items: usize,
}

/// Call `apply` once per consecutive chunk of at most `batch_size` items,
/// stopping at the first error. Empty input makes zero calls.
///
/// # Errors
/// Returns `InvalidBatchSize` for a zero batch size, or the first `apply`
/// failure together with the failing chunk's index and offset.
pub fn batch_process<T, F, E>(
    items: &[T],
    batch_size: usize,
    mut apply: F,
) -> Result<BatchSummary, BatchError>
where
    F: FnMut(&[T]) -> Result<(), E>,
    E: Into<BoxError>,
{
    if batch_size == 0 {
        return Err(BatchError::InvalidBatchSize(batch_size));
    }

    let mut summary = BatchSummary::default();
    for (batch_index, chunk) in items.chunks(batch_size).enumerate() {
        let offset = batch_index * batch_size;
        apply(chunk).map_err(|err| BatchError::Apply {
            batch_index,
            offset,
            source: err.into(),
        })?;
        summary.batches += 1;
        summary.items += chunk.len();
        debug!(
            batch_index,
            offset,
            size = chunk.len(),
            total = items.len(),
            "batch applied"
        );
    }
    Ok(summary)
}

/// Streaming variant of [`batch_process`] for working sets that are not
/// materialized up front. At most `batch_size` items are buffered at a time.
///
/// # Errors
/// Same as [`batch_process`].
pub fn batch_process_iter<I, F, E>(
    items: I,
    batch_size: usize,
    mut apply: F,
) -> Result<BatchSummary, BatchError>
where
    I: IntoIterator,
    F: FnMut(&[I::Item]) -> Result<(), E>,
    E: Into<BoxError>,
{
    if batch_size == 0 {
        return Err(BatchError::InvalidBatchSize(batch_size));
    }

    let mut summary = BatchSummary::default();
    let mut buffer = Vec::new();
    let mut iter = items.into_iter();
    loop {
        buffer.clear();
        buffer.extend(iter.by_ref().take(batch_size));
        if buffer.is_empty() {
            break;
        }
        let batch_index = summary.batches;
        let offset = summary.items;
        apply(&buffer).map_err(|err| BatchError::Apply {
            batch_index,
            offset,
            source: err.into(),
        })?;
        summary.batches += 1;
        summary.items += buffer.len();
        debug!(batch_index, offset, size = buffer.len(), "batch applied");
        if buffer.len() < batch_size {
            break;
        }
    }
    Ok(summary)
}
