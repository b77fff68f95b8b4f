//! Selection policies over a [`DatumBackend`].
//!
//! - [`uniform`]: round-robin over a filtered subset. The caller supplies an
//!   `offset` that varies across calls; position `offset mod count` in the
//!   subset's order is returned, so consecutive offsets cycle through every
//!   match without cursor state.
//! - [`ring`]: unbiased random choice among the datums holding the maximum
//!   replication counter. Each datum's `rvalue` is a fixed point on a ring
//!   of `u64` values and the caller-drawn `r` is a random rotation; the first
//!   point at or after `r` wins, wrapping to the smallest `rvalue`.
//! - [`replication`]: [`ring`] followed by decrementing the winner's counter.
//! - [`eviction_candidate`]: the soonest-expired datum if any has expired,
//!   else the lowest-priority datum.
//!
//! Randomness is always an argument, never drawn here.

use tracing::debug;
use veil_core::{datum, AbsoluteTime, Datum};

use crate::error::BackendResult;
use crate::storage::{DatumBackend, Selection};

/// Returns the datum at position `offset mod count` of `selection`.
///
/// # Errors
///
/// Propagates backend failures.
pub async fn uniform(
    backend: &mut dyn DatumBackend,
    selection: &Selection,
    offset: u64,
) -> BackendResult<Option<Datum>> {
    let count = backend.count(selection).await?;
    if count == 0 {
        debug!(selection = selection.label(), "no matches");
        return Ok(None);
    }
    let position = offset % count;
    debug!(selection = selection.label(), count, position, "uniform pick");
    backend.nth(selection, position).await
}

/// Picks one datum among those with the highest replication counter.
///
/// # Errors
///
/// Propagates backend failures.
pub async fn ring(backend: &mut dyn DatumBackend, r: u64) -> BackendResult<Option<Datum>> {
    let Some(max) = backend.max_replication().await? else {
        return Ok(None);
    };
    if let Some(hit) = backend.ring_successor(max, r).await? {
        return Ok(Some(hit));
    }
    // r fell past the largest rvalue: wrap around.
    backend.ring_successor(max, 0).await
}

/// Selects a datum for replication and decrements its counter.
///
/// The decrement targets the selected uid. The returned datum carries the
/// counter as it is after the decrement.
///
/// # Errors
///
/// Propagates backend failures.
pub async fn replication(backend: &mut dyn DatumBackend, r: u64) -> BackendResult<Option<Datum>> {
    let Some(mut chosen) = ring(backend, r).await? else {
        return Ok(None);
    };
    if !backend.decrement_replication(chosen.uid).await? {
        debug!(uid = %chosen.uid, "replication candidate vanished before decrement");
        return Ok(None);
    }
    chosen.replication = datum::decrement_replication(chosen.replication);
    Ok(Some(chosen))
}

/// Picks the datum to evict first.
///
/// # Errors
///
/// Propagates backend failures.
pub async fn eviction_candidate(
    backend: &mut dyn DatumBackend,
    now: AbsoluteTime,
) -> BackendResult<Option<Datum>> {
    if let Some(expired) = backend.soonest_expired(now).await? {
        return Ok(Some(expired));
    }
    backend.lowest_priority().await
}
