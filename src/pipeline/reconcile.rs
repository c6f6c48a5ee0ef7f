use crate::error::Result;
use crate::model::{db::session::Session, mongodb::Id};
use crate::storage::Storage;

use super::aggregator::Aggregator;

/// Recompute a session's counters from the vote ledger.
///
/// Applies everything still queued first, then overwrites every option
/// counter with its ledger count and the participant counter with the number
/// of distinct participants. The counters come from a ledger snapshot, so a
/// vote admitted while this runs may be counted twice, or have its increment
/// overwritten and go uncounted, until the next reconciliation.
pub async fn reconcile(
    storage: &Storage,
    aggregator: &Aggregator,
    session_id: Id,
) -> Result<Option<Session>> {
    aggregator.flush().await;
    let tally = storage.ledger.tally(session_id).await?;
    let session = storage
        .sessions
        .overwrite_counters(session_id, &tally)
        .await?;
    if session.is_some() {
        info!(
            "Reconciled session {session_id}: {} votes, {} participants",
            tally.votes.values().sum::<u64>(),
            tally.participants
        );
    }
    Ok(session)
}
