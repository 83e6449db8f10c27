//! Chunked batch writes.
//!
//! Bulk writes (rollups, compaction, catalog sync) are split into chunks of
//! at most [`MAX_BATCH_STATEMENTS`] statements. Each chunk runs in its own
//! transaction: a failing chunk rolls back alone and earlier chunks stay
//! committed.

use rusqlite::{Connection, Transaction};
use toolpulse_analytics_core::Result;

/// Upper bound on statements per transaction
pub const MAX_BATCH_STATEMENTS: usize = 50;

/// Run `f` once per chunk of `items`, each chunk inside its own transaction.
///
/// Returns the sum of the per-chunk counts reported by `f`. Stops at the
/// first failing chunk and returns its error.
pub fn for_each_chunk<T, F>(conn: &Connection, items: &[T], mut f: F) -> Result<usize>
where
    F: FnMut(&Transaction<'_>, &[T]) -> Result<usize>,
{
    let mut total = 0;
    for (index, chunk) in items.chunks(MAX_BATCH_STATEMENTS).enumerate() {
        let tx = conn.unchecked_transaction()?;
        match f(&tx, chunk) {
            Ok(n) => {
                tx.commit()?;
                total += n;
            }
            Err(e) => {
                tracing::warn!(chunk = index, error = %e, "Batch chunk failed, rolled back");
                return Err(e);
            }
        }
    }
    Ok(total)
}
