//! Chunked writes for backfill steps.
//!
//! Each chunk runs inside its own savepoint. Outside a transaction a released
//! savepoint commits, so every chunk lands on its own; inside a migration
//! step's transaction the savepoints nest and the step's commit decides.

use rusqlite::Connection;
use schema_ledger_core::{batch_process, BatchError, BatchSummary};
use tracing::warn;

const SAVEPOINT: &str = "schema_ledger_chunk";

/// Run `apply` over consecutive chunks of at most `batch_size` items. A
/// failing chunk is rolled back to its savepoint before the error is returned;
/// earlier chunks are kept.
///
/// # Errors
/// Returns `InvalidBatchSize` for a zero batch size, or the first chunk
/// failure with its index and offset.
pub fn write_in_batches<T, F>(
    conn: &Connection,
    items: &[T],
    batch_size: usize,
    mut apply: F,
) -> Result<BatchSummary, BatchError>
where
    F: FnMut(&Connection, &[T]) -> anyhow::Result<()>,
{
    batch_process(items, batch_size, |chunk| -> anyhow::Result<()> {
        conn.execute_batch(&format!("SAVEPOINT {SAVEPOINT}"))?;
        match apply(conn, chunk) {
            Ok(()) => {
                conn.execute_batch(&format!("RELEASE {SAVEPOINT}"))?;
                Ok(())
            }
            Err(err) => {
                let rollback =
                    conn.execute_batch(&format!("ROLLBACK TO {SAVEPOINT}; RELEASE {SAVEPOINT}"));
                match rollback {
                    Ok(()) => Err(err),
                    Err(rollback_err) => {
                        warn!(error = %rollback_err, "failed to roll back chunk savepoint");
                        Err(err.context(format!(
                            "chunk savepoint {SAVEPOINT} could not be rolled back: {rollback_err}"
                        )))
                    }
                }
            }
        }
    })
}
