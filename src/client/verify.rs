use crate::error::{Error, Result};
use crate::piece::verify;
use crate::storage::StorageSink;
use crate::torrent::PieceHash;
use std::io;
use std::sync::Arc;
use tokio::task;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Delay before the first storage retry; later retries wait proportionally longer
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub(super) enum Outcome {
    /// Hash matched and the sink accepted the bytes
    Stored,
    /// Hash mismatch
    Corrupt,
    /// Cancelled before anything was written
    Abandoned,
    /// The sink kept failing
    Failed(Error),
}

#[derive(Debug)]
pub(super) struct Verified {
    pub index: usize,
    pub length: usize,
    pub outcome: Outcome,
}

/// Hash an assembled piece off the async threads and hand it to storage.
///
/// Cancellation is only observed before the first write: a write that has
/// started is retried to completion so no piece is left half committed.
pub(super) async fn verify_and_store(
    index: usize,
    data: Vec<u8>,
    expected: PieceHash,
    storage: Arc<dyn StorageSink>,
    attempts: u32,
    cancel: CancellationToken,
) -> Verified {
    let length = data.len();
    let outcome = match check(data, expected).await {
        Ok(Some(_)) if cancel.is_cancelled() => Outcome::Abandoned,
        Ok(Some(data)) => store(index, &data, storage.as_ref(), attempts.max(1)).await,
        Ok(None) => Outcome::Corrupt,
        Err(e) => Outcome::Failed(e),
    };

    Verified {
        index,
        length,
        outcome,
    }
}

/// The piece back if its SHA1 matches
async fn check(data: Vec<u8>, expected: PieceHash) -> Result<Option<Vec<u8>>> {
    let checked = task::spawn_blocking(move || {
        if verify(&data, &expected) {
            Some(data)
        } else {
            None
        }
    })
    .await
    .map_err(io::Error::from)?;
    Ok(checked)
}

async fn store(index: usize, data: &[u8], storage: &dyn StorageSink, attempts: u32) -> Outcome {
    let mut attempt = 1;
    loop {
        match storage.write_piece(index, data).await {
            Ok(()) => {
                debug!("Piece {} stored", index);
                return Outcome::Stored;
            }
            Err(e) if attempt < attempts => {
                warn!(
                    "Writing piece {} failed (attempt {}/{}): {}",
                    index, attempt, attempts, e
                );
                sleep(RETRY_BACKOFF * attempt).await;
                attempt += 1;
            }
            Err(e) => {
                return Outcome::Failed(Error::Storage(format!(
                    "Writing piece {} failed after {} attempts: {}",
                    index, attempts, e
                )))
            }
        }
    }
}
