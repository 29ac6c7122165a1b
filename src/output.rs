//! Buffered materialization of an archive stream

use crate::error::{BundleError, Result};
use log::warn;
use tokio::io::{AsyncRead, AsyncReadExt};

const DRAIN_CHUNK_SIZE: usize = 64 * 1024;

/// Read `reader` to EOF into one buffer of at most `limit` bytes
///
/// Growing past `limit`, or an allocator refusing the next reservation,
/// fails with [`BundleError::OutputTooLarge`]. Any other failure is returned
/// as it was raised.
pub async fn buffer_output<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut chunk = vec![0u8; DRAIN_CHUNK_SIZE];

    loop {
        let n = reader.read(&mut chunk).await.map_err(BundleError::from_io)?;
        if n == 0 {
            break;
        }

        let fits = data
            .len()
            .checked_add(n)
            .map_or(false, |total| total <= limit);
        if !fits || data.try_reserve(n).is_err() {
            warn!(
                "archive exceeded {} bytes while buffering; stream output is required",
                limit
            );
            return Err(BundleError::OutputTooLarge { limit });
        }
        data.extend_from_slice(&chunk[..n]);
    }

    Ok(data)
}
