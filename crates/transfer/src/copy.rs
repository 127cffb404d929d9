use ferry_protocol::{FerryError, RemoteFile};

use crate::engine::{AttemptContext, Outcome};
use crate::progress::ProgressReporter;

/// Block size for streaming copies.
pub const COPY_BLOCK_SIZE: usize = 1024 * 1024;

/// Streams `src` into `dst` from offset 0 until the source is exhausted.
///
/// Stop requests are checked between blocks. Returns the outcome to stop
/// with, or `None` when the whole file was copied and flushed.
pub async fn copy_stream(
    src: &mut dyn RemoteFile,
    dst: &mut dyn RemoteFile,
    ctx: &AttemptContext,
    reporter: &ProgressReporter,
) -> Result<Option<Outcome>, FerryError> {
    let mut offset = 0u64;
    loop {
        if let Some(outcome) = ctx.interrupted() {
            return Ok(Some(outcome));
        }
        let block = src.read_at(offset, COPY_BLOCK_SIZE).await?;
        if block.is_empty() {
            break;
        }
        dst.write_at(offset, &block).await?;
        offset += block.len() as u64;
        reporter.add(block.len() as u64);
    }
    dst.flush().await?;
    Ok(None)
}

/// Copies the byte range `[start, end)` from `src` to `dst` and flushes.
pub async fn copy_range(
    src: &mut dyn RemoteFile,
    dst: &mut dyn RemoteFile,
    start: u64,
    end: u64,
) -> Result<(), FerryError> {
    let mut offset = start;
    while offset < end {
        let want = (end - offset).min(COPY_BLOCK_SIZE as u64) as usize;
        let block = src.read_at(offset, want).await?;
        if block.len() != want {
            return Err(FerryError::unknown(format!(
                "short read at offset {offset}: wanted {want} bytes, got {}",
                block.len()
            )));
        }
        dst.write_at(offset, &block).await?;
        offset += want as u64;
    }
    dst.flush().await
}
