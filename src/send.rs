//! Outbound data: chunking over the prompt-based write commands.

use crate::at::{Session, Transport, UrcHandler};
use crate::error::Error;
use crate::modules::Dialect;

/// Push `payload` to `mux` in chunks of at most `max_send_chunk` bytes.
///
/// Each chunk is announced, written after the prompt and confirmed by the
/// module. The write cursor only moves past confirmed bytes; a chunk that
/// keeps failing for `send_attempts` rounds aborts the send. Returns the
/// number of bytes confirmed.
pub(crate) async fn send_chunked<S, U, D>(
    at: &mut Session<'_, S, U>,
    dialect: &D,
    mux: u8,
    payload: &[u8],
) -> Result<usize, Error>
where
    S: Transport,
    U: UrcHandler,
    D: Dialect,
{
    let config = at.config();
    let max_chunk = config.max_send_chunk.max(1);
    let mut cursor = 0;
    let mut failures = 0;

    while cursor < payload.len() {
        if failures >= config.send_attempts {
            warn!(
                "[{}] Send aborted after {} attempts, {}/{} bytes confirmed",
                mux,
                failures,
                cursor,
                payload.len()
            );
            break;
        }

        let mut len = (payload.len() - cursor).min(max_chunk);
        if let Some(space) = dialect.send_space(at, mux).await? {
            if space == 0 {
                trace!("[{}] Send buffer full", mux);
                failures += 1;
                at.reader().pause().await;
                continue;
            }
            len = len.min(space);
        }

        if !dialect.begin_send(at, mux, len).await? {
            warn!("[{}] No prompt for {} bytes", mux, len);
            failures += 1;
            continue;
        }
        at.write_raw(&payload[cursor..cursor + len]).await?;

        let confirmed = dialect.end_send(at, mux, len).await?.min(len);
        trace!("[{}] {}/{} bytes confirmed", mux, confirmed, len);
        cursor += confirmed;
        if confirmed < len {
            failures += 1;
        } else {
            failures = 0;
        }
    }

    Ok(cursor)
}
