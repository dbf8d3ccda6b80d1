use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::events::GatewayEvent;

/// Maximum frame length including the trailing newline.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Counts for a single ingest connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub forwarded: u64,
    pub rejected: u64,
}

fn line_too_long() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "ingest frame exceeds maximum length",
    )
}

/// Read one newline-terminated frame into `buf`, capped at MAX_LINE_LENGTH.
/// Returns Ok(0) on EOF. An oversized frame is consumed through its newline
/// and reported as InvalidData so the caller can keep reading.
async fn read_bounded_line<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    buf: &mut Vec<u8>,
) -> std::io::Result<usize> {
    let mut consumed = 0;
    let mut overflow = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            // EOF; a final frame without a newline still counts
            return if overflow { Err(line_too_long()) } else { Ok(consumed) };
        }

        let (chunk, complete) = match available.iter().position(|&b| b == b'\n') {
            Some(pos) => (&available[..=pos], true),
            None => (available, false),
        };
        let len = chunk.len();
        if !overflow {
            if buf.len() + len > MAX_LINE_LENGTH {
                overflow = true;
                buf.clear();
            } else {
                buf.extend_from_slice(chunk);
            }
        }
        reader.consume(len);
        consumed += len;

        if complete {
            return if overflow { Err(line_too_long()) } else { Ok(consumed) };
        }
    }
}

/// Handle a single ingest connection from accept to close.
///
/// Every frame is decoded at the boundary and forwarded to the dispatcher
/// queue in arrival order. Bad frames are logged and skipped. The connection
/// ends on EOF, on a read error, on cancellation, or when the dispatcher
/// queue is gone.
pub async fn handle_ingest_connection<R>(
    stream: R,
    peer: String,
    events: mpsc::Sender<GatewayEvent>,
    cancel: CancellationToken,
) -> ConnectionStats
where
    R: AsyncRead + Unpin,
{
    info!(%peer, "ingest connection opened");

    let mut reader = BufReader::new(stream);
    let mut buf = Vec::with_capacity(1024);
    let mut stats = ConnectionStats::default();

    loop {
        buf.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = read_bounded_line(&mut reader, &mut buf) => read,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                warn!(%peer, max = MAX_LINE_LENGTH, "dropping oversized frame");
                stats.rejected += 1;
                continue;
            }
            Err(e) => {
                warn!(%peer, error = %e, "ingest read failed");
                break;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match GatewayEvent::parse_line(line) {
            Ok(event) => {
                debug!(%peer, kind = event.kind(), "frame decoded");
                if events.send(event).await.is_err() {
                    warn!(%peer, "dispatcher queue closed, dropping connection");
                    break;
                }
                stats.forwarded += 1;
            }
            Err(e) => {
                warn!(%peer, error = %e, "skipping undecodable frame");
                stats.rejected += 1;
            }
        }
    }

    info!(
        %peer,
        forwarded = stats.forwarded,
        rejected = stats.rejected,
        "ingest connection closed"
    );
    stats
}
