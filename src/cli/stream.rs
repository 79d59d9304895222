//! Stream parser for assistant CLI stdout.

use futures_core::Stream;
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

use crate::cli::CliEvent;

/// Default buffer size for the event channel.
pub const DEFAULT_CHANNEL_BUFFER: usize = 64;

/// Error type for stream operations.
#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("I/O error reading stream: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Parse a single line of stream-json output.
///
/// # Errors
///
/// Returns `StreamError::Parse` if the JSON is invalid.
pub fn parse_event(line: &str) -> Result<CliEvent, StreamError> {
    let event: CliEvent = serde_json::from_str(line)?;
    Ok(event)
}

/// Turn a reader of line-delimited JSON into an ordered event stream.
/// Blank and malformed lines are logged and skipped; the stream ends
/// when the reader does.
pub fn read_events<R>(reader: R) -> impl Stream<Item = CliEvent>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let lines = BufReader::new(reader).lines();
    futures_util::stream::unfold(lines, |mut lines| async move {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match parse_event(trimmed) {
                        Ok(event) => return Some((event, lines)),
                        Err(e) => {
                            tracing::warn!(error = %e, "skipping malformed stream line");
                        }
                    }
                }
                Ok(None) => return None,
                Err(e) => {
                    tracing::warn!(error = %e, "stream read failed");
                    return None;
                }
            }
        }
    })
}

/// Line-by-line stream-json parser pumping events into a channel.
pub struct StreamParser;

impl StreamParser {
    /// Spawn a reader task that parses `reader` line by line and sends
    /// events into the returned channel. The channel closes when the
    /// stream ends.
    pub fn into_channel<R>(reader: R, buffer: usize) -> mpsc::Receiver<CliEvent>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(buffer);
        tokio::spawn(async move {
            let mut events = std::pin::pin!(read_events(reader));
            while let Some(event) = events.next().await {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        rx
    }
}
