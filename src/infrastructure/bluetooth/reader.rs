//! Response Reader
//!
//! Reads newline-terminated status lines from the inbound half of the link
//! and hands each one off. Decoding and applying happen elsewhere, on the
//! service's apply context.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    /// A complete line, without its terminator
    Line(String),
    /// The reader has stopped; no more lines will follow
    Closed,
}

/// Why the reader stopped
#[derive(Debug)]
pub enum ReaderExit {
    EndOfStream,
    Error(std::io::Error),
    /// The link was closed locally
    Closed,
}

/// Start a reader task. It runs until end of stream, an I/O error, or until
/// `close` fires or is dropped; `on_event` receives every line followed by
/// exactly one [`ReaderEvent::Closed`].
pub fn spawn<R, F>(source: R, close: oneshot::Receiver<()>, on_event: F) -> JoinHandle<ReaderExit>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: Fn(ReaderEvent) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let exit = read_lines(source, close, &on_event).await;
        match &exit {
            ReaderExit::Error(e) => warn!("Error reading response: {}", e),
            ReaderExit::EndOfStream => info!("Link reached end of stream"),
            ReaderExit::Closed => debug!("Link closed"),
        }
        on_event(ReaderEvent::Closed);
        exit
    })
}

async fn read_lines<R, F>(source: R, mut close: oneshot::Receiver<()>, on_event: &F) -> ReaderExit
where
    R: AsyncRead + Unpin,
    F: Fn(ReaderEvent),
{
    let mut reader = BufReader::new(source);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        tokio::select! {
            _ = &mut close => return ReaderExit::Closed,
            read = reader.read_until(b'\n', &mut buf) => match read {
                Ok(0) => return ReaderExit::EndOfStream,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf);
                    let line = text.trim_end_matches(['\r', '\n']);
                    debug!("RESPONSE: {}", line);
                    on_event(ReaderEvent::Line(line.to_string()));
                }
                Err(e) => return ReaderExit::Error(e),
            },
        }
    }
}
