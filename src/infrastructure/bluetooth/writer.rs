//! Command Writer
//!
//! Serializes command strings onto the outbound half of the link. The board
//! needs settling time after each command, so writes are paced.

use crate::domain::settings::LinkSettings;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Timing of the writer loop
#[derive(Debug, Clone, Copy)]
pub struct WriterTiming {
    /// Longest wait for a queued command per loop iteration
    pub poll: Duration,
    /// Pause after every command
    pub pacing: Duration,
}

impl From<&LinkSettings> for WriterTiming {
    fn from(settings: &LinkSettings) -> Self {
        Self {
            poll: settings.writer_poll(),
            pacing: settings.command_pacing(),
        }
    }
}

enum WriterMessage {
    Command(String),
    Stop,
}

/// Handle to a running writer task
#[derive(Clone)]
pub struct CommandWriter {
    queue: mpsc::UnboundedSender<WriterMessage>,
    // Commands queued but not yet picked up by the writer task
    pending: Arc<AtomicUsize>,
    stopped: Arc<AtomicBool>,
}

impl CommandWriter {
    /// Start a writer task that owns `sink`
    pub fn spawn<W>(sink: W, timing: WriterTiming) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (queue, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_writer(
            sink,
            rx,
            Arc::clone(&pending),
            Arc::clone(&stopped),
            timing,
        ));
        (
            Self {
                queue,
                pending,
                stopped,
            },
            task,
        )
    }

    /// Always queue the command. Returns false only if the writer has exited.
    pub fn send_command(&self, command: impl Into<String>) -> bool {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.enqueue(command.into())
    }

    /// Queue the command only if nothing is waiting to be written, so a
    /// stream of live updates collapses to whatever the board can keep up
    /// with. Returns whether the command was queued.
    pub fn send_command_if_ready(&self, command: impl Into<String>) -> bool {
        if self
            .pending
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            trace!("Writer busy, dropping command");
            return false;
        }
        self.enqueue(command.into())
    }

    /// Stop the writer. Nothing more is written once this returns, except
    /// a command already being written; queued commands are discarded.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        // Wakes a writer idling in recv
        let _ = self.queue.send(WriterMessage::Stop);
    }

    pub fn is_alive(&self) -> bool {
        !self.queue.is_closed()
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn enqueue(&self, command: String) -> bool {
        if self.queue.send(WriterMessage::Command(command)).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }
}

async fn run_writer<W>(
    mut sink: W,
    mut rx: mpsc::UnboundedReceiver<WriterMessage>,
    pending: Arc<AtomicUsize>,
    stopped: Arc<AtomicBool>,
    timing: WriterTiming,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let message = match tokio::time::timeout(timing.poll, rx.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(_) => continue,
        };

        let command = match message {
            WriterMessage::Stop => break,
            WriterMessage::Command(command) => command,
        };
        pending.fetch_sub(1, Ordering::SeqCst);

        if stopped.load(Ordering::SeqCst) {
            debug!("Writer stopped, dropping queued commands");
            break;
        }

        if let Err(e) = write_command(&mut sink, &command).await {
            warn!("Error sending command: {}", e);
            break;
        }
        debug!("Send command: {:?}", command);

        // Give the controller board time to handle the message
        tokio::time::sleep(timing.pacing).await;
    }
    debug!("Command writer stopped");
}

async fn write_command<W>(sink: &mut W, command: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    sink.write_all(command.as_bytes()).await?;
    sink.flush().await
}
