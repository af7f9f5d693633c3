//! Output pump: moves process output to the client as `stdout` messages.
//!
//! Runs as its own task so that a slow client never stalls inbound handling.
//! Chunks are forwarded one at a time in the order the reader produced them.

use protocol::{Message, Utf8Chunker};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::session::{ConnectionId, OutputStream};

/// Why the pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// The output stream ended, meaning the process is gone.
    ProcessExited,
    /// The outbound channel was closed by the transport.
    TransportClosed,
    /// The handler cancelled the pump.
    Cancelled,
}

/// Spawns the pump for one session.
pub fn spawn_output_pump(
    connection_id: ConnectionId,
    output: OutputStream,
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
) -> JoinHandle<PumpExit> {
    tokio::spawn(run_output_pump(connection_id, output, outbound, cancel))
}

/// Forwards output until the stream ends, the transport closes, or `cancel`
/// fires.
pub async fn run_output_pump(
    connection_id: ConnectionId,
    mut output: OutputStream,
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
) -> PumpExit {
    let mut chunker = Utf8Chunker::new();
    let mut forwarded = 0usize;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PumpExit::Cancelled,
            chunk = output.recv() => chunk,
        };

        let Some(chunk) = chunk else {
            break;
        };

        let ready = chunker.push(&chunk);
        if ready.is_empty() {
            continue;
        }
        forwarded += ready.len();
        if let Some(exit) = forward(&outbound, &cancel, ready).await {
            tracing::debug!(connection_id = %connection_id, ?exit, forwarded, "Output pump stopped");
            return exit;
        }
    }

    let rest = chunker.finish();
    if !rest.is_empty() {
        if let Some(exit) = forward(&outbound, &cancel, rest).await {
            return exit;
        }
    }

    tracing::debug!(connection_id = %connection_id, forwarded, "Output stream ended");
    PumpExit::ProcessExited
}

async fn forward(
    outbound: &mpsc::Sender<Message>,
    cancel: &CancellationToken,
    data: Vec<u8>,
) -> Option<PumpExit> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Some(PumpExit::Cancelled),
        sent = outbound.send(Message::stdout(data)) => sent.err().map(|_| PumpExit::TransportClosed),
    }
}
