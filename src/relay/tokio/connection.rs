//! Per-connection reader and writer tasks.

use super::actor::{HubHandle, PeerHandle, SessionKey};
use crate::config::RelaySettings;
use crate::relay::command::{Command, LineBuffer};
use crate::relay::hub::CloseReason;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Serve one client from accept to teardown.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    hub: HubHandle,
    settings: RelaySettings,
) {
    let (outbound_tx, outbound_rx) = mpsc::channel(settings.outbound_queue);
    let (stop_tx, stop_rx) = oneshot::channel();

    let key = match hub.join(peer, PeerHandle::new(outbound_tx, stop_tx)).await {
        Ok(Some(key)) => key,
        // At capacity or shutting down: dropping the stream closes it
        Ok(None) | Err(_) => return,
    };

    let (reader, writer) = stream.into_split();
    tokio::spawn(write_frames(writer, outbound_rx));

    if let Some(reason) = read_lines(reader, key, &hub, settings, stop_rx).await {
        if let Err(e) = hub.leave(key, reason).await {
            debug!(slot = %key.slot, error = %e, "Leave not delivered");
        }
    }
}

/// Read, frame, and classify input until the session ends.
///
/// Returns the teardown reason, or `None` if the hub already released the
/// session (evicted, or the hub is gone).
pub async fn read_lines<R>(
    mut reader: R,
    key: SessionKey,
    hub: &HubHandle,
    settings: RelaySettings,
    mut stop: oneshot::Receiver<()>,
) -> Option<CloseReason>
where
    R: AsyncRead + Unpin,
{
    let mut lines = LineBuffer::new(settings.max_line_length);
    let mut chunk = vec![0u8; settings.read_chunk_size];

    loop {
        let n = tokio::select! {
            _ = &mut stop => return None,
            read = reader.read(&mut chunk) => match read {
                Ok(0) => return Some(CloseReason::PeerClosed),
                Ok(n) => n,
                Err(e) => {
                    debug!(slot = %key.slot, error = %e, "Read error");
                    return Some(CloseReason::ReadError);
                }
            },
        };
        lines.extend(&chunk[..n]);

        while let Some(command) = lines.next_command() {
            match command {
                Command::Quit => return Some(CloseReason::Quit),
                Command::NoOp => trace!(slot = %key.slot, "No-op"),
                Command::Broadcast(payload) => {
                    if hub.broadcast(key, payload).await.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

/// Drain the outbound queue into the socket, then shut the write side down.
pub async fn write_frames<W>(mut writer: W, mut outbound: mpsc::Receiver<Bytes>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!(error = %e, "Write error");
            // Closing the receiver makes the hub's next delivery fail
            return;
        }
    }
    let _ = writer.shutdown().await;
}
