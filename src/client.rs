//! Per-connection tasks
//!
//! Each accepted WebSocket runs an independent reader loop that decodes
//! frames and hands them to the hub, plus a writer task that owns the only
//! serialized path onto the socket. The reader refreshes liveness for every
//! inbound frame and runs the hub disconnect path exactly once on the way
//! out, whatever ended the stream.

use std::sync::Arc;

use actix_ws::{Message, MessageStream, Session};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::hub::{ClientRole, ConnectionHub, WriterCommand};
use crate::protocol::ClientMessage;

/// Run a connection to completion. Spawned once per accepted upgrade.
pub async fn run_connection(
    hub: Arc<ConnectionHub>,
    connection_id: Uuid,
    role: ClientRole,
    mut session: Session,
    mut stream: MessageStream,
) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let writer = tokio::spawn(writer_task(session.clone(), receiver));

    hub.register(connection_id, role, sender);
    debug!(%connection_id, ?role, "connection loop started");

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                hub.touch(&connection_id);
                match ClientMessage::parse(&text) {
                    Ok(ClientMessage::Unknown { kind }) => {
                        warn!(%connection_id, %kind, "unknown message type, dropping");
                    }
                    Ok(message) => hub.handle_message(connection_id, message).await,
                    Err(e) => {
                        debug!(%connection_id, error = %e, "protocol error");
                        // Best effort: the client may already be gone.
                        hub.reply_error(&connection_id, &e.to_string());
                    }
                }
            }
            Ok(Message::Ping(bytes)) => {
                hub.touch(&connection_id);
                if session.pong(&bytes).await.is_err() {
                    break;
                }
            }
            Ok(Message::Pong(_)) => {
                hub.touch(&connection_id);
            }
            Ok(Message::Close(reason)) => {
                info!(%connection_id, ?reason, "client closed connection");
                break;
            }
            Ok(_) => {
                // Binary and continuation frames are not part of the protocol.
                debug!(%connection_id, "ignoring non-text frame");
            }
            Err(e) => {
                warn!(%connection_id, error = %e, "websocket stream error");
                break;
            }
        }
    }

    hub.disconnect(&connection_id);
    writer.abort();
    debug!(%connection_id, "connection loop finished");
}

/// Drains the outbound channel onto the socket. The single consumer makes
/// every write to this connection serialized.
async fn writer_task(mut session: Session, mut receiver: UnboundedReceiver<WriterCommand>) {
    while let Some(command) = receiver.recv().await {
        match command {
            WriterCommand::Frame(text) => {
                if session.text(text).await.is_err() {
                    return;
                }
            }
            WriterCommand::Ping => {
                if session.ping(b"").await.is_err() {
                    return;
                }
            }
            WriterCommand::Close(reason) => {
                let _ = session.close(reason).await;
                return;
            }
        }
    }
    let _ = session.close(None).await;
}
