//! Serving one authorized WebSocket connection.

use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use protocol::{Encoding, ErrorCode, ErrorMessage, Outbound, Reply, ServerEvent};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use super::{Admission, Transport, TransportError};
use crate::router::ConnectionContext;

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

/// Reason sent to a collaborator refused for lack of an owner.
pub const OWNER_ABSENT_REASON: &str = "the project owner is not connected";

/// Runs the connection until the peer leaves or `shutdown` fires.
///
/// Requests are handled one at a time in arrival order. Replies and pushes
/// share a single writer task so frames never interleave.
pub(crate) async fn serve(
    transport: &Transport,
    mut socket: WebSocketStream<TcpStream>,
    admission: Admission,
    connection_id: u64,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    let project_id = admission.record.id.clone();
    let registry = Arc::clone(&transport.registry);

    if transport.settings.require_owner_presence
        && !admission.is_owner
        && !registry.owner_connected(&project_id)
    {
        tracing::info!(project_id = %project_id, user_id = %admission.user_id, "Refusing collaborator without owner");
        let event = Outbound::Push(ServerEvent::DisableAccess {
            reason: OWNER_ABSENT_REASON.to_string(),
        });
        if let Some(frame) = encode_frame(&event, Encoding::Json) {
            socket.send(frame).await?;
        }
        socket.close(Some(close_frame(CloseCode::Policy, OWNER_ABSENT_REASON))).await?;
        return Ok(());
    }

    let session = registry.attach(&admission.record, connection_id, admission.is_owner);
    tracing::info!(
        project_id = %project_id,
        user_id = %admission.user_id,
        connection_id,
        is_owner = admission.is_owner,
        "Client connected"
    );

    if let Err(e) = session.initialize().await {
        tracing::error!(project_id = %project_id, connection_id, error = %e, "Session initialization failed, closing connection");
        let _ = socket
            .close(Some(close_frame(CloseCode::Error, "sandbox unavailable")))
            .await;
        registry.detach(&project_id, connection_id).await;
        return Ok(());
    }

    let (push_tx, push_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let events = session.subscribe();

    match session.file_tree().await {
        Ok(tree) => {
            let _ = push_tx.send(ServerEvent::Loaded { tree });
        }
        Err(e) => tracing::warn!(project_id = %project_id, error = %e, "Failed to load file tree"),
    }

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, reply_rx, push_rx, events));

    let ctx = ConnectionContext {
        connection_id,
        user_id: admission.user_id,
        project_id: project_id.clone(),
        is_owner: admission.is_owner,
        session,
        push: push_tx,
    };

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!(connection_id, "Closing connection for shutdown");
                break;
            }
            frame = stream.next() => frame,
        };

        let (encoding, bytes) = match frame {
            Some(Ok(WsMessage::Text(text))) => (Encoding::Json, text.into_bytes()),
            Some(Ok(WsMessage::Binary(bytes))) => (Encoding::MessagePack, bytes),
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!(connection_id, error = %e, "WebSocket read failed");
                break;
            }
        };

        let reply = match encoding.decode_envelope(&bytes) {
            Ok(envelope) => transport.router.handle(&ctx, envelope).await,
            Err(e) => {
                tracing::debug!(connection_id, error = %e, "Undecodable frame");
                Reply::err(
                    0,
                    ErrorMessage {
                        code: ErrorCode::InvalidRequest,
                        message: e.to_string(),
                        context: None,
                        recoverable: false,
                    },
                )
            }
        };
        if reply_tx.send((reply, encoding)).is_err() {
            break;
        }
    }

    // Closing the reply channel stops the writer, which closes the socket.
    drop(reply_tx);
    drop(ctx);
    if let Err(e) = writer.await {
        tracing::warn!(connection_id, error = %e, "Writer task failed");
    }

    registry.detach(&project_id, connection_id).await;
    tracing::info!(project_id = %project_id, connection_id, "Client disconnected");
    Ok(())
}

/// Writes replies and pushes in the order they become ready.
///
/// Pushes use the encoding of the most recent request so that a binary
/// client keeps receiving binary frames.
async fn write_loop(
    mut sink: WsSink,
    mut replies: mpsc::UnboundedReceiver<(Reply, Encoding)>,
    mut pushes: mpsc::UnboundedReceiver<ServerEvent>,
    mut events: broadcast::Receiver<ServerEvent>,
) {
    let mut encoding = Encoding::Json;
    loop {
        let outbound = tokio::select! {
            reply = replies.recv() => match reply {
                Some((reply, reply_encoding)) => {
                    encoding = reply_encoding;
                    Outbound::Reply(reply)
                }
                None => break,
            },
            Some(event) = pushes.recv() => Outbound::Push(event),
            event = events.recv() => match event {
                Ok(event) => Outbound::Push(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Connection lagged behind project events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let Some(frame) = encode_frame(&outbound, encoding) else {
            continue;
        };
        if let Err(e) = sink.send(frame).await {
            tracing::debug!(error = %e, "WebSocket write failed");
            return;
        }
    }
    let _ = sink.close().await;
}

fn encode_frame(outbound: &Outbound, encoding: Encoding) -> Option<WsMessage> {
    let bytes = match encoding.encode_outbound(outbound) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode outbound frame");
            return None;
        }
    };
    match encoding {
        Encoding::Json => match String::from_utf8(bytes) {
            Ok(text) => Some(WsMessage::Text(text)),
            Err(e) => {
                tracing::error!(error = %e, "Encoded JSON is not UTF-8");
                None
            }
        },
        Encoding::MessagePack => Some(WsMessage::Binary(bytes)),
    }
}

fn close_frame(code: CloseCode, reason: &'static str) -> CloseFrame<'static> {
    CloseFrame {
        code,
        reason: reason.into(),
    }
}
