//! Direct-pipe front door: one local client speaking newline-delimited JSON-RPC over a byte
//! stream (normally the gateway's own stdin/stdout), bridged to a single backend.
//!
//! Shares the session layer with HTTP: the client is a `Pipe` session, responses and backend
//! notifications travel through the session's outbound queue, and the stream is framed with
//! the same codec as backend pipes.

use crate::error::{GatewayError, Result};
use crate::session::{Session, SessionGuard, SessionManager, SessionTransport};
use futures::StreamExt;
use mcp_mux_protocol::{
    Decoded, JsonRpcError, JsonRpcResponse, LineCodec, Message, RequestId, encode,
};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

/// Serve `backend` over `input`/`output` until the input reaches EOF.
///
/// Requests still in flight at EOF are allowed to finish and their responses are written
/// before returning. If the gateway closes the session first (slow consumer, shutdown), every
/// request left unanswered gets a JSON-RPC error carrying the close reason and the close reason
/// is returned as the error.
pub async fn serve<R, W>(
    sessions: Arc<SessionManager>,
    backend: &str,
    input: R,
    output: W,
    max_frame_bytes: usize,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let opened = sessions.open(backend, SessionTransport::Pipe)?;
    let outbound = opened.outbound.ok_or_else(|| {
        GatewayError::InvalidRequest("pipe session has no outbound queue".to_string())
    })?;
    let guard = SessionGuard::new(sessions.clone(), opened.session);
    let session = guard.session().clone();
    tracing::info!(backend = %backend, session_id = %session.id(), "stdio bridge attached");

    let writer = tokio::spawn(write_frames(output, outbound, session.closed().clone()));

    let mut calls = JoinSet::new();
    let mut unanswered = Vec::new();
    let mut frames = FramedRead::new(input, LineCodec::new(max_frame_bytes));
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Decoded::Messages(messages)) => {
                for msg in messages {
                    if session.closed().is_cancelled() {
                        if let Message::Request(request) = msg {
                            unanswered.push(request.id);
                        }
                        continue;
                    }
                    dispatch(&sessions, &session, msg, &mut calls).await;
                }
            }
            Ok(Decoded::Malformed(e)) => {
                tracing::warn!(
                    backend = %backend,
                    error = %e,
                    "malformed frame from stdio client"
                );
                let reply = JsonRpcResponse::error(None, JsonRpcError::parse_error(&e));
                let _ = session.push(Message::Response(reply));
            }
            Err(e) => {
                tracing::warn!(backend = %backend, error = %e, "stdio input failed");
                break;
            }
        }
        if session.closed().is_cancelled() {
            break;
        }
    }

    while let Some(joined) = calls.join_next().await {
        if let Ok(Some(id)) = joined {
            unanswered.push(id);
        }
    }
    let closed_early = session.close_reason();
    drop(guard);

    let mut output = match writer.await {
        Ok(result) => result.map_err(|e| GatewayError::transport(backend, e))?,
        Err(e) => return Err(GatewayError::transport(backend, e)),
    };
    let Some(reason) = closed_early else {
        return Ok(());
    };

    tracing::warn!(
        backend = %backend,
        session_id = %session.id(),
        reason = %reason,
        unanswered = unanswered.len(),
        "stdio session closed by the gateway"
    );
    let error = reason.to_rpc_error();
    for id in unanswered {
        let reply = Message::Response(JsonRpcResponse::error(Some(id), error.clone()));
        output
            .write_all(&encode(&reply))
            .await
            .map_err(|e| GatewayError::transport(backend, e))?;
    }
    output
        .flush()
        .await
        .map_err(|e| GatewayError::transport(backend, e))?;
    Err(reason)
}

async fn dispatch(
    sessions: &Arc<SessionManager>,
    session: &Arc<Session>,
    msg: Message,
    calls: &mut JoinSet<Option<RequestId>>,
) {
    match msg {
        Message::Request(request) => {
            let sessions = sessions.clone();
            let session = session.clone();
            // Resolves to the request id when the reply could not be queued.
            calls.spawn(async move {
                let id = request.id.clone();
                let response = match sessions.send(&session, request).await {
                    Ok(resp) => resp,
                    Err(GatewayError::SessionClosed) => return Some(id),
                    Err(e) => JsonRpcResponse::error(Some(id.clone()), e.to_rpc_error()),
                };
                session.push(Message::Response(response)).err().map(|_| id)
            });
        }
        Message::Notification(notification) => {
            if let Err(e) = sessions.notify(session, notification).await {
                tracing::warn!(
                    session_id = %session.id(),
                    error = %e,
                    "notification not forwarded"
                );
            }
        }
        Message::Response(response) => {
            tracing::debug!(id = ?response.id, "discarding client response");
        }
    }
}

async fn write_frames<W>(
    mut output: W,
    mut outbound: mpsc::Receiver<Message>,
    closed: CancellationToken,
) -> std::io::Result<W>
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    output.write_all(&encode(&msg)).await?;
                    output.flush().await?;
                }
                None => break,
            },
            () = closed.cancelled() => {
                while let Ok(msg) = outbound.try_recv() {
                    output.write_all(&encode(&msg)).await?;
                }
                break;
            }
        }
    }
    output.flush().await?;
    Ok(output)
}
