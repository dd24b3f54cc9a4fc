//! Upgrade gateway and per-connection read/write loops.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    response::Response,
};
use chrono::Utc;
use futures::stream::SplitStream;
use futures::{Sink, SinkExt, StreamExt};
use log::{debug, info, warn};

use crate::api::AppState;
use crate::auth::CurrentUser;

use super::connection::{Connection, DisconnectReason};
use super::hub::{IngestOutcome, LocationHub};
use super::types::InboundFrame;

/// Upper bound on the goodbye close frame, so a peer that stopped reading
/// cannot hold the connection open.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Timing for one connection's write loop.
#[derive(Debug, Clone, Copy)]
struct StreamTimers {
    ping_interval: Duration,
    write_timeout: Duration,
    /// Time left on the token the stream was opened with.
    session_ttl: Duration,
}

/// WebSocket upgrade handler.
///
/// GET /locations
///
/// Sits behind the auth middleware, so an unauthenticated request is rejected
/// before any connection state exists.
pub async fn locations_ws_handler(
    State(state): State<AppState>,
    user: CurrentUser,
    ws: WebSocketUpgrade,
) -> Response {
    let user_id = user.id().to_string();
    info!("Location stream upgrade request from user {}", user_id);

    let remaining = user.claims.exp.saturating_sub(Utc::now().timestamp());
    let timers = StreamTimers {
        ping_interval: state.ping_interval,
        write_timeout: state.write_timeout,
        session_ttl: Duration::from_secs(u64::try_from(remaining).unwrap_or(0)),
    };

    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| serve_connection(socket, hub, user_id, timers))
}

/// Run one upgraded connection until both of its loops exit.
async fn serve_connection(
    socket: WebSocket,
    hub: Arc<LocationHub>,
    user_id: String,
    timers: StreamTimers,
) {
    let conn = hub.connect(&user_id);
    let id = hub.register(&conn);
    info!("Location stream {} opened for user {}", id, user_id);

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, conn.clone(), timers));
    let reader = tokio::spawn(read_loop(stream, hub.clone(), conn.clone()));

    let (writer, reader) = tokio::join!(writer, reader);
    for result in [writer, reader] {
        if let Err(e) = result {
            warn!("Connection task for {} failed: {}", id, e);
            conn.close(DisconnectReason::ReadError);
        }
    }

    hub.unregister(id);
    info!(
        "Location stream {} closed for user {} ({})",
        id,
        user_id,
        conn.disconnect_reason()
            .unwrap_or(DisconnectReason::Unregistered)
    );
}

/// Decode inbound frames and hand them to the hub.
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    hub: Arc<LocationHub>,
    conn: Arc<Connection>,
) {
    loop {
        let msg = tokio::select! {
            msg = stream.next() => msg,
            _ = conn.closed() => break,
        };

        match msg {
            Some(Ok(Message::Text(text))) => handle_frame(&hub, &conn, text.as_str().as_bytes()),
            Some(Ok(Message::Binary(data))) => handle_frame(&hub, &conn, &data),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                debug!("Client closed {} with {:?}", conn.id(), frame);
                conn.close(DisconnectReason::ClientClosed);
                break;
            }
            Some(Err(e)) => {
                warn!("WebSocket receive error on {}: {}", conn.id(), e);
                conn.close(DisconnectReason::ReadError);
                break;
            }
            None => {
                conn.close(DisconnectReason::StreamEnded);
                break;
            }
        }
    }
}

fn handle_frame(hub: &LocationHub, conn: &Connection, payload: &[u8]) {
    let frame = match InboundFrame::decode(payload) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(
                "Dropping undecodable frame from user {} on {}: {}",
                conn.user_id(),
                conn.id(),
                e
            );
            return;
        }
    };

    match frame {
        InboundFrame::Location(update) => {
            if let IngestOutcome::Superseded { current } = hub.ingest(conn.user_id(), update) {
                debug!(
                    "Location update from user {} superseded by value at {}",
                    conn.user_id(),
                    current
                );
            }
        }
        InboundFrame::Activity(report) => {
            hub.report_activity(conn.user_id(), report.active);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameWrite {
    Sent,
    /// The connection closed while the frame was in flight.
    Interrupted,
    /// The transport failed or did not accept the frame in time.
    Failed,
}

/// Send one frame, giving up when the connection closes or `timeout` passes.
async fn write_frame<S>(
    sink: &mut S,
    conn: &Connection,
    frame: Message,
    timeout: Duration,
) -> FrameWrite
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    tokio::select! {
        biased;
        result = tokio::time::timeout(timeout, sink.send(frame)) => match result {
            Ok(Ok(())) => FrameWrite::Sent,
            Ok(Err(e)) => {
                warn!("WebSocket send error on {}: {}", conn.id(), e);
                conn.close(DisconnectReason::WriteError);
                FrameWrite::Failed
            }
            Err(_) => {
                warn!("WebSocket send on {} timed out after {:?}", conn.id(), timeout);
                conn.close(DisconnectReason::WriteError);
                FrameWrite::Failed
            }
        },
        _ = conn.closed() => FrameWrite::Interrupted,
    }
}

/// Drain the connection's queue onto the socket, with periodic pings.
async fn write_loop<S>(mut sink: S, conn: Arc<Connection>, timers: StreamTimers)
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let mut ping = tokio::time::interval(timers.ping_interval);
    // Skip the first immediate tick
    ping.tick().await;

    let session_expiry = tokio::time::sleep(timers.session_ttl);
    tokio::pin!(session_expiry);

    loop {
        let frame = tokio::select! {
            next = conn.next_snapshot() => match next {
                Some(snapshot) => Message::Text(snapshot.payload().to_owned().into()),
                None => break,
            },
            _ = ping.tick() => Message::Ping(Default::default()),
            _ = &mut session_expiry => {
                info!("Session for user {} on {} expired", conn.user_id(), conn.id());
                conn.close(DisconnectReason::SessionExpired);
                break;
            }
        };

        if write_frame(&mut sink, &conn, frame, timers.write_timeout).await != FrameWrite::Sent {
            break;
        }
    }

    if conn.disconnect_reason() == Some(DisconnectReason::WriteError) {
        return;
    }

    let close_frame = conn
        .disconnect_reason()
        .and_then(DisconnectReason::close_frame)
        .map(|(code, reason)| CloseFrame {
            code,
            reason: reason.into(),
        });
    let goodbye = async {
        let _ = sink.send(Message::Close(close_frame)).await;
        let _ = sink.close().await;
    };
    if tokio::time::timeout(timers.write_timeout.min(CLOSE_GRACE), goodbye)
        .await
        .is_err()
    {
        debug!("Peer on {} did not take the close frame", conn.id());
    }
}
