use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use kindroom_types::events::{ErrorKind, ServerEvent};
use kindroom_types::models::{Message as ChatMessage, MessageId, RoomId};

use crate::pipeline::{ConnectionCtx, Outcome, Pipeline};
use crate::registry::Frame;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    /// Messages sent as history right after joining
    pub history_limit: u32,
    /// Room events buffered per connection before it counts as stalled
    pub outbound_buffer: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            history_limit: 50,
            outbound_buffer: 256,
        }
    }
}

/// Serve one room socket until the client leaves, stalls or is evicted.
pub async fn handle_connection(
    socket: WebSocket,
    pipeline: Pipeline,
    settings: ConnectionSettings,
    room_id: RoomId,
) {
    let (mut sender, receiver) = socket.split();
    let ctx = ConnectionCtx {
        conn_id: Uuid::new_v4(),
        room_id,
    };

    // Room events arrive here; the registry holds the only sender, so an
    // eviction closes this queue and ends the connection.
    let (room_tx, room_rx) = mpsc::channel::<Frame>(settings.outbound_buffer.max(1));
    pipeline.registry().join(room_id, ctx.conn_id, room_tx);
    info!(conn_id = %ctx.conn_id, room_id, "Connection joined room");

    if let Some(replay) = greet(&mut sender, &pipeline, &settings, room_id).await {
        run_connection_loop(sender, receiver, pipeline.clone(), ctx, room_rx, replay).await;
    }

    pipeline.registry().leave(room_id, ctx.conn_id);
    info!(conn_id = %ctx.conn_id, room_id, "Connection left room");
}

/// Send `joined` and the room's recent history. Returns `None` if the socket is gone.
async fn greet(
    sender: &mut SplitSink<WebSocket, Message>,
    pipeline: &Pipeline,
    settings: &ConnectionSettings,
    room_id: RoomId,
) -> Option<ReplayFilter> {
    send_event(sender, &ServerEvent::Joined { room_id }).await.ok()?;

    match pipeline
        .repository()
        .recent_messages(room_id, settings.history_limit)
        .await
    {
        Ok(messages) => {
            let replay = ReplayFilter::after(&messages);
            send_event(sender, &ServerEvent::History { room_id, messages })
                .await
                .ok()?;
            Some(replay)
        }
        Err(e) => {
            warn!(error = %e, room_id, "Could not load room history");
            Some(ReplayFilter::default())
        }
    }
}

/// The connection joins its room before history is loaded, so a message
/// committed in between shows up both in `history` and as a room event.
/// Drops those room events until the first one newer than the history.
#[derive(Debug, Default)]
struct ReplayFilter {
    watermark: Option<MessageId>,
}

impl ReplayFilter {
    fn after(history: &[ChatMessage]) -> Self {
        Self {
            watermark: history.iter().map(|m| m.id).max(),
        }
    }

    fn admit(&mut self, frame: &str) -> bool {
        let Some(watermark) = self.watermark else {
            return true;
        };
        match frame_message_id(frame) {
            Some(id) if id <= watermark => false,
            Some(_) => {
                self.watermark = None;
                true
            }
            None => true,
        }
    }
}

fn frame_message_id(frame: &str) -> Option<MessageId> {
    serde_json::from_str::<serde_json::Value>(frame)
        .ok()?
        .pointer("/message/id")?
        .as_i64()
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to serialize event");
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    pipeline: Pipeline,
    ctx: ConnectionCtx,
    mut room_rx: mpsc::Receiver<Frame>,
    mut replay: ReplayFilter,
) {
    // Replies meant for this connection only (acks, errors)
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ServerEvent>();

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward room events + direct replies -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                frame = room_rx.recv() => {
                    let Some(frame) = frame else {
                        debug!(conn_id = %ctx.conn_id, "Removed from room, closing");
                        break;
                    };
                    if !replay.admit(&frame) {
                        debug!(conn_id = %ctx.conn_id, "Skipping event already sent as history");
                        continue;
                    }
                    if sender.send(Message::Text(frame.to_string().into())).await.is_err() {
                        break;
                    }
                }
                reply = reply_rx.recv() => {
                    let Some(event) = reply else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!(conn_id = %ctx.conn_id, "Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }

        let _ = sender.close().await;
    });

    // Read envelopes from client, one at a time
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    match pipeline.handle_text(&ctx, text.as_str()).await {
                        Ok(Outcome::Joined) => {
                            let _ = reply_tx.send(ServerEvent::Joined { room_id: ctx.room_id });
                        }
                        Ok(Outcome::Delivered { .. }) => {}
                        Err(e) => {
                            warn!(
                                conn_id = %ctx.conn_id,
                                room_id = ctx.room_id,
                                error = %e,
                                raw = %text.as_str().chars().take(200).collect::<String>(),
                                "Message rejected"
                            );
                            let _ = reply_tx.send(e.to_event());
                        }
                    }
                }
                Message::Binary(_) => {
                    let _ = reply_tx.send(ServerEvent::Error {
                        kind: ErrorKind::Protocol,
                        detail: "binary frames are not supported".into(),
                    });
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}
