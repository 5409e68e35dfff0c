#![forbid(unsafe_code)]

// Peer session - one peer's signaling loop, transport and track wiring

use crate::config::Config;
use crate::metrics::ServerMetrics;
use crate::pipeline::Pipeline;
use crate::sfu::peer_conn::PeerConn;
use crate::sfu::room::{Room, RoomStore};
use crate::sfu::MixerSlice;
use crate::signaling::protocol::{ControlPayload, Envelope, JoinPayload, MediaKind};
use anyhow::Result;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Bounded outbound queue per client; one send task drains it, serializing
/// websocket writes.
const CHANNEL_CAPACITY: usize = 64;

/// Signaling progress of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Joined,
    Negotiating,
    Stable,
    Closed,
}

/// One connected peer: its signaling state, transport, pipeline and slices.
pub struct PeerSession {
    user_id: String,
    /// Stream id shared by this peer's outbound tracks.
    stream_id: String,
    room: Arc<Room>,
    pc: Arc<PeerConn>,
    pipeline: Arc<Pipeline>,
    outbound: mpsc::Sender<Arc<String>>,
    state: Mutex<SessionState>,
    audio_slice: Mutex<Option<Arc<MixerSlice>>>,
    video_slice: Mutex<Option<Arc<MixerSlice>>>,
    closed: AtomicBool,
    close: CancellationToken,
    metrics: ServerMetrics,
}

impl PeerSession {
    fn new(
        join: &JoinPayload,
        room: Arc<Room>,
        pc: Arc<PeerConn>,
        pipeline: Arc<Pipeline>,
        outbound: mpsc::Sender<Arc<String>>,
        metrics: ServerMetrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            user_id: join.user_id.clone(),
            stream_id: Uuid::new_v4().to_string(),
            room,
            pc,
            pipeline,
            outbound,
            state: Mutex::new(SessionState::Joined),
            audio_slice: Mutex::new(None),
            video_slice: Mutex::new(None),
            closed: AtomicBool::new(false),
            close: CancellationToken::new(),
            metrics,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    pub fn pc(&self) -> &Arc<PeerConn> {
        &self.pc
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// One-shot signal observed by this peer's slices and background tasks.
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    pub async fn closed(&self) {
        self.close.cancelled().await
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            debug!(
                room = %self.room.short_id(),
                user = %self.user_id,
                "session {:?} -> {:?}",
                *state,
                next
            );
            *state = next;
        }
    }

    pub(crate) fn set_slice(&self, kind: MediaKind, slice: Arc<MixerSlice>) {
        let slot = match kind {
            MediaKind::Audio => &self.audio_slice,
            MediaKind::Video => &self.video_slice,
        };
        let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(slice);
    }

    pub fn slice(&self, kind: MediaKind) -> Option<Arc<MixerSlice>> {
        let slot = match kind {
            MediaKind::Audio => &self.audio_slice,
            MediaKind::Video => &self.video_slice,
        };
        slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Both published slices, audio first.
    pub fn slices(&self) -> Vec<Arc<MixerSlice>> {
        [MediaKind::Audio, MediaKind::Video]
            .into_iter()
            .filter_map(|kind| self.slice(kind))
            .collect()
    }

    /// Output track ids of the published slices, for sender removal.
    pub fn slice_track_ids(&self) -> Vec<String> {
        self.slices().iter().map(|slice| slice.id()).collect()
    }

    /// Sends a payloadless frame.
    pub async fn send(&self, kind: &str) {
        self.send_envelope(Envelope::new(kind)).await;
    }

    /// Sends a frame with a JSON-encoded payload.
    pub async fn send_payload<T: Serialize>(&self, kind: &str, payload: &T) {
        match Envelope::with_payload(kind, payload) {
            Ok(envelope) => self.send_envelope(envelope).await,
            Err(e) => warn!(user = %self.user_id, "encode {} payload: {}", kind, e),
        }
    }

    async fn send_envelope(&self, envelope: Envelope) {
        match envelope.to_json() {
            Ok(json) => {
                if self.outbound.send(Arc::new(json)).await.is_ok() {
                    self.metrics.count_frame_out();
                }
            }
            Err(e) => warn!(user = %self.user_id, "encode frame: {}", e),
        }
    }

    /// Produces a fresh offer and sends it to the client.
    pub async fn send_offer(&self) -> Result<()> {
        if self.closed.load(Relaxed) {
            return Ok(());
        }
        let offer = self.pc.create_offer().await?;
        self.pc.set_local_description(offer.clone()).await?;
        self.set_state(SessionState::Negotiating);
        self.send_payload("offer", &offer).await;
        self.metrics.count_offer();
        Ok(())
    }

    /// Tears the session down exactly once: signals subordinate slices,
    /// leaves the room and closes the transport.
    pub async fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Relaxed) {
            return;
        }
        info!(room = %self.room.short_id(), user = %self.user_id, "closing peer session");
        self.set_state(SessionState::Closed);
        self.close.cancel();
        self.room.disconnect_user(self).await;
        self.pc.close().await;
        self.pipeline.stop();
    }
}

/// Reads the first frame, which must be a valid `join`.
fn parse_join(text: &str, origin: Option<&str>) -> Result<JoinPayload> {
    let envelope: Envelope = serde_json::from_str(text)?;
    if envelope.kind != "join" {
        anyhow::bail!("first frame must be join, got {}", envelope.kind);
    }
    let mut join: JoinPayload = envelope.parse_payload()?;
    join.origin = origin.unwrap_or_default().to_string();
    join.validate()?;
    Ok(join)
}

/// Recording file prefix: timestamp, room, user and per-user join count.
fn file_prefix(join: &JoinPayload, room: &Room) -> String {
    format!(
        "{}-r-{}-u-{}-c-{}",
        chrono::Local::now().format("%Y%m%d-%H%M%S%.3f"),
        join.room_id,
        join.user_id,
        room.joined_count_for(&join.user_id)
    )
}

async fn send_frame(tx: &mpsc::Sender<Arc<String>>, envelope: Envelope) {
    if let Ok(json) = envelope.to_json() {
        let _ = tx.send(Arc::new(json)).await;
    }
}

/// Sends the `ending` notice shortly before the room's hard deadline.
fn spawn_ending_notice(ps: Arc<PeerSession>) {
    tokio::spawn(async move {
        let room = ps.room().clone();
        tokio::select! {
            _ = ps.closed() => return,
            _ = room.ready() => {}
        }
        let delay = Duration::from_secs(room.ending_delay_secs());
        tokio::select! {
            _ = ps.closed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        info!(room = %room.short_id(), user = %ps.user_id(), "ending notice sent");
        ps.send("ending").await;
    });
}

/// Drives one websocket connection from upgrade to close.
pub async fn run_session(
    socket: WebSocket,
    origin: Option<String>,
    store: RoomStore,
    config: Arc<Config>,
    metrics: ServerMetrics,
) {
    let _socket = metrics.count_connection();

    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);
    let send_task = tokio::spawn(run_send_task(ws_sender, rx));

    // first frame must be a join request
    let first = match ws_receiver.next().await {
        Some(Ok(Message::Text(text))) => text,
        Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
            drop(tx);
            let _ = send_task.await;
            return;
        }
        Some(Ok(_)) => {
            send_frame(&tx, Envelope::new("error-join")).await;
            drop(tx);
            let _ = send_task.await;
            return;
        }
    };
    metrics.count_frame_in();

    let join = match parse_join(&first, origin.as_deref()) {
        Ok(join) => join,
        Err(e) => {
            warn!("join payload invalid: {}", e);
            metrics.count_error();
            send_frame(&tx, Envelope::new("error-join")).await;
            drop(tx);
            let _ = send_task.await;
            return;
        }
    };

    let room = match store.join_room(&join) {
        Ok(room) => room,
        Err(e) => {
            warn!(user = %join.user_id, "join failed: {}", e);
            metrics.count_join_rejected();
            send_frame(&tx, Envelope::new(format!("error-{e}"))).await;
            drop(tx);
            let _ = send_task.await;
            return;
        }
    };
    metrics.count_join();

    let pipeline = match Pipeline::new(&join, file_prefix(&join, &room), &config) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            warn!(user = %join.user_id, "pipeline creation failed: {}", e);
            metrics.count_error();
            send_frame(&tx, Envelope::new("error-pipeline")).await;
            drop(tx);
            let _ = send_task.await;
            return;
        }
    };

    let pc = match PeerConn::new(&join, room.short_id()).await {
        Ok(pc) => pc,
        Err(e) => {
            warn!(user = %join.user_id, "pc creation failed: {}", e);
            metrics.count_error();
            send_frame(&tx, Envelope::new("error-peer-connection")).await;
            drop(tx);
            let _ = send_task.await;
            return;
        }
    };

    let ps = PeerSession::new(&join, room.clone(), pc.clone(), pipeline, tx.clone(), metrics.clone());
    pc.connect(&ps);

    if let Err(e) = room.connect_peer(ps.clone()).await {
        warn!(user = %join.user_id, "room registration failed: {}", e);
        send_frame(&tx, Envelope::new(format!("error-{e}"))).await;
        ps.close().await;
        drop(ps);
        drop(tx);
        let _ = send_task.await;
        return;
    }

    info!(room = %room.short_id(), user = %ps.user_id(), "peer session started");
    spawn_ending_notice(ps.clone());

    // message loop
    loop {
        tokio::select! {
            _ = room.ended() => {
                if room.is_running() {
                    let files = room.files_for(ps.user_id());
                    ps.send_payload("files", &files).await;
                }
                ps.close().await;
                break;
            }
            _ = ps.closed() => break,
            frame = ws_receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        metrics.count_frame_in();
                        let keep_going = match serde_json::from_str::<Envelope>(&text) {
                            Ok(envelope) => handle_message(&ps, envelope).await,
                            Err(e) => {
                                warn!(user = %ps.user_id(), "invalid frame: {}", e);
                                metrics.count_error();
                                true
                            }
                        };
                        if !keep_going {
                            ps.close().await;
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(user = %ps.user_id(), "websocket closed by client");
                        ps.close().await;
                        break;
                    }
                    Some(Ok(_)) => {
                        // ping/pong handled by the transport, binary ignored
                    }
                    Some(Err(e)) => {
                        warn!(user = %ps.user_id(), "websocket read: {}", e);
                        metrics.count_error();
                        ps.close().await;
                        break;
                    }
                }
            }
        }
    }

    // flush pending outbound frames before the socket drops
    drop(ps);
    drop(tx);
    let _ = send_task.await;
}

async fn run_send_task(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Arc<String>>,
) {
    while let Some(json) = rx.recv().await {
        if ws_sender.send(Message::Text((*json).clone())).await.is_err() {
            break;
        }
    }
    let _ = ws_sender.close().await;
}

/// Dispatches one in-room client frame. Returns false when the session must
/// close.
async fn handle_message(ps: &Arc<PeerSession>, envelope: Envelope) -> bool {
    match envelope.kind.as_str() {
        "candidate" => {
            let candidate: RTCIceCandidateInit = match envelope.parse_payload() {
                Ok(candidate) => candidate,
                Err(e) => {
                    warn!(user = %ps.user_id(), "unmarshal candidate: {}", e);
                    return false;
                }
            };
            if let Err(e) = ps.pc().add_ice_candidate(candidate).await {
                warn!(user = %ps.user_id(), "add candidate: {}", e);
                return false;
            }
            true
        }
        "answer" => {
            let answer: RTCSessionDescription = match envelope.parse_payload() {
                Ok(answer) => answer,
                Err(e) => {
                    warn!(user = %ps.user_id(), "unmarshal answer: {}", e);
                    return false;
                }
            };
            if let Err(e) = ps.pc().set_remote_description(answer).await {
                warn!(user = %ps.user_id(), "set remote description: {}", e);
                return false;
            }
            ps.set_state(SessionState::Stable);
            true
        }
        "control" => {
            match envelope.parse_payload::<ControlPayload>() {
                Ok(payload) => {
                    if let Some(slice) = ps.slice(payload.kind) {
                        tokio::spawn(async move { slice.control_fx(payload).await });
                    } else {
                        debug!(
                            user = %ps.user_id(),
                            "control for missing {} slice ignored",
                            payload.kind
                        );
                    }
                }
                Err(e) => warn!(user = %ps.user_id(), "unmarshal control: {}", e),
            }
            true
        }
        other => {
            // repeat joins and unknown kinds are ignored
            debug!(user = %ps.user_id(), "ignoring frame kind {}", other);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_join_accepts_valid_first_frame() {
        let envelope = Envelope {
            kind: "join".to_string(),
            payload: r#"{"roomId":"r1","userId":"u1","duration":30}"#.to_string(),
        };
        let frame = envelope.to_json().unwrap();

        let join = parse_join(&frame, Some("https://example.com")).unwrap();
        assert_eq!(join.room_id, "r1");
        assert_eq!(join.user_id, "u1");
        assert_eq!(join.origin, "https://example.com");
    }

    #[test]
    fn test_parse_join_rejects_other_kinds() {
        let frame = r#"{"kind":"answer","payload":"{}"}"#;
        assert!(parse_join(frame, None).is_err());
    }

    #[test]
    fn test_parse_join_rejects_invalid_payload() {
        let frame = r#"{"kind":"join","payload":"{\"roomId\":\"\",\"userId\":\"u\",\"duration\":30}"}"#;
        assert!(parse_join(frame, None).is_err());
    }
}
