#![forbid(unsafe_code)]

// Peer connection wrapper - webrtc callbacks, trickle ICE, PLI throttling

use crate::sfu::engine;
use crate::sfu::mixer_slice::MixerSlice;
use crate::sfu::peer_session::PeerSession;
use crate::signaling::protocol::{JoinPayload, MediaKind};
use anyhow::Result;
use std::sync::atomic::{AtomicU32, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

/// Upstream PLI requests are debounced to at most one per this interval.
const PLI_MIN_INTERVAL: Duration = Duration::from_millis(500);

/// Wraps one RTCPeerConnection with the codecs the room advertises.
pub struct PeerConn {
    pc: Arc<RTCPeerConnection>,
    user_id: String,
    room_id: String,
    video_ssrc: AtomicU32,
    last_pli: Mutex<Instant>,
}

impl PeerConn {
    pub async fn new(join: &JoinPayload, room_short_id: &str) -> Result<Arc<Self>> {
        let api = engine::build_api(join.video_format)?;
        let pc = api.new_peer_connection(RTCConfiguration::default()).await?;

        Ok(Arc::new(Self {
            pc: Arc::new(pc),
            user_id: join.user_id.clone(),
            room_id: room_short_id.to_string(),
            video_ssrc: AtomicU32::new(0),
            last_pli: Mutex::new(
                Instant::now()
                    .checked_sub(PLI_MIN_INTERVAL)
                    .unwrap_or_else(Instant::now),
            ),
        }))
    }

    /// Wires the connection callbacks to the owning session. The callbacks
    /// hold weak references so a closed session can be dropped.
    pub(crate) fn connect(self: &Arc<Self>, ps: &Arc<PeerSession>) {
        // trickle ICE to the client
        let weak = Arc::downgrade(ps);
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(ps) = weak.upgrade() else { return };
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => ps.send_payload("candidate", &init).await,
                        Err(e) => warn!(user = %ps.user_id(), "candidate to_json: {}", e),
                    }
                }
            })
        }));

        // each inbound track becomes a mixer slice fanned out by the room
        let conn = self.clone();
        let weak = Arc::downgrade(ps);
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let conn = conn.clone();
            let weak = weak.clone();
            Box::pin(async move {
                let Some(ps) = weak.upgrade() else { return };
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    RTPCodecType::Video => MediaKind::Video,
                    _ => {
                        warn!(user = %ps.user_id(), "track with unknown kind ignored");
                        return;
                    }
                };
                info!(
                    room = %conn.room_id,
                    user = %ps.user_id(),
                    "new {} track, ssrc {}",
                    kind,
                    track.ssrc()
                );
                if kind == MediaKind::Video {
                    conn.video_ssrc.store(track.ssrc(), Relaxed);
                }

                match MixerSlice::new(&ps, kind, track) {
                    Ok(slice) => {
                        ps.set_slice(kind, slice.clone());
                        ps.room().broadcast_slice(ps.user_id(), &slice).await;
                        let supervised = slice.clone();
                        let room_id = conn.room_id.clone();
                        tokio::spawn(async move {
                            // release resources even if the data-plane loop panics
                            if tokio::spawn(slice.run()).await.is_err() {
                                warn!(room = %room_id, "slice loop panicked, stopping");
                                supervised.stop();
                            }
                        });
                    }
                    Err(e) => error!(
                        room = %conn.room_id,
                        user = %ps.user_id(),
                        "mixer slice creation failed: {}", e
                    ),
                }
            })
        }));

        // a dead transport closes the session; other peers renegotiate
        let weak = Arc::downgrade(ps);
        self.pc
            .on_peer_connection_state_change(Box::new(move |state| {
                let weak = weak.clone();
                Box::pin(async move {
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                    ) {
                        if let Some(ps) = weak.upgrade() {
                            debug!(user = %ps.user_id(), "peer connection {}", state);
                            tokio::spawn(async move { ps.close().await });
                        }
                    }
                })
            }));
    }

    pub async fn create_offer(&self) -> Result<RTCSessionDescription> {
        Ok(self.pc.create_offer(None).await?)
    }

    pub async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()> {
        Ok(self.pc.set_local_description(desc).await?)
    }

    pub async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()> {
        Ok(self.pc.set_remote_description(desc).await?)
    }

    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        Ok(self.pc.add_ice_candidate(candidate).await?)
    }

    pub async fn add_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<Arc<RTCRtpSender>> {
        Ok(self.pc.add_track(track).await?)
    }

    /// Removes every outbound sender whose track id is in `track_ids`.
    pub async fn remove_senders_for(&self, track_ids: &[String]) {
        for sender in self.pc.get_senders().await {
            let Some(track) = sender.track().await else { continue };
            if track_ids.iter().any(|id| id == track.id()) {
                if let Err(e) = self.pc.remove_track(&sender).await {
                    debug!(
                        room = %self.room_id,
                        user = %self.user_id,
                        "remove_track: {}", e
                    );
                }
            }
        }
    }

    /// Fire-and-forget variant for non-async callers (the pipeline PLI hook).
    pub fn spawn_pli_request(self: &Arc<Self>) {
        let conn = self.clone();
        tokio::spawn(async move { conn.throttled_pli_request().await });
    }

    /// Asks the client for a keyframe, at most once per `PLI_MIN_INTERVAL`.
    pub async fn throttled_pli_request(&self) {
        let ssrc = self.video_ssrc.load(Relaxed);
        if ssrc == 0 {
            return;
        }
        {
            let mut last = self.last_pli.lock().unwrap_or_else(|e| e.into_inner());
            if last.elapsed() < PLI_MIN_INTERVAL {
                return;
            }
            *last = Instant::now();
        }

        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc: ssrc,
        };
        if let Err(e) = self.pc.write_rtcp(&[Box::new(pli)]).await {
            debug!(room = %self.room_id, user = %self.user_id, "pli send: {}", e);
        }
    }

    pub async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(room = %self.room_id, user = %self.user_id, "pc close: {}", e);
        }
    }
}
