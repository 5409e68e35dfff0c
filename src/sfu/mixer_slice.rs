#![forbid(unsafe_code)]

// Mixer slice - one inbound track: RTP pump, encoder retargeting, telemetry

use crate::pipeline::{Pipeline, TrackWriter};
use crate::sequencing::LinearInterpolator;
use crate::sfu::peer_conn::PeerConn;
use crate::sfu::peer_session::PeerSession;
use crate::sfu::room::Room;
use crate::sfu::sender_controller::SenderController;
use crate::signaling::protocol::{ControlPayload, MediaKind};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::{Marshal, MarshalSize, Unmarshal};

const DEFAULT_INTERPOLATOR_STEP_MS: u64 = 30;
const MAX_INTERPOLATOR_DURATION_MS: u64 = 5000;
const ENCODER_PERIOD_MS: u64 = 1000;
const STATS_PERIOD_MS: u64 = 3000;
// Offset from the stats period so target-bitrate lines don't burst-align
// with the bitrate reset.
const LOG_PERIOD_MS: u64 = 7300;

/// A slice stops itself after this many write failures in a row.
const MAX_CONSECUTIVE_WRITE_ERRORS: u32 = 10;

pub(crate) struct InterpolatorEntry {
    generation: u64,
    stop: CancellationToken,
}

/// One inbound track and its processing: pumps RTP into the pipeline, writes
/// processed RTP back out to the local track the room fans out, and keeps the
/// encoder no faster than the slowest subscriber.
pub struct MixerSlice {
    kind: MediaKind,
    user_id: String,
    room: Arc<Room>,
    room_end: CancellationToken,
    peer_closed: CancellationToken,
    input: Arc<TrackRemote>,
    output: Arc<TrackLocalStaticRTP>,
    pipeline: Arc<Pipeline>,
    pc: Arc<PeerConn>,
    /// Sender controllers per subscriber user id.
    sender_controllers: Mutex<HashMap<String, Arc<SenderController>>>,
    /// Live interpolators per `kind+name+property` key.
    interpolators: Mutex<HashMap<String, InterpolatorEntry>>,
    next_generation: AtomicU64,
    input_bits: AtomicU64,
    output_bits: AtomicU64,
    last_stats: Mutex<Instant>,
    optimal_bitrate: AtomicU64,
    consecutive_write_errors: AtomicU32,
    end: CancellationToken,
}

impl MixerSlice {
    pub fn new(ps: &Arc<PeerSession>, kind: MediaKind, track: Arc<TrackRemote>) -> Result<Arc<Self>> {
        // Same codec as the inbound track; the output id reuses the remote
        // track id, the stream id is shared among this peer's tracks.
        let output = Arc::new(TrackLocalStaticRTP::new(
            track.codec().capability,
            track.id(),
            ps.stream_id().to_string(),
        ));

        Ok(Arc::new(Self {
            kind,
            user_id: ps.user_id().to_string(),
            room: ps.room().clone(),
            room_end: ps.room().end_token(),
            peer_closed: ps.close_token(),
            input: track,
            output,
            pipeline: ps.pipeline().clone(),
            pc: ps.pc().clone(),
            sender_controllers: Mutex::new(HashMap::new()),
            interpolators: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            input_bits: AtomicU64::new(0),
            output_bits: AtomicU64::new(0),
            last_stats: Mutex::new(Instant::now()),
            optimal_bitrate: AtomicU64::new(0),
            consecutive_write_errors: AtomicU32::new(0),
            end: CancellationToken::new(),
        }))
    }

    /// Same id as the output track.
    pub fn id(&self) -> String {
        self.output.id().to_string()
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// The local track the room registers on every other peer.
    pub fn output_track(&self) -> Arc<TrackLocalStaticRTP> {
        self.output.clone()
    }

    pub fn optimal_bitrate(&self) -> u64 {
        self.optimal_bitrate.load(Relaxed)
    }

    /// Registers the outbound sender of one subscriber. Skipped when the
    /// sender does not carry exactly one encoding.
    pub async fn add_sender(self: &Arc<Self>, sender: Arc<RTCRtpSender>, to_user_id: &str) {
        let params = sender.get_parameters().await;
        if params.encodings.len() != 1 {
            error!(
                room = %self.room.short_id(),
                from_user = %self.user_id,
                to_user = %to_user_id,
                "can't add sender: wrong number of encoding parameters"
            );
            return;
        }

        let controller = SenderController::new(sender, to_user_id);
        {
            let mut controllers = self.lock_controllers();
            controllers.insert(to_user_id.to_string(), controller.clone());
        }
        tokio::spawn(controller.run_listener(self.end.clone(), self.room.short_id().to_string()));
    }

    /// Drops a departed subscriber from the bitrate aggregation.
    pub fn remove_sender(&self, to_user_id: &str) {
        let mut controllers = self.lock_controllers();
        controllers.remove(to_user_id);
    }

    /// Reads the inbound track into the pipeline until the room ends, the
    /// peer closes, or the track dies.
    pub async fn run(self: Arc<Self>) {
        let files = self
            .pipeline
            .bind_track(self.kind, self.clone() as Arc<dyn TrackWriter>);
        if self.kind == MediaKind::Video {
            let pc = self.pc.clone();
            self.pipeline.bind_pli_callback(move || pc.spawn_pli_request());
        }
        if !files.is_empty() {
            self.room.add_files(&self.user_id, files);
        }

        self.spawn_tickers();

        loop {
            tokio::select! {
                // room is over, no need to trigger signaling on every closing track
                _ = self.room_end.cancelled() => break,
                // peer may quit early (page refresh), other peers get renegotiated
                _ = self.peer_closed.cancelled() => break,
                result = self.input.read_rtp() => match result {
                    Ok((packet, _)) => match packet.marshal() {
                        Ok(buf) => {
                            self.input_bits.fetch_add(buf.len() as u64 * 8, Relaxed);
                            self.pipeline.push_rtp(self.kind, buf);
                        }
                        Err(e) => debug!(
                            room = %self.room.short_id(),
                            user = %self.user_id,
                            "rtp marshal: {}", e
                        ),
                    },
                    Err(e) => {
                        debug!(
                            room = %self.room.short_id(),
                            user = %self.user_id,
                            "input read ended: {}", e
                        );
                        break;
                    }
                }
            }
        }

        info!(
            room = %self.room.short_id(),
            user = %self.user_id,
            "stopping {} slice {}",
            self.kind,
            self.id()
        );
        self.stop();
    }

    /// Stops the pipeline, the tickers and the controller listeners. Idempotent.
    pub fn stop(&self) {
        if self.end.is_cancelled() {
            return;
        }
        self.pipeline.stop();
        self.end.cancel();
    }

    pub async fn control_fx(&self, payload: ControlPayload) {
        apply_fx_control(
            &self.pipeline,
            &self.interpolators,
            &self.next_generation,
            &self.room_end,
            &self.peer_closed,
            payload,
        )
        .await;
    }

    fn lock_controllers(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SenderController>>> {
        self.sender_controllers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Minimum of the subscribers' estimates — the mixer must encode no
    /// faster than the slowest subscriber can receive.
    fn min_sender_rate(&self) -> Option<u64> {
        let controllers = self.lock_controllers();
        controllers.values().map(|sc| sc.optimal_bitrate()).min()
    }

    fn spawn_tickers(self: &Arc<Self>) {
        // encoder retargeting
        let slice = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(ENCODER_PERIOD_MS));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = slice.end.cancelled() => return,
                    _ = interval.tick() => {}
                }
                if let Some(rate) = slice.min_sender_rate() {
                    if rate > 0 {
                        slice.optimal_bitrate.store(rate, Relaxed);
                        slice.pipeline.set_encoding_rate(slice.kind, rate);
                    }
                }
            }
        });

        // bitrate stats
        let slice = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(STATS_PERIOD_MS));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = slice.end.cancelled() => return,
                    _ = interval.tick() => {}
                }
                let elapsed = {
                    let mut last = slice.last_stats.lock().unwrap_or_else(|e| e.into_inner());
                    let elapsed = last.elapsed().as_secs_f64();
                    *last = Instant::now();
                    elapsed
                };
                if elapsed <= 0.0 {
                    continue;
                }
                let input_bitrate = (slice.input_bits.swap(0, Relaxed) as f64 / elapsed) as u64;
                let output_bitrate = (slice.output_bits.swap(0, Relaxed) as f64 / elapsed) as u64;
                slice.room.metrics().observe_output_bitrate(output_bitrate / 1000);
                info!(
                    room = %slice.room.short_id(),
                    user = %slice.user_id,
                    "mixer {} input bitrate: {} kbit/s",
                    slice.kind,
                    input_bitrate / 1000
                );
                info!(
                    room = %slice.room.short_id(),
                    user = %slice.user_id,
                    "mixer {} output bitrate: {} kbit/s",
                    slice.kind,
                    output_bitrate / 1000
                );
            }
        });

        // periodical target-bitrate log, video only
        if self.kind == MediaKind::Video {
            let slice = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(LOG_PERIOD_MS));
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = slice.end.cancelled() => return,
                        _ = interval.tick() => {}
                    }
                    info!(
                        room = %slice.room.short_id(),
                        user = %slice.user_id,
                        "mixer new target bitrate: {} kbit/s",
                        slice.optimal_bitrate.load(Relaxed) / 1000
                    );
                }
            });
        }
    }
}

/// The slice is the pipeline's output destination: processed RTP comes back
/// through here onto the local track.
#[async_trait::async_trait]
impl TrackWriter for MixerSlice {
    fn id(&self) -> String {
        self.output.id().to_string()
    }

    async fn write(&self, buf: &[u8]) -> Result<()> {
        let mut b = buf;
        let packet = Packet::unmarshal(&mut b)?;

        match self.output.write_rtp(&packet).await {
            Ok(_) => {
                self.consecutive_write_errors.store(0, Relaxed);
                // payload size only: marshaled size minus header size
                let bits = (packet.marshal_size() - packet.header.marshal_size()) * 8;
                self.output_bits.fetch_add(bits as u64, Relaxed);
                Ok(())
            }
            Err(e) => {
                let errors = self.consecutive_write_errors.fetch_add(1, Relaxed) + 1;
                if errors >= MAX_CONSECUTIVE_WRITE_ERRORS {
                    warn!(
                        room = %self.room.short_id(),
                        user = %self.user_id,
                        "{} write errors in a row, stopping {} slice",
                        errors,
                        self.kind
                    );
                    self.stop();
                }
                Err(e.into())
            }
        }
    }
}

/// Applies one effect-control request. The latest request for a
/// `kind+name+property` key preempts any in-flight interpolation.
pub(crate) async fn apply_fx_control(
    pipeline: &Pipeline,
    interpolators: &Mutex<HashMap<String, InterpolatorEntry>>,
    next_generation: &AtomicU64,
    room_end: &CancellationToken,
    peer_closed: &CancellationToken,
    payload: ControlPayload,
) {
    let interpolator_id = format!("{}{}{}", payload.kind, payload.name, payload.property);

    if payload.duration == 0 {
        let previous = {
            let mut map = interpolators.lock().unwrap_or_else(|e| e.into_inner());
            map.remove(&interpolator_id)
        };
        if let Some(previous) = previous {
            previous.stop.cancel();
        }
        pipeline.set_fx_prop(payload.kind, &payload.name, &payload.property, payload.value);
        return;
    }

    let duration = payload.duration.min(MAX_INTERPOLATOR_DURATION_MS);
    let old_value = pipeline.get_fx_prop(payload.kind, &payload.name, &payload.property);
    let mut interpolator = LinearInterpolator::new(
        old_value,
        payload.value,
        duration,
        DEFAULT_INTERPOLATOR_STEP_MS,
    );
    let stop = interpolator.stop_handle();
    let generation = next_generation.fetch_add(1, Relaxed) + 1;

    let previous = {
        let mut map = interpolators.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(
            interpolator_id.clone(),
            InterpolatorEntry {
                generation,
                stop: stop.clone(),
            },
        )
    };
    if let Some(previous) = previous {
        previous.stop.cancel();
    }

    loop {
        tokio::select! {
            // preemption and shutdown win over a buffered value
            biased;
            _ = stop.cancelled() => break,
            _ = room_end.cancelled() => break,
            _ = peer_closed.cancelled() => break,
            value = interpolator.next() => match value {
                Some(value) => {
                    pipeline.set_fx_prop(payload.kind, &payload.name, &payload.property, value);
                }
                None => break,
            }
        }
    }

    // unregister, unless a newer interpolation already took the key
    let mut map = interpolators.lock().unwrap_or_else(|e| e.into_inner());
    if map.get(&interpolator_id).map(|e| e.generation) == Some(generation) {
        map.remove(&interpolator_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DeployEnv};
    use crate::signaling::protocol::JoinPayload;

    fn test_pipeline() -> Arc<Pipeline> {
        let mut join: JoinPayload = serde_json::from_str(
            r#"{"roomId":"r1","userId":"u1","duration":30,"audioFx":"reverb name=rv"}"#,
        )
        .unwrap();
        join.validate().unwrap();
        let config = Config {
            env: DeployEnv::Dev,
            port: 8000,
            origins: vec![],
            nvidia: false,
            force_encoding_size: false,
        };
        Pipeline::new(&join, "prefix".to_string(), &config).unwrap()
    }

    fn control(value: f32, duration: u64) -> ControlPayload {
        ControlPayload {
            kind: MediaKind::Audio,
            name: "rv".to_string(),
            property: "room-size".to_string(),
            value,
            duration,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_duration_sets_property_directly() {
        let pipeline = test_pipeline();
        let interpolators = Mutex::new(HashMap::new());
        let generation = AtomicU64::new(0);
        let room_end = CancellationToken::new();
        let peer_closed = CancellationToken::new();

        apply_fx_control(
            &pipeline,
            &interpolators,
            &generation,
            &room_end,
            &peer_closed,
            control(0.6, 0),
        )
        .await;

        assert_eq!(pipeline.get_fx_prop(MediaKind::Audio, "rv", "room-size"), 0.6);
        assert!(interpolators.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interpolation_reaches_target_and_unregisters() {
        let pipeline = test_pipeline();
        let interpolators = Mutex::new(HashMap::new());
        let generation = AtomicU64::new(0);
        let room_end = CancellationToken::new();
        let peer_closed = CancellationToken::new();

        apply_fx_control(
            &pipeline,
            &interpolators,
            &generation,
            &room_end,
            &peer_closed,
            control(1.0, 300),
        )
        .await;

        assert_eq!(pipeline.get_fx_prop(MediaKind::Audio, "rv", "room-size"), 1.0);
        assert!(interpolators.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_control_preempts_running_interpolation() {
        let pipeline = test_pipeline();
        let interpolators = Arc::new(Mutex::new(HashMap::new()));
        let generation = Arc::new(AtomicU64::new(0));
        let room_end = CancellationToken::new();
        let peer_closed = CancellationToken::new();

        let first = {
            let pipeline = pipeline.clone();
            let interpolators = interpolators.clone();
            let generation = generation.clone();
            let room_end = room_end.clone();
            let peer_closed = peer_closed.clone();
            tokio::spawn(async move {
                apply_fx_control(
                    &pipeline,
                    &interpolators,
                    &generation,
                    &room_end,
                    &peer_closed,
                    control(1.0, 2000),
                )
                .await;
            })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        // the transition is under way
        let mid = pipeline.get_fx_prop(MediaKind::Audio, "rv", "room-size");
        assert!(mid > 0.0 && mid < 1.0);

        apply_fx_control(
            &pipeline,
            &interpolators,
            &generation,
            &room_end,
            &peer_closed,
            control(0.0, 0),
        )
        .await;
        first.await.unwrap();

        // cancellation wins: no further transitions after the direct set
        assert_eq!(pipeline.get_fx_prop(MediaKind::Audio, "rv", "room-size"), 0.0);
        assert!(interpolators.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_interpolator_per_key() {
        let pipeline = test_pipeline();
        let interpolators = Arc::new(Mutex::new(HashMap::new()));
        let generation = Arc::new(AtomicU64::new(0));
        let room_end = CancellationToken::new();
        let peer_closed = CancellationToken::new();

        for value in [1.0, 0.2] {
            let pipeline = pipeline.clone();
            let interpolators = interpolators.clone();
            let generation = generation.clone();
            let room_end = room_end.clone();
            let peer_closed = peer_closed.clone();
            tokio::spawn(async move {
                apply_fx_control(
                    &pipeline,
                    &interpolators,
                    &generation,
                    &room_end,
                    &peer_closed,
                    control(value, 5000),
                )
                .await;
            });
            tokio::task::yield_now().await;
        }

        assert!(interpolators.lock().unwrap().len() <= 1);
    }
}
