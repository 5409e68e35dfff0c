#![forbid(unsafe_code)]

// Pipeline module - control surface of the per-peer media processing backend
//
// The backend decodes, applies effects, records and re-encodes each lane; this
// facade owns what the rest of the server needs from it: an RTP intake queue
// per lane, the fx property state, the encoder bitrate target, recording file
// paths, and the keyframe-request hook.

pub mod config;

use crate::config::Config;
use crate::signaling::protocol::{JoinPayload, MediaKind, VideoFormat};
use bytes::Bytes;
use self::config::{recording_ext, Codec};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-lane RTP intake queue depth. At 50 packets/s audio this is multiple
/// seconds of backlog; overflow drops packets rather than stalling the reader.
const RTP_QUEUE_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),
}

/// Destination for processed RTP, implemented by the mixer slice.
#[async_trait::async_trait]
pub trait TrackWriter: Send + Sync {
    fn id(&self) -> String;
    async fn write(&self, buf: &[u8]) -> anyhow::Result<()>;
}

/// Hard encoder caps, applied when the host sets `DS_FORCE_ENCODING_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingCaps {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

struct Lane {
    codec: Codec,
    fx: String,
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    /// Effect properties keyed by `name:property`.
    props: Mutex<HashMap<String, f32>>,
    encoding_rate: AtomicU64,
}

impl Lane {
    fn new(codec: Codec, fx: String) -> Self {
        Self {
            codec,
            fx,
            tx: Mutex::new(None),
            props: Mutex::new(HashMap::new()),
            encoding_rate: AtomicU64::new(0),
        }
    }

    fn has_fx(&self) -> bool {
        !self.fx.is_empty()
    }
}

/// One processing pipeline per peer, with an audio and a video lane.
pub struct Pipeline {
    room_id: String,
    user_id: String,
    namespace: String,
    file_prefix: String,
    recording: bool,
    caps: Option<EncodingCaps>,
    audio: Lane,
    video: Lane,
    pli: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    stop: CancellationToken,
}

impl Pipeline {
    pub fn new(join: &JoinPayload, file_prefix: String, config: &Config) -> Result<Arc<Self>, PipelineError> {
        // The namespace becomes a directory component of recording paths.
        if join.namespace.contains("..") || join.namespace.contains('/') {
            return Err(PipelineError::InvalidNamespace(join.namespace.clone()));
        }

        let video_codec = Codec::for_kind(
            MediaKind::Video,
            join.video_format,
            join.gpu,
            config.nvidia,
        );
        if join.gpu && join.video_format == VideoFormat::H264 && !config.nvidia {
            debug!(
                room = %join.room_id,
                user = %join.user_id,
                "gpu encoding requested but DS_NVIDIA is off, using {}",
                video_codec.encoder()
            );
        }

        let caps = config.force_encoding_size.then_some(EncodingCaps {
            width: join.width,
            height: join.height,
            frame_rate: join.frame_rate,
        });

        let pipeline = Arc::new(Self {
            room_id: join.room_id.clone(),
            user_id: join.user_id.clone(),
            namespace: join.namespace.clone(),
            file_prefix,
            recording: join.recording_enabled(),
            caps,
            audio: Lane::new(Codec::Opus, join.audio_fx.clone()),
            video: Lane::new(video_codec, join.video_fx.clone()),
            pli: Mutex::new(None),
            stop: CancellationToken::new(),
        });

        info!(
            room = %pipeline.room_id,
            user = %pipeline.user_id,
            "pipeline initialized (video encoder: {}, caps: {:?})",
            video_codec.encoder(),
            pipeline.caps
        );
        Ok(pipeline)
    }

    fn lane(&self, kind: MediaKind) -> &Lane {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }

    /// Attaches the output writer for one lane and starts its worker. Returns
    /// the recording paths this lane will produce.
    pub fn bind_track(&self, kind: MediaKind, writer: Arc<dyn TrackWriter>) -> Vec<String> {
        let lane = self.lane(kind);
        let (tx, mut rx) = mpsc::channel::<Bytes>(RTP_QUEUE_CAPACITY);
        {
            let mut slot = lane.tx.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_some() {
                warn!(
                    room = %self.room_id,
                    user = %self.user_id,
                    "{} lane already bound, rebinding",
                    kind
                );
            }
            *slot = Some(tx);
        }

        let stop = self.stop.clone();
        let room_id = self.room_id.clone();
        let user_id = self.user_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    buf = rx.recv() => match buf {
                        Some(buf) => {
                            if let Err(e) = writer.write(&buf).await {
                                debug!(room = %room_id, user = %user_id, "{} lane write: {}", kind, e);
                            }
                        }
                        None => break,
                    }
                }
            }
            debug!(room = %room_id, user = %user_id, "{} lane worker finished", kind);
        });

        info!(
            room = %self.room_id,
            user = %self.user_id,
            "pipeline {} lane started with recording prefix {}/{}",
            kind,
            self.namespace,
            self.file_prefix
        );
        self.files(kind)
    }

    /// Registers the keyframe-request hook, invoked by the backend when the
    /// video decoder observes unrecoverable frame loss.
    pub fn bind_pli_callback(&self, f: impl Fn() + Send + Sync + 'static) {
        let mut slot = self.pli.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::new(f));
    }

    /// Backend entry point for keyframe requests.
    pub fn request_keyframe(&self) {
        let callback = {
            let slot = self.pli.lock().unwrap_or_else(|e| e.into_inner());
            slot.clone()
        };
        if let Some(f) = callback {
            f();
        }
    }

    /// Queues one RTP packet for processing. Never blocks; packets beyond the
    /// queue capacity are dropped.
    pub fn push_rtp(&self, kind: MediaKind, buf: Bytes) {
        let lane = self.lane(kind);
        let tx = {
            let slot = lane.tx.lock().unwrap_or_else(|e| e.into_inner());
            slot.clone()
        };
        if let Some(tx) = tx {
            let _ = tx.try_send(buf);
        }
    }

    /// Sets the lane's encoder target, in bits per second.
    pub fn set_encoding_rate(&self, kind: MediaKind, bits_per_second: u64) {
        let lane = self.lane(kind);
        lane.encoding_rate.store(bits_per_second, Relaxed);
        debug!(
            room = %self.room_id,
            user = %self.user_id,
            "{} encoder {}={}",
            kind,
            lane.codec.bitrate_prop(),
            lane.codec.scale_bitrate(bits_per_second)
        );
    }

    pub fn encoding_rate(&self, kind: MediaKind) -> u64 {
        self.lane(kind).encoding_rate.load(Relaxed)
    }

    /// Width/height/framerate caps forced on the video encoder, if any.
    pub fn encoding_caps(&self) -> Option<EncodingCaps> {
        self.caps
    }

    pub fn set_fx_prop(&self, kind: MediaKind, name: &str, property: &str, value: f32) {
        let lane = self.lane(kind);
        let mut props = lane.props.lock().unwrap_or_else(|e| e.into_inner());
        props.insert(format!("{name}:{property}"), value);
    }

    pub fn get_fx_prop(&self, kind: MediaKind, name: &str, property: &str) -> f32 {
        let lane = self.lane(kind);
        let props = lane.props.lock().unwrap_or_else(|e| e.into_inner());
        props.get(&format!("{name}:{property}")).copied().unwrap_or(0.0)
    }

    /// Recording paths one lane produces: the raw capture, plus the processed
    /// capture when an effect is configured.
    pub fn files(&self, kind: MediaKind) -> Vec<String> {
        if !self.recording {
            return Vec::new();
        }
        let lane = self.lane(kind);
        let mut files = vec![self.file_name(kind, "in")];
        if lane.has_fx() {
            files.push(self.file_name(kind, "fx"));
        }
        files
    }

    fn file_name(&self, kind: MediaKind, suffix: &str) -> String {
        format!(
            "{}/{}-{}-{}{}",
            self.namespace,
            self.file_prefix,
            kind,
            suffix,
            recording_ext(kind)
        )
    }

    /// Stops both lane workers. Idempotent.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            info!(room = %self.room_id, user = %self.user_id, "pipeline stop requested");
            self.stop.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_join() -> JoinPayload {
        let mut join: JoinPayload = serde_json::from_str(
            r#"{"roomId":"r1","userId":"u1","duration":30,"namespace":"ns","audioFx":"reverb name=rv"}"#,
        )
        .unwrap();
        join.validate().unwrap();
        join
    }

    fn test_config() -> Config {
        Config {
            env: crate::config::DeployEnv::Dev,
            port: 8000,
            origins: vec![],
            nvidia: false,
            force_encoding_size: false,
        }
    }

    struct RecordingWriter {
        tx: mpsc::UnboundedSender<Vec<u8>>,
    }

    #[async_trait::async_trait]
    impl TrackWriter for RecordingWriter {
        fn id(&self) -> String {
            "writer-1".to_string()
        }

        async fn write(&self, buf: &[u8]) -> anyhow::Result<()> {
            self.tx.send(buf.to_vec())?;
            Ok(())
        }
    }

    #[test]
    fn test_recording_file_names() {
        let pipeline = Pipeline::new(
            &test_join(),
            "20260802-101530.000-r-r1-u-u1-c-1".to_string(),
            &test_config(),
        )
        .unwrap();

        // Audio lane has an fx, so it records both captures
        let audio = pipeline.files(MediaKind::Audio);
        assert_eq!(
            audio,
            vec![
                "ns/20260802-101530.000-r-r1-u-u1-c-1-audio-in.ogg",
                "ns/20260802-101530.000-r-r1-u-u1-c-1-audio-fx.ogg",
            ]
        );

        // Video lane has no fx
        let video = pipeline.files(MediaKind::Video);
        assert_eq!(video, vec!["ns/20260802-101530.000-r-r1-u-u1-c-1-video-in.mkv"]);
    }

    #[test]
    fn test_recording_mode_none_produces_no_files() {
        let mut join = test_join();
        join.recording_mode = "none".to_string();
        let pipeline = Pipeline::new(&join, "prefix".to_string(), &test_config()).unwrap();
        assert!(pipeline.files(MediaKind::Audio).is_empty());
    }

    #[test]
    fn test_namespace_cannot_escape() {
        let mut join = test_join();
        join.namespace = "../etc".to_string();
        assert!(Pipeline::new(&join, "prefix".to_string(), &test_config()).is_err());
    }

    #[test]
    fn test_forced_encoding_size_caps() {
        let mut config = test_config();
        let pipeline = Pipeline::new(&test_join(), "prefix".to_string(), &config).unwrap();
        assert_eq!(pipeline.encoding_caps(), None);

        config.force_encoding_size = true;
        let pipeline = Pipeline::new(&test_join(), "prefix".to_string(), &config).unwrap();
        assert_eq!(
            pipeline.encoding_caps(),
            Some(EncodingCaps {
                width: 800,
                height: 600,
                frame_rate: 30,
            })
        );
    }

    #[test]
    fn test_fx_props_default_to_zero() {
        let pipeline = Pipeline::new(&test_join(), "prefix".to_string(), &test_config()).unwrap();

        assert_eq!(pipeline.get_fx_prop(MediaKind::Audio, "rv", "room-size"), 0.0);
        pipeline.set_fx_prop(MediaKind::Audio, "rv", "room-size", 0.7);
        assert_eq!(pipeline.get_fx_prop(MediaKind::Audio, "rv", "room-size"), 0.7);
        // Lanes are independent
        assert_eq!(pipeline.get_fx_prop(MediaKind::Video, "rv", "room-size"), 0.0);
    }

    #[tokio::test]
    async fn test_push_rtp_reaches_bound_writer() {
        let pipeline = Pipeline::new(&test_join(), "prefix".to_string(), &test_config()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let files = pipeline.bind_track(MediaKind::Audio, Arc::new(RecordingWriter { tx }));
        assert_eq!(files.len(), 2);

        pipeline.push_rtp(MediaKind::Audio, Bytes::from_static(&[1, 2, 3]));
        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, vec![1, 2, 3]);

        // Unbound lane drops silently
        pipeline.push_rtp(MediaKind::Video, Bytes::from_static(&[4]));

        pipeline.stop();
        pipeline.stop();
    }
}
