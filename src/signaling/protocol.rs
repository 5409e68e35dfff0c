#![forbid(unsafe_code)]

// Signaling protocol - websocket envelope and payload types

use anyhow::{bail, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Admitted room duration bounds, seconds.
pub const MIN_DURATION_SECS: u64 = 1;
pub const MAX_DURATION_SECS: u64 = 1200;

/// Admitted room size bounds.
pub const MIN_SIZE: usize = 1;
pub const MAX_SIZE: usize = 8;

const MAX_ID_LEN: usize = 64;

/// Every websocket frame, in both directions: a kind plus a JSON string
/// payload (double-encoded).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: String,
    #[serde(default)]
    pub payload: String,
}

impl Envelope {
    /// A payloadless frame (`ending`, `error-*`).
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: String::new(),
        }
    }

    /// A frame whose payload is the JSON encoding of `payload`.
    pub fn with_payload<T: Serialize>(kind: impl Into<String>, payload: &T) -> Result<Self> {
        Ok(Self {
            kind: kind.into(),
            payload: serde_json::to_string(payload)?,
        })
    }

    /// Decodes the double-encoded payload.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.payload)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Media kind of a track or pipeline lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Video codec requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VideoFormat {
    #[default]
    #[serde(rename = "VP8")]
    Vp8,
    #[serde(rename = "H264")]
    H264,
}

/// First frame of every connection. Immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub room_id: String,
    pub user_id: String,
    /// Requested room duration in seconds, clamped on validation.
    pub duration: u64,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub video_format: VideoFormat,
    #[serde(default)]
    pub recording_mode: String,
    #[serde(default = "default_size")]
    pub size: usize,
    #[serde(default)]
    pub audio_fx: String,
    #[serde(default)]
    pub video_fx: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
    #[serde(default)]
    pub gpu: bool,
    /// Inferred from the connection, never taken from JSON.
    #[serde(skip)]
    pub origin: String,
}

fn default_size() -> usize {
    2
}

fn default_width() -> u32 {
    800
}

fn default_height() -> u32 {
    600
}

fn default_frame_rate() -> u32 {
    30
}

fn printable_id(s: &str) -> bool {
    !s.is_empty() && s.len() <= MAX_ID_LEN && s.chars().all(|c| c.is_ascii_graphic())
}

impl JoinPayload {
    /// Normalizes defaults and rejects malformed requests.
    pub fn validate(&mut self) -> Result<()> {
        if !printable_id(&self.room_id) {
            bail!("invalid roomId");
        }
        if !printable_id(&self.user_id) {
            bail!("invalid userId");
        }
        if self.size < MIN_SIZE || self.size > MAX_SIZE {
            bail!("invalid size: {}", self.size);
        }
        self.duration = self.duration.clamp(MIN_DURATION_SECS, MAX_DURATION_SECS);
        if self.namespace.is_empty() {
            self.namespace = "default".to_string();
        }
        if self.width == 0 {
            self.width = default_width();
        }
        if self.height == 0 {
            self.height = default_height();
        }
        if self.frame_rate == 0 {
            self.frame_rate = default_frame_rate();
        }
        Ok(())
    }

    /// Effect descriptor for the given kind.
    pub fn fx(&self, kind: MediaKind) -> &str {
        match kind {
            MediaKind::Audio => &self.audio_fx,
            MediaKind::Video => &self.video_fx,
        }
    }

    pub fn recording_enabled(&self) -> bool {
        self.recording_mode != "none"
    }
}

/// `control` frame payload: one effect property change, optionally interpolated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPayload {
    pub kind: MediaKind,
    pub name: String,
    pub property: String,
    pub value: f32,
    /// Transition duration in milliseconds; 0 applies immediately.
    #[serde(default)]
    pub duration: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let control = ControlPayload {
            kind: MediaKind::Audio,
            name: "reverb".to_string(),
            property: "room-size".to_string(),
            value: 0.8,
            duration: 500,
        };
        let envelope = Envelope::with_payload("control", &control).unwrap();
        let json = envelope.to_json().unwrap();

        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, "control");
        let payload: ControlPayload = parsed.parse_payload().unwrap();
        assert_eq!(payload.name, "reverb");
        assert_eq!(payload.duration, 500);
    }

    #[test]
    fn test_join_defaults() {
        let raw = r#"{"roomId":"r1","userId":"u1","duration":30}"#;
        let mut join: JoinPayload = serde_json::from_str(raw).unwrap();
        join.validate().unwrap();

        assert_eq!(join.size, 2);
        assert_eq!(join.namespace, "default");
        assert_eq!(join.video_format, VideoFormat::Vp8);
        assert_eq!(join.width, 800);
        assert_eq!(join.frame_rate, 30);
    }

    #[test]
    fn test_join_validation_rejects_bad_ids() {
        let raw = r#"{"roomId":"","userId":"u1","duration":30}"#;
        let mut join: JoinPayload = serde_json::from_str(raw).unwrap();
        assert!(join.validate().is_err());

        let raw = r#"{"roomId":"r1","userId":"a b","duration":30}"#;
        let mut join: JoinPayload = serde_json::from_str(raw).unwrap();
        assert!(join.validate().is_err());

        let raw = r#"{"roomId":"r1","userId":"u1","duration":30,"size":0}"#;
        let mut join: JoinPayload = serde_json::from_str(raw).unwrap();
        assert!(join.validate().is_err());
    }

    #[test]
    fn test_join_duration_clamped() {
        let raw = r#"{"roomId":"r1","userId":"u1","duration":99999}"#;
        let mut join: JoinPayload = serde_json::from_str(raw).unwrap();
        join.validate().unwrap();
        assert_eq!(join.duration, MAX_DURATION_SECS);

        let raw = r#"{"roomId":"r1","userId":"u1","duration":0}"#;
        let mut join: JoinPayload = serde_json::from_str(raw).unwrap();
        join.validate().unwrap();
        assert_eq!(join.duration, MIN_DURATION_SECS);
    }

    #[test]
    fn test_origin_never_read_from_json() {
        let raw = r#"{"roomId":"r1","userId":"u1","duration":30,"origin":"https://evil.example.org"}"#;
        let join: JoinPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(join.origin, "");
    }

    #[test]
    fn test_video_format_parsing() {
        let raw = r#"{"roomId":"r1","userId":"u1","duration":30,"videoFormat":"H264"}"#;
        let join: JoinPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(join.video_format, VideoFormat::H264);
    }
}
