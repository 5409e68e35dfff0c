#![forbid(unsafe_code)]

// Pipeline configuration - per-codec encoder settings

use crate::signaling::protocol::{MediaKind, VideoFormat};

/// Encoder selected for one pipeline lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Opus,
    Vp8,
    X264,
    /// NVIDIA hardware H264, only when the host enables it and the client asked.
    Nv264,
}

impl Codec {
    pub fn for_kind(
        kind: MediaKind,
        video_format: VideoFormat,
        gpu_requested: bool,
        nvidia_enabled: bool,
    ) -> Self {
        match kind {
            MediaKind::Audio => Self::Opus,
            MediaKind::Video => match video_format {
                VideoFormat::Vp8 => Self::Vp8,
                VideoFormat::H264 => {
                    if gpu_requested && nvidia_enabled {
                        Self::Nv264
                    } else {
                        Self::X264
                    }
                }
            },
        }
    }

    /// Encoder element name in the processing backend.
    pub fn encoder(&self) -> &'static str {
        match self {
            Self::Opus => "opusenc",
            Self::Vp8 => "vp8enc",
            Self::X264 => "x264enc",
            Self::Nv264 => "nvh264enc",
        }
    }

    /// Name of the encoder property that carries the target bitrate.
    pub fn bitrate_prop(&self) -> &'static str {
        match self {
            Self::Vp8 => "target-bitrate",
            _ => "bitrate",
        }
    }

    /// Converts a bits-per-second target into the unit the encoder expects.
    /// The H264 encoders take kbit/s; the others take bit/s.
    pub fn scale_bitrate(&self, bits_per_second: u64) -> u64 {
        match self {
            Self::X264 | Self::Nv264 => bits_per_second / 1000,
            _ => bits_per_second,
        }
    }
}

/// Recording container extension per kind.
pub fn recording_ext(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Audio => ".ogg",
        MediaKind::Video => ".mkv",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_selection() {
        assert_eq!(
            Codec::for_kind(MediaKind::Audio, VideoFormat::H264, true, true),
            Codec::Opus
        );
        assert_eq!(
            Codec::for_kind(MediaKind::Video, VideoFormat::Vp8, true, true),
            Codec::Vp8
        );
        // GPU encoding needs both the client request and host support
        assert_eq!(
            Codec::for_kind(MediaKind::Video, VideoFormat::H264, true, false),
            Codec::X264
        );
        assert_eq!(
            Codec::for_kind(MediaKind::Video, VideoFormat::H264, true, true),
            Codec::Nv264
        );
    }

    #[test]
    fn test_bitrate_units() {
        assert_eq!(Codec::Vp8.scale_bitrate(300_000), 300_000);
        assert_eq!(Codec::X264.scale_bitrate(300_000), 300);
        assert_eq!(Codec::Vp8.bitrate_prop(), "target-bitrate");
        assert_eq!(Codec::X264.bitrate_prop(), "bitrate");
    }
}
