#![forbid(unsafe_code)]

// Sender controller - per-subscriber bitrate target derived from RTCP feedback

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webrtc::rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

/// Bounds for subscriber bandwidth estimates, bits per second.
pub const MIN_BITRATE: u64 = 100_000;
pub const MAX_BITRATE: u64 = 4_000_000;

/// Tracks the RTCP feedback of one outbound sender and derives the bitrate
/// this subscriber can receive.
pub struct SenderController {
    sender: Arc<RTCRtpSender>,
    to_user_id: String,
    /// Starts at the configured minimum until the first estimate arrives.
    optimal_bitrate: AtomicU64,
}

pub(crate) fn clamp_estimate(bits_per_second: u64) -> u64 {
    bits_per_second.clamp(MIN_BITRATE, MAX_BITRATE)
}

impl SenderController {
    pub fn new(sender: Arc<RTCRtpSender>, to_user_id: &str) -> Arc<Self> {
        Arc::new(Self {
            sender,
            to_user_id: to_user_id.to_string(),
            optimal_bitrate: AtomicU64::new(MIN_BITRATE),
        })
    }

    pub fn optimal_bitrate(&self) -> u64 {
        self.optimal_bitrate.load(Relaxed)
    }

    pub fn to_user_id(&self) -> &str {
        &self.to_user_id
    }

    /// Reads RTCP flowing on the sender until the slice ends or the sender is
    /// removed. REMB carries the subscriber's estimate; TWCC feedback is
    /// already consumed by the interceptors.
    pub async fn run_listener(self: Arc<Self>, end: CancellationToken, room_id: String) {
        loop {
            let packets = tokio::select! {
                _ = end.cancelled() => return,
                result = self.sender.read_rtcp() => match result {
                    Ok((packets, _)) => packets,
                    Err(webrtc::Error::ErrClosedPipe) => return,
                    Err(e) => {
                        warn!(room = %room_id, to_user = %self.to_user_id, "rtcp read: {}", e);
                        return;
                    }
                },
            };

            for packet in packets {
                if let Some(remb) = packet
                    .as_any()
                    .downcast_ref::<ReceiverEstimatedMaximumBitrate>()
                {
                    let estimate = clamp_estimate(remb.bitrate as u64);
                    let previous = self.optimal_bitrate.swap(estimate, Relaxed);
                    if previous != estimate {
                        debug!(
                            room = %room_id,
                            to_user = %self.to_user_id,
                            "subscriber estimate {} bit/s",
                            estimate
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_clamping() {
        assert_eq!(clamp_estimate(10_000), MIN_BITRATE);
        assert_eq!(clamp_estimate(300_000), 300_000);
        assert_eq!(clamp_estimate(50_000_000), MAX_BITRATE);
    }
}
