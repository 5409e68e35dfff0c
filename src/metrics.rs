#![forbid(unsafe_code)]

// Metrics - SFU lifecycle counters and slice bitrate distribution,
// rendered in Prometheus text exposition format

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

/// Bucket bounds for the slice output-bitrate histogram, kbit/s. The low end
/// covers Opus voice, the high end the ceiling the sender controllers allow.
const BITRATE_BUCKETS_KBPS: [u64; 8] = [32, 64, 128, 256, 512, 1024, 2048, 4096];

/// Shared handle to the server-wide metrics. Cheap to clone; all writes are
/// relaxed atomics.
#[derive(Clone)]
pub struct ServerMetrics {
    shared: Arc<Shared>,
}

struct Shared {
    // websocket traffic
    connections: AtomicU64,
    connections_open: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    // admission
    joins: AtomicU64,
    joins_rejected: AtomicU64,
    // room and slice lifecycle
    rooms_opened: AtomicU64,
    rooms_aborted: AtomicU64,
    slices: AtomicU64,
    offers: AtomicU64,
    errors: AtomicU64,
    // one observation count per bucket, plus a slot for everything above the
    // last bound; cumulated only at render time
    bitrate_slots: [AtomicU64; BITRATE_BUCKETS_KBPS.len() + 1],
    bitrate_sum_kbps: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                connections: AtomicU64::new(0),
                connections_open: AtomicU64::new(0),
                frames_in: AtomicU64::new(0),
                frames_out: AtomicU64::new(0),
                joins: AtomicU64::new(0),
                joins_rejected: AtomicU64::new(0),
                rooms_opened: AtomicU64::new(0),
                rooms_aborted: AtomicU64::new(0),
                slices: AtomicU64::new(0),
                offers: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                bitrate_slots: std::array::from_fn(|_| AtomicU64::new(0)),
                bitrate_sum_kbps: AtomicU64::new(0),
            }),
        }
    }

    /// Counts a websocket connection and holds the open-connection gauge up
    /// for as long as the returned guard lives, handler panics included.
    pub fn count_connection(&self) -> OpenConnection {
        self.shared.connections.fetch_add(1, Relaxed);
        self.shared.connections_open.fetch_add(1, Relaxed);
        OpenConnection {
            shared: self.shared.clone(),
        }
    }

    pub fn count_frame_in(&self) {
        self.shared.frames_in.fetch_add(1, Relaxed);
    }

    pub fn count_frame_out(&self) {
        self.shared.frames_out.fetch_add(1, Relaxed);
    }

    pub fn count_join(&self) {
        self.shared.joins.fetch_add(1, Relaxed);
    }

    /// An admission rejection (`room-full`, reconnect cap, ...), as opposed
    /// to a malformed request.
    pub fn count_join_rejected(&self) {
        self.shared.joins_rejected.fetch_add(1, Relaxed);
    }

    pub fn count_room_opened(&self) {
        self.shared.rooms_opened.fetch_add(1, Relaxed);
    }

    /// A room that hit its joining deadline before filling up.
    pub fn count_room_aborted(&self) {
        self.shared.rooms_aborted.fetch_add(1, Relaxed);
    }

    pub fn count_slice(&self) {
        self.shared.slices.fetch_add(1, Relaxed);
    }

    pub fn count_offer(&self) {
        self.shared.offers.fetch_add(1, Relaxed);
    }

    pub fn count_error(&self) {
        self.shared.errors.fetch_add(1, Relaxed);
    }

    /// Records one slice bitrate sample from the 3-second stats tick.
    pub fn observe_output_bitrate(&self, kbps: u64) {
        let slot = BITRATE_BUCKETS_KBPS
            .iter()
            .position(|&bound| kbps <= bound)
            .unwrap_or(BITRATE_BUCKETS_KBPS.len());
        self.shared.bitrate_slots[slot].fetch_add(1, Relaxed);
        self.shared.bitrate_sum_kbps.fetch_add(kbps, Relaxed);
    }

    /// Renders everything in Prometheus text exposition format. Room and peer
    /// gauges come from the room store, which owns that state.
    pub fn render_prometheus(&self, rooms_active: usize, peers_active: usize) -> String {
        let s = &self.shared;
        let mut out = String::with_capacity(2048);

        let counters = [
            ("roomfx_connections_total", "Websocket connections accepted", s.connections.load(Relaxed)),
            ("roomfx_frames_received_total", "Signaling frames received from clients", s.frames_in.load(Relaxed)),
            ("roomfx_frames_sent_total", "Signaling frames sent to clients", s.frames_out.load(Relaxed)),
            ("roomfx_joins_total", "Accepted room joins", s.joins.load(Relaxed)),
            ("roomfx_joins_rejected_total", "Joins rejected by admission policy", s.joins_rejected.load(Relaxed)),
            ("roomfx_rooms_opened_total", "Rooms created", s.rooms_opened.load(Relaxed)),
            ("roomfx_rooms_aborted_total", "Rooms that missed their joining deadline", s.rooms_aborted.load(Relaxed)),
            ("roomfx_slices_total", "Mixer slices created", s.slices.load(Relaxed)),
            ("roomfx_offers_total", "Renegotiation offers sent", s.offers.load(Relaxed)),
            ("roomfx_errors_total", "Errors", s.errors.load(Relaxed)),
        ];
        for (name, help, value) in counters {
            push_metric(&mut out, "counter", name, help, value);
        }

        let gauges = [
            ("roomfx_connections_open", "Currently open websocket connections", s.connections_open.load(Relaxed)),
            ("roomfx_rooms_active", "Rooms currently live", rooms_active as u64),
            ("roomfx_peers_active", "Peers currently in a room", peers_active as u64),
        ];
        for (name, help, value) in gauges {
            push_metric(&mut out, "gauge", name, help, value);
        }

        self.render_bitrate_histogram(&mut out);
        out
    }

    fn render_bitrate_histogram(&self, out: &mut String) {
        let name = "roomfx_slice_output_kbps";
        let _ = writeln!(out, "# HELP {name} Slice output bitrate samples in kbit/s");
        let _ = writeln!(out, "# TYPE {name} histogram");

        let mut cumulative = 0u64;
        for (i, bound) in BITRATE_BUCKETS_KBPS.iter().enumerate() {
            cumulative += self.shared.bitrate_slots[i].load(Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
        }
        cumulative += self.shared.bitrate_slots[BITRATE_BUCKETS_KBPS.len()].load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");
        let _ = writeln!(out, "{name}_sum {}", self.shared.bitrate_sum_kbps.load(Relaxed));
        let _ = writeln!(out, "{name}_count {cumulative}");
    }
}

/// Keeps `roomfx_connections_open` raised until the connection handler is
/// done with its socket.
pub struct OpenConnection {
    shared: Arc<Shared>,
}

impl Drop for OpenConnection {
    fn drop(&mut self) {
        self.shared.connections_open.fetch_sub(1, Relaxed);
    }
}

fn push_metric(out: &mut String, kind: &str, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        let metrics = ServerMetrics::new();
        metrics.count_join();
        metrics.count_join_rejected();
        metrics.count_room_opened();

        let out = metrics.render_prometheus(1, 2);
        assert!(out.contains("roomfx_joins_total 1"));
        assert!(out.contains("roomfx_joins_rejected_total 1"));
        assert!(out.contains("roomfx_rooms_opened_total 1"));
        assert!(out.contains("roomfx_rooms_active 1"));
        assert!(out.contains("roomfx_peers_active 2"));
    }

    #[test]
    fn test_open_connection_gauge_drops_with_guard() {
        let metrics = ServerMetrics::new();
        {
            let _a = metrics.count_connection();
            let _b = metrics.count_connection();
            assert!(metrics.render_prometheus(0, 0).contains("roomfx_connections_open 2"));
        }
        let out = metrics.render_prometheus(0, 0);
        assert!(out.contains("roomfx_connections_open 0"));
        assert!(out.contains("roomfx_connections_total 2"));
    }

    #[test]
    fn test_bitrate_histogram_is_cumulative_at_render() {
        let metrics = ServerMetrics::new();
        metrics.observe_output_bitrate(48);    // voice
        metrics.observe_output_bitrate(900);   // video
        metrics.observe_output_bitrate(9_000); // above the last bound

        let out = metrics.render_prometheus(0, 0);
        assert!(out.contains(r#"roomfx_slice_output_kbps_bucket{le="64"} 1"#));
        assert!(out.contains(r#"roomfx_slice_output_kbps_bucket{le="1024"} 2"#));
        assert!(out.contains(r#"roomfx_slice_output_kbps_bucket{le="4096"} 2"#));
        assert!(out.contains(r#"roomfx_slice_output_kbps_bucket{le="+Inf"} 3"#));
        assert!(out.contains("roomfx_slice_output_kbps_count 3"));
        assert!(out.contains("roomfx_slice_output_kbps_sum 9948"));
    }
}
