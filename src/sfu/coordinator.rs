#![forbid(unsafe_code)]

// Signaling coordinator - one task per room owning the renegotiation debounce

use crate::sfu::room::Room;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Coalescing window for renegotiation triggers. Joining peers and fresh
/// tracks arrive in bursts; one offer round covers them all.
const SIGNALING_DEBOUNCE: Duration = Duration::from_millis(150);

/// Runs until the room ends. Any number of triggers within the debounce
/// window collapse into a single offer round.
pub(crate) fn spawn(room: Arc<Room>, mut trigger_rx: mpsc::Receiver<()>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = room.ended() => break,
                signal = trigger_rx.recv() => {
                    if signal.is_none() {
                        break;
                    }
                    tokio::time::sleep(SIGNALING_DEBOUNCE).await;
                    while trigger_rx.try_recv().is_ok() {}
                    renegotiate_all(&room).await;
                }
            }
        }
        debug!(room = %room.short_id(), "signaling coordinator finished");
    });
}

async fn renegotiate_all(room: &Arc<Room>) {
    let mut peers = room.members();
    // lexical order keeps traces reproducible
    peers.sort_by(|a, b| a.user_id().cmp(b.user_id()));

    debug!(room = %room.short_id(), "renegotiating {} peers", peers.len());
    for ps in peers {
        if let Err(e) = ps.send_offer().await {
            // skip the offending peer, the others still get their offer
            warn!(
                room = %room.short_id(),
                user = %ps.user_id(),
                "offer failed: {}", e
            );
        }
    }
}
