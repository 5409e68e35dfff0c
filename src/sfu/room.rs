#![forbid(unsafe_code)]

// Room - admission, readiness barrier, deadlines and track fan-out

use crate::metrics::ServerMetrics;
use crate::sfu::coordinator;
use crate::sfu::mixer_slice::MixerSlice;
use crate::sfu::peer_session::PeerSession;
use crate::signaling::protocol::JoinPayload;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How many times one user id may join the same room.
const MAX_RECONNECTS: u32 = 3;

/// How long a room may wait for all expected peers before aborting.
const JOINING_GRACE: Duration = Duration::from_secs(10);

/// Seconds before the hard deadline at which clients get the `ending` notice.
const ENDING_LEADTIME_SECS: u64 = 2;

/// Queue depth of coalesced renegotiation triggers.
const NEGOTIATE_QUEUE: usize = 8;

/// Admission failures; the `Display` form is the client-visible reason.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum JoinError {
    #[error("room-full")]
    RoomFull,
    #[error("room-running-already")]
    RoomRunningAlready,
    #[error("duplicate-user-connection-exceeded")]
    DuplicateUserConnectionExceeded,
    #[error("room-ended")]
    RoomEnded,
}

struct RoomInner {
    members: HashMap<String, Arc<PeerSession>>,
    /// Monotonic join counts per user id; survive early disconnects so
    /// reconnects land in the same room.
    joined_count: HashMap<String, u32>,
    /// Recording paths contributed by pipelines, insertion-ordered per user.
    files: HashMap<String, Vec<String>>,
    running: bool,
    started_at: Option<Instant>,
}

/// One conference room: the authority for membership and deadlines.
pub struct Room {
    id: String,
    short_id: String,
    size: usize,
    duration_secs: u64,
    created_at: Instant,
    inner: Mutex<RoomInner>,
    ready_tx: watch::Sender<bool>,
    end: CancellationToken,
    negotiate_tx: mpsc::Sender<()>,
    metrics: ServerMetrics,
}

impl Room {
    fn new(join: &JoinPayload, metrics: ServerMetrics) -> Arc<Self> {
        let short_id: String = join.room_id.chars().take(8).collect();
        let (negotiate_tx, negotiate_rx) = mpsc::channel(NEGOTIATE_QUEUE);
        let (ready_tx, _) = watch::channel(false);

        let room = Arc::new(Self {
            id: join.room_id.clone(),
            short_id,
            size: join.size,
            duration_secs: join.duration,
            created_at: Instant::now(),
            inner: Mutex::new(RoomInner {
                members: HashMap::new(),
                joined_count: HashMap::new(),
                files: HashMap::new(),
                running: false,
                started_at: None,
            }),
            ready_tx,
            end: CancellationToken::new(),
            negotiate_tx,
            metrics,
        });

        coordinator::spawn(room.clone(), negotiate_rx);
        room
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Short identifier for log lines.
    pub fn short_id(&self) -> &str {
        &self.short_id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RoomInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Checks admission policy and counts the join. Fails with the
    /// client-visible reason otherwise.
    pub(crate) fn admit(&self, user_id: &str) -> Result<(), JoinError> {
        let mut inner = self.lock();
        if self.end.is_cancelled() {
            return Err(JoinError::RoomEnded);
        }
        let count = inner.joined_count.get(user_id).copied().unwrap_or(0);
        if inner.running && count == 0 {
            return Err(JoinError::RoomRunningAlready);
        }
        if inner.members.len() >= self.size && !inner.members.contains_key(user_id) {
            return Err(JoinError::RoomFull);
        }
        if count >= MAX_RECONNECTS {
            return Err(JoinError::DuplicateUserConnectionExceeded);
        }
        *inner.joined_count.entry(user_id.to_string()).or_insert(0) += 1;
        Ok(())
    }

    pub fn joined_count_for(&self, user_id: &str) -> u32 {
        self.lock().joined_count.get(user_id).copied().unwrap_or(0)
    }

    /// Registers an admitted peer, fires the readiness barrier when the room
    /// fills up, and wires every existing slice to the newcomer.
    pub async fn connect_peer(self: &Arc<Self>, ps: Arc<PeerSession>) -> Result<(), JoinError> {
        let (became_ready, replaced, others) = {
            let mut inner = self.lock();
            if self.end.is_cancelled() {
                return Err(JoinError::RoomEnded);
            }
            let replaced = inner.members.insert(ps.user_id().to_string(), ps.clone());
            let became_ready = !inner.running && inner.members.len() == self.size;
            if became_ready {
                inner.running = true;
                inner.started_at = Some(Instant::now());
            }
            let others: Vec<Arc<PeerSession>> = inner
                .members
                .values()
                .filter(|m| m.user_id() != ps.user_id())
                .cloned()
                .collect();
            (became_ready, replaced, others)
        };

        if let Some(old) = replaced {
            if !Arc::ptr_eq(&old, &ps) {
                info!(room = %self.short_id, user = %ps.user_id(), "replacing previous connection");
                tokio::spawn(async move { old.close().await });
            }
        }

        if became_ready {
            info!(room = %self.short_id, "room is ready with {} peers", self.size);
            // send_replace updates the latch even before anyone subscribed
            self.ready_tx.send_replace(true);
        }

        // the newcomer subscribes to every slice the others already publish
        for other in others {
            for slice in other.slices() {
                match ps.pc().add_track(slice.output_track()).await {
                    Ok(sender) => slice.add_sender(sender, ps.user_id()).await,
                    Err(e) => warn!(
                        room = %self.short_id,
                        user = %ps.user_id(),
                        "add_track for {} slice of {}: {}",
                        slice.kind(),
                        other.user_id(),
                        e
                    ),
                }
            }
        }

        self.negotiate();
        Ok(())
    }

    /// Registers a freshly published slice on every other member.
    pub async fn broadcast_slice(self: &Arc<Self>, from_user: &str, slice: &Arc<MixerSlice>) {
        self.metrics.count_slice();
        let others: Vec<Arc<PeerSession>> = {
            let inner = self.lock();
            inner
                .members
                .values()
                .filter(|m| m.user_id() != from_user)
                .cloned()
                .collect()
        };

        for member in others {
            match member.pc().add_track(slice.output_track()).await {
                Ok(sender) => slice.add_sender(sender, member.user_id()).await,
                Err(e) => warn!(
                    room = %self.short_id,
                    user = %member.user_id(),
                    "add_track for new {} slice of {}: {}",
                    slice.kind(),
                    from_user,
                    e
                ),
            }
        }

        self.negotiate();
    }

    /// Removes a departing session; ends the room when the last member of a
    /// running room leaves, otherwise drops the departed tracks everywhere
    /// and renegotiates.
    pub async fn disconnect_user(self: &Arc<Self>, ps: &Arc<PeerSession>) {
        let user_id = ps.user_id();
        let removed = {
            let mut inner = self.lock();
            match inner.members.get(user_id) {
                // a reconnect may have replaced this entry already
                Some(current) if Arc::ptr_eq(current, ps) => inner.members.remove(user_id),
                _ => None,
            }
        };
        let Some(removed_ps) = removed else { return };

        info!(room = %self.short_id, user = %user_id, "user disconnected");

        let (running, remaining) = {
            let inner = self.lock();
            (
                inner.running,
                inner.members.values().cloned().collect::<Vec<_>>(),
            )
        };

        if running && remaining.is_empty() {
            info!(room = %self.short_id, "all peers left, ending room");
            self.end.cancel();
            return;
        }

        let track_ids = removed_ps.slice_track_ids();
        for member in &remaining {
            if !track_ids.is_empty() {
                member.pc().remove_senders_for(&track_ids).await;
            }
            for slice in member.slices() {
                slice.remove_sender(user_id);
            }
        }

        self.negotiate();
    }

    /// Appends pipeline-produced recording paths under the user's key,
    /// preserving insertion order.
    pub fn add_files(&self, user_id: &str, files: Vec<String>) {
        let mut inner = self.lock();
        inner
            .files
            .entry(user_id.to_string())
            .or_default()
            .extend(files);
    }

    pub fn files_for(&self, user_id: &str) -> Vec<String> {
        self.lock().files.get(user_id).cloned().unwrap_or_default()
    }

    /// Resolves once the room has its configured number of peers.
    pub async fn ready(&self) {
        let mut rx = self.ready_tx.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Resolves once the room is over.
    pub async fn ended(&self) {
        self.end.cancelled().await
    }

    pub fn end_token(&self) -> CancellationToken {
        self.end.clone()
    }

    fn end_is_cancelled(&self) -> bool {
        self.end.is_cancelled()
    }

    /// Seconds between readiness and the `ending` client notice.
    pub fn ending_delay_secs(&self) -> u64 {
        self.duration_secs.saturating_sub(ENDING_LEADTIME_SECS)
    }

    /// Schedules a debounced renegotiation of all peers.
    pub fn negotiate(&self) {
        let _ = self.negotiate_tx.try_send(());
    }

    /// Current members, unordered.
    pub fn members(&self) -> Vec<Arc<PeerSession>> {
        self.lock().members.values().cloned().collect()
    }

    pub fn member_count(&self) -> usize {
        self.lock().members.len()
    }

    pub(crate) fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    async fn abort_unstarted(&self) {
        warn!(room = %self.short_id, "no full room before joining deadline, aborting");
        self.metrics.count_room_aborted();
        for ps in self.members() {
            ps.send("error-room-did-not-start").await;
        }
    }

    #[cfg(test)]
    pub(crate) fn mark_running(&self) {
        self.lock().running = true;
    }
}

/// Global registry of live rooms.
#[derive(Clone)]
pub struct RoomStore {
    rooms: Arc<Mutex<HashMap<String, Arc<Room>>>>,
    metrics: ServerMetrics,
}

impl RoomStore {
    pub fn new(metrics: ServerMetrics) -> Self {
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            metrics,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Room>>> {
        self.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admission: returns the (possibly new) room the join lands in, or the
    /// client-visible rejection.
    pub fn join_room(&self, join: &JoinPayload) -> Result<Arc<Room>, JoinError> {
        let mut rooms = self.lock();

        // sweep an ended room eagerly in case its supervisor hasn't yet
        if rooms
            .get(&join.room_id)
            .is_some_and(|room| room.end_is_cancelled())
        {
            rooms.remove(&join.room_id);
        }

        if let Some(room) = rooms.get(&join.room_id) {
            room.admit(&join.user_id)?;
            return Ok(room.clone());
        }

        let room = Room::new(join, self.metrics.clone());
        room.admit(&join.user_id)?;
        rooms.insert(join.room_id.clone(), room.clone());
        self.metrics.count_room_opened();
        info!(
            room = %room.short_id,
            "room created: size {}, duration {}s",
            room.size,
            room.duration_secs
        );

        tokio::spawn(supervise(room.clone(), self.clone()));
        Ok(room)
    }

    fn remove(&self, room_id: &str) {
        self.lock().remove(room_id);
    }

    pub fn room_count(&self) -> usize {
        self.lock().len()
    }

    pub fn peer_count(&self) -> usize {
        self.lock().values().map(|room| room.member_count()).sum()
    }
}

/// Drives a room's deadlines: abort when it never fills up, end it when its
/// duration elapses, and reclaim it from the store afterwards.
async fn supervise(room: Arc<Room>, store: RoomStore) {
    tokio::select! {
        _ = room.ended() => {}
        _ = async {
            match tokio::time::timeout(JOINING_GRACE, room.ready()).await {
                Ok(()) => {
                    tokio::time::sleep(Duration::from_secs(room.duration_secs)).await;
                    let ran_for = room.lock().started_at.map(|t| t.elapsed());
                    info!(room = %room.short_id, "room duration elapsed (ran {:?})", ran_for);
                }
                Err(_) => room.abort_unstarted().await,
            }
            room.end.cancel();
        } => {}
    }

    store.remove(&room.id);
    // members close themselves on the end signal; release our references
    let members = {
        let mut inner = room.lock();
        std::mem::take(&mut inner.members)
    };
    drop(members);
    info!(room = %room.short_id, "room closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(room_id: &str, user_id: &str, size: usize, duration: u64) -> JoinPayload {
        let mut join: JoinPayload = serde_json::from_str(&format!(
            r#"{{"roomId":"{room_id}","userId":"{user_id}","duration":{duration},"size":{size}}}"#
        ))
        .unwrap();
        join.validate().unwrap();
        join
    }

    #[tokio::test]
    async fn test_joined_count_is_monotonic_and_capped() {
        let room = Room::new(&join("r1", "u1", 2, 30), ServerMetrics::new());

        for expected in 1..=MAX_RECONNECTS {
            room.admit("u1").unwrap();
            assert_eq!(room.joined_count_for("u1"), expected);
        }
        assert_eq!(
            room.admit("u1"),
            Err(JoinError::DuplicateUserConnectionExceeded)
        );
        // the failed attempt does not count
        assert_eq!(room.joined_count_for("u1"), MAX_RECONNECTS);
    }

    #[tokio::test]
    async fn test_running_room_rejects_unknown_users() {
        let room = Room::new(&join("r1", "u1", 2, 30), ServerMetrics::new());
        room.admit("u1").unwrap();
        room.mark_running();

        assert_eq!(room.admit("u2"), Err(JoinError::RoomRunningAlready));
        // a known user may reconnect into a running room
        assert!(room.admit("u1").is_ok());
    }

    #[tokio::test]
    async fn test_ended_room_rejects_joins() {
        let room = Room::new(&join("r1", "u1", 2, 30), ServerMetrics::new());
        room.end.cancel();
        assert_eq!(room.admit("u1"), Err(JoinError::RoomEnded));
    }

    #[tokio::test]
    async fn test_store_reuses_live_room() {
        let store = RoomStore::new(ServerMetrics::new());
        let a = store.join_room(&join("r1", "u1", 2, 30)).unwrap();
        let b = store.join_room(&join("r1", "u2", 2, 30)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.room_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unstarted_room_is_reclaimed_after_grace() {
        let store = RoomStore::new(ServerMetrics::new());
        let room = store.join_room(&join("r2", "u1", 2, 30)).unwrap();

        tokio::time::sleep(JOINING_GRACE + Duration::from_secs(1)).await;

        assert!(room.end_is_cancelled());
        assert_eq!(store.room_count(), 0);

        // the identifier is reusable afterwards
        let fresh = store.join_room(&join("r2", "u1", 2, 30)).unwrap();
        assert!(!Arc::ptr_eq(&room, &fresh));
    }

    #[tokio::test]
    async fn test_files_preserve_insertion_order() {
        let room = Room::new(&join("r1", "u1", 2, 30), ServerMetrics::new());
        room.add_files("u1", vec!["a-in.ogg".into(), "a-fx.ogg".into()]);
        room.add_files("u1", vec!["b-in.mkv".into()]);

        assert_eq!(room.files_for("u1"), vec!["a-in.ogg", "a-fx.ogg", "b-in.mkv"]);
        assert!(room.files_for("u2").is_empty());
    }

    #[tokio::test]
    async fn test_ending_delay_clamps_to_zero() {
        let room = Room::new(&join("r1", "u1", 2, 30), ServerMetrics::new());
        assert_eq!(room.ending_delay_secs(), 28);

        let short = Room::new(&join("r1", "u1", 2, 1), ServerMetrics::new());
        assert_eq!(short.ending_delay_secs(), 0);
    }
}
