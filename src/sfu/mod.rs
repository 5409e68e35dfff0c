#![forbid(unsafe_code)]

// SFU module - rooms, peer sessions and the per-track data plane

pub mod coordinator;
pub mod engine;
pub mod mixer_slice;
pub mod peer_conn;
pub mod peer_session;
pub mod room;
pub mod sender_controller;

pub use mixer_slice::MixerSlice;
pub use peer_conn::PeerConn;
pub use peer_session::PeerSession;
pub use room::{JoinError, Room, RoomStore};
