#![forbid(unsafe_code)]

pub mod frames;

pub use frames::{
	ClientFrame, DEFAULT_MAX_FRAME_SIZE, MessageEvent, Participant, PresenceStatus, ServerFrame, WireError,
	decode_client_frame,
};

/// WebSocket close codes used by the server.
pub mod close {
	/// Normal closure: chat ended cleanly or the server is shutting the
	/// connection down after a completed end-chat.
	pub const NORMAL: u16 = 1000;
	/// Policy violation: the connection did not name a room.
	pub const POLICY: u16 = 1008;
	/// Credential missing or rejected.
	pub const UNAUTHORIZED: u16 = 4401;
	/// Credential valid but scoped to a different room.
	pub const FORBIDDEN: u16 = 4403;
}
