#![forbid(unsafe_code)]

use parley_domain::{ChatMessage, EndReason, Identity, UserType};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum accepted size of one inbound frame, in bytes.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Errors for decoding inbound frames.
#[derive(Debug, Error)]
pub enum WireError {
	#[error("frame of {len} bytes exceeds limit of {max} bytes")]
	Oversize { len: usize, max: usize },
	#[error("malformed frame: {0}")]
	Malformed(#[from] serde_json::Error),
}

/// One inbound JSON frame, discriminated on `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
	#[serde(rename_all = "camelCase")]
	Auth {
		#[serde(default)]
		token: Option<String>,
		#[serde(default)]
		user_id: Option<String>,
		#[serde(default)]
		user_type: Option<UserType>,
		#[serde(default)]
		user_name: Option<String>,
	},
	Message {
		content: String,
	},
	#[serde(rename_all = "camelCase")]
	Typing {
		is_typing: bool,
	},
	EndChat {
		#[serde(default)]
		reason: Option<EndReason>,
	},
	Ping,
}

/// Presence transition carried by a `presence` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
	Online,
	Offline,
}

/// Chat message payload as it appears on the wire, both as a live
/// `message` frame and inside `history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
	pub id: String,
	pub content: String,
	pub user_id: String,
	pub user_type: UserType,
	pub user_name: String,
	pub timestamp: i64,
}

impl From<&ChatMessage> for MessageEvent {
	fn from(m: &ChatMessage) -> Self {
		Self {
			id: m.id.to_string(),
			content: m.content.clone(),
			user_id: m.user_id.clone(),
			user_type: m.user_type,
			user_name: m.display_name.clone(),
			timestamp: m.created_at_ms,
		}
	}
}

/// One authenticated participant, as reported in `auth_success`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
	pub user_id: String,
	pub user_type: UserType,
	pub user_name: String,
}

impl From<&Identity> for Participant {
	fn from(identity: &Identity) -> Self {
		Self {
			user_id: identity.user_id.clone(),
			user_type: identity.user_type,
			user_name: identity.display_name.clone(),
		}
	}
}

/// One outbound JSON frame, discriminated on `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
	#[serde(rename_all = "camelCase")]
	AuthSuccess {
		user_id: String,
		participants: Vec<Participant>,
	},
	AuthError {
		message: String,
	},
	History {
		messages: Vec<MessageEvent>,
	},
	Message(MessageEvent),
	#[serde(rename_all = "camelCase")]
	Typing {
		user_id: String,
		user_type: UserType,
		is_typing: bool,
	},
	#[serde(rename_all = "camelCase")]
	Presence {
		user_id: String,
		user_type: UserType,
		user_name: String,
		status: PresenceStatus,
	},
	#[serde(rename_all = "camelCase")]
	ChatEnded {
		ended_by: UserType,
		user_name: String,
		reason: EndReason,
		billing: serde_json::Value,
		timestamp: i64,
	},
	#[serde(rename_all = "camelCase")]
	EndChatSuccess {
		billing: serde_json::Value,
		already_ended: bool,
		timestamp: i64,
	},
	Pong {
		timestamp: i64,
	},
	Error {
		message: String,
	},
}

/// Decode one inbound frame, enforcing the size limit first.
pub fn decode_client_frame(text: &str) -> Result<ClientFrame, WireError> {
	if text.len() > DEFAULT_MAX_FRAME_SIZE {
		return Err(WireError::Oversize {
			len: text.len(),
			max: DEFAULT_MAX_FRAME_SIZE,
		});
	}

	Ok(serde_json::from_str(text)?)
}
