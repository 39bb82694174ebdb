#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Role of a party inside a room. Every room is a conversation between
/// exactly one client and one advisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
	#[default]
	Client,
	Advisor,
}

impl UserType {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			UserType::Client => "client",
			UserType::Advisor => "advisor",
		}
	}
}

impl fmt::Display for UserType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown user type: {0}")]
	UnknownUserType(String),
	#[error("unknown end reason: {0}")]
	UnknownReason(String),
}

impl FromStr for UserType {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"client" => Ok(UserType::Client),
			"advisor" => Ok(UserType::Advisor),
			other => Err(ParseIdError::UnknownUserType(other.to_string())),
		}
	}
}

/// Stable room identifier; equals the external reading/session id this
/// room's traffic maps to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
	/// Create a non-empty `RoomId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.to_string())
	}
}

/// Server-assigned chat message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
	/// Create a new random message id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for MessageId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self(uuid::Uuid::parse_str(s)?))
	}
}

/// Authenticated identity bound to one connection's session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
	pub user_id: String,
	pub user_type: UserType,
	pub display_name: String,
}

/// One accepted chat message. Immutable once appended to the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
	pub id: MessageId,
	pub user_id: String,
	pub user_type: UserType,
	pub display_name: String,
	/// Sanitized at acceptance time; stored and broadcast verbatim after that.
	pub content: String,
	pub created_at_ms: i64,
}

/// Why a chat was ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
	#[default]
	Normal,
	Timeout,
	LowBalance,
	Disconnect,
}

impl EndReason {
	pub const fn as_str(self) -> &'static str {
		match self {
			EndReason::Normal => "normal",
			EndReason::Timeout => "timeout",
			EndReason::LowBalance => "low_balance",
			EndReason::Disconnect => "disconnect",
		}
	}
}

impl fmt::Display for EndReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for EndReason {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"normal" => Ok(EndReason::Normal),
			"timeout" => Ok(EndReason::Timeout),
			"low_balance" => Ok(EndReason::LowBalance),
			"disconnect" => Ok(EndReason::Disconnect),
			other => Err(ParseIdError::UnknownReason(other.to_string())),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn user_type_parse_and_display() {
		assert_eq!("client".parse::<UserType>().unwrap(), UserType::Client);
		assert_eq!("ADVISOR".parse::<UserType>().unwrap(), UserType::Advisor);
		assert_eq!(UserType::Advisor.to_string(), "advisor");
		assert!("moderator".parse::<UserType>().is_err());
	}

	#[test]
	fn room_id_rejects_empty() {
		assert!(RoomId::new("").is_err());
		assert!(RoomId::new("   ").is_err());
		assert_eq!(RoomId::new("r1").unwrap().as_str(), "r1");
	}

	#[test]
	fn end_reason_parse_roundtrip() {
		for reason in [
			EndReason::Normal,
			EndReason::Timeout,
			EndReason::LowBalance,
			EndReason::Disconnect,
		] {
			assert_eq!(reason.as_str().parse::<EndReason>().unwrap(), reason);
		}
		assert!("whatever".parse::<EndReason>().is_err());
	}

	#[test]
	fn end_reason_serde_uses_snake_case() {
		let json = serde_json::to_string(&EndReason::LowBalance).unwrap();
		assert_eq!(json, "\"low_balance\"");
	}

	#[test]
	fn identity_serde_uses_camel_case() {
		let identity = Identity {
			user_id: "u1".to_string(),
			user_type: UserType::Client,
			display_name: "Ana".to_string(),
		};
		let json = serde_json::to_value(&identity).unwrap();
		assert_eq!(json["userId"], "u1");
		assert_eq!(json["userType"], "client");
		assert_eq!(json["displayName"], "Ana");
	}
}
