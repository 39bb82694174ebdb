#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use parley_domain::{Identity, RoomId, UserType};
use parley_protocol::close;
use parley_util::secret::SecretString;
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::warn;

/// Claims carried by a `v1.<payload>.<sig>` credential.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomClaims {
	/// Subject: the authenticated user id.
	pub sub: String,
	/// Room the credential is scoped to.
	pub reading_room_id: String,
	pub user_type: UserType,
	#[serde(default)]
	pub display_name: Option<String>,
	pub exp: u64,
}

pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<RoomClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: RoomClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	if claims.exp <= now {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

/// Terminal authentication outcomes. Each maps to a distinct close code;
/// the connection does not survive any of them.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
	#[error("invalid token")]
	InvalidToken,
	#[error("token is scoped to a different room")]
	RoomMismatch,
	#[error("authentication token required")]
	TokenRequired,
}

impl AuthError {
	pub const fn close_code(self) -> u16 {
		match self {
			AuthError::InvalidToken | AuthError::TokenRequired => close::UNAUTHORIZED,
			AuthError::RoomMismatch => close::FORBIDDEN,
		}
	}
}

/// How the gate authenticates connections for a room.
#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
	/// HMAC secret for signed credentials. Unset means tokens cannot be
	/// trusted and are ignored.
	pub hmac_secret: Option<SecretString>,
	/// Credential-less development mode: synthesize an identity from the
	/// caller-supplied auth fields.
	pub allow_anonymous: bool,
}

/// Fields of an inbound `auth` frame, as the gate consumes them.
#[derive(Debug, Clone, Default)]
pub struct AuthRequest {
	pub token: Option<String>,
	pub user_id: Option<String>,
	pub user_type: Option<UserType>,
	pub user_name: Option<String>,
}

/// Resolve an identity for one `auth` attempt against the actor's bound room.
///
/// A verified credential wins; its room-scope claim must match `room_id`.
/// Without a usable credential, development mode synthesizes an identity with
/// safe defaults, and everything else is `TokenRequired`.
pub fn resolve_identity(settings: &AuthSettings, room_id: &RoomId, request: &AuthRequest) -> Result<Identity, AuthError> {
	let token = request.token.as_deref().map(str::trim).filter(|t| !t.is_empty());

	if let (Some(token), Some(secret)) = (token, settings.hmac_secret.as_ref()) {
		let claims = verify_hmac_token(token, secret.expose()).map_err(|e| {
			warn!(room = %room_id, error = %e, "credential rejected");
			AuthError::InvalidToken
		})?;

		if claims.reading_room_id != room_id.as_str() {
			warn!(room = %room_id, claimed = %claims.reading_room_id, "credential scoped to a different room");
			return Err(AuthError::RoomMismatch);
		}

		return Ok(Identity {
			user_id: claims.sub,
			user_type: claims.user_type,
			display_name: claims.display_name.unwrap_or_else(|| "Anonymous".to_string()),
		});
	}

	// A token with no configured secret is not trusted; it falls through to
	// the anonymous path rather than being accepted unverified.
	if settings.allow_anonymous {
		let user_id = request
			.user_id
			.as_deref()
			.map(str::trim)
			.filter(|s| !s.is_empty())
			.map(str::to_string)
			.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
		let display_name = request
			.user_name
			.as_deref()
			.map(str::trim)
			.filter(|s| !s.is_empty())
			.unwrap_or("Anonymous")
			.to_string();

		return Ok(Identity {
			user_id,
			user_type: request.user_type.unwrap_or_default(),
			display_name,
		});
	}

	Err(AuthError::TokenRequired)
}
