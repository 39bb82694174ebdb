#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, anyhow};
use parley_domain::{ChatMessage, EndReason, UserType};
use parley_util::secret::SecretString;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::server::room::RoomContext;

/// Result of the ledger's "end room + compute billing" operation. A room the
/// ledger already considers ended is success-with-flag, never a local error.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingOutcome {
	pub already_ended: bool,
	pub billing: serde_json::Value,
}

#[async_trait::async_trait]
pub trait LedgerApi: Send + Sync {
	/// Replicate one accepted message downstream. Callers dispatch this
	/// fire-and-forget; failures are logged, never retried.
	async fn record_message(&self, ctx: &RoomContext, message: &ChatMessage) -> anyhow::Result<()>;

	/// End the room and compute billing. Awaited inline by the room actor.
	async fn end_room(&self, ctx: &RoomContext, ended_by: UserType, reason: EndReason) -> anyhow::Result<BillingOutcome>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordMessageRequest<'a> {
	message_id: String,
	user_id: &'a str,
	user_type: UserType,
	display_name: &'a str,
	content: &'a str,
	created_at_ms: i64,
	client_user_id: Option<&'a str>,
	advisor_user_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EndRoomRequest<'a> {
	ended_by_user_type: UserType,
	reason: EndReason,
	client_user_id: Option<&'a str>,
	advisor_user_id: Option<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct EndRoomResponse {
	already_ended: bool,
	billing: serde_json::Value,
}

/// Ledger reached over HTTP with bearer auth. One client, one request
/// timeout; the timeout is what bounds the awaited `end_room` call.
pub struct HttpLedger {
	http: reqwest::Client,
	base_url: Url,
	api_token: Option<SecretString>,
}

impl HttpLedger {
	pub fn new(base_url: Url, api_token: Option<SecretString>, timeout: Duration) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent(concat!("parley/", env!("CARGO_PKG_VERSION")))
			.timeout(timeout)
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			http,
			base_url,
			api_token,
		})
	}

	fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		match self.api_token.as_ref() {
			Some(token) => req.header("Authorization", format!("Bearer {}", token.expose())),
			None => req,
		}
	}

	fn room_url(&self, ctx: &RoomContext, leaf: &str) -> anyhow::Result<Url> {
		let mut url = self.base_url.clone();
		url.path_segments_mut()
			.map_err(|_| anyhow!("ledger base_url cannot be a base"))?
			.pop_if_empty()
			.extend(["rooms", ctx.room_id.as_str(), leaf]);
		Ok(url)
	}
}

#[async_trait::async_trait]
impl LedgerApi for HttpLedger {
	async fn record_message(&self, ctx: &RoomContext, message: &ChatMessage) -> anyhow::Result<()> {
		let url = self.room_url(ctx, "messages")?;
		let body = RecordMessageRequest {
			message_id: message.id.to_string(),
			user_id: &message.user_id,
			user_type: message.user_type,
			display_name: &message.display_name,
			content: &message.content,
			created_at_ms: message.created_at_ms,
			client_user_id: ctx.client_user_id.as_deref(),
			advisor_user_id: ctx.advisor_user_id.as_deref(),
		};

		let resp = self
			.authed(self.http.post(url))
			.json(&body)
			.send()
			.await
			.context("ledger POST messages send")?;

		let status = resp.status();
		if !status.is_success() {
			let body = resp.text().await.unwrap_or_default();
			anyhow::bail!("ledger record message failed: status={status} body={body}");
		}

		Ok(())
	}

	async fn end_room(&self, ctx: &RoomContext, ended_by: UserType, reason: EndReason) -> anyhow::Result<BillingOutcome> {
		let url = self.room_url(ctx, "end")?;
		let body = EndRoomRequest {
			ended_by_user_type: ended_by,
			reason,
			client_user_id: ctx.client_user_id.as_deref(),
			advisor_user_id: ctx.advisor_user_id.as_deref(),
		};

		let resp = self
			.authed(self.http.post(url))
			.json(&body)
			.send()
			.await
			.context("ledger POST end send")?;

		let status = resp.status();
		let text = resp.text().await.context("ledger POST end read body")?;

		// Conflict means the ledger already ended this room.
		if status == StatusCode::CONFLICT {
			let parsed: EndRoomResponse = serde_json::from_str(&text).unwrap_or_default();
			return Ok(BillingOutcome {
				already_ended: true,
				billing: parsed.billing,
			});
		}

		if !status.is_success() {
			anyhow::bail!("ledger end room failed: status={status} body={text}");
		}

		let parsed: EndRoomResponse = serde_json::from_str(&text).context("ledger end room parse json")?;
		Ok(BillingOutcome {
			already_ended: parsed.already_ended,
			billing: parsed.billing,
		})
	}
}

/// No-op ledger for deployments without one configured. Message sync is
/// dropped and end-chat bills nothing.
pub struct NullLedger;

#[async_trait::async_trait]
impl LedgerApi for NullLedger {
	async fn record_message(&self, ctx: &RoomContext, message: &ChatMessage) -> anyhow::Result<()> {
		debug!(room = %ctx.room_id, message_id = %message.id, "null ledger: dropping message sync");
		Ok(())
	}

	async fn end_room(&self, ctx: &RoomContext, ended_by: UserType, reason: EndReason) -> anyhow::Result<BillingOutcome> {
		debug!(room = %ctx.room_id, %ended_by, %reason, "null ledger: ending room with empty billing");
		Ok(BillingOutcome {
			already_ended: false,
			billing: serde_json::Value::Null,
		})
	}
}
