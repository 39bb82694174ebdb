#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use parley_domain::{ChatMessage, Identity, MessageId, RoomId, UserType};
use tokio::sync::Mutex;

use crate::util::time::unix_ms_now;

/// Documented cap on stored message content, in characters of the raw input.
pub const MAX_CONTENT_CHARS: usize = 1000;

/// Entity-escape HTML-significant characters after capping the raw length.
/// Runs once at acceptance; stored and broadcast content is the escaped form.
pub fn sanitize_content(raw: &str) -> String {
	let mut out = String::with_capacity(raw.len().min(MAX_CONTENT_CHARS));
	for c in raw.chars().take(MAX_CONTENT_CHARS) {
		match c {
			'&' => out.push_str("&amp;"),
			'<' => out.push_str("&lt;"),
			'>' => out.push_str("&gt;"),
			'"' => out.push_str("&quot;"),
			'\'' => out.push_str("&#x27;"),
			c => out.push(c),
		}
	}
	out
}

#[async_trait::async_trait]
pub trait ChatLogBackend: Send + Sync {
	/// Durable append; the message is not "accepted" until this returns.
	async fn append(&self, room: &RoomId, message: &ChatMessage) -> anyhow::Result<()>;

	/// The most recent `limit` messages, chronological ascending. Pure read.
	async fn recent(&self, room: &RoomId, limit: usize) -> anyhow::Result<Vec<ChatMessage>>;
}

/// Process-local log for deployments without a database.
#[derive(Default)]
pub struct InMemoryChatLog {
	inner: Mutex<HashMap<RoomId, Vec<ChatMessage>>>,
}

#[async_trait::async_trait]
impl ChatLogBackend for InMemoryChatLog {
	async fn append(&self, room: &RoomId, message: &ChatMessage) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		guard.entry(room.clone()).or_default().push(message.clone());
		Ok(())
	}

	async fn recent(&self, room: &RoomId, limit: usize) -> anyhow::Result<Vec<ChatMessage>> {
		let guard = self.inner.lock().await;
		let Some(messages) = guard.get(room) else {
			return Ok(Vec::new());
		};

		let start = messages.len().saturating_sub(limit);
		Ok(messages[start..].to_vec())
	}
}

/// Database-backed log (sqlite or postgres).
#[derive(Clone)]
pub struct PersistentChatLog {
	backend: LogBackend,
}

#[derive(Clone)]
enum LogBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

type MessageRow = (String, String, String, String, String, i64);

fn message_from_row(row: MessageRow) -> anyhow::Result<ChatMessage> {
	let (message_id, user_id, user_type, display_name, content, created_at_ms) = row;
	Ok(ChatMessage {
		id: MessageId::from_str(&message_id).context("parse stored message id")?,
		user_id,
		user_type: UserType::from_str(&user_type).context("parse stored user type")?,
		display_name,
		content,
		created_at_ms,
	})
}

impl PersistentChatLog {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: LogBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: LogBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}
}

#[async_trait::async_trait]
impl ChatLogBackend for PersistentChatLog {
	async fn append(&self, room: &RoomId, message: &ChatMessage) -> anyhow::Result<()> {
		match &self.backend {
			LogBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO chat_messages (room_id, message_id, user_id, user_type, display_name, content, created_at_ms) \
					VALUES (?, ?, ?, ?, ?, ?, ?)",
				)
				.bind(room.as_str())
				.bind(message.id.to_string())
				.bind(&message.user_id)
				.bind(message.user_type.as_str())
				.bind(&message.display_name)
				.bind(&message.content)
				.bind(message.created_at_ms)
				.execute(pool)
				.await
				.context("insert chat message (sqlite)")?;
			}
			LogBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO chat_messages (room_id, message_id, user_id, user_type, display_name, content, created_at_ms) \
					VALUES ($1, $2, $3, $4, $5, $6, $7)",
				)
				.bind(room.as_str())
				.bind(message.id.to_string())
				.bind(&message.user_id)
				.bind(message.user_type.as_str())
				.bind(&message.display_name)
				.bind(&message.content)
				.bind(message.created_at_ms)
				.execute(pool)
				.await
				.context("insert chat message (postgres)")?;
			}
		}

		Ok(())
	}

	async fn recent(&self, room: &RoomId, limit: usize) -> anyhow::Result<Vec<ChatMessage>> {
		// Newest first for the bounded fetch, reversed to chronological below.
		// `seq` breaks created_at_ms ties by insertion order.
		let mut rows: Vec<MessageRow> = match &self.backend {
			LogBackend::Sqlite(pool) => {
				sqlx::query_as(
					"SELECT message_id, user_id, user_type, display_name, content, created_at_ms FROM chat_messages \
					WHERE room_id = ? ORDER BY created_at_ms DESC, seq DESC LIMIT ?",
				)
				.bind(room.as_str())
				.bind(limit as i64)
				.fetch_all(pool)
				.await
				.context("select recent chat messages (sqlite)")?
			}
			LogBackend::Postgres(pool) => {
				sqlx::query_as(
					"SELECT message_id, user_id, user_type, display_name, content, created_at_ms FROM chat_messages \
					WHERE room_id = $1 ORDER BY created_at_ms DESC, seq DESC LIMIT $2",
				)
				.bind(room.as_str())
				.bind(limit as i64)
				.fetch_all(pool)
				.await
				.context("select recent chat messages (postgres)")?
			}
		};

		rows.reverse();
		rows.into_iter().map(message_from_row).collect()
	}
}

/// Facade over the configured backend. `accept` is the one write path: it
/// sanitizes, stamps, and durably appends before the caller may broadcast.
/// `recent` also backs the out-of-band history read, independent of any
/// live connection.
#[derive(Clone)]
pub struct ChatLogService {
	backend: Arc<dyn ChatLogBackend>,
}

impl ChatLogService {
	pub fn new_in_memory() -> Self {
		Self {
			backend: Arc::new(InMemoryChatLog::default()),
		}
	}

	pub fn new_persistent(backend: PersistentChatLog) -> Self {
		Self {
			backend: Arc::new(backend),
		}
	}

	pub async fn accept(&self, room: &RoomId, identity: &Identity, raw_content: &str) -> anyhow::Result<ChatMessage> {
		let message = ChatMessage {
			id: MessageId::new_v4(),
			user_id: identity.user_id.clone(),
			user_type: identity.user_type,
			display_name: identity.display_name.clone(),
			content: sanitize_content(raw_content),
			created_at_ms: unix_ms_now(),
		};

		self.backend.append(room, &message).await?;
		metrics::counter!("parley_server_log_appends_total").increment(1);

		Ok(message)
	}

	pub async fn recent(&self, room: &RoomId, limit: usize) -> anyhow::Result<Vec<ChatMessage>> {
		self.backend.recent(room, limit).await
	}
}
