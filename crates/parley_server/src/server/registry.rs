#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use parley_domain::{Identity, RoomId};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tracing::warn;

/// One item on a connection's outbound queue.
#[derive(Debug, Clone)]
pub enum Outbound {
	/// Pre-serialized JSON frame.
	Frame(Arc<str>),
	/// Close the connection after draining what was queued before it.
	Close { code: u16, reason: String },
}

/// Write side of one live connection. The queue is bounded; a slow consumer
/// loses frames rather than stalling the room.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
	conn_id: u64,
	tx: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
	pub fn new(conn_id: u64, tx: mpsc::Sender<Outbound>) -> Self {
		Self { conn_id, tx }
	}

	pub fn conn_id(&self) -> u64 {
		self.conn_id
	}

	/// Best-effort enqueue of a pre-serialized frame. Returns whether the
	/// frame was queued; a full or closed queue is absorbed here and only
	/// reconciled via the connection's own close event.
	pub fn send_raw(&self, payload: Arc<str>) -> bool {
		match self.tx.try_send(Outbound::Frame(payload)) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(_)) => {
				metrics::counter!("parley_server_outbound_drops_total").increment(1);
				false
			}
			Err(mpsc::error::TrySendError::Closed(_)) => false,
		}
	}

	/// Serialize and enqueue a single frame for this connection only.
	pub fn send_frame(&self, frame: &parley_protocol::ServerFrame) -> bool {
		match serde_json::to_string(frame) {
			Ok(json) => self.send_raw(Arc::from(json)),
			Err(e) => {
				warn!(conn_id = self.conn_id, error = %e, "failed to serialize outbound frame");
				false
			}
		}
	}

	/// Queue a close; the writer task sends the close frame and stops.
	pub fn close(&self, code: u16, reason: &str) {
		let _ = self.tx.try_send(Outbound::Close {
			code,
			reason: reason.to_string(),
		});
	}
}

/// Per-connection runtime state, owned exclusively by the room actor.
#[derive(Debug)]
pub struct Session {
	pub handle: ConnectionHandle,
	pub identity: Identity,
	pub authenticated: bool,
	/// Key the session snapshot is persisted under, when the client supplied
	/// one at connect time. No key means no restart survival.
	pub snapshot_key: Option<String>,
}

/// Live-session table for one room. All mutation happens on the room actor's
/// serialized event loop, so no interior locking is needed.
#[derive(Debug, Default)]
pub struct SessionRegistry {
	sessions: HashMap<u64, Session>,
}

impl SessionRegistry {
	/// Create an unauthenticated session for a connection. Idempotent per
	/// connection id: registering twice returns the existing session untouched.
	pub fn register(&mut self, handle: ConnectionHandle, snapshot_key: Option<String>) -> &Session {
		self.sessions.entry(handle.conn_id()).or_insert_with(|| Session {
			handle,
			identity: Identity::default(),
			authenticated: false,
			snapshot_key,
		})
	}

	/// Rehydrate an already-authenticated session verbatim from a snapshot.
	/// No authentication side effects run for restored sessions.
	pub fn restore(&mut self, handle: ConnectionHandle, snapshot_key: Option<String>, identity: Identity) -> &Session {
		self.sessions.entry(handle.conn_id()).or_insert_with(|| Session {
			handle,
			identity,
			authenticated: true,
			snapshot_key,
		})
	}

	pub fn get(&self, conn_id: u64) -> Option<&Session> {
		self.sessions.get(&conn_id)
	}

	/// Populate identity and flip the session to authenticated. Identity is
	/// bound exactly once; the caller rejects re-authentication beforehand.
	pub fn mark_authenticated(&mut self, conn_id: u64, identity: Identity) -> Option<&Session> {
		let session = self.sessions.get_mut(&conn_id)?;
		session.identity = identity;
		session.authenticated = true;
		Some(session)
	}

	pub fn remove(&mut self, conn_id: u64) -> Option<Session> {
		self.sessions.remove(&conn_id)
	}

	/// Sessions eligible for broadcast delivery.
	pub fn authenticated(&self) -> impl Iterator<Item = &Session> {
		self.sessions.values().filter(|s| s.authenticated)
	}

	/// Current authenticated participant list, as reported in `auth_success`.
	pub fn participants(&self) -> Vec<parley_protocol::Participant> {
		self.authenticated().map(|s| (&s.identity).into()).collect()
	}

	pub fn len(&self) -> usize {
		self.sessions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.sessions.is_empty()
	}

	/// Remove and return every session. Used by end-chat teardown.
	pub fn drain(&mut self) -> Vec<Session> {
		self.sessions.drain().map(|(_, s)| s).collect()
	}
}

/// Externally persisted image of an authenticated session, keyed by the
/// client-supplied `session` query parameter. Rehydrating one side-steps
/// re-authentication after a process restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
	pub room_id: RoomId,
	pub identity: Identity,
}

#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
	async fn put(&self, key: &str, snapshot: &SessionSnapshot) -> anyhow::Result<()>;
	async fn get(&self, key: &str) -> anyhow::Result<Option<SessionSnapshot>>;
	async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// Snapshots held in process memory only: sessions survive actor restarts
/// within the process, not process restarts.
#[derive(Default)]
pub struct InMemorySnapshotStore {
	inner: Mutex<HashMap<String, SessionSnapshot>>,
}

#[async_trait::async_trait]
impl SnapshotStore for InMemorySnapshotStore {
	async fn put(&self, key: &str, snapshot: &SessionSnapshot) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		guard.insert(key.to_string(), snapshot.clone());
		Ok(())
	}

	async fn get(&self, key: &str) -> anyhow::Result<Option<SessionSnapshot>> {
		let guard = self.inner.lock().await;
		Ok(guard.get(key).cloned())
	}

	async fn delete(&self, key: &str) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		guard.remove(key);
		Ok(())
	}
}

/// Database-backed snapshots, sharing the chat-log database.
#[derive(Clone)]
pub struct PersistentSnapshotStore {
	backend: SnapshotBackend,
}

#[derive(Clone)]
enum SnapshotBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl PersistentSnapshotStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			Ok(Self {
				backend: SnapshotBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			Ok(Self {
				backend: SnapshotBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url for snapshots (use sqlite: or postgres:)"))
		}
	}
}

#[async_trait::async_trait]
impl SnapshotStore for PersistentSnapshotStore {
	async fn put(&self, key: &str, snapshot: &SessionSnapshot) -> anyhow::Result<()> {
		let payload = serde_json::to_string(snapshot).context("serialize session snapshot")?;

		match &self.backend {
			SnapshotBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO session_snapshots (snapshot_key, payload, updated_at) VALUES (?, ?, strftime('%s','now')) \
					ON CONFLICT(snapshot_key) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
				)
				.bind(key)
				.bind(payload)
				.execute(pool)
				.await
				.context("upsert session snapshot (sqlite)")?;
			}
			SnapshotBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO session_snapshots (snapshot_key, payload, updated_at) VALUES ($1, $2, NOW()) \
					ON CONFLICT (snapshot_key) DO UPDATE SET payload = EXCLUDED.payload, updated_at = EXCLUDED.updated_at",
				)
				.bind(key)
				.bind(payload)
				.execute(pool)
				.await
				.context("upsert session snapshot (postgres)")?;
			}
		}

		Ok(())
	}

	async fn get(&self, key: &str) -> anyhow::Result<Option<SessionSnapshot>> {
		let row: Option<(String,)> = match &self.backend {
			SnapshotBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT payload FROM session_snapshots WHERE snapshot_key = ?")
					.bind(key)
					.fetch_optional(pool)
					.await
					.context("select session snapshot (sqlite)")?
			}
			SnapshotBackend::Postgres(pool) => {
				sqlx::query_as("SELECT payload FROM session_snapshots WHERE snapshot_key = $1")
					.bind(key)
					.fetch_optional(pool)
					.await
					.context("select session snapshot (postgres)")?
			}
		};

		match row {
			Some((payload,)) => {
				let snapshot = serde_json::from_str(&payload).context("parse session snapshot")?;
				Ok(Some(snapshot))
			}
			None => Ok(None),
		}
	}

	async fn delete(&self, key: &str) -> anyhow::Result<()> {
		match &self.backend {
			SnapshotBackend::Sqlite(pool) => {
				sqlx::query("DELETE FROM session_snapshots WHERE snapshot_key = ?")
					.bind(key)
					.execute(pool)
					.await
					.context("delete session snapshot (sqlite)")?;
			}
			SnapshotBackend::Postgres(pool) => {
				sqlx::query("DELETE FROM session_snapshots WHERE snapshot_key = $1")
					.bind(key)
					.execute(pool)
					.await
					.context("delete session snapshot (postgres)")?;
			}
		}

		Ok(())
	}
}
