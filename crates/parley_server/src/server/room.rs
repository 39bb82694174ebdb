#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parley_domain::{EndReason, Identity, RoomId, UserType};
use parley_protocol::{ClientFrame, MessageEvent, PresenceStatus, ServerFrame, close, decode_client_frame};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::server::auth::{AuthRequest, AuthSettings, resolve_identity};
use crate::server::broadcast::broadcast;
use crate::server::ledger::LedgerApi;
use crate::server::log::ChatLogService;
use crate::server::registry::{ConnectionHandle, SessionRegistry, SessionSnapshot, SnapshotStore};
use crate::util::time::unix_ms_now;

/// Correlation identifiers for ledger calls, fixed by the first successful
/// authentication of each party. At most one room id is authoritative per
/// actor instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomContext {
	pub room_id: RoomId,
	pub client_user_id: Option<String>,
	pub advisor_user_id: Option<String>,
}

/// Inbound events for one room, processed strictly one at a time.
#[derive(Debug)]
pub enum RoomEvent {
	Connected {
		handle: ConnectionHandle,
		snapshot_key: Option<String>,
	},
	Frame {
		conn_id: u64,
		text: String,
	},
	Closed {
		conn_id: u64,
	},
	/// Self-posted after the end-chat grace delay so teardown runs on the
	/// serialized loop like every other event.
	Teardown,
}

/// Handle used by the transport layer to feed a room actor.
#[derive(Debug, Clone)]
pub struct RoomHandle {
	room_id: RoomId,
	tx: mpsc::Sender<RoomEvent>,
}

impl RoomHandle {
	pub fn room_id(&self) -> &RoomId {
		&self.room_id
	}

	/// Enqueue an event, preserving arrival order. Returns false once the
	/// actor is gone.
	pub async fn send(&self, event: RoomEvent) -> bool {
		self.tx.send(event).await.is_ok()
	}

	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

#[derive(Debug, Clone)]
pub struct RoomSettings {
	pub auth: AuthSettings,
	/// Bounded history window sent on auth success.
	pub history_limit: usize,
	/// Delay between the `chat_ended` broadcast and closing every connection,
	/// letting in-flight sends complete.
	pub end_grace: Duration,
	pub event_queue_capacity: usize,
}

impl Default for RoomSettings {
	fn default() -> Self {
		Self {
			auth: AuthSettings::default(),
			history_limit: 50,
			end_grace: Duration::from_secs(1),
			event_queue_capacity: 256,
		}
	}
}

/// Spawn the actor task for one room and return its feed handle.
pub fn spawn_room(
	room_id: RoomId,
	settings: RoomSettings,
	log: ChatLogService,
	ledger: Arc<dyn LedgerApi>,
	snapshots: Arc<dyn SnapshotStore>,
) -> RoomHandle {
	let (tx, rx) = mpsc::channel(settings.event_queue_capacity);

	let actor = RoomActor {
		room_id: room_id.clone(),
		settings,
		registry: SessionRegistry::default(),
		context: None,
		ending: false,
		log,
		ledger,
		snapshots,
		self_tx: tx.clone(),
	};
	tokio::spawn(actor.run(rx));

	RoomHandle { room_id, tx }
}

/// One room's composition root: owns the session registry, gates every
/// frame on authentication, and coordinates log, broadcast and ledger.
struct RoomActor {
	room_id: RoomId,
	settings: RoomSettings,
	registry: SessionRegistry,
	context: Option<RoomContext>,
	/// Set once `end_room` succeeded and teardown is pending.
	ending: bool,
	log: ChatLogService,
	ledger: Arc<dyn LedgerApi>,
	snapshots: Arc<dyn SnapshotStore>,
	self_tx: mpsc::Sender<RoomEvent>,
}

impl RoomActor {
	async fn run(mut self, mut rx: mpsc::Receiver<RoomEvent>) {
		struct RoomGaugeGuard;
		impl Drop for RoomGaugeGuard {
			fn drop(&mut self) {
				metrics::gauge!("parley_server_active_rooms").decrement(1.0);
			}
		}

		metrics::gauge!("parley_server_active_rooms").increment(1.0);
		let _room_guard = RoomGaugeGuard;

		info!(room = %self.room_id, "room actor started");

		while let Some(event) = rx.recv().await {
			self.handle_event(event).await;
		}

		debug!(room = %self.room_id, "room actor stopped");
	}

	async fn handle_event(&mut self, event: RoomEvent) {
		match event {
			RoomEvent::Connected { handle, snapshot_key } => self.on_connected(handle, snapshot_key).await,
			RoomEvent::Frame { conn_id, text } => self.on_frame(conn_id, text).await,
			RoomEvent::Closed { conn_id } => self.on_closed(conn_id).await,
			RoomEvent::Teardown => self.on_teardown().await,
		}
	}

	async fn on_connected(&mut self, handle: ConnectionHandle, snapshot_key: Option<String>) {
		if let Some(key) = snapshot_key.as_deref() {
			match self.snapshots.get(key).await {
				Ok(Some(snapshot)) if snapshot.room_id == self.room_id => {
					info!(
						room = %self.room_id,
						conn_id = handle.conn_id(),
						user_id = %snapshot.identity.user_id,
						"restored authenticated session from snapshot"
					);
					metrics::counter!("parley_server_sessions_restored_total").increment(1);

					// Rebind the party slot so ledger correlation survives
					// the restart; no auth side effects are replayed.
					let identity = snapshot.identity.clone();
					self.registry.restore(handle, snapshot_key, snapshot.identity);
					self.bind_context(&identity);
					return;
				}
				Ok(Some(_)) => {
					warn!(room = %self.room_id, conn_id = handle.conn_id(), "snapshot bound to a different room; ignoring");
				}
				Ok(None) => {}
				Err(e) => {
					warn!(room = %self.room_id, conn_id = handle.conn_id(), error = %e, "snapshot lookup failed");
				}
			}
		}

		self.registry.register(handle, snapshot_key);
	}

	async fn on_frame(&mut self, conn_id: u64, text: String) {
		let Some(session) = self.registry.get(conn_id) else {
			// Frame for a connection with no session: report, never crash.
			warn!(room = %self.room_id, conn_id, "frame for unknown connection");
			metrics::counter!("parley_server_orphan_frames_total").increment(1);
			return;
		};
		let handle = session.handle.clone();

		let frame = match decode_client_frame(&text) {
			Ok(frame) => frame,
			Err(e) => {
				metrics::counter!("parley_server_frame_decode_errors_total").increment(1);
				handle.send_frame(&ServerFrame::Error { message: e.to_string() });
				return;
			}
		};

		match frame {
			ClientFrame::Ping => {
				// Unconditional, regardless of auth state.
				handle.send_frame(&ServerFrame::Pong {
					timestamp: unix_ms_now(),
				});
			}
			ClientFrame::Auth {
				token,
				user_id,
				user_type,
				user_name,
			} => {
				self.on_auth(
					conn_id,
					AuthRequest {
						token,
						user_id,
						user_type,
						user_name,
					},
				)
				.await;
			}
			ClientFrame::Message { content } => self.on_message(conn_id, content).await,
			ClientFrame::Typing { is_typing } => self.on_typing(conn_id, is_typing),
			ClientFrame::EndChat { reason } => self.on_end_chat(conn_id, reason).await,
		}
	}

	async fn on_auth(&mut self, conn_id: u64, request: AuthRequest) {
		let Some(session) = self.registry.get(conn_id) else {
			return;
		};
		let handle = session.handle.clone();
		let snapshot_key = session.snapshot_key.clone();

		if session.authenticated {
			// Identity is bound exactly once; rebinding would let the
			// ledger correlation ids drift mid-session.
			warn!(room = %self.room_id, conn_id, "rejecting auth on an already-authenticated session");
			handle.send_frame(&ServerFrame::Error {
				message: "already authenticated".to_string(),
			});
			return;
		}

		let identity = match resolve_identity(&self.settings.auth, &self.room_id, &request) {
			Ok(identity) => identity,
			Err(err) => {
				metrics::counter!("parley_server_auth_failures_total").increment(1);
				handle.send_frame(&ServerFrame::AuthError { message: err.to_string() });
				handle.close(err.close_code(), &err.to_string());
				return;
			}
		};

		self.registry.mark_authenticated(conn_id, identity.clone());
		self.bind_context(&identity);

		if let Some(key) = snapshot_key.as_deref() {
			let snapshot = SessionSnapshot {
				room_id: self.room_id.clone(),
				identity: identity.clone(),
			};
			if let Err(e) = self.snapshots.put(key, &snapshot).await {
				warn!(room = %self.room_id, conn_id, error = %e, "failed to persist session snapshot");
			}
		}

		info!(
			room = %self.room_id,
			conn_id,
			user_id = %identity.user_id,
			user_type = %identity.user_type,
			"session authenticated"
		);
		metrics::counter!("parley_server_auth_success_total").increment(1);

		handle.send_frame(&ServerFrame::AuthSuccess {
			user_id: identity.user_id.clone(),
			participants: self.registry.participants(),
		});

		match self.log.recent(&self.room_id, self.settings.history_limit).await {
			Ok(messages) => {
				handle.send_frame(&ServerFrame::History {
					messages: messages.iter().map(MessageEvent::from).collect(),
				});
			}
			Err(e) => {
				warn!(room = %self.room_id, conn_id, error = %e, "failed to read history for new session");
			}
		}

		broadcast(
			&self.registry,
			&ServerFrame::Presence {
				user_id: identity.user_id,
				user_type: identity.user_type,
				user_name: identity.display_name,
				status: PresenceStatus::Online,
			},
			Some(conn_id),
		);
	}

	async fn on_message(&mut self, conn_id: u64, content: String) {
		let Some(session) = self.registry.get(conn_id) else {
			return;
		};
		let handle = session.handle.clone();

		if !session.authenticated {
			handle.send_frame(&ServerFrame::Error {
				message: "not authenticated".to_string(),
			});
			return;
		}

		if content.trim().is_empty() {
			return;
		}

		let identity = session.identity.clone();
		let message = match self.log.accept(&self.room_id, &identity, &content).await {
			Ok(message) => message,
			Err(e) => {
				error!(room = %self.room_id, conn_id, error = %e, "failed to append chat message");
				handle.send_frame(&ServerFrame::Error {
					message: "message not accepted".to_string(),
				});
				return;
			}
		};

		// Sender included: delivery of its own message is the confirmation.
		broadcast(&self.registry, &ServerFrame::Message(MessageEvent::from(&message)), None);

		if let Some(ctx) = self.context.clone() {
			let ledger = Arc::clone(&self.ledger);
			tokio::spawn(async move {
				if let Err(e) = ledger.record_message(&ctx, &message).await {
					metrics::counter!("parley_server_ledger_sync_failures_total").increment(1);
					warn!(room = %ctx.room_id, message_id = %message.id, error = %e, "ledger sync failed");
				} else {
					metrics::counter!("parley_server_ledger_sync_total").increment(1);
				}
			});
		}
	}

	fn on_typing(&mut self, conn_id: u64, is_typing: bool) {
		let Some(session) = self.registry.get(conn_id) else {
			return;
		};

		if !session.authenticated {
			debug!(room = %self.room_id, conn_id, "dropping typing event from unauthenticated session");
			return;
		}

		let identity = &session.identity;
		broadcast(
			&self.registry,
			&ServerFrame::Typing {
				user_id: identity.user_id.clone(),
				user_type: identity.user_type,
				is_typing,
			},
			Some(conn_id),
		);
	}

	async fn on_end_chat(&mut self, conn_id: u64, reason: Option<EndReason>) {
		let Some(session) = self.registry.get(conn_id) else {
			return;
		};
		let handle = session.handle.clone();

		if !session.authenticated {
			handle.send_frame(&ServerFrame::Error {
				message: "not authenticated".to_string(),
			});
			return;
		}

		let Some(ctx) = self.context.clone() else {
			handle.send_frame(&ServerFrame::Error {
				message: "room has no billing context".to_string(),
			});
			return;
		};

		if self.ending {
			handle.send_frame(&ServerFrame::Error {
				message: "chat is already ending".to_string(),
			});
			return;
		}

		let identity = session.identity.clone();
		let reason = reason.unwrap_or_default();

		// Awaited inline: the billing result must be broadcast before
		// teardown, so this is the one place ledger latency blocks the room.
		match self.ledger.end_room(&ctx, identity.user_type, reason).await {
			Ok(outcome) => {
				self.ending = true;
				let timestamp = unix_ms_now();

				info!(
					room = %self.room_id,
					conn_id,
					ended_by = %identity.user_type,
					%reason,
					already_ended = outcome.already_ended,
					"chat ended; closing connections after grace delay"
				);
				metrics::counter!("parley_server_chats_ended_total").increment(1);

				broadcast(
					&self.registry,
					&ServerFrame::ChatEnded {
						ended_by: identity.user_type,
						user_name: identity.display_name,
						reason,
						billing: outcome.billing.clone(),
						timestamp,
					},
					None,
				);

				handle.send_frame(&ServerFrame::EndChatSuccess {
					billing: outcome.billing,
					already_ended: outcome.already_ended,
					timestamp,
				});

				let tx = self.self_tx.clone();
				let grace = self.settings.end_grace;
				tokio::spawn(async move {
					tokio::time::sleep(grace).await;
					let _ = tx.send(RoomEvent::Teardown).await;
				});
			}
			Err(e) => {
				// Room stays open; the initiator may retry end_chat.
				metrics::counter!("parley_server_end_chat_failures_total").increment(1);
				warn!(room = %self.room_id, conn_id, error = %e, "ledger end room failed");
				handle.send_frame(&ServerFrame::Error {
					message: format!("failed to end chat: {e}"),
				});
			}
		}
	}

	async fn on_closed(&mut self, conn_id: u64) {
		let Some(session) = self.registry.remove(conn_id) else {
			return;
		};

		// A deliberate disconnect ends the restart-survival trust; only a
		// crashed process leaves a snapshot behind for rehydration.
		if let Some(key) = session.snapshot_key.as_deref()
			&& let Err(e) = self.snapshots.delete(key).await
		{
			warn!(room = %self.room_id, conn_id, error = %e, "failed to delete session snapshot");
		}

		debug!(room = %self.room_id, conn_id, sessions = self.registry.len(), "session removed");

		if session.authenticated {
			let identity = &session.identity;
			broadcast(
				&self.registry,
				&ServerFrame::Presence {
					user_id: identity.user_id.clone(),
					user_type: identity.user_type,
					user_name: identity.display_name.clone(),
					status: PresenceStatus::Offline,
				},
				None,
			);
		}
	}

	async fn on_teardown(&mut self) {
		info!(room = %self.room_id, sessions = self.registry.len(), "tearing down ended chat");

		for session in self.registry.drain() {
			if let Some(key) = session.snapshot_key.as_deref()
				&& let Err(e) = self.snapshots.delete(key).await
			{
				warn!(room = %self.room_id, error = %e, "failed to delete session snapshot during teardown");
			}

			session.handle.close(close::NORMAL, "chat ended");
		}

		// The external room is ended; a later end_chat on a fresh session
		// surfaces the ledger's already-ended outcome instead of an error.
		self.ending = false;
	}

	fn bind_context(&mut self, identity: &Identity) {
		let ctx = self.context.get_or_insert_with(|| RoomContext {
			room_id: self.room_id.clone(),
			client_user_id: None,
			advisor_user_id: None,
		});

		let slot = match identity.user_type {
			UserType::Client => &mut ctx.client_user_id,
			UserType::Advisor => &mut ctx.advisor_user_id,
		};
		if slot.is_none() {
			*slot = Some(identity.user_id.clone());
		}
	}
}
