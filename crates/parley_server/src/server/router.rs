#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parley_domain::RoomId;
use tokio::sync::Mutex;
use tracing::debug;

use crate::server::ledger::LedgerApi;
use crate::server::log::ChatLogService;
use crate::server::registry::SnapshotStore;
use crate::server::room::{RoomHandle, RoomSettings, spawn_room};

/// Maps room ids to live actors. Placement is deterministic: the same room
/// id always resolves to the same actor instance for its lifetime.
pub struct RoomDirectory {
	rooms: Mutex<HashMap<RoomId, RoomHandle>>,
	settings: RoomSettings,
	log: ChatLogService,
	ledger: Arc<dyn LedgerApi>,
	snapshots: Arc<dyn SnapshotStore>,
}

impl RoomDirectory {
	pub fn new(
		settings: RoomSettings,
		log: ChatLogService,
		ledger: Arc<dyn LedgerApi>,
		snapshots: Arc<dyn SnapshotStore>,
	) -> Arc<Self> {
		Arc::new(Self {
			rooms: Mutex::new(HashMap::new()),
			settings,
			log,
			ledger,
			snapshots,
		})
	}

	/// The live actor for a room, spawning it lazily on first use.
	pub async fn room(&self, room_id: &RoomId) -> RoomHandle {
		let mut rooms = self.rooms.lock().await;

		if let Some(handle) = rooms.get(room_id)
			&& !handle.is_closed()
		{
			return handle.clone();
		}

		debug!(room = %room_id, "spawning room actor");
		metrics::counter!("parley_server_rooms_spawned_total").increment(1);

		let handle = spawn_room(
			room_id.clone(),
			self.settings.clone(),
			self.log.clone(),
			Arc::clone(&self.ledger),
			Arc::clone(&self.snapshots),
		);
		rooms.insert(room_id.clone(), handle.clone());
		handle
	}

	/// Out-of-band access to the room transcript, independent of any live
	/// connection.
	pub fn chat_log(&self) -> &ChatLogService {
		&self.log
	}
}
