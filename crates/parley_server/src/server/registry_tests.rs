#![forbid(unsafe_code)]

use parley_domain::{Identity, RoomId, UserType};
use tokio::sync::mpsc;

use crate::server::registry::{
	ConnectionHandle, InMemorySnapshotStore, Outbound, SessionRegistry, SessionSnapshot, SnapshotStore,
};

fn handle(conn_id: u64) -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
	let (tx, rx) = mpsc::channel(16);
	(ConnectionHandle::new(conn_id, tx), rx)
}

fn identity(user_id: &str, user_type: UserType) -> Identity {
	Identity {
		user_id: user_id.to_string(),
		user_type,
		display_name: user_id.to_uppercase(),
	}
}

#[test]
fn register_is_idempotent_per_connection() {
	let mut registry = SessionRegistry::default();
	let (h1, _rx1) = handle(1);

	registry.register(h1.clone(), Some("snap-1".to_string()));
	assert_eq!(registry.len(), 1);

	// Re-registering the same connection returns the existing session
	// untouched, snapshot key included.
	registry.register(h1, None);
	assert_eq!(registry.len(), 1);
	let session = registry.get(1).unwrap();
	assert!(!session.authenticated);
	assert_eq!(session.snapshot_key.as_deref(), Some("snap-1"));
}

#[test]
fn mark_authenticated_populates_identity_once() {
	let mut registry = SessionRegistry::default();
	let (h1, _rx1) = handle(1);
	registry.register(h1, None);

	assert!(registry.get(1).unwrap().identity.user_id.is_empty());

	let session = registry.mark_authenticated(1, identity("u1", UserType::Client)).unwrap();
	assert!(session.authenticated);
	assert_eq!(session.identity.user_id, "u1");

	assert!(registry.mark_authenticated(99, identity("ghost", UserType::Client)).is_none());
}

#[test]
fn authenticated_iterator_skips_pending_sessions() {
	let mut registry = SessionRegistry::default();
	let (h1, _rx1) = handle(1);
	let (h2, _rx2) = handle(2);
	let (h3, _rx3) = handle(3);

	registry.register(h1, None);
	registry.register(h2, None);
	registry.register(h3, None);
	registry.mark_authenticated(1, identity("u1", UserType::Client));
	registry.mark_authenticated(3, identity("u3", UserType::Advisor));

	let mut ids: Vec<u64> = registry.authenticated().map(|s| s.handle.conn_id()).collect();
	ids.sort_unstable();
	assert_eq!(ids, vec![1, 3]);

	let participants = registry.participants();
	assert_eq!(participants.len(), 2);
	assert!(participants.iter().any(|p| p.user_id == "u1"));
	assert!(participants.iter().any(|p| p.user_id == "u3"));
}

#[test]
fn restore_rehydrates_an_authenticated_session_verbatim() {
	let mut registry = SessionRegistry::default();
	let (h1, _rx1) = handle(1);

	let restored = identity("u1", UserType::Advisor);
	let session = registry.restore(h1, Some("snap-1".to_string()), restored.clone());
	assert!(session.authenticated);
	assert_eq!(session.identity, restored);
	assert_eq!(registry.participants().len(), 1);
}

#[test]
fn remove_and_drain_clear_sessions() {
	let mut registry = SessionRegistry::default();
	let (h1, _rx1) = handle(1);
	let (h2, _rx2) = handle(2);
	registry.register(h1, None);
	registry.register(h2, None);

	let removed = registry.remove(1).unwrap();
	assert_eq!(removed.handle.conn_id(), 1);
	assert!(registry.remove(1).is_none());
	assert_eq!(registry.len(), 1);

	let drained = registry.drain();
	assert_eq!(drained.len(), 1);
	assert!(registry.is_empty());
}

#[tokio::test]
async fn in_memory_snapshot_store_roundtrip() {
	let store = InMemorySnapshotStore::default();
	let snapshot = SessionSnapshot {
		room_id: RoomId::new("r1").unwrap(),
		identity: identity("u1", UserType::Client),
	};

	assert!(store.get("k1").await.unwrap().is_none());

	store.put("k1", &snapshot).await.unwrap();
	assert_eq!(store.get("k1").await.unwrap(), Some(snapshot));

	store.delete("k1").await.unwrap();
	assert!(store.get("k1").await.unwrap().is_none());
}

#[test]
fn full_outbound_queue_drops_without_erroring() {
	let (tx, mut rx) = mpsc::channel(1);
	let handle = ConnectionHandle::new(1, tx);

	assert!(handle.send_raw("a".into()));
	assert!(!handle.send_raw("b".into()));

	drop(rx.try_recv().unwrap());
	assert!(handle.send_raw("c".into()));

	drop(rx);
	assert!(!handle.send_raw("d".into()));
}
