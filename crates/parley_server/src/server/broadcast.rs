#![forbid(unsafe_code)]

use std::sync::Arc;

use parley_protocol::ServerFrame;
use tracing::{debug, warn};

use crate::server::registry::SessionRegistry;

/// Deliver one frame to every authenticated session, serialized once,
/// optionally excluding a single connection (typing and presence exclude
/// their subject; chat messages and `chat_ended` exclude nobody).
///
/// Delivery is best-effort per recipient: a full or closed outbound queue
/// never aborts the fan-out and never surfaces to the caller; the affected
/// connection is reconciled via its own close event.
pub fn broadcast(registry: &SessionRegistry, frame: &ServerFrame, exclude: Option<u64>) {
	let payload: Arc<str> = match serde_json::to_string(frame) {
		Ok(json) => Arc::from(json),
		Err(e) => {
			warn!(error = %e, "failed to serialize broadcast frame");
			return;
		}
	};

	let mut delivered: u64 = 0;
	let mut dropped: u64 = 0;

	for session in registry.authenticated() {
		if exclude == Some(session.handle.conn_id()) {
			continue;
		}

		if session.handle.send_raw(Arc::clone(&payload)) {
			delivered += 1;
		} else {
			dropped += 1;
		}
	}

	metrics::counter!("parley_server_broadcasts_total").increment(1);
	if dropped > 0 {
		metrics::counter!("parley_server_broadcast_drops_total").increment(dropped);
		debug!(delivered, dropped, "broadcast dropped frames for slow or closed recipients");
	}
}
