#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use parley_domain::RoomId;
use parley_protocol::{ServerFrame, close};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use crate::server::registry::{ConnectionHandle, Outbound};
use crate::server::room::RoomEvent;
use crate::server::router::RoomDirectory;

/// Per-connection transport settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	/// Outbound queue depth per connection; a slow consumer past this loses
	/// frames instead of stalling the room.
	pub outbound_queue_capacity: usize,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			outbound_queue_capacity: 256,
		}
	}
}

/// Query parameters of the upgrade request.
#[derive(Debug, Default)]
struct ConnectParams {
	room: Option<RoomId>,
	session: Option<String>,
}

fn parse_connect_params(uri: &str) -> ConnectParams {
	let Ok(url) = url::Url::parse(&format!("ws://localhost{uri}")) else {
		return ConnectParams::default();
	};

	let mut params = ConnectParams::default();
	for (key, value) in url.query_pairs() {
		match key.as_ref() {
			"room" => params.room = RoomId::from_str(&value).ok(),
			"session" => {
				let value = value.trim();
				if !value.is_empty() {
					params.session = Some(value.to_string());
				}
			}
			_ => {}
		}
	}

	params
}

/// Accept loop: one task per inbound connection.
pub async fn serve(listener: TcpListener, directory: Arc<RoomDirectory>, settings: ConnectionSettings) -> anyhow::Result<()> {
	let mut next_conn_id: u64 = 1;

	loop {
		let (stream, remote) = listener.accept().await.context("accept tcp connection")?;

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("parley_server_connections_total").increment(1);
		info!(conn_id, %remote, "accepted connection");

		let directory = Arc::clone(&directory);
		let settings = settings.clone();
		tokio::spawn(async move {
			if let Err(e) = handle_socket(conn_id, stream, directory, settings).await {
				warn!(conn_id, error = %e, "connection handler exited with error");
			}
		});
	}
}

/// Pump one WebSocket connection: upgrade, route to the room actor named by
/// the `room` query parameter, then shuttle frames both ways. The reader
/// forwards inbound text to the actor in arrival order; a writer task drains
/// the bounded outbound queue.
pub async fn handle_socket(
	conn_id: u64,
	stream: TcpStream,
	directory: Arc<RoomDirectory>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("parley_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("parley_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let captured_uri: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
	let captured_uri_for_cb = Arc::clone(&captured_uri);

	let mut ws = tokio_tungstenite::accept_hdr_async(
		stream,
		move |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
			if let Ok(mut uri) = captured_uri_for_cb.lock() {
				*uri = req.uri().to_string();
			}
			Ok(response)
		},
	)
	.await
	.context("websocket handshake")?;

	let uri = captured_uri.lock().map(|u| u.clone()).unwrap_or_default();
	let params = parse_connect_params(&uri);

	let Some(room_id) = params.room else {
		warn!(conn_id, "connection did not name a room; closing");
		ws.close(Some(CloseFrame {
			code: CloseCode::from(close::POLICY),
			reason: "missing room parameter".into(),
		}))
		.await
		.ok();
		return Ok(());
	};

	let (tx, mut rx) = mpsc::channel::<Outbound>(settings.outbound_queue_capacity);
	let handle = ConnectionHandle::new(conn_id, tx);

	let (mut sink, mut reader) = ws.split();
	let writer = tokio::spawn(async move {
		while let Some(item) = rx.recv().await {
			match item {
				Outbound::Frame(json) => {
					metrics::counter!("parley_server_frames_out_total").increment(1);
					if sink.send(Message::text(json.as_ref())).await.is_err() {
						break;
					}
				}
				Outbound::Close { code, reason } => {
					let _ = sink
						.send(Message::Close(Some(CloseFrame {
							code: CloseCode::from(code),
							reason: reason.into(),
						})))
						.await;
					break;
				}
			}
		}
	});

	let room = directory.room(&room_id).await;
	if !room
		.send(RoomEvent::Connected {
			handle: handle.clone(),
			snapshot_key: params.session,
		})
		.await
	{
		anyhow::bail!("room actor unavailable for {room_id}");
	}

	info!(conn_id, room = %room_id, "connection joined room");

	while let Some(msg) = reader.next().await {
		match msg {
			Ok(Message::Text(text)) => {
				metrics::counter!("parley_server_frames_in_total").increment(1);
				if !room
					.send(RoomEvent::Frame {
						conn_id,
						text: text.to_string(),
					})
					.await
				{
					break;
				}
			}
			Ok(Message::Binary(_)) => {
				handle.send_frame(&ServerFrame::Error {
					message: "binary frames are not supported".to_string(),
				});
			}
			Ok(Message::Close(_)) => break,
			Ok(_) => {}
			Err(e) => {
				debug!(conn_id, error = %e, "websocket read ended");
				break;
			}
		}
	}

	let _ = room.send(RoomEvent::Closed { conn_id }).await;
	drop(handle);

	let _ = writer.await;
	debug!(conn_id, room = %room_id, "connection closed");

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_room_and_session_from_query() {
		let params = parse_connect_params("/?room=r1&session=abc");
		assert_eq!(params.room.unwrap().as_str(), "r1");
		assert_eq!(params.session.as_deref(), Some("abc"));
	}

	#[test]
	fn missing_or_empty_params_are_none() {
		let params = parse_connect_params("/");
		assert!(params.room.is_none());
		assert!(params.session.is_none());

		let params = parse_connect_params("/?room=&session=%20");
		assert!(params.room.is_none());
		assert!(params.session.is_none());
	}

	#[test]
	fn percent_encoded_room_id_is_decoded() {
		let params = parse_connect_params("/?room=reading%2F42");
		assert_eq!(params.room.unwrap().as_str(), "reading/42");
	}
}
