#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use cohort_protocol::{FramingError, Hello, decode_frame, encode_frame};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::action_messages;
use crate::server::auth::AuthPolicy;
use crate::server::channel::Duplex;
use crate::server::session_service::SessionService;

const REJECT_FLUSH_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub auth: AuthPolicy,
	pub max_frame_bytes: usize,
	/// Capacity of the in-process queues between the QUIC stream and the channel.
	pub transport_capacity: usize,
}

/// Serve one QUIC connection: Hello, admission, then pump frames through a channel.
pub async fn handle_connection(
	conn_id: u64,
	connection: quinn::Connection,
	sessions: SessionService,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("cohort_connections_active").decrement(1.0);
		}
	}

	metrics::gauge!("cohort_connections_active").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut send, mut recv) = connection.accept_bi().await.context("accept bidirectional stream")?;

	let (in_tx, mut in_rx) = mpsc::channel::<Value>(settings.transport_capacity.max(1));
	let max_frame = settings.max_frame_bytes;
	let reader_task = tokio::spawn(async move {
		let mut buf = Vec::<u8>::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("stream read failed")),
			};

			metrics::counter!("cohort_bytes_in_total").increment(n as u64);
			buf.extend_from_slice(&tmp[..n]);

			loop {
				match decode_frame::<Value>(&buf, max_frame) {
					Ok((payload, used)) => {
						buf.drain(0..used);
						if in_tx.send(payload).await.is_err() {
							return Ok(());
						}
					}
					Err(FramingError::InsufficientData { .. }) => break,
					Err(e) => {
						metrics::counter!("cohort_frame_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode frame"));
					}
				}
			}
		}
	});

	let hello = match wait_for_hello(&mut in_rx).await {
		Ok(hello) => hello,
		Err(e) => {
			let _ = send_value(&mut send, &action_messages::handshake_error(e.to_string()).to_value(), max_frame).await;
			finish_rejected(&mut send).await;
			reader_task.abort();
			return Err(e);
		}
	};
	let key = hello.entity_key();

	info!(conn_id, entity = %key, participant = %hello.participant_id, "received Hello");

	if !hello.is_supported_version() {
		warn!(conn_id, entity = %key, version = hello.protocol_version, "unsupported protocol version");
		let message = format!("unsupported protocol version {}", hello.protocol_version);
		let _ = send_value(&mut send, &action_messages::error(key.id, message).to_value(), max_frame).await;
		finish_rejected(&mut send).await;
		reader_task.abort();
		return Ok(());
	}

	if let Err(e) = settings.auth.check(hello.auth_token.trim(), hello.participant_id, key) {
		warn!(conn_id, entity = %key, participant = %hello.participant_id, error = %e, "unauthorized");
		let _ = send_value(&mut send, &action_messages::error(key.id, "unauthorized").to_value(), max_frame).await;
		finish_rejected(&mut send).await;
		reader_task.abort();
		return Ok(());
	}

	let (out_tx, mut out_rx) = mpsc::channel::<Arc<Value>>(settings.transport_capacity.max(1));
	let duplex = Duplex {
		inbound: in_rx,
		outbound: out_tx,
	};

	let opened = match sessions.open_channel(key, hello.participant_id, duplex).await {
		Ok(opened) => opened,
		Err(e) => {
			let _ = send_value(&mut send, &action_messages::error(key.id, e.to_string()).to_value(), max_frame).await;
			finish_rejected(&mut send).await;
			reader_task.abort();
			return Err(anyhow!(e).context("open channel"));
		}
	};

	// the channel drops its outbound sender when it closes, which ends this loop
	while let Some(payload) = out_rx.recv().await {
		if let Err(e) = send_value(&mut send, &payload, max_frame).await {
			debug!(conn_id, error = %e, "write failed; closing");
			break;
		}
	}
	drop(out_rx);
	let _ = send.finish();

	let _ = opened.task.await;
	reader_task.abort();
	info!(conn_id, entity = %key, participant = %hello.participant_id, "connection finished");
	Ok(())
}

async fn wait_for_hello(rx: &mut mpsc::Receiver<Value>) -> anyhow::Result<Hello> {
	let first = rx.recv().await.ok_or_else(|| anyhow!("connection closed before Hello"))?;
	serde_json::from_value(first).context("decode Hello")
}

/// Finish the stream and wait until the peer has read it, bounded.
async fn finish_rejected(send: &mut quinn::SendStream) {
	if send.finish().is_ok() {
		let _ = tokio::time::timeout(REJECT_FLUSH_WAIT, send.stopped()).await;
	}
}

async fn send_value(send: &mut quinn::SendStream, value: &Value, max_frame: usize) -> anyhow::Result<()> {
	let frame = encode_frame(value, max_frame).map_err(|e| anyhow!(e))?;
	metrics::counter!("cohort_bytes_out_total").increment(frame.len() as u64);

	send.write_all(&frame).await.context("stream write")?;
	Ok(())
}
