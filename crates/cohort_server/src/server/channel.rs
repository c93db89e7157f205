#![forbid(unsafe_code)]

use std::sync::Arc;

use cohort_domain::ParticipantId;
use cohort_protocol::is_heartbeat;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::dispatcher::DispatcherHandle;
use crate::server::dispatcher_registry::DispatcherRegistry;
use crate::server::error::DispatchError;
use crate::server::registry::{ChannelHandle, ChannelId, ChannelMsg};

/// A dispatcher that terminates between lookup and registration is replaced
/// this many times before the channel gives up.
const REGISTER_ATTEMPTS: usize = 3;

/// Abstract bidirectional transport of one connection.
///
/// Dropping `outbound` closes the transport; `inbound` yielding `None` means the
/// peer went away.
#[derive(Debug)]
pub struct Duplex {
	pub inbound: mpsc::Receiver<Value>,
	pub outbound: mpsc::Sender<Arc<Value>>,
}

impl Duplex {
	/// In-memory pair: the channel side and the peer side.
	pub fn pair(capacity: usize) -> (Duplex, DuplexPeer) {
		let (to_channel, inbound) = mpsc::channel(capacity.max(1));
		let (outbound, from_channel) = mpsc::channel(capacity.max(1));
		(
			Duplex { inbound, outbound },
			DuplexPeer {
				tx: to_channel,
				rx: from_channel,
			},
		)
	}
}

/// Remote end of an in-memory [`Duplex`].
#[derive(Debug)]
pub struct DuplexPeer {
	pub tx: mpsc::Sender<Value>,
	pub rx: mpsc::Receiver<Arc<Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
	Open,
	Closing,
}

/// Bridges one transport to the dispatcher of its entity.
pub struct Channel {
	id: ChannelId,
	participant: ParticipantId,
	handle: ChannelHandle,
	dispatcher: DispatcherHandle,
	directory: DispatcherRegistry,
	rx: mpsc::Receiver<ChannelMsg>,
	duplex: Option<Duplex>,
	state: ChannelState,
	debug_logs: bool,
}

impl Channel {
	/// Start the channel task. It registers before reading from the transport.
	pub fn spawn(
		participant: ParticipantId,
		dispatcher: DispatcherHandle,
		directory: DispatcherRegistry,
		duplex: Duplex,
		mailbox_capacity: usize,
		debug_logs: bool,
	) -> (ChannelHandle, JoinHandle<()>) {
		let id = ChannelId::next();
		let (tx, rx) = mpsc::channel(mailbox_capacity.max(1));
		let handle = ChannelHandle::new(id, tx);

		let channel = Channel {
			id,
			participant,
			handle: handle.clone(),
			dispatcher,
			directory,
			rx,
			duplex: Some(duplex),
			state: ChannelState::Open,
			debug_logs,
		};
		let task = tokio::spawn(channel.run());
		(handle, task)
	}

	async fn run(mut self) {
		metrics::gauge!("cohort_channels_active").increment(1.0);

		if let Err(e) = self.register().await {
			warn!(participant = %self.participant, entity = %self.dispatcher.key(), error = %e, "channel failed to register");
			self.duplex = None;
			metrics::gauge!("cohort_channels_active").decrement(1.0);
			return;
		}

		info!(
			participant = %self.participant,
			entity = %self.dispatcher.key(),
			channel = %self.id,
			"channel opened"
		);

		while self.state == ChannelState::Open {
			let Some(duplex) = self.duplex.as_mut() else {
				break;
			};

			tokio::select! {
				msg = self.rx.recv() => match msg {
					Some(ChannelMsg::Deliver(payload)) => {
						if duplex.outbound.send(payload).await.is_err() {
							self.state = ChannelState::Closing;
						}
					}
					Some(ChannelMsg::Poison) => {
						debug!(participant = %self.participant, channel = %self.id, "channel poisoned");
						self.state = ChannelState::Closing;
					}
					Some(ChannelMsg::Reassign { dispatcher }) => {
						self.reassign(dispatcher).await;
					}
					None => self.state = ChannelState::Closing,
				},
				frame = duplex.inbound.recv() => match frame {
					Some(payload) if is_heartbeat(&payload) => {}
					Some(payload) => {
						if let Err(e) = self.dispatcher.inbound(self.participant, self.handle.clone(), payload).await {
							debug!(participant = %self.participant, error = %e, "inbound payload not delivered");
						}
					}
					None => self.state = ChannelState::Closing,
				},
			}
		}

		self.close().await;
	}

	/// Close the transport, then unregister. Unregister is sent before the
	/// channel task ends, so the dispatcher never keeps a dead connection.
	async fn close(mut self) {
		self.duplex = None;

		if let Err(e) = self.dispatcher.unregister_channel(self.participant, self.id).await {
			debug!(participant = %self.participant, error = %e, "unregister after close not delivered");
		}

		metrics::gauge!("cohort_channels_active").decrement(1.0);
		info!(
			participant = %self.participant,
			entity = %self.dispatcher.key(),
			channel = %self.id,
			"channel closed"
		);
	}

	async fn register(&mut self) -> Result<(), DispatchError> {
		let mut last_err = DispatchError::Terminated(self.dispatcher.key());
		for attempt in 0..REGISTER_ATTEMPTS {
			if attempt > 0 {
				self.dispatcher = self.directory.get_or_create(self.dispatcher.key().id).await?;
			}

			match self
				.dispatcher
				.register_channel(self.participant, self.handle.clone())
				.await
			{
				Ok(()) => return Ok(()),
				Err(e) => {
					if self.debug_logs {
						debug!(participant = %self.participant, attempt, error = %e, "channel: register raced termination");
					}
					last_err = e;
				}
			}
		}
		Err(last_err)
	}

	async fn reassign(&mut self, target: DispatcherHandle) {
		if target.same_instance(&self.dispatcher) {
			return;
		}

		let from = self.dispatcher.key();
		if let Err(e) = self.dispatcher.unregister_channel(self.participant, self.id).await {
			debug!(participant = %self.participant, error = %e, "unregister on reassign not delivered");
		}

		self.dispatcher = target;
		if let Err(e) = self.register().await {
			warn!(participant = %self.participant, from = %from, to = %self.dispatcher.key(), error = %e, "reassign failed");
			self.state = ChannelState::Closing;
			return;
		}

		info!(participant = %self.participant, from = %from, to = %self.dispatcher.key(), "channel reassigned");
	}
}
