#![forbid(unsafe_code)]

use std::sync::Arc;

use cohort_domain::{EntityId, EntityKey, ParticipantId};
use cohort_protocol::{ActionKind, ActionRequest, Inbound, PayloadError, TellWhom, classify};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::server::action_handler::{ActionHandler, FixOutcome, SessionOutcome};
use crate::server::action_messages::{self, ActionMessage};
use crate::server::dispatcher_registry::RegistryCmd;
use crate::server::error::DispatchError;
use crate::server::registry::{ChannelHandle, ChannelId, ChannelMsg, ChannelRegistry};
use crate::server::store::SessionEntity;

/// Configuration for one dispatcher actor.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
	/// Maximum number of queued messages in the dispatcher mailbox.
	pub mailbox_capacity: usize,

	pub debug_logs: bool,
}

impl Default for DispatcherConfig {
	fn default() -> Self {
		Self {
			mailbox_capacity: 256,
			debug_logs: false,
		}
	}
}

#[derive(Debug)]
pub(crate) enum DispatcherMsg {
	RegisterChannel {
		participant: ParticipantId,
		channel: ChannelHandle,
		ack: oneshot::Sender<()>,
	},
	UnregisterChannel {
		participant: ParticipantId,
		channel: ChannelId,
	},
	Inbound {
		participant: ParticipantId,
		sender: ChannelHandle,
		payload: Value,
	},
	PoisonChannel {
		participant: ParticipantId,
		reply: oneshot::Sender<bool>,
	},
	ReassignChannel {
		participant: ParticipantId,
		target: DispatcherHandle,
		reply: oneshot::Sender<bool>,
	},
	Joined {
		participant: ParticipantId,
	},
	Left {
		participant: ParticipantId,
	},
	Channels {
		reply: oneshot::Sender<Vec<ParticipantId>>,
	},
}

/// Cloneable address of one dispatcher instance.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
	key: EntityKey,
	instance: u64,
	tx: mpsc::Sender<DispatcherMsg>,
}

impl DispatcherHandle {
	pub fn key(&self) -> EntityKey {
		self.key
	}

	/// Distinguishes successive dispatchers for the same entity.
	pub fn instance(&self) -> u64 {
		self.instance
	}

	/// True once the dispatcher started terminating.
	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}

	pub fn same_instance(&self, other: &DispatcherHandle) -> bool {
		self.key == other.key && self.instance == other.instance
	}

	async fn send(&self, msg: DispatcherMsg) -> Result<(), DispatchError> {
		self.tx.send(msg).await.map_err(|_| DispatchError::Terminated(self.key))
	}

	/// Register and wait until the dispatcher has recorded the channel.
	pub async fn register_channel(&self, participant: ParticipantId, channel: ChannelHandle) -> Result<(), DispatchError> {
		let (ack, done) = oneshot::channel();
		self.send(DispatcherMsg::RegisterChannel {
			participant,
			channel,
			ack,
		})
		.await?;
		done.await.map_err(|_| DispatchError::Terminated(self.key))
	}

	pub async fn unregister_channel(&self, participant: ParticipantId, channel: ChannelId) -> Result<(), DispatchError> {
		self.send(DispatcherMsg::UnregisterChannel { participant, channel }).await
	}

	pub async fn inbound(
		&self,
		participant: ParticipantId,
		sender: ChannelHandle,
		payload: Value,
	) -> Result<(), DispatchError> {
		self.send(DispatcherMsg::Inbound {
			participant,
			sender,
			payload,
		})
		.await
	}

	/// Tell the participant's channel to close. `Ok(false)` if it has none here.
	pub async fn poison_channel(&self, participant: ParticipantId) -> Result<bool, DispatchError> {
		let (reply, rx) = oneshot::channel();
		self.send(DispatcherMsg::PoisonChannel { participant, reply }).await?;
		rx.await.map_err(|_| DispatchError::Terminated(self.key))
	}

	pub async fn reassign_channel(&self, participant: ParticipantId, target: DispatcherHandle) -> Result<(), DispatchError> {
		let (reply, rx) = oneshot::channel();
		self.send(DispatcherMsg::ReassignChannel {
			participant,
			target,
			reply,
		})
		.await?;
		match rx.await {
			Ok(true) => Ok(()),
			Ok(false) => Err(DispatchError::ParticipantNotFound(participant)),
			Err(_) => Err(DispatchError::Terminated(self.key)),
		}
	}

	pub async fn notify_joined(&self, participant: ParticipantId) -> Result<(), DispatchError> {
		self.send(DispatcherMsg::Joined { participant }).await
	}

	pub async fn notify_left(&self, participant: ParticipantId) -> Result<(), DispatchError> {
		self.send(DispatcherMsg::Left { participant }).await
	}

	/// Participants with a registered channel, ascending.
	pub async fn channels(&self) -> Result<Vec<ParticipantId>, DispatchError> {
		let (reply, rx) = oneshot::channel();
		self.send(DispatcherMsg::Channels { reply }).await?;
		rx.await.map_err(|_| DispatchError::Terminated(self.key))
	}
}

enum Flow {
	Continue,
	Terminate,
}

/// Per-entity coordinator. Owns the channel registry of one group or batch.
pub(crate) struct Dispatcher<E: SessionEntity> {
	key: EntityKey,
	instance: u64,
	handler: ActionHandler<E>,
	channels: ChannelRegistry,
	rx: mpsc::Receiver<DispatcherMsg>,
	registry: mpsc::WeakSender<RegistryCmd>,
	cfg: DispatcherConfig,
}

/// Start a dispatcher task for `E` and return its address.
pub(crate) fn spawn_dispatcher<E: SessionEntity>(
	id: EntityId,
	instance: u64,
	handler: ActionHandler<E>,
	registry: mpsc::WeakSender<RegistryCmd>,
	cfg: DispatcherConfig,
) -> DispatcherHandle {
	let key = EntityKey::new(E::KIND, id);
	let (tx, rx) = mpsc::channel(cfg.mailbox_capacity.max(1));

	let dispatcher = Dispatcher {
		key,
		instance,
		handler,
		channels: ChannelRegistry::new(),
		rx,
		registry,
		cfg,
	};
	tokio::spawn(dispatcher.run());

	DispatcherHandle { key, instance, tx }
}

impl<E: SessionEntity> Dispatcher<E> {
	async fn run(mut self) {
		metrics::gauge!("cohort_dispatchers_active").increment(1.0);
		if self.cfg.debug_logs {
			debug!(entity = %self.key, instance = self.instance, "dispatcher: started");
		}

		while let Some(msg) = self.rx.recv().await {
			if let Flow::Terminate = self.handle(msg).await {
				break;
			}
		}

		self.terminate().await;
	}

	async fn terminate(mut self) {
		self.rx.close();
		let mut discarded = 0usize;
		while let Some(msg) = self.rx.recv().await {
			// dropping pending acks and replies tells their senders we are gone
			drop(msg);
			discarded += 1;
		}

		if let Some(registry) = self.registry.upgrade() {
			let _ = registry
				.send(RegistryCmd::Unregister {
					id: self.key.id,
					instance: self.instance,
				})
				.await;
		}

		metrics::gauge!("cohort_dispatchers_active").decrement(1.0);
		info!(entity = %self.key, instance = self.instance, discarded, "dispatcher terminated");
	}

	async fn handle(&mut self, msg: DispatcherMsg) -> Flow {
		match msg {
			DispatcherMsg::RegisterChannel {
				participant,
				channel,
				ack,
			} => {
				self.on_register(participant, channel, ack).await;
				Flow::Continue
			}
			DispatcherMsg::UnregisterChannel { participant, channel } => self.on_unregister(participant, channel),
			DispatcherMsg::Inbound {
				participant,
				sender,
				payload,
			} => {
				self.on_inbound(participant, &sender, payload).await;
				Flow::Continue
			}
			DispatcherMsg::PoisonChannel { participant, reply } => {
				let signaled = self
					.channels
					.get(participant)
					.is_some_and(|ch| ch.signal(ChannelMsg::Poison));
				let _ = reply.send(signaled);
				Flow::Continue
			}
			DispatcherMsg::ReassignChannel {
				participant,
				target,
				reply,
			} => {
				let signaled = self
					.channels
					.get(participant)
					.is_some_and(|ch| ch.signal(ChannelMsg::Reassign { dispatcher: target }));
				if !signaled {
					debug!(entity = %self.key, participant = %participant, "reassign: no channel for participant");
				}
				let _ = reply.send(signaled);
				Flow::Continue
			}
			DispatcherMsg::Joined { participant } => {
				self.on_joined(participant).await;
				Flow::Continue
			}
			DispatcherMsg::Left { participant } => {
				let exclude = self.channels.get(participant).map(ChannelHandle::id);
				let msg = action_messages::simple(ActionKind::Left, participant, TellWhom::AllButSender);
				self.fan_out(&msg.to_value(), exclude);
				Flow::Continue
			}
			DispatcherMsg::Channels { reply } => {
				let _ = reply.send(self.channels.participants());
				Flow::Continue
			}
		}
	}

	async fn on_register(&mut self, participant: ParticipantId, channel: ChannelHandle, ack: oneshot::Sender<()>) {
		let replaced = self.channels.register(participant, channel.clone());
		let _ = ack.send(());

		if self.cfg.debug_logs {
			debug!(
				entity = %self.key,
				participant = %participant,
				channel = %channel.id(),
				replaced = replaced.is_some(),
				channels = self.channels.len(),
				"dispatcher: channel registered"
			);
		}

		let entity = match self.handler.store().find(self.key.id).await {
			Ok(Some(entity)) => entity,
			Ok(None) => {
				warn!(entity = %self.key, participant = %participant, "channel opened for missing entity");
				self.route(&action_messages::error(self.key.id, format!("{} not found", self.key)), &channel);
				return;
			}
			Err(e) => {
				warn!(entity = %self.key, error = %e, "failed to load entity on register");
				self.route(&action_messages::error(self.key.id, format!("failed to load {}", self.key)), &channel);
				return;
			}
		};

		let channels = self.channels.participants();
		let snapshot = action_messages::full_snapshot(
			ActionKind::Opened,
			&entity,
			channels.clone(),
			Some(participant),
			TellWhom::SenderOnly,
		);
		self.route(&snapshot, &channel);

		let notice = action_messages::membership_notice(
			ActionKind::Opened,
			&entity,
			channels,
			Some(participant),
			TellWhom::AllButSender,
		);
		self.route(&notice, &channel);
	}

	fn on_unregister(&mut self, participant: ParticipantId, channel: ChannelId) -> Flow {
		let is_current = self.channels.get(participant).is_some_and(|c| c.id() == channel);
		if !is_current {
			if self.cfg.debug_logs {
				debug!(entity = %self.key, participant = %participant, channel = %channel, "dispatcher: stale unregister ignored");
			}
			return Flow::Continue;
		}

		self.channels.unregister(participant);
		if self.channels.is_empty() {
			return Flow::Terminate;
		}

		let msg = action_messages::simple(ActionKind::Closed, participant, TellWhom::AllButSender);
		self.fan_out(&msg.to_value(), Some(channel));
		Flow::Continue
	}

	async fn on_inbound(&mut self, claimed: ParticipantId, sender: &ChannelHandle, payload: Value) {
		// only the currently registered channel may speak for a participant
		let Some(participant) = self.channels.reverse_lookup(sender.id()) else {
			metrics::counter!("cohort_messages_dropped_total").increment(1);
			if self.cfg.debug_logs {
				debug!(entity = %self.key, participant = %claimed, channel = %sender.id(), "dispatcher: payload from unregistered channel dropped");
			}
			return;
		};

		let inbound = match classify(&payload) {
			Ok(inbound) => inbound,
			Err(e) => {
				self.reject(participant, sender, &e);
				return;
			}
		};

		match inbound {
			Inbound::Broadcast => {
				self.fan_out(&payload, Some(sender.id()));
			}
			Inbound::Unicast { recipient } => match self.channels.get(recipient) {
				Some(target) => deliver(&self.key, target, Arc::new(payload)),
				None => {
					let msg = action_messages::error(self.key.id, format!("recipient {recipient} is not connected"));
					self.route(&msg, sender);
				}
			},
			Inbound::Action(ActionRequest::Session { patch, version }) => {
				match self.handler.apply_session(self.key.id, &patch, version).await {
					Ok(SessionOutcome::Applied { patch, version }) => {
						self.route(&action_messages::session_update(patch, version), sender);
						self.route(&action_messages::session_ack(version), sender);
					}
					Ok(SessionOutcome::Rejected(rejection)) => {
						let msg = action_messages::session_fail(rejection.reason(), rejection.current_version());
						self.route(&msg, sender);
					}
					Err(e) => {
						warn!(entity = %self.key, participant = %participant, error = %e, "session patch failed");
						self.route(&action_messages::session_fail("session store unavailable", None), sender);
					}
				}
			}
			Inbound::Action(ActionRequest::Fixed) => match self.handler.fix(self.key.id).await {
				Ok(FixOutcome::Fixed(entity)) => {
					let msg = action_messages::fixed(&entity, self.channels.participants());
					self.route(&msg, sender);
				}
				Ok(FixOutcome::NotFound) => {
					self.route(&action_messages::error(self.key.id, format!("{} not found", self.key)), sender);
				}
				Ok(FixOutcome::AlreadyFinished) => {
					self.route(&action_messages::error(self.key.id, format!("{} is already finished", self.key)), sender);
				}
				Err(e) => {
					warn!(entity = %self.key, participant = %participant, error = %e, "fix failed");
					self.route(&action_messages::error(self.key.id, format!("failed to fix {}", self.key)), sender);
				}
			},
		}
	}

	fn reject(&self, participant: ParticipantId, sender: &ChannelHandle, err: &PayloadError) {
		if self.cfg.debug_logs {
			debug!(entity = %self.key, participant = %participant, error = %err, "dispatcher: rejected payload");
		}

		let msg = if err.is_session_failure() {
			action_messages::session_fail(err.to_string(), None)
		} else {
			action_messages::error(self.key.id, err.to_string())
		};
		self.route(&msg, sender);
	}

	async fn on_joined(&mut self, participant: ParticipantId) {
		let entity = match self.handler.store().find(self.key.id).await {
			Ok(Some(entity)) => entity,
			Ok(None) => {
				warn!(entity = %self.key, participant = %participant, "joined notice for missing entity");
				return;
			}
			Err(e) => {
				warn!(entity = %self.key, error = %e, "failed to load entity for joined notice");
				return;
			}
		};

		let exclude = self.channels.get(participant).map(ChannelHandle::id);
		let msg = action_messages::membership_notice(
			ActionKind::Joined,
			&entity,
			self.channels.participants(),
			Some(participant),
			TellWhom::AllButSender,
		);
		self.fan_out(&msg.to_value(), exclude);
	}

	fn route(&self, msg: &ActionMessage, sender: &ChannelHandle) {
		let payload = msg.to_value();
		match msg.tell {
			TellWhom::All => self.fan_out(&payload, None),
			TellWhom::AllButSender => self.fan_out(&payload, Some(sender.id())),
			TellWhom::SenderOnly => deliver(&self.key, sender, Arc::new(payload)),
		}
	}

	/// Deliver to every registered channel except `exclude`.
	fn fan_out(&self, payload: &Value, exclude: Option<ChannelId>) {
		let shared = Arc::new(payload.clone());
		for (_, channel) in self.channels.all() {
			if Some(channel.id()) == exclude {
				continue;
			}
			deliver(&self.key, channel, Arc::clone(&shared));
		}
	}
}

fn deliver(key: &EntityKey, channel: &ChannelHandle, payload: Arc<Value>) {
	match channel.try_deliver(payload) {
		Ok(()) => metrics::counter!("cohort_messages_routed_total").increment(1),
		Err(reason) => {
			metrics::counter!("cohort_messages_dropped_total").increment(1);
			debug!(entity = %key, channel = %channel.id(), ?reason, "dropped outbound message");
		}
	}
}
