#![forbid(unsafe_code)]

use cohort_domain::{EntityKey, EntityKind, ParticipantId};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::server::channel::{Channel, Duplex};
use crate::server::dispatcher_registry::DispatcherRegistry;
use crate::server::error::DispatchError;
use crate::server::registry::ChannelHandle;

#[derive(Debug, Clone)]
pub struct SessionServiceConfig {
	pub channel_mailbox_capacity: usize,
	pub debug_logs: bool,
}

impl Default for SessionServiceConfig {
	fn default() -> Self {
		Self {
			channel_mailbox_capacity: 256,
			debug_logs: false,
		}
	}
}

/// A channel started by [`SessionService::open_channel`].
#[derive(Debug)]
pub struct OpenedChannel {
	pub handle: ChannelHandle,
	pub task: JoinHandle<()>,
}

/// Entry point for the connection layer: opens and closes channels and
/// forwards membership notifications to live dispatchers.
#[derive(Debug, Clone)]
pub struct SessionService {
	groups: DispatcherRegistry,
	batches: DispatcherRegistry,
	cfg: SessionServiceConfig,
}

impl SessionService {
	pub fn new(groups: DispatcherRegistry, batches: DispatcherRegistry, cfg: SessionServiceConfig) -> Self {
		Self { groups, batches, cfg }
	}

	pub fn registry(&self, kind: EntityKind) -> &DispatcherRegistry {
		match kind {
			EntityKind::Group => &self.groups,
			EntityKind::Batch => &self.batches,
		}
	}

	/// Attach a transport to the entity's dispatcher, creating it if needed.
	pub async fn open_channel(
		&self,
		key: EntityKey,
		participant: ParticipantId,
		duplex: Duplex,
	) -> Result<OpenedChannel, DispatchError> {
		let registry = self.registry(key.kind);
		let dispatcher = registry.get_or_create(key.id).await?;

		let (handle, task) = Channel::spawn(
			participant,
			dispatcher,
			registry.clone(),
			duplex,
			self.cfg.channel_mailbox_capacity,
			self.cfg.debug_logs,
		);
		Ok(OpenedChannel { handle, task })
	}

	/// Ask the participant's channel to close. `Ok(false)` when nothing was open.
	pub async fn close_channel(&self, key: EntityKey, participant: ParticipantId) -> Result<bool, DispatchError> {
		let Some(dispatcher) = self.registry(key.kind).get(key.id).await? else {
			return Ok(false);
		};
		match dispatcher.poison_channel(participant).await {
			Ok(found) => Ok(found),
			Err(DispatchError::Terminated(_)) => Ok(false),
			Err(e) => Err(e),
		}
	}

	/// Tell the other channels that `participant` joined. Never creates a dispatcher.
	pub async fn notify_joined(&self, key: EntityKey, participant: ParticipantId) -> Result<bool, DispatchError> {
		let Some(dispatcher) = self.registry(key.kind).get(key.id).await? else {
			if self.cfg.debug_logs {
				debug!(entity = %key, participant = %participant, "joined notice without live dispatcher");
			}
			return Ok(false);
		};
		Ok(dispatcher.notify_joined(participant).await.is_ok())
	}

	/// Tell the other channels that `participant` left. Never creates a dispatcher.
	pub async fn notify_left(&self, key: EntityKey, participant: ParticipantId) -> Result<bool, DispatchError> {
		let Some(dispatcher) = self.registry(key.kind).get(key.id).await? else {
			if self.cfg.debug_logs {
				debug!(entity = %key, participant = %participant, "left notice without live dispatcher");
			}
			return Ok(false);
		};
		Ok(dispatcher.notify_left(participant).await.is_ok())
	}

	/// Move an open channel to another entity of the same kind.
	pub async fn reassign(&self, participant: ParticipantId, from: EntityKey, to: EntityKey) -> Result<(), DispatchError> {
		if from.kind != to.kind {
			return Err(DispatchError::KindMismatch {
				from: from.kind,
				to: to.kind,
			});
		}

		let registry = self.registry(from.kind);
		let Some(current) = registry.get(from.id).await? else {
			return Err(DispatchError::ParticipantNotFound(participant));
		};
		// check first so a failed move does not leave an empty target dispatcher behind
		if !current.channels().await?.contains(&participant) {
			return Err(DispatchError::ParticipantNotFound(participant));
		}
		let target = registry.get_or_create(to.id).await?;

		current.reassign_channel(participant, target).await
	}

	/// Live dispatchers across both kinds.
	pub async fn dispatcher_count(&self) -> Result<usize, DispatchError> {
		Ok(self.groups.len().await? + self.batches.len().await?)
	}
}
