#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use cohort_domain::{EntityId, EntityKind};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::server::action_handler::ActionHandler;
use crate::server::dispatcher::{DispatcherConfig, DispatcherHandle, spawn_dispatcher};
use crate::server::error::DispatchError;
use crate::server::store::{EntityStore, SessionEntity};

/// Configuration for `DispatcherRegistry`.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
	pub mailbox_capacity: usize,
	pub dispatcher: DispatcherConfig,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		Self {
			mailbox_capacity: 1024,
			dispatcher: DispatcherConfig::default(),
		}
	}
}

#[derive(Debug)]
pub(crate) enum RegistryCmd {
	Get {
		id: EntityId,
		reply: oneshot::Sender<Option<DispatcherHandle>>,
	},
	GetOrCreate {
		id: EntityId,
		reply: oneshot::Sender<DispatcherHandle>,
	},
	/// Sent by a terminating dispatcher about itself.
	Unregister {
		id: EntityId,
		instance: u64,
	},
	Count {
		reply: oneshot::Sender<usize>,
	},
}

/// Process-wide map from entity id to its live dispatcher, for one entity kind.
///
/// All operations go through a single actor task, so `get_or_create` calls for
/// the same id are serialized and never produce two dispatchers.
#[derive(Debug, Clone)]
pub struct DispatcherRegistry {
	kind: EntityKind,
	tx: mpsc::Sender<RegistryCmd>,
}

impl DispatcherRegistry {
	pub fn spawn<E: SessionEntity>(store: Arc<dyn EntityStore<E>>, cfg: RegistryConfig) -> Self {
		let (tx, rx) = mpsc::channel(cfg.mailbox_capacity.max(1));

		let actor = RegistryActor::<E> {
			handler: ActionHandler::new(store),
			dispatchers: HashMap::new(),
			next_instance: 1,
			rx,
			weak: tx.downgrade(),
			cfg,
		};
		tokio::spawn(actor.run());

		Self { kind: E::KIND, tx }
	}

	#[cfg(test)]
	pub(crate) fn from_sender(kind: EntityKind, tx: mpsc::Sender<RegistryCmd>) -> Self {
		Self { kind, tx }
	}

	pub fn kind(&self) -> EntityKind {
		self.kind
	}

	/// Live dispatcher for `id`, never creating one.
	pub async fn get(&self, id: EntityId) -> Result<Option<DispatcherHandle>, DispatchError> {
		let (reply, rx) = oneshot::channel();
		self.tx
			.send(RegistryCmd::Get { id, reply })
			.await
			.map_err(|_| DispatchError::RegistryClosed)?;
		rx.await.map_err(|_| DispatchError::RegistryClosed)
	}

	pub async fn get_or_create(&self, id: EntityId) -> Result<DispatcherHandle, DispatchError> {
		let (reply, rx) = oneshot::channel();
		self.tx
			.send(RegistryCmd::GetOrCreate { id, reply })
			.await
			.map_err(|_| DispatchError::RegistryClosed)?;
		rx.await.map_err(|_| DispatchError::RegistryClosed)
	}

	/// Number of live dispatchers.
	pub async fn len(&self) -> Result<usize, DispatchError> {
		let (reply, rx) = oneshot::channel();
		self.tx
			.send(RegistryCmd::Count { reply })
			.await
			.map_err(|_| DispatchError::RegistryClosed)?;
		rx.await.map_err(|_| DispatchError::RegistryClosed)
	}
}

struct RegistryActor<E: SessionEntity> {
	handler: ActionHandler<E>,
	dispatchers: HashMap<EntityId, DispatcherHandle>,
	next_instance: u64,
	rx: mpsc::Receiver<RegistryCmd>,
	weak: mpsc::WeakSender<RegistryCmd>,
	cfg: RegistryConfig,
}

impl<E: SessionEntity> RegistryActor<E> {
	async fn run(mut self) {
		while let Some(cmd) = self.rx.recv().await {
			match cmd {
				RegistryCmd::Get { id, reply } => {
					let live = self.dispatchers.get(&id).filter(|h| !h.is_closed()).cloned();
					let _ = reply.send(live);
				}
				RegistryCmd::GetOrCreate { id, reply } => {
					let handle = self.get_or_create(id);
					let _ = reply.send(handle);
				}
				RegistryCmd::Unregister { id, instance } => {
					if self.dispatchers.get(&id).is_some_and(|h| h.instance() == instance) {
						self.dispatchers.remove(&id);
						debug!(kind = %E::KIND, id = %id, instance, "dispatcher unregistered");
					}
				}
				RegistryCmd::Count { reply } => {
					let live = self.dispatchers.values().filter(|h| !h.is_closed()).count();
					let _ = reply.send(live);
				}
			}
		}
	}

	fn get_or_create(&mut self, id: EntityId) -> DispatcherHandle {
		if let Some(existing) = self.dispatchers.get(&id)
			&& !existing.is_closed()
		{
			return existing.clone();
		}

		// a closed handle belongs to a dispatcher still winding down; its
		// unregister carries the old instance and will be ignored
		let instance = self.next_instance;
		self.next_instance += 1;

		let handle = spawn_dispatcher(
			id,
			instance,
			self.handler.clone(),
			self.weak.clone(),
			self.cfg.dispatcher.clone(),
		);
		metrics::counter!("cohort_dispatchers_created_total").increment(1);
		debug!(kind = %E::KIND, id = %id, instance, "dispatcher created");

		self.dispatchers.insert(id, handle.clone());
		handle
	}
}
