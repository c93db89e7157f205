#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use cohort_domain::{EntityKey, ParticipantId};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::channel::{Duplex, DuplexPeer};
use crate::server::dispatcher_registry::{DispatcherRegistry, RegistryConfig};
use crate::server::registry::{ChannelHandle, ChannelId, ChannelMsg};
use crate::server::session_service::{OpenedChannel, SessionService, SessionServiceConfig};
use crate::server::store::{BatchRecord, EntityStore, GroupRecord, InMemoryEntityStore};

pub(crate) const WAIT: Duration = Duration::from_millis(500);
pub(crate) const QUIET: Duration = Duration::from_millis(50);

pub(crate) fn group_store(groups: impl IntoIterator<Item = GroupRecord>) -> Arc<InMemoryEntityStore<GroupRecord>> {
	Arc::new(InMemoryEntityStore::with_entities(groups))
}

pub(crate) fn group_registry(store: &Arc<InMemoryEntityStore<GroupRecord>>) -> DispatcherRegistry {
	let store: Arc<dyn EntityStore<GroupRecord>> = store.clone();
	DispatcherRegistry::spawn(store, RegistryConfig::default())
}

pub(crate) fn service(groups: &Arc<InMemoryEntityStore<GroupRecord>>) -> SessionService {
	let batches: Arc<dyn EntityStore<BatchRecord>> = Arc::new(InMemoryEntityStore::default());
	SessionService::new(
		group_registry(groups),
		DispatcherRegistry::spawn(batches, RegistryConfig::default()),
		SessionServiceConfig::default(),
	)
}

/// Raw channel endpoint for driving a dispatcher without a channel actor.
pub(crate) fn fake_channel() -> (ChannelHandle, mpsc::Receiver<ChannelMsg>) {
	let (tx, rx) = mpsc::channel(64);
	(ChannelHandle::new(ChannelId::next(), tx), rx)
}

pub(crate) async fn next_delivery(rx: &mut mpsc::Receiver<ChannelMsg>) -> Value {
	match timeout(WAIT, rx.recv()).await.expect("delivery within timeout") {
		Some(ChannelMsg::Deliver(payload)) => (*payload).clone(),
		other => panic!("expected Deliver, got: {other:?}"),
	}
}

pub(crate) async fn assert_no_delivery(rx: &mut mpsc::Receiver<ChannelMsg>) {
	if let Ok(Some(msg)) = timeout(QUIET, rx.recv()).await {
		panic!("unexpected channel message: {msg:?}");
	}
}

/// A participant connected through a real channel actor.
pub(crate) struct TestClient {
	pub participant: ParticipantId,
	pub peer: DuplexPeer,
	pub opened: OpenedChannel,
	/// The OPENED snapshot received on connect.
	pub snapshot: Value,
}

impl TestClient {
	/// Connect and wait for the OPENED snapshot, so registration order is deterministic.
	pub async fn connect(service: &SessionService, key: EntityKey, participant: u64) -> Self {
		let (duplex, mut peer): (Duplex, DuplexPeer) = Duplex::pair(64);
		let participant = ParticipantId(participant);
		let opened = service
			.open_channel(key, participant, duplex)
			.await
			.expect("open channel");

		let snapshot = recv_from(&mut peer).await;
		assert_eq!(snapshot["action"], "OPENED", "first message must be the snapshot: {snapshot}");

		Self {
			participant,
			peer,
			opened,
			snapshot,
		}
	}

	pub async fn send(&self, payload: Value) {
		self.peer.tx.send(payload).await.expect("channel accepts inbound");
	}

	pub async fn recv(&mut self) -> Value {
		recv_from(&mut self.peer).await
	}

	pub async fn assert_silent(&mut self) {
		if let Ok(Some(msg)) = timeout(QUIET, self.peer.rx.recv()).await {
			panic!("participant {} unexpectedly received {msg}", self.participant);
		}
	}

	/// Hang up the transport and wait for the channel task to finish.
	pub async fn hang_up(self) {
		let TestClient { peer, opened, .. } = self;
		drop(peer);
		timeout(WAIT, opened.task)
			.await
			.expect("channel task ends after hang-up")
			.expect("channel task did not panic");
	}
}

pub(crate) async fn recv_from(peer: &mut DuplexPeer) -> Value {
	let payload = timeout(WAIT, peer.rx.recv())
		.await
		.expect("message within timeout")
		.expect("transport open");
	(*payload).clone()
}
