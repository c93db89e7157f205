#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cohort_domain::ParticipantId;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::server::dispatcher::DispatcherHandle;

/// Process-unique identity of one channel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl ChannelId {
	pub fn next() -> Self {
		static NEXT: AtomicU64 = AtomicU64::new(1);
		Self(NEXT.fetch_add(1, Ordering::Relaxed))
	}
}

impl fmt::Display for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ch-{}", self.0)
	}
}

/// Messages a dispatcher (or the session service through it) sends to a channel.
#[derive(Debug)]
pub enum ChannelMsg {
	/// Payload to write to the transport verbatim.
	Deliver(Arc<Value>),
	/// Close the transport and unregister.
	Poison,
	/// Move to another dispatcher while keeping the transport open.
	Reassign { dispatcher: DispatcherHandle },
}

/// Why a payload could not be queued on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverError {
	Full,
	Closed,
}

#[derive(Debug, Clone)]
pub struct ChannelHandle {
	id: ChannelId,
	tx: mpsc::Sender<ChannelMsg>,
}

impl ChannelHandle {
	pub fn new(id: ChannelId, tx: mpsc::Sender<ChannelMsg>) -> Self {
		Self { id, tx }
	}

	pub fn id(&self) -> ChannelId {
		self.id
	}

	/// Queue a payload without waiting; a full mailbox drops it.
	pub fn try_deliver(&self, payload: Arc<Value>) -> Result<(), DeliverError> {
		self.tx.try_send(ChannelMsg::Deliver(payload)).map_err(|e| match e {
			mpsc::error::TrySendError::Full(_) => DeliverError::Full,
			mpsc::error::TrySendError::Closed(_) => DeliverError::Closed,
		})
	}

	/// Signal a control message. Never blocks the caller on a full mailbox.
	///
	/// Returns false only when the channel is already gone.
	pub fn signal(&self, msg: ChannelMsg) -> bool {
		match self.tx.try_send(msg) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(msg)) => {
				let tx = self.tx.clone();
				tokio::spawn(async move {
					let _ = tx.send(msg).await;
				});
				true
			}
			Err(mpsc::error::TrySendError::Closed(_)) => false,
		}
	}
}

impl PartialEq for ChannelHandle {
	fn eq(&self, other: &Self) -> bool {
		self.id == other.id
	}
}

impl Eq for ChannelHandle {}

/// Participant ↔ channel map owned by exactly one dispatcher.
///
/// Both directions stay a bijection: registering a participant again replaces
/// its previous channel, and a channel maps to at most one participant.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
	by_participant: HashMap<ParticipantId, ChannelHandle>,
	by_channel: HashMap<ChannelId, ParticipantId>,
}

impl ChannelRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert or overwrite. Returns the channel that was replaced, if any.
	pub fn register(&mut self, participant: ParticipantId, channel: ChannelHandle) -> Option<ChannelHandle> {
		if let Some(prev_owner) = self.by_channel.insert(channel.id(), participant)
			&& prev_owner != participant
		{
			self.by_participant.remove(&prev_owner);
		}

		let replaced = self.by_participant.insert(participant, channel)?;
		if let Some(current) = self.by_participant.get(&participant)
			&& current.id() != replaced.id()
		{
			self.by_channel.remove(&replaced.id());
		}
		Some(replaced)
	}

	pub fn unregister(&mut self, participant: ParticipantId) -> Option<ChannelHandle> {
		let channel = self.by_participant.remove(&participant)?;
		self.by_channel.remove(&channel.id());
		Some(channel)
	}

	pub fn get(&self, participant: ParticipantId) -> Option<&ChannelHandle> {
		self.by_participant.get(&participant)
	}

	pub fn reverse_lookup(&self, channel: ChannelId) -> Option<ParticipantId> {
		self.by_channel.get(&channel).copied()
	}

	pub fn all(&self) -> impl Iterator<Item = (ParticipantId, &ChannelHandle)> {
		self.by_participant.iter().map(|(p, c)| (*p, c))
	}

	/// Registered participants in ascending order.
	pub fn participants(&self) -> Vec<ParticipantId> {
		let mut out = self.by_participant.keys().copied().collect::<Vec<_>>();
		out.sort_unstable();
		out
	}

	pub fn len(&self) -> usize {
		self.by_participant.len()
	}

	pub fn is_empty(&self) -> bool {
		self.by_participant.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashSet;

	use super::*;

	fn handle() -> (ChannelHandle, mpsc::Receiver<ChannelMsg>) {
		let (tx, rx) = mpsc::channel(4);
		(ChannelHandle::new(ChannelId::next(), tx), rx)
	}

	#[test]
	fn size_tracks_distinct_participants() {
		let mut reg = ChannelRegistry::new();
		let mut live = HashSet::new();
		let mut keep = Vec::new();

		let script: &[(bool, u64)] = &[
			(true, 1),
			(true, 2),
			(true, 1),
			(false, 3),
			(true, 3),
			(false, 1),
			(false, 1),
			(true, 4),
		];

		for &(register, p) in script {
			let p = ParticipantId(p);
			if register {
				let (h, rx) = handle();
				keep.push(rx);
				reg.register(p, h);
				live.insert(p);
			} else {
				reg.unregister(p);
				live.remove(&p);
			}
			assert_eq!(reg.len(), live.len());
			assert_eq!(reg.is_empty(), live.is_empty());
		}

		let mut expected = live.into_iter().collect::<Vec<_>>();
		expected.sort_unstable();
		assert_eq!(reg.participants(), expected);
	}

	#[test]
	fn overwrite_replaces_reverse_mapping() {
		let mut reg = ChannelRegistry::new();
		let (first, _rx1) = handle();
		let (second, _rx2) = handle();
		let p = ParticipantId(7);

		assert!(reg.register(p, first.clone()).is_none());
		let replaced = reg.register(p, second.clone()).unwrap();
		assert_eq!(replaced.id(), first.id());

		assert_eq!(reg.reverse_lookup(first.id()), None);
		assert_eq!(reg.reverse_lookup(second.id()), Some(p));
		assert_eq!(reg.get(p).map(ChannelHandle::id), Some(second.id()));
		assert_eq!(reg.len(), 1);
	}

	#[test]
	fn moving_a_channel_to_another_participant_keeps_bijection() {
		let mut reg = ChannelRegistry::new();
		let (h, _rx) = handle();

		reg.register(ParticipantId(1), h.clone());
		reg.register(ParticipantId(2), h.clone());

		assert!(reg.get(ParticipantId(1)).is_none());
		assert_eq!(reg.reverse_lookup(h.id()), Some(ParticipantId(2)));
		assert_eq!(reg.len(), 1);
	}

	#[test]
	fn unregister_unknown_is_noop() {
		let mut reg = ChannelRegistry::new();
		assert!(reg.unregister(ParticipantId(1)).is_none());
		assert!(reg.is_empty());
	}
}
