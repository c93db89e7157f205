#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;

use anyhow::anyhow;
use cohort_domain::{EntityId, EntityKey, EntityKind, EntityState, ParticipantId};
use serde_json::{Value, json};
use tokio::sync::Mutex;

/// Storage-neutral shape of a group or batch record.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRow {
	pub id: EntityId,
	pub owner_id: u64,
	pub state: EntityState,
	pub session_data: Value,
	pub session_version: u64,
	pub active_members: Vec<ParticipantId>,
	pub history_members: Vec<ParticipantId>,
}

/// Durable record with shared session data, a version and a member list.
pub trait SessionEntity: Clone + fmt::Debug + Send + Sync + 'static {
	const KIND: EntityKind;

	fn from_row(row: EntityRow) -> Self;
	fn to_row(&self) -> EntityRow;

	fn id(&self) -> EntityId;
	fn state(&self) -> EntityState;
	fn set_state(&mut self, state: EntityState);
	fn session_data(&self) -> &Value;
	fn session_version(&self) -> u64;
	fn active_members(&self) -> &[ParticipantId];
	fn history_members(&self) -> &[ParticipantId];

	fn key(&self) -> EntityKey {
		EntityKey::new(Self::KIND, self.id())
	}
}

/// A group of study runs that interact with each other in real time.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupRecord {
	pub id: EntityId,
	pub batch_id: u64,
	pub state: EntityState,
	pub session_data: Value,
	pub session_version: u64,
	pub active_members: Vec<ParticipantId>,
	pub history_members: Vec<ParticipantId>,
}

impl GroupRecord {
	pub fn new(id: EntityId, batch_id: u64) -> Self {
		Self {
			id,
			batch_id,
			state: EntityState::Started,
			session_data: json!({}),
			session_version: 0,
			active_members: Vec::new(),
			history_members: Vec::new(),
		}
	}

	pub fn with_members(mut self, members: impl IntoIterator<Item = u64>) -> Self {
		self.active_members = members.into_iter().map(ParticipantId).collect();
		self
	}
}

/// All study runs of one batch; shares a batch-wide session.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRecord {
	pub id: EntityId,
	pub study_id: u64,
	pub state: EntityState,
	pub session_data: Value,
	pub session_version: u64,
	pub active_members: Vec<ParticipantId>,
	pub history_members: Vec<ParticipantId>,
}

impl BatchRecord {
	pub fn new(id: EntityId, study_id: u64) -> Self {
		Self {
			id,
			study_id,
			state: EntityState::Started,
			session_data: json!({}),
			session_version: 0,
			active_members: Vec::new(),
			history_members: Vec::new(),
		}
	}
}

macro_rules! impl_session_entity {
	($ty:ty, $kind:expr, $owner:ident) => {
		impl SessionEntity for $ty {
			const KIND: EntityKind = $kind;

			fn from_row(row: EntityRow) -> Self {
				Self {
					id: row.id,
					$owner: row.owner_id,
					state: row.state,
					session_data: row.session_data,
					session_version: row.session_version,
					active_members: row.active_members,
					history_members: row.history_members,
				}
			}

			fn to_row(&self) -> EntityRow {
				EntityRow {
					id: self.id,
					owner_id: self.$owner,
					state: self.state,
					session_data: self.session_data.clone(),
					session_version: self.session_version,
					active_members: self.active_members.clone(),
					history_members: self.history_members.clone(),
				}
			}

			fn id(&self) -> EntityId {
				self.id
			}

			fn state(&self) -> EntityState {
				self.state
			}

			fn set_state(&mut self, state: EntityState) {
				self.state = state;
			}

			fn session_data(&self) -> &Value {
				&self.session_data
			}

			fn session_version(&self) -> u64 {
				self.session_version
			}

			fn active_members(&self) -> &[ParticipantId] {
				&self.active_members
			}

			fn history_members(&self) -> &[ParticipantId] {
				&self.history_members
			}
		}
	};
}

impl_session_entity!(GroupRecord, EntityKind::Group, batch_id);
impl_session_entity!(BatchRecord, EntityKind::Batch, study_id);

/// Result of a version-guarded session write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
	Applied { version: u64 },
	VersionMismatch { current: u64 },
	NotFound,
}

/// CRUD interface to the durable records.
///
/// `update` writes state and membership only. Session data and version are
/// written exclusively through `compare_and_set_session`.
#[async_trait::async_trait]
pub trait EntityStore<E: SessionEntity>: Send + Sync {
	async fn find(&self, id: EntityId) -> anyhow::Result<Option<E>>;

	async fn insert(&self, entity: &E) -> anyhow::Result<()>;

	async fn update(&self, entity: &E) -> anyhow::Result<()>;

	async fn list_by_owner(&self, owner_id: u64) -> anyhow::Result<Vec<E>>;

	/// Store `data` and bump the version by one iff the stored version equals `expected_version`.
	async fn compare_and_set_session(
		&self,
		id: EntityId,
		expected_version: u64,
		data: &Value,
	) -> anyhow::Result<CasOutcome>;
}

pub struct InMemoryEntityStore<E> {
	inner: Mutex<HashMap<EntityId, E>>,
}

impl<E> Default for InMemoryEntityStore<E> {
	fn default() -> Self {
		Self {
			inner: Mutex::new(HashMap::new()),
		}
	}
}

impl<E: SessionEntity> InMemoryEntityStore<E> {
	pub fn with_entities(entities: impl IntoIterator<Item = E>) -> Self {
		Self {
			inner: Mutex::new(entities.into_iter().map(|e| (e.id(), e)).collect()),
		}
	}
}

#[async_trait::async_trait]
impl<E: SessionEntity> EntityStore<E> for InMemoryEntityStore<E> {
	async fn find(&self, id: EntityId) -> anyhow::Result<Option<E>> {
		Ok(self.inner.lock().await.get(&id).cloned())
	}

	async fn insert(&self, entity: &E) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		if guard.contains_key(&entity.id()) {
			return Err(anyhow!("{} already exists", entity.key()));
		}
		guard.insert(entity.id(), entity.clone());
		Ok(())
	}

	async fn update(&self, entity: &E) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		let Some(stored) = guard.get_mut(&entity.id()) else {
			return Err(anyhow!("{} not found", entity.key()));
		};

		let current = stored.to_row();
		let mut row = entity.to_row();
		row.session_data = current.session_data;
		row.session_version = current.session_version;
		*stored = E::from_row(row);
		Ok(())
	}

	async fn list_by_owner(&self, owner_id: u64) -> anyhow::Result<Vec<E>> {
		let guard = self.inner.lock().await;
		let mut out = guard
			.values()
			.filter(|e| e.to_row().owner_id == owner_id)
			.cloned()
			.collect::<Vec<_>>();
		out.sort_by_key(|e| e.id());
		Ok(out)
	}

	async fn compare_and_set_session(
		&self,
		id: EntityId,
		expected_version: u64,
		data: &Value,
	) -> anyhow::Result<CasOutcome> {
		let mut guard = self.inner.lock().await;
		let Some(stored) = guard.get_mut(&id) else {
			return Ok(CasOutcome::NotFound);
		};

		let mut row = stored.to_row();
		if row.session_version != expected_version {
			return Ok(CasOutcome::VersionMismatch {
				current: row.session_version,
			});
		}

		row.session_data = data.clone();
		row.session_version += 1;
		let version = row.session_version;
		*stored = E::from_row(row);
		Ok(CasOutcome::Applied { version })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn cas_applies_once_per_version() {
		let store = InMemoryEntityStore::with_entities([GroupRecord::new(EntityId(1), 10)]);

		let first = store
			.compare_and_set_session(EntityId(1), 0, &json!({"a": 1}))
			.await
			.unwrap();
		assert_eq!(first, CasOutcome::Applied { version: 1 });

		let second = store
			.compare_and_set_session(EntityId(1), 0, &json!({"a": 2}))
			.await
			.unwrap();
		assert_eq!(second, CasOutcome::VersionMismatch { current: 1 });

		let stored = store.find(EntityId(1)).await.unwrap().unwrap();
		assert_eq!(stored.session_data, json!({"a": 1}));
		assert_eq!(stored.session_version, 1);

		assert_eq!(
			store.compare_and_set_session(EntityId(9), 0, &json!({})).await.unwrap(),
			CasOutcome::NotFound
		);
	}

	#[tokio::test]
	async fn update_never_touches_session_fields() {
		let store = InMemoryEntityStore::with_entities([GroupRecord::new(EntityId(1), 10)]);
		let stale = store.find(EntityId(1)).await.unwrap().unwrap();

		store
			.compare_and_set_session(EntityId(1), 0, &json!({"fresh": true}))
			.await
			.unwrap();

		let mut fixed = stale.clone();
		fixed.state = EntityState::Fixed;
		store.update(&fixed).await.unwrap();

		let stored = store.find(EntityId(1)).await.unwrap().unwrap();
		assert_eq!(stored.state, EntityState::Fixed);
		assert_eq!(stored.session_data, json!({"fresh": true}));
		assert_eq!(stored.session_version, 1);
	}

	#[tokio::test]
	async fn list_by_owner_filters_and_sorts() {
		let store = InMemoryEntityStore::with_entities([
			BatchRecord::new(EntityId(3), 7),
			BatchRecord::new(EntityId(1), 7),
			BatchRecord::new(EntityId(2), 8),
		]);

		let ids = store
			.list_by_owner(7)
			.await
			.unwrap()
			.into_iter()
			.map(|b| b.id)
			.collect::<Vec<_>>();
		assert_eq!(ids, vec![EntityId(1), EntityId(3)]);
		assert!(store.insert(&BatchRecord::new(EntityId(1), 7)).await.is_err());
	}
}
