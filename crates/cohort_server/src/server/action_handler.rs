#![forbid(unsafe_code)]

use std::sync::Arc;

use cohort_domain::{EntityId, EntityState};
use cohort_protocol::{Patch, PatchError};
use serde_json::Value;
use tracing::debug;

use crate::server::store::{CasOutcome, EntityStore, SessionEntity};

/// Result of a session patch request.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
	Applied { patch: Value, version: u64 },
	Rejected(SessionRejection),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionRejection {
	NotFound,
	Patch(PatchError),
	VersionMismatch { believed: u64, current: u64 },
}

impl SessionRejection {
	pub fn reason(&self) -> String {
		match self {
			SessionRejection::NotFound => "entity not found".to_string(),
			SessionRejection::Patch(e) => format!("patch failed: {e}"),
			SessionRejection::VersionMismatch { believed, current } => {
				format!("version mismatch: believed {believed}, current {current}")
			}
		}
	}

	/// Stored version to hint the client with, when known.
	pub fn current_version(&self) -> Option<u64> {
		match self {
			SessionRejection::VersionMismatch { current, .. } => Some(*current),
			_ => None,
		}
	}

	fn metric_label(&self) -> &'static str {
		match self {
			SessionRejection::NotFound => "not_found",
			SessionRejection::Patch(_) => "invalid_patch",
			SessionRejection::VersionMismatch { .. } => "conflict",
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum FixOutcome<E> {
	Fixed(E),
	NotFound,
	/// Finished entities never go back to FIXED.
	AlreadyFinished,
}

/// Stateless business logic over one entity kind.
pub struct ActionHandler<E> {
	store: Arc<dyn EntityStore<E>>,
}

impl<E> Clone for ActionHandler<E> {
	fn clone(&self) -> Self {
		Self {
			store: Arc::clone(&self.store),
		}
	}
}

impl<E: SessionEntity> ActionHandler<E> {
	pub fn new(store: Arc<dyn EntityStore<E>>) -> Self {
		Self { store }
	}

	pub fn store(&self) -> &Arc<dyn EntityStore<E>> {
		&self.store
	}

	/// Apply `patch` to the stored session iff the stored version equals `believed_version`.
	///
	/// `Err` is reserved for store failures; every protocol outcome is `Ok`.
	pub async fn apply_session(
		&self,
		id: EntityId,
		patch: &Patch,
		believed_version: u64,
	) -> anyhow::Result<SessionOutcome> {
		let outcome = self.apply_session_inner(id, patch, believed_version).await?;

		let label = match &outcome {
			SessionOutcome::Applied { .. } => "applied",
			SessionOutcome::Rejected(r) => r.metric_label(),
		};
		metrics::counter!("cohort_session_patches_total", "outcome" => label).increment(1);

		Ok(outcome)
	}

	async fn apply_session_inner(
		&self,
		id: EntityId,
		patch: &Patch,
		believed_version: u64,
	) -> anyhow::Result<SessionOutcome> {
		let Some(entity) = self.store.find(id).await? else {
			return Ok(SessionOutcome::Rejected(SessionRejection::NotFound));
		};

		if entity.session_version() != believed_version {
			debug!(
				entity = %entity.key(),
				believed = believed_version,
				current = entity.session_version(),
				"session patch against stale version"
			);
			return Ok(SessionOutcome::Rejected(SessionRejection::VersionMismatch {
				believed: believed_version,
				current: entity.session_version(),
			}));
		}

		let candidate = match patch.apply(entity.session_data()) {
			Ok(doc) => doc,
			Err(e) => return Ok(SessionOutcome::Rejected(SessionRejection::Patch(e))),
		};

		Ok(
			match self
				.store
				.compare_and_set_session(id, believed_version, &candidate)
				.await?
			{
				CasOutcome::Applied { version } => SessionOutcome::Applied {
					patch: patch.to_value(),
					version,
				},
				CasOutcome::VersionMismatch { current } => {
					debug!(entity = %entity.key(), believed = believed_version, current, "session CAS lost race");
					SessionOutcome::Rejected(SessionRejection::VersionMismatch {
						believed: believed_version,
						current,
					})
				}
				CasOutcome::NotFound => SessionOutcome::Rejected(SessionRejection::NotFound),
			},
		)
	}

	/// Move the entity to FIXED. Repeating it on a FIXED entity succeeds again.
	pub async fn fix(&self, id: EntityId) -> anyhow::Result<FixOutcome<E>> {
		let Some(mut entity) = self.store.find(id).await? else {
			return Ok(FixOutcome::NotFound);
		};

		match entity.state() {
			EntityState::Finished => Ok(FixOutcome::AlreadyFinished),
			EntityState::Fixed => Ok(FixOutcome::Fixed(entity)),
			EntityState::Started => {
				entity.set_state(EntityState::Fixed);
				self.store.update(&entity).await?;
				Ok(FixOutcome::Fixed(entity))
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::server::store::{GroupRecord, InMemoryEntityStore};

	fn handler(groups: impl IntoIterator<Item = GroupRecord>) -> ActionHandler<GroupRecord> {
		ActionHandler::new(Arc::new(InMemoryEntityStore::with_entities(groups)))
	}

	fn add(path: &str, value: Value) -> Patch {
		Patch::from_value(&json!([{"op": "add", "path": path, "value": value}])).unwrap()
	}

	#[tokio::test]
	async fn applies_patch_and_bumps_version() {
		let h = handler([GroupRecord::new(EntityId(42), 1)]);

		let out = h.apply_session(EntityId(42), &add("/score", json!(3)), 0).await.unwrap();
		assert_eq!(
			out,
			SessionOutcome::Applied {
				patch: json!([{"op": "add", "path": "/score", "value": 3}]),
				version: 1
			}
		);

		let stored = h.store().find(EntityId(42)).await.unwrap().unwrap();
		assert_eq!(stored.session_data, json!({"score": 3}));
	}

	#[tokio::test]
	async fn same_believed_version_succeeds_once() {
		let h = handler([GroupRecord::new(EntityId(42), 1)]);

		let a = h.apply_session(EntityId(42), &add("/a", json!(1)), 0).await.unwrap();
		let b = h.apply_session(EntityId(42), &add("/b", json!(2)), 0).await.unwrap();

		assert!(matches!(a, SessionOutcome::Applied { version: 1, .. }));
		assert_eq!(
			b,
			SessionOutcome::Rejected(SessionRejection::VersionMismatch { believed: 0, current: 1 })
		);
		let stored = h.store().find(EntityId(42)).await.unwrap().unwrap();
		assert_eq!(stored.session_data, json!({"a": 1}));
	}

	#[tokio::test]
	async fn failing_patch_persists_nothing() {
		let h = handler([GroupRecord::new(EntityId(42), 1)]);
		let patch = Patch::from_value(&json!({"op": "remove", "path": "/missing"})).unwrap();

		let out = h.apply_session(EntityId(42), &patch, 0).await.unwrap();
		assert!(matches!(out, SessionOutcome::Rejected(SessionRejection::Patch(_))));

		let stored = h.store().find(EntityId(42)).await.unwrap().unwrap();
		assert_eq!(stored.session_version, 0);
		assert_eq!(stored.session_data, json!({}));
	}

	#[tokio::test]
	async fn fix_transitions_and_respects_finished() {
		let mut finished = GroupRecord::new(EntityId(2), 1);
		finished.state = EntityState::Finished;
		let h = handler([GroupRecord::new(EntityId(1), 1), finished]);

		let FixOutcome::Fixed(g) = h.fix(EntityId(1)).await.unwrap() else {
			panic!("expected fixed");
		};
		assert_eq!(g.state, EntityState::Fixed);
		assert!(matches!(h.fix(EntityId(1)).await.unwrap(), FixOutcome::Fixed(_)));
		assert_eq!(h.fix(EntityId(2)).await.unwrap(), FixOutcome::AlreadyFinished);
		assert_eq!(h.fix(EntityId(3)).await.unwrap(), FixOutcome::NotFound);
	}
}
