#![forbid(unsafe_code)]

use std::marker::PhantomData;

use anyhow::{Context, anyhow};
use cohort_domain::{EntityId, EntityState, ParticipantId};
use serde_json::Value;

use crate::server::store::{CasOutcome, EntityRow, EntityStore, SessionEntity};

/// Connection pool shared by every entity store of one process.
#[derive(Clone)]
pub enum SqlPool {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

impl SqlPool {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			Ok(Self::Sqlite(pool))
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			Ok(Self::Postgres(pool))
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
			sqlx::migrate!("migrations/mysql")
				.run(&pool)
				.await
				.context("run mysql migrations")?;
			Ok(Self::Mysql(pool))
		} else {
			Err(anyhow!("unsupported database_url (use sqlite:, postgres:, mysql:)"))
		}
	}
}

/// id, owner_id, state, session_data, session_version, active_members, history_members
type RawRow = (i64, i64, String, String, i64, String, String);

const SELECT_COLUMNS: &str =
	"id, owner_id, state, session_data, session_version, active_members, history_members";

fn decode_row(raw: RawRow) -> anyhow::Result<EntityRow> {
	let (id, owner_id, state, session_data, session_version, active, history) = raw;
	let state: EntityState = state.parse().with_context(|| format!("decode state {state:?}"))?;
	let session_data: Value = serde_json::from_str(&session_data).context("decode session_data")?;
	let active_members: Vec<ParticipantId> = serde_json::from_str(&active).context("decode active_members")?;
	let history_members: Vec<ParticipantId> = serde_json::from_str(&history).context("decode history_members")?;

	Ok(EntityRow {
		id: EntityId(id as u64),
		owner_id: owner_id as u64,
		state,
		session_data,
		session_version: session_version as u64,
		active_members,
		history_members,
	})
}

struct EncodedRow {
	id: i64,
	owner_id: i64,
	state: &'static str,
	session_data: String,
	session_version: i64,
	active_members: String,
	history_members: String,
}

fn encode_row(row: &EntityRow) -> anyhow::Result<EncodedRow> {
	Ok(EncodedRow {
		id: row.id.0 as i64,
		owner_id: row.owner_id as i64,
		state: row.state.as_str(),
		session_data: serde_json::to_string(&row.session_data).context("encode session_data")?,
		session_version: row.session_version as i64,
		active_members: serde_json::to_string(&row.active_members).context("encode active_members")?,
		history_members: serde_json::to_string(&row.history_members).context("encode history_members")?,
	})
}

/// Entity store over the `session_entities` table, one row per (kind, id).
pub struct SqlEntityStore<E> {
	pool: SqlPool,
	_entity: PhantomData<fn() -> E>,
}

impl<E: SessionEntity> SqlEntityStore<E> {
	pub fn new(pool: SqlPool) -> Self {
		Self {
			pool,
			_entity: PhantomData,
		}
	}

	fn kind(&self) -> &'static str {
		E::KIND.as_str()
	}

	async fn current_version(&self, id: EntityId) -> anyhow::Result<Option<u64>> {
		let kind = self.kind();
		let row: Option<(i64,)> = match &self.pool {
			SqlPool::Sqlite(pool) => sqlx::query_as("SELECT session_version FROM session_entities WHERE kind = ? AND id = ?")
				.bind(kind)
				.bind(id.0 as i64)
				.fetch_optional(pool)
				.await
				.context("select session_version (sqlite)")?,
			SqlPool::Postgres(pool) => {
				sqlx::query_as("SELECT session_version FROM session_entities WHERE kind = $1 AND id = $2")
					.bind(kind)
					.bind(id.0 as i64)
					.fetch_optional(pool)
					.await
					.context("select session_version (postgres)")?
			}
			SqlPool::Mysql(pool) => sqlx::query_as("SELECT session_version FROM session_entities WHERE kind = ? AND id = ?")
				.bind(kind)
				.bind(id.0 as i64)
				.fetch_optional(pool)
				.await
				.context("select session_version (mysql)")?,
		};
		Ok(row.map(|(v,)| v as u64))
	}
}

#[async_trait::async_trait]
impl<E: SessionEntity> EntityStore<E> for SqlEntityStore<E> {
	async fn find(&self, id: EntityId) -> anyhow::Result<Option<E>> {
		let kind = self.kind();
		let raw: Option<RawRow> = match &self.pool {
			SqlPool::Sqlite(pool) => {
				sqlx::query_as(&format!("SELECT {SELECT_COLUMNS} FROM session_entities WHERE kind = ? AND id = ?"))
					.bind(kind)
					.bind(id.0 as i64)
					.fetch_optional(pool)
					.await
					.context("select entity (sqlite)")?
			}
			SqlPool::Postgres(pool) => {
				sqlx::query_as(&format!("SELECT {SELECT_COLUMNS} FROM session_entities WHERE kind = $1 AND id = $2"))
					.bind(kind)
					.bind(id.0 as i64)
					.fetch_optional(pool)
					.await
					.context("select entity (postgres)")?
			}
			SqlPool::Mysql(pool) => {
				sqlx::query_as(&format!("SELECT {SELECT_COLUMNS} FROM session_entities WHERE kind = ? AND id = ?"))
					.bind(kind)
					.bind(id.0 as i64)
					.fetch_optional(pool)
					.await
					.context("select entity (mysql)")?
			}
		};

		raw.map(|r| decode_row(r).map(E::from_row)).transpose()
	}

	async fn insert(&self, entity: &E) -> anyhow::Result<()> {
		let kind = self.kind();
		let row = encode_row(&entity.to_row())?;

		match &self.pool {
			SqlPool::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO session_entities (kind, id, owner_id, state, session_data, session_version, active_members, history_members) \
					VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
				)
				.bind(kind)
				.bind(row.id)
				.bind(row.owner_id)
				.bind(row.state)
				.bind(&row.session_data)
				.bind(row.session_version)
				.bind(&row.active_members)
				.bind(&row.history_members)
				.execute(pool)
				.await
				.context("insert entity (sqlite)")?;
			}
			SqlPool::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO session_entities (kind, id, owner_id, state, session_data, session_version, active_members, history_members) \
					VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
				)
				.bind(kind)
				.bind(row.id)
				.bind(row.owner_id)
				.bind(row.state)
				.bind(&row.session_data)
				.bind(row.session_version)
				.bind(&row.active_members)
				.bind(&row.history_members)
				.execute(pool)
				.await
				.context("insert entity (postgres)")?;
			}
			SqlPool::Mysql(pool) => {
				sqlx::query(
					"INSERT INTO session_entities (kind, id, owner_id, state, session_data, session_version, active_members, history_members) \
					VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
				)
				.bind(kind)
				.bind(row.id)
				.bind(row.owner_id)
				.bind(row.state)
				.bind(&row.session_data)
				.bind(row.session_version)
				.bind(&row.active_members)
				.bind(&row.history_members)
				.execute(pool)
				.await
				.context("insert entity (mysql)")?;
			}
		}
		Ok(())
	}

	async fn update(&self, entity: &E) -> anyhow::Result<()> {
		let kind = self.kind();
		let row = encode_row(&entity.to_row())?;

		let affected = match &self.pool {
			SqlPool::Sqlite(pool) => sqlx::query(
				"UPDATE session_entities SET owner_id = ?, state = ?, active_members = ?, history_members = ? \
				WHERE kind = ? AND id = ?",
			)
			.bind(row.owner_id)
			.bind(row.state)
			.bind(&row.active_members)
			.bind(&row.history_members)
			.bind(kind)
			.bind(row.id)
			.execute(pool)
			.await
			.context("update entity (sqlite)")?
			.rows_affected(),
			SqlPool::Postgres(pool) => sqlx::query(
				"UPDATE session_entities SET owner_id = $1, state = $2, active_members = $3, history_members = $4 \
				WHERE kind = $5 AND id = $6",
			)
			.bind(row.owner_id)
			.bind(row.state)
			.bind(&row.active_members)
			.bind(&row.history_members)
			.bind(kind)
			.bind(row.id)
			.execute(pool)
			.await
			.context("update entity (postgres)")?
			.rows_affected(),
			SqlPool::Mysql(pool) => {
				sqlx::query(
					"UPDATE session_entities SET owner_id = ?, state = ?, active_members = ?, history_members = ? \
					WHERE kind = ? AND id = ?",
				)
				.bind(row.owner_id)
				.bind(row.state)
				.bind(&row.active_members)
				.bind(&row.history_members)
				.bind(kind)
				.bind(row.id)
				.execute(pool)
				.await
				.context("update entity (mysql)")?;
				// mysql reports changed rows, so an identical update counts as zero
				return match self.current_version(entity.id()).await? {
					Some(_) => Ok(()),
					None => Err(anyhow!("{} not found", entity.key())),
				};
			}
		};

		if affected == 0 {
			return Err(anyhow!("{} not found", entity.key()));
		}
		Ok(())
	}

	async fn list_by_owner(&self, owner_id: u64) -> anyhow::Result<Vec<E>> {
		let kind = self.kind();
		let rows: Vec<RawRow> = match &self.pool {
			SqlPool::Sqlite(pool) => sqlx::query_as(&format!(
				"SELECT {SELECT_COLUMNS} FROM session_entities WHERE kind = ? AND owner_id = ? ORDER BY id"
			))
			.bind(kind)
			.bind(owner_id as i64)
			.fetch_all(pool)
			.await
			.context("list entities (sqlite)")?,
			SqlPool::Postgres(pool) => sqlx::query_as(&format!(
				"SELECT {SELECT_COLUMNS} FROM session_entities WHERE kind = $1 AND owner_id = $2 ORDER BY id"
			))
			.bind(kind)
			.bind(owner_id as i64)
			.fetch_all(pool)
			.await
			.context("list entities (postgres)")?,
			SqlPool::Mysql(pool) => sqlx::query_as(&format!(
				"SELECT {SELECT_COLUMNS} FROM session_entities WHERE kind = ? AND owner_id = ? ORDER BY id"
			))
			.bind(kind)
			.bind(owner_id as i64)
			.fetch_all(pool)
			.await
			.context("list entities (mysql)")?,
		};

		rows.into_iter().map(|r| decode_row(r).map(E::from_row)).collect()
	}

	async fn compare_and_set_session(
		&self,
		id: EntityId,
		expected_version: u64,
		data: &Value,
	) -> anyhow::Result<CasOutcome> {
		let kind = self.kind();
		let data = serde_json::to_string(data).context("encode session_data")?;
		let expected = expected_version as i64;

		let affected = match &self.pool {
			SqlPool::Sqlite(pool) => sqlx::query(
				"UPDATE session_entities SET session_data = ?, session_version = session_version + 1 \
				WHERE kind = ? AND id = ? AND session_version = ?",
			)
			.bind(&data)
			.bind(kind)
			.bind(id.0 as i64)
			.bind(expected)
			.execute(pool)
			.await
			.context("cas session (sqlite)")?
			.rows_affected(),
			SqlPool::Postgres(pool) => sqlx::query(
				"UPDATE session_entities SET session_data = $1, session_version = session_version + 1 \
				WHERE kind = $2 AND id = $3 AND session_version = $4",
			)
			.bind(&data)
			.bind(kind)
			.bind(id.0 as i64)
			.bind(expected)
			.execute(pool)
			.await
			.context("cas session (postgres)")?
			.rows_affected(),
			SqlPool::Mysql(pool) => sqlx::query(
				"UPDATE session_entities SET session_data = ?, session_version = session_version + 1 \
				WHERE kind = ? AND id = ? AND session_version = ?",
			)
			.bind(&data)
			.bind(kind)
			.bind(id.0 as i64)
			.bind(expected)
			.execute(pool)
			.await
			.context("cas session (mysql)")?
			.rows_affected(),
		};

		if affected == 1 {
			return Ok(CasOutcome::Applied {
				version: expected_version + 1,
			});
		}

		Ok(match self.current_version(id).await? {
			Some(current) => CasOutcome::VersionMismatch { current },
			None => CasOutcome::NotFound,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::server::store::GroupRecord;
	use serde_json::json;

	async fn sqlite_store() -> SqlEntityStore<GroupRecord> {
		let pool = SqlPool::connect("sqlite::memory:").await.unwrap();
		SqlEntityStore::new(pool)
	}

	#[tokio::test]
	async fn sqlite_roundtrips_entity_and_cas() {
		let store = sqlite_store().await;
		let group = GroupRecord::new(EntityId(42), 5).with_members([1, 2]);
		store.insert(&group).await.unwrap();

		let loaded = store.find(EntityId(42)).await.unwrap().unwrap();
		assert_eq!(loaded, group);

		let applied = store
			.compare_and_set_session(EntityId(42), 0, &json!({"round": 1}))
			.await
			.unwrap();
		assert_eq!(applied, CasOutcome::Applied { version: 1 });

		let stale = store
			.compare_and_set_session(EntityId(42), 0, &json!({"round": 2}))
			.await
			.unwrap();
		assert_eq!(stale, CasOutcome::VersionMismatch { current: 1 });

		assert_eq!(
			store.compare_and_set_session(EntityId(7), 0, &json!({})).await.unwrap(),
			CasOutcome::NotFound
		);

		let loaded = store.find(EntityId(42)).await.unwrap().unwrap();
		assert_eq!(loaded.session_data, json!({"round": 1}));
		assert_eq!(loaded.session_version, 1);
	}

	#[tokio::test]
	async fn sqlite_update_keeps_session_and_lists_by_owner() {
		let store = sqlite_store().await;
		store.insert(&GroupRecord::new(EntityId(1), 9)).await.unwrap();
		store.insert(&GroupRecord::new(EntityId(2), 9)).await.unwrap();
		store.insert(&GroupRecord::new(EntityId(3), 4)).await.unwrap();

		store
			.compare_and_set_session(EntityId(1), 0, &json!({"k": "v"}))
			.await
			.unwrap();

		let mut fixed = GroupRecord::new(EntityId(1), 9);
		fixed.state = EntityState::Fixed;
		store.update(&fixed).await.unwrap();

		let loaded = store.find(EntityId(1)).await.unwrap().unwrap();
		assert_eq!(loaded.state, EntityState::Fixed);
		assert_eq!(loaded.session_data, json!({"k": "v"}));

		let ids = store
			.list_by_owner(9)
			.await
			.unwrap()
			.into_iter()
			.map(|g| g.id)
			.collect::<Vec<_>>();
		assert_eq!(ids, vec![EntityId(1), EntityId(2)]);

		assert!(store.update(&GroupRecord::new(EntityId(99), 9)).await.is_err());
	}
}
