#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of durable record a dispatcher coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
	Group,
	Batch,
}

impl EntityKind {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			EntityKind::Group => "group",
			EntityKind::Batch => "batch",
		}
	}
}

impl fmt::Display for EntityKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown entity kind: {0}")]
	UnknownKind(String),
	#[error("unknown entity state: {0}")]
	UnknownState(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

impl FromStr for EntityKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"group" | "group_result" => Ok(EntityKind::Group),
			"batch" => Ok(EntityKind::Batch),
			other => Err(ParseIdError::UnknownKind(other.to_string())),
		}
	}
}

fn parse_u64(s: &str) -> Result<u64, ParseIdError> {
	let s = s.trim();
	if s.is_empty() {
		return Err(ParseIdError::Empty);
	}
	s.parse::<u64>()
		.map_err(|_| ParseIdError::InvalidFormat(format!("expected a non-negative integer, got {s:?}")))
}

/// Identifier of a group or batch record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl EntityId {
	pub const fn get(self) -> u64 {
		self.0
	}
}

impl fmt::Display for EntityId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for EntityId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		parse_u64(s).map(Self)
	}
}

/// Identifier of one running study instance (a group or batch member).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub u64);

impl ParticipantId {
	pub const fn get(self) -> u64 {
		self.0
	}
}

impl fmt::Display for ParticipantId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for ParticipantId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		parse_u64(s).map(Self)
	}
}

/// Unique dispatcher key: `(kind, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
	pub kind: EntityKind,
	pub id: EntityId,
}

impl EntityKey {
	pub const fn new(kind: EntityKind, id: EntityId) -> Self {
		Self { kind, id }
	}

	pub const fn group(id: u64) -> Self {
		Self::new(EntityKind::Group, EntityId(id))
	}

	pub const fn batch(id: u64) -> Self {
		Self::new(EntityKind::Batch, EntityId(id))
	}

	/// Parse a `kind:id` string.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let (kind_s, id_s) = s
			.split_once(':')
			.ok_or_else(|| ParseIdError::InvalidFormat("expected kind:id".into()))?;

		let kind = EntityKind::from_str(kind_s)?;
		let id = EntityId::from_str(id_s)?;
		Ok(Self::new(kind, id))
	}
}

impl fmt::Display for EntityKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.kind, self.id)
	}
}

impl FromStr for EntityKey {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		EntityKey::parse(s)
	}
}

/// Lifecycle state of a group or batch record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityState {
	/// Open for new members; session data is shared.
	#[default]
	Started,
	/// No new members are assigned; still running.
	Fixed,
	/// All members are done. Terminal.
	Finished,
}

impl EntityState {
	pub const fn as_str(self) -> &'static str {
		match self {
			EntityState::Started => "STARTED",
			EntityState::Fixed => "FIXED",
			EntityState::Finished => "FINISHED",
		}
	}

	pub const fn is_terminal(self) -> bool {
		matches!(self, EntityState::Finished)
	}
}

impl fmt::Display for EntityState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for EntityState {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_uppercase().as_str() {
			"STARTED" | "ACTIVE" => Ok(EntityState::Started),
			"FIXED" => Ok(EntityState::Fixed),
			"FINISHED" => Ok(EntityState::Finished),
			other => Err(ParseIdError::UnknownState(other.to_string())),
		}
	}
}
