#![forbid(unsafe_code)]

use cohort_domain::{EntityId, EntityKey, EntityKind, ParticipantId};
use serde::{Deserialize, Serialize};

/// First frame a client sends after opening its stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
	pub kind: EntityKind,
	pub entity_id: EntityId,
	pub participant_id: ParticipantId,

	#[serde(default)]
	pub auth_token: String,

	#[serde(default)]
	pub protocol_version: u32,
}

impl Hello {
	pub fn entity_key(&self) -> EntityKey {
		EntityKey::new(self.kind, self.entity_id)
	}

	/// Major version the client asked for. Accepts a bare major or the packed
	/// `major << 16 | minor` form; `None` when the client sent nothing.
	pub fn requested_major(&self) -> Option<u32> {
		match self.protocol_version {
			0 => None,
			v if v >> 16 == 0 => Some(v),
			v => Some(v >> 16),
		}
	}

	/// Whether this server can talk to the client. An omitted version is accepted.
	pub fn is_supported_version(&self) -> bool {
		self.requested_major().is_none_or(|major| major == crate::version::PROTOCOL_MAJOR)
	}
}
