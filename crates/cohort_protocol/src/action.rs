#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use cohort_domain::{EntityId, EntityState, ParticipantId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Value of the `action` field on protocol envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
	Opened,
	Closed,
	Joined,
	Left,
	Session,
	SessionAck,
	SessionFail,
	Fixed,
	Error,
}

impl ActionKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			ActionKind::Opened => "OPENED",
			ActionKind::Closed => "CLOSED",
			ActionKind::Joined => "JOINED",
			ActionKind::Left => "LEFT",
			ActionKind::Session => "SESSION",
			ActionKind::SessionAck => "SESSION_ACK",
			ActionKind::SessionFail => "SESSION_FAIL",
			ActionKind::Fixed => "FIXED",
			ActionKind::Error => "ERROR",
		}
	}

	/// Whether a client may send this kind; the rest are server-emitted only.
	pub const fn is_client_request(self) -> bool {
		matches!(self, ActionKind::Session | ActionKind::Fixed)
	}
}

impl fmt::Display for ActionKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ActionKind {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(match s {
			"OPENED" => ActionKind::Opened,
			"CLOSED" => ActionKind::Closed,
			"JOINED" => ActionKind::Joined,
			"LEFT" => ActionKind::Left,
			"SESSION" => ActionKind::Session,
			"SESSION_ACK" => ActionKind::SessionAck,
			"SESSION_FAIL" => ActionKind::SessionFail,
			"FIXED" => ActionKind::Fixed,
			"ERROR" => ActionKind::Error,
			other => return Err(other.to_string()),
		})
	}
}

/// Routing directive attached to an outbound action message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TellWhom {
	All,
	AllButSender,
	SenderOnly,
}

/// Outbound protocol envelope. Absent fields are omitted on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEnvelope {
	pub action: ActionKind,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub entity_id: Option<EntityId>,

	/// Participant the notice is about (joiner, leaver, opener).
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub member_id: Option<ParticipantId>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub members: Option<Vec<ParticipantId>>,

	/// Participants with an open channel.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub channels: Option<Vec<ParticipantId>>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub state: Option<EntityState>,

	/// Only present on full snapshots.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_data: Option<Value>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_version: Option<u64>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub patch: Option<Value>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<u64>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error_message: Option<String>,
}

impl ActionEnvelope {
	/// Envelope with only the `action` field set.
	pub fn new(action: ActionKind) -> Self {
		Self {
			action,
			entity_id: None,
			member_id: None,
			members: None,
			channels: None,
			state: None,
			session_data: None,
			session_version: None,
			patch: None,
			version: None,
			error_message: None,
		}
	}

	pub fn to_value(&self) -> Value {
		serde_json::to_value(self).unwrap_or(Value::Null)
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn omits_absent_fields() {
		let mut env = ActionEnvelope::new(ActionKind::SessionAck);
		env.entity_id = Some(EntityId(42));
		env.session_version = Some(3);
		assert_eq!(
			env.to_value(),
			json!({"action": "SESSION_ACK", "entityId": 42, "sessionVersion": 3})
		);
	}

	#[test]
	fn action_kind_names_match_wire_format() {
		for kind in [
			ActionKind::Opened,
			ActionKind::Closed,
			ActionKind::Joined,
			ActionKind::Left,
			ActionKind::Session,
			ActionKind::SessionAck,
			ActionKind::SessionFail,
			ActionKind::Fixed,
			ActionKind::Error,
		] {
			assert_eq!(serde_json::to_value(kind).unwrap(), json!(kind.as_str()));
			assert_eq!(kind.as_str().parse::<ActionKind>().unwrap(), kind);
		}
		assert!("BOGUS".parse::<ActionKind>().is_err());
	}
}
