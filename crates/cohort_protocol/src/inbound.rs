#![forbid(unsafe_code)]

use cohort_domain::ParticipantId;
use serde_json::Value;
use thiserror::Error;

use crate::action::ActionKind;
use crate::patch::Patch;

pub const ACTION_FIELD: &str = "action";
pub const RECIPIENT_FIELD: &str = "recipient";
pub const HEARTBEAT_FIELD: &str = "heartbeat";

/// How the dispatcher must treat one client payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
	/// Forward verbatim to everybody but the sender.
	Broadcast,
	/// Forward verbatim to a single participant.
	Unicast { recipient: ParticipantId },
	Action(ActionRequest),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionRequest {
	/// Session data patch against the sender's believed version.
	Session { patch: Patch, version: u64 },
	Fixed,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PayloadError {
	#[error("payload must be a JSON object")]
	NotAnObject,

	#[error("malformed recipient: {0}")]
	MalformedRecipient(String),

	#[error("unknown action: {0}")]
	UnknownAction(String),

	#[error("action {0} is not accepted from clients")]
	ServerOnlyAction(ActionKind),

	/// Session request that can't be applied; answered with `SESSION_FAIL`.
	#[error("invalid session request: {0}")]
	InvalidSession(String),
}

impl PayloadError {
	/// Whether this failure is reported as `SESSION_FAIL` rather than `ERROR`.
	pub fn is_session_failure(&self) -> bool {
		matches!(self, PayloadError::InvalidSession(_))
	}
}

/// Heartbeats keep the connection alive and never reach the dispatcher.
pub fn is_heartbeat(payload: &Value) -> bool {
	payload.as_object().is_some_and(|obj| obj.contains_key(HEARTBEAT_FIELD))
}

/// Classify a client payload. `action` wins over `recipient`.
pub fn classify(payload: &Value) -> Result<Inbound, PayloadError> {
	let obj = payload.as_object().ok_or(PayloadError::NotAnObject)?;

	if let Some(action) = obj.get(ACTION_FIELD) {
		let name = action
			.as_str()
			.ok_or_else(|| PayloadError::UnknownAction(action.to_string()))?;
		let kind = name
			.parse::<ActionKind>()
			.map_err(PayloadError::UnknownAction)?;

		if !kind.is_client_request() {
			return Err(PayloadError::ServerOnlyAction(kind));
		}
		return match kind {
			ActionKind::Session => parse_session_request(obj).map(Inbound::Action),
			_ => Ok(Inbound::Action(ActionRequest::Fixed)),
		};
	}

	if let Some(recipient) = obj.get(RECIPIENT_FIELD) {
		return parse_recipient(recipient).map(|recipient| Inbound::Unicast { recipient });
	}

	Ok(Inbound::Broadcast)
}

fn parse_recipient(value: &Value) -> Result<ParticipantId, PayloadError> {
	match value {
		Value::String(s) => s
			.parse::<ParticipantId>()
			.map_err(|e| PayloadError::MalformedRecipient(format!("{s:?}: {e}"))),
		Value::Number(n) => n
			.as_u64()
			.map(ParticipantId)
			.ok_or_else(|| PayloadError::MalformedRecipient(n.to_string())),
		other => Err(PayloadError::MalformedRecipient(other.to_string())),
	}
}

fn parse_session_request(obj: &serde_json::Map<String, Value>) -> Result<ActionRequest, PayloadError> {
	let patch = obj
		.get("patch")
		.ok_or_else(|| PayloadError::InvalidSession("missing patch".to_string()))?;
	let patch = Patch::from_value(patch).map_err(|e| PayloadError::InvalidSession(e.to_string()))?;

	let version = obj
		.get("version")
		.and_then(Value::as_u64)
		.ok_or_else(|| PayloadError::InvalidSession("missing or invalid version".to_string()))?;

	Ok(ActionRequest::Session { patch, version })
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn plain_objects_are_broadcast() {
		assert_eq!(classify(&json!({"hello": "world"})).unwrap(), Inbound::Broadcast);
	}

	#[test]
	fn recipient_switches_to_unicast() {
		assert_eq!(
			classify(&json!({"recipient": "7", "x": 1})).unwrap(),
			Inbound::Unicast {
				recipient: ParticipantId(7)
			}
		);
		assert_eq!(
			classify(&json!({"recipient": 8})).unwrap(),
			Inbound::Unicast {
				recipient: ParticipantId(8)
			}
		);
	}

	#[test]
	fn malformed_recipient_is_rejected() {
		for bad in [json!("abc"), json!(""), json!(-3), json!(null), json!({"id": 1})] {
			let err = classify(&json!({ "recipient": bad })).unwrap_err();
			assert!(matches!(err, PayloadError::MalformedRecipient(_)), "{err:?}");
		}
	}

	#[test]
	fn session_request_parses_patch_and_version() {
		let got = classify(&json!({
			"action": "SESSION",
			"patch": [{"op": "add", "path": "/a", "value": 1}],
			"version": 0
		}))
		.unwrap();
		match got {
			Inbound::Action(ActionRequest::Session { patch, version }) => {
				assert_eq!(version, 0);
				assert_eq!(patch.operations().len(), 1);
			}
			other => panic!("unexpected: {other:?}"),
		}
	}

	#[test]
	fn bad_session_request_is_a_session_failure() {
		let err = classify(&json!({"action": "SESSION", "patch": []})).unwrap_err();
		assert!(err.is_session_failure());
		let err = classify(&json!({"action": "SESSION", "patch": 5, "version": 1})).unwrap_err();
		assert!(err.is_session_failure());
	}

	#[test]
	fn action_wins_over_recipient() {
		assert_eq!(
			classify(&json!({"action": "FIXED", "recipient": "nope"})).unwrap(),
			Inbound::Action(ActionRequest::Fixed)
		);
	}

	#[test]
	fn unknown_and_server_only_actions_are_errors() {
		assert_eq!(
			classify(&json!({"action": "DANCE"})).unwrap_err(),
			PayloadError::UnknownAction("DANCE".into())
		);
		assert_eq!(
			classify(&json!({"action": "OPENED"})).unwrap_err(),
			PayloadError::ServerOnlyAction(ActionKind::Opened)
		);
		assert!(!classify(&json!({"action": 3})).unwrap_err().is_session_failure());
	}

	#[test]
	fn non_objects_are_rejected() {
		assert_eq!(classify(&json!([1, 2])).unwrap_err(), PayloadError::NotAnObject);
	}

	#[test]
	fn heartbeat_detection() {
		assert!(is_heartbeat(&json!({"heartbeat": "ping"})));
		assert!(!is_heartbeat(&json!({"beat": 1})));
		assert!(!is_heartbeat(&json!("heartbeat")));
	}
}
