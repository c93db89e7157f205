#![forbid(unsafe_code)]

use cohort_domain::{EntityId, EntityState, ParticipantId};
use cohort_protocol::{ActionEnvelope, ActionKind, TellWhom};
use serde_json::Value;

use crate::server::store::SessionEntity;

/// Outbound envelope plus its routing directive.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionMessage {
	pub envelope: ActionEnvelope,
	pub tell: TellWhom,
}

impl ActionMessage {
	pub fn new(envelope: ActionEnvelope, tell: TellWhom) -> Self {
		Self { envelope, tell }
	}

	pub fn to_value(&self) -> Value {
		self.envelope.to_value()
	}
}

fn membership<E: SessionEntity>(
	action: ActionKind,
	entity: &E,
	channels: Vec<ParticipantId>,
	member: Option<ParticipantId>,
) -> ActionEnvelope {
	let mut env = ActionEnvelope::new(action);
	env.entity_id = Some(entity.id());
	env.member_id = member;
	env.members = Some(entity.active_members().to_vec());
	env.channels = Some(channels);
	env.state = Some(entity.state());
	env.session_version = Some(entity.session_version());
	env
}

/// Membership, channels, state and the complete session document.
pub fn full_snapshot<E: SessionEntity>(
	action: ActionKind,
	entity: &E,
	channels: Vec<ParticipantId>,
	member: Option<ParticipantId>,
	tell: TellWhom,
) -> ActionMessage {
	let mut env = membership(action, entity, channels, member);
	env.session_data = Some(entity.session_data().clone());
	ActionMessage::new(env, tell)
}

/// Same as [`full_snapshot`] without the session document.
pub fn membership_notice<E: SessionEntity>(
	action: ActionKind,
	entity: &E,
	channels: Vec<ParticipantId>,
	member: Option<ParticipantId>,
	tell: TellWhom,
) -> ActionMessage {
	ActionMessage::new(membership(action, entity, channels, member), tell)
}

/// Notice carrying only the participant it is about.
pub fn simple(action: ActionKind, member: ParticipantId, tell: TellWhom) -> ActionMessage {
	let mut env = ActionEnvelope::new(action);
	env.member_id = Some(member);
	ActionMessage::new(env, tell)
}

/// Accepted patch, fanned out to every channel including the sender.
pub fn session_update(patch: Value, version: u64) -> ActionMessage {
	let mut env = ActionEnvelope::new(ActionKind::Session);
	env.patch = Some(patch);
	env.version = Some(version);
	ActionMessage::new(env, TellWhom::All)
}

pub fn session_ack(version: u64) -> ActionMessage {
	let mut env = ActionEnvelope::new(ActionKind::SessionAck);
	env.session_version = Some(version);
	ActionMessage::new(env, TellWhom::SenderOnly)
}

pub fn session_fail(reason: impl Into<String>, current_version: Option<u64>) -> ActionMessage {
	let mut env = ActionEnvelope::new(ActionKind::SessionFail);
	env.session_version = current_version;
	env.error_message = Some(reason.into());
	ActionMessage::new(env, TellWhom::SenderOnly)
}

pub fn fixed<E: SessionEntity>(entity: &E, channels: Vec<ParticipantId>) -> ActionMessage {
	debug_assert_eq!(entity.state(), EntityState::Fixed);
	membership_notice(ActionKind::Fixed, entity, channels, None, TellWhom::All)
}

pub fn error(entity: EntityId, message: impl Into<String>) -> ActionMessage {
	let mut msg = handshake_error(message);
	msg.envelope.entity_id = Some(entity);
	msg
}

/// `ERROR` for a connection that never named its entity.
pub fn handshake_error(message: impl Into<String>) -> ActionMessage {
	let mut env = ActionEnvelope::new(ActionKind::Error);
	env.error_message = Some(message.into());
	ActionMessage::new(env, TellWhom::SenderOnly)
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::server::store::GroupRecord;

	fn group() -> GroupRecord {
		let mut g = GroupRecord::new(EntityId(42), 3).with_members([1, 2]);
		g.session_data = json!({"k": 1});
		g.session_version = 4;
		g
	}

	#[test]
	fn snapshot_carries_session_data_but_notice_does_not() {
		let g = group();
		let full = full_snapshot(
			ActionKind::Opened,
			&g,
			vec![ParticipantId(1)],
			Some(ParticipantId(1)),
			TellWhom::SenderOnly,
		);
		assert_eq!(
			full.to_value(),
			json!({
				"action": "OPENED",
				"entityId": 42,
				"memberId": 1,
				"members": [1, 2],
				"channels": [1],
				"state": "STARTED",
				"sessionData": {"k": 1},
				"sessionVersion": 4
			})
		);

		let notice = membership_notice(
			ActionKind::Opened,
			&g,
			vec![ParticipantId(1)],
			Some(ParticipantId(1)),
			TellWhom::AllButSender,
		);
		assert!(notice.to_value().get("sessionData").is_none());
		assert_eq!(notice.tell, TellWhom::AllButSender);
	}

	#[test]
	fn session_messages_route_correctly() {
		let update = session_update(json!([{"op": "add", "path": "/a", "value": 1}]), 5);
		assert_eq!(update.tell, TellWhom::All);
		assert_eq!(update.to_value()["version"], json!(5));

		let ack = session_ack(5);
		assert_eq!(ack.tell, TellWhom::SenderOnly);
		assert_eq!(ack.to_value(), json!({"action": "SESSION_ACK", "sessionVersion": 5}));

		let fail = session_fail("version mismatch", Some(5));
		assert_eq!(fail.tell, TellWhom::SenderOnly);
		assert_eq!(fail.to_value()["errorMessage"], json!("version mismatch"));
	}

	#[test]
	fn error_goes_to_sender_only_with_entity_id() {
		let e = error(EntityId(42), "unknown action: NOPE");
		assert_eq!(e.tell, TellWhom::SenderOnly);
		assert_eq!(
			e.to_value(),
			json!({"action": "ERROR", "entityId": 42, "errorMessage": "unknown action: NOPE"})
		);

		let early = handshake_error("decode Hello");
		assert_eq!(early.to_value(), json!({"action": "ERROR", "errorMessage": "decode Hello"}));
	}
}
