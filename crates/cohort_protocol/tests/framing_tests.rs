use bytes::BytesMut;
use cohort_domain::{EntityId, EntityKind, ParticipantId};
use cohort_protocol::{
	ActionEnvelope, ActionKind, DEFAULT_MAX_FRAME_SIZE, FramingError, Hello, decode_frame, encode_frame,
	encode_frame_default, encode_frame_into, frame_len_from_payload_len, try_decode_frame_from_buffer,
};
use serde_json::{Value, json};

fn hello() -> Hello {
	Hello {
		kind: EntityKind::Group,
		entity_id: EntityId(42),
		participant_id: ParticipantId(1),
		auth_token: "t".to_string(),
		protocol_version: 1,
	}
}

#[test]
fn hello_frame_decodes_from_camel_case_json() {
	let frame = encode_frame_default(&json!({
		"kind": "group",
		"entityId": 42,
		"participantId": 1,
		"authToken": "t",
		"protocolVersion": 1
	}))
	.expect("encode");

	let (decoded, consumed) = decode_frame::<Hello>(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode");
	assert_eq!(consumed, frame.len());
	assert_eq!(decoded, hello());
}

#[test]
fn try_decode_from_buffer_incremental() {
	let mut env = ActionEnvelope::new(ActionKind::Opened);
	env.members = Some(vec![ParticipantId(1), ParticipantId(2)]);
	let frame = encode_frame_default(&env).expect("encode");

	let mut buf = BytesMut::new();

	buf.extend_from_slice(&frame[..2]);
	assert!(
		try_decode_frame_from_buffer::<ActionEnvelope>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
			.expect("ok")
			.is_none()
	);

	buf.extend_from_slice(&frame[2..8]);
	assert!(
		try_decode_frame_from_buffer::<ActionEnvelope>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
			.expect("ok")
			.is_none()
	);

	buf.extend_from_slice(&frame[8..]);
	let decoded = try_decode_frame_from_buffer::<ActionEnvelope>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
		.expect("ok")
		.expect("some");

	assert_eq!(decoded, env);
	assert!(buf.is_empty());
}

#[test]
fn encode_into_appends_and_respects_existing_data() {
	let first = json!({"n": 1});
	let second = json!({"recipient": "2", "n": 2});

	let mut buf = BytesMut::new();
	buf.extend_from_slice(b"prefix-");

	encode_frame_into(&mut buf, &first, DEFAULT_MAX_FRAME_SIZE).expect("encode first");
	encode_frame_into(&mut buf, &second, DEFAULT_MAX_FRAME_SIZE).expect("encode second");

	let total = buf.to_vec();
	let framed = &total[b"prefix-".len()..];

	let (d1, used1) = decode_frame::<Value>(framed, DEFAULT_MAX_FRAME_SIZE).expect("decode first");
	assert_eq!(d1, first);

	let (d2, used2) = decode_frame::<Value>(&framed[used1..], DEFAULT_MAX_FRAME_SIZE).expect("decode second");
	assert_eq!(d2, second);

	assert_eq!(used1 + used2, framed.len());
}

#[test]
fn frame_len_helper_is_correct() {
	let msg = json!({"hello": "world"});
	let payload_len = serde_json::to_vec(&msg).expect("json").len();
	let frame = encode_frame(&msg, DEFAULT_MAX_FRAME_SIZE).expect("encode");

	assert_eq!(frame_len_from_payload_len(payload_len), frame.len());
}

#[test]
fn decode_rejects_too_large_prefix() {
	let mut buf = BytesMut::new();
	buf.extend_from_slice(&(DEFAULT_MAX_FRAME_SIZE as u32 + 1).to_be_bytes());

	let err = try_decode_frame_from_buffer::<Value>(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
	match err {
		FramingError::FrameTooLarge { .. } => {}
		other => panic!("unexpected error: {other:?}"),
	}
}
