#![forbid(unsafe_code)]

pub mod action;
pub mod framing;
pub mod hello;
pub mod inbound;
pub mod patch;

pub use action::{ActionEnvelope, ActionKind, TellWhom};
pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default, encode_frame_into,
	frame_len_from_payload_len, try_decode_frame_from_buffer,
};
pub use hello::Hello;
pub use inbound::{ActionRequest, Inbound, PayloadError, classify, is_heartbeat};
pub use patch::{Patch, PatchError, PatchOperation};

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;

	/// Compact representation useful for logs/metrics.
	pub const PROTOCOL_VERSION_U32: u32 = (PROTOCOL_MAJOR << 16) | PROTOCOL_MINOR;

	/// ALPN identifier negotiated on the QUIC transport.
	pub const ALPN: &[u8] = b"cohort-v1";
}
