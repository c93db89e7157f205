#![forbid(unsafe_code)]

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Default maximum frame payload size for v1.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024; // 1 MiB

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

/// Encode a JSON message into a length-prefixed frame.
pub fn encode_frame<T: Serialize + ?Sized>(msg: &T, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let payload = serde_json::to_vec(msg)?;
	if payload.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload.len(),
			max: max_frame_size,
		});
	}

	let mut out = Vec::with_capacity(frame_len_from_payload_len(payload.len()));
	out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
	out.extend_from_slice(&payload);
	Ok(out)
}

/// Encode a frame using `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode_frame_default<T: Serialize + ?Sized>(msg: &T) -> Result<Vec<u8>, FramingError> {
	encode_frame(msg, DEFAULT_MAX_FRAME_SIZE)
}

/// Append an encoded frame into the provided buffer.
pub fn encode_frame_into<T: Serialize + ?Sized>(
	buf: &mut BytesMut,
	msg: &T,
	max_frame_size: usize,
) -> Result<(), FramingError> {
	let payload = serde_json::to_vec(msg)?;
	if payload.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload.len(),
			max: max_frame_size,
		});
	}

	buf.reserve(frame_len_from_payload_len(payload.len()));
	buf.put_u32(payload.len() as u32);
	buf.put_slice(&payload);
	Ok(())
}

/// Compute total frame length (prefix + payload).
#[inline]
pub fn frame_len_from_payload_len(payload_len: usize) -> usize {
	4 + payload_len
}

fn read_len_prefix(src: &[u8], max_frame_size: usize) -> Result<Option<usize>, FramingError> {
	if src.len() < 4 {
		return Ok(None);
	}

	let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}

	Ok(Some(len))
}

/// Decode a single frame from the start of `src`.
pub fn decode_frame<T: DeserializeOwned>(src: &[u8], max_frame_size: usize) -> Result<(T, usize), FramingError> {
	let Some(len) = read_len_prefix(src, max_frame_size)? else {
		return Err(FramingError::InsufficientData {
			need: 4,
			have: src.len(),
		});
	};

	let need = frame_len_from_payload_len(len);
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	let msg = serde_json::from_slice(&src[4..need])?;
	Ok((msg, need))
}

/// Try to decode a single frame from a growable buffer.
pub fn try_decode_frame_from_buffer<T: DeserializeOwned>(
	buf: &mut BytesMut,
	max_frame_size: usize,
) -> Result<Option<T>, FramingError> {
	let Some(len) = read_len_prefix(&buf[..], max_frame_size)? else {
		return Ok(None);
	};

	let need = frame_len_from_payload_len(len);
	if buf.len() < need {
		return Ok(None);
	}

	let frame = buf.split_to(need);
	let msg = serde_json::from_slice(&frame[4..])?;
	Ok(Some(msg))
}
