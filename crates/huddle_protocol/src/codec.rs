#![forbid(unsafe_code)]

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::events::ClientEvent;

/// Default maximum text frame size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024; // 64 KiB

#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

/// Encode an event into a JSON text frame.
pub fn encode_event<E: Serialize>(event: &E, max_frame_size: usize) -> Result<String, ProtocolError> {
	let text = serde_json::to_string(event)?;
	if text.len() > max_frame_size {
		return Err(ProtocolError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}
	Ok(text)
}

/// Decode a JSON text frame into an event.
pub fn decode_event<E: DeserializeOwned>(text: &str, max_frame_size: usize) -> Result<E, ProtocolError> {
	if text.len() > max_frame_size {
		return Err(ProtocolError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}
	Ok(serde_json::from_str(text)?)
}

/// Decode a client event frame.
#[inline]
pub fn decode_client_event(text: &str, max_frame_size: usize) -> Result<ClientEvent, ProtocolError> {
	decode_event(text, max_frame_size)
}
