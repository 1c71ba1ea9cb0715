#![forbid(unsafe_code)]

pub mod codec;
pub mod events;

pub use codec::{DEFAULT_MAX_FRAME_SIZE, ProtocolError, decode_client_event, decode_event, encode_event};
pub use events::{
	ClientEvent, DeliveredMessage, ErrorEvent, JoinRoom, LeaveRoom, RoomPresence, SendMessage, ServerEvent, UserList,
};
