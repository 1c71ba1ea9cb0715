#![forbid(unsafe_code)]

use huddle_domain::{GroupId, RoomKey, RoomKind, Username};
use serde::{Deserialize, Deserializer, Serialize};

/// Client → server events. Wire shape: `{"event": "<name>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
	JoinRoom(JoinRoom),
	LeaveRoom(LeaveRoom),
	SendMessage(SendMessage),
}

impl ClientEvent {
	/// Stable event name, for logs and metrics labels.
	pub const fn name(&self) -> &'static str {
		match self {
			Self::JoinRoom(_) => "join_room",
			Self::LeaveRoom(_) => "leave_room",
			Self::SendMessage(_) => "send_message",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRoom {
	#[serde(alias = "type")]
	pub kind: RoomKind,
	/// Username for private rooms, group id for group rooms.
	#[serde(deserialize_with = "string_or_number")]
	pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveRoom {
	/// Canonical room key string, as received in `user_joined`.
	pub room: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessage {
	#[serde(alias = "type")]
	pub kind: RoomKind,
	#[serde(deserialize_with = "string_or_number")]
	pub target: String,
	#[serde(default, alias = "message")]
	pub content: String,
}

/// Server → client events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
	UpdateUserList(UserList),
	UserJoined(RoomPresence),
	UserLeft(RoomPresence),
	ReceiveMessage(DeliveredMessage),
	Error(ErrorEvent),
}

impl ServerEvent {
	pub const fn name(&self) -> &'static str {
		match self {
			Self::UpdateUserList(_) => "update_user_list",
			Self::UserJoined(_) => "user_joined",
			Self::UserLeft(_) => "user_left",
			Self::ReceiveMessage(_) => "receive_message",
			Self::Error(_) => "error",
		}
	}

	/// Scoped error without detail.
	pub fn error(message: impl Into<String>) -> Self {
		Self::Error(ErrorEvent {
			message: message.into(),
			detail: None,
		})
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserList {
	pub usernames: Vec<Username>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomPresence {
	pub username: Username,
	pub room: RoomKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredMessage {
	pub sender: Username,
	pub content: String,
	/// Server local time, `%Y-%m-%d %H:%M:%S`.
	pub timestamp: String,
	pub kind: RoomKind,
	pub room: RoomKey,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub group_name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub group_id: Option<GroupId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub detail: Option<String>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
	D: Deserializer<'de>,
{
	#[derive(Deserialize)]
	#[serde(untagged)]
	enum Raw {
		Str(String),
		Int(i64),
	}

	Ok(match Raw::deserialize(deserializer)? {
		Raw::Str(s) => s,
		Raw::Int(n) => n.to_string(),
	})
}
