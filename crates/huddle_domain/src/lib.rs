#![forbid(unsafe_code)]

pub mod room;

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use room::{RoomKey, escape_component, unescape_component};

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown room kind: {0}")]
	UnknownKind(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Unique account name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
	/// Create a non-empty `Username`. Surrounding whitespace is trimmed.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		let trimmed = name.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if trimmed.len() == name.len() {
			Ok(Self(name))
		} else {
			Ok(Self(trimmed.to_string()))
		}
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for Username {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Username {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Username::new(s.to_string())
	}
}

impl AsRef<str> for Username {
	fn as_ref(&self) -> &str {
		&self.0
	}
}

/// Store-assigned group identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub i64);

impl GroupId {
	pub const fn get(self) -> i64 {
		self.0
	}
}

impl fmt::Display for GroupId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for GroupId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		s.parse::<i64>()
			.map(GroupId)
			.map_err(|_| ParseIdError::InvalidFormat(format!("expected numeric group id, got {s:?}")))
	}
}

/// Room namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
	Private,
	Group,
}

impl RoomKind {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			RoomKind::Private => "private",
			RoomKind::Group => "group",
		}
	}
}

impl fmt::Display for RoomKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for RoomKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"private" => Ok(RoomKind::Private),
			"group" => Ok(RoomKind::Group),
			other => Err(ParseIdError::UnknownKind(other.to_string())),
		}
	}
}

/// Registered account as seen by the routing core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
	pub username: Username,
}

/// Chat group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
	pub id: GroupId,
	pub name: String,
	pub created_by: Username,
}

/// Group listing row for a particular viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSummary {
	pub id: GroupId,
	pub name: String,
	pub created_by: Username,
	pub member_count: u64,
	/// Whether the viewer is a member.
	pub joined: bool,
}

/// Result of a persisted insert: the store sequence number and server timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
	pub id: i64,
	/// Unix time in milliseconds assigned by the server.
	pub timestamp_ms: i64,
}

/// Persisted private message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateMessage {
	pub id: i64,
	pub sender: Username,
	pub recipient: Username,
	pub content: String,
	pub timestamp_ms: i64,
}

/// Persisted group message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessage {
	pub id: i64,
	pub group_id: GroupId,
	pub sender: Username,
	pub content: String,
	pub timestamp_ms: i64,
}
