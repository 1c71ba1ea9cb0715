#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use huddle_domain::{ParseIdError, RoomKey, RoomKind, Username};
use huddle_protocol::{DEFAULT_MAX_FRAME_SIZE, DeliveredMessage, ErrorEvent, ProtocolError, ServerEvent, encode_event};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::server::gate::{Decision, DenyReason, authorize};
use crate::server::presence::{PresenceError, PresenceRegistry};
use crate::store::{ChatStore, StoreError};
use crate::util::time::{format_timestamp, unix_ms_now};

type Sequencers = Mutex<HashMap<RoomKey, Arc<tokio::sync::Mutex<()>>>>;

#[derive(Debug, Error)]
pub enum RouteError {
	#[error("invalid room target: {0}")]
	InvalidTarget(ParseIdError),

	#[error("not authorized: {0}")]
	Unauthorized(DenyReason),

	#[error("group not found")]
	NotFound,

	#[error("message too large: {0}")]
	TooLarge(ProtocolError),

	#[error("persistence failed: {0}")]
	Persistence(#[from] StoreError),

	#[error("presence invariant violated: {0}")]
	Presence(#[from] PresenceError),
}

impl RouteError {
	fn metric_label(&self) -> &'static str {
		match self {
			Self::InvalidTarget(_) => "invalid_target",
			Self::Unauthorized(_) => "unauthorized",
			Self::NotFound => "not_found",
			Self::TooLarge(_) => "too_large",
			Self::Persistence(_) => "persistence",
			Self::Presence(_) => "presence",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
	/// Blank content; nothing persisted, nothing sent.
	Dropped,
	Delivered {
		room: RoomKey,
		message_id: i64,
		recipients: usize,
	},
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
	/// Include low-level error text in client-facing errors.
	pub expose_error_detail: bool,
	/// Largest `receive_message` frame a send may produce.
	pub max_frame_bytes: usize,
}

impl Default for RouterConfig {
	fn default() -> Self {
		Self {
			expose_error_detail: false,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

/// Validates, persists and fans out room messages; also owns join/leave.
pub struct MessageRouter {
	store: Arc<dyn ChatStore>,
	presence: PresenceRegistry,
	cfg: RouterConfig,
	sequencers: Sequencers,
}

impl MessageRouter {
	pub fn new(store: Arc<dyn ChatStore>, presence: PresenceRegistry, cfg: RouterConfig) -> Self {
		Self {
			store,
			presence,
			cfg,
			sequencers: Mutex::new(HashMap::new()),
		}
	}

	pub fn presence(&self) -> &PresenceRegistry {
		&self.presence
	}

	pub fn store(&self) -> &Arc<dyn ChatStore> {
		&self.store
	}

	async fn authorized(&self, user: &Username, room: &RoomKey) -> Result<(), RouteError> {
		match authorize(self.store.as_ref(), user, room).await? {
			Decision::Allowed => Ok(()),
			Decision::Denied(reason) => {
				metrics::counter!("huddle_server_send_denied_total", "reason" => deny_label(reason)).increment(1);
				Err(RouteError::Unauthorized(reason))
			}
		}
	}

	/// Authorize and subscribe `user` to the room named by `(kind, target)`.
	pub async fn join_room(&self, user: &Username, kind: RoomKind, target: &str) -> Result<RoomKey, RouteError> {
		let room = RoomKey::for_target(kind, user, target).map_err(RouteError::InvalidTarget)?;
		self.authorized(user, &room).await?;

		if self.presence.join(user, &room)? {
			debug!(user = %user, room = %room, "joined room");
		}
		Ok(room)
	}

	/// Unsubscribe from a room given its canonical string. Unknown or malformed keys are a no-op.
	pub fn leave_room(&self, user: &Username, room: &str) -> bool {
		let room = match RoomKey::parse(room) {
			Ok(room) => room,
			Err(e) => {
				debug!(user = %user, room, error = %e, "leave_room: ignoring malformed room key");
				return false;
			}
		};
		let left = self.presence.leave(user, &room);
		if left {
			debug!(user = %user, room = %room, "left room");
		}
		left
	}

	/// Route one chat message: validate, authorize, persist, then broadcast.
	pub async fn send_message(
		&self,
		sender: &Username,
		kind: RoomKind,
		target: &str,
		raw: &str,
	) -> Result<SendOutcome, RouteError> {
		let content = raw.trim();
		if content.is_empty() {
			return Ok(SendOutcome::Dropped);
		}

		let room = RoomKey::for_target(kind, sender, target).map_err(RouteError::InvalidTarget)?;
		self.authorized(sender, &room).await?;

		let group_name = match room.group_id() {
			Some(group) => Some(self.store.group_name(group).await?.ok_or(RouteError::NotFound)?),
			None => None,
		};

		if !self.presence.is_online(sender) {
			let err = PresenceError::NotConnected(sender.clone());
			error!(user = %sender, room = %room, error = %err, "send from a user without a session");
			return Err(err.into());
		}

		// Refuse before persisting a message whose delivery frame could never be sent.
		let envelope = delivered_event(sender, &room, content, format_timestamp(unix_ms_now()), group_name.clone());
		encode_event(&envelope, self.cfg.max_frame_bytes).map_err(RouteError::TooLarge)?;

		let lease = SequencerLease::acquire(&self.sequencers, &room);
		let _turn = lease.sequencer.lock().await;
		self.persist_and_broadcast(sender, &room, content, group_name).await
	}

	async fn persist_and_broadcast(
		&self,
		sender: &Username,
		room: &RoomKey,
		content: &str,
		group_name: Option<String>,
	) -> Result<SendOutcome, RouteError> {
		let stored = match room {
			RoomKey::Private { .. } => {
				let recipient = room
					.counterpart(sender)
					.ok_or(RouteError::Unauthorized(DenyReason::NotParticipant))?;
				self.store.insert_private_message(sender, recipient, content).await
			}
			RoomKey::Group(group) => self.store.insert_group_message(sender, *group, content).await,
		};
		let stored = stored.inspect_err(|e| {
			metrics::counter!("huddle_server_persist_failures_total").increment(1);
			warn!(user = %sender, room = %room, error = %e, "failed to persist message");
		})?;
		metrics::counter!("huddle_server_messages_persisted_total", "kind" => room.kind().as_str()).increment(1);

		let event = delivered_event(sender, room, content, format_timestamp(stored.timestamp_ms), group_name);
		let recipients = self.presence.publish_to_room(room, &event);

		debug!(
			user = %sender,
			room = %room,
			message_id = stored.id,
			recipients,
			"message routed"
		);

		Ok(SendOutcome::Delivered {
			room: room.clone(),
			message_id: stored.id,
			recipients,
		})
	}

	#[cfg(test)]
	pub(crate) fn active_sequencers(&self) -> usize {
		self.sequencers.lock().len()
	}

	/// Scoped `error` event whose detail is shown only when detail exposure is enabled.
	pub fn scoped_error(&self, message: &str, detail: &dyn fmt::Display) -> ServerEvent {
		ServerEvent::Error(ErrorEvent {
			message: message.to_string(),
			detail: self.cfg.expose_error_detail.then(|| detail.to_string()),
		})
	}

	/// Client-facing `error` event for a failed action.
	pub fn to_client_error(&self, err: &RouteError, action_failed: &str) -> ServerEvent {
		metrics::counter!("huddle_server_route_errors_total", "error" => err.metric_label()).increment(1);

		let (message, detail) = match err {
			RouteError::InvalidTarget(e) => ("Invalid room target".to_string(), Some(e.to_string())),
			RouteError::Unauthorized(reason) => (format!("Not authorized: {reason}"), None),
			RouteError::NotFound => ("Group not found".to_string(), None),
			RouteError::TooLarge(e) => ("Message too large".to_string(), Some(e.to_string())),
			RouteError::Persistence(e) => (action_failed.to_string(), Some(e.to_string())),
			RouteError::Presence(e) => (action_failed.to_string(), Some(e.to_string())),
		};

		ServerEvent::Error(ErrorEvent {
			message,
			detail: detail.filter(|_| self.cfg.expose_error_detail),
		})
	}
}

fn delivered_event(
	sender: &Username,
	room: &RoomKey,
	content: &str,
	timestamp: String,
	group_name: Option<String>,
) -> ServerEvent {
	ServerEvent::ReceiveMessage(DeliveredMessage {
		sender: sender.clone(),
		content: content.to_string(),
		timestamp,
		kind: room.kind(),
		room: room.clone(),
		group_name,
		group_id: room.group_id(),
	})
}

/// A claim on a room's sequencer. Dropping it, including when the send future is cancelled,
/// reclaims the map entry once no other send holds or waits on it.
struct SequencerLease<'a> {
	sequencers: &'a Sequencers,
	room: RoomKey,
	sequencer: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> SequencerLease<'a> {
	fn acquire(sequencers: &'a Sequencers, room: &RoomKey) -> Self {
		let sequencer = sequencers.lock().entry(room.clone()).or_default().clone();
		Self {
			sequencers,
			room: room.clone(),
			sequencer,
		}
	}
}

impl Drop for SequencerLease<'_> {
	fn drop(&mut self) {
		let mut map = self.sequencers.lock();
		// Release ours under the map lock so concurrent leases agree on the count.
		drop(std::mem::take(&mut self.sequencer));
		if let Some(entry) = map.get(&self.room)
			&& Arc::strong_count(entry) == 1
		{
			map.remove(&self.room);
		}
	}
}

fn deny_label(reason: DenyReason) -> &'static str {
	match reason {
		DenyReason::NotParticipant => "not_participant",
		DenyReason::SelfConversation => "self_conversation",
		DenyReason::UnknownUser => "unknown_user",
		DenyReason::NotGroupMember => "not_group_member",
	}
}
