#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use huddle_domain::{RoomKey, Username};
use huddle_protocol::{RoomPresence, ServerEvent, UserList};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PresenceError {
	#[error("user {0} is not connected")]
	NotConnected(Username),
}

/// Outbound side of one websocket session.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
	conn_id: u64,
	tx: mpsc::Sender<ServerEvent>,
}

impl ConnectionHandle {
	pub fn new(conn_id: u64, tx: mpsc::Sender<ServerEvent>) -> Self {
		Self { conn_id, tx }
	}

	pub fn conn_id(&self) -> u64 {
		self.conn_id
	}

	/// Enqueue without blocking. A full queue drops the event for this subscriber only.
	fn deliver(&self, event: &ServerEvent) -> bool {
		match self.tx.try_send(event.clone()) {
			Ok(()) => {
				metrics::counter!("huddle_server_deliveries_total", "event" => event.name()).increment(1);
				true
			}
			Err(mpsc::error::TrySendError::Full(_)) => {
				metrics::counter!("huddle_server_presence_dropped_total", "event" => event.name()).increment(1);
				debug!(conn_id = self.conn_id, event = event.name(), "presence: dropped due to full queue");
				false
			}
			Err(mpsc::error::TrySendError::Closed(_)) => false,
		}
	}
}

/// Who is online and which rooms each session has joined.
///
/// Every operation runs under a single lock that is never held across an `.await`, so
/// readers never observe a user in a room's member set who is absent from the online map.
#[derive(Debug, Clone, Default)]
pub struct PresenceRegistry {
	inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
	sessions: HashMap<Username, Session>,
	room_members: HashMap<RoomKey, BTreeSet<Username>>,
}

#[derive(Debug)]
struct Session {
	handle: ConnectionHandle,
	rooms: BTreeSet<RoomKey>,
}

impl Inner {
	fn publish_user_list(&self) {
		let mut usernames: Vec<Username> = self.sessions.keys().cloned().collect();
		usernames.sort();
		let event = ServerEvent::UpdateUserList(UserList { usernames });
		for session in self.sessions.values() {
			session.handle.deliver(&event);
		}
	}

	fn publish(&self, room: &RoomKey, event: &ServerEvent) -> usize {
		let Some(members) = self.room_members.get(room) else {
			return 0;
		};
		members
			.iter()
			.filter_map(|user| self.sessions.get(user))
			.filter(|session| session.handle.deliver(event))
			.count()
	}

	/// Drop `user` from `room`'s member set and tell whoever remains.
	fn remove_member(&mut self, user: &Username, room: &RoomKey) {
		if let Some(members) = self.room_members.get_mut(room) {
			members.remove(user);
			if members.is_empty() {
				self.room_members.remove(room);
				return;
			}
		}
		let event = ServerEvent::UserLeft(RoomPresence {
			username: user.clone(),
			room: room.clone(),
		});
		self.publish(room, &event);
	}

	fn leave_all(&mut self, user: &Username, rooms: BTreeSet<RoomKey>) {
		for room in rooms {
			self.remove_member(user, &room);
		}
	}
}

impl PresenceRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register `user` as online. Returns `true` when an older session was superseded.
	pub fn connect(&self, user: &Username, handle: ConnectionHandle) -> bool {
		let mut inner = self.inner.lock();
		let conn_id = handle.conn_id();

		let previous = inner.sessions.remove(user);
		let superseded = previous.is_some();
		if let Some(old) = previous {
			debug!(
				user = %user,
				old_conn_id = old.handle.conn_id(),
				conn_id,
				"presence: superseding previous session"
			);
			inner.leave_all(user, old.rooms);
		}

		inner.sessions.insert(
			user.clone(),
			Session {
				handle,
				rooms: BTreeSet::new(),
			},
		);
		inner.publish_user_list();
		superseded
	}

	/// Remove `user` if `conn_id` is still its active session. Returns `false` for a no-op.
	pub fn disconnect(&self, user: &Username, conn_id: u64) -> bool {
		let mut inner = self.inner.lock();

		match inner.sessions.get(user) {
			Some(session) if session.handle.conn_id() == conn_id => {}
			_ => return false,
		}
		let Some(session) = inner.sessions.remove(user) else {
			return false;
		};

		inner.leave_all(user, session.rooms);
		inner.publish_user_list();
		true
	}

	/// Subscribe `user` to `room`. Returns `false` when already joined.
	pub fn join(&self, user: &Username, room: &RoomKey) -> Result<bool, PresenceError> {
		let mut inner = self.inner.lock();

		let session = inner
			.sessions
			.get_mut(user)
			.ok_or_else(|| PresenceError::NotConnected(user.clone()))?;
		if !session.rooms.insert(room.clone()) {
			return Ok(false);
		}
		inner.room_members.entry(room.clone()).or_default().insert(user.clone());

		let event = ServerEvent::UserJoined(RoomPresence {
			username: user.clone(),
			room: room.clone(),
		});
		inner.publish(room, &event);
		Ok(true)
	}

	/// Unsubscribe `user` from `room`. Returns `false` when not a member.
	pub fn leave(&self, user: &Username, room: &RoomKey) -> bool {
		let mut inner = self.inner.lock();

		let removed = inner
			.sessions
			.get_mut(user)
			.map(|session| session.rooms.remove(room))
			.unwrap_or(false);
		if removed {
			inner.remove_member(user, room);
		}
		removed
	}

	pub fn members_of(&self, room: &RoomKey) -> BTreeSet<Username> {
		self.inner.lock().room_members.get(room).cloned().unwrap_or_default()
	}

	/// Online usernames, sorted.
	pub fn online_users(&self) -> Vec<Username> {
		let mut users: Vec<Username> = self.inner.lock().sessions.keys().cloned().collect();
		users.sort();
		users
	}

	pub fn rooms_of(&self, user: &Username) -> BTreeSet<RoomKey> {
		self.inner
			.lock()
			.sessions
			.get(user)
			.map(|s| s.rooms.clone())
			.unwrap_or_default()
	}

	pub fn is_online(&self, user: &Username) -> bool {
		self.inner.lock().sessions.contains_key(user)
	}

	/// Whether `conn_id` is the active session for `user`.
	pub fn is_current(&self, user: &Username, conn_id: u64) -> bool {
		self.inner
			.lock()
			.sessions
			.get(user)
			.is_some_and(|s| s.handle.conn_id() == conn_id)
	}

	/// Deliver to every current member of `room`. Returns how many queues accepted it.
	pub fn publish_to_room(&self, room: &RoomKey, event: &ServerEvent) -> usize {
		self.inner.lock().publish(room, event)
	}
}
