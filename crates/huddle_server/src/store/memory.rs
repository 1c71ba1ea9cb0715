#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use huddle_domain::{Group, GroupId, GroupMessage, GroupSummary, PrivateMessage, StoredMessage, User, Username};
use parking_lot::Mutex;

use crate::store::{ChatStore, JoinGroupOutcome, StoreError};
use crate::util::time::unix_ms_now;

/// Process-local store used for development and tests.
///
/// Writes can be made to fail or to stall, which the router tests use to exercise the
/// persistence-failure and ordering paths.
#[derive(Debug, Default)]
pub struct InMemoryStore {
	inner: Mutex<Inner>,
	fail_writes: AtomicBool,
	write_delay: Mutex<Option<Duration>>,
	commit_jitter: Mutex<Option<Duration>>,
}

#[derive(Debug, Default)]
struct Inner {
	users: BTreeSet<Username>,
	groups: BTreeMap<GroupId, Group>,
	members: HashSet<(GroupId, Username)>,
	private_messages: Vec<PrivateMessage>,
	group_messages: Vec<GroupMessage>,
	next_group_id: i64,
	next_message_id: i64,
	last_timestamp_ms: i64,
}

impl Inner {
	fn next_message(&mut self) -> StoredMessage {
		self.next_message_id += 1;
		let timestamp_ms = unix_ms_now().max(self.last_timestamp_ms);
		self.last_timestamp_ms = timestamp_ms;
		StoredMessage {
			id: self.next_message_id,
			timestamp_ms,
		}
	}

	fn insert_group(&mut self, name: &str, creator: &Username) -> Group {
		self.next_group_id += 1;
		let group = Group {
			id: GroupId(self.next_group_id),
			name: name.to_string(),
			created_by: creator.clone(),
		};
		self.groups.insert(group.id, group.clone());
		self.members.insert((group.id, creator.clone()));
		group
	}
}

impl InMemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_user(&self, user: Username) {
		self.inner.lock().users.insert(user);
	}

	/// Create a group directly (creator is added as a member).
	#[cfg(test)]
	pub fn add_group(&self, name: &str, creator: &Username) -> GroupId {
		self.inner.lock().insert_group(name, creator).id
	}

	#[cfg(test)]
	pub fn add_member(&self, group: GroupId, user: &Username) {
		self.inner.lock().members.insert((group, user.clone()));
	}

	/// Make every subsequent write fail with `StoreError::Unavailable`.
	#[cfg(test)]
	pub fn set_fail_writes(&self, fail: bool) {
		self.fail_writes.store(fail, Ordering::SeqCst);
	}

	/// Stall every subsequent write for `delay` before it commits.
	#[cfg(test)]
	pub fn set_write_delay(&self, delay: Option<Duration>) {
		*self.write_delay.lock() = delay;
	}

	/// Stall each write after its id is assigned, for up to `max`. Consecutive ids get
	/// decreasing stalls, so unsequenced writers finish out of id order.
	#[cfg(test)]
	pub fn set_commit_jitter(&self, max: Option<Duration>) {
		*self.commit_jitter.lock() = max;
	}

	#[cfg(test)]
	pub fn private_message_count(&self) -> usize {
		self.inner.lock().private_messages.len()
	}

	#[cfg(test)]
	pub fn group_message_count(&self) -> usize {
		self.inner.lock().group_messages.len()
	}

	async fn before_write(&self) -> Result<(), StoreError> {
		let delay = *self.write_delay.lock();
		if let Some(delay) = delay {
			tokio::time::sleep(delay).await;
		}
		if self.fail_writes.load(Ordering::SeqCst) {
			return Err(StoreError::Unavailable("writes disabled".to_string()));
		}
		Ok(())
	}

	async fn after_commit(&self, id: i64) {
		let jitter = *self.commit_jitter.lock();
		if let Some(max) = jitter {
			let steps = (4 - id.rem_euclid(5)) as u32;
			tokio::time::sleep(max * steps / 4).await;
		}
	}
}

#[async_trait::async_trait]
impl ChatStore for InMemoryStore {
	async fn find_user(&self, username: &Username) -> Result<Option<User>, StoreError> {
		let inner = self.inner.lock();
		Ok(inner.users.get(username).map(|u| User { username: u.clone() }))
	}

	async fn group_membership(&self, username: &Username, group: GroupId) -> Result<bool, StoreError> {
		let inner = self.inner.lock();
		Ok(inner.members.contains(&(group, username.clone())))
	}

	async fn group_name(&self, group: GroupId) -> Result<Option<String>, StoreError> {
		let inner = self.inner.lock();
		Ok(inner.groups.get(&group).map(|g| g.name.clone()))
	}

	async fn insert_private_message(
		&self,
		sender: &Username,
		recipient: &Username,
		content: &str,
	) -> Result<StoredMessage, StoreError> {
		self.before_write().await?;

		let stored = {
			let mut inner = self.inner.lock();
			let stored = inner.next_message();
			inner.private_messages.push(PrivateMessage {
				id: stored.id,
				sender: sender.clone(),
				recipient: recipient.clone(),
				content: content.to_string(),
				timestamp_ms: stored.timestamp_ms,
			});
			stored
		};
		self.after_commit(stored.id).await;
		Ok(stored)
	}

	async fn insert_group_message(
		&self,
		sender: &Username,
		group: GroupId,
		content: &str,
	) -> Result<StoredMessage, StoreError> {
		self.before_write().await?;

		let stored = {
			let mut inner = self.inner.lock();
			let stored = inner.next_message();
			inner.group_messages.push(GroupMessage {
				id: stored.id,
				group_id: group,
				sender: sender.clone(),
				content: content.to_string(),
				timestamp_ms: stored.timestamp_ms,
			});
			stored
		};
		self.after_commit(stored.id).await;
		Ok(stored)
	}

	async fn list_private_messages(&self, a: &Username, b: &Username) -> Result<Vec<PrivateMessage>, StoreError> {
		let inner = self.inner.lock();
		Ok(inner
			.private_messages
			.iter()
			.filter(|m| (&m.sender == a && &m.recipient == b) || (&m.sender == b && &m.recipient == a))
			.cloned()
			.collect())
	}

	async fn list_group_messages(&self, group: GroupId) -> Result<Vec<GroupMessage>, StoreError> {
		let inner = self.inner.lock();
		Ok(inner.group_messages.iter().filter(|m| m.group_id == group).cloned().collect())
	}

	async fn list_contacts(&self, username: &Username) -> Result<Vec<Username>, StoreError> {
		let inner = self.inner.lock();
		Ok(inner.users.iter().filter(|u| *u != username).cloned().collect())
	}

	async fn list_groups(&self, viewer: &Username) -> Result<Vec<GroupSummary>, StoreError> {
		let inner = self.inner.lock();
		Ok(inner
			.groups
			.values()
			.map(|g| GroupSummary {
				id: g.id,
				name: g.name.clone(),
				created_by: g.created_by.clone(),
				member_count: inner.members.iter().filter(|(gid, _)| *gid == g.id).count() as u64,
				joined: inner.members.contains(&(g.id, viewer.clone())),
			})
			.collect())
	}

	async fn create_group(&self, name: &str, creator: &Username) -> Result<Group, StoreError> {
		self.before_write().await?;
		Ok(self.inner.lock().insert_group(name, creator))
	}

	async fn join_group(&self, username: &Username, group: GroupId) -> Result<JoinGroupOutcome, StoreError> {
		self.before_write().await?;

		let mut inner = self.inner.lock();
		if !inner.groups.contains_key(&group) {
			return Ok(JoinGroupOutcome::NoSuchGroup);
		}
		if inner.members.insert((group, username.clone())) {
			Ok(JoinGroupOutcome::Joined)
		} else {
			Ok(JoinGroupOutcome::AlreadyMember)
		}
	}
}
