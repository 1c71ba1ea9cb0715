#![forbid(unsafe_code)]

pub mod memory;
pub mod sql;

#[cfg(test)]
mod sql_tests;

use std::sync::Arc;

use anyhow::Context;
use huddle_domain::{Group, GroupId, GroupMessage, GroupSummary, PrivateMessage, StoredMessage, User, Username};
use thiserror::Error;
use tracing::{info, warn};

pub use memory::InMemoryStore;
pub use sql::SqlStore;

/// Persistence failures. Never shown verbatim to clients unless detail exposure is enabled.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("store unavailable: {0}")]
	Unavailable(String),

	#[error("stored data is invalid: {0}")]
	Integrity(String),
}

/// Outcome of an append-only group join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinGroupOutcome {
	Joined,
	AlreadyMember,
	NoSuchGroup,
}

/// Relational store consumed by the routing core and the history API.
#[async_trait::async_trait]
pub trait ChatStore: Send + Sync {
	async fn find_user(&self, username: &Username) -> Result<Option<User>, StoreError>;

	async fn group_membership(&self, username: &Username, group: GroupId) -> Result<bool, StoreError>;

	async fn group_name(&self, group: GroupId) -> Result<Option<String>, StoreError>;

	/// Insert a private message and return its sequence id and server timestamp. Atomic.
	async fn insert_private_message(
		&self,
		sender: &Username,
		recipient: &Username,
		content: &str,
	) -> Result<StoredMessage, StoreError>;

	/// Insert a group message and return its sequence id and server timestamp. Atomic.
	async fn insert_group_message(
		&self,
		sender: &Username,
		group: GroupId,
		content: &str,
	) -> Result<StoredMessage, StoreError>;

	/// Conversation between two users, oldest first.
	async fn list_private_messages(&self, a: &Username, b: &Username) -> Result<Vec<PrivateMessage>, StoreError>;

	/// Group history, oldest first.
	async fn list_group_messages(&self, group: GroupId) -> Result<Vec<GroupMessage>, StoreError>;

	/// Every other registered user, by name.
	async fn list_contacts(&self, username: &Username) -> Result<Vec<Username>, StoreError>;

	/// All groups with member counts, flagged with the viewer's membership.
	async fn list_groups(&self, viewer: &Username) -> Result<Vec<GroupSummary>, StoreError>;

	/// Create a group; the creator becomes its first member in the same transaction.
	async fn create_group(&self, name: &str, creator: &Username) -> Result<Group, StoreError>;

	async fn join_group(&self, username: &Username, group: GroupId) -> Result<JoinGroupOutcome, StoreError>;
}

/// Open the configured store, or an in-memory one when no database is configured.
pub async fn connect(database_url: Option<&str>, seed_users: &[String]) -> anyhow::Result<Arc<dyn ChatStore>> {
	match database_url {
		Some(url) => {
			let store = SqlStore::connect(url).await?;
			info!(backend = store.backend_name(), "connected chat store");
			for user in parse_seed_users(seed_users) {
				store
					.add_user(&user)
					.await
					.with_context(|| format!("seed user {user}"))?;
			}
			Ok(Arc::new(store))
		}
		None => {
			warn!("no database_url configured; using in-memory chat store (history is lost on restart)");
			let store = InMemoryStore::new();
			for user in parse_seed_users(seed_users) {
				store.add_user(user);
			}
			Ok(Arc::new(store))
		}
	}
}

fn parse_seed_users(names: &[String]) -> Vec<Username> {
	names
		.iter()
		.filter_map(|name| match Username::new(name.clone()) {
			Ok(user) => Some(user),
			Err(e) => {
				warn!(error = %e, name = %name, "skipping invalid seed user");
				None
			}
		})
		.collect()
}

pub(crate) fn username_from_row(raw: String) -> Result<Username, StoreError> {
	Username::new(raw).map_err(|e| StoreError::Integrity(format!("username: {e}")))
}
