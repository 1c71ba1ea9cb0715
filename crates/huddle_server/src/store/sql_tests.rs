#![forbid(unsafe_code)]

use huddle_domain::{GroupId, Username};
use tempfile::tempdir;

use crate::store::{ChatStore, JoinGroupOutcome, SqlStore};

fn user(s: &str) -> Username {
	Username::new(s).expect("valid username")
}

async fn sqlite_store(dir: &tempfile::TempDir) -> SqlStore {
	let path = dir.path().join("huddle.db");
	let url = format!("sqlite://{}?mode=rwc", path.display());
	SqlStore::connect(&url).await.expect("connect sqlite")
}

#[tokio::test]
async fn sqlite_users_and_private_history() {
	let dir = tempdir().expect("tempdir");
	let store = sqlite_store(&dir).await;
	assert_eq!(store.backend_name(), "sqlite");

	for name in ["alice", "bob", "carol"] {
		store.add_user(&user(name)).await.expect("add user");
	}
	// Adding twice is a no-op.
	store.add_user(&user("alice")).await.expect("re-add user");

	assert!(store.find_user(&user("bob")).await.unwrap().is_some());
	assert!(store.find_user(&user("mallory")).await.unwrap().is_none());

	let first = store
		.insert_private_message(&user("alice"), &user("bob"), "hi")
		.await
		.expect("insert");
	let second = store
		.insert_private_message(&user("bob"), &user("alice"), "hey")
		.await
		.expect("insert");
	store
		.insert_private_message(&user("alice"), &user("carol"), "elsewhere")
		.await
		.expect("insert");
	assert!(second.id > first.id);
	assert!(second.timestamp_ms >= first.timestamp_ms);

	let history = store
		.list_private_messages(&user("bob"), &user("alice"))
		.await
		.expect("list");
	let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
	assert_eq!(contents, vec!["hi", "hey"]);
	assert_eq!(history[0].sender, user("alice"));
	assert_eq!(history[0].recipient, user("bob"));

	let contacts = store.list_contacts(&user("alice")).await.expect("contacts");
	assert_eq!(contacts, vec![user("bob"), user("carol")]);
}

#[tokio::test]
async fn sqlite_groups_membership_and_history() {
	let dir = tempdir().expect("tempdir");
	let store = sqlite_store(&dir).await;
	for name in ["alice", "bob"] {
		store.add_user(&user(name)).await.expect("add user");
	}

	let group = store.create_group("team", &user("alice")).await.expect("create");
	assert_eq!(group.name, "team");
	assert_eq!(store.group_name(group.id).await.unwrap().as_deref(), Some("team"));
	assert!(store.group_membership(&user("alice"), group.id).await.unwrap());
	assert!(!store.group_membership(&user("bob"), group.id).await.unwrap());

	assert_eq!(
		store.join_group(&user("bob"), group.id).await.unwrap(),
		JoinGroupOutcome::Joined
	);
	assert_eq!(
		store.join_group(&user("bob"), group.id).await.unwrap(),
		JoinGroupOutcome::AlreadyMember
	);
	assert_eq!(
		store.join_group(&user("bob"), GroupId(999)).await.unwrap(),
		JoinGroupOutcome::NoSuchGroup
	);
	assert_eq!(store.group_name(GroupId(999)).await.unwrap(), None);

	let groups = store.list_groups(&user("bob")).await.expect("groups");
	assert_eq!(groups.len(), 1);
	assert_eq!(groups[0].member_count, 2);
	assert!(groups[0].joined);

	store
		.insert_group_message(&user("alice"), group.id, "standup")
		.await
		.expect("insert");
	store
		.insert_group_message(&user("bob"), group.id, "here")
		.await
		.expect("insert");

	let history = store.list_group_messages(group.id).await.expect("list");
	let senders: Vec<_> = history.iter().map(|m| m.sender.as_str()).collect();
	assert_eq!(senders, vec!["alice", "bob"]);
	assert!(history.iter().all(|m| m.group_id == group.id));
}

#[tokio::test]
async fn unsupported_scheme_is_rejected() {
	let err = SqlStore::connect("redis://localhost").await.err().expect("should fail");
	assert!(err.to_string().contains("unsupported database_url"));
}

#[tokio::test]
async fn history_follows_insert_order_even_if_the_clock_steps_back() {
	let dir = tempdir().expect("tempdir");
	let store = sqlite_store(&dir).await;
	for name in ["alice", "bob"] {
		store.add_user(&user(name)).await.expect("add user");
	}
	let team = store.create_group("team", &user("alice")).await.expect("create group").id;

	store
		.insert_private_message(&user("alice"), &user("bob"), "first")
		.await
		.expect("insert");
	store
		.insert_private_message(&user("bob"), &user("alice"), "second")
		.await
		.expect("insert");
	store.insert_group_message(&user("alice"), team, "first").await.expect("insert");
	store.insert_group_message(&user("alice"), team, "second").await.expect("insert");

	// Simulate a wall clock that jumped backwards between the two writes.
	let url = format!("sqlite://{}", dir.path().join("huddle.db").display());
	let raw = sqlx::SqlitePool::connect(&url).await.expect("raw pool");
	for table in ["private_messages", "group_messages"] {
		sqlx::query(&format!("UPDATE {table} SET created_at_ms = created_at_ms - 60000 WHERE content = 'second'"))
			.execute(&raw)
			.await
			.expect("rewind clock");
	}
	raw.close().await;

	let private = store
		.list_private_messages(&user("alice"), &user("bob"))
		.await
		.expect("list");
	let contents: Vec<_> = private.iter().map(|m| m.content.as_str()).collect();
	assert_eq!(contents, vec!["first", "second"]);

	let group = store.list_group_messages(team).await.expect("list");
	let contents: Vec<_> = group.iter().map(|m| m.content.as_str()).collect();
	assert_eq!(contents, vec!["first", "second"]);
}
