#![forbid(unsafe_code)]

use std::time::Duration;

use huddle_domain::{GroupId, RoomKey, Username};
use huddle_protocol::{RoomPresence, ServerEvent, UserList};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::presence::{ConnectionHandle, PresenceError, PresenceRegistry};

fn user(s: &str) -> Username {
	Username::new(s).expect("valid username")
}

fn handle(conn_id: u64, capacity: usize) -> (ConnectionHandle, mpsc::Receiver<ServerEvent>) {
	let (tx, rx) = mpsc::channel(capacity);
	(ConnectionHandle::new(conn_id, tx), rx)
}

async fn next(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
	timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected an event within timeout")
		.expect("channel open")
}

fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
	let mut out = Vec::new();
	while let Ok(ev) = rx.try_recv() {
		out.push(ev);
	}
	out
}

fn user_list(names: &[&str]) -> ServerEvent {
	ServerEvent::UpdateUserList(UserList {
		usernames: names.iter().map(|n| user(n)).collect(),
	})
}

#[tokio::test]
async fn connect_broadcasts_sorted_user_list_to_everyone() {
	let presence = PresenceRegistry::new();
	let (h_bob, mut rx_bob) = handle(1, 16);
	let (h_alice, mut rx_alice) = handle(2, 16);

	assert!(!presence.connect(&user("bob"), h_bob));
	assert_eq!(next(&mut rx_bob).await, user_list(&["bob"]));

	presence.connect(&user("alice"), h_alice);
	assert_eq!(next(&mut rx_bob).await, user_list(&["alice", "bob"]));
	assert_eq!(next(&mut rx_alice).await, user_list(&["alice", "bob"]));

	assert_eq!(presence.online_users(), vec![user("alice"), user("bob")]);
	assert!(presence.rooms_of(&user("alice")).is_empty());
}

#[tokio::test]
async fn join_notifies_all_members_including_joiner() {
	let presence = PresenceRegistry::new();
	let (h_alice, mut rx_alice) = handle(1, 16);
	let (h_bob, mut rx_bob) = handle(2, 16);
	presence.connect(&user("alice"), h_alice);
	presence.connect(&user("bob"), h_bob);
	drain(&mut rx_alice);
	drain(&mut rx_bob);

	let room = RoomKey::private(&user("alice"), &user("bob"));
	assert_eq!(presence.join(&user("alice"), &room), Ok(true));
	let joined_alice = ServerEvent::UserJoined(RoomPresence {
		username: user("alice"),
		room: room.clone(),
	});
	assert_eq!(next(&mut rx_alice).await, joined_alice);
	assert!(drain(&mut rx_bob).is_empty(), "bob is not in the room yet");

	assert_eq!(presence.join(&user("bob"), &room), Ok(true));
	let joined_bob = ServerEvent::UserJoined(RoomPresence {
		username: user("bob"),
		room: room.clone(),
	});
	assert_eq!(next(&mut rx_alice).await, joined_bob);
	assert_eq!(next(&mut rx_bob).await, joined_bob);

	assert_eq!(presence.members_of(&room).into_iter().collect::<Vec<_>>(), vec![user("alice"), user("bob")]);
}

#[tokio::test]
async fn rejoin_is_silent() {
	let presence = PresenceRegistry::new();
	let (h, mut rx) = handle(1, 16);
	presence.connect(&user("alice"), h);
	let room = RoomKey::group(GroupId(7));

	assert_eq!(presence.join(&user("alice"), &room), Ok(true));
	drain(&mut rx);
	assert_eq!(presence.join(&user("alice"), &room), Ok(false));
	assert!(drain(&mut rx).is_empty());
	assert_eq!(presence.members_of(&room).len(), 1);
}

#[tokio::test]
async fn join_without_session_is_rejected() {
	let presence = PresenceRegistry::new();
	let room = RoomKey::group(GroupId(1));
	assert_eq!(
		presence.join(&user("ghost"), &room),
		Err(PresenceError::NotConnected(user("ghost")))
	);
	assert!(presence.members_of(&room).is_empty());
}

#[tokio::test]
async fn leave_notifies_remaining_members_only() {
	let presence = PresenceRegistry::new();
	let (h_alice, mut rx_alice) = handle(1, 16);
	let (h_bob, mut rx_bob) = handle(2, 16);
	presence.connect(&user("alice"), h_alice);
	presence.connect(&user("bob"), h_bob);
	let room = RoomKey::group(GroupId(3));
	presence.join(&user("alice"), &room).unwrap();
	presence.join(&user("bob"), &room).unwrap();
	drain(&mut rx_alice);
	drain(&mut rx_bob);

	assert!(presence.leave(&user("bob"), &room));
	assert_eq!(
		next(&mut rx_alice).await,
		ServerEvent::UserLeft(RoomPresence {
			username: user("bob"),
			room: room.clone(),
		})
	);
	assert!(drain(&mut rx_bob).is_empty());

	assert!(!presence.leave(&user("bob"), &room), "second leave is a no-op");
	assert!(drain(&mut rx_alice).is_empty());
}

#[tokio::test]
async fn disconnect_leaves_every_room_and_is_idempotent() {
	let presence = PresenceRegistry::new();
	let (h_alice, mut rx_alice) = handle(1, 16);
	let (h_bob, mut rx_bob) = handle(2, 16);
	presence.connect(&user("alice"), h_alice);
	presence.connect(&user("bob"), h_bob);
	let private = RoomKey::private(&user("alice"), &user("bob"));
	let group = RoomKey::group(GroupId(9));
	for room in [&private, &group] {
		presence.join(&user("alice"), room).unwrap();
		presence.join(&user("bob"), room).unwrap();
	}
	drain(&mut rx_alice);
	drain(&mut rx_bob);

	assert!(presence.disconnect(&user("bob"), 2));

	let events = drain(&mut rx_alice);
	let left: Vec<_> = events
		.iter()
		.filter_map(|e| match e {
			ServerEvent::UserLeft(p) => Some(p.room.clone()),
			_ => None,
		})
		.collect();
	assert_eq!(left.len(), 2);
	assert!(left.contains(&private) && left.contains(&group));
	assert_eq!(events.last(), Some(&user_list(&["alice"])));

	assert!(presence.members_of(&private).iter().all(|u| u != &user("bob")));
	assert!(presence.rooms_of(&user("bob")).is_empty());
	assert_eq!(presence.online_users(), vec![user("alice")]);

	assert!(!presence.disconnect(&user("bob"), 2));
	assert!(drain(&mut rx_alice).is_empty(), "a repeated disconnect emits nothing");
}

#[tokio::test]
async fn superseded_session_is_abandoned() {
	let presence = PresenceRegistry::new();
	let (h_old, mut rx_old) = handle(1, 16);
	let (h_carol, mut rx_carol) = handle(2, 16);
	presence.connect(&user("alice"), h_old);
	presence.connect(&user("carol"), h_carol);
	let room = RoomKey::group(GroupId(4));
	presence.join(&user("alice"), &room).unwrap();
	presence.join(&user("carol"), &room).unwrap();
	drain(&mut rx_old);
	drain(&mut rx_carol);

	let (h_new, mut rx_new) = handle(3, 16);
	assert!(presence.connect(&user("alice"), h_new));

	// The old session's rooms were left on its behalf.
	let events = drain(&mut rx_carol);
	assert!(events.contains(&ServerEvent::UserLeft(RoomPresence {
		username: user("alice"),
		room: room.clone(),
	})));
	assert!(presence.rooms_of(&user("alice")).is_empty());
	assert_eq!(next(&mut rx_new).await, user_list(&["alice", "carol"]));

	// The stale connection id no longer controls the session.
	assert!(!presence.is_current(&user("alice"), 1));
	assert!(!presence.disconnect(&user("alice"), 1));
	assert_eq!(presence.online_users(), vec![user("alice"), user("carol")]);

	// Nothing new reaches the abandoned handle.
	presence.publish_to_room(&room, &ServerEvent::error("x"));
	assert!(drain(&mut rx_old).is_empty());
}

#[tokio::test]
async fn full_queue_drops_for_that_subscriber_only() {
	let presence = PresenceRegistry::new();
	let (h_slow, mut rx_slow) = handle(1, 1);
	let (h_fast, mut rx_fast) = handle(2, 16);
	presence.connect(&user("slow"), h_slow);
	presence.connect(&user("fast"), h_fast);
	let room = RoomKey::group(GroupId(5));
	presence.join(&user("slow"), &room).unwrap();
	presence.join(&user("fast"), &room).unwrap();
	// slow's single slot is already full from the presence events above.

	let delivered = presence.publish_to_room(&room, &ServerEvent::error("hello"));
	assert_eq!(delivered, 1);
	assert!(drain(&mut rx_fast).contains(&ServerEvent::error("hello")));
	assert!(!drain(&mut rx_slow).contains(&ServerEvent::error("hello")));
}

#[tokio::test]
async fn concurrent_joins_and_disconnects_keep_indexes_consistent() {
	let presence = PresenceRegistry::new();
	let room = RoomKey::group(GroupId(1));
	let mut tasks = Vec::new();
	let mut receivers = Vec::new();

	for i in 0..32u64 {
		let (h, rx) = handle(i, 1024);
		receivers.push(rx);
		let presence = presence.clone();
		let room = room.clone();
		tasks.push(tokio::spawn(async move {
			let name = user(&format!("u{i}"));
			presence.connect(&name, h);
			presence.join(&name, &room).unwrap();
			if i % 2 == 0 {
				presence.disconnect(&name, i);
			}
		}));
	}
	for t in tasks {
		t.await.expect("task");
	}

	let online = presence.online_users();
	let members = presence.members_of(&room);
	assert_eq!(online.len(), 16);
	assert_eq!(members.len(), 16);
	assert!(members.iter().all(|m| online.contains(m)));
}
