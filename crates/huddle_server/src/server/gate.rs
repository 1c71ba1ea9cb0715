#![forbid(unsafe_code)]

use std::fmt;

use huddle_domain::{RoomKey, Username};

use crate::store::{ChatStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
	Allowed,
	Denied(DenyReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
	/// The user is not one of the two private participants.
	NotParticipant,
	/// Private rooms need two distinct users.
	SelfConversation,
	/// The private counterpart is not a registered user.
	UnknownUser,
	/// The user is not in the group's membership relation (or the group does not exist).
	NotGroupMember,
}

impl fmt::Display for DenyReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::NotParticipant => "not a participant of this conversation",
			Self::SelfConversation => "cannot open a private conversation with yourself",
			Self::UnknownUser => "no such user",
			Self::NotGroupMember => "not a member of this group",
		})
	}
}

/// Decide whether `user` may join or send into `room`. Never mutates state.
pub async fn authorize(store: &dyn ChatStore, user: &Username, room: &RoomKey) -> Result<Decision, StoreError> {
	match room {
		RoomKey::Private { low, high } => {
			if low == high {
				return Ok(Decision::Denied(DenyReason::SelfConversation));
			}
			let Some(other) = room.counterpart(user) else {
				return Ok(Decision::Denied(DenyReason::NotParticipant));
			};
			if store.find_user(other).await?.is_none() {
				return Ok(Decision::Denied(DenyReason::UnknownUser));
			}
			Ok(Decision::Allowed)
		}
		RoomKey::Group(group) => {
			if store.group_membership(user, *group).await? {
				Ok(Decision::Allowed)
			} else {
				Ok(Decision::Denied(DenyReason::NotGroupMember))
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use huddle_domain::GroupId;

	use super::*;
	use crate::store::InMemoryStore;

	fn user(s: &str) -> Username {
		Username::new(s).expect("valid username")
	}

	fn store() -> InMemoryStore {
		let store = InMemoryStore::new();
		for name in ["alice", "bob", "carol"] {
			store.add_user(user(name));
		}
		store
	}

	#[tokio::test]
	async fn private_rooms_between_registered_users_are_allowed() {
		let store = store();
		let room = RoomKey::private(&user("alice"), &user("bob"));
		assert_eq!(
			authorize(&store, &user("bob"), &room).await.unwrap(),
			Decision::Allowed
		);
	}

	#[tokio::test]
	async fn private_room_denials() {
		let store = store();

		let with_self = RoomKey::private(&user("alice"), &user("alice"));
		assert_eq!(
			authorize(&store, &user("alice"), &with_self).await.unwrap(),
			Decision::Denied(DenyReason::SelfConversation)
		);

		let unknown = RoomKey::private(&user("alice"), &user("mallory"));
		assert_eq!(
			authorize(&store, &user("alice"), &unknown).await.unwrap(),
			Decision::Denied(DenyReason::UnknownUser)
		);

		let others = RoomKey::private(&user("alice"), &user("bob"));
		assert_eq!(
			authorize(&store, &user("carol"), &others).await.unwrap(),
			Decision::Denied(DenyReason::NotParticipant)
		);
	}

	#[tokio::test]
	async fn group_rooms_require_membership() {
		let store = store();
		let team = store.add_group("team", &user("alice"));
		store.add_member(team, &user("bob"));

		let room = RoomKey::group(team);
		assert_eq!(authorize(&store, &user("bob"), &room).await.unwrap(), Decision::Allowed);
		assert_eq!(
			authorize(&store, &user("carol"), &room).await.unwrap(),
			Decision::Denied(DenyReason::NotGroupMember)
		);

		// A group that does not exist is a denial, not an error.
		assert_eq!(
			authorize(&store, &user("alice"), &RoomKey::group(GroupId(404))).await.unwrap(),
			Decision::Denied(DenyReason::NotGroupMember)
		);
	}
}
