#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{GroupId, ParseIdError, RoomKind, Username};

/// Canonical room identifier.
///
/// Private rooms store the two participants in sorted order, so the key is the same whichever
/// side computes it. The string form is `private_<low>_<high>` or `group_<id>`; usernames are
/// escaped with [`escape_component`] so the separator is unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum RoomKey {
	Private { low: Username, high: Username },
	Group(GroupId),
}

impl RoomKey {
	pub const PRIVATE_PREFIX: &'static str = "private_";
	pub const GROUP_PREFIX: &'static str = "group_";

	/// Room shared by two users.
	pub fn private(a: &Username, b: &Username) -> Self {
		let (low, high) = if a <= b { (a, b) } else { (b, a) };
		Self::Private {
			low: low.clone(),
			high: high.clone(),
		}
	}

	/// Room of a group.
	pub fn group(id: GroupId) -> Self {
		Self::Group(id)
	}

	/// Resolve the room addressed by a client `target` (a username for private rooms, a numeric
	/// group id for group rooms).
	pub fn for_target(kind: RoomKind, me: &Username, target: &str) -> Result<Self, ParseIdError> {
		match kind {
			RoomKind::Private => {
				let other = Username::new(target.to_string())?;
				Ok(Self::private(me, &other))
			}
			RoomKind::Group => Ok(Self::group(target.parse()?)),
		}
	}

	pub fn kind(&self) -> RoomKind {
		match self {
			Self::Private { .. } => RoomKind::Private,
			Self::Group(_) => RoomKind::Group,
		}
	}

	pub fn group_id(&self) -> Option<GroupId> {
		match self {
			Self::Group(id) => Some(*id),
			Self::Private { .. } => None,
		}
	}

	/// The other participant of a private room, from `me`'s point of view.
	pub fn counterpart(&self, me: &Username) -> Option<&Username> {
		match self {
			Self::Private { low, high } if low == me => Some(high),
			Self::Private { low, high } if high == me => Some(low),
			_ => None,
		}
	}

	/// Parse the canonical string form.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		if let Some(rest) = s.strip_prefix(Self::PRIVATE_PREFIX) {
			let (a, b) = rest
				.split_once('_')
				.ok_or_else(|| ParseIdError::InvalidFormat("expected private_<user>_<user>".into()))?;
			if b.contains('_') {
				return Err(ParseIdError::InvalidFormat("unescaped '_' in private room key".into()));
			}
			let a = Username::new(unescape_component(a)?)?;
			let b = Username::new(unescape_component(b)?)?;
			return Ok(Self::private(&a, &b));
		}

		if let Some(rest) = s.strip_prefix(Self::GROUP_PREFIX) {
			return Ok(Self::group(rest.parse()?));
		}

		Err(ParseIdError::InvalidFormat(
			"expected private_<user>_<user> or group_<id>".into(),
		))
	}
}

impl fmt::Display for RoomKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Private { low, high } => write!(
				f,
				"{}{}_{}",
				Self::PRIVATE_PREFIX,
				escape_component(low.as_str()),
				escape_component(high.as_str())
			),
			Self::Group(id) => write!(f, "{}{}", Self::GROUP_PREFIX, id),
		}
	}
}

impl FromStr for RoomKey {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomKey::parse(s)
	}
}

impl From<RoomKey> for String {
	fn from(room: RoomKey) -> Self {
		room.to_string()
	}
}

impl TryFrom<String> for RoomKey {
	type Error = ParseIdError;

	fn try_from(s: String) -> Result<Self, Self::Error> {
		RoomKey::parse(&s)
	}
}

/// Escape `%` and `_` so a username never contains the key separator.
pub fn escape_component(s: &str) -> String {
	let mut out = String::with_capacity(s.len());
	for c in s.chars() {
		match c {
			'%' => out.push_str("%25"),
			'_' => out.push_str("%5F"),
			other => out.push(other),
		}
	}
	out
}

/// Inverse of [`escape_component`].
pub fn unescape_component(s: &str) -> Result<String, ParseIdError> {
	let mut out = String::with_capacity(s.len());
	let mut rest = s;
	while let Some(idx) = rest.find('%') {
		out.push_str(&rest[..idx]);
		let code = rest.get(idx + 1..idx + 3).unwrap_or("");
		match code {
			"25" => out.push('%'),
			"5F" | "5f" => out.push('_'),
			_ => return Err(ParseIdError::InvalidFormat(format!("invalid escape in {s:?}"))),
		}
		rest = &rest[idx + 3..];
	}
	out.push_str(rest);
	Ok(out)
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	fn user(s: &str) -> Username {
		Username::new(s).expect("valid username")
	}

	fn name_strategy() -> impl Strategy<Value = String> {
		"[a-zA-Z0-9_%.]{1,12}"
	}

	#[test]
	fn private_key_matches_reference_format() {
		let key = RoomKey::private(&user("bob"), &user("alice"));
		assert_eq!(key.to_string(), "private_alice_bob");
		assert_eq!(RoomKey::group(GroupId(7)).to_string(), "group_7");
	}

	#[test]
	fn underscores_do_not_collide() {
		let a = RoomKey::private(&user("a_b"), &user("c"));
		let b = RoomKey::private(&user("a"), &user("b_c"));
		assert_ne!(a, b);
		assert_ne!(a.to_string(), b.to_string());
		assert_eq!(RoomKey::parse(&a.to_string()).unwrap(), a);
		assert_eq!(RoomKey::parse(&b.to_string()).unwrap(), b);
	}

	#[test]
	fn for_target_resolves_both_kinds() {
		let me = user("carol");
		assert_eq!(
			RoomKey::for_target(RoomKind::Private, &me, "alice").unwrap(),
			RoomKey::private(&me, &user("alice"))
		);
		assert_eq!(
			RoomKey::for_target(RoomKind::Group, &me, "7").unwrap(),
			RoomKey::group(GroupId(7))
		);
		assert!(RoomKey::for_target(RoomKind::Group, &me, "seven").is_err());
		assert!(RoomKey::for_target(RoomKind::Private, &me, " ").is_err());
	}

	#[test]
	fn counterpart_from_either_side() {
		let key = RoomKey::private(&user("alice"), &user("bob"));
		assert_eq!(key.counterpart(&user("alice")), Some(&user("bob")));
		assert_eq!(key.counterpart(&user("bob")), Some(&user("alice")));
		assert_eq!(key.counterpart(&user("carol")), None);
		assert_eq!(RoomKey::group(GroupId(1)).counterpart(&user("bob")), None);
	}

	#[test]
	fn rejects_malformed_keys() {
		assert!(RoomKey::parse("").is_err());
		assert!(RoomKey::parse("private_alice").is_err());
		assert!(RoomKey::parse("private_al%ZZ_bob").is_err());
		assert!(RoomKey::parse("group_x").is_err());
		assert!(RoomKey::parse("lobby").is_err());
	}

	#[test]
	fn serde_uses_canonical_string() {
		let key = RoomKey::private(&user("bob"), &user("alice"));
		let json = serde_json::to_string(&key).unwrap();
		assert_eq!(json, "\"private_alice_bob\"");
		assert_eq!(serde_json::from_str::<RoomKey>(&json).unwrap(), key);
		assert!(serde_json::from_str::<RoomKey>("\"lobby\"").is_err());
	}

	proptest! {
		#[test]
		fn private_key_is_symmetric(x in name_strategy(), y in name_strategy()) {
			let (x, y) = (user(&x), user(&y));
			prop_assert_eq!(RoomKey::private(&x, &y), RoomKey::private(&y, &x));
			prop_assert_eq!(RoomKey::private(&x, &y).to_string(), RoomKey::private(&y, &x).to_string());
		}

		#[test]
		fn distinct_pairs_never_collide(
			a in name_strategy(),
			b in name_strategy(),
			c in name_strategy(),
			d in name_strategy(),
		) {
			let k1 = RoomKey::private(&user(&a), &user(&b));
			let k2 = RoomKey::private(&user(&c), &user(&d));
			let mut p1 = [a, b];
			let mut p2 = [c, d];
			p1.sort();
			p2.sort();
			prop_assert_eq!(p1 == p2, k1.to_string() == k2.to_string());
		}

		#[test]
		fn group_keys_are_distinct_and_disjoint(g1 in any::<i64>(), g2 in any::<i64>(), x in name_strategy(), y in name_strategy()) {
			let k1 = RoomKey::group(GroupId(g1)).to_string();
			let k2 = RoomKey::group(GroupId(g2)).to_string();
			prop_assert_eq!(g1 == g2, k1 == k2);
			prop_assert_ne!(k1, RoomKey::private(&user(&x), &user(&y)).to_string());
		}

		#[test]
		fn canonical_string_parses_back(x in name_strategy(), y in name_strategy(), g in any::<i64>()) {
			let private = RoomKey::private(&user(&x), &user(&y));
			prop_assert_eq!(RoomKey::parse(&private.to_string()).unwrap(), private);
			let group = RoomKey::group(GroupId(g));
			prop_assert_eq!(RoomKey::parse(&group.to_string()).unwrap(), group);
		}
	}
}
