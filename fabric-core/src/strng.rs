//! Cheaply-cloneable immutable strings used throughout the policy fabric.
//!
//! Route ids, header names pulled off the wire, and backend hostnames are
//! cloned into every engine's config and into every `VarCtx` lookup; an
//! `Arc<str>`-backed string keeps those clones to a refcount bump instead of
//! a heap copy.

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

pub use arcstr::ArcStr;

/// Alias kept distinct from `ArcStr` so call sites read as domain vocabulary
/// rather than a borrowed implementation detail.
pub type Strng = ArcStr;

/// Build a `Strng` from anything that can be turned into one, matching the
/// ergonomics of `String::from` without forcing an intermediate `String`.
#[inline]
pub fn new(s: impl AsRef<str>) -> Strng {
	Strng::from(s.as_ref())
}

/// A string-like newtype for request/route identifiers, so `RouteId` and a
/// bare backend hostname are not interchangeable at the type level even
/// though both are backed by a `Strng`.
#[derive(Clone, Eq, PartialEq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RouteId(Strng);

impl RouteId {
	pub fn new(s: impl AsRef<str>) -> Self {
		Self(new(s))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for RouteId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "RouteId({})", self.0)
	}
}

impl fmt::Display for RouteId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(&self.0, f)
	}
}

impl Deref for RouteId {
	type Target = str;
	fn deref(&self) -> &str {
		&self.0
	}
}

impl Borrow<str> for RouteId {
	fn borrow(&self) -> &str {
		&self.0
	}
}

impl<T: AsRef<str>> From<T> for RouteId {
	fn from(s: T) -> Self {
		Self::new(s)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn route_id_clone_is_cheap_and_equal() {
		let a = RouteId::new("route-checkout");
		let b = a.clone();
		assert_eq!(a, b);
		assert_eq!(a.as_str(), "route-checkout");
	}

	#[test]
	fn route_id_borrows_as_str_for_map_lookup() {
		use std::collections::HashMap;
		let mut m: HashMap<RouteId, u32> = HashMap::new();
		m.insert(RouteId::new("r1"), 1);
		assert_eq!(m.get("r1"), Some(&1));
	}
}
