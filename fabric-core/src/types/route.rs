//! Route and backend identity (§3 "Route" / "Backend").
//!
//! These are the keys every by-route engine is addressed by; the router
//! that performs path/host matching against live traffic is an external
//! collaborator (§1), so `RouteMatch` here only describes what a route was
//! configured to match, for the benefit of whatever external router
//! resolves it.

use std::time::Instant;

use http::Method;
use regex::Regex;

use crate::strng;
use crate::strng::{RouteId, Strng};

/// How a route's path is matched. The matching itself happens in the
/// external router; this is carried for introspection/admin dumps and so a
/// `Factory` constructor can precompile the regex variant once.
#[derive(Clone)]
pub enum MatchKind {
	PathPrefix(Strng),
	PathExact(Strng),
	PathRegex(Regex),
}

impl std::fmt::Debug for MatchKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			MatchKind::PathPrefix(p) => write!(f, "PathPrefix({p})"),
			MatchKind::PathExact(p) => write!(f, "PathExact({p})"),
			MatchKind::PathRegex(r) => write!(f, "PathRegex({})", r.as_str()),
		}
	}
}

/// A route's match predicate: path kind, optional method set, optional
/// host. All are ANDed together.
#[derive(Debug, Clone)]
pub struct RouteMatch {
	pub path: MatchKind,
	pub methods: Option<Vec<Method>>,
	pub host: Option<Strng>,
}

impl RouteMatch {
	pub fn matches_method(&self, method: &Method) -> bool {
		match &self.methods {
			Some(set) => set.iter().any(|m| m == method),
			None => true,
		}
	}

	pub fn matches_host(&self, host: Option<&str>) -> bool {
		match (&self.host, host) {
			(None, _) => true,
			(Some(expected), Some(actual)) => expected.as_str().eq_ignore_ascii_case(actual),
			(Some(_), None) => false,
		}
	}
}

/// Upstream health, as last observed by an external health probe. A
/// backend marked `Unavailable` is never removed from the routing table by
/// that alone — only a `Reconfigure` changes the backend list (§3
/// invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendHealth {
	Healthy,
	Unavailable,
}

/// One upstream target for a route.
#[derive(Debug, Clone)]
pub struct Backend {
	pub url: url::Url,
	pub weight: u32,
	pub health: BackendHealth,
}

impl Backend {
	pub fn new(url: url::Url) -> Self {
		Backend {
			url,
			weight: 1,
			health: BackendHealth::Healthy,
		}
	}

	pub fn is_available(&self) -> bool {
		self.health == BackendHealth::Healthy
	}
}

/// Identity for policy lookup (§3 "Route"). `id` is unique within a
/// `Reconfigure` generation; every engine below addresses its per-route
/// state by this id, never by a pointer into `Route` itself.
#[derive(Debug, Clone)]
pub struct Route {
	pub id: RouteId,
	pub matcher: RouteMatch,
	pub backends: Vec<Backend>,
}

impl Route {
	/// Backends currently eligible for selection (§4.14.2 "round-robin with
	/// health-gate"). Per the §3 invariant a route always has at least one
	/// configured backend, but every backend may currently be unavailable;
	/// callers must handle an empty result (maps to `NoHealthyEndpoints`).
	pub fn healthy_backends(&self) -> Vec<&Backend> {
		self.backends.iter().filter(|b| b.is_available()).collect()
	}
}

/// Round-robin cursor with a health gate, grounded in §4.14.2's "assume
/// round-robin with health-gate" selection policy. One instance per route,
/// held in the dispatcher's registry.
pub struct RoundRobin {
	cursor: std::sync::atomic::AtomicUsize,
}

impl Default for RoundRobin {
	fn default() -> Self {
		RoundRobin {
			cursor: std::sync::atomic::AtomicUsize::new(0),
		}
	}
}

impl RoundRobin {
	pub fn select<'a>(&self, route: &'a Route) -> Option<&'a Backend> {
		let healthy = route.healthy_backends();
		if healthy.is_empty() {
			return None;
		}
		let i = self
			.cursor
			.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
			% healthy.len();
		Some(healthy[i])
	}
}

/// Timestamp helper shared by the engines that need monotonic elapsed time
/// (breaker `opened_at`, rate-limiter refill, mirror latency samples)
/// without pulling in a wall-clock dependency for arithmetic that only
/// needs to compare against `Instant::now()`.
pub fn now() -> Instant {
	Instant::now()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn backend(health: BackendHealth) -> Backend {
		Backend {
			url: url::Url::parse("http://example.test").unwrap(),
			weight: 1,
			health,
		}
	}

	#[test]
	fn round_robin_skips_unavailable_backends() {
		let route = Route {
			id: RouteId::new("r1"),
			matcher: RouteMatch {
				path: MatchKind::PathPrefix(strng::new("/")),
				methods: None,
				host: None,
			},
			backends: vec![
				backend(BackendHealth::Unavailable),
				backend(BackendHealth::Healthy),
			],
		};
		let rr = RoundRobin::default();
		for _ in 0..4 {
			let b = rr.select(&route).unwrap();
			assert_eq!(b.health, BackendHealth::Healthy);
		}
	}

	#[test]
	fn round_robin_none_when_all_unavailable() {
		let route = Route {
			id: RouteId::new("r1"),
			matcher: RouteMatch {
				path: MatchKind::PathPrefix(strng::new("/")),
				methods: None,
				host: None,
			},
			backends: vec![backend(BackendHealth::Unavailable)],
		};
		assert!(RoundRobin::default().select(&route).is_none());
	}
}
