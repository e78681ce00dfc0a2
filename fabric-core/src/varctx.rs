//! Per-request variable context (§3 "Variable Context").
//!
//! One `VarCtx` is created when the middleware chain begins and threaded
//! through every engine by reference; it is destroyed once the response has
//! been fully written. It is not `Clone` on purpose — there is exactly one
//! owner per in-flight request, mirroring the teacher's request-scoped
//! extension types.

use std::collections::HashMap;

use uuid::Uuid;

use crate::strng::{RouteId, Strng};

/// Tightened-only overrides a per-request caller may apply on top of a
/// route's static policy. `Timeout::effective` and the breaker's tenant
/// lookup both consult this.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
	/// Per-request timeout ceiling; never allowed to *loosen* the
	/// configured deadline (TO-1).
	pub request_timeout: Option<std::time::Duration>,
}

/// Resolved caller identity, when upstream auth populated one. Held as a
/// generic claim map rather than a concrete JWT type so the baggage engine
/// can pull arbitrary fields out of it without this crate depending on a
/// specific token format.
#[derive(Debug, Clone, Default)]
pub struct Identity {
	pub claims: HashMap<String, String>,
}

/// The per-request scratchpad described in §3. Lives exactly as long as one
/// request.
#[derive(Debug)]
pub struct VarCtx {
	/// Stable UUID minted when the chain begins.
	pub request_id: Uuid,
	/// Set once the router resolves a match; `None` observed only if an
	/// engine runs ahead of route resolution, which should not happen in a
	/// correctly assembled chain.
	pub route_id: Option<RouteId>,
	pub identity: Option<Identity>,
	pub tenant_id: Option<Strng>,
	/// Free-form values set by the baggage engine and readable by every
	/// downstream engine and the access-log formatter.
	custom: HashMap<String, String>,
	pub overrides: Overrides,
	pub propagate_trace: bool,
}

impl VarCtx {
	pub fn new(request_id: Uuid) -> Self {
		VarCtx {
			request_id,
			route_id: None,
			identity: None,
			tenant_id: None,
			custom: HashMap::new(),
			overrides: Overrides::default(),
			propagate_trace: false,
		}
	}

	pub fn set_custom(&mut self, key: impl Into<String>, value: impl Into<String>) {
		self.custom.insert(key.into(), value.into());
	}

	pub fn get_custom(&self, key: &str) -> Option<&str> {
		self.custom.get(key).map(|s| s.as_str())
	}

	pub fn custom_entries(&self) -> impl Iterator<Item = (&str, &str)> {
		self.custom.iter().map(|(k, v)| (k.as_str(), v.as_str()))
	}

	/// `min(configured, override)` per TO-1 — an override can only shorten a
	/// deadline, never extend it.
	pub fn effective_timeout(&self, configured: Option<std::time::Duration>) -> Option<std::time::Duration> {
		match (configured, self.overrides.request_timeout) {
			(Some(c), Some(o)) => Some(c.min(o)),
			(Some(c), None) => Some(c),
			(None, Some(o)) => Some(o),
			(None, None) => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn override_only_tightens_deadline() {
		let mut ctx = VarCtx::new(Uuid::nil());
		ctx.overrides.request_timeout = Some(std::time::Duration::from_millis(500));
		assert_eq!(
			ctx.effective_timeout(Some(std::time::Duration::from_secs(2))),
			Some(std::time::Duration::from_millis(500))
		);
		ctx.overrides.request_timeout = Some(std::time::Duration::from_secs(10));
		assert_eq!(
			ctx.effective_timeout(Some(std::time::Duration::from_secs(2))),
			Some(std::time::Duration::from_secs(2))
		);
	}

	#[test]
	fn custom_map_round_trips() {
		let mut ctx = VarCtx::new(Uuid::nil());
		ctx.set_custom("tenant", "acme");
		assert_eq!(ctx.get_custom("tenant"), Some("acme"));
		assert_eq!(ctx.get_custom("missing"), None);
	}
}
