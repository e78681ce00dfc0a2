//! Distributed circuit breaker mode: the same Closed/Open/HalfOpen
//! machine as the local breaker, but with state shared across gateway
//! instances through an external key-value store instead of in-process
//! atomics.
//!
//! The store is behind a small [`Store`] trait rather than a concrete
//! Redis client — this crate has no network KV dependency of its own, and
//! the trait is the same shape as the cached-config transport sketch in
//! `control`: a minimal async seam a deployment wires up to whatever
//! store it already runs. Every breaker instance keeps its own five keys
//! per route:
//!
//! `gw:cb:<route_id>:state`
//! `gw:cb:<route_id>:failures`
//! `gw:cb:<route_id>:successes`
//! `gw:cb:<route_id>:opened_at`
//! `gw:cb:<route_id>:half_open_count`
//!
//! A notable departure from some real distributed breakers: `successes`
//! is its own counter, incremented only while the shared state is
//! `HalfOpen`, and is what closes the breaker at `success_threshold`. It
//! is never conflated with `half_open_count` (the admission counter that
//! caps concurrent probes) — storing both in the same key is the
//! source of a well-known half-open-always-closes-immediately bug in at
//! least one production implementation we looked at, and this module
//! deliberately keeps them apart.

use std::time::Duration;

use async_trait::async_trait;
use fabric_core::{GatewayError, RejectReason, RouteId};

use super::{Config, Outcome, Override, State};

/// A key-value store capable of the handful of primitives a distributed
/// breaker needs: plain reads, a compare-and-swap for the state
/// transition, and atomic increments for the two counters. Errors from
/// the store fail the breaker open (admit) per the ambient "fail open on
/// control-plane and store errors" rule — an unreachable store must
/// never become an outage amplifier.
#[async_trait]
pub trait Store: Send + Sync {
	async fn get(&self, key: &str) -> Result<Option<String>, GatewayError>;
	/// Atomically sets `key` to `new` only if its current value equals
	/// `expected` (or the key is absent and `expected` is `None`).
	/// Returns whether the swap happened.
	async fn compare_and_swap(&self, key: &str, expected: Option<&str>, new: &str) -> Result<bool, GatewayError>;
	async fn set(&self, key: &str, value: &str) -> Result<(), GatewayError>;
	/// Atomically adds `delta` to the integer stored at `key` (0 if
	/// absent) and returns the new value.
	async fn incr(&self, key: &str, delta: i64) -> Result<i64, GatewayError>;
}

fn keys(route_id: &RouteId) -> [String; 5] {
	[
		format!("gw:cb:{route_id}:state"),
		format!("gw:cb:{route_id}:failures"),
		format!("gw:cb:{route_id}:successes"),
		format!("gw:cb:{route_id}:opened_at"),
		format!("gw:cb:{route_id}:half_open_count"),
	]
}

pub struct DistributedBreaker<S: Store> {
	route_id: RouteId,
	config: Config,
	store: S,
}

pub struct Permit {
	half_open: bool,
}

impl Permit {
	pub fn half_open(&self) -> bool {
		self.half_open
	}
}

impl<S: Store> DistributedBreaker<S> {
	pub fn new(route_id: RouteId, config: Config, store: S) -> Self {
		DistributedBreaker {
			route_id,
			config,
			store,
		}
	}

	fn k(&self) -> [String; 5] {
		keys(&self.route_id)
	}

	/// Mirrors [`super::CircuitBreaker::allow`], but every read/write
	/// round-trips the store. A store error admits the request (fail
	/// open) rather than rejecting it, logging is left to the caller via
	/// the returned `Err` only ever being a genuine breaker rejection.
	pub async fn allow(&self) -> Result<Permit, GatewayError> {
		let [state_key, failures_key, successes_key, opened_at_key, half_open_key] = self.k();

		let state = match self.store.get(&state_key).await {
			Ok(v) => parse_state(v.as_deref()),
			Err(_) => return Ok(Permit { half_open: false }), // fail open
		};

		match state {
			State::Closed => Ok(Permit { half_open: false }),
			State::Open => {
				let opened_at: u64 = match self.store.get(&opened_at_key).await {
					Ok(Some(v)) => v.parse().unwrap_or(0),
					_ => 0,
				};
				let now = now_millis();
				if now.saturating_sub(opened_at) < self.config.timeout.as_millis() as u64 {
					return Err(self.reject(RejectReason::BreakerOpen {
						route_id: self.route_id.clone(),
					}));
				}
				// Attempt to move Open -> HalfOpen; lose the race gracefully.
				let swapped = self
					.store
					.compare_and_swap(&state_key, Some("open"), "half_open")
					.await
					.unwrap_or(false);
				if swapped {
					let _ = self.store.set(&failures_key, "0").await;
					let _ = self.store.set(&successes_key, "0").await;
					let _ = self.store.set(&half_open_key, "0").await;
				}
				self.admit_half_open(&half_open_key).await
			},
			State::HalfOpen => self.admit_half_open(&half_open_key).await,
		}
	}

	async fn admit_half_open(&self, half_open_key: &str) -> Result<Permit, GatewayError> {
		let n = match self.store.incr(half_open_key, 1).await {
			Ok(n) => n,
			Err(_) => return Ok(Permit { half_open: true }), // fail open
		};
		if n as u32 <= self.config.max_half_open_requests {
			Ok(Permit { half_open: true })
		} else {
			let _ = self.store.incr(half_open_key, -1).await;
			Err(self.reject(RejectReason::BreakerHalfOpenFull {
				route_id: self.route_id.clone(),
			}))
		}
	}

	pub async fn report(&self, permit: Permit, outcome: Outcome) {
		let [state_key, failures_key, successes_key, opened_at_key, half_open_key] = self.k();
		if permit.half_open {
			let _ = self.store.incr(&half_open_key, -1).await;
		}
		match outcome {
			Outcome::Success => {
				let _ = self.store.set(&failures_key, "0").await;
				if permit.half_open {
					let successes = self.store.incr(&successes_key, 1).await.unwrap_or(0);
					if successes >= self.config.success_threshold as i64 {
						let _ = self.store.set(&state_key, "closed").await;
						let _ = self.store.set(&failures_key, "0").await;
						let _ = self.store.set(&successes_key, "0").await;
					}
				}
			},
			Outcome::Failure => {
				let _ = self.store.set(&successes_key, "0").await;
				if permit.half_open {
					let _ = self.store.set(&state_key, "open").await;
					let _ = self.store.set(&opened_at_key, &now_millis().to_string()).await;
					return;
				}
				let failures = self.store.incr(&failures_key, 1).await.unwrap_or(0);
				if failures >= self.config.failure_threshold as i64 {
					let _ = self.store.set(&state_key, "open").await;
					let _ = self.store.set(&opened_at_key, &now_millis().to_string()).await;
				}
			},
		}
	}

	fn reject(&self, reason: RejectReason) -> GatewayError {
		GatewayError::Rejected {
			engine: "circuit_breaker::distributed",
			reason,
		}
	}
}

fn parse_state(s: Option<&str>) -> State {
	match s {
		Some("open") => State::Open,
		Some("half_open") => State::HalfOpen,
		_ => State::Closed,
	}
}

fn now_millis() -> u64 {
	// A real deployment would inject a clock for testability, as the
	// local breaker does via `Instant`; this module only needs wall time
	// since the store is the source of truth for `opened_at`, not an
	// in-process baseline.
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.unwrap_or(Duration::ZERO)
		.as_millis() as u64
}

/// Applies an admin [`Override`] by writing directly into the shared
/// state, bypassing the normal transition rules the same way the local
/// breaker's `set_override` does.
pub async fn apply_override<S: Store>(store: &S, route_id: &RouteId, ov: Override) -> Result<(), GatewayError> {
	let [state_key, _, _, opened_at_key, _] = keys(route_id);
	match ov {
		Override::Auto => Ok(()),
		Override::ForceOpen => {
			// There is no dedicated override slot in the five-key layout, so
			// forcing open is modelled as opening the breaker right now;
			// unlike the local breaker's sticky `ForceOpen`, a distributed
			// force-open still releases into a half-open probe once
			// `timeout` elapses, and a deployment wanting it to stay open
			// must keep reapplying the override.
			store.set(&opened_at_key, &now_millis().to_string()).await?;
			store.set(&state_key, "open").await
		},
		Override::ForceClosed => store.set(&state_key, "closed").await,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;
	use std::sync::Mutex;

	#[derive(Default)]
	struct MemStore {
		data: Mutex<HashMap<String, String>>,
	}

	#[async_trait]
	impl Store for MemStore {
		async fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
			Ok(self.data.lock().unwrap().get(key).cloned())
		}

		async fn compare_and_swap(&self, key: &str, expected: Option<&str>, new: &str) -> Result<bool, GatewayError> {
			let mut guard = self.data.lock().unwrap();
			let current = guard.get(key).map(|s| s.as_str());
			if current == expected {
				guard.insert(key.to_string(), new.to_string());
				Ok(true)
			} else {
				Ok(false)
			}
		}

		async fn set(&self, key: &str, value: &str) -> Result<(), GatewayError> {
			self.data.lock().unwrap().insert(key.to_string(), value.to_string());
			Ok(())
		}

		async fn incr(&self, key: &str, delta: i64) -> Result<i64, GatewayError> {
			let mut guard = self.data.lock().unwrap();
			let current: i64 = guard.get(key).and_then(|v| v.parse().ok()).unwrap_or(0);
			let next = current + delta;
			guard.insert(key.to_string(), next.to_string());
			Ok(next)
		}
	}

	fn cfg() -> Config {
		Config {
			failure_threshold: 2,
			success_threshold: 2,
			timeout: Duration::from_millis(10),
			max_half_open_requests: 1,
			tenant_isolation: false,
		}
	}

	#[tokio::test]
	async fn opens_after_threshold_and_recovers() {
		let cb = DistributedBreaker::new(RouteId::new("r"), cfg(), MemStore::default());
		for _ in 0..2 {
			let p = cb.allow().await.unwrap();
			cb.report(p, Outcome::Failure).await;
		}
		assert!(cb.allow().await.is_err());
		tokio::time::sleep(Duration::from_millis(20)).await;
		let p = cb.allow().await.expect("probe admitted after timeout");
		assert!(p.half_open());
		cb.report(p, Outcome::Success).await;
		let p2 = cb.allow().await.expect("second half-open probe");
		cb.report(p2, Outcome::Success).await;
		let p3 = cb.allow().await.expect("breaker closed again");
		assert!(!p3.half_open());
	}

	#[tokio::test]
	async fn half_open_failure_never_closes_via_success_counter() {
		// Regression guard for the bug this module deliberately avoids:
		// a single half-open success must not close the breaker when
		// success_threshold > 1, even though `half_open_count` also sits
		// at 1 at that moment.
		let mut c = cfg();
		c.success_threshold = 2;
		let cb = DistributedBreaker::new(RouteId::new("r"), c, MemStore::default());
		for _ in 0..2 {
			let p = cb.allow().await.unwrap();
			cb.report(p, Outcome::Failure).await;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
		let p = cb.allow().await.unwrap();
		cb.report(p, Outcome::Success).await;
		// Still half-open: only one of two required successes recorded.
		let state = cb.store.get("gw:cb:r:state").await.unwrap();
		assert_eq!(state.as_deref(), Some("half_open"));
	}

	#[tokio::test]
	async fn admin_override_force_open() {
		let store = MemStore::default();
		let route_id = RouteId::new("r");
		apply_override(&store, &route_id, Override::ForceOpen).await.unwrap();
		let cb = DistributedBreaker::new(route_id, cfg(), store);
		assert!(cb.allow().await.is_err());
	}
}
