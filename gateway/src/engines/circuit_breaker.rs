//! Circuit breaker (§4.3), local in-process mode.
//!
//! The state machine itself is grounded in
//! `examples/flyingrobots-ninelives/src/circuit_breaker.rs` — a monotonic
//! clock plus atomics for the hot path — generalised from that crate's
//! single global breaker to the per-`(route_id, tenant_id)` breaker this
//! spec calls for, with the admin override and lifetime counters §4.3
//! adds. The distributed mode lives in [`distributed`].

pub mod distributed;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use fabric_core::strng;
use fabric_core::{GatewayError, RejectReason, RouteId, Strng};
use macro_rules_attribute::apply;
use serde::{Deserialize, Serialize};

use crate::serdes::serde_dur;
use crate::schema;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

const OVERRIDE_AUTO: u8 = 0;
const OVERRIDE_FORCE_OPEN: u8 = 1;
const OVERRIDE_FORCE_CLOSED: u8 = 2;

#[apply(schema!)]
pub struct Config {
	pub failure_threshold: u32,
	pub success_threshold: u32,
	#[serde(with = "serde_dur")]
	pub timeout: Duration,
	pub max_half_open_requests: u32,
	#[serde(default)]
	pub tenant_isolation: bool,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			failure_threshold: 5,
			success_threshold: 2,
			timeout: Duration::from_secs(30),
			max_half_open_requests: 1,
			tenant_isolation: false,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
	Closed,
	Open,
	HalfOpen,
}

fn state_from_u8(v: u8) -> State {
	match v {
		STATE_OPEN => State::Open,
		STATE_HALF_OPEN => State::HalfOpen,
		_ => State::Closed,
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Override {
	Auto,
	ForceOpen,
	ForceClosed,
}

fn override_from_u8(v: u8) -> Override {
	match v {
		OVERRIDE_FORCE_OPEN => Override::ForceOpen,
		OVERRIDE_FORCE_CLOSED => Override::ForceClosed,
		_ => Override::Auto,
	}
}

pub enum Outcome {
	Success,
	Failure,
}

/// One `(route_id, optional tenant_id)` breaker instance (§3). Tenant
/// sub-breakers are owned by the route breaker that created them (§9
/// "cyclic lifetimes: breaker -> tenant sub-breakers are strictly
/// owning").
pub struct CircuitBreaker {
	route_id: RouteId,
	config: Config,
	start: Instant,

	state: AtomicU8,
	override_state: AtomicU8,
	consecutive_failures: AtomicU32,
	consecutive_successes: AtomicU32,
	half_open_permits: AtomicU32,
	opened_at_millis: AtomicU64,

	total_requests: AtomicU64,
	total_successes: AtomicU64,
	total_failures: AtomicU64,
	total_rejected: AtomicU64,

	tenants: RwLock<HashMap<Strng, std::sync::Arc<CircuitBreaker>>>,
}

/// The right to perform one protected call; the caller must report the
/// outcome exactly once via [`Permit::done`].
pub struct Permit<'a> {
	breaker: &'a CircuitBreaker,
	half_open: bool,
	reported: bool,
}

impl<'a> Permit<'a> {
	pub fn done(mut self, outcome: Outcome) {
		self.reported = true;
		self.breaker.report(self.half_open, outcome);
	}
}

impl<'a> Drop for Permit<'a> {
	fn drop(&mut self) {
		// A dropped, un-reported permit (cancellation mid-call, §5) must
		// still release a half-open slot so the breaker cannot deadlock
		// waiting on a permit nobody will ever return.
		if !self.reported && self.half_open {
			self.breaker.half_open_permits.fetch_sub(1, Ordering::AcqRel);
		}
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
	pub state: State,
	pub failure_count: u32,
	pub success_count: u32,
	pub failure_threshold: u32,
	pub success_threshold: u32,
	pub override_state: Override,
	pub total_requests: u64,
	pub total_successes: u64,
	pub total_failures: u64,
	pub total_rejected: u64,
	pub tenants: HashMap<String, Box<Snapshot>>,
}

impl CircuitBreaker {
	pub fn new(route_id: RouteId, config: Config) -> Self {
		CircuitBreaker {
			route_id,
			config,
			start: Instant::now(),
			state: AtomicU8::new(STATE_CLOSED),
			override_state: AtomicU8::new(OVERRIDE_AUTO),
			consecutive_failures: AtomicU32::new(0),
			consecutive_successes: AtomicU32::new(0),
			half_open_permits: AtomicU32::new(0),
			opened_at_millis: AtomicU64::new(0),
			total_requests: AtomicU64::new(0),
			total_successes: AtomicU64::new(0),
			total_failures: AtomicU64::new(0),
			total_rejected: AtomicU64::new(0),
			tenants: RwLock::new(HashMap::new()),
		}
	}

	fn now_millis(&self) -> u64 {
		self.start.elapsed().as_millis() as u64
	}

	/// `allow()` from §4.3. `ForceOpen` rejects without consulting the
	/// inner state machine; `ForceClosed` always admits but still drives
	/// the inner machine so its counters stay meaningful (§4.3 "Admin
	/// override").
	pub fn allow(&self) -> Result<Permit<'_>, GatewayError> {
		self.total_requests.fetch_add(1, Ordering::Relaxed);

		match override_from_u8(self.override_state.load(Ordering::Acquire)) {
			Override::ForceOpen => {
				self.total_rejected.fetch_add(1, Ordering::Relaxed);
				return Err(self.reject(RejectReason::BreakerOpen {
					route_id: self.route_id.clone(),
				}));
			},
			Override::ForceClosed => {
				return Ok(Permit {
					breaker: self,
					half_open: false,
					reported: false,
				});
			},
			Override::Auto => {},
		}

		loop {
			let state = state_from_u8(self.state.load(Ordering::Acquire));
			match state {
				State::Closed => {
					return Ok(Permit {
						breaker: self,
						half_open: false,
						reported: false,
					});
				},
				State::Open => {
					let opened_at = self.opened_at_millis.load(Ordering::Acquire);
					let elapsed = self.now_millis().saturating_sub(opened_at);
					if elapsed < self.config.timeout.as_millis() as u64 {
						self.total_rejected.fetch_add(1, Ordering::Relaxed);
						return Err(self.reject(RejectReason::BreakerOpen {
							route_id: self.route_id.clone(),
						}));
					}
					// Probing admission: try to transition Open -> HalfOpen.
					if self
						.state
						.compare_exchange(STATE_OPEN, STATE_HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
						.is_ok()
					{
						self.consecutive_failures.store(0, Ordering::Relaxed);
						self.consecutive_successes.store(0, Ordering::Relaxed);
						self.half_open_permits.store(0, Ordering::Relaxed);
					}
					// Either we just transitioned or lost the race to another
					// prober; loop to re-evaluate under HalfOpen.
				},
				State::HalfOpen => {
					let granted =
						self
							.half_open_permits
							.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
								if n < self.config.max_half_open_requests {
									Some(n + 1)
								} else {
									None
								}
							});
					if granted.is_ok() {
						return Ok(Permit {
							breaker: self,
							half_open: true,
							reported: false,
						});
					}
					self.total_rejected.fetch_add(1, Ordering::Relaxed);
					return Err(self.reject(RejectReason::BreakerHalfOpenFull {
						route_id: self.route_id.clone(),
					}));
				},
			}
		}
	}

	fn reject(&self, reason: RejectReason) -> GatewayError {
		GatewayError::Rejected {
			engine: "circuit_breaker",
			reason,
		}
	}

	fn report(&self, half_open: bool, outcome: Outcome) {
		if half_open {
			self.half_open_permits.fetch_sub(1, Ordering::AcqRel);
		}
		match outcome {
			Outcome::Success => {
				self.total_successes.fetch_add(1, Ordering::Relaxed);
				self.consecutive_failures.store(0, Ordering::Relaxed);
				let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
				if half_open && successes >= self.config.success_threshold {
					self.close();
				}
			},
			Outcome::Failure => {
				self.total_failures.fetch_add(1, Ordering::Relaxed);
				self.consecutive_successes.store(0, Ordering::Relaxed);
				if half_open {
					self.open();
					return;
				}
				let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
				if failures >= self.config.failure_threshold {
					self.open();
				}
			},
		}
	}

	fn open(&self) {
		self.opened_at_millis.store(self.now_millis(), Ordering::Release);
		self.state.store(STATE_OPEN, Ordering::Release);
		self.half_open_permits.store(0, Ordering::Relaxed);
	}

	fn close(&self) {
		self.state.store(STATE_CLOSED, Ordering::Release);
		self.consecutive_failures.store(0, Ordering::Relaxed);
		self.consecutive_successes.store(0, Ordering::Relaxed);
	}

	/// Admin-initiated override (§4.3 "Override transitions are
	/// admin-initiated only").
	pub fn set_override(&self, ov: Override) {
		let v = match ov {
			Override::Auto => OVERRIDE_AUTO,
			Override::ForceOpen => OVERRIDE_FORCE_OPEN,
			Override::ForceClosed => OVERRIDE_FORCE_CLOSED,
		};
		self.override_state.store(v, Ordering::Release);
	}

	/// Delegates to a lazily created tenant sub-breaker; an empty/absent
	/// tenant, or a breaker with `tenant_isolation` off, falls through to
	/// the route breaker itself (§4.3).
	pub fn allow_for_tenant(self: &std::sync::Arc<Self>, tenant: Option<&str>) -> Result<OwnedPermit, GatewayError> {
		let target = match tenant.filter(|t| !t.is_empty()) {
			Some(tenant) if self.config.tenant_isolation => self.tenant_breaker(tenant),
			_ => self.clone(),
		};
		target.allow_owned()
	}

	fn tenant_breaker(self: &std::sync::Arc<Self>, tenant: &str) -> std::sync::Arc<CircuitBreaker> {
		if let Some(sub) = self.tenants.read().expect("tenant map lock poisoned").get(tenant) {
			return sub.clone();
		}
		self
			.tenants
			.write()
			.expect("tenant map lock poisoned")
			.entry(strng::new(tenant))
			.or_insert_with(|| std::sync::Arc::new(CircuitBreaker::new(self.route_id.clone(), self.config.clone())))
			.clone()
	}

	fn allow_owned(self: std::sync::Arc<Self>) -> Result<OwnedPermit, GatewayError> {
		// Mirrors `allow()` but returns an owning permit so it can outlive
		// the borrow of a transient `Arc` lookup (tenant sub-breakers).
		// `allow()`'s borrowed Permit is leaked rather than dropped: its
		// bookkeeping (the half-open slot it reserved) is handed off to
		// the OwnedPermit below, which reports it exactly once via `done`.
		let permit = self.allow()?;
		let half_open = permit.half_open;
		std::mem::forget(permit);
		Ok(OwnedPermit {
			breaker: self,
			half_open,
			reported: false,
		})
	}

	pub fn snapshot(&self) -> Snapshot {
		let tenants = self
			.tenants
			.read()
			.expect("tenant map lock poisoned")
			.iter()
			.map(|(k, v)| (k.to_string(), Box::new(v.snapshot())))
			.collect();
		Snapshot {
			state: state_from_u8(self.state.load(Ordering::Acquire)),
			failure_count: self.consecutive_failures.load(Ordering::Acquire),
			success_count: self.consecutive_successes.load(Ordering::Acquire),
			failure_threshold: self.config.failure_threshold,
			success_threshold: self.config.success_threshold,
			override_state: override_from_u8(self.override_state.load(Ordering::Acquire)),
			total_requests: self.total_requests.load(Ordering::Relaxed),
			total_successes: self.total_successes.load(Ordering::Relaxed),
			total_failures: self.total_failures.load(Ordering::Relaxed),
			total_rejected: self.total_rejected.load(Ordering::Relaxed),
			tenants,
		}
	}
}

/// An owning permit, used by the tenant-aware path where the sub-breaker
/// was looked up through an `Arc` rather than borrowed directly.
pub struct OwnedPermit {
	breaker: std::sync::Arc<CircuitBreaker>,
	half_open: bool,
	reported: bool,
}

impl OwnedPermit {
	pub fn done(mut self, outcome: Outcome) {
		self.reported = true;
		self.breaker.report(self.half_open, outcome);
	}
}

impl Drop for OwnedPermit {
	fn drop(&mut self) {
		if !self.reported && self.half_open {
			self.breaker.half_open_permits.fetch_sub(1, Ordering::AcqRel);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cfg() -> Config {
		Config {
			failure_threshold: 3,
			success_threshold: 2,
			timeout: Duration::from_millis(50),
			max_half_open_requests: 1,
			tenant_isolation: false,
		}
	}

	// CB-1: failure_threshold consecutive failures while Closed -> Open.
	#[test]
	fn cb1_threshold_failures_open_the_breaker() {
		let cb = CircuitBreaker::new(RouteId::new("r"), cfg());
		for _ in 0..3 {
			let p = cb.allow().unwrap();
			p.done(Outcome::Failure);
		}
		assert_eq!(state_from_u8(cb.state.load(Ordering::Acquire)), State::Open);
	}

	#[test]
	fn rejects_while_open_and_recovers_through_half_open() {
		let cb = CircuitBreaker::new(RouteId::new("r"), cfg());
		for _ in 0..3 {
			cb.allow().unwrap().done(Outcome::Failure);
		}
		assert!(cb.allow().is_err());
		std::thread::sleep(Duration::from_millis(60));
		let p = cb.allow().expect("probing admission after timeout");
		p.done(Outcome::Success);
		assert_eq!(state_from_u8(cb.state.load(Ordering::Acquire)), State::HalfOpen);
		let p2 = cb.allow().expect("second half-open probe");
		p2.done(Outcome::Success);
		assert_eq!(state_from_u8(cb.state.load(Ordering::Acquire)), State::Closed);
	}

	#[test]
	fn half_open_admits_at_most_max_requests_concurrently() {
		let mut c = cfg();
		c.max_half_open_requests = 2;
		let cb = CircuitBreaker::new(RouteId::new("r"), c);
		for _ in 0..3 {
			cb.allow().unwrap().done(Outcome::Failure);
		}
		std::thread::sleep(Duration::from_millis(60));
		let p1 = cb.allow().unwrap(); // transitions to half-open, permit 1
		let p2 = cb.allow().unwrap(); // permit 2
		assert!(cb.allow().is_err()); // third is over max_half_open_requests
		p1.done(Outcome::Success);
		p2.done(Outcome::Success);
	}

	#[test]
	fn any_half_open_failure_reopens() {
		let cb = CircuitBreaker::new(RouteId::new("r"), cfg());
		for _ in 0..3 {
			cb.allow().unwrap().done(Outcome::Failure);
		}
		std::thread::sleep(Duration::from_millis(60));
		cb.allow().unwrap().done(Outcome::Failure);
		assert_eq!(state_from_u8(cb.state.load(Ordering::Acquire)), State::Open);
	}

	// CB-3: total == successes + failures + rejected for an isolated run.
	#[test]
	fn cb3_lifetime_counters_are_consistent() {
		let cb = CircuitBreaker::new(RouteId::new("r"), cfg());
		for _ in 0..3 {
			cb.allow().unwrap().done(Outcome::Failure);
		}
		let _ = cb.allow(); // rejected, Open
		std::thread::sleep(Duration::from_millis(60));
		cb.allow().unwrap().done(Outcome::Success);
		let snap = cb.snapshot();
		assert_eq!(
			snap.total_requests,
			snap.total_successes + snap.total_failures + snap.total_rejected
		);
	}

	#[test]
	fn force_open_rejects_without_consulting_inner_state() {
		let cb = CircuitBreaker::new(RouteId::new("r"), cfg());
		cb.set_override(Override::ForceOpen);
		assert!(cb.allow().is_err());
		assert_eq!(state_from_u8(cb.state.load(Ordering::Acquire)), State::Closed);
	}

	#[test]
	fn force_closed_still_feeds_inner_counters() {
		let cb = CircuitBreaker::new(RouteId::new("r"), cfg());
		cb.set_override(Override::ForceClosed);
		for _ in 0..5 {
			cb.allow().unwrap().done(Outcome::Failure);
		}
		// Inner machine would be Open by now, but ForceClosed keeps admitting.
		assert!(cb.allow().is_ok());
		let snap = cb.snapshot();
		assert_eq!(snap.total_failures, 5);
	}
}
