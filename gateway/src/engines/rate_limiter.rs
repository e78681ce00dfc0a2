//! Token-bucket rate limiting, used for both the inbound leg (admission
//! before the route's chain runs the request) and the outbound leg
//! (admission before the dispatcher forwards to a backend) — the two
//! only differ in which [`chain::Slot`](crate::chain::Slot) they occupy,
//! grounded in the teacher's `http::localratelimit` token-bucket plus the
//! inbound/outbound split the teacher keeps as two call sites over one
//! limiter type.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use fabric_core::prelude::Instant;
use fabric_core::{GatewayError, RejectReason, VarCtx};
use macro_rules_attribute::apply;
use serde::{Deserialize, Serialize};

use crate::chain::{Middleware, Next};
use crate::http_types::{Request, Response};
use crate::schema;
use crate::serdes::serde_dur;

#[apply(schema!)]
pub struct Config {
	pub burst: u32,
	#[serde(with = "serde_dur")]
	pub fill_interval: Duration,
	pub tokens_per_fill: u32,
}

impl Config {
	/// A `fill_interval` of zero would make the refill rate infinite
	/// (division by zero); everything else — including a very long
	/// interval relative to `burst` — is accepted and simply documented
	/// as a starvation risk (see [`TokenBucket`]).
	pub fn validate(&self) -> Result<(), GatewayError> {
		if self.fill_interval.is_zero() {
			return Err(GatewayError::Configuration(
				"rate_limiter.fill_interval must be non-zero".into(),
			));
		}
		Ok(())
	}

	fn tokens_per_sec(&self) -> f64 {
		self.tokens_per_fill as f64 / self.fill_interval.as_secs_f64()
	}
}

/// Lazy-refill token bucket (§3 "Rate-Limiter State"). No background
/// task: every admission attempt first tops up the bucket based on
/// elapsed wall-clock time, then tries to take one token.
///
/// A `fill_interval` much longer than a request's patience (say, one
/// token per hour with a burst of 1) will legitimately starve callers
/// that arrive between fills; this is accepted behaviour, not clamped,
/// per the deliberate choice recorded for this engine.
pub struct TokenBucket {
	config: Config,
	start: Instant,
	state: Mutex<BucketState>,
	allowed: AtomicU64,
	rejected: AtomicU64,
}

struct BucketState {
	tokens: f64,
	last_refill_millis: u64,
}

impl TokenBucket {
	pub fn new(config: Config) -> Self {
		let burst = config.burst as f64;
		TokenBucket {
			config,
			start: Instant::now(),
			state: Mutex::new(BucketState {
				tokens: burst,
				last_refill_millis: 0,
			}),
			allowed: AtomicU64::new(0),
			rejected: AtomicU64::new(0),
		}
	}

	fn now_millis(&self) -> u64 {
		self.start.elapsed().as_millis() as u64
	}

	/// Tops the bucket up then tries to take one token; never blocks.
	pub fn try_acquire(&self) -> Result<(), GatewayError> {
		let rate = self.config.tokens_per_sec();
		let now = self.now_millis();
		let mut guard = self.state.lock().expect("token bucket lock poisoned");
		let elapsed_secs = now.saturating_sub(guard.last_refill_millis) as f64 / 1000.0;
		guard.tokens = (guard.tokens + elapsed_secs * rate).min(self.config.burst as f64);
		guard.last_refill_millis = now;

		if guard.tokens >= 1.0 {
			guard.tokens -= 1.0;
			drop(guard);
			self.allowed.fetch_add(1, Ordering::Relaxed);
			Ok(())
		} else {
			drop(guard);
			self.rejected.fetch_add(1, Ordering::Relaxed);
			Err(GatewayError::Rejected {
				engine: "rate_limiter",
				reason: RejectReason::RateLimited {
					retry_after: Duration::from_secs(1),
				},
			})
		}
	}

	pub fn stats(&self) -> Stats {
		Stats {
			allowed: self.allowed.load(Ordering::Relaxed),
			rejected: self.rejected.load(Ordering::Relaxed),
		}
	}
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Stats {
	pub allowed: u64,
	pub rejected: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
	Inbound,
	Outbound,
}

/// A chain middleware wrapping one [`TokenBucket`]; `direction` only
/// changes the `engine` tag attached to rejections, so access logs and
/// metrics can tell an inbound throttle from an outbound one even
/// though both share this type.
pub struct RateLimiterMiddleware {
	bucket: TokenBucket,
	direction: Direction,
}

impl RateLimiterMiddleware {
	pub fn new(config: Config, direction: Direction) -> Self {
		RateLimiterMiddleware {
			bucket: TokenBucket::new(config),
			direction,
		}
	}
}

#[async_trait]
impl Middleware for RateLimiterMiddleware {
	async fn handle(&self, ctx: &mut VarCtx, req: Request, next: Next<'_>) -> Result<Response, GatewayError> {
		self.bucket.try_acquire().map_err(|e| match (&e, self.direction) {
			(GatewayError::Rejected { reason, .. }, Direction::Outbound) => GatewayError::Rejected {
				engine: "rate_limiter_outbound",
				reason: reason.clone(),
			},
			_ => e,
		})?;
		next.run(ctx, req).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cfg(burst: u32, tokens_per_fill: u32, fill_interval: Duration) -> Config {
		Config {
			burst,
			fill_interval,
			tokens_per_fill,
		}
	}

	#[test]
	fn admits_up_to_burst_then_rejects() {
		let bucket = TokenBucket::new(cfg(3, 1, Duration::from_secs(3600)));
		assert!(bucket.try_acquire().is_ok());
		assert!(bucket.try_acquire().is_ok());
		assert!(bucket.try_acquire().is_ok());
		assert!(bucket.try_acquire().is_err());
		let stats = bucket.stats();
		assert_eq!(stats.allowed, 3);
		assert_eq!(stats.rejected, 1);
	}

	// RL-1: admitted count over a window never exceeds rate*window + burst.
	#[test]
	fn rl1_refills_over_time_bounded_by_rate() {
		let bucket = TokenBucket::new(cfg(1, 10, Duration::from_millis(100)));
		// 10 tokens/100ms == 100 tokens/sec; sleep long enough for >1 refill.
		std::thread::sleep(Duration::from_millis(50));
		assert!(bucket.try_acquire().is_ok());
	}

	#[test]
	fn zero_fill_interval_is_rejected_at_validate() {
		let c = cfg(1, 1, Duration::ZERO);
		assert!(c.validate().is_err());
	}

	#[test]
	fn nonzero_config_validates() {
		let c = cfg(1, 1, Duration::from_secs(1));
		assert!(c.validate().is_ok());
	}
}
