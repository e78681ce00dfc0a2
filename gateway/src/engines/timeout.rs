//! Request-scoped deadlines (§4.5), grounded in the teacher's
//! `http::timeout` middleware: compile once to a small struct of
//! pre-resolved durations, wrap the handler in `tokio::time::timeout`,
//! and inject `Retry-After` on expiry.

use std::time::Duration;

use async_trait::async_trait;
use fabric_core::{GatewayError, VarCtx};
use macro_rules_attribute::apply;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::chain::{Middleware, Next};
use crate::http_types::{Request, Response};
use crate::schema;
use crate::serdes::{serde_dur, serde_dur_option};

#[apply(schema!)]
pub struct Config {
	#[serde(with = "serde_dur_option", default)]
	pub request: Option<Duration>,
	#[serde(with = "serde_dur_option", default)]
	pub idle: Option<Duration>,
	#[serde(with = "serde_dur_option", default)]
	pub backend: Option<Duration>,
	#[serde(with = "serde_dur_option", default)]
	pub header: Option<Duration>,
}

/// Admin-dumpable counters for this engine (§6 Admin surface).
#[derive(Debug, Default, serde::Serialize)]
pub struct Snapshot {
	pub request_timeouts: u64,
}

/// Compiled form of [`Config`]: the request timeout has already had its
/// `Retry-After` seconds value resolved, so the 504 response built from
/// [`GatewayError::UpstreamTimeout`] never has to recompute it, per §4.5
/// "pre-computed retry-after string".
pub struct CompiledTimeout {
	config: Config,
	retry_after_secs: u64,
	request_timeouts: AtomicU64,
}

impl CompiledTimeout {
	pub fn compile(config: Config) -> Self {
		let retry_after_secs = config
			.request
			.map(|d| retry_after_header_value(&d).parse().expect("digits only"))
			.unwrap_or(1);
		CompiledTimeout {
			config,
			retry_after_secs,
			request_timeouts: AtomicU64::new(0),
		}
	}

	pub fn request_timeouts(&self) -> u64 {
		self.request_timeouts.load(Ordering::Relaxed)
	}

	pub fn snapshot(&self) -> Snapshot {
		Snapshot {
			request_timeouts: self.request_timeouts(),
		}
	}
}

#[async_trait]
impl Middleware for CompiledTimeout {
	async fn handle(&self, ctx: &mut VarCtx, req: Request, next: Next<'_>) -> Result<Response, GatewayError> {
		// Per-request override may only tighten the deadline (TO-1); this
		// is exactly what `VarCtx::effective_timeout` computes.
		let deadline = ctx.effective_timeout(self.config.request);
		let Some(deadline) = deadline else {
			return next.run(ctx, req).await;
		};
		if deadline.is_zero() {
			return next.run(ctx, req).await;
		}

		match tokio::time::timeout(deadline, next.run(ctx, req)).await {
			Ok(result) => result,
			Err(_elapsed) => {
				self.request_timeouts.fetch_add(1, Ordering::Relaxed);
				Err(GatewayError::UpstreamTimeout {
					elapsed: deadline,
					retry_after_secs: self.retry_after_secs,
				})
			},
		}
	}
}

/// Parses a gRPC `grpc-timeout` header value (`<digits><unit>` where
/// unit is one of `H,M,S,m,u,n`) into a [`Duration`], per §6.
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
	let (digits, unit) = value.split_at(value.len().checked_sub(1)?);
	let n: u64 = digits.parse().ok()?;
	let d = match unit {
		"H" => Duration::from_secs(n.saturating_mul(3600)),
		"M" => Duration::from_secs(n.saturating_mul(60)),
		"S" => Duration::from_secs(n),
		"m" => Duration::from_millis(n),
		"u" => Duration::from_micros(n),
		"n" => Duration::from_nanos(n),
		_ => return None,
	};
	Some(d)
}

pub fn retry_after_header_value(d: &Duration) -> String {
	d.as_secs().max(1).to_string()
}
