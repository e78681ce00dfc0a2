//! The error taxonomy every policy engine converts its failures into.
//!
//! §7 of the design groups failures into six kinds; this enum is the one
//! place that grouping is made concrete so the dispatcher can decide, in one
//! `match`, what status code and body (if any) the client sees.

use std::time::Duration;

use crate::strng::RouteId;

/// A failure surfaced by a policy engine or the dispatcher.
///
/// Only [`GatewayError::Rejected`] and the response-shaping variants mutate
/// the client response; [`GatewayError::Degraded`] is logged and the request
/// continues as if the engine had been a no-op.
#[derive(thiserror::Error, Debug, Clone)]
pub enum GatewayError {
	/// Admission refused by a policy engine: breaker open, rate limited,
	/// ext-auth deny, WAF block, schema validation failure.
	#[error("rejected by {engine}: {reason}")]
	Rejected {
		engine: &'static str,
		reason: RejectReason,
	},

	/// The request-scoped deadline elapsed before the backend responded.
	/// `retry_after_secs` is the timeout engine's pre-computed §4.5
	/// "pre-computed retry-after string" value, not derived from `elapsed`.
	#[error("upstream timeout after {elapsed:?}")]
	UpstreamTimeout { elapsed: Duration, retry_after_secs: u64 },

	/// Dial failure or the backend returned a transport-level error.
	#[error("upstream unavailable: {detail}")]
	UpstreamUnavailable { detail: String },

	/// An engine failed in a way that policy says should not affect the
	/// request: distributed store unreachable, ext-auth transport error
	/// under fail-open, a mirror dispatch failure.
	#[error("degraded ({engine}): {detail}")]
	Degraded {
		engine: &'static str,
		detail: String,
	},

	/// Invalid regex, unresolvable slot ordering, schema parse failure.
	/// Only ever raised while building a chain/config, never at request time.
	#[error("configuration error: {0}")]
	Configuration(String),

	/// An invariant was violated. Always a bug, never a response to a policy
	/// decision.
	#[error("internal error: {0}")]
	Internal(String),
}

/// Why a request was refused admission. Carried inside
/// [`GatewayError::Rejected`] so the dispatcher can pick the right status
/// code and body without string-matching an engine name.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
	BreakerOpen { route_id: RouteId },
	BreakerHalfOpenFull { route_id: RouteId },
	RateLimited { retry_after: Duration },
	ExtAuthDenied { status: u16, body: Vec<u8> },
	WafBlocked { status: u16, rule_id: Option<String> },
	ValidationFailed { detail: String },
}

impl std::fmt::Display for RejectReason {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			RejectReason::BreakerOpen { route_id } => write!(f, "breaker open for route {route_id}"),
			RejectReason::BreakerHalfOpenFull { route_id } => {
				write!(f, "breaker half-open permit limit reached for route {route_id}")
			},
			RejectReason::RateLimited { retry_after } => write!(f, "rate limited, retry after {retry_after:?}"),
			RejectReason::ExtAuthDenied { status, .. } => write!(f, "ext-auth denied with status {status}"),
			RejectReason::WafBlocked { status, rule_id } => match rule_id {
				Some(id) => write!(f, "WAF blocked (rule {id}) with status {status}"),
				None => write!(f, "WAF blocked with status {status}"),
			},
			RejectReason::ValidationFailed { detail } => write!(f, "schema validation failed: {detail}"),
		}
	}
}

impl GatewayError {
	/// Whether a circuit breaker observing this error should count it as a
	/// failure. Mirrors the dispatcher's gRPC status mapping in §4.14.7:
	/// transport-level failures count, policy rejections from *other*
	/// engines and client cancellation do not.
	pub fn is_breaker_failure(&self) -> bool {
		matches!(
			self,
			GatewayError::UpstreamTimeout { .. } | GatewayError::UpstreamUnavailable { .. }
		)
	}

	/// Whether a caller may safely retry the same request against a
	/// different backend instance. Configuration/Internal errors are never
	/// retryable — they will fail identically everywhere.
	pub fn is_retryable(&self) -> bool {
		matches!(
			self,
			GatewayError::UpstreamTimeout { .. } | GatewayError::UpstreamUnavailable { .. }
		)
	}

	/// Render this error as the response the client actually sees: status
	/// from [`GatewayError::status_code`], a plain-text body, and a
	/// `Retry-After` header where one applies.
	pub fn into_response(self) -> http::Response<String> {
		let status = self.status_code();
		let retry_after = self.retry_after_seconds();
		let body = self.to_string();
		let mut builder = http::Response::builder()
			.status(status)
			.header(http::header::CONTENT_TYPE, "text/plain");
		if let Some(secs) = retry_after {
			builder = builder.header(http::header::RETRY_AFTER, secs.to_string());
		}
		builder.body(body).expect("status and headers are always valid")
	}

	/// The HTTP status this error maps to when it reaches the client.
	pub fn status_code(&self) -> u16 {
		match self {
			GatewayError::Rejected { reason, .. } => match reason {
				RejectReason::BreakerOpen { .. } | RejectReason::BreakerHalfOpenFull { .. } => 503,
				RejectReason::RateLimited { .. } => 503,
				RejectReason::ExtAuthDenied { status, .. } => *status,
				RejectReason::WafBlocked { status, .. } => *status,
				RejectReason::ValidationFailed { .. } => 400,
			},
			GatewayError::UpstreamTimeout { .. } => 504,
			GatewayError::UpstreamUnavailable { .. } => 502,
			GatewayError::Degraded { .. } => 200, // degradations never mutate the response alone
			GatewayError::Configuration(_) => 500,
			GatewayError::Internal(_) => 500,
		}
	}

	/// `Retry-After` header value, if this error kind injects one (§6).
	pub fn retry_after_seconds(&self) -> Option<u64> {
		match self {
			GatewayError::UpstreamTimeout { retry_after_secs, .. } => Some(*retry_after_secs),
			GatewayError::Rejected {
				reason: RejectReason::RateLimited { retry_after },
				..
			} => Some(retry_after.as_secs().max(1)),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn into_response_sets_status_and_retry_after() {
		let err = GatewayError::Rejected {
			engine: "rate_limiter",
			reason: RejectReason::RateLimited {
				retry_after: Duration::from_secs(5),
			},
		};
		let resp = err.into_response();
		assert_eq!(resp.status().as_u16(), 503);
		assert_eq!(resp.headers().get(http::header::RETRY_AFTER).unwrap(), "5");
	}

	#[test]
	fn into_response_omits_retry_after_when_not_applicable() {
		let err = GatewayError::Internal("boom".into());
		let resp = err.into_response();
		assert_eq!(resp.status().as_u16(), 500);
		assert!(resp.headers().get(http::header::RETRY_AFTER).is_none());
	}

	#[test]
	fn upstream_timeout_retry_after_reflects_compiled_value() {
		let err = GatewayError::UpstreamTimeout {
			elapsed: Duration::from_millis(50),
			retry_after_secs: 30,
		};
		let resp = err.into_response();
		assert_eq!(resp.status().as_u16(), 504);
		assert_eq!(resp.headers().get(http::header::RETRY_AFTER).unwrap(), "30");
	}

	#[test]
	fn is_retryable_matches_transport_failures_only() {
		assert!(
			GatewayError::UpstreamTimeout {
				elapsed: Duration::from_secs(1),
				retry_after_secs: 1
			}
			.is_retryable()
		);
		assert!(
			GatewayError::UpstreamUnavailable {
				detail: "dial failed".into()
			}
			.is_retryable()
		);
		assert!(!GatewayError::Configuration("bad schema".into()).is_retryable());
	}
}
