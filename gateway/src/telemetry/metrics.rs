//! Per-engine Prometheus metrics, grounded in the teacher's
//! `telemetry::metrics::Metrics` (a `prometheus_client::Registry` plus one
//! `Family` per counter) — generalised here from the teacher's single
//! request-counter to one family per engine named in §2's ambient-stack
//! note. There is exactly one [`Metrics`] per process (§9), built once and
//! shared by every engine instance via `Arc`.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteLabel {
	pub route: String,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct AlgorithmLabel {
	pub algorithm: String,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct MirrorMismatchLabel {
	pub route: String,
	pub kind: String,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct DispatchLabel {
	pub route: String,
	pub status: u16,
}

/// The process-wide registry of per-engine instruments. Every field is a
/// `Family`/bare counter registered once in [`Metrics::new`]; engines hold
/// an `Arc<Metrics>` and only ever call `.get_or_create(...).inc()` style
/// methods, never re-register.
pub struct Metrics {
	pub breaker_state: Family<RouteLabel, Gauge>,
	pub breaker_rejections: Family<RouteLabel, Counter>,
	pub rate_limiter_allowed: Family<RouteLabel, Counter>,
	pub rate_limiter_rejected: Family<RouteLabel, Counter>,
	pub compression_bytes_in: Family<AlgorithmLabel, Counter>,
	pub compression_bytes_out: Family<AlgorithmLabel, Counter>,
	pub mirror_dispatched: Family<RouteLabel, Counter>,
	pub mirror_mismatches: Family<MirrorMismatchLabel, Counter>,
	pub ext_auth_cache_hits: Family<RouteLabel, Counter>,
	pub ext_auth_denied: Family<RouteLabel, Counter>,
	pub dispatcher_requests: Family<DispatchLabel, Counter>,
	pub dispatcher_latency_seconds: Histogram,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let mut build_counter = |name: &str, help: &str| -> Family<RouteLabel, Counter> {
			let m = Family::default();
			registry.register(name, help, m.clone());
			m
		};
		let breaker_state = Family::default();
		registry.register(
			"gateway_breaker_state",
			"Current circuit breaker state (0=closed,1=open,2=half_open)",
			breaker_state.clone(),
		);
		let breaker_rejections = build_counter("gateway_breaker_rejections", "Requests rejected by an open breaker");
		let rate_limiter_allowed = build_counter("gateway_rate_limiter_allowed", "Requests admitted by the rate limiter");
		let rate_limiter_rejected = build_counter("gateway_rate_limiter_rejected", "Requests rejected by the rate limiter");

		let compression_bytes_in = Family::default();
		registry.register(
			"gateway_compression_bytes_in",
			"Uncompressed bytes seen by the compressor",
			compression_bytes_in.clone(),
		);
		let compression_bytes_out = Family::default();
		registry.register(
			"gateway_compression_bytes_out",
			"Compressed bytes written to the client",
			compression_bytes_out.clone(),
		);

		let mirror_dispatched = build_counter("gateway_mirror_dispatched", "Requests shadow-copied to a mirror backend");
		let mirror_mismatches = Family::default();
		registry.register(
			"gateway_mirror_mismatches",
			"Primary/mirror response diffs observed, by kind",
			mirror_mismatches.clone(),
		);

		let ext_auth_cache_hits = build_counter("gateway_ext_auth_cache_hits", "ext-auth decisions served from cache");
		let ext_auth_denied = build_counter("gateway_ext_auth_denied", "ext-auth deny decisions");

		let dispatcher_requests = Family::default();
		registry.register(
			"gateway_dispatcher_requests",
			"Requests forwarded to a backend, by route and final status",
			dispatcher_requests.clone(),
		);
		let dispatcher_latency_seconds = Histogram::new(prometheus_client::metrics::histogram::exponential_buckets(
			0.001, 2.0, 16,
		));
		registry.register(
			"gateway_dispatcher_latency_seconds",
			"Backend round-trip latency",
			dispatcher_latency_seconds.clone(),
		);

		Metrics {
			breaker_state,
			breaker_rejections,
			rate_limiter_allowed,
			rate_limiter_rejected,
			compression_bytes_in,
			compression_bytes_out,
			mirror_dispatched,
			mirror_mismatches,
			ext_auth_cache_hits,
			ext_auth_denied,
			dispatcher_requests,
			dispatcher_latency_seconds,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn registers_without_panicking_and_counters_increment() {
		let mut registry = Registry::default();
		let metrics = Metrics::new(&mut registry);
		metrics
			.dispatcher_requests
			.get_or_create(&DispatchLabel {
				route: "r1".into(),
				status: 200,
			})
			.inc();
		metrics.breaker_state.get_or_create(&RouteLabel { route: "r1".into() }).set(1);
		let mut buf = String::new();
		prometheus_client::encoding::text::encode(&mut buf, &registry).unwrap();
		assert!(buf.contains("gateway_dispatcher_requests"));
	}
}
