//! Process-wide observability surface (§9 "Global state: the process
//! holds one logger, one metrics registry, one health-aggregator...").
//! Logging goes through bare `tracing` macros at each call site, matching
//! the teacher's style; this module is only the metrics half, grounded
//! in the teacher's `telemetry::metrics`/`mtrcs` pair.

pub mod metrics;
