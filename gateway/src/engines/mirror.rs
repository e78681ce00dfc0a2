//! Traffic mirror with response diff (§4.9), grounded in the teacher's
//! `http::ext_authz` outbound-call shape for the fire-and-forget dispatch
//! and the teacher's `telemetry::metrics` counters for per-type mismatch
//! tracking. The mismatch store and latency samples both reuse [`crate::ring::RingBuffer`].
//!
//! This module buffers full bodies rather than wrapping the response
//! writer in a genuine streaming-hash tee: the request/response vocabulary
//! in `http_types` is already whole-body (§4.11's validator and §4.7's
//! access log both buffer-then-restore), so "truncated" here means
//! "longer than `max_body_capture`", decided after a full buffer rather
//! than mid-stream. The comparison semantics are unchanged from the spec.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use fabric_core::{GatewayError, VarCtx};
use macro_rules_attribute::apply;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::chain::{Middleware, Next};
use crate::http_types::{read_and_restore, read_and_restore_response, Request, Response};
use crate::ring::RingBuffer;
use crate::schema_de;

const MIRROR_TIMEOUT: Duration = Duration::from_secs(5);
const LATENCY_RING_CAPACITY: usize = 1000;

#[apply(schema_de!)]
pub struct Config {
	pub backends: Vec<String>,
	#[serde(default)]
	pub methods: Vec<String>,
	#[serde(default)]
	pub headers: BTreeMap<String, String>,
	#[serde(default)]
	pub path_regex: Option<String>,
	#[serde(default = "default_percentage")]
	pub percentage: f64,
	#[serde(default)]
	pub compare: bool,
	#[serde(default)]
	pub detailed_diffs: bool,
	#[serde(default = "default_max_body_capture")]
	pub max_body_capture: usize,
	#[serde(default = "default_max_response_body")]
	pub max_response_body: usize,
	#[serde(default)]
	pub ignore_headers: Vec<String>,
	#[serde(default)]
	pub ignore_json_fields: Vec<String>,
	#[serde(default = "default_mismatch_capacity")]
	pub mismatch_capacity: usize,
}

fn default_percentage() -> f64 {
	100.0
}

fn default_max_body_capture() -> usize {
	64 * 1024
}

fn default_max_response_body() -> usize {
	8 * 1024 * 1024
}

fn default_mismatch_capacity() -> usize {
	200
}

const ALWAYS_IGNORED_HEADERS: [&str; 2] = ["date", "x-request-id"];

/// A buffered view of a body, truncated at `max_body_capture` for
/// diffing purposes only — the untruncated bytes are always what is
/// actually forwarded to the client or the mirror backend.
struct Captured {
	full: Bytes,
	diff_view: Bytes,
	truncated: bool,
}

fn capture(full: Bytes, max_body_capture: usize) -> Captured {
	let truncated = full.len() > max_body_capture;
	let diff_view = full.slice(0..full.len().min(max_body_capture));
	Captured {
		full,
		diff_view,
		truncated,
	}
}

fn sha256_hex(bytes: &[u8]) -> String {
	let mut hasher = Sha256::new();
	hasher.update(bytes);
	hex::encode(hasher.finalize())
}

/// One recorded primary/mirror disagreement, per §4.9's mismatch-store
/// record shape.
#[derive(Debug, Clone, Serialize)]
pub struct MismatchEntry {
	pub timestamp_unix_ms: u64,
	pub method: String,
	pub path: String,
	pub backend: String,
	pub diff_detail: Vec<String>,
	pub diff_types: Vec<&'static str>,
}

#[derive(Default)]
struct Stats {
	mirrored: AtomicU64,
	errors: AtomicU64,
	compared: AtomicU64,
	mismatches: AtomicU64,
	status_mismatches: AtomicU64,
	header_mismatches: AtomicU64,
	body_mismatches: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
	pub mirrored: u64,
	pub errors: u64,
	pub compared: u64,
	pub mismatches: u64,
	pub status_mismatches: u64,
	pub header_mismatches: u64,
	pub body_mismatches: u64,
	pub latency: crate::ring::Percentiles,
}

pub struct MirrorMiddleware {
	config: Config,
	path_regex: Option<Regex>,
	client: reqwest::Client,
	stats: Arc<Stats>,
	latency_micros: Arc<RingBuffer<u64>>,
	mismatch_store: Arc<RingBuffer<MismatchEntry>>,
}

impl MirrorMiddleware {
	pub fn compile(config: Config) -> Result<Self, GatewayError> {
		let path_regex = config
			.path_regex
			.as_deref()
			.map(Regex::new)
			.transpose()
			.map_err(|e| GatewayError::Configuration(format!("invalid mirror path_regex: {e}")))?;
		let mismatch_capacity = config.mismatch_capacity;
		Ok(MirrorMiddleware {
			config,
			path_regex,
			client: reqwest::Client::new(),
			stats: Arc::new(Stats::default()),
			latency_micros: Arc::new(RingBuffer::new(LATENCY_RING_CAPACITY)),
			mismatch_store: Arc::new(RingBuffer::new(mismatch_capacity)),
		})
	}

	pub fn snapshot(&self) -> Snapshot {
		Snapshot {
			mirrored: self.stats.mirrored.load(Ordering::Relaxed),
			errors: self.stats.errors.load(Ordering::Relaxed),
			compared: self.stats.compared.load(Ordering::Relaxed),
			mismatches: self.stats.mismatches.load(Ordering::Relaxed),
			status_mismatches: self.stats.status_mismatches.load(Ordering::Relaxed),
			header_mismatches: self.stats.header_mismatches.load(Ordering::Relaxed),
			body_mismatches: self.stats.body_mismatches.load(Ordering::Relaxed),
			latency: self.latency_micros.percentiles(),
		}
	}

	pub fn recent_mismatches(&self) -> Vec<MismatchEntry> {
		self.mismatch_store.snapshot()
	}

	/// `method set ∩ header equality map ∩ compiled path regex (AND)`,
	/// additionally gated by a uniform-random percentage (§4.9).
	fn should_mirror(&self, req: &Request) -> bool {
		if !self.config.methods.is_empty()
			&& !self
				.config
				.methods
				.iter()
				.any(|m| m.eq_ignore_ascii_case(req.method().as_str()))
		{
			return false;
		}
		for (name, expected) in &self.config.headers {
			let actual = req.headers().get(name.as_str()).and_then(|v| v.to_str().ok());
			if actual != Some(expected.as_str()) {
				return false;
			}
		}
		if let Some(re) = &self.path_regex {
			if !re.is_match(req.uri().path()) {
				return false;
			}
		}
		rand::random_bool((self.config.percentage / 100.0).clamp(0.0, 1.0))
	}
}

#[async_trait]
impl Middleware for MirrorMiddleware {
	async fn handle(&self, ctx: &mut VarCtx, mut req: Request, next: Next<'_>) -> Result<Response, GatewayError> {
		if self.config.backends.is_empty() || !self.should_mirror(&req) {
			return next.run(ctx, req).await;
		}

		let request_bytes = read_and_restore(&mut req, self.config.max_response_body)
			.await
			.map_err(|e| GatewayError::Internal(format!("mirror: failed to buffer request body: {e}")))?;
		let method = req.method().to_string();
		let path = req.uri().path().to_string();
		let headers: Vec<(String, String)> = req
			.headers()
			.iter()
			.filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
			.collect();
		let original_host = req
			.headers()
			.get(http::header::HOST)
			.and_then(|v| v.to_str().ok())
			.unwrap_or("")
			.to_string();

		if !self.config.compare {
			for backend in &self.config.backends {
				self.spawn_dispatch(
					backend.clone(),
					method.clone(),
					path.clone(),
					headers.clone(),
					original_host.clone(),
					request_bytes.clone(),
					None,
				);
			}
			return next.run(ctx, req).await;
		}

		let mut response = next.run(ctx, req).await?;
		let primary_full = read_and_restore_response(&mut response, self.config.max_response_body)
			.await
			.map_err(|e| GatewayError::Internal(format!("mirror: failed to buffer response body: {e}")))?;
		let primary = PrimarySnapshot {
			status: response.status().as_u16(),
			headers: response
				.headers()
				.iter()
				.filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
				.collect(),
			body: capture(primary_full, self.config.max_body_capture),
		};
		let primary = Arc::new(primary);

		for backend in &self.config.backends {
			self.spawn_dispatch(
				backend.clone(),
				method.clone(),
				path.clone(),
				headers.clone(),
				original_host.clone(),
				request_bytes.clone(),
				Some(primary.clone()),
			);
		}

		Ok(response)
	}
}

struct PrimarySnapshot {
	status: u16,
	headers: Vec<(String, String)>,
	body: Captured,
}

impl MirrorMiddleware {
	#[allow(clippy::too_many_arguments)]
	fn spawn_dispatch(
		&self,
		backend: String,
		method: String,
		path: String,
		headers: Vec<(String, String)>,
		original_host: String,
		body: Bytes,
		primary: Option<Arc<PrimarySnapshot>>,
	) {
		let client = self.client.clone();
		let stats = self.stats.clone();
		let latency = self.latency_micros.clone();
		let mismatch_store = self.mismatch_store.clone();
		let ignore_headers = self.config.ignore_headers.clone();
		let ignore_json_fields = self.config.ignore_json_fields.clone();
		let max_body_capture = self.config.max_body_capture;
		let detailed = self.config.detailed_diffs;
		tokio::spawn(async move {
			dispatch_one(
				client,
				stats,
				latency,
				mismatch_store,
				backend,
				method,
				path,
				headers,
				original_host,
				body,
				primary,
				ignore_headers,
				ignore_json_fields,
				max_body_capture,
				detailed,
			)
			.await;
		});
	}
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_one(
	client: reqwest::Client,
	stats: Arc<Stats>,
	latency: Arc<RingBuffer<u64>>,
	mismatch_store: Arc<RingBuffer<MismatchEntry>>,
	backend: String,
	method: String,
	path: String,
	headers: Vec<(String, String)>,
	original_host: String,
	body: Bytes,
	primary: Option<Arc<PrimarySnapshot>>,
	ignore_headers: Vec<String>,
	ignore_json_fields: Vec<String>,
	max_body_capture: usize,
	detailed: bool,
) {
	let Some(url) = rewrite_host(&backend, &path) else {
		stats.errors.fetch_add(1, Ordering::Relaxed);
		return;
	};
	let Ok(verb) = reqwest::Method::from_bytes(method.as_bytes()) else {
		stats.errors.fetch_add(1, Ordering::Relaxed);
		return;
	};

	let mut builder = client.request(verb, url).body(body);
	for (name, value) in &headers {
		if name.eq_ignore_ascii_case("host") {
			continue;
		}
		builder = builder.header(name, value);
	}
	builder = builder.header("X-Mirrored-From", original_host);

	let started = Instant::now();
	let outcome = tokio::time::timeout(MIRROR_TIMEOUT, builder.send()).await;
	stats.mirrored.fetch_add(1, Ordering::Relaxed);

	let response = match outcome {
		Ok(Ok(resp)) => resp,
		Ok(Err(e)) => {
			tracing::debug!(backend = %backend, error = %e, "mirror dispatch failed");
			stats.errors.fetch_add(1, Ordering::Relaxed);
			return;
		},
		Err(_) => {
			tracing::debug!(backend = %backend, "mirror dispatch timed out");
			stats.errors.fetch_add(1, Ordering::Relaxed);
			return;
		},
	};

	let Some(primary) = primary else {
		// Compare off: drain and discard.
		let _ = response.bytes().await;
		latency.push(started.elapsed().as_micros() as u64);
		return;
	};

	let mirror_status = response.status().as_u16();
	let mirror_header_map: Vec<(String, String)> = response
		.headers()
		.iter()
		.filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
		.collect();
	let mirror_bytes = response.bytes().await.unwrap_or_default();
	latency.push(started.elapsed().as_micros() as u64);
	stats.compared.fetch_add(1, Ordering::Relaxed);

	let mirror_body = capture(mirror_bytes, max_body_capture);
	let mut diff_detail = Vec::new();
	let mut diff_types: Vec<&'static str> = Vec::new();

	if primary.status != mirror_status {
		diff_detail.push(format!("status: primary={} mirror={}", primary.status, mirror_status));
		diff_types.push("status");
		stats.status_mismatches.fetch_add(1, Ordering::Relaxed);
	}

	// Only a detailed-diff capture clones the header map and compares it;
	// the plain streaming-hash mode (§4.9) only ever compares status and a
	// whole-body hash.
	if detailed {
		let ignored: Vec<String> = ALWAYS_IGNORED_HEADERS
			.iter()
			.map(|s| s.to_string())
			.chain(ignore_headers.iter().cloned())
			.map(|s| s.to_ascii_lowercase())
			.collect();
		let header_diffs = diff_headers(&primary.headers, &mirror_header_map, &ignored);
		if !header_diffs.is_empty() {
			diff_detail.extend(header_diffs);
			diff_types.push("header");
			stats.header_mismatches.fetch_add(1, Ordering::Relaxed);
		}
	}

	if !detailed || primary.body.truncated || mirror_body.truncated {
		let primary_hash = sha256_hex(&primary.body.full);
		let mirror_hash = sha256_hex(&mirror_body.full);
		if primary_hash != mirror_hash {
			diff_detail.push("hash_mismatch".to_string());
			diff_types.push("body");
			stats.body_mismatches.fetch_add(1, Ordering::Relaxed);
		}
	} else {
		match (
			serde_json::from_slice::<serde_json::Value>(&primary.body.diff_view),
			serde_json::from_slice::<serde_json::Value>(&mirror_body.diff_view),
		) {
			(Ok(a), Ok(b)) => {
				let field_diffs = diff_json(&a, &b, &ignore_json_fields, Vec::new());
				if !field_diffs.is_empty() {
					diff_detail.extend(field_diffs);
					diff_types.push("body");
					stats.body_mismatches.fetch_add(1, Ordering::Relaxed);
				}
			},
			_ => {
				if primary.body.diff_view != mirror_body.diff_view {
					diff_detail.push("content_diff".to_string());
					diff_types.push("body");
					stats.body_mismatches.fetch_add(1, Ordering::Relaxed);
				}
			},
		}
	}

	if !diff_detail.is_empty() {
		stats.mismatches.fetch_add(1, Ordering::Relaxed);
		mismatch_store.push(MismatchEntry {
			timestamp_unix_ms: std::time::SystemTime::now()
				.duration_since(std::time::UNIX_EPOCH)
				.unwrap_or_default()
				.as_millis() as u64,
			method,
			path,
			backend,
			diff_detail,
			diff_types,
		});
	}
}

fn rewrite_host(backend: &str, path: &str) -> Option<url::Url> {
	let base = url::Url::parse(backend).ok()?;
	base.join(path).ok()
}

fn diff_headers(a: &[(String, String)], b: &[(String, String)], ignored: &[String]) -> Vec<String> {
	let am: BTreeMap<String, String> = a
		.iter()
		.filter(|(k, _)| !ignored.contains(&k.to_ascii_lowercase()))
		.map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
		.collect();
	let bm: BTreeMap<String, String> = b
		.iter()
		.filter(|(k, _)| !ignored.contains(&k.to_ascii_lowercase()))
		.map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
		.collect();
	let mut diffs = Vec::new();
	let mut keys: Vec<&String> = am.keys().chain(bm.keys()).collect();
	keys.sort();
	keys.dedup();
	for key in keys {
		match (am.get(key), bm.get(key)) {
			(Some(av), Some(bv)) if av != bv => diffs.push(format!("header {key}: primary={av} mirror={bv}")),
			(Some(_), None) => diffs.push(format!("header {key}: missing on mirror")),
			(None, Some(_)) => diffs.push(format!("header {key}: missing on primary")),
			_ => {},
		}
	}
	diffs
}

/// Recursively compares two JSON values field-by-field, reporting each
/// differing dotted path, skipping any field whose final path segment
/// appears in `ignore`.
fn diff_json(a: &serde_json::Value, b: &serde_json::Value, ignore: &[String], path: Vec<String>) -> Vec<String> {
	use serde_json::Value;
	match (a, b) {
		(Value::Object(am), Value::Object(bm)) => {
			let mut keys: Vec<&String> = am.keys().chain(bm.keys()).collect();
			keys.sort();
			keys.dedup();
			let mut diffs = Vec::new();
			for key in keys {
				if ignore.contains(key) {
					continue;
				}
				let mut child_path = path.clone();
				child_path.push(key.clone());
				match (am.get(key), bm.get(key)) {
					(Some(av), Some(bv)) => diffs.extend(diff_json(av, bv, ignore, child_path)),
					(Some(_), None) => diffs.push(format!("field {}: missing on mirror", child_path.join("."))),
					(None, Some(_)) => diffs.push(format!("field {}: missing on primary", child_path.join("."))),
					(None, None) => unreachable!(),
				}
			}
			diffs
		},
		(Value::Array(al), Value::Array(bl)) if al.len() == bl.len() => al
			.iter()
			.zip(bl.iter())
			.enumerate()
			.flat_map(|(i, (av, bv))| {
				let mut child_path = path.clone();
				child_path.push(i.to_string());
				diff_json(av, bv, ignore, child_path)
			})
			.collect(),
		(a, b) if a != b => {
			if path.last().map(|last| ignore.contains(last)).unwrap_or(false) {
				Vec::new()
			} else {
				vec![format!("field {}: values differ", path.join("."))]
			}
		},
		_ => Vec::new(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http_types::{full_body, to_bytes};

	fn cfg() -> Config {
		Config {
			backends: vec!["http://mirror.internal".to_string()],
			methods: vec![],
			headers: BTreeMap::new(),
			path_regex: None,
			percentage: 100.0,
			compare: false,
			detailed_diffs: true,
			max_body_capture: default_max_body_capture(),
			max_response_body: default_max_response_body(),
			ignore_headers: vec![],
			ignore_json_fields: vec!["ts".to_string()],
			mismatch_capacity: default_mismatch_capacity(),
		}
	}

	struct Echo;
	#[async_trait]
	impl crate::chain::Terminal for Echo {
		async fn call(&self, _ctx: &mut VarCtx, _req: Request) -> Result<Response, GatewayError> {
			Ok(http::Response::new(full_body(Bytes::from_static(b"primary-ok"))))
		}
	}

	#[tokio::test]
	async fn zero_percentage_never_mirrors() {
		let mut c = cfg();
		c.percentage = 0.0;
		let mw = MirrorMiddleware::compile(c).unwrap();
		let chain = crate::chain::ChainBuilder::new()
			.add(crate::chain::Slot::new("mirror", std::sync::Arc::new(mw)))
			.build(std::sync::Arc::new(Echo))
			.unwrap();
		let mut ctx = VarCtx::new(uuid::Uuid::nil());
		let req = http::Request::builder().uri("/x").body(full_body(Bytes::new())).unwrap();
		let resp = chain.run(&mut ctx, req).await.unwrap();
		let body = to_bytes(resp.into_body(), 1024).await.unwrap();
		assert_eq!(body.as_ref(), b"primary-ok");
	}

	#[test]
	fn json_diff_reports_only_non_ignored_field() {
		let a = serde_json::json!({"name":"alice","age":30,"ts":"T1"});
		let b = serde_json::json!({"name":"bob","age":30,"ts":"T2"});
		let diffs = diff_json(&a, &b, &["ts".to_string()], Vec::new());
		assert_eq!(diffs, vec!["field name: values differ".to_string()]);
	}

	#[test]
	fn header_diff_ignores_date_and_request_id_by_default() {
		let a = vec![
			("date".to_string(), "a".to_string()),
			("x-request-id".to_string(), "r1".to_string()),
			("x-custom".to_string(), "v1".to_string()),
		];
		let b = vec![
			("date".to_string(), "b".to_string()),
			("x-request-id".to_string(), "r2".to_string()),
			("x-custom".to_string(), "v2".to_string()),
		];
		let ignored: Vec<String> = ALWAYS_IGNORED_HEADERS.iter().map(|s| s.to_string()).collect();
		let diffs = diff_headers(&a, &b, &ignored);
		assert_eq!(diffs.len(), 1);
		assert!(diffs[0].contains("x-custom"));
	}

	#[test]
	fn hash_mismatch_detected_when_truncated_bodies_differ() {
		let a = capture(Bytes::from_static(b"hello"), 64 * 1024);
		let b = capture(Bytes::from_static(b"world"), 64 * 1024);
		assert_ne!(sha256_hex(&a.full), sha256_hex(&b.full));
	}

	#[test]
	fn mismatch_capacity_bounds_store_but_preserves_total() {
		let store: RingBuffer<MismatchEntry> = RingBuffer::new(2);
		for i in 0..5 {
			store.push(MismatchEntry {
				timestamp_unix_ms: i,
				method: "GET".into(),
				path: "/".into(),
				backend: "b".into(),
				diff_detail: vec![],
				diff_types: vec![],
			});
		}
		assert_eq!(store.len(), 2);
		assert_eq!(store.total(), 5);
	}

	#[test]
	fn rewrite_host_preserves_path() {
		let url = rewrite_host("http://mirror.internal", "/orders/42").unwrap();
		assert_eq!(url.as_str(), "http://mirror.internal/orders/42");
	}
}
