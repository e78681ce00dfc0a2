//! Compiled access logging (§4.7), grounded in the teacher's
//! `telemetry::log` module: a raw config is compiled once into canonical
//! header sets, parsed status ranges, and a merged sensitive-header set,
//! then consulted on every request without re-parsing anything.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fabric_core::{GatewayError, VarCtx};
use macro_rules_attribute::apply;
use tracing::info;

use crate::chain::{Middleware, Next};
use crate::http_types::{read_and_restore, read_and_restore_response, Request, Response};
use crate::schema_de;

#[apply(schema_de!)]
pub struct BodyCaptureConfig {
	#[serde(default)]
	pub enabled: bool,
	pub direction: BodyCaptureDirection,
	pub max_size: usize,
	#[serde(default)]
	pub content_type_filter: Vec<String>,
}

#[derive(Debug, Clone, Copy, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyCaptureDirection {
	Request,
	Response,
	Both,
}

#[apply(schema_de!)]
pub struct Config {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default = "default_format")]
	pub format: String,
	#[serde(default)]
	pub include_headers: Vec<String>,
	#[serde(default)]
	pub exclude_headers: Vec<String>,
	#[serde(default)]
	pub sensitive_headers: Vec<String>,
	pub body_capture: Option<BodyCaptureConfig>,
	#[serde(default)]
	pub status_ranges: Vec<String>,
	#[serde(default)]
	pub methods: Vec<String>,
	#[serde(default = "default_sample_rate")]
	pub sample_rate: f64,
}

fn default_format() -> String {
	"%{method} %{path} %{status} %{duration_ms}ms".to_string()
}

fn default_sample_rate() -> f64 {
	1.0
}

const BUILTIN_SENSITIVE: [&str; 4] = ["authorization", "cookie", "set-cookie", "x-api-key"];

/// The crate's whole-body `http_types` vocabulary means a capture pass
/// already has the complete body in hand via read-and-restore; this bound
/// only guards against buffering something absurd, not the `max_size`
/// truncation §4.7 asks for (that is `Captured::truncated` below).
const MAX_BODY_CAPTURE_READ: usize = 16 * 1024 * 1024;

/// A body-capture tee result (§4.7): up to `max_size` bytes mirrored into
/// an internal buffer, with `truncated` set once the real body exceeds
/// that cap — computed here by reading the whole body and comparing
/// lengths rather than stopping a stream mid-flight, the same
/// whole-body simplification `engines::mirror` and `engines::validator`
/// already make.
struct Captured {
	body: String,
	truncated: bool,
}

/// §4.7's content-type gate on body capture: no filter configured means
/// capture everything; otherwise the body's content-type must match one
/// of the configured prefixes (so `"application/json"` also matches
/// `"application/json; charset=utf-8"`).
fn content_type_allowed(filter: &[String], content_type: Option<&str>) -> bool {
	if filter.is_empty() {
		return true;
	}
	let Some(ct) = content_type else {
		return false;
	};
	filter.iter().any(|f| ct.to_ascii_lowercase().starts_with(&f.to_ascii_lowercase()))
}

async fn capture_request_body(req: &mut Request, cfg: &BodyCaptureConfig) -> Option<Captured> {
	let content_type = req
		.headers()
		.get(http::header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok());
	if !content_type_allowed(&cfg.content_type_filter, content_type) {
		return None;
	}
	let bytes = read_and_restore(req, MAX_BODY_CAPTURE_READ).await.ok()?;
	Some(Captured {
		truncated: bytes.len() > cfg.max_size,
		body: String::from_utf8_lossy(&bytes[..bytes.len().min(cfg.max_size)]).into_owned(),
	})
}

async fn capture_response_body(resp: &mut Response, cfg: &BodyCaptureConfig) -> Option<Captured> {
	let content_type = resp
		.headers()
		.get(http::header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok());
	if !content_type_allowed(&cfg.content_type_filter, content_type) {
		return None;
	}
	let bytes = read_and_restore_response(resp, MAX_BODY_CAPTURE_READ).await.ok()?;
	Some(Captured {
		truncated: bytes.len() > cfg.max_size,
		body: String::from_utf8_lossy(&bytes[..bytes.len().min(cfg.max_size)]).into_owned(),
	})
}

/// An inclusive status-code range parsed from `"4xx"`, `"N-M"`, or a bare
/// `"N"`.
#[derive(Debug, Clone, Copy)]
struct StatusRange {
	low: u16,
	high: u16,
}

impl StatusRange {
	fn contains(&self, status: u16) -> bool {
		(self.low..=self.high).contains(&status)
	}
}

fn parse_status_range(s: &str) -> Option<StatusRange> {
	let s = s.trim();
	if let Some(prefix) = s.strip_suffix("xx") {
		let digit: u16 = prefix.parse().ok()?;
		return Some(StatusRange {
			low: digit * 100,
			high: digit * 100 + 99,
		});
	}
	if let Some((lo, hi)) = s.split_once('-') {
		return Some(StatusRange {
			low: lo.trim().parse().ok()?,
			high: hi.trim().parse().ok()?,
		});
	}
	let n: u16 = s.parse().ok()?;
	Some(StatusRange { low: n, high: n })
}

/// Admin-dumpable counters for this engine (§6 Admin surface).
#[derive(Debug, Default, serde::Serialize)]
pub struct Snapshot {
	pub lines_emitted: u64,
	pub lines_skipped: u64,
}

/// The compiled, immutable form of [`Config`] (§3 "Compiled Access-Log
/// Config"). Built once per Reconfigure and swapped in atomically at the
/// call site; this struct itself holds no interior mutability — the
/// counters below are the one exception, since they accumulate across
/// every request this compiled instance ever serves.
pub struct CompiledAccessLog {
	enabled: bool,
	format: String,
	include_headers: HashSet<String>,
	exclude_headers: HashSet<String>,
	sensitive_headers: HashSet<String>,
	body_capture: Option<BodyCaptureConfig>,
	status_ranges: Vec<StatusRange>,
	methods: HashSet<String>,
	sample_rate: f64,
	lines_emitted: AtomicU64,
	lines_skipped: AtomicU64,
}

fn canonicalize<I: IntoIterator<Item = String>>(names: I) -> HashSet<String> {
	names.into_iter().map(|s| s.to_ascii_lowercase()).collect()
}

impl CompiledAccessLog {
	pub fn compile(config: Config) -> Self {
		let mut sensitive = canonicalize(config.sensitive_headers);
		sensitive.extend(BUILTIN_SENSITIVE.iter().map(|s| s.to_string()));
		let status_ranges = config.status_ranges.iter().filter_map(|s| parse_status_range(s)).collect();
		CompiledAccessLog {
			enabled: config.enabled,
			format: config.format,
			include_headers: canonicalize(config.include_headers),
			exclude_headers: canonicalize(config.exclude_headers),
			sensitive_headers: sensitive,
			body_capture: config.body_capture,
			status_ranges,
			methods: canonicalize(config.methods),
			sample_rate: config.sample_rate.clamp(0.0, 1.0),
			lines_emitted: AtomicU64::new(0),
			lines_skipped: AtomicU64::new(0),
		}
	}

	pub fn snapshot(&self) -> Snapshot {
		Snapshot {
			lines_emitted: self.lines_emitted.load(Ordering::Relaxed),
			lines_skipped: self.lines_skipped.load(Ordering::Relaxed),
		}
	}

	/// Dumps the merged sensitive-header set (configured + built-in) for
	/// admin introspection — what this compiled instance actually masks,
	/// not just what `Config` asked for.
	pub fn compiled(&self) -> &HashSet<String> {
		&self.sensitive_headers
	}

	/// §4.7 `should_log`: sample probability, then method filter, then
	/// status-range filter, in that order — an early `false` skips the
	/// remaining, cheaper checks last rather than first since sampling is
	/// the one most likely to short-circuit on a busy route.
	fn should_log(&self, status: u16, method: &str) -> bool {
		if !self.enabled {
			return false;
		}
		if self.sample_rate < 1.0 && !rand::random_bool(self.sample_rate) {
			return false;
		}
		if !self.methods.is_empty() && !self.methods.contains(&method.to_ascii_lowercase()) {
			return false;
		}
		if !self.status_ranges.is_empty() && !self.status_ranges.iter().any(|r| r.contains(status)) {
			return false;
		}
		true
	}

	fn header_allowed(&self, name: &str) -> bool {
		let name = name.to_ascii_lowercase();
		if self.exclude_headers.contains(&name) {
			return false;
		}
		self.include_headers.is_empty() || self.include_headers.contains(&name)
	}

	fn mask(&self, name: &str, value: &str) -> String {
		if self.sensitive_headers.contains(&name.to_ascii_lowercase()) {
			"***".to_string()
		} else {
			value.to_string()
		}
	}

	fn render(&self, method: &str, path: &str, status: u16, duration: Duration) -> String {
		self
			.format
			.replace("%{method}", method)
			.replace("%{path}", path)
			.replace("%{status}", &status.to_string())
			.replace("%{duration_ms}", &duration.as_millis().to_string())
	}
}

#[async_trait]
impl Middleware for CompiledAccessLog {
	async fn handle(&self, ctx: &mut VarCtx, mut req: Request, next: Next<'_>) -> Result<Response, GatewayError> {
		if !self.enabled {
			return next.run(ctx, req).await;
		}

		let method = req.method().to_string();
		let path = req.uri().path().to_string();
		let started = Instant::now();

		let capture_request = matches!(
			self.body_capture.as_ref(),
			Some(BodyCaptureConfig {
				enabled: true,
				direction: BodyCaptureDirection::Request | BodyCaptureDirection::Both,
				..
			})
		);
		let request_capture = if capture_request {
			capture_request_body(&mut req, self.body_capture.as_ref().expect("capture_request implies Some")).await
		} else {
			None
		};

		let headers_to_log: Vec<(String, String)> = req
			.headers()
			.iter()
			.filter(|(name, _)| self.header_allowed(name.as_str()))
			.filter_map(|(name, value)| {
				value
					.to_str()
					.ok()
					.map(|v| (name.as_str().to_string(), self.mask(name.as_str(), v)))
			})
			.collect();

		let mut response = next.run(ctx, req).await?;
		let duration = started.elapsed();
		let status = response.status().as_u16();

		let capture_response = matches!(
			self.body_capture.as_ref(),
			Some(BodyCaptureConfig {
				enabled: true,
				direction: BodyCaptureDirection::Response | BodyCaptureDirection::Both,
				..
			})
		);
		let response_capture = if capture_response {
			capture_response_body(&mut response, self.body_capture.as_ref().expect("capture_response implies Some")).await
		} else {
			None
		};

		if self.should_log(status, &method) {
			self.lines_emitted.fetch_add(1, Ordering::Relaxed);
			info!(
				method = %method,
				path = %path,
				status,
				duration_ms = duration.as_millis() as u64,
				request_id = %ctx.request_id,
				headers = ?headers_to_log,
				request_body = ?request_capture.as_ref().map(|c| &c.body),
				request_body_truncated = request_capture.as_ref().map(|c| c.truncated).unwrap_or(false),
				response_body = ?response_capture.as_ref().map(|c| &c.body),
				response_body_truncated = response_capture.as_ref().map(|c| c.truncated).unwrap_or(false),
				"{}",
				self.render(&method, &path, status, duration)
			);
		} else {
			self.lines_skipped.fetch_add(1, Ordering::Relaxed);
		}

		Ok(response)
	}
}
