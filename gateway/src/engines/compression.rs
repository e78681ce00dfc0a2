//! Response compression negotiation (§4.6), grounded in the teacher's
//! `http::compression` module: parse `Accept-Encoding` into
//! quality-weighted preferences, pick a server-preferred algorithm, and
//! buffer-then-commit rather than stream, since every response already
//! passes through this crate's boxed body.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use fabric_core::{GatewayError, VarCtx};
use macro_rules_attribute::apply;
use tokio::io::AsyncWriteExt;

use crate::chain::{Middleware, Next};
use crate::http_types::{full_body, to_bytes, Request, Response};
use crate::schema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub enum Algorithm {
	Br,
	Zstd,
	Gzip,
}

impl Algorithm {
	fn token(self) -> &'static str {
		match self {
			Algorithm::Br => "br",
			Algorithm::Zstd => "zstd",
			Algorithm::Gzip => "gzip",
		}
	}

	/// Server preference order when quality ties (§4.6).
	const PREFERENCE: [Algorithm; 3] = [Algorithm::Br, Algorithm::Zstd, Algorithm::Gzip];
}

#[apply(schema!)]
pub struct Config {
	pub algorithms: Vec<Algorithm>,
	pub min_size: usize,
	#[serde(default)]
	pub content_types: Vec<String>,
	#[serde(default = "default_max_body")]
	pub max_body: usize,
}

fn default_max_body() -> usize {
	16 * 1024 * 1024
}

impl Default for Config {
	fn default() -> Self {
		Config {
			algorithms: vec![Algorithm::Br, Algorithm::Zstd, Algorithm::Gzip],
			min_size: 256,
			content_types: vec![
				"text/".into(),
				"application/json".into(),
				"application/javascript".into(),
				"application/xml".into(),
			],
			max_body: default_max_body(),
		}
	}
}

/// One `(quality, encoding-token)` pair parsed out of `Accept-Encoding`.
struct Preference {
	token: String,
	quality: f32,
}

fn parse_accept_encoding(header: &str) -> Vec<Preference> {
	header
		.split(',')
		.filter_map(|part| {
			let part = part.trim();
			if part.is_empty() {
				return None;
			}
			let mut pieces = part.split(';');
			let token = pieces.next()?.trim().to_ascii_lowercase();
			let quality = pieces
				.find_map(|p| {
					let p = p.trim();
					p.strip_prefix("q=").and_then(|v| v.parse::<f32>().ok())
				})
				.unwrap_or(1.0);
			Some(Preference { token, quality })
		})
		.collect()
}

/// Picks the best configured algorithm for a given `Accept-Encoding`
/// header value, honouring `*` and `q=0` per RFC 7231 §5.3.4. Returns
/// `None` if nothing configured is acceptable.
pub fn negotiate(accept_encoding: Option<&str>, configured: &[Algorithm]) -> Option<Algorithm> {
	let Some(header) = accept_encoding else {
		return None;
	};
	let prefs = parse_accept_encoding(header);
	let mut by_token: HashMap<&str, f32> = HashMap::new();
	let mut wildcard_quality: Option<f32> = None;
	for p in &prefs {
		if p.token == "*" {
			wildcard_quality = Some(p.quality);
		} else {
			by_token.insert(p.token.as_str(), p.quality);
		}
	}

	let mut best: Option<(Algorithm, f32)> = None;
	for &alg in configured {
		let q = by_token
			.get(alg.token())
			.copied()
			.or(wildcard_quality)
			.unwrap_or(0.0);
		if q <= 0.0 {
			continue;
		}
		// PREFERENCE order gives a deterministic tie-break: since
		// `configured` is scanned in caller-declared order we instead
		// compare against PREFERENCE rank below.
		let better = match best {
			None => true,
			Some((_, best_q)) if q > best_q => true,
			Some((best_alg, best_q)) if q == best_q => rank(alg) < rank(best_alg),
			_ => false,
		};
		if better {
			best = Some((alg, q));
		}
	}
	best.map(|(alg, _)| alg)
}

fn rank(alg: Algorithm) -> usize {
	Algorithm::PREFERENCE.iter().position(|&a| a == alg).unwrap_or(usize::MAX)
}

fn is_compressible(content_type: Option<&str>, allow_prefixes: &[String]) -> bool {
	let Some(ct) = content_type else {
		return false;
	};
	allow_prefixes.iter().any(|prefix| ct.starts_with(prefix.as_str()))
}

async fn compress(alg: Algorithm, data: &[u8]) -> std::io::Result<Vec<u8>> {
	use async_compression::tokio::write::{BrotliEncoder, GzipEncoder, ZstdEncoder};
	let mut out = Vec::new();
	match alg {
		Algorithm::Br => {
			let mut enc = BrotliEncoder::new(&mut out);
			enc.write_all(data).await?;
			enc.shutdown().await?;
		},
		Algorithm::Zstd => {
			let mut enc = ZstdEncoder::new(&mut out);
			enc.write_all(data).await?;
			enc.shutdown().await?;
		},
		Algorithm::Gzip => {
			let mut enc = GzipEncoder::new(&mut out);
			enc.write_all(data).await?;
			enc.shutdown().await?;
		},
	}
	Ok(out)
}

#[derive(Default)]
struct AlgorithmStats {
	bytes_in: AtomicU64,
	bytes_out: AtomicU64,
	count: AtomicU64,
}

/// One algorithm's admin-dumpable counters, part of the per-engine
/// [`Snapshot`] (§6 Admin surface).
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct AlgorithmSnapshot {
	pub bytes_in: u64,
	pub bytes_out: u64,
	pub count: u64,
}

/// Admin-dumpable counters for every configured algorithm.
#[derive(Debug, Default, serde::Serialize)]
pub struct Snapshot {
	pub by_algorithm: HashMap<Algorithm, AlgorithmSnapshot>,
}

pub struct CompressionMiddleware {
	config: Config,
	stats: HashMap<Algorithm, AlgorithmStats>,
}

impl CompressionMiddleware {
	pub fn new(config: Config) -> Self {
		let mut stats = HashMap::new();
		for &alg in &config.algorithms {
			stats.insert(alg, AlgorithmStats::default());
		}
		CompressionMiddleware { config, stats }
	}

	pub fn stats_for(&self, alg: Algorithm) -> Option<(u64, u64, u64)> {
		self.stats.get(&alg).map(|s| {
			(
				s.bytes_in.load(Ordering::Relaxed),
				s.bytes_out.load(Ordering::Relaxed),
				s.count.load(Ordering::Relaxed),
			)
		})
	}

	pub fn snapshot(&self) -> Snapshot {
		let by_algorithm = self
			.stats
			.iter()
			.map(|(&alg, s)| {
				(
					alg,
					AlgorithmSnapshot {
						bytes_in: s.bytes_in.load(Ordering::Relaxed),
						bytes_out: s.bytes_out.load(Ordering::Relaxed),
						count: s.count.load(Ordering::Relaxed),
					},
				)
			})
			.collect();
		Snapshot { by_algorithm }
	}
}

#[async_trait]
impl Middleware for CompressionMiddleware {
	async fn handle(&self, ctx: &mut VarCtx, req: Request, next: Next<'_>) -> Result<Response, GatewayError> {
		let accept_encoding = req
			.headers()
			.get(http::header::ACCEPT_ENCODING)
			.and_then(|v| v.to_str().ok())
			.map(str::to_string);

		let mut response = next.run(ctx, req).await?;

		let Some(alg) = negotiate(accept_encoding.as_deref(), &self.config.algorithms) else {
			return Ok(response);
		};
		let content_type = response
			.headers()
			.get(http::header::CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.map(str::to_string);
		if !is_compressible(content_type.as_deref(), &self.config.content_types) {
			return Ok(response);
		}

		let body = std::mem::replace(response.body_mut(), crate::http_types::empty_body());
		let bytes = match to_bytes(body, self.config.max_body).await {
			Ok(b) => b,
			Err(_) => return Err(GatewayError::Internal("compression: failed to buffer response body".into())),
		};
		if bytes.len() < self.config.min_size {
			*response.body_mut() = full_body(bytes);
			return Ok(response);
		}

		let compressed = compress(alg, &bytes)
			.await
			.map_err(|e| GatewayError::Internal(format!("compression failed: {e}")))?;

		if let Some(stats) = self.stats.get(&alg) {
			stats.bytes_in.fetch_add(bytes.len() as u64, Ordering::Relaxed);
			stats.bytes_out.fetch_add(compressed.len() as u64, Ordering::Relaxed);
			stats.count.fetch_add(1, Ordering::Relaxed);
		}

		let headers = response.headers_mut();
		headers.remove(http::header::CONTENT_LENGTH);
		headers.insert(
			http::header::CONTENT_ENCODING,
			http::HeaderValue::from_static(alg.token()),
		);
		match headers.entry(http::header::VARY) {
			http::header::Entry::Occupied(mut e) => {
				let mut v = e.get().to_str().unwrap_or_default().to_string();
				if !v.split(',').any(|t| t.trim().eq_ignore_ascii_case("accept-encoding")) {
					if !v.is_empty() {
						v.push_str(", ");
					}
					v.push_str("Accept-Encoding");
					e.insert(http::HeaderValue::from_str(&v).expect("vary header value is valid"));
				}
			},
			http::header::Entry::Vacant(e) => {
				e.insert(http::HeaderValue::from_static("Accept-Encoding"));
			},
		}
		*response.body_mut() = full_body(Bytes::from(compressed));
		Ok(response)
	}
}
