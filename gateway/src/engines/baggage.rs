//! Baggage propagation (§4.12), grounded in the teacher's `http::jwt`
//! module for the `jwt_claim:` extractor (an unverified decode of the
//! bearer token's payload segment — this engine only reads a claim
//! already authenticated upstream, it does not perform authentication
//! itself) and the teacher's `filters::HeaderModifier` for writing the
//! extracted value back onto the outbound request.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::Engine as _;
use fabric_core::{GatewayError, VarCtx};
use macro_rules_attribute::apply;

use crate::chain::{Middleware, Next};
use crate::http_types::{Request, Response};
use crate::schema;

pub const W3C_BAGGAGE_HEADER: &str = "baggage";

#[apply(schema!)]
pub struct Tag {
	pub name: String,
	pub source: Source,
	#[serde(default)]
	pub backend_header: Option<String>,
	#[serde(default)]
	pub baggage_key: Option<String>,
}

/// One extractor kind per §4.12. The `static:` variant carries its literal
/// value directly in the `value` field rather than a lookup key.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub enum Source {
	Header { key: String },
	Cookie { key: String },
	Query { key: String },
	JwtClaim { key: String },
	Static { value: String },
}

#[apply(schema!)]
pub struct Config {
	pub tags: Vec<Tag>,
}

/// Parses the `Cookie` header into a name->value map without validating
/// attributes (`Path`, `Secure`, ...) — baggage extraction only cares
/// about the value of one named cookie.
fn parse_cookies(header: &str) -> BTreeMap<&str, &str> {
	header
		.split(';')
		.filter_map(|pair| {
			let (k, v) = pair.trim().split_once('=')?;
			Some((k.trim(), v.trim()))
		})
		.collect()
}

fn parse_query(query: &str) -> BTreeMap<&str, &str> {
	query
		.split('&')
		.filter_map(|pair| {
			let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
			Some((k, v))
		})
		.collect()
}

/// Decodes the payload segment of a JWT *without verifying its
/// signature*. Baggage only extracts a claim from a token that upstream
/// ext-auth/JWT middleware has already authenticated; re-verifying here
/// would require this engine to carry its own JWKS configuration.
fn decode_jwt_claim_unverified(token: &str, claim: &str) -> Option<String> {
	let payload = token.split('.').nth(1)?;
	let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(payload).ok()?;
	let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
	match value.get(claim)? {
		serde_json::Value::String(s) => Some(s.clone()),
		other => Some(other.to_string()),
	}
}

fn bearer_token(req: &Request) -> Option<&str> {
	req
		.headers()
		.get(http::header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "))
}

/// Parses the W3C `baggage` header into an ordered `key -> value` map,
/// preserving unknown members verbatim so this engine can merge in new
/// ones without dropping whatever an upstream hop already set.
fn parse_w3c_baggage(header: &str) -> BTreeMap<String, String> {
	header
		.split(',')
		.filter_map(|member| {
			let member = member.trim();
			let kv = member.split(';').next()?;
			let (k, v) = kv.split_once('=')?;
			Some((k.trim().to_string(), v.trim().to_string()))
		})
		.collect()
}

fn render_w3c_baggage(members: &BTreeMap<String, String>) -> String {
	members
		.iter()
		.map(|(k, v)| format!("{k}={v}"))
		.collect::<Vec<_>>()
		.join(",")
}

/// Extracts one tag's value from the request surface per its configured
/// [`Source`]. Returns `None` on an empty/absent source, which the
/// caller treats as "skip this tag silently" (§4.12).
fn extract(source: &Source, req: &Request) -> Option<String> {
	let value = match source {
		Source::Header { key } => req
			.headers()
			.get(key.as_str())
			.and_then(|v| v.to_str().ok())
			.map(str::to_string),
		Source::Cookie { key } => req
			.headers()
			.get(http::header::COOKIE)
			.and_then(|v| v.to_str().ok())
			.and_then(|h| parse_cookies(h).get(key.as_str()).map(|v| v.to_string())),
		Source::Query { key } => req
			.uri()
			.query()
			.and_then(|q| parse_query(q).get(key.as_str()).map(|v| v.to_string())),
		Source::JwtClaim { key } => bearer_token(req).and_then(|token| decode_jwt_claim_unverified(token, key)),
		Source::Static { value } => Some(value.clone()),
	};
	value.filter(|v| !v.is_empty())
}

/// Admin-dumpable counters for this engine (§6 Admin surface).
#[derive(Debug, Default, serde::Serialize)]
pub struct Snapshot {
	pub tags_extracted: u64,
	pub tags_skipped_empty: u64,
}

pub struct BaggageMiddleware {
	config: Config,
	tags_extracted: AtomicU64,
	tags_skipped_empty: AtomicU64,
}

impl BaggageMiddleware {
	pub fn new(config: Config) -> Self {
		BaggageMiddleware {
			config,
			tags_extracted: AtomicU64::new(0),
			tags_skipped_empty: AtomicU64::new(0),
		}
	}

	pub fn snapshot(&self) -> Snapshot {
		Snapshot {
			tags_extracted: self.tags_extracted.load(Ordering::Relaxed),
			tags_skipped_empty: self.tags_skipped_empty.load(Ordering::Relaxed),
		}
	}
}

#[async_trait]
impl Middleware for BaggageMiddleware {
	async fn handle(&self, ctx: &mut VarCtx, mut req: Request, next: Next<'_>) -> Result<Response, GatewayError> {
		let mut w3c = req
			.headers()
			.get(W3C_BAGGAGE_HEADER)
			.and_then(|v| v.to_str().ok())
			.map(parse_w3c_baggage)
			.unwrap_or_default();

		for tag in &self.config.tags {
			let Some(value) = extract(&tag.source, &req) else {
				self.tags_skipped_empty.fetch_add(1, Ordering::Relaxed);
				continue;
			};
			self.tags_extracted.fetch_add(1, Ordering::Relaxed);
			ctx.set_custom(tag.name.clone(), value.clone());
			if let Some(header_name) = &tag.backend_header {
				if let (Ok(name), Ok(val)) = (
					http::HeaderName::from_bytes(header_name.as_bytes()),
					http::HeaderValue::from_str(&value),
				) {
					req.headers_mut().insert(name, val);
				}
			}
			if let Some(baggage_key) = &tag.baggage_key {
				w3c.insert(baggage_key.clone(), value);
			}
		}

		if !w3c.is_empty() {
			if let Ok(val) = http::HeaderValue::from_str(&render_w3c_baggage(&w3c)) {
				req.headers_mut().insert(
					http::HeaderName::from_static(W3C_BAGGAGE_HEADER),
					val,
				);
			}
		}

		next.run(ctx, req).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http_types::full_body;

	fn req() -> Request {
		http::Request::builder()
			.uri("/path?tenant=acme")
			.header("x-user", "alice")
			.header("cookie", "session=abc123; other=x")
			.body(full_body(bytes::Bytes::new()))
			.unwrap()
	}

	#[tokio::test]
	async fn extracts_header_cookie_query_and_static() {
		let config = Config {
			tags: vec![
				Tag {
					name: "user".into(),
					source: Source::Header { key: "x-user".into() },
					backend_header: Some("x-baggage-user".into()),
					baggage_key: None,
				},
				Tag {
					name: "session".into(),
					source: Source::Cookie { key: "session".into() },
					backend_header: None,
					baggage_key: Some("session".into()),
				},
				Tag {
					name: "tenant".into(),
					source: Source::Query { key: "tenant".into() },
					backend_header: None,
					baggage_key: None,
				},
				Tag {
					name: "env".into(),
					source: Source::Static { value: "prod".into() },
					backend_header: None,
					baggage_key: None,
				},
			],
		};
		let mw = BaggageMiddleware::new(config);
		let mut ctx = VarCtx::new(uuid::Uuid::nil());

		struct Echo;
		#[async_trait]
		impl crate::chain::Terminal for Echo {
			async fn call(&self, _ctx: &mut VarCtx, req: Request) -> Result<Response, GatewayError> {
				Ok(http::Response::new(crate::http_types::full_body(bytes::Bytes::from(
					req.headers().get("x-baggage-user").unwrap().to_str().unwrap().to_string(),
				))))
			}
		}
		let chain = crate::chain::ChainBuilder::new()
			.add(crate::chain::Slot::new("baggage", std::sync::Arc::new(mw)))
			.build(std::sync::Arc::new(Echo))
			.unwrap();
		let resp = chain.run(&mut ctx, req()).await.unwrap();
		let body = crate::http_types::to_bytes(resp.into_body(), 1024).await.unwrap();
		assert_eq!(body.as_ref(), b"alice");
		assert_eq!(ctx.get_custom("session"), Some("abc123"));
		assert_eq!(ctx.get_custom("tenant"), Some("acme"));
		assert_eq!(ctx.get_custom("env"), Some("prod"));
	}

	#[tokio::test]
	async fn empty_extraction_skips_tag_silently() {
		let config = Config {
			tags: vec![Tag {
				name: "missing".into(),
				source: Source::Header { key: "x-absent".into() },
				backend_header: None,
				baggage_key: None,
			}],
		};
		let mw = std::sync::Arc::new(BaggageMiddleware::new(config));
		let mut ctx = VarCtx::new(uuid::Uuid::nil());

		struct Echo;
		#[async_trait]
		impl crate::chain::Terminal for Echo {
			async fn call(&self, _ctx: &mut VarCtx, _req: Request) -> Result<Response, GatewayError> {
				Ok(http::Response::new(crate::http_types::full_body(bytes::Bytes::new())))
			}
		}
		let chain = crate::chain::ChainBuilder::new()
			.add(crate::chain::Slot::new("baggage", mw.clone()))
			.build(std::sync::Arc::new(Echo))
			.unwrap();
		chain.run(&mut ctx, req()).await.unwrap();
		assert_eq!(ctx.get_custom("missing"), None);
		let snap = mw.snapshot();
		assert_eq!(snap.tags_extracted, 0);
		assert_eq!(snap.tags_skipped_empty, 1);
	}

	#[test]
	fn jwt_claim_extracted_without_verifying_signature() {
		// header {"alg":"none"} . payload {"sub":"u1"} . (no signature)
		let token = format!(
			"{}.{}.",
			base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"{\"alg\":\"none\"}"),
			base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"{\"sub\":\"u1\"}"),
		);
		assert_eq!(decode_jwt_claim_unverified(&token, "sub"), Some("u1".to_string()));
		assert_eq!(decode_jwt_claim_unverified(&token, "missing"), None);
	}

	#[test]
	fn w3c_baggage_round_trips_and_merges() {
		let existing = parse_w3c_baggage("userId=alice,serverNode=DF28");
		let mut merged = existing.clone();
		merged.insert("tenant".to_string(), "acme".to_string());
		let rendered = render_w3c_baggage(&merged);
		let reparsed = parse_w3c_baggage(&rendered);
		assert_eq!(reparsed.get("userId"), Some(&"alice".to_string()));
		assert_eq!(reparsed.get("tenant"), Some(&"acme".to_string()));
	}
}
