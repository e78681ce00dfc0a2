//! WAF bridge (§4.13), grounded in the teacher's `http::ext_authz`
//! request-to-external-engine shape, generalised from "call a remote
//! gRPC service" to "open a transaction against an in-process rule
//! engine" — ModSecurity-compatible engines (e.g. `coraza`) are not pure
//! Rust, so this crate models the engine itself behind a small [`RuleEngine`]
//! trait rather than linking one, the same seam the distributed breaker
//! uses for its external store.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use fabric_core::{GatewayError, RejectReason, VarCtx};
use macro_rules_attribute::apply;

use crate::chain::{Middleware, Next};
use crate::http_types::{client_ip, read_and_restore, Request, Response};
use crate::schema_de;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub enum Mode {
	Block,
	Detect,
}

#[apply(schema_de!)]
pub struct Config {
	#[serde(default)]
	pub inline_rules: Vec<String>,
	#[serde(default)]
	pub rule_files: Vec<String>,
	#[serde(default)]
	pub enable_sqli: bool,
	#[serde(default)]
	pub enable_xss: bool,
	#[serde(default = "default_mode")]
	pub mode: Mode,
	#[serde(default = "default_max_body")]
	pub max_body: usize,
}

fn default_mode() -> Mode {
	Mode::Block
}

fn default_max_body() -> usize {
	256 * 1024
}

/// What the rule engine saw about the request, handed to
/// [`RuleEngine::open_transaction`] in one call rather than the
/// phase-by-phase (connection, URI, headers, body) API a real
/// ModSecurity binding exposes — collapsed here since this crate's
/// request is always fully buffered by the time the WAF stage runs.
pub struct TransactionInput<'a> {
	pub client_addr: Option<std::net::IpAddr>,
	pub method: &'a str,
	pub uri: &'a str,
	pub headers: Vec<(&'a str, &'a str)>,
	pub body: &'a [u8],
}

/// An interruption raised by a rule match in block mode.
#[derive(Debug, Clone)]
pub struct Interruption {
	pub status: u16,
	pub rule_id: Option<String>,
	pub message: String,
}

/// A completed transaction's verdict.
pub enum Verdict {
	Pass,
	Interrupted(Interruption),
}

/// The rule engine seam. A real deployment wires this up to a compiled
/// ModSecurity-style ruleset (inline + file includes + built-ins); this
/// crate only defines the contract §4.13 calls for.
#[async_trait]
pub trait RuleEngine: Send + Sync {
	async fn evaluate(&self, input: TransactionInput<'_>) -> Verdict;
}

/// A `RuleEngine` built from simple substring/regex rules — the degree
/// of "selective built-ins (SQL-i, XSS)" this crate can express without
/// a vendored ModSecurity ruleset: a handful of well-known attack-pattern
/// regexes gated by `enable_sqli`/`enable_xss`, plus one regex per
/// non-empty, non-`#`-comment line loaded from each of `rule_files`, plus
/// `inline_rules` as additional regexes.
pub struct BuiltinRuleEngine {
	patterns: Vec<(String, regex::Regex)>,
}

impl BuiltinRuleEngine {
	pub fn compile(config: &Config) -> Result<Self, GatewayError> {
		let mut patterns = Vec::new();
		if config.enable_sqli {
			patterns.push((
				"sqli-builtin".to_string(),
				regex::Regex::new(r"(?i)(\bunion\s+select\b|\bor\s+1\s*=\s*1\b|;\s*drop\s+table\b|--\s*$)")
					.expect("builtin sqli regex is valid"),
			));
		}
		if config.enable_xss {
			patterns.push((
				"xss-builtin".to_string(),
				regex::Regex::new(r"(?i)(<script\b|on\w+\s*=\s*['\"]|javascript:)")
					.expect("builtin xss regex is valid"),
			));
		}
		for (fi, path) in config.rule_files.iter().enumerate() {
			let contents = std::fs::read_to_string(path)
				.map_err(|e| GatewayError::Configuration(format!("waf rule_files[{fi}] ({path}): {e}")))?;
			for (li, line) in contents.lines().enumerate() {
				let line = line.trim();
				if line.is_empty() || line.starts_with('#') {
					continue;
				}
				let re = regex::Regex::new(line).map_err(|e| {
					GatewayError::Configuration(format!("waf rule_files[{fi}] ({path}) line {}: invalid regex: {e}", li + 1))
				})?;
				patterns.push((format!("file-{fi}-{li}"), re));
			}
		}
		for (i, rule) in config.inline_rules.iter().enumerate() {
			let re = regex::Regex::new(rule)
				.map_err(|e| GatewayError::Configuration(format!("waf inline_rules[{i}] invalid regex: {e}")))?;
			patterns.push((format!("inline-{i}"), re));
		}
		Ok(BuiltinRuleEngine { patterns })
	}
}

#[async_trait]
impl RuleEngine for BuiltinRuleEngine {
	async fn evaluate(&self, input: TransactionInput<'_>) -> Verdict {
		let body_text = String::from_utf8_lossy(input.body);
		let haystacks: Vec<&str> = std::iter::once(input.uri)
			.chain(input.headers.iter().map(|(_, v)| *v))
			.chain(std::iter::once(body_text.as_ref()))
			.collect();
		for (rule_id, pattern) in &self.patterns {
			for haystack in &haystacks {
				if pattern.is_match(haystack) {
					return Verdict::Interrupted(Interruption {
						status: 403,
						rule_id: Some(rule_id.clone()),
						message: format!("blocked by rule {rule_id}"),
					});
				}
			}
		}
		Verdict::Pass
	}
}

/// Admin-dumpable counters for this engine (§6 Admin surface).
#[derive(Debug, Default, serde::Serialize)]
pub struct Snapshot {
	pub transactions_passed: u64,
	pub transactions_interrupted: u64,
}

pub struct WafMiddleware {
	config: Config,
	engine: Box<dyn RuleEngine>,
	transactions_passed: AtomicU64,
	transactions_interrupted: AtomicU64,
}

impl WafMiddleware {
	pub fn new(config: Config, engine: Box<dyn RuleEngine>) -> Self {
		WafMiddleware {
			config,
			engine,
			transactions_passed: AtomicU64::new(0),
			transactions_interrupted: AtomicU64::new(0),
		}
	}

	pub fn compiled(config: Config) -> Result<Self, GatewayError> {
		let engine = Box::new(BuiltinRuleEngine::compile(&config)?);
		Ok(WafMiddleware::new(config, engine))
	}

	pub fn snapshot(&self) -> Snapshot {
		Snapshot {
			transactions_passed: self.transactions_passed.load(Ordering::Relaxed),
			transactions_interrupted: self.transactions_interrupted.load(Ordering::Relaxed),
		}
	}
}

#[async_trait]
impl Middleware for WafMiddleware {
	async fn handle(&self, ctx: &mut VarCtx, mut req: Request, next: Next<'_>) -> Result<Response, GatewayError> {
		let client_addr = client_ip(req.headers());
		let method = req.method().to_string();
		let uri = req.uri().to_string();
		let headers: Vec<(String, String)> = req
			.headers()
			.iter()
			.filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
			.collect();
		let body = read_and_restore(&mut req, self.config.max_body)
			.await
			.map_err(|e| GatewayError::Internal(format!("waf: failed to buffer request body: {e}")))?;

		let input = TransactionInput {
			client_addr,
			method: &method,
			uri: &uri,
			headers: headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect(),
			body: &body,
		};

		// "Always close and log the transaction" (§4.13): the transaction is
		// scope-bound to this `evaluate` call, so it closes deterministically
		// on every return path, including the early interruption below.
		let verdict = self.engine.evaluate(input).await;
		match verdict {
			Verdict::Pass => {
				self.transactions_passed.fetch_add(1, Ordering::Relaxed);
				tracing::trace!(request_id = %ctx.request_id, "waf transaction closed: pass");
			},
			Verdict::Interrupted(interruption) => {
				self.transactions_interrupted.fetch_add(1, Ordering::Relaxed);
				tracing::info!(
					request_id = %ctx.request_id,
					rule_id = ?interruption.rule_id,
					"waf transaction closed: interrupted"
				);
				if self.config.mode == Mode::Block {
					return Err(GatewayError::Rejected {
						engine: "waf",
						reason: RejectReason::WafBlocked {
							status: interruption.status,
							rule_id: interruption.rule_id,
						},
					});
				}
			},
		}
		next.run(ctx, req).await
	}
}

/// The small JSON body a block-mode interruption renders to the client
/// (§4.13 "return the interruption's status with a small JSON body").
pub fn block_response(status: u16, rule_id: Option<&str>) -> Response {
	let body = serde_json::json!({"error": "request blocked", "rule_id": rule_id});
	let bytes = serde_json::to_vec(&body).unwrap_or_else(|_| b"{\"error\":\"request blocked\"}".to_vec());
	http::Response::builder()
		.status(status)
		.header(http::header::CONTENT_TYPE, "application/json")
		.body(crate::http_types::full_body(Bytes::from(bytes)))
		.unwrap_or_else(|_| http::Response::new(crate::http_types::full_body(Bytes::new())))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http_types::full_body;

	struct Echo;
	#[async_trait]
	impl crate::chain::Terminal for Echo {
		async fn call(&self, _ctx: &mut VarCtx, _req: Request) -> Result<Response, GatewayError> {
			Ok(http::Response::new(full_body(bytes::Bytes::from_static(b"ok"))))
		}
	}

	fn cfg(mode: Mode) -> Config {
		Config {
			inline_rules: vec![],
			rule_files: vec![],
			enable_sqli: true,
			enable_xss: true,
			mode,
			max_body: default_max_body(),
		}
	}

	#[tokio::test]
	async fn clean_request_passes() {
		let waf = WafMiddleware::compiled(cfg(Mode::Block)).unwrap();
		let chain = crate::chain::ChainBuilder::new()
			.add(crate::chain::Slot::new("waf", std::sync::Arc::new(waf)))
			.build(std::sync::Arc::new(Echo))
			.unwrap();
		let mut ctx = VarCtx::new(uuid::Uuid::nil());
		let req = http::Request::builder()
			.uri("/search?q=hello")
			.body(full_body(bytes::Bytes::new()))
			.unwrap();
		assert!(chain.run(&mut ctx, req).await.is_ok());
	}

	#[tokio::test]
	async fn snapshot_counts_pass_and_interrupted_transactions() {
		let waf = std::sync::Arc::new(WafMiddleware::compiled(cfg(Mode::Detect)).unwrap());
		let chain = crate::chain::ChainBuilder::new()
			.add(crate::chain::Slot::new("waf", waf.clone()))
			.build(std::sync::Arc::new(Echo))
			.unwrap();
		let mut ctx = VarCtx::new(uuid::Uuid::nil());
		let clean = http::Request::builder()
			.uri("/search?q=hello")
			.body(full_body(bytes::Bytes::new()))
			.unwrap();
		chain.run(&mut ctx, clean).await.unwrap();
		let dirty = http::Request::builder()
			.uri("/search?q=1%20OR%201=1")
			.body(full_body(bytes::Bytes::new()))
			.unwrap();
		chain.run(&mut ctx, dirty).await.unwrap();
		let snap = waf.snapshot();
		assert_eq!(snap.transactions_passed, 1);
		assert_eq!(snap.transactions_interrupted, 1);
	}

	#[tokio::test]
	async fn sqli_pattern_is_blocked_in_block_mode() {
		let waf = WafMiddleware::compiled(cfg(Mode::Block)).unwrap();
		let chain = crate::chain::ChainBuilder::new()
			.add(crate::chain::Slot::new("waf", std::sync::Arc::new(waf)))
			.build(std::sync::Arc::new(Echo))
			.unwrap();
		let mut ctx = VarCtx::new(uuid::Uuid::nil());
		let req = http::Request::builder()
			.uri("/search?q=1%20OR%201=1")
			.body(full_body(bytes::Bytes::new()))
			.unwrap();
		let err = chain.run(&mut ctx, req).await.unwrap_err();
		assert!(matches!(
			err,
			GatewayError::Rejected {
				reason: RejectReason::WafBlocked { .. },
				..
			}
		));
	}

	#[tokio::test]
	async fn detect_mode_logs_and_passes_through() {
		let waf = WafMiddleware::compiled(cfg(Mode::Detect)).unwrap();
		let chain = crate::chain::ChainBuilder::new()
			.add(crate::chain::Slot::new("waf", std::sync::Arc::new(waf)))
			.build(std::sync::Arc::new(Echo))
			.unwrap();
		let mut ctx = VarCtx::new(uuid::Uuid::nil());
		let req = http::Request::builder()
			.uri("/")
			.body(full_body(bytes::Bytes::from_static(b"<script>alert(1)</script>")))
			.unwrap();
		assert!(chain.run(&mut ctx, req).await.is_ok());
	}

	#[tokio::test]
	async fn rule_file_lines_become_blocking_rules() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("rules.txt");
		std::fs::write(&path, "# comment\n\nblocked-by-file\n").unwrap();
		let config = Config {
			inline_rules: vec![],
			rule_files: vec![path.to_str().unwrap().to_string()],
			enable_sqli: false,
			enable_xss: false,
			mode: Mode::Block,
			max_body: default_max_body(),
		};
		let waf = WafMiddleware::compiled(config).unwrap();
		let chain = crate::chain::ChainBuilder::new()
			.add(crate::chain::Slot::new("waf", std::sync::Arc::new(waf)))
			.build(std::sync::Arc::new(Echo))
			.unwrap();
		let mut ctx = VarCtx::new(uuid::Uuid::nil());
		let req = http::Request::builder()
			.uri("/search?q=blocked-by-file")
			.body(full_body(bytes::Bytes::new()))
			.unwrap();
		let err = chain.run(&mut ctx, req).await.unwrap_err();
		assert!(matches!(
			err,
			GatewayError::Rejected {
				reason: RejectReason::WafBlocked { .. },
				..
			}
		));
	}

	#[test]
	fn missing_rule_file_is_a_configuration_error() {
		let config = Config {
			inline_rules: vec![],
			rule_files: vec!["/nonexistent/waf-rules.txt".to_string()],
			enable_sqli: false,
			enable_xss: false,
			mode: Mode::Block,
			max_body: default_max_body(),
		};
		assert!(matches!(
			BuiltinRuleEngine::compile(&config),
			Err(GatewayError::Configuration(_))
		));
	}

	#[test]
	fn invalid_rule_file_regex_is_a_configuration_error() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("rules.txt");
		std::fs::write(&path, "(unclosed\n").unwrap();
		let config = Config {
			inline_rules: vec![],
			rule_files: vec![path.to_str().unwrap().to_string()],
			enable_sqli: false,
			enable_xss: false,
			mode: Mode::Block,
			max_body: default_max_body(),
		};
		assert!(matches!(
			BuiltinRuleEngine::compile(&config),
			Err(GatewayError::Configuration(_))
		));
	}

	#[test]
	fn invalid_inline_rule_is_a_configuration_error() {
		let config = Config {
			inline_rules: vec!["(unclosed".to_string()],
			rule_files: vec![],
			enable_sqli: false,
			enable_xss: false,
			mode: Mode::Block,
			max_body: default_max_body(),
		};
		assert!(matches!(
			BuiltinRuleEngine::compile(&config),
			Err(GatewayError::Configuration(_))
		));
	}
}
