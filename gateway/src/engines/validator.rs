//! JSON-schema request/response validation (§4.11), grounded in the
//! teacher's read-and-restore pattern (`http_types::read_and_restore`,
//! itself grounded in the teacher's `json::inspect_body`): a schema is
//! compiled once from inline JSON or a file's contents, then every
//! request (and, optionally, response) with a JSON content-type is
//! buffered, parsed, and validated without consuming the body for
//! downstream stages.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use fabric_core::{GatewayError, RejectReason, VarCtx};
use macro_rules_attribute::apply;
use serde::Serialize;

use crate::chain::{Middleware, Next};
use crate::http_types::{read_and_restore, read_and_restore_response, Request, Response};
use crate::schema_de;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub enum Mode {
	Block,
	LogOnly,
}

#[apply(schema_de!)]
pub struct Config {
	/// Inline JSON Schema validating request bodies.
	pub request_schema: Option<serde_json::Value>,
	/// Inline JSON Schema validating response bodies.
	pub response_schema: Option<serde_json::Value>,
	#[serde(default = "default_mode")]
	pub mode: Mode,
	#[serde(default = "default_max_body")]
	pub max_body: usize,
}

fn default_mode() -> Mode {
	Mode::Block
}

fn default_max_body() -> usize {
	1024 * 1024
}

fn is_json_content_type(headers: &http::HeaderMap) -> bool {
	headers
		.get(http::header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.map(|ct| ct.split(';').next().unwrap_or("").trim() == "application/json")
		.unwrap_or(false)
}

#[derive(Debug, Default, Serialize)]
pub struct Snapshot {
	pub requests_validated: u64,
	pub requests_failed: u64,
	pub responses_validated: u64,
	pub responses_failed: u64,
}

#[derive(Default)]
struct Counters {
	requests_validated: AtomicU64,
	requests_failed: AtomicU64,
	responses_validated: AtomicU64,
	responses_failed: AtomicU64,
}

/// Compiled form of [`Config`]: the request/response schemas are parsed
/// into `jsonschema::Validator`s once, at `compile` time — never on the
/// request path (§7 "schema parse failure. Surfaced at build-time only").
pub struct CompiledValidator {
	request_schema: Option<jsonschema::Validator>,
	response_schema: Option<jsonschema::Validator>,
	mode: Mode,
	max_body: usize,
	counters: Counters,
}

impl CompiledValidator {
	pub fn compile(config: Config) -> Result<Self, GatewayError> {
		let request_schema = config
			.request_schema
			.as_ref()
			.map(|v| jsonschema::validator_for(v))
			.transpose()
			.map_err(|e| GatewayError::Configuration(format!("invalid request schema: {e}")))?;
		let response_schema = config
			.response_schema
			.as_ref()
			.map(|v| jsonschema::validator_for(v))
			.transpose()
			.map_err(|e| GatewayError::Configuration(format!("invalid response schema: {e}")))?;
		Ok(CompiledValidator {
			request_schema,
			response_schema,
			mode: config.mode,
			max_body: config.max_body,
			counters: Counters::default(),
		})
	}

	pub fn snapshot(&self) -> Snapshot {
		Snapshot {
			requests_validated: self.counters.requests_validated.load(Ordering::Relaxed),
			requests_failed: self.counters.requests_failed.load(Ordering::Relaxed),
			responses_validated: self.counters.responses_validated.load(Ordering::Relaxed),
			responses_failed: self.counters.responses_failed.load(Ordering::Relaxed),
		}
	}

	/// Validates `bytes` as JSON against `schema`, returning a sanitized
	/// one-line detail string on failure — the raw `jsonschema` error may
	/// quote request data, so only the failing instance path is surfaced
	/// (§7 "sanitized error detail").
	fn validate(schema: &jsonschema::Validator, bytes: &[u8]) -> Result<(), String> {
		let value: serde_json::Value = serde_json::from_slice(bytes).map_err(|e| format!("invalid JSON: {e}"))?;
		if let Some(error) = schema.iter_errors(&value).next() {
			return Err(format!("schema violation at {}", error.instance_path));
		}
		Ok(())
	}
}

#[async_trait]
impl Middleware for CompiledValidator {
	async fn handle(&self, ctx: &mut VarCtx, mut req: Request, next: Next<'_>) -> Result<Response, GatewayError> {
		if let Some(schema) = &self.request_schema {
			if is_json_content_type(req.headers()) {
				let bytes = read_and_restore(&mut req, self.max_body)
					.await
					.map_err(|e| GatewayError::Internal(format!("validator: failed to buffer request body: {e}")))?;
				match Self::validate(schema, &bytes) {
					Ok(()) => {
						self.counters.requests_validated.fetch_add(1, Ordering::Relaxed);
					},
					Err(detail) => {
						self.counters.requests_failed.fetch_add(1, Ordering::Relaxed);
						if self.mode == Mode::Block {
							return Err(GatewayError::Rejected {
								engine: "validator",
								reason: RejectReason::ValidationFailed { detail },
							});
						}
						tracing::warn!(request_id = %ctx.request_id, %detail, "request body failed schema validation (log-only)");
					},
				}
			}
		}

		let mut response = next.run(ctx, req).await?;

		if let Some(schema) = &self.response_schema {
			if is_json_content_type(response.headers()) {
				let bytes = read_and_restore_response(&mut response, self.max_body)
					.await
					.map_err(|e| GatewayError::Internal(format!("validator: failed to buffer response body: {e}")))?;
				match Self::validate(schema, &bytes) {
					Ok(()) => {
						self.counters.responses_validated.fetch_add(1, Ordering::Relaxed);
					},
					Err(detail) => {
						self.counters.responses_failed.fetch_add(1, Ordering::Relaxed);
						if self.mode == Mode::Block {
							return Err(GatewayError::Rejected {
								engine: "validator",
								reason: RejectReason::ValidationFailed { detail },
							});
						}
						tracing::warn!(request_id = %ctx.request_id, %detail, "response body failed schema validation (log-only)");
					},
				}
			}
		}

		Ok(response)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http_types::full_body;

	fn schema_cfg(mode: Mode) -> Config {
		Config {
			request_schema: Some(serde_json::json!({
				"type": "object",
				"required": ["name"],
				"properties": {"name": {"type": "string"}},
			})),
			response_schema: None,
			mode,
			max_body: default_max_body(),
		}
	}

	struct Echo;
	#[async_trait]
	impl crate::chain::Terminal for Echo {
		async fn call(&self, _ctx: &mut VarCtx, _req: Request) -> Result<Response, GatewayError> {
			Ok(http::Response::new(full_body(bytes::Bytes::from_static(b"ok"))))
		}
	}

	fn req(body: &'static [u8]) -> Request {
		http::Request::builder()
			.header(http::header::CONTENT_TYPE, "application/json")
			.body(full_body(bytes::Bytes::from_static(body)))
			.unwrap()
	}

	#[tokio::test]
	async fn valid_body_passes_through() {
		let validator = CompiledValidator::compile(schema_cfg(Mode::Block)).unwrap();
		let chain = crate::chain::ChainBuilder::new()
			.add(crate::chain::Slot::new("validator", std::sync::Arc::new(validator)))
			.build(std::sync::Arc::new(Echo))
			.unwrap();
		let mut ctx = VarCtx::new(uuid::Uuid::nil());
		let res = chain.run(&mut ctx, req(br#"{"name":"alice"}"#)).await;
		assert!(res.is_ok());
	}

	#[tokio::test]
	async fn block_mode_rejects_invalid_body() {
		let validator = CompiledValidator::compile(schema_cfg(Mode::Block)).unwrap();
		let chain = crate::chain::ChainBuilder::new()
			.add(crate::chain::Slot::new("validator", std::sync::Arc::new(validator)))
			.build(std::sync::Arc::new(Echo))
			.unwrap();
		let mut ctx = VarCtx::new(uuid::Uuid::nil());
		let res = chain.run(&mut ctx, req(br#"{"age":30}"#)).await;
		assert!(matches!(
			res,
			Err(GatewayError::Rejected {
				reason: RejectReason::ValidationFailed { .. },
				..
			})
		));
	}

	#[tokio::test]
	async fn log_only_mode_passes_through_invalid_body() {
		let validator = CompiledValidator::compile(schema_cfg(Mode::LogOnly)).unwrap();
		let chain = crate::chain::ChainBuilder::new()
			.add(crate::chain::Slot::new("validator", std::sync::Arc::new(validator)))
			.build(std::sync::Arc::new(Echo))
			.unwrap();
		let mut ctx = VarCtx::new(uuid::Uuid::nil());
		let res = chain.run(&mut ctx, req(br#"{"age":30}"#)).await;
		assert!(res.is_ok());
	}

	#[test]
	fn invalid_schema_is_a_configuration_error() {
		let config = Config {
			request_schema: Some(serde_json::json!({"type": "not-a-real-type"})),
			response_schema: None,
			mode: Mode::Block,
			max_body: default_max_body(),
		};
		assert!(matches!(
			CompiledValidator::compile(config),
			Err(GatewayError::Configuration(_))
		));
	}
}
