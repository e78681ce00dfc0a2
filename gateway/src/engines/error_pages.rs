//! Status-driven error page rendering (§4.8), grounded in the teacher's
//! response-rewriting middlewares that intercept a handler's status code
//! before headers are flushed: three-level match (exact → class →
//! default), content negotiated against `Accept`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use fabric_core::{GatewayError, VarCtx};
use macro_rules_attribute::apply;

use crate::chain::{Middleware, Next};
use crate::http_types::{full_body, Request, Response};
use crate::schema_de;

#[apply(schema_de!)]
pub struct PageEntry {
	#[serde(default)]
	pub html: Option<String>,
	#[serde(default)]
	pub json: Option<String>,
	#[serde(default)]
	pub xml: Option<String>,
}

#[apply(schema_de!)]
pub struct Config {
	/// Exact status code -> page, e.g. `"404"`.
	#[serde(default)]
	pub exact: HashMap<u16, PageEntry>,
	/// Status class -> page, e.g. `"4xx"`, `"5xx"`.
	#[serde(default)]
	pub classes: HashMap<String, PageEntry>,
	#[serde(default)]
	pub default: Option<PageEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Negotiated {
	Html,
	Json,
	Xml,
}

fn negotiate(accept: Option<&str>) -> Negotiated {
	let Some(accept) = accept else {
		return Negotiated::Html;
	};
	// First acceptable match in the client's stated order; unrecognised
	// types fall through to the next, and no match at all defaults html.
	for part in accept.split(',') {
		let mime = part.split(';').next().unwrap_or("").trim();
		match mime {
			"application/json" => return Negotiated::Json,
			"application/xml" | "text/xml" => return Negotiated::Xml,
			"text/html" | "*/*" => return Negotiated::Html,
			_ => continue,
		}
	}
	Negotiated::Html
}

fn render(entry: &PageEntry, negotiated: Negotiated, status: u16) -> (Negotiated, String) {
	match negotiated {
		Negotiated::Json if entry.json.is_some() => (Negotiated::Json, entry.json.clone().unwrap()),
		Negotiated::Xml if entry.xml.is_some() => (Negotiated::Xml, entry.xml.clone().unwrap()),
		_ => {
			if let Some(html) = &entry.html {
				(Negotiated::Html, html.clone())
			} else if let Some(json) = &entry.json {
				(Negotiated::Json, json.clone())
			} else if let Some(xml) = &entry.xml {
				(Negotiated::Xml, xml.clone())
			} else {
				(Negotiated::Html, format!("<html><body>{status}</body></html>"))
			}
		},
	}
}

fn status_class(status: u16) -> String {
	format!("{}xx", status / 100)
}

/// Admin-dumpable counters for this engine (§6 Admin surface).
#[derive(Debug, Default, serde::Serialize)]
pub struct Snapshot {
	pub pages_rendered: u64,
	pub passthrough: u64,
}

pub struct ErrorPages {
	config: Config,
	pages_rendered: AtomicU64,
	passthrough: AtomicU64,
}

impl ErrorPages {
	pub fn new(config: Config) -> Self {
		ErrorPages {
			config,
			pages_rendered: AtomicU64::new(0),
			passthrough: AtomicU64::new(0),
		}
	}

	pub fn snapshot(&self) -> Snapshot {
		Snapshot {
			pages_rendered: self.pages_rendered.load(Ordering::Relaxed),
			passthrough: self.passthrough.load(Ordering::Relaxed),
		}
	}

	/// Three-level match: exact status, then status class, then the
	/// configured default. Returns `None` if nothing is configured for
	/// this status (the original body passes through untouched).
	fn lookup(&self, status: u16) -> Option<&PageEntry> {
		self
			.config
			.exact
			.get(&status)
			.or_else(|| self.config.classes.get(&status_class(status)))
			.or(self.config.default.as_ref())
	}
}

#[async_trait]
impl Middleware for ErrorPages {
	async fn handle(&self, ctx: &mut VarCtx, req: Request, next: Next<'_>) -> Result<Response, GatewayError> {
		let accept = req
			.headers()
			.get(http::header::ACCEPT)
			.and_then(|v| v.to_str().ok())
			.map(str::to_string);

		let mut response = next.run(ctx, req).await?;
		let status = response.status().as_u16();
		if status < 400 {
			return Ok(response);
		}
		let Some(entry) = self.lookup(status) else {
			self.passthrough.fetch_add(1, Ordering::Relaxed);
			return Ok(response);
		};
		self.pages_rendered.fetch_add(1, Ordering::Relaxed);

		let (negotiated, body) = render(entry, negotiate(accept.as_deref()), status);
		let content_type = match negotiated {
			Negotiated::Html => "text/html; charset=utf-8",
			Negotiated::Json => "application/json",
			Negotiated::Xml => "application/xml",
		};

		let headers = response.headers_mut();
		headers.remove(http::header::CONTENT_ENCODING);
		headers.insert(
			http::header::CONTENT_TYPE,
			http::HeaderValue::from_static(content_type),
		);
		headers.insert(
			http::header::CONTENT_LENGTH,
			http::HeaderValue::from_str(&body.len().to_string()).expect("digit string is a valid header value"),
		);
		*response.body_mut() = full_body(body);
		Ok(response)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn page(html: &str) -> PageEntry {
		PageEntry {
			html: Some(html.to_string()),
			json: None,
			xml: None,
		}
	}

	#[test]
	fn exact_match_wins_over_class() {
		let mut exact = HashMap::new();
		exact.insert(404, page("not found"));
		let mut classes = HashMap::new();
		classes.insert("4xx".to_string(), page("client error"));
		let pages = ErrorPages::new(Config {
			exact,
			classes,
			default: None,
		});
		let entry = pages.lookup(404).unwrap();
		assert_eq!(entry.html.as_deref(), Some("not found"));
	}

	#[test]
	fn class_match_used_when_no_exact() {
		let mut classes = HashMap::new();
		classes.insert("5xx".to_string(), page("server error"));
		let pages = ErrorPages::new(Config {
			exact: HashMap::new(),
			classes,
			default: None,
		});
		let entry = pages.lookup(503).unwrap();
		assert_eq!(entry.html.as_deref(), Some("server error"));
	}

	#[test]
	fn default_used_when_nothing_else_matches() {
		let pages = ErrorPages::new(Config {
			exact: HashMap::new(),
			classes: HashMap::new(),
			default: Some(page("fallback")),
		});
		assert_eq!(pages.lookup(499).unwrap().html.as_deref(), Some("fallback"));
	}

	#[test]
	fn no_configuration_means_no_match() {
		let pages = ErrorPages::new(Config {
			exact: HashMap::new(),
			classes: HashMap::new(),
			default: None,
		});
		assert!(pages.lookup(500).is_none());
	}

	#[test]
	fn negotiates_json_over_html_when_requested() {
		assert_eq!(negotiate(Some("application/json")), Negotiated::Json);
		assert_eq!(negotiate(Some("text/html")), Negotiated::Html);
		assert_eq!(negotiate(None), Negotiated::Html);
	}

	#[tokio::test]
	async fn snapshot_tracks_rendered_and_passthrough() {
		let mut exact = HashMap::new();
		exact.insert(404, page("not found"));
		let pages = std::sync::Arc::new(ErrorPages::new(Config {
			exact,
			classes: HashMap::new(),
			default: None,
		}));

		struct FixedStatus(u16);
		#[async_trait]
		impl crate::chain::Terminal for FixedStatus {
			async fn call(&self, _ctx: &mut VarCtx, _req: Request) -> Result<Response, GatewayError> {
				Ok(http::Response::builder()
					.status(self.0)
					.body(full_body(bytes::Bytes::new()))
					.unwrap())
			}
		}

		let mut ctx = VarCtx::new(uuid::Uuid::nil());
		let chain_404 = crate::chain::ChainBuilder::new()
			.add(crate::chain::Slot::new("error_pages", pages.clone()))
			.build(std::sync::Arc::new(FixedStatus(404)))
			.unwrap();
		chain_404
			.run(&mut ctx, http::Request::new(full_body(bytes::Bytes::new())))
			.await
			.unwrap();

		let chain_500 = crate::chain::ChainBuilder::new()
			.add(crate::chain::Slot::new("error_pages", pages.clone()))
			.build(std::sync::Arc::new(FixedStatus(500)))
			.unwrap();
		chain_500
			.run(&mut ctx, http::Request::new(full_body(bytes::Bytes::new())))
			.await
			.unwrap();

		let snap = pages.snapshot();
		assert_eq!(snap.pages_rendered, 1);
		assert_eq!(snap.passthrough, 1);
	}
}
