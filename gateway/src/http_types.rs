//! The `Request`/`Response`/`Body` vocabulary shared by every engine,
//! grounded in the teacher's `http::{Body, Request, Response}` aliases but
//! built on `http-body-util`'s boxed body instead of `axum_core::body::Body`
//! — the engines here have no dependency on a specific web framework, only
//! on the `http`/`http-body` crates the host server already speaks.

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type Body = BoxBody<Bytes, BoxError>;
pub type Request = http::Request<Body>;
pub type Response = http::Response<Body>;

pub fn empty_body() -> Body {
	Full::new(Bytes::new())
		.map_err(|never: std::convert::Infallible| match never {})
		.boxed()
}

pub fn full_body(bytes: impl Into<Bytes>) -> Body {
	Full::new(bytes.into())
		.map_err(|never: std::convert::Infallible| match never {})
		.boxed()
}

/// Buffer an entire body into `Bytes`, failing if it exceeds `limit`. Used
/// by the validator (request/response JSON) and the ext-auth envelope.
pub async fn to_bytes(body: Body, limit: usize) -> Result<Bytes, BoxError> {
	let collected = http_body_util::Limited::new(body, limit)
		.collect()
		.await
		.map_err(|e| -> BoxError { Box::new(LimitedBodyError(e.to_string())) })?;
	Ok(collected.to_bytes())
}

#[derive(Debug)]
struct LimitedBodyError(String);

impl std::fmt::Display for LimitedBodyError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "body exceeded limit or failed to read: {}", self.0)
	}
}
impl std::error::Error for LimitedBodyError {}

/// Read a request body to completion and put an equivalent, replayable
/// body back in its place — the "read-and-restore" pattern the validator
/// (§4.11) and the access-log request-body capture (§4.7) both need,
/// grounded in the teacher's `json::inspect_body`.
pub async fn read_and_restore(req: &mut Request, limit: usize) -> Result<Bytes, BoxError> {
	let taken = std::mem::replace(req.body_mut(), empty_body());
	let bytes = to_bytes(taken, limit).await?;
	*req.body_mut() = full_body(bytes.clone());
	Ok(bytes)
}

pub async fn read_and_restore_response(
	resp: &mut Response,
	limit: usize,
) -> Result<Bytes, BoxError> {
	let taken = std::mem::replace(resp.body_mut(), empty_body());
	let bytes = to_bytes(taken, limit).await?;
	*resp.body_mut() = full_body(bytes.clone());
	Ok(bytes)
}

pub fn json_body<T: serde::Serialize>(value: &T) -> Result<Body, serde_json::Error> {
	let bytes = serde_json::to_vec(value)?;
	Ok(full_body(bytes))
}

/// Client-IP extraction per §6: the leftmost `X-Forwarded-For` hop, falling
/// back to `X-Real-IP` when that header is absent or unparsable.
pub fn client_ip(headers: &http::HeaderMap) -> Option<std::net::IpAddr> {
	headers
		.get("x-forwarded-for")
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.split(',').next())
		.and_then(|ip| ip.trim().parse().ok())
		.or_else(|| {
			headers
				.get("x-real-ip")
				.and_then(|v| v.to_str().ok())
				.and_then(|ip| ip.trim().parse().ok())
		})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn read_and_restore_preserves_bytes() {
		let mut req = http::Request::new(full_body(Bytes::from_static(b"hello")));
		let read = read_and_restore(&mut req, 1024).await.unwrap();
		assert_eq!(read.as_ref(), b"hello");
		let again = to_bytes(req.into_body(), 1024).await.unwrap();
		assert_eq!(again.as_ref(), b"hello");
	}

	#[tokio::test]
	async fn to_bytes_respects_limit() {
		let body = full_body(Bytes::from_static(b"0123456789"));
		assert!(to_bytes(body, 4).await.is_err());
	}

	#[test]
	fn client_ip_prefers_forwarded_for_over_real_ip() {
		let mut headers = http::HeaderMap::new();
		headers.insert("x-forwarded-for", "203.0.113.1, 10.0.0.1".parse().unwrap());
		headers.insert("x-real-ip", "198.51.100.1".parse().unwrap());
		assert_eq!(client_ip(&headers), Some("203.0.113.1".parse().unwrap()));
	}

	#[test]
	fn client_ip_falls_back_to_real_ip() {
		let mut headers = http::HeaderMap::new();
		headers.insert("x-real-ip", "198.51.100.1".parse().unwrap());
		assert_eq!(client_ip(&headers), Some("198.51.100.1".parse().unwrap()));
	}

	#[test]
	fn client_ip_none_when_neither_header_present() {
		assert_eq!(client_ip(&http::HeaderMap::new()), None);
	}
}
