//! The policy engines: one module per component listed in the
//! component-design table, each a `Middleware` (or pair of
//! `Middleware`s, for engines with inbound and outbound legs) plus its
//! own `Config` type.

pub mod access_log;
pub mod baggage;
pub mod circuit_breaker;
pub mod compression;
pub mod error_pages;
pub mod ext_auth;
pub mod mirror;
pub mod rate_limiter;
pub mod timeout;
pub mod validator;
pub mod waf;
