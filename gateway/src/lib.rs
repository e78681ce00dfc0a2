//! The per-route policy fabric: the chain of stateful, concurrency-safe
//! engines described in the component-design table, plus the dispatcher
//! that resolves a route, runs its chain, and forwards to a backend.
//!
//! This crate has no opinion on how routes are matched, how config is
//! parsed, or how a server accepts connections — those are external
//! collaborators (`fabric-core::types::route` only models what a route
//! was *configured* to match). A caller builds a [`chain::ChainBuilder`]
//! per route from the engines below, wires a [`dispatcher::Dispatcher`]
//! as its terminal, and swaps the compiled chain in on `Reconfigure`.

pub mod chain;
pub mod control;
pub mod dispatcher;
pub mod engines;
pub mod http_types;
pub mod json;
pub mod ring;
pub mod serdes;
pub mod telemetry;

pub use serdes::{apply, attribute_alias};
