//! # LLM Proxy
//!
//! A multi-tenant, credential-rotating reverse proxy for upstream LLM
//! APIs, plus an asynchronous observability pipeline for every exchange
//! it forwards.
//!
//! ## Architecture
//!
//! - [`config`]: layered TOML/env configuration for both binaries
//! - [`error`]: the crate-wide `ProxyError` status-code taxonomy
//! - [`decode`]: best-effort gzip/brotli reversal shared by metadata
//!   extraction and event transformation
//! - [`model`]: projects, tokens, and the events the proxy emits
//! - [`store`]: token/project lookup traits, implemented out of crate
//! - [`validator`]: token validation behind a bounded, TTL'd cache
//! - [`ratelimit`]: per-token fixed-window admission control
//! - [`respcache`]: a fingerprinted response cache
//! - [`bus`]: the event bus the proxy publishes to and the dispatcher drains
//! - [`instrumentation`]: request recording and the capped response tee
//! - [`proxy`]: the reverse-proxy handler, connection pool, and router state
//! - [`dispatcher`]: batching, retrying, and delivering events to backends
//! - [`telemetry`]: structured logging initialization

#![warn(clippy::all)]

pub mod bus;
pub mod config;
pub mod decode;
pub mod dispatcher;
pub mod error;
pub mod instrumentation;
pub mod model;
pub mod proxy;
pub mod ratelimit;
pub mod respcache;
pub mod store;
pub mod telemetry;
pub mod validator;

/// Crate version, as declared in `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name, as declared in `Cargo.toml`.
pub const NAME: &str = env!("CARGO_PKG_NAME");
