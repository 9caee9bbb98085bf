//! HTTP middleware stack: CORS, per-request tracing and the API token gate.

pub mod auth;
pub mod cors;
pub mod trace;
