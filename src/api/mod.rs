//! HTTP API Module
//!
//! Answers "who leads" over plain HTTP on any path.

mod http;

pub use http::StatusServer;
