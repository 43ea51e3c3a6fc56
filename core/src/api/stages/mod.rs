//! Stage implementations, one module per feature.

pub mod body;
pub mod cors;
pub mod error_boundary;
pub mod observability;
pub mod rate_limit;
pub mod websocket;
