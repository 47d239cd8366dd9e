//! Resilience layer between the competitive-research application and its
//! LLM completion backend.
//!
//! The layer decides whether and how to call the backend: it pools client
//! instances with TTL eviction, cascades through credential strategies,
//! guards every backend call with a circuit breaker, monitors health and
//! metrics in the background, and hands the report-generation path either a
//! real completion or a typed basic-template fallback.

pub mod backend;
pub mod circuit_breaker;
pub mod config;
pub mod errors;
pub mod factory;
pub mod fallback;
pub mod monitor;
pub mod service;

pub use backend::*;
pub use circuit_breaker::*;
pub use config::*;
pub use errors::*;
pub use factory::*;
pub use fallback::*;
pub use monitor::*;
pub use service::*;
