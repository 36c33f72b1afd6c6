//! Floodgate - Request Admission Filter
//!
//! This crate decides, per incoming HTTP request, whether to forward it or
//! reject it with a rate limit error. The single active rule and all request
//! counters live in a store shared by every instance, so limits hold across
//! the whole deployment.

pub mod clock;
pub mod config;
pub mod error;
pub mod filter;
pub mod ratelimit;
pub mod server;
pub mod store;
