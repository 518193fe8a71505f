//! Tollgate - Rate Limiting Gate for Transactional APIs
//!
//! This crate protects authenticated, money-moving HTTP endpoints from abusive
//! request volume. Requests are bucketed by client, counted against named
//! policies in either a process-local fixed window store or a shared sliding
//! window log, and rejected with a retry hint before any business logic runs.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
