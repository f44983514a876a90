//! Gatehouse - rate-limited gate trigger service
//!
//! This crate exposes a small HTTP service that answers health checks and
//! publishes MQTT messages to open physical gates. Every inbound request
//! passes through a per-client sliding-window rate limiter first.

pub mod config;
pub mod error;
pub mod http;
pub mod mqtt;
pub mod ratelimit;
pub mod telemetry;
