//! HTTP surface: health check and gate trigger endpoints.

mod client;
mod handlers;
mod server;

pub use client::{extract_client_ip, sanitize_input, ClientIp, MAX_INPUT_LEN};
pub use handlers::{health_check, publish_gate, AppState};
pub use server::{router, HttpServer};
