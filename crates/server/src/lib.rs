//! HTTP surface of the chatmem memory service
//!
//! The server crate owns the composition root (`AppState::init` wires
//! every component once at startup, no runtime container) and the axum
//! router exposing the memorize/fetch/search/agentic endpoints.

pub mod http;
pub mod metrics;
pub mod state;

pub use http::create_router;
pub use metrics::{init_metrics, metrics_handler};
pub use state::AppState;
