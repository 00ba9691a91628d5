//! HTTP API handlers for callsync-engine

pub mod admin;
pub mod calls;
pub mod health;
pub mod sse;
pub mod webhooks;

pub use admin::{admin_auth_middleware, admin_routes};
pub use calls::call_routes;
pub use health::health_routes;
pub use sse::event_stream;
pub use webhooks::webhook_routes;
