//! # CallSync Common Library
//!
//! Shared code for the call-event ingestion services including:
//! - Database initialization, migrations and row models
//! - Call lifecycle types (statuses, sync state, inbox status)
//! - Event bus for realtime call updates
//! - Configuration loading
//! - Webhook signature validation
//! - Time utilities

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod signature;
pub mod time;
pub mod types;

pub use error::{Error, Result};
pub use types::{CallStatus, EventSource, InboxStatus, SatelliteStatus, SyncState};
