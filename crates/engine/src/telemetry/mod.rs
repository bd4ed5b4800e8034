//! Structured logging and optional OpenTelemetry span export.
//!
//! # Telemetry invariants
//!
//! - **No plaintext PHI, data-key material or search-token plaintext** may
//!   appear in any span attribute or log field. Field names, field types,
//!   clinic IDs, key IDs and error codes may.
//! - Log level is configurable via `LOG_LEVEL` (default: `info`).

pub mod init;

pub use init::{init_telemetry, shutdown_telemetry};
