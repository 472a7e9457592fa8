//! virtd-daemon library crate.
//!
//! The server side of the remote management protocol: it accepts client
//! connections, authenticates them, and translates their calls into calls on
//! the internal management API.
//!
//! # Architecture
//!
//! ```text
//! Client (framed XDR over unix / tcp)
//!         ↕
//! [virtd-daemon]
//!   ├── application/      Context, dispatch, events, auth, migration
//!   └── infrastructure/
//!         ├── network/    Listeners and per-connection sessions (tokio)
//!         ├── storage/    TOML configuration
//!         └── test_driver In-memory management API
//!         ↕
//! Management API (ManagementConnection trait)
//! ```
//!
//! Wire types and the codec live in `virtd-core`.

/// Application layer: protocol engine logic (no I/O).
pub mod application;

/// Infrastructure layer: sockets, credentials, configuration.
pub mod infrastructure;
