//! Network infrastructure.
//!
//! # Sub-modules
//!
//! - **`server`** – Binds the configured listeners, accepts clients up to the
//!   configured caps, and runs one session per connection: a framed reader,
//!   a writer fed by the outbound queue, keep-alive, and dispatch on
//!   blocking worker threads.

pub mod server;
