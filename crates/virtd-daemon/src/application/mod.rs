//! Application layer of the daemon.
//!
//! Everything here is transport-agnostic: it works on decoded calls and a
//! [`connection::ClientContext`], and reaches the hypervisor only through the
//! traits in [`management`].
//!
//! # Sub-modules
//!
//! - **`connection`** – Per-client state: the management connection handle,
//!   event subscriptions, authentication progress and the teardown path.
//!
//! - **`dispatch`** – Routes CALL frames to handlers after access and
//!   ceiling checks, and turns every failure into a structured error reply.
//!
//! - **`events`** – Registers and deregisters event subscriptions and relays
//!   fired events to the client in the format it asked for.
//!
//! - **`auth`** – The SASL and policy handshake, allow-list and audit log.
//!
//! - **`migration`** – The five-phase migration handshake in both its
//!   fixed-argument and parameter-list forms.
//!
//! - **`keepalive`** – Liveness check driven by the network layer's timer.
//!
//! - **`management`** – The seam to the internal management API.

pub mod auth;
pub mod connection;
pub mod dispatch;
pub mod events;
pub mod keepalive;
pub mod management;
pub mod migration;
