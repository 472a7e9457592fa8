//! Domain values that travel between the management API and the wire.
//!
//! Nothing in here knows about byte layouts or sockets. The wire forms of
//! these types live in [`crate::protocol`].

pub mod event;
pub mod instance;
pub mod migration;
pub mod typed_param;
