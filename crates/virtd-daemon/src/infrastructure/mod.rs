//! Infrastructure layer of the daemon.
//!
//! Contains OS-facing adapters: socket listeners, peer credential lookup,
//! configuration file storage, the `pkcheck` policy backend, and the
//! in-memory test driver served by the binary.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `virtd_core`, but MUST NOT be imported by the `application` layer outside
//! its tests.

pub mod credentials;
pub mod network;
pub mod polkit;
pub mod storage;
pub mod test_driver;
