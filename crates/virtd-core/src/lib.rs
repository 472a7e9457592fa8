//! # virtd-core
//!
//! Shared library for the virtd management daemon containing the remote
//! protocol codec, the typed parameter codec, the event model and the error
//! taxonomy.
//!
//! It has no dependency on sockets, threads or the management API itself, so
//! every piece can be tested with plain byte buffers.
//!
//! # Architecture overview (for beginners)
//!
//! A management client talks to the daemon over a stream socket. Each call
//! is one length-prefixed frame: a 24-byte header naming the program,
//! procedure and serial, followed by the procedure's arguments in XDR form.
//! The daemon answers with a reply frame carrying the same serial, or with a
//! structured error. Events fired by the hypervisor reach the client as
//! unsolicited frames of type `MESSAGE`.
//!
//! - **`protocol`** – Framing, XDR primitives, the typed parameter list
//!   codec and the argument/result records of each procedure.
//! - **`domain`** – Instance references, event payloads, typed parameter
//!   values and migration cookies, free of any wire detail.
//! - **`error`** – The [`RpcError`] taxonomy and its mapping to wire error
//!   payloads.

pub mod domain;
pub mod error;
pub mod protocol;

pub use domain::event::{DomainEvent, DomainEventClass, Event, EventClass, EventTarget, NetworkEvent, NetworkEventClass};
pub use domain::instance::{InstanceRef, NetworkRef};
pub use domain::migration::{MigrationCookie, MigrationPhase, MigrationRequest};
pub use domain::typed_param::{TypedParam, TypedValue};
pub use error::{ErrorCode, RpcError, UpstreamError};
pub use protocol::codec::CodecError;
