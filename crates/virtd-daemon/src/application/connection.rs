//! Per-client connection context.
//!
//! One [`ClientContext`] exists for every accepted transport connection. It
//! owns the client's management connection, its event subscriptions and its
//! authentication progress, all behind a single mutex.
//!
//! # Locking rule
//!
//! The mutex is held only for short list and state updates. It is never held
//! while calling into the management API: callers clone the connection handle
//! out, drop the guard, make the call, and re-lock to commit the result.
//!
//! # Lifecycle
//!
//! ```text
//! init ──► attach (ConnectOpen) ──► ... calls ... ──► teardown
//!                                                     ▲
//!                        transport disconnect ────────┘
//! ```
//!
//! `teardown` runs once. It marks every callback record dead before any
//! deregistration reaches the management API, so an event fired concurrently
//! finds nothing to deliver into.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use virtd_core::domain::event::{EventClass, EventTarget};
use virtd_core::error::RpcError;
use virtd_core::protocol::events::DeliveryFormat;
use virtd_core::protocol::sequence::CallbackIdCounter;
use virtd_core::protocol::typed_param::caps;

use crate::application::auth::{AuthPhase, AuthSlot, AuthType};
use crate::application::management::ManagementConnection;

/// Registration id of a record that must not receive events.
pub const UNREGISTERED: i32 = -1;

// ── Transport description ─────────────────────────────────────────────────────

/// How the client reached the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Local stream socket; the kernel vouches for the peer.
    Unix,
    /// Plain TCP.
    Tcp,
    /// TCP wrapped in TLS with a session key of `key_bytes` bytes.
    Tls { key_bytes: u32 },
}

/// OS-level identity of the process on the other end of a local socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
    /// Process start time; `None` when it could not be read.
    pub start_time: Option<u64>,
}

/// Facts about the transport fixed at accept time.
#[derive(Debug, Clone)]
pub struct TransportInfo {
    pub kind: TransportKind,
    /// Accepted on a read-only listener.
    pub read_only: bool,
    /// Authentication the listener demands.
    pub auth_type: AuthType,
    /// Peer credentials, known for local sockets only.
    pub peer: Option<PeerIdentity>,
    /// Printable peer address for logs.
    pub peer_addr: String,
    /// The client must declare keep-alive support before `ConnectOpen`.
    pub keepalive_required: bool,
}

impl TransportInfo {
    /// Local sockets and TLS are confidential without SASL's help.
    pub fn is_secure(&self) -> bool {
        matches!(self.kind, TransportKind::Unix | TransportKind::Tls { .. })
    }
}

// ── Callback records ──────────────────────────────────────────────────────────

/// One event subscription held by a client.
#[derive(Debug, Clone)]
pub struct CallbackRecord {
    /// Local key handed to the relay sink; never reused on a connection.
    pub(crate) key: u64,
    /// Id the client uses to name this subscription.
    pub(crate) callback_id: i32,
    pub(crate) class: EventClass,
    pub(crate) target: Option<EventTarget>,
    /// Id returned by the management API, or [`UNREGISTERED`].
    pub(crate) registration_id: i32,
    pub(crate) format: DeliveryFormat,
}

impl CallbackRecord {
    pub fn is_deliverable(&self) -> bool {
        self.registration_id >= 0
    }

    pub fn is_legacy(&self) -> bool {
        self.format == DeliveryFormat::Legacy
    }
}

// ── Context ───────────────────────────────────────────────────────────────────

/// Mutable per-connection state. Only reachable through [`ClientContext::lock`].
pub(crate) struct ContextState {
    pub(crate) conn: Option<Arc<dyn ManagementConnection>>,
    /// Set by the first successful `attach`; never cleared.
    pub(crate) opened: bool,
    pub(crate) read_only: bool,
    pub(crate) callbacks: Vec<CallbackRecord>,
    pub(crate) next_record_key: u64,
    pub(crate) auth: AuthSlot,
    pub(crate) keepalive_supported: bool,
    /// The peer asked about string-valued typed parameters.
    pub(crate) string_params: bool,
    pub(crate) torn_down: bool,
}

/// State attached to one client connection.
pub struct ClientContext {
    id: u64,
    transport: TransportInfo,
    outbound: mpsc::Sender<Vec<u8>>,
    callback_ids: CallbackIdCounter,
    state: Mutex<ContextState>,
}

impl ClientContext {
    /// Creates the context for a freshly accepted connection.
    ///
    /// `outbound` is the connection's send queue; event frames are pushed
    /// onto it with `try_send`.
    pub fn init(id: u64, transport: TransportInfo, outbound: mpsc::Sender<Vec<u8>>) -> Arc<Self> {
        let phase = if transport.auth_type == AuthType::None {
            AuthPhase::Authenticated
        } else {
            AuthPhase::Unauthenticated
        };
        debug!(conn = id, peer = %transport.peer_addr, auth = ?transport.auth_type, "client context created");
        Arc::new(Self {
            id,
            transport,
            outbound,
            callback_ids: CallbackIdCounter::new(),
            state: Mutex::new(ContextState {
                conn: None,
                opened: false,
                read_only: false,
                callbacks: Vec::new(),
                next_record_key: 0,
                auth: AuthSlot::new(phase),
                keepalive_supported: false,
                string_params: false,
                torn_down: false,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn transport(&self) -> &TransportInfo {
        &self.transport
    }

    pub(crate) fn outbound(&self) -> &mpsc::Sender<Vec<u8>> {
        &self.outbound
    }

    pub(crate) fn callback_ids(&self) -> &CallbackIdCounter {
        &self.callback_ids
    }

    /// Locks the connection state. A poisoned lock is recovered: every
    /// critical section leaves the state consistent before it can panic.
    pub(crate) fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs the management connection opened by `ConnectOpen`.
    ///
    /// # Errors
    ///
    /// - [`RpcError::AlreadyOpen`] on a second call.
    /// - [`RpcError::OperationFailed`] when the transport requires keep-alive
    ///   and the client has not declared support for it.
    /// - [`RpcError::ConnectionNotOpen`] once the context has been torn down.
    pub fn attach(&self, conn: Arc<dyn ManagementConnection>, read_only: bool) -> Result<(), RpcError> {
        let mut st = self.lock();
        if st.torn_down {
            return Err(RpcError::ConnectionNotOpen);
        }
        if st.opened {
            return Err(RpcError::AlreadyOpen);
        }
        if self.transport.keepalive_required && !st.keepalive_supported {
            return Err(RpcError::OperationFailed(
                "keepalive support is required to connect".to_string(),
            ));
        }
        st.conn = Some(conn);
        st.opened = true;
        st.read_only = read_only || self.transport.read_only;
        info!(conn = self.id, read_only = st.read_only, "management connection opened");
        Ok(())
    }

    /// Checks, without opening anything, that `attach` would be accepted.
    ///
    /// # Errors
    ///
    /// Same as [`attach`](Self::attach).
    pub fn can_attach(&self) -> Result<(), RpcError> {
        let st = self.lock();
        if st.torn_down {
            return Err(RpcError::ConnectionNotOpen);
        }
        if st.opened {
            return Err(RpcError::AlreadyOpen);
        }
        if self.transport.keepalive_required && !st.keepalive_supported {
            return Err(RpcError::OperationFailed(
                "keepalive support is required to connect".to_string(),
            ));
        }
        Ok(())
    }

    /// Handle to the open management connection.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ConnectionNotOpen`] before `attach` or after the
    /// connection has been closed.
    pub fn connection(&self) -> Result<Arc<dyn ManagementConnection>, RpcError> {
        self.lock().conn.clone().ok_or(RpcError::ConnectionNotOpen)
    }

    pub fn is_read_only(&self) -> bool {
        let st = self.lock();
        st.read_only || self.transport.read_only
    }

    pub fn is_open(&self) -> bool {
        self.lock().conn.is_some()
    }

    pub fn auth_phase(&self) -> AuthPhase {
        self.lock().auth.phase()
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_phase() == AuthPhase::Authenticated
    }

    pub fn keepalive_supported(&self) -> bool {
        self.lock().keepalive_supported
    }

    pub fn set_keepalive_supported(&self) {
        self.lock().keepalive_supported = true;
    }

    pub fn declare_string_params(&self) {
        self.lock().string_params = true;
    }

    /// Capability flags for typed parameter lists sent to this peer.
    pub fn typed_param_caps(&self) -> u32 {
        if self.lock().string_params {
            caps::TYPED_PARAM_STRING_OKAY
        } else {
            0
        }
    }

    /// Number of live or pending event subscriptions.
    pub fn callback_count(&self) -> usize {
        self.lock().callbacks.len()
    }

    /// Releases the management connection and every event subscription
    /// while keeping the transport up (`ConnectClose`).
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ConnectionNotOpen`] when nothing is open.
    pub fn close_connection(&self) -> Result<(), RpcError> {
        let (ids, conn) = {
            let mut st = self.lock();
            let conn = st.conn.take().ok_or(RpcError::ConnectionNotOpen)?;
            (Self::retire_callbacks(&mut st), conn)
        };
        self.release(ids, conn);
        Ok(())
    }

    /// Final cleanup when the transport goes away. Runs at most once.
    ///
    /// Management API failures are logged and otherwise ignored; the
    /// instance behind a registration may already be gone.
    pub fn teardown(&self) {
        let (ids, conn) = {
            let mut st = self.lock();
            if st.torn_down {
                return;
            }
            st.torn_down = true;
            st.auth.reset();
            (Self::retire_callbacks(&mut st), st.conn.take())
        };
        match conn {
            Some(conn) => self.release(ids, conn),
            None => debug!(conn = self.id, "teardown with no management connection"),
        }
        info!(conn = self.id, "client context torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.lock().torn_down
    }

    /// Marks every record dead, empties the list and returns the ids that
    /// still need deregistering.
    fn retire_callbacks(st: &mut ContextState) -> Vec<i32> {
        let mut ids = Vec::with_capacity(st.callbacks.len());
        for record in st.callbacks.iter_mut() {
            if record.registration_id >= 0 {
                ids.push(record.registration_id);
            }
            record.registration_id = UNREGISTERED;
        }
        st.callbacks.clear();
        ids
    }

    fn release(&self, ids: Vec<i32>, conn: Arc<dyn ManagementConnection>) {
        for id in ids {
            if let Err(e) = conn.deregister_event(id) {
                warn!(conn = self.id, registration_id = id, "failed to deregister event callback: {e}");
            }
        }
        if let Err(e) = conn.close() {
            warn!(conn = self.id, "failed to close management connection: {e}");
        }
    }
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::test_driver::TestDriver;
    use crate::application::management::Hypervisor;

    fn transport(auth_type: AuthType) -> TransportInfo {
        TransportInfo {
            kind: TransportKind::Unix,
            read_only: false,
            auth_type,
            peer: None,
            peer_addr: "unix".to_string(),
            keepalive_required: false,
        }
    }

    fn context(transport: TransportInfo) -> Arc<ClientContext> {
        let (tx, _rx) = mpsc::channel(8);
        ClientContext::init(1, transport, tx)
    }

    #[test]
    fn test_attach_twice_is_already_open() {
        // Arrange
        let driver = TestDriver::new();
        let ctx = context(transport(AuthType::None));
        ctx.attach(driver.open(None, false).expect("open"), false).expect("first attach");

        // Act
        let second = ctx.attach(driver.open(None, false).expect("open"), false);

        // Assert
        assert_eq!(second, Err(RpcError::AlreadyOpen));
    }

    #[test]
    fn test_attach_without_keepalive_fails_when_required() {
        let driver = TestDriver::new();
        let mut t = transport(AuthType::None);
        t.keepalive_required = true;
        let ctx = context(t);

        let err = ctx.attach(driver.open(None, false).expect("open"), false).unwrap_err();

        assert_eq!(
            err,
            RpcError::OperationFailed("keepalive support is required to connect".to_string())
        );
        assert!(!ctx.is_open());
    }

    #[test]
    fn test_attach_after_keepalive_declared_succeeds() {
        let driver = TestDriver::new();
        let mut t = transport(AuthType::None);
        t.keepalive_required = true;
        let ctx = context(t);
        ctx.set_keepalive_supported();

        assert!(ctx.attach(driver.open(None, false).expect("open"), false).is_ok());
    }

    #[test]
    fn test_read_only_listener_forces_read_only() {
        let driver = TestDriver::new();
        let mut t = transport(AuthType::None);
        t.read_only = true;
        let ctx = context(t);

        ctx.attach(driver.open(None, true).expect("open"), false).expect("attach");

        assert!(ctx.is_read_only());
    }

    #[test]
    fn test_connection_before_attach_is_not_open() {
        let ctx = context(transport(AuthType::None));
        assert!(matches!(ctx.connection(), Err(RpcError::ConnectionNotOpen)));
    }

    #[test]
    fn test_teardown_closes_connection_once() {
        // Arrange
        let driver = TestDriver::new();
        let ctx = context(transport(AuthType::None));
        ctx.attach(driver.open(None, false).expect("open"), false).expect("attach");

        // Act
        ctx.teardown();
        ctx.teardown();

        // Assert
        assert_eq!(driver.close_count(), 1);
        assert!(ctx.is_torn_down());
        assert!(matches!(ctx.connection(), Err(RpcError::ConnectionNotOpen)));
    }

    #[test]
    fn test_attach_after_teardown_is_rejected() {
        let driver = TestDriver::new();
        let ctx = context(transport(AuthType::None));
        ctx.teardown();

        let err = ctx.attach(driver.open(None, false).expect("open"), false).unwrap_err();

        assert_eq!(err, RpcError::ConnectionNotOpen);
    }

    #[test]
    fn test_auth_none_listener_starts_authenticated() {
        assert!(context(transport(AuthType::None)).is_authenticated());
        assert!(!context(transport(AuthType::Sasl)).is_authenticated());
    }

    #[test]
    fn test_close_connection_keeps_context_but_rejects_reopen() {
        let driver = TestDriver::new();
        let ctx = context(transport(AuthType::None));
        ctx.attach(driver.open(None, false).expect("open"), false).expect("attach");

        ctx.close_connection().expect("close");

        assert!(!ctx.is_open());
        assert!(!ctx.is_torn_down());
        assert_eq!(driver.close_count(), 1);
        assert_eq!(
            ctx.attach(driver.open(None, false).expect("open"), false),
            Err(RpcError::AlreadyOpen)
        );
    }
}
