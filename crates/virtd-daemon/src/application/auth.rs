//! Authentication negotiator.
//!
//! Two paths lead to [`AuthPhase::Authenticated`]:
//!
//! ```text
//! challenge/response:  Unauthenticated ─► MechanismOffered ─► StepInProgress* ─► Authenticated
//! policy check:        Unauthenticated ─► PolicyChecked ─────────────────────► Authenticated
//! ```
//!
//! A `Complete` from the SASL library is necessary but not sufficient: the
//! negotiated key strength and the resulting username are checked before the
//! phase moves. Every failure resets the slot to `Unauthenticated` and is
//! reported to the peer as a bare "authentication failed"; the real reason
//! only reaches the `virtd::audit` log target.
//!
//! The SASL library and the policy engine sit behind the [`SaslServer`],
//! [`SaslSession`] and [`PolicyEngine`] traits.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use virtd_core::error::RpcError;
use virtd_core::protocol::limits::AUTH_SASL_DATA_MAX;

use crate::application::connection::{ClientContext, PeerIdentity, TransportInfo, TransportKind};

/// Smallest key strength accepted on a transport that is not already
/// confidential.
pub const MIN_SSF: u32 = 56;

/// Policy action for read-only connections.
pub const ACTION_MONITOR: &str = "org.libvirt.unix.monitor";
/// Policy action for read-write connections.
pub const ACTION_MANAGE: &str = "org.libvirt.unix.manage";

const AUDIT: &str = "virtd::audit";

// ── Types and phases ──────────────────────────────────────────────────────────

/// Authentication a listener demands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum AuthType {
    None = 0,
    Sasl = 1,
    #[serde(rename = "polkit", alias = "policy")]
    Policy = 2,
}

impl TryFrom<i32> for AuthType {
    type Error = ();

    fn try_from(value: i32) -> Result<Self, ()> {
        match value {
            0 => Ok(AuthType::None),
            1 => Ok(AuthType::Sasl),
            2 => Ok(AuthType::Policy),
            _ => Err(()),
        }
    }
}

/// Where a connection stands in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Unauthenticated,
    /// `AuthSaslInit` succeeded; a mechanism may be started.
    MechanismOffered,
    /// The SASL exchange wants more steps.
    StepInProgress,
    /// The policy engine is being consulted.
    PolicyChecked,
    Authenticated,
}

/// Per-connection authentication state, stored in the context.
pub struct AuthSlot {
    phase: AuthPhase,
    session: Option<Box<dyn SaslSession>>,
    /// Bumped by every reset so a call that ran outside the lock can tell
    /// whether its exchange is still the current one.
    attempt: u64,
}

impl AuthSlot {
    pub fn new(phase: AuthPhase) -> Self {
        Self {
            phase,
            session: None,
            attempt: 0,
        }
    }

    pub fn phase(&self) -> AuthPhase {
        self.phase
    }

    /// Drops any SASL session and returns to `Unauthenticated`.
    pub fn reset(&mut self) {
        self.phase = AuthPhase::Unauthenticated;
        self.session = None;
        self.attempt += 1;
    }
}

// ── Backend seams ─────────────────────────────────────────────────────────────

/// Failure reported by the SASL library.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct SaslError(pub String);

/// Result of one SASL start or step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslOutcome {
    /// The mechanism wants another step; the data goes back to the client.
    Continue(Option<Vec<u8>>),
    /// The library considers the exchange finished.
    Complete(Option<Vec<u8>>),
}

/// Factory for server-side SASL sessions.
#[cfg_attr(test, mockall::automock)]
pub trait SaslServer: Send + Sync {
    fn new_session(&self, transport: &TransportInfo) -> Result<Box<dyn SaslSession>, SaslError>;
}

/// One server-side SASL exchange.
#[cfg_attr(test, mockall::automock)]
pub trait SaslSession: Send {
    fn mechanisms(&self) -> Result<Vec<String>, SaslError>;

    /// Declares the key strength the transport already provides.
    fn set_external_ssf(&mut self, ssf: u32) -> Result<(), SaslError>;

    fn start(&mut self, mechanism: &str, data: Option<Vec<u8>>) -> Result<SaslOutcome, SaslError>;

    fn step(&mut self, data: Option<Vec<u8>>) -> Result<SaslOutcome, SaslError>;

    /// Negotiated security strength factor.
    fn ssf(&self) -> Result<u32, SaslError>;

    fn username(&self) -> Result<String, SaslError>;
}

/// Answer of the external policy engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny,
    /// The engine could not be asked or gave no answer.
    Error(String),
}

#[cfg_attr(test, mockall::automock)]
pub trait PolicyEngine: Send + Sync {
    fn check(&self, action: &str, peer: &PeerIdentity) -> PolicyDecision;
}

// ── Allow list ────────────────────────────────────────────────────────────────

/// Glob patterns a SASL username must match. `None` admits everyone.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    patterns: Option<Vec<glob::Pattern>>,
}

impl AllowList {
    pub fn allow_all() -> Self {
        Self { patterns: None }
    }

    /// # Errors
    ///
    /// Returns the first pattern that fails to compile.
    pub fn from_patterns(patterns: &[String]) -> Result<Self, glob::PatternError> {
        let compiled = patterns
            .iter()
            .map(|p| glob::Pattern::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns: Some(compiled),
        })
    }

    pub fn permits(&self, username: &str) -> bool {
        match &self.patterns {
            None => true,
            Some(list) => list.iter().any(|p| p.matches(username)),
        }
    }
}

// ── Negotiator ────────────────────────────────────────────────────────────────

/// Which SASL call is driving the exchange.
enum Exchange {
    Start { mechanism: String },
    Step,
}

/// Drives the handshake for every connection.
#[derive(Clone, Default)]
pub struct AuthNegotiator {
    sasl: Option<Arc<dyn SaslServer>>,
    policy: Option<Arc<dyn PolicyEngine>>,
    allow_list: AllowList,
}

impl AuthNegotiator {
    pub fn new(
        sasl: Option<Arc<dyn SaslServer>>,
        policy: Option<Arc<dyn PolicyEngine>>,
        allow_list: AllowList,
    ) -> Self {
        Self {
            sasl,
            policy,
            allow_list,
        }
    }

    /// Auth types the client must use on this connection.
    ///
    /// A policy-checked listener lets the local superuser straight through:
    /// the connection becomes authenticated and the list reads `[None]`.
    pub fn auth_list(&self, ctx: &ClientContext) -> Vec<AuthType> {
        let transport = ctx.transport();
        if transport.auth_type == AuthType::Policy {
            if let Some(peer) = transport.peer.as_ref().filter(|p| p.uid == 0) {
                let mut st = ctx.lock();
                if st.auth.phase == AuthPhase::Unauthenticated {
                    st.auth.phase = AuthPhase::Authenticated;
                    info!(
                        target: AUDIT,
                        conn = ctx.id(),
                        auth = ?AuthType::Policy,
                        uid = peer.uid,
                        pid = peer.pid,
                        outcome = "bypass",
                        "superuser bypassed policy check"
                    );
                }
                return vec![AuthType::None];
            }
        }
        vec![transport.auth_type]
    }

    /// Opens a SASL session and returns the comma-separated mechanism list.
    ///
    /// # Errors
    ///
    /// [`RpcError::AuthenticationFailed`] when the listener does not use
    /// SASL, an exchange already started, or the library refuses.
    pub fn sasl_init(&self, ctx: &ClientContext) -> Result<String, RpcError> {
        let transport = ctx.transport();
        let attempt = {
            let st = ctx.lock();
            if transport.auth_type != AuthType::Sasl || st.auth.phase != AuthPhase::Unauthenticated {
                drop(st);
                return Err(self.fail(ctx, "sasl init in wrong state"));
            }
            st.auth.attempt
        };
        let server = match &self.sasl {
            Some(s) => s,
            None => return Err(self.fail(ctx, "sasl not available")),
        };

        let mut session = server
            .new_session(transport)
            .map_err(|e| self.fail(ctx, &format!("cannot create sasl session: {e}")))?;
        if let TransportKind::Tls { key_bytes } = transport.kind {
            session
                .set_external_ssf(key_bytes.saturating_mul(8))
                .map_err(|e| self.fail(ctx, &format!("cannot set external ssf: {e}")))?;
        }
        let mechlist = session
            .mechanisms()
            .map_err(|e| self.fail(ctx, &format!("cannot list mechanisms: {e}")))?
            .join(",");

        let mut st = ctx.lock();
        if st.auth.attempt != attempt || st.auth.phase != AuthPhase::Unauthenticated {
            drop(st);
            return Err(self.fail(ctx, "concurrent sasl init"));
        }
        st.auth.session = Some(session);
        st.auth.phase = AuthPhase::MechanismOffered;
        debug!(conn = ctx.id(), mechlist = %mechlist, "sasl mechanisms offered");
        Ok(mechlist)
    }

    /// Starts the exchange with `mechanism`. Returns `(complete, data)`.
    ///
    /// # Errors
    ///
    /// [`RpcError::AuthenticationFailed`] on any failure.
    pub fn sasl_start(
        &self,
        ctx: &ClientContext,
        mechanism: &str,
        data: Option<Vec<u8>>,
    ) -> Result<(bool, Option<Vec<u8>>), RpcError> {
        self.drive(
            ctx,
            AuthPhase::MechanismOffered,
            Exchange::Start {
                mechanism: mechanism.to_string(),
            },
            data,
        )
    }

    /// Continues the exchange. Returns `(complete, data)`.
    ///
    /// # Errors
    ///
    /// [`RpcError::AuthenticationFailed`] on any failure.
    pub fn sasl_step(&self, ctx: &ClientContext, data: Option<Vec<u8>>) -> Result<(bool, Option<Vec<u8>>), RpcError> {
        self.drive(ctx, AuthPhase::StepInProgress, Exchange::Step, data)
    }

    fn drive(
        &self,
        ctx: &ClientContext,
        expected: AuthPhase,
        exchange: Exchange,
        data: Option<Vec<u8>>,
    ) -> Result<(bool, Option<Vec<u8>>), RpcError> {
        let (mut session, attempt) = {
            let mut st = ctx.lock();
            if ctx.transport().auth_type != AuthType::Sasl || st.auth.phase != expected {
                drop(st);
                return Err(self.fail(ctx, "sasl exchange in wrong state"));
            }
            match st.auth.session.take() {
                Some(s) => (s, st.auth.attempt),
                None => {
                    drop(st);
                    return Err(self.fail(ctx, "no sasl session"));
                }
            }
        };

        let outcome = match exchange {
            Exchange::Start { mechanism } => {
                debug!(conn = ctx.id(), mechanism = %mechanism, "sasl start");
                session.start(&mechanism, data)
            }
            Exchange::Step => session.step(data),
        }
        .map_err(|e| self.fail(ctx, &format!("sasl exchange failed: {e}")))?;

        let (complete, reply) = match outcome {
            SaslOutcome::Continue(reply) => (false, reply),
            SaslOutcome::Complete(reply) => (true, reply),
        };
        if let Some(bytes) = &reply {
            if bytes.len() > AUTH_SASL_DATA_MAX {
                return Err(self.fail(
                    ctx,
                    &format!("sasl reply data {} exceeds {}", bytes.len(), AUTH_SASL_DATA_MAX),
                ));
            }
        }

        let username = if complete {
            Some(self.final_check(ctx, session.as_ref())?)
        } else {
            None
        };

        let mut st = ctx.lock();
        if st.auth.attempt != attempt {
            drop(st);
            return Err(self.fail(ctx, "sasl exchange superseded"));
        }
        match &username {
            Some(name) => {
                st.auth.phase = AuthPhase::Authenticated;
                info!(
                    target: AUDIT,
                    conn = ctx.id(),
                    auth = ?AuthType::Sasl,
                    username = %name,
                    outcome = "allow",
                    "sasl authentication succeeded"
                );
            }
            None => {
                st.auth.phase = AuthPhase::StepInProgress;
                st.auth.session = Some(session);
            }
        }
        Ok((complete, reply))
    }

    /// Key strength and allow-list checks run once the library reports
    /// completion. Returns the authenticated username.
    fn final_check(&self, ctx: &ClientContext, session: &dyn SaslSession) -> Result<String, RpcError> {
        let transport = ctx.transport();
        if !transport.is_secure() {
            let ssf = session
                .ssf()
                .map_err(|e| self.fail(ctx, &format!("cannot query ssf: {e}")))?;
            if ssf < MIN_SSF {
                return Err(self.fail(ctx, &format!("negotiated ssf {ssf} was below {MIN_SSF}")));
            }
        }
        let username = session
            .username()
            .map_err(|e| self.fail(ctx, &format!("no sasl username: {e}")))?;
        if !self.allow_list.permits(&username) {
            return Err(self.fail(ctx, &format!("sasl username {username} not in allow list")));
        }
        Ok(username)
    }

    /// Asks the policy engine whether the local peer may connect.
    ///
    /// # Errors
    ///
    /// - [`RpcError::AuthenticationFailed`] when the listener does not use
    ///   policy checks, the peer identity (including its process start time)
    ///   is unknown, or the engine gives no answer.
    /// - [`RpcError::AuthenticationDenied`] when the engine says no.
    pub fn check_policy(&self, ctx: &ClientContext) -> Result<(), RpcError> {
        let transport = ctx.transport();
        let attempt = {
            let mut st = ctx.lock();
            if transport.auth_type != AuthType::Policy || st.auth.phase != AuthPhase::Unauthenticated {
                drop(st);
                return Err(self.fail(ctx, "policy check in wrong state"));
            }
            st.auth.phase = AuthPhase::PolicyChecked;
            st.auth.attempt
        };

        let peer = match &transport.peer {
            Some(peer) => peer,
            None => return Err(self.fail(ctx, "cannot resolve peer identity")),
        };
        if peer.start_time.is_none() {
            return Err(self.fail(ctx, &format!("cannot determine start time of pid {}", peer.pid)));
        }
        let engine = match &self.policy {
            Some(engine) => engine,
            None => return Err(self.fail(ctx, "policy engine not available")),
        };

        let action = if transport.read_only {
            ACTION_MONITOR
        } else {
            ACTION_MANAGE
        };
        let decision = engine.check(action, peer);

        let mut st = ctx.lock();
        if st.auth.attempt != attempt {
            drop(st);
            return Err(self.fail(ctx, "policy check superseded"));
        }
        match decision {
            PolicyDecision::Allow => {
                st.auth.phase = AuthPhase::Authenticated;
                info!(
                    target: AUDIT,
                    conn = ctx.id(),
                    auth = ?AuthType::Policy,
                    action,
                    uid = peer.uid,
                    gid = peer.gid,
                    pid = peer.pid,
                    outcome = "allow",
                    "policy allowed client"
                );
                Ok(())
            }
            PolicyDecision::Deny => {
                st.auth.reset();
                warn!(
                    target: AUDIT,
                    conn = ctx.id(),
                    auth = ?AuthType::Policy,
                    action,
                    uid = peer.uid,
                    gid = peer.gid,
                    pid = peer.pid,
                    outcome = "deny",
                    "policy denied client"
                );
                Err(RpcError::AuthenticationDenied(format!(
                    "policy denied {action} for pid {}",
                    peer.pid
                )))
            }
            PolicyDecision::Error(msg) => {
                drop(st);
                Err(self.fail(ctx, &format!("policy engine error: {msg}")))
            }
        }
    }

    /// Resets the slot, audits `reason` and returns the uniform failure.
    fn fail(&self, ctx: &ClientContext, reason: &str) -> RpcError {
        ctx.lock().auth.reset();
        warn!(
            target: AUDIT,
            conn = ctx.id(),
            auth = ?ctx.transport().auth_type,
            peer = %ctx.transport().peer_addr,
            outcome = "fail",
            "{reason}"
        );
        RpcError::AuthenticationFailed(reason.to_string())
    }
}

impl std::fmt::Debug for AuthNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthNegotiator")
            .field("sasl", &self.sasl.is_some())
            .field("policy", &self.policy.is_some())
            .field("allow_list", &self.allow_list)
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn context(kind: TransportKind, auth_type: AuthType, peer: Option<PeerIdentity>) -> Arc<ClientContext> {
        let (tx, _rx) = mpsc::channel(4);
        ClientContext::init(
            3,
            TransportInfo {
                kind,
                read_only: false,
                auth_type,
                peer,
                peer_addr: "test".into(),
                keepalive_required: false,
            },
            tx,
        )
    }

    fn peer(uid: u32, start_time: Option<u64>) -> PeerIdentity {
        PeerIdentity {
            uid,
            gid: 100,
            pid: 4242,
            start_time,
        }
    }

    /// SASL server whose sessions complete on start with the given ssf.
    fn completing_server(ssf: u32, username: &'static str) -> Arc<dyn SaslServer> {
        let mut server = MockSaslServer::new();
        server.expect_new_session().returning(move |_| {
            let mut session = MockSaslSession::new();
            session
                .expect_mechanisms()
                .returning(|| Ok(vec!["SCRAM-SHA-256".into(), "GSSAPI".into()]));
            session.expect_set_external_ssf().returning(|_| Ok(()));
            session
                .expect_start()
                .returning(|_, _| Ok(SaslOutcome::Complete(Some(b"ok".to_vec()))));
            session.expect_ssf().returning(move || Ok(ssf));
            session.expect_username().returning(move || Ok(username.to_string()));
            Ok(Box::new(session))
        });
        Arc::new(server)
    }

    #[test]
    fn test_complete_with_weak_ssf_on_tcp_fails() {
        // Arrange
        let negotiator = AuthNegotiator::new(Some(completing_server(40, "alice")), None, AllowList::allow_all());
        let ctx = context(TransportKind::Tcp, AuthType::Sasl, None);
        negotiator.sasl_init(&ctx).expect("init");

        // Act
        let result = negotiator.sasl_start(&ctx, "SCRAM-SHA-256", None);

        // Assert
        assert!(matches!(result, Err(RpcError::AuthenticationFailed(_))));
        assert_eq!(ctx.auth_phase(), AuthPhase::Unauthenticated);
        assert!(!ctx.is_authenticated());
    }

    #[test]
    fn test_complete_with_strong_ssf_authenticates() {
        let negotiator = AuthNegotiator::new(Some(completing_server(256, "alice")), None, AllowList::allow_all());
        let ctx = context(TransportKind::Tcp, AuthType::Sasl, None);
        negotiator.sasl_init(&ctx).expect("init");

        let (complete, data) = negotiator.sasl_start(&ctx, "SCRAM-SHA-256", None).expect("start");

        assert!(complete);
        assert_eq!(data.as_deref(), Some(&b"ok"[..]));
        assert!(ctx.is_authenticated());
    }

    #[test]
    fn test_weak_ssf_is_accepted_on_local_socket() {
        let negotiator = AuthNegotiator::new(Some(completing_server(0, "alice")), None, AllowList::allow_all());
        let ctx = context(TransportKind::Unix, AuthType::Sasl, None);
        negotiator.sasl_init(&ctx).expect("init");

        negotiator.sasl_start(&ctx, "SCRAM-SHA-256", None).expect("start");

        assert!(ctx.is_authenticated());
    }

    #[test]
    fn test_username_outside_allow_list_fails() {
        let allow = AllowList::from_patterns(&["admin*".to_string()]).expect("patterns");
        let negotiator = AuthNegotiator::new(Some(completing_server(256, "mallory")), None, allow);
        let ctx = context(TransportKind::Tcp, AuthType::Sasl, None);
        negotiator.sasl_init(&ctx).expect("init");

        let err = negotiator.sasl_start(&ctx, "SCRAM-SHA-256", None).unwrap_err();

        assert!(matches!(err, RpcError::AuthenticationFailed(_)));
        assert_eq!(err.to_payload().message.as_deref(), Some("authentication failed"));
    }

    #[test]
    fn test_init_offers_mechanisms_and_sets_tls_ssf() {
        let mut server = MockSaslServer::new();
        server.expect_new_session().returning(|_| {
            let mut session = MockSaslSession::new();
            session
                .expect_set_external_ssf()
                .withf(|ssf| *ssf == 256)
                .times(1)
                .returning(|_| Ok(()));
            session.expect_mechanisms().returning(|| Ok(vec!["PLAIN".into(), "GSSAPI".into()]));
            Ok(Box::new(session))
        });
        let negotiator = AuthNegotiator::new(Some(Arc::new(server)), None, AllowList::allow_all());
        let ctx = context(TransportKind::Tls { key_bytes: 32 }, AuthType::Sasl, None);

        let mechlist = negotiator.sasl_init(&ctx).expect("init");

        assert_eq!(mechlist, "PLAIN,GSSAPI");
        assert_eq!(ctx.auth_phase(), AuthPhase::MechanismOffered);
    }

    #[test]
    fn test_continue_then_step_complete() {
        let mut server = MockSaslServer::new();
        server.expect_new_session().returning(|_| {
            let mut session = MockSaslSession::new();
            session.expect_mechanisms().returning(|| Ok(vec!["SCRAM-SHA-256".into()]));
            session
                .expect_start()
                .returning(|_, _| Ok(SaslOutcome::Continue(Some(Vec::new()))));
            session
                .expect_step()
                .withf(|data| data.as_deref() == Some(&b"proof"[..]))
                .returning(|_| Ok(SaslOutcome::Complete(None)));
            session.expect_ssf().returning(|| Ok(256));
            session.expect_username().returning(|| Ok("alice".into()));
            Ok(Box::new(session))
        });
        let negotiator = AuthNegotiator::new(Some(Arc::new(server)), None, AllowList::allow_all());
        let ctx = context(TransportKind::Tcp, AuthType::Sasl, None);
        negotiator.sasl_init(&ctx).expect("init");

        let (complete, data) = negotiator.sasl_start(&ctx, "SCRAM-SHA-256", None).expect("start");
        assert!(!complete);
        assert_eq!(data, Some(Vec::new()), "empty buffer must stay distinct from absent");
        assert_eq!(ctx.auth_phase(), AuthPhase::StepInProgress);

        let (complete, data) = negotiator.sasl_step(&ctx, Some(b"proof".to_vec())).expect("step");
        assert!(complete);
        assert_eq!(data, None);
        assert!(ctx.is_authenticated());
    }

    #[test]
    fn test_step_before_start_fails_and_resets() {
        let negotiator = AuthNegotiator::new(Some(completing_server(256, "alice")), None, AllowList::allow_all());
        let ctx = context(TransportKind::Tcp, AuthType::Sasl, None);
        negotiator.sasl_init(&ctx).expect("init");

        let err = negotiator.sasl_step(&ctx, None).unwrap_err();

        assert!(matches!(err, RpcError::AuthenticationFailed(_)));
        assert_eq!(ctx.auth_phase(), AuthPhase::Unauthenticated);
    }

    #[test]
    fn test_sasl_on_policy_listener_fails() {
        let negotiator = AuthNegotiator::new(Some(completing_server(256, "alice")), None, AllowList::allow_all());
        let ctx = context(TransportKind::Unix, AuthType::Policy, Some(peer(1000, Some(1))));

        assert!(negotiator.sasl_init(&ctx).is_err());
    }

    #[test]
    fn test_policy_without_start_time_fails_even_if_engine_allows() {
        // Arrange
        let mut engine = MockPolicyEngine::new();
        engine.expect_check().times(0).returning(|_, _| PolicyDecision::Allow);
        let negotiator = AuthNegotiator::new(None, Some(Arc::new(engine)), AllowList::allow_all());
        let ctx = context(TransportKind::Unix, AuthType::Policy, Some(peer(1000, None)));

        // Act
        let err = negotiator.check_policy(&ctx).unwrap_err();

        // Assert
        assert!(matches!(err, RpcError::AuthenticationFailed(_)));
        assert!(!ctx.is_authenticated());
    }

    #[test]
    fn test_policy_deny_is_authentication_denied() {
        let mut engine = MockPolicyEngine::new();
        engine
            .expect_check()
            .withf(|action, _| action.to_string() == ACTION_MANAGE)
            .returning(|_, _| PolicyDecision::Deny);
        let negotiator = AuthNegotiator::new(None, Some(Arc::new(engine)), AllowList::allow_all());
        let ctx = context(TransportKind::Unix, AuthType::Policy, Some(peer(1000, Some(99))));

        let err = negotiator.check_policy(&ctx).unwrap_err();

        assert!(matches!(err, RpcError::AuthenticationDenied(_)));
        assert_eq!(ctx.auth_phase(), AuthPhase::Unauthenticated);
    }

    #[test]
    fn test_policy_allow_authenticates() {
        let mut engine = MockPolicyEngine::new();
        engine.expect_check().returning(|_, _| PolicyDecision::Allow);
        let negotiator = AuthNegotiator::new(None, Some(Arc::new(engine)), AllowList::allow_all());
        let ctx = context(TransportKind::Unix, AuthType::Policy, Some(peer(1000, Some(99))));

        negotiator.check_policy(&ctx).expect("allowed");

        assert!(ctx.is_authenticated());
    }

    #[test]
    fn test_superuser_bypasses_policy_listener() {
        let negotiator = AuthNegotiator::default();
        let ctx = context(TransportKind::Unix, AuthType::Policy, Some(peer(0, Some(1))));

        let types = negotiator.auth_list(&ctx);

        assert_eq!(types, vec![AuthType::None]);
        assert!(ctx.is_authenticated());
    }

    #[test]
    fn test_superuser_gets_no_bypass_on_sasl_listener() {
        let negotiator = AuthNegotiator::default();
        let ctx = context(TransportKind::Unix, AuthType::Sasl, Some(peer(0, Some(1))));

        let types = negotiator.auth_list(&ctx);

        assert_eq!(types, vec![AuthType::Sasl]);
        assert!(!ctx.is_authenticated());
    }

    #[test]
    fn test_allow_list_globs() {
        let list = AllowList::from_patterns(&["admin".to_string(), "*@EXAMPLE.COM".to_string()]).expect("patterns");
        assert!(list.permits("admin"));
        assert!(list.permits("fred@EXAMPLE.COM"));
        assert!(!list.permits("fred@OTHER.COM"));
        assert!(AllowList::allow_all().permits("anyone"));
        assert!(!AllowList::from_patterns(&[]).expect("empty").permits("anyone"));
    }

    #[test]
    fn test_auth_type_config_names() {
        #[derive(Deserialize)]
        struct Wrap {
            a: AuthType,
        }
        let w: Wrap = toml::from_str("a = \"polkit\"").expect("parse");
        assert_eq!(w.a, AuthType::Policy);
        let w: Wrap = toml::from_str("a = \"sasl\"").expect("parse");
        assert_eq!(w.a, AuthType::Sasl);
    }
}
