//! End-to-end protocol scenarios driven through the [`Dispatcher`].
//!
//! Each test builds a client context on an in-memory outbound queue, feeds
//! CALL frames through `handle_call` the way a worker thread would, and
//! inspects the reply frames and whatever events land in the queue. The
//! in-memory test driver stands in for the management API; the SASL and
//! policy backends are hand-written fakes.

use std::sync::Arc;

use tokio::sync::mpsc;

use virtd_core::domain::event::{DomainEvent, DomainEventClass, Event};
use virtd_core::domain::instance::InstanceRef;
use virtd_core::domain::migration::MigrationCookie;
use virtd_core::error::ErrorCode;
use virtd_core::protocol::codec::{decode_frame, from_bytes, to_bytes, WireDecode, WireEncode};
use virtd_core::protocol::events::{DomainEventCallback, LegacyDomainEvent};
use virtd_core::protocol::messages::{
    ErrorPayload, MessageHeader, MessageStatus, MessageType, Procedure, REMOTE_PROGRAM, REMOTE_PROTOCOL_VERSION,
};
use virtd_core::protocol::remote::{
    AuthPolkitRet, AuthSaslInitRet, AuthSaslReply, AuthSaslStartArgs, CallbackIdArgs, CallbackIdRet,
    ConnectDomainEventCallbackRegisterAnyArgs, ConnectDomainEventRegisterRet, ConnectGetVersionRet, ConnectOpenArgs, DomainEventRegisterAnyArgs,
    MigrateBegin3Args, MigrateBegin3Ret, MigrateConfirm3Args, MigratePerform3Args, MigratePerform3Ret,
    MigratePrepare3Args, MigratePrepare3Ret, SaslData,
};

use virtd_daemon::application::auth::{
    AllowList, AuthNegotiator, AuthType, PolicyDecision, PolicyEngine, SaslError, SaslOutcome, SaslServer,
    SaslSession,
};
use virtd_daemon::application::connection::{ClientContext, PeerIdentity, TransportInfo, TransportKind};
use virtd_daemon::application::dispatch::Dispatcher;
use virtd_daemon::infrastructure::test_driver::TestDriver;

// ── Fakes ─────────────────────────────────────────────────────────────────────

/// SASL backend whose sessions complete on the first start with a fixed
/// key strength.
struct FixedSsfSasl {
    ssf: u32,
}

struct FixedSsfSession {
    ssf: u32,
}

impl SaslServer for FixedSsfSasl {
    fn new_session(&self, _transport: &TransportInfo) -> Result<Box<dyn SaslSession>, SaslError> {
        Ok(Box::new(FixedSsfSession { ssf: self.ssf }))
    }
}

impl SaslSession for FixedSsfSession {
    fn mechanisms(&self) -> Result<Vec<String>, SaslError> {
        Ok(vec!["SCRAM-SHA-256".to_string()])
    }

    fn set_external_ssf(&mut self, _ssf: u32) -> Result<(), SaslError> {
        Ok(())
    }

    fn start(&mut self, _mechanism: &str, _data: Option<Vec<u8>>) -> Result<SaslOutcome, SaslError> {
        Ok(SaslOutcome::Complete(None))
    }

    fn step(&mut self, _data: Option<Vec<u8>>) -> Result<SaslOutcome, SaslError> {
        Err(SaslError("no further steps".to_string()))
    }

    fn ssf(&self) -> Result<u32, SaslError> {
        Ok(self.ssf)
    }

    fn username(&self) -> Result<String, SaslError> {
        Ok("alice".to_string())
    }
}

struct AlwaysAllow;

impl PolicyEngine for AlwaysAllow {
    fn check(&self, _action: &str, _peer: &PeerIdentity) -> PolicyDecision {
        PolicyDecision::Allow
    }
}

// ── Client harness ────────────────────────────────────────────────────────────

struct Client {
    dispatcher: Dispatcher,
    ctx: Arc<ClientContext>,
    events: mpsc::Receiver<Vec<u8>>,
    serial: u32,
}

impl Client {
    fn new(dispatcher: Dispatcher, transport: TransportInfo) -> Self {
        let (tx, events) = mpsc::channel(16);
        let ctx = ClientContext::init(7, transport, tx);
        Self {
            dispatcher,
            ctx,
            events,
            serial: 0,
        }
    }

    fn local(driver: &TestDriver) -> Self {
        Self::new(
            Dispatcher::new(Arc::new(driver.clone()), AuthNegotiator::default()),
            transport(TransportKind::Unix, AuthType::None, None),
        )
    }

    fn call<A: WireEncode>(&mut self, procedure: Procedure, args: &A) -> Result<Vec<u8>, ErrorPayload> {
        self.serial += 1;
        let header = MessageHeader {
            program: REMOTE_PROGRAM,
            version: REMOTE_PROTOCOL_VERSION,
            procedure: procedure as i32,
            msg_type: MessageType::Call,
            serial: self.serial,
            status: MessageStatus::Ok,
        };
        let payload = to_bytes(args).expect("encode args");
        let frame = self
            .dispatcher
            .handle_call(&self.ctx, &header, &payload)
            .expect("calls always get a reply");
        let (reply, body, used) = decode_frame(&frame).expect("decode reply");
        assert_eq!(used, frame.len());
        assert_eq!(reply.msg_type, MessageType::Reply);
        assert_eq!(reply.serial, self.serial);
        assert_eq!(reply.procedure, procedure as i32);
        match reply.status {
            MessageStatus::Ok => Ok(body.to_vec()),
            _ => Err(from_bytes(body).expect("error payload")),
        }
    }

    fn call_ok<A: WireEncode, R: WireDecode>(&mut self, procedure: Procedure, args: &A) -> R {
        let body = self
            .call(procedure, args)
            .unwrap_or_else(|e| panic!("{procedure:?} failed: {e:?}"));
        from_bytes(&body).expect("decode reply body")
    }

    fn open(&mut self) {
        self.call(Procedure::ConnectOpen, &ConnectOpenArgs::default())
            .expect("open");
    }

    /// Every event frame queued so far, as (header, payload).
    fn drain_events(&mut self) -> Vec<(MessageHeader, Vec<u8>)> {
        let mut out = Vec::new();
        while let Ok(frame) = self.events.try_recv() {
            let (header, body, _) = decode_frame(&frame).expect("decode event frame");
            out.push((header, body.to_vec()));
        }
        out
    }
}

fn transport(kind: TransportKind, auth_type: AuthType, peer: Option<PeerIdentity>) -> TransportInfo {
    TransportInfo {
        kind,
        read_only: false,
        auth_type,
        peer,
        peer_addr: "scenario".to_string(),
        keepalive_required: false,
    }
}

fn lifecycle(instance: &InstanceRef, event: i32) -> Event {
    Event::Domain {
        instance: instance.clone(),
        event: DomainEvent::Lifecycle { event, detail: 0 },
    }
}

// ── Event scenarios ───────────────────────────────────────────────────────────

/// A legacy lifecycle subscription gets exactly one per-class frame per
/// event, without a callback id, and nothing once it is deregistered.
#[test]
fn test_legacy_lifecycle_subscription_delivers_until_deregistered() {
    // Arrange
    let driver = TestDriver::new();
    let web = driver.define("web01");
    let mut client = Client::local(&driver);
    client.open();
    let register = DomainEventRegisterAnyArgs {
        event_id: DomainEventClass::Lifecycle as i32,
    };
    client
        .call(Procedure::DomainEventRegisterAny, &register)
        .expect("register");

    // Act
    driver.fire(lifecycle(&web, 2));
    let delivered = client.drain_events();

    // Assert
    assert_eq!(delivered.len(), 1);
    let (header, payload) = &delivered[0];
    assert_eq!(header.procedure, Procedure::DomainEventLifecycle as i32);
    assert_eq!(header.msg_type, MessageType::Message);
    assert_eq!(header.serial, 1);
    let expected = to_bytes(&LegacyDomainEvent {
        instance: web.clone(),
        event: DomainEvent::Lifecycle { event: 2, detail: 0 },
    })
    .expect("encode expected");
    assert_eq!(payload, &expected);
    assert!(from_bytes::<DomainEventCallback>(payload).is_err());

    client
        .call(Procedure::DomainEventDeregisterAny, &register)
        .expect("deregister");
    driver.fire(lifecycle(&web, 3));
    assert!(client.drain_events().is_empty());
    assert_eq!(driver.live_registrations(), 0);
}

/// The lifecycle-only register/deregister pair shares the legacy Lifecycle
/// subscription with `DomainEventRegisterAny`.
#[test]
fn test_lifecycle_only_registration_uses_legacy_lifecycle_slot() {
    // Arrange
    let driver = TestDriver::new();
    let web = driver.define("web01");
    let mut client = Client::local(&driver);
    client.open();

    // Act
    let registered: ConnectDomainEventRegisterRet = client.call_ok(Procedure::ConnectDomainEventRegister, &());
    let duplicate = client
        .call(
            Procedure::DomainEventRegisterAny,
            &DomainEventRegisterAnyArgs {
                event_id: DomainEventClass::Lifecycle as i32,
            },
        )
        .unwrap_err();
    driver.fire(lifecycle(&web, 0));

    // Assert
    assert_eq!(registered.cb_registered, 1);
    assert_eq!(duplicate.code, ErrorCode::OperationFailed as i32);
    let delivered = client.drain_events();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0.procedure, Procedure::DomainEventLifecycle as i32);

    let deregistered: ConnectDomainEventRegisterRet = client.call_ok(Procedure::ConnectDomainEventDeregister, &());
    assert_eq!(deregistered.cb_registered, 0);
    driver.fire(lifecycle(&web, 1));
    assert!(client.drain_events().is_empty());
    let again = client.call(Procedure::ConnectDomainEventDeregister, &()).unwrap_err();
    assert_eq!(again.code, ErrorCode::NotRegistered as i32);
}

/// When the transport goes away while a registration is still in flight,
/// the registration is undone and the call fails as not open.
#[test]
fn test_teardown_during_registration_leaves_nothing_behind() {
    // Arrange
    let driver = TestDriver::new();
    let web = driver.define("web01");
    let mut client = Client::local(&driver);
    client.open();
    let ctx = Arc::clone(&client.ctx);
    driver.on_next_registration(move || ctx.teardown());

    // Act
    let err = client
        .call(
            Procedure::DomainEventRegisterAny,
            &DomainEventRegisterAnyArgs {
                event_id: DomainEventClass::Lifecycle as i32,
            },
        )
        .unwrap_err();
    driver.fire(lifecycle(&web, 2));

    // Assert
    assert_eq!(err.code, ErrorCode::ConnectionNotOpen as i32);
    assert_eq!(driver.live_registrations(), 0);
    assert_eq!(client.ctx.callback_count(), 0);
    assert!(client.drain_events().is_empty());
    assert_eq!(driver.close_count(), 1);
}

/// Callback ids handed out by successive register/deregister cycles are
/// never reused, and modern frames carry the id they were issued.
#[test]
fn test_modern_callback_ids_are_distinct_across_cycles() {
    // Arrange
    let driver = TestDriver::new();
    let web = driver.define("web01");
    let mut client = Client::local(&driver);
    client.open();
    let args = ConnectDomainEventCallbackRegisterAnyArgs {
        event_id: DomainEventClass::Lifecycle as i32,
        dom: None,
    };

    // Act
    let first: CallbackIdRet = client.call_ok(Procedure::ConnectDomainEventCallbackRegisterAny, &args);
    client
        .call(
            Procedure::ConnectDomainEventCallbackDeregisterAny,
            &CallbackIdArgs {
                callback_id: first.callback_id,
            },
        )
        .expect("deregister first");
    let second: CallbackIdRet = client.call_ok(Procedure::ConnectDomainEventCallbackRegisterAny, &args);
    driver.fire(lifecycle(&web, 1));

    // Assert
    assert_ne!(first.callback_id, second.callback_id);
    let delivered = client.drain_events();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0.procedure, Procedure::DomainEventCallback as i32);
    let event: DomainEventCallback = from_bytes(&delivered[0].1).expect("modern envelope");
    assert_eq!(event.callback_id, second.callback_id);
    assert_eq!(event.instance, web);
}

/// Deregistering an id that was already released fails as not registered.
#[test]
fn test_deregistering_released_callback_is_not_registered() {
    let driver = TestDriver::new();
    let mut client = Client::local(&driver);
    client.open();
    let reg: CallbackIdRet = client.call_ok(
        Procedure::ConnectDomainEventCallbackRegisterAny,
        &ConnectDomainEventCallbackRegisterAnyArgs {
            event_id: DomainEventClass::Reboot as i32,
            dom: None,
        },
    );
    let args = CallbackIdArgs {
        callback_id: reg.callback_id,
    };
    client
        .call(Procedure::ConnectDomainEventCallbackDeregisterAny, &args)
        .expect("first deregister");

    let err = client
        .call(Procedure::ConnectDomainEventCallbackDeregisterAny, &args)
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::NotRegistered as i32);
}

// ── Migration scenario ────────────────────────────────────────────────────────

/// A confirm carrying a cookie the source never produced fails upstream,
/// leaves the connection usable, and the genuine cookie still confirms.
#[test]
fn test_forged_confirm_cookie_fails_without_closing_connection() {
    // Arrange
    let src_driver = TestDriver::new();
    let dst_driver = TestDriver::new();
    let web = src_driver.define("web01");
    let mut src = Client::local(&src_driver);
    let mut dst = Client::local(&dst_driver);
    src.open();
    dst.open();

    let begun: MigrateBegin3Ret = src.call_ok(
        Procedure::DomainMigrateBegin3,
        &MigrateBegin3Args {
            dom: web.clone(),
            ..Default::default()
        },
    );
    let prepared: MigratePrepare3Ret = dst.call_ok(
        Procedure::DomainMigratePrepare3,
        &MigratePrepare3Args {
            cookie_in: begun.cookie_out.clone(),
            dom_xml: begun.xml.clone(),
            ..Default::default()
        },
    );
    let performed: MigratePerform3Ret = src.call_ok(
        Procedure::DomainMigratePerform3,
        &MigratePerform3Args {
            dom: web.clone(),
            cookie_in: prepared.cookie_out.clone(),
            uri: prepared.uri_out.clone(),
            ..Default::default()
        },
    );

    // Act
    let forged = src
        .call(
            Procedure::DomainMigrateConfirm3,
            &MigrateConfirm3Args {
                dom: web.clone(),
                cookie_in: MigrationCookie::new(b"not-from-perform".to_vec()),
                ..Default::default()
            },
        )
        .unwrap_err();

    // Assert
    assert_eq!(forged.code, ErrorCode::UpstreamFailure as i32);
    assert!(src.ctx.is_open());
    let version: ConnectGetVersionRet = src.call_ok(Procedure::ConnectGetVersion, &());
    assert!(version.hv_ver > 0);
    src.call(
        Procedure::DomainMigrateConfirm3,
        &MigrateConfirm3Args {
            dom: web.clone(),
            cookie_in: performed.cookie_out.clone(),
            ..Default::default()
        },
    )
    .expect("genuine confirm");
}

// ── Authentication scenarios ──────────────────────────────────────────────────

fn sasl_client(ssf: u32) -> Client {
    let driver = TestDriver::new();
    let negotiator = AuthNegotiator::new(Some(Arc::new(FixedSsfSasl { ssf })), None, AllowList::allow_all());
    Client::new(
        Dispatcher::new(Arc::new(driver), negotiator),
        transport(TransportKind::Tcp, AuthType::Sasl, None),
    )
}

fn sasl_start(client: &mut Client) -> Result<Vec<u8>, ErrorPayload> {
    let init: AuthSaslInitRet = client.call_ok(Procedure::AuthSaslInit, &());
    assert_eq!(init.mechlist, "SCRAM-SHA-256");
    client.call(
        Procedure::AuthSaslStart,
        &AuthSaslStartArgs {
            mech: "SCRAM-SHA-256".to_string(),
            data: SaslData::absent(),
        },
    )
}

/// On plain TCP a SASL exchange that completes with a weak key strength is
/// refused, and the connection stays unauthenticated.
#[test]
fn test_weak_sasl_ssf_on_tcp_is_refused() {
    // Arrange
    let mut client = sasl_client(40);

    // Act
    let err = sasl_start(&mut client).unwrap_err();

    // Assert
    assert_eq!(err.code, ErrorCode::AuthenticationFailed as i32);
    assert_eq!(err.message.as_deref(), Some("authentication failed"));
    assert!(!client.ctx.is_authenticated());
    let blocked = client
        .call(Procedure::ConnectOpen, &ConnectOpenArgs::default())
        .unwrap_err();
    assert_eq!(blocked.code, ErrorCode::AuthenticationFailed as i32);
}

/// A key strength of 56 is enough; the connection can then open.
#[test]
fn test_sasl_ssf_of_56_authenticates() {
    let mut client = sasl_client(56);

    let body = sasl_start(&mut client).expect("start");
    let reply: AuthSaslReply = from_bytes(&body).expect("sasl reply");

    assert!(reply.complete);
    assert!(client.ctx.is_authenticated());
    client.open();
}

fn policy_client(start_time: Option<u64>) -> Client {
    let negotiator = AuthNegotiator::new(None, Some(Arc::new(AlwaysAllow)), AllowList::allow_all());
    let peer = PeerIdentity {
        uid: 1000,
        gid: 1000,
        pid: 4242,
        start_time,
    };
    Client::new(
        Dispatcher::new(Arc::new(TestDriver::new()), negotiator),
        transport(TransportKind::Unix, AuthType::Policy, Some(peer)),
    )
}

/// Without the peer's process start time the policy check fails even though
/// the engine would allow it.
#[test]
fn test_policy_check_needs_process_start_time() {
    let mut client = policy_client(None);

    let err = client.call(Procedure::AuthPolkit, &()).unwrap_err();

    assert_eq!(err.code, ErrorCode::AuthenticationFailed as i32);
    assert!(!client.ctx.is_authenticated());
}

/// With a complete peer identity the engine's answer decides.
#[test]
fn test_policy_check_with_start_time_authenticates() {
    let mut client = policy_client(Some(987_654));

    let ret: AuthPolkitRet = client.call_ok(Procedure::AuthPolkit, &());

    assert!(ret.complete);
    assert!(client.ctx.is_authenticated());
    client.open();
}

// ── Access control ────────────────────────────────────────────────────────────

/// A read-only connection may subscribe to events but may not migrate.
#[test]
fn test_read_only_connection_can_subscribe_but_not_migrate() {
    // Arrange
    let driver = TestDriver::new();
    let web = driver.define("web01");
    let mut client = Client::local(&driver);
    client
        .call(
            Procedure::ConnectOpen,
            &ConnectOpenArgs {
                name: None,
                flags: virtd_core::protocol::remote::CONNECT_RO,
            },
        )
        .expect("read-only open");

    // Act
    let subscribed = client.call(
        Procedure::DomainEventRegisterAny,
        &DomainEventRegisterAnyArgs {
            event_id: DomainEventClass::Reboot as i32,
        },
    );
    let migrate = client
        .call(
            Procedure::DomainMigrateBegin3,
            &MigrateBegin3Args {
                dom: web,
                ..Default::default()
            },
        )
        .unwrap_err();

    // Assert
    assert!(client.ctx.is_read_only());
    assert!(subscribed.is_ok());
    assert_eq!(migrate.code, ErrorCode::OperationDenied as i32);
    assert!(driver.migration_log().is_empty());
}
