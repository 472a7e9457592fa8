//! Procedure dispatcher.
//!
//! [`Dispatcher::handle_call`] is the single entry point for inbound CALL
//! frames. It runs on a blocking worker thread and may call into the
//! management API for as long as that takes.
//!
//! Each call goes through the same steps:
//!
//! 1. Header checks (program, version, message type, known procedure).
//! 2. Access checks from [`call_policy`]: authentication, read-only.
//! 3. Argument decode with compiled-in ceilings.
//! 4. Ceiling checks on scalar counts the peer supplies (`nparams`, `size`,
//!    `maxids`) before anything proportional to them is allocated.
//! 5. The handler itself, then reply encode.
//!
//! Any failure becomes a REPLY with status ERROR carrying the structured
//! error payload.

use std::sync::Arc;

use tracing::{debug, error, warn};

use virtd_core::domain::event::{DomainEventClass, EventTarget, NetworkEventClass};
use virtd_core::error::RpcError;
use virtd_core::protocol::codec::{encode_frame, from_bytes, to_bytes, WireEncode};
use virtd_core::protocol::limits::{
    DOMAIN_BLOCK_PEEK_BUFFER_MAX, DOMAIN_GET_CPU_STATS_MAX, DOMAIN_GET_CPU_STATS_NCPUS_MAX, DOMAIN_LIST_MAX,
    DOMAIN_MEMORY_PEEK_BUFFER_MAX, NODE_CPU_STATS_MAX, SCHEDULER_PARAMETERS_MAX,
};
use virtd_core::protocol::messages::{
    MessageHeader, MessageStatus, MessageType, Procedure, REMOTE_PROGRAM, REMOTE_PROTOCOL_VERSION,
};
use virtd_core::protocol::remote::{
    features, AuthListRet, AuthPolkitRet, AuthSaslInitRet, AuthSaslReply, AuthSaslStartArgs, AuthSaslStepArgs,
    AuthTypes, CallbackIdArgs, CallbackIdRet, ConnectDomainEventCallbackRegisterAnyArgs, ConnectDomainEventRegisterRet, ConnectGetVersionRet,
    ConnectListDomainsArgs, ConnectListDomainsRet, ConnectNetworkEventRegisterAnyArgs, ConnectOpenArgs,
    ConnectSupportsFeatureArgs, ConnectSupportsFeatureRet, CpuStatsParams, DomainBlockPeekArgs, DomainEventRegisterAnyArgs,
    DomainGetCpuStatsArgs, DomainGetCpuStatsRet, DomainGetSchedulerParametersArgs, DomainGetSchedulerParametersRet,
    DomainIds, DomainLookupByNameArgs, DomainLookupByNameRet, DomainMemoryPeekArgs, DomainPeekRet,
    DomainSetSchedulerParametersArgs, PeekBuffer, SaslData, SchedulerParams, CONNECT_RO,
};
use virtd_core::protocol::typed_param::{caps, TypedParamList};

use crate::application::auth::AuthNegotiator;
use crate::application::connection::ClientContext;
use crate::application::events::{self, Deregistration, Subscription};
use crate::application::management::Hypervisor;
use crate::application::migration;

// ── Access policy ─────────────────────────────────────────────────────────────

/// Access rules of one procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPolicy {
    /// Rejected until the connection has authenticated.
    pub needs_auth: bool,
    /// Allowed on a read-only connection.
    pub read_safe: bool,
}

const PRE_AUTH: CallPolicy = CallPolicy {
    needs_auth: false,
    read_safe: true,
};
const READ: CallPolicy = CallPolicy {
    needs_auth: true,
    read_safe: true,
};
const WRITE: CallPolicy = CallPolicy {
    needs_auth: true,
    read_safe: false,
};

/// Access rules per procedure. `None` for server-to-client messages, which a
/// client may never call.
pub fn call_policy(procedure: Procedure) -> Option<CallPolicy> {
    use Procedure::*;
    match procedure {
        AuthList | AuthSaslInit | AuthSaslStart | AuthSaslStep | AuthPolkit | ConnectSupportsFeature => Some(PRE_AUTH),

        ConnectOpen
        | ConnectClose
        | ConnectGetVersion
        | ConnectListDomains
        | DomainLookupByName
        | DomainGetSchedulerParameters
        | DomainGetCpuStats
        | DomainEventRegisterAny
        | DomainEventDeregisterAny
        | ConnectDomainEventCallbackRegisterAny
        | ConnectDomainEventCallbackDeregisterAny
        | ConnectNetworkEventRegisterAny
        | ConnectNetworkEventDeregisterAny
        | ConnectDomainEventRegister
        | ConnectDomainEventDeregister => Some(READ),

        DomainSetSchedulerParameters
        | DomainBlockPeek
        | DomainMemoryPeek
        | DomainMigrateBegin3
        | DomainMigratePrepare3
        | DomainMigratePerform3
        | DomainMigrateFinish3
        | DomainMigrateConfirm3
        | DomainMigrateBegin3Params
        | DomainMigratePrepare3Params
        | DomainMigratePerform3Params
        | DomainMigrateFinish3Params
        | DomainMigrateConfirm3Params => Some(WRITE),

        DomainEventLifecycle
        | DomainEventReboot
        | DomainEventRtcChange
        | DomainEventWatchdog
        | DomainEventIoError
        | DomainEventGraphics
        | DomainEventIoErrorReason
        | DomainEventControlError
        | DomainEventBlockJob
        | DomainEventDiskChange
        | DomainEventTrayChange
        | DomainEventPmWakeup
        | DomainEventPmSuspend
        | DomainEventBalloonChange
        | DomainEventPmSuspendDisk
        | DomainEventDeviceRemoved
        | DomainEventCallback
        | NetworkEventCallback => None,
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

/// Routes decoded calls to their handlers.
#[derive(Clone)]
pub struct Dispatcher {
    hypervisor: Arc<dyn Hypervisor>,
    negotiator: AuthNegotiator,
}

impl Dispatcher {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, negotiator: AuthNegotiator) -> Self {
        Self { hypervisor, negotiator }
    }

    /// Handles one inbound frame of the remote program and returns the
    /// reply frame, or `None` when the frame expects no reply.
    pub fn handle_call(&self, ctx: &Arc<ClientContext>, header: &MessageHeader, payload: &[u8]) -> Option<Vec<u8>> {
        if header.msg_type != MessageType::Call {
            debug!(conn = ctx.id(), msg_type = ?header.msg_type, serial = header.serial, "ignoring non-call message");
            return None;
        }

        let result = self.check_header(header).and_then(|procedure| {
            debug!(conn = ctx.id(), proc = ?procedure, serial = header.serial, "dispatching call");
            self.dispatch(ctx, procedure, payload)
        });

        match result {
            Ok(body) => match encode_frame(&header.reply(MessageStatus::Ok), &body) {
                Ok(frame) => Some(frame),
                Err(e) => error_reply(ctx, header, &RpcError::from(e)),
            },
            Err(e) => error_reply(ctx, header, &e),
        }
    }

    fn check_header(&self, header: &MessageHeader) -> Result<Procedure, RpcError> {
        if header.program != REMOTE_PROGRAM {
            return Err(RpcError::Unsupported(format!("unknown program {:#x}", header.program)));
        }
        if header.version != REMOTE_PROTOCOL_VERSION {
            return Err(RpcError::Unsupported(format!(
                "program version {} not supported",
                header.version
            )));
        }
        Procedure::try_from(header.procedure)
            .map_err(|_| RpcError::Unsupported(format!("unknown procedure {}", header.procedure)))
    }

    fn check_access(&self, ctx: &ClientContext, procedure: Procedure) -> Result<(), RpcError> {
        let policy = call_policy(procedure)
            .ok_or_else(|| RpcError::Unsupported(format!("{procedure:?} is not a callable procedure")))?;
        if policy.needs_auth && !ctx.is_authenticated() {
            return Err(RpcError::AuthenticationFailed("authentication required".to_string()));
        }
        if !policy.read_safe && ctx.is_read_only() {
            return Err(RpcError::OperationDenied(format!("{procedure:?} needs a read-write connection")));
        }
        Ok(())
    }

    fn dispatch(&self, ctx: &Arc<ClientContext>, procedure: Procedure, payload: &[u8]) -> Result<Vec<u8>, RpcError> {
        self.check_access(ctx, procedure)?;

        use Procedure::*;
        match procedure {
            // Connection.
            ConnectOpen => {
                let args: ConnectOpenArgs = from_bytes(payload)?;
                self.open(ctx, args)?;
                empty()
            }
            ConnectClose => {
                ctx.close_connection()?;
                empty()
            }
            ConnectGetVersion => reply(&ConnectGetVersionRet {
                hv_ver: ctx.connection()?.version()?,
            }),
            ConnectSupportsFeature => {
                let args: ConnectSupportsFeatureArgs = from_bytes(payload)?;
                reply(&ConnectSupportsFeatureRet {
                    supported: i32::from(supports_feature(ctx, args.feature)),
                })
            }
            ConnectListDomains => {
                let args: ConnectListDomainsArgs = from_bytes(payload)?;
                let max = checked_count("domain ids", args.maxids, DOMAIN_LIST_MAX)?;
                let ids = ctx.connection()?.list_instances(max)?;
                reply(&ConnectListDomainsRet { ids: DomainIds(ids) })
            }
            DomainLookupByName => {
                let args: DomainLookupByNameArgs = from_bytes(payload)?;
                let dom = ctx.connection()?.lookup_by_name(&args.name)?;
                reply(&DomainLookupByNameRet { dom })
            }

            // Authentication.
            AuthList => {
                let types = self.negotiator.auth_list(ctx).into_iter().map(|t| t as i32).collect();
                reply(&AuthListRet { types: AuthTypes(types) })
            }
            AuthSaslInit => reply(&AuthSaslInitRet {
                mechlist: self.negotiator.sasl_init(ctx)?,
            }),
            AuthSaslStart => {
                let args: AuthSaslStartArgs = from_bytes(payload)?;
                let (complete, data) = self.negotiator.sasl_start(ctx, &args.mech, args.data.0)?;
                reply(&AuthSaslReply {
                    complete,
                    data: SaslData(data),
                })
            }
            AuthSaslStep => {
                let args: AuthSaslStepArgs = from_bytes(payload)?;
                let (complete, data) = self.negotiator.sasl_step(ctx, args.data.0)?;
                reply(&AuthSaslReply {
                    complete,
                    data: SaslData(data),
                })
            }
            AuthPolkit => {
                self.negotiator.check_policy(ctx)?;
                reply(&AuthPolkitRet { complete: true })
            }

            // Scheduler, statistics and peek.
            DomainGetSchedulerParameters => {
                let args: DomainGetSchedulerParametersArgs = from_bytes(payload)?;
                let n = checked_count("scheduler parameters", args.nparams, SCHEDULER_PARAMETERS_MAX)?;
                let params = ctx.connection()?.scheduler_parameters(&args.dom, n)?;
                let list = TypedParamList::encode(&params, ctx.typed_param_caps())?;
                reply(&DomainGetSchedulerParametersRet {
                    params: SchedulerParams::from(list),
                })
            }
            DomainSetSchedulerParameters => {
                let args: DomainSetSchedulerParametersArgs = from_bytes(payload)?;
                ctx.connection()?.set_scheduler_parameters(&args.dom, &args.params.0)?;
                empty()
            }
            DomainGetCpuStats => {
                let args: DomainGetCpuStatsArgs = from_bytes(payload)?;
                check_cpu_stats(&args)?;
                let stats = ctx.connection()?.cpu_stats(
                    &args.dom,
                    args.nparams,
                    args.start_cpu,
                    args.ncpus,
                    args.flags & !caps::TYPED_PARAM_STRING_OKAY,
                )?;
                let wire_caps = ctx.typed_param_caps() | (args.flags & caps::TYPED_PARAM_STRING_OKAY);
                let list = TypedParamList::encode(&stats.params, wire_caps)?;
                reply(&DomainGetCpuStatsRet {
                    params: CpuStatsParams::from(list),
                    nparams: stats.nparams,
                })
            }
            DomainBlockPeek => {
                let args: DomainBlockPeekArgs = from_bytes(payload)?;
                check_size("peek buffer bytes", args.size, DOMAIN_BLOCK_PEEK_BUFFER_MAX)?;
                let buffer = ctx
                    .connection()?
                    .block_peek(&args.dom, &args.path, args.offset, args.size, args.flags)?;
                reply(&DomainPeekRet {
                    buffer: PeekBuffer(buffer),
                })
            }
            DomainMemoryPeek => {
                let args: DomainMemoryPeekArgs = from_bytes(payload)?;
                check_size("peek buffer bytes", args.size, DOMAIN_MEMORY_PEEK_BUFFER_MAX)?;
                let buffer = ctx
                    .connection()?
                    .memory_peek(&args.dom, args.offset, args.size, args.flags)?;
                reply(&DomainPeekRet {
                    buffer: PeekBuffer(buffer),
                })
            }

            // Events.
            DomainEventRegisterAny => {
                let args: DomainEventRegisterAnyArgs = from_bytes(payload)?;
                let class = legacy_class(args.event_id)?;
                events::register(ctx, Subscription::LegacyDomain(class), None)?;
                empty()
            }
            DomainEventDeregisterAny => {
                let args: DomainEventRegisterAnyArgs = from_bytes(payload)?;
                let class = legacy_class(args.event_id)?;
                events::deregister(ctx, Deregistration::LegacyDomain(class))?;
                empty()
            }
            ConnectDomainEventRegister => {
                let lifecycle = Subscription::LegacyDomain(DomainEventClass::Lifecycle);
                events::register(ctx, lifecycle, None)?;
                reply(&ConnectDomainEventRegisterRet { cb_registered: 1 })
            }
            ConnectDomainEventDeregister => {
                events::deregister(ctx, Deregistration::LegacyDomain(DomainEventClass::Lifecycle))?;
                reply(&ConnectDomainEventRegisterRet { cb_registered: 0 })
            }
            ConnectDomainEventCallbackRegisterAny => {
                let args: ConnectDomainEventCallbackRegisterAnyArgs = from_bytes(payload)?;
                let class = DomainEventClass::try_from(args.event_id).map_err(|_| unsupported_event(args.event_id))?;
                let target = args.dom.map(EventTarget::Instance);
                let callback_id = events::register(ctx, Subscription::Domain(class), target)?;
                reply(&CallbackIdRet { callback_id })
            }
            ConnectDomainEventCallbackDeregisterAny => {
                let args: CallbackIdArgs = from_bytes(payload)?;
                events::deregister(ctx, Deregistration::Domain(args.callback_id))?;
                empty()
            }
            ConnectNetworkEventRegisterAny => {
                let args: ConnectNetworkEventRegisterAnyArgs = from_bytes(payload)?;
                let class = NetworkEventClass::try_from(args.event_id).map_err(|_| unsupported_event(args.event_id))?;
                let target = args.net.map(EventTarget::Network);
                let callback_id = events::register(ctx, Subscription::Network(class), target)?;
                reply(&CallbackIdRet { callback_id })
            }
            ConnectNetworkEventDeregisterAny => {
                let args: CallbackIdArgs = from_bytes(payload)?;
                events::deregister(ctx, Deregistration::Network(args.callback_id))?;
                empty()
            }

            // Migration.
            DomainMigrateBegin3 => reply(&migration::begin3(ctx, from_bytes(payload)?)?),
            DomainMigratePrepare3 => reply(&migration::prepare3(ctx, from_bytes(payload)?)?),
            DomainMigratePerform3 => reply(&migration::perform3(ctx, from_bytes(payload)?)?),
            DomainMigrateFinish3 => reply(&migration::finish3(ctx, from_bytes(payload)?)?),
            DomainMigrateConfirm3 => {
                migration::confirm3(ctx, from_bytes(payload)?)?;
                empty()
            }
            DomainMigrateBegin3Params => reply(&migration::begin3_params(ctx, from_bytes(payload)?)?),
            DomainMigratePrepare3Params => reply(&migration::prepare3_params(ctx, from_bytes(payload)?)?),
            DomainMigratePerform3Params => reply(&migration::perform3_params(ctx, from_bytes(payload)?)?),
            DomainMigrateFinish3Params => reply(&migration::finish3_params(ctx, from_bytes(payload)?)?),
            DomainMigrateConfirm3Params => {
                migration::confirm3_params(ctx, from_bytes(payload)?)?;
                empty()
            }

            DomainEventLifecycle
            | DomainEventReboot
            | DomainEventRtcChange
            | DomainEventWatchdog
            | DomainEventIoError
            | DomainEventGraphics
            | DomainEventIoErrorReason
            | DomainEventControlError
            | DomainEventBlockJob
            | DomainEventDiskChange
            | DomainEventTrayChange
            | DomainEventPmWakeup
            | DomainEventPmSuspend
            | DomainEventBalloonChange
            | DomainEventPmSuspendDisk
            | DomainEventDeviceRemoved
            | DomainEventCallback
            | NetworkEventCallback => Err(RpcError::Unsupported(format!("{procedure:?} is not a callable procedure"))),
        }
    }

    fn open(&self, ctx: &ClientContext, args: ConnectOpenArgs) -> Result<(), RpcError> {
        ctx.can_attach()?;
        let read_only = args.flags & CONNECT_RO != 0 || ctx.transport().read_only;
        let conn = self.hypervisor.open(args.name.as_deref(), read_only)?;
        if let Err(e) = ctx.attach(Arc::clone(&conn), read_only) {
            if let Err(close_err) = conn.close() {
                warn!(conn = ctx.id(), "failed to close rejected management connection: {close_err}");
            }
            return Err(e);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("negotiator", &self.negotiator)
            .finish_non_exhaustive()
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn reply<T: WireEncode>(value: &T) -> Result<Vec<u8>, RpcError> {
    Ok(to_bytes(value)?)
}

fn empty() -> Result<Vec<u8>, RpcError> {
    Ok(Vec::new())
}

fn error_reply(ctx: &ClientContext, header: &MessageHeader, err: &RpcError) -> Option<Vec<u8>> {
    match err {
        RpcError::AuthenticationFailed(_) | RpcError::AuthenticationDenied(_) => {
            debug!(conn = ctx.id(), serial = header.serial, "call rejected: {err}")
        }
        _ => debug!(conn = ctx.id(), proc = header.procedure, serial = header.serial, "call failed: {err}"),
    }
    let frame = to_bytes(&err.to_payload())
        .and_then(|body| encode_frame(&header.reply(MessageStatus::Error), &body));
    match frame {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!(conn = ctx.id(), serial = header.serial, "cannot encode error reply: {e}");
            None
        }
    }
}

fn supports_feature(ctx: &ClientContext, feature: i32) -> bool {
    match feature {
        features::PROGRAM_KEEPALIVE => {
            ctx.set_keepalive_supported();
            true
        }
        features::TYPED_PARAM_STRING => {
            ctx.declare_string_params();
            true
        }
        features::MIGRATION_PARAMS => true,
        _ => false,
    }
}

fn unsupported_event(event_id: i32) -> RpcError {
    RpcError::Unsupported(format!("unsupported event ID {event_id}"))
}

/// Classes a legacy registration may name: those up to `DeviceRemoved`.
fn legacy_class(event_id: i32) -> Result<DomainEventClass, RpcError> {
    match DomainEventClass::try_from(event_id) {
        Ok(class) if class.has_legacy_form() => Ok(class),
        _ => Err(unsupported_event(event_id)),
    }
}

/// Validates a peer-supplied signed count against `limit`.
fn checked_count(what: &str, count: i32, limit: usize) -> Result<usize, RpcError> {
    let n = usize::try_from(count).map_err(|_| RpcError::OperationFailed(format!("negative {what} count {count}")))?;
    if n > limit {
        return Err(RpcError::LimitExceeded {
            what: what.to_string(),
            count: n,
            limit,
        });
    }
    Ok(n)
}

fn check_size(what: &str, size: u32, limit: usize) -> Result<(), RpcError> {
    let n = size as usize;
    if n > limit {
        return Err(RpcError::LimitExceeded {
            what: what.to_string(),
            count: n,
            limit,
        });
    }
    Ok(())
}

fn check_cpu_stats(args: &DomainGetCpuStatsArgs) -> Result<(), RpcError> {
    let nparams = args.nparams as usize;
    let ncpus = args.ncpus as usize;
    if nparams > NODE_CPU_STATS_MAX {
        return Err(RpcError::LimitExceeded {
            what: "cpu stats parameters per cpu".to_string(),
            count: nparams,
            limit: NODE_CPU_STATS_MAX,
        });
    }
    if ncpus > DOMAIN_GET_CPU_STATS_NCPUS_MAX {
        return Err(RpcError::LimitExceeded {
            what: "cpus".to_string(),
            count: ncpus,
            limit: DOMAIN_GET_CPU_STATS_NCPUS_MAX,
        });
    }
    let slots = nparams * ncpus;
    if slots > DOMAIN_GET_CPU_STATS_MAX {
        return Err(RpcError::LimitExceeded {
            what: "cpu stats parameters".to_string(),
            count: slots,
            limit: DOMAIN_GET_CPU_STATS_MAX,
        });
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
