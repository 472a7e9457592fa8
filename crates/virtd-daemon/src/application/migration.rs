//! Migration protocol handler.
//!
//! Every phase of a version 3 migration arrives in one of two wire forms: a
//! fixed list of optional scalars, or a typed-parameter list. Both are
//! normalised into a [`MigrationRequest`] before the management API is
//! called, so the driver sees one request shape.
//!
//! Cookies are forwarded untouched. No phase rolls back work already done on
//! the peer host; that is the calling client's job.

use std::sync::Arc;

use tracing::{debug, info};

use virtd_core::domain::instance::InstanceRef;
use virtd_core::domain::migration::{MigrationCookie, MigrationPhase, MigrationRequest};
use virtd_core::error::RpcError;
use virtd_core::protocol::remote::{
    MigrateBegin3Args, MigrateBegin3ParamsArgs, MigrateBegin3Ret, MigrateConfirm3Args, MigrateConfirm3ParamsArgs,
    MigrateFinish3Args, MigrateFinish3ParamsArgs, MigrateFinish3Ret, MigratePerform3Args, MigratePerform3ParamsArgs,
    MigratePerform3Ret, MigratePrepare3Args, MigratePrepare3ParamsArgs, MigratePrepare3Ret,
};

use crate::application::connection::ClientContext;
use crate::application::management::ManagementConnection;

fn writable(ctx: &ClientContext) -> Result<Arc<dyn ManagementConnection>, RpcError> {
    let conn = ctx.connection()?;
    if ctx.is_read_only() {
        return Err(RpcError::OperationDenied("migration needs a read-write connection".to_string()));
    }
    Ok(conn)
}

fn log_phase(ctx: &ClientContext, phase: MigrationPhase, dom: Option<&InstanceRef>, req: &MigrationRequest) {
    info!(
        conn = ctx.id(),
        ?phase,
        dom = dom.map(|d| d.name.as_str()).unwrap_or("-"),
        flags = req.flags,
        params = req.params.len(),
        "migration phase"
    );
}

// ── Begin ─────────────────────────────────────────────────────────────────────

pub fn begin3(ctx: &ClientContext, args: MigrateBegin3Args) -> Result<MigrateBegin3Ret, RpcError> {
    let req = MigrationRequest::from_scalars(
        args.flags,
        None,
        args.dname.as_deref(),
        args.xmlin.as_deref(),
        args.bandwidth,
    );
    begin(ctx, &args.dom, req)
}

pub fn begin3_params(ctx: &ClientContext, args: MigrateBegin3ParamsArgs) -> Result<MigrateBegin3Ret, RpcError> {
    let req = MigrationRequest::new(args.params.0, u64::from(args.flags));
    begin(ctx, &args.dom, req)
}

fn begin(ctx: &ClientContext, dom: &InstanceRef, req: MigrationRequest) -> Result<MigrateBegin3Ret, RpcError> {
    let conn = writable(ctx)?;
    log_phase(ctx, MigrationPhase::Begin, Some(dom), &req);
    let (xml, cookie_out) = conn.migrate_begin(dom, &req)?;
    debug!(conn = ctx.id(), cookie_len = cookie_out.0.len(), "begin produced cookie");
    Ok(MigrateBegin3Ret { cookie_out, xml })
}

// ── Prepare ───────────────────────────────────────────────────────────────────

pub fn prepare3(ctx: &ClientContext, args: MigratePrepare3Args) -> Result<MigratePrepare3Ret, RpcError> {
    let req = MigrationRequest::from_scalars(
        args.flags,
        args.uri_in.as_deref(),
        args.dname.as_deref(),
        Some(args.dom_xml.as_str()),
        args.bandwidth,
    );
    prepare(ctx, args.cookie_in, req)
}

pub fn prepare3_params(ctx: &ClientContext, args: MigratePrepare3ParamsArgs) -> Result<MigratePrepare3Ret, RpcError> {
    let req = MigrationRequest::new(args.params.0, u64::from(args.flags));
    prepare(ctx, args.cookie_in, req)
}

fn prepare(
    ctx: &ClientContext,
    cookie_in: MigrationCookie,
    req: MigrationRequest,
) -> Result<MigratePrepare3Ret, RpcError> {
    let conn = writable(ctx)?;
    log_phase(ctx, MigrationPhase::Prepare, None, &req);
    let (cookie_out, uri_out) = conn.migrate_prepare(&cookie_in, &req)?;
    Ok(MigratePrepare3Ret { cookie_out, uri_out })
}

// ── Perform ───────────────────────────────────────────────────────────────────

pub fn perform3(ctx: &ClientContext, args: MigratePerform3Args) -> Result<MigratePerform3Ret, RpcError> {
    let req = MigrationRequest::from_scalars(
        args.flags,
        args.uri.as_deref(),
        args.dname.as_deref(),
        args.xmlin.as_deref(),
        args.bandwidth,
    );
    let conn = writable(ctx)?;
    log_phase(ctx, MigrationPhase::Perform, Some(&args.dom), &req);
    let cookie_out = conn.migrate_perform(&args.dom, &args.cookie_in, args.dconnuri.as_deref(), &req)?;
    Ok(MigratePerform3Ret { cookie_out })
}

pub fn perform3_params(ctx: &ClientContext, args: MigratePerform3ParamsArgs) -> Result<MigratePerform3Ret, RpcError> {
    let req = MigrationRequest::new(args.params.0, u64::from(args.flags));
    let conn = writable(ctx)?;
    log_phase(ctx, MigrationPhase::Perform, Some(&args.dom), &req);
    let cookie_out = conn.migrate_perform(&args.dom, &args.cookie_in, args.dconnuri.as_deref(), &req)?;
    Ok(MigratePerform3Ret { cookie_out })
}

// ── Finish ────────────────────────────────────────────────────────────────────

pub fn finish3(ctx: &ClientContext, args: MigrateFinish3Args) -> Result<MigrateFinish3Ret, RpcError> {
    let req = MigrationRequest::from_scalars(args.flags, args.uri.as_deref(), Some(args.dname.as_str()), None, 0);
    finish(ctx, args.cookie_in, args.dconnuri.as_deref(), req, args.cancelled != 0)
}

pub fn finish3_params(ctx: &ClientContext, args: MigrateFinish3ParamsArgs) -> Result<MigrateFinish3Ret, RpcError> {
    let req = MigrationRequest::new(args.params.0, u64::from(args.flags));
    finish(ctx, args.cookie_in, None, req, args.cancelled != 0)
}

fn finish(
    ctx: &ClientContext,
    cookie_in: MigrationCookie,
    dconnuri: Option<&str>,
    req: MigrationRequest,
    cancelled: bool,
) -> Result<MigrateFinish3Ret, RpcError> {
    let conn = writable(ctx)?;
    log_phase(ctx, MigrationPhase::Finish, None, &req);
    let (dom, cookie_out) = conn.migrate_finish(&cookie_in, dconnuri, &req, cancelled)?;
    Ok(MigrateFinish3Ret { dom, cookie_out })
}

// ── Confirm ───────────────────────────────────────────────────────────────────

pub fn confirm3(ctx: &ClientContext, args: MigrateConfirm3Args) -> Result<(), RpcError> {
    let req = MigrationRequest::new(Vec::new(), args.flags);
    confirm(ctx, &args.dom, args.cookie_in, req, args.cancelled != 0)
}

pub fn confirm3_params(ctx: &ClientContext, args: MigrateConfirm3ParamsArgs) -> Result<(), RpcError> {
    let req = MigrationRequest::new(args.params.0, u64::from(args.flags));
    confirm(ctx, &args.dom, args.cookie_in, req, args.cancelled != 0)
}

fn confirm(
    ctx: &ClientContext,
    dom: &InstanceRef,
    cookie_in: MigrationCookie,
    req: MigrationRequest,
    cancelled: bool,
) -> Result<(), RpcError> {
    let conn = writable(ctx)?;
    log_phase(ctx, MigrationPhase::Confirm, Some(dom), &req);
    conn.migrate_confirm(dom, &cookie_in, &req, cancelled)?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
