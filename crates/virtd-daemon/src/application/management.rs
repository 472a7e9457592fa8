//! The seam between the protocol engine and the internal management API.
//!
//! Everything the daemon asks of the hypervisor goes through these traits.
//! Calls are synchronous and may block for as long as the driver needs, so
//! the dispatcher only ever makes them from a worker thread and never while
//! holding a connection lock.
//!
//! Events travel the other way: the driver calls [`EventSink::deliver`] on
//! whatever thread it fires notifications from.

use std::sync::Arc;

use virtd_core::domain::event::{Event, EventClass, EventTarget};
use virtd_core::domain::instance::InstanceRef;
use virtd_core::domain::migration::{MigrationCookie, MigrationRequest};
use virtd_core::domain::typed_param::TypedParam;
use virtd_core::error::UpstreamError;

/// Result type of every management API call.
pub type MgmtResult<T> = Result<T, UpstreamError>;

/// Receives events fired by the management API for one registration.
///
/// Implementations must not block and must not call back into the
/// management API.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: Event);
}

/// Entry point of the management API: opens per-client connections.
pub trait Hypervisor: Send + Sync {
    /// Opens a management connection for `name` (the driver URI).
    fn open(&self, name: Option<&str>, read_only: bool) -> MgmtResult<Arc<dyn ManagementConnection>>;
}

/// Reply of a per-CPU statistics query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CpuStats {
    /// Parameters reported for each CPU.
    pub nparams: i32,
    /// `nparams * ncpus` slots; slots a CPU did not fill are
    /// [`TypedParam::unset`].
    pub params: Vec<TypedParam>,
}

/// One open management connection.
pub trait ManagementConnection: Send + Sync {
    /// Releases the connection. Called once, at teardown.
    fn close(&self) -> MgmtResult<()>;

    fn version(&self) -> MgmtResult<u64>;

    /// Ids of running instances, at most `max`.
    fn list_instances(&self, max: usize) -> MgmtResult<Vec<i32>>;

    fn lookup_by_name(&self, name: &str) -> MgmtResult<InstanceRef>;

    /// Subscribes `sink` to `class`, optionally narrowed to `target`.
    ///
    /// Returns a non-negative registration id. The driver may call
    /// `sink` before this function returns.
    fn register_event(
        &self,
        class: EventClass,
        target: Option<&EventTarget>,
        sink: Arc<dyn EventSink>,
    ) -> MgmtResult<i32>;

    fn deregister_event(&self, registration_id: i32) -> MgmtResult<()>;

    fn scheduler_parameters(&self, dom: &InstanceRef, nparams: usize) -> MgmtResult<Vec<TypedParam>>;

    fn set_scheduler_parameters(&self, dom: &InstanceRef, params: &[TypedParam]) -> MgmtResult<()>;

    /// Per-CPU statistics. `nparams == 0` asks only for the per-CPU count.
    fn cpu_stats(
        &self,
        dom: &InstanceRef,
        nparams: u32,
        start_cpu: i32,
        ncpus: u32,
        flags: u32,
    ) -> MgmtResult<CpuStats>;

    fn block_peek(&self, dom: &InstanceRef, path: &str, offset: u64, size: u32, flags: u32) -> MgmtResult<Vec<u8>>;

    fn memory_peek(&self, dom: &InstanceRef, offset: u64, size: u32, flags: u32) -> MgmtResult<Vec<u8>>;

    /// Source side: describes the instance and produces the first cookie.
    fn migrate_begin(&self, dom: &InstanceRef, req: &MigrationRequest) -> MgmtResult<(String, MigrationCookie)>;

    /// Destination side: reserves resources and returns a cookie plus the
    /// URI the source should stream to.
    fn migrate_prepare(
        &self,
        cookie_in: &MigrationCookie,
        req: &MigrationRequest,
    ) -> MgmtResult<(MigrationCookie, Option<String>)>;

    /// Source side: streams state to the destination.
    fn migrate_perform(
        &self,
        dom: &InstanceRef,
        cookie_in: &MigrationCookie,
        dconnuri: Option<&str>,
        req: &MigrationRequest,
    ) -> MgmtResult<MigrationCookie>;

    /// Destination side: starts the incoming instance, or discards it when
    /// `cancelled`.
    fn migrate_finish(
        &self,
        cookie_in: &MigrationCookie,
        dconnuri: Option<&str>,
        req: &MigrationRequest,
        cancelled: bool,
    ) -> MgmtResult<(InstanceRef, MigrationCookie)>;

    /// Source side: removes the original instance, or resumes it when
    /// `cancelled`.
    fn migrate_confirm(
        &self,
        dom: &InstanceRef,
        cookie_in: &MigrationCookie,
        req: &MigrationRequest,
        cancelled: bool,
    ) -> MgmtResult<()>;
}
