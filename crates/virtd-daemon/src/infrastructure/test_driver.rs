//! In-memory management driver.
//!
//! Serves the `test:///default` URI: a handful of instances held in memory,
//! event registrations that fire synchronously through [`TestDriver::fire`],
//! and a migration handshake that checks cookies end to end. The daemon
//! binary serves it when no real hypervisor is wired in, and the tests use it
//! as a recording double of the management API.
//!
//! Hooks let a test run code from inside `register_event`, which is the only
//! way to reproduce "the driver fires, or the client disconnects, before
//! registration returns" deterministically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;
use uuid::Uuid;

use virtd_core::domain::event::{Event, EventClass, EventTarget};
use virtd_core::domain::instance::InstanceRef;
use virtd_core::domain::migration::{MigrationCookie, MigrationRequest};
use virtd_core::domain::typed_param::TypedParam;
use virtd_core::error::UpstreamError;

use crate::application::management::{CpuStats, EventSink, Hypervisor, ManagementConnection, MgmtResult};

/// URI this driver answers to. `None` also selects it.
pub const DEFAULT_URI: &str = "test:///default";

/// Version reported by `ConnectGetVersion` (major * 1_000_000 + minor * 1000).
pub const DRIVER_VERSION: u64 = 2_000_000;

/// CPUs every instance reports statistics for.
pub const HOST_CPUS: u32 = 4;

/// Upstream error code for a lookup that found nothing.
pub const ERR_NO_DOMAIN: i32 = 42;

type Hook = Box<dyn FnOnce() + Send>;

struct Registration {
    class: EventClass,
    target: Option<EventTarget>,
    sink: Arc<dyn EventSink>,
}

struct Instance {
    dom: InstanceRef,
    scheduler: Vec<TypedParam>,
}

#[derive(Default)]
struct DriverState {
    instances: Vec<Instance>,
    next_domain_id: i32,
    registrations: HashMap<i32, Registration>,
    next_registration_id: i32,
    open_count: usize,
    close_count: usize,
    register_hook: Option<Hook>,
    deregister_hook: Option<Hook>,
    /// Every id `deregister_event` was asked to drop, in call order.
    deregister_calls: Vec<i32>,
    fail_register: Option<String>,
    fail_deregister: Option<String>,
    /// Perform cookie issued per instance, checked by confirm.
    perform_cookies: HashMap<Uuid, MigrationCookie>,
    migration_log: Vec<String>,
    migration_requests: Vec<MigrationRequest>,
    cookie_serial: u64,
}

impl DriverState {
    fn find(&self, dom: &InstanceRef) -> MgmtResult<&Instance> {
        self.instances
            .iter()
            .find(|i| i.dom.uuid == dom.uuid)
            .ok_or_else(|| no_domain(&dom.name))
    }

    fn find_mut(&mut self, dom: &InstanceRef) -> MgmtResult<&mut Instance> {
        self.instances
            .iter_mut()
            .find(|i| i.dom.uuid == dom.uuid)
            .ok_or_else(|| no_domain(&dom.name))
    }

    fn define(&mut self, name: &str) -> InstanceRef {
        self.next_domain_id += 1;
        let dom = InstanceRef::new(name, Uuid::new_v4(), self.next_domain_id);
        self.instances.push(Instance {
            dom: dom.clone(),
            scheduler: default_scheduler(),
        });
        dom
    }

    fn cookie(&mut self, phase: &str, dom: &Uuid) -> MigrationCookie {
        self.cookie_serial += 1;
        MigrationCookie::new(format!("{phase}:{dom}:{}", self.cookie_serial).into_bytes())
    }
}

fn no_domain(name: &str) -> UpstreamError {
    UpstreamError::with_code(ERR_NO_DOMAIN, format!("domain not found: no domain with matching name '{name}'"))
}

fn default_scheduler() -> Vec<TypedParam> {
    vec![
        TypedParam::ullong("cpu_shares", 1024),
        TypedParam::ullong("vcpu_period", 100_000),
        TypedParam::llong("vcpu_quota", -1),
    ]
}

// ── Driver ────────────────────────────────────────────────────────────────────

/// Shared handle to the in-memory driver. Clones see the same state.
#[derive(Clone, Default)]
pub struct TestDriver {
    state: Arc<Mutex<DriverState>>,
}

impl TestDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Driver pre-populated with one running instance, as served by the
    /// daemon binary.
    pub fn with_default_instances() -> Self {
        let driver = Self::new();
        driver.define("test");
        driver
    }

    fn lock(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a running instance.
    pub fn define(&self, name: &str) -> InstanceRef {
        self.lock().define(name)
    }

    /// Delivers `event` to every matching registration, on the caller's
    /// thread, the way a driver's notification thread would.
    pub fn fire(&self, event: Event) {
        let sinks: Vec<Arc<dyn EventSink>> = {
            let st = self.lock();
            st.registrations
                .values()
                .filter(|r| r.class == event.class())
                .filter(|r| r.target.as_ref().map_or(true, |t| event.concerns(t)))
                .map(|r| Arc::clone(&r.sink))
                .collect()
        };
        debug!(sinks = sinks.len(), class = ?event.class(), "test driver firing event");
        for sink in sinks {
            sink.deliver(event.clone());
        }
    }

    /// Runs `hook` inside the next `register_event`, after the sink is
    /// installed and before the call returns.
    pub fn on_next_registration(&self, hook: impl FnOnce() + Send + 'static) {
        self.lock().register_hook = Some(Box::new(hook));
    }

    /// Fires `event` from inside the next `register_event`.
    pub fn fire_during_next_registration(&self, event: Event) {
        let driver = self.clone();
        self.on_next_registration(move || driver.fire(event));
    }

    /// Runs `hook` inside the next `deregister_event`, after the driver has
    /// dropped the registration and before the call returns.
    pub fn on_next_deregistration(&self, hook: impl FnOnce() + Send + 'static) {
        self.lock().deregister_hook = Some(Box::new(hook));
    }

    pub fn fail_next_registration(&self, message: &str) {
        self.lock().fail_register = Some(message.to_string());
    }

    pub fn fail_next_deregistration(&self, message: &str) {
        self.lock().fail_deregister = Some(message.to_string());
    }

    /// Registrations the driver still holds.
    pub fn live_registrations(&self) -> usize {
        self.lock().registrations.len()
    }

    /// Registration ids passed to `deregister_event`, including failed calls.
    pub fn deregistration_calls(&self) -> Vec<i32> {
        self.lock().deregister_calls.clone()
    }

    pub fn open_count(&self) -> usize {
        self.lock().open_count
    }

    pub fn close_count(&self) -> usize {
        self.lock().close_count
    }

    /// One line per migration call, `"<phase> <instance>"`.
    pub fn migration_log(&self) -> Vec<String> {
        self.lock().migration_log.clone()
    }

    /// Requests exactly as the migration calls received them.
    pub fn migration_requests(&self) -> Vec<MigrationRequest> {
        self.lock().migration_requests.clone()
    }
}

impl Hypervisor for TestDriver {
    fn open(&self, name: Option<&str>, read_only: bool) -> MgmtResult<Arc<dyn ManagementConnection>> {
        match name {
            None | Some(DEFAULT_URI) | Some("") => {}
            Some(other) => {
                return Err(UpstreamError::new(format!("no connection driver available for {other}")));
            }
        }
        self.lock().open_count += 1;
        debug!(read_only, "test driver connection opened");
        Ok(Arc::new(TestConnection {
            driver: self.clone(),
            read_only,
        }))
    }
}

// ── Connection ────────────────────────────────────────────────────────────────

struct TestConnection {
    driver: TestDriver,
    read_only: bool,
}

impl TestConnection {
    fn write_access(&self) -> MgmtResult<()> {
        if self.read_only {
            return Err(UpstreamError::new("operation forbidden: read only access prevents this"));
        }
        Ok(())
    }

    fn record(&self, phase: &str, dom: &str, req: &MigrationRequest) -> MutexGuard<'_, DriverState> {
        let mut st = self.driver.lock();
        st.migration_log.push(format!("{phase} {dom}"));
        st.migration_requests.push(req.clone());
        st
    }
}

impl ManagementConnection for TestConnection {
    fn close(&self) -> MgmtResult<()> {
        self.driver.lock().close_count += 1;
        Ok(())
    }

    fn version(&self) -> MgmtResult<u64> {
        Ok(DRIVER_VERSION)
    }

    fn list_instances(&self, max: usize) -> MgmtResult<Vec<i32>> {
        let st = self.driver.lock();
        Ok(st
            .instances
            .iter()
            .filter(|i| i.dom.id > 0)
            .map(|i| i.dom.id)
            .take(max)
            .collect())
    }

    fn lookup_by_name(&self, name: &str) -> MgmtResult<InstanceRef> {
        let st = self.driver.lock();
        st.instances
            .iter()
            .find(|i| i.dom.name == name)
            .map(|i| i.dom.clone())
            .ok_or_else(|| no_domain(name))
    }

    fn register_event(
        &self,
        class: EventClass,
        target: Option<&EventTarget>,
        sink: Arc<dyn EventSink>,
    ) -> MgmtResult<i32> {
        let (id, hook) = {
            let mut st = self.driver.lock();
            if let Some(message) = st.fail_register.take() {
                return Err(UpstreamError::new(message));
            }
            let id = st.next_registration_id;
            st.next_registration_id += 1;
            st.registrations.insert(
                id,
                Registration {
                    class,
                    target: target.cloned(),
                    sink,
                },
            );
            (id, st.register_hook.take())
        };
        if let Some(hook) = hook {
            hook();
        }
        Ok(id)
    }

    fn deregister_event(&self, registration_id: i32) -> MgmtResult<()> {
        let (result, hook) = {
            let mut st = self.driver.lock();
            st.deregister_calls.push(registration_id);
            if let Some(message) = st.fail_deregister.take() {
                return Err(UpstreamError::new(message));
            }
            let result = st
                .registrations
                .remove(&registration_id)
                .map(|_| ())
                .ok_or_else(|| UpstreamError::new(format!("callback {registration_id} not registered")));
            (result, st.deregister_hook.take())
        };
        if let Some(hook) = hook {
            hook();
        }
        result
    }

    fn scheduler_parameters(&self, dom: &InstanceRef, nparams: usize) -> MgmtResult<Vec<TypedParam>> {
        let st = self.driver.lock();
        let inst = st.find(dom)?;
        Ok(inst.scheduler.iter().take(nparams).cloned().collect())
    }

    fn set_scheduler_parameters(&self, dom: &InstanceRef, params: &[TypedParam]) -> MgmtResult<()> {
        self.write_access()?;
        let mut st = self.driver.lock();
        let inst = st.find_mut(dom)?;
        for p in params {
            match inst.scheduler.iter_mut().find(|s| s.field == p.field) {
                Some(slot) if slot.value.tag() == p.value.tag() => slot.value = p.value.clone(),
                Some(_) => {
                    return Err(UpstreamError::new(format!("invalid type for parameter '{}'", p.field)));
                }
                None => return Err(UpstreamError::new(format!("unsupported parameter '{}'", p.field))),
            }
        }
        Ok(())
    }

    fn cpu_stats(&self, dom: &InstanceRef, nparams: u32, start_cpu: i32, ncpus: u32, _flags: u32) -> MgmtResult<CpuStats> {
        let st = self.driver.lock();
        st.find(dom)?;

        if start_cpu < 0 {
            // Totals across all CPUs.
            let totals = vec![
                TypedParam::ullong("cpu_time", 9_000_000),
                TypedParam::ullong("user_time", 6_000_000),
                TypedParam::ullong("system_time", 3_000_000),
            ];
            let n = totals.len() as i32;
            if nparams == 0 {
                return Ok(CpuStats { nparams: n, params: Vec::new() });
            }
            return Ok(CpuStats {
                nparams: n,
                params: totals.into_iter().take(nparams as usize).collect(),
            });
        }

        // Per-CPU: cpu_time always, vcpu_time only on even CPUs.
        const PER_CPU: u32 = 2;
        if nparams == 0 {
            return Ok(CpuStats {
                nparams: PER_CPU as i32,
                params: Vec::new(),
            });
        }
        let start = start_cpu as u32;
        if start >= HOST_CPUS {
            return Err(UpstreamError::new(format!("start_cpu {start} larger than maximum of {}", HOST_CPUS - 1)));
        }
        let per = nparams.min(PER_CPU);
        let end = start.saturating_add(ncpus).min(HOST_CPUS);
        let mut params = Vec::with_capacity(((end - start) * nparams) as usize);
        for cpu in start..end {
            for slot in 0..nparams {
                let p = match slot {
                    0 => TypedParam::ullong("cpu_time", 1_000_000 * u64::from(cpu + 1)),
                    1 if slot < per && cpu % 2 == 0 => TypedParam::ullong("vcpu_time", 500_000 * u64::from(cpu + 1)),
                    _ => TypedParam::unset(),
                };
                params.push(p);
            }
        }
        Ok(CpuStats {
            nparams: per as i32,
            params,
        })
    }

    fn block_peek(&self, dom: &InstanceRef, path: &str, offset: u64, size: u32, _flags: u32) -> MgmtResult<Vec<u8>> {
        let st = self.driver.lock();
        st.find(dom)?;
        if path.is_empty() {
            return Err(UpstreamError::new("invalid path"));
        }
        Ok(pattern(offset, size))
    }

    fn memory_peek(&self, dom: &InstanceRef, offset: u64, size: u32, _flags: u32) -> MgmtResult<Vec<u8>> {
        let st = self.driver.lock();
        st.find(dom)?;
        Ok(pattern(offset, size))
    }

    fn migrate_begin(&self, dom: &InstanceRef, req: &MigrationRequest) -> MgmtResult<(String, MigrationCookie)> {
        self.write_access()?;
        let mut st = self.record("begin", &dom.name, req);
        let name = st.find(dom)?.dom.name.clone();
        let uuid = dom.uuid;
        let xml = format!("<domain><name>{name}</name><uuid>{uuid}</uuid></domain>");
        Ok((xml, st.cookie("begin", &uuid)))
    }

    fn migrate_prepare(
        &self,
        cookie_in: &MigrationCookie,
        req: &MigrationRequest,
    ) -> MgmtResult<(MigrationCookie, Option<String>)> {
        self.write_access()?;
        let mut st = self.record("prepare", req.dest_name().unwrap_or("-"), req);
        if cookie_in.is_empty() {
            return Err(UpstreamError::new("missing migration cookie"));
        }
        let uri = req.uri().map(str::to_string).unwrap_or_else(|| "tcp://localhost:49152".to_string());
        let cookie = st.cookie("prepare", &Uuid::nil());
        Ok((cookie, Some(uri)))
    }

    fn migrate_perform(
        &self,
        dom: &InstanceRef,
        _cookie_in: &MigrationCookie,
        _dconnuri: Option<&str>,
        req: &MigrationRequest,
    ) -> MgmtResult<MigrationCookie> {
        self.write_access()?;
        let mut st = self.record("perform", &dom.name, req);
        st.find(dom)?;
        let cookie = st.cookie("perform", &dom.uuid);
        st.perform_cookies.insert(dom.uuid, cookie.clone());
        Ok(cookie)
    }

    fn migrate_finish(
        &self,
        cookie_in: &MigrationCookie,
        _dconnuri: Option<&str>,
        req: &MigrationRequest,
        cancelled: bool,
    ) -> MgmtResult<(InstanceRef, MigrationCookie)> {
        self.write_access()?;
        let name = req
            .dest_name()
            .map(str::to_string)
            .ok_or_else(|| UpstreamError::new("missing destination name"))?;
        let mut st = self.record("finish", &name, req);
        if cancelled {
            return Err(UpstreamError::new(format!("migration of '{name}' was cancelled")));
        }
        if cookie_in.is_empty() {
            return Err(UpstreamError::new("missing migration cookie"));
        }
        let dom = match st.instances.iter().find(|i| i.dom.name == name) {
            Some(i) => i.dom.clone(),
            None => st.define(&name),
        };
        let cookie = st.cookie("finish", &dom.uuid);
        Ok((dom, cookie))
    }

    fn migrate_confirm(
        &self,
        dom: &InstanceRef,
        cookie_in: &MigrationCookie,
        req: &MigrationRequest,
        cancelled: bool,
    ) -> MgmtResult<()> {
        self.write_access()?;
        let mut st = self.record("confirm", &dom.name, req);
        st.find(dom)?;
        match st.perform_cookies.get(&dom.uuid) {
            Some(expected) if expected == cookie_in => {}
            _ => return Err(UpstreamError::new("migration cookie mismatch")),
        }
        st.perform_cookies.remove(&dom.uuid);
        if !cancelled {
            if let Ok(inst) = st.find_mut(dom) {
                inst.dom.id = -1;
            }
        }
        Ok(())
    }
}

fn pattern(offset: u64, size: u32) -> Vec<u8> {
    (0..u64::from(size)).map(|i| (offset.wrapping_add(i) & 0xff) as u8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtd_core::domain::event::{DomainEvent, DomainEventClass};
    use virtd_core::domain::typed_param::TypedValue;

    struct Counter(Mutex<usize>);

    impl EventSink for Counter {
        fn deliver(&self, _event: Event) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn test_unknown_uri_is_rejected() {
        let driver = TestDriver::new();
        assert!(driver.open(Some("qemu:///system"), false).is_err());
        assert!(driver.open(Some(DEFAULT_URI), false).is_ok());
    }

    #[test]
    fn test_fire_respects_class_and_target() {
        // Arrange
        let driver = TestDriver::new();
        let a = driver.define("a");
        let b = driver.define("b");
        let conn = driver.open(None, false).expect("open");
        let sink = Arc::new(Counter(Mutex::new(0)));
        conn.register_event(
            EventClass::Domain(DomainEventClass::Reboot),
            Some(&EventTarget::Instance(a.clone())),
            sink.clone(),
        )
        .expect("register");

        // Act
        driver.fire(Event::Domain { instance: b, event: DomainEvent::Reboot });
        driver.fire(Event::Domain { instance: a.clone(), event: DomainEvent::ControlError });
        driver.fire(Event::Domain { instance: a, event: DomainEvent::Reboot });

        // Assert
        assert_eq!(*sink.0.lock().unwrap(), 1);
    }

    #[test]
    fn test_cpu_stats_are_sparse_on_odd_cpus() {
        let driver = TestDriver::new();
        let dom = driver.define("a");
        let conn = driver.open(None, false).expect("open");

        let stats = conn.cpu_stats(&dom, 2, 0, 2, 0).expect("stats");

        assert_eq!(stats.nparams, 2);
        assert_eq!(stats.params.len(), 4);
        assert_eq!(stats.params[1].field, "vcpu_time");
        assert_eq!(stats.params[3].value, TypedValue::Unset);
    }

    #[test]
    fn test_read_only_connection_cannot_set_scheduler() {
        let driver = TestDriver::new();
        let dom = driver.define("a");
        let conn = driver.open(None, true).expect("open");

        let err = conn
            .set_scheduler_parameters(&dom, &[TypedParam::ullong("cpu_shares", 2048)])
            .unwrap_err();

        assert!(err.message.contains("read only"));
    }

    #[test]
    fn test_scheduler_type_mismatch_is_rejected() {
        let driver = TestDriver::new();
        let dom = driver.define("a");
        let conn = driver.open(None, false).expect("open");

        assert!(conn.set_scheduler_parameters(&dom, &[TypedParam::int("cpu_shares", 1)]).is_err());
        conn.set_scheduler_parameters(&dom, &[TypedParam::ullong("cpu_shares", 2048)])
            .expect("set");
        let params = conn.scheduler_parameters(&dom, 1).expect("get");
        assert_eq!(params, vec![TypedParam::ullong("cpu_shares", 2048)]);
    }
}
