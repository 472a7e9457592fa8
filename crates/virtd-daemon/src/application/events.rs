//! Event callback registry and relay.
//!
//! Registration bridges a synchronous RPC with asynchronous delivery:
//!
//! 1. Under the context lock, a placeholder record (registration id
//!    [`UNREGISTERED`]) is appended.
//! 2. Outside the lock, the management API registers a [`RelaySink`] that
//!    points back at that record.
//! 3. Under the lock again, the placeholder is patched with the real id. If
//!    the record vanished in the meantime (teardown ran), the fresh
//!    registration is undone and the call fails.
//!
//! The relay runs on the driver's notification thread. It never blocks: the
//! frame is pushed with `try_send` and dropped if the queue is full.

use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use virtd_core::domain::event::{DomainEventClass, Event, EventClass, EventTarget, NetworkEventClass};
use virtd_core::error::RpcError;
use virtd_core::protocol::events::DeliveryFormat;

use crate::application::connection::{CallbackRecord, ClientContext, UNREGISTERED};
use crate::application::management::EventSink;

// ── Relay ─────────────────────────────────────────────────────────────────────

/// Sink handed to the management API for one callback record.
///
/// Holds a non-owning reference to the context so a registration the
/// driver forgot to drop cannot keep a dead connection alive.
pub struct RelaySink {
    ctx: Weak<ClientContext>,
    record_key: u64,
}

impl EventSink for RelaySink {
    fn deliver(&self, event: Event) {
        match self.ctx.upgrade() {
            Some(ctx) => relay(&ctx, self.record_key, event),
            None => debug!(record = self.record_key, "event for a dropped connection discarded"),
        }
    }
}

/// Converts `event` into a wire frame for one subscriber and queues it.
///
/// Errors are logged and swallowed; delivery is best effort.
pub fn relay(ctx: &ClientContext, record_key: u64, event: Event) {
    let format = {
        let st = ctx.lock();
        match st.callbacks.iter().find(|r| r.key == record_key) {
            Some(r) if r.is_deliverable() => {
                if let Some(target) = &r.target {
                    if !event.concerns(target) {
                        debug!(conn = ctx.id(), callback_id = r.callback_id, "event outside subscription filter dropped");
                        return;
                    }
                }
                r.format
            }
            _ => {
                debug!(conn = ctx.id(), record = record_key, "event for inactive callback dropped");
                return;
            }
        }
    };

    let frame = match format.wrap(event).and_then(|d| d.to_frame()) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(conn = ctx.id(), record = record_key, "failed to build event message: {e}");
            return;
        }
    };

    // Re-check under the lock so nothing is queued once teardown has begun.
    let st = ctx.lock();
    let live = st
        .callbacks
        .iter()
        .any(|r| r.key == record_key && r.is_deliverable());
    if !live {
        debug!(conn = ctx.id(), record = record_key, "callback retired while building event");
        return;
    }
    if let Err(e) = ctx.outbound().try_send(frame) {
        debug!(conn = ctx.id(), record = record_key, "event dropped: {e}");
    }
}

// ── Registration ──────────────────────────────────────────────────────────────

/// Which client procedure is registering, which fixes the wire format and
/// how the client-visible id is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    /// `DomainEventRegisterAny`, or `ConnectDomainEventRegister` for
    /// Lifecycle: id is the class number.
    LegacyDomain(DomainEventClass),
    /// `ConnectDomainEventCallbackRegisterAny`.
    Domain(DomainEventClass),
    /// `ConnectNetworkEventRegisterAny`.
    Network(NetworkEventClass),
}

impl Subscription {
    pub fn class(self) -> EventClass {
        match self {
            Subscription::LegacyDomain(c) | Subscription::Domain(c) => EventClass::Domain(c),
            Subscription::Network(c) => EventClass::Network(c),
        }
    }
}

/// Registers a subscription and returns the id the client names it by.
///
/// # Errors
///
/// - [`RpcError::ConnectionNotOpen`] without an open management connection,
///   or when teardown overtook the registration.
/// - [`RpcError::Unsupported`] for a legacy registration of a class that has
///   no legacy message.
/// - [`RpcError::OperationFailed`] for a duplicate legacy registration.
/// - [`RpcError::Upstream`] when the management API refuses.
pub fn register(
    ctx: &Arc<ClientContext>,
    subscription: Subscription,
    target: Option<EventTarget>,
) -> Result<i32, RpcError> {
    let conn = ctx.connection()?;
    let class = subscription.class();

    let (key, callback_id) = {
        let mut st = ctx.lock();
        if st.conn.is_none() {
            return Err(RpcError::ConnectionNotOpen);
        }
        let (callback_id, format) = match subscription {
            Subscription::LegacyDomain(c) => {
                if !c.has_legacy_form() {
                    return Err(RpcError::Unsupported(format!("unsupported event ID {}", c as i32)));
                }
                if st.callbacks.iter().any(|r| r.is_legacy() && r.class == class) {
                    return Err(RpcError::OperationFailed(format!(
                        "domain event {} already registered",
                        c as i32
                    )));
                }
                (c as i32, DeliveryFormat::Legacy)
            }
            Subscription::Domain(_) | Subscription::Network(_) => {
                let id = ctx
                    .callback_ids()
                    .next()
                    .ok_or_else(|| RpcError::OperationFailed("callback ids exhausted".to_string()))?;
                (id, DeliveryFormat::Modern { callback_id: id })
            }
        };
        let key = st.next_record_key;
        st.next_record_key += 1;
        st.callbacks.push(CallbackRecord {
            key,
            callback_id,
            class,
            target: target.clone(),
            registration_id: UNREGISTERED,
            format,
        });
        (key, callback_id)
    };

    let sink = Arc::new(RelaySink {
        ctx: Arc::downgrade(ctx),
        record_key: key,
    });
    let result = conn.register_event(class, target.as_ref(), sink);

    let mut st = ctx.lock();
    let slot = st.callbacks.iter().position(|r| r.key == key);
    match (result, slot) {
        (Ok(registration_id), Some(i)) => {
            st.callbacks[i].registration_id = registration_id;
            debug!(conn = ctx.id(), callback_id, registration_id, ?class, "event callback registered");
            Ok(callback_id)
        }
        (Ok(registration_id), None) => {
            drop(st);
            if let Err(e) = conn.deregister_event(registration_id) {
                warn!(conn = ctx.id(), registration_id, "failed to undo registration after teardown: {e}");
            }
            Err(RpcError::ConnectionNotOpen)
        }
        (Err(e), slot) => {
            if let Some(i) = slot {
                st.callbacks.remove(i);
            }
            Err(RpcError::Upstream(e))
        }
    }
}

/// Which client procedure is deregistering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deregistration {
    /// `DomainEventDeregisterAny(class)` or `ConnectDomainEventDeregister`.
    LegacyDomain(DomainEventClass),
    /// `ConnectDomainEventCallbackDeregisterAny(callback_id)`.
    Domain(i32),
    /// `ConnectNetworkEventDeregisterAny(callback_id)`.
    Network(i32),
}

/// Removes a subscription.
///
/// The record stays in place until the management API has confirmed the
/// deregistration; on failure it is restored unchanged. While the call is in
/// flight the record carries no registration id, so the relay drops its
/// events, teardown leaves it alone and a second deregistration of the same
/// subscription fails as not registered.
///
/// # Errors
///
/// - [`RpcError::ConnectionNotOpen`] without an open management connection.
/// - [`RpcError::NotRegistered`] when no live record matches.
/// - [`RpcError::Upstream`] when the management API refuses.
pub fn deregister(ctx: &Arc<ClientContext>, which: Deregistration) -> Result<(), RpcError> {
    let conn = ctx.connection()?;

    let (key, registration_id) = {
        let mut st = ctx.lock();
        let found = st.callbacks.iter_mut().find(|r| {
            r.is_deliverable()
                && match which {
                    Deregistration::LegacyDomain(c) => r.is_legacy() && r.class == EventClass::Domain(c),
                    Deregistration::Domain(id) => {
                        !r.is_legacy() && matches!(r.class, EventClass::Domain(_)) && r.callback_id == id
                    }
                    Deregistration::Network(id) => matches!(r.class, EventClass::Network(_)) && r.callback_id == id,
                }
        });
        match found {
            Some(r) => {
                let registration_id = std::mem::replace(&mut r.registration_id, UNREGISTERED);
                (r.key, registration_id)
            }
            None => return Err(not_registered(which)),
        }
    };

    let result = conn.deregister_event(registration_id);

    let mut st = ctx.lock();
    let slot = st.callbacks.iter().position(|r| r.key == key);
    match (result, slot) {
        (Ok(()), Some(i)) => {
            st.callbacks.remove(i);
            debug!(conn = ctx.id(), registration_id, ?which, "event callback deregistered");
            Ok(())
        }
        (Ok(()), None) => {
            debug!(conn = ctx.id(), registration_id, ?which, "event callback deregistered during teardown");
            Ok(())
        }
        (Err(e), Some(i)) => {
            st.callbacks[i].registration_id = registration_id;
            Err(RpcError::Upstream(e))
        }
        (Err(e), None) => {
            drop(st);
            warn!(conn = ctx.id(), registration_id, "deregistration failed after teardown retired the callback: {e}");
            Err(RpcError::Upstream(e))
        }
    }
}

fn not_registered(which: Deregistration) -> RpcError {
    match which {
        Deregistration::LegacyDomain(c) => RpcError::NotRegistered(format!("domain event {}", c as i32)),
        Deregistration::Domain(id) => RpcError::NotRegistered(format!("domain event callback {id}")),
        Deregistration::Network(id) => RpcError::NotRegistered(format!("network event callback {id}")),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
