//! Event classes and event payloads fired by the management API.
//!
//! Event classes form a closed set. Anything that needs a per-class answer
//! (wire procedure, legacy support) matches on the enum exhaustively, so a
//! new class cannot be added without the compiler pointing at every table.

use serde::{Deserialize, Serialize};

use crate::domain::instance::{InstanceRef, NetworkRef};
use crate::domain::typed_param::TypedParam;

// ── Domain event classes ──────────────────────────────────────────────────────

/// Event classes reported for managed instances, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum DomainEventClass {
    Lifecycle = 0,
    Reboot = 1,
    RtcChange = 2,
    Watchdog = 3,
    IoError = 4,
    Graphics = 5,
    IoErrorReason = 6,
    ControlError = 7,
    BlockJob = 8,
    DiskChange = 9,
    TrayChange = 10,
    PmWakeup = 11,
    PmSuspend = 12,
    BalloonChange = 13,
    PmSuspendDisk = 14,
    DeviceRemoved = 15,
    BlockJob2 = 16,
    Tunable = 17,
    AgentLifecycle = 18,
}

impl DomainEventClass {
    /// Every class, in wire order.
    pub const ALL: [DomainEventClass; 19] = [
        DomainEventClass::Lifecycle,
        DomainEventClass::Reboot,
        DomainEventClass::RtcChange,
        DomainEventClass::Watchdog,
        DomainEventClass::IoError,
        DomainEventClass::Graphics,
        DomainEventClass::IoErrorReason,
        DomainEventClass::ControlError,
        DomainEventClass::BlockJob,
        DomainEventClass::DiskChange,
        DomainEventClass::TrayChange,
        DomainEventClass::PmWakeup,
        DomainEventClass::PmSuspend,
        DomainEventClass::BalloonChange,
        DomainEventClass::PmSuspendDisk,
        DomainEventClass::DeviceRemoved,
        DomainEventClass::BlockJob2,
        DomainEventClass::Tunable,
        DomainEventClass::AgentLifecycle,
    ];

    /// Whether older clients have a dedicated wire message for this class.
    ///
    /// Classes added after `DeviceRemoved` are only deliverable through the
    /// callback-id envelope.
    pub fn has_legacy_form(self) -> bool {
        match self {
            DomainEventClass::Lifecycle
            | DomainEventClass::Reboot
            | DomainEventClass::RtcChange
            | DomainEventClass::Watchdog
            | DomainEventClass::IoError
            | DomainEventClass::Graphics
            | DomainEventClass::IoErrorReason
            | DomainEventClass::ControlError
            | DomainEventClass::BlockJob
            | DomainEventClass::DiskChange
            | DomainEventClass::TrayChange
            | DomainEventClass::PmWakeup
            | DomainEventClass::PmSuspend
            | DomainEventClass::BalloonChange
            | DomainEventClass::PmSuspendDisk
            | DomainEventClass::DeviceRemoved => true,
            DomainEventClass::BlockJob2
            | DomainEventClass::Tunable
            | DomainEventClass::AgentLifecycle => false,
        }
    }
}

impl TryFrom<i32> for DomainEventClass {
    type Error = ();

    fn try_from(value: i32) -> Result<Self, ()> {
        usize::try_from(value)
            .ok()
            .and_then(|i| DomainEventClass::ALL.get(i).copied())
            .ok_or(())
    }
}

/// Event classes reported for virtual networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum NetworkEventClass {
    Lifecycle = 0,
}

impl TryFrom<i32> for NetworkEventClass {
    type Error = ();

    fn try_from(value: i32) -> Result<Self, ()> {
        match value {
            0 => Ok(NetworkEventClass::Lifecycle),
            _ => Err(()),
        }
    }
}

/// Any subscribable event class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventClass {
    Domain(DomainEventClass),
    Network(NetworkEventClass),
}

/// Optional filter narrowing a subscription to a single object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTarget {
    Instance(InstanceRef),
    Network(NetworkRef),
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// Address of one end of a graphics connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphicsAddress {
    pub family: i32,
    pub node: String,
    pub service: String,
}

/// One authenticated identity attached to a graphics client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphicsIdentity {
    pub kind: String,
    pub name: String,
}

/// Payload of an event fired for a managed instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DomainEvent {
    Lifecycle {
        event: i32,
        detail: i32,
    },
    Reboot,
    RtcChange {
        offset: i64,
    },
    Watchdog {
        action: i32,
    },
    IoError {
        src_path: String,
        dev_alias: String,
        action: i32,
    },
    Graphics {
        phase: i32,
        local: GraphicsAddress,
        remote: GraphicsAddress,
        auth_scheme: String,
        subject: Vec<GraphicsIdentity>,
    },
    IoErrorReason {
        src_path: String,
        dev_alias: String,
        action: i32,
        reason: String,
    },
    ControlError,
    BlockJob {
        path: String,
        job_type: i32,
        status: i32,
    },
    DiskChange {
        old_src_path: Option<String>,
        new_src_path: Option<String>,
        dev_alias: String,
        reason: i32,
    },
    TrayChange {
        dev_alias: String,
        reason: i32,
    },
    PmWakeup {
        reason: i32,
    },
    PmSuspend {
        reason: i32,
    },
    BalloonChange {
        actual: u64,
    },
    PmSuspendDisk {
        reason: i32,
    },
    DeviceRemoved {
        dev_alias: String,
    },
    BlockJob2 {
        dst: String,
        job_type: i32,
        status: i32,
    },
    Tunable {
        params: Vec<TypedParam>,
    },
    AgentLifecycle {
        state: i32,
        reason: i32,
    },
}

impl DomainEvent {
    pub fn class(&self) -> DomainEventClass {
        match self {
            DomainEvent::Lifecycle { .. } => DomainEventClass::Lifecycle,
            DomainEvent::Reboot => DomainEventClass::Reboot,
            DomainEvent::RtcChange { .. } => DomainEventClass::RtcChange,
            DomainEvent::Watchdog { .. } => DomainEventClass::Watchdog,
            DomainEvent::IoError { .. } => DomainEventClass::IoError,
            DomainEvent::Graphics { .. } => DomainEventClass::Graphics,
            DomainEvent::IoErrorReason { .. } => DomainEventClass::IoErrorReason,
            DomainEvent::ControlError => DomainEventClass::ControlError,
            DomainEvent::BlockJob { .. } => DomainEventClass::BlockJob,
            DomainEvent::DiskChange { .. } => DomainEventClass::DiskChange,
            DomainEvent::TrayChange { .. } => DomainEventClass::TrayChange,
            DomainEvent::PmWakeup { .. } => DomainEventClass::PmWakeup,
            DomainEvent::PmSuspend { .. } => DomainEventClass::PmSuspend,
            DomainEvent::BalloonChange { .. } => DomainEventClass::BalloonChange,
            DomainEvent::PmSuspendDisk { .. } => DomainEventClass::PmSuspendDisk,
            DomainEvent::DeviceRemoved { .. } => DomainEventClass::DeviceRemoved,
            DomainEvent::BlockJob2 { .. } => DomainEventClass::BlockJob2,
            DomainEvent::Tunable { .. } => DomainEventClass::Tunable,
            DomainEvent::AgentLifecycle { .. } => DomainEventClass::AgentLifecycle,
        }
    }
}

/// Payload of an event fired for a virtual network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkEvent {
    Lifecycle { event: i32, detail: i32 },
}

impl NetworkEvent {
    pub fn class(&self) -> NetworkEventClass {
        match self {
            NetworkEvent::Lifecycle { .. } => NetworkEventClass::Lifecycle,
        }
    }
}

/// An event together with the object it concerns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    Domain {
        instance: InstanceRef,
        event: DomainEvent,
    },
    Network {
        network: NetworkRef,
        event: NetworkEvent,
    },
}

impl Event {
    pub fn class(&self) -> EventClass {
        match self {
            Event::Domain { event, .. } => EventClass::Domain(event.class()),
            Event::Network { event, .. } => EventClass::Network(event.class()),
        }
    }

    /// Whether this event concerns `target`.
    pub fn concerns(&self, target: &EventTarget) -> bool {
        match (self, target) {
            (Event::Domain { instance, .. }, EventTarget::Instance(t)) => instance.uuid == t.uuid,
            (Event::Network { network, .. }, EventTarget::Network(t)) => network.uuid == t.uuid,
            _ => false,
        }
    }
}
