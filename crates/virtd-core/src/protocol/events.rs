//! Wire forms of asynchronous event messages.
//!
//! An event reaches a client in one of two shapes, chosen when the client
//! subscribed:
//!
//! - **Legacy**: one procedure per event class, payload is the instance plus
//!   the class-specific body. No callback id; the client infers the
//!   subscription from the class. Only classes up to `DeviceRemoved` have a
//!   legacy procedure.
//! - **Modern**: one envelope procedure per object family, payload starts with
//!   the callback id and the class, so a single message type covers every
//!   class.
//!
//! All event frames use `MessageType::Message`, serial 1, status OK.

use crate::domain::event::{
    DomainEvent, DomainEventClass, Event, GraphicsAddress, GraphicsIdentity, NetworkEvent,
    NetworkEventClass,
};
use crate::domain::instance::{InstanceRef, NetworkRef};
use crate::protocol::codec::{
    encode_frame, to_bytes, CodecError, WireDecode, WireEncode, WireReader, WireWriter,
};
use crate::protocol::limits::{DOMAIN_EVENT_GRAPHICS_IDENTITY_MAX, DOMAIN_EVENT_TUNABLE_MAX};
use crate::protocol::messages::{MessageHeader, Procedure};
use crate::protocol::typed_param::{caps, TypedParamList};

// ── Format selection ──────────────────────────────────────────────────────────

/// Wire shape chosen for one subscription at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFormat {
    Legacy,
    Modern { callback_id: i32 },
}

impl DeliveryFormat {
    /// Wraps `event` in the message shape this subscription receives.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] when a legacy subscription is handed
    /// an event that has no legacy message.
    pub fn wrap(self, event: Event) -> Result<DeliverableEvent, CodecError> {
        match (self, event) {
            (DeliveryFormat::Legacy, Event::Domain { instance, event }) => {
                if event.class().has_legacy_form() {
                    Ok(DeliverableEvent::Legacy(LegacyDomainEvent { instance, event }))
                } else {
                    Err(CodecError::Malformed(format!(
                        "{:?} has no legacy event message",
                        event.class()
                    )))
                }
            }
            (DeliveryFormat::Legacy, Event::Network { .. }) => Err(CodecError::Malformed(
                "network events have no legacy event message".to_string(),
            )),
            (DeliveryFormat::Modern { callback_id }, Event::Domain { instance, event }) => {
                Ok(DeliverableEvent::Modern(ModernEvent::Domain(DomainEventCallback {
                    callback_id,
                    instance,
                    event,
                })))
            }
            (DeliveryFormat::Modern { callback_id }, Event::Network { network, event }) => {
                Ok(DeliverableEvent::Modern(ModernEvent::Network(NetworkEventCallback {
                    callback_id,
                    network,
                    event,
                })))
            }
        }
    }
}

/// An event ready to be serialized for one subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliverableEvent {
    Legacy(LegacyDomainEvent),
    Modern(ModernEvent),
}

impl DeliverableEvent {
    /// Procedure number the frame is sent under.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] for a legacy message built around a
    /// class that has no legacy procedure.
    pub fn procedure(&self) -> Result<Procedure, CodecError> {
        match self {
            DeliverableEvent::Legacy(m) => legacy_procedure(m.event.class()).ok_or_else(|| {
                CodecError::Malformed(format!("{:?} has no legacy event message", m.event.class()))
            }),
            DeliverableEvent::Modern(ModernEvent::Domain(_)) => Ok(Procedure::DomainEventCallback),
            DeliverableEvent::Modern(ModernEvent::Network(_)) => Ok(Procedure::NetworkEventCallback),
        }
    }

    /// Serializes the complete event frame.
    ///
    /// The payload is built in its own buffer first; if any field fails to
    /// encode the buffer is dropped and no frame is produced.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] when the event body cannot be encoded.
    pub fn to_frame(&self) -> Result<Vec<u8>, CodecError> {
        let procedure = self.procedure()?;
        let payload = match self {
            DeliverableEvent::Legacy(m) => to_bytes(m)?,
            DeliverableEvent::Modern(ModernEvent::Domain(m)) => to_bytes(m)?,
            DeliverableEvent::Modern(ModernEvent::Network(m)) => to_bytes(m)?,
        };
        encode_frame(&MessageHeader::event(procedure), &payload)
    }
}

/// Callback-id envelopes.
#[derive(Debug, Clone, PartialEq)]
pub enum ModernEvent {
    Domain(DomainEventCallback),
    Network(NetworkEventCallback),
}

/// Legacy procedure for `class`, if it has one.
pub fn legacy_procedure(class: DomainEventClass) -> Option<Procedure> {
    match class {
        DomainEventClass::Lifecycle => Some(Procedure::DomainEventLifecycle),
        DomainEventClass::Reboot => Some(Procedure::DomainEventReboot),
        DomainEventClass::RtcChange => Some(Procedure::DomainEventRtcChange),
        DomainEventClass::Watchdog => Some(Procedure::DomainEventWatchdog),
        DomainEventClass::IoError => Some(Procedure::DomainEventIoError),
        DomainEventClass::Graphics => Some(Procedure::DomainEventGraphics),
        DomainEventClass::IoErrorReason => Some(Procedure::DomainEventIoErrorReason),
        DomainEventClass::ControlError => Some(Procedure::DomainEventControlError),
        DomainEventClass::BlockJob => Some(Procedure::DomainEventBlockJob),
        DomainEventClass::DiskChange => Some(Procedure::DomainEventDiskChange),
        DomainEventClass::TrayChange => Some(Procedure::DomainEventTrayChange),
        DomainEventClass::PmWakeup => Some(Procedure::DomainEventPmWakeup),
        DomainEventClass::PmSuspend => Some(Procedure::DomainEventPmSuspend),
        DomainEventClass::BalloonChange => Some(Procedure::DomainEventBalloonChange),
        DomainEventClass::PmSuspendDisk => Some(Procedure::DomainEventPmSuspendDisk),
        DomainEventClass::DeviceRemoved => Some(Procedure::DomainEventDeviceRemoved),
        DomainEventClass::BlockJob2 | DomainEventClass::Tunable | DomainEventClass::AgentLifecycle => None,
    }
}

/// Inverse of [`legacy_procedure`].
pub fn legacy_class(procedure: Procedure) -> Option<DomainEventClass> {
    DomainEventClass::ALL
        .into_iter()
        .find(|c| legacy_procedure(*c) == Some(procedure))
}

// ── Message records ───────────────────────────────────────────────────────────

/// Legacy event: instance plus body, no callback id.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyDomainEvent {
    pub instance: InstanceRef,
    pub event: DomainEvent,
}

impl LegacyDomainEvent {
    /// Decodes a legacy payload; the class comes from the frame's procedure.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] if `procedure` is not a legacy event
    /// procedure, or any body decode error.
    pub fn decode_for(procedure: Procedure, r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let class = legacy_class(procedure).ok_or_else(|| {
            CodecError::Malformed(format!("{procedure:?} is not a legacy event procedure"))
        })?;
        let instance = InstanceRef::decode(r)?;
        let event = decode_domain_body(class, r)?;
        Ok(Self { instance, event })
    }
}

impl WireEncode for LegacyDomainEvent {
    fn encode(&self, w: &mut WireWriter) -> Result<(), CodecError> {
        self.instance.encode(w)?;
        encode_domain_body(&self.event, w)
    }
}

/// Modern domain event envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEventCallback {
    pub callback_id: i32,
    pub instance: InstanceRef,
    pub event: DomainEvent,
}

impl WireEncode for DomainEventCallback {
    fn encode(&self, w: &mut WireWriter) -> Result<(), CodecError> {
        w.put_i32(self.callback_id);
        w.put_i32(self.event.class() as i32);
        self.instance.encode(w)?;
        encode_domain_body(&self.event, w)
    }
}

impl WireDecode for DomainEventCallback {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let callback_id = r.get_i32()?;
        let raw = r.get_i32()?;
        let class = DomainEventClass::try_from(raw)
            .map_err(|_| CodecError::Malformed(format!("unknown domain event class {raw}")))?;
        let instance = InstanceRef::decode(r)?;
        let event = decode_domain_body(class, r)?;
        Ok(Self {
            callback_id,
            instance,
            event,
        })
    }
}

/// Modern network event envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkEventCallback {
    pub callback_id: i32,
    pub network: NetworkRef,
    pub event: NetworkEvent,
}

impl WireEncode for NetworkEventCallback {
    fn encode(&self, w: &mut WireWriter) -> Result<(), CodecError> {
        w.put_i32(self.callback_id);
        w.put_i32(self.event.class() as i32);
        self.network.encode(w)?;
        match &self.event {
            NetworkEvent::Lifecycle { event, detail } => {
                w.put_i32(*event);
                w.put_i32(*detail);
            }
        }
        Ok(())
    }
}

impl WireDecode for NetworkEventCallback {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let callback_id = r.get_i32()?;
        let raw = r.get_i32()?;
        let class = NetworkEventClass::try_from(raw)
            .map_err(|_| CodecError::Malformed(format!("unknown network event class {raw}")))?;
        let network = NetworkRef::decode(r)?;
        let event = match class {
            NetworkEventClass::Lifecycle => NetworkEvent::Lifecycle {
                event: r.get_i32()?,
                detail: r.get_i32()?,
            },
        };
        Ok(Self {
            callback_id,
            network,
            event,
        })
    }
}

// ── Bodies ────────────────────────────────────────────────────────────────────

fn encode_domain_body(event: &DomainEvent, w: &mut WireWriter) -> Result<(), CodecError> {
    match event {
        DomainEvent::Lifecycle { event, detail } => {
            w.put_i32(*event);
            w.put_i32(*detail);
        }
        DomainEvent::Reboot | DomainEvent::ControlError => {}
        DomainEvent::RtcChange { offset } => w.put_i64(*offset),
        DomainEvent::Watchdog { action } => w.put_i32(*action),
        DomainEvent::IoError {
            src_path,
            dev_alias,
            action,
        } => {
            w.put_string(src_path)?;
            w.put_string(dev_alias)?;
            w.put_i32(*action);
        }
        DomainEvent::Graphics {
            phase,
            local,
            remote,
            auth_scheme,
            subject,
        } => {
            w.put_i32(*phase);
            encode_address(local, w)?;
            encode_address(remote, w)?;
            w.put_string(auth_scheme)?;
            w.put_count(
                "graphics identities",
                subject.len(),
                DOMAIN_EVENT_GRAPHICS_IDENTITY_MAX,
            )?;
            for id in subject {
                w.put_string(&id.kind)?;
                w.put_string(&id.name)?;
            }
        }
        DomainEvent::IoErrorReason {
            src_path,
            dev_alias,
            action,
            reason,
        } => {
            w.put_string(src_path)?;
            w.put_string(dev_alias)?;
            w.put_i32(*action);
            w.put_string(reason)?;
        }
        DomainEvent::BlockJob {
            path,
            job_type,
            status,
        } => {
            w.put_string(path)?;
            w.put_i32(*job_type);
            w.put_i32(*status);
        }
        DomainEvent::DiskChange {
            old_src_path,
            new_src_path,
            dev_alias,
            reason,
        } => {
            w.put_opt_string(old_src_path.as_deref())?;
            w.put_opt_string(new_src_path.as_deref())?;
            w.put_string(dev_alias)?;
            w.put_i32(*reason);
        }
        DomainEvent::TrayChange { dev_alias, reason } => {
            w.put_string(dev_alias)?;
            w.put_i32(*reason);
        }
        DomainEvent::PmWakeup { reason }
        | DomainEvent::PmSuspend { reason }
        | DomainEvent::PmSuspendDisk { reason } => w.put_i32(*reason),
        DomainEvent::BalloonChange { actual } => w.put_u64(*actual),
        DomainEvent::DeviceRemoved { dev_alias } => w.put_string(dev_alias)?,
        DomainEvent::BlockJob2 {
            dst,
            job_type,
            status,
        } => {
            w.put_string(dst)?;
            w.put_i32(*job_type);
            w.put_i32(*status);
        }
        DomainEvent::Tunable { params } => {
            if params.len() > DOMAIN_EVENT_TUNABLE_MAX {
                return Err(CodecError::LimitExceeded {
                    what: "tunable parameters",
                    count: params.len(),
                    limit: DOMAIN_EVENT_TUNABLE_MAX,
                });
            }
            TypedParamList::encode(params, caps::TYPED_PARAM_STRING_OKAY)?.encode(w)?;
        }
        DomainEvent::AgentLifecycle { state, reason } => {
            w.put_i32(*state);
            w.put_i32(*reason);
        }
    }
    Ok(())
}

fn decode_domain_body(class: DomainEventClass, r: &mut WireReader<'_>) -> Result<DomainEvent, CodecError> {
    let event = match class {
        DomainEventClass::Lifecycle => DomainEvent::Lifecycle {
            event: r.get_i32()?,
            detail: r.get_i32()?,
        },
        DomainEventClass::Reboot => DomainEvent::Reboot,
        DomainEventClass::RtcChange => DomainEvent::RtcChange {
            offset: r.get_i64()?,
        },
        DomainEventClass::Watchdog => DomainEvent::Watchdog {
            action: r.get_i32()?,
        },
        DomainEventClass::IoError => DomainEvent::IoError {
            src_path: r.get_string()?,
            dev_alias: r.get_string()?,
            action: r.get_i32()?,
        },
        DomainEventClass::Graphics => {
            let phase = r.get_i32()?;
            let local = decode_address(r)?;
            let remote = decode_address(r)?;
            let auth_scheme = r.get_string()?;
            let n = r.get_count("graphics identities", DOMAIN_EVENT_GRAPHICS_IDENTITY_MAX)?;
            let mut subject = Vec::with_capacity(n);
            for _ in 0..n {
                subject.push(GraphicsIdentity {
                    kind: r.get_string()?,
                    name: r.get_string()?,
                });
            }
            DomainEvent::Graphics {
                phase,
                local,
                remote,
                auth_scheme,
                subject,
            }
        }
        DomainEventClass::IoErrorReason => DomainEvent::IoErrorReason {
            src_path: r.get_string()?,
            dev_alias: r.get_string()?,
            action: r.get_i32()?,
            reason: r.get_string()?,
        },
        DomainEventClass::ControlError => DomainEvent::ControlError,
        DomainEventClass::BlockJob => DomainEvent::BlockJob {
            path: r.get_string()?,
            job_type: r.get_i32()?,
            status: r.get_i32()?,
        },
        DomainEventClass::DiskChange => DomainEvent::DiskChange {
            old_src_path: r.get_opt_string()?,
            new_src_path: r.get_opt_string()?,
            dev_alias: r.get_string()?,
            reason: r.get_i32()?,
        },
        DomainEventClass::TrayChange => DomainEvent::TrayChange {
            dev_alias: r.get_string()?,
            reason: r.get_i32()?,
        },
        DomainEventClass::PmWakeup => DomainEvent::PmWakeup {
            reason: r.get_i32()?,
        },
        DomainEventClass::PmSuspend => DomainEvent::PmSuspend {
            reason: r.get_i32()?,
        },
        DomainEventClass::BalloonChange => DomainEvent::BalloonChange {
            actual: r.get_u64()?,
        },
        DomainEventClass::PmSuspendDisk => DomainEvent::PmSuspendDisk {
            reason: r.get_i32()?,
        },
        DomainEventClass::DeviceRemoved => DomainEvent::DeviceRemoved {
            dev_alias: r.get_string()?,
        },
        DomainEventClass::BlockJob2 => DomainEvent::BlockJob2 {
            dst: r.get_string()?,
            job_type: r.get_i32()?,
            status: r.get_i32()?,
        },
        DomainEventClass::Tunable => DomainEvent::Tunable {
            params: TypedParamList::read(r, "tunable parameters", DOMAIN_EVENT_TUNABLE_MAX)?.into_inner(),
        },
        DomainEventClass::AgentLifecycle => DomainEvent::AgentLifecycle {
            state: r.get_i32()?,
            reason: r.get_i32()?,
        },
    };
    Ok(event)
}

fn encode_address(a: &GraphicsAddress, w: &mut WireWriter) -> Result<(), CodecError> {
    w.put_i32(a.family);
    w.put_string(&a.node)?;
    w.put_string(&a.service)
}

fn decode_address(r: &mut WireReader<'_>) -> Result<GraphicsAddress, CodecError> {
    Ok(GraphicsAddress {
        family: r.get_i32()?,
        node: r.get_string()?,
        service: r.get_string()?,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::typed_param::TypedParam;
    use crate::protocol::codec::{decode_frame, from_bytes};
    use crate::protocol::messages::{MessageType, EVENT_SERIAL};
    use uuid::Uuid;

    fn web01() -> InstanceRef {
        InstanceRef::new("web01", Uuid::new_v4(), 3)
    }

    fn lifecycle() -> DomainEvent {
        DomainEvent::Lifecycle { event: 2, detail: 0 }
    }

    #[test]
    fn test_legacy_frame_uses_per_class_procedure_without_callback_id() {
        let instance = web01();
        let ev = DeliveryFormat::Legacy
            .wrap(Event::Domain {
                instance: instance.clone(),
                event: lifecycle(),
            })
            .expect("wrap");

        let frame = ev.to_frame().expect("frame");
        let (header, payload, _) = decode_frame(&frame).expect("decode frame");

        assert_eq!(header.procedure, Procedure::DomainEventLifecycle as i32);
        assert_eq!(header.msg_type, MessageType::Message);
        assert_eq!(header.serial, EVENT_SERIAL);

        let mut r = WireReader::new(payload);
        let decoded = LegacyDomainEvent::decode_for(Procedure::DomainEventLifecycle, &mut r).expect("body");
        r.finish().expect("no trailing bytes");
        assert_eq!(decoded.instance, instance);
        assert_eq!(decoded.event, lifecycle());
    }

    #[test]
    fn test_modern_frame_carries_callback_id_and_class() {
        let ev = DeliveryFormat::Modern { callback_id: 17 }
            .wrap(Event::Domain {
                instance: web01(),
                event: DomainEvent::AgentLifecycle { state: 1, reason: 2 },
            })
            .expect("wrap");

        let frame = ev.to_frame().expect("frame");
        let (header, payload, _) = decode_frame(&frame).expect("decode frame");

        assert_eq!(header.procedure, Procedure::DomainEventCallback as i32);
        let decoded: DomainEventCallback = from_bytes(payload).expect("body");
        assert_eq!(decoded.callback_id, 17);
        assert_eq!(decoded.event, DomainEvent::AgentLifecycle { state: 1, reason: 2 });
    }

    #[test]
    fn test_legacy_wrap_rejects_modern_only_class() {
        let result = DeliveryFormat::Legacy.wrap(Event::Domain {
            instance: web01(),
            event: DomainEvent::BlockJob2 {
                dst: "vda".into(),
                job_type: 1,
                status: 0,
            },
        });
        assert!(matches!(result, Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_legacy_procedure_table_covers_exactly_the_legacy_classes() {
        for class in DomainEventClass::ALL {
            assert_eq!(legacy_procedure(class).is_some(), class.has_legacy_form());
            if let Some(p) = legacy_procedure(class) {
                assert_eq!(legacy_class(p), Some(class));
            }
        }
    }

    #[test]
    fn test_graphics_with_too_many_identities_fails_to_build() {
        let addr = GraphicsAddress {
            family: 0,
            node: "127.0.0.1".into(),
            service: "5900".into(),
        };
        let subject = (0..=DOMAIN_EVENT_GRAPHICS_IDENTITY_MAX)
            .map(|i| GraphicsIdentity {
                kind: "x509dname".into(),
                name: format!("cn=user{i}"),
            })
            .collect();
        let ev = DeliveryFormat::Legacy
            .wrap(Event::Domain {
                instance: web01(),
                event: DomainEvent::Graphics {
                    phase: 0,
                    local: addr.clone(),
                    remote: addr,
                    auth_scheme: "vnc".into(),
                    subject,
                },
            })
            .expect("wrap");

        assert!(matches!(ev.to_frame(), Err(CodecError::LimitExceeded { .. })));
    }

    #[test]
    fn test_tunable_keeps_string_params() {
        let params = vec![
            TypedParam::string("cputune.vcpupin0", "0-1"),
            TypedParam::ullong("cputune.shares", 1024),
        ];
        let ev = DeliveryFormat::Modern { callback_id: 1 }
            .wrap(Event::Domain {
                instance: web01(),
                event: DomainEvent::Tunable { params: params.clone() },
            })
            .expect("wrap");

        let frame = ev.to_frame().expect("frame");
        let (_, payload, _) = decode_frame(&frame).expect("decode frame");
        let decoded: DomainEventCallback = from_bytes(payload).expect("body");

        assert_eq!(decoded.event, DomainEvent::Tunable { params });
    }

    #[test]
    fn test_network_event_uses_network_envelope() {
        let network = NetworkRef::new("default", Uuid::new_v4());
        let ev = DeliveryFormat::Modern { callback_id: 4 }
            .wrap(Event::Network {
                network: network.clone(),
                event: NetworkEvent::Lifecycle { event: 2, detail: 0 },
            })
            .expect("wrap");

        assert_eq!(ev.procedure(), Ok(Procedure::NetworkEventCallback));
        let frame = ev.to_frame().expect("frame");
        let (_, payload, _) = decode_frame(&frame).expect("decode");
        let decoded: NetworkEventCallback = from_bytes(payload).expect("body");
        assert_eq!(decoded.network, network);
        assert_eq!(decoded.callback_id, 4);
    }

    #[test]
    fn test_disk_change_optional_paths_round_trip() {
        let event = DomainEvent::DiskChange {
            old_src_path: None,
            new_src_path: Some("/var/lib/images/new.iso".into()),
            dev_alias: "ide0-1-0".into(),
            reason: 0,
        };
        let msg = DomainEventCallback {
            callback_id: 9,
            instance: web01(),
            event,
        };
        let bytes = to_bytes(&msg).expect("encode");
        assert_eq!(from_bytes::<DomainEventCallback>(&bytes).expect("decode"), msg);
    }
}
