//! Argument and result records of the remote program.
//!
//! Each record is a plain struct whose fields are written in declaration
//! order. Variable-length fields use newtypes that carry their compiled-in
//! ceiling, so the limit is enforced by the decoder itself and never left to
//! the handler.

use crate::domain::instance::{InstanceRef, NetworkRef};
use crate::domain::migration::MigrationCookie;
use crate::domain::typed_param::TypedParam;
use crate::protocol::codec::{CodecError, WireDecode, WireEncode, WireReader, WireWriter};
use crate::protocol::limits::{
    AUTH_SASL_DATA_MAX, AUTH_TYPE_LIST_MAX, DOMAIN_BLOCK_PEEK_BUFFER_MAX, DOMAIN_GET_CPU_STATS_MAX,
    DOMAIN_LIST_MAX, MIGRATE_COOKIE_MAX, MIGRATE_PARAM_LIST_MAX, SCHEDULER_PARAMETERS_MAX,
};
use crate::protocol::typed_param::{write_param, TypedParamList};

// ── Scalar and object impls ───────────────────────────────────────────────────

macro_rules! scalar_wire {
    ($ty:ty, $put:ident, $get:ident) => {
        impl WireEncode for $ty {
            fn encode(&self, w: &mut WireWriter) -> Result<(), CodecError> {
                w.$put(*self);
                Ok(())
            }
        }

        impl WireDecode for $ty {
            fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
                r.$get()
            }
        }
    };
}

scalar_wire!(i32, put_i32, get_i32);
scalar_wire!(u32, put_u32, get_u32);
scalar_wire!(i64, put_i64, get_i64);
scalar_wire!(u64, put_u64, get_u64);
scalar_wire!(bool, put_bool, get_bool);

impl WireEncode for String {
    fn encode(&self, w: &mut WireWriter) -> Result<(), CodecError> {
        w.put_string(self)
    }
}

impl WireDecode for String {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        r.get_string()
    }
}

impl<T: WireEncode> WireEncode for Option<T> {
    fn encode(&self, w: &mut WireWriter) -> Result<(), CodecError> {
        w.put_opt(self.as_ref())
    }
}

impl<T: WireDecode> WireDecode for Option<T> {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        r.get_opt()
    }
}

impl WireEncode for InstanceRef {
    fn encode(&self, w: &mut WireWriter) -> Result<(), CodecError> {
        w.put_string(&self.name)?;
        w.put_fixed_opaque(self.uuid.as_bytes());
        w.put_i32(self.id);
        Ok(())
    }
}

impl WireDecode for InstanceRef {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let name = r.get_string()?;
        let uuid = read_uuid(r)?;
        let id = r.get_i32()?;
        Ok(Self { name, uuid, id })
    }
}

impl WireEncode for NetworkRef {
    fn encode(&self, w: &mut WireWriter) -> Result<(), CodecError> {
        w.put_string(&self.name)?;
        w.put_fixed_opaque(self.uuid.as_bytes());
        Ok(())
    }
}

impl WireDecode for NetworkRef {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let name = r.get_string()?;
        let uuid = read_uuid(r)?;
        Ok(Self { name, uuid })
    }
}

fn read_uuid(r: &mut WireReader<'_>) -> Result<uuid::Uuid, CodecError> {
    let bytes = r.get_fixed_opaque(16)?;
    uuid::Uuid::from_slice(&bytes).map_err(|e| CodecError::Malformed(format!("invalid UUID: {e}")))
}

impl WireEncode for MigrationCookie {
    fn encode(&self, w: &mut WireWriter) -> Result<(), CodecError> {
        w.put_opaque("migration cookie bytes", &self.0, MIGRATE_COOKIE_MAX)
    }
}

impl WireDecode for MigrationCookie {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        Ok(Self(r.get_opaque("migration cookie bytes", MIGRATE_COOKIE_MAX)?))
    }
}

// ── Bounded newtypes ──────────────────────────────────────────────────────────

macro_rules! bounded_params {
    ($(#[$meta:meta])* $name:ident, $what:literal, $limit:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Default)]
        pub struct $name(pub Vec<TypedParam>);

        impl WireEncode for $name {
            fn encode(&self, w: &mut WireWriter) -> Result<(), CodecError> {
                w.put_count($what, self.0.len(), $limit)?;
                for p in &self.0 {
                    write_param(w, p)?;
                }
                Ok(())
            }
        }

        impl WireDecode for $name {
            fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
                Ok(Self(TypedParamList::read(r, $what, $limit)?.into_inner()))
            }
        }

        impl From<TypedParamList> for $name {
            fn from(list: TypedParamList) -> Self {
                Self(list.into_inner())
            }
        }
    };
}

bounded_params!(
    /// Scheduler tunables, at most [`SCHEDULER_PARAMETERS_MAX`].
    SchedulerParams,
    "scheduler parameters",
    SCHEDULER_PARAMETERS_MAX
);

bounded_params!(
    /// Extensible migration arguments, at most [`MIGRATE_PARAM_LIST_MAX`].
    MigrationParams,
    "migration parameters",
    MIGRATE_PARAM_LIST_MAX
);

bounded_params!(
    /// Flattened per-CPU statistics, at most [`DOMAIN_GET_CPU_STATS_MAX`].
    CpuStatsParams,
    "cpu stats parameters",
    DOMAIN_GET_CPU_STATS_MAX
);

macro_rules! bounded_bytes {
    ($(#[$meta:meta])* $name:ident, $what:literal, $limit:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Default)]
        pub struct $name(pub Vec<u8>);

        impl WireEncode for $name {
            fn encode(&self, w: &mut WireWriter) -> Result<(), CodecError> {
                w.put_opaque($what, &self.0, $limit)
            }
        }

        impl WireDecode for $name {
            fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
                Ok(Self(r.get_opaque($what, $limit)?))
            }
        }
    };
}

bounded_bytes!(
    /// Bytes returned by block or memory peek.
    PeekBuffer,
    "peek buffer bytes",
    DOMAIN_BLOCK_PEEK_BUFFER_MAX
);

macro_rules! bounded_ints {
    ($(#[$meta:meta])* $name:ident, $what:literal, $limit:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Default)]
        pub struct $name(pub Vec<i32>);

        impl WireEncode for $name {
            fn encode(&self, w: &mut WireWriter) -> Result<(), CodecError> {
                w.put_count($what, self.0.len(), $limit)?;
                for v in &self.0 {
                    w.put_i32(*v);
                }
                Ok(())
            }
        }

        impl WireDecode for $name {
            fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
                let n = r.get_count($what, $limit)?;
                let mut out = Vec::with_capacity(r.capacity_hint(n, 4));
                for _ in 0..n {
                    out.push(r.get_i32()?);
                }
                Ok(Self(out))
            }
        }
    };
}

bounded_ints!(
    /// Ids of running instances.
    DomainIds,
    "domain ids",
    DOMAIN_LIST_MAX
);

bounded_ints!(
    /// Auth types advertised by a listener.
    AuthTypes,
    "auth types",
    AUTH_TYPE_LIST_MAX
);

/// SASL payload that keeps "absent" and "empty" apart.
///
/// Encoded as a `nil` flag followed by the bytes; `nil = 1` means absent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SaslData(pub Option<Vec<u8>>);

impl SaslData {
    pub fn absent() -> Self {
        Self(None)
    }

    pub fn present(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Some(bytes.into()))
    }

    pub fn as_deref(&self) -> Option<&[u8]> {
        self.0.as_deref()
    }
}

impl WireEncode for SaslData {
    fn encode(&self, w: &mut WireWriter) -> Result<(), CodecError> {
        w.put_bool(self.0.is_none());
        w.put_opaque("sasl data bytes", self.0.as_deref().unwrap_or_default(), AUTH_SASL_DATA_MAX)
    }
}

impl WireDecode for SaslData {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let nil = r.get_bool()?;
        let data = r.get_opaque("sasl data bytes", AUTH_SASL_DATA_MAX)?;
        Ok(if nil { Self(None) } else { Self(Some(data)) })
    }
}

// ── Records ───────────────────────────────────────────────────────────────────

macro_rules! wire_record {
    ($(#[$meta:meta])* pub struct $name:ident { $($(#[$fmeta:meta])* pub $field:ident : $ty:ty,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Default)]
        pub struct $name {
            $($(#[$fmeta])* pub $field: $ty,)*
        }

        impl WireEncode for $name {
            #[allow(unused_variables)]
            fn encode(&self, w: &mut WireWriter) -> Result<(), CodecError> {
                $(WireEncode::encode(&self.$field, w)?;)*
                Ok(())
            }
        }

        impl WireDecode for $name {
            #[allow(unused_variables)]
            fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
                Ok(Self {
                    $($field: <$ty as WireDecode>::decode(r)?,)*
                })
            }
        }
    };
}

/// Flag on [`ConnectOpenArgs::flags`] requesting a read-only connection.
pub const CONNECT_RO: u32 = 1;

/// Feature numbers understood by `ConnectSupportsFeature`.
pub mod features {
    /// The peer speaks the keep-alive program.
    pub const PROGRAM_KEEPALIVE: i32 = 12;
    /// The peer understands string-valued typed parameters.
    pub const TYPED_PARAM_STRING: i32 = 13;
    /// Migration v3 with extensible parameters.
    pub const MIGRATION_PARAMS: i32 = 14;
}

wire_record! {
    pub struct ConnectOpenArgs {
        pub name: Option<String>,
        pub flags: u32,
    }
}

wire_record! {
    pub struct ConnectGetVersionRet {
        pub hv_ver: u64,
    }
}

wire_record! {
    pub struct ConnectSupportsFeatureArgs {
        pub feature: i32,
    }
}

wire_record! {
    pub struct ConnectSupportsFeatureRet {
        pub supported: i32,
    }
}

wire_record! {
    pub struct ConnectListDomainsArgs {
        pub maxids: i32,
    }
}

wire_record! {
    pub struct ConnectListDomainsRet {
        pub ids: DomainIds,
    }
}

wire_record! {
    pub struct DomainLookupByNameArgs {
        pub name: String,
    }
}

wire_record! {
    pub struct DomainLookupByNameRet {
        pub dom: InstanceRef,
    }
}

// Authentication.

wire_record! {
    pub struct AuthListRet {
        pub types: AuthTypes,
    }
}

wire_record! {
    pub struct AuthSaslInitRet {
        /// Comma-separated mechanism names.
        pub mechlist: String,
    }
}

wire_record! {
    pub struct AuthSaslStartArgs {
        pub mech: String,
        pub data: SaslData,
    }
}

wire_record! {
    pub struct AuthSaslStepArgs {
        pub data: SaslData,
    }
}

wire_record! {
    /// Reply to a SASL start or step.
    pub struct AuthSaslReply {
        pub complete: bool,
        pub data: SaslData,
    }
}

wire_record! {
    pub struct AuthPolkitRet {
        pub complete: bool,
    }
}

// Scheduler, statistics and peek.

wire_record! {
    pub struct DomainGetSchedulerParametersArgs {
        pub dom: InstanceRef,
        pub nparams: i32,
    }
}

wire_record! {
    pub struct DomainGetSchedulerParametersRet {
        pub params: SchedulerParams,
    }
}

wire_record! {
    pub struct DomainSetSchedulerParametersArgs {
        pub dom: InstanceRef,
        pub params: SchedulerParams,
    }
}

wire_record! {
    pub struct DomainGetCpuStatsArgs {
        pub dom: InstanceRef,
        /// Parameters per CPU the caller can accept; 0 asks for the count.
        pub nparams: u32,
        pub start_cpu: i32,
        pub ncpus: u32,
        pub flags: u32,
    }
}

wire_record! {
    pub struct DomainGetCpuStatsRet {
        pub params: CpuStatsParams,
        /// Parameters per CPU reported by the management API.
        pub nparams: i32,
    }
}

wire_record! {
    pub struct DomainBlockPeekArgs {
        pub dom: InstanceRef,
        pub path: String,
        pub offset: u64,
        pub size: u32,
        pub flags: u32,
    }
}

wire_record! {
    pub struct DomainMemoryPeekArgs {
        pub dom: InstanceRef,
        pub offset: u64,
        pub size: u32,
        pub flags: u32,
    }
}

wire_record! {
    pub struct DomainPeekRet {
        pub buffer: PeekBuffer,
    }
}

// Events.

wire_record! {
    /// Legacy register/deregister: the class doubles as the subscription id.
    pub struct DomainEventRegisterAnyArgs {
        pub event_id: i32,
    }
}

wire_record! {
    /// Reply to the lifecycle-only register/deregister pair: 1 after
    /// registering, 0 after deregistering.
    pub struct ConnectDomainEventRegisterRet {
        pub cb_registered: i32,
    }
}

wire_record! {
    pub struct ConnectDomainEventCallbackRegisterAnyArgs {
        pub event_id: i32,
        pub dom: Option<InstanceRef>,
    }
}

wire_record! {
    pub struct ConnectNetworkEventRegisterAnyArgs {
        pub event_id: i32,
        pub net: Option<NetworkRef>,
    }
}

wire_record! {
    pub struct CallbackIdRet {
        pub callback_id: i32,
    }
}

wire_record! {
    pub struct CallbackIdArgs {
        pub callback_id: i32,
    }
}

// Migration, fixed-argument form.

wire_record! {
    pub struct MigrateBegin3Args {
        pub dom: InstanceRef,
        pub xmlin: Option<String>,
        pub flags: u64,
        pub dname: Option<String>,
        pub bandwidth: u64,
    }
}

wire_record! {
    pub struct MigrateBegin3Ret {
        pub cookie_out: MigrationCookie,
        pub xml: String,
    }
}

wire_record! {
    pub struct MigratePrepare3Args {
        pub cookie_in: MigrationCookie,
        pub uri_in: Option<String>,
        pub flags: u64,
        pub dname: Option<String>,
        pub bandwidth: u64,
        pub dom_xml: String,
    }
}

wire_record! {
    pub struct MigratePrepare3Ret {
        pub cookie_out: MigrationCookie,
        pub uri_out: Option<String>,
    }
}

wire_record! {
    pub struct MigratePerform3Args {
        pub dom: InstanceRef,
        pub xmlin: Option<String>,
        pub cookie_in: MigrationCookie,
        pub dconnuri: Option<String>,
        pub uri: Option<String>,
        pub flags: u64,
        pub dname: Option<String>,
        pub bandwidth: u64,
    }
}

wire_record! {
    pub struct MigratePerform3Ret {
        pub cookie_out: MigrationCookie,
    }
}

wire_record! {
    pub struct MigrateFinish3Args {
        pub dname: String,
        pub cookie_in: MigrationCookie,
        pub dconnuri: Option<String>,
        pub uri: Option<String>,
        pub flags: u64,
        pub cancelled: i32,
    }
}

wire_record! {
    pub struct MigrateFinish3Ret {
        pub dom: InstanceRef,
        pub cookie_out: MigrationCookie,
    }
}

wire_record! {
    pub struct MigrateConfirm3Args {
        pub dom: InstanceRef,
        pub cookie_in: MigrationCookie,
        pub flags: u64,
        pub cancelled: i32,
    }
}

// Migration, typed-parameter form.

wire_record! {
    pub struct MigrateBegin3ParamsArgs {
        pub dom: InstanceRef,
        pub params: MigrationParams,
        pub flags: u32,
    }
}

wire_record! {
    pub struct MigratePrepare3ParamsArgs {
        pub params: MigrationParams,
        pub cookie_in: MigrationCookie,
        pub flags: u32,
    }
}

wire_record! {
    pub struct MigratePerform3ParamsArgs {
        pub dom: InstanceRef,
        pub dconnuri: Option<String>,
        pub params: MigrationParams,
        pub cookie_in: MigrationCookie,
        pub flags: u32,
    }
}

wire_record! {
    pub struct MigrateFinish3ParamsArgs {
        pub params: MigrationParams,
        pub cookie_in: MigrationCookie,
        pub flags: u32,
        pub cancelled: i32,
    }
}

wire_record! {
    pub struct MigrateConfirm3ParamsArgs {
        pub dom: InstanceRef,
        pub params: MigrationParams,
        pub cookie_in: MigrationCookie,
        pub flags: u32,
        pub cancelled: i32,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::{from_bytes, to_bytes};
    use uuid::Uuid;

    #[test]
    fn test_sasl_data_keeps_absent_and_empty_apart() {
        let absent = to_bytes(&SaslData::absent()).expect("absent");
        let empty = to_bytes(&SaslData::present(Vec::new())).expect("empty");

        assert_ne!(absent, empty);
        assert_eq!(from_bytes::<SaslData>(&absent).expect("decode"), SaslData::absent());
        assert_eq!(
            from_bytes::<SaslData>(&empty).expect("decode"),
            SaslData::present(Vec::new())
        );
    }

    #[test]
    fn test_sasl_data_over_ceiling_is_rejected() {
        let big = SaslData::present(vec![0u8; AUTH_SASL_DATA_MAX + 1]);
        assert!(matches!(to_bytes(&big), Err(CodecError::LimitExceeded { .. })));
    }

    #[test]
    fn test_migration_params_over_ceiling_rejected_on_decode() {
        let mut w = WireWriter::new();
        InstanceRef::new("vm", Uuid::nil(), 1).encode(&mut w).expect("dom");
        w.put_u32((MIGRATE_PARAM_LIST_MAX + 1) as u32);
        let bytes = w.into_bytes();

        let err = from_bytes::<MigrateBegin3ParamsArgs>(&bytes).unwrap_err();

        assert_eq!(
            err,
            CodecError::LimitExceeded {
                what: "migration parameters",
                count: MIGRATE_PARAM_LIST_MAX + 1,
                limit: MIGRATE_PARAM_LIST_MAX
            }
        );
    }

    #[test]
    fn test_perform3_args_round_trip() {
        let args = MigratePerform3Args {
            dom: InstanceRef::new("db01", Uuid::new_v4(), 7),
            xmlin: None,
            cookie_in: MigrationCookie::new(b"cookie-from-prepare".to_vec()),
            dconnuri: Some("virtd+tcp://dst/system".into()),
            uri: Some("tcp://dst:49152".into()),
            flags: 1,
            dname: None,
            bandwidth: 0,
        };
        let bytes = to_bytes(&args).expect("encode");
        assert_eq!(from_bytes::<MigratePerform3Args>(&bytes).expect("decode"), args);
    }

    #[test]
    fn test_domain_ids_over_ceiling_rejected() {
        let mut w = WireWriter::new();
        w.put_u32((DOMAIN_LIST_MAX + 1) as u32);
        let bytes = w.into_bytes();
        assert!(matches!(
            from_bytes::<DomainIds>(&bytes),
            Err(CodecError::LimitExceeded { .. })
        ));
    }

    #[test]
    fn test_optional_instance_round_trip() {
        let args = ConnectDomainEventCallbackRegisterAnyArgs {
            event_id: 0,
            dom: Some(InstanceRef::new("web01", Uuid::new_v4(), 2)),
        };
        let bytes = to_bytes(&args).expect("encode");
        assert_eq!(
            from_bytes::<ConnectDomainEventCallbackRegisterAnyArgs>(&bytes).expect("decode"),
            args
        );
    }
}
