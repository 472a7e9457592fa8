//! Migration handshake values.

use serde::{Deserialize, Serialize};

use crate::domain::typed_param::{find_string, find_ullong, TypedParam};

/// Opaque blob produced by one migration phase and consumed by the next.
///
/// The daemon forwards cookies between peers but never looks inside them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MigrationCookie(pub Vec<u8>);

impl MigrationCookie {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The phases of a version 3 migration, in the order a successful
/// migration runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationPhase {
    /// Source: describe the instance and produce the first cookie.
    Begin,
    /// Destination: reserve resources and answer with a connection URI.
    Prepare,
    /// Source: stream state to the destination.
    Perform,
    /// Destination: start or discard the incoming instance.
    Finish,
    /// Source: tear down or resume the original instance.
    Confirm,
}

/// Well-known typed parameter names understood by every migration phase.
pub mod params {
    /// URI the destination listens on for the migration stream.
    pub const URI: &str = "migrate_uri";
    /// New name for the instance on the destination host.
    pub const DEST_NAME: &str = "destination_name";
    /// Replacement configuration for the instance on the destination host.
    pub const DEST_XML: &str = "destination_xml";
    /// Bandwidth cap in MiB/s.
    pub const BANDWIDTH: &str = "bandwidth";
}

/// Extensible arguments shared by every migration phase.
///
/// Fixed-argument calls are normalised into this shape, so the management
/// API sees a single request form regardless of which wire procedure the
/// caller used.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub params: Vec<TypedParam>,
    pub flags: u64,
}

impl MigrationRequest {
    pub fn new(params: Vec<TypedParam>, flags: u64) -> Self {
        Self { params, flags }
    }

    /// Builds a request from the optional scalar arguments of the
    /// fixed-argument procedures.
    pub fn from_scalars(
        flags: u64,
        uri: Option<&str>,
        dname: Option<&str>,
        xml: Option<&str>,
        bandwidth: u64,
    ) -> Self {
        let mut list = Vec::new();
        if let Some(uri) = uri {
            list.push(TypedParam::string(params::URI, uri));
        }
        if let Some(dname) = dname {
            list.push(TypedParam::string(params::DEST_NAME, dname));
        }
        if let Some(xml) = xml {
            list.push(TypedParam::string(params::DEST_XML, xml));
        }
        if bandwidth > 0 {
            list.push(TypedParam::ullong(params::BANDWIDTH, bandwidth));
        }
        Self { params: list, flags }
    }

    pub fn uri(&self) -> Option<&str> {
        find_string(&self.params, params::URI)
    }

    pub fn dest_name(&self) -> Option<&str> {
        find_string(&self.params, params::DEST_NAME)
    }

    pub fn dest_xml(&self) -> Option<&str> {
        find_string(&self.params, params::DEST_XML)
    }

    pub fn bandwidth(&self) -> Option<u64> {
        find_ullong(&self.params, params::BANDWIDTH)
    }
}
