//! References to managed instances and virtual networks.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one managed instance (a guest "domain").
///
/// `id` is `-1` for an instance that is defined but not running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceRef {
    pub name: String,
    pub uuid: Uuid,
    pub id: i32,
}

impl InstanceRef {
    pub fn new(name: impl Into<String>, uuid: Uuid, id: i32) -> Self {
        Self {
            name: name.into(),
            uuid,
            id,
        }
    }
}

/// Identifies one virtual network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkRef {
    pub name: String,
    pub uuid: Uuid,
}

impl NetworkRef {
    pub fn new(name: impl Into<String>, uuid: Uuid) -> Self {
        Self {
            name: name.into(),
            uuid,
        }
    }
}
