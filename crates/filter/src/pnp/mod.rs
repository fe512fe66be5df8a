//! Plug-and-play platform layer
//!
//! Types and traits describing the platform the filter plugs into: opaque
//! device handles, the relations buffers the bus driver reports, PnP requests
//! travelling down device stacks, and the primitives used to build and wire
//! device objects.
//!
//! The filter only talks to the platform through [`DeviceStack`] and exposes
//! itself through [`DeviceContext`]. [`InMemoryStack`] is an in-process
//! implementation of that contract used by the CLI host mirror and the tests.

pub mod irp;
pub mod memory;
pub mod stack;

use std::fmt;

pub use irp::{Completion, Irp, IrpOutcome};
pub use memory::{FailurePoint, InMemoryStack};
pub use stack::{DeviceContext, DeviceStack, PdoInit, PlatformError};

/// Opaque platform device handle
///
/// Compared by identity only. Two handles are the same device exactly when
/// they are equal; nothing about the device's descriptors takes part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceObject(pub u64);

impl fmt::Display for DeviceObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Device-relations buffer as allocated by the platform
///
/// `len()` is the buffer's declared count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRelations {
    objects: Vec<DeviceObject>,
}

impl DeviceRelations {
    pub fn new(objects: Vec<DeviceObject>) -> Self {
        Self { objects }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn objects(&self) -> &[DeviceObject] {
        &self.objects
    }

    pub fn contains(&self, device: DeviceObject) -> bool {
        self.objects.contains(&device)
    }

    pub(crate) fn objects_mut(&mut self) -> &mut Vec<DeviceObject> {
        &mut self.objects
    }
}

impl From<Vec<DeviceObject>> for DeviceRelations {
    fn from(objects: Vec<DeviceObject>) -> Self {
        Self::new(objects)
    }
}

/// Kind of relations requested by a query-device-relations request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationType {
    /// Children enumerated by the bus
    Bus,
    Ejection,
    Removal,
    TargetDevice,
    Power,
}

/// Identity strings a query-id request can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusQueryId {
    DeviceId,
    HardwareIds,
    CompatibleIds,
    InstanceId,
}

/// Device properties readable through [`DeviceStack::read_property`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceProperty {
    DeviceId,
    InstanceId,
    HardwareIds,
    CompatibleIds,
}

impl From<BusQueryId> for DeviceProperty {
    fn from(id: BusQueryId) -> Self {
        match id {
            BusQueryId::DeviceId => Self::DeviceId,
            BusQueryId::HardwareIds => Self::HardwareIds,
            BusQueryId::CompatibleIds => Self::CompatibleIds,
            BusQueryId::InstanceId => Self::InstanceId,
        }
    }
}

/// PnP request subtype
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PnpMinor {
    StartDevice,
    QueryDeviceRelations(RelationType),
    QueryId(BusQueryId),
    QueryCapabilities,
    DeviceEnumerated,
    QueryRemoveDevice,
    RemoveDevice,
    SurpriseRemoval,
    Other(u8),
}

/// Capabilities reported in response to a query-capabilities request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Device may be started without a function driver
    pub raw_device_ok: bool,
    pub removable: bool,
    pub unique_id: bool,
    pub surprise_removal_ok: bool,
}

/// Completion status of a PnP request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    /// Request will be completed later, off the caller's stack
    Pending,
    NotSupported,
    InsufficientResources,
    NoSuchDevice,
    Unsuccessful,
}

impl Status {
    pub fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }
}
