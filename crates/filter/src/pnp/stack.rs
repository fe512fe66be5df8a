//! Platform device-stack contract

use super::{DeviceObject, DeviceProperty, Irp, Status};
use common::RegText;
use std::sync::Arc;
use thiserror::Error;

/// Failures reported by platform primitives
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("Insufficient resources")]
    InsufficientResources,

    #[error("No such device {0}")]
    NoSuchDevice(DeviceObject),

    #[error("Failed to assign {0}")]
    IdentityAssignment(&'static str),

    #[error("Failed to attach {device} to the stack of {target}")]
    AttachFailed {
        device: DeviceObject,
        target: DeviceObject,
    },

    #[error("Device {0} already has a context")]
    ContextInUse(DeviceObject),

    #[error("Request was dropped before completion")]
    RequestDropped,
}

/// Driver-side hooks the platform invokes for a device object
pub trait DeviceContext: Send + Sync {
    /// Pre-process a PnP request addressed to this device
    ///
    /// The context owns the request from here on: it must complete it, hand
    /// it to [`DeviceStack::dispatch_default`], or forward it with
    /// [`DeviceStack::call_driver`].
    fn preprocess(&self, irp: Irp) -> Status;

    /// Teardown callback, run by the platform right before it drops the
    /// context when the device object is deleted
    fn cleanup(&self) {}
}

/// Creation parameters for a synthetic physical device object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdoInit {
    pub device_id: String,
    pub hardware_ids: RegText,
    pub compatible_ids: RegText,
    pub instance_id: String,
    /// Device class GUID for raw-mode operation, if any
    pub raw_class_guid: Option<String>,
    pub exclusive: bool,
    pub direct_io: bool,
}

/// Platform primitives used by the filter
///
/// Everything here is a black box that either succeeds or fails.
pub trait DeviceStack: Send + Sync {
    /// Read an identity property of a device
    fn read_property(&self, device: DeviceObject, property: DeviceProperty) -> Option<RegText>;

    /// Create a filter device object on top of `target`'s stack
    fn create_filter_device(&self, target: DeviceObject) -> Result<DeviceObject, PlatformError>;

    /// Allocate a child PDO under `parent` with the given identity
    fn create_pdo(&self, parent: DeviceObject, init: &PdoInit) -> Result<DeviceObject, PlatformError>;

    /// Install the pre-processing hook and teardown callback for a device
    fn set_context(
        &self,
        device: DeviceObject,
        context: Arc<dyn DeviceContext>,
    ) -> Result<(), PlatformError>;

    /// Attach `device` on top of `target`'s stack
    ///
    /// Returns the device object `device` landed on, which becomes its
    /// request target.
    fn attach_to_stack(
        &self,
        device: DeviceObject,
        target: DeviceObject,
    ) -> Result<DeviceObject, PlatformError>;

    /// Delete a device object, running its context's teardown callback
    fn delete_device(&self, device: DeviceObject);

    /// Send a request to a specific device object
    fn call_driver(&self, target: DeviceObject, irp: Irp) -> Status;

    /// Platform default handling of a request for `device`
    fn dispatch_default(&self, device: DeviceObject, irp: Irp) -> Status;
}
