//! Redirector nodes
//!
//! A redirector is a synthetic raw PDO stacked directly above an original
//! USB device. It carries a fixed vendor-specific identity so that no
//! function driver binds to it and a capture client can open it exclusively.
//! Identity and capability queries are answered locally; everything else is
//! forwarded to the original device.

use super::child::RedirectorHandle;
use crate::pnp::{Completion, DeviceContext, DeviceObject, DeviceStack, Irp, PdoInit, PnpMinor, Status};
use common::RegText;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};

/// Device id of every redirector PDO
pub const REDIRECTOR_DEVICE_ID: &str = "USB\\Vid_FEED&Pid_CAFE&Rev_0001";

pub const REDIRECTOR_HARDWARE_IDS: [&str; 2] =
    ["USB\\Vid_FEED&Pid_CAFE&Rev_0001", "USB\\Vid_FEED&Pid_CAFE"];

pub const REDIRECTOR_COMPATIBLE_IDS: [&str; 3] = [
    "USB\\Class_FF&SubClass_FF&Prot_FF",
    "USB\\Class_FF&SubClass_FF",
    "USB\\Class_FF",
];

pub const REDIRECTOR_INSTANCE_ID: &str = "111222333";

/// Device class of raw redirector PDOs
pub const REDIRECTOR_RAW_CLASS_GUID: &str = "52af46d0-ab11-4a38-96a5-bc0ac6abd2af";

/// Creation parameters shared by all redirector PDOs
pub fn redirector_pdo_init() -> PdoInit {
    // Compatible ids double as hardware ids
    let hardware_ids = RegText::new(
        REDIRECTOR_HARDWARE_IDS
            .iter()
            .chain(REDIRECTOR_COMPATIBLE_IDS.iter())
            .copied(),
    );

    PdoInit {
        device_id: REDIRECTOR_DEVICE_ID.to_string(),
        hardware_ids,
        compatible_ids: RegText::new(REDIRECTOR_COMPATIBLE_IDS),
        instance_id: REDIRECTOR_INSTANCE_ID.to_string(),
        raw_class_guid: Some(REDIRECTOR_RAW_CLASS_GUID.to_string()),
        exclusive: true,
        direct_io: true,
    }
}

/// Creates redirector nodes under a filter's device object
pub struct RedirectorFactory {
    stack: Arc<dyn DeviceStack>,
    parent: DeviceObject,
}

impl RedirectorFactory {
    pub fn new(stack: Arc<dyn DeviceStack>, parent: DeviceObject) -> Self {
        Self { stack, parent }
    }

    /// Build a redirector above `original`
    ///
    /// Returns `None` if any step fails. A device created by a failed
    /// attempt is deleted again before returning.
    pub fn create(&self, original: DeviceObject) -> Option<RedirectorHandle> {
        let device = match self.stack.create_pdo(self.parent, &redirector_pdo_init()) {
            Ok(device) => device,
            Err(e) => {
                warn!("Failed to create redirector PDO for {}: {}", original, e);
                return None;
            }
        };

        let node = Arc::new(RedirectorPdo::new(device, Arc::downgrade(&self.stack)));
        let handle = RedirectorHandle::new(device, Arc::downgrade(&node));

        if let Err(e) = self.stack.set_context(device, node.clone()) {
            warn!("Failed to install redirector context on {}: {}", device, e);
            self.stack.delete_device(device);
            return None;
        }

        match self.stack.attach_to_stack(device, original) {
            Ok(target) => node.set_target(target),
            Err(e) => {
                warn!("Failed to attach redirector {} to {}: {}", device, original, e);
                self.stack.delete_device(device);
                return None;
            }
        }

        info!("Created redirector {} for {}", device, original);
        Some(handle)
    }
}

/// Pre-processing hook of a redirector PDO
///
/// Owned by the platform as the device's context.
pub struct RedirectorPdo {
    device: DeviceObject,
    stack: Weak<dyn DeviceStack>,
    /// Device the PDO is attached on top of; cleared on teardown
    target: Mutex<Option<DeviceObject>>,
}

impl RedirectorPdo {
    fn new(device: DeviceObject, stack: Weak<dyn DeviceStack>) -> Self {
        Self {
            device,
            stack,
            target: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<DeviceObject>> {
        self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_target(&self, target: DeviceObject) {
        *self.lock() = Some(target);
    }

    pub fn device(&self) -> DeviceObject {
        self.device
    }

    pub fn target(&self) -> Option<DeviceObject> {
        *self.lock()
    }

    fn forward(&self, stack: &dyn DeviceStack, irp: Irp) -> Status {
        match self.target() {
            Some(target) => stack.call_driver(target, irp),
            None => {
                debug!("Redirector {} has no target for {:?}", self.device, irp.minor());
                irp.complete_with(Status::NoSuchDevice)
            }
        }
    }
}

impl DeviceContext for RedirectorPdo {
    fn preprocess(&self, mut irp: Irp) -> Status {
        let Some(stack) = self.stack.upgrade() else {
            return irp.complete_with(Status::NoSuchDevice);
        };

        match irp.minor() {
            PnpMinor::QueryId(_) | PnpMinor::DeviceEnumerated | PnpMinor::StartDevice => {
                stack.dispatch_default(self.device, irp)
            }
            PnpMinor::QueryCapabilities => {
                irp.set_completion_routine(|mut irp| {
                    if let Some(caps) = irp.capabilities.as_mut() {
                        caps.raw_device_ok = true;
                    }
                    Completion::Continue(irp)
                });
                self.forward(stack.as_ref(), irp)
            }
            _ => self.forward(stack.as_ref(), irp),
        }
    }

    fn cleanup(&self) {
        debug!("Redirector {} torn down", self.device);
        self.lock().take();
    }
}
