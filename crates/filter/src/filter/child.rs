//! Child device records
//!
//! One record per USB device enumerated under the filtered hub, keyed by the
//! PDO the bus reported for it.

use crate::filter::redirector::RedirectorPdo;
use crate::pnp::{DeviceObject, DeviceProperty, DeviceStack};
use common::RegText;
use std::sync::Weak;
use thiserror::Error;
use tracing::info;

/// Why a device's identity could not be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("No device id read")]
    MissingDeviceId,

    #[error("No instance id read")]
    MissingInstanceId,
}

/// Device and instance identity of a child, read once at discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    device_id: RegText,
    instance_id: RegText,
}

impl IdentityRecord {
    /// Build from already-read texts; both must be present and non-empty
    pub fn new(
        device_id: Option<RegText>,
        instance_id: Option<RegText>,
    ) -> Result<Self, IdentityError> {
        let device_id = device_id
            .filter(|t| !t.is_empty())
            .ok_or(IdentityError::MissingDeviceId)?;
        let instance_id = instance_id
            .filter(|t| !t.is_empty())
            .ok_or(IdentityError::MissingInstanceId)?;

        Ok(Self {
            device_id,
            instance_id,
        })
    }

    /// Read the identity of `pdo` from the platform
    pub fn read(stack: &dyn DeviceStack, pdo: DeviceObject) -> Result<Self, IdentityError> {
        let device_id = stack.read_property(pdo, DeviceProperty::DeviceId);
        if device_id.as_ref().is_none_or(RegText::is_empty) {
            return Err(IdentityError::MissingDeviceId);
        }

        let instance_id = stack.read_property(pdo, DeviceProperty::InstanceId);
        Self::new(device_id, instance_id)
    }

    pub fn device_id(&self) -> &RegText {
        &self.device_id
    }

    pub fn instance_id(&self) -> &RegText {
        &self.instance_id
    }

    /// Case-insensitive match against either identity text
    pub fn matches(&self, value: &str) -> bool {
        self.device_id.matches(value) || self.instance_id.matches(value)
    }

    pub fn dump(&self) {
        self.device_id.dump("Device ID");
        self.instance_id.dump("Instance ID");
    }
}

/// Back-reference to a redirector node
///
/// The platform owns the node (as its device context) and destroys it from
/// its teardown callback; a record only ever holds this weak handle.
#[derive(Debug, Clone)]
pub struct RedirectorHandle {
    device: DeviceObject,
    node: Weak<RedirectorPdo>,
}

impl RedirectorHandle {
    pub(crate) fn new(device: DeviceObject, node: Weak<RedirectorPdo>) -> Self {
        Self { device, node }
    }

    /// Device object of the redirector PDO
    pub fn device(&self) -> DeviceObject {
        self.device
    }

    /// Whether the platform still holds the node
    pub fn is_alive(&self) -> bool {
        self.node.strong_count() > 0
    }
}

/// Redirection state of a child
#[derive(Debug, Clone)]
pub enum RedirectionState {
    Undecided,
    Redirected(RedirectorHandle),
    NonRedirected,
}

/// A tracked child device
#[derive(Debug)]
pub struct ChildDevice {
    identity: IdentityRecord,
    pdo: DeviceObject,
    state: RedirectionState,
}

impl ChildDevice {
    pub fn new(identity: IdentityRecord, pdo: DeviceObject) -> Self {
        Self {
            identity,
            pdo,
            state: RedirectionState::Undecided,
        }
    }

    pub fn identity(&self) -> &IdentityRecord {
        &self.identity
    }

    /// PDO the bus reported for this device
    pub fn pdo(&self) -> DeviceObject {
        self.pdo
    }

    pub fn state(&self) -> &RedirectionState {
        &self.state
    }

    /// Identity comparison against a reported PDO
    pub fn matches(&self, pdo: DeviceObject) -> bool {
        self.pdo == pdo
    }

    pub fn is_redirected(&self) -> bool {
        matches!(self.state, RedirectionState::Redirected(_))
    }

    pub fn redirector(&self) -> Option<&RedirectorHandle> {
        match &self.state {
            RedirectionState::Redirected(handle) => Some(handle),
            _ => None,
        }
    }

    /// Handle reported upwards: the redirector PDO if redirected, else the
    /// original PDO
    pub fn outward_pdo(&self) -> DeviceObject {
        self.redirector().map_or(self.pdo, RedirectorHandle::device)
    }

    /// Record a redirected decision; decisions are made once
    pub fn make_redirected(&mut self, handle: RedirectorHandle) {
        debug_assert!(matches!(self.state, RedirectionState::Undecided));
        self.state = RedirectionState::Redirected(handle);
    }

    /// Record a native decision; decisions are made once
    pub fn make_non_redirected(&mut self) {
        debug_assert!(matches!(self.state, RedirectionState::Undecided));
        self.state = RedirectionState::NonRedirected;
    }

    pub fn dump(&self) {
        info!(
            "Child device {} (redirector PDO {:?}):",
            self.pdo,
            self.redirector().map(RedirectorHandle::device)
        );
        self.identity.dump();
    }
}
