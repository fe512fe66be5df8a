//! Control device
//!
//! Process-wide service shared by all filter devices. Filters register with
//! it for the lifetime of their device object and ask it whether a newly
//! discovered child is to be redirected. Front ends use it to list the
//! children every live filter tracks.
//!
//! The control device exists only while referenced: the first
//! [`ControlSlot::reference`] creates it, dropping the last [`ControlHandle`]
//! destroys it.

use crate::filter::{ChildDevice, ChildSummary, ReconciliationEngine, RedirectionPolicy};
use crate::pnp::DeviceObject;
use crate::policy::PolicyEngine;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};

struct FilterRegistration {
    device: DeviceObject,
    hub: DeviceObject,
    engine: Weak<ReconciliationEngine>,
}

/// Registered filter, as reported by [`ControlDevice::filters`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterInfo {
    pub device: DeviceObject,
    /// Root hub the filter is attached to
    pub hub: DeviceObject,
}

pub struct ControlDevice {
    policy: Arc<PolicyEngine>,
    filters: Mutex<Vec<FilterRegistration>>,
}

impl ControlDevice {
    fn new(policy: Arc<PolicyEngine>) -> Self {
        info!("Control device created");
        Self {
            policy,
            filters: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<FilterRegistration>> {
        self.filters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_filter(
        &self,
        device: DeviceObject,
        hub: DeviceObject,
        engine: Weak<ReconciliationEngine>,
    ) {
        let mut filters = self.lock();
        if filters.iter().any(|f| f.device == device) {
            warn!("Filter {} registered twice", device);
            return;
        }
        filters.push(FilterRegistration {
            device,
            hub,
            engine,
        });
        debug!("Registered filter {} on hub {}", device, hub);
    }

    /// Returns `false` if the filter was not registered
    pub fn unregister_filter(&self, device: DeviceObject) -> bool {
        let mut filters = self.lock();
        let before = filters.len();
        filters.retain(|f| f.device != device);
        let removed = filters.len() != before;
        if removed {
            debug!("Unregistered filter {}", device);
        }
        removed
    }

    pub fn filter_count(&self) -> usize {
        self.lock().len()
    }

    pub fn filters(&self) -> Vec<FilterInfo> {
        self.lock()
            .iter()
            .map(|f| FilterInfo {
                device: f.device,
                hub: f.hub,
            })
            .collect()
    }

    /// Children tracked by all live filters, in registration order
    pub fn enumerate_children(&self) -> Vec<ChildSummary> {
        let engines: Vec<Arc<ReconciliationEngine>> =
            self.lock().iter().filter_map(|f| f.engine.upgrade()).collect();

        engines.iter().flat_map(|engine| engine.children()).collect()
    }

    /// Policy service handed to filters
    pub fn redirection_policy(&self) -> Arc<dyn RedirectionPolicy> {
        self.policy.clone()
    }
}

impl RedirectionPolicy for ControlDevice {
    fn should_redirect(&self, child: &ChildDevice) -> bool {
        self.policy.should_redirect(child)
    }
}

impl Drop for ControlDevice {
    fn drop(&mut self) {
        info!("Control device destroyed");
    }
}

/// Counted reference to the control device
pub struct ControlHandle {
    device: Arc<ControlDevice>,
}

impl ControlHandle {
    /// Give up this reference
    pub fn release(self) {}
}

impl Deref for ControlHandle {
    type Target = ControlDevice;

    fn deref(&self) -> &ControlDevice {
        &self.device
    }
}

/// Creates the control device on demand
pub struct ControlSlot {
    policy: Arc<PolicyEngine>,
    current: Mutex<Weak<ControlDevice>>,
}

impl ControlSlot {
    pub fn new(policy: PolicyEngine) -> Self {
        Self {
            policy: Arc::new(policy),
            current: Mutex::new(Weak::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Weak<ControlDevice>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a reference, creating the control device if there is none
    pub fn reference(&self) -> ControlHandle {
        let mut current = self.lock();
        let device = match current.upgrade() {
            Some(device) => device,
            None => {
                let device = Arc::new(ControlDevice::new(self.policy.clone()));
                *current = Arc::downgrade(&device);
                device
            }
        };
        ControlHandle { device }
    }

    /// Number of live handles
    pub fn reference_count(&self) -> usize {
        self.lock().strong_count()
    }

    pub fn is_active(&self) -> bool {
        self.reference_count() > 0
    }
}
