//! Root hub filter device
//!
//! A [`FilterDevice`] sits on top of a USB root hub's stack. It lets every
//! request through except bus-relations queries, whose completion it
//! intercepts: the completed request is parked in the engine, the work item
//! is signalled, and completion resumes once the relations were reconciled.

use super::engine::ReconciliationEngine;
use super::work_item::{WorkItem, WorkQueue};
use crate::config::FilterSettings;
use crate::control::{ControlHandle, ControlSlot};
use crate::error::{FilterError, Result};
use crate::pnp::{
    Completion, DeviceContext, DeviceObject, DeviceProperty, DeviceStack, Irp, PnpMinor,
    RelationType, Status,
};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Whether `device` is a root hub the filter should attach to
pub fn should_attach(stack: &dyn DeviceStack, device: DeviceObject, root_hub_ids: &[String]) -> bool {
    let Some(hardware_ids) = stack.read_property(device, DeviceProperty::HardwareIds) else {
        return false;
    };
    root_hub_ids.iter().any(|id| hardware_ids.matches(id))
}

/// Pre-processing hook of the filter device object
struct FilterContext {
    device: DeviceObject,
    stack: Weak<dyn DeviceStack>,
    engine: Arc<ReconciliationEngine>,
    queue: WorkQueue,
}

impl DeviceContext for FilterContext {
    fn preprocess(&self, mut irp: Irp) -> Status {
        let Some(stack) = self.stack.upgrade() else {
            return irp.complete_with(Status::NoSuchDevice);
        };

        if irp.minor() == PnpMinor::QueryDeviceRelations(RelationType::Bus) {
            let engine = self.engine.clone();
            let queue = self.queue.clone();
            irp.set_completion_routine(move |irp| {
                post_process_bus_relations(&engine, &queue, irp);
                Completion::MoreProcessingRequired
            });
        }

        stack.dispatch_default(self.device, irp)
    }

    fn cleanup(&self) {
        debug!("Filter device {} torn down", self.device);
    }
}

fn post_process_bus_relations(engine: &ReconciliationEngine, queue: &WorkQueue, irp: Irp) {
    if let Err(violation) = engine.queue_pass(irp) {
        panic!("{}", violation);
    }

    if let Err(e) = queue.enqueue() {
        warn!(
            "Failed to signal work item of {}: {}, reconciling inline",
            engine.device(),
            e
        );
        run_pass(engine);
    }
}

fn run_pass(engine: &ReconciliationEngine) {
    match engine.run_pending() {
        Ok(status) => debug!("Bus relations on {} completed: {:?}", engine.device(), status),
        Err(violation) => error!("{}", violation),
    }
}

/// Filter attached to a USB root hub
pub struct FilterDevice {
    device: DeviceObject,
    hub: DeviceObject,
    stack: Arc<dyn DeviceStack>,
    engine: Arc<ReconciliationEngine>,
    work_item: WorkItem,
    control: Option<ControlHandle>,
}

impl FilterDevice {
    /// Attach a filter to `hub`
    ///
    /// Fails with [`FilterError::NotSupported`] if `hub` is not a root hub.
    pub fn create(
        stack: Arc<dyn DeviceStack>,
        hub: DeviceObject,
        control: &ControlSlot,
        settings: &FilterSettings,
    ) -> Result<Self> {
        if !should_attach(stack.as_ref(), hub, &settings.root_hub_ids) {
            debug!("Not attaching to {}: not a root hub", hub);
            return Err(FilterError::NotSupported(hub));
        }

        let device = stack.create_filter_device(hub)?;
        match Self::initialize(stack.clone(), device, hub, control.reference()) {
            Ok(filter) => {
                info!("Filter {} attached to root hub {}", device, hub);
                Ok(filter)
            }
            Err(e) => {
                warn!("Failed to initialize filter {}: {}", device, e);
                stack.delete_device(device);
                Err(e)
            }
        }
    }

    fn initialize(
        stack: Arc<dyn DeviceStack>,
        device: DeviceObject,
        hub: DeviceObject,
        control: ControlHandle,
    ) -> Result<Self> {
        let engine = Arc::new(ReconciliationEngine::new(
            device,
            stack.clone(),
            control.redirection_policy(),
        ));

        let worker_engine = engine.clone();
        let work_item = WorkItem::spawn(format!("qdr-{}", device), move || {
            run_pass(&worker_engine);
        })?;

        let context = Arc::new(FilterContext {
            device,
            stack: Arc::downgrade(&stack),
            engine: engine.clone(),
            queue: work_item.queue(),
        });
        stack.set_context(device, context)?;

        control.register_filter(device, hub, Arc::downgrade(&engine));

        Ok(Self {
            device,
            hub,
            stack,
            engine,
            work_item,
            control: Some(control),
        })
    }

    pub fn device(&self) -> DeviceObject {
        self.device
    }

    /// Root hub the filter is attached to
    pub fn hub(&self) -> DeviceObject {
        self.hub
    }

    pub fn engine(&self) -> &Arc<ReconciliationEngine> {
        &self.engine
    }
}

impl Drop for FilterDevice {
    fn drop(&mut self) {
        self.work_item.shutdown();
        if let Some(control) = self.control.take() {
            control.unregister_filter(self.device);
            control.release();
        }
        self.stack.delete_device(self.device);
        info!("Filter {} detached from root hub {}", self.device, self.hub);
    }
}
