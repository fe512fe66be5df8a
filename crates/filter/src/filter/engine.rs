//! Bus-relations reconciliation
//!
//! The engine owns a filter's [`ChildRegistry`] and rewrites every completed
//! bus-relations request against it:
//!
//! 1. capture the reported relations,
//! 2. prune records whose PDO disappeared,
//! 3. register PDOs seen for the first time (creating redirectors),
//! 4. export the outward-facing PDOs back into the same buffer.
//!
//! A request is parked with [`ReconciliationEngine::queue_pass`] from the
//! completion path and processed by [`ReconciliationEngine::run_pending`] on
//! the filter's work context. Only one request may be parked at a time.

use super::registry::{ChildRegistry, RedirectionPolicy};
use super::redirector::RedirectorFactory;
use super::relations::{RelationsBuilder, RelationsView};
use crate::error::ContractViolation;
use crate::pnp::{DeviceObject, DeviceRelations, DeviceStack, Irp, Status};
use common::RegText;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Processing state of the single bus-relations request slot
#[derive(Debug)]
enum PassState {
    Idle,
    AwaitingWorkItem(Irp),
    Running,
}

/// Snapshot of one tracked child, for reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSummary {
    /// Filter device tracking the child
    pub filter: DeviceObject,
    pub pdo: DeviceObject,
    pub device_id: RegText,
    pub instance_id: RegText,
    /// Redirector PDO, if the child is redirected
    pub redirector: Option<DeviceObject>,
}

pub struct ReconciliationEngine {
    device: DeviceObject,
    state: Mutex<PassState>,
    registry: Mutex<ChildRegistry>,
    stack: Arc<dyn DeviceStack>,
    policy: Arc<dyn RedirectionPolicy>,
    factory: RedirectorFactory,
}

impl ReconciliationEngine {
    /// Create the engine for the filter device `device`
    pub fn new(
        device: DeviceObject,
        stack: Arc<dyn DeviceStack>,
        policy: Arc<dyn RedirectionPolicy>,
    ) -> Self {
        let factory = RedirectorFactory::new(stack.clone(), device);
        Self {
            device,
            state: Mutex::new(PassState::Idle),
            registry: Mutex::new(ChildRegistry::new()),
            stack,
            policy,
            factory,
        }
    }

    pub fn device(&self) -> DeviceObject {
        self.device
    }

    fn lock_state(&self) -> MutexGuard<'_, PassState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_registry(&self) -> MutexGuard<'_, ChildRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park a completed bus-relations request until the work item runs
    ///
    /// Fails if a request is already parked or being processed; the request
    /// is dropped in that case.
    pub fn queue_pass(&self, irp: Irp) -> Result<(), ContractViolation> {
        let mut state = self.lock_state();
        if !matches!(*state, PassState::Idle) {
            return Err(ContractViolation::OverlappingRequest(self.device));
        }

        debug!("Queued bus relations pass on {}", self.device);
        *state = PassState::AwaitingWorkItem(irp);
        Ok(())
    }

    /// Whether a request is parked or being processed
    pub fn is_busy(&self) -> bool {
        !matches!(*self.lock_state(), PassState::Idle)
    }

    /// Process the parked request and resume its completion
    ///
    /// Returns the status the completion chain finished with.
    pub fn run_pending(&self) -> Result<Status, ContractViolation> {
        let mut irp = {
            let mut state = self.lock_state();
            match std::mem::replace(&mut *state, PassState::Running) {
                PassState::AwaitingWorkItem(irp) => irp,
                previous => {
                    *state = previous;
                    return Err(ContractViolation::NoPendingRequest(self.device));
                }
            }
        };

        irp.relations = self.reconcile(irp.relations.take());

        *self.lock_state() = PassState::Idle;
        Ok(irp.complete())
    }

    /// Run one reconciliation pass over a relations buffer
    ///
    /// An absent buffer stays absent; the registry is still pruned against
    /// it as if it were empty.
    pub fn reconcile(&self, relations: Option<DeviceRelations>) -> Option<DeviceRelations> {
        let snapshot = RelationsView::capture(relations.as_ref());
        let mut registry = self.lock_registry();

        let pruned = registry.prune_absent(&snapshot);
        let mut added = 0;
        for pdo in snapshot.iter() {
            if registry.register_if_absent(
                pdo,
                self.stack.as_ref(),
                self.policy.as_ref(),
                &self.factory,
            ) {
                added += 1;
            }
        }

        let mut relations = relations?;
        let mut builder = RelationsBuilder::over(&mut relations);
        registry.export(&mut builder);
        let written = builder.finish();

        info!(
            "Bus relations on {}: {} reported, {} pruned, {} added, {} exported",
            self.device,
            snapshot.len(),
            pruned,
            added,
            written
        );
        Some(relations)
    }

    /// Summaries of all tracked children, in registry order
    pub fn children(&self) -> Vec<ChildSummary> {
        self.lock_registry()
            .iter()
            .map(|child| ChildSummary {
                filter: self.device,
                pdo: child.pdo(),
                device_id: child.identity().device_id().clone(),
                instance_id: child.identity().instance_id().clone(),
                redirector: child.redirector().map(|handle| handle.device()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::child::ChildDevice;
    use crate::pnp::{InMemoryStack, PnpMinor, RelationType};

    fn engine_with(
        policy: impl RedirectionPolicy + 'static,
    ) -> (Arc<InMemoryStack>, DeviceObject, ReconciliationEngine) {
        let stack = Arc::new(InMemoryStack::new());
        let hub = stack.add_root_hub(RegText::single("USB\\ROOT_HUB20"));
        let engine = ReconciliationEngine::new(hub, stack.clone(), Arc::new(policy));
        (stack, hub, engine)
    }

    fn never(_: &ChildDevice) -> bool {
        false
    }

    fn bus_request(relations: Option<Vec<DeviceObject>>) -> Irp {
        let (mut irp, _rx) = Irp::new(PnpMinor::QueryDeviceRelations(RelationType::Bus));
        irp.relations = relations.map(DeviceRelations::new);
        irp.status = Status::Success;
        irp
    }

    #[test]
    fn test_overlapping_pass_rejected() {
        let (_stack, hub, engine) = engine_with(never);

        engine.queue_pass(bus_request(Some(vec![]))).unwrap();
        assert!(engine.is_busy());
        assert_eq!(
            engine.queue_pass(bus_request(Some(vec![]))),
            Err(ContractViolation::OverlappingRequest(hub))
        );

        assert_eq!(engine.run_pending(), Ok(Status::Success));
        assert!(!engine.is_busy());
    }

    #[test]
    fn test_run_without_pending_request() {
        let (_stack, hub, engine) = engine_with(never);
        assert_eq!(
            engine.run_pending(),
            Err(ContractViolation::NoPendingRequest(hub))
        );
    }

    #[test]
    fn test_absent_buffer_stays_absent_and_prunes() {
        let (stack, hub, engine) = engine_with(never);
        let a = stack.plug(hub, "USB\\VID_1234&PID_0001", "1-1").unwrap();

        let out = engine.reconcile(Some(DeviceRelations::new(vec![a])));
        assert_eq!(out.unwrap().objects(), &[a]);
        assert_eq!(engine.children().len(), 1);

        assert!(engine.reconcile(None).is_none());
        assert!(engine.children().is_empty());
    }

    #[test]
    fn test_children_summary() {
        let (stack, hub, engine) = engine_with(|_: &ChildDevice| true);
        let a = stack.plug(hub, "USB\\VID_1234&PID_0001", "1-1").unwrap();

        let out = engine.reconcile(Some(DeviceRelations::new(vec![a]))).unwrap();
        let children = engine.children();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].filter, hub);
        assert_eq!(children[0].pdo, a);
        assert_eq!(children[0].instance_id, RegText::single("1-1"));
        assert_eq!(out.objects(), &[children[0].redirector.unwrap()]);
    }
}
