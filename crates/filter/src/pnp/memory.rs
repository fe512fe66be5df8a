//! In-memory device tree
//!
//! [`InMemoryStack`] implements [`DeviceStack`] over a process-local table of
//! device objects. It plays the roles of both the USB bus driver and the PnP
//! manager: root hubs report their plugged children for bus-relations
//! queries, and synthetic devices that drop out of a hub's reported relations
//! are deleted (running their teardown callback) once the query completes.
//!
//! Contexts are never invoked while the table lock is held, so drivers can
//! call back into the stack from their hooks.

use super::{
    DeviceCapabilities, DeviceContext, DeviceObject, DeviceProperty, DeviceRelations, DeviceStack,
    Irp, IrpOutcome, PdoInit, PlatformError, PnpMinor, RelationType, Status,
};
use common::{RegText, UsbHardwareId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

/// Platform primitive that can be made to fail once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePoint {
    CreateFilterDevice,
    CreatePdo,
    SetContext,
    AttachToStack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NodeKind {
    RootHub,
    Child,
    Filter,
    Synthetic,
}

struct Node {
    kind: NodeKind,
    properties: HashMap<DeviceProperty, RegText>,
    context: Option<Arc<dyn DeviceContext>>,
    /// Device this one is attached on top of
    lower: Option<DeviceObject>,
    /// Device attached on top of this one
    upper: Option<DeviceObject>,
    pdo_init: Option<PdoInit>,
}

impl Node {
    fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            properties: HashMap::new(),
            context: None,
            lower: None,
            upper: None,
            pdo_init: None,
        }
    }
}

#[derive(Default)]
struct StackState {
    nodes: HashMap<DeviceObject, Node>,
    /// Root hub -> plugged child PDOs, in plug order
    children: HashMap<DeviceObject, Vec<DeviceObject>>,
    /// Root hub -> relations last accepted from the top of its stack
    reported: HashMap<DeviceObject, Vec<DeviceObject>>,
    failures: Vec<FailurePoint>,
}

impl StackState {
    fn take_failure(&mut self, point: FailurePoint) -> bool {
        match self.failures.iter().position(|p| *p == point) {
            Some(index) => {
                self.failures.remove(index);
                true
            }
            None => false,
        }
    }

    fn top_of(&self, mut device: DeviceObject) -> DeviceObject {
        while let Some(upper) = self.nodes.get(&device).and_then(|n| n.upper) {
            device = upper;
        }
        device
    }
}

/// Process-local device tree implementing the platform contract
pub struct InMemoryStack {
    state: Mutex<StackState>,
    next_handle: AtomicU64,
}

impl Default for InMemoryStack {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStack {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StackState::default()),
            next_handle: AtomicU64::new(0x100),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate_handle(&self) -> DeviceObject {
        DeviceObject(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Add a root hub PDO with the given hardware ids
    pub fn add_root_hub(&self, hardware_ids: RegText) -> DeviceObject {
        let device = self.allocate_handle();
        let mut node = Node::new(NodeKind::RootHub);
        node.properties.insert(DeviceProperty::HardwareIds, hardware_ids);

        let mut state = self.lock();
        state.nodes.insert(device, node);
        state.children.insert(device, Vec::new());
        debug!("Added root hub {}", device);
        device
    }

    /// Plug a child device into a hub
    ///
    /// Empty `device_id` or `instance_id` leave the property unset, which is
    /// how a device with unreadable identity is modelled.
    pub fn plug(
        &self,
        hub: DeviceObject,
        device_id: &str,
        instance_id: &str,
    ) -> Result<DeviceObject, PlatformError> {
        let device = self.allocate_handle();
        let mut node = Node::new(NodeKind::Child);

        if !device_id.is_empty() {
            let hardware_ids = UsbHardwareId::parse(device_id)
                .map(|id| id.hardware_ids())
                .unwrap_or_else(|| RegText::single(device_id));
            node.properties.insert(DeviceProperty::DeviceId, RegText::single(device_id));
            node.properties.insert(DeviceProperty::HardwareIds, hardware_ids);
        }
        if !instance_id.is_empty() {
            node.properties.insert(DeviceProperty::InstanceId, RegText::single(instance_id));
        }

        let mut state = self.lock();
        let children = state
            .children
            .get_mut(&hub)
            .ok_or(PlatformError::NoSuchDevice(hub))?;
        children.push(device);
        state.nodes.insert(device, node);

        debug!("Plugged {} ({}) into hub {}", device, device_id, hub);
        Ok(device)
    }

    /// Remove a child device from its hub and from the tree
    ///
    /// Devices stacked on top of it stay until the PnP side retires them.
    pub fn unplug(&self, device: DeviceObject) -> bool {
        let mut state = self.lock();
        let mut found = false;
        for children in state.children.values_mut() {
            if let Some(index) = children.iter().position(|d| *d == device) {
                children.remove(index);
                found = true;
            }
        }
        if found {
            if let Some(node) = state.nodes.remove(&device)
                && let Some(upper) = node.upper
                && let Some(upper_node) = state.nodes.get_mut(&upper)
            {
                upper_node.lower = None;
            }
            debug!("Unplugged {}", device);
        }
        found
    }

    /// Make the next call of a primitive fail
    pub fn fail_next(&self, point: FailurePoint) {
        self.lock().failures.push(point);
    }

    pub fn is_present(&self, device: DeviceObject) -> bool {
        self.lock().nodes.contains_key(&device)
    }

    /// Child PDOs currently plugged into a hub
    pub fn children(&self, hub: DeviceObject) -> Vec<DeviceObject> {
        self.lock().children.get(&hub).cloned().unwrap_or_default()
    }

    /// All synthetic PDOs in the tree
    pub fn synthetic_devices(&self) -> Vec<DeviceObject> {
        let state = self.lock();
        let mut devices: Vec<_> = state
            .nodes
            .iter()
            .filter(|(_, node)| node.kind == NodeKind::Synthetic)
            .map(|(device, _)| *device)
            .collect();
        devices.sort();
        devices
    }

    /// Creation parameters a synthetic PDO was built with
    pub fn pdo_init(&self, device: DeviceObject) -> Option<PdoInit> {
        self.lock().nodes.get(&device)?.pdo_init.clone()
    }

    /// Device `device` is attached on top of
    pub fn lower_device(&self, device: DeviceObject) -> Option<DeviceObject> {
        self.lock().nodes.get(&device)?.lower
    }

    /// Topmost device of the stack `device` belongs to
    pub fn top_of_stack(&self, device: DeviceObject) -> DeviceObject {
        self.lock().top_of(device)
    }

    /// Send a PnP request to a device object
    pub fn send_pnp(&self, device: DeviceObject, minor: PnpMinor) -> oneshot::Receiver<IrpOutcome> {
        let (irp, rx) = Irp::new(minor);
        let status = self.call_driver(device, irp);
        trace!("PnP {:?} to {} returned {:?}", minor, device, status);
        rx
    }

    /// Query a hub's bus relations through the top of its stack and wait for
    /// the outcome
    ///
    /// Synthetic devices that were reported by the previous query but are
    /// missing from this one are deleted afterwards.
    pub async fn query_bus_relations(&self, hub: DeviceObject) -> Result<IrpOutcome, PlatformError> {
        let rx = self.send_pnp(self.top_of_stack(hub), PnpMinor::QueryDeviceRelations(RelationType::Bus));
        let outcome = rx.await.map_err(|_| PlatformError::RequestDropped)?;
        self.retire_unreported(hub, &outcome);
        Ok(outcome)
    }

    /// Blocking variant of [`InMemoryStack::query_bus_relations`], for use
    /// outside an async runtime
    pub fn query_bus_relations_blocking(&self, hub: DeviceObject) -> Result<IrpOutcome, PlatformError> {
        let rx = self.send_pnp(self.top_of_stack(hub), PnpMinor::QueryDeviceRelations(RelationType::Bus));
        let outcome = rx.blocking_recv().map_err(|_| PlatformError::RequestDropped)?;
        self.retire_unreported(hub, &outcome);
        Ok(outcome)
    }

    fn retire_unreported(&self, hub: DeviceObject, outcome: &IrpOutcome) {
        if !outcome.status.is_success() {
            return;
        }

        let reported = outcome
            .relations
            .as_ref()
            .map(|r| r.objects().to_vec())
            .unwrap_or_default();

        let stale: Vec<DeviceObject> = {
            let mut state = self.lock();
            let previous = state.reported.insert(hub, reported.clone()).unwrap_or_default();
            previous
                .into_iter()
                .filter(|device| !reported.contains(device))
                .filter(|device| {
                    state
                        .nodes
                        .get(device)
                        .is_some_and(|n| n.kind == NodeKind::Synthetic)
                })
                .collect()
        };

        for device in stale {
            debug!("Retiring unreported synthetic device {}", device);
            self.delete_device(device);
        }
    }

    /// Bus-driver handling of a request that reached the bottom of a stack
    fn complete_as_bus(&self, device: DeviceObject, mut irp: Irp) -> Status {
        let handled = {
            let state = self.lock();
            match state.nodes.get(&device) {
                Some(node) => {
                    Self::fill_bus_response(&state, device, node, &mut irp);
                    true
                }
                None => false,
            }
        };

        if handled {
            irp.complete()
        } else {
            irp.complete_with(Status::NoSuchDevice)
        }
    }

    fn fill_bus_response(state: &StackState, device: DeviceObject, node: &Node, irp: &mut Irp) {
        match irp.minor() {
            PnpMinor::QueryDeviceRelations(RelationType::Bus) => {
                if let Some(children) = state.children.get(&device) {
                    irp.relations = Some(DeviceRelations::new(children.clone()));
                    irp.status = Status::Success;
                }
            }
            PnpMinor::QueryDeviceRelations(RelationType::TargetDevice) => {
                irp.relations = Some(DeviceRelations::new(vec![device]));
                irp.status = Status::Success;
            }
            PnpMinor::QueryDeviceRelations(_) => {}
            PnpMinor::QueryId(id) => {
                irp.ids = node.properties.get(&DeviceProperty::from(id)).cloned();
                irp.status = if irp.ids.is_some() {
                    Status::Success
                } else {
                    Status::NotSupported
                };
            }
            PnpMinor::QueryCapabilities => {
                if let Some(caps) = irp.capabilities.as_mut() {
                    *caps = DeviceCapabilities {
                        raw_device_ok: false,
                        removable: node.kind == NodeKind::Child,
                        unique_id: node.properties.contains_key(&DeviceProperty::InstanceId),
                        surprise_removal_ok: node.kind == NodeKind::Child,
                    };
                }
                irp.status = Status::Success;
            }
            PnpMinor::StartDevice
            | PnpMinor::DeviceEnumerated
            | PnpMinor::QueryRemoveDevice
            | PnpMinor::RemoveDevice
            | PnpMinor::SurpriseRemoval => irp.status = Status::Success,
            PnpMinor::Other(_) => {}
        }
    }
}

impl DeviceStack for InMemoryStack {
    fn read_property(&self, device: DeviceObject, property: DeviceProperty) -> Option<RegText> {
        self.lock().nodes.get(&device)?.properties.get(&property).cloned()
    }

    fn create_filter_device(&self, target: DeviceObject) -> Result<DeviceObject, PlatformError> {
        let device = self.allocate_handle();
        let mut state = self.lock();

        if state.take_failure(FailurePoint::CreateFilterDevice) {
            return Err(PlatformError::InsufficientResources);
        }
        if !state.nodes.contains_key(&target) {
            return Err(PlatformError::NoSuchDevice(target));
        }

        let top = state.top_of(target);
        let mut node = Node::new(NodeKind::Filter);
        node.lower = Some(top);
        state.nodes.insert(device, node);
        if let Some(top_node) = state.nodes.get_mut(&top) {
            top_node.upper = Some(device);
        }

        debug!("Created filter device {} above {}", device, top);
        Ok(device)
    }

    fn create_pdo(&self, parent: DeviceObject, init: &PdoInit) -> Result<DeviceObject, PlatformError> {
        let mut state = self.lock();

        if state.take_failure(FailurePoint::CreatePdo) {
            return Err(PlatformError::InsufficientResources);
        }
        if !state.nodes.contains_key(&parent) {
            return Err(PlatformError::NoSuchDevice(parent));
        }
        if init.device_id.is_empty() {
            return Err(PlatformError::IdentityAssignment("device id"));
        }
        if init.instance_id.is_empty() {
            return Err(PlatformError::IdentityAssignment("instance id"));
        }

        let device = self.allocate_handle();
        let mut node = Node::new(NodeKind::Synthetic);
        node.properties.insert(DeviceProperty::DeviceId, RegText::single(init.device_id.as_str()));
        node.properties.insert(DeviceProperty::HardwareIds, init.hardware_ids.clone());
        node.properties.insert(DeviceProperty::CompatibleIds, init.compatible_ids.clone());
        node.properties.insert(DeviceProperty::InstanceId, RegText::single(init.instance_id.as_str()));
        node.pdo_init = Some(init.clone());
        state.nodes.insert(device, node);

        debug!("Created synthetic PDO {} under {}", device, parent);
        Ok(device)
    }

    fn set_context(
        &self,
        device: DeviceObject,
        context: Arc<dyn DeviceContext>,
    ) -> Result<(), PlatformError> {
        let mut state = self.lock();

        if state.take_failure(FailurePoint::SetContext) {
            return Err(PlatformError::InsufficientResources);
        }
        let node = state
            .nodes
            .get_mut(&device)
            .ok_or(PlatformError::NoSuchDevice(device))?;
        if node.context.is_some() {
            return Err(PlatformError::ContextInUse(device));
        }
        node.context = Some(context);
        Ok(())
    }

    fn attach_to_stack(
        &self,
        device: DeviceObject,
        target: DeviceObject,
    ) -> Result<DeviceObject, PlatformError> {
        let mut state = self.lock();

        if state.take_failure(FailurePoint::AttachToStack)
            || !state.nodes.contains_key(&device)
            || !state.nodes.contains_key(&target)
        {
            return Err(PlatformError::AttachFailed { device, target });
        }

        let top = state.top_of(target);
        if let Some(top_node) = state.nodes.get_mut(&top) {
            top_node.upper = Some(device);
        }
        if let Some(node) = state.nodes.get_mut(&device) {
            node.lower = Some(top);
        }

        debug!("Attached {} on top of {}", device, top);
        Ok(top)
    }

    fn delete_device(&self, device: DeviceObject) {
        let context = {
            let mut state = self.lock();
            let Some(node) = state.nodes.remove(&device) else {
                warn!("Delete of unknown device {}", device);
                return;
            };

            if let Some(lower) = node.lower
                && let Some(lower_node) = state.nodes.get_mut(&lower)
            {
                lower_node.upper = node.upper;
            }
            if let Some(upper) = node.upper
                && let Some(upper_node) = state.nodes.get_mut(&upper)
            {
                upper_node.lower = node.lower;
            }
            for reported in state.reported.values_mut() {
                reported.retain(|d| *d != device);
            }
            node.context
        };

        debug!("Deleted device {}", device);
        if let Some(context) = context {
            context.cleanup();
        }
    }

    fn call_driver(&self, target: DeviceObject, irp: Irp) -> Status {
        let context = self
            .lock()
            .nodes
            .get(&target)
            .map(|node| node.context.clone());

        match context {
            Some(Some(context)) => context.preprocess(irp),
            Some(None) => self.dispatch_default(target, irp),
            None => irp.complete_with(Status::NoSuchDevice),
        }
    }

    fn dispatch_default(&self, device: DeviceObject, irp: Irp) -> Status {
        let node = self
            .lock()
            .nodes
            .get(&device)
            .map(|node| (node.kind.clone(), node.lower));

        match node {
            Some((NodeKind::Filter, Some(lower))) => self.call_driver(lower, irp),
            Some((NodeKind::Filter, None)) | None => irp.complete_with(Status::NoSuchDevice),
            Some(_) => self.complete_as_bus(device, irp),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pnp::BusQueryId;
    use std::sync::atomic::AtomicUsize;

    struct CountingContext {
        preprocessed: AtomicUsize,
        cleaned_up: Arc<AtomicUsize>,
    }

    impl DeviceContext for CountingContext {
        fn preprocess(&self, irp: Irp) -> Status {
            self.preprocessed.fetch_add(1, Ordering::SeqCst);
            irp.complete_with(Status::Success)
        }

        fn cleanup(&self) {
            self.cleaned_up.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn hub(stack: &InMemoryStack) -> DeviceObject {
        stack.add_root_hub(RegText::new(["USB\\ROOT_HUB20", "USB\\ROOT_HUB"]))
    }

    #[test]
    fn test_bus_relations_report_plugged_children() {
        let stack = InMemoryStack::new();
        let hub = hub(&stack);
        let a = stack.plug(hub, "USB\\VID_1234&PID_0001", "1-1").unwrap();
        let b = stack.plug(hub, "USB\\VID_1234&PID_0002", "1-2").unwrap();

        let outcome = stack.query_bus_relations_blocking(hub).unwrap();
        assert_eq!(outcome.status, Status::Success);
        assert_eq!(outcome.relations.unwrap().objects(), &[a, b]);

        assert!(stack.unplug(a));
        let outcome = stack.query_bus_relations_blocking(hub).unwrap();
        assert_eq!(outcome.relations.unwrap().objects(), &[b]);
    }

    #[test]
    fn test_plug_sets_identity_properties() {
        let stack = InMemoryStack::new();
        let hub = hub(&stack);
        let dev = stack.plug(hub, "USB\\VID_046D&PID_C52B", "1-3").unwrap();

        let ids = stack.read_property(dev, DeviceProperty::HardwareIds).unwrap();
        assert!(ids.matches("USB\\VID_046D&PID_C52B"));
        assert_eq!(
            stack.read_property(dev, DeviceProperty::InstanceId),
            Some(RegText::single("1-3"))
        );

        let anonymous = stack.plug(hub, "", "").unwrap();
        assert!(stack.read_property(anonymous, DeviceProperty::DeviceId).is_none());
        assert!(stack.read_property(anonymous, DeviceProperty::InstanceId).is_none());
    }

    #[test]
    fn test_query_id_answered_by_bus() {
        let stack = InMemoryStack::new();
        let hub = hub(&stack);
        let dev = stack.plug(hub, "USB\\VID_1234&PID_0001", "1-1").unwrap();

        let mut rx = stack.send_pnp(dev, PnpMinor::QueryId(BusQueryId::InstanceId));
        let outcome = rx.try_recv().unwrap();
        assert_eq!(outcome.status, Status::Success);
        assert_eq!(outcome.ids, Some(RegText::single("1-1")));
    }

    #[test]
    fn test_attach_and_delete_relink_stack() {
        let stack = InMemoryStack::new();
        let hub = hub(&stack);
        let dev = stack.plug(hub, "USB\\VID_1234&PID_0001", "1-1").unwrap();
        let init = PdoInit {
            device_id: "USB\\Vid_FEED&Pid_CAFE".to_string(),
            hardware_ids: RegText::single("USB\\Vid_FEED&Pid_CAFE"),
            compatible_ids: RegText::default(),
            instance_id: "1".to_string(),
            raw_class_guid: None,
            exclusive: true,
            direct_io: true,
        };
        let pdo = stack.create_pdo(hub, &init).unwrap();

        let cleaned_up = Arc::new(AtomicUsize::new(0));
        let context = Arc::new(CountingContext {
            preprocessed: AtomicUsize::new(0),
            cleaned_up: cleaned_up.clone(),
        });
        stack.set_context(pdo, context.clone()).unwrap();
        assert_eq!(stack.attach_to_stack(pdo, dev).unwrap(), dev);
        assert_eq!(stack.top_of_stack(dev), pdo);

        let mut rx = stack.send_pnp(pdo, PnpMinor::StartDevice);
        assert_eq!(rx.try_recv().unwrap().status, Status::Success);
        assert_eq!(context.preprocessed.load(Ordering::SeqCst), 1);

        stack.delete_device(pdo);
        assert_eq!(cleaned_up.load(Ordering::SeqCst), 1);
        assert_eq!(stack.top_of_stack(dev), dev);
        assert!(!stack.is_present(pdo));
    }

    #[test]
    fn test_injected_failures_fire_once() {
        let stack = InMemoryStack::new();
        let hub = hub(&stack);

        stack.fail_next(FailurePoint::CreateFilterDevice);
        assert_eq!(
            stack.create_filter_device(hub),
            Err(PlatformError::InsufficientResources)
        );
        assert!(stack.create_filter_device(hub).is_ok());
    }

    #[test]
    fn test_request_to_missing_device() {
        let stack = InMemoryStack::new();
        let mut rx = stack.send_pnp(DeviceObject(0xdead), PnpMinor::StartDevice);
        assert_eq!(rx.try_recv().unwrap().status, Status::NoSuchDevice);
    }
}
