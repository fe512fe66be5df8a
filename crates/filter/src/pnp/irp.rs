//! PnP request packets
//!
//! An [`Irp`] travels down a device stack by value. Drivers on the way down
//! may register completion routines; completing the request runs them
//! bottom-up. A routine that returns [`Completion::MoreProcessingRequired`]
//! keeps the request and is responsible for completing it again later, which
//! is how a request outlives the call stack that issued it.

use super::{DeviceCapabilities, DeviceRelations, PnpMinor, Status};
use common::RegText;
use std::fmt;
use tokio::sync::oneshot;

/// Result of running a completion routine
pub enum Completion {
    /// Continue unwinding the completion chain
    Continue(Irp),
    /// The routine took ownership of the request
    MoreProcessingRequired,
}

/// Completion routine registered by a driver on the way down
pub type CompletionRoutine = Box<dyn FnOnce(Irp) -> Completion + Send>;

/// Final state of a request, delivered to whoever issued it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrpOutcome {
    pub minor: PnpMinor,
    pub status: Status,
    pub relations: Option<DeviceRelations>,
    pub capabilities: Option<DeviceCapabilities>,
    pub ids: Option<RegText>,
}

/// A PnP request in flight
pub struct Irp {
    minor: PnpMinor,
    /// Completion status, written by whoever completes the request
    pub status: Status,
    /// Relations buffer (query-device-relations)
    pub relations: Option<DeviceRelations>,
    /// Caller-supplied capabilities (query-capabilities)
    pub capabilities: Option<DeviceCapabilities>,
    /// Identity strings (query-id)
    pub ids: Option<RegText>,
    completion_routines: Vec<CompletionRoutine>,
    requester: Option<oneshot::Sender<IrpOutcome>>,
}

impl Irp {
    /// Build a request and the receiver its outcome will be delivered to
    pub fn new(minor: PnpMinor) -> (Self, oneshot::Receiver<IrpOutcome>) {
        let (tx, rx) = oneshot::channel();

        let capabilities =
            matches!(minor, PnpMinor::QueryCapabilities).then(DeviceCapabilities::default);

        let irp = Self {
            minor,
            status: Status::NotSupported,
            relations: None,
            capabilities,
            ids: None,
            completion_routines: Vec::new(),
            requester: Some(tx),
        };

        (irp, rx)
    }

    pub fn minor(&self) -> PnpMinor {
        self.minor
    }

    /// Register a routine to run when the request is completed
    ///
    /// Routines run in reverse registration order, i.e. the driver lowest in
    /// the stack sees the completion first.
    pub fn set_completion_routine<F>(&mut self, routine: F)
    where
        F: FnOnce(Irp) -> Completion + Send + 'static,
    {
        self.completion_routines.push(Box::new(routine));
    }

    /// Complete the request
    ///
    /// Returns the final status once every completion routine has run and the
    /// issuer has been notified, or [`Status::Pending`] when a routine kept
    /// the request.
    pub fn complete(mut self) -> Status {
        while let Some(routine) = self.completion_routines.pop() {
            match routine(self) {
                Completion::Continue(irp) => self = irp,
                Completion::MoreProcessingRequired => return Status::Pending,
            }
        }

        let status = self.status;
        if let Some(requester) = self.requester.take() {
            let outcome = IrpOutcome {
                minor: self.minor,
                status,
                relations: self.relations.take(),
                capabilities: self.capabilities.take(),
                ids: self.ids.take(),
            };
            // The issuer may have stopped waiting
            let _ = requester.send(outcome);
        }
        status
    }

    /// Set the status and complete
    pub fn complete_with(mut self, status: Status) -> Status {
        self.status = status;
        self.complete()
    }
}

impl fmt::Debug for Irp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Irp")
            .field("minor", &self.minor)
            .field("status", &self.status)
            .field("relations", &self.relations)
            .field("completion_routines", &self.completion_routines.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pnp::{DeviceObject, RelationType};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_completion_routines_run_bottom_up() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (mut irp, mut rx) = Irp::new(PnpMinor::StartDevice);

        for name in ["upper", "lower"] {
            let order = order.clone();
            irp.set_completion_routine(move |irp| {
                order.lock().unwrap().push(name);
                Completion::Continue(irp)
            });
        }

        assert_eq!(irp.complete_with(Status::Success), Status::Success);
        assert_eq!(*order.lock().unwrap(), vec!["lower", "upper"]);
        assert_eq!(rx.try_recv().unwrap().status, Status::Success);
    }

    #[test]
    fn test_more_processing_required_defers_completion() {
        let parked = Arc::new(Mutex::new(None));
        let (mut irp, mut rx) = Irp::new(PnpMinor::QueryDeviceRelations(RelationType::Bus));

        let slot = parked.clone();
        irp.set_completion_routine(move |irp| {
            *slot.lock().unwrap() = Some(irp);
            Completion::MoreProcessingRequired
        });
        irp.relations = Some(DeviceRelations::new(vec![DeviceObject(1)]));

        assert_eq!(irp.complete_with(Status::Success), Status::Pending);
        assert!(rx.try_recv().is_err());

        let irp = parked.lock().unwrap().take().unwrap();
        assert_eq!(irp.complete(), Status::Success);

        let outcome = rx.try_recv().unwrap();
        assert_eq!(outcome.relations.unwrap().objects(), &[DeviceObject(1)]);
    }

    #[test]
    fn test_capabilities_buffer_only_for_capability_queries() {
        let (irp, _rx) = Irp::new(PnpMinor::QueryCapabilities);
        assert_eq!(irp.capabilities, Some(DeviceCapabilities::default()));

        let (irp, _rx) = Irp::new(PnpMinor::StartDevice);
        assert!(irp.capabilities.is_none());
        assert_eq!(irp.status, Status::NotSupported);
    }
}
