//! Child device registry
//!
//! Ordered set of [`ChildDevice`] records for one filter. The engine diffs
//! each relations snapshot against it: records whose PDO vanished are pruned,
//! new PDOs are registered (and possibly redirected), and the survivors are
//! exported back into the relations buffer.

use super::child::{ChildDevice, IdentityRecord};
use super::redirector::RedirectorFactory;
use super::relations::{RelationsBuilder, RelationsView};
use crate::pnp::{DeviceObject, DeviceStack};
use tracing::{debug, info, warn};

/// Decides whether a newly discovered child gets a redirector
pub trait RedirectionPolicy: Send + Sync {
    fn should_redirect(&self, child: &ChildDevice) -> bool;
}

impl<F> RedirectionPolicy for F
where
    F: Fn(&ChildDevice) -> bool + Send + Sync,
{
    fn should_redirect(&self, child: &ChildDevice) -> bool {
        self(child)
    }
}

#[derive(Debug, Default)]
pub struct ChildRegistry {
    children: Vec<ChildDevice>,
}

impl ChildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChildDevice> {
        self.children.iter()
    }

    pub fn is_registered(&self, pdo: DeviceObject) -> bool {
        self.children.iter().any(|child| child.matches(pdo))
    }

    /// Track `pdo` if no record references it yet
    ///
    /// Returns `true` when a record was added. Devices whose identity cannot
    /// be read, or for which no storage is available, are skipped and will be
    /// retried on the next pass that still reports them.
    pub fn register_if_absent(
        &mut self,
        pdo: DeviceObject,
        stack: &dyn DeviceStack,
        policy: &dyn RedirectionPolicy,
        factory: &RedirectorFactory,
    ) -> bool {
        if self.is_registered(pdo) {
            return false;
        }

        let identity = match IdentityRecord::read(stack, pdo) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Skipping child {}: {}", pdo, e);
                return false;
            }
        };

        if self.children.try_reserve(1).is_err() {
            warn!("Skipping child {}: out of memory for its record", pdo);
            return false;
        }

        let mut child = ChildDevice::new(identity, pdo);
        Self::apply_redirection_policy(&mut child, policy, factory);

        info!(
            "Registered child {} ({}redirected)",
            pdo,
            if child.is_redirected() { "" } else { "not " }
        );
        child.dump();

        self.children.push(child);
        true
    }

    fn apply_redirection_policy(
        child: &mut ChildDevice,
        policy: &dyn RedirectionPolicy,
        factory: &RedirectorFactory,
    ) {
        if !policy.should_redirect(child) {
            child.make_non_redirected();
            return;
        }

        match factory.create(child.pdo()) {
            Some(handle) => child.make_redirected(handle),
            None => {
                warn!("Failed to create redirector for {}, exposing it natively", child.pdo());
                child.make_non_redirected();
            }
        }
    }

    /// Drop every record whose PDO is missing from `snapshot`
    ///
    /// Redirector nodes are left alone; the platform tears them down once
    /// they disappear from the reported relations.
    pub fn prune_absent(&mut self, snapshot: &RelationsView) -> usize {
        let before = self.children.len();
        self.children.retain(|child| {
            let present = snapshot.contains(child.pdo());
            if !present {
                debug!("Pruning vanished child {}", child.pdo());
            }
            present
        });
        before - self.children.len()
    }

    /// Write the outward-facing PDO of every record, in registry order
    pub fn export(&self, builder: &mut RelationsBuilder<'_>) {
        for child in &self.children {
            builder.push_back(child.outward_pdo());
        }
    }
}
