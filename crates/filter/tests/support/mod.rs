//! Shared fixtures for filter integration tests

#![allow(dead_code)]

use common::RegText;
use filter::config::{FilterSettings, PolicySettings, RedirectAction, RedirectRule};
use filter::pnp::{DeviceObject, InMemoryStack, IrpOutcome};
use filter::{ControlSlot, FilterDevice, PolicyEngine};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a future with the default test timeout
pub async fn with_timeout<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(DEFAULT_TEST_TIMEOUT, future)
        .await
        .expect("test timed out")
}

pub fn redirect_rule(device_filter: &str) -> RedirectRule {
    RedirectRule {
        device_filter: device_filter.to_string(),
        instance_prefix: None,
        action: RedirectAction::Redirect,
        description: None,
    }
}

pub fn root_hub(stack: &InMemoryStack) -> DeviceObject {
    stack.add_root_hub(RegText::new(["USB\\ROOT_HUB20", "USB\\ROOT_HUB"]))
}

/// A root hub with a filter attached
pub struct Harness {
    pub stack: Arc<InMemoryStack>,
    pub hub: DeviceObject,
    pub slot: ControlSlot,
    pub filter: FilterDevice,
}

impl Harness {
    /// Filter whose policy redirects what `rules` select
    pub fn new(rules: Vec<RedirectRule>) -> Self {
        let stack = Arc::new(InMemoryStack::new());
        let hub = root_hub(&stack);
        let slot = ControlSlot::new(PolicyEngine::new(PolicySettings {
            default_action: RedirectAction::Native,
            rules,
        }));
        let filter = FilterDevice::create(stack.clone(), hub, &slot, &FilterSettings::default())
            .expect("filter attaches to root hub");

        Self {
            stack,
            hub,
            slot,
            filter,
        }
    }

    pub fn plug(&self, device_id: &str, instance_id: &str) -> DeviceObject {
        self.stack
            .plug(self.hub, device_id, instance_id)
            .expect("hub exists")
    }

    /// Query bus relations through the filter and wait for the result
    pub async fn query(&self) -> IrpOutcome {
        with_timeout(self.stack.query_bus_relations(self.hub))
            .await
            .expect("request completed")
    }

    /// Relations the filter exported in response to a fresh query
    pub async fn exported(&self) -> Vec<DeviceObject> {
        self.query()
            .await
            .relations
            .map(|r| r.objects().to_vec())
            .unwrap_or_default()
    }
}
