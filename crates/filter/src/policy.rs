//! Device redirection policy engine
//!
//! Decides, once per newly discovered device, whether it is exposed natively
//! or through a redirector. Rules select devices by VID:PID pattern and,
//! optionally, by instance-id prefix (the port a device is plugged into).
//!
//! The most specific matching rule wins:
//! 1. exact `VID:PID`
//! 2. `VID:*`
//! 3. `*:PID`
//! 4. `*:*`
//!
//! Within a tier the first rule in configuration order is used. Devices no
//! rule matches get the configured default action.

use crate::config::{PolicySettings, RedirectAction, RedirectRule};
use crate::filter::{ChildDevice, IdentityRecord, RedirectionPolicy};
use common::UsbHardwareId;
use tracing::{debug, warn};

/// Policy evaluation result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyDecision {
    pub action: RedirectAction,
    /// Index of the deciding rule; `None` when the default action applied
    pub rule: Option<usize>,
}

impl PolicyDecision {
    pub fn is_redirect(&self) -> bool {
        self.action == RedirectAction::Redirect
    }
}

/// Parsed `VID:PID` pattern, `None` standing for `*`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeviceFilter {
    vendor_id: Option<u16>,
    product_id: Option<u16>,
}

impl DeviceFilter {
    fn parse(filter: &str) -> Option<Self> {
        let (vid, pid) = filter.split_once(':')?;
        Some(Self {
            vendor_id: Self::parse_part(vid)?,
            product_id: Self::parse_part(pid)?,
        })
    }

    fn parse_part(part: &str) -> Option<Option<u16>> {
        if part == "*" {
            return Some(None);
        }
        let hex = part
            .strip_prefix("0x")
            .or_else(|| part.strip_prefix("0X"))
            .unwrap_or(part);
        u16::from_str_radix(hex, 16).ok().map(Some)
    }

    /// Lower is more specific
    fn tier(&self) -> u8 {
        match (self.vendor_id, self.product_id) {
            (Some(_), Some(_)) => 0,
            (Some(_), None) => 1,
            (None, Some(_)) => 2,
            (None, None) => 3,
        }
    }

    fn matches(&self, id: Option<&UsbHardwareId>) -> bool {
        if self.tier() == 3 {
            return true;
        }
        let Some(id) = id else {
            return false;
        };
        self.vendor_id.is_none_or(|vid| vid == id.vendor_id)
            && self.product_id.is_none_or(|pid| pid == id.product_id)
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    index: usize,
    filter: DeviceFilter,
    instance_prefix: Option<String>,
    action: RedirectAction,
}

impl CompiledRule {
    fn matches(&self, id: Option<&UsbHardwareId>, identity: &IdentityRecord) -> bool {
        if !self.filter.matches(id) {
            return false;
        }
        match &self.instance_prefix {
            Some(prefix) => identity.instance_id().matches_prefix(prefix),
            None => true,
        }
    }
}

/// Rule-based redirection policy
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    default_action: RedirectAction,
    /// Rules sorted by specificity, configuration order within a tier
    rules: Vec<CompiledRule>,
}

impl PolicyEngine {
    /// Create a policy engine from configuration
    ///
    /// Rules with an unparseable device filter are ignored.
    pub fn new(settings: PolicySettings) -> Self {
        let mut rules: Vec<CompiledRule> = settings
            .rules
            .into_iter()
            .enumerate()
            .filter_map(|(index, rule)| Self::compile(index, rule))
            .collect();
        // Stable sort keeps configuration order within a tier
        rules.sort_by_key(|rule| rule.filter.tier());

        Self {
            default_action: settings.default_action,
            rules,
        }
    }

    fn compile(index: usize, rule: RedirectRule) -> Option<CompiledRule> {
        match DeviceFilter::parse(&rule.device_filter) {
            Some(filter) => Some(CompiledRule {
                index,
                filter,
                instance_prefix: rule.instance_prefix,
                action: rule.action,
            }),
            None => {
                warn!("Ignoring rule with invalid device filter '{}'", rule.device_filter);
                None
            }
        }
    }

    pub fn default_action(&self) -> RedirectAction {
        self.default_action
    }

    /// Decide what to do with a device
    pub fn evaluate(&self, identity: &IdentityRecord) -> PolicyDecision {
        let id = UsbHardwareId::from_reg_text(identity.device_id());

        self.rules
            .iter()
            .find(|rule| rule.matches(id.as_ref(), identity))
            .map(|rule| PolicyDecision {
                action: rule.action,
                rule: Some(rule.index),
            })
            .unwrap_or(PolicyDecision {
                action: self.default_action,
                rule: None,
            })
    }
}

impl RedirectionPolicy for PolicyEngine {
    fn should_redirect(&self, child: &ChildDevice) -> bool {
        let decision = self.evaluate(child.identity());
        debug!(
            "Policy for {} ({}): {:?} (rule {:?})",
            child.pdo(),
            child.identity().device_id(),
            decision.action,
            decision.rule
        );
        decision.is_redirect()
    }
}
