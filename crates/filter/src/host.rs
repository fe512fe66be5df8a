//! Host USB topology mirror
//!
//! Enumerates the host's USB devices with libusb and mirrors them into an
//! [`InMemoryStack`]: one root hub node per bus, one child node per
//! non-hub device. Filters attached to the mirrored hubs then see the same
//! bus relations the host reports.

use crate::pnp::{DeviceObject, InMemoryStack};
use common::{RegText, UsbHardwareId};
use rusb::{Context, Device, UsbContext};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// USB class code of hubs
const HUB_CLASS: u8 = 9;

/// Hardware ids given to mirrored root hubs
pub const ROOT_HUB_IDS: [&str; 2] = ["USB\\ROOT_HUB20", "USB\\ROOT_HUB"];

/// A device found on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDevice {
    pub bus: u8,
    /// Port numbers from the root hub down to the device
    pub port_path: Vec<u8>,
    pub id: UsbHardwareId,
}

impl HostDevice {
    /// `<bus>-<port.path>`, the way the host names device locations
    pub fn instance_id(&self) -> String {
        let ports: Vec<String> = self.port_path.iter().map(|p| p.to_string()).collect();
        format!("{}-{}", self.bus, ports.join("."))
    }

    pub fn device_id(&self) -> String {
        self.id.device_id()
    }

    fn from_device(device: &Device<Context>) -> Option<Self> {
        let desc = match device.device_descriptor() {
            Ok(desc) => desc,
            Err(e) => {
                warn!(
                    "Failed to read descriptor of bus {} address {}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                return None;
            }
        };

        // Hubs (root hubs included) are not redirection candidates
        if desc.class_code() == HUB_CLASS {
            return None;
        }

        let port_path = device.port_numbers().ok()?;
        if port_path.is_empty() {
            return None;
        }

        Some(Self {
            bus: device.bus_number(),
            port_path,
            id: UsbHardwareId::new(desc.vendor_id(), desc.product_id()),
        })
    }
}

/// Enumerate the non-hub devices currently attached to the host
pub fn scan_host(context: &Context) -> Result<Vec<HostDevice>, rusb::Error> {
    let devices = context.devices()?;
    let found: Vec<HostDevice> = devices.iter().filter_map(|d| HostDevice::from_device(&d)).collect();
    debug!("Scanned {} host devices", found.len());
    Ok(found)
}

struct MirroredDevice {
    pdo: DeviceObject,
    id: UsbHardwareId,
}

/// Mirror of the host topology inside an [`InMemoryStack`]
pub struct HostTopology {
    stack: Arc<InMemoryStack>,
    /// Bus number -> root hub node
    hubs: BTreeMap<u8, DeviceObject>,
    /// Instance id -> mirrored child
    devices: HashMap<String, MirroredDevice>,
}

impl HostTopology {
    pub fn new(stack: Arc<InMemoryStack>) -> Self {
        Self {
            stack,
            hubs: BTreeMap::new(),
            devices: HashMap::new(),
        }
    }

    /// Root hub nodes, by bus number
    pub fn hubs(&self) -> Vec<DeviceObject> {
        self.hubs.values().copied().collect()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Scan the host and mirror any change; returns whether anything changed
    pub fn sync(&mut self, context: &Context) -> Result<bool, rusb::Error> {
        let devices = scan_host(context)?;
        Ok(self.apply(&devices))
    }

    /// Mirror a scan result; returns whether anything changed
    ///
    /// A device whose location now reports a different VID:PID is treated as
    /// unplugged and replugged.
    pub fn apply(&mut self, devices: &[HostDevice]) -> bool {
        let mut changed = false;

        let present: HashMap<String, &HostDevice> =
            devices.iter().map(|d| (d.instance_id(), d)).collect();

        let vanished: Vec<String> = self
            .devices
            .iter()
            .filter(|(instance_id, mirrored)| {
                present.get(*instance_id).is_none_or(|d| d.id != mirrored.id)
            })
            .map(|(instance_id, _)| instance_id.clone())
            .collect();

        for instance_id in vanished {
            if let Some(mirrored) = self.devices.remove(&instance_id) {
                info!("Device {} ({}) removed", instance_id, mirrored.id);
                self.stack.unplug(mirrored.pdo);
                changed = true;
            }
        }

        for device in devices {
            let instance_id = device.instance_id();
            if self.devices.contains_key(&instance_id) {
                continue;
            }

            let hub = self.hub_for_bus(device.bus);
            match self.stack.plug(hub, &device.device_id(), &instance_id) {
                Ok(pdo) => {
                    info!("Device {} ({}) arrived", instance_id, device.id);
                    self.devices.insert(instance_id, MirroredDevice { pdo, id: device.id });
                    changed = true;
                }
                Err(e) => warn!("Failed to mirror device {}: {}", instance_id, e),
            }
        }

        changed
    }

    fn hub_for_bus(&mut self, bus: u8) -> DeviceObject {
        *self.hubs.entry(bus).or_insert_with(|| {
            let hub = self.stack.add_root_hub(RegText::new(ROOT_HUB_IDS));
            info!("Bus {:03} mirrored as root hub {}", bus, hub);
            hub
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_device(bus: u8, ports: &[u8], vid: u16, pid: u16) -> HostDevice {
        HostDevice {
            bus,
            port_path: ports.to_vec(),
            id: UsbHardwareId::new(vid, pid),
        }
    }

    #[test]
    fn test_instance_id_format() {
        let device = host_device(1, &[2, 3], 0x046d, 0xc52b);
        assert_eq!(device.instance_id(), "1-2.3");
        assert_eq!(device.device_id(), "USB\\VID_046D&PID_C52B");
    }

    #[test]
    fn test_apply_mirrors_plug_and_unplug() {
        let stack = Arc::new(InMemoryStack::new());
        let mut host = HostTopology::new(stack.clone());

        let a = host_device(1, &[1], 0x1234, 0x0001);
        let b = host_device(2, &[4], 0x1234, 0x0002);
        assert!(host.apply(&[a.clone(), b.clone()]));
        assert_eq!(host.hubs().len(), 2);
        assert_eq!(host.device_count(), 2);

        // Unchanged scan
        assert!(!host.apply(&[a.clone(), b]));

        assert!(host.apply(&[a]));
        assert_eq!(host.device_count(), 1);
        assert_eq!(stack.children(host.hubs()[1]).len(), 0);
        assert_eq!(stack.children(host.hubs()[0]).len(), 1);
    }

    #[test]
    fn test_swapped_device_is_replugged() {
        let stack = Arc::new(InMemoryStack::new());
        let mut host = HostTopology::new(stack.clone());

        assert!(host.apply(&[host_device(1, &[1], 0x1234, 0x0001)]));
        let hub = host.hubs()[0];
        let first = stack.children(hub);

        assert!(host.apply(&[host_device(1, &[1], 0x1234, 0x0002)]));
        let second = stack.children(hub);
        assert_eq!(second.len(), 1);
        assert_ne!(first, second);
    }
}
