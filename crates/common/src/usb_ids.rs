//! USB identity strings
//!
//! Formatting and parsing of bus-reported USB device ids such as
//! `USB\VID_046D&PID_C52B&REV_1201`.

use crate::RegText;
use std::fmt;

/// Vendor/product (and optional revision) identity of a USB device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbHardwareId {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// bcdDevice revision, if known
    pub revision: Option<u16>,
}

impl UsbHardwareId {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            revision: None,
        }
    }

    pub fn with_revision(mut self, revision: u16) -> Self {
        self.revision = Some(revision);
        self
    }

    /// Device id string without the revision component
    pub fn device_id(&self) -> String {
        format!("USB\\VID_{:04X}&PID_{:04X}", self.vendor_id, self.product_id)
    }

    /// Hardware id list, most specific first
    pub fn hardware_ids(&self) -> RegText {
        match self.revision {
            Some(rev) => RegText::new([format!("{}&REV_{:04X}", self.device_id(), rev), self.device_id()]),
            None => RegText::single(self.device_id()),
        }
    }

    /// Parse a bus-reported id
    ///
    /// Accepts any letter case and ignores components after `PID_` other
    /// than `REV_`. Returns `None` for non-USB or malformed ids.
    pub fn parse(id: &str) -> Option<Self> {
        let upper = id.to_ascii_uppercase();
        let rest = upper.strip_prefix("USB\\")?;

        let mut vendor_id = None;
        let mut product_id = None;
        let mut revision = None;

        for part in rest.split('&') {
            if let Some(v) = part.strip_prefix("VID_") {
                vendor_id = Some(parse_hex4(v)?);
            } else if let Some(p) = part.strip_prefix("PID_") {
                product_id = Some(parse_hex4(p)?);
            } else if let Some(r) = part.strip_prefix("REV_") {
                revision = Some(parse_hex4(r)?);
            }
        }

        Some(Self {
            vendor_id: vendor_id?,
            product_id: product_id?,
            revision,
        })
    }

    /// Parse the first entry of a text list that is a valid USB id
    pub fn from_reg_text(text: &RegText) -> Option<Self> {
        text.iter().find_map(Self::parse)
    }
}

impl fmt::Display for UsbHardwareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

fn parse_hex4(s: &str) -> Option<u16> {
    if s.is_empty() || s.len() > 4 {
        return None;
    }
    u16::from_str_radix(s, 16).ok()
}
