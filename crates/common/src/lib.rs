//! Common utilities for usb-redirector
//!
//! This crate provides functionality shared by the filter library and its
//! command-line front end: error handling, logging setup, and the text
//! utilities used to read and match device identity strings.

pub mod error;
pub mod logging;
pub mod reg_text;
pub mod usb_ids;

pub use error::{Error, Result};
pub use logging::{LogFormat, setup_logging};
pub use reg_text::RegText;
pub use usb_ids::UsbHardwareId;
