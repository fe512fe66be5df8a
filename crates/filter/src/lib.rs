//! USB device redirection filter
//!
//! Attaches to USB root hubs and rewrites the children they report, so that
//! selected devices are exposed through a synthetic raw "redirector" device
//! a capture client can claim exclusively, instead of through their native
//! driver stack.
//!
//! - [`pnp`]: the platform contract and an in-memory device tree
//! - [`filter`]: filter devices, child tracking, redirectors, reconciliation
//! - [`control`]: the shared control device
//! - [`policy`]: which devices get redirected
//! - [`host`]: mirrors the host's USB topology for the CLI

pub mod config;
pub mod control;
pub mod error;
pub mod filter;
pub mod host;
pub mod pnp;
pub mod policy;

pub use config::FilterConfig;
pub use control::{ControlDevice, ControlHandle, ControlSlot};
pub use error::{ContractViolation, FilterError};
pub use filter::{ChildSummary, FilterDevice};
pub use policy::PolicyEngine;
