//! Filter error types

use crate::pnp::{DeviceObject, PlatformError};
use thiserror::Error;

/// Errors creating or running a filter device
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Device {0} is not a USB root hub")]
    NotSupported(DeviceObject),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Work item error: {0}")]
    WorkItem(#[from] common::Error),
}

/// Broken calling conventions between the platform and the filter
///
/// These are bugs, not runtime conditions; callers treat them as fatal or
/// log them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContractViolation {
    #[error("Bus relations request on {0} while a previous one is still being processed")]
    OverlappingRequest(DeviceObject),

    #[error("Work item for {0} ran with no pending request")]
    NoPendingRequest(DeviceObject),
}

pub type Result<T> = std::result::Result<T, FilterError>;
