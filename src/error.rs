//! Error taxonomy shared by the service layer.

use chrono::NaiveDate;
use core::fmt;
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub enum CoreError {
    /// The device is unknown, inactive, or has no active site assignment.
    DeviceNotAssigned(String),
    /// No session exists for the referenced id.
    SessionNotFound(i64),
    /// A counter mutation was attempted against a finalized session. Callers
    /// reroute the wake to the next day's session; a locked session is never
    /// reopened.
    SessionLocked { site_id: i64, date: NaiveDate },
    /// The referenced image does not exist (unknown id, or a retry against
    /// a (device, image name) pair that was never ingested). Signals a
    /// device/client bug; surfaced, not retried.
    ImageNotFound(String),
    /// The device's wake-schedule expression does not parse. Provisioning
    /// data bug; the wake cannot be slotted.
    InvalidSchedule { device_uid: String, reason: String },
    /// Underlying storage failure, propagated as-is. Retry policy is the
    /// caller's.
    Storage(diesel::result::Error),
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::DeviceNotAssigned(uid) => {
                write!(f, "device {} has no active site assignment", uid)
            }
            CoreError::SessionNotFound(id) => write!(f, "session {} not found", id),
            CoreError::SessionLocked { site_id, date } => {
                write!(f, "session for site {} on {} is locked", site_id, date)
            }
            CoreError::ImageNotFound(key) => write!(f, "image not found: {}", key),
            CoreError::InvalidSchedule { device_uid, reason } => {
                write!(f, "wake schedule for device {} invalid: {}", device_uid, reason)
            }
            CoreError::Storage(e) => write!(f, "storage error: {}", e),
        }
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CoreError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<diesel::result::Error> for CoreError {
    fn from(value: diesel::result::Error) -> Self {
        CoreError::Storage(value)
    }
}
