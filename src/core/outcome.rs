use std::time::Duration;

use crate::error::{Error, Result};

use super::backend::BackendError;
use super::events::{CooperativeFailureReason, ShutdownPath};

/// Result of detaching host mounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountOutcome {
    Stopped,
    Failed { detail: String },
}

/// Result of the cooperative, in-guest shutdown attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GracefulAttempt {
    /// No remote-shell session was available.
    Skipped,
    /// The guest acknowledged the shutdown command.
    Acknowledged { elapsed: Duration },
    /// The attempt failed or timed out.
    Failed {
        elapsed: Duration,
        reason: CooperativeFailureReason,
        detail: Option<String>,
    },
}

impl GracefulAttempt {
    pub fn succeeded(&self) -> bool {
        matches!(self, GracefulAttempt::Acknowledged { .. })
    }
}

/// Everything the shutdown sequence did for one VM; delivered to every
/// subscriber of the finished notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub vm: String,
    pub path: ShutdownPath,
    pub mounts: MountOutcome,
    pub graceful: GracefulAttempt,
    /// `None` when the forced power-off was not needed.
    pub power_off: Option<std::result::Result<(), BackendError>>,
    pub total: Duration,
}

impl ShutdownReport {
    pub fn is_success(&self) -> bool {
        !matches!(self.power_off, Some(Err(_)))
    }

    pub fn power_off_invoked(&self) -> bool {
        self.power_off.is_some()
    }

    /// Convert a backend failure into the crate error, keeping successful reports intact.
    pub fn into_result(self) -> Result<Self> {
        match self.power_off {
            Some(Err(source)) => Err(Error::PowerOffFailed {
                vm: self.vm,
                source,
            }),
            _ => Ok(self),
        }
    }
}
