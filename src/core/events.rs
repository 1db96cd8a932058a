use serde::Serialize;

/// Structured event emitted while a shutdown coordinator runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A countdown was armed (or re-armed) for a VM.
    ShutdownArmed {
        /// Name of the VM.
        vm: String,
        /// Requested delay in milliseconds.
        delay_ms: u64,
        /// Whether this call superseded a countdown that was still running.
        rearmed: bool,
    },
    /// A running countdown was cancelled before it fired.
    CountdownCancelled {
        /// Name of the VM.
        vm: String,
        /// Milliseconds that were still left on the cancelled countdown.
        remaining_ms: u64,
    },
    /// A power-off warning was queued for logged-in guest users.
    GuestWarned {
        /// Name of the VM.
        vm: String,
        /// Whole minutes announced in the warning.
        minutes: u64,
    },
    /// The countdown elapsed and the shutdown sequence began.
    ShutdownRequested {
        /// Name of the VM.
        vm: String,
    },
    /// Host mounts were detached.
    MountsStopped {
        /// Name of the VM.
        vm: String,
    },
    /// Detaching host mounts failed; the sequence continues regardless.
    MountStopFailed {
        /// Name of the VM.
        vm: String,
        /// Error reported by the mount manager.
        detail: String,
    },
    /// A guest-cooperative shutdown was attempted.
    CooperativeAttempted {
        /// Name of the VM.
        vm: String,
        /// Channel used for the attempt.
        method: CooperativeMethod,
        /// Milliseconds the host waits before forcing power-off.
        timeout_ms: u64,
    },
    /// The guest acknowledged the shutdown command.
    CooperativeSucceeded {
        /// Name of the VM.
        vm: String,
        /// Milliseconds until the guest acknowledged.
        elapsed_ms: u64,
    },
    /// The cooperative attempt did not succeed.
    CooperativeFailed {
        /// Name of the VM.
        vm: String,
        /// Milliseconds spent on the attempt.
        waited_ms: u64,
        /// Why the cooperative phase concluded.
        reason: CooperativeFailureReason,
        /// Optional detail (e.g. transport errors).
        detail: Option<String>,
    },
    /// The backend was asked to power the VM off.
    PowerOffRequested {
        /// Name of the VM.
        vm: String,
    },
    /// The shutdown sequence finished and the VM is stopping.
    ShutdownComplete {
        /// Name of the VM.
        vm: String,
        /// Path the sequence took.
        path: ShutdownPath,
        /// Milliseconds from shutdown request until completion.
        total_ms: u64,
    },
    /// The backend failed to power the VM off.
    ShutdownFailed {
        /// Name of the VM.
        vm: String,
        /// Milliseconds from shutdown request until the failure.
        total_ms: u64,
        /// Backend error message.
        error: String,
    },
}

impl Event {
    pub fn vm(&self) -> &str {
        match self {
            Event::ShutdownArmed { vm, .. }
            | Event::CountdownCancelled { vm, .. }
            | Event::GuestWarned { vm, .. }
            | Event::ShutdownRequested { vm }
            | Event::MountsStopped { vm }
            | Event::MountStopFailed { vm, .. }
            | Event::CooperativeAttempted { vm, .. }
            | Event::CooperativeSucceeded { vm, .. }
            | Event::CooperativeFailed { vm, .. }
            | Event::PowerOffRequested { vm }
            | Event::ShutdownComplete { vm, .. }
            | Event::ShutdownFailed { vm, .. } => vm,
        }
    }
}

/// Channel used for the cooperative shutdown attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CooperativeMethod {
    Ssh,
    Unavailable,
}

impl CooperativeMethod {
    pub fn describe(self) -> &'static str {
        match self {
            CooperativeMethod::Ssh => "SSH guest command",
            CooperativeMethod::Unavailable => "no remote shell session",
        }
    }
}

/// Reason a cooperative attempt concluded without the guest acknowledging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CooperativeFailureReason {
    TimeoutExpired,
    ChannelUnavailable,
    ChannelError,
    Refused,
}

impl CooperativeFailureReason {
    pub fn describe(self) -> &'static str {
        match self {
            CooperativeFailureReason::TimeoutExpired => "timed out",
            CooperativeFailureReason::ChannelUnavailable => "skipped (no session)",
            CooperativeFailureReason::ChannelError => "failed",
            CooperativeFailureReason::Refused => "was refused by the guest",
        }
    }
}

/// Path the shutdown sequence took to stop the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPath {
    Graceful,
    Forced,
}

impl ShutdownPath {
    pub fn as_str(self) -> &'static str {
        match self {
            ShutdownPath::Graceful => "graceful",
            ShutdownPath::Forced => "forced",
        }
    }
}
