//! Delayed shutdown coordinator and the collaborator contracts it drives.

pub mod backend;
pub mod coordinator;
pub mod countdown;
pub mod events;
pub mod mounts;
pub mod outcome;
pub mod reporter;
pub mod session;

mod guest;
mod sequencer;

pub use backend::{BackendError, VmBackend};
#[cfg(unix)]
pub use backend::ProcessBackend;
pub use coordinator::{DelayedShutdown, Finished};
pub use countdown::{Arming, CountdownState};
pub use events::{CooperativeFailureReason, CooperativeMethod, Event, ShutdownPath};
pub use mounts::{MountError, StopMounts, no_mounts};
pub use outcome::{GracefulAttempt, MountOutcome, ShutdownReport};
pub use reporter::Reporter;
pub use session::{ExecOutput, SessionError, ShellSession, SshSession, SshTarget};
