//! The ordered teardown that runs once a countdown elapses: stop host mounts,
//! ask the guest to power off, force the power-off when the guest did not
//! cooperate, then report.

use std::rc::Rc;
use std::time::Duration;

use log::{info, warn};
use tokio::time::Instant;

use super::backend::VmBackend;
use super::events::{CooperativeFailureReason, CooperativeMethod, Event, ShutdownPath};
use super::guest::GuestLink;
use super::mounts::StopMounts;
use super::outcome::{GracefulAttempt, MountOutcome, ShutdownReport};

pub(crate) struct ShutdownSequence {
    pub(crate) vm: String,
    pub(crate) backend: Rc<dyn VmBackend>,
    pub(crate) stop_mounts: StopMounts,
    pub(crate) guest: GuestLink,
    pub(crate) guest_command: String,
    pub(crate) guest_timeout: Duration,
}

impl ShutdownSequence {
    /// Run every step in order. Only the backend result can mark the report failed.
    pub(crate) async fn run(self, emit: &mut dyn FnMut(Event)) -> ShutdownReport {
        let ShutdownSequence {
            vm,
            backend,
            stop_mounts,
            mut guest,
            guest_command,
            guest_timeout,
        } = self;

        let started = Instant::now();
        info!("shutting down `{vm}`");
        emit(Event::ShutdownRequested { vm: vm.clone() });

        let mounts = match stop_mounts(&vm) {
            Ok(()) => {
                emit(Event::MountsStopped { vm: vm.clone() });
                MountOutcome::Stopped
            }
            Err(err) => {
                let detail = err.to_string();
                warn!("failed to stop mounts for `{vm}`: {detail}; continuing shutdown");
                emit(Event::MountStopFailed {
                    vm: vm.clone(),
                    detail: detail.clone(),
                });
                MountOutcome::Failed { detail }
            }
        };

        let graceful = match guest.activate(&vm, guest_timeout) {
            Some(channel) => {
                emit(Event::CooperativeAttempted {
                    vm: vm.clone(),
                    method: CooperativeMethod::Ssh,
                    timeout_ms: duration_to_millis(guest_timeout),
                });
                let attempt_started = Instant::now();
                // The worker times the command itself; this only catches a worker
                // that never answers.
                let bound = guest_timeout.saturating_mul(2);
                let request = channel.request_shutdown(&guest_command);
                match tokio::time::timeout(bound, request).await {
                    Ok(attempt) => attempt,
                    Err(_) => GracefulAttempt::Failed {
                        elapsed: attempt_started.elapsed(),
                        reason: CooperativeFailureReason::TimeoutExpired,
                        detail: None,
                    },
                }
            }
            None => {
                emit(Event::CooperativeAttempted {
                    vm: vm.clone(),
                    method: CooperativeMethod::Unavailable,
                    timeout_ms: 0,
                });
                GracefulAttempt::Skipped
            }
        };
        // Closing the channel lets the guest worker drain and exit.
        drop(guest);

        let (path, power_off) = match &graceful {
            GracefulAttempt::Acknowledged { elapsed } => {
                emit(Event::CooperativeSucceeded {
                    vm: vm.clone(),
                    elapsed_ms: duration_to_millis(*elapsed),
                });
                (ShutdownPath::Graceful, None)
            }
            failed => {
                let (waited_ms, reason, detail) = match failed {
                    GracefulAttempt::Failed {
                        elapsed,
                        reason,
                        detail,
                    } => (duration_to_millis(*elapsed), *reason, detail.clone()),
                    _ => (
                        0,
                        CooperativeFailureReason::ChannelUnavailable,
                        Some(CooperativeMethod::Unavailable.describe().to_string()),
                    ),
                };
                info!(
                    "guest shutdown for `{vm}` {}; forcing power-off",
                    reason.describe()
                );
                emit(Event::CooperativeFailed {
                    vm: vm.clone(),
                    waited_ms,
                    reason,
                    detail,
                });

                emit(Event::PowerOffRequested { vm: vm.clone() });
                let result = backend.power_off().await;
                (ShutdownPath::Forced, Some(result))
            }
        };

        let total = started.elapsed();
        match &power_off {
            Some(Err(err)) => {
                warn!("power-off of `{vm}` failed: {err}");
                emit(Event::ShutdownFailed {
                    vm: vm.clone(),
                    total_ms: duration_to_millis(total),
                    error: err.to_string(),
                });
            }
            _ => emit(Event::ShutdownComplete {
                vm: vm.clone(),
                path,
                total_ms: duration_to_millis(total),
            }),
        }

        ShutdownReport {
            vm,
            path,
            mounts,
            graceful,
            power_off,
            total,
        }
    }
}

pub(crate) fn duration_to_millis(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}
