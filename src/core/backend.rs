//! VM backend contract and the process-signal backend used for QEMU guests.

use async_trait::async_trait;
use thiserror::Error;

/// Control handle for the hypervisor side of one VM.
///
/// `power_off` halts the VM without guest cooperation. Implementations that
/// talk to an asynchronous hypervisor should resolve only once the stop is
/// confirmed or has definitively failed.
#[async_trait(?Send)]
pub trait VmBackend {
    async fn power_off(&self) -> Result<(), BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("failed to send {signal} to pid {pid}: errno {errno}")]
    Signal {
        pid: i32,
        signal: &'static str,
        errno: i32,
    },
    #[error("process {pid} did not exit after SIGKILL")]
    StillRunning { pid: i32 },
    #[error("{message}")]
    Failed { message: String },
}

impl BackendError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

#[cfg(unix)]
pub use self::process::ProcessBackend;

#[cfg(unix)]
mod process {
    use std::io;
    use std::time::Duration;

    use async_trait::async_trait;
    use libc::pid_t;
    use log::{debug, info, warn};

    use super::{BackendError, VmBackend};
    use crate::config::ProcessSettings;

    const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

    /// Powers a VM off by signalling its hypervisor process: SIGTERM first, SIGKILL
    /// once the grace window lapses.
    #[derive(Debug, Clone)]
    pub struct ProcessBackend {
        vm: String,
        pid: pid_t,
        sigterm_wait: Duration,
        sigkill_wait: Duration,
        poll_interval: Duration,
    }

    impl ProcessBackend {
        pub fn new(vm: impl Into<String>, pid: u32, settings: &ProcessSettings) -> Self {
            Self {
                vm: vm.into(),
                pid: pid as pid_t,
                sigterm_wait: settings.sigterm_wait(),
                sigkill_wait: settings.sigkill_wait(),
                poll_interval: DEFAULT_POLL_INTERVAL,
            }
        }

        pub fn with_poll_interval(mut self, interval: Duration) -> Self {
            self.poll_interval = interval;
            self
        }

        pub fn pid(&self) -> u32 {
            self.pid as u32
        }

        async fn wait_for_exit(&self, timeout: Duration) -> bool {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if process_exited(self.pid) {
                    return true;
                }
                if tokio::time::Instant::now() >= deadline {
                    return false;
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }

    #[async_trait(?Send)]
    impl VmBackend for ProcessBackend {
        async fn power_off(&self) -> Result<(), BackendError> {
            let pid = self.pid;
            // kill(2) treats 0 and negative pids as process groups.
            if pid <= 0 {
                return Err(BackendError::failed(format!(
                    "refusing to signal invalid pid {pid} for VM `{}`",
                    self.vm
                )));
            }
            match send_signal(pid, libc::SIGTERM) {
                Ok(()) => {}
                Err(libc::ESRCH) => {
                    info!("VM `{}` process {pid} already exited", self.vm);
                    return Ok(());
                }
                Err(errno) => {
                    return Err(BackendError::Signal {
                        pid,
                        signal: "SIGTERM",
                        errno,
                    });
                }
            }

            debug!(
                "sent SIGTERM to VM `{}` (pid {pid}); waiting up to {:?}",
                self.vm, self.sigterm_wait
            );
            if self.wait_for_exit(self.sigterm_wait).await {
                return Ok(());
            }

            warn!(
                "VM `{}` (pid {pid}) ignored SIGTERM for {:?}; escalating to SIGKILL",
                self.vm, self.sigterm_wait
            );
            match send_signal(pid, libc::SIGKILL) {
                Ok(()) | Err(libc::ESRCH) => {}
                Err(errno) => {
                    return Err(BackendError::Signal {
                        pid,
                        signal: "SIGKILL",
                        errno,
                    });
                }
            }

            if self.wait_for_exit(self.sigkill_wait).await {
                Ok(())
            } else {
                Err(BackendError::StillRunning { pid })
            }
        }
    }

    fn send_signal(pid: pid_t, signal: libc::c_int) -> Result<(), i32> {
        // SAFETY: kill(2) has no memory-safety preconditions.
        let res = unsafe { libc::kill(pid, signal) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or_default())
        }
    }

    fn process_exited(pid: pid_t) -> bool {
        // Reap the process if it is our own child; zombies still answer kill(pid, 0).
        let mut status: libc::c_int = 0;
        // SAFETY: `status` is a valid, writable c_int for the duration of the call.
        let reaped = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        if reaped == pid {
            return true;
        }

        matches!(send_signal(pid, 0), Err(libc::ESRCH))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::process::Command;

        fn settings(sigterm: u64, sigkill: u64) -> ProcessSettings {
            ProcessSettings {
                sigterm_wait_secs: sigterm,
                sigkill_wait_secs: sigkill,
            }
        }

        #[tokio::test]
        async fn sigterm_stops_cooperative_process() {
            let child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
            let backend = ProcessBackend::new("devbox", child.id(), &settings(5, 1))
                .with_poll_interval(Duration::from_millis(20));

            backend.power_off().await.expect("power off");
            assert!(process_exited(backend.pid() as pid_t));
        }

        #[tokio::test]
        async fn already_exited_process_counts_as_stopped() {
            let mut child = Command::new("true").spawn().expect("spawn true");
            let pid = child.id();
            child.wait().expect("wait for true");

            let backend = ProcessBackend::new("devbox", pid, &settings(1, 1))
                .with_poll_interval(Duration::from_millis(20));
            backend.power_off().await.expect("power off exited process");
        }

        #[tokio::test]
        async fn group_pids_are_rejected() {
            let backend = ProcessBackend::new("devbox", 0, &settings(1, 1));
            let err = backend.power_off().await.expect_err("pid 0 is a group");
            assert!(matches!(err, BackendError::Failed { .. }));
        }

        #[tokio::test]
        async fn sigkill_follows_ignored_sigterm() {
            let child = Command::new("sh")
                .args(["-c", "trap '' TERM; sleep 30"])
                .spawn()
                .expect("spawn sh");
            // Give the shell a moment to install its trap.
            tokio::time::sleep(Duration::from_millis(200)).await;

            let backend = ProcessBackend::new("devbox", child.id(), &settings(0, 2))
                .with_poll_interval(Duration::from_millis(20));
            backend.power_off().await.expect("power off via SIGKILL");
        }
    }
}
