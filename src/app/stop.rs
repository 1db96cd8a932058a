use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::rc::Rc;
use std::time::{Duration, Instant};

use tokio::task::LocalSet;

use crate::cli::{SshArgs, StopArgs};
use crate::config::{ShutdownConfig, load_config};
use crate::core::{
    CountdownState, DelayedShutdown, MountError, ProcessBackend, ShellSession, ShutdownPath,
    SshSession, SshTarget, StopMounts, no_mounts,
};
use crate::{Error, Result};

use super::display::{EventPrinter, format_remaining};

/// How often the remaining time is printed while a countdown is armed.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

/// Longest the unmount command may run before it is killed.
const UNMOUNT_TIMEOUT: Duration = Duration::from_secs(60);
const UNMOUNT_POLL: Duration = Duration::from_millis(50);

pub fn handle_stop(args: StopArgs, config_override: Option<&PathBuf>, json: bool) -> Result<()> {
    if args.pid == 0 || args.pid > i32::MAX as u32 {
        return Err(Error::Usage {
            message: format!("--pid {} is not a valid process id.", args.pid),
        });
    }

    let config = match config_override {
        Some(path) if !path.is_file() => {
            return Err(Error::ExplicitConfigMissing { path: path.clone() });
        }
        Some(path) => load_config(path)?,
        None => ShutdownConfig::discover()?,
    };
    for warning in &config.warnings {
        eprintln!("Warning: {warning}");
    }

    let backend = Rc::new(ProcessBackend::new(&args.vm, args.pid, &config.process));
    let session = ssh_session(&args.ssh);
    let stop_mounts = match args.unmount_command.clone() {
        Some(command) => unmount_with(command, UNMOUNT_TIMEOUT),
        None => no_mounts(),
    };
    let delay = Duration::from_secs(args.delay_secs);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|source| Error::Runtime { source })?;
    let local = LocalSet::new();

    let report = runtime.block_on(local.run_until(async move {
        let mut shutdown =
            DelayedShutdown::new(&args.vm, backend, session, stop_mounts, config.shutdown)
                .with_reporter(EventPrinter::new(json));
        shutdown.start(delay);

        let mut finished = shutdown.finished();
        let start = tokio::time::Instant::now() + PROGRESS_INTERVAL;
        let mut progress = tokio::time::interval_at(start, PROGRESS_INTERVAL);
        loop {
            tokio::select! {
                result = &mut finished => break result,
                _ = progress.tick() => {
                    if !json && shutdown.state() == CountdownState::Armed {
                        println!(
                            "→ {}: {} until shutdown.",
                            shutdown.vm(),
                            format_remaining(shutdown.get_time_remaining_secs())
                        );
                    }
                }
            }
        }
    }))?;

    if report.path == ShutdownPath::Forced && !json {
        eprintln!("Warning: forced power-off required for {}.", report.vm);
    }

    Ok(())
}

fn ssh_session(args: &SshArgs) -> Option<Box<dyn ShellSession>> {
    let (host, user) = match (&args.ssh_host, &args.ssh_user) {
        (Some(host), Some(user)) => (host, user),
        _ => return None,
    };

    let mut target = SshTarget::new(user, host).with_port(args.ssh_port);
    if let Some(identity) = &args.ssh_identity {
        target = target.with_identity(identity);
    }
    for option in &args.ssh_options {
        target = target.with_option(option);
    }
    Some(Box::new(SshSession::new(target)))
}

/// Mount-stop callback that runs `command` through `sh -c` with the VM name as `$1`.
///
/// The callback blocks the event loop, so the command is killed once `timeout`
/// passes.
fn unmount_with(command: String, timeout: Duration) -> StopMounts {
    Box::new(move |vm: &str| -> std::result::Result<(), MountError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .arg("vmstop-unmount")
            .arg(vm)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| MountError::Other(format!("failed to run `{command}`: {err}")))?;

        let status = wait_with_deadline(&mut child, timeout)
            .map_err(|err| MountError::Other(format!("failed to wait for `{command}`: {err}")))?;
        let Some(status) = status else {
            return Err(MountError::Unmount {
                target: vm.to_string(),
                message: format!(
                    "`{command}` did not finish within {}s and was killed",
                    timeout.as_secs()
                ),
            });
        };

        if status.success() {
            return Ok(());
        }
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        let stderr = stderr.trim();
        Err(MountError::Unmount {
            target: vm.to_string(),
            message: if stderr.is_empty() {
                format!("`{command}` exited with {status}")
            } else {
                stderr.to_string()
            },
        })
    })
}

/// Poll `child` until it exits; kill and reap it once `timeout` passes.
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        std::thread::sleep(UNMOUNT_POLL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_session_requires_host_and_user() {
        assert!(ssh_session(&SshArgs::default()).is_none());

        let args = SshArgs {
            ssh_host: Some("127.0.0.1".into()),
            ssh_user: Some("dev".into()),
            ssh_port: 2222,
            ..Default::default()
        };
        assert!(ssh_session(&args).is_some());
    }

    #[cfg(unix)]
    #[test]
    fn unmount_command_receives_vm_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("unmounted");
        let command = format!("echo \"$1\" > '{}'", marker.display());

        unmount_with(command, UNMOUNT_TIMEOUT)("devbox").expect("unmount succeeds");
        let contents = std::fs::read_to_string(&marker).expect("marker written");
        assert_eq!(contents.trim(), "devbox");
    }

    #[cfg(unix)]
    #[test]
    fn failing_unmount_reports_stderr() {
        let err = unmount_with("echo 'target is busy' >&2; exit 32".into(), UNMOUNT_TIMEOUT)(
            "devbox",
        )
        .expect_err("unmount fails");
        assert_eq!(
            err,
            MountError::Unmount {
                target: "devbox".into(),
                message: "target is busy".into()
            }
        );
    }

    #[cfg(unix)]
    #[test]
    fn hung_unmount_is_killed_after_timeout() {
        let started = Instant::now();
        let err = unmount_with("exec sleep 30".into(), Duration::from_millis(200))("devbox")
            .expect_err("unmount times out");

        assert!(started.elapsed() < Duration::from_secs(10));
        match err {
            MountError::Unmount { target, message } => {
                assert_eq!(target, "devbox");
                assert!(message.contains("did not finish"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn zero_pid_is_a_usage_error() {
        let args = StopArgs {
            vm: "devbox".into(),
            pid: 0,
            delay_secs: 0,
            ssh: SshArgs::default(),
            unmount_command: None,
        };
        let err = handle_stop(args, None, false).expect_err("pid 0 rejected");
        assert!(matches!(err, Error::Usage { .. }));
    }
}
