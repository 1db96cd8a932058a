//! Exclusive owner of a guest's shell session.
//!
//! The session moves into a local task that serves requests one at a time, so
//! a slow or hung command never blocks the countdown and the session is never
//! used concurrently. A shutdown request cuts short any broadcast still running
//! and skips queued ones, so its timeout covers only the command itself.

use std::collections::VecDeque;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use log::{debug, warn};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::events::CooperativeFailureReason;
use super::outcome::GracefulAttempt;
use super::session::{SessionError, ShellSession};

pub(crate) const CANCELLED_NOTICE: &str = "The system shutdown has been cancelled.";

enum GuestRequest {
    Notice(String),
    Shutdown {
        command: String,
        reply: oneshot::Sender<GracefulAttempt>,
    },
}

/// Session slot held by the coordinator until the event loop is available.
pub(crate) enum GuestLink {
    Absent,
    Idle(Box<dyn ShellSession>),
    Active(GuestChannel),
}

impl GuestLink {
    pub(crate) fn new(session: Option<Box<dyn ShellSession>>) -> Self {
        match session {
            Some(session) => GuestLink::Idle(session),
            None => GuestLink::Absent,
        }
    }

    /// Move an idle session into its worker task. Must run inside a `LocalSet`.
    pub(crate) fn activate(&mut self, vm: &str, timeout: Duration) -> Option<&GuestChannel> {
        if matches!(self, GuestLink::Idle(_)) {
            if let GuestLink::Idle(session) = std::mem::replace(self, GuestLink::Absent) {
                *self = GuestLink::Active(GuestChannel::spawn(vm.to_string(), session, timeout));
            }
        }
        match self {
            GuestLink::Active(channel) => Some(channel),
            _ => None,
        }
    }

    pub(crate) fn channel(&self) -> Option<&GuestChannel> {
        match self {
            GuestLink::Active(channel) => Some(channel),
            _ => None,
        }
    }

    pub(crate) fn take(&mut self) -> GuestLink {
        std::mem::replace(self, GuestLink::Absent)
    }
}

pub(crate) struct GuestChannel {
    vm: String,
    sender: Sender<GuestRequest>,
}

impl GuestChannel {
    fn spawn(vm: String, session: Box<dyn ShellSession>, timeout: Duration) -> Self {
        let (sender, receiver) = async_channel::unbounded();
        tokio::task::spawn_local(serve(vm.clone(), session, receiver, timeout));
        Self { vm, sender }
    }

    /// Queue a `wall` broadcast; never waits for the guest.
    pub(crate) fn notify(&self, message: impl Into<String>) {
        if self
            .sender
            .try_send(GuestRequest::Notice(message.into()))
            .is_err()
        {
            debug!("guest session for `{}` already released; notice dropped", self.vm);
        }
    }

    /// Hand the shutdown command to the worker and wait for its bounded result.
    pub(crate) async fn request_shutdown(&self, command: &str) -> GracefulAttempt {
        let started = Instant::now();
        let (reply, response) = oneshot::channel();
        let request = GuestRequest::Shutdown {
            command: command.to_string(),
            reply,
        };

        if self.sender.send(request).await.is_err() {
            return channel_lost(started);
        }

        response.await.unwrap_or_else(|_| channel_lost(started))
    }
}

fn channel_lost(started: Instant) -> GracefulAttempt {
    GracefulAttempt::Failed {
        elapsed: started.elapsed(),
        reason: CooperativeFailureReason::ChannelError,
        detail: Some(SessionError::Closed.to_string()),
    }
}

async fn serve(
    vm: String,
    mut session: Box<dyn ShellSession>,
    receiver: Receiver<GuestRequest>,
    timeout: Duration,
) {
    let mut pending: VecDeque<String> = VecDeque::new();
    loop {
        let request = match pending.pop_front() {
            Some(message) => GuestRequest::Notice(message),
            None => match receiver.recv().await {
                Ok(request) => request,
                Err(_) => return,
            },
        };

        let (command, reply) = match request {
            GuestRequest::Notice(message) => {
                match broadcast(&vm, &mut *session, &message, &receiver, &mut pending, timeout)
                    .await
                {
                    Some(shutdown) => shutdown,
                    None => continue,
                }
            }
            GuestRequest::Shutdown { command, reply } => (command, reply),
        };

        if !pending.is_empty() {
            debug!(
                "dropping {} queued broadcast(s) to `{vm}` for shutdown",
                pending.len()
            );
        }
        if reply.is_closed() {
            debug!("shutdown request for `{vm}` was abandoned before it ran");
            return;
        }
        let started = Instant::now();
        let result = tokio::time::timeout(timeout, session.exec(&command)).await;
        let attempt = classify(result, started.elapsed());
        let _ = reply.send(attempt);
        // The session is spent once the guest was asked to power off.
        return;
    }
}

/// Run one `wall` broadcast. Notices arriving meanwhile are queued; a shutdown
/// request preempts the broadcast and is handed back to run at once.
async fn broadcast(
    vm: &str,
    session: &mut dyn ShellSession,
    message: &str,
    receiver: &Receiver<GuestRequest>,
    pending: &mut VecDeque<String>,
    timeout: Duration,
) -> Option<(String, oneshot::Sender<GracefulAttempt>)> {
    let command = wall_command(message);
    let exec = tokio::time::timeout(timeout, session.exec(&command));
    tokio::pin!(exec);
    let mut open = true;

    loop {
        tokio::select! {
            result = &mut exec => {
                match result {
                    Ok(Ok(_)) => debug!("broadcast to `{vm}`: {message}"),
                    Ok(Err(err)) => warn!("failed to broadcast to `{vm}`: {err}"),
                    Err(_) => warn!("broadcast to `{vm}` timed out after {timeout:?}"),
                }
                return None;
            }
            request = receiver.recv(), if open => match request {
                Ok(GuestRequest::Notice(next)) => pending.push_back(next),
                Ok(GuestRequest::Shutdown { command, reply }) => {
                    debug!("broadcast to `{vm}` interrupted by shutdown request");
                    return Some((command, reply));
                }
                Err(_) => open = false,
            },
        }
    }
}

fn classify(
    result: Result<Result<super::session::ExecOutput, SessionError>, tokio::time::error::Elapsed>,
    elapsed: Duration,
) -> GracefulAttempt {
    match result {
        Ok(Ok(output)) => match output.exit_status {
            Some(0) | None => GracefulAttempt::Acknowledged { elapsed },
            Some(code) => GracefulAttempt::Failed {
                elapsed,
                reason: CooperativeFailureReason::Refused,
                detail: Some(refusal_detail(code, &output.output)),
            },
        },
        Ok(Err(err)) => GracefulAttempt::Failed {
            elapsed,
            reason: CooperativeFailureReason::ChannelError,
            detail: Some(err.to_string()),
        },
        Err(_) => GracefulAttempt::Failed {
            elapsed,
            reason: CooperativeFailureReason::TimeoutExpired,
            detail: None,
        },
    }
}

fn refusal_detail(code: i32, output: &str) -> String {
    let output = output.trim();
    if output.is_empty() {
        format!("exit status {code}")
    } else {
        format!("exit status {code}: {output}")
    }
}

/// Announcement for logged-in guest users about a pending power-off.
pub(crate) fn poweroff_notice(minutes: u64) -> String {
    let unit = if minutes == 1 { "minute" } else { "minutes" };
    format!("The system is going down for poweroff in {minutes} {unit}.")
}

pub(crate) fn wall_command(message: &str) -> String {
    format!("wall '{}'", message.replace('\'', r"'\''"))
}
