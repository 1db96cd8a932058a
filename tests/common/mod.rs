#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use vmstop::ShutdownSettings;
use vmstop::core::{
    BackendError, DelayedShutdown, Event, ExecOutput, MountError, SessionError, ShellSession,
    StopMounts, VmBackend,
};

pub const VM: &str = "devbox";
pub const GUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    MountsStopped,
    Notice(String),
    GuestCommand(String),
    PowerOff,
    Finished,
}

/// Timestamped record of every collaborator call, shared by the fakes.
#[derive(Debug, Clone, Default)]
pub struct Journal(Rc<RefCell<Vec<(Instant, Step)>>>);

impl Journal {
    pub fn record(&self, step: Step) {
        self.0.borrow_mut().push((Instant::now(), step));
    }

    pub fn steps(&self) -> Vec<Step> {
        self.0.borrow().iter().map(|(_, step)| step.clone()).collect()
    }

    pub fn count(&self, wanted: &Step) -> usize {
        self.0.borrow().iter().filter(|(_, step)| step == wanted).count()
    }

    pub fn count_matching(&self, predicate: impl Fn(&Step) -> bool) -> usize {
        self.0.borrow().iter().filter(|(_, step)| predicate(step)).count()
    }

    /// When the first step matching `predicate` happened.
    pub fn first_at(&self, predicate: impl Fn(&Step) -> bool) -> Option<Instant> {
        self.0
            .borrow()
            .iter()
            .find(|(_, step)| predicate(step))
            .map(|(at, _)| *at)
    }

    /// Steps other than guest notices, in the order they happened.
    pub fn sequence(&self) -> Vec<Step> {
        self.steps()
            .into_iter()
            .filter(|step| !matches!(step, Step::Notice(_)))
            .collect()
    }

    pub fn notices(&self) -> Vec<String> {
        self.steps()
            .into_iter()
            .filter_map(|step| match step {
                Step::Notice(command) => Some(command),
                _ => None,
            })
            .collect()
    }
}

pub struct FakeBackend {
    journal: Journal,
    fail: bool,
}

impl FakeBackend {
    pub fn new(journal: &Journal) -> Rc<Self> {
        Rc::new(Self {
            journal: journal.clone(),
            fail: false,
        })
    }

    pub fn failing(journal: &Journal) -> Rc<Self> {
        Rc::new(Self {
            journal: journal.clone(),
            fail: true,
        })
    }
}

#[async_trait(?Send)]
impl VmBackend for FakeBackend {
    async fn power_off(&self) -> Result<(), BackendError> {
        self.journal.record(Step::PowerOff);
        if self.fail {
            Err(BackendError::failed("hypervisor rejected power-off"))
        } else {
            Ok(())
        }
    }
}

/// How the fake guest answers the shutdown command. `wall` notices always succeed.
#[derive(Debug, Clone)]
pub enum Guest {
    Accepts,
    AcceptsAfter(Duration),
    Hangs,
    Refuses,
    Breaks,
}

pub struct FakeSession {
    journal: Journal,
    guest: Guest,
    notice_delay: Duration,
}

impl FakeSession {
    pub fn boxed(journal: &Journal, guest: Guest) -> Option<Box<dyn ShellSession>> {
        Self::with_notice_delay(journal, guest, Duration::ZERO)
    }

    /// A session whose `wall` broadcasts take `notice_delay` to return.
    pub fn with_notice_delay(
        journal: &Journal,
        guest: Guest,
        notice_delay: Duration,
    ) -> Option<Box<dyn ShellSession>> {
        Some(Box::new(Self {
            journal: journal.clone(),
            guest,
            notice_delay,
        }))
    }
}

#[async_trait(?Send)]
impl ShellSession for FakeSession {
    async fn exec(&mut self, command: &str) -> Result<ExecOutput, SessionError> {
        if command.starts_with("wall ") {
            self.journal.record(Step::Notice(command.to_string()));
            if !self.notice_delay.is_zero() {
                tokio::time::sleep(self.notice_delay).await;
            }
            return Ok(ExecOutput::exited(0, ""));
        }

        self.journal.record(Step::GuestCommand(command.to_string()));
        match self.guest {
            Guest::Accepts => Ok(ExecOutput::disconnected("")),
            Guest::AcceptsAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(ExecOutput::disconnected(""))
            }
            Guest::Hangs => std::future::pending().await,
            Guest::Refuses => Ok(ExecOutput::exited(1, "sudo: a password is required")),
            Guest::Breaks => Err(SessionError::Transport("broken pipe".into())),
        }
    }
}

pub fn recording_mounts(journal: &Journal) -> StopMounts {
    let journal = journal.clone();
    Box::new(move |_vm: &str| -> Result<(), MountError> {
        journal.record(Step::MountsStopped);
        Ok(())
    })
}

pub fn failing_mounts(journal: &Journal) -> StopMounts {
    let journal = journal.clone();
    Box::new(move |vm: &str| -> Result<(), MountError> {
        journal.record(Step::MountsStopped);
        Err(MountError::Unmount {
            target: format!("/srv/{vm}"),
            message: "target is busy".into(),
        })
    })
}

pub fn settings() -> ShutdownSettings {
    ShutdownSettings::default().with_guest_command_timeout(GUEST_TIMEOUT)
}

pub fn coordinator(
    journal: &Journal,
    session: Option<Box<dyn ShellSession>>,
) -> (DelayedShutdown, Rc<RefCell<Vec<Event>>>) {
    let events = Rc::new(RefCell::new(Vec::new()));
    let shutdown = DelayedShutdown::new(
        VM,
        FakeBackend::new(journal),
        session,
        recording_mounts(journal),
        settings(),
    )
    .with_reporter(events.clone());
    (shutdown, events)
}
