//! Delayed shutdown of a single VM.
//!
//! A [`DelayedShutdown`] arms a countdown on the current `LocalSet`; when it
//! elapses the shutdown sequence runs exactly once and every [`Finished`]
//! future obtained from the coordinator resolves with the resulting
//! [`ShutdownReport`].
//!
//! Background tasks hold only a weak reference to the coordinator's state, so
//! dropping the coordinator never leaves a callback pointing at freed state.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use log::{debug, info};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ShutdownSettings;
use crate::error::{Error, Result};

use super::backend::VmBackend;
use super::countdown::{
    Arming, Countdown, CountdownState, Tick, announced_minutes, warning_due, whole_seconds,
};
use super::events::Event;
use super::guest::{CANCELLED_NOTICE, GuestLink, poweroff_notice};
use super::mounts::StopMounts;
use super::outcome::ShutdownReport;
use super::reporter::Reporter;
use super::sequencer::{ShutdownSequence, duration_to_millis};
use super::session::ShellSession;

/// Coordinates a delayed, guest-cooperative shutdown of one VM.
///
/// All methods must be called from within a `tokio::task::LocalSet`; the
/// countdown and the guest session run as local tasks on it.
pub struct DelayedShutdown {
    inner: Rc<Inner>,
    countdown_task: Option<JoinHandle<()>>,
}

struct Inner {
    vm: String,
    settings: ShutdownSettings,
    countdown: RefCell<Countdown>,
    collaborators: RefCell<Option<Collaborators>>,
    guest: RefCell<GuestLink>,
    reporter: RefCell<Box<dyn Reporter>>,
    completion: RefCell<Completion>,
}

struct Collaborators {
    backend: Rc<dyn VmBackend>,
    stop_mounts: StopMounts,
}

enum Completion {
    Pending(Vec<oneshot::Sender<ShutdownReport>>),
    Done(ShutdownReport),
}

impl DelayedShutdown {
    /// Bind a coordinator to one VM.
    ///
    /// `session` is optional; without one the guest is never contacted and the
    /// backend always powers the VM off.
    pub fn new(
        vm: impl Into<String>,
        backend: Rc<dyn VmBackend>,
        session: Option<Box<dyn ShellSession>>,
        stop_mounts: StopMounts,
        settings: ShutdownSettings,
    ) -> Self {
        let countdown = Countdown::new(settings.tick());
        let inner = Inner {
            vm: vm.into(),
            settings,
            countdown: RefCell::new(countdown),
            collaborators: RefCell::new(Some(Collaborators {
                backend,
                stop_mounts,
            })),
            guest: RefCell::new(GuestLink::new(session)),
            reporter: RefCell::new(Box::new(())),
            completion: RefCell::new(Completion::Pending(Vec::new())),
        };

        Self {
            inner: Rc::new(inner),
            countdown_task: None,
        }
    }

    pub fn with_reporter<R: Reporter + 'static>(self, reporter: R) -> Self {
        *self.inner.reporter.borrow_mut() = Box::new(reporter);
        self
    }

    pub fn vm(&self) -> &str {
        &self.inner.vm
    }

    pub fn state(&self) -> CountdownState {
        self.inner.countdown.borrow().state()
    }

    /// Delay requested by the most recent accepted `start`.
    pub fn requested_delay(&self) -> Duration {
        self.inner.countdown.borrow().requested()
    }

    /// Arm the countdown, replacing any countdown that is still running.
    ///
    /// A zero delay runs the shutdown sequence on the next turn of the event
    /// loop. Once the sequence has begun further calls are ignored.
    ///
    /// # Panics
    ///
    /// Panics when called outside a `tokio::task::LocalSet`.
    pub fn start(&mut self, delay: Duration) -> Arming {
        let arming = self.inner.countdown.borrow_mut().arm(delay);
        match arming {
            Arming::Ignored => {
                info!(
                    "ignoring new countdown for `{}`: shutdown already {}",
                    self.inner.vm,
                    self.state().as_str()
                );
                return arming;
            }
            Arming::Rearmed {
                superseded_remaining,
            } => {
                if let Some(task) = self.countdown_task.take() {
                    task.abort();
                }
                debug!(
                    "re-arming `{}` with {:?} left on the previous countdown",
                    self.inner.vm, superseded_remaining
                );
            }
            Arming::Armed => {}
        }

        info!("shutdown of `{}` armed for {delay:?}", self.inner.vm);
        self.inner.report(Event::ShutdownArmed {
            vm: self.inner.vm.clone(),
            delay_ms: duration_to_millis(delay),
            rearmed: matches!(arming, Arming::Rearmed { .. }),
        });

        if !delay.is_zero() {
            self.inner.warn_guest(announced_minutes(delay));
        }

        let epoch = self.inner.countdown.borrow().epoch();
        let weak = Rc::downgrade(&self.inner);
        self.countdown_task = Some(tokio::task::spawn_local(count_down(weak, epoch)));
        arming
    }

    /// Time left before the shutdown sequence starts; zero unless armed.
    pub fn get_time_remaining(&self) -> Duration {
        self.inner.countdown.borrow().remaining()
    }

    /// Remaining time rounded up to whole seconds.
    pub fn get_time_remaining_secs(&self) -> u64 {
        whole_seconds(self.get_time_remaining())
    }

    /// Future resolving once the shutdown sequence completes.
    ///
    /// A backend failure is the only error a completed sequence produces: it
    /// resolves to [`Error::PowerOffFailed`] when the VM could not be powered
    /// off, and to `Ok` with the report on every other path.
    ///
    /// Dropping the coordinator before completion never fires a completion
    /// notification. Instead of leaving waiters pending forever, their futures
    /// resolve to [`Error::Abandoned`]. That is not a shutdown outcome: when the
    /// drop happened mid-shutdown the sequence still runs to the end detached,
    /// but its result is not delivered.
    pub fn finished(&self) -> Finished {
        let vm = self.inner.vm.clone();
        let mut completion = self.inner.completion.borrow_mut();
        let state = match &mut *completion {
            Completion::Pending(listeners) => {
                let (sender, receiver) = oneshot::channel();
                listeners.push(sender);
                FinishedState::Waiting(receiver)
            }
            Completion::Done(report) => FinishedState::Ready(Some(report.clone())),
        };
        Finished { vm, state }
    }
}

impl Drop for DelayedShutdown {
    fn drop(&mut self) {
        match self.state() {
            CountdownState::Armed => {
                if let Some(task) = self.countdown_task.take() {
                    task.abort();
                }
                let remaining = self.inner.countdown.borrow_mut().disarm();
                if let Some(remaining) = remaining {
                    info!("shutdown of `{}` cancelled", self.inner.vm);
                    self.inner.report(Event::CountdownCancelled {
                        vm: self.inner.vm.clone(),
                        remaining_ms: duration_to_millis(remaining),
                    });
                    if self.inner.settings.warn_guests {
                        if let Some(channel) = self.inner.guest.borrow().channel() {
                            channel.notify(CANCELLED_NOTICE);
                        }
                    }
                }
            }
            CountdownState::ShuttingDown => {
                // The sequence owns its collaborators and keeps running detached.
                debug!(
                    "coordinator for `{}` dropped mid-shutdown; detaching",
                    self.inner.vm
                );
                self.countdown_task.take();
            }
            CountdownState::Idle | CountdownState::Finished => {}
        }
    }
}

impl fmt::Debug for DelayedShutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedShutdown")
            .field("vm", &self.inner.vm)
            .field("state", &self.state())
            .field("remaining", &self.get_time_remaining())
            .finish()
    }
}

impl Inner {
    fn report(&self, event: Event) {
        self.reporter.borrow_mut().report(event);
    }

    /// Queue a power-off notice for logged-in guest users.
    fn warn_guest(&self, minutes: u64) {
        if !self.settings.warn_guests {
            return;
        }
        let mut guest = self.guest.borrow_mut();
        let Some(channel) = guest.activate(&self.vm, self.settings.guest_command_timeout())
        else {
            return;
        };
        channel.notify(poweroff_notice(minutes));
        drop(guest);
        self.report(Event::GuestWarned {
            vm: self.vm.clone(),
            minutes,
        });
    }

    fn begin_shutdown(&self, epoch: u64) -> Option<ShutdownSequence> {
        if !self.countdown.borrow_mut().begin_shutdown(epoch) {
            return None;
        }
        let Collaborators {
            backend,
            stop_mounts,
        } = self.collaborators.borrow_mut().take()?;

        Some(ShutdownSequence {
            vm: self.vm.clone(),
            backend,
            stop_mounts,
            guest: self.guest.borrow_mut().take(),
            guest_command: self.settings.guest_command.clone(),
            guest_timeout: self.settings.guest_command_timeout(),
        })
    }

    fn finish(&self, report: ShutdownReport) {
        self.countdown.borrow_mut().finish();
        let previous = std::mem::replace(
            &mut *self.completion.borrow_mut(),
            Completion::Done(report.clone()),
        );
        if let Completion::Pending(listeners) = previous {
            for listener in listeners {
                let _ = listener.send(report.clone());
            }
        }
    }
}

/// Tick chain for one armed countdown. Exits quietly when the coordinator is
/// gone or the countdown was superseded.
async fn count_down(inner: Weak<Inner>, epoch: u64) {
    let Some(strong) = inner.upgrade() else {
        return;
    };
    let (first_wait, tick) = {
        let countdown = strong.countdown.borrow();
        (countdown.first_wait(), countdown.tick_length())
    };
    drop(strong);

    let mut deadline = Instant::now() + first_wait;
    let mut elapsed = first_wait;
    loop {
        tokio::time::sleep_until(deadline).await;
        let Some(strong) = inner.upgrade() else {
            return;
        };
        let outcome = strong.countdown.borrow_mut().on_tick(epoch, elapsed);
        match outcome {
            Tick::Stale => return,
            Tick::Elapsed => break,
            Tick::Counting {
                previous,
                remaining,
            } => {
                let settings = &strong.settings;
                if let Some(minutes) = warning_due(
                    previous,
                    remaining,
                    settings.warning_interval_mins,
                    settings.final_warning_mins,
                ) {
                    strong.warn_guest(minutes);
                }
            }
        }
        deadline += tick;
        elapsed = tick;
    }

    let sequence = match inner.upgrade() {
        Some(strong) => strong.begin_shutdown(epoch),
        None => None,
    };
    let Some(sequence) = sequence else {
        return;
    };

    let mut emit = |event: Event| {
        if let Some(strong) = inner.upgrade() {
            strong.report(event);
        }
    };
    let report = sequence.run(&mut emit).await;

    match inner.upgrade() {
        Some(strong) => strong.finish(report),
        None => debug!("shutdown of `{}` finished after its coordinator was dropped", report.vm),
    }
}

/// Completion future returned by [`DelayedShutdown::finished`].
#[must_use = "futures do nothing unless awaited"]
pub struct Finished {
    vm: String,
    state: FinishedState,
}

enum FinishedState {
    Ready(Option<ShutdownReport>),
    Waiting(oneshot::Receiver<ShutdownReport>),
}

impl Future for Finished {
    type Output = Result<ShutdownReport>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            FinishedState::Ready(report) => Poll::Ready(match report.take() {
                Some(report) => report.into_result(),
                None => Err(Error::Abandoned {
                    vm: this.vm.clone(),
                }),
            }),
            FinishedState::Waiting(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(report)) => Poll::Ready(report.into_result()),
                Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Abandoned {
                    vm: this.vm.clone(),
                })),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
