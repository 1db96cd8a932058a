mod common;

use std::time::Duration;

use regex::Regex;
use tokio::task::LocalSet;
use tokio::time::sleep;

use vmstop::core::{DelayedShutdown, Event};

use common::{FakeBackend, FakeSession, Guest, Journal, VM, coordinator, recording_mounts, settings};

const MINUTE: Duration = Duration::from_secs(60);

fn announced_minutes(notices: &[String]) -> Vec<u64> {
    let pattern =
        Regex::new(r"^wall 'The system is going down for poweroff in (\d+) minutes?\.'$")
            .expect("valid regex");
    notices
        .iter()
        .map(|notice| {
            let captures = pattern
                .captures(notice)
                .unwrap_or_else(|| panic!("unexpected notice: {notice}"));
            captures[1].parse().expect("minutes")
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn countdown_announces_interval_and_final_minutes() {
    LocalSet::new()
        .run_until(async {
            let journal = Journal::default();
            let (mut shutdown, events) =
                coordinator(&journal, FakeSession::boxed(&journal, Guest::Accepts));

            shutdown.start(MINUTE * 11);
            shutdown.finished().await.expect("shutdown succeeds");

            assert_eq!(
                announced_minutes(&journal.notices()),
                vec![11, 10, 5, 4, 3, 2, 1]
            );
            let warned: Vec<u64> = events
                .borrow()
                .iter()
                .filter_map(|event| match event {
                    Event::GuestWarned { minutes, .. } => Some(*minutes),
                    _ => None,
                })
                .collect();
            assert_eq!(warned, vec![11, 10, 5, 4, 3, 2, 1]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn short_delays_announce_a_single_minute() {
    LocalSet::new()
        .run_until(async {
            let journal = Journal::default();
            let (mut shutdown, _events) =
                coordinator(&journal, FakeSession::boxed(&journal, Guest::Accepts));

            shutdown.start(Duration::from_secs(20));
            shutdown.finished().await.expect("shutdown succeeds");

            assert_eq!(
                journal.notices(),
                vec!["wall 'The system is going down for poweroff in 1 minute.'".to_string()]
            );
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn dropping_an_armed_countdown_tells_the_guest() {
    LocalSet::new()
        .run_until(async {
            let journal = Journal::default();
            let (mut shutdown, events) =
                coordinator(&journal, FakeSession::boxed(&journal, Guest::Accepts));

            shutdown.start(MINUTE * 10);
            sleep(Duration::from_secs(90)).await;
            drop(shutdown);

            // Let the guest worker drain its queue.
            sleep(Duration::from_secs(1)).await;
            let notices = journal.notices();
            assert_eq!(
                notices.last().map(String::as_str),
                Some("wall 'The system shutdown has been cancelled.'")
            );
            assert_eq!(announced_minutes(&notices[..notices.len() - 1]), vec![10]);
            assert!(matches!(
                events.borrow().last(),
                Some(Event::CountdownCancelled { vm, .. }) if vm == VM
            ));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn disabled_warnings_stay_silent() {
    LocalSet::new()
        .run_until(async {
            let journal = Journal::default();
            let mut shutdown = DelayedShutdown::new(
                VM,
                FakeBackend::new(&journal),
                FakeSession::boxed(&journal, Guest::Accepts),
                recording_mounts(&journal),
                settings().with_warn_guests(false),
            );

            shutdown.start(MINUTE * 6);
            sleep(Duration::from_secs(30)).await;
            drop(shutdown);
            sleep(Duration::from_secs(1)).await;

            assert!(journal.notices().is_empty());
            assert!(journal.steps().is_empty());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn rearming_announces_the_new_deadline() {
    LocalSet::new()
        .run_until(async {
            let journal = Journal::default();
            let (mut shutdown, _events) =
                coordinator(&journal, FakeSession::boxed(&journal, Guest::Accepts));

            shutdown.start(MINUTE * 3);
            sleep(Duration::from_secs(10)).await;
            shutdown.start(MINUTE * 15);
            sleep(Duration::from_secs(1)).await;

            assert_eq!(announced_minutes(&journal.notices()), vec![3, 15]);
        })
        .await;
}
