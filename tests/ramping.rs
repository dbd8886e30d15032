use serial_test::serial;
use std::time::{Duration, Instant};

mod common;

use gander::prelude::*;

pub async fn study(_user: &mut VirtualUser) -> TaskResult {
    tokio::time::sleep(Duration::from_millis(30)).await;
    Ok(())
}

// Fails before its first await: no host is configured.
pub async fn fail_without_host(user: &mut VirtualUser) -> TaskResult {
    let _response = user.get("/api/v1/todos")?.send().await?;
    Ok(())
}

// The highest target the controller could be following at `elapsed`: it resizes the
// pool every RAMP_INTERVAL, and the scenario starts slightly after the test's clock.
fn recent_target(schedule: &RampSchedule, elapsed: Duration) -> f64 {
    let mut highest = schedule.target_at(elapsed);
    let mut step = Duration::ZERO;
    while step <= Duration::from_millis(300) {
        highest = highest.max(schedule.target_at(elapsed.saturating_sub(step)));
        step += Duration::from_millis(10);
    }
    highest
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
// Sample the live pool while ramping up, holding and ramping down: it never exceeds the
// interpolated target.
async fn test_ramping_follows_schedule() {
    let schedule: RampSchedule = "10,600ms;10,400ms;0,600ms".parse().unwrap();
    let configuration = common::build_offline_configuration(vec![]);
    let gander = common::build_load_test(
        configuration,
        vec![Scenario::new("studier", task!(study))
            .set_executor(ScenarioExecutor::ramping(schedule.clone()))],
    );
    let monitor = gander.monitor("studier").unwrap();
    assert_eq!(monitor.phase(), ScenarioPhase::Pending);

    let started = Instant::now();
    let sample = async {
        let mut samples = Vec::new();
        while monitor.phase() != ScenarioPhase::Completed {
            samples.push((started.elapsed(), monitor.active_users()));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        samples
    };
    let (summary, samples) = tokio::join!(common::run_load_test(gander), sample);

    assert!(samples.len() > 20);
    let mut peak = 0;
    for (elapsed, active) in samples {
        let ceiling = recent_target(&schedule, elapsed).ceil() as usize + 1;
        assert!(
            active <= ceiling,
            "{} users active at {:?}, expected at most {}",
            active,
            elapsed,
            ceiling
        );
        peak = peak.max(active);
    }
    // The hold stage was reached.
    assert_eq!(peak, 10);

    let studier = summary.scenario("studier").unwrap();
    assert!(!studier.canceled);
    assert_eq!(studier.max_users, 10);
    assert!(summary.total_invocations() > 0);
    assert_eq!(summary.failure_count(), 0);

    let phases: Vec<ScenarioPhase> = studier.phases.iter().map(|t| t.phase).collect();
    assert_eq!(
        phases,
        vec![
            ScenarioPhase::Pending,
            ScenarioPhase::Running,
            ScenarioPhase::Draining,
            ScenarioPhase::Completed
        ]
    );
    assert_eq!(monitor.active_users(), 0);
    assert_eq!(monitor.draining_users(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
// A run time shorter than the schedule drains the scenario: no invocation starts after
// the cap, and the scenario stops within one invocation.
async fn test_run_time_cancels_ramping() {
    let configuration = common::build_offline_configuration(vec!["--run-time", "1"]);
    let gander = common::build_load_test(
        configuration,
        vec![Scenario::new("studier", task!(study))
            .set_executor("ramping:5,200ms;5,1m".parse().unwrap())],
    );

    let started = Instant::now();
    let summary = common::run_load_test(gander).await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_millis(1_500), "took {:?}", elapsed);
    assert!(summary.canceled);

    let studier = summary.scenario("studier").unwrap();
    assert!(studier.canceled);
    assert_eq!(studier.max_users, 5);
    assert_eq!(
        studier.phases.last().map(|t| t.phase),
        Some(ScenarioPhase::Completed)
    );
    assert!(studier
        .phases
        .iter()
        .any(|t| t.phase == ScenarioPhase::Draining));

    let last_started = summary.last_started.unwrap();
    assert!(
        last_started < Duration::from_millis(1_100),
        "last invocation started at {:?}",
        last_started
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
// Step ramps jump straight to each stage's target.
async fn test_step_ramp() {
    let schedule = RampSchedule::new(vec![
        Stage::new(Duration::from_millis(400), 6),
        Stage::new(Duration::from_millis(400), 2),
    ])
    .set_style(RampStyle::Step);
    let configuration = common::build_offline_configuration(vec![]);
    let gander = common::build_load_test(
        configuration,
        vec![Scenario::new("stepper", task!(study))
            .set_executor(ScenarioExecutor::ramping(schedule))],
    );
    let monitor = gander.monitor("stepper").unwrap();

    let sample = async {
        // Wait for the first stage to start.
        while monitor.phase() == ScenarioPhase::Pending {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        let first = monitor.active_users();
        tokio::time::sleep(Duration::from_millis(400)).await;
        let second = monitor.active_users();
        (first, second)
    };
    let (summary, (first, second)) = tokio::join!(common::run_load_test(gander), sample);

    assert_eq!(first, 6);
    assert_eq!(second, 2);
    let stepper = summary.scenario("stepper").unwrap();
    assert_eq!(stepper.max_users, 6);
    assert_eq!(stepper.stages.first().map(|s| s.users), Some(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
// Users whose task fails without ever suspending still leave room for the controller
// and the run time: the scenario is canceled and completes normally.
async fn test_failing_users_respect_run_time() {
    let configuration = common::build_offline_configuration(vec!["--run-time", "500ms"]);
    let gander = common::build_load_test(
        configuration,
        vec![Scenario::new("spinner", task!(fail_without_host))
            .set_executor("ramping:2,100ms;2,1m".parse().unwrap())],
    );

    let started = Instant::now();
    let summary = common::run_load_test(gander).await;
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
    assert!(summary.canceled);
    assert!(summary.total_invocations() > 0);
    assert_eq!(summary.success_count(), 0);
    assert_eq!(summary.failure_count(), summary.total_invocations());

    let spinner = summary.scenario("spinner").unwrap();
    assert_eq!(spinner.max_users, 2);
    assert_eq!(
        spinner.phases.last().map(|t| t.phase),
        Some(ScenarioPhase::Completed)
    );
}
