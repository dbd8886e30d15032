use httpmock::prelude::*;
use std::time::Duration;

mod common;

use gander::prelude::*;

const TODOS_PATH: &str = "/api/v1/todos";

pub async fn list_todos(user: &mut VirtualUser) -> TaskResult {
    let response = user.get(TODOS_PATH)?.send().await?;
    VirtualUser::check_status(&response, StatusCode::OK)
}

pub async fn quick(_user: &mut VirtualUser) -> TaskResult {
    tokio::time::sleep(Duration::from_millis(2)).await;
    Ok(())
}

pub async fn flaky(user: &mut VirtualUser) -> TaskResult {
    if user.iteration % 2 == 0 {
        Ok(())
    } else {
        Err(TaskError::custom("odd iteration"))
    }
}

pub async fn panics(user: &mut VirtualUser) -> TaskResult {
    if user.iteration == 1 {
        panic!("boom");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
// Outcomes of concurrently running scenarios are merged into one summary.
async fn test_scenarios_merge_into_one_summary() {
    let configuration = common::build_offline_configuration(vec![]);
    let summary = common::run_load_test(common::build_load_test(
        configuration,
        vec![
            Scenario::new("quick", task!(quick))
                .set_executor(ScenarioExecutor::fixed_iterations(3, 10)),
            Scenario::new("flaky", task!(flaky).set_name("flaky task"))
                .set_executor(ScenarioExecutor::shared_iterations(4, 20)),
            Scenario::new("ramp", task!(quick)).set_executor("ramping:2,200ms".parse().unwrap()),
        ],
    ))
    .await;

    let quick = summary.scenario("quick").unwrap();
    let flaky = summary.scenario("flaky").unwrap();
    let ramp = summary.scenario("ramp").unwrap();
    assert_eq!(quick.outcomes.counter, 30);
    assert_eq!(flaky.outcomes.counter, 20);
    assert_eq!(flaky.outcomes.fail_count, 10);
    assert_eq!(summary.labels["flaky task"].success_count, 10);
    assert!(ramp.outcomes.counter > 0);
    assert_eq!(
        summary.total_invocations(),
        quick.outcomes.counter + flaky.outcomes.counter + ramp.outcomes.counter
    );
    assert_eq!(summary.failure_count(), 10);
    assert!(!summary.canceled);

    assert_eq!(quick.executor, "fixed:3x10");
    assert_eq!(flaky.executor, "shared:4x20");
    assert!(ramp.executor.starts_with("ramping:"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
// A panicking task is recorded as a failure, and its user keeps going.
async fn test_panics_are_failures() {
    let configuration = common::build_offline_configuration(vec![]);
    let summary = common::run_load_test(common::build_load_test(
        configuration,
        vec![Scenario::new("panics", task!(panics))
            .set_executor(ScenarioExecutor::fixed_iterations(2, 3))],
    ))
    .await;

    assert_eq!(summary.total_invocations(), 6);
    assert_eq!(summary.failure_count(), 2);
    assert_eq!(summary.errors["panics: task panicked (boom)"], 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
// Invalid scenarios fail the whole load test before any user starts.
async fn test_invalid_scenarios_fail_before_start() {
    let server = MockServer::start_async().await;
    let todos = server
        .mock_async(|when, then| {
            when.method(GET).path(TODOS_PATH);
            then.status(200);
        })
        .await;

    let valid = || {
        Scenario::new("valid", task!(list_todos))
            .set_executor(ScenarioExecutor::fixed_iterations(1, 1))
    };
    let invalid = vec![
        Scenario::new("no users", task!(quick))
            .set_executor(ScenarioExecutor::fixed_iterations(0, 5)),
        Scenario::new("no stages", task!(quick))
            .set_executor(ScenarioExecutor::ramping(RampSchedule::new(vec![]))),
        Scenario::new("instant stage", task!(quick)).set_executor(ScenarioExecutor::ramping(
            RampSchedule::new(vec![Stage::new(Duration::ZERO, 5)]),
        )),
        Scenario::new("", task!(quick)),
    ];
    for scenario in invalid {
        let configuration = common::build_configuration(&server, vec![]);
        let error = common::build_load_test(configuration, vec![valid(), scenario])
            .execute()
            .await
            .unwrap_err();
        assert!(
            matches!(error, GanderError::InvalidScenario { .. }),
            "unexpected error: {}",
            error
        );
    }

    let mut backwards = valid();
    backwards.name = "backwards".to_string();
    backwards.wait_time = Some((Duration::from_secs(2), Duration::from_secs(1)));
    let configuration = common::build_configuration(&server, vec![]);
    let error = common::build_load_test(configuration, vec![valid(), backwards])
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(error, GanderError::InvalidWaitTime { .. }));

    // The valid scenario never ran.
    assert_eq!(todos.hits_async().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_configuration_errors() {
    let configuration = common::build_offline_configuration(vec![]);
    let error = common::build_load_test(configuration, vec![])
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(error, GanderError::NoScenarios { .. }));

    let configuration = common::build_offline_configuration(vec![]);
    let error = common::build_load_test(
        configuration,
        vec![
            Scenario::new("twice", task!(quick)),
            Scenario::new("twice", task!(quick)),
        ],
    )
    .execute()
    .await
    .unwrap_err();
    assert!(matches!(error, GanderError::DuplicateScenario { ref name } if name == "twice"));

    let configuration = common::build_offline_configuration(vec!["--host", "not a host"]);
    let error = common::build_load_test(configuration, vec![Scenario::new("one", task!(quick))])
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(error, GanderError::InvalidHost { .. }));

    for custom in [
        vec!["--verbose"],
        vec!["--run-time", "soon"],
        vec!["--timeout", "0"],
        vec!["--recorder-timeout", "0"],
        vec!["--outcome-format", "json"],
    ] {
        let configuration = common::build_offline_configuration(custom.clone());
        let error = common::build_load_test(configuration, vec![Scenario::new("one", task!(quick))])
            .execute()
            .await
            .unwrap_err();
        assert!(
            matches!(error, GanderError::InvalidOption { .. }),
            "{:?} returned {}",
            custom,
            error
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
// Only scenarios matching --scenarios run.
async fn test_scenario_filter() {
    let scenarios = || {
        vec![
            Scenario::new("planner", task!(quick))
                .set_executor(ScenarioExecutor::fixed_iterations(1, 2)),
            Scenario::new("Studier", task!(quick))
                .set_executor(ScenarioExecutor::fixed_iterations(1, 3)),
        ]
    };

    let configuration = common::build_offline_configuration(vec!["--scenarios", "plan*"]);
    let gander = common::build_load_test(configuration, scenarios());
    let studier = gander.monitor("Studier").unwrap();
    let summary = common::run_load_test(gander).await;
    assert_eq!(summary.total_invocations(), 2);
    assert!(summary.scenario("planner").is_some());
    assert!(summary.scenario("Studier").is_none());
    assert_eq!(studier.phase(), ScenarioPhase::Pending);

    let configuration = common::build_offline_configuration(vec!["--scenarios", "studier"]);
    let summary = common::run_load_test(common::build_load_test(configuration, scenarios())).await;
    assert_eq!(summary.total_invocations(), 3);

    let configuration = common::build_offline_configuration(vec!["--scenarios", "nobody"]);
    let error = common::build_load_test(configuration, scenarios())
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(error, GanderError::NoScenarios { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
// Every outcome is written to the outcome log, and the summary to the summary file.
async fn test_outcome_log_and_summary_file() {
    let outcome_log = "orchestrator-outcomes.csv";
    let summary_file = "orchestrator-summary.json";
    common::cleanup_files(vec![outcome_log, summary_file]);

    let configuration = common::build_offline_configuration(vec![
        "--outcome-log",
        outcome_log,
        "--outcome-format",
        "csv",
        "--summary-file",
        summary_file,
    ]);
    let summary = common::run_load_test(common::build_load_test(
        configuration,
        vec![Scenario::new("flaky", task!(flaky))
            .set_executor(ScenarioExecutor::fixed_iterations(3, 4))],
    ))
    .await;

    // One header row, then one row per outcome.
    assert_eq!(common::file_length(outcome_log), 13);

    let written: RunSummary =
        serde_json::from_str(&std::fs::read_to_string(summary_file).unwrap()).unwrap();
    assert_eq!(written.total_invocations(), summary.total_invocations());
    assert_eq!(written.failure_count(), 6);
    assert_eq!(written.scenario("flaky").unwrap().max_users, 3);

    common::cleanup_files(vec![outcome_log, summary_file]);
}
