use chrono::Utc;
use futures::FutureExt;
use rand::Rng;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::executor::ScenarioMonitor;
use crate::recorder::{OutcomeRecord, RecorderHandle};
use crate::scenario::{Scenario, TaskError, VirtualUser};

/// Commands sent from a scenario executor to its virtual users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UserCommand {
    /// Stop after the in-flight invocation, or immediately if pausing.
    Exit,
}

/// How many iterations a virtual user runs.
#[derive(Debug, Clone)]
pub(crate) enum Iterations {
    /// Loop until told to exit.
    Unbounded,
    /// Run this many iterations.
    PerUser(usize),
    /// Claim iterations from a pool shared by every user of the scenario.
    Shared {
        claimed: Arc<AtomicUsize>,
        total: usize,
    },
}
impl Iterations {
    pub(crate) fn shared(total: usize) -> Self {
        Iterations::Shared {
            claimed: Arc::new(AtomicUsize::new(0)),
            total,
        }
    }

    /// Claim the next iteration, given how many this user has completed.
    fn claim(&self, completed: usize) -> Option<usize> {
        match self {
            Iterations::Unbounded => Some(completed),
            Iterations::PerUser(iterations) => (completed < *iterations).then_some(completed),
            Iterations::Shared { claimed, total } => {
                let iteration = claimed.fetch_add(1, Ordering::SeqCst);
                (iteration < *total).then_some(iteration)
            }
        }
    }

    /// Whether no further iteration can be claimed, without claiming one.
    fn exhausted(&self, completed: usize) -> bool {
        match self {
            Iterations::Unbounded => false,
            Iterations::PerUser(iterations) => completed >= *iterations,
            Iterations::Shared { claimed, total } => claimed.load(Ordering::SeqCst) >= *total,
        }
    }
}

/// The virtual user loop: invoke the task, record the outcome, pause, repeat until the
/// iterations run out or the executor says to exit.
pub(crate) async fn user_main(
    scenario: Arc<Scenario>,
    mut user: VirtualUser,
    iterations: Iterations,
    recorder: RecorderHandle,
    monitor: ScenarioMonitor,
    receiver: flume::Receiver<UserCommand>,
) {
    info!("launching user {} from {}...", user.user, scenario.name);

    let mut completed = 0;
    'launch_tasks: loop {
        // Never start a new invocation once told to exit.
        if received_exit(&receiver) {
            break;
        }
        let iteration = match iterations.claim(completed) {
            Some(iteration) => iteration,
            None => break,
        };
        user.iteration = iteration;
        debug!(
            "[user {}]: launching iteration {} from {}",
            user.user, iteration, scenario.name
        );

        let outcome = invoke_task_function(&scenario, &mut user).await;
        recorder.record(outcome);
        monitor.record_invocation();
        completed += 1;

        // If a wait time is defined, pause for a random time before the next invocation.
        if let Some((min_wait, max_wait)) = scenario.wait_time {
            if iterations.exhausted(completed) {
                break;
            }
            let wait_time = rand::rng().random_range(min_wait..=max_wait);
            debug!(
                "user {} from {} sleeping {:?} ...",
                user.user, scenario.name, wait_time
            );
            tokio::select! {
                _ = tokio::time::sleep(wait_time) => {},
                // Exit immediately if a message is received, or the executor is gone.
                _ = receiver.recv_async() => break 'launch_tasks,
            }
        } else {
            // A task that fails before its first await never suspends, so give the
            // executor's controller and timers a chance to run.
            tokio::task::yield_now().await;
        }
    }

    info!(
        "exiting user {} from {} after {} iterations...",
        user.user, scenario.name, completed
    );
}

// Determine if the executor has sent a UserCommand::Exit message, or gone away.
fn received_exit(receiver: &flume::Receiver<UserCommand>) -> bool {
    match receiver.try_recv() {
        Ok(UserCommand::Exit) => true,
        Err(flume::TryRecvError::Empty) => false,
        Err(flume::TryRecvError::Disconnected) => true,
    }
}

// Invoke the task function once, turning the result (or a panic) into an outcome.
async fn invoke_task_function(scenario: &Scenario, user: &mut VirtualUser) -> OutcomeRecord {
    let timestamp = Utc::now();
    let elapsed = user.started.elapsed();
    let started = Instant::now();

    let result = AssertUnwindSafe((scenario.task.function)(user))
        .catch_unwind()
        .await;
    let duration = started.elapsed();

    let error = match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            debug!(
                "[user {}]: iteration {} of {} failed: {}",
                user.user, user.iteration, scenario.name, e
            );
            Some(e.to_string())
        }
        Err(panic) => {
            let e = TaskError::Panicked {
                detail: panic_detail(panic),
            };
            warn!(
                "[user {}]: iteration {} of {} panicked: {}",
                user.user, user.iteration, scenario.name, e
            );
            Some(e.to_string())
        }
    };

    OutcomeRecord {
        timestamp,
        elapsed,
        duration,
        success: error.is_none(),
        label: user
            .take_label()
            .unwrap_or_else(|| scenario.label().to_string()),
        scenario: scenario.name.clone(),
        user: user.user,
        iteration: user.iteration,
        error,
    }
}

fn panic_detail(panic: Box<dyn Any + Send>) -> String {
    if let Some(detail) = panic.downcast_ref::<&str>() {
        detail.to_string()
    } else if let Some(detail) = panic.downcast_ref::<String>() {
        detail.clone()
    } else {
        "unknown panic".to_string()
    }
}
