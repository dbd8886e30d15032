//! Ramping scenarios: a controller loop resizes the pool of looping virtual users to
//! follow a [`RampSchedule`].

use futures::future::join_all;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{canceled, ScenarioContext, ScenarioPhase, ScenarioReport};
use crate::stage::{RampSchedule, StageAction, StageHistory};
use crate::user::{self, Iterations, UserCommand};
use crate::GanderError;

/// How often the controller resizes the pool of virtual users.
pub const RAMP_INTERVAL: Duration = Duration::from_millis(100);

// A virtual user that hasn't been told to stop.
struct RampingUser {
    sender: flume::Sender<UserCommand>,
    handle: JoinHandle<()>,
}

pub(super) async fn run_ramping(
    context: ScenarioContext,
    schedule: RampSchedule,
) -> Result<ScenarioReport, GanderError> {
    let name = context.scenario.name.clone();
    let monitor = context.monitor.clone();
    let started = monitor.start();
    info!(
        "{}: ramping over {} stages ({})",
        name,
        schedule.stages().len(),
        schedule
    );

    // Live users, oldest first.
    let mut live: Vec<RampingUser> = Vec::new();
    // Users told to stop that may still be finishing an invocation.
    let mut retired: Vec<JoinHandle<()>> = Vec::new();
    let mut stages: Vec<StageHistory> = Vec::new();
    let mut current_stage = None;
    let mut next_user = 0;
    let mut max_users = 0;

    let mut cancel = context.cancel.clone();
    let mut interval = tokio::time::interval(RAMP_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let was_canceled = loop {
        tokio::select! {
            _ = interval.tick() => {},
            _ = canceled(&mut cancel) => break true,
        }

        let elapsed = started.elapsed();
        let stage = match schedule.stage_at(elapsed) {
            Some(stage) => stage,
            None => break false,
        };
        if current_stage != Some(stage) {
            let action = schedule.stage_action(stage);
            info!(
                "{}: stage {} of {}, {:?} to {} users",
                name,
                stage + 1,
                schedule.stages().len(),
                action,
                schedule.stages()[stage].target
            );
            stages.push(StageHistory::step(action, live.len()));
            current_stage = Some(stage);
        }

        let target = schedule.users_at(elapsed);
        monitor.set_target(target);

        // Launch users until the target is reached.
        while live.len() < target {
            let (sender, receiver) = flume::unbounded();
            let handle = tokio::spawn(user::user_main(
                context.scenario.clone(),
                context.virtual_user(next_user),
                Iterations::Unbounded,
                context.recorder.clone(),
                monitor.clone(),
                receiver,
            ));
            live.push(RampingUser { sender, handle });
            next_user += 1;
        }

        // Retire the most recently launched users until the target is reached.
        while live.len() > target {
            if let Some(user) = live.pop() {
                retire(user, &mut retired);
            }
        }

        reap_retired(&mut retired).await?;
        max_users = max_users.max(live.len());
        monitor.set_users(live.len(), retired.len());
    };

    let action = if was_canceled {
        info!("{}: canceled, draining {} users", name, live.len());
        StageAction::Canceling
    } else {
        info!("{}: final stage ended, draining {} users", name, live.len());
        StageAction::Finished
    };
    stages.push(StageHistory::step(action, live.len()));

    monitor.set_phase(ScenarioPhase::Draining);
    monitor.set_target(0);
    while let Some(user) = live.pop() {
        retire(user, &mut retired);
    }
    monitor.set_users(0, retired.len());
    for result in join_all(retired).await {
        result?;
    }
    monitor.set_users(0, 0);
    monitor.set_phase(ScenarioPhase::Completed);

    Ok(context.report(stages, was_canceled, max_users))
}

// Tell a user to stop after its in-flight invocation, keeping its handle to await.
fn retire(user: RampingUser, retired: &mut Vec<JoinHandle<()>>) {
    // The user can only be gone already if it panicked outside of the task function.
    let _ = user.sender.send(UserCommand::Exit);
    retired.push(user.handle);
}

// Await retired users that have exited, keeping the rest.
async fn reap_retired(retired: &mut Vec<JoinHandle<()>>) -> Result<(), GanderError> {
    let mut running = Vec::with_capacity(retired.len());
    for handle in retired.drain(..) {
        if handle.is_finished() {
            handle.await?;
        } else {
            running.push(handle);
        }
    }
    *retired = running;
    Ok(())
}
