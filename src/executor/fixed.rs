//! Fixed and shared iteration scenarios: launch every virtual user at once, and wait for
//! them to run out of iterations.

use futures::future::join_all;

use super::{canceled, ScenarioContext, ScenarioPhase, ScenarioReport};
use crate::user::{self, Iterations, UserCommand};
use crate::GanderError;

pub(super) async fn run_fixed(
    context: ScenarioContext,
    virtual_users: usize,
    iterations: Iterations,
) -> Result<ScenarioReport, GanderError> {
    let name = context.scenario.name.clone();
    let monitor = context.monitor.clone();
    monitor.set_target(virtual_users);
    monitor.start();
    info!(
        "{}: launching {} users ({})",
        name, virtual_users, context.scenario.executor
    );

    // Set before launching, users with no iteration to run decrement it at once.
    monitor.set_users(virtual_users, 0);

    let mut senders = Vec::with_capacity(virtual_users);
    let mut users = Vec::with_capacity(virtual_users);
    for index in 0..virtual_users {
        let (sender, receiver) = flume::unbounded();
        senders.push(sender);
        let user_monitor = monitor.clone();
        let user = user::user_main(
            context.scenario.clone(),
            context.virtual_user(index),
            iterations.clone(),
            context.recorder.clone(),
            monitor.clone(),
            receiver,
        );
        users.push(tokio::spawn(async move {
            user.await;
            user_monitor.user_exited();
        }));
    }

    let all_users = join_all(users);
    tokio::pin!(all_users);
    let mut cancel = context.cancel.clone();
    let (results, was_canceled) = tokio::select! {
        results = &mut all_users => (results, false),
        _ = canceled(&mut cancel) => {
            info!("{}: canceled, stopping users after their current iteration", name);
            for sender in &senders {
                // The user may already have finished.
                let _ = sender.send(UserCommand::Exit);
            }
            (all_users.await, true)
        }
    };
    for result in results {
        result?;
    }

    monitor.set_users(0, 0);
    monitor.set_phase(ScenarioPhase::Completed);
    Ok(context.report(Vec::new(), was_canceled, virtual_users))
}
