//! Scenario executors decide how many virtual users run a scenario's task, and for how
//! long.
//!
//! - [`ScenarioExecutor::FixedIterations`]: a fixed number of virtual users each run the
//!   task a fixed number of times, then stop.
//! - [`ScenarioExecutor::SharedIterations`]: a fixed number of virtual users share a pool
//!   of iterations, stopping once all have started.
//! - [`ScenarioExecutor::Ramping`]: the number of concurrently looping virtual users
//!   follows a [`RampSchedule`].
//!
//! Every scenario moves through the phases `Pending -> Running -> Draining -> Completed`,
//! observable while running through a [`ScenarioMonitor`]. Only ramping scenarios drain:
//! the others move straight from `Running` to `Completed`.

use chrono::prelude::*;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use url::Url;

use crate::recorder::RecorderHandle;
use crate::scenario::{Scenario, VirtualUser};
use crate::stage::{RampSchedule, StageHistory};
use crate::GanderError;

mod fixed;
mod ramping;

pub use ramping::RAMP_INTERVAL;

/// How virtual users are scheduled for a scenario.
///
/// # Example
/// ```rust
/// use gander::executor::ScenarioExecutor;
///
/// let planner: ScenarioExecutor = "shared:20x400".parse().unwrap();
/// assert_eq!(planner, ScenarioExecutor::shared_iterations(20, 400));
///
/// let studier: ScenarioExecutor = "ramping:1500,1m;7500,3m;0,2m".parse().unwrap();
/// assert_eq!(studier.to_string(), "ramping:1500,1m;7500,3m;0,2m");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScenarioExecutor {
    /// Each virtual user runs the task `iterations_per_user` times.
    FixedIterations {
        virtual_users: usize,
        iterations_per_user: usize,
    },
    /// The virtual users run the task `iterations` times in total.
    SharedIterations {
        virtual_users: usize,
        iterations: usize,
    },
    /// Looping virtual users, as many as the schedule asks for at any moment.
    Ramping(RampSchedule),
}
impl Default for ScenarioExecutor {
    fn default() -> Self {
        ScenarioExecutor::fixed_iterations(1, 1)
    }
}
impl ScenarioExecutor {
    pub fn fixed_iterations(virtual_users: usize, iterations_per_user: usize) -> Self {
        ScenarioExecutor::FixedIterations {
            virtual_users,
            iterations_per_user,
        }
    }

    pub fn shared_iterations(virtual_users: usize, iterations: usize) -> Self {
        ScenarioExecutor::SharedIterations {
            virtual_users,
            iterations,
        }
    }

    pub fn ramping(schedule: RampSchedule) -> Self {
        ScenarioExecutor::Ramping(schedule)
    }

    /// Reject configurations that can't be run.
    pub(crate) fn validate(&self, scenario: &str) -> Result<(), GanderError> {
        match self {
            ScenarioExecutor::FixedIterations { virtual_users, .. }
            | ScenarioExecutor::SharedIterations { virtual_users, .. } => {
                if *virtual_users == 0 {
                    return Err(GanderError::InvalidScenario {
                        scenario: scenario.to_string(),
                        detail: "virtual_users must be at least 1".to_string(),
                    });
                }
                Ok(())
            }
            ScenarioExecutor::Ramping(schedule) => schedule.validate(scenario),
        }
    }
}

/// Parse executors from `"fixed:{users}x{iterations}"`, `"shared:{users}x{iterations}"`
/// or `"ramping:{schedule}"`, see [`RampSchedule`] for the schedule format.
impl FromStr for ScenarioExecutor {
    type Err = GanderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |detail: &str| GanderError::InvalidOption {
            option: "scenario executor".to_string(),
            value: s.to_string(),
            detail: detail.to_string(),
        };
        let users_by_iterations = |value: &str| -> Result<(usize, usize), GanderError> {
            let (users, iterations) = value
                .split_once('x')
                .ok_or_else(|| invalid("expected \"{users}x{iterations}\""))?;
            let users = usize::from_str(users.trim())
                .map_err(|_| invalid("{users} must be an integer"))?;
            let iterations = usize::from_str(iterations.trim())
                .map_err(|_| invalid("{iterations} must be an integer"))?;
            Ok((users, iterations))
        };

        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| invalid("expected \"fixed:\", \"shared:\" or \"ramping:\" prefix"))?;
        match kind.trim().to_lowercase().as_str() {
            "fixed" => {
                let (users, iterations) = users_by_iterations(value)?;
                Ok(ScenarioExecutor::fixed_iterations(users, iterations))
            }
            "shared" => {
                let (users, iterations) = users_by_iterations(value)?;
                Ok(ScenarioExecutor::shared_iterations(users, iterations))
            }
            "ramping" => Ok(ScenarioExecutor::ramping(value.parse()?)),
            _ => Err(invalid(
                "expected \"fixed:\", \"shared:\" or \"ramping:\" prefix",
            )),
        }
    }
}

impl fmt::Display for ScenarioExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioExecutor::FixedIterations {
                virtual_users,
                iterations_per_user,
            } => write!(f, "fixed:{}x{}", virtual_users, iterations_per_user),
            ScenarioExecutor::SharedIterations {
                virtual_users,
                iterations,
            } => write!(f, "shared:{}x{}", virtual_users, iterations),
            ScenarioExecutor::Ramping(schedule) => write!(f, "ramping:{}", schedule),
        }
    }
}

/// The lifecycle of a scenario.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum_macros::Display,
)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum ScenarioPhase {
    /// Registered, not started.
    Pending = 0,
    /// Virtual users are running.
    Running = 1,
    /// No new virtual users start; running ones finish their in-flight invocation.
    Draining = 2,
    /// Every virtual user has exited.
    Completed = 3,
}
impl ScenarioPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ScenarioPhase::Pending,
            1 => ScenarioPhase::Running,
            2 => ScenarioPhase::Draining,
            _ => ScenarioPhase::Completed,
        }
    }
}

/// A timestamped phase change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub phase: ScenarioPhase,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct MonitorState {
    name: String,
    phase: AtomicU8,
    active_users: AtomicUsize,
    draining_users: AtomicUsize,
    target_users: AtomicUsize,
    invocations: AtomicUsize,
    started: OnceLock<Instant>,
    phases: Mutex<Vec<PhaseTransition>>,
}

/// A live view of a running scenario, from
/// [`GanderAttack::monitor`](../struct.GanderAttack.html#method.monitor).
///
/// Cloning is cheap; all clones observe the same scenario.
#[derive(Debug, Clone)]
pub struct ScenarioMonitor {
    state: Arc<MonitorState>,
}
impl ScenarioMonitor {
    pub(crate) fn new(name: &str) -> Self {
        let monitor = ScenarioMonitor {
            state: Arc::new(MonitorState {
                name: name.to_string(),
                phase: AtomicU8::new(ScenarioPhase::Pending as u8),
                active_users: AtomicUsize::new(0),
                draining_users: AtomicUsize::new(0),
                target_users: AtomicUsize::new(0),
                invocations: AtomicUsize::new(0),
                started: OnceLock::new(),
                phases: Mutex::new(Vec::new()),
            }),
        };
        monitor.push_transition(ScenarioPhase::Pending);
        monitor
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// The current phase.
    pub fn phase(&self) -> ScenarioPhase {
        ScenarioPhase::from_u8(self.state.phase.load(Ordering::SeqCst))
    }

    /// Virtual users running the task and not yet told to stop.
    pub fn active_users(&self) -> usize {
        self.state.active_users.load(Ordering::SeqCst)
    }

    /// Virtual users told to stop, still finishing their in-flight invocation.
    pub fn draining_users(&self) -> usize {
        self.state.draining_users.load(Ordering::SeqCst)
    }

    /// How many virtual users the scenario is currently aiming for.
    pub fn target_users(&self) -> usize {
        self.state.target_users.load(Ordering::SeqCst)
    }

    /// Completed task invocations so far.
    pub fn invocations(&self) -> usize {
        self.state.invocations.load(Ordering::SeqCst)
    }

    /// Time since the scenario started running, `None` while pending.
    pub fn elapsed(&self) -> Option<Duration> {
        self.state.started.get().map(|started| started.elapsed())
    }

    /// Every phase change so far.
    pub fn phases(&self) -> Vec<PhaseTransition> {
        self.state
            .phases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Start the scenario clock and move to `Running`.
    pub(crate) fn start(&self) -> Instant {
        let started = *self.state.started.get_or_init(Instant::now);
        self.set_phase(ScenarioPhase::Running);
        started
    }

    pub(crate) fn set_phase(&self, phase: ScenarioPhase) {
        let previous = ScenarioPhase::from_u8(self.state.phase.swap(phase as u8, Ordering::SeqCst));
        if previous == phase {
            return;
        }
        info!("{}: {} -> {}", self.state.name, previous, phase);
        self.push_transition(phase);
    }

    pub(crate) fn set_users(&self, active: usize, draining: usize) {
        self.state.active_users.store(active, Ordering::SeqCst);
        self.state.draining_users.store(draining, Ordering::SeqCst);
    }

    pub(crate) fn user_exited(&self) {
        // Saturate rather than wrap if counts were reset in the meantime.
        let _ = self
            .state
            .active_users
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                active.checked_sub(1)
            });
    }

    pub(crate) fn set_target(&self, target: usize) {
        self.state.target_users.store(target, Ordering::SeqCst);
    }

    pub(crate) fn record_invocation(&self) {
        self.state.invocations.fetch_add(1, Ordering::SeqCst);
    }

    fn push_transition(&self, phase: ScenarioPhase) {
        self.state
            .phases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(PhaseTransition {
                phase,
                timestamp: Utc::now(),
            });
    }
}

/// What a finished scenario reports back to the orchestrator.
#[derive(Debug, Clone)]
pub(crate) struct ScenarioReport {
    pub(crate) name: String,
    pub(crate) executor: String,
    pub(crate) phases: Vec<PhaseTransition>,
    pub(crate) stages: Vec<StageHistory>,
    pub(crate) canceled: bool,
    pub(crate) max_users: usize,
}

/// Everything a scenario needs to launch virtual users.
pub(crate) struct ScenarioContext {
    pub(crate) scenario: Arc<Scenario>,
    pub(crate) monitor: ScenarioMonitor,
    pub(crate) recorder: RecorderHandle,
    pub(crate) client: Client,
    pub(crate) base_url: Option<Url>,
    /// When the load test started.
    pub(crate) started: Instant,
    pub(crate) cancel: watch::Receiver<bool>,
}
impl ScenarioContext {
    pub(crate) fn virtual_user(&self, index: usize) -> VirtualUser {
        VirtualUser::new(
            &self.scenario.name,
            index,
            self.started,
            self.base_url.clone(),
            self.client.clone(),
        )
    }

    fn report(&self, stages: Vec<StageHistory>, canceled: bool, max_users: usize) -> ScenarioReport {
        ScenarioReport {
            name: self.scenario.name.clone(),
            executor: self.scenario.executor.to_string(),
            phases: self.monitor.phases(),
            stages,
            canceled,
            max_users,
        }
    }
}

/// Run a scenario to completion, or until canceled.
pub(crate) async fn run_scenario(context: ScenarioContext) -> Result<ScenarioReport, GanderError> {
    match context.scenario.executor.clone() {
        ScenarioExecutor::FixedIterations {
            virtual_users,
            iterations_per_user,
        } => {
            fixed::run_fixed(
                context,
                virtual_users,
                crate::user::Iterations::PerUser(iterations_per_user),
            )
            .await
        }
        ScenarioExecutor::SharedIterations {
            virtual_users,
            iterations,
        } => {
            fixed::run_fixed(
                context,
                virtual_users,
                crate::user::Iterations::shared(iterations),
            )
            .await
        }
        ScenarioExecutor::Ramping(schedule) => ramping::run_ramping(context, schedule).await,
    }
}

/// Resolves once cancellation is requested. Never resolves if nothing can cancel anymore.
pub(crate) async fn canceled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|canceled| *canceled).await.is_err() {
        futures::future::pending::<()>().await;
    }
}
