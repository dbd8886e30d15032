pub use crate::config::GanderConfiguration;
pub use crate::executor::{ScenarioExecutor, ScenarioMonitor, ScenarioPhase};
pub use crate::metrics::RunSummary;
pub use crate::scenario::{Scenario, Task, TaskError, TaskFunction, TaskResult, VirtualUser};
pub use crate::stage::{RampSchedule, RampStyle, Stage};
pub use crate::{task, GanderAttack, GanderError};
pub use http::StatusCode;
