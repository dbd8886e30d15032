//! Scenarios, tasks and the virtual users that run them.
//!
//! A [`Scenario`] pairs a single [`Task`] with a
//! [`ScenarioExecutor`](../executor/enum.ScenarioExecutor.html) deciding how many
//! [`VirtualUser`]s invoke the task, and for how long.
//!
//! Task functions are async functions taking a mutable reference to the invoking
//! [`VirtualUser`] and returning a [`TaskResult`]:
//!
//! ```rust
//! use gander::prelude::*;
//!
//! let mut list_todos = task!(list_todos).set_name("list todos");
//!
//! async fn list_todos(user: &mut VirtualUser) -> TaskResult {
//!     let response = user.get("/api/v1/todos")?.send().await?;
//!     VirtualUser::check_status(&response, StatusCode::OK)
//! }
//! ```

use http::StatusCode;
use reqwest::{Client, RequestBuilder, Response};
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{fmt, future::Future, pin::Pin};
use url::Url;

use crate::executor::ScenarioExecutor;
use crate::GanderError;

/// The result of a single task invocation. An `Err` is recorded as a failed outcome.
pub type TaskResult = Result<(), Box<TaskError>>;

/// A boxed async function invoked by virtual users.
pub type TaskFunction = Arc<
    dyn for<'r> Fn(&'r mut VirtualUser) -> Pin<Box<dyn Future<Output = TaskResult> + Send + 'r>>
        + Send
        + Sync,
>;

/// task!(foo) expands to Task::new(foo), but also does some boxing to work around a limitation in the compiler.
#[macro_export]
macro_rules! task {
    ($task_func:ident) => {
        $crate::scenario::Task::new(std::sync::Arc::new(move |s| {
            std::boxed::Box::pin($task_func(s))
        }))
    };
}

/// Errors a task function can return. Each is recorded as a failed outcome, and never
/// stops the virtual user or the scenario.
#[derive(Debug)]
pub enum TaskError {
    /// Wraps a [`reqwest::Error`](https://docs.rs/reqwest/*/reqwest/struct.Error.html).
    Reqwest(reqwest::Error),
    /// Wraps a [`url::ParseError`](https://docs.rs/url/*/url/enum.ParseError.html).
    Url(url::ParseError),
    /// The server returned a different status code than the task expected.
    UnexpectedStatus {
        expected: StatusCode,
        received: StatusCode,
    },
    /// The task function panicked.
    Panicked {
        /// The panic message, when it was a string.
        detail: String,
    },
    /// Any other failure detected by the task function.
    Custom {
        /// An explanation of the failure.
        detail: String,
    },
}
impl TaskError {
    fn describe(&self) -> &str {
        match *self {
            TaskError::Reqwest(_) => "reqwest::Error",
            TaskError::Url(_) => "url::ParseError",
            TaskError::UnexpectedStatus { .. } => "unexpected status code",
            TaskError::Panicked { .. } => "task panicked",
            TaskError::Custom { .. } => "task failed",
        }
    }

    /// Build a boxed custom error, ready to return from a task function.
    ///
    /// # Example
    /// ```rust
    /// use gander::prelude::*;
    ///
    /// async fn create_todo(user: &mut VirtualUser) -> TaskResult {
    ///     let body = user.post("/api/v1/todos")?.send().await?.text().await?;
    ///     if !body.contains("\"id\"") {
    ///         return Err(TaskError::custom("created todo has no id"));
    ///     }
    ///     Ok(())
    /// }
    /// ```
    pub fn custom<S: Into<String>>(detail: S) -> Box<TaskError> {
        Box::new(TaskError::Custom {
            detail: detail.into(),
        })
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TaskError::Reqwest(ref source) => write!(f, "{} ({})", self.describe(), source),
            TaskError::Url(ref source) => write!(f, "{} ({})", self.describe(), source),
            TaskError::UnexpectedStatus { expected, received } => write!(
                f,
                "{} (expected {}, received {})",
                self.describe(),
                expected,
                received
            ),
            TaskError::Panicked { ref detail } | TaskError::Custom { ref detail } => {
                write!(f, "{} ({})", self.describe(), detail)
            }
        }
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            TaskError::Reqwest(ref source) => Some(source),
            TaskError::Url(ref source) => Some(source),
            _ => None,
        }
    }
}

/// Auto-convert Reqwest errors.
impl From<reqwest::Error> for TaskError {
    fn from(err: reqwest::Error) -> TaskError {
        TaskError::Reqwest(err)
    }
}

/// Auto-convert Reqwest errors to boxed task errors, so task functions can use `?`.
impl From<reqwest::Error> for Box<TaskError> {
    fn from(err: reqwest::Error) -> Box<TaskError> {
        Box::new(TaskError::Reqwest(err))
    }
}

/// Auto-convert Url errors.
impl From<url::ParseError> for TaskError {
    fn from(err: url::ParseError) -> TaskError {
        TaskError::Url(err)
    }
}

impl From<url::ParseError> for Box<TaskError> {
    fn from(err: url::ParseError) -> Box<TaskError> {
        Box::new(TaskError::Url(err))
    }
}

/// A named task function.
#[derive(Clone)]
pub struct Task {
    /// The label recorded with each outcome. Defaults to the scenario name when empty.
    pub name: String,
    /// The function executed each time this task runs.
    pub function: TaskFunction,
}
impl Task {
    pub fn new(function: TaskFunction) -> Self {
        trace!("new task");
        Task {
            name: "".to_string(),
            function,
        }
    }

    /// Set the label recorded with each outcome of this task.
    ///
    /// Individual invocations can also override the label, see
    /// [`VirtualUser::set_label`].
    ///
    /// # Example
    /// ```rust
    /// use gander::prelude::*;
    ///
    /// task!(my_task_function).set_name("foo");
    ///
    /// async fn my_task_function(user: &mut VirtualUser) -> TaskResult {
    ///     let _response = user.get("/")?.send().await?;
    ///     Ok(())
    /// }
    /// ```
    pub fn set_name(mut self, name: &str) -> Self {
        trace!("set_name: {}", name);
        self.name = name.to_string();
        self
    }
}
impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("name", &self.name).finish()
    }
}

/// A named load pattern: one task, the executor deciding who runs it, and optional
/// think time between invocations.
///
/// # Example
/// ```rust
/// use gander::prelude::*;
/// use std::time::Duration;
///
/// fn main() -> Result<(), GanderError> {
///     let studier = Scenario::new("studier", task!(list_todos))
///         .set_executor("ramping:100,30s;0,30s".parse()?)
///         .set_wait_time(Duration::from_secs(1), Duration::from_secs(3))?;
///     Ok(())
/// }
///
/// async fn list_todos(user: &mut VirtualUser) -> TaskResult {
///     let _response = user.get("/api/v1/todos")?.send().await?;
///     Ok(())
/// }
/// ```
#[derive(Clone, Debug)]
pub struct Scenario {
    /// The unique name of the scenario.
    pub name: String,
    /// The task invoked by every virtual user of this scenario.
    pub task: Task,
    /// How virtual users are scheduled.
    pub executor: ScenarioExecutor,
    /// Optional (minimum, maximum) pause between invocations.
    pub wait_time: Option<(Duration, Duration)>,
}
impl Scenario {
    /// Create a scenario running one virtual user for one iteration.
    pub fn new(name: &str, task: Task) -> Self {
        trace!("new scenario: name: {}", name);
        Scenario {
            name: name.to_string(),
            task,
            executor: ScenarioExecutor::default(),
            wait_time: None,
        }
    }

    /// Set how virtual users are scheduled for this scenario.
    pub fn set_executor(mut self, executor: ScenarioExecutor) -> Self {
        trace!("{} set_executor: {}", self.name, executor);
        self.executor = executor;
        self
    }

    /// Configure a random pause between `min_wait` and `max_wait` (inclusive) after each
    /// invocation. The pause ends immediately when the virtual user is told to stop.
    ///
    /// Returns [`GanderError::InvalidWaitTime`] if `min_wait` is larger than `max_wait`.
    pub fn set_wait_time(
        mut self,
        min_wait: Duration,
        max_wait: Duration,
    ) -> Result<Self, GanderError> {
        trace!(
            "{} set_wait time: min: {:?} max: {:?}",
            self.name,
            min_wait,
            max_wait
        );
        if min_wait > max_wait {
            return Err(GanderError::InvalidWaitTime {
                min_wait,
                max_wait,
                detail: "The min_wait option can not be set to a larger value than the max_wait option."
                    .to_string(),
            });
        }
        self.wait_time = Some((min_wait, max_wait));
        Ok(self)
    }

    /// The label recorded for outcomes of this scenario's task.
    pub(crate) fn label(&self) -> &str {
        if self.task.name.is_empty() {
            &self.name
        } else {
            &self.task.name
        }
    }

    /// Reject scenarios that can't be run, before anything is spawned.
    pub(crate) fn validate(&self) -> Result<(), GanderError> {
        if self.name.trim().is_empty() {
            return Err(GanderError::InvalidScenario {
                scenario: self.name.clone(),
                detail: "scenario names can not be empty".to_string(),
            });
        }
        if let Some((min_wait, max_wait)) = self.wait_time {
            if min_wait > max_wait {
                return Err(GanderError::InvalidWaitTime {
                    min_wait,
                    max_wait,
                    detail: format!(
                        "{}: min_wait can't be larger than max_wait",
                        self.name
                    ),
                });
            }
        }
        self.executor.validate(&self.name)
    }
}

/// The context passed to every task invocation.
#[derive(Debug, Clone)]
pub struct VirtualUser {
    /// The name of the scenario this user belongs to.
    pub scenario_name: String,
    /// The index of this user within its scenario, starting at 0.
    pub user: usize,
    /// The iteration currently running. For shared-iteration scenarios this is the
    /// scenario-wide iteration number.
    pub iteration: usize,
    /// When the load test started.
    pub started: Instant,
    /// The configured `--host`, if any.
    pub base_url: Option<Url>,
    /// Shared HTTP client.
    pub client: Client,
    label: Option<String>,
}
impl VirtualUser {
    pub fn new(
        scenario_name: &str,
        user: usize,
        started: Instant,
        base_url: Option<Url>,
        client: Client,
    ) -> Self {
        trace!("new virtual user {} for {}", user, scenario_name);
        VirtualUser {
            scenario_name: scenario_name.to_string(),
            user,
            iteration: 0,
            started,
            base_url,
            client,
            label: None,
        }
    }

    /// A reference to the HTTP client shared by all virtual users.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Build a fully qualified URL from a path.
    ///
    /// If `path` already includes a host it is returned unchanged, otherwise it is joined
    /// to the configured `--host`.
    ///
    /// # Example
    /// ```rust
    /// use gander::prelude::*;
    /// use std::time::Instant;
    ///
    /// let base_url = url::Url::parse("http://127.0.0.1:8080/").unwrap();
    /// let user = VirtualUser::new("doc", 0, Instant::now(), Some(base_url), reqwest::Client::new());
    /// assert_eq!(user.build_url("/api/v1/todos").unwrap(), "http://127.0.0.1:8080/api/v1/todos");
    /// assert_eq!(user.build_url("http://example.com/").unwrap(), "http://example.com/");
    /// ```
    pub fn build_url(&self, path: &str) -> Result<String, Box<TaskError>> {
        // If URL includes a host, simply use it.
        if let Ok(parsed_path) = Url::parse(path) {
            if parsed_path.host().is_some() {
                return Ok(path.to_string());
            }
        }

        // Otherwise use the configured host.
        match &self.base_url {
            Some(base_url) => Ok(base_url.join(path)?.to_string()),
            None => Err(TaskError::custom(format!(
                "no --host configured to request {}",
                path
            ))),
        }
    }

    /// Prepare a GET request for `path`.
    pub fn get(&self, path: &str) -> Result<RequestBuilder, Box<TaskError>> {
        Ok(self.client.get(self.build_url(path)?))
    }

    /// Prepare a POST request for `path`.
    pub fn post(&self, path: &str) -> Result<RequestBuilder, Box<TaskError>> {
        Ok(self.client.post(self.build_url(path)?))
    }

    /// Prepare a DELETE request for `path`.
    pub fn delete(&self, path: &str) -> Result<RequestBuilder, Box<TaskError>> {
        Ok(self.client.delete(self.build_url(path)?))
    }

    /// Fail with [`TaskError::UnexpectedStatus`] unless the response has the expected
    /// status code.
    pub fn check_status(response: &Response, expected: StatusCode) -> TaskResult {
        let received = response.status();
        if received == expected {
            Ok(())
        } else {
            Err(Box::new(TaskError::UnexpectedStatus { expected, received }))
        }
    }

    /// Override the label recorded for the current invocation only.
    pub fn set_label(&mut self, label: &str) {
        self.label = Some(label.to_string());
    }

    /// Consume any label override set during the invocation.
    pub(crate) fn take_label(&mut self) -> Option<String> {
        self.label.take()
    }
}
