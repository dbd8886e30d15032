//! # Gander
//!
//! Gander is a virtual-user load generation library. Load tests, called Gander Attacks,
//! are built by creating an application with Cargo and declaring a dependency on the
//! Gander library.
//!
//! A load test is made of one or more named [`Scenario`](scenario/struct.Scenario.html)s
//! running concurrently. Each scenario pairs an async task function with an executor
//! deciding how many virtual users invoke it:
//!
//! - **fixed iterations**: a fixed number of virtual users each invoke the task a fixed
//!   number of times;
//! - **shared iterations**: a fixed number of virtual users share a fixed number of
//!   invocations between them;
//! - **ramping**: the number of concurrently looping virtual users follows a schedule of
//!   timed stages, ramping up, holding and ramping down.
//!
//! Every invocation is recorded as one pass/fail outcome with its timing. When all
//! scenarios finish, or the optional `--run-time` hard cap elapses, the outcomes are
//! merged into a single [`RunSummary`](metrics/struct.RunSummary.html).
//!
//! Gander uses [`reqwest`](https://docs.rs/reqwest/) to provide a convenient HTTP
//! client.
//!
//! ## Creating a Gander load test
//!
//! Add Gander and Tokio as dependencies in `Cargo.toml`, then add the following
//! boilerplate `use` declaration at the top of your `src/main.rs`:
//!
//! ```rust
//! use gander::prelude::*;
//! ```
//!
//! Task functions are async functions that take the invoking
//! [`VirtualUser`](scenario/struct.VirtualUser.html) and return a
//! [`TaskResult`](scenario/type.TaskResult.html). Returning an error records a failed
//! outcome; the virtual user carries on with its next iteration.
//!
//! ```rust
//! use gander::prelude::*;
//!
//! async fn list_todos(user: &mut VirtualUser) -> TaskResult {
//!     let response = user.get("/api/v1/todos")?.send().await?;
//!     VirtualUser::check_status(&response, StatusCode::OK)
//! }
//! ```
//!
//! Scenarios are registered on a [`GanderAttack`], which is then executed:
//!
//! ```rust,no_run
//! use gander::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), GanderError> {
//!     GanderAttack::initialize()?
//!         .register_scenario(
//!             Scenario::new("studier", task!(list_todos))
//!                 .set_executor("ramping:100,30s;500,2m;0,1m".parse()?)
//!                 .set_wait_time(Duration::from_secs(1), Duration::from_secs(5))?,
//!         )
//!         .register_scenario(
//!             Scenario::new("checker", task!(list_todos))
//!                 .set_executor(ScenarioExecutor::fixed_iterations(10, 50)),
//!         )
//!         .execute()
//!         .await?;
//!
//!     Ok(())
//! }
//!
//! async fn list_todos(user: &mut VirtualUser) -> TaskResult {
//!     let response = user.get("/api/v1/todos")?.send().await?;
//!     VirtualUser::check_status(&response, StatusCode::OK)
//! }
//! ```
//!
//! Run it against a host, stopping everything after ten minutes at the latest:
//!
//! ```bash
//! $ cargo run --release -- --host http://127.0.0.1:8080 --run-time 10m
//! ```
//!
//! Run with `-h` to see every run-time option.

#[macro_use]
extern crate log;

pub mod config;
pub mod executor;
pub mod logger;
pub mod metrics;
pub mod prelude;
pub mod recorder;
pub mod scenario;
pub mod stage;
mod user;
pub mod util;

use futures::future::join_all;
use gumdrop::Options;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{fmt, io};
use tokio::sync::watch;
use url::Url;

pub use crate::config::GanderConfiguration;
use crate::executor::{ScenarioContext, ScenarioMonitor};
use crate::metrics::RunSummary;
use crate::recorder::Recorder;
use crate::scenario::Scenario;

/// Constant defining how the shared HTTP client identifies itself.
static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// An enumeration of all errors a [`GanderAttack`] can return.
#[derive(Debug)]
pub enum GanderError {
    /// Wraps a [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    Io(io::Error),
    /// Wraps a [`reqwest::Error`](https://docs.rs/reqwest/*/reqwest/struct.Error.html).
    Reqwest(reqwest::Error),
    /// Wraps a ['tokio::task::JoinError'](https://docs.rs/tokio/*/tokio/task/struct.JoinError.html).
    TokioJoin(tokio::task::JoinError),
    /// Wraps a [`serde_json::Error`](https://docs.rs/serde_json/*/serde_json/struct.Error.html).
    Serde(serde_json::Error),
    /// Failed to parse a hostname.
    InvalidHost {
        /// The invalid hostname that caused this error.
        host: String,
        /// An optional explanation of the error.
        detail: String,
        /// Wraps a [`url::ParseError`](https://docs.rs/url/*/url/enum.ParseError.html).
        parse_error: url::ParseError,
    },
    /// Invalid option or value specified, may only be invalid in context.
    InvalidOption {
        /// The invalid option that caused this error, may be only invalid in context.
        option: String,
        /// The invalid value that caused this error, may be only invalid in context.
        value: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// Invalid wait time specified.
    InvalidWaitTime {
        // The specified minimum wait time.
        min_wait: Duration,
        // The specified maximum wait time.
        max_wait: Duration,
        /// An optional explanation of the error.
        detail: String,
    },
    /// A scenario can't be run as configured.
    InvalidScenario {
        /// The name of the invalid scenario.
        scenario: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// [`GanderAttack`] has no [`Scenario`](./scenario/struct.Scenario.html) to run.
    NoScenarios {
        /// An optional explanation of the error.
        detail: String,
    },
    /// More than one scenario was registered with the same name.
    DuplicateScenario {
        /// The repeated name.
        name: String,
    },
    /// The outcome storage lock wasn't acquired in time.
    RecorderContention {
        /// How long was waited.
        waited: Duration,
    },
}
/// Implement a helper to provide a text description of all possible types of errors.
impl GanderError {
    fn describe(&self) -> &str {
        match *self {
            GanderError::Io(_) => "io::Error",
            GanderError::Reqwest(_) => "reqwest::Error",
            GanderError::TokioJoin(_) => "tokio::task::JoinError",
            GanderError::Serde(_) => "serde_json::Error",
            GanderError::InvalidHost { .. } => "failed to parse hostname",
            GanderError::InvalidOption { .. } => "invalid option or value specified",
            GanderError::InvalidWaitTime { .. } => "invalid wait_time specified",
            GanderError::InvalidScenario { .. } => "invalid scenario",
            GanderError::NoScenarios { .. } => "no scenarios defined",
            GanderError::DuplicateScenario { .. } => "duplicate scenario name",
            GanderError::RecorderContention { .. } => "timed out waiting for outcome storage",
        }
    }
}

/// Implement format trait to allow displaying errors.
impl fmt::Display for GanderError {
    // Implement display of error with `{}` marker.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            GanderError::Io(ref source) => write!(f, "GanderError: {} ({})", self.describe(), source),
            GanderError::Reqwest(ref source) => {
                write!(f, "GanderError: {} ({})", self.describe(), source)
            }
            GanderError::TokioJoin(ref source) => {
                write!(f, "GanderError: {} ({})", self.describe(), source)
            }
            GanderError::Serde(ref source) => {
                write!(f, "GanderError: {} ({})", self.describe(), source)
            }
            GanderError::InvalidHost {
                ref host,
                ref parse_error,
                ..
            } => write!(
                f,
                "GanderError: {} {} ({})",
                self.describe(),
                host,
                parse_error
            ),
            GanderError::InvalidOption {
                ref option,
                ref value,
                ref detail,
            } => write!(
                f,
                "GanderError: {}: {} = {} ({})",
                self.describe(),
                option,
                value,
                detail
            ),
            GanderError::InvalidScenario {
                ref scenario,
                ref detail,
            } => write!(f, "GanderError: {} {}: {}", self.describe(), scenario, detail),
            GanderError::InvalidWaitTime { ref detail, .. }
            | GanderError::NoScenarios { ref detail } => {
                write!(f, "GanderError: {}: {}", self.describe(), detail)
            }
            GanderError::DuplicateScenario { ref name } => {
                write!(f, "GanderError: {}: {}", self.describe(), name)
            }
            GanderError::RecorderContention { waited } => {
                write!(f, "GanderError: {} after {:?}", self.describe(), waited)
            }
        }
    }
}

// Define the lower level source of this error, if any.
impl std::error::Error for GanderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            GanderError::Io(ref source) => Some(source),
            GanderError::Reqwest(ref source) => Some(source),
            GanderError::TokioJoin(ref source) => Some(source),
            GanderError::Serde(ref source) => Some(source),
            GanderError::InvalidHost {
                ref parse_error, ..
            } => Some(parse_error),
            _ => None,
        }
    }
}

/// Auto-convert Reqwest errors.
impl From<reqwest::Error> for GanderError {
    fn from(err: reqwest::Error) -> GanderError {
        GanderError::Reqwest(err)
    }
}

/// Auto-convert IO errors.
impl From<io::Error> for GanderError {
    fn from(err: io::Error) -> GanderError {
        GanderError::Io(err)
    }
}

/// Auto-convert TokioJoin errors.
impl From<tokio::task::JoinError> for GanderError {
    fn from(err: tokio::task::JoinError) -> GanderError {
        GanderError::TokioJoin(err)
    }
}

/// Auto-convert serde_json errors.
impl From<serde_json::Error> for GanderError {
    fn from(err: serde_json::Error) -> GanderError {
        GanderError::Serde(err)
    }
}

// Build the HTTP client shared by every virtual user.
fn build_client(configuration: &GanderConfiguration) -> Result<reqwest::Client, GanderError> {
    let mut builder = reqwest::Client::builder()
        .user_agent(APP_USER_AGENT)
        .gzip(true);
    if let Some(timeout) = configuration.request_timeout() {
        builder = builder.timeout(timeout);
    }
    Ok(builder.build()?)
}

/// Global internal state for the load test.
pub struct GanderAttack {
    /// Registered scenarios, each with the monitor observing it.
    scenarios: Vec<(Scenario, ScenarioMonitor)>,
    /// Configuration object holding options set when launching the load test.
    configuration: GanderConfiguration,
}
impl GanderAttack {
    /// Load configuration from the command line and initialize a [`GanderAttack`].
    ///
    /// Exits with a usage message if the command line can't be parsed.
    ///
    /// # Example
    /// ```rust
    /// use gander::prelude::*;
    ///
    /// let mut gander_attack = GanderAttack::initialize();
    /// ```
    pub fn initialize() -> Result<GanderAttack, GanderError> {
        Ok(GanderAttack {
            scenarios: Vec::new(),
            configuration: GanderConfiguration::parse_args_default_or_exit(),
        })
    }

    /// Initialize a [`GanderAttack`] with an already loaded configuration.
    ///
    /// This is generally used by tests, and by load tests configured in code.
    ///
    /// # Example
    /// ```rust
    /// use gander::GanderAttack;
    /// use gander::config::GanderConfiguration;
    /// use gumdrop::Options;
    ///
    /// let configuration = GanderConfiguration::parse_args_default(&["--host", "http://127.0.0.1:8080"]).unwrap();
    /// let mut gander_attack = GanderAttack::initialize_with_config(configuration);
    /// ```
    pub fn initialize_with_config(
        configuration: GanderConfiguration,
    ) -> Result<GanderAttack, GanderError> {
        Ok(GanderAttack {
            scenarios: Vec::new(),
            configuration,
        })
    }

    /// A load test must contain one or more [`Scenario`](./scenario/struct.Scenario.html)s
    /// registered with this method for it to run. Names must be unique.
    ///
    /// # Example
    /// ```rust
    /// use gander::prelude::*;
    ///
    /// fn main() -> Result<(), GanderError> {
    ///     GanderAttack::initialize()?
    ///         .register_scenario(Scenario::new("ExampleScenario", task!(example_task)))
    ///         .register_scenario(
    ///             Scenario::new("OtherScenario", task!(other_task))
    ///                 .set_executor(ScenarioExecutor::shared_iterations(5, 100)),
    ///         );
    ///
    ///     Ok(())
    /// }
    ///
    /// async fn example_task(user: &mut VirtualUser) -> TaskResult {
    ///     let _response = user.get("/foo")?.send().await?;
    ///     Ok(())
    /// }
    ///
    /// async fn other_task(user: &mut VirtualUser) -> TaskResult {
    ///     let _response = user.get("/bar")?.send().await?;
    ///     Ok(())
    /// }
    /// ```
    pub fn register_scenario(mut self, scenario: Scenario) -> Self {
        let monitor = ScenarioMonitor::new(&scenario.name);
        self.scenarios.push((scenario, monitor));
        self
    }

    /// A live view of the named scenario, usable while the load test runs.
    pub fn monitor(&self, name: &str) -> Option<ScenarioMonitor> {
        self.scenarios
            .iter()
            .find(|(scenario, _)| scenario.name == name)
            .map(|(_, monitor)| monitor.clone())
    }

    // Reject everything that can't run, before anything starts.
    fn validate_scenarios(&self) -> Result<(), GanderError> {
        if self.scenarios.is_empty() {
            return Err(GanderError::NoScenarios {
                detail: "No scenarios are defined.".to_string(),
            });
        }
        let mut names = HashSet::new();
        for (scenario, _) in &self.scenarios {
            scenario.validate()?;
            if !names.insert(scenario.name.as_str()) {
                return Err(GanderError::DuplicateScenario {
                    name: scenario.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Execute the [`GanderAttack`] load test.
    ///
    /// Runs every registered scenario (or those matching `--scenarios`) concurrently,
    /// until all complete or the `--run-time` hard cap elapses, then returns the merged
    /// [`RunSummary`](metrics/struct.RunSummary.html).
    ///
    /// # Example
    /// ```rust,no_run
    /// use gander::prelude::*;
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), GanderError> {
    ///     let _summary = GanderAttack::initialize()?
    ///         .register_scenario(
    ///             Scenario::new("ExampleScenario", task!(example_task))
    ///                 .set_executor(ScenarioExecutor::fixed_iterations(2, 10)),
    ///         )
    ///         .execute()
    ///         .await?;
    ///
    ///     Ok(())
    /// }
    ///
    /// async fn example_task(user: &mut VirtualUser) -> TaskResult {
    ///     let _response = user.get("/foo")?.send().await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn execute(self) -> Result<RunSummary, GanderError> {
        // If version flag is set, display package name and version and exit.
        if self.configuration.version {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }

        // Display scenarios, then exit.
        if self.configuration.list {
            println!("Available scenarios:");
            for (scenario, _) in &self.scenarios {
                println!(" - {} ({})", scenario.name, scenario.executor);
            }
            std::process::exit(0);
        }

        self.configuration.validate()?;
        self.validate_scenarios()?;

        let GanderAttack {
            scenarios,
            configuration,
        } = self;

        // Limit the load test to scenarios matching --scenarios.
        let active: Vec<(Scenario, ScenarioMonitor)> = scenarios
            .into_iter()
            .filter(|(scenario, _)| configuration.scenarios.matches(&scenario.name))
            .collect();
        if active.is_empty() {
            return Err(GanderError::NoScenarios {
                detail: format!(
                    "No scenarios match --scenarios \"{}\".",
                    configuration.scenarios.active.join(",")
                ),
            });
        }

        let base_url = if configuration.host.is_empty() {
            None
        } else {
            Some(
                Url::parse(&configuration.host).map_err(|parse_error| {
                    GanderError::InvalidHost {
                        host: configuration.host.clone(),
                        detail: "Invalid host.".to_string(),
                        parse_error,
                    }
                })?,
            )
        };

        configuration.initialize_logger();
        let client = build_client(&configuration)?;

        // Create the outcome log before anything runs, so a bad path fails fast.
        let mut recorder = Recorder::new(configuration.recorder_timeout());
        let outcome_logger = match configuration.open_outcome_log().await? {
            Some(file) => {
                let (sender, receiver) = flume::unbounded();
                recorder.set_logger(sender.clone());
                let format = configuration.outcome_format.unwrap_or_default();
                Some((
                    sender,
                    tokio::spawn(logger::logger_main(file, format, receiver)),
                ))
            }
            None => None,
        };

        // Scenarios drain when this is set, by the hard cap or by ctrl-c.
        let (cancel, canceled) = watch::channel(false);
        let cancel = Arc::new(cancel);
        util::setup_ctrlc_handler(cancel.clone());

        let started = Instant::now();
        info!("launching {} scenarios...", active.len());
        let mut runners = Vec::with_capacity(active.len());
        for (scenario, monitor) in active {
            let context = ScenarioContext {
                scenario: Arc::new(scenario),
                monitor,
                recorder: recorder.handle(),
                client: client.clone(),
                base_url: base_url.clone(),
                started,
                cancel: canceled.clone(),
            };
            runners.push(tokio::spawn(executor::run_scenario(context)));
        }

        let all_scenarios = join_all(runners);
        tokio::pin!(all_scenarios);
        let results = match configuration.run_time() {
            Some(run_time) => {
                tokio::select! {
                    results = &mut all_scenarios => results,
                    _ = tokio::time::sleep(run_time) => {
                        info!(
                            "run time of {} elapsed, draining all scenarios...",
                            util::format_timespan(run_time)
                        );
                        cancel.send_replace(true);
                        all_scenarios.await
                    }
                }
            }
            None => all_scenarios.await,
        };
        info!(
            "all scenarios stopped after {}",
            util::format_timespan(started.elapsed())
        );

        // Every virtual user has exited: stop the outcome logger once it has written
        // everything it was sent.
        if let Some((sender, logger)) = outcome_logger {
            let _ = sender.send(None);
            logger.await??;
        }

        let mut reports = Vec::with_capacity(results.len());
        for result in results {
            reports.push(result??);
        }

        let mut summary = recorder.summarize().await?;
        for report in reports {
            summary.attach_report(report);
        }

        if !configuration.no_print_summary {
            summary.print();
        }

        if !configuration.summary_file.is_empty() {
            tokio::fs::write(
                &configuration.summary_file,
                serde_json::to_string_pretty(&summary)?,
            )
            .await?;
            info!("wrote run summary to: {}", configuration.summary_file);
        }

        Ok(summary)
    }
}
