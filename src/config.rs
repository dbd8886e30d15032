//! Functions and structures related to configuring a Gander load test.
//!
//! Gander is configured at run time by passing in the options and flags defined by the
//! [`GanderConfiguration`] structure, or programmatically by building one and passing it
//! to [`GanderAttack::initialize_with_config`](../struct.GanderAttack.html#method.initialize_with_config).

use gumdrop::Options;
use serde::{Deserialize, Serialize};
use simplelog::*;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use wildcard::Wildcard;

use crate::logger::GanderLogFormat;
use crate::util;
use crate::GanderError;

/// Default bound on how long to wait for the outcome storage lock, in seconds.
const DEFAULT_RECORDER_TIMEOUT: usize = 10;

/// Runtime options available when launching a Gander load test.
///
/// Help is generated for all of these options by passing a `-h` flag to an application
/// built with the Gander library.
///
/// Gander leverages [`gumdrop`](https://docs.rs/gumdrop/) to derive the above help from
/// the below structure.
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"Gander runs virtual users through fixed-iteration and ramping scenarios
against an HTTP(S) endpoint, and summarizes their outcomes.

The following runtime options are available when launching a Gander load test:"#
)]
pub struct GanderConfiguration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,
    /// Prints version information
    #[options(short = "V")]
    pub version: bool,
    /// Lists all scenarios and exits
    // Add a blank line after this option
    #[options(short = "l", help = "Lists all scenarios and exits\n")]
    pub list: bool,

    /// Defines host to load test (ie http://10.21.32.33)
    #[options(short = "H")]
    pub host: String,
    /// Stops all scenarios after (30s, 20m, 3h, 1h30m, etc)
    #[options(short = "t", meta = "TIME")]
    pub run_time: String,
    /// Limits load test to only specified scenarios
    #[options(no_short, meta = "\"SCENARIO\"")]
    pub scenarios: Scenarios,
    /// Sets per-request timeout, in seconds (default: 60)
    #[options(no_short, meta = "VALUE")]
    pub timeout: Option<String>,
    /// Sets how long to wait for outcome storage, in seconds (default: 10)
    #[options(no_short, meta = "VALUE")]
    pub recorder_timeout: Option<usize>,
    /// Enables Gander log file and sets name
    #[options(short = "G", meta = "NAME")]
    pub log_file: String,
    /// Increases Gander log level (-g, -gg, etc)
    #[options(short = "g", count)]
    pub log_level: u8,
    /// Decreases Gander verbosity (-q, -qq, etc)
    #[options(count, short = "q", help = "Decreases Gander verbosity (-q, -qq, etc)")]
    pub quiet: u8,
    /// Increases Gander verbosity (-v, -vv, etc)
    #[options(
        count,
        short = "v",
        // Add a blank line and then an 'Outcomes:' header after this option
        help = "Increases Gander verbosity (-v, -vv, etc)\n\nOutcomes:"
    )]
    pub verbose: u8,

    /// Sets outcome log file name
    #[options(short = "O", meta = "NAME")]
    pub outcome_log: String,
    /// Sets outcome log format (csv, json, raw, pretty)
    #[options(no_short, meta = "FORMAT")]
    pub outcome_format: Option<GanderLogFormat>,
    /// Writes the run summary as JSON
    #[options(no_short, meta = "NAME")]
    pub summary_file: String,
    /// Doesn't display the run summary at the end of the load test
    #[options(no_short)]
    pub no_print_summary: bool,
}

/// Optionally defines a subset of registered scenarios to run during a load test.
///
/// Names are compared case-insensitively, and may use the `*` and `?` wildcards.
#[derive(Options, Default, Debug, Clone, Serialize, Deserialize)]
pub struct Scenarios {
    pub active: Vec<String>,
}
/// Implement [`FromStr`] to convert `"foo,bar"` comma separated string to a vector of strings.
impl FromStr for Scenarios {
    type Err = GanderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut active: Vec<String> = Vec::new();
        // Multiple scenarios can be defined as a comma separated list.
        for line in s.split(',') {
            // Ignore white space and case.
            let scenario = line.trim().to_lowercase();
            let valid = !scenario.is_empty()
                && scenario
                    .chars()
                    .all(|c| c.is_alphanumeric() || matches!(c, '*' | '?' | '_' | '-'));
            if valid {
                active.push(scenario);
            } else {
                // Logger isn't initialized yet, provide helpful debug output.
                eprintln!("ERROR: invalid `configuration.scenarios` value: '{}'", line);
                eprintln!("  Expected format: --scenarios \"{{one}},{{two}},{{three}}\"");
                eprintln!("    {{one}}, {{two}}, {{three}}, etc may contain letters, numbers, '_', '-', '*' and '?'");
                eprintln!("    To view valid scenario names invoke `--list`");
                return Err(GanderError::InvalidOption {
                    option: "`configuration.scenarios`".to_string(),
                    value: line.to_string(),
                    detail: "invalid `configuration.scenarios` value.".to_string(),
                });
            }
        }
        // The listed scenarios are only valid if the logic gets this far.
        Ok(Scenarios { active })
    }
}
impl Scenarios {
    /// Whether the named scenario should run. Everything runs when no filter is set.
    pub fn matches(&self, name: &str) -> bool {
        if self.active.is_empty() {
            return true;
        }
        let name = name.to_lowercase();
        self.active.iter().any(|pattern| {
            match Wildcard::new(pattern.as_bytes()) {
                Ok(wildcard) => wildcard.is_match(name.as_bytes()),
                // Patterns are validated when parsed, fall back to an exact match.
                Err(_) => pattern == &name,
            }
        })
    }
}

impl GanderConfiguration {
    /// Validate configured [`GanderConfiguration`] values.
    pub(crate) fn validate(&self) -> Result<(), GanderError> {
        // Can't set both --verbose and --quiet.
        if self.verbose > 0 && self.quiet > 0 {
            return Err(GanderError::InvalidOption {
                option: "`configuration.verbose`".to_string(),
                value: self.verbose.to_string(),
                detail: "`configuration.verbose` can not be set with `configuration.quiet`."
                    .to_string(),
            });
        }

        if !self.host.is_empty() {
            util::is_valid_host(&self.host)?;
        }

        // If set, run time must be a valid time span.
        if !self.run_time.is_empty() && util::parse_timespan(&self.run_time).is_none() {
            return Err(GanderError::InvalidOption {
                option: "`configuration.run_time`".to_string(),
                value: self.run_time.clone(),
                detail: "`configuration.run_time` must be a time span such as 30s, 20m, 3h or 1h30m."
                    .to_string(),
            });
        }

        // If set, timeout must be greater than zero.
        if let Some(timeout) = self.timeout.as_ref() {
            if !matches!(f64::from_str(timeout.trim()), Ok(value) if value > 0.0) {
                return Err(GanderError::InvalidOption {
                    option: "`configuration.timeout`".to_string(),
                    value: timeout.to_string(),
                    detail: "`configuration.timeout` must be greater than 0.".to_string(),
                });
            }
        }

        if self.recorder_timeout == Some(0) {
            return Err(GanderError::InvalidOption {
                option: "`configuration.recorder_timeout`".to_string(),
                value: "0".to_string(),
                detail: "`configuration.recorder_timeout` must be at least 1.".to_string(),
            });
        }

        // The outcome format only makes sense with an outcome log.
        if let Some(format) = self.outcome_format.as_ref() {
            if self.outcome_log.is_empty() {
                return Err(GanderError::InvalidOption {
                    option: "`configuration.outcome_format`".to_string(),
                    value: format.to_string(),
                    detail: "`configuration.outcome_format` can not be set without setting `configuration.outcome_log`."
                        .to_string(),
                });
            }
        }

        Ok(())
    }

    /// The hard cap on the load test, if any. `0` disables it.
    pub(crate) fn run_time(&self) -> Option<Duration> {
        if self.run_time.is_empty() {
            return None;
        }
        util::parse_timespan(&self.run_time).filter(|run_time| !run_time.is_zero())
    }

    /// The per-request timeout of the shared HTTP client, if any.
    pub(crate) fn request_timeout(&self) -> Option<Duration> {
        self.timeout
            .as_ref()
            .and_then(|timeout| f64::from_str(timeout.trim()).ok())
            .filter(|timeout| *timeout > 0.0)
            .map(Duration::from_secs_f64)
    }

    /// How long to wait for the outcome storage lock.
    pub(crate) fn recorder_timeout(&self) -> Duration {
        Duration::from_secs(
            self.recorder_timeout
                .unwrap_or(DEFAULT_RECORDER_TIMEOUT) as u64,
        )
    }

    /// Optionally initialize the Gander logger which writes to standard out and/or to
    /// a configurable log file.
    pub(crate) fn initialize_logger(&self) {
        // Configure debug output level.
        let debug_level = match self.verbose {
            0 => match self.quiet {
                0 => LevelFilter::Info,
                _ => LevelFilter::Warn,
            },
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Configure Gander log level.
        let log_level = match self.log_level {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Open the log file if configured.
        let log_file: Option<PathBuf> = if !self.log_file.is_empty() {
            Some(PathBuf::from(&self.log_file))
        // Otherwise disable the log.
        } else {
            None
        };

        let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
        loggers.push(SimpleLogger::new(debug_level, Config::default()));
        if let Some(log_to_file) = log_file.as_ref() {
            match std::fs::File::create(log_to_file) {
                Ok(file) => loggers.push(WriteLogger::new(log_level, Config::default(), file)),
                Err(e) => eprintln!(
                    "failed to create log file {}: {}",
                    log_to_file.display(),
                    e
                ),
            }
        }
        // Only one logger can be installed per process, as when running many load tests
        // from one test binary.
        if let Err(e) = CombinedLogger::init(loggers) {
            info!("failed to initialize CombinedLogger: {}", e);
        }
        if let Some(log_to_file) = log_file {
            info!("Writing to log file: {}", log_to_file.display());
        }

        info!("Output verbosity level: {}", debug_level);
        info!("Logfile verbosity level: {}", log_level);
    }
}
