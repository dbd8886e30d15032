//! Aggregated statistics about a load test.
//!
//! The [`RunSummary`] is built once from all recorded outcomes when a load test ends,
//! and returned by [`GanderAttack::execute`](../struct.GanderAttack.html#method.execute).
//! It can be displayed as plain text tables, or serialized.
//!
//! ```rust,no_run
//! use gander::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), GanderError> {
//!     let summary = GanderAttack::initialize()?
//!         .register_scenario(Scenario::new("example", task!(example_task)))
//!         .execute()
//!         .await?;
//!
//!     // The summary is printed automatically unless --no-print-summary is set.
//!     if summary.failure_rate() > 0.01 {
//!         eprintln!("more than 1% of invocations failed");
//!     }
//!     Ok(())
//! }
//!
//! async fn example_task(user: &mut VirtualUser) -> TaskResult {
//!     let _response = user.get("/")?.send().await?;
//!     Ok(())
//! }
//! ```

use chrono::prelude::*;
use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::executor::{PhaseTransition, ScenarioReport};
use crate::recorder::OutcomeRecord;
use crate::stage::StageHistory;
use crate::util;

/// Percentiles included in the displayed summary.
const PERCENTILES: [f32; 5] = [0.5, 0.75, 0.98, 0.99, 0.999];

/// Counts and timings for a group of outcomes.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct OutcomeAggregate {
    /// What the outcomes are grouped by: a label, a scenario name or "Aggregated".
    pub name: String,
    /// Per-duration counters (in milliseconds, rounded), tracking how often invocations
    /// took a given time to complete.
    pub times: BTreeMap<usize, usize>,
    /// The shortest invocation, in milliseconds.
    pub min_time: usize,
    /// The longest invocation, in milliseconds.
    pub max_time: usize,
    /// Total combined invocation time, in milliseconds.
    pub total_time: usize,
    /// Total number of invocations.
    pub counter: usize,
    /// Total number of successful invocations.
    pub success_count: usize,
    /// Total number of failed invocations.
    pub fail_count: usize,
}
impl OutcomeAggregate {
    pub fn new(name: &str) -> Self {
        OutcomeAggregate {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Track one invocation taking `time` milliseconds.
    pub(crate) fn set_time(&mut self, time: u64, success: bool) {
        // Perform this conversion only once, then re-use throughout this function.
        let time_usize = time as usize;

        // Update minimum if this one is fastest yet.
        if self.counter == 0 || time_usize < self.min_time {
            self.min_time = time_usize;
        }

        // Update maximum if this one is slowest yet.
        if time_usize > self.max_time {
            self.max_time = time_usize;
        }

        self.total_time += time_usize;
        self.counter += 1;

        if success {
            self.success_count += 1;
        } else {
            self.fail_count += 1;
        }

        // Round the time so similar times are combined, minimizing required memory.
        let rounded_time = match time {
            // No rounding for times 0-100 ms.
            0..=100 => time_usize,
            // Round to nearest 10 for times 100-500 ms.
            101..=500 => ((time as f64 / 10.0).round() * 10.0) as usize,
            // Round to nearest 100 for times 500-1000 ms.
            501..=1000 => ((time as f64 / 100.0).round() * 100.0) as usize,
            // Round to nearest 1000 for larger times.
            _ => ((time as f64 / 1000.0).round() * 1000.0) as usize,
        };
        *self.times.entry(rounded_time).or_insert(0) += 1;
    }

    /// Fold another aggregate into this one.
    pub(crate) fn merge(&mut self, other: &OutcomeAggregate) {
        if other.counter == 0 {
            return;
        }
        if self.counter == 0 || other.min_time < self.min_time {
            self.min_time = other.min_time;
        }
        self.max_time = self.max_time.max(other.max_time);
        self.total_time += other.total_time;
        self.counter += other.counter;
        self.success_count += other.success_count;
        self.fail_count += other.fail_count;
        for (time, count) in &other.times {
            *self.times.entry(*time).or_insert(0) += count;
        }
    }

    /// Average invocation time in milliseconds.
    pub fn mean_time(&self) -> f32 {
        match self.counter {
            0 => 0.0,
            _ => self.total_time as f32 / self.counter as f32,
        }
    }

    /// Fraction of invocations that failed, between 0 and 1.
    pub fn failure_rate(&self) -> f32 {
        match self.counter {
            0 => 0.0,
            _ => self.fail_count as f32 / self.counter as f32,
        }
    }

    /// The time in milliseconds that `percent` of invocations finished within.
    pub fn percentile(&self, percent: f32) -> usize {
        calculate_percentile(
            &self.times,
            self.counter,
            self.min_time,
            self.max_time,
            percent,
        )
    }
}

/// The outcomes and lifecycle of a single scenario.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioSummary {
    /// How the scenario's virtual users were scheduled.
    pub executor: String,
    /// Counts and timings of every invocation in this scenario.
    pub outcomes: OutcomeAggregate,
    /// Timestamped phase changes.
    pub phases: Vec<PhaseTransition>,
    /// Timestamped stage changes, for ramping scenarios.
    pub stages: Vec<StageHistory>,
    /// Whether the scenario was cut short by the run time limit or ctrl-c.
    pub canceled: bool,
    /// The largest number of virtual users active at once.
    pub max_users: usize,
}

/// Aggregated results of a load test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// When the load test started.
    pub started: DateTime<Utc>,
    /// How long the load test ran.
    pub duration: Duration,
    /// Every invocation, across all scenarios.
    pub overall: OutcomeAggregate,
    /// Invocations grouped by label.
    pub labels: BTreeMap<String, OutcomeAggregate>,
    /// Invocations grouped by scenario, with each scenario's lifecycle.
    pub scenarios: BTreeMap<String, ScenarioSummary>,
    /// Failed invocations grouped by label and error.
    pub errors: BTreeMap<String, usize>,
    /// How long after the start of the load test the last invocation started.
    pub last_started: Option<Duration>,
    /// Whether the load test was cut short by the run time limit or ctrl-c.
    pub canceled: bool,
}
impl RunSummary {
    /// Aggregate a snapshot of records.
    pub(crate) fn from_records(
        records: &[OutcomeRecord],
        started: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        let mut summary = RunSummary {
            started,
            duration,
            overall: OutcomeAggregate::new("Aggregated"),
            labels: BTreeMap::new(),
            scenarios: BTreeMap::new(),
            errors: BTreeMap::new(),
            last_started: None,
            canceled: false,
        };
        for record in records {
            let time = record.duration.as_millis() as u64;
            summary
                .labels
                .entry(record.label.clone())
                .or_insert_with(|| OutcomeAggregate::new(&record.label))
                .set_time(time, record.success);
            summary
                .scenarios
                .entry(record.scenario.clone())
                .or_insert_with(|| ScenarioSummary {
                    outcomes: OutcomeAggregate::new(&record.scenario),
                    ..Default::default()
                })
                .outcomes
                .set_time(time, record.success);
            if let Some(error) = record.error.as_ref() {
                *summary
                    .errors
                    .entry(format!("{}: {}", record.label, error))
                    .or_insert(0) += 1;
            }
            if summary
                .last_started
                .map_or(true, |last| record.elapsed > last)
            {
                summary.last_started = Some(record.elapsed);
            }
        }
        for scenario in summary.scenarios.values() {
            summary.overall.merge(&scenario.outcomes);
        }
        summary
    }

    /// Attach the lifecycle of a finished scenario, including scenarios that never
    /// recorded an outcome.
    pub(crate) fn attach_report(&mut self, report: ScenarioReport) {
        let scenario = self
            .scenarios
            .entry(report.name.clone())
            .or_insert_with(|| ScenarioSummary {
                outcomes: OutcomeAggregate::new(&report.name),
                ..Default::default()
            });
        scenario.executor = report.executor;
        scenario.phases = report.phases;
        scenario.stages = report.stages;
        scenario.canceled = report.canceled;
        scenario.max_users = report.max_users;
        self.canceled |= report.canceled;
    }

    /// Total number of task invocations.
    pub fn total_invocations(&self) -> usize {
        self.overall.counter
    }

    /// Number of task invocations that returned `Ok`.
    pub fn success_count(&self) -> usize {
        self.overall.success_count
    }

    /// Number of task invocations that failed or panicked.
    pub fn failure_count(&self) -> usize {
        self.overall.fail_count
    }

    /// Fraction of task invocations that failed, between 0 and 1.
    pub fn failure_rate(&self) -> f32 {
        self.overall.failure_rate()
    }

    /// The summary of one scenario.
    pub fn scenario(&self, name: &str) -> Option<&ScenarioSummary> {
        self.scenarios.get(name)
    }

    /// Print the summary to stdout.
    pub fn print(&self) {
        println!("{}", self);
    }

    fn fmt_invocations(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            fmt,
            "\n === PER SCENARIO OUTCOMES ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>13} | {:>14} | {:>8} | {:>7}",
            "Name", "# times run", "# fails", "task/s", "fail/s"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for (name, scenario) in &self.scenarios {
            self.fmt_invocation_row(fmt, name, &scenario.outcomes)?;
        }
        if self.scenarios.len() > 1 {
            writeln!(
                fmt,
                " -------------------------+---------------+----------------+----------+--------"
            )?;
            self.fmt_invocation_row(fmt, "Aggregated", &self.overall)?;
        }
        Ok(())
    }

    fn fmt_invocation_row(
        &self,
        fmt: &mut fmt::Formatter<'_>,
        name: &str,
        aggregate: &OutcomeAggregate,
    ) -> fmt::Result {
        let fail_percent = aggregate.failure_rate() * 100.0;
        let (runs, fails) = per_second_calculations(
            self.duration.as_secs() as usize,
            aggregate.counter,
            aggregate.fail_count,
        );
        // Compress 100.0 and 0.0 to 100 and 0 respectively to save width.
        let fails_column = if fail_percent as usize == 100 || fail_percent as usize == 0 {
            format!(
                "{} ({}%)",
                format_number(aggregate.fail_count),
                fail_percent as usize
            )
        } else {
            format!(
                "{} ({:.1}%)",
                format_number(aggregate.fail_count),
                fail_percent
            )
        };
        writeln!(
            fmt,
            " {:<24} | {:>13} | {:>14} | {:>8.runs_p$} | {:>7.fails_p$}",
            util::truncate_string(name, 24),
            format_number(aggregate.counter),
            fails_column,
            runs,
            fails,
            runs_p = determine_precision(runs),
            fails_p = determine_precision(fails),
        )
    }

    fn fmt_times(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            fmt,
            "\n === PER LABEL TIMES ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>11} | {:>10} | {:>11} | {:>10}",
            "Name", "Avg (ms)", "Min", "Max", "Median"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        let mut rows: Vec<&OutcomeAggregate> = self.labels.values().collect();
        if self.labels.len() > 1 {
            rows.push(&self.overall);
        }
        for aggregate in rows {
            let average = aggregate.mean_time();
            writeln!(
                fmt,
                " {:<24} | {:>11.avg_precision$} | {:>10} | {:>11} | {:>10}",
                util::truncate_string(&aggregate.name, 24),
                average,
                format_number(aggregate.min_time),
                format_number(aggregate.max_time),
                format_number(aggregate.percentile(0.5)),
                avg_precision = determine_precision(average),
            )?;
        }
        Ok(())
    }

    fn fmt_percentiles(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " Slowest invocation within specified percentile of invocations (in ms):"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>8} | {:>8} | {:>8} | {:>8} | {:>8}",
            "Name", "50%", "75%", "98%", "99%", "99.9%"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        let mut rows: Vec<&OutcomeAggregate> = self.labels.values().collect();
        if self.labels.len() > 1 {
            rows.push(&self.overall);
        }
        for aggregate in rows {
            let percentiles: Vec<String> = PERCENTILES
                .iter()
                .map(|percent| format_number(aggregate.percentile(*percent)))
                .collect();
            writeln!(
                fmt,
                " {:<24} | {:>8} | {:>8} | {:>8} | {:>8} | {:>8}",
                util::truncate_string(&aggregate.name, 24),
                percentiles[0],
                percentiles[1],
                percentiles[2],
                percentiles[3],
                percentiles[4],
            )?;
        }
        Ok(())
    }

    fn fmt_errors(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return Ok(());
        }
        writeln!(
            fmt,
            "\n === ERRORS ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(fmt, " {:<11} | Error", "Count")?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for (error, count) in &self.errors {
            writeln!(fmt, " {:<11} | {}", format_number(*count), error)?;
        }
        Ok(())
    }

    fn fmt_scenarios(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            fmt,
            "\n === SCENARIOS ===\n ------------------------------------------------------------------------------"
        )?;
        for (name, scenario) in &self.scenarios {
            writeln!(
                fmt,
                " {}: {} (max users: {}){}",
                name,
                scenario.executor,
                format_number(scenario.max_users),
                if scenario.canceled { ", canceled" } else { "" }
            )?;
            for transition in &scenario.phases {
                writeln!(
                    fmt,
                    "   {:<10} {}",
                    transition.phase,
                    transition.timestamp.format("%Y-%m-%d %H:%M:%S%.3f")
                )?;
            }
            for stage in &scenario.stages {
                writeln!(
                    fmt,
                    "   {:<10} {} ({} users)",
                    format!("{:?}", stage.action),
                    stage.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                    format_number(stage.users)
                )?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            fmt,
            "\n === RUN SUMMARY ===\n Started {}, ran for {}{}",
            self.started.format("%Y-%m-%d %H:%M:%S"),
            util::format_timespan(self.duration),
            if self.canceled { " (canceled)" } else { "" }
        )?;
        self.fmt_invocations(fmt)?;
        if self.overall.counter > 0 {
            self.fmt_times(fmt)?;
            self.fmt_percentiles(fmt)?;
        }
        self.fmt_errors(fmt)?;
        self.fmt_scenarios(fmt)
    }
}

pub(crate) fn per_second_calculations(duration: usize, total: usize, fail: usize) -> (f32, f32) {
    if duration == 0 {
        (0.0, 0.0)
    } else {
        (
            total as f32 / duration as f32,
            fail as f32 / duration as f32,
        )
    }
}

fn determine_precision(value: f32) -> usize {
    if value < 1000.0 {
        2
    } else {
        0
    }
}

/// Format large number in locale appropriate style.
pub(crate) fn format_number(number: usize) -> String {
    (number).to_formatted_string(&Locale::en)
}

/// Get the time that a certain number of percent of the invocations finished within.
pub(crate) fn calculate_percentile(
    times: &BTreeMap<usize, usize>,
    total: usize,
    min: usize,
    max: usize,
    percent: f32,
) -> usize {
    let percentile_invocation = (total as f32 * percent).round() as usize;
    debug!(
        "percentile: {}, invocation {} of total {}",
        percent, percentile_invocation, total
    );

    let mut total_count: usize = 0;
    for (value, counter) in times {
        total_count += counter;
        if total_count >= percentile_invocation {
            // Rounding can move a value outside of the recorded range.
            return (*value).clamp(min, max);
        }
    }
    0
}
