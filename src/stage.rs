//! Stage schedules driving ramping-concurrency scenarios.
//!
//! A [`RampSchedule`] is an ordered list of [`Stage`]s. Each stage ramps the number of
//! active virtual users from the previous stage's target (or from 0 for the first stage)
//! to its own target over its duration.

use chrono::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::util;
use crate::GanderError;

/// A time-boxed target concurrency level within a ramping scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// How long it takes to reach `target` from the previous stage's target.
    pub duration: Duration,
    /// How many virtual users are active when the stage ends.
    pub target: usize,
}
impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Stage { duration, target }
    }
}

/// How the target concurrency moves between stage boundaries.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum RampStyle {
    /// Interpolate linearly from the previous target to the stage target (default).
    #[default]
    Linear,
    /// Jump to the stage target as soon as the stage starts.
    Step,
}

/// An ordered sequence of [`Stage`]s.
///
/// # Example
/// ```rust
/// use gander::stage::{RampSchedule, RampStyle};
/// use std::time::Duration;
///
/// // Ramp to 1,500 users over a minute, to 7,500 over the next three, then back to 0.
/// let schedule: RampSchedule = "1500,1m;7500,3m;0,2m".parse().unwrap();
/// assert_eq!(schedule.total_duration(), Duration::from_secs(360));
/// assert_eq!(schedule.users_at(Duration::from_secs(30)), 750);
///
/// // The same stages, jumping straight to each target instead.
/// let schedule = schedule.set_style(RampStyle::Step);
/// assert_eq!(schedule.users_at(Duration::from_secs(30)), 1_500);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RampSchedule {
    stages: Vec<Stage>,
    style: RampStyle,
}
impl RampSchedule {
    /// Create a linearly interpolated schedule from stages.
    pub fn new(stages: Vec<Stage>) -> Self {
        RampSchedule {
            stages,
            style: RampStyle::default(),
        }
    }

    /// Change how the target moves between stage boundaries.
    pub fn set_style(mut self, style: RampStyle) -> Self {
        self.style = style;
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn style(&self) -> RampStyle {
        self.style
    }

    /// The combined duration of all stages.
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|stage| stage.duration).sum()
    }

    /// The largest number of users any stage asks for.
    pub fn max_target(&self) -> usize {
        self.stages
            .iter()
            .map(|stage| stage.target)
            .max()
            .unwrap_or(0)
    }

    /// Index of the stage running at `elapsed`, or `None` once all stages have ended.
    pub fn stage_at(&self, elapsed: Duration) -> Option<usize> {
        let mut stage_end = Duration::ZERO;
        for (index, stage) in self.stages.iter().enumerate() {
            stage_end += stage.duration;
            if elapsed < stage_end {
                return Some(index);
            }
        }
        None
    }

    /// The exact (unrounded) target concurrency at `elapsed`.
    ///
    /// After the final stage ends the target remains the final stage's target.
    pub fn target_at(&self, elapsed: Duration) -> f64 {
        let mut previous = 0.0;
        let mut stage_start = Duration::ZERO;
        for stage in &self.stages {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                let target = stage.target as f64;
                return match self.style {
                    RampStyle::Step => target,
                    RampStyle::Linear => {
                        // A stage reached here never has a zero duration: elapsed would
                        // already be past its end.
                        let progress = (elapsed - stage_start).as_secs_f64()
                            / stage.duration.as_secs_f64();
                        previous + (target - previous) * progress
                    }
                };
            }
            previous = stage.target as f64;
            stage_start = stage_end;
        }
        previous
    }

    /// The number of virtual users that should be active at `elapsed`: the target
    /// rounded to the nearest user.
    pub fn users_at(&self, elapsed: Duration) -> usize {
        self.target_at(elapsed).round() as usize
    }

    /// Describe what happens during the stage at `index`.
    pub(crate) fn stage_action(&self, index: usize) -> StageAction {
        let previous = if index == 0 {
            0
        } else {
            self.stages[index - 1].target
        };
        match self.stages[index].target.cmp(&previous) {
            std::cmp::Ordering::Greater => StageAction::Increasing,
            std::cmp::Ordering::Less => StageAction::Decreasing,
            std::cmp::Ordering::Equal => StageAction::Maintaining,
        }
    }

    /// Reject schedules that can't be run: no stages, or stages without a duration.
    pub(crate) fn validate(&self, scenario: &str) -> Result<(), GanderError> {
        if self.stages.is_empty() {
            return Err(GanderError::InvalidScenario {
                scenario: scenario.to_string(),
                detail: "a ramping scenario requires at least one stage".to_string(),
            });
        }
        if let Some(index) = self
            .stages
            .iter()
            .position(|stage| stage.duration.is_zero())
        {
            return Err(GanderError::InvalidScenario {
                scenario: scenario.to_string(),
                detail: format!("stage {} has a zero duration", index + 1),
            });
        }
        Ok(())
    }
}

/// Convert `"users,timespan"` string formatted stages to a [`RampSchedule`].
///
/// Users are represented simply as an integer. Time span can be specified as an integer,
/// indicating seconds, or with the formats accepted by [`util::parse_timespan`]. Stages
/// are separated by a semicolon, for example `"10,30s;10,1m;0,30s"`. The stages may be
/// prefixed with a [`RampStyle`], as in `"step:10,30s;0,30s"`; linear is the default.
impl FromStr for RampSchedule {
    type Err = GanderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |line: &str, detail: &str| GanderError::InvalidOption {
            option: "ramp schedule".to_string(),
            value: line.to_string(),
            detail: detail.to_string(),
        };

        let (style, s) = match s.split_once(':') {
            Some((style, stages)) => (
                RampStyle::from_str(style.trim())
                    .map_err(|_| invalid(style, "ramp style must be \"linear\" or \"step\""))?,
                stages,
            ),
            None => (RampStyle::Linear, s),
        };

        let mut stages = Vec::new();
        for line in s.split(';') {
            // Tolerate a trailing semicolon.
            if line.trim().is_empty() {
                continue;
            }
            let (users, timespan) = line
                .split_once(',')
                .ok_or_else(|| invalid(line, "expected format \"{users},{timespan}\""))?;
            let target = usize::from_str(users.trim())
                .map_err(|_| invalid(line, "{users} must be an integer, ie \"100\""))?;
            let duration = util::parse_timespan(timespan).ok_or_else(|| {
                invalid(
                    line,
                    "{timespan} can be integer seconds or \"30s\", \"20m\", \"3h\", \"1h30m\", etc",
                )
            })?;
            stages.push(Stage::new(duration, target));
        }
        Ok(RampSchedule::new(stages).set_style(style))
    }
}

impl fmt::Display for RampSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stages: Vec<String> = self
            .stages
            .iter()
            .map(|stage| {
                format!(
                    "{},{}",
                    stage.target,
                    util::format_timespan(stage.duration)
                )
            })
            .collect();
        if self.style == RampStyle::Step {
            write!(f, "{}:", self.style)?;
        }
        write!(f, "{}", stages.join(";"))
    }
}

/// A ramping scenario moves through stages performing one of the following actions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageAction {
    /// A stage that is increasing the number of virtual users.
    Increasing,
    /// A stage that is maintaining the number of virtual users.
    Maintaining,
    /// A stage that is decreasing the number of virtual users.
    Decreasing,
    /// The schedule was cut short and all virtual users are draining.
    Canceling,
    /// The final stage ended.
    Finished,
}

/// A historical record of a single stage transition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageHistory {
    /// What action happened in this stage.
    pub action: StageAction,
    /// When the stage started.
    pub timestamp: DateTime<Utc>,
    /// The number of active users when the stage started.
    pub users: usize,
}
impl StageHistory {
    pub(crate) fn step(action: StageAction, users: usize) -> StageHistory {
        StageHistory {
            action,
            timestamp: Utc::now(),
            users,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn studier_schedule() -> RampSchedule {
        RampSchedule::new(vec![
            Stage::new(Duration::from_secs(60), 1_500),
            Stage::new(Duration::from_secs(180), 7_500),
            Stage::new(Duration::from_secs(120), 0),
        ])
    }

    #[test]
    fn linear_interpolation() {
        let schedule = studier_schedule();
        assert_eq!(schedule.users_at(Duration::ZERO), 0);
        assert_eq!(schedule.users_at(Duration::from_secs(30)), 750);
        assert_eq!(schedule.users_at(Duration::from_secs(60)), 1_500);
        assert_eq!(schedule.users_at(Duration::from_secs(150)), 4_500);
        assert_eq!(schedule.users_at(Duration::from_secs(240)), 7_500);
        assert_eq!(schedule.users_at(Duration::from_secs(300)), 3_750);
        assert_eq!(schedule.users_at(Duration::from_secs(360)), 0);
        assert_eq!(schedule.users_at(Duration::from_secs(1_000)), 0);
    }

    #[test]
    fn step_interpolation() {
        let schedule = studier_schedule().set_style(RampStyle::Step);
        assert_eq!(schedule.users_at(Duration::ZERO), 1_500);
        assert_eq!(schedule.users_at(Duration::from_secs(59)), 1_500);
        assert_eq!(schedule.users_at(Duration::from_secs(61)), 7_500);
        assert_eq!(schedule.users_at(Duration::from_secs(300)), 0);
    }

    #[test]
    fn rounded_users_never_exceed_ceiling() {
        let schedule = RampSchedule::new(vec![
            Stage::new(Duration::from_millis(700), 3),
            Stage::new(Duration::from_millis(300), 3),
            Stage::new(Duration::from_millis(900), 1),
        ]);
        let mut elapsed = Duration::ZERO;
        while elapsed < Duration::from_secs(2) {
            let target = schedule.target_at(elapsed);
            assert!(schedule.users_at(elapsed) as f64 <= target.ceil());
            elapsed += Duration::from_millis(7);
        }
    }

    #[test]
    fn final_target_holds_after_schedule() {
        let schedule = RampSchedule::new(vec![Stage::new(Duration::from_secs(10), 4)]);
        assert_eq!(schedule.stage_at(Duration::from_secs(9)), Some(0));
        assert_eq!(schedule.stage_at(Duration::from_secs(10)), None);
        assert_eq!(schedule.users_at(Duration::from_secs(11)), 4);
    }

    #[test]
    fn stage_lookup_and_actions() {
        let schedule: RampSchedule = "10,10s;10,10s;0,5s".parse().unwrap();
        assert_eq!(schedule.stage_at(Duration::ZERO), Some(0));
        assert_eq!(schedule.stage_at(Duration::from_secs(15)), Some(1));
        assert_eq!(schedule.stage_at(Duration::from_secs(24)), Some(2));
        assert_eq!(schedule.stage_action(0), StageAction::Increasing);
        assert_eq!(schedule.stage_action(1), StageAction::Maintaining);
        assert_eq!(schedule.stage_action(2), StageAction::Decreasing);
        assert_eq!(schedule.max_target(), 10);
    }

    #[test]
    fn parse_schedule() {
        let schedule: RampSchedule = "1500,1m;7500,3m;0,2m".parse().unwrap();
        assert_eq!(schedule, studier_schedule());
        assert_eq!(schedule.to_string(), "1500,1m;7500,3m;0,2m");

        // White space and a trailing semicolon are ignored.
        let schedule: RampSchedule = " 5 , 500ms ; 0,1s;".parse().unwrap();
        assert_eq!(
            schedule.stages(),
            &[
                Stage::new(Duration::from_millis(500), 5),
                Stage::new(Duration::from_secs(1), 0)
            ]
        );

        assert!("10".parse::<RampSchedule>().is_err());
        assert!("ten,1m".parse::<RampSchedule>().is_err());
        assert!("10,1 minute".parse::<RampSchedule>().is_err());
        assert!("-1,1m".parse::<RampSchedule>().is_err());
        assert!("curved:10,1m".parse::<RampSchedule>().is_err());
    }

    #[test]
    fn parse_schedule_style() {
        let schedule: RampSchedule = "step:1500,1m;7500,3m;0,2m".parse().unwrap();
        assert_eq!(schedule, studier_schedule().set_style(RampStyle::Step));
        assert_eq!(schedule.to_string(), "step:1500,1m;7500,3m;0,2m");
        assert_eq!(schedule.to_string().parse::<RampSchedule>().unwrap(), schedule);

        let schedule: RampSchedule = "Linear: 1500,1m;7500,3m;0,2m".parse().unwrap();
        assert_eq!(schedule, studier_schedule());
        // Linear is the default, and isn't written out.
        assert_eq!(schedule.to_string(), "1500,1m;7500,3m;0,2m");
    }

    #[test]
    fn validate_schedule() {
        assert!(studier_schedule().validate("studier").is_ok());
        assert!(matches!(
            RampSchedule::new(vec![]).validate("studier"),
            Err(GanderError::InvalidScenario { .. })
        ));
        assert!(matches!(
            "10,1m;10,0".parse::<RampSchedule>().unwrap().validate("studier"),
            Err(GanderError::InvalidScenario { .. })
        ));
    }

    #[test]
    fn parse_ramp_style() {
        assert_eq!("linear".parse::<RampStyle>().unwrap(), RampStyle::Linear);
        assert_eq!("STEP".parse::<RampStyle>().unwrap(), RampStyle::Step);
        assert!("curved".parse::<RampStyle>().is_err());
        assert_eq!(RampStyle::Step.to_string(), "step");
    }
}
