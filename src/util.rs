//! Utility functions used by Gander, and available when writing load tests.

use regex::Regex;
use std::str::FromStr;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::watch;
use url::Url;

use crate::GanderError;

/// Parse a string representing a time span and return it as a [`Duration`].
///
/// Can be specified as an integer, indicating seconds. Or can use integers
/// together with one or more of "h", "m", "s" and "ms", in that order, indicating
/// "hours", "minutes", "seconds" and "milliseconds".
///
/// Valid formats include: 20, 20s, 3m, 2h, 1h20m, 3h30m10s, 1s500ms, 250ms, etc.
///
/// Returns `None` if the string can't be parsed.
///
/// # Example
/// ```rust
/// use gander::util;
/// use std::time::Duration;
///
/// // 1 hour 2 minutes and 3 seconds is 3,723 seconds.
/// assert_eq!(util::parse_timespan("1h2m3s"), Some(Duration::from_secs(3_723)));
///
/// // 45 seconds is 45 seconds.
/// assert_eq!(util::parse_timespan("45"), Some(Duration::from_secs(45)));
///
/// // Invalid value can't be parsed.
/// assert_eq!(util::parse_timespan("foo"), None);
/// ```
pub fn parse_timespan(time_str: &str) -> Option<Duration> {
    let time_str = time_str.trim();
    match u64::from_str(time_str) {
        // If an integer is passed in, assume it's seconds
        Ok(t) => {
            trace!("{} is integer: {} seconds", time_str, t);
            Some(Duration::from_secs(t))
        }
        // Otherwise use a regex to extract hours, minutes, seconds and milliseconds from string.
        Err(_) => {
            let re = Regex::new(
                r"^((?P<hours>\d+)h)?((?P<minutes>\d+)m)?((?P<seconds>\d+)s)?((?P<millis>\d+)ms)?$",
            )
            .ok()?;
            let time_matches = re.captures(time_str)?;
            let component = |name: &str| -> Option<u64> {
                time_matches
                    .name(name)
                    .and_then(|m| u64::from_str(m.as_str()).ok())
            };
            let (hours, minutes, seconds, millis) = (
                component("hours"),
                component("minutes"),
                component("seconds"),
                component("millis"),
            );
            // An empty string matches the regular expression, but is not a time span.
            if hours.is_none() && minutes.is_none() && seconds.is_none() && millis.is_none() {
                return None;
            }
            let total = Duration::from_secs(
                hours.unwrap_or(0) * 60 * 60 + minutes.unwrap_or(0) * 60 + seconds.unwrap_or(0),
            ) + Duration::from_millis(millis.unwrap_or(0));
            trace!("{}: {:?}", time_str, total);
            Some(total)
        }
    }
}

/// Format a [`Duration`] the way [`parse_timespan`] reads it.
///
/// # Example
/// ```rust
/// use gander::util;
/// use std::time::Duration;
///
/// assert_eq!(util::format_timespan(Duration::from_secs(90)), "1m30s");
/// assert_eq!(util::format_timespan(Duration::from_millis(1_250)), "1s250ms");
/// assert_eq!(util::format_timespan(Duration::ZERO), "0s");
/// ```
pub fn format_timespan(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let (hours, minutes, seconds) = (total_secs / 3600, (total_secs % 3600) / 60, total_secs % 60);
    let millis = duration.subsec_millis();

    let mut formatted = String::new();
    if hours > 0 {
        formatted.push_str(&format!("{}h", hours));
    }
    if minutes > 0 {
        formatted.push_str(&format!("{}m", minutes));
    }
    if seconds > 0 {
        formatted.push_str(&format!("{}s", seconds));
    }
    if millis > 0 {
        formatted.push_str(&format!("{}ms", millis));
    }
    if formatted.is_empty() {
        formatted.push_str("0s");
    }
    formatted
}

/// Truncate strings when they're too long to display.
///
/// If a string is longer than the specified max length, this function will return
/// a truncated version of the string, with `..` replacing the last characters.
///
/// # Example
/// ```rust
/// use gander::util;
///
/// assert_eq!("list t..", util::truncate_string("list todos", 8));
/// ```
pub fn truncate_string(str_to_truncate: &str, max_length: usize) -> String {
    if str_to_truncate.char_indices().count() > max_length {
        match str_to_truncate.char_indices().nth(max_length.saturating_sub(2)) {
            None => str_to_truncate.to_string(),
            Some((idx, _)) => format!("{}..", &str_to_truncate[..idx]),
        }
    } else {
        str_to_truncate.to_string()
    }
}

/// Helper function to determine if a host can be parsed.
///
/// # Example
/// ```rust
/// use gander::util;
///
/// // Hostname is a valid URL.
/// assert_eq!(util::is_valid_host("http://localhost/").is_ok(), true);
///
/// // Protocol is required
/// assert_eq!(util::is_valid_host("example.com/").is_ok(), false);
/// ```
pub fn is_valid_host(host: &str) -> Result<bool, GanderError> {
    Url::parse(host).map_err(|parse_error| GanderError::InvalidHost {
        host: host.to_string(),
        detail: "Invalid host.".to_string(),
        parse_error,
    })?;
    Ok(true)
}

// The load test ctrl-c currently drains. Only one handler can be registered per
// process, so each load test re-points it here.
static CTRLC_CANCEL: Mutex<Option<Arc<watch::Sender<bool>>>> = Mutex::new(None);
static CTRLC_HANDLER: Once = Once::new();

// Internal helper to configure the control-c handler. Drain cleanly on the first
// ctrl-c. Exit abruptly on the second ctrl-c.
pub(crate) fn setup_ctrlc_handler(cancel: Arc<watch::Sender<bool>>) {
    *CTRLC_CANCEL
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(cancel);

    CTRLC_HANDLER.call_once(|| {
        if let Err(e) = ctrlc::set_handler(|| {
            if ctrlc_pressed() {
                warn!("caught another ctrl-c, exiting immediately...");
                std::process::exit(1);
            }
        }) {
            info!("failed to set ctrl-c handler: {}", e);
        }
    });
}

// Request a drain of the current load test. Returns true if it was already draining,
// or if no load test is running.
fn ctrlc_pressed() -> bool {
    let cancel = CTRLC_CANCEL
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    match cancel {
        Some(cancel) if !*cancel.borrow() => {
            warn!("caught ctrl-c, draining all scenarios...");
            cancel.send_replace(true);
            false
        }
        _ => true,
    }
}
