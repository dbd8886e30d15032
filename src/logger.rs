//! Optional outcome log.
//!
//! When enabled with `--outcome-log <FILE>`, every [`OutcomeRecord`] is streamed to a
//! logger task as it is submitted, and written to the file in one of the following
//! formats, selected with `--outcome-format`:
//!  - `csv` (default): one comma separated row per outcome, after a header row
//!  - `json`: one JSON object per line
//!  - `raw`: the Rust debug representation of each outcome, one per line
//!  - `pretty`: the pretty-printed Rust debug representation of each outcome
//!
//! The logger task writes through Tokio's asynchronous
//! [`BufWriter`](https://docs.rs/tokio/*/tokio/io/struct.BufWriter.html), and flushes it
//! when the load test ends.
//!
//! A csv outcome log looks like:
//! ```csv
//! timestamp,elapsed,duration,success,label,scenario,user,iteration,error
//! 2025-09-05T15:00:00.125+00:00,125,17,true,list todos,studier,0,0,
//! 2025-09-05T15:00:00.131+00:00,131,32,false,create todo,planner,3,12,"unexpected status code (expected 200 OK, received 500 Internal Server Error)"
//! ```

use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::recorder::OutcomeRecord;
use crate::{GanderConfiguration, GanderError};

/// Formats the outcome log can be written in.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum GanderLogFormat {
    #[default]
    Csv,
    Json,
    Raw,
    Pretty,
}

const CSV_HEADER: &str = "timestamp,elapsed,duration,success,label,scenario,user,iteration,error";

// Quote a csv field if needed, doubling embedded quotes.
fn csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Format one outcome as a line of the outcome log, without a trailing line feed.
pub(crate) fn format_outcome(
    outcome: &OutcomeRecord,
    format: GanderLogFormat,
) -> Result<String, GanderError> {
    Ok(match format {
        GanderLogFormat::Csv => format!(
            "{},{},{},{},{},{},{},{},{}",
            outcome.timestamp.to_rfc3339(),
            outcome.elapsed.as_millis(),
            outcome.duration.as_millis(),
            outcome.success,
            csv_field(&outcome.label),
            csv_field(&outcome.scenario),
            outcome.user,
            outcome.iteration,
            csv_field(outcome.error.as_deref().unwrap_or("")),
        ),
        GanderLogFormat::Json => serde_json::to_string(outcome)?,
        GanderLogFormat::Raw => format!("{:?}", outcome),
        GanderLogFormat::Pretty => format!("{:#?}", outcome),
    })
}

impl GanderConfiguration {
    /// Create the outcome log file, if one is configured. Done before the load test
    /// starts so a bad path fails fast.
    pub(crate) async fn open_outcome_log(&self) -> Result<Option<BufWriter<File>>, GanderError> {
        if self.outcome_log.is_empty() {
            return Ok(None);
        }
        let file = File::create(&self.outcome_log).await?;
        info!("writing outcomes to: {}", &self.outcome_log);
        Ok(Some(BufWriter::with_capacity(64 * 1024, file)))
    }
}

/// Logger task: writes outcomes received from virtual users until it receives `None`,
/// or every sender is gone.
pub(crate) async fn logger_main(
    mut file: BufWriter<File>,
    format: GanderLogFormat,
    receiver: flume::Receiver<Option<OutcomeRecord>>,
) -> Result<(), GanderError> {
    if format == GanderLogFormat::Csv {
        file.write_all(format!("{}\n", CSV_HEADER).as_bytes())
            .await?;
    }

    while let Ok(message) = receiver.recv_async().await {
        if let Some(outcome) = message {
            let formatted = match format_outcome(&outcome, format) {
                Ok(formatted) => formatted,
                Err(e) => {
                    warn!("failed to format outcome: {}", e);
                    continue;
                }
            };
            if let Err(e) = file.write_all(format!("{}\n", formatted).as_bytes()).await {
                warn!("failed to write to outcome log: {}", e);
            }
        } else {
            // Empty message means it's time to exit.
            break;
        }
    }

    // Cleanup and flush the log to disk.
    info!("flushing outcome log");
    file.flush().await?;

    Ok(())
}
