//! Marlin-style line protocol: the commands a device issues on its own and
//! the classification of the lines that come back.
//!
//! Job payload lines never pass through here for interpretation; they are
//! forwarded verbatim by [`exchange`].

use super::state::{AxisMove, Temperatures};
use super::DeviceError;
use crate::transport::Connection;
use std::time::Duration;

pub const HOME: &str = "G28";
pub const AUTO_LEVEL: &str = "G29";
pub const REPORT_TEMPERATURES: &str = "M105";

pub fn set_hotend(target: f64) -> String {
    format!("M104 S{}", target)
}

pub fn set_bed(target: f64) -> String {
    format!("M140 S{}", target)
}

/// `G0` with only the supplied axes, or `None` for an empty move.
pub fn linear_move(axes: &AxisMove) -> Option<String> {
    if axes.is_empty() {
        return None;
    }
    let mut command = String::from("G0");
    for (letter, value) in [('X', axes.x), ('Y', axes.y), ('Z', axes.z), ('E', axes.e)] {
        if let Some(value) = value {
            command.push_str(&format!(" {}{}", letter, value));
        }
    }
    Some(command)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `ok`, possibly carrying a report.
    Ack,
    /// `Error:` or `!!` from the firmware.
    Error(String),
    /// Echo, busy and other chatter.
    Info,
}

pub fn classify(line: &str) -> Reply {
    if line.starts_with("ok") {
        Reply::Ack
    } else if let Some(message) = line.strip_prefix("Error:") {
        Reply::Error(message.trim().to_string())
    } else if let Some(message) = line.strip_prefix("!!") {
        Reply::Error(message.trim().to_string())
    } else {
        Reply::Info
    }
}

/// Parse `T:<cur> /<target> B:<cur> /<target>` out of a temperature report.
///
/// Returns `None` unless at least the hotend reading is present.
pub fn parse_temperature_report(line: &str) -> Option<Temperatures> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let mut report = Temperatures::default();
    let mut saw_hotend = false;

    for (i, token) in tokens.iter().enumerate() {
        let target = tokens
            .get(i + 1)
            .and_then(|t| t.strip_prefix('/'))
            .and_then(|t| t.parse::<f64>().ok());
        if let Some(value) = token.strip_prefix("T:") {
            report.hotend = value.parse().ok()?;
            report.target_hotend = target.unwrap_or(0.0);
            saw_hotend = true;
        } else if let Some(value) = token.strip_prefix("B:") {
            report.bed = value.parse().ok()?;
            report.target_bed = target.unwrap_or(0.0);
        }
    }
    saw_hotend.then_some(report)
}

/// Send one command and collect replies up to and including the `ok`.
///
/// Each received line restarts the timeout, so long-running commands that
/// emit `busy:` keep-alives do not time out.
pub async fn exchange(
    conn: &mut dyn Connection,
    command: &str,
    timeout: Duration,
) -> Result<Vec<String>, DeviceError> {
    conn.send(command).await?;
    let mut lines = Vec::new();
    loop {
        let line = conn.receive(timeout).await?;
        match classify(&line) {
            Reply::Ack => {
                lines.push(line);
                return Ok(lines);
            }
            Reply::Error(message) => {
                tracing::error!("{} rejected '{}': {}", conn.address(), command, message);
                return Err(DeviceError::Firmware(message));
            }
            Reply::Info => {
                tracing::trace!("{} chatter: {}", conn.address(), line);
                lines.push(line);
            }
        }
    }
}
