//! Plain-text command protocol
//!
//! One request per connection, one text response. Requests are matched
//! after trimming, lowercasing, and collapsing whitespace; anything
//! unrecognised gets `Unknown command` and touches no state.

use std::fmt;
use tracing::warn;

use crate::engine::{EngineHandle, EngineStatus};
use crate::{EngineError, Schedule};

/// Largest request read from a connection
pub const MAX_REQUEST_SIZE: usize = 1024;

pub const UNKNOWN_RESPONSE: &str = "Unknown command";

/// Parsed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandRequest {
    Status,
    Schedule,
    AlarmOn,
    AlarmOff,
    AlarmReset,
    LastFrame,
    Unknown,
}

impl CommandRequest {
    pub fn parse(text: &str) -> Self {
        let normalized = text
            .split_whitespace()
            .map(str::to_ascii_lowercase)
            .collect::<Vec<_>>()
            .join(" ");

        match normalized.as_str() {
            "status" => Self::Status,
            "schedule" => Self::Schedule,
            "alarm on" => Self::AlarmOn,
            "alarm off" => Self::AlarmOff,
            "alarm reset" => Self::AlarmReset,
            "last" => Self::LastFrame,
            _ => Self::Unknown,
        }
    }

    /// Whether the request changes alarm state
    pub fn mutates(&self) -> bool {
        matches!(self, Self::AlarmOn | Self::AlarmOff | Self::AlarmReset)
    }
}

impl fmt::Display for CommandRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Status => "status",
            Self::Schedule => "schedule",
            Self::AlarmOn => "alarm on",
            Self::AlarmOff => "alarm off",
            Self::AlarmReset => "alarm reset",
            Self::LastFrame => "last",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", text)
    }
}

pub fn format_status(status: &EngineStatus) -> String {
    let next = status.alarm.next_change;
    format!(
        "System Status:\n\
         Current Time: {}\n\
         System is: {}\n\
         Manual Override: {}\n\
         Next Schedule Change: {}:00 ({})",
        status.now.format("%H:%M:%S"),
        status.alarm.state,
        if status.alarm.manual_override { "Yes" } else { "No" },
        next.hour,
        next.action
    )
}

pub fn format_schedule(schedule: &Schedule) -> String {
    format!(
        "Schedule Settings:\nArm Time: {}:00\nDisarm Time: {}:00",
        schedule.arm, schedule.disarm
    )
}

/// Apply `request` to the engine and build the response text
pub async fn execute(handle: &EngineHandle, request: CommandRequest) -> String {
    let result = match request {
        CommandRequest::Status => handle.status().await.map(|s| format_status(&s)),
        CommandRequest::Schedule => handle.schedule().await.map(|s| format_schedule(&s)),
        CommandRequest::AlarmOn => match handle.arm().await {
            Ok(()) => Ok("Alarm activated".to_string()),
            Err(EngineError::CaptureUnavailable(e)) => {
                Ok(format!("Error: could not capture initial frame ({})", e))
            }
            Err(e) => Err(e),
        },
        CommandRequest::AlarmOff => handle
            .disarm()
            .await
            .map(|()| "Alarm deactivated".to_string()),
        CommandRequest::AlarmReset => handle.reset().await.map(|_| "Alarm reset".to_string()),
        CommandRequest::LastFrame => handle.send_last_frame().await.map(|path| match path {
            Some(_) => "Sending last motion frame".to_string(),
            None => "No motion frame available!".to_string(),
        }),
        CommandRequest::Unknown => Ok(UNKNOWN_RESPONSE.to_string()),
    };

    result.unwrap_or_else(|e| {
        warn!(%request, "Command failed: {}", e);
        format!("Error: {}", e)
    })
}
