//! Remote instruction model and poll-reply classification.
//!
//! The engine polls the StartRemoteSsh instruction until the node reports a
//! terminal state. Scheduling lives in the engine; this module only decides
//! what a reply means.
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::api::{ApiError, decode_success};

/// Delay between two polls of a non-terminal instruction.
pub const POLL_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstructionState {
    Unknown,
    Queuing,
    Queued,
    Received,
    Executing,
    Declined,
    Completed,
    Other(String),
}

impl InstructionState {
    pub fn parse(s: &str) -> Self {
        match s {
            "Unknown" => InstructionState::Unknown,
            "Queuing" => InstructionState::Queuing,
            "Queued" => InstructionState::Queued,
            "Received" => InstructionState::Received,
            "Executing" => InstructionState::Executing,
            "Declined" => InstructionState::Declined,
            "Completed" => InstructionState::Completed,
            other => InstructionState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            InstructionState::Unknown => "Unknown",
            InstructionState::Queuing => "Queuing",
            InstructionState::Queued => "Queued",
            InstructionState::Received => "Received",
            InstructionState::Executing => "Executing",
            InstructionState::Declined => "Declined",
            InstructionState::Completed => "Completed",
            InstructionState::Other(s) => s,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InstructionState::Completed | InstructionState::Declined)
    }
}

impl fmt::Display for InstructionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionData {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub topic: Option<String>,
    pub state: String,
}

/// What one poll reply means for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Completed,
    Declined,
    /// Keep waiting; carries the reported state for logging.
    Pending(InstructionState),
}

/// Classify an instruction-view reply. A reply without a `state` is an error.
pub fn classify_poll_reply(value: &Value) -> Result<PollOutcome, ApiError> {
    let data: InstructionData = decode_success(value)?;
    Ok(match InstructionState::parse(&data.state) {
        InstructionState::Completed => PollOutcome::Completed,
        InstructionState::Declined => PollOutcome::Declined,
        other => PollOutcome::Pending(other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(json: &str) -> Value {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn parse_known_and_unknown_states() {
        assert_eq!(InstructionState::parse("Queued"), InstructionState::Queued);
        assert_eq!(InstructionState::parse("Completed"), InstructionState::Completed);
        let odd = InstructionState::parse("Paused");
        assert_eq!(odd, InstructionState::Other("Paused".to_string()));
        assert_eq!(odd.to_string(), "Paused");
        assert!(!odd.is_terminal());
    }

    #[test]
    fn only_completed_and_declined_are_terminal() {
        for s in ["Unknown", "Queuing", "Queued", "Received", "Executing"] {
            assert!(!InstructionState::parse(s).is_terminal(), "{}", s);
        }
        assert!(InstructionState::Completed.is_terminal());
        assert!(InstructionState::Declined.is_terminal());
    }

    #[test]
    fn classify_terminal_replies() {
        let done = reply(r#"{"success":true,"data":{"id":5,"topic":"StartRemoteSsh","state":"Completed"}}"#);
        assert_eq!(classify_poll_reply(&done).unwrap(), PollOutcome::Completed);
        let declined = reply(r#"{"success":true,"data":{"id":5,"state":"Declined"}}"#);
        assert_eq!(classify_poll_reply(&declined).unwrap(), PollOutcome::Declined);
    }

    #[test]
    fn classify_pending_replies() {
        let queued = reply(r#"{"success":true,"data":{"state":"Queued"}}"#);
        assert_eq!(
            classify_poll_reply(&queued).unwrap(),
            PollOutcome::Pending(InstructionState::Queued)
        );
        let odd = reply(r#"{"success":true,"data":{"state":"Mystery"}}"#);
        assert!(matches!(classify_poll_reply(&odd).unwrap(), PollOutcome::Pending(_)));
    }

    #[test]
    fn classify_rejects_reply_without_state() {
        assert!(classify_poll_reply(&reply(r#"{"success":true,"data":{"id":5}}"#)).is_err());
        assert!(classify_poll_reply(&reply(r#"{"success":false}"#)).is_err());
    }
}
