//! Execution state machine
//!
//! Mission progress only moves along declared transitions. Illegal
//! transitions are reported back to the caller and never clamp the state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

/// Where the vehicle is in the mission pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Idle,
    Downloading,
    Uploading,
    Armed,
    InFlight,
    Completing,
    Cancelling,
    Error,
    Rejected,
}

impl ExecutionState {
    pub const ALL: [ExecutionState; 9] = [
        Self::Idle,
        Self::Downloading,
        Self::Uploading,
        Self::Armed,
        Self::InFlight,
        Self::Completing,
        Self::Cancelling,
        Self::Error,
        Self::Rejected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Downloading => "DOWNLOADING",
            Self::Uploading => "UPLOADING",
            Self::Armed => "ARMED",
            Self::InFlight => "IN_FLIGHT",
            Self::Completing => "COMPLETING",
            Self::Cancelling => "CANCELLING",
            Self::Error => "ERROR",
            Self::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events accepted by [`StateMachine::trigger`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    Download,
    Upload,
    Arm,
    Fly,
    Complete,
    Idle,
    Cancel,
    Emergency,
    Error,
    Reset,
    Reject,
}

impl Event {
    pub const ALL: [Event; 11] = [
        Self::Download,
        Self::Upload,
        Self::Arm,
        Self::Fly,
        Self::Complete,
        Self::Idle,
        Self::Cancel,
        Self::Emergency,
        Self::Error,
        Self::Reset,
        Self::Reject,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Upload => "upload",
            Self::Arm => "arm",
            Self::Fly => "fly",
            Self::Complete => "complete",
            Self::Idle => "idle",
            Self::Cancel => "cancel",
            Self::Emergency => "emergency",
            Self::Error => "error",
            Self::Reset => "reset",
            Self::Reject => "reject",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transition table
///
/// ```text
/// IDLE        -> download: DOWNLOADING | reject: REJECTED | error: ERROR
/// DOWNLOADING -> upload: UPLOADING     | cancel: CANCELLING | error: ERROR
/// UPLOADING   -> arm: ARMED            | cancel: CANCELLING | error: ERROR
/// ARMED       -> fly: IN_FLIGHT        | cancel: CANCELLING | error: ERROR
/// IN_FLIGHT   -> complete: COMPLETING  | cancel/emergency: CANCELLING | error: ERROR
/// COMPLETING  -> idle: IDLE            | error: ERROR
/// CANCELLING  -> idle: IDLE            | error: ERROR
/// ERROR       -> reset: IDLE
/// REJECTED    -> idle: IDLE
/// ```
fn next_state(state: ExecutionState, event: Event) -> Option<ExecutionState> {
    use ExecutionState as S;

    let next = match (state, event) {
        (S::Idle, Event::Download) => S::Downloading,
        (S::Idle, Event::Reject) => S::Rejected,
        (S::Idle, Event::Error) => S::Error,

        (S::Downloading, Event::Upload) => S::Uploading,
        (S::Downloading, Event::Cancel) => S::Cancelling,
        (S::Downloading, Event::Error) => S::Error,

        (S::Uploading, Event::Arm) => S::Armed,
        (S::Uploading, Event::Cancel) => S::Cancelling,
        (S::Uploading, Event::Error) => S::Error,

        (S::Armed, Event::Fly) => S::InFlight,
        (S::Armed, Event::Cancel) => S::Cancelling,
        (S::Armed, Event::Error) => S::Error,

        (S::InFlight, Event::Complete) => S::Completing,
        (S::InFlight, Event::Cancel | Event::Emergency) => S::Cancelling,
        (S::InFlight, Event::Error) => S::Error,

        (S::Completing | S::Cancelling, Event::Idle) => S::Idle,
        (S::Completing | S::Cancelling, Event::Error) => S::Error,

        (S::Error, Event::Reset) => S::Idle,
        (S::Rejected, Event::Idle) => S::Idle,

        _ => return None,
    };
    Some(next)
}

/// Error returned when an event is not valid from the current state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalTransition {
    pub state: ExecutionState,
    pub event: Event,
    pub valid_events: BTreeSet<Event>,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let valid: Vec<&str> = self.valid_events.iter().map(|e| e.as_str()).collect();
        write!(
            f,
            "Event '{}' invalid from {}. Valid: {:?}",
            self.event, self.state, valid
        )
    }
}

impl std::error::Error for IllegalTransition {}

/// The execution state machine
///
/// Owned by the job coordinator. Nothing else holds a mutable handle.
#[derive(Debug)]
pub struct StateMachine {
    state: ExecutionState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: ExecutionState::Idle,
        }
    }

    /// Apply `event`, returning `Ok(true)` when the state moved
    ///
    /// On an illegal pair the state is left untouched.
    pub fn trigger(&mut self, event: Event) -> Result<bool, IllegalTransition> {
        match next_state(self.state, event) {
            Some(next) => {
                debug!(from = %self.state, to = %next, event = %event, "State transition");
                self.state = next;
                Ok(true)
            }
            None => Err(IllegalTransition {
                state: self.state,
                event,
                valid_events: self.valid_events(),
            }),
        }
    }

    pub fn get_state(&self) -> ExecutionState {
        self.state
    }

    /// Whether `event` would be accepted from the current state
    pub fn can_trigger(&self, event: Event) -> bool {
        next_state(self.state, event).is_some()
    }

    /// Events accepted from the current state
    pub fn valid_events(&self) -> BTreeSet<Event> {
        Event::ALL
            .into_iter()
            .filter(|event| next_state(self.state, *event).is_some())
            .collect()
    }

    /// Unconditionally return to IDLE, bypassing the table
    ///
    /// Reserved for the coordinator's failure and cleanup paths.
    pub fn force_reset(&mut self) {
        if self.state != ExecutionState::Idle {
            debug!(from = %self.state, "Forcing state reset to IDLE");
        }
        self.state = ExecutionState::Idle;
    }

    #[cfg(test)]
    pub(crate) fn with_state(state: ExecutionState) -> Self {
        Self { state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DECLARED: &[(ExecutionState, Event, ExecutionState)] = &[
        (ExecutionState::Idle, Event::Download, ExecutionState::Downloading),
        (ExecutionState::Idle, Event::Error, ExecutionState::Error),
        (ExecutionState::Idle, Event::Reject, ExecutionState::Rejected),
        (ExecutionState::Downloading, Event::Upload, ExecutionState::Uploading),
        (ExecutionState::Downloading, Event::Cancel, ExecutionState::Cancelling),
        (ExecutionState::Downloading, Event::Error, ExecutionState::Error),
        (ExecutionState::Uploading, Event::Arm, ExecutionState::Armed),
        (ExecutionState::Uploading, Event::Cancel, ExecutionState::Cancelling),
        (ExecutionState::Uploading, Event::Error, ExecutionState::Error),
        (ExecutionState::Armed, Event::Fly, ExecutionState::InFlight),
        (ExecutionState::Armed, Event::Cancel, ExecutionState::Cancelling),
        (ExecutionState::Armed, Event::Error, ExecutionState::Error),
        (ExecutionState::InFlight, Event::Complete, ExecutionState::Completing),
        (ExecutionState::InFlight, Event::Cancel, ExecutionState::Cancelling),
        (ExecutionState::InFlight, Event::Emergency, ExecutionState::Cancelling),
        (ExecutionState::InFlight, Event::Error, ExecutionState::Error),
        (ExecutionState::Completing, Event::Idle, ExecutionState::Idle),
        (ExecutionState::Completing, Event::Error, ExecutionState::Error),
        (ExecutionState::Cancelling, Event::Idle, ExecutionState::Idle),
        (ExecutionState::Cancelling, Event::Error, ExecutionState::Error),
        (ExecutionState::Error, Event::Reset, ExecutionState::Idle),
        (ExecutionState::Rejected, Event::Idle, ExecutionState::Idle),
    ];

    fn declared(state: ExecutionState, event: Event) -> Option<ExecutionState> {
        DECLARED
            .iter()
            .find(|(s, e, _)| *s == state && *e == event)
            .map(|(_, _, next)| *next)
    }

    #[test]
    fn test_full_valid_transitions() {
        let mut sm = StateMachine::new();
        let mut seen = Vec::new();

        let pipeline = [
            Event::Download,
            Event::Upload,
            Event::Arm,
            Event::Fly,
            Event::Complete,
            Event::Idle,
        ];
        for event in pipeline {
            assert_eq!(sm.trigger(event), Ok(true));
            seen.push(sm.get_state());
        }

        assert_eq!(
            seen,
            vec![
                ExecutionState::Downloading,
                ExecutionState::Uploading,
                ExecutionState::Armed,
                ExecutionState::InFlight,
                ExecutionState::Completing,
                ExecutionState::Idle,
            ]
        );
    }

    #[test]
    fn test_every_declared_transition() {
        for (from, event, to) in DECLARED {
            let mut sm = StateMachine::with_state(*from);
            assert_eq!(sm.trigger(*event), Ok(true), "{} --{}-->", from, event);
            assert_eq!(sm.get_state(), *to);
        }
    }

    #[test]
    fn test_undeclared_pairs_fail_without_mutation() {
        for state in ExecutionState::ALL {
            for event in Event::ALL {
                if declared(state, event).is_some() {
                    continue;
                }
                let mut sm = StateMachine::with_state(state);
                let err = sm.trigger(event).unwrap_err();
                assert_eq!(err.state, state);
                assert_eq!(err.event, event);
                assert_eq!(sm.get_state(), state, "{} mutated by {}", state, event);
            }
        }
    }

    #[test]
    fn test_illegal_transition_lists_valid_events() {
        let mut sm = StateMachine::new();
        let err = sm.trigger(Event::Upload).unwrap_err();

        let expected: BTreeSet<Event> =
            [Event::Download, Event::Error, Event::Reject].into_iter().collect();
        assert_eq!(err.valid_events, expected);
        assert_eq!(
            err.to_string(),
            "Event 'upload' invalid from IDLE. Valid: [\"download\", \"error\", \"reject\"]"
        );
    }

    #[test]
    fn test_force_reset_from_any_state() {
        for state in ExecutionState::ALL {
            let mut sm = StateMachine::with_state(state);
            sm.force_reset();
            assert_eq!(sm.get_state(), ExecutionState::Idle);
        }
    }

    #[test]
    fn test_reset_from_error() {
        let mut sm = StateMachine::new();
        sm.trigger(Event::Download).unwrap();
        sm.trigger(Event::Error).unwrap();
        assert_eq!(sm.get_state(), ExecutionState::Error);

        sm.trigger(Event::Reset).unwrap();
        assert_eq!(sm.get_state(), ExecutionState::Idle);
    }

    #[test]
    fn test_rejected_round_trip() {
        let mut sm = StateMachine::new();
        sm.trigger(Event::Reject).unwrap();
        assert_eq!(sm.get_state(), ExecutionState::Rejected);
        assert!(!sm.can_trigger(Event::Download));

        sm.trigger(Event::Idle).unwrap();
        assert_eq!(sm.get_state(), ExecutionState::Idle);
    }
}
