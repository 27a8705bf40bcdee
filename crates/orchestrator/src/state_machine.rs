use protocol_core::{ProtocolError, Result, RunState};

pub struct RunStateMachine;

impl RunStateMachine {
    pub fn validate_transition(from: &RunState, to: &RunState) -> Result<()> {
        let allowed = Self::allowed_transitions(from);

        if allowed.contains(to) {
            Ok(())
        } else {
            Err(ProtocolError::conflict(format!(
                "Invalid run state transition from {} to {}",
                from.as_str(),
                to.as_str()
            )))
        }
    }

    fn allowed_transitions(from: &RunState) -> &'static [RunState] {
        match from {
            RunState::Starting => &[RunState::Active, RunState::Errored, RunState::Canceled],
            RunState::Active => &[
                RunState::WaitingForInput,
                RunState::Completed,
                RunState::Errored,
                RunState::Canceled,
            ],
            RunState::WaitingForInput => &[RunState::Active, RunState::Errored, RunState::Canceled],
            RunState::Completed | RunState::Errored | RunState::Canceled => &[],
        }
    }

    pub fn can_transition(from: &RunState, to: &RunState) -> bool {
        Self::validate_transition(from, to).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        assert!(RunStateMachine::can_transition(
            &RunState::Starting,
            &RunState::Active
        ));
        assert!(RunStateMachine::can_transition(
            &RunState::Active,
            &RunState::WaitingForInput
        ));
        assert!(RunStateMachine::can_transition(
            &RunState::WaitingForInput,
            &RunState::Active
        ));
        assert!(RunStateMachine::can_transition(
            &RunState::WaitingForInput,
            &RunState::Canceled
        ));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!RunStateMachine::can_transition(
            &RunState::Starting,
            &RunState::WaitingForInput
        ));
        assert!(!RunStateMachine::can_transition(
            &RunState::WaitingForInput,
            &RunState::Completed
        ));
        assert!(!RunStateMachine::can_transition(
            &RunState::Active,
            &RunState::Starting
        ));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [RunState::Completed, RunState::Errored, RunState::Canceled] {
            for to in [
                RunState::Starting,
                RunState::Active,
                RunState::WaitingForInput,
                RunState::Completed,
                RunState::Errored,
                RunState::Canceled,
            ] {
                assert!(!RunStateMachine::can_transition(&terminal, &to));
            }
        }
    }

    #[test]
    fn test_rejection_is_conflict() {
        let err = RunStateMachine::validate_transition(&RunState::Active, &RunState::Active)
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(err.to_string().contains("active"));
    }
}
