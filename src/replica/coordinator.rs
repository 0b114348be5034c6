use std::fmt;
use std::sync::Mutex;

/// Who this replica believes is coordinating, as seen by callers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CurrentCoordinator {
    Me,
    Other(String),
    Unknown,
}

enum State {
    /// Trusting a coordinator, or nobody yet (`coordinator: None` right
    /// after boot before the directory answered).
    Follower { coordinator: Option<String> },
    /// A bid is out, or a stronger peer acknowledged one; waiting for a
    /// `"servers"` announcement. Probes during this state re-trigger
    /// elections so a vanished winner cannot wedge us.
    Candidate,
    /// This replica announced itself; its log is the authoritative one.
    Leader,
}

/// Election standing as a small state machine. Transitions:
/// ping timeout -> `Candidate`; stronger peer acknowledged -> stay
/// `Candidate`; no peer answered -> `Leader`; `"servers"` announcement ->
/// `Follower` (or `Leader` when the announcement names us).
pub(crate) struct CoordinatorState {
    my_name: String,
    state: Mutex<State>,
}

impl CoordinatorState {
    pub(crate) fn new(my_name: impl Into<String>) -> Self {
        CoordinatorState {
            my_name: my_name.into(),
            state: Mutex::new(State::Follower { coordinator: None }),
        }
    }

    pub(crate) fn current(&self) -> CurrentCoordinator {
        match &*self.state.lock().expect("CoordinatorState mutex guard poison") {
            State::Leader => CurrentCoordinator::Me,
            State::Candidate => CurrentCoordinator::Unknown,
            State::Follower { coordinator: None } => CurrentCoordinator::Unknown,
            State::Follower {
                coordinator: Some(name),
            } => CurrentCoordinator::Other(name.clone()),
        }
    }

    pub(crate) fn is_me(&self) -> bool {
        self.current() == CurrentCoordinator::Me
    }

    pub(crate) fn transition_to_candidate(&self) {
        *self.state.lock().expect("CoordinatorState mutex guard poison") = State::Candidate;
    }

    pub(crate) fn transition_to_leader(&self) {
        *self.state.lock().expect("CoordinatorState mutex guard poison") = State::Leader;
    }

    /// Adopt an announced (or startup-chosen) coordinator. An announcement
    /// naming this replica is a leader transition, not a follow.
    pub(crate) fn accept_coordinator(&self, name: &str) {
        let mut state = self.state.lock().expect("CoordinatorState mutex guard poison");
        *state = if name == self.my_name {
            State::Leader
        } else {
            State::Follower {
                coordinator: Some(name.to_string()),
            }
        };
    }
}

impl fmt::Debug for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.state.lock().expect("CoordinatorState mutex guard poison") {
            State::Leader => write!(f, "Leader"),
            State::Candidate => write!(f, "Candidate"),
            State::Follower { coordinator: None } => write!(f, "Follower(?)"),
            State::Follower {
                coordinator: Some(name),
            } => write!(f, "Follower({})", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_without_a_coordinator() {
        let state = CoordinatorState::new("a");
        assert_eq!(state.current(), CurrentCoordinator::Unknown);
        assert!(!state.is_me());
    }

    #[test]
    fn announcement_naming_me_means_leader() {
        let state = CoordinatorState::new("a");
        state.accept_coordinator("a");
        assert_eq!(state.current(), CurrentCoordinator::Me);
    }

    #[test]
    fn full_election_round_transitions() {
        let state = CoordinatorState::new("a");
        state.accept_coordinator("c");
        assert_eq!(state.current(), CurrentCoordinator::Other("c".to_string()));

        // Ping timeout: become a candidate; standing is unknown meanwhile.
        state.transition_to_candidate();
        assert_eq!(state.current(), CurrentCoordinator::Unknown);

        // Nobody stronger answered: self-win.
        state.transition_to_leader();
        assert!(state.is_me());

        // A later announcement from a rejoined stronger peer demotes us.
        state.accept_coordinator("d");
        assert_eq!(state.current(), CurrentCoordinator::Other("d".to_string()));
    }
}
