#[cfg(feature = "testing")]
use proptest_derive::Arbitrary;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

#[cfg_attr(feature = "testing", derive(Arbitrary))]
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Display,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryState {
    #[default]
    Queued, // Query was classified and enqueued at its leaf group
    Running,  // Query was admitted and handed to the execution engine
    Finished, // Query completed successfully
    Failed,   // Query was rejected, cancelled, or failed during execution
}

impl QueryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryState::Finished | QueryState::Failed)
    }

    pub fn transitions(&self) -> Vec<QueryState> {
        match self {
            // A query never re-enters Queued after Running.
            QueryState::Queued => vec![QueryState::Running, QueryState::Failed],
            QueryState::Running => vec![QueryState::Finished, QueryState::Failed],
            QueryState::Finished | QueryState::Failed => vec![],
        }
    }

    pub fn invalid_transitions(&self) -> Vec<QueryState> {
        let valid = self.transitions();
        QueryState::iter()
            .filter(|s| *s != *self && !valid.contains(s))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_never_finishes_directly() {
        assert!(!QueryState::Queued.transitions().contains(&QueryState::Finished));
        assert!(
            QueryState::Queued
                .invalid_transitions()
                .contains(&QueryState::Finished)
        );
    }

    #[test]
    fn terminal_states_have_no_transitions() {
        assert!(QueryState::Finished.transitions().is_empty());
        assert!(QueryState::Failed.transitions().is_empty());
        assert!(QueryState::Finished.is_terminal());
        assert!(QueryState::Failed.is_terminal());
        assert!(!QueryState::Running.is_terminal());
    }
}
