//! Connectivity edges.
//!
//! Connectivity detection lives outside this crate; it only has to push
//! [`Reachability`] values into a channel. Repeated identical values are
//! collapsed so each real transition is acted on once.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reachability {
    Reachable,
    Unreachable,
}

/// Remembers the last observed state and reports only transitions.
#[derive(Debug, Default, Clone)]
pub struct ReachabilityTracker {
    last: Option<Reachability>,
}

impl ReachabilityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `Some(state)` when `state` differs from the previous one.
    /// The first observation always counts as an edge.
    pub fn observe(&mut self, state: Reachability) -> Option<Reachability> {
        if self.last == Some(state) {
            return None;
        }
        self.last = Some(state);
        Some(state)
    }

    pub fn last(&self) -> Option<Reachability> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_states_are_not_edges() {
        let mut tracker = ReachabilityTracker::new();
        assert_eq!(tracker.observe(Reachability::Unreachable), Some(Reachability::Unreachable));
        assert_eq!(tracker.observe(Reachability::Unreachable), None);
        assert_eq!(tracker.observe(Reachability::Reachable), Some(Reachability::Reachable));
        assert_eq!(tracker.observe(Reachability::Reachable), None);
        assert_eq!(tracker.last(), Some(Reachability::Reachable));
    }
}
