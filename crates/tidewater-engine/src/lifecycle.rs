//! Per-source state machine registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tidewater_types::record::SourceId;
use tidewater_types::state::SourceState;

/// Current [`SourceState`] of every known source. Cheap to clone.
#[derive(Clone, Default)]
pub struct SourceStateRegistry {
    states: Arc<Mutex<HashMap<SourceId, SourceState>>>,
}

impl SourceStateRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Move `source` to `next` if the move is legal.
    ///
    /// Unknown sources start in [`SourceState::Idle`]. An illegal move is
    /// logged and leaves the state unchanged.
    pub fn transition(&self, source: &SourceId, next: SourceState) -> bool {
        let Ok(mut states) = self.states.lock() else {
            tracing::error!(source = %source, "source state registry lock poisoned");
            return false;
        };
        let current = states.entry(source.clone()).or_default();
        if *current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            tracing::warn!(
                source = %source,
                from = %current,
                to = %next,
                "Rejected illegal source state transition"
            );
            return false;
        }
        tracing::trace!(source = %source, from = %current, to = %next, "Source state changed");
        *current = next;
        true
    }

    #[must_use]
    pub fn get(&self, source: &SourceId) -> SourceState {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(source).copied())
            .unwrap_or_default()
    }

    /// Sorted copy of all states.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<SourceId, SourceState> {
        self.states
            .lock()
            .map(|states| states.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_cycle() {
        let registry = SourceStateRegistry::new();
        let orders = SourceId::new("orders");
        for next in [
            SourceState::Ingesting,
            SourceState::Transforming,
            SourceState::DeadLettering,
            SourceState::Committing,
            SourceState::Idle,
        ] {
            assert!(registry.transition(&orders, next), "move to {next} refused");
        }
        assert_eq!(registry.get(&orders), SourceState::Idle);
    }

    #[test]
    fn illegal_transition_is_refused() {
        let registry = SourceStateRegistry::new();
        let orders = SourceId::new("orders");
        assert!(!registry.transition(&orders, SourceState::Committing));
        assert_eq!(registry.get(&orders), SourceState::Idle);
    }

    #[test]
    fn recovering_reachable_from_anywhere() {
        let registry = SourceStateRegistry::new();
        let orders = SourceId::new("orders");
        registry.transition(&orders, SourceState::Ingesting);
        registry.transition(&orders, SourceState::Transforming);
        assert!(registry.transition(&orders, SourceState::Recovering));
        assert!(registry.transition(&orders, SourceState::Idle));
        assert_eq!(
            registry.snapshot().into_iter().collect::<Vec<_>>(),
            vec![(orders, SourceState::Idle)]
        );
    }
}
