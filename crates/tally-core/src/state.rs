// ABOUTME: Defines CounterState and the pure reducer that folds actions into it.
// ABOUTME: The apply() method pattern-matches on Action to update the counter in place.

use serde::{Deserialize, Serialize};

use crate::action::Action;

/// The materialized counter state. `last_count` holds the value of
/// `counter` before the most recent increment or decrement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterState {
    pub counter: i64,
    pub last_count: i64,
}

impl CounterState {
    /// Create the default state: `counter = 0, last_count = 0`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a single action to mutate this state. Arithmetic wraps at the
    /// i64 boundary rather than panicking.
    pub fn apply(&mut self, action: &Action) {
        match action {
            Action::SetCount { value } => {
                self.counter = *value;
            }

            Action::Increment => {
                self.last_count = self.counter;
                self.counter = self.counter.wrapping_add(1);
            }

            Action::Decrement => {
                self.last_count = self.counter;
                self.counter = self.counter.wrapping_sub(1);
            }

            Action::Rehydrate { state } => {
                *self = *state;
            }
        }
    }
}

/// Pure reducer: returns the state that results from applying `action` to
/// `state`, leaving the input untouched.
pub fn reduce(state: &CounterState, action: &Action) -> CounterState {
    let mut next = *state;
    next.apply(action);
    next
}
