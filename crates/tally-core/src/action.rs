// ABOUTME: Defines the Action enum representing every mutation that can be dispatched to the store.
// ABOUTME: Actions are plain data; the reducer in state.rs gives them meaning.

use serde::{Deserialize, Serialize};

use crate::state::CounterState;

/// A request to change the counter. Dispatched through a `StoreHandle`
/// and folded into state by the reducer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Action {
    SetCount { value: i64 },
    Increment,
    Decrement,
    /// Replaces the whole state with a snapshot restored from storage.
    Rehydrate { state: CounterState },
}

impl Action {
    /// True for the persistence-internal rehydrate action.
    pub fn is_rehydrate(&self) -> bool {
        matches!(self, Action::Rehydrate { .. })
    }
}
