// ABOUTME: Defines the Transition record broadcast to subscribers after each committed action.
// ABOUTME: A transition pairs the applied action with the resulting state and a sequence number.

use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::state::CounterState;

/// A committed state change. `seq` starts at 1 and increases by one for
/// every action the store applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub seq: u64,
    pub action: Action,
    pub state: CounterState,
}
