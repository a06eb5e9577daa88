// ABOUTME: Core library for tally, containing the counter state, actions, and reducer.
// ABOUTME: Also hosts the store actor that serializes dispatches and broadcasts transitions.

pub mod action;
pub mod state;
pub mod store;
pub mod transition;

pub use action::Action;
pub use state::{CounterState, reduce};
pub use store::{StateReader, StoreError, StoreHandle, spawn};
pub use transition::Transition;
