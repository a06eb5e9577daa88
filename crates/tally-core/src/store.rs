// ABOUTME: Async store actor that applies dispatched actions and publishes transitions via tokio channels.
// ABOUTME: Provides StoreHandle for dispatching actions, subscribing to transitions, and reading state.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{RwLock, broadcast, mpsc, oneshot};

use crate::action::Action;
use crate::state::CounterState;
use crate::transition::Transition;

/// Errors that can occur when dispatching to the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store channel closed")]
    ChannelClosed,
}

/// Message type sent through the action channel: an action paired with
/// a oneshot sender for the resulting state.
type ActionMessage = (Action, oneshot::Sender<CounterState>);

/// Public handle for interacting with a store actor. Supports dispatching
/// actions, subscribing to transitions, and reading the current state.
///
/// The actor stops once every clone of the handle has been dropped.
#[derive(Clone)]
pub struct StoreHandle {
    action_tx: mpsc::Sender<ActionMessage>,
    transition_tx: broadcast::Sender<Transition>,
    state: Arc<RwLock<CounterState>>,
}

impl StoreHandle {
    /// Send an action to the actor and await the resulting state.
    pub async fn dispatch(&self, action: Action) -> Result<CounterState, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.action_tx
            .send((action, tx))
            .await
            .map_err(|_| StoreError::ChannelClosed)?;
        rx.await.map_err(|_| StoreError::ChannelClosed)
    }

    pub async fn set_count(&self, value: i64) -> Result<CounterState, StoreError> {
        self.dispatch(Action::SetCount { value }).await
    }

    pub async fn increment(&self) -> Result<CounterState, StoreError> {
        self.dispatch(Action::Increment).await
    }

    pub async fn decrement(&self) -> Result<CounterState, StoreError> {
        self.dispatch(Action::Decrement).await
    }

    /// Subscribe to the transition broadcast stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.transition_tx.subscribe()
    }

    /// Get a read-only reference to the shared state.
    pub async fn read_state(&self) -> tokio::sync::RwLockReadGuard<'_, CounterState> {
        self.state.read().await
    }

    /// Copy out the current state.
    pub async fn get_state(&self) -> CounterState {
        *self.state.read().await
    }

    /// A read-only view of the state that does not keep the actor alive.
    pub fn reader(&self) -> StateReader {
        StateReader {
            state: Arc::clone(&self.state),
        }
    }
}

/// Read-only access to a store's state. Unlike a StoreHandle it holds no
/// channel senders, so the actor still stops once every handle is dropped.
#[derive(Clone)]
pub struct StateReader {
    state: Arc<RwLock<CounterState>>,
}

impl StateReader {
    /// Copy out the current state.
    pub async fn get_state(&self) -> CounterState {
        *self.state.read().await
    }
}

/// Spawn a new store actor seeded with `initial` and return the handle for
/// interacting with it. The actor applies actions sequentially and
/// broadcasts each transition only after the state update is committed.
pub fn spawn(initial: CounterState) -> StoreHandle {
    let (action_tx, action_rx) = mpsc::channel::<ActionMessage>(64);
    let (transition_tx, _) = broadcast::channel::<Transition>(256);
    let state = Arc::new(RwLock::new(initial));

    let handle = StoreHandle {
        action_tx,
        transition_tx: transition_tx.clone(),
        state: Arc::clone(&state),
    };

    let actor = StoreActor {
        state,
        action_rx,
        transition_tx,
        next_seq: 1,
    };

    tokio::spawn(actor.run());

    handle
}

/// The internal actor that applies actions in a loop.
struct StoreActor {
    state: Arc<RwLock<CounterState>>,
    action_rx: mpsc::Receiver<ActionMessage>,
    transition_tx: broadcast::Sender<Transition>,
    next_seq: u64,
}

impl StoreActor {
    async fn run(mut self) {
        while let Some((action, reply_tx)) = self.action_rx.recv().await {
            let state = self.apply(action).await;
            // Ignore send error: the caller may have dropped their receiver
            let _ = reply_tx.send(state);
        }
        tracing::debug!("store actor shutting down (all handles dropped)");
    }

    async fn apply(&mut self, action: Action) -> CounterState {
        let next = {
            let mut state = self.state.write().await;
            state.apply(&action);
            *state
        };

        let transition = Transition {
            seq: self.next_seq,
            action,
            state: next,
        };
        self.next_seq += 1;

        tracing::trace!(seq = transition.seq, action = ?transition.action, "applied action");

        // Ignore broadcast errors (no active subscribers is fine)
        let _ = self.transition_tx.send(transition);

        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_applies_increments() {
        let handle = spawn(CounterState::new());

        for _ in 0..3 {
            handle.increment().await.unwrap();
        }

        let state = handle.get_state().await;
        assert_eq!(
            state,
            CounterState {
                counter: 3,
                last_count: 2
            }
        );
    }

    #[tokio::test]
    async fn dispatch_returns_new_state() {
        let handle = spawn(CounterState::new());

        let state = handle.set_count(10).await.unwrap();
        assert_eq!(state.counter, 10);
        assert_eq!(state.last_count, 0);

        let state = handle.decrement().await.unwrap();
        assert_eq!(
            state,
            CounterState {
                counter: 9,
                last_count: 10
            }
        );
    }

    #[tokio::test]
    async fn store_broadcasts_transitions_in_order() {
        let handle = spawn(CounterState::new());
        let mut rx = handle.subscribe();

        handle.increment().await.unwrap();
        handle.set_count(7).await.unwrap();

        let first = rx.recv().await.expect("should receive first transition");
        assert_eq!(first.seq, 1);
        assert_eq!(first.action, Action::Increment);
        assert_eq!(first.state.counter, 1);

        let second = rx.recv().await.expect("should receive second transition");
        assert_eq!(second.seq, 2);
        assert_eq!(second.action, Action::SetCount { value: 7 });
        assert_eq!(second.state.counter, 7);
        assert_eq!(second.state.last_count, 0);
    }

    #[tokio::test]
    async fn state_is_committed_before_broadcast() {
        let handle = spawn(CounterState::new());
        let mut rx = handle.subscribe();

        handle.increment().await.unwrap();

        let transition = rx.recv().await.unwrap();
        assert_eq!(handle.get_state().await, transition.state);
    }

    #[tokio::test]
    async fn clones_share_the_same_store() {
        let handle = spawn(CounterState::new());
        let other = handle.clone();

        handle.increment().await.unwrap();
        other.increment().await.unwrap();

        let state = handle.read_state().await;
        assert_eq!(state.counter, 2);
        assert_eq!(state.last_count, 1);
    }

    #[tokio::test]
    async fn reader_outlives_handles_without_keeping_actor_alive() {
        let handle = spawn(CounterState::new());
        let mut rx = handle.subscribe();
        let reader = handle.reader();

        handle.set_count(4).await.unwrap();
        assert_eq!(reader.get_state().await.counter, 4);

        drop(handle);

        // The buffered transition is still delivered, then the channel closes
        // because the actor exited.
        assert_eq!(rx.recv().await.unwrap().state.counter, 4);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert_eq!(reader.get_state().await.counter, 4);
    }

    #[tokio::test]
    async fn concurrent_dispatches_are_serialized() {
        let handle = spawn(CounterState::new());

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let h = handle.clone();
            tasks.push(tokio::spawn(async move { h.increment().await.unwrap() }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let state = handle.get_state().await;
        assert_eq!(state.counter, 50);
        assert_eq!(state.last_count, 49);
    }
}
