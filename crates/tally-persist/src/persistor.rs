// ABOUTME: Background persistor that rehydrates a store from storage and writes every later transition back.
// ABOUTME: Exposes the one-time rehydration signal plus flush, pause, resume, purge, and stop controls.

use std::sync::Arc;

use tally_core::{Action, CounterState, StateReader, StoreHandle, Transition};
use thiserror::Error;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::envelope::{EnvelopeError, PersistedEnvelope};
use crate::storage::{Storage, StorageError};
use crate::transform::Transform;

/// Prefix applied to every persist key before it reaches storage.
pub const KEY_PREFIX: &str = "persist:";

/// Envelope version used when none is configured.
pub const DEFAULT_VERSION: u32 = 1;

/// Errors surfaced by persistor controls.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("persistor stopped")]
    Stopped,
}

/// Where and how a store's state is persisted.
#[derive(Clone)]
pub struct PersistConfig {
    pub key: String,
    pub version: u32,
    pub storage: Arc<dyn Storage>,
    pub transforms: Vec<Arc<dyn Transform>>,
}

impl PersistConfig {
    /// Create a config for `key` backed by `storage`, with no transforms.
    pub fn new(key: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        Self {
            key: key.into(),
            version: DEFAULT_VERSION,
            storage,
            transforms: Vec::new(),
        }
    }

    /// Append a transform. Transforms run in the order they are added on
    /// write and in reverse on read.
    pub fn with_transform(mut self, transform: impl Transform + 'static) -> Self {
        self.transforms.push(Arc::new(transform));
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// The key actually used in storage, e.g. `persist:count`.
    pub fn storage_key(&self) -> String {
        format!("{}{}", KEY_PREFIX, self.key)
    }
}

/// Control messages sent from a Persistor to its worker. Every message
/// carries a reply channel so callers know the worker has acted on it.
enum Control {
    Flush(oneshot::Sender<()>),
    Pause(oneshot::Sender<()>),
    Resume(oneshot::Sender<()>),
    Purge(oneshot::Sender<Result<(), StorageError>>),
    Stop(oneshot::Sender<()>),
}

/// Handle to a running persistor task.
pub struct Persistor {
    control_tx: mpsc::Sender<Control>,
    rehydrated_rx: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl Persistor {
    /// Subscribe to `store`, then spawn the worker that rehydrates it from
    /// storage and persists every transition that follows.
    pub fn start(store: &StoreHandle, config: PersistConfig) -> Self {
        let transitions = store.subscribe();
        let (control_tx, control_rx) = mpsc::channel(16);
        let (rehydrated_tx, rehydrated_rx) = watch::channel(false);

        let worker = PersistWorker {
            reader: store.reader(),
            storage_key: config.storage_key(),
            config,
            transitions,
            control_rx,
            rehydrated_tx,
            rehydrated: false,
            paused: false,
            dirty: false,
        };

        let task = tokio::spawn(worker.run(store.clone()));

        Self {
            control_tx,
            rehydrated_rx,
            task,
        }
    }

    /// True once the startup read has finished and the store was seeded.
    pub fn is_rehydrated(&self) -> bool {
        *self.rehydrated_rx.borrow()
    }

    /// A receiver for the rehydration flag, for dependents that outlive
    /// a borrow of the Persistor.
    pub fn rehydration(&self) -> watch::Receiver<bool> {
        self.rehydrated_rx.clone()
    }

    /// Wait until rehydration completes. Returns immediately if it already has.
    pub async fn wait_rehydrated(&self) -> Result<(), PersistError> {
        let mut rx = self.rehydrated_rx.clone();
        rx.wait_for(|done| *done)
            .await
            .map_err(|_| PersistError::Stopped)?;
        Ok(())
    }

    /// Complete once every transition committed before this call has been written.
    pub async fn flush(&self) -> Result<(), PersistError> {
        self.request(Control::Flush).await
    }

    /// Stop writing transitions until `resume` is called.
    pub async fn pause(&self) -> Result<(), PersistError> {
        self.request(Control::Pause).await
    }

    /// Resume writing. If the state changed while paused, the current state
    /// is written immediately.
    pub async fn resume(&self) -> Result<(), PersistError> {
        self.request(Control::Resume).await
    }

    /// Remove the persisted value from storage.
    pub async fn purge(&self) -> Result<(), PersistError> {
        self.request(Control::Purge).await??;
        Ok(())
    }

    /// Flush pending writes and shut the worker down.
    pub async fn stop(self) -> Result<(), PersistError> {
        self.request(Control::Stop).await?;
        if let Err(e) = self.task.await {
            tracing::error!("persistor task ended abnormally: {}", e);
        }
        Ok(())
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Control,
    ) -> Result<T, PersistError> {
        let (tx, rx) = oneshot::channel();
        self.control_tx
            .send(make(tx))
            .await
            .map_err(|_| PersistError::Stopped)?;
        rx.await.map_err(|_| PersistError::Stopped)
    }
}

/// The task behind a Persistor.
struct PersistWorker {
    /// Read-only, so an attached persistor never keeps the store actor alive.
    reader: StateReader,
    config: PersistConfig,
    storage_key: String,
    transitions: broadcast::Receiver<Transition>,
    control_rx: mpsc::Receiver<Control>,
    rehydrated_tx: watch::Sender<bool>,
    /// Set once the rehydrate transition has been seen; earlier
    /// transitions are never written.
    rehydrated: bool,
    paused: bool,
    /// A transition arrived while paused.
    dirty: bool,
}

impl PersistWorker {
    /// `store` is used only for the rehydrate dispatch and is dropped before
    /// the write loop starts.
    async fn run(mut self, store: StoreHandle) {
        let restored = self.read_persisted().await;

        let dispatched = store.dispatch(Action::Rehydrate { state: restored }).await;
        drop(store);
        if let Err(e) = dispatched {
            tracing::error!("persistor could not rehydrate {}: {}", self.storage_key, e);
            return;
        }
        self.rehydrated_tx.send_replace(true);
        tracing::info!(
            "rehydrated {} (counter={}, lastCount={})",
            self.storage_key,
            restored.counter,
            restored.last_count
        );

        loop {
            tokio::select! {
                biased;

                received = self.transitions.recv() => match received {
                    Ok(transition) => self.on_transition(transition).await,
                    Err(RecvError::Lagged(n)) => self.on_lagged(n).await,
                    Err(RecvError::Closed) => {
                        tracing::debug!("persistor for {} shutting down (store closed)", self.storage_key);
                        break;
                    }
                },

                control = self.control_rx.recv() => match control {
                    Some(Control::Flush(reply)) => {
                        self.drain().await;
                        let _ = reply.send(());
                    }
                    Some(Control::Pause(reply)) => {
                        self.drain().await;
                        self.paused = true;
                        let _ = reply.send(());
                    }
                    Some(Control::Resume(reply)) => {
                        self.drain().await;
                        self.paused = false;
                        if self.dirty {
                            self.dirty = false;
                            let state = self.reader.get_state().await;
                            self.write(&state).await;
                        }
                        let _ = reply.send(());
                    }
                    Some(Control::Purge(reply)) => {
                        self.drain().await;
                        let result = self.config.storage.remove_item(&self.storage_key).await;
                        match &result {
                            Ok(()) => tracing::info!("purged {}", self.storage_key),
                            Err(e) => tracing::error!("failed to purge {}: {}", self.storage_key, e),
                        }
                        let _ = reply.send(result);
                    }
                    Some(Control::Stop(reply)) => {
                        self.drain().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => break,
                },
            }
        }
    }

    /// Startup read. Any failure is logged and yields the default state.
    async fn read_persisted(&self) -> CounterState {
        let raw = match self.config.storage.get_item(&self.storage_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                tracing::info!("no persisted state under {}, using default", self.storage_key);
                return CounterState::default();
            }
            Err(e) => {
                tracing::error!(
                    "failed to read {}: {}; falling back to default state",
                    self.storage_key,
                    e
                );
                return CounterState::default();
            }
        };

        match PersistedEnvelope::decode(&raw, self.config.version, &self.config.transforms) {
            Ok(state) => state,
            Err(e) if reported_by_transform(&e) => {
                tracing::debug!(
                    "failed to restore {}: {}; falling back to default state",
                    self.storage_key,
                    e
                );
                CounterState::default()
            }
            Err(e) => {
                tracing::warn!(
                    "failed to restore {}: {}; falling back to default state",
                    self.storage_key,
                    e
                );
                CounterState::default()
            }
        }
    }

    /// Process every transition already queued on the broadcast channel.
    async fn drain(&mut self) {
        loop {
            match self.transitions.try_recv() {
                Ok(transition) => self.on_transition(transition).await,
                Err(TryRecvError::Lagged(n)) => self.on_lagged(n).await,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    async fn on_transition(&mut self, transition: Transition) {
        if !self.rehydrated {
            if !transition.action.is_rehydrate() {
                tracing::trace!(seq = transition.seq, "skipping pre-rehydration transition");
                return;
            }
            self.rehydrated = true;
        }

        if self.paused {
            self.dirty = true;
            return;
        }

        self.write(&transition.state).await;
    }

    /// Missed transitions are not replayed; the current state supersedes them.
    async fn on_lagged(&mut self, missed: u64) {
        tracing::warn!(
            "persistor for {} lagged, missed {} transitions; writing current state",
            self.storage_key,
            missed
        );
        // The worker only reads transitions after its own rehydrate dispatch
        // returned, so the store is already rehydrated here.
        self.rehydrated = true;

        if self.paused {
            self.dirty = true;
            return;
        }

        let state = self.reader.get_state().await;
        self.write(&state).await;
    }

    /// Encode and store `state`. A failure leaves the previous persisted
    /// value in place and is only logged.
    async fn write(&self, state: &CounterState) {
        let raw = match PersistedEnvelope::encode(state, self.config.version, &self.config.transforms) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(
                    "failed to encode state for {}: {}; keeping previous persisted value",
                    self.storage_key,
                    e
                );
                return;
            }
        };

        if let Err(e) = self.config.storage.set_item(&self.storage_key, &raw).await {
            tracing::error!("failed to write {}: {}", self.storage_key, e);
        }
    }
}

/// Transform failures were already surfaced through the transform's own
/// error hook, so the persistor only notes them at debug level.
fn reported_by_transform(e: &EnvelopeError) -> bool {
    matches!(e, EnvelopeError::Transform(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::transform::{EncryptTransform, TransformError};
    use std::sync::Mutex;
    use tally_core::store;

    const SECRET: &str = "my-super-secret-key";

    fn config(storage: &Arc<MemoryStorage>, secret: &str) -> PersistConfig {
        PersistConfig::new("count", Arc::clone(storage) as Arc<dyn Storage>)
            .with_transform(EncryptTransform::from_passphrase(secret).unwrap())
    }

    async fn stored_state(storage: &MemoryStorage, secret: &str) -> Option<CounterState> {
        let raw = storage.get_item("persist:count").await.unwrap()?;
        let transforms: Vec<Arc<dyn Transform>> =
            vec![Arc::new(EncryptTransform::from_passphrase(secret).unwrap())];
        Some(PersistedEnvelope::decode(&raw, DEFAULT_VERSION, &transforms).unwrap())
    }

    #[test]
    fn storage_key_is_prefixed() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let config = PersistConfig::new("count", storage);
        assert_eq!(config.storage_key(), "persist:count");
        assert_eq!(config.version, DEFAULT_VERSION);
        assert!(config.transforms.is_empty());
    }

    #[tokio::test]
    async fn worker_exits_when_last_store_handle_dropped() {
        let storage = Arc::new(MemoryStorage::new());
        let handle = store::spawn(CounterState::new());
        let persistor = Persistor::start(&handle, config(&storage, SECRET));
        persistor.wait_rehydrated().await.unwrap();

        handle.increment().await.unwrap();
        drop(handle);

        tokio::time::timeout(std::time::Duration::from_secs(2), persistor.task)
            .await
            .expect("worker should stop once the store is gone")
            .unwrap();

        // Transitions buffered before the store closed are still written.
        assert_eq!(
            stored_state(&storage, SECRET).await.unwrap(),
            CounterState {
                counter: 1,
                last_count: 0
            }
        );
    }

    #[test]
    fn transform_failures_are_left_to_the_hook() {
        let crypto = EnvelopeError::Transform(TransformError::Crypto(
            crate::crypto::CryptoError::DecryptionFailed,
        ));
        assert!(reported_by_transform(&crypto));

        let garbage = serde_json::from_str::<PersistedEnvelope>("{").unwrap_err();
        assert!(!reported_by_transform(&EnvelopeError::Json(garbage)));
        assert!(!reported_by_transform(&EnvelopeError::VersionMismatch {
            expected: 2,
            found: 1
        }));
    }

    #[tokio::test]
    async fn fresh_start_rehydrates_default() {
        let storage = Arc::new(MemoryStorage::new());
        let handle = store::spawn(CounterState::new());
        let persistor = Persistor::start(&handle, config(&storage, SECRET));

        persistor.wait_rehydrated().await.unwrap();
        assert!(persistor.is_rehydrated());
        assert_eq!(handle.get_state().await, CounterState::default());
    }

    #[tokio::test]
    async fn increments_are_persisted_encrypted() {
        let storage = Arc::new(MemoryStorage::new());
        let handle = store::spawn(CounterState::new());
        let persistor = Persistor::start(&handle, config(&storage, SECRET));
        persistor.wait_rehydrated().await.unwrap();

        for _ in 0..3 {
            handle.increment().await.unwrap();
        }
        persistor.flush().await.unwrap();

        let raw = storage.get_item("persist:count").await.unwrap().unwrap();
        assert!(!raw.contains("lastCount"), "payload should be encrypted");

        let stored = stored_state(&storage, SECRET).await.unwrap();
        assert_eq!(
            stored,
            CounterState {
                counter: 3,
                last_count: 2
            }
        );
    }

    #[tokio::test]
    async fn restart_restores_persisted_state() {
        let storage = Arc::new(MemoryStorage::new());

        {
            let handle = store::spawn(CounterState::new());
            let persistor = Persistor::start(&handle, config(&storage, SECRET));
            persistor.wait_rehydrated().await.unwrap();
            handle.set_count(41).await.unwrap();
            handle.increment().await.unwrap();
            persistor.stop().await.unwrap();
        }

        let handle = store::spawn(CounterState::new());
        let persistor = Persistor::start(&handle, config(&storage, SECRET));
        persistor.wait_rehydrated().await.unwrap();

        assert_eq!(
            handle.get_state().await,
            CounterState {
                counter: 42,
                last_count: 41
            }
        );
    }

    #[tokio::test]
    async fn wrong_key_falls_back_to_default() {
        let storage = Arc::new(MemoryStorage::new());
        {
            let handle = store::spawn(CounterState::new());
            let persistor = Persistor::start(&handle, config(&storage, SECRET));
            persistor.wait_rehydrated().await.unwrap();
            handle.set_count(99).await.unwrap();
            persistor.stop().await.unwrap();
        }

        let errors = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&errors);
        let transform = EncryptTransform::from_passphrase("not-the-key")
            .unwrap()
            .with_on_error(move |_| *sink.lock().unwrap() += 1);
        let config = PersistConfig::new("count", Arc::clone(&storage) as Arc<dyn Storage>)
            .with_transform(transform);

        let handle = store::spawn(CounterState::new());
        let persistor = Persistor::start(&handle, config);
        persistor.wait_rehydrated().await.unwrap();

        assert_eq!(handle.get_state().await, CounterState::default());
        assert_eq!(*errors.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn corrupted_value_falls_back_to_default() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .set_item("persist:count", "definitely not an envelope")
            .await
            .unwrap();

        let handle = store::spawn(CounterState::new());
        let persistor = Persistor::start(&handle, config(&storage, SECRET));
        persistor.wait_rehydrated().await.unwrap();
        persistor.flush().await.unwrap();

        assert_eq!(handle.get_state().await, CounterState::default());
        // The rehydrated default replaces the unreadable value.
        assert_eq!(
            stored_state(&storage, SECRET).await,
            Some(CounterState::default())
        );
    }

    #[tokio::test]
    async fn version_mismatch_falls_back_to_default() {
        let storage = Arc::new(MemoryStorage::new());
        {
            let handle = store::spawn(CounterState::new());
            let persistor = Persistor::start(&handle, config(&storage, SECRET));
            persistor.wait_rehydrated().await.unwrap();
            handle.set_count(5).await.unwrap();
            persistor.stop().await.unwrap();
        }

        let handle = store::spawn(CounterState::new());
        let persistor = Persistor::start(&handle, config(&storage, SECRET).with_version(2));
        persistor.wait_rehydrated().await.unwrap();

        assert_eq!(handle.get_state().await, CounterState::default());
    }

    #[tokio::test]
    async fn paused_persistor_defers_writes() {
        let storage = Arc::new(MemoryStorage::new());
        let handle = store::spawn(CounterState::new());
        let persistor = Persistor::start(&handle, config(&storage, SECRET));
        persistor.wait_rehydrated().await.unwrap();

        handle.increment().await.unwrap();
        persistor.pause().await.unwrap();
        handle.increment().await.unwrap();
        handle.increment().await.unwrap();
        persistor.flush().await.unwrap();

        assert_eq!(stored_state(&storage, SECRET).await.unwrap().counter, 1);

        persistor.resume().await.unwrap();
        assert_eq!(
            stored_state(&storage, SECRET).await.unwrap(),
            CounterState {
                counter: 3,
                last_count: 2
            }
        );
    }

    #[tokio::test]
    async fn purge_removes_stored_value() {
        let storage = Arc::new(MemoryStorage::new());
        let handle = store::spawn(CounterState::new());
        let persistor = Persistor::start(&handle, config(&storage, SECRET));
        persistor.wait_rehydrated().await.unwrap();

        handle.increment().await.unwrap();
        persistor.flush().await.unwrap();
        assert!(!storage.is_empty().await);

        persistor.purge().await.unwrap();
        assert!(storage.is_empty().await);
    }

    #[tokio::test]
    async fn stop_flushes_pending_transitions() {
        let storage = Arc::new(MemoryStorage::new());
        let handle = store::spawn(CounterState::new());
        let persistor = Persistor::start(&handle, config(&storage, SECRET));
        persistor.wait_rehydrated().await.unwrap();

        handle.decrement().await.unwrap();
        handle.decrement().await.unwrap();
        persistor.stop().await.unwrap();

        assert_eq!(
            stored_state(&storage, SECRET).await.unwrap(),
            CounterState {
                counter: -2,
                last_count: -1
            }
        );
    }
}
