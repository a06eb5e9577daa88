// ABOUTME: Persistence layer for tally, handling encrypted storage and startup rehydration.
// ABOUTME: Provides key-value storage backends, the transform pipeline, encryption, and the Persistor.

pub mod crypto;
pub mod envelope;
pub mod persistor;
pub mod storage;
pub mod transform;

pub use crypto::{CryptoError, SecretKey};
pub use envelope::{EnvelopeError, PersistedEnvelope};
pub use persistor::{PersistConfig, PersistError, Persistor};
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError};
pub use transform::{EncryptTransform, Transform, TransformError};
