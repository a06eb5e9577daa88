// ABOUTME: Reversible transforms applied to state on its way into and out of storage.
// ABOUTME: Includes EncryptTransform, which seals the serialized state with a SecretKey.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::crypto::{CryptoError, SecretKey};

/// Errors that can occur while transforming state.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("utf-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("expected an encrypted string payload, found {0}")]
    UnexpectedPayload(&'static str),
}

/// A step in the persistence pipeline. `inbound` runs on write, in the
/// configured order. `outbound` runs on read, in reverse order.
pub trait Transform: Send + Sync {
    fn inbound(&self, value: Value) -> Result<Value, TransformError>;

    fn outbound(&self, value: Value) -> Result<Value, TransformError>;
}

/// Callback invoked with any error raised by an EncryptTransform.
pub type ErrorHook = Arc<dyn Fn(&TransformError) + Send + Sync>;

/// Serializes the value to JSON, encrypts it, and stores the result as a
/// single string.
pub struct EncryptTransform {
    key: SecretKey,
    on_error: ErrorHook,
}

impl EncryptTransform {
    /// Build a transform whose errors are logged through tracing.
    pub fn new(key: SecretKey) -> Self {
        Self {
            key,
            on_error: Arc::new(|e: &TransformError| {
                tracing::error!("encrypt transform failed: {}", e);
            }),
        }
    }

    /// Build a transform from a passphrase.
    pub fn from_passphrase(secret: &str) -> Result<Self, CryptoError> {
        Ok(Self::new(SecretKey::from_passphrase(secret)?))
    }

    /// Replace the error hook.
    pub fn with_on_error(mut self, hook: impl Fn(&TransformError) + Send + Sync + 'static) -> Self {
        self.on_error = Arc::new(hook);
        self
    }

    fn report<T>(&self, result: Result<T, TransformError>) -> Result<T, TransformError> {
        if let Err(e) = &result {
            (self.on_error)(e);
        }
        result
    }

    fn seal(&self, value: &Value) -> Result<Value, TransformError> {
        let plaintext = serde_json::to_vec(value)?;
        let blob = self.key.encrypt(&plaintext)?;
        Ok(Value::String(blob))
    }

    fn open(&self, value: &Value) -> Result<Value, TransformError> {
        let blob = match value {
            Value::String(s) => s,
            Value::Null => return Err(TransformError::UnexpectedPayload("null")),
            Value::Bool(_) => return Err(TransformError::UnexpectedPayload("bool")),
            Value::Number(_) => return Err(TransformError::UnexpectedPayload("number")),
            Value::Array(_) => return Err(TransformError::UnexpectedPayload("array")),
            Value::Object(_) => return Err(TransformError::UnexpectedPayload("object")),
        };
        let plaintext = self.key.decrypt(blob)?;
        let json = String::from_utf8(plaintext)?;
        Ok(serde_json::from_str(&json)?)
    }
}

impl fmt::Debug for EncryptTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptTransform")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl Transform for EncryptTransform {
    fn inbound(&self, value: Value) -> Result<Value, TransformError> {
        self.report(self.seal(&value))
    }

    fn outbound(&self, value: Value) -> Result<Value, TransformError> {
        self.report(self.open(&value))
    }
}

/// Run `transforms` over `value` in order (the write path).
pub fn apply_inbound(transforms: &[Arc<dyn Transform>], value: Value) -> Result<Value, TransformError> {
    transforms.iter().try_fold(value, |v, t| t.inbound(v))
}

/// Run `transforms` over `value` in reverse order (the read path).
pub fn apply_outbound(transforms: &[Arc<dyn Transform>], value: Value) -> Result<Value, TransformError> {
    transforms.iter().rev().try_fold(value, |v, t| t.outbound(v))
}
