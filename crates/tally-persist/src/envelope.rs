// ABOUTME: The versioned envelope written under a persist key, and the encode/decode paths around it.
// ABOUTME: Encoding runs the inbound transforms; decoding checks the version and runs them outbound.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tally_core::CounterState;
use thiserror::Error;

use crate::transform::{Transform, TransformError, apply_inbound, apply_outbound};

/// Errors that can occur while encoding or decoding an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

/// What actually lands in storage. `payload` is the transformed state; with
/// an EncryptTransform configured it is an opaque base64 string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEnvelope {
    pub version: u32,
    pub payload: Value,
    pub persisted_at: DateTime<Utc>,
}

impl PersistedEnvelope {
    /// Serialize `state`, run it through `transforms`, and render the
    /// envelope as a JSON string ready for storage.
    pub fn encode(
        state: &CounterState,
        version: u32,
        transforms: &[Arc<dyn Transform>],
    ) -> Result<String, EnvelopeError> {
        let raw = serde_json::to_value(state)?;
        let payload = apply_inbound(transforms, raw)?;
        let envelope = PersistedEnvelope {
            version,
            payload,
            persisted_at: Utc::now(),
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Parse a stored envelope, check its version, undo the transforms, and
    /// deserialize the state.
    pub fn decode(
        raw: &str,
        expected_version: u32,
        transforms: &[Arc<dyn Transform>],
    ) -> Result<CounterState, EnvelopeError> {
        let envelope: PersistedEnvelope = serde_json::from_str(raw)?;
        if envelope.version != expected_version {
            return Err(EnvelopeError::VersionMismatch {
                expected: expected_version,
                found: envelope.version,
            });
        }
        let value = apply_outbound(transforms, envelope.payload)?;
        Ok(serde_json::from_value(value)?)
    }
}
