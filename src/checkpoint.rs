//! Versioned checkpoint payloads.
//!
//! A task's intermediate data is persisted as `{"version": n, "data": ...}`.
//! Decoding an older version goes through [`CheckpointData::migrate`]; a newer
//! version than the running code knows is rejected instead of misread.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error raised while encoding or decoding a checkpoint.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint version {found} is not supported (current is {current})")]
    Unsupported { found: u32, current: u32 },

    #[error("malformed checkpoint: {0}")]
    Malformed(String),
}

/// The intermediate data of one task type.
pub trait CheckpointData: Serialize + DeserializeOwned + Default + Send + Sync + 'static {
    /// Schema version written with every checkpoint.
    const VERSION: u32;

    /// Upgrade data written by an older schema version.
    fn migrate(version: u32, _data: serde_json::Value) -> Result<Self, CheckpointError> {
        Err(CheckpointError::Unsupported {
            found: version,
            current: Self::VERSION,
        })
    }
}

impl CheckpointData for () {
    const VERSION: u32 = 1;
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    data: T,
}

/// Wrap `data` in a versioned envelope.
pub fn encode<D: CheckpointData>(data: &D) -> Result<serde_json::Value, CheckpointError> {
    serde_json::to_value(Envelope {
        version: D::VERSION,
        data,
    })
    .map_err(|e| CheckpointError::Malformed(e.to_string()))
}

/// Read a checkpoint; a task that never checkpointed yields the default.
pub fn decode<D: CheckpointData>(raw: &serde_json::Value) -> Result<D, CheckpointError> {
    if raw.is_null() {
        return Ok(D::default());
    }

    let envelope: Envelope<serde_json::Value> = serde_json::from_value(raw.clone())
        .map_err(|e| CheckpointError::Malformed(e.to_string()))?;

    match envelope.version {
        v if v == D::VERSION => serde_json::from_value(envelope.data)
            .map_err(|e| CheckpointError::Malformed(e.to_string())),
        v if v < D::VERSION => D::migrate(v, envelope.data),
        v => Err(CheckpointError::Unsupported {
            found: v,
            current: D::VERSION,
        }),
    }
}
