//! Canonical JSON encoding of the [`State`] document.

use super::store::{StateStore, StoreError};
use super::types::State;
use thiserror::Error;

/// Failure to obtain the initial state at startup. Always fatal.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to read persisted state: {0}")]
    Read(#[from] StoreError),
    #[error("Persisted state is not a valid state document: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Failure of a single persist cycle.
#[derive(Debug, Error)]
pub enum PersistError {
    /// The store rejected the write; the next cycle retries.
    #[error("Failed to write state: {0}")]
    Write(#[from] StoreError),
    /// The in-memory state could not be encoded; not recoverable.
    #[error("Failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PersistError {
    /// Whether a later cycle can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PersistError::Write(_))
    }
}

pub fn encode(state: &State) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(state)
}

pub fn decode(bytes: &[u8]) -> Result<State, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Read and decode the state document from `store`.
pub async fn load_state<S: StateStore>(store: &S) -> Result<State, LoadError> {
    let bytes = store.load().await?;
    let state = decode(&bytes)?;
    tracing::info!(
        folders = state.folders.len(),
        sources = state.source_count(),
        unread = state.sources().map(|s| s.unread_count()).sum::<usize>(),
        "Loaded persisted state"
    );
    Ok(state)
}

/// Encode `state` and write it through `store` in one go.
pub async fn save_state<S: StateStore>(store: &S, state: &State) -> Result<(), PersistError> {
    let bytes = encode(state)?;
    store.save(bytes).await?;
    Ok(())
}
