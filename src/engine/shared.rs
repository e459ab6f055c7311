//! The single lock around the in-memory state and its dirty flag.

use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use crate::storage::{encode, State};

struct Guarded {
    state: State,
    dirty: bool,
    /// Bumped on every mutable access; lets a persist cycle tell whether the
    /// state changed while its snapshot was being written.
    generation: u64,
}

/// Shared handle to the aggregator state.
///
/// Every read-modify-write goes through one `tokio::sync::Mutex`, so a merge
/// can never interleave with a persist snapshot. Cloning the handle is cheap.
#[derive(Clone)]
pub struct SharedState {
    inner: Arc<Mutex<Guarded>>,
}

/// Exclusive access to the state for the lifetime of the guard.
pub struct StateGuard<'a> {
    inner: MutexGuard<'a, Guarded>,
}

impl StateGuard<'_> {
    pub fn state(&self) -> &State {
        &self.inner.state
    }

    /// Mutable access. Marks the state dirty.
    pub fn state_mut(&mut self) -> &mut State {
        self.inner.dirty = true;
        self.inner.generation = self.inner.generation.wrapping_add(1);
        &mut self.inner.state
    }

    pub fn mark_dirty(&mut self) {
        self.inner.dirty = true;
        self.inner.generation = self.inner.generation.wrapping_add(1);
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.dirty
    }
}

/// Encoded snapshot taken by a persist cycle.
pub(crate) struct Snapshot {
    pub bytes: Vec<u8>,
    pub generation: u64,
}

impl SharedState {
    /// Wrap a freshly loaded state. It matches storage, so it starts clean.
    pub fn new(state: State) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Guarded {
                state,
                dirty: false,
                generation: 0,
            })),
        }
    }

    pub async fn lock(&self) -> StateGuard<'_> {
        StateGuard {
            inner: self.inner.lock().await,
        }
    }

    /// Run `f` against the state without marking it dirty.
    pub async fn read<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        let guard = self.inner.lock().await;
        f(&guard.state)
    }

    /// Run `f` against the state and mark it dirty.
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = self.lock().await;
        f(guard.state_mut())
    }

    pub async fn mark_dirty(&self) {
        self.lock().await.mark_dirty();
    }

    pub async fn is_dirty(&self) -> bool {
        self.inner.lock().await.dirty
    }

    /// Deep copy of the current state.
    pub async fn snapshot(&self) -> State {
        self.read(State::clone).await
    }

    /// Encode the state if it is dirty. Returns `None` when clean.
    pub(crate) async fn dirty_snapshot(&self) -> Result<Option<Snapshot>, serde_json::Error> {
        let guard = self.inner.lock().await;
        if !guard.dirty {
            return Ok(None);
        }
        let bytes = encode(&guard.state)?;
        Ok(Some(Snapshot {
            bytes,
            generation: guard.generation,
        }))
    }

    /// Clear the dirty flag after `generation` was written, unless the state
    /// moved on in the meantime. Returns whether the flag was cleared.
    pub(crate) async fn mark_clean(&self, generation: u64) -> bool {
        let mut guard = self.inner.lock().await;
        if guard.generation == generation {
            guard.dirty = false;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{decode, Source};
    use chrono::Utc;

    #[tokio::test]
    async fn test_new_state_is_clean() {
        let shared = SharedState::new(State::default());
        assert!(!shared.is_dirty().await);
        assert!(shared.dirty_snapshot().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_does_not_dirty() {
        let shared = SharedState::new(State::default());
        let count = shared.read(|s| s.source_count()).await;
        assert_eq!(count, 0);
        assert!(!shared.is_dirty().await);
    }

    #[tokio::test]
    async fn test_mutate_dirties_and_snapshot_encodes() {
        let shared = SharedState::new(State::default());
        shared
            .mutate(|s| {
                s.folders
                    .entry("uncategorized".to_string())
                    .or_default()
                    .push(Source::new("A", "http://a/feed", Utc::now()))
            })
            .await;
        assert!(shared.is_dirty().await);

        let snapshot = shared.dirty_snapshot().await.unwrap().unwrap();
        let decoded = decode(&snapshot.bytes).unwrap();
        assert_eq!(decoded, shared.snapshot().await);
    }

    #[tokio::test]
    async fn test_mark_clean_only_for_current_generation() {
        let shared = SharedState::new(State::default());
        shared.mark_dirty().await;
        let first = shared.dirty_snapshot().await.unwrap().unwrap();

        // A mutation lands while the first snapshot is being written
        shared.mark_dirty().await;
        assert!(!shared.mark_clean(first.generation).await);
        assert!(shared.is_dirty().await);

        let second = shared.dirty_snapshot().await.unwrap().unwrap();
        assert!(shared.mark_clean(second.generation).await);
        assert!(!shared.is_dirty().await);
    }

    #[tokio::test]
    async fn test_guard_state_access() {
        let shared = SharedState::new(State::default());
        {
            let guard = shared.lock().await;
            assert_eq!(guard.state().source_count(), 0);
            assert!(!guard.is_dirty());
        }
        {
            let mut guard = shared.lock().await;
            guard.state_mut().folders.insert("x".to_string(), Vec::new());
            assert!(guard.is_dirty());
        }
        assert!(shared.read(|s| s.folders.contains_key("x")).await);
    }
}
