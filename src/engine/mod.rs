//! The feed synchronization engine.
//!
//! [`Engine`] owns the shared state handle, the feed fetcher and the state
//! store. It exposes the operations the web layer needs (`list_unread`,
//! `mark_read`, `add_subscription`) and the two periodic jobs the
//! [`scheduler`] drives (`refresh_all`, `persist`).

mod import;
mod merge;
pub mod scheduler;
mod shared;

pub use import::{import_subscriptions, ImportReport};
pub use merge::merge;
pub use shared::{SharedState, StateGuard};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use thiserror::Error;

use crate::feed::{Fetcher, ParseOptions, SourceError};
use crate::storage::{
    load_state, LoadError, PersistError, Source, State, StateStore, UnreadSource, UnreadView,
    UNCATEGORIZED,
};
use crate::util::{validate_url, UrlValidationError};

/// Errors returned by [`Engine::add_subscription`]. Nothing is added on error.
#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error(transparent)]
    InvalidUrl(#[from] UrlValidationError),
    #[error("Already subscribed to {0}")]
    AlreadySubscribed(String),
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Behaviour switches shared by refresh, import and subscribe.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub parse: ParseOptions,
    /// Upper bound on feeds fetched at the same time during a refresh pass.
    pub max_concurrent_fetches: usize,
    /// Accept subscriptions pointing at localhost or private networks.
    pub allow_private_hosts: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            parse: ParseOptions::default(),
            max_concurrent_fetches: 10,
            allow_private_hosts: false,
        }
    }
}

/// Outcome of one refresh pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub refreshed: usize,
    pub failed: usize,
    pub new_entries: usize,
}

/// Outcome of one persist cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Nothing changed since the last write.
    Clean,
    /// The snapshot was written and the state is clean.
    Written,
    /// The snapshot was written but the state changed meanwhile; still dirty.
    Superseded,
}

enum SourceOutcome {
    Merged(usize),
    Failed,
}

pub struct Engine<S> {
    shared: SharedState,
    store: Arc<S>,
    fetcher: Fetcher,
    options: EngineOptions,
}

impl<S: StateStore> Engine<S> {
    pub fn new(state: State, store: Arc<S>, fetcher: Fetcher, options: EngineOptions) -> Self {
        Self {
            shared: SharedState::new(state),
            store,
            fetcher,
            options,
        }
    }

    /// Build an engine from the state held in `store`.
    ///
    /// A missing or undecodable document is an error; the caller is expected
    /// to treat it as fatal.
    pub async fn load(
        store: Arc<S>,
        fetcher: Fetcher,
        options: EngineOptions,
    ) -> Result<Self, LoadError> {
        let state = load_state(store.as_ref()).await?;
        Ok(Self::new(state, store, fetcher, options))
    }

    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Folder to sources that have unread entries, each reduced to those
    /// entries.
    pub async fn list_unread(&self) -> UnreadView {
        self.shared
            .read(|state| {
                state
                    .folders
                    .iter()
                    .filter_map(|(folder, sources)| {
                        let unread: Vec<UnreadSource> = sources
                            .iter()
                            .filter(|s| s.has_unread())
                            .map(|s| UnreadSource {
                                title: s.title.clone(),
                                url: s.url.clone(),
                                entries: s.entries.iter().filter(|e| !e.read).cloned().collect(),
                            })
                            .collect();
                        (!unread.is_empty()).then(|| (folder.clone(), unread))
                    })
                    .collect()
            })
            .await
    }

    /// Mark every entry linking to `link` as read, in every source of every
    /// folder. Returns how many entries flipped from unread to read.
    pub async fn mark_read(&self, link: &str) -> usize {
        let changed = self
            .shared
            .mutate(|state| {
                let mut changed = 0;
                for entry in state
                    .sources_mut()
                    .flat_map(|s| s.entries.iter_mut())
                    .filter(|e| e.url == link)
                {
                    if !entry.read {
                        entry.read = true;
                        changed += 1;
                    }
                }
                changed
            })
            .await;
        tracing::debug!(link = %link, changed, "Marked entry as read");
        changed
    }

    /// Fetch `url` and add it to the uncategorized folder.
    pub async fn add_subscription(&self, url: &str) -> Result<(), SubscribeError> {
        let url = url.trim();
        validate_url(url, self.options.allow_private_hosts)?;

        if self.shared.read(|s| s.contains_feed(url)).await {
            return Err(SubscribeError::AlreadySubscribed(url.to_string()));
        }

        // Network I/O happens outside the lock
        let fetched = self
            .fetcher
            .fetch_source(url, Utc::now(), self.options.parse)
            .await?;

        let mut guard = self.shared.lock().await;
        // Another request may have subscribed while we were fetching
        if guard.state().contains_feed(url) {
            return Err(SubscribeError::AlreadySubscribed(url.to_string()));
        }
        let source = seed_source(fetched);
        tracing::info!(
            feed = %url,
            title = %source.title,
            entries = source.entries.len(),
            "Added subscription"
        );
        guard
            .state_mut()
            .folders
            .entry(UNCATEGORIZED.to_string())
            .or_default()
            .push(source);
        Ok(())
    }

    /// Refresh every source once, stamping fetches with the current time.
    pub async fn refresh_all(&self) -> RefreshReport {
        self.refresh_all_at(Utc::now()).await
    }

    /// Refresh every source once, stamping fetches with `now`.
    ///
    /// # Arguments
    ///
    /// * `now` - Fetch time recorded as `last_fetched` on every source that
    ///   was fetched and parsed successfully
    ///
    /// # Returns
    ///
    /// A [`RefreshReport`] counting refreshed sources, failed sources and
    /// entries appended across the pass.
    ///
    /// # Behavior
    ///
    /// - The list of sources is read under the lock, then released
    /// - Up to `max_concurrent_fetches` feeds are fetched at once, outside the lock
    /// - Each successful fetch is merged under the lock as soon as it arrives
    /// - A failing source is logged with its URL and left untouched
    /// - A source removed while its fetch was in flight is ignored
    /// - The state is marked dirty at the end of the pass, whatever was found
    pub async fn refresh_all_at(&self, now: DateTime<Utc>) -> RefreshReport {
        let targets: Vec<(String, String)> = self
            .shared
            .read(|state| {
                state
                    .folders
                    .iter()
                    .flat_map(|(folder, sources)| {
                        sources.iter().map(move |s| (folder.clone(), s.url.clone()))
                    })
                    .collect()
            })
            .await;

        tracing::info!(sources = targets.len(), "Refreshing feeds");

        let outcomes: Vec<SourceOutcome> = stream::iter(targets)
            .map(|(folder, url)| async move { self.refresh_source(&folder, &url, now).await })
            .buffer_unordered(self.options.max_concurrent_fetches.max(1))
            .collect()
            .await;

        self.shared.mark_dirty().await;

        let mut report = RefreshReport::default();
        for outcome in outcomes {
            match outcome {
                SourceOutcome::Merged(added) => {
                    report.refreshed += 1;
                    report.new_entries += added;
                }
                SourceOutcome::Failed => report.failed += 1,
            }
        }
        tracing::info!(
            refreshed = report.refreshed,
            failed = report.failed,
            new_entries = report.new_entries,
            "Refresh pass complete"
        );
        report
    }

    async fn refresh_source(&self, folder: &str, url: &str, now: DateTime<Utc>) -> SourceOutcome {
        let fetched = match self.fetcher.fetch_source(url, now, self.options.parse).await {
            Ok(fetched) => fetched,
            Err(e) => {
                tracing::warn!(feed = %url, error = %e, "Skipping feed this pass");
                return SourceOutcome::Failed;
            }
        };

        let mut guard = self.shared.lock().await;
        match guard.state_mut().find_source_mut(folder, url) {
            Some(existing) => {
                existing.last_fetched = fetched.last_fetched;
                let added = merge(existing, fetched);
                if added > 0 {
                    tracing::info!(feed = %url, new_entries = added, "Feed updated");
                } else {
                    tracing::debug!(feed = %url, "Feed updated: no new entries");
                }
                SourceOutcome::Merged(added)
            }
            None => {
                tracing::debug!(feed = %url, folder = %folder, "Source disappeared during refresh");
                SourceOutcome::Merged(0)
            }
        }
    }

    /// Write the state through the store if it is dirty.
    ///
    /// # Returns
    ///
    /// - [`PersistOutcome::Clean`] when nothing changed since the last write
    /// - [`PersistOutcome::Written`] when the snapshot was written and the
    ///   state is clean again
    /// - [`PersistOutcome::Superseded`] when the snapshot was written but a
    ///   mutation landed during the write, so the state stays dirty
    ///
    /// # Errors
    ///
    /// - [`PersistError::Encode`] if the state cannot be serialized. Nothing is
    ///   written and the caller should treat it as fatal.
    /// - [`PersistError::Write`] if the store rejects the bytes. The dirty flag
    ///   stays set so the next cycle retries.
    ///
    /// Encoding happens under the lock; the write does not.
    pub async fn persist(&self) -> Result<PersistOutcome, PersistError> {
        let snapshot = match self.shared.dirty_snapshot().await? {
            Some(snapshot) => snapshot,
            None => return Ok(PersistOutcome::Clean),
        };

        let size = snapshot.bytes.len();
        self.store.save(snapshot.bytes).await?;

        if self.shared.mark_clean(snapshot.generation).await {
            tracing::debug!(bytes = size, "State persisted");
            Ok(PersistOutcome::Written)
        } else {
            tracing::debug!(bytes = size, "State persisted, newer changes pending");
            Ok(PersistOutcome::Superseded)
        }
    }
}

/// Turn a freshly parsed source into one that satisfies the unique-link
/// invariant.
fn seed_source(fetched: Source) -> Source {
    let mut source = Source::new(fetched.title.clone(), fetched.url.clone(), fetched.last_fetched);
    source.folder.clone_from(&fetched.folder);
    merge(&mut source, fetched);
    source
}
