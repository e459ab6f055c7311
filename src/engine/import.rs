//! One-shot import of an OPML subscription list into a fresh state.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;

use super::{seed_source, EngineOptions};
use crate::feed::{Fetcher, SourceError};
use crate::storage::{Source, State};
use crate::util::{validate_url, UrlValidationError};

/// Result of importing a subscription list.
#[derive(Debug)]
pub struct ImportReport {
    /// State holding every feed that could be fetched, all uncategorized.
    pub state: State,
    /// Feeds that were skipped, with the reason.
    pub skipped: Vec<(String, String)>,
}

enum ImportOutcome {
    Imported(Source),
    Skipped(String, String),
}

/// Fetch every URL and build the initial state from the feeds that parse.
///
/// Feeds are fetched with bounded concurrency but keep the order of `urls`
/// in the result. Repeated URLs are imported once. Invalid, unreachable or
/// unparseable feeds are logged and reported, never fatal.
pub async fn import_subscriptions(
    urls: &[String],
    fetcher: &Fetcher,
    options: EngineOptions,
    now: DateTime<Utc>,
) -> ImportReport {
    let mut seen = HashSet::new();
    let unique: Vec<&str> = urls
        .iter()
        .map(|u| u.trim())
        .filter(|u| {
            let first = seen.insert(*u);
            if !first {
                tracing::debug!(feed = %u, "Duplicate subscription in OPML, importing once");
            }
            first
        })
        .collect();

    let outcomes: Vec<ImportOutcome> = stream::iter(unique)
        .map(|url| async move {
            tracing::info!(feed = %url, "Loading feed");
            match import_one(url, fetcher, options, now).await {
                Ok(source) => ImportOutcome::Imported(source),
                Err(e) => {
                    tracing::warn!(feed = %url, error = %e, "Skipping feed");
                    ImportOutcome::Skipped(url.to_string(), e.to_string())
                }
            }
        })
        .buffered(options.max_concurrent_fetches.max(1))
        .collect()
        .await;

    let mut sources = Vec::new();
    let mut skipped = Vec::new();
    for outcome in outcomes {
        match outcome {
            ImportOutcome::Imported(source) => sources.push(source),
            ImportOutcome::Skipped(url, reason) => skipped.push((url, reason)),
        }
    }

    tracing::info!(
        imported = sources.len(),
        skipped = skipped.len(),
        "Import complete"
    );
    ImportReport {
        state: State::with_uncategorized(sources),
        skipped,
    }
}

#[derive(Debug, thiserror::Error)]
enum ImportError {
    #[error(transparent)]
    InvalidUrl(#[from] UrlValidationError),
    #[error(transparent)]
    Source(#[from] SourceError),
}

async fn import_one(
    url: &str,
    fetcher: &Fetcher,
    options: EngineOptions,
    now: DateTime<Utc>,
) -> Result<Source, ImportError> {
    validate_url(url, options.allow_private_hosts)?;
    let fetched = fetcher.fetch_source(url, now, options.parse).await?;
    Ok(seed_source(fetched))
}
