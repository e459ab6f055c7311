use std::collections::HashSet;

use crate::storage::Source;

/// Append the entries of `fetched` that `existing` has not seen yet.
///
/// An entry is known when an entry with the same link URL is already present.
/// Known entries are left untouched, so read flags survive a refresh. New
/// entries keep their feed order and go to the end. Nothing is ever removed.
/// Returns the number of entries appended.
pub fn merge(existing: &mut Source, fetched: Source) -> usize {
    let mut seen: HashSet<String> = existing.entries.iter().map(|e| e.url.clone()).collect();
    let before = existing.entries.len();

    for entry in fetched.entries {
        // Also collapses duplicate links inside a single fetch
        if seen.insert(entry.url.clone()) {
            existing.entries.push(entry);
        }
    }

    existing.entries.len() - before
}
