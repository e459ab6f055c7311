//! Feed handling: OPML subscription lists, HTTP fetching and RSS/Atom parsing.
//!
//! - [`opml`] - OPML outline tree parsing, flattening to feed URLs and export
//! - [`fetcher`] - bounded HTTP retrieval with retry and size limits
//! - [`parser`] - Atom-then-RSS parsing into the [`Source`](crate::storage::Source) model
//!
//! # Example
//!
//! ```ignore
//! use tidings::feed::{flatten, parse_opml, Fetcher, FetchPolicy, ParseOptions};
//!
//! let urls = flatten(&parse_opml(&opml_text)?);
//! let fetcher = Fetcher::new(FetchPolicy::default())?;
//! let source = fetcher.fetch_source(&urls[0], chrono::Utc::now(), ParseOptions::default()).await?;
//! ```

mod fetcher;
mod opml;
mod parser;

pub use fetcher::{FetchError, FetchPolicy, Fetcher, SourceError};
pub use opml::{export_opml, flatten, parse, parse_opml, OpmlError, Outline};
pub use parser::{parse_atom, parse_feed, parse_rss, FormatError, FormatUnrecognized, ParseOptions};
