//! Dual-format feed parsing.
//!
//! A document is tried as Atom first and as RSS 2.0 second. Each attempt
//! returns its own [`FormatError`]; when both fail the caller receives a
//! [`FormatUnrecognized`] holding the two reasons.

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::Deserialize;
use thiserror::Error;

use crate::storage::{Entry, Source};

/// Why a single format attempt rejected a document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("document is empty")]
    Empty,
    #[error("document is not valid UTF-8")]
    Encoding,
    #[error("root element is <{found}>, expected <{expected}>")]
    RootMismatch {
        expected: &'static str,
        found: String,
    },
    #[error("XML error: {0}")]
    Xml(String),
    /// RSS document without a `<channel>`.
    #[error("RSS document has no channel")]
    NoChannelFound,
    /// RSS document with more than one `<channel>`.
    #[error("RSS document has {0} channels, expected exactly 1")]
    MultiChannelUnsupported(usize),
}

/// Neither the Atom nor the RSS attempt accepted the document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unrecognized feed format (atom: {atom}; rss: {rss})")]
pub struct FormatUnrecognized {
    pub atom: FormatError,
    pub rss: FormatError,
}

/// Knobs that apply to every entry parsed during a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseOptions {
    /// Fill `Entry::body` from Atom content/summary or RSS description.
    /// When off, bodies are left empty.
    pub include_body: bool,
}

// ============================================================================
// Document Shapes
// ============================================================================

/// Text content of an element; attributes and child elements are ignored.
#[derive(Debug, Default, Deserialize)]
struct Text {
    #[serde(rename = "$text", default)]
    value: String,
}

fn text(value: Option<Text>) -> String {
    value.map(|t| t.value.trim().to_string()).unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(default)]
    title: Option<Text>,
    #[serde(rename = "entry", default)]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    #[serde(default)]
    title: Option<Text>,
    #[serde(rename = "link", default)]
    links: Vec<AtomLink>,
    #[serde(rename = "author", default)]
    authors: Vec<AtomAuthor>,
    #[serde(default)]
    summary: Option<Text>,
    #[serde(default)]
    content: Option<Text>,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href", default)]
    href: String,
    #[serde(rename = "@rel", default)]
    rel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomAuthor {
    #[serde(default)]
    name: Option<Text>,
}

#[derive(Debug, Deserialize)]
struct RssDocument {
    #[serde(rename = "channel", default)]
    channels: Vec<RssChannel>,
}

#[derive(Debug, Deserialize)]
struct RssChannel {
    #[serde(default)]
    title: Option<Text>,
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    #[serde(default)]
    title: Option<Text>,
    #[serde(default)]
    link: Option<Text>,
    #[serde(default)]
    description: Option<Text>,
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse a fetched feed document into a [`Source`].
///
/// # Arguments
///
/// * `bytes` - Raw response body, UTF-8 with an optional byte order mark
/// * `feed_url` - URL the document was fetched from; becomes the source identity
/// * `now` - Fetch time stored as `last_fetched`
/// * `options` - Whether entry bodies are filled in
///
/// # Returns
///
/// A source in the uncategorized folder with every entry unread, in
/// document order. Namespaced extension elements are ignored.
///
/// # Errors
///
/// [`FormatUnrecognized`] when the document is neither a valid Atom feed nor
/// an RSS 2.0 document with exactly one channel. It carries the reason each
/// attempt gave up.
pub fn parse_feed(
    bytes: &[u8],
    feed_url: &str,
    now: DateTime<Utc>,
    options: ParseOptions,
) -> Result<Source, FormatUnrecognized> {
    let atom = match parse_atom(bytes, feed_url, now, options) {
        Ok(source) => {
            tracing::debug!(feed = %feed_url, entries = source.entries.len(), "Parsed as Atom");
            return Ok(source);
        }
        Err(e) => e,
    };

    let rss = match parse_rss(bytes, feed_url, now, options) {
        Ok(source) => {
            tracing::debug!(feed = %feed_url, entries = source.entries.len(), "Parsed as RSS");
            return Ok(source);
        }
        Err(e) => e,
    };

    Err(FormatUnrecognized { atom, rss })
}

/// Parse `bytes` as an Atom feed.
pub fn parse_atom(
    bytes: &[u8],
    feed_url: &str,
    now: DateTime<Utc>,
    options: ParseOptions,
) -> Result<Source, FormatError> {
    let xml = prepare(bytes)?;
    expect_root(xml, "feed")?;
    let xml = unprefixed_document(xml, true)?;
    let feed: AtomFeed = quick_xml::de::from_str(&xml).map_err(xml_error)?;

    let mut source = Source::new(text(feed.title), feed_url, now);
    source.entries = feed
        .entries
        .into_iter()
        .map(|entry| {
            let url = pick_atom_link(&entry.links);
            let author = entry
                .authors
                .into_iter()
                .find_map(|a| a.name.map(|n| n.value.trim().to_string()))
                .unwrap_or_default();
            let body = if options.include_body {
                let content = text(entry.content);
                if content.is_empty() {
                    text(entry.summary)
                } else {
                    content
                }
            } else {
                String::new()
            };

            Entry {
                title: text(entry.title),
                author,
                url,
                read: false,
                body,
            }
        })
        .collect();

    Ok(source)
}

/// Parse `bytes` as an RSS 2.0 feed with exactly one channel.
pub fn parse_rss(
    bytes: &[u8],
    feed_url: &str,
    now: DateTime<Utc>,
    options: ParseOptions,
) -> Result<Source, FormatError> {
    let xml = prepare(bytes)?;
    expect_root(xml, "rss")?;
    let xml = unprefixed_document(xml, false)?;
    let document: RssDocument = quick_xml::de::from_str(&xml).map_err(xml_error)?;

    let mut channels = document.channels;
    let channel = match channels.len() {
        0 => return Err(FormatError::NoChannelFound),
        1 => channels.remove(0),
        n => return Err(FormatError::MultiChannelUnsupported(n)),
    };

    let mut source = Source::new(text(channel.title), feed_url, now);
    source.entries = channel
        .items
        .into_iter()
        .map(|item| Entry {
            title: text(item.title),
            // RSS items carry no author we read
            author: String::new(),
            url: text(item.link),
            read: false,
            body: if options.include_body {
                text(item.description)
            } else {
                String::new()
            },
        })
        .collect();

    Ok(source)
}

/// The `href` of the entry's alternate link, falling back to the first link.
fn pick_atom_link(links: &[AtomLink]) -> String {
    links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")) && !l.href.is_empty())
        .or_else(|| links.iter().find(|l| !l.href.is_empty()))
        .map(|l| l.href.trim().to_string())
        .unwrap_or_default()
}

fn prepare(bytes: &[u8]) -> Result<&str, FormatError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let xml = std::str::from_utf8(bytes)
        .map_err(|_| FormatError::Encoding)?
        .trim_start();
    if xml.is_empty() {
        return Err(FormatError::Empty);
    }
    Ok(xml)
}

fn expect_root(xml: &str, expected: &'static str) -> Result<(), FormatError> {
    let found = root_element(xml)?;
    if found == expected {
        Ok(())
    } else {
        Err(FormatError::RootMismatch { expected, found })
    }
}

/// Qualified name of the document's first element. Prefixed roots such as
/// `<atom:feed>` do not match, since the document shapes expect plain names.
fn root_element(xml: &str) -> Result<String, FormatError> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return Ok(String::from_utf8_lossy(e.name().as_ref()).into_owned());
            }
            Ok(Event::Eof) => return Err(FormatError::Empty),
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
    }
}

fn xml_error(e: impl std::fmt::Display) -> FormatError {
    FormatError::Xml(e.to_string())
}

/// Re-serialize `xml` without any namespace-prefixed element.
///
/// The serde deserializer matches elements by local name, so extension
/// elements such as `<dc:title>`, `<media:title>` or an item-level
/// `<atom:link>` would otherwise collide with the core `title` and `link`
/// fields. Extension elements are dropped together with their subtree.
///
/// With `inline_xhtml`, Atom `content` and `summary` elements of
/// `type="xhtml"` have their markup turned into escaped text, so that the
/// body keeps it instead of reading only the bare text nodes.
fn unprefixed_document(xml: &str, inline_xhtml: bool) -> Result<String, FormatError> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::with_capacity(xml.len()));

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Eof => break,
            Event::Start(e) if e.name().prefix().is_some() => {
                reader.read_to_end(e.name()).map_err(xml_error)?;
            }
            Event::Empty(e) if e.name().prefix().is_some() => {}
            Event::Start(e) if inline_xhtml && is_xhtml_text_construct(&e) => {
                let markup = inner_markup(&mut reader)?;
                let end = e.to_end().into_owned();
                writer.write_event(Event::Start(e)).map_err(xml_error)?;
                writer
                    .write_event(Event::Text(BytesText::new(&markup)))
                    .map_err(xml_error)?;
                writer.write_event(Event::End(end)).map_err(xml_error)?;
            }
            event => writer.write_event(event).map_err(xml_error)?,
        }
    }

    String::from_utf8(writer.into_inner()).map_err(|_| FormatError::Encoding)
}

fn is_xhtml_text_construct(e: &BytesStart<'_>) -> bool {
    matches!(e.name().as_ref(), b"content" | b"summary")
        && e.try_get_attribute("type")
            .ok()
            .flatten()
            .is_some_and(|a| a.value.as_ref() == b"xhtml")
}

/// Markup between the current start tag and its end tag, which is consumed.
/// The wrapping `<div>` that Atom requires around xhtml content is left out.
fn inner_markup(reader: &mut Reader<&[u8]>) -> Result<String, FormatError> {
    let mut out = Writer::new(Vec::new());
    let mut depth = 0usize;
    let mut seen_element = false;
    let mut in_wrapper = false;

    loop {
        let event = reader.read_event().map_err(xml_error)?;
        match &event {
            Event::Start(e) => {
                depth += 1;
                let first = !seen_element;
                seen_element = true;
                if depth == 1 && first && e.local_name().as_ref() == b"div" {
                    in_wrapper = true;
                    continue;
                }
            }
            Event::Empty(_) => seen_element = true,
            Event::End(_) if depth == 0 => break,
            Event::End(_) => {
                depth -= 1;
                if depth == 0 && in_wrapper {
                    in_wrapper = false;
                    continue;
                }
            }
            Event::Eof => return Err(FormatError::Xml("unexpected end of document".to_string())),
            _ => {}
        }
        out.write_event(event).map_err(xml_error)?;
    }

    String::from_utf8(out.into_inner()).map_err(|_| FormatError::Encoding)
}
