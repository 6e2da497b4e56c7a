//! Feed document parsing.
//!
//! Wraps `feed-rs` (RSS 0.9x/1.0/2.0, Atom, JSON Feed) and adapts each
//! parsed entry into an [`EntryRecord`]. The parser is configured not to
//! synthesize ids, so an empty `guid` means the feed did not supply one
//! and de-duplication falls back to the link.

use feed_rs::model::{Entry, Link};
use feed_rs::parser;

use crate::error::ParseError;
use crate::models::EntryRecord;

/// Parse a feed document into entry records, in document order.
pub fn parse_entries(body: &[u8]) -> Result<Vec<EntryRecord>, ParseError> {
    let parser = parser::Builder::new()
        .id_generator(|_links, _title, _uri| String::new())
        .build();

    let feed = parser
        .parse(body)
        .map_err(|e| ParseError(e.to_string()))?;

    Ok(feed.entries.into_iter().map(entry_record).collect())
}

/// The entry's canonical link: `rel="alternate"` (or no rel) first.
fn primary_link(links: &[Link]) -> Option<String> {
    links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .or_else(|| links.first())
        .map(|l| l.href.trim().to_string())
        .filter(|href| !href.is_empty())
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn entry_record(entry: Entry) -> EntryRecord {
    let link = primary_link(&entry.links);
    let summary_html = entry
        .summary
        .map(|t| t.content)
        .or_else(|| entry.content.and_then(|c| c.body))
        .and_then(non_empty);

    EntryRecord {
        guid: non_empty(entry.id),
        link,
        title: entry.title.map(|t| t.content).and_then(non_empty),
        author: entry
            .authors
            .into_iter()
            .next()
            .map(|p| p.name)
            .and_then(non_empty),
        published: entry.published.or(entry.updated),
        summary_html,
    }
}
