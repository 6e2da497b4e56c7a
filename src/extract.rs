//! Readable-text extraction from fetched HTML pages.
//!
//! [`HtmlExtractor`] prefers the page's `<article>` / `<main>` element,
//! falls back to `<body>`, drops non-content elements (scripts, styles,
//! navigation, forms) and emits one line per block element.

use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};

use crate::error::ExtractError;

/// Pure function from raw page bytes to plain body text.
pub trait ContentExtractor: Send + Sync {
    fn extract(&self, raw: &[u8]) -> Result<String, ExtractError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlExtractor;

const SKIPPED: &[&str] = &[
    "script", "style", "noscript", "iframe", "svg", "head", "nav", "header", "footer", "aside",
    "form", "button", "template", "figure",
];

const BLOCKS: &[&str] = &[
    "p", "div", "section", "article", "main", "h1", "h2", "h3", "h4", "h5", "h6", "li", "ul",
    "ol", "pre", "blockquote", "table", "tr", "td", "th", "br", "hr", "dd", "dt",
];

const CONTENT_ROOTS: &[&str] = &["article", "main", "[role=main]", "body"];

impl ContentExtractor for HtmlExtractor {
    fn extract(&self, raw: &[u8]) -> Result<String, ExtractError> {
        let html = String::from_utf8_lossy(raw);
        if html.trim().is_empty() {
            return Err(ExtractError::Empty);
        }

        let document = Html::parse_document(&html);
        let root = CONTENT_ROOTS
            .iter()
            .filter_map(|s| Selector::parse(s).ok())
            .find_map(|selector| document.select(&selector).next())
            .unwrap_or_else(|| document.root_element());

        let mut lines = Vec::new();
        let mut line = String::new();
        walk(root, &mut lines, &mut line);
        flush(&mut lines, &mut line);

        if lines.is_empty() {
            return Err(ExtractError::NoText);
        }
        Ok(lines.join("\n"))
    }
}

fn walk(element: ElementRef<'_>, lines: &mut Vec<String>, line: &mut String) {
    let name = element.value().name();
    if SKIPPED.contains(&name) {
        return;
    }

    let block = BLOCKS.contains(&name);
    if block {
        flush(lines, line);
    }

    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                for word in text.split_whitespace() {
                    if !line.is_empty() {
                        line.push(' ');
                    }
                    line.push_str(word);
                }
            }
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    walk(child, lines, line);
                }
            }
            _ => {}
        }
    }

    if block {
        flush(lines, line);
    }
}

fn flush(lines: &mut Vec<String>, line: &mut String) {
    if !line.is_empty() {
        lines.push(std::mem::take(line));
    }
}
