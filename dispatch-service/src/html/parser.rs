//! HTML parsing utilities for deriving the plain-text part of a message.

use scraper::{Html, Node};
use tracing::debug;

/// Elements that start a new line in the text rendering.
const BLOCK_ELEMENTS: &[&str] = &[
    "address", "article", "blockquote", "br", "div", "dd", "dl", "dt", "footer", "h1", "h2",
    "h3", "h4", "h5", "h6", "header", "hr", "li", "ol", "p", "pre", "section", "table", "td",
    "th", "tr", "ul",
];

/// Elements whose text is never shown.
const HIDDEN_ELEMENTS: &[&str] = &["head", "script", "style", "title"];

/// Convert rendered HTML into readable plain text.
///
/// Block elements break lines, whitespace inside text collapses, and blank
/// lines are dropped.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut raw = String::with_capacity(html.len() / 2);

    for node in document.tree.root().descendants() {
        match node.value() {
            Node::Text(text) => {
                let hidden = node.ancestors().any(|a| match a.value() {
                    Node::Element(el) => HIDDEN_ELEMENTS.contains(&el.name()),
                    _ => false,
                });
                if !hidden {
                    raw.extend(text.chars().map(|c| if c.is_whitespace() { ' ' } else { c }));
                }
            }
            Node::Element(el) if BLOCK_ELEMENTS.contains(&el.name()) => raw.push('\n'),
            _ => {}
        }
    }

    let text = raw
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    debug!(html_length = html.len(), text_length = text.len(), "html_to_text");
    text
}
