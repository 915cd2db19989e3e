//! Markdown → HTML conversion for `__md` context keys and the content block.

use comrak::{markdown_to_html, Options};

/// Suffix marking a context key whose string value is markdown.
pub const MARKDOWN_SUFFIX: &str = "__md";

/// Render markdown to an HTML fragment.
///
/// Single newlines become `<br />` and raw HTML in the source is passed through.
pub fn render_markdown(source: &str) -> String {
    let mut options = Options::default();
    options.render.hardbreaks = true;
    options.render.unsafe_ = true;

    let source = source.replace("\r\n", "\n");
    markdown_to_html(&source, &options)
}
