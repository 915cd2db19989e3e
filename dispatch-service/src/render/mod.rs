//! Template rendering.
//!
//! A mustache-family engine with request-scoped partials and macros:
//!
//! ```text
//! template → tokenize() → Token stream → section tree → Renderer (Scope) → text
//! ```

pub mod engine;
pub mod macros;
pub mod markdown;
pub mod token;
pub mod value;

pub use engine::{escape_html, Renderer, CONTENT_TARGET, DEFAULT_CONTENT_KEY, MAX_RENDER_DEPTH};
pub use macros::{MacroDef, MacroForm, MacroSet};
pub use markdown::{render_markdown, MARKDOWN_SUFFIX};
pub use value::{Context, Scope, Value};
