//! HTML helpers.

pub mod parser;

pub use parser::html_to_text;
