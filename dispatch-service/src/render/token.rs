//! Template scanner.
//!
//! Turns a template into a flat stream of [`Token`]s in a single left-to-right
//! pass. Tag boundaries are depth-aware: inside `{{ ... }}` every nested `{{`
//! raises the depth and every `}}` lowers it, and the tag closes at the `}}`
//! that brings the depth back to zero. This lets macro arguments carry whole
//! mustache tags.
//!
//! Nothing here looks at a context. Anything that is not a recognised tag shape
//! becomes [`TokenKind::Text`] carrying the original characters.

const OPEN: &str = "{{";
const CLOSE: &str = "}}";
const TRIPLE_OPEN: &str = "{{{";
const TRIPLE_CLOSE: &str = "}}}";

/// A scanned template fragment together with its source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Token<'a> {
    pub kind: TokenKind<'a>,
    /// The exact source characters, used when a tag has to fall back to literal text.
    pub raw: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind<'a> {
    Text,
    /// `{{ name }}`
    Variable(&'a str),
    /// `{{{ name }}}` or `{{& name }}`
    Raw(&'a str),
    /// `{{> name }}`
    Partial(&'a str),
    /// `{{# name }}` / `{{^ name }}`
    SectionOpen { name: &'a str, inverted: bool },
    /// `{{/ name }}`
    SectionClose(&'a str),
    /// `{{! ... }}`
    Comment,
    /// `{{ name(arg, ...) }}`
    MacroCall { name: &'a str, args: Vec<&'a str> },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Text,
    Tag { depth: usize },
}

/// Scan a template into tokens.
pub fn tokenize(template: &str) -> Vec<Token<'_>> {
    let bytes = template.as_bytes();
    let mut tokens = Vec::new();
    let mut state = State::Text;
    let mut text_start = 0;
    let mut tag_start = 0;
    let mut i = 0;

    loop {
        if i >= bytes.len() {
            match state {
                State::Text => break,
                // An unterminated tag: its opening braces are text, scanning resumes after them
                State::Tag { .. } => {
                    state = State::Text;
                    i = tag_start + OPEN.len();
                    continue;
                }
            }
        }

        match state {
            State::Text => {
                if template[i..].starts_with(TRIPLE_OPEN) {
                    if let Some(rel) = template[i + TRIPLE_OPEN.len()..].find(TRIPLE_CLOSE) {
                        push_text(&mut tokens, template, text_start, i);
                        let end = i + TRIPLE_OPEN.len() + rel + TRIPLE_CLOSE.len();
                        let body = &template[i + TRIPLE_OPEN.len()..end - TRIPLE_CLOSE.len()];
                        let raw = &template[i..end];
                        tokens.push(raw_tag(body.trim(), raw));
                        i = end;
                        text_start = end;
                        continue;
                    }
                }
                if template[i..].starts_with(OPEN) {
                    tag_start = i;
                    state = State::Tag { depth: 1 };
                    i += OPEN.len();
                    continue;
                }
                i += next_char_len(template, i);
            }
            State::Tag { depth } => {
                if template[i..].starts_with(OPEN) {
                    state = State::Tag { depth: depth + 1 };
                    i += OPEN.len();
                } else if template[i..].starts_with(CLOSE) {
                    i += CLOSE.len();
                    if depth == 1 {
                        push_text(&mut tokens, template, text_start, tag_start);
                        let raw = &template[tag_start..i];
                        let body = &raw[OPEN.len()..raw.len() - CLOSE.len()];
                        tokens.push(classify(body, raw));
                        text_start = i;
                        state = State::Text;
                    } else {
                        state = State::Tag { depth: depth - 1 };
                    }
                } else {
                    i += next_char_len(template, i);
                }
            }
        }
    }

    push_text(&mut tokens, template, text_start, template.len());
    tokens
}

fn next_char_len(s: &str, at: usize) -> usize {
    s[at..].chars().next().map_or(1, char::len_utf8)
}

fn push_text<'a>(tokens: &mut Vec<Token<'a>>, template: &'a str, start: usize, end: usize) {
    if end > start {
        tokens.push(Token {
            kind: TokenKind::Text,
            raw: &template[start..end],
        });
    }
}

fn raw_tag<'a>(name: &'a str, raw: &'a str) -> Token<'a> {
    let kind = if is_name(name) {
        TokenKind::Raw(name)
    } else {
        TokenKind::Text
    };
    Token { kind, raw }
}

/// Decide what a `{{ ... }}` tag body is.
fn classify<'a>(body: &'a str, raw: &'a str) -> Token<'a> {
    let trimmed = body.trim();
    let literal = Token {
        kind: TokenKind::Text,
        raw,
    };

    let Some(sigil) = trimmed.chars().next() else {
        return literal;
    };
    let rest = trimmed[sigil.len_utf8()..].trim();

    let kind = match sigil {
        '!' => TokenKind::Comment,
        '>' if is_name(rest) => TokenKind::Partial(rest),
        '#' if is_name(rest) => TokenKind::SectionOpen {
            name: rest,
            inverted: false,
        },
        '^' if is_name(rest) => TokenKind::SectionOpen {
            name: rest,
            inverted: true,
        },
        '/' if is_name(rest) => TokenKind::SectionClose(rest),
        '&' if is_name(rest) => TokenKind::Raw(rest),
        _ if is_name(trimmed) => TokenKind::Variable(trimmed),
        _ => match macro_call(trimmed) {
            Some((name, args)) => TokenKind::MacroCall { name, args },
            None => return literal,
        },
    };

    Token { kind, raw }
}

/// Parse `name(args...)`.
///
/// The argument list runs from the first `(` to the last `)`, so a literal `)`
/// inside an argument does not end the call.
fn macro_call(body: &str) -> Option<(&str, Vec<&str>)> {
    let open = body.find('(')?;
    let close = body.rfind(')')?;
    if close != body.len() - 1 || close < open {
        return None;
    }

    let name = body[..open].trim();
    if !is_identifier(name) {
        return None;
    }

    Some((name, split_args(&body[open + 1..close])))
}

/// Split an argument list on commas that sit outside any nested `{{ }}`.
///
/// An empty (or all-whitespace) list yields no arguments.
pub fn split_args(list: &str) -> Vec<&str> {
    if list.trim().is_empty() {
        return Vec::new();
    }

    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut i = 0;

    while i < list.len() {
        let rest = &list[i..];
        if rest.starts_with(OPEN) {
            depth += 1;
            i += OPEN.len();
        } else if rest.starts_with(CLOSE) {
            depth = depth.saturating_sub(1);
            i += CLOSE.len();
        } else if rest.starts_with(',') && depth == 0 {
            args.push(list[start..i].trim());
            i += 1;
            start = i;
        } else {
            i += next_char_len(list, i);
        }
    }
    args.push(list[start..].trim());

    args
}

/// Variable and section names: identifier characters plus `.` for nested access.
pub fn is_name(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Macro and parameter names.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(template: &str) -> Vec<TokenKind<'_>> {
        tokenize(template).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_plain_text_is_single_token() {
        let tokens = tokenize("hello world");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].raw, "hello world");
    }

    #[test]
    fn test_tag_shapes() {
        assert_eq!(
            kinds("a {{ x }} {{{ y }}} {{> p }} {{& z }}"),
            vec![
                TokenKind::Text,
                TokenKind::Variable("x"),
                TokenKind::Text,
                TokenKind::Raw("y"),
                TokenKind::Text,
                TokenKind::Partial("p"),
                TokenKind::Text,
                TokenKind::Raw("z"),
            ]
        );
    }

    #[test]
    fn test_sections_and_comments() {
        assert_eq!(
            kinds("{{# items }}{{^ none }}{{/ items }}{{! note }}"),
            vec![
                TokenKind::SectionOpen {
                    name: "items",
                    inverted: false
                },
                TokenKind::SectionOpen {
                    name: "none",
                    inverted: true
                },
                TokenKind::SectionClose("items"),
                TokenKind::Comment,
            ]
        );
    }

    #[test]
    fn test_macro_call_with_nested_tags() {
        let tokens = tokenize("{{ spam({{ foo }}, {{ bar}} ) }}");
        assert_eq!(tokens.len(), 1);
        assert_eq!(
            tokens[0].kind,
            TokenKind::MacroCall {
                name: "spam",
                args: vec!["{{ foo }}", "{{ bar}}"]
            }
        );
    }

    #[test]
    fn test_macro_args_run_to_last_paren() {
        let tokens = tokenize("{{ spam(with bracket ) , {{ bar}} ) }}");
        assert_eq!(
            tokens[0].kind,
            TokenKind::MacroCall {
                name: "spam",
                args: vec!["with bracket )", "{{ bar}}"]
            }
        );
    }

    #[test]
    fn test_macro_call_without_args() {
        assert_eq!(
            kinds("{{ foo() }}"),
            vec![TokenKind::MacroCall {
                name: "foo",
                args: vec![]
            }]
        );
    }

    #[test]
    fn test_comma_inside_nested_tag_does_not_split() {
        assert_eq!(split_args("a, {{ f(b, c) }}"), vec!["a", "{{ f(b, c) }}"]);
    }

    #[test]
    fn test_unknown_and_unterminated_tags_are_literal() {
        let tokens = tokenize("x {{ not a tag }} y {{ open");
        assert!(tokens.iter().all(|t| t.kind == TokenKind::Text));
        let joined: String = tokens.iter().map(|t| t.raw).collect();
        assert_eq!(joined, "x {{ not a tag }} y {{ open");
    }

    #[test]
    fn test_stray_open_does_not_swallow_later_tags() {
        let template = "Hi {{ oops, welcome {{ name }}! {{{ x }}}";
        let tokens = tokenize(template);

        assert!(tokens.iter().any(|t| t.kind == TokenKind::Variable("name")));
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Raw("x")));
        let joined: String = tokens.iter().map(|t| t.raw).collect();
        assert_eq!(joined, template);
    }

    #[test]
    fn test_raw_text_is_preserved_across_tokens() {
        let template = "a{{b}}c{{{d}}}e{{ f(1, {{g}}) }}h";
        let joined: String = tokenize(template).iter().map(|t| t.raw).collect();
        assert_eq!(joined, template);
    }

    #[test]
    fn test_identifier_rules() {
        assert!(is_identifier("spam"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1x"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("a b"));
    }
}
