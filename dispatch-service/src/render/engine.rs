//! Template renderer.
//!
//! Rendering runs in two steps: the token stream from [`tokenize`] is folded
//! into a tree (sections own their children), then the tree is walked against
//! a [`Scope`]. Partials and macros are passed in explicitly and live only as
//! long as one send request.
//!
//! Rendering never fails. Unknown tags are emitted as written, missing values
//! and partials render empty, and macro calls with the wrong number of
//! arguments collapse to nothing.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::macros::{MacroDef, MacroSet};
use super::markdown::{render_markdown, MARKDOWN_SUFFIX};
use super::token::{tokenize, Token, TokenKind};
use super::value::{Context, Scope, Value};

/// Maximum nesting of partials, macro bodies and macro arguments.
pub const MAX_RENDER_DEPTH: usize = 16;

/// Context key holding the main body template by default.
pub const DEFAULT_CONTENT_KEY: &str = "message__render";

/// Context key under which the rendered body is exposed to the main template.
pub const CONTENT_TARGET: &str = "message";

#[derive(Debug, Clone, PartialEq)]
enum Node<'a> {
    Text(&'a str),
    Variable(&'a str),
    Raw(&'a str),
    Partial(&'a str),
    Section {
        name: &'a str,
        inverted: bool,
        children: Vec<Node<'a>>,
    },
    Macro {
        name: &'a str,
        args: Vec<&'a str>,
        raw: &'a str,
    },
}

struct OpenSection<'a> {
    name: &'a str,
    inverted: bool,
    raw: &'a str,
    children: Vec<Node<'a>>,
}

impl<'a> OpenSection<'a> {
    /// An unclosed section: its opening tag becomes text and its children are kept.
    fn flatten_into(self, parent: &mut Vec<Node<'a>>) {
        parent.push(Node::Text(self.raw));
        parent.extend(self.children);
    }
}

fn current<'s, 'a>(
    root: &'s mut Vec<Node<'a>>,
    stack: &'s mut [OpenSection<'a>],
) -> &'s mut Vec<Node<'a>> {
    match stack.last_mut() {
        Some(section) => &mut section.children,
        None => root,
    }
}

fn build_tree(tokens: Vec<Token<'_>>) -> Vec<Node<'_>> {
    let mut root = Vec::new();
    let mut stack: Vec<OpenSection> = Vec::new();

    for token in tokens {
        let node = match token.kind {
            TokenKind::Text => Node::Text(token.raw),
            TokenKind::Comment => continue,
            TokenKind::Variable(name) => Node::Variable(name),
            TokenKind::Raw(name) => Node::Raw(name),
            TokenKind::Partial(name) => Node::Partial(name),
            TokenKind::MacroCall { name, args } => Node::Macro {
                name,
                args,
                raw: token.raw,
            },
            TokenKind::SectionOpen { name, inverted } => {
                stack.push(OpenSection {
                    name,
                    inverted,
                    raw: token.raw,
                    children: Vec::new(),
                });
                continue;
            }
            TokenKind::SectionClose(name) => {
                let Some(pos) = stack.iter().rposition(|s| s.name == name) else {
                    current(&mut root, &mut stack).push(Node::Text(token.raw));
                    continue;
                };

                while stack.len() > pos + 1 {
                    if let Some(unclosed) = stack.pop() {
                        unclosed.flatten_into(current(&mut root, &mut stack));
                    }
                }

                let Some(section) = stack.pop() else { continue };
                Node::Section {
                    name: section.name,
                    inverted: section.inverted,
                    children: section.children,
                }
            }
        };

        current(&mut root, &mut stack).push(node);
    }

    while let Some(unclosed) = stack.pop() {
        unclosed.flatten_into(current(&mut root, &mut stack));
    }

    root
}

/// HTML-escape interpolated text.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Renders templates against a context with request-scoped partials and macros.
#[derive(Debug, Clone, Copy)]
pub struct Renderer<'r> {
    partials: &'r HashMap<String, String>,
    macros: &'r MacroSet,
}

impl<'r> Renderer<'r> {
    pub fn new(partials: &'r HashMap<String, String>, macros: &'r MacroSet) -> Self {
        Self { partials, macros }
    }

    /// Render `template` against `context`.
    pub fn render(&self, template: &str, context: &Context) -> String {
        let root = Value::Map(context.clone());
        self.render_in(template, &Scope::new(&root), 0)
    }

    /// Render the content block and expose it for the main template.
    ///
    /// When `content_key` holds a string it is rendered against `context`,
    /// converted from markdown, and inserted as [`CONTENT_TARGET`]. Returns the
    /// rendered markdown source, which is what a plain-text part would show.
    pub fn render_content(&self, context: &mut Context, content_key: &str) -> Option<String> {
        let source = context.get(content_key)?.as_str()?.to_string();
        let rendered = self.render(&source, context);
        context.insert(
            CONTENT_TARGET.to_string(),
            Value::Html(render_markdown(&rendered)),
        );
        Some(rendered)
    }

    fn render_in(&self, template: &str, scope: &Scope<'_>, depth: usize) -> String {
        if depth > MAX_RENDER_DEPTH {
            warn!(depth = depth, "render_depth_exceeded");
            return String::new();
        }

        let nodes = build_tree(tokenize(template));
        let mut out = String::with_capacity(template.len());
        self.render_nodes(&nodes, scope, depth, &mut out);
        out
    }

    fn render_nodes(&self, nodes: &[Node<'_>], scope: &Scope<'_>, depth: usize, out: &mut String) {
        for node in nodes {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Variable(name) => self.interpolate(name, scope, depth, true, out),
                Node::Raw(name) => self.interpolate(name, scope, depth, false, out),
                Node::Partial(name) => match self.partials.get(*name) {
                    Some(partial) => out.push_str(&self.render_in(partial, scope, depth + 1)),
                    None => debug!(partial = %name, "partial_missing"),
                },
                Node::Section {
                    name,
                    inverted,
                    children,
                } => {
                    let value = scope.lookup(name);
                    let truthy = value.is_some_and(Value::is_truthy);

                    if *inverted {
                        if !truthy {
                            self.render_nodes(children, scope, depth, out);
                        }
                        continue;
                    }

                    match value {
                        Some(Value::List(items)) => {
                            for item in items {
                                self.render_nodes(children, &scope.push(item), depth, out);
                            }
                        }
                        Some(value) if truthy => {
                            self.render_nodes(children, &scope.push(value), depth, out);
                        }
                        _ => {}
                    }
                }
                Node::Macro { name, args, raw } => match self.macros.get(name) {
                    None => out.push_str(raw),
                    Some(def) if def.accepts_call(args.len()) => {
                        out.push_str(&self.expand(def, args, scope, depth));
                    }
                    Some(def) => {
                        debug!(
                            name = %name,
                            expected = def.params.len(),
                            given = args.len(),
                            "macro_arity_mismatch"
                        );
                    }
                },
            }
        }
    }

    /// Substitute a name.
    ///
    /// Lookup order: the value itself, then a markdown `name__md` value
    /// (converted to HTML), then a zero-parameter macro of the same name.
    fn interpolate(&self, name: &str, scope: &Scope<'_>, depth: usize, escape: bool, out: &mut String) {
        match scope.lookup(name) {
            Some(Value::Html(html)) => out.push_str(html),
            Some(value) if escape => out.push_str(&escape_html(&value.to_text())),
            Some(value) => out.push_str(&value.to_text()),
            None => {
                let markdown = format!("{}{}", name, MARKDOWN_SUFFIX);
                if let Some(source) = scope.lookup(&markdown).and_then(Value::as_str) {
                    out.push_str(&render_markdown(source));
                } else if let Some(def) = self.macros.get(name).filter(|d| d.accepts_bare()) {
                    out.push_str(&self.expand(def, &[], scope, depth));
                }
            }
        }
    }

    /// Expand a macro body in a fresh scope holding only its parameters.
    ///
    /// Each argument is first rendered against the caller's scope; the results
    /// are bound as already-rendered markup.
    fn expand(&self, def: &MacroDef, args: &[&str], scope: &Scope<'_>, depth: usize) -> String {
        let params: Context = def
            .params
            .iter()
            .zip(args)
            .map(|(param, arg)| {
                let rendered = self.render_in(arg, scope, depth + 1);
                (param.clone(), Value::Html(rendered))
            })
            .collect();

        let frame = Value::Map(params);
        self.render_in(&def.body, &Scope::new(&frame), depth + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(json: serde_json::Value) -> Context {
        serde_json::from_value(json).unwrap()
    }

    fn render(template: &str, context: serde_json::Value) -> String {
        let partials = HashMap::new();
        let macros = MacroSet::new();
        Renderer::new(&partials, &macros).render(template, &ctx(context))
    }

    fn render_with_macros(template: &str, context: serde_json::Value, defs: &[(&str, &str)]) -> String {
        let partials = HashMap::new();
        let defs: HashMap<String, String> = defs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let macros = MacroSet::parse(&defs);
        Renderer::new(&partials, &macros).render(template, &ctx(context))
    }

    #[test]
    fn test_text_without_tags_is_unchanged() {
        let template = "Dear customer,\n\n  nothing {here} to } see {\n";
        assert_eq!(render(template, json!({"x": 1})), template);
    }

    #[test]
    fn test_escaped_and_raw_interpolation() {
        assert_eq!(render("{{ x }}", json!({"x": "<b>"})), "&lt;b&gt;");
        assert_eq!(render("{{{ x }}}", json!({"x": "<b>"})), "<b>");
        assert_eq!(render("{{& x }}", json!({"x": "<b>"})), "<b>");
    }

    #[test]
    fn test_markdown_key_renders_as_html() {
        assert_eq!(render("{{ x }}", json!({"x__md": "**A**"})), "<p><strong>A</strong></p>\n");
        assert_eq!(render("{{{ x }}}", json!({"x__md": "**A**"})), "<p><strong>A</strong></p>\n");
        assert_eq!(render("{{ x }}", json!({"x": "plain", "x__md": "**A**"})), "plain");
    }

    #[test]
    fn test_markdown_key_inside_section() {
        let out = render(
            "{{# items }}[{{ d }}]{{/ items }}",
            json!({"items": [{"d__md": "**A**"}, {"d__md": "_b_"}]}),
        );
        assert_eq!(out, "[<p><strong>A</strong></p>\n][<p><em>b</em></p>\n]");
    }

    #[test]
    fn test_stray_open_tag_keeps_rendering() {
        assert_eq!(
            render("Hi {{ oops, welcome {{ name }}! {{{ x }}}", json!({"name": "Ann", "x": "<X>"})),
            "Hi {{ oops, welcome Ann! <X>"
        );
    }

    #[test]
    fn test_missing_key_renders_empty() {
        assert_eq!(render("a{{ missing }}b", json!({})), "ab");
    }

    #[test]
    fn test_unknown_tags_left_literal() {
        assert_eq!(
            render("x {{ not valid! }} y {{ a", json!({"a": "A"})),
            "x {{ not valid! }} y {{ a"
        );
    }

    #[test]
    fn test_dotted_and_numbers() {
        assert_eq!(
            render("{{ user.name }} has {{ count }}", json!({"user": {"name": "Ann"}, "count": 3})),
            "Ann has 3"
        );
    }

    #[test]
    fn test_list_section_repeats() {
        let out = render(
            "{{# items }}[{{ name }}]{{/ items }}",
            json!({"items": [{"name": "a"}, {"name": "b"}]}),
        );
        assert_eq!(out, "[a][b]");
    }

    #[test]
    fn test_absent_section_and_inverted() {
        assert_eq!(render("{{# nope }}x{{/ nope }}y", json!({})), "y");
        assert_eq!(render("{{^ nope }}empty{{/ nope }}", json!({"nope": []})), "empty");
        assert_eq!(render("{{^ yes }}empty{{/ yes }}", json!({"yes": true})), "");
    }

    #[test]
    fn test_section_on_map_and_dot() {
        assert_eq!(
            render("{{# user }}{{ name }}{{/ user }}", json!({"user": {"name": "Ann"}})),
            "Ann"
        );
        assert_eq!(
            render("{{# tags }}{{ . }},{{/ tags }}", json!({"tags": ["a", "b"]})),
            "a,b,"
        );
    }

    #[test]
    fn test_unbalanced_sections_degrade_to_text() {
        assert_eq!(render("a{{/ x }}b", json!({})), "a{{/ x }}b");
        assert_eq!(render("a{{# x }}b", json!({"x": true})), "a{{# x }}b");
    }

    #[test]
    fn test_partials_render_in_current_context() {
        let mut partials = HashMap::new();
        partials.insert("p".to_string(), "({{ foo }})".to_string());
        let macros = MacroSet::new();
        let renderer = Renderer::new(&partials, &macros);

        let out = renderer.render("x {{> p }} {{> missing }}y", &ctx(json!({"foo": "FOO"})));
        assert_eq!(out, "x (FOO) y");
    }

    #[test]
    fn test_recursive_partial_is_bounded() {
        let mut partials = HashMap::new();
        partials.insert("loop".to_string(), "a{{> loop }}".to_string());
        let macros = MacroSet::new();

        let out = Renderer::new(&partials, &macros).render("{{> loop }}", &Context::new());
        assert_eq!(out, "a".repeat(MAX_RENDER_DEPTH));
    }

    #[test]
    fn test_html_values_are_not_escaped() {
        let mut context = Context::new();
        context.insert("x".into(), Value::Html("<strong>A</strong>".into()));
        let partials = HashMap::new();
        let macros = MacroSet::new();

        let out = Renderer::new(&partials, &macros).render("{{ x }}", &context);
        assert_eq!(out, "<strong>A</strong>");
    }

    #[test]
    fn test_macro_with_nested_args() {
        let defs = [("spam(apple, pear)", "___{{apple}} {{pear}}___")];
        let context = json!({"foo": "FOO", "bar": "BAR"});

        assert_eq!(
            render_with_macros("{{ spam({{foo}}, {{bar}}) }}", context.clone(), &defs),
            "___FOO BAR___"
        );
        assert_eq!(render_with_macros("{{ spam(x, y) }}", context, &defs), "___x y___");
    }

    #[test]
    fn test_macro_arity() {
        let defs = [("foo()", "body")];
        assert_eq!(render_with_macros("[{{ foo() }}]", json!({}), &defs), "[body]");
        assert_eq!(render_with_macros("[{{ foo(1,2) }}]", json!({}), &defs), "[]");
    }

    #[test]
    fn test_macro_call_forms() {
        let defs = [
            ("foo()", "___is foo___"),
            ("bar", "___is bar___"),
            ("spam(apple, pear)", "___spam {{apple}} {{pear}}___"),
        ];
        let context = json!({"foo": "FOO", "bar": "BAR"});
        let template = "foo:{{ foo() }}\n\
                        foo wrong:{{ foo(1, 2) }}\n\
                        bar:{{ bar() }}\n\
                        spam1:{{ spam(x, y ) }}\n\
                        spam2:{{ spam(with bracket ) , {{ bar}} ) }}\n\
                        spam3:{{ spam({{ foo }}, {{ bar}} ) }}\n\
                        spam wrong:{{ spam(1, {{ bar}}, x) }}\n";

        assert_eq!(
            render_with_macros(template, context, &defs),
            "foo:___is foo___\n\
             foo wrong:\n\
             bar:\n\
             spam1:___spam x y___\n\
             spam2:___spam with bracket ) BAR___\n\
             spam3:___spam FOO BAR___\n\
             spam wrong:\n"
        );
    }

    #[test]
    fn test_bare_macro_call_yields_to_context() {
        let defs = [("bar", "macro"), ("baz()", "zero-arg")];

        assert_eq!(render_with_macros("{{ bar }}", json!({}), &defs), "macro");
        assert_eq!(render_with_macros("{{ bar }}", json!({"bar": "ctx"}), &defs), "ctx");
        assert_eq!(render_with_macros("{{ baz }}", json!({}), &defs), "zero-arg");
    }

    #[test]
    fn test_unknown_macro_left_literal() {
        assert_eq!(
            render_with_macros("{{ nope(a, {{ x }}) }}", json!({"x": "X"}), &[]),
            "{{ nope(a, {{ x }}) }}"
        );
    }

    #[test]
    fn test_macro_body_only_sees_params() {
        let defs = [("show(a)", "{{ a }}/{{ secret }}")];
        assert_eq!(
            render_with_macros("{{ show(v) }}", json!({"secret": "s"}), &defs),
            "v/"
        );
    }

    #[test]
    fn test_macro_args_escape_once() {
        let defs = [("wrap(a)", "<i>{{ a }}</i>")];
        assert_eq!(
            render_with_macros("{{ wrap({{ x }}) }}", json!({"x": "a&b"}), &defs),
            "<i>a&amp;b</i>"
        );
    }

    #[test]
    fn test_render_content_exposes_markdown() {
        let partials = HashMap::new();
        let macros = MacroSet::new();
        let renderer = Renderer::new(&partials, &macros);
        let mut context = ctx(json!({
            "message__render": "This is a **{{ b }}**.",
            "b": "Banana"
        }));

        let raw = renderer.render_content(&mut context, DEFAULT_CONTENT_KEY);

        assert_eq!(raw.as_deref(), Some("This is a **Banana**."));
        let html = renderer.render("<div>{{{ message }}}</div>", &context);
        assert_eq!(html, "<div><p>This is a <strong>Banana</strong>.</p>\n</div>");
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html(r#"<a href="x">&</a>"#), "&lt;a href=&quot;x&quot;&gt;&amp;&lt;/a&gt;");
    }
}
