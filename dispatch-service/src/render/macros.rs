//! Request-scoped macro definitions.
//!
//! A definition maps a signature to a body template. The signature is either a
//! bare name (`bar`) or a parenthesised parameter list (`spam(apple, pear)`,
//! `foo()`). Parameters must be unique identifiers.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use super::token::is_identifier;

/// How a macro was declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroForm {
    /// `name`: callable only as `{{ name }}`.
    Bare,
    /// `name(...)`: callable as `{{ name(...) }}`, or as `{{ name }}` when it has no parameters.
    Call,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MacroDef {
    pub form: MacroForm,
    pub params: Vec<String>,
    pub body: String,
}

impl MacroDef {
    /// Whether `{{ name(args) }}` with `arg_count` arguments expands this macro.
    pub fn accepts_call(&self, arg_count: usize) -> bool {
        self.form == MacroForm::Call && self.params.len() == arg_count
    }

    /// Whether the parenthesis-less `{{ name }}` form expands this macro.
    pub fn accepts_bare(&self) -> bool {
        self.params.is_empty()
    }
}

/// Parsed macro definitions for one send request.
#[derive(Debug, Clone, Default)]
pub struct MacroSet {
    defs: HashMap<String, MacroDef>,
}

impl MacroSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a signature to body mapping. Invalid signatures are skipped with
    /// a warning. A name declared by more than one signature (`foo` and
    /// `foo()`) is dropped entirely, whatever order the mapping yields them in.
    pub fn parse<'a, I>(definitions: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut set = Self::new();
        let mut duplicated = HashSet::new();

        for (signature, body) in definitions {
            let Some((name, def)) = parse_signature(signature, body) else {
                warn!(signature = %signature, "macro_signature_invalid");
                continue;
            };

            if set.defs.contains_key(&name) || duplicated.contains(&name) {
                warn!(signature = %signature, name = %name, "macro_name_duplicate");
                set.defs.remove(&name);
                duplicated.insert(name);
                continue;
            }
            set.defs.insert(name, def);
        }

        set
    }

    pub fn get(&self, name: &str) -> Option<&MacroDef> {
        self.defs.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }
}

fn parse_signature(signature: &str, body: &str) -> Option<(String, MacroDef)> {
    let signature = signature.trim();

    let Some(open) = signature.find('(') else {
        return is_identifier(signature).then(|| {
            (
                signature.to_string(),
                MacroDef {
                    form: MacroForm::Bare,
                    params: Vec::new(),
                    body: body.to_string(),
                },
            )
        });
    };

    let inner = signature[open + 1..].strip_suffix(')')?;
    let name = signature[..open].trim();
    if !is_identifier(name) {
        return None;
    }

    let mut params: Vec<String> = Vec::new();
    if !inner.trim().is_empty() {
        for param in inner.split(',').map(str::trim) {
            if !is_identifier(param) || params.iter().any(|p| p == param) {
                return None;
            }
            params.push(param.to_string());
        }
    }

    Some((
        name.to_string(),
        MacroDef {
            form: MacroForm::Call,
            params,
            body: body.to_string(),
        },
    ))
}
