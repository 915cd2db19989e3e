//! Per-recipient message composition.
//!
//! A [`Composer`] is built once per send request (macro definitions are
//! parsed a single time) and then turns each recipient into a
//! [`MessageRecord`]. Composition is pure: no I/O, no clock, so recipients can
//! be composed in any order or in parallel.

use std::collections::BTreeMap;

use tracing::debug;

use crate::html::html_to_text;
use crate::message::{is_message_id_char, MessageRecord, MessageStatus, Recipient, SendRequest};
use crate::render::{Context, MacroSet, Renderer, Value, CONTENT_TARGET};

/// Header added when the context carries an unsubscribe link.
pub const UNSUBSCRIBE_HEADER: &str = "List-Unsubscribe";

/// Context key holding the recipient's unsubscribe URL.
pub const UNSUBSCRIBE_LINK_KEY: &str = "unsubscribe_link";

/// A parsed sender address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub email: String,
    pub name: Option<String>,
}

/// Derive the record id for a recipient of a send group.
///
/// The id is `{uid}-{address}` with every character outside `[A-Za-z0-9-]`
/// removed, so the same group and address always map to the same record.
pub fn message_id(uid: &str, address: &str) -> String {
    format!("{}-{}", uid, address)
        .chars()
        .filter(|c| is_message_id_char(*c))
        .collect()
}

/// Build the render context for one recipient.
///
/// Recipient values override global ones key by key; the recipient's name
/// fields are injected last.
pub fn recipient_context(global: &Context, recipient: &Recipient) -> Context {
    let mut context = global.clone();
    context.extend(
        recipient
            .context
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );

    let first = recipient.first_name.as_deref().unwrap_or("");
    let last = recipient.last_name.as_deref().unwrap_or("");
    let full_name = format!("{} {}", first, last).trim().to_string();

    context.insert("first_name".to_string(), optional(&recipient.first_name));
    context.insert("last_name".to_string(), optional(&recipient.last_name));
    context.insert("full_name".to_string(), Value::String(full_name));
    context
}

fn optional(value: &Option<String>) -> Value {
    value.clone().map_or(Value::Null, Value::String)
}

/// Merge global and recipient headers, recipient winning per key.
///
/// When the context has an `unsubscribe_link` and no `List-Unsubscribe`
/// header was given explicitly (case-insensitive), one is added.
pub fn merge_headers(
    global: &BTreeMap<String, String>,
    recipient: &BTreeMap<String, String>,
    context: &Context,
) -> BTreeMap<String, String> {
    let mut headers = global.clone();
    headers.extend(recipient.iter().map(|(k, v)| (k.clone(), v.clone())));

    let explicit = headers
        .keys()
        .any(|k| k.eq_ignore_ascii_case(UNSUBSCRIBE_HEADER));

    if !explicit {
        if let Some(link) = context
            .get(UNSUBSCRIBE_LINK_KEY)
            .and_then(Value::as_str)
            .filter(|link| !link.is_empty())
        {
            headers.insert(UNSUBSCRIBE_HEADER.to_string(), format!("<{}>", link));
        }
    }

    headers
}

/// Composes the messages of one send request.
#[derive(Debug)]
pub struct Composer<'a> {
    request: &'a SendRequest,
    sender: Sender,
    macros: MacroSet,
    content_key: &'a str,
}

impl<'a> Composer<'a> {
    pub fn new(request: &'a SendRequest, sender: Sender, content_key: &'a str) -> Self {
        let macros = MacroSet::parse(&request.macros);
        if !macros.is_empty() {
            debug!(
                group_id = %request.uid,
                macro_count = macros.len(),
                "macros_parsed"
            );
        }

        Self {
            request,
            sender,
            macros,
            content_key,
        }
    }

    /// Render one recipient's message. `now_ms` becomes both `send_ts` and `update_ts`.
    pub fn compose(&self, recipient: &Recipient, now_ms: i64) -> MessageRecord {
        let request = self.request;
        let renderer = Renderer::new(&request.mustache_partials, &self.macros);

        let mut context = recipient_context(&request.context, recipient);

        let subject = renderer.render(&request.subject_template, &context);
        context.insert("subject".to_string(), Value::String(subject.clone()));

        let has_content = renderer
            .render_content(&mut context, self.content_key)
            .is_some();

        let html_body = renderer.render(&request.main_template, &context);

        // Plain text comes from the content block alone so layout chrome stays out of it
        let text_body = match context.get(CONTENT_TARGET) {
            Some(Value::Html(content)) if has_content => html_to_text(content),
            _ => html_to_text(&html_body),
        };

        let headers = merge_headers(&request.headers, &recipient.headers, &context);
        let id = message_id(&request.uid, &recipient.address);

        debug!(
            message_id = %id,
            group_id = %request.uid,
            html_length = html_body.len(),
            header_count = headers.len(),
            "message_composed"
        );

        MessageRecord {
            id,
            company: request.company_code.clone(),
            method: request.method,
            group_id: request.uid.clone(),
            to_first_name: recipient.first_name.clone(),
            to_last_name: recipient.last_name.clone(),
            to_email: recipient.address.clone(),
            from_email: self.sender.email.clone(),
            from_name: self.sender.name.clone(),
            subaccount: request.subaccount.clone(),
            tags: request
                .tags
                .iter()
                .chain(recipient.tags.iter())
                .cloned()
                .collect(),
            subject,
            html_body,
            text_body,
            headers,
            status: MessageStatus::Send,
            send_ts: now_ms,
            update_ts: now_ms,
            events: Vec::new(),
        }
    }
}
