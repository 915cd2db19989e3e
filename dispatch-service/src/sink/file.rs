//! File sink for `*-test` methods: one text file per message.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;
use tracing::info;

use super::{DeliveryError, Sink};
use crate::message::MessageRecord;

#[derive(Debug, Clone)]
pub struct TestSink {
    output_dir: PathBuf,
}

impl TestSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Path the message with `id` is written to.
    pub fn path_for(&self, id: &str) -> PathBuf {
        self.output_dir.join(format!("{}.txt", id))
    }
}

/// Render the file body for a message.
fn render_output(message: &MessageRecord) -> Result<String, serde_json::Error> {
    let to_name = [message.to_first_name.as_deref(), message.to_last_name.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");

    let data = json!({
        "from_email": message.from_email,
        "from_name": message.from_name,
        "group_id": message.group_id,
        "to_email": message.to_email,
        "to_name": to_name,
        "tags": message.tags,
        "headers": message.headers,
    });

    let ts = Utc
        .timestamp_millis_opt(message.send_ts)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| message.send_ts.to_string());

    Ok(format!(
        "to: {}\nmsg id: {}\nts: {}\nsubject: {}\ndata: {}\ncontent: {}\n",
        message.to_email,
        message.id,
        ts,
        message.subject,
        serde_json::to_string_pretty(&data)?,
        message.html_body,
    ))
}

#[async_trait]
impl Sink for TestSink {
    async fn deliver(&self, message: &MessageRecord) -> Result<(), DeliveryError> {
        let output = render_output(message)?;
        let path = self.path_for(&message.id);

        tokio::fs::create_dir_all(&self.output_dir).await?;
        tokio::fs::write(&path, output).await?;

        info!(
            message_id = %message.id,
            to_email = %message.to_email,
            path = %path.display(),
            "test_message_written"
        );
        Ok(())
    }
}
