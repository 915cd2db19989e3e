//! Configuration module for environment variable parsing.
//!
//! Every setting has a default so the service starts with no environment at
//! all: in-memory store, test sink only, signed webhooks refused.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

use crate::render::DEFAULT_CONTENT_KEY;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port for the web server to listen on
    pub port: u16,

    /// Expected `Authorization` header value for the send and readback endpoints
    pub auth_key: String,

    /// Public host name, used to build the default signed webhook URL
    pub host_name: String,

    /// Callback URL registered with the signed provider
    pub signed_webhook_url: String,

    /// Shared secret for signed webhooks; signed webhooks are refused when unset
    pub webhook_auth_key: Option<String>,

    /// Key user session tokens are signed with; the user views refuse every
    /// request when unset
    pub user_auth_key: Option<String>,

    /// Directory the test sink writes messages to
    pub test_output: PathBuf,

    // =========================================================================
    // Message store
    // =========================================================================
    /// Search engine URL; records are kept in memory when unset
    pub elastic_url: Option<String>,

    pub elastic_username: Option<String>,

    pub elastic_password: Option<String>,

    /// Extra attempts for an optimistic record update that hits a version conflict
    pub store_update_retries: u32,

    // =========================================================================
    // Sending
    // =========================================================================
    /// Seconds a send group uid blocks a repeat send
    pub send_group_ttl_secs: u64,

    /// Maximum accepted request body size in bytes
    pub max_body_bytes: usize,

    /// Context key holding the content block
    pub content_key: String,

    /// Mandrill API root
    pub mandrill_url: String,

    /// Mandrill API key; `email-mandrill` sends are refused when unset
    pub mandrill_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let host_name = "localhost".to_string();
        Config {
            port: 8000,
            auth_key: "testing".to_string(),
            signed_webhook_url: default_webhook_url(&host_name),
            host_name,
            webhook_auth_key: None,
            user_auth_key: None,
            test_output: PathBuf::from("/tmp/dispatch/tests"),
            elastic_url: None,
            elastic_username: None,
            elastic_password: None,
            store_update_retries: 5,
            send_group_ttl_secs: 86_400,
            max_body_bytes: 5 * 1024 * 1024,
            content_key: DEFAULT_CONTENT_KEY.to_string(),
            mandrill_url: "https://mandrillapp.com/api/1.0/".to_string(),
            mandrill_key: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        let host_name = env::var("HOST_NAME").unwrap_or(defaults.host_name);

        Config {
            port: parse_or("PORT", defaults.port),

            auth_key: env::var("AUTH_KEY").unwrap_or(defaults.auth_key),

            signed_webhook_url: env::var("SIGNED_WEBHOOK_URL")
                .unwrap_or_else(|_| default_webhook_url(&host_name)),

            host_name,

            webhook_auth_key: non_empty("WEBHOOK_AUTH_KEY"),

            user_auth_key: non_empty("USER_AUTH_KEY"),

            test_output: env::var("TEST_OUTPUT")
                .map(PathBuf::from)
                .unwrap_or(defaults.test_output),

            elastic_url: non_empty("ELASTIC_URL"),

            elastic_username: non_empty("ELASTIC_USERNAME"),

            elastic_password: non_empty("ELASTIC_PASSWORD"),

            store_update_retries: parse_or("STORE_UPDATE_RETRIES", defaults.store_update_retries),

            send_group_ttl_secs: parse_or("SEND_GROUP_TTL_SECS", defaults.send_group_ttl_secs),

            max_body_bytes: parse_or("MAX_BODY_BYTES", defaults.max_body_bytes),

            content_key: non_empty("CONTENT_KEY").unwrap_or(defaults.content_key),

            mandrill_url: env::var("MANDRILL_URL").unwrap_or(defaults.mandrill_url),

            mandrill_key: non_empty("MANDRILL_KEY"),
        }
    }
}

fn default_webhook_url(host_name: &str) -> String {
    format!("https://{}/webhook/mandrill/", host_name)
}

/// Parse a variable, falling back to `default` when unset or invalid.
fn parse_or<T: FromStr + Copy>(name: &str, default: T) -> T {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            warn!(env_var = name, value = %raw, "Invalid value, using default");
            default
        }
    }
}

/// Read a variable, treating blank values as unset.
fn non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_or_valid() {
        env::set_var("DISPATCH_TEST_PORT", "9100");
        assert_eq!(parse_or("DISPATCH_TEST_PORT", 1u16), 9100);
        env::remove_var("DISPATCH_TEST_PORT");
    }

    #[test]
    fn test_parse_or_invalid_uses_default() {
        env::set_var("DISPATCH_TEST_RETRIES", "lots");
        assert_eq!(parse_or("DISPATCH_TEST_RETRIES", 5u32), 5);
        env::remove_var("DISPATCH_TEST_RETRIES");
    }

    #[test]
    fn test_parse_or_missing() {
        assert_eq!(parse_or("DISPATCH_TEST_NONEXISTENT", 10u64), 10);
    }

    #[test]
    fn test_non_empty() {
        env::set_var("DISPATCH_TEST_BLANK", "   ");
        assert_eq!(non_empty("DISPATCH_TEST_BLANK"), None);
        env::set_var("DISPATCH_TEST_BLANK", " key ");
        assert_eq!(non_empty("DISPATCH_TEST_BLANK"), Some("key".to_string()));
        env::remove_var("DISPATCH_TEST_BLANK");
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 8000);
        assert_eq!(config.auth_key, "testing");
        assert_eq!(config.signed_webhook_url, "https://localhost/webhook/mandrill/");
        assert_eq!(config.content_key, "message__render");
        assert!(config.webhook_auth_key.is_none());
        assert!(config.user_auth_key.is_none());
    }
}
