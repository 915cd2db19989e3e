//! Message domain types.

pub mod types;

pub use types::{
    is_message_id_char, is_valid_message_id, MessageEvent, MessageKey, MessageRecord, MessageStatus, Recipient, SendMethod, SendRequest,
    DEFAULT_MAIN_TEMPLATE, UID_MAX_LEN, UID_MIN_LEN,
};
