//! Chat line as held by the store and rendered by the UI.

use chrono::{DateTime, Utc};

/// One line of a chat.
///
/// `user_name` is resolved from the chat roster when the line is stored;
/// the value a sender puts on the wire is ignored. `error_message` marks
/// system-generated lines such as the disconnect notice.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub chat_id: String,
    pub user_id: String,
    pub user_name: String,
    pub text: String,
    pub at: DateTime<Utc>,
    pub error_message: bool,
}

impl Message {
    /// A user-authored line. The name is filled in by the store.
    pub fn new(chat_id: String, user_id: String, text: String, at: DateTime<Utc>) -> Self {
        Self {
            chat_id,
            user_id,
            user_name: String::new(),
            text,
            at,
            error_message: false,
        }
    }
}
