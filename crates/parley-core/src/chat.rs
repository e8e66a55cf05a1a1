//! Chats — one per remote peer, identified independently of who opened it.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::message::Message;
use crate::user::User;

/// A conversation between the local user and a set of remote participants.
///
/// `users` never contains the owner. `offline` means the remote side was
/// absent from the latest directory snapshot; the chat itself is never
/// deleted and keeps accepting lines.
#[derive(Debug, Clone)]
pub struct Chat {
    pub id: String,
    pub owner_user: User,
    pub users: Vec<User>,
    pub content: Vec<Message>,
    pub offline: bool,
}

impl Chat {
    /// Look up a participant by id, owner included.
    pub fn user(&self, id: &str) -> Option<&User> {
        self.users
            .iter()
            .find(|u| u.id == id)
            .or((self.owner_user.id == id).then_some(&self.owner_user))
    }

    /// The remote participants.
    pub fn other_users(&self) -> &[User] {
        &self.users
    }
}

/// Deterministic chat id over a participant id set: sort lexicographically,
/// join with `_`, base64. Both ends of a chat compute the same id no matter
/// who connected first.
pub fn chat_id<'a, I>(participant_ids: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut ids: Vec<&str> = participant_ids.into_iter().collect();
    ids.sort_unstable();
    STANDARD.encode(ids.join("_"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user(id: &str, port: u16) -> User {
        User {
            id: id.into(),
            name: id.to_uppercase(),
            address: "10.0.0.1".into(),
            port,
        }
    }

    #[test]
    fn chat_id_is_order_independent() {
        assert_eq!(chat_id(["aaa", "bbb"]), chat_id(["bbb", "aaa"]));
    }

    #[test]
    fn chat_id_matches_known_value() {
        // base64("aaa_bbb")
        assert_eq!(chat_id(["bbb", "aaa"]), "YWFhX2JiYg==");
    }

    #[test]
    fn user_lookup_covers_owner_and_participants() {
        let chat = Chat {
            id: chat_id(["aaa", "bbb"]),
            owner_user: user("aaa", 1000),
            users: vec![user("bbb", 1001)],
            content: vec![Message::new(
                "c".into(),
                "aaa".into(),
                "hi".into(),
                Utc::now(),
            )],
            offline: false,
        };

        assert_eq!(chat.user("bbb").unwrap().port, 1001);
        assert_eq!(chat.user("aaa").unwrap().port, 1000);
        assert!(chat.user("ccc").is_none());
    }
}
