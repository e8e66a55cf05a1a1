//! In-memory store — the client's source of truth for chats and messages.
//!
//! Writers (directory sync, peer connections, the UI input line) mutate it;
//! readers subscribe to its two event streams. Events are best-effort: a
//! full buffer drops the notification, never the data.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};

use parley_core::{chat_id, Chat, Message, User};

/// Invoked for every message stored. Each invocation runs on its own task.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Invoked with the chat id for every chat created or updated.
pub type ChatHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Capacity of the internal event channels. Chats and messages stay readable
/// through direct queries, so a dropped notification is recoverable.
const EVENT_BUFFER: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("chat not found: {0}")]
    ChatNotFound(String),

    #[error("user {user_id} not found in chat {chat_id}")]
    UserNotInChat { user_id: String, chat_id: String },

    #[error("a new chat should not include the current user")]
    WrongNewChatUsers,
}

pub struct Store {
    current_user: User,
    chats: DashMap<String, Chat>,
    message_handlers: Mutex<Vec<MessageHandler>>,
    chat_handlers: Mutex<Vec<ChatHandler>>,
    message_events: mpsc::Sender<Message>,
    chat_events: mpsc::Sender<String>,
}

impl Store {
    /// Create the store and spawn its event dispatcher. The dispatcher runs
    /// until the shutdown signal fires.
    pub fn new(current_user: User, shutdown: watch::Receiver<bool>) -> Arc<Self> {
        let (message_events, message_rx) = mpsc::channel(EVENT_BUFFER);
        let (chat_events, chat_rx) = mpsc::channel(EVENT_BUFFER);

        let store = Arc::new(Self {
            current_user,
            chats: DashMap::new(),
            message_handlers: Mutex::new(Vec::new()),
            chat_handlers: Mutex::new(Vec::new()),
            message_events,
            chat_events,
        });

        tokio::spawn(dispatch_events(store.clone(), message_rx, chat_rx, shutdown));
        store
    }

    pub fn current_user(&self) -> &User {
        &self.current_user
    }

    /// Store a new chat line.
    ///
    /// The chat must exist and the author must be one of its participants.
    /// The author's display name is resolved from the chat roster; whatever
    /// the caller put in `user_name` is overwritten. Content stays sorted by
    /// timestamp, so a late frame with an older `at` lands mid-history.
    pub fn add_chat_line(&self, mut message: Message) -> Result<(), StoreError> {
        let mut chat = self
            .chats
            .get_mut(&message.chat_id)
            .ok_or_else(|| StoreError::ChatNotFound(message.chat_id.clone()))?;

        let user_name = match chat.user(&message.user_id) {
            Some(u) => u.name.clone(),
            None => {
                return Err(StoreError::UserNotInChat {
                    user_id: message.user_id.clone(),
                    chat_id: message.chat_id.clone(),
                })
            }
        };

        message.user_name = user_name;
        chat.content.push(message.clone());
        chat.content.sort_by_key(|m| m.at);
        drop(chat);

        self.emit_message(message);
        Ok(())
    }

    /// Reconcile the chat set with the latest directory snapshot.
    ///
    /// Every listed peer gets an online chat (created if first seen, content
    /// preserved if not); every chat whose peer is absent from the list is
    /// flipped offline. The current user is skipped, never chatted with.
    pub fn refresh_users(&self, users: Vec<User>) -> Result<(), StoreError> {
        let mut missing: HashSet<String> = self.chats.iter().map(|e| e.key().clone()).collect();

        for user in users {
            if user.id == self.current_user.id {
                continue;
            }
            let chat = self.build_chat(vec![user])?;
            missing.remove(&chat.id);
            self.store_chat(chat);
        }

        for chat_id in missing {
            if let Some(mut chat) = self.chats.get_mut(&chat_id) {
                chat.offline = true;
            }
            self.emit_chat(chat_id);
        }
        Ok(())
    }

    pub fn get_chat(&self, chat_id: &str) -> Result<Chat, StoreError> {
        self.chats
            .get(chat_id)
            .map(|c| c.value().clone())
            .ok_or_else(|| StoreError::ChatNotFound(chat_id.to_string()))
    }

    pub fn get_chats(&self) -> Vec<Chat> {
        self.chats.iter().map(|e| e.value().clone()).collect()
    }

    pub fn register_message_handler(&self, handler: MessageHandler) {
        self.message_handlers.lock().unwrap().push(handler);
    }

    pub fn register_chat_handler(&self, handler: ChatHandler) {
        self.chat_handlers.lock().unwrap().push(handler);
    }

    /// A fresh online chat between the current user and the given peers.
    fn build_chat(&self, users: Vec<User>) -> Result<Chat, StoreError> {
        if users.iter().any(|u| u.id == self.current_user.id) {
            return Err(StoreError::WrongNewChatUsers);
        }

        let mut ids: Vec<&str> = users.iter().map(|u| u.id.as_str()).collect();
        ids.push(self.current_user.id.as_str());

        Ok(Chat {
            id: chat_id(ids),
            owner_user: self.current_user.clone(),
            users,
            content: Vec::new(),
            offline: false,
        })
    }

    /// Insert or replace a chat, carrying existing content over.
    fn store_chat(&self, mut chat: Chat) {
        let id = chat.id.clone();
        match self.chats.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                chat.content = std::mem::take(&mut e.get_mut().content);
                e.insert(chat);
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(chat);
            }
        }
        self.emit_chat(id);
    }

    fn emit_message(&self, message: Message) {
        if self.message_events.try_send(message).is_err() {
            tracing::warn!("chat line update dropped, event buffer full");
        }
    }

    fn emit_chat(&self, chat_id: String) {
        if self.chat_events.try_send(chat_id).is_err() {
            tracing::warn!("chat update dropped, event buffer full");
        }
    }
}

/// Drain the event channels and fan each event out to every subscriber.
async fn dispatch_events(
    store: Arc<Store>,
    mut message_rx: mpsc::Receiver<Message>,
    mut chat_rx: mpsc::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::debug!("store event dispatcher stopping");
                return;
            }
            Some(message) = message_rx.recv() => {
                let handlers = store.message_handlers.lock().unwrap().clone();
                for handler in handlers {
                    let message = message.clone();
                    tokio::spawn(async move { handler(message) });
                }
            }
            Some(chat_id) = chat_rx.recv() => {
                let handlers = store.chat_handlers.lock().unwrap().clone();
                for handler in handlers {
                    let chat_id = chat_id.clone();
                    tokio::spawn(async move { handler(chat_id) });
                }
            }
        }
    }
}
