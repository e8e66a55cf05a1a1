//! parley-core — shared domain types, the peer wire codec, and configuration.
//! Both the directory and the client depend on this crate.

pub mod chat;
pub mod config;
pub mod message;
pub mod user;
pub mod wire;

pub use chat::{chat_id, Chat};
pub use message::Message;
pub use user::User;
