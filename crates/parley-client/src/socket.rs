//! Socket manager — owns the listen socket and the per-peer connection table.
//!
//! Inbound: accepted sockets must present a hello frame within the deadline;
//! its chat and user ids are looked up in the store and the socket becomes
//! that peer's connection. Outbound: a store subscription picks up messages
//! authored locally and fans them out, creating connections as needed.
//!
//! The table holds at most one connection per remote user, across all chats.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use parley_core::user::MIN_CLIENT_PORT;
use parley_core::wire::{self, HELLO_TIMEOUT_SECS};
use parley_core::{Chat, Message, User};

use crate::conn::{CloseCallback, Connection, ReceiveCallback};
use crate::store::Store;

/// Bind the first free port from [`MIN_CLIENT_PORT`] upward and keep the
/// listener. Fails only when every candidate port is taken.
pub async fn bind_listen_port() -> Result<TcpListener> {
    for port in MIN_CLIENT_PORT..u16::MAX {
        if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
            tracing::debug!(port, "listen port bound");
            return Ok(listener);
        }
    }
    anyhow::bail!("no listen port available")
}

/// First non-loopback IPv4 address among the host's interfaces.
pub fn local_ipv4() -> Result<String> {
    let interfaces =
        local_ip_address::list_afinet_netifas().context("failed to list network interfaces")?;

    for (_name, ip) in interfaces {
        if let IpAddr::V4(v4) = ip {
            if !v4.is_loopback() {
                return Ok(v4.to_string());
            }
        }
    }
    anyhow::bail!("could not figure out the IP of your machine")
}

pub struct SocketManager {
    listener: Mutex<Option<TcpListener>>,
    port: u16,
    store: Arc<Store>,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
}

impl SocketManager {
    pub fn new(listener: TcpListener, store: Arc<Store>) -> Result<Arc<Self>> {
        let port = listener.local_addr().context("listener address")?.port();
        Ok(Arc::new(Self {
            listener: Mutex::new(Some(listener)),
            port,
            store,
            connections: Mutex::new(HashMap::new()),
        }))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Subscribe to the store for outbound fan-out and spawn the accept loop.
    /// Returns the accept loop's handle so the caller can wait for it.
    pub async fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mgr = self.clone();
        let fanout_shutdown = shutdown.clone();
        let current_id = self.store.current_user().id.clone();
        self.store
            .register_message_handler(Arc::new(move |message: Message| {
                if message.user_id != current_id {
                    return;
                }
                let mgr = mgr.clone();
                let shutdown = fanout_shutdown.clone();
                tokio::spawn(async move { mgr.handle_outgoing(message, shutdown).await });
            }));

        let mgr = self.clone();
        let mut shutdown = shutdown;
        tokio::spawn(async move {
            let listener = mgr.listener.lock().await.take();
            let Some(listener) = listener else {
                tracing::error!("socket manager already started");
                return;
            };

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        tracing::debug!("accept loop stopping");
                        return;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer_addr)) => {
                            let mgr = mgr.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                mgr.handle_incoming(stream, peer_addr, shutdown).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to accept connection");
                        }
                    },
                }
            }
        })
    }

    /// Acknowledge an accepted socket: read its hello, route it, and promote
    /// the socket to the peer's connection. A socket that cannot be routed is
    /// dropped, which closes it.
    async fn handle_incoming(
        self: Arc<Self>,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) {
        let hello = match timeout(
            Duration::from_secs(HELLO_TIMEOUT_SECS),
            wire::read_message(&mut stream),
        )
        .await
        {
            Ok(Ok(msg)) => msg,
            Ok(Err(e)) => {
                tracing::warn!(peer = %peer_addr, error = %e, "failed to acknowledge the connection");
                return;
            }
            Err(_) => {
                tracing::warn!(peer = %peer_addr, "hello not received in time");
                return;
            }
        };

        let chat = match self.store.get_chat(&hello.chat_id) {
            Ok(chat) => chat,
            Err(e) => {
                tracing::warn!(peer = %peer_addr, error = %e, "hello references an unknown chat");
                return;
            }
        };
        let Some(user) = chat.user(&hello.user_id).cloned() else {
            tracing::warn!(
                peer = %peer_addr,
                chat = %hello.chat_id,
                user = %hello.user_id,
                "hello references a user outside the chat"
            );
            return;
        };

        let conn = Connection::new(
            user.clone(),
            chat.clone(),
            Some(stream),
            self.close_callback(),
            self.receive_callback(),
        );
        self.store_conn(&user.id, conn.clone()).await;
        conn.start(shutdown).await;

        // the hello doubles as the first chat line
        let at = hello.at();
        let line = Message::new(hello.chat_id, hello.user_id, hello.message, at);
        if let Err(e) = self.store.add_chat_line(line) {
            tracing::warn!(user = %user.id, error = %e, "failed to store the hello message");
        }
    }

    /// Forward a locally-authored message to every remote participant of its
    /// chat, creating pending connections where none exist.
    async fn handle_outgoing(
        self: Arc<Self>,
        message: Message,
        shutdown: watch::Receiver<bool>,
    ) {
        let chat = match self.store.get_chat(&message.chat_id) {
            Ok(chat) => chat,
            Err(e) => {
                tracing::warn!(error = %e, text = %message.text, "failed to send message");
                return;
            }
        };

        let conns = self.conns_for(&chat, shutdown).await;
        for conn in conns {
            conn.send_message(message.clone()).await;
        }
    }

    /// Existing or freshly-started connections for every remote user of the
    /// chat. New ones go into the table before anything is sent.
    async fn conns_for(
        self: &Arc<Self>,
        chat: &Chat,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<Arc<Connection>> {
        let mut result = Vec::with_capacity(chat.other_users().len());
        let mut table = self.connections.lock().await;
        for user in chat.other_users() {
            let conn = match table.get(&user.id) {
                Some(existing) => existing.clone(),
                None => {
                    let conn = Connection::new(
                        user.clone(),
                        chat.clone(),
                        None,
                        self.close_callback(),
                        self.receive_callback(),
                    );
                    table.insert(user.id.clone(), conn.clone());
                    conn.start(shutdown.clone()).await;
                    conn
                }
            };
            result.push(conn);
        }
        result
    }

    /// Insert a connection, closing whatever it displaces first.
    async fn store_conn(&self, user_id: &str, conn: Arc<Connection>) {
        let mut table = self.connections.lock().await;
        if let Some(displaced) = table.remove(user_id) {
            displaced.close();
        }
        table.insert(user_id.to_string(), conn);
    }

    /// Drop a closed peer's table entry and record the disconnect in its
    /// chat. The entry is left alone when a replacement connection has
    /// already taken the slot.
    async fn remove_conn(&self, user: User, chat: Chat) {
        {
            let mut table = self.connections.lock().await;
            if table.get(&user.id).is_some_and(|c| c.is_closed()) {
                table.remove(&user.id);
            }
        }

        let line = Message {
            chat_id: chat.id.clone(),
            user_id: user.id.clone(),
            user_name: user.name,
            text: "Disconnected".into(),
            at: Utc::now(),
            error_message: true,
        };
        if let Err(e) = self.store.add_chat_line(line) {
            tracing::warn!(user = %user.id, chat = %chat.id, error = %e, "failed to record the disconnect");
        }
    }

    fn close_callback(self: &Arc<Self>) -> CloseCallback {
        let mgr = self.clone();
        Arc::new(move |user, chat| {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.remove_conn(user, chat).await });
        })
    }

    fn receive_callback(self: &Arc<Self>) -> ReceiveCallback {
        let store = self.store.clone();
        Arc::new(move |message| {
            if let Err(e) = store.add_chat_line(message) {
                tracing::warn!(error = %e, "error adding chat line to store");
            }
        })
    }
}
