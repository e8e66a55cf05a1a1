//! Per-peer connection — one TCP link per remote user, both directions.
//!
//! The writer drains a bounded queue and frames messages onto the socket; the
//! reader decodes frames and hands them to the receive callback. Whichever
//! side stops first brings the whole connection down, and the close callback
//! fires exactly once, from the connection's own task.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;

use parley_core::wire::{self, NetworkMsg, WireError, DIAL_TIMEOUT_SECS, SEND_QUEUE_CAPACITY};
use parley_core::{Chat, Message, User};

/// Fired once when the connection is done, with the user and chat it served.
pub type CloseCallback = Arc<dyn Fn(User, Chat) + Send + Sync>;

/// Fired for every decoded inbound message.
pub type ReceiveCallback = Arc<dyn Fn(Message) + Send + Sync>;

/// Outbound link state. A pending link has no socket yet; the writer dials
/// on the first message that needs one.
enum Link {
    Pending,
    Established(OwnedWriteHalf),
}

pub struct Connection {
    user: User,
    chat: Chat,
    write_tx: mpsc::Sender<Message>,
    closed_tx: watch::Sender<bool>,
    launch: Mutex<Option<Launch>>,
}

/// Everything `run` consumes. Taken out of the connection on the first
/// `start`; a second `start` finds nothing and does nothing.
struct Launch {
    socket: Option<TcpStream>,
    write_rx: mpsc::Receiver<Message>,
    close_callback: CloseCallback,
    receive_callback: ReceiveCallback,
}

impl Connection {
    /// A connection to `user` scoped to `chat`. Pass the socket for accepted
    /// inbound connections; leave it out for locally-initiated ones and
    /// `start` will dial.
    pub fn new(
        user: User,
        chat: Chat,
        socket: Option<TcpStream>,
        close_callback: CloseCallback,
        receive_callback: ReceiveCallback,
    ) -> Arc<Self> {
        let (write_tx, write_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (closed_tx, _) = watch::channel(false);

        Arc::new(Self {
            user,
            chat,
            write_tx,
            closed_tx,
            launch: Mutex::new(Some(Launch {
                socket,
                write_rx,
                close_callback,
                receive_callback,
            })),
        })
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// Spawn the connection's task. Idempotent.
    pub async fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let Some(launch) = self.launch.lock().await.take() else {
            return;
        };
        let conn = self.clone();
        tokio::spawn(conn.run(shutdown, launch));
    }

    /// Queue a message for the writer. Blocks while the queue is full;
    /// messages submitted after close are dropped.
    pub async fn send_message(&self, message: Message) {
        if self.write_tx.send(message).await.is_err() {
            tracing::debug!(user = %self.user.id, "connection closed, outbound message dropped");
        }
    }

    /// Ask the connection to shut down. Never blocks: cleanup happens on the
    /// connection's own task, which is where the close callback fires.
    pub fn close(&self) {
        self.closed_tx.send_replace(true);
    }

    /// Whether this connection has shut down (or been asked to).
    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>, launch: Launch) {
        let Launch {
            socket,
            write_rx,
            close_callback,
            receive_callback,
        } = launch;

        // Hands the read half to the reader, whether the link was established
        // here or later by the writer's lazy dial.
        let (read_tx, read_rx) = mpsc::channel::<OwnedReadHalf>(1);

        let link = match socket {
            Some(stream) => {
                let (rh, wh) = stream.into_split();
                let _ = read_tx.try_send(rh);
                Link::Established(wh)
            }
            None => match dial(&self.user).await {
                Ok(stream) => {
                    let (rh, wh) = stream.into_split();
                    let _ = read_tx.try_send(rh);
                    Link::Established(wh)
                }
                Err(e) => {
                    tracing::warn!(user = %self.user.id, error = %e, "failed to reach peer");
                    self.closed_tx.send_replace(true);
                    close_callback(self.user.clone(), self.chat.clone());
                    return;
                }
            },
        };

        let writer = tokio::spawn(writer_loop(
            self.clone(),
            link,
            write_rx,
            read_tx,
            shutdown.clone(),
            self.closed_tx.subscribe(),
        ));

        self.reader_loop(read_rx, receive_callback, &mut shutdown)
            .await;

        // Single exit point: stop the writer, drop the socket halves, report.
        // The abort covers a writer stalled mid-write against a dead peer.
        self.closed_tx.send_replace(true);
        writer.abort();
        let _ = writer.await;
        close_callback(self.user.clone(), self.chat.clone());
    }

    async fn reader_loop(
        &self,
        mut read_rx: mpsc::Receiver<OwnedReadHalf>,
        receive_callback: ReceiveCallback,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let mut closed_rx = self.closed_tx.subscribe();

        // the read half shows up once the link is established, from either
        // the eager dial in `run` or the writer's lazy one
        let mut half = tokio::select! {
            _ = shutdown.changed() => return,
            _ = closed_rx.changed() => return,
            half = read_rx.recv() => match half {
                Some(half) => half,
                None => return,
            },
        };

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = closed_rx.changed() => return,
                result = wire::read_message(&mut half) => match result {
                    Ok(msg) => {
                        let at = msg.at();
                        receive_callback(Message {
                            chat_id: msg.chat_id,
                            user_id: msg.user_id,
                            user_name: String::new(),
                            text: msg.message,
                            at,
                            error_message: false,
                        });
                    }
                    Err(e) => {
                        if !matches!(e, WireError::UnexpectedEof) {
                            tracing::debug!(user = %self.user.id, error = %e, "failed to read network message");
                        }
                        return;
                    }
                },
            }
        }
    }
}

async fn writer_loop(
    conn: Arc<Connection>,
    mut link: Link,
    mut write_rx: mpsc::Receiver<Message>,
    read_tx: mpsc::Sender<OwnedReadHalf>,
    mut shutdown: watch::Receiver<bool>,
    mut closed_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = closed_rx.changed() => return,
            message = write_rx.recv() => match message {
                Some(message) => write_one(&conn, &mut link, &read_tx, message).await,
                None => return,
            },
        }
    }
}

async fn write_one(
    conn: &Connection,
    link: &mut Link,
    read_tx: &mpsc::Sender<OwnedReadHalf>,
    message: Message,
) {
    if let Link::Pending = link {
        match dial(&conn.user).await {
            Ok(stream) => {
                let (rh, wh) = stream.into_split();
                let _ = read_tx.try_send(rh);
                *link = Link::Established(wh);
            }
            Err(e) => {
                tracing::warn!(
                    user = %conn.user.id,
                    chat = %conn.chat.id,
                    error = %e,
                    "dial failed, message discarded"
                );
                return;
            }
        }
    }

    let Link::Established(stream) = link else {
        return;
    };

    let msg = NetworkMsg::new(message.user_id, message.chat_id, message.text, message.at);
    match wire::write_message(stream, &msg).await {
        Ok(()) => {}
        Err(WireError::PayloadTooLarge(size)) => {
            tracing::warn!(size, "outbound message too large, dropped");
        }
        Err(e) => {
            // The reader notices a dead socket; a failed write is only logged.
            tracing::warn!(user = %conn.user.id, error = %e, "failed to write message to socket");
        }
    }
}

async fn dial(user: &User) -> std::io::Result<TcpStream> {
    let addr = format!("{}:{}", user.address, user.port);
    match timeout(
        Duration::from_secs(DIAL_TIMEOUT_SECS),
        TcpStream::connect(&addr),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("connect to {addr} timed out"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parley_core::chat_id;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    fn peer(id: &str, port: u16) -> User {
        User {
            id: id.into(),
            name: id.to_uppercase(),
            address: "127.0.0.1".into(),
            port,
        }
    }

    fn chat_with(owner: &User, remote: &User) -> Chat {
        Chat {
            id: chat_id([owner.id.as_str(), remote.id.as_str()]),
            owner_user: owner.clone(),
            users: vec![remote.clone()],
            content: Vec::new(),
            offline: false,
        }
    }

    struct Callbacks {
        closes: Arc<AtomicUsize>,
        received: mpsc::UnboundedReceiver<Message>,
        close_callback: CloseCallback,
        receive_callback: ReceiveCallback,
    }

    fn callbacks() -> Callbacks {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        let (tx, received) = mpsc::unbounded_channel();
        Callbacks {
            closes,
            received,
            close_callback: Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            receive_callback: Arc::new(move |m| {
                let _ = tx.send(m);
            }),
        }
    }

    #[tokio::test]
    async fn dialed_connection_sends_frames_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let remote = peer("bbb", port);
        let owner = peer("aaa", 1000);
        let chat = chat_with(&owner, &remote);
        let cb = callbacks();

        let (_guard, shutdown) = watch::channel(false);
        let conn = Connection::new(
            remote,
            chat.clone(),
            None,
            cb.close_callback,
            cb.receive_callback,
        );
        conn.start(shutdown).await;

        for i in 0..3 {
            conn.send_message(Message::new(
                chat.id.clone(),
                "aaa".into(),
                format!("msg-{i}"),
                Utc::now(),
            ))
            .await;
        }

        let (mut accepted, _) = listener.accept().await.unwrap();
        for i in 0..3 {
            let msg = wire::read_message(&mut accepted).await.unwrap();
            assert_eq!(msg.message, format!("msg-{i}"));
            assert_eq!(msg.user_id, "aaa");
            assert_eq!(msg.chat_id, chat.id);
        }
    }

    #[tokio::test]
    async fn inbound_frames_reach_the_receive_callback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let local = TcpStream::connect(addr);
        let (accepted, local) = tokio::join!(listener.accept(), local);
        let (accepted, _) = accepted.unwrap();
        let mut local = local.unwrap();

        let remote = peer("bbb", addr.port());
        let chat = chat_with(&peer("aaa", 1000), &remote);
        let mut cb = callbacks();

        let (_guard, shutdown) = watch::channel(false);
        let conn = Connection::new(
            remote,
            chat.clone(),
            Some(accepted),
            cb.close_callback,
            cb.receive_callback,
        );
        conn.start(shutdown).await;

        let sent = NetworkMsg::new("bbb".into(), chat.id.clone(), "over the wire".into(), Utc::now());
        wire::write_message(&mut local, &sent).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), cb.received.recv())
            .await
            .expect("message should arrive")
            .unwrap();
        assert_eq!(got.text, "over the wire");
        assert_eq!(got.user_id, "bbb");
        assert_eq!(got.at, sent.at());
    }

    #[tokio::test]
    async fn peer_eof_fires_the_close_callback_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let local = TcpStream::connect(addr);
        let (accepted, local) = tokio::join!(listener.accept(), local);
        let (accepted, _) = accepted.unwrap();

        let remote = peer("bbb", addr.port());
        let chat = chat_with(&peer("aaa", 1000), &remote);
        let cb = callbacks();
        let closes = cb.closes.clone();

        let (_guard, shutdown) = watch::channel(false);
        let conn = Connection::new(
            remote,
            chat,
            Some(accepted),
            cb.close_callback,
            cb.receive_callback,
        );
        conn.start(shutdown).await;

        // peer hangs up, and we also close explicitly to race the paths
        drop(local.unwrap());
        conn.close();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_dial_closes_the_connection() {
        // bind-then-drop gives a port nothing is listening on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let remote = peer("bbb", port);
        let chat = chat_with(&peer("aaa", 1000), &remote);
        let cb = callbacks();
        let closes = cb.closes.clone();

        let (_guard, shutdown) = watch::channel(false);
        let conn = Connection::new(remote, chat, None, cb.close_callback, cb.receive_callback);
        conn.start(shutdown).await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_signal_closes_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let local = TcpStream::connect(addr);
        let (accepted, local) = tokio::join!(listener.accept(), local);
        let (accepted, _) = accepted.unwrap();
        let _local = local.unwrap();

        let remote = peer("bbb", addr.port());
        let chat = chat_with(&peer("aaa", 1000), &remote);
        let cb = callbacks();
        let closes = cb.closes.clone();

        let (shutdown_tx, shutdown) = watch::channel(false);
        let conn = Connection::new(
            remote,
            chat,
            Some(accepted),
            cb.close_callback,
            cb.receive_callback,
        );
        conn.start(shutdown).await;

        shutdown_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_after_close_is_dropped_quietly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let local = TcpStream::connect(addr);
        let (accepted, local) = tokio::join!(listener.accept(), local);
        let (accepted, _) = accepted.unwrap();
        let _local = local.unwrap();

        let remote = peer("bbb", addr.port());
        let chat = chat_with(&peer("aaa", 1000), &remote);
        let cb = callbacks();

        let (_guard, shutdown) = watch::channel(false);
        let conn = Connection::new(
            remote,
            chat.clone(),
            Some(accepted),
            cb.close_callback,
            cb.receive_callback,
        );
        conn.start(shutdown).await;

        conn.close();
        tokio::time::sleep(Duration::from_millis(200)).await;

        conn.send_message(Message::new(chat.id, "aaa".into(), "late".into(), Utc::now()))
            .await;
    }
}
