//! Client transport: a pair of bounded channels over one TCP connection plus
//! a ping-based liveness policy.

use std::io;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::warn;

use super::wire;
use super::Message;

const CHAN_BUFFER_SIZE: usize = 100;
const PING_INTERVAL: Duration = Duration::from_secs(5);
const RECONNECT_THRESHOLD: u32 = 5;

/// A connected multiworld client.
///
/// Every received message except `Ping` is delivered through [`Client::recv`];
/// pings are consumed for liveness. Once five consecutive pings go unanswered
/// the inbox closes and `recv` returns `None`. Dropping the client sends a
/// final `Disconnect` and closes the connection.
pub struct Client {
    outbox: mpsc::Sender<Message>,
    inbox: mpsc::Receiver<Message>,
}

impl Client {
    pub async fn dial(server_addr: &str) -> io::Result<Client> {
        let stream = TcpStream::connect(server_addr).await?;
        let (read_half, write_half) = stream.into_split();

        let (raw_tx, raw_rx) = mpsc::channel(CHAN_BUFFER_SIZE);
        let (inbox_tx, inbox_rx) = mpsc::channel(CHAN_BUFFER_SIZE);
        let (outbox_tx, outbox_rx) = mpsc::channel(CHAN_BUFFER_SIZE);

        tokio::spawn(recv_messages(read_half, raw_tx));
        tokio::spawn(send_messages(write_half, outbox_rx));
        tokio::spawn(ping(raw_rx, inbox_tx, outbox_tx.downgrade()));

        Ok(Client {
            outbox: outbox_tx,
            inbox: inbox_rx,
        })
    }

    /// Queues a message for sending. Blocks once the outbox buffer is full.
    pub async fn send(&self, msg: Message) {
        let _ = self.outbox.send(msg).await;
    }

    /// Receives the next non-ping message; `None` once the connection is
    /// lost or the liveness threshold is exceeded.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbox.recv().await
    }
}

// Terminates when the outbox is closed (the client was dropped).
async fn send_messages(mut conn: OwnedWriteHalf, mut outbox: mpsc::Receiver<Message>) {
    while let Some(msg) = outbox.recv().await {
        if let Err(err) = wire::write_message(&mut conn, &msg).await {
            warn!("error sending MW message: {err}");
        }
    }
    let _ = wire::write_message(&mut conn, &Message::Disconnect).await;
    let _ = conn.shutdown().await;
}

// Terminates when the network connection is closed from either side.
async fn recv_messages(mut conn: OwnedReadHalf, raw_inbox: mpsc::Sender<Message>) {
    loop {
        match wire::read_message(&mut conn).await {
            Ok(msg) => {
                if raw_inbox.send(msg).await.is_err() {
                    return;
                }
            }
            Err(err) if err.is_fatal() => {
                warn!("MW connection closed: {err}");
                return;
            }
            Err(err) => warn!("error reading MW message: {err}"),
        }
    }
}

// Terminates when either too many pings go unanswered, or the connection is
// closed.
async fn ping(
    mut raw_inbox: mpsc::Receiver<Message>,
    inbox: mpsc::Sender<Message>,
    outbox: mpsc::WeakSender<Message>,
) {
    let start = tokio::time::Instant::now() + PING_INTERVAL;
    let mut ticker = tokio::time::interval_at(start, PING_INTERVAL);
    let mut unanswered_pings = 0u32;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                unanswered_pings += 1;
                if unanswered_pings == RECONNECT_THRESHOLD {
                    return;
                }
                let Some(outbox) = outbox.upgrade() else {
                    return;
                };
                let _ = outbox.send(Message::Ping).await;
            }
            msg = raw_inbox.recv() => {
                match msg {
                    None => return,
                    Some(Message::Ping) => unanswered_pings = 0,
                    Some(msg) => {
                        if inbox.send(msg).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}
