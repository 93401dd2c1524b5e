//! The AP-facing WebSocket surface.
//!
//! Accepts at most one client at a time; later attempts are closed right
//! away. Each physical frame is a JSON array of `cmd`-discriminated message
//! objects. `RoomInfo` is pushed to every freshly-connected client with its
//! `time` field stamped at send time.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{info, warn};

use mwbridge_core::approto::{ClientMessage, RoomInfo, ServerMessage};

#[derive(Debug)]
pub enum ApEvent {
    Message(ClientMessage),
    Disconnected,
}

/// Handle to the AP server; the session multiplexes `recv` with its
/// multiworld inbox and pushes replies through `send`. Dropping the handle
/// stops the accept loop and releases the port, so a resumed session can
/// bind it again.
pub struct ApServer {
    inbox: mpsc::Receiver<ApEvent>,
    outbox: mpsc::Sender<ServerMessage>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl ApServer {
    pub async fn bind(port: u16, room_info: RoomInfo) -> io::Result<ApServer> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        info!("serving AP on port {port}");
        Ok(ApServer::from_listener(listener, room_info))
    }

    pub fn from_listener(listener: TcpListener, room_info: RoomInfo) -> ApServer {
        let (inbox_tx, inbox_rx) = mpsc::channel(1);
        let (outbox_tx, outbox_rx) = mpsc::channel(1);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            inbox_tx,
            Arc::new(Mutex::new(outbox_rx)),
            room_info,
        ));
        ApServer {
            inbox: inbox_rx,
            outbox: outbox_tx,
            accept_task,
        }
    }

    pub async fn recv(&mut self) -> Option<ApEvent> {
        self.inbox.recv().await
    }

    pub async fn send(&self, msg: ServerMessage) {
        let _ = self.outbox.send(msg).await;
    }
}

impl Drop for ApServer {
    fn drop(&mut self) {
        // An already-connected client task shuts down on its own when the
        // outbox closes.
        self.accept_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbox: mpsc::Sender<ApEvent>,
    outbox: Arc<Mutex<mpsc::Receiver<ServerMessage>>>,
    room_info: RoomInfo,
) {
    let active = Arc::new(AtomicBool::new(false));
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("accept AP client: {err}");
                continue;
            }
        };
        tokio::spawn(handle_client(
            stream,
            active.clone(),
            inbox.clone(),
            outbox.clone(),
            room_info.clone(),
        ));
    }
}

async fn handle_client(
    stream: TcpStream,
    active: Arc<AtomicBool>,
    inbox: mpsc::Sender<ApEvent>,
    outbox: Arc<Mutex<mpsc::Receiver<ServerMessage>>>,
    room_info: RoomInfo,
) {
    let mut ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(err) => {
            warn!("AP websocket handshake failed: {err}");
            return;
        }
    };
    if active
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        warn!("AP client rejected; only one allowed at a time");
        let _ = ws.close(None).await;
        return;
    }
    info!("AP client connected");

    let greeting = ServerMessage::RoomInfo(RoomInfo {
        time: epoch_millis(),
        ..room_info
    });
    if write_frame(&mut ws, &greeting).await.is_err() {
        active.store(false, Ordering::SeqCst);
        let _ = inbox.send(ApEvent::Disconnected).await;
        return;
    }

    let mut outbox = outbox.lock().await;
    loop {
        tokio::select! {
            incoming = ws.next() => {
                match incoming {
                    None | Some(Ok(WsMessage::Close(_))) => {
                        info!("AP client disconnected");
                        break;
                    }
                    Some(Ok(WsMessage::Text(text))) => {
                        if forward_packet(&text, &inbox).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("error reading AP packet: {err}");
                        break;
                    }
                }
            }
            out = outbox.recv() => {
                let Some(msg) = out else { break };
                if let Err(err) = write_frame(&mut ws, &msg).await {
                    warn!("error writing AP message: {err}");
                }
            }
        }
    }

    drop(outbox);
    active.store(false, Ordering::SeqCst);
    let _ = inbox.send(ApEvent::Disconnected).await;
}

async fn write_frame(
    ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
    msg: &ServerMessage,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let frame = serde_json::to_string(&[msg]).unwrap_or_default();
    ws.send(WsMessage::Text(frame.into())).await
}

// Each frame is an array of commands; bad elements are skipped so one
// malformed command does not poison the rest of the packet.
async fn forward_packet(text: &str, inbox: &mpsc::Sender<ApEvent>) -> Result<(), ()> {
    let packet: Vec<serde_json::Value> = match serde_json::from_str(text) {
        Ok(packet) => packet,
        Err(err) => {
            warn!("error parsing AP packet: {err}");
            return Ok(());
        }
    };
    for element in packet {
        match serde_json::from_value::<ClientMessage>(element) {
            Ok(msg) => {
                if inbox.send(ApEvent::Message(msg)).await.is_err() {
                    return Err(());
                }
            }
            Err(err) => warn!("unhandled AP client message: {err}"),
        }
    }
    Ok(())
}

fn epoch_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as f64)
        .unwrap_or_default()
}
