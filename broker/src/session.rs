//! The per-connection accept loop and session state machine.
//!
//! A session moves through three states: awaiting `Connect`, awaiting
//! `Ready`, and in-room. While in a room it multiplexes the client's
//! messages with the messages its room broadcasts back.

use std::net::SocketAddr;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, warn};

use mwbridge_core::mwproto::{wire, Message};

use crate::mix::World;
use crate::room::{Player, RoomCommand, RoomMessage, Rooms, Uid};

/// Accepts connections forever, giving each one a process-unique uid.
pub async fn serve(listener: TcpListener, rooms: Rooms, server_name: String) {
    let mut next_uid: Uid = 0;
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("accept: {err}");
                continue;
            }
        };
        let uid = next_uid;
        next_uid += 1;
        let rooms = rooms.clone();
        let server_name = server_name.clone();
        tokio::spawn(session(stream, addr, uid, rooms, server_name));
    }
}

async fn session(stream: TcpStream, addr: SocketAddr, uid: Uid, rooms: Rooms, server_name: String) {
    info!("new connection from {addr}");

    let (read_half, mut conn) = stream.into_split();
    let (tx, mut client_messages) = mpsc::channel(1);
    let reader = tokio::spawn(read_messages(read_half, tx, addr));

    let mut joined: Option<mpsc::Sender<RoomCommand>> = None;
    run(
        &mut client_messages,
        &mut conn,
        &mut joined,
        uid,
        &rooms,
        &server_name,
        addr,
    )
    .await;

    if let Some(room) = joined {
        let _ = room.send(RoomCommand::Leave { uid }).await;
    }
    reader.abort();
}

async fn read_messages(mut conn: OwnedReadHalf, messages: mpsc::Sender<Message>, addr: SocketAddr) {
    loop {
        match wire::read_message(&mut conn).await {
            Ok(msg) => {
                if messages.send(msg).await.is_err() {
                    return;
                }
            }
            Err(err) if err.is_fatal() => {
                warn!("read from {addr}: {err}");
                return;
            }
            Err(err) => warn!("read from {addr}: {err}"),
        }
    }
}

async fn run(
    client_messages: &mut mpsc::Receiver<Message>,
    conn: &mut OwnedWriteHalf,
    joined: &mut Option<mpsc::Sender<RoomCommand>>,
    uid: Uid,
    rooms: &Rooms,
    server_name: &str,
    addr: SocketAddr,
) {
    // awaitConnect
    loop {
        let Some(msg) = client_messages.recv().await else {
            return;
        };
        match msg {
            Message::Connect { .. } => {
                let reply = Message::Connect {
                    server_name: server_name.to_string(),
                };
                if let Err(err) = wire::write_message(conn, &reply).await {
                    warn!("acknowledge connection from {addr}: {err}");
                    return;
                }
                break;
            }
            Message::Ping => {
                if let Err(err) = wire::write_message(conn, &Message::Ping).await {
                    warn!("respond to ping from {addr}: {err}");
                    return;
                }
            }
            Message::Disconnect => {
                info!("connection from {addr} terminated");
                return;
            }
            other => warn!("unexpected message (awaiting connection) from {addr}: {other:?}"),
        }
    }

    'await_ready: loop {
        // awaitReady
        let (room, mut room_messages) = loop {
            let Some(msg) = client_messages.recv().await else {
                return;
            };
            match msg {
                Message::Ping => {
                    if let Err(err) = wire::write_message(conn, &Message::Ping).await {
                        warn!("respond to ping from {addr}: {err}");
                        return;
                    }
                }
                Message::Disconnect => {
                    info!("connection from {addr} terminated");
                    return;
                }
                Message::Ready {
                    room,
                    nickname,
                    mode,
                    ready_metadata,
                } => {
                    if mode != 0 {
                        warn!("invalid room mode from {addr}: {mode}");
                        let deny = Message::ReadyDeny {
                            description: "invalid room mode".to_string(),
                        };
                        if let Err(err) = wire::write_message(conn, &deny).await {
                            warn!("send ready deny to {addr}: {err}");
                            return;
                        }
                        continue;
                    }
                    let commands = rooms.open(&room);
                    let (room_tx, room_rx) = mpsc::channel(1);
                    let player = Player {
                        uid,
                        nickname,
                        sender: room_tx,
                        world: None,
                        ready_metadata,
                    };
                    if commands.send(RoomCommand::Join { player }).await.is_err() {
                        warn!("room {room:?} closed while joining from {addr}");
                        continue;
                    }
                    break (commands, room_rx);
                }
                other => warn!("unexpected message (awaiting ready) from {addr}: {other:?}"),
            }
        };
        *joined = Some(room.clone());

        // inRoom
        loop {
            tokio::select! {
                msg = client_messages.recv() => {
                    let Some(msg) = msg else { return };
                    match msg {
                        Message::Ping => {
                            if let Err(err) = wire::write_message(conn, &Message::Ping).await {
                                warn!("respond to ping from {addr}: {err}");
                                return;
                            }
                        }
                        Message::Disconnect => {
                            info!("connection from {addr} terminated");
                            return;
                        }
                        Message::Unready => {
                            let _ = room.send(RoomCommand::Leave { uid }).await;
                            *joined = None;
                            continue 'await_ready;
                        }
                        Message::InitiateGame { options } => {
                            if !options.randomization_algorithm.is_default() {
                                warn!(
                                    "invalid randomization algorithm from {addr}: {:?}",
                                    options.randomization_algorithm
                                );
                                continue;
                            }
                            let _ = room.send(RoomCommand::StartRandomization).await;
                        }
                        Message::RandoGenerated { items, seed } => {
                            // Uploaded placement lists arrive flat and ordered;
                            // each placement becomes its own progression sphere.
                            let placements = items
                                .into_iter()
                                .map(|(group, list)| {
                                    (group, list.into_iter().map(|p| vec![p]).collect())
                                })
                                .collect();
                            let world = World { seed, placements };
                            let _ = room.send(RoomCommand::UploadRando { uid, world }).await;
                        }
                        other => warn!("unexpected message (in room) from {addr}: {other:?}"),
                    }
                }
                room_msg = room_messages.recv() => {
                    let Some(room_msg) = room_msg else { return };
                    match room_msg {
                        RoomMessage::PlayersJoined { nicknames } => {
                            let confirm = Message::ReadyConfirm { ready: 0, names: nicknames };
                            if let Err(err) = wire::write_message(conn, &confirm).await {
                                warn!("send nicknames to {addr}: {err}");
                                return;
                            }
                        }
                        RoomMessage::RandomizationStarting => {
                            if let Err(err) = wire::write_message(conn, &Message::RequestRando).await {
                                warn!("sending rando request to {addr}: {err}");
                            }
                        }
                        RoomMessage::RandomizationResult(result) => {
                            if let Err(err) =
                                wire::write_message(conn, &Message::Result(*result)).await
                            {
                                warn!("send result to {addr}: {err}");
                            }
                            let _ = room.send(RoomCommand::Leave { uid }).await;
                            *joined = None;
                            continue 'await_ready;
                        }
                    }
                }
            }
        }
    }
}
