//! Rooms and their command loops.
//!
//! Each room is owned by a single task draining a command channel; commands
//! mutate the room serially, so no locking happens inside a room. The shared
//! registry only maps names to command senders and is the one place guarded
//! by a mutex. A room removes itself from the registry after the command that
//! leaves it empty.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use mwbridge_core::mwproto::names;
use mwbridge_core::mwproto::{KeyValuePair, Placement, ResultMessage, SpoilerLogs};

use crate::mix::{self, World};

pub const ROOM_MESSAGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed randomization id stamped on every result.
pub const RANDO_ID: i32 = 0x7777_7777;

pub type Uid = u64;

pub struct Player {
    pub uid: Uid,
    pub nickname: String,
    pub sender: mpsc::Sender<RoomMessage>,
    pub world: Option<World>,
    pub ready_metadata: Vec<KeyValuePair>,
}

pub enum RoomCommand {
    Join { player: Player },
    Leave { uid: Uid },
    StartRandomization,
    UploadRando { uid: Uid, world: World },
}

#[derive(Debug, Clone)]
pub enum RoomMessage {
    PlayersJoined { nicknames: Vec<String> },
    RandomizationStarting,
    RandomizationResult(Box<ResultMessage>),
}

/// The room registry. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct Rooms {
    inner: Arc<Mutex<HashMap<String, mpsc::Sender<RoomCommand>>>>,
}

impl Rooms {
    pub fn new() -> Rooms {
        Rooms::default()
    }

    /// Returns the command channel of the named room, creating the room and
    /// spawning its command loop if it does not exist yet.
    pub fn open(&self, name: &str) -> mpsc::Sender<RoomCommand> {
        let mut rooms = self.inner.lock().unwrap();
        if let Some(commands) = rooms.get(name) {
            return commands.clone();
        }
        let (tx, rx) = mpsc::channel(1);
        rooms.insert(name.to_string(), tx.clone());
        let room = Room {
            name: name.to_string(),
            players: Vec::new(),
        };
        tokio::spawn(run_room(room, rx, self.clone()));
        tx
    }

    fn close(&self, name: &str) {
        self.inner.lock().unwrap().remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().unwrap().contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

async fn run_room(mut room: Room, mut commands: mpsc::Receiver<RoomCommand>, rooms: Rooms) {
    info!(room = %room.name, "opened room");
    while let Some(cmd) = commands.recv().await {
        room.apply(cmd).await;
        if room.players.is_empty() {
            info!(room = %room.name, "closing room, no players left");
            break;
        }
    }
    rooms.close(&room.name);
}

/// A room's state, owned exclusively by its command loop. Players keep their
/// insertion order.
pub struct Room {
    name: String,
    players: Vec<Player>,
}

impl Room {
    pub async fn apply(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Join { player } => {
                self.players.push(player);
                let nicknames = self.nicknames();
                self.broadcast(RoomMessage::PlayersJoined { nicknames })
                    .await;
            }
            RoomCommand::Leave { uid } => {
                let Some(i) = self.players.iter().position(|p| p.uid == uid) else {
                    warn!(room = %self.name, "nonexistent player attempted to leave room");
                    return;
                };
                self.players.remove(i);
                let nicknames = self.nicknames();
                self.broadcast(RoomMessage::PlayersJoined { nicknames })
                    .await;
            }
            RoomCommand::StartRandomization => {
                self.broadcast(RoomMessage::RandomizationStarting).await;
            }
            RoomCommand::UploadRando { uid, world } => {
                self.upload_rando(uid, world).await;
            }
        }
    }

    fn nicknames(&self) -> Vec<String> {
        self.players.iter().map(|p| p.nickname.clone()).collect()
    }

    async fn broadcast(&self, msg: RoomMessage) {
        let deadline = Instant::now() + ROOM_MESSAGE_TIMEOUT;
        let mut senders = JoinSet::new();
        for p in &self.players {
            senders.spawn(try_send(
                p.sender.clone(),
                p.nickname.clone(),
                msg.clone(),
                deadline,
            ));
        }
        // In-flight sends must finish (or time out) before the next command
        // mutates the room.
        while senders.join_next().await.is_some() {}
    }

    async fn upload_rando(&mut self, uid: Uid, world: World) {
        let Some(p) = self.players.iter_mut().find(|p| p.uid == uid) else {
            warn!(room = %self.name, "nonexistent player attempted to upload a rando");
            return;
        };
        p.world = Some(world);

        if self.players.iter().any(|p| p.world.is_none()) {
            return;
        }

        info!(room = %self.name, "generating rando");

        // Result indices are assigned by ascending seed, not join order.
        let mut bound: Vec<(usize, World)> = self
            .players
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.world.clone().map(|w| (i, w)))
            .collect();
        bound.sort_by_key(|(_, w)| w.seed);

        let worlds: Vec<World> = bound.iter().map(|(_, w)| w.clone()).collect();
        let mixed = mix::mix(&worlds);
        let result_hash = mix::hash(&mixed);

        info!(room = %self.name, hash = %result_hash, "generated rando");

        let nicknames: Vec<String> = bound
            .iter()
            .map(|(i, _)| self.players[*i].nickname.clone())
            .collect();
        // Each per-player metadata list must be present (possibly empty) when
        // rebroadcast.
        let metadata: Vec<Vec<KeyValuePair>> = bound
            .iter()
            .map(|(i, _)| self.players[*i].ready_metadata.clone())
            .collect();
        let mut spoilers = BTreeMap::new();
        for name in &nicknames {
            spoilers.insert(name.clone(), String::new());
        }

        let deadline = Instant::now() + ROOM_MESSAGE_TIMEOUT;
        let mut senders = JoinSet::new();
        for (index, (player_index, _)) in bound.iter().enumerate() {
            let mut placements: BTreeMap<String, Vec<Placement>> = BTreeMap::new();
            let mut own_items: BTreeMap<String, String> = BTreeMap::new();
            for p in &mixed {
                if p.location.world == index {
                    placements
                        .entry(p.group.clone())
                        .or_default()
                        .push(Placement {
                            item: names::qualified_name(p.item.world as i32, &p.item.name),
                            location: p.location.name.clone(),
                        });
                }
                if p.item.world == index {
                    own_items.insert(
                        p.item.name.clone(),
                        names::qualified_name(p.location.world as i32, &p.location.name),
                    );
                }
            }
            let result = ResultMessage {
                player_id: index as i32,
                rando_id: RANDO_ID,
                nicknames: nicknames.clone(),
                ready_metadata: metadata.clone(),
                items_spoiler: SpoilerLogs {
                    individual_world_spoilers: spoilers.clone(),
                    full_ordered_items_log: String::new(),
                },
                placements,
                player_items_placements: own_items,
                generated_hash: result_hash.clone(),
            };
            let player = &self.players[*player_index];
            senders.spawn(try_send(
                player.sender.clone(),
                player.nickname.clone(),
                RoomMessage::RandomizationResult(Box::new(result)),
                deadline,
            ));
        }
        while senders.join_next().await.is_some() {}
    }
}

// One sender per recipient; a stuck consumer only loses its own copy.
async fn try_send(
    sender: mpsc::Sender<RoomMessage>,
    nickname: String,
    msg: RoomMessage,
    deadline: Instant,
) {
    tokio::select! {
        res = sender.send(msg) => {
            if res.is_err() {
                debug!("room message to {nickname} dropped; session is gone");
            }
        }
        _ = tokio::time::sleep_until(deadline) => {
            warn!("broadcast to {nickname} timed out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mix::Sphere;

    fn sphere(pairs: &[(&str, &str)]) -> Sphere {
        pairs
            .iter()
            .map(|(i, l)| Placement {
                item: i.to_string(),
                location: l.to_string(),
            })
            .collect()
    }

    fn test_world(seed: i64, spheres: Vec<Sphere>) -> World {
        let mut placements = BTreeMap::new();
        placements.insert("Main Item Group".to_string(), spheres);
        World { seed, placements }
    }

    fn test_player(uid: Uid, nickname: &str) -> (Player, mpsc::Receiver<RoomMessage>) {
        let (tx, rx) = mpsc::channel(8);
        (
            Player {
                uid,
                nickname: nickname.to_string(),
                sender: tx,
                world: None,
                ready_metadata: Vec::new(),
            },
            rx,
        )
    }

    async fn recv_result(rx: &mut mpsc::Receiver<RoomMessage>) -> ResultMessage {
        loop {
            match rx.recv().await.expect("channel open") {
                RoomMessage::RandomizationResult(r) => return *r,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn result_player_ids_follow_seed_order() {
        let mut room = Room {
            name: "test".to_string(),
            players: Vec::new(),
        };
        // Join order is opposite to seed order.
        let (p1, mut rx1) = test_player(1, "second");
        let (p2, mut rx2) = test_player(2, "first");
        room.apply(RoomCommand::Join { player: p1 }).await;
        room.apply(RoomCommand::Join { player: p2 }).await;

        room.apply(RoomCommand::UploadRando {
            uid: 1,
            world: test_world(2, vec![sphere(&[("b1", "lb1"), ("b2", "lb2")])]),
        })
        .await;
        room.apply(RoomCommand::UploadRando {
            uid: 2,
            world: test_world(1, vec![sphere(&[("a1", "la1"), ("a2", "la2")])]),
        })
        .await;

        let r1 = recv_result(&mut rx1).await;
        let r2 = recv_result(&mut rx2).await;
        // seed=1 belongs to uid 2 and becomes player 0.
        assert_eq!(r2.player_id, 0);
        assert_eq!(r1.player_id, 1);
        assert_eq!(r1.rando_id, RANDO_ID);
        assert_eq!(r1.nicknames, vec!["first".to_string(), "second".to_string()]);
        assert_eq!(r1.nicknames, r2.nicknames);
        assert_eq!(r1.generated_hash, r2.generated_hash);
        assert_eq!(r1.ready_metadata.len(), 2);
        assert_eq!(r1.items_spoiler.individual_world_spoilers.len(), 2);
    }

    #[tokio::test]
    async fn result_placements_are_filtered_per_recipient() {
        let mut room = Room {
            name: "test".to_string(),
            players: Vec::new(),
        };
        let (p1, mut rx1) = test_player(1, "alice");
        let (p2, mut rx2) = test_player(2, "bob");
        room.apply(RoomCommand::Join { player: p1 }).await;
        room.apply(RoomCommand::Join { player: p2 }).await;
        room.apply(RoomCommand::UploadRando {
            uid: 1,
            world: test_world(1, vec![sphere(&[("a", "la")])]),
        })
        .await;
        room.apply(RoomCommand::UploadRando {
            uid: 2,
            world: test_world(2, vec![sphere(&[("b", "lb")])]),
        })
        .await;

        let r1 = recv_result(&mut rx1).await;
        let r2 = recv_result(&mut rx2).await;

        let total: usize = r1.placements.values().map(Vec::len).sum::<usize>()
            + r2.placements.values().map(Vec::len).sum::<usize>();
        assert_eq!(total, 2);

        for result in [&r1, &r2] {
            for p in result.placements.values().flatten() {
                // Locations all belong to the recipient, items are qualified.
                assert!(names::parse_qualified_name(&p.item).is_some());
                assert!(names::parse_qualified_name(&p.location).is_none());
            }
            for location in result.player_items_placements.values() {
                let (world, _) = names::parse_qualified_name(location).expect("qualified");
                assert!(world == 0 || world == 1);
            }
        }

        // Every item of world 0 appears in r1's own-items map.
        assert_eq!(r1.player_items_placements.len(), 1);
        assert!(r1.player_items_placements.contains_key("a"));
        assert!(r2.player_items_placements.contains_key("b"));
    }

    #[tokio::test]
    async fn upload_waits_for_every_player() {
        let mut room = Room {
            name: "test".to_string(),
            players: Vec::new(),
        };
        let (p1, mut rx1) = test_player(1, "alice");
        let (p2, _rx2) = test_player(2, "bob");
        room.apply(RoomCommand::Join { player: p1 }).await;
        room.apply(RoomCommand::Join { player: p2 }).await;
        room.apply(RoomCommand::UploadRando {
            uid: 1,
            world: test_world(1, vec![sphere(&[("a", "la")])]),
        })
        .await;

        // Drain join broadcasts; no result may be present.
        while let Ok(msg) = rx1.try_recv() {
            assert!(!matches!(msg, RoomMessage::RandomizationResult(_)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_consumer_does_not_stall_broadcast() {
        let mut room = Room {
            name: "test".to_string(),
            players: Vec::new(),
        };
        // A player whose channel is full and never drained.
        let (stuck_tx, _stuck_rx) = mpsc::channel(1);
        stuck_tx
            .send(RoomMessage::RandomizationStarting)
            .await
            .unwrap();
        room.players.push(Player {
            uid: 1,
            nickname: "stuck".to_string(),
            sender: stuck_tx,
            world: None,
            ready_metadata: Vec::new(),
        });
        let (p2, mut rx2) = test_player(2, "live");
        room.players.push(p2);

        let started = Instant::now();
        room.broadcast(RoomMessage::RandomizationStarting).await;
        assert!(started.elapsed() >= ROOM_MESSAGE_TIMEOUT);

        // The live consumer still got its copy.
        assert!(matches!(
            rx2.try_recv(),
            Ok(RoomMessage::RandomizationStarting)
        ));
    }
}
