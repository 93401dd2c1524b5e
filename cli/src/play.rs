//! The bridge session: one durable savefile, one multiworld connection, one
//! AP client at a time.
//!
//! All translation between the two ecosystems happens here. The session
//! itself is a pure message-in/messages-out state machine over the savefile;
//! the `play` loop is a thin multiplexer that pumps both inboxes through it.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::Context;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use mwbridge_core::approto::{
    self, ClientMessage, DataPackage, DataPackageContents, NetworkItem, NetworkPlayer,
    NetworkSlot, RoomInfo, RoomPermissions, ServerMessage, Version, CLIENT_STATUS_UNKNOWN,
    READ_ONLY_KEY_PREFIX, RECEIVE_OTHERS_ITEMS, RECEIVE_OWN_ITEMS, SLOT_TYPE_PLAYER,
};
use mwbridge_core::mwproto::names::strip_discriminator;
use mwbridge_core::mwproto::{Message, LABEL_MULTIWORLD_ITEM};
use mwbridge_core::Client;

use crate::apfile::ApData;
use crate::apserver::{ApEvent, ApServer};
use crate::datastorage;
use crate::itemnames;
use crate::savefile::{Savefile, SavefileError};
use crate::Args;

pub const SAVEFILE_NAME: &str = "state.sqlite3";

/// The main item group used by the randomizers this bridge speaks for.
pub const MAIN_ITEM_GROUP: &str = "Main Item Group";

/// Time-to-live stamped on forwarded items.
pub const SENT_ITEM_TTL: i32 = 666;

/// Sentinel for a lost AP or MW connection; the owner resumes instead of
/// aborting.
#[derive(Debug, thiserror::Error)]
#[error("connection lost")]
pub struct ConnectionLost;

pub async fn play(args: &Args, data: &ApData) -> anyhow::Result<()> {
    single_slot(data)?;
    let savefile = Savefile::open(&args.workdir.join(SAVEFILE_NAME))
        .context("open persistent state DB")?;
    let mut session = Session::new(savefile, data)?;
    let room_info = session.room_info(data);

    let mut ap = ApServer::bind(args.apport, room_info).await?;
    let mut mw = Client::dial(&args.mwserver).await.context("connect to MW")?;
    mw.send(Message::Connect {
        server_name: String::new(),
    })
    .await;

    loop {
        tokio::select! {
            msg = mw.recv() => {
                let Some(msg) = msg else { return Err(ConnectionLost.into()) };
                let out = session.handle_mw(msg)?;
                dispatch(&mw, &ap, out).await;
            }
            event = ap.recv() => {
                match event {
                    None | Some(ApEvent::Disconnected) => return Err(ConnectionLost.into()),
                    Some(ApEvent::Message(msg)) => {
                        let out = session.handle_ap(msg)?;
                        dispatch(&mw, &ap, out).await;
                    }
                }
            }
        }
    }
}

async fn dispatch(mw: &Client, ap: &ApServer, out: Vec<Outgoing>) {
    for msg in out {
        match msg {
            Outgoing::Ap(msg) => ap.send(msg).await,
            Outgoing::Mw(msg) => mw.send(msg).await,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Ap(ServerMessage),
    Mw(Message),
}

#[derive(Debug, Clone)]
struct PlacedItem {
    owner: i32,
    name: String,
}

pub struct Session {
    savefile: Savefile,
    player_id: i32,
    rando_id: i32,
    nicknames: Vec<String>,
    games: Vec<String>,
    checksums: Vec<String>,
    slot_name: String,
    slot_game: String,
    own_items: HashMap<String, i64>,
    own_locations: HashMap<String, i64>,
    own_placement_tuples: HashMap<i64, Vec<i64>>,
    own_original: Value,
    slot_data: Value,
    synth_packages: BTreeMap<String, DataPackage>,
    pretty: HashMap<String, String>,
    placements_by_location: HashMap<i64, PlacedItem>,
    readonly_store: HashMap<String, Value>,
    watched_keys: HashSet<String>,
    item_handling: i32,
}

impl Session {
    pub fn new(savefile: Savefile, data: &ApData) -> Result<Session, SavefileError> {
        let nicknames = savefile.nicknames()?;
        let (player_id, rando_id) = savefile.connection_params()?;

        let (slot_id, slot) = data
            .slot_info
            .iter()
            .next()
            .map(|(id, slot)| (*id, slot.clone()))
            .unwrap_or_default();

        let games: Vec<String> = nicknames
            .iter()
            .enumerate()
            .map(|(i, nick)| {
                if i as i32 == player_id {
                    slot.game.clone()
                } else {
                    format!("{nick}'s World")
                }
            })
            .collect();

        let own_package = data.datapackage.get(&slot.game).cloned().unwrap_or_default();
        let own_placement_tuples = data.locations.get(&slot_id).cloned().unwrap_or_default();
        let slot_data = data.slot_data.get(&slot_id).cloned().unwrap_or(Value::Null);

        let world_placements = savefile.own_world_placements()?;
        let pretty = itemnames::pretty_names(
            world_placements
                .iter()
                .map(|p| (p.dest_player_id, p.item_name.as_str())),
            player_id,
        );

        let mut synth_packages: BTreeMap<String, DataPackage> = BTreeMap::new();
        for (i, game) in games.iter().enumerate() {
            if i as i32 != player_id {
                synth_packages.insert(game.clone(), DataPackage::default());
            }
        }

        // Item ids are dense from 1, assigned in placement-scan order.
        let mut placements_by_location = HashMap::new();
        let mut next_item_id: i64 = 1;
        for p in &world_placements {
            if p.dest_player_id < 0 || p.dest_player_id as usize >= games.len() {
                warn!("MW item has world out of range: {:?}", p.item_name);
                continue;
            }
            if p.dest_player_id != player_id {
                let game = &games[p.dest_player_id as usize];
                if let (Some(pretty_name), Some(package)) =
                    (pretty.get(&p.item_name), synth_packages.get_mut(game))
                {
                    package
                        .item_name_to_id
                        .entry(pretty_name.clone())
                        .or_insert_with(|| {
                            let id = next_item_id;
                            next_item_id += 1;
                            id
                        });
                }
            }
            placements_by_location.insert(
                p.ap_location_id,
                PlacedItem {
                    owner: p.dest_player_id,
                    name: p.item_name.clone(),
                },
            );
        }

        // Location ids likewise, in location-name order.
        let mut next_location_id: i64 = 1;
        for (location, source) in savefile.own_item_locations()? {
            if source < 0 || source as usize >= games.len() {
                warn!("MW location has world out of range: {location:?}");
                continue;
            }
            if source == player_id {
                continue;
            }
            let game = &games[source as usize];
            if let Some(package) = synth_packages.get_mut(game) {
                package.location_name_to_id.entry(location).or_insert_with(|| {
                    let id = next_location_id;
                    next_location_id += 1;
                    id
                });
            }
        }

        let checksums: Vec<String> = games
            .iter()
            .enumerate()
            .map(|(i, game)| {
                if i as i32 == player_id {
                    own_package.checksum.clone()
                } else if let Some(package) = synth_packages.get_mut(game) {
                    package.set_checksum();
                    package.checksum.clone()
                } else {
                    String::new()
                }
            })
            .collect();

        let mut readonly_store = HashMap::new();
        for (i, game) in games.iter().enumerate() {
            let slot_number = i + 1;
            readonly_store.insert(format!("{READ_ONLY_KEY_PREFIX}hints_0_{slot_number}"), json!([]));
            readonly_store.insert(
                format!("{READ_ONLY_KEY_PREFIX}client_status_0_{slot_number}"),
                json!(CLIENT_STATUS_UNKNOWN),
            );
            let (item_groups, location_groups) = if i as i32 == player_id {
                (
                    own_package
                        .original
                        .get("item_name_groups")
                        .cloned()
                        .unwrap_or_else(|| json!({})),
                    own_package
                        .original
                        .get("location_name_groups")
                        .cloned()
                        .unwrap_or_else(|| json!({})),
                )
            } else {
                (json!({}), json!({}))
            };
            readonly_store.insert(
                format!("{READ_ONLY_KEY_PREFIX}item_name_groups_{game}"),
                item_groups,
            );
            readonly_store.insert(
                format!("{READ_ONLY_KEY_PREFIX}location_name_groups_{game}"),
                location_groups,
            );
            let per_slot_data = if i as i32 == player_id {
                slot_data.clone()
            } else {
                json!({})
            };
            readonly_store.insert(
                format!("{READ_ONLY_KEY_PREFIX}slot_data_{slot_number}"),
                per_slot_data,
            );
        }
        readonly_store.insert(format!("{READ_ONLY_KEY_PREFIX}race_mode"), json!(0));

        Ok(Session {
            savefile,
            player_id,
            rando_id,
            nicknames,
            games,
            checksums,
            slot_name: slot.name,
            slot_game: slot.game,
            own_items: own_package.item_name_to_id,
            own_locations: own_package.location_name_to_id,
            own_placement_tuples,
            own_original: own_package.original,
            slot_data,
            synth_packages,
            pretty,
            placements_by_location,
            readonly_store,
            watched_keys: HashSet::new(),
            item_handling: 0,
        })
    }

    pub fn room_info(&self, data: &ApData) -> RoomInfo {
        let generator = [
            data.version.first().copied().unwrap_or_default(),
            data.version.get(1).copied().unwrap_or_default(),
            data.version.get(2).copied().unwrap_or_default(),
        ];
        RoomInfo {
            version: Version::new([0, 5, 1]),
            generator_version: Version::new(generator),
            tags: data.tags.clone(),
            password: false,
            permissions: RoomPermissions {
                release: approto::permission_for_mode(&data.server_options.release_mode),
                collect: approto::permission_for_mode(&data.server_options.collect_mode),
                remaining: approto::permission_for_mode(&data.server_options.remaining_mode),
            },
            hint_cost: data.server_options.hint_cost,
            location_check_points: data.server_options.location_check_points,
            games: self.games.clone(),
            data_package_checksums: self.checksums.clone(),
            seed_name: data.seed_name.clone(),
            // Stamped at send time.
            time: 0.0,
        }
    }

    pub fn handle_mw(&mut self, msg: Message) -> Result<Vec<Outgoing>, SavefileError> {
        match msg {
            Message::Connect { server_name } => {
                info!("connected to {server_name}");
                Ok(vec![])
            }
            Message::JoinConfirm => {
                // Recover anything the previous connection never confirmed.
                let queued = self.savefile.unconfirmed_items()?;
                Ok(queued
                    .into_iter()
                    .map(|item| {
                        Outgoing::Mw(Message::DataSend {
                            label: item.label,
                            content: item.content,
                            to: item.dest_player_id,
                            ttl: SENT_ITEM_TTL,
                        })
                    })
                    .collect())
            }
            Message::DataReceive {
                label,
                content,
                from,
                from_id,
            } => {
                let Some((index, item)) = self.receive_item(&label, &content, &from, from_id)?
                else {
                    return Ok(vec![]);
                };
                Ok(vec![
                    Outgoing::Ap(ServerMessage::ReceivedItems {
                        index,
                        items: vec![item],
                    }),
                    Outgoing::Mw(Message::DataReceiveConfirm {
                        label,
                        data: content,
                        from,
                    }),
                    Outgoing::Mw(Message::Save),
                ])
            }
            Message::DatasReceive { datas } => {
                let count = datas.len() as i32;
                let mut items = Vec::new();
                let mut first_index = None;
                for entry in &datas {
                    if let Some((index, item)) =
                        self.receive_item(&entry.label, &entry.content, &entry.from, entry.from_id)?
                    {
                        first_index.get_or_insert(index);
                        items.push(item);
                    }
                }
                let mut out = Vec::new();
                if let Some(index) = first_index {
                    out.push(Outgoing::Ap(ServerMessage::ReceivedItems { index, items }));
                }
                out.push(Outgoing::Mw(Message::DatasReceiveConfirm { count }));
                if first_index.is_some() {
                    out.push(Outgoing::Mw(Message::Save));
                }
                Ok(out)
            }
            Message::DataSendConfirm { label, content, to } => {
                if !self.savefile.confirm_item(&label, &content, to)? {
                    warn!(
                        "received confirmation for item that wasn't sent: \
                         label={label:?} content={content:?} to={to}"
                    );
                }
                Ok(vec![])
            }
            Message::RequestCharmNotchCosts => {
                // Nothing to announce.
                Ok(vec![Outgoing::Mw(Message::AnnounceCharmNotchCosts {
                    player_id: self.player_id,
                    notch_costs: BTreeMap::new(),
                })])
            }
            Message::AnnounceCharmNotchCosts {
                player_id,
                notch_costs,
            } => {
                info!("got charm notch costs for player {player_id}");
                for (charm, cost) in &notch_costs {
                    debug!("charm {charm} costs {cost} notches");
                }
                Ok(vec![Outgoing::Mw(Message::ConfirmCharmNotchCostsReceived {
                    player_id,
                })])
            }
            other => {
                debug!("unhandled MW message: {other:?}");
                Ok(vec![])
            }
        }
    }

    pub fn handle_ap(&mut self, msg: ClientMessage) -> Result<Vec<Outgoing>, SavefileError> {
        match msg {
            ClientMessage::Connect {
                items_handling,
                slot_data: wants_slot_data,
                ..
            } => self.connect(items_handling, wants_slot_data),
            ClientMessage::GetDataPackage { games } => {
                let picked = games.unwrap_or_else(|| self.games.clone());
                let mut contents = DataPackageContents::default();
                for game in picked {
                    let package = if game == self.slot_game {
                        self.own_original.clone()
                    } else if let Some(synth) = self.synth_packages.get(&game) {
                        serde_json::to_value(synth).unwrap_or(Value::Null)
                    } else {
                        Value::Null
                    };
                    contents.games.insert(game, package);
                }
                Ok(vec![Outgoing::Ap(ServerMessage::DataPackage {
                    data: contents,
                })])
            }
            ClientMessage::Sync {} => Ok(vec![Outgoing::Ap(ServerMessage::ReceivedItems {
                index: 0,
                items: self.savefile.sent_items()?,
            })]),
            ClientMessage::Set {
                key,
                default,
                want_reply,
                operations,
            } => {
                if key.starts_with(READ_ONLY_KEY_PREFIX) {
                    warn!("cannot modify read-only key {key:?}");
                    return Ok(vec![]);
                }
                let stored = self
                    .savefile
                    .stored_data(&key)?
                    .and_then(|raw| serde_json::from_str(&raw).ok());
                let (original, new) = match datastorage::apply(stored, &default, &operations) {
                    Ok(applied) => applied,
                    Err(err) => {
                        warn!("set {key:?}: {err}");
                        return Ok(vec![]);
                    }
                };
                self.savefile.set_stored_data(&key, &new.to_string())?;
                if want_reply || self.watched_keys.contains(&key) {
                    Ok(vec![Outgoing::Ap(ServerMessage::SetReply {
                        key,
                        value: new,
                        original_value: original,
                        slot: self.player_id,
                    })])
                } else {
                    Ok(vec![])
                }
            }
            ClientMessage::SetNotify { keys } => {
                for key in keys {
                    debug!("client watching key {key:?}");
                    self.watched_keys.insert(key);
                }
                Ok(vec![])
            }
            ClientMessage::Get { keys, rest } => {
                let mut values = Map::new();
                for key in keys {
                    let value = if key.starts_with(READ_ONLY_KEY_PREFIX) {
                        self.readonly_store.get(&key).cloned().unwrap_or(Value::Null)
                    } else {
                        self.savefile
                            .stored_data(&key)?
                            .and_then(|raw| serde_json::from_str(&raw).ok())
                            .unwrap_or(Value::Null)
                    };
                    values.insert(key, value);
                }
                Ok(vec![Outgoing::Ap(ServerMessage::Retrieved {
                    keys: values,
                    rest,
                })])
            }
            ClientMessage::LocationScouts { locations, .. } => self.location_scouts(&locations),
            ClientMessage::LocationChecks { locations } => self.location_checks(&locations),
            ClientMessage::Say { text } => {
                info!("AP client says: {text}");
                Ok(vec![])
            }
        }
    }

    fn connect(
        &mut self,
        items_handling: Option<i32>,
        wants_slot_data: bool,
    ) -> Result<Vec<Outgoing>, SavefileError> {
        let mut out = vec![Outgoing::Mw(Message::Join {
            display_name: self.slot_name.clone(),
            player_id: self.player_id,
            rando_id: self.rando_id,
        })];

        let mut players = Vec::with_capacity(self.nicknames.len());
        let mut slot_info = BTreeMap::new();
        for (i, nick) in self.nicknames.iter().enumerate() {
            let slot = i as i32 + 1;
            players.push(NetworkPlayer {
                team: 0,
                slot,
                alias: nick.clone(),
                name: nick.clone(),
            });
            slot_info.insert(
                slot,
                NetworkSlot {
                    name: nick.clone(),
                    game: self.games[i].clone(),
                    slot_type: SLOT_TYPE_PLAYER,
                    group_members: Vec::new(),
                },
            );
        }

        let checked_locations = self.savefile.cleared_locations()?;
        let cleared: HashSet<i64> = checked_locations.iter().copied().collect();
        let mut missing_locations: Vec<i64> = self
            .own_locations
            .values()
            .copied()
            .filter(|id| !cleared.contains(id))
            .collect();
        missing_locations.sort_unstable();

        // A client that does not say what it wants receives other worlds'
        // items only.
        self.item_handling = items_handling.unwrap_or(RECEIVE_OTHERS_ITEMS);

        out.push(Outgoing::Ap(ServerMessage::Connected {
            team: 0,
            slot: self.player_id + 1,
            players,
            slot_info,
            missing_locations,
            checked_locations,
            hint_points: 0,
            slot_data: wants_slot_data.then(|| self.slot_data.clone()),
        }));

        // Replay the full delivery history so a reconnecting client catches
        // up from index zero.
        out.push(Outgoing::Ap(ServerMessage::ReceivedItems {
            index: 0,
            items: self.savefile.sent_items()?,
        }));
        Ok(out)
    }

    fn location_scouts(&self, locations: &[i64]) -> Result<Vec<Outgoing>, SavefileError> {
        let mut scouted = Vec::with_capacity(locations.len());
        for &location in locations {
            if let Some(placed) = self.placements_by_location.get(&location) {
                let item = if placed.owner == self.player_id {
                    self.own_items
                        .get(strip_discriminator(&placed.name))
                        .copied()
                        .unwrap_or_default()
                } else {
                    self.synth_item_id(placed)
                };
                scouted.push(NetworkItem {
                    item,
                    location,
                    player: placed.owner + 1,
                    flags: 0,
                });
            } else if let Some(tuple) = self.own_placement_tuples.get(&location) {
                if tuple.len() < 3 {
                    continue;
                }
                scouted.push(NetworkItem {
                    item: tuple[0],
                    location,
                    player: self.player_id + 1,
                    flags: tuple[2] as i32,
                });
            }
        }
        Ok(vec![Outgoing::Ap(ServerMessage::LocationInfo {
            locations: scouted,
        })])
    }

    fn location_checks(&mut self, locations: &[i64]) -> Result<Vec<Outgoing>, SavefileError> {
        let mut out = Vec::new();
        for &location in locations {
            if self.savefile.is_location_cleared(location)? {
                continue;
            }
            if let Some(placed) = self.placements_by_location.get(&location).cloned() {
                if placed.owner == self.player_id {
                    if self.item_handling & RECEIVE_OWN_ITEMS == 0 {
                        continue;
                    }
                    let item = NetworkItem {
                        item: self
                            .own_items
                            .get(strip_discriminator(&placed.name))
                            .copied()
                            .unwrap_or_default(),
                        location,
                        player: self.player_id + 1,
                        flags: 0,
                    };
                    let index = self.savefile.add_sent_item(&item)?;
                    out.push(Outgoing::Ap(ServerMessage::ReceivedItems {
                        index,
                        items: vec![item],
                    }));
                } else {
                    self.savefile.add_unconfirmed_item(
                        LABEL_MULTIWORLD_ITEM,
                        &placed.name,
                        placed.owner,
                    )?;
                    out.push(Outgoing::Mw(Message::DataSend {
                        label: LABEL_MULTIWORLD_ITEM.to_string(),
                        content: placed.name,
                        to: placed.owner,
                        ttl: SENT_ITEM_TTL,
                    }));
                }
            } else {
                if self.item_handling & RECEIVE_OWN_ITEMS == 0 {
                    continue;
                }
                let Some(tuple) = self.own_placement_tuples.get(&location) else {
                    continue;
                };
                if tuple.len() < 3 {
                    continue;
                }
                let item = NetworkItem {
                    item: tuple[0],
                    location,
                    player: self.player_id + 1,
                    flags: tuple[2] as i32,
                };
                let index = self.savefile.add_sent_item(&item)?;
                out.push(Outgoing::Ap(ServerMessage::ReceivedItems {
                    index,
                    items: vec![item],
                }));
            }
            self.savefile.clear_location(location)?;
        }
        Ok(out)
    }

    // Translates one incoming MW item; `None` when the message is dropped
    // (bad label, out-of-range world, or already delivered).
    fn receive_item(
        &mut self,
        label: &str,
        content: &str,
        from: &str,
        from_id: i32,
    ) -> Result<Option<(i64, NetworkItem)>, SavefileError> {
        if label != LABEL_MULTIWORLD_ITEM {
            warn!("unknown label for received item: {label:?}");
            return Ok(None);
        }
        if from_id < 0 || from_id as usize >= self.games.len() {
            warn!("invalid sender id: {from_id}");
            return Ok(None);
        }
        if self.savefile.has_received_item(label, content)? {
            info!("ignoring duplicate item {content:?} from {from:?}");
            return Ok(None);
        }

        let item_id = self
            .own_items
            .get(strip_discriminator(content))
            .copied()
            .unwrap_or_default();
        let location_id = match self.savefile.location_of_own_item(content) {
            Ok((location, _)) => self
                .synth_packages
                .get(&self.games[from_id as usize])
                .and_then(|package| package.location_name_to_id.get(&location))
                .copied()
                .unwrap_or_default(),
            Err(SavefileError::ZeroRows) => 0,
            Err(err) => return Err(err),
        };

        let item = NetworkItem {
            item: item_id,
            location: location_id,
            player: from_id + 1,
            flags: 0,
        };
        let index = self.savefile.add_sent_item(&item)?;
        self.savefile.add_received_item(label, content)?;
        Ok(Some((index, item)))
    }

    fn synth_item_id(&self, placed: &PlacedItem) -> i64 {
        let Some(pretty_name) = self.pretty.get(&placed.name) else {
            return 0;
        };
        let Some(game) = self.games.get(placed.owner as usize) else {
            return 0;
        };
        self.synth_packages
            .get(game)
            .and_then(|package| package.item_name_to_id.get(pretty_name))
            .copied()
            .unwrap_or_default()
    }
}

/// Validates that the seed carries exactly one slot and returns its id.
pub fn single_slot(data: &ApData) -> anyhow::Result<i64> {
    let mut slots = data.slot_info.keys();
    match (slots.next(), slots.next()) {
        (Some(id), None) => Ok(*id),
        _ => anyhow::bail!(
            ".archipelago contains {} slots, expected only one",
            data.slot_info.len()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apfile::{ApGameData, ApSlot};
    use mwbridge_core::mwproto::{DataReceiveEntry, Placement, ResultMessage, SpoilerLogs};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    static NEXT_DB: AtomicU32 = AtomicU32::new(0);

    fn temp_db() -> PathBuf {
        let n = NEXT_DB.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "mwbridge-session-test-{}-{n}.sqlite3",
            std::process::id()
        ))
    }

    fn sample_result() -> ResultMessage {
        let mut placements = BTreeMap::new();
        placements.insert(
            MAIN_ITEM_GROUP.to_string(),
            vec![
                // My location 10 hosts peer's Gem.
                Placement {
                    item: "MW(1)_Gem_(0)".to_string(),
                    location: "Spot_(10)".to_string(),
                },
                // My location 12 hosts my own Rock2.
                Placement {
                    item: "MW(0)_Rock2_(2)".to_string(),
                    location: "Elsewhere_(12)".to_string(),
                },
            ],
        );
        let mut own_items = BTreeMap::new();
        own_items.insert("Rock_(1)".to_string(), "MW(1)_Lair_(5)".to_string());
        own_items.insert("Rock2_(2)".to_string(), "MW(0)_Elsewhere_(12)".to_string());
        ResultMessage {
            player_id: 0,
            rando_id: 0x7777_7777,
            nicknames: vec!["me".to_string(), "peer".to_string()],
            ready_metadata: vec![vec![], vec![]],
            items_spoiler: SpoilerLogs::default(),
            placements,
            player_items_placements: own_items,
            generated_hash: "HASH".to_string(),
        }
    }

    fn sample_apdata() -> ApData {
        let mut data = ApData {
            seed_name: "seed".to_string(),
            version: vec![0, 5, 1],
            tags: vec!["AP".to_string()],
            ..ApData::default()
        };
        data.connect_names.insert("me".to_string(), vec![0, 1]);
        let mut package = ApGameData {
            checksum: "own-checksum".to_string(),
            original: json!({
                "item_name_to_id": {"Rock": 7, "Rock2": 8, "Gem": 9},
                "item_name_groups": {"Everything": ["Rock"]},
            }),
            ..ApGameData::default()
        };
        package.item_name_to_id.insert("Rock".to_string(), 7);
        package.item_name_to_id.insert("Rock2".to_string(), 8);
        package.item_name_to_id.insert("Gem".to_string(), 9);
        package.location_name_to_id.insert("Spot".to_string(), 10);
        package.location_name_to_id.insert("Elsewhere".to_string(), 12);
        package.location_name_to_id.insert("Hidden".to_string(), 13);
        data.datapackage.insert("HK".to_string(), package);
        data.slot_info.insert(
            1,
            ApSlot {
                name: "me".to_string(),
                game: "HK".to_string(),
                type_code: 1,
                group_members: Vec::new(),
            },
        );
        data.slot_data.insert(1, json!({"a": 1}));
        // Location 13 is not part of the multiworld mix; the seed's own
        // placement tuple (item, player, flags) is the fallback.
        let mut own = HashMap::new();
        own.insert(13, vec![7, 1, 1]);
        data.locations.insert(1, own);
        data
    }

    fn new_session() -> Session {
        let path = temp_db();
        let _ = std::fs::remove_file(&path);
        Savefile::create(&path, &sample_result(), MAIN_ITEM_GROUP).unwrap();
        let savefile = Savefile::open(&path).unwrap();
        Session::new(savefile, &sample_apdata()).unwrap()
    }

    fn connect(session: &mut Session, items_handling: Option<i32>) -> Vec<Outgoing> {
        session
            .handle_ap(ClientMessage::Connect {
                password: None,
                game: "HK".to_string(),
                name: "me".to_string(),
                uuid: json!(1),
                version: None,
                items_handling,
                tags: vec![],
                slot_data: true,
            })
            .unwrap()
    }

    fn received_items(out: &[Outgoing]) -> Option<(i64, Vec<NetworkItem>)> {
        out.iter().find_map(|msg| match msg {
            Outgoing::Ap(ServerMessage::ReceivedItems { index, items }) => {
                Some((*index, items.clone()))
            }
            _ => None,
        })
    }

    #[test]
    fn synthesized_packages_use_dense_ids() {
        let session = new_session();
        let peer = &session.synth_packages["peer's World"];
        assert_eq!(peer.item_name_to_id["Gem"], 1);
        assert_eq!(peer.location_name_to_id["Lair_(5)"], 1);
        assert!(!peer.checksum.is_empty());
        assert_eq!(session.checksums[0], "own-checksum");
        assert_eq!(session.checksums[1], peer.checksum);
        assert_eq!(session.games, vec!["HK", "peer's World"]);
    }

    #[test]
    fn duplicate_delivery_is_applied_once() {
        let mut session = new_session();
        let receive = Message::DataReceive {
            label: LABEL_MULTIWORLD_ITEM.to_string(),
            content: "Rock_(1)".to_string(),
            from: "peer".to_string(),
            from_id: 1,
        };
        let out = session.handle_mw(receive.clone()).unwrap();
        let (index, items) = received_items(&out).expect("items delivered");
        assert_eq!(index, 0);
        assert_eq!(
            items,
            vec![NetworkItem {
                item: 7,
                location: 1,
                player: 2,
                flags: 0,
            }]
        );
        assert!(out.iter().any(|msg| matches!(
            msg,
            Outgoing::Mw(Message::DataReceiveConfirm { .. })
        )));
        assert!(out.iter().any(|msg| matches!(msg, Outgoing::Mw(Message::Save))));

        // The same (label, content) again produces nothing at all.
        let replayed = session.handle_mw(receive).unwrap();
        assert!(replayed.is_empty());
        assert_eq!(session.savefile.sent_items().unwrap().len(), 1);
    }

    #[test]
    fn connect_replays_history_from_index_zero() {
        let mut session = new_session();
        session
            .handle_mw(Message::DataReceive {
                label: LABEL_MULTIWORLD_ITEM.to_string(),
                content: "Rock_(1)".to_string(),
                from: "peer".to_string(),
                from_id: 1,
            })
            .unwrap();

        let out = connect(&mut session, Some(RECEIVE_OTHERS_ITEMS));
        assert!(matches!(out[0], Outgoing::Mw(Message::Join { .. })));
        let connected = out
            .iter()
            .find_map(|msg| match msg {
                Outgoing::Ap(ServerMessage::Connected {
                    slot,
                    missing_locations,
                    checked_locations,
                    slot_data,
                    ..
                }) => Some((*slot, missing_locations.clone(), checked_locations.clone(), slot_data.clone())),
                _ => None,
            })
            .expect("connected");
        assert_eq!(connected.0, 1);
        assert_eq!(connected.1, vec![10, 12, 13]);
        assert!(connected.2.is_empty());
        assert_eq!(connected.3, Some(json!({"a": 1})));

        let (index, items) = received_items(&out).expect("history replay");
        assert_eq!(index, 0);
        assert_eq!(items.len(), 1);

        // A second connect replays the same history again.
        let again = connect(&mut session, None);
        let (index, items) = received_items(&again).expect("history replay");
        assert_eq!(index, 0);
        assert_eq!(items.len(), 1);
        assert_eq!(session.item_handling, RECEIVE_OTHERS_ITEMS);
    }

    #[test]
    fn checking_own_location_with_own_item_delivers_locally() {
        let mut session = new_session();
        connect(&mut session, Some(RECEIVE_OTHERS_ITEMS | RECEIVE_OWN_ITEMS));

        let out = session
            .handle_ap(ClientMessage::LocationChecks {
                locations: vec![12],
            })
            .unwrap();
        assert!(!out.iter().any(|msg| matches!(msg, Outgoing::Mw(_))));
        let (index, items) = received_items(&out).expect("own item delivered");
        assert_eq!(index, 0);
        assert_eq!(
            items,
            vec![NetworkItem {
                item: 8,
                location: 12,
                player: 1,
                flags: 0,
            }]
        );
        assert!(session.savefile.is_location_cleared(12).unwrap());
    }

    #[test]
    fn checking_foreign_location_forwards_to_mw() {
        let mut session = new_session();
        connect(&mut session, Some(RECEIVE_OTHERS_ITEMS | RECEIVE_OWN_ITEMS));

        let out = session
            .handle_ap(ClientMessage::LocationChecks {
                locations: vec![10],
            })
            .unwrap();
        assert!(received_items(&out).is_none());
        assert_eq!(
            out,
            vec![Outgoing::Mw(Message::DataSend {
                label: LABEL_MULTIWORLD_ITEM.to_string(),
                content: "Gem_(0)".to_string(),
                to: 1,
                ttl: SENT_ITEM_TTL,
            })]
        );
        assert!(session.savefile.is_location_cleared(10).unwrap());
        assert_eq!(session.savefile.unconfirmed_items().unwrap().len(), 1);

        // Checking the same location again is a no-op.
        let again = session
            .handle_ap(ClientMessage::LocationChecks {
                locations: vec![10],
            })
            .unwrap();
        assert!(again.is_empty());
        assert_eq!(session.savefile.unconfirmed_items().unwrap().len(), 1);
    }

    #[test]
    fn join_confirm_resubmits_unconfirmed_queue() {
        let mut session = new_session();
        connect(&mut session, Some(RECEIVE_OTHERS_ITEMS));
        session
            .handle_ap(ClientMessage::LocationChecks {
                locations: vec![10],
            })
            .unwrap();

        let out = session.handle_mw(Message::JoinConfirm).unwrap();
        assert_eq!(
            out,
            vec![Outgoing::Mw(Message::DataSend {
                label: LABEL_MULTIWORLD_ITEM.to_string(),
                content: "Gem_(0)".to_string(),
                to: 1,
                ttl: SENT_ITEM_TTL,
            })]
        );

        // Confirmation drains the queue; a second confirmation is logged
        // but harmless.
        session
            .handle_mw(Message::DataSendConfirm {
                label: LABEL_MULTIWORLD_ITEM.to_string(),
                content: "Gem_(0)".to_string(),
                to: 1,
            })
            .unwrap();
        assert!(session.handle_mw(Message::JoinConfirm).unwrap().is_empty());
    }

    #[test]
    fn scouts_report_synth_and_fallback_items() {
        let mut session = new_session();
        connect(&mut session, Some(RECEIVE_OTHERS_ITEMS));
        let out = session
            .handle_ap(ClientMessage::LocationScouts {
                locations: vec![10, 13],
                create_as_hint: 0,
            })
            .unwrap();
        let Some(Outgoing::Ap(ServerMessage::LocationInfo { locations })) = out.first() else {
            panic!("expected location info, got {out:?}");
        };
        assert_eq!(
            locations,
            &vec![
                // Peer's Gem at my location 10, as its synth id.
                NetworkItem {
                    item: 1,
                    location: 10,
                    player: 2,
                    flags: 0,
                },
                // Location 13 falls back to the seed's own placement tuple.
                NetworkItem {
                    item: 7,
                    location: 13,
                    player: 1,
                    flags: 1,
                },
            ]
        );
    }

    #[test]
    fn batched_deliveries_share_one_receiveditems() {
        let mut session = new_session();
        // Rock2 was already delivered once, so the batch half-applies.
        session
            .handle_mw(Message::DataReceive {
                label: LABEL_MULTIWORLD_ITEM.to_string(),
                content: "Rock2_(2)".to_string(),
                from: "peer".to_string(),
                from_id: 1,
            })
            .unwrap();

        let out = session
            .handle_mw(Message::DatasReceive {
                datas: vec![
                    DataReceiveEntry {
                        label: LABEL_MULTIWORLD_ITEM.to_string(),
                        content: "Rock2_(2)".to_string(),
                        from: "peer".to_string(),
                        from_id: 1,
                    },
                    DataReceiveEntry {
                        label: LABEL_MULTIWORLD_ITEM.to_string(),
                        content: "Rock_(1)".to_string(),
                        from: "peer".to_string(),
                        from_id: 1,
                    },
                ],
            })
            .unwrap();
        let (index, items) = received_items(&out).expect("fresh item applied");
        assert_eq!(index, 1, "first newly-assigned index");
        assert_eq!(items.len(), 1);
        assert!(out.iter().any(|msg| matches!(
            msg,
            Outgoing::Mw(Message::DatasReceiveConfirm { count: 2 })
        )));
    }

    #[test]
    fn data_storage_set_get_roundtrip() {
        let mut session = new_session();
        let out = session
            .handle_ap(ClientMessage::Set {
                key: "counter".to_string(),
                default: json!(0),
                want_reply: true,
                operations: vec![approto::DataStorageOperation {
                    operation: "add".to_string(),
                    value: json!(5),
                }],
            })
            .unwrap();
        assert_eq!(
            out,
            vec![Outgoing::Ap(ServerMessage::SetReply {
                key: "counter".to_string(),
                value: json!(5.0),
                original_value: json!(0),
                slot: 0,
            })]
        );

        let out = session
            .handle_ap(ClientMessage::Get {
                keys: vec!["counter".to_string(), "_read_race_mode".to_string()],
                rest: Map::new(),
            })
            .unwrap();
        let Some(Outgoing::Ap(ServerMessage::Retrieved { keys, .. })) = out.first() else {
            panic!("expected retrieved, got {out:?}");
        };
        assert_eq!(keys["counter"], json!(5.0));
        assert_eq!(keys["_read_race_mode"], json!(0));
    }

    #[test]
    fn read_only_keys_reject_writes() {
        let mut session = new_session();
        let out = session
            .handle_ap(ClientMessage::Set {
                key: "_read_race_mode".to_string(),
                default: json!(0),
                want_reply: true,
                operations: vec![approto::DataStorageOperation {
                    operation: "replace".to_string(),
                    value: json!(1),
                }],
            })
            .unwrap();
        assert!(out.is_empty());
        // The snapshot value is unchanged.
        let out = session
            .handle_ap(ClientMessage::Get {
                keys: vec!["_read_race_mode".to_string()],
                rest: Map::new(),
            })
            .unwrap();
        let Some(Outgoing::Ap(ServerMessage::Retrieved { keys, .. })) = out.first() else {
            panic!("expected retrieved");
        };
        assert_eq!(keys["_read_race_mode"], json!(0));
    }

    #[test]
    fn watched_keys_trigger_unsolicited_replies() {
        let mut session = new_session();
        session
            .handle_ap(ClientMessage::SetNotify {
                keys: vec!["score".to_string()],
            })
            .unwrap();
        let out = session
            .handle_ap(ClientMessage::Set {
                key: "score".to_string(),
                default: json!(0),
                want_reply: false,
                operations: vec![approto::DataStorageOperation {
                    operation: "replace".to_string(),
                    value: json!(3),
                }],
            })
            .unwrap();
        assert!(matches!(
            out.first(),
            Some(Outgoing::Ap(ServerMessage::SetReply { .. }))
        ));
    }

    #[test]
    fn own_data_package_is_served_verbatim() {
        let mut session = new_session();
        let out = session
            .handle_ap(ClientMessage::GetDataPackage { games: None })
            .unwrap();
        let Some(Outgoing::Ap(ServerMessage::DataPackage { data })) = out.first() else {
            panic!("expected data package");
        };
        assert_eq!(data.games["HK"]["item_name_to_id"]["Rock"], json!(7));
        assert_eq!(data.games["peer's World"]["item_name_to_id"]["Gem"], json!(1));
        assert!(data.games["peer's World"]["checksum"].as_str().is_some());
    }

    #[test]
    fn item_to_unknown_location_still_delivers_with_zero_location() {
        let mut session = new_session();
        // "Rock2" is known, but peer 1's synth package has no location for
        // it (it lives in my own world), so the location id defaults.
        let out = session
            .handle_mw(Message::DataReceive {
                label: LABEL_MULTIWORLD_ITEM.to_string(),
                content: "Rock2_(2)".to_string(),
                from: "peer".to_string(),
                from_id: 1,
            })
            .unwrap();
        let (_, items) = received_items(&out).expect("delivered");
        assert_eq!(items[0].item, 8);
        assert_eq!(items[0].location, 0);
    }

    #[test]
    fn bad_labels_and_ranges_are_dropped() {
        let mut session = new_session();
        let out = session
            .handle_mw(Message::DataReceive {
                label: "Other-Label".to_string(),
                content: "Rock_(1)".to_string(),
                from: "peer".to_string(),
                from_id: 1,
            })
            .unwrap();
        assert!(out.is_empty());
        let out = session
            .handle_mw(Message::DataReceive {
                label: LABEL_MULTIWORLD_ITEM.to_string(),
                content: "Rock_(1)".to_string(),
                from: "peer".to_string(),
                from_id: 7,
            })
            .unwrap();
        assert!(out.is_empty());
        assert!(session.savefile.sent_items().unwrap().is_empty());
    }
}
