//! The multiworld wire protocol: message catalog, binary codec and client
//! transport.
//!
//! Every message travels in a frame of
//! `len:u32le | type:u32le | sender_uid:u64le | message_id:u64le | payload`,
//! where `len` counts the whole frame including itself. `sender_uid` and
//! `message_id` are ignored on input and zeroed on output. Payload fields are
//! encoded in declaration order: `u8` raw, `i32`/`u32` little-endian,
//! strings as a 7-bit varint length followed by UTF-8 bytes, and everything
//! else as varint-length-prefixed JSON.

pub mod client;
pub mod names;
pub mod wire;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use wire::{read_message, write_message, WireError};

/// Label attached to item payloads exchanged between worlds.
pub const LABEL_MULTIWORLD_ITEM: &str = "MultiWorld-Item";

/// A key/value pair as produced by C# tuple serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValuePair {
    #[serde(rename = "Item1")]
    pub key: String,
    #[serde(rename = "Item2")]
    pub value: String,
}

/// A single item-at-location assignment within one world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    #[serde(rename = "Item")]
    pub item: String,
    #[serde(rename = "Location")]
    pub location: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoilerLogs {
    #[serde(rename = "IndividualWorldSpoilers", default)]
    pub individual_world_spoilers: BTreeMap<String, String>,
    #[serde(rename = "FullOrderedItemsLog", default)]
    pub full_ordered_items_log: String,
}

/// The per-player outcome of a finished randomization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub player_id: i32,
    pub rando_id: i32,
    pub nicknames: Vec<String>,
    pub ready_metadata: Vec<Vec<KeyValuePair>>,
    pub items_spoiler: SpoilerLogs,
    pub placements: BTreeMap<String, Vec<Placement>>,
    pub player_items_placements: BTreeMap<String, String>,
    pub generated_hash: String,
}

/// Game options attached to `InitiateGame`. The algorithm selector is
/// polymorphic on the wire: older clients send the numeric enum value, newer
/// ones the variant name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameOptions {
    #[serde(rename = "RandomizationAlgorithm", default)]
    pub randomization_algorithm: AlgorithmChoice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AlgorithmChoice {
    Number(i64),
    Name(String),
}

impl AlgorithmChoice {
    pub fn is_default(&self) -> bool {
        match self {
            AlgorithmChoice::Number(n) => *n == 0,
            AlgorithmChoice::Name(name) => name == "Default",
        }
    }
}

impl Default for AlgorithmChoice {
    fn default() -> Self {
        AlgorithmChoice::Number(0)
    }
}

/// One element of a batched send toward another world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSendEntry {
    #[serde(rename = "Label")]
    pub label: String,
    #[serde(rename = "Content")]
    pub content: String,
    #[serde(rename = "To")]
    pub to: i32,
    #[serde(rename = "TTL")]
    pub ttl: i32,
}

/// One element of a batched delivery from another world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataReceiveEntry {
    #[serde(rename = "Label")]
    pub label: String,
    #[serde(rename = "Content")]
    pub content: String,
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "FromID")]
    pub from_id: i32,
}

/// Every message the protocol defines. Type codes are fixed by the catalog;
/// new codes append, never reorder.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Connect {
        server_name: String,
    },
    Disconnect,
    Join {
        display_name: String,
        player_id: i32,
        rando_id: i32,
    },
    JoinConfirm,
    DataReceive {
        label: String,
        content: String,
        from: String,
        from_id: i32,
    },
    DataReceiveConfirm {
        label: String,
        data: String,
        from: String,
    },
    DataSend {
        label: String,
        content: String,
        to: i32,
        ttl: i32,
    },
    DataSendConfirm {
        label: String,
        content: String,
        to: i32,
    },
    ReadyConfirm {
        ready: i32,
        names: Vec<String>,
    },
    ReadyDeny {
        description: String,
    },
    Ping,
    Ready {
        room: String,
        nickname: String,
        mode: u8,
        ready_metadata: Vec<KeyValuePair>,
    },
    Result(ResultMessage),
    Save,
    RandoGenerated {
        items: BTreeMap<String, Vec<Placement>>,
        seed: i64,
    },
    Unready,
    InitiateGame {
        options: GameOptions,
    },
    RequestRando,
    AnnounceCharmNotchCosts {
        player_id: i32,
        notch_costs: BTreeMap<i32, i32>,
    },
    RequestCharmNotchCosts,
    ConfirmCharmNotchCostsReceived {
        player_id: i32,
    },
    DatasSend {
        datas: Vec<DataSendEntry>,
    },
    DatasSendConfirm {
        count: i32,
    },
    InitiateSyncGame {
        settings: Value,
    },
    ApplySettings {
        settings: Value,
    },
    RequestSettings,
    ISReady,
    DatasReceive {
        datas: Vec<DataReceiveEntry>,
    },
    DatasReceiveConfirm {
        count: i32,
    },
    ConnectedPlayersChanged {
        players: BTreeMap<i32, String>,
    },
}

impl Message {
    pub fn type_code(&self) -> u32 {
        match self {
            Message::Connect { .. } => 2,
            Message::Disconnect => 3,
            Message::Join { .. } => 4,
            Message::JoinConfirm => 5,
            Message::DataReceive { .. } => 6,
            Message::DataReceiveConfirm { .. } => 7,
            Message::DataSend { .. } => 8,
            Message::DataSendConfirm { .. } => 9,
            Message::ReadyConfirm { .. } => 10,
            Message::ReadyDeny { .. } => 11,
            Message::Ping => 12,
            Message::Ready { .. } => 13,
            Message::Result(_) => 14,
            Message::Save => 15,
            Message::RandoGenerated { .. } => 16,
            Message::Unready => 17,
            Message::InitiateGame { .. } => 18,
            Message::RequestRando => 19,
            Message::AnnounceCharmNotchCosts { .. } => 20,
            Message::RequestCharmNotchCosts => 21,
            Message::ConfirmCharmNotchCostsReceived { .. } => 22,
            Message::DatasSend { .. } => 23,
            Message::DatasSendConfirm { .. } => 24,
            Message::InitiateSyncGame { .. } => 25,
            Message::ApplySettings { .. } => 26,
            Message::RequestSettings => 27,
            Message::ISReady => 28,
            Message::DatasReceive { .. } => 29,
            Message::DatasReceiveConfirm { .. } => 30,
            Message::ConnectedPlayersChanged { .. } => 31,
        }
    }
}
