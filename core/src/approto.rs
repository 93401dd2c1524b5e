//! The Archipelago-compatible JSON surface.
//!
//! Every physical WebSocket frame carries a JSON array of message objects
//! discriminated by their `cmd` field. Field naming follows the AP wire
//! format, snake_case except where compatibility demands otherwise
//! (`hintCost`), and `Version` objects carry a mandatory `class` marker.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Keys with this prefix are served from the host snapshot and reject writes.
pub const READ_ONLY_KEY_PREFIX: &str = "_read_";

/// Items-handling flag: receive items placed in other worlds.
pub const RECEIVE_OTHERS_ITEMS: i32 = 0b001;
/// Items-handling flag: receive items placed in the client's own world.
pub const RECEIVE_OWN_ITEMS: i32 = 0b010;
/// Items-handling flag: receive the starting inventory.
pub const RECEIVE_STARTING_ITEMS: i32 = 0b100;

pub const CLIENT_STATUS_UNKNOWN: i32 = 0;
pub const SLOT_TYPE_PLAYER: i32 = 1;

/// The slot number the AP ecosystem reserves for the server itself.
pub const SERVER_SLOT: i32 = 0;
/// The location id the AP ecosystem uses for starting-inventory items.
pub const SERVER_LOCATION: i64 = -2;

pub const VERSION_NUMBER_SIZE: usize = 3;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Version {
    pub major: i64,
    pub minor: i64,
    pub build: i64,
    // The AP ecosystem requires this marker on every version object.
    pub class: String,
}

impl Version {
    pub fn new(nums: [i64; VERSION_NUMBER_SIZE]) -> Version {
        Version {
            major: nums[0],
            minor: nums[1],
            build: nums[2],
            class: "Version".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(pub i32);

pub const PERMISSION_DISABLED: Permission = Permission(0);
pub const PERMISSION_ENABLED: Permission = Permission(0b001);
pub const PERMISSION_GOAL: Permission = Permission(0b010);
pub const PERMISSION_AUTO: Permission = Permission(0b110);

/// Maps the textual modes found in server options onto the permission
/// bitfield; unknown modes fall back to enabled.
pub fn permission_for_mode(mode: &str) -> Permission {
    match mode {
        "disabled" => PERMISSION_DISABLED,
        "enabled" => PERMISSION_ENABLED,
        "auto" => PERMISSION_AUTO,
        "auto-enabled" => Permission(PERMISSION_AUTO.0 | PERMISSION_ENABLED.0),
        "goal" => PERMISSION_GOAL,
        _ => PERMISSION_ENABLED,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomPermissions {
    pub release: Permission,
    pub collect: Permission,
    pub remaining: Permission,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub version: Version,
    pub generator_version: Version,
    pub tags: Vec<String>,
    pub password: bool,
    pub permissions: RoomPermissions,
    #[serde(rename = "hintCost")]
    pub hint_cost: i64,
    pub location_check_points: i64,
    pub games: Vec<String>,
    pub data_package_checksums: Vec<String>,
    pub seed_name: String,
    /// Milliseconds since the epoch, stamped at send time.
    pub time: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataPackage {
    pub location_name_to_id: BTreeMap<String, i64>,
    pub item_name_to_id: BTreeMap<String, i64>,
    pub checksum: String,
}

impl DataPackage {
    /// Computes the checksum over the `checksum = ""` rendering and stores it.
    pub fn set_checksum(&mut self) {
        self.checksum = String::new();
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&encoded);
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            use std::fmt::Write;
            let _ = write!(out, "{byte:02x}");
        }
        self.checksum = out;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkItem {
    pub item: i64,
    pub location: i64,
    pub player: i32,
    pub flags: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkPlayer {
    pub team: i32,
    pub slot: i32,
    pub alias: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSlot {
    pub name: String,
    pub game: String,
    #[serde(rename = "type")]
    pub slot_type: i32,
    pub group_members: Vec<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataPackageContents {
    pub games: BTreeMap<String, Value>,
}

/// Messages the bridge sends to its AP client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum ServerMessage {
    RoomInfo(RoomInfo),
    DataPackage {
        data: DataPackageContents,
    },
    Connected {
        team: i32,
        slot: i32,
        players: Vec<NetworkPlayer>,
        slot_info: BTreeMap<i32, NetworkSlot>,
        missing_locations: Vec<i64>,
        checked_locations: Vec<i64>,
        hint_points: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        slot_data: Option<Value>,
    },
    ReceivedItems {
        index: i64,
        items: Vec<NetworkItem>,
    },
    SetReply {
        key: String,
        value: Value,
        original_value: Value,
        slot: i32,
    },
    Retrieved {
        keys: Map<String, Value>,
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    LocationInfo {
        locations: Vec<NetworkItem>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataStorageOperation {
    pub operation: String,
    #[serde(default)]
    pub value: Value,
}

/// Messages an AP client may send to the bridge. Unknown commands fail to
/// parse and are skipped by the server loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum ClientMessage {
    Connect {
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        game: String,
        #[serde(default)]
        name: String,
        // May be any JSON scalar.
        #[serde(default)]
        uuid: Value,
        #[serde(default)]
        version: Option<Version>,
        #[serde(default)]
        items_handling: Option<i32>,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default)]
        slot_data: bool,
    },
    GetDataPackage {
        #[serde(default)]
        games: Option<Vec<String>>,
    },
    Set {
        key: String,
        #[serde(default)]
        default: Value,
        #[serde(default)]
        want_reply: bool,
        #[serde(default)]
        operations: Vec<DataStorageOperation>,
    },
    SetNotify {
        keys: Vec<String>,
    },
    Get {
        keys: Vec<String>,
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    LocationScouts {
        locations: Vec<i64>,
        #[serde(default)]
        create_as_hint: i32,
    },
    LocationChecks {
        locations: Vec<i64>,
    },
    Sync {},
    Say {
        text: String,
    },
}
