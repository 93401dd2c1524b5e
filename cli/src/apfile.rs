//! The `.archipelago` seed loader.
//!
//! The container is a single version byte followed by a zlib-compressed
//! pickle stream. Pickle decoding itself is delegated to `serde-pickle`;
//! this module owns the envelope and the binding from the decoded value tree
//! to the typed record the rest of the bridge consumes. Dict keys follow the
//! generator's snake_case naming.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde_json::Value as JsonValue;
use serde_pickle::{HashableValue, Value};

const EXPECTED_AP_FILE_VERSION: u8 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ApFileError {
    #[error("read .archipelago: {0}")]
    Io(#[from] std::io::Error),
    #[error(".archipelago file is version {0}, expected {EXPECTED_AP_FILE_VERSION}")]
    BadVersion(u8),
    #[error("decode .archipelago: {0}")]
    Pickle(#[from] serde_pickle::Error),
    #[error("bind .archipelago: {0}")]
    Bind(String),
}

#[derive(Debug, Clone, Default)]
pub struct ApData {
    pub connect_names: HashMap<String, Vec<i64>>,
    pub spheres: Vec<HashMap<i64, Vec<i64>>>,
    pub locations: HashMap<i64, HashMap<i64, Vec<i64>>>,
    pub datapackage: HashMap<String, ApGameData>,
    pub slot_info: HashMap<i64, ApSlot>,
    pub slot_data: HashMap<i64, JsonValue>,
    pub version: Vec<i64>,
    pub tags: Vec<String>,
    pub server_options: ApServerOptions,
    pub seed_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct ApGameData {
    pub item_name_to_id: HashMap<String, i64>,
    pub location_name_to_id: HashMap<String, i64>,
    pub checksum: String,
    /// The game's data package exactly as the generator wrote it; served
    /// verbatim to the local player's client.
    pub original: JsonValue,
}

#[derive(Debug, Clone, Default)]
pub struct ApSlot {
    pub name: String,
    pub game: String,
    pub type_code: i64,
    pub group_members: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ApServerOptions {
    pub location_check_points: i64,
    pub hint_cost: i64,
    pub release_mode: String,
    pub collect_mode: String,
    pub remaining_mode: String,
}

pub fn load(path: &Path) -> Result<ApData, ApFileError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != EXPECTED_AP_FILE_VERSION {
        return Err(ApFileError::BadVersion(version[0]));
    }
    let mut decoder = flate2::bufread::ZlibDecoder::new(reader);
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;
    let value = serde_pickle::value_from_slice(&raw, serde_pickle::DeOptions::new())?;
    bind_apdata(&value)
}

fn bind_apdata(value: &Value) -> Result<ApData, ApFileError> {
    let top = as_dict(value, "multidata")?;

    let mut data = ApData {
        seed_name: as_string(require(top, "seed_name")?, "seed_name")?,
        ..ApData::default()
    };

    for (game, ids) in as_dict(require(top, "connect_names")?, "connect_names")? {
        data.connect_names
            .insert(key_string(game)?, as_i64_list(ids, "connect_names")?);
    }

    for sphere in as_list(require(top, "spheres")?, "spheres")? {
        let mut bound = HashMap::new();
        for (slot, locations) in as_dict(sphere, "spheres")? {
            bound.insert(key_i64(slot)?, as_i64_list(locations, "spheres")?);
        }
        data.spheres.push(bound);
    }

    for (slot, placements) in as_dict(require(top, "locations")?, "locations")? {
        let mut bound = HashMap::new();
        for (location, tuple) in as_dict(placements, "locations")? {
            bound.insert(key_i64(location)?, as_i64_list(tuple, "locations")?);
        }
        data.locations.insert(key_i64(slot)?, bound);
    }

    for (game, package) in as_dict(require(top, "datapackage")?, "datapackage")? {
        data.datapackage
            .insert(key_string(game)?, bind_game_data(package)?);
    }

    for (slot, info) in as_dict(require(top, "slot_info")?, "slot_info")? {
        data.slot_info.insert(key_i64(slot)?, bind_slot(info)?);
    }

    for (slot, payload) in as_dict(require(top, "slot_data")?, "slot_data")? {
        data.slot_data.insert(key_i64(slot)?, to_json(payload));
    }

    data.version = as_i64_list(require(top, "version")?, "version")?;
    for tag in as_list(require(top, "tags")?, "tags")? {
        data.tags.push(as_string(tag, "tags")?);
    }

    let options = as_dict(require(top, "server_options")?, "server_options")?;
    data.server_options = ApServerOptions {
        location_check_points: as_i64(require(options, "location_check_points")?, "server_options")?,
        hint_cost: as_i64(require(options, "hint_cost")?, "server_options")?,
        release_mode: as_string(require(options, "release_mode")?, "server_options")?,
        collect_mode: as_string(require(options, "collect_mode")?, "server_options")?,
        remaining_mode: as_string(require(options, "remaining_mode")?, "server_options")?,
    };

    Ok(data)
}

fn bind_game_data(value: &Value) -> Result<ApGameData, ApFileError> {
    let dict = as_dict(value, "datapackage entry")?;
    let mut package = ApGameData {
        checksum: as_string(require(dict, "checksum")?, "checksum")?,
        original: to_json(value),
        ..ApGameData::default()
    };
    for (name, id) in as_dict(require(dict, "item_name_to_id")?, "item_name_to_id")? {
        package
            .item_name_to_id
            .insert(key_string(name)?, as_i64(id, "item_name_to_id")?);
    }
    for (name, id) in as_dict(require(dict, "location_name_to_id")?, "location_name_to_id")? {
        package
            .location_name_to_id
            .insert(key_string(name)?, as_i64(id, "location_name_to_id")?);
    }
    Ok(package)
}

fn bind_slot(value: &Value) -> Result<ApSlot, ApFileError> {
    let dict = as_dict(value, "slot_info entry")?;
    let type_code = match require(dict, "type")? {
        Value::I64(n) => *n,
        other => match as_dict(other, "slot type") {
            Ok(inner) => as_i64(require(inner, "code")?, "slot type")?,
            Err(_) => return Err(ApFileError::Bind("unsupported slot type".to_string())),
        },
    };
    let mut slot = ApSlot {
        name: as_string(require(dict, "name")?, "slot name")?,
        game: as_string(require(dict, "game")?, "slot game")?,
        type_code,
        group_members: Vec::new(),
    };
    if let Some(members) = lookup(dict, "group_members") {
        for member in as_list(members, "group_members")? {
            slot.group_members.push(as_string(member, "group_members")?);
        }
    }
    Ok(slot)
}

type Dict = std::collections::BTreeMap<HashableValue, Value>;

fn as_dict<'a>(value: &'a Value, what: &str) -> Result<&'a Dict, ApFileError> {
    match value {
        Value::Dict(dict) => Ok(dict),
        other => Err(ApFileError::Bind(format!("{what}: expected dict, got {other:?}"))),
    }
}

fn as_list<'a>(value: &'a Value, what: &str) -> Result<&'a [Value], ApFileError> {
    match value {
        Value::List(list) | Value::Tuple(list) => Ok(list),
        other => Err(ApFileError::Bind(format!("{what}: expected list, got {other:?}"))),
    }
}

fn as_i64(value: &Value, what: &str) -> Result<i64, ApFileError> {
    match value {
        Value::I64(n) => Ok(*n),
        Value::Int(big) => big
            .to_string()
            .parse()
            .map_err(|_| ApFileError::Bind(format!("{what}: integer out of range"))),
        other => Err(ApFileError::Bind(format!("{what}: expected int, got {other:?}"))),
    }
}

// Accepts lists, tuples and sets; the generator uses all three for id
// collections. Sets come out in sorted order.
fn as_i64_list(value: &Value, what: &str) -> Result<Vec<i64>, ApFileError> {
    match value {
        Value::List(items) | Value::Tuple(items) => {
            items.iter().map(|v| as_i64(v, what)).collect()
        }
        Value::Set(items) | Value::FrozenSet(items) => items
            .iter()
            .map(|v| match v {
                HashableValue::I64(n) => Ok(*n),
                other => Err(ApFileError::Bind(format!(
                    "{what}: expected int, got {other:?}"
                ))),
            })
            .collect(),
        other => Err(ApFileError::Bind(format!(
            "{what}: expected list, got {other:?}"
        ))),
    }
}

fn as_string(value: &Value, what: &str) -> Result<String, ApFileError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(ApFileError::Bind(format!("{what}: expected string, got {other:?}"))),
    }
}

fn lookup<'a>(dict: &'a Dict, key: &str) -> Option<&'a Value> {
    dict.get(&HashableValue::String(key.to_string()))
}

fn require<'a>(dict: &'a Dict, key: &str) -> Result<&'a Value, ApFileError> {
    lookup(dict, key).ok_or_else(|| ApFileError::Bind(format!("key {key} not found")))
}

fn key_string(key: &HashableValue) -> Result<String, ApFileError> {
    match key {
        HashableValue::String(s) => Ok(s.clone()),
        other => Err(ApFileError::Bind(format!("expected string key, got {other:?}"))),
    }
}

fn key_i64(key: &HashableValue) -> Result<i64, ApFileError> {
    match key {
        HashableValue::I64(n) => Ok(*n),
        other => Err(ApFileError::Bind(format!("expected int key, got {other:?}"))),
    }
}

// Converts a pickle value tree to JSON for payloads that are passed through
// opaquely (slot data, original data packages).
fn to_json(value: &Value) -> JsonValue {
    match value {
        Value::None => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::I64(n) => JsonValue::from(*n),
        Value::Int(big) => big
            .to_string()
            .parse::<i64>()
            .map(JsonValue::from)
            .unwrap_or_else(|_| JsonValue::String(big.to_string())),
        Value::F64(x) => serde_json::Number::from_f64(*x)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Value::Bytes(bytes) => JsonValue::String(String::from_utf8_lossy(bytes).into_owned()),
        Value::String(s) => JsonValue::String(s.clone()),
        Value::List(items) | Value::Tuple(items) => {
            JsonValue::Array(items.iter().map(to_json).collect())
        }
        Value::Set(items) | Value::FrozenSet(items) => {
            JsonValue::Array(items.iter().map(hashable_to_json).collect())
        }
        Value::Dict(entries) => {
            let mut map = serde_json::Map::new();
            for (k, v) in entries {
                map.insert(hashable_key_string(k), to_json(v));
            }
            JsonValue::Object(map)
        }
    }
}

fn hashable_to_json(value: &HashableValue) -> JsonValue {
    match value {
        HashableValue::None => JsonValue::Null,
        HashableValue::Bool(b) => JsonValue::Bool(*b),
        HashableValue::I64(n) => JsonValue::from(*n),
        HashableValue::Int(big) => big
            .to_string()
            .parse::<i64>()
            .map(JsonValue::from)
            .unwrap_or_else(|_| JsonValue::String(big.to_string())),
        HashableValue::F64(x) => serde_json::Number::from_f64(*x)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        HashableValue::Bytes(bytes) => JsonValue::String(String::from_utf8_lossy(bytes).into_owned()),
        HashableValue::String(s) => JsonValue::String(s.clone()),
        HashableValue::Tuple(items) => JsonValue::Array(items.iter().map(hashable_to_json).collect()),
        HashableValue::FrozenSet(items) => {
            JsonValue::Array(items.iter().map(hashable_to_json).collect())
        }
    }
}

fn hashable_key_string(key: &HashableValue) -> String {
    match key {
        HashableValue::String(s) => s.clone(),
        other => hashable_to_json(other).to_string(),
    }
}
