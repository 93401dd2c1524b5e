//! The durable savefile backing one bridge session.
//!
//! Everything the bridge must survive a restart with lives here: the room's
//! roster and global data written once at setup, the at-least-once queues on
//! the multiworld side, and the append-only item log on the AP side. The
//! `item_index` column of `ap_sent_items` is relied on to form a dense
//! 1..N sequence; rows are never deleted and never conflict, which is the
//! regime where SQLite allocates rowids sequentially.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use mwbridge_core::approto::NetworkItem;
use mwbridge_core::mwproto::{names, ResultMessage};

#[derive(Debug, thiserror::Error)]
pub enum SavefileError {
    #[error("savefile: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("statement returned no rows")]
    ZeroRows,
    #[error("location without discriminator: {0}")]
    MissingDiscriminator(String),
    #[error("item without qualifier: {0}")]
    MissingQualifier(String),
}

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS locations_cleared (
    location_id INTEGER NOT NULL PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS mw_unconfirmed_sent_items (
    label TEXT NOT NULL,
    content TEXT NOT NULL,
    dest_player_id INTEGER NOT NULL,

    PRIMARY KEY (label, content, dest_player_id)
);

CREATE TABLE IF NOT EXISTS mw_received_items (
    label TEXT NOT NULL,
    content TEXT NOT NULL,

    PRIMARY KEY (label, content)
);

CREATE TABLE IF NOT EXISTS ap_sent_items (
    item_index INTEGER NOT NULL PRIMARY KEY,
    item_id INTEGER NOT NULL,
    location_id INTEGER NOT NULL,
    player_id INTEGER NOT NULL,
    flags INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS ap_data_storage (
    key TEXT NOT NULL,
    json_value TEXT NOT NULL,

    PRIMARY KEY (key)
);

CREATE TABLE IF NOT EXISTS mw_players (
    player_id INTEGER NOT NULL PRIMARY KEY,
    nickname TEXT NOT NULL,
    spoiler_log TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS mw_global_data (
    player_id INTEGER NOT NULL REFERENCES mw_players (player_id),
    rando_id INTEGER NOT NULL,
    full_spoiler_log TEXT NOT NULL,
    hash TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS mw_own_world_placements (
    ap_location_id INTEGER NOT NULL PRIMARY KEY,
    dest_player_id INTEGER NOT NULL REFERENCES mw_players (player_id),
    item_name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS mw_own_item_placements (
    item_name TEXT NOT NULL PRIMARY KEY,
    location_name TEXT NOT NULL,
    source_player_id INTEGER NOT NULL
);
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnWorldPlacement {
    pub ap_location_id: i64,
    pub item_name: String,
    pub dest_player_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnconfirmedItem {
    pub label: String,
    pub content: String,
    pub dest_player_id: i32,
}

pub struct Savefile {
    conn: Connection,
}

impl Savefile {
    pub fn open(path: &Path) -> Result<Savefile, SavefileError> {
        let conn = Connection::open(path)?;
        Ok(Savefile { conn })
    }

    /// Creates the savefile for a fresh multiworld result in one transaction.
    pub fn create(
        path: &Path,
        result: &ResultMessage,
        item_group: &str,
    ) -> Result<(), SavefileError> {
        let mut conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        let tx = conn.transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO mw_players (player_id, nickname, spoiler_log) VALUES (?, ?, ?)",
            )?;
            for (i, name) in result.nicknames.iter().enumerate() {
                let spoiler = result
                    .items_spoiler
                    .individual_world_spoilers
                    .get(name)
                    .map(String::as_str)
                    .unwrap_or_default();
                stmt.execute(params![i as i64, name, spoiler])?;
            }
        }

        tx.execute(
            "INSERT INTO mw_global_data (player_id, rando_id, full_spoiler_log, hash)
             VALUES (?, ?, ?, ?)",
            params![
                result.player_id,
                result.rando_id,
                result.items_spoiler.full_ordered_items_log,
                result.generated_hash,
            ],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO mw_own_world_placements (ap_location_id, dest_player_id, item_name)
                 VALUES (?, ?, ?)",
            )?;
            for p in result.placements.get(item_group).into_iter().flatten() {
                let loc_id = names::parse_discriminator(&p.location)
                    .ok_or_else(|| SavefileError::MissingDiscriminator(p.location.clone()))?;
                let (owner, item) = names::parse_qualified_name(&p.item)
                    .ok_or_else(|| SavefileError::MissingQualifier(p.item.clone()))?;
                stmt.execute(params![loc_id, owner, item])?;
            }
        }

        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO mw_own_item_placements
                 (item_name, location_name, source_player_id) VALUES (?, ?, ?)",
            )?;
            for (item, qualified_location) in &result.player_items_placements {
                let Some((source, location)) = names::parse_qualified_name(qualified_location)
                else {
                    warn!("own item {item:?} has unqualified location {qualified_location:?}");
                    continue;
                };
                let inserted = stmt.execute(params![item, location, source])?;
                if inserted == 0 {
                    // Identically-named items from different worlds collide
                    // on this key; the first writer wins.
                    warn!("duplicate own-item name {item:?}; keeping the first placement");
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    pub fn nicknames(&self) -> Result<Vec<String>, SavefileError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT nickname FROM mw_players ORDER BY player_id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn connection_params(&self) -> Result<(i32, i32), SavefileError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT player_id, rando_id FROM mw_global_data")?;
        stmt.query_row([], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?
            .ok_or(SavefileError::ZeroRows)
    }

    pub fn own_world_placements(&self) -> Result<Vec<OwnWorldPlacement>, SavefileError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT ap_location_id, item_name, dest_player_id
             FROM mw_own_world_placements ORDER BY ap_location_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(OwnWorldPlacement {
                ap_location_id: row.get(0)?,
                item_name: row.get(1)?,
                dest_player_id: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Where this world's own items ended up, ordered by location name so
    /// synthesized ids are reproducible.
    pub fn own_item_locations(&self) -> Result<Vec<(String, i32)>, SavefileError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT location_name, source_player_id
             FROM mw_own_item_placements ORDER BY location_name",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn location_of_own_item(&self, item_name: &str) -> Result<(String, i32), SavefileError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT location_name, source_player_id
             FROM mw_own_item_placements WHERE item_name = ?",
        )?;
        stmt.query_row([item_name], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?
            .ok_or(SavefileError::ZeroRows)
    }

    pub fn cleared_locations(&self) -> Result<Vec<i64>, SavefileError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT location_id FROM locations_cleared ORDER BY location_id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn is_location_cleared(&self, id: i64) -> Result<bool, SavefileError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT EXISTS(SELECT 1 FROM locations_cleared WHERE location_id = ?)")?;
        Ok(stmt.query_row([id], |row| row.get(0))?)
    }

    pub fn clear_location(&self, id: i64) -> Result<(), SavefileError> {
        let mut stmt = self
            .conn
            .prepare_cached("INSERT OR IGNORE INTO locations_cleared (location_id) VALUES (?)")?;
        stmt.execute([id])?;
        Ok(())
    }

    /// Appends to the sent-item log and returns the AP-visible index
    /// (`item_index - 1`).
    pub fn add_sent_item(&self, item: &NetworkItem) -> Result<i64, SavefileError> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO ap_sent_items (item_id, location_id, player_id, flags)
             VALUES (?, ?, ?, ?) RETURNING item_index",
        )?;
        let index: i64 = stmt.query_row(
            params![item.item, item.location, item.player, item.flags],
            |row| row.get(0),
        )?;
        Ok(index - 1)
    }

    pub fn sent_items(&self) -> Result<Vec<NetworkItem>, SavefileError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT item_id, location_id, player_id, flags
             FROM ap_sent_items ORDER BY item_index",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(NetworkItem {
                item: row.get(0)?,
                location: row.get(1)?,
                player: row.get(2)?,
                flags: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn unconfirmed_items(&self) -> Result<Vec<UnconfirmedItem>, SavefileError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT label, content, dest_player_id FROM mw_unconfirmed_sent_items",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(UnconfirmedItem {
                label: row.get(0)?,
                content: row.get(1)?,
                dest_player_id: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn add_unconfirmed_item(
        &self,
        label: &str,
        content: &str,
        dest_player_id: i32,
    ) -> Result<(), SavefileError> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO mw_unconfirmed_sent_items (label, content, dest_player_id)
             VALUES (?, ?, ?)",
        )?;
        stmt.execute(params![label, content, dest_player_id])?;
        Ok(())
    }

    /// Deletes the matching queue row; false when nothing matched.
    pub fn confirm_item(
        &self,
        label: &str,
        content: &str,
        dest_player_id: i32,
    ) -> Result<bool, SavefileError> {
        let mut stmt = self.conn.prepare_cached(
            "DELETE FROM mw_unconfirmed_sent_items
             WHERE label = ? AND content = ? AND dest_player_id = ?",
        )?;
        let deleted = stmt.execute(params![label, content, dest_player_id])?;
        Ok(deleted > 0)
    }

    pub fn add_received_item(&self, label: &str, content: &str) -> Result<(), SavefileError> {
        let mut stmt = self
            .conn
            .prepare_cached("INSERT INTO mw_received_items (label, content) VALUES (?, ?)")?;
        stmt.execute(params![label, content])?;
        Ok(())
    }

    pub fn has_received_item(&self, label: &str, content: &str) -> Result<bool, SavefileError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT EXISTS(SELECT 1 FROM mw_received_items WHERE label = ? AND content = ?)",
        )?;
        Ok(stmt.query_row(params![label, content], |row| row.get(0))?)
    }

    pub fn stored_data(&self, key: &str) -> Result<Option<String>, SavefileError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT json_value FROM ap_data_storage WHERE key = ?")?;
        Ok(stmt.query_row([key], |row| row.get(0)).optional()?)
    }

    pub fn set_stored_data(&self, key: &str, json_value: &str) -> Result<(), SavefileError> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO ap_data_storage (key, json_value) VALUES (?, ?)
             ON CONFLICT DO UPDATE SET json_value = excluded.json_value",
        )?;
        stmt.execute(params![key, json_value])?;
        Ok(())
    }
}
