//! First-run setup: join a room, upload the seed, save the mixed result.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use anyhow::{bail, Context};
use tracing::{debug, info, warn};

use mwbridge_core::mwproto::{Message, Placement, ResultMessage};
use mwbridge_core::Client;

use crate::apfile::ApData;
use crate::play::{single_slot, ConnectionLost, MAIN_ITEM_GROUP, SAVEFILE_NAME};
use crate::savefile::Savefile;
use crate::Args;

/// Seed reported with the upload. All bridges report the same value, so
/// world order degenerates to join order, which is fine: the sort only has
/// to be reproducible, not fair.
const UPLOAD_SEED: i64 = 666_666_666;

const FALLBACK_LOCATION_NAME: &str = "Mystery_Place";

pub async fn setup(args: &Args, data: &ApData) -> anyhow::Result<()> {
    let slot_id = single_slot(data)?;
    let slot = &data.slot_info[&slot_id];
    let placements = ap_to_mw_placements(data).context("convert AP to MW")?;

    let mut conn = Client::dial(&args.mwserver).await.context("connect to MW")?;
    conn.send(Message::Connect {
        server_name: String::new(),
    })
    .await;

    loop {
        let Some(msg) = conn.recv().await else {
            return Err(ConnectionLost.into());
        };
        match msg {
            Message::Connect { server_name } => {
                info!("connected to {server_name}");
                break;
            }
            other => warn!("unexpected message before connect: {other:?}"),
        }
    }

    conn.send(Message::Ready {
        room: args.mwroom.clone(),
        nickname: slot.name.clone(),
        mode: 0,
        ready_metadata: Vec::new(),
    })
    .await;

    // Waiting to enter the room.
    loop {
        let Some(msg) = conn.recv().await else {
            return Err(ConnectionLost.into());
        };
        match msg {
            Message::ReadyConfirm { names, .. } => {
                info!("joined room {:?} with players {names:?}", args.mwroom);
                break;
            }
            Message::ReadyDeny { description } => {
                warn!("denied entry to room {:?}: {description}", args.mwroom);
            }
            Message::Disconnect => return Err(ConnectionLost.into()),
            Message::RequestRando => {}
            other => warn!("unexpected message while joining room: {other:?}"),
        }
    }

    // Waiting for the room to start randomizing.
    loop {
        let Some(msg) = conn.recv().await else {
            return Err(ConnectionLost.into());
        };
        match msg {
            Message::Disconnect => return Err(ConnectionLost.into()),
            Message::ReadyConfirm { names, .. } => info!("players in room: {names:?}"),
            Message::RequestRando => {
                let mut items = BTreeMap::new();
                items.insert(MAIN_ITEM_GROUP.to_string(), placements.clone());
                conn.send(Message::RandoGenerated {
                    items,
                    seed: UPLOAD_SEED,
                })
                .await;
                break;
            }
            other => warn!("unexpected message while in room: {other:?}"),
        }
    }

    let result: ResultMessage = loop {
        let Some(msg) = conn.recv().await else {
            return Err(ConnectionLost.into());
        };
        match msg {
            Message::Disconnect => return Err(ConnectionLost.into()),
            Message::Result(result) => break result,
            _ => {}
        }
    };

    std::fs::create_dir(&args.workdir)
        .with_context(|| format!("create workdir {:?}", args.workdir))?;
    Savefile::create(&args.workdir.join(SAVEFILE_NAME), &result, MAIN_ITEM_GROUP)
        .context("write savefile")?;
    Ok(())
}

/// Flattens the seed's sphere-ordered placements into the upload format.
/// Names gain discriminators so they stay unique on the multiworld side; the
/// play session strips them again and resolves real ids from the data
/// package.
fn ap_to_mw_placements(data: &ApData) -> anyhow::Result<Vec<Placement>> {
    let slot_id = single_slot(data)?;
    let slot = &data.slot_info[&slot_id];
    let Some(package) = data.datapackage.get(&slot.game) else {
        bail!(".archipelago does not contain datapackage for main game {}", slot.game);
    };
    let item_names = invert(&package.item_name_to_id, "duplicate item ID in datapackage")?;
    let location_names = invert(
        &package.location_name_to_id,
        "duplicate location ID in datapackage",
    )?;
    let Some(placements) = data.locations.get(&slot_id) else {
        bail!(".archipelago does not contain location data for its single slot");
    };

    let mut out = Vec::new();
    for sphere in &data.spheres {
        for &location in sphere.get(&slot_id).into_iter().flatten() {
            let base = location_names
                .get(&location)
                .map(String::as_str)
                .unwrap_or(FALLBACK_LOCATION_NAME);
            let location_name = format!("{base}_({location})");
            let Some(placed) = placements.get(&location) else {
                debug!("nothing placed at {location_name}");
                continue;
            };
            if placed.len() < 2 {
                debug!("missing placement data at {location_name}");
                continue;
            }
            let Some(item_base) = item_names.get(&placed[0]) else {
                bail!("item missing from datapackage: {}", placed[0]);
            };
            let item_name = format!("{item_base}_({})", out.len());
            out.push(Placement {
                item: item_name,
                location: location_name,
            });
        }
    }
    Ok(out)
}

fn invert<K, V>(map: &HashMap<K, V>, error: &str) -> anyhow::Result<HashMap<V, K>>
where
    K: Clone,
    V: Clone + Eq + Hash + std::fmt::Debug,
{
    let mut inverted = HashMap::with_capacity(map.len());
    for (k, v) in map {
        if inverted.insert(v.clone(), k.clone()).is_some() {
            bail!("{error}: {v:?}");
        }
    }
    Ok(inverted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apfile::{ApGameData, ApSlot};

    fn test_data() -> ApData {
        let mut data = ApData {
            version: vec![0, 5, 1],
            ..ApData::default()
        };
        let mut package = ApGameData::default();
        package.item_name_to_id.insert("Rock".to_string(), 7);
        package.item_name_to_id.insert("Gem".to_string(), 9);
        package.location_name_to_id.insert("Spot".to_string(), 10);
        package.location_name_to_id.insert("Elsewhere".to_string(), 12);
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
        // Two spheres: Spot first, then Elsewhere and an unnamed location.
        data.spheres = vec![
            HashMap::from([(1, vec![10])]),
            HashMap::from([(1, vec![12, 999])]),
        ];
        data.locations.insert(
            1,
            HashMap::from([(10, vec![9, 1, 0]), (12, vec![7, 1, 0]), (999, vec![7, 1, 0])]),
        );
        data
    }

    #[test]
    fn placements_follow_sphere_order_with_discriminators() {
        let placements = ap_to_mw_placements(&test_data()).unwrap();
        assert_eq!(
            placements,
            vec![
                Placement {
                    item: "Gem_(0)".to_string(),
                    location: "Spot_(10)".to_string(),
                },
                Placement {
                    item: "Rock_(1)".to_string(),
                    location: "Elsewhere_(12)".to_string(),
                },
                Placement {
                    item: "Rock_(2)".to_string(),
                    location: "Mystery_Place_(999)".to_string(),
                },
            ]
        );
    }

    #[test]
    fn empty_and_short_placements_are_skipped() {
        let mut data = test_data();
        data.locations.get_mut(&1).unwrap().remove(&12);
        data.locations.get_mut(&1).unwrap().insert(999, vec![7]);
        let placements = ap_to_mw_placements(&data).unwrap();
        assert_eq!(placements.len(), 1);
        assert_eq!(placements[0].location, "Spot_(10)");
    }

    #[test]
    fn duplicate_ids_in_datapackage_are_rejected() {
        let mut data = test_data();
        data.datapackage
            .get_mut("HK")
            .unwrap()
            .item_name_to_id
            .insert("RockAlias".to_string(), 7);
        assert!(ap_to_mw_placements(&data).is_err());
    }
}
