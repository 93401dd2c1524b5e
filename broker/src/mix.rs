//! Cooperative placement mixing.
//!
//! Every world arrives already randomized as an ordered list of spheres per
//! item group; mixing only reshuffles which world's location hosts which
//! world's item, walking spheres so that progression stays intact: a world's
//! sphere `k` only enters the pools once all of its sphere `k - 1` items have
//! been placed somewhere.

use std::collections::BTreeMap;

use rand::Rng;
use rand_pcg::Pcg64Mcg;
use serde::Serialize;
use sha2::{Digest, Sha224};

use mwbridge_core::mwproto::Placement;

pub type Sphere = Vec<Placement>;

/// One player's uploaded seed: placements per group, partitioned into
/// progression spheres.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct World {
    pub seed: i64,
    pub placements: BTreeMap<String, Vec<Sphere>>,
}

/// A single mixed placement; the hashed and distributed output form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MixedPlacement {
    #[serde(rename = "Item")]
    pub item: QualifiedItem,
    #[serde(rename = "Location")]
    pub location: QualifiedItem,
    #[serde(rename = "Group")]
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualifiedItem {
    #[serde(rename = "World")]
    pub world: usize,
    #[serde(rename = "Name")]
    pub name: String,
}

const SEED_FOLD_MULTIPLIER: u128 = 0xAAAA_AAAA_AAAA_AAAA;

/// Mixes the given worlds into one global placement list. Deterministic for
/// identical input; callers sort worlds by seed beforehand so the world
/// indices are reproducible.
pub fn mix(worlds: &[World]) -> Vec<MixedPlacement> {
    let mut seed: u128 = 0;
    for w in worlds {
        seed = seed
            .wrapping_mul(SEED_FOLD_MULTIPLIER)
            .wrapping_add(u128::from(w.seed as u64));
    }
    let mut rng = Pcg64Mcg::new(seed);

    let mut groups: BTreeMap<&str, Vec<GroupWorld>> = BTreeMap::new();
    for (i, w) in worlds.iter().enumerate() {
        for (group, spheres) in &w.placements {
            groups
                .entry(group.as_str())
                .or_default()
                .push(GroupWorld { world: i, spheres });
        }
    }

    let mut placements = Vec::new();
    for (group, group_worlds) in &groups {
        mix_group(&mut rng, group_worlds, group, &mut placements);
    }
    placements
}

struct GroupWorld<'a> {
    world: usize,
    spheres: &'a [Sphere],
}

#[derive(Clone, Copy, Default)]
struct UpcomingSphere {
    index: usize,
    items_to_unlock: usize,
}

fn mix_group(
    rng: &mut Pcg64Mcg,
    worlds: &[GroupWorld<'_>],
    group_name: &str,
    out: &mut Vec<MixedPlacement>,
) {
    let mut available_locations: Vec<QualifiedItem> = Vec::new();
    let mut available_items: Vec<QualifiedItem> = Vec::new();
    let mut next_spheres = vec![UpcomingSphere::default(); worlds.len()];

    for (i, w) in worlds.iter().enumerate() {
        let Some(first) = w.spheres.first() else {
            continue;
        };
        next_spheres[i] = UpcomingSphere {
            index: 1,
            items_to_unlock: first.len(),
        };
        for p in first {
            available_locations.push(QualifiedItem {
                world: w.world,
                name: p.location.clone(),
            });
            available_items.push(QualifiedItem {
                world: w.world,
                name: p.item.clone(),
            });
        }
    }

    while !available_locations.is_empty() {
        let location = sample(rng, &mut available_locations);
        let item = sample(rng, &mut available_items);
        let item_world = item.world;
        out.push(MixedPlacement {
            item,
            location,
            group: group_name.to_string(),
        });

        let w = worlds
            .iter()
            .position(|gw| gw.world == item_world)
            .expect("item placed for a world outside this group");
        let ns = &mut next_spheres[w];
        ns.items_to_unlock -= 1;
        let has_more_spheres = ns.index < worlds[w].spheres.len();
        if ns.items_to_unlock == 0 && has_more_spheres {
            let new_sphere = &worlds[w].spheres[ns.index];
            ns.index += 1;
            ns.items_to_unlock = new_sphere.len();
            for p in new_sphere {
                available_locations.push(QualifiedItem {
                    world: item_world,
                    name: p.location.clone(),
                });
                available_items.push(QualifiedItem {
                    world: item_world,
                    name: p.item.clone(),
                });
            }
        }
    }
}

// Fisher-Yates half-step: swap the pick with the last element and shrink.
fn sample(rng: &mut Pcg64Mcg, pool: &mut Vec<QualifiedItem>) -> QualifiedItem {
    let i = rng.random_range(0..pool.len());
    pool.swap_remove(i)
}

/// SHA-224 of the JSON encoding of the placement list, uppercase hex.
pub fn hash(placements: &[MixedPlacement]) -> String {
    let encoded = serde_json::to_vec(placements).unwrap_or_default();
    let digest = Sha224::digest(&encoded);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02X}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placement(item: &str, location: &str) -> Placement {
        Placement {
            item: item.to_string(),
            location: location.to_string(),
        }
    }

    fn world(seed: i64, groups: &[(&str, Vec<Vec<(&str, &str)>>)]) -> World {
        let mut placements = BTreeMap::new();
        for (name, spheres) in groups {
            placements.insert(
                name.to_string(),
                spheres
                    .iter()
                    .map(|s| s.iter().map(|(i, l)| placement(i, l)).collect())
                    .collect(),
            );
        }
        World {
            seed,
            placements,
        }
    }

    fn two_sphere_worlds() -> Vec<World> {
        vec![
            world(
                3,
                &[(
                    "G",
                    vec![
                        vec![("a1", "la1"), ("a2", "la2")],
                        vec![("a3", "la3")],
                        vec![("a4", "la4"), ("a5", "la5")],
                    ],
                )],
            ),
            world(
                9,
                &[(
                    "G",
                    vec![vec![("b1", "lb1")], vec![("b2", "lb2"), ("b3", "lb3")]],
                )],
            ),
        ]
    }

    #[test]
    fn mix_is_deterministic() {
        let worlds = two_sphere_worlds();
        assert_eq!(mix(&worlds), mix(&worlds));
    }

    #[test]
    fn mix_of_two_singleton_worlds_is_a_permutation() {
        let worlds = vec![
            world(0, &[("G", vec![vec![("a", "la")]])]),
            world(1, &[("G", vec![vec![("b", "lb")]])]),
        ];
        let mixed = mix(&worlds);
        assert_eq!(mixed.len(), 2);

        let mut items: Vec<(usize, &str)> = mixed
            .iter()
            .map(|p| (p.item.world, p.item.name.as_str()))
            .collect();
        items.sort_unstable();
        assert_eq!(items, vec![(0, "a"), (1, "b")]);

        let mut locations: Vec<(usize, &str)> = mixed
            .iter()
            .map(|p| (p.location.world, p.location.name.as_str()))
            .collect();
        locations.sort_unstable();
        assert_eq!(locations, vec![(0, "la"), (1, "lb")]);
        assert!(mixed.iter().all(|p| p.group == "G"));
    }

    #[test]
    fn mix_conserves_items_and_locations() {
        let worlds = two_sphere_worlds();
        let mixed = mix(&worlds);

        let mut expected_items = Vec::new();
        let mut expected_locations = Vec::new();
        for (w, world) in worlds.iter().enumerate() {
            for spheres in world.placements.values() {
                for sphere in spheres {
                    for p in sphere {
                        expected_items.push((w, p.item.clone()));
                        expected_locations.push((w, p.location.clone()));
                    }
                }
            }
        }
        expected_items.sort();
        expected_locations.sort();

        let mut items: Vec<(usize, String)> = mixed
            .iter()
            .map(|p| (p.item.world, p.item.name.clone()))
            .collect();
        items.sort();
        let mut locations: Vec<(usize, String)> = mixed
            .iter()
            .map(|p| (p.location.world, p.location.name.clone()))
            .collect();
        locations.sort();

        assert_eq!(items, expected_items);
        assert_eq!(locations, expected_locations);
    }

    #[test]
    fn mix_respects_sphere_progression() {
        let worlds = two_sphere_worlds();
        let mixed = mix(&worlds);

        // Recover each item's sphere index in its source world.
        let sphere_of = |world: usize, item: &str| -> usize {
            worlds[world].placements["G"]
                .iter()
                .position(|s| s.iter().any(|p| p.item == item))
                .expect("item came from somewhere")
        };

        for (i, p) in mixed.iter().enumerate() {
            let k = sphere_of(p.item.world, &p.item.name);
            if k == 0 {
                continue;
            }
            let unlocked = mixed[..i]
                .iter()
                .any(|q| q.item.world == p.item.world && sphere_of(q.item.world, &q.item.name) == k - 1);
            assert!(
                unlocked,
                "item {} from sphere {k} placed before sphere {} opened",
                p.item.name,
                k - 1
            );
        }
    }

    #[test]
    fn mix_ignores_groups_with_no_spheres() {
        let worlds = vec![
            world(1, &[("G", vec![vec![("a", "la")]]), ("H", vec![])]),
            world(2, &[("G", vec![vec![("b", "lb")]])]),
        ];
        let mixed = mix(&worlds);
        assert_eq!(mixed.len(), 2);
        assert!(mixed.iter().all(|p| p.group == "G"));
    }

    #[test]
    fn mix_is_invariant_under_pre_sort_permutation() {
        // Callers sort by seed before mixing; any arrival order of the same
        // worlds therefore produces the identical result.
        let mut shuffled = vec![
            world(9, &[("G", vec![vec![("c", "lc"), ("d", "ld")]])]),
            world(3, &[("G", vec![vec![("a", "la"), ("b", "lb")]])]),
        ];
        shuffled.sort_by_key(|w| w.seed);
        let sorted = vec![
            world(3, &[("G", vec![vec![("a", "la"), ("b", "lb")]])]),
            world(9, &[("G", vec![vec![("c", "lc"), ("d", "ld")]])]),
        ];
        assert_eq!(mix(&shuffled), mix(&sorted));
    }

    #[test]
    fn hash_is_uppercase_sha224() {
        let mixed = mix(&two_sphere_worlds());
        let h = hash(&mixed);
        assert_eq!(h.len(), 56);
        assert!(h.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        assert_eq!(h, hash(&mixed));
    }
}
