//! Pretty display names for items coming from other worlds.
//!
//! Discriminators only exist to make names unique on the multiworld side;
//! clients should see `Mask Shard`, not `Mask_Shard_(3)`. When several
//! occurrences share a base name the discriminator is kept so the pretty
//! names stay distinct.

use std::collections::{BTreeMap, HashMap};

use mwbridge_core::mwproto::names::strip_discriminator;

/// Builds a bidirectional pretty-name mapping for every item owned by
/// another player. Both directions are stored: pretty → wire name and
/// wire name → pretty.
pub fn pretty_names<'a, I>(placements: I, self_id: i32) -> HashMap<String, String>
where
    I: IntoIterator<Item = (i32, &'a str)>,
{
    let mut by_base: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (owner, item) in placements {
        if owner == self_id {
            continue;
        }
        by_base
            .entry(strip_discriminator(item).to_string())
            .or_default()
            .push(item.to_string());
    }

    let mut mapping = HashMap::new();
    for (base, names) in by_base {
        if let [single] = names.as_slice() {
            let pretty = base.replace('_', " ");
            mapping.insert(pretty.clone(), single.clone());
            mapping.insert(single.clone(), pretty);
        } else {
            for name in names {
                let pretty = name.replace('_', " ");
                mapping.insert(pretty.clone(), name.clone());
                mapping.insert(name, pretty);
            }
        }
    }
    mapping
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_names_lose_their_discriminator() {
        let mapping = pretty_names([(1, "Mask_Shard_(3)")], 0);
        assert_eq!(mapping["Mask_Shard_(3)"], "Mask Shard");
        assert_eq!(mapping["Mask Shard"], "Mask_Shard_(3)");
    }

    #[test]
    fn duplicate_base_names_keep_discriminators() {
        let mapping = pretty_names([(1, "Grub_(1)"), (2, "Grub_(2)")], 0);
        assert_eq!(mapping["Grub_(1)"], "Grub (1)");
        assert_eq!(mapping["Grub_(2)"], "Grub (2)");
        assert_eq!(mapping["Grub (1)"], "Grub_(1)");
    }

    #[test]
    fn own_items_are_skipped() {
        let mapping = pretty_names([(0, "Rock_(1)"), (1, "Gem_(2)")], 0);
        assert!(!mapping.contains_key("Rock_(1)"));
        assert!(mapping.contains_key("Gem_(2)"));
    }
}
