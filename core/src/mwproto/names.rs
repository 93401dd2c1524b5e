//! Naming conventions shared by both ecosystems.
//!
//! Items and locations cross the multiworld boundary as plain strings, so two
//! conventions keep them attributable and unique: a `MW(<world>)_` qualifier
//! ties a name to the world it belongs to, and a trailing `_(<n>)`
//! discriminator distinguishes identically-named occurrences.

/// Parses a `MW(<n>)_<name>` qualified name; `<n>` must fit a signed 32-bit
/// decimal.
pub fn parse_qualified_name(name: &str) -> Option<(i32, &str)> {
    let rest = name.strip_prefix("MW(")?;
    let (qualifier, item) = rest.split_once(")_")?;
    let world = qualifier.parse::<i32>().ok()?;
    Some((world, item))
}

/// Formats a name with its world qualifier.
pub fn qualified_name(world: i32, name: &str) -> String {
    format!("MW({world})_{name}")
}

/// Parses the trailing `_(<digits>)` discriminator, if present.
pub fn parse_discriminator(name: &str) -> Option<i64> {
    let name = name.strip_suffix(')')?;
    let (_, digits) = name.rsplit_once("_(")?;
    digits.parse::<i64>().ok()
}

/// Drops the trailing `_(<digits>)` discriminator, if present.
pub fn strip_discriminator(name: &str) -> &str {
    let Some(trimmed) = name.strip_suffix(')') else {
        return name;
    };
    match trimmed.rsplit_once("_(") {
        Some((base, digits)) if digits.parse::<i64>().is_ok() => base,
        _ => name,
    }
}

/// The human-readable rendering of a discriminated name.
pub fn prettify(name: &str) -> String {
    strip_discriminator(name).replace('_', " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_name_parses() {
        assert_eq!(
            parse_qualified_name("MW(3)_Mask_Shard_(12)"),
            Some((3, "Mask_Shard_(12)"))
        );
        assert_eq!(parse_qualified_name("MW(-1)_x"), Some((-1, "x")));
        assert_eq!(parse_qualified_name("Mask_Shard"), None);
        assert_eq!(parse_qualified_name("MW(nope)_x"), None);
        assert_eq!(parse_qualified_name("MW(3)Mask"), None);
    }

    #[test]
    fn qualified_name_roundtrips() {
        let name = qualified_name(7, "Grub_(4)");
        assert_eq!(parse_qualified_name(&name), Some((7, "Grub_(4)")));
    }

    #[test]
    fn discriminator_parses() {
        assert_eq!(parse_discriminator("Grub_(42)"), Some(42));
        assert_eq!(parse_discriminator("Grub"), None);
        assert_eq!(parse_discriminator("Grub_(x)"), None);
        assert_eq!(parse_discriminator("Grub_()"), None);
    }

    #[test]
    fn discriminator_strips() {
        assert_eq!(strip_discriminator("Grub_(42)"), "Grub");
        assert_eq!(strip_discriminator("Grub"), "Grub");
        assert_eq!(strip_discriminator("King's_Idol_(0)"), "King's_Idol");
        assert_eq!(strip_discriminator("Odd_(name)"), "Odd_(name)");
    }

    #[test]
    fn prettify_replaces_underscores() {
        assert_eq!(prettify("Mask_Shard_(3)"), "Mask Shard");
        assert_eq!(prettify("Grub"), "Grub");
    }
}
