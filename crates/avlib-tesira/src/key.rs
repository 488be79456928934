//! Correlation keys.
//!
//! A key identifies one addressable attribute: `tag-attribute-i1-i2...`.
//! Gets, sets and subscriptions of the same attribute share a key, and the
//! key doubles as the publish token of the attribute's subscription.
//!
//! Keys are only unique while tags and attribute names avoid `-`; a tag such
//! as `Lobby-Level` can collide with another block's attribute. This is the
//! accepted trade-off for human-readable tokens.

/// Build the correlation key for an attribute address.
///
/// Service codes have no attribute and use the empty string in its place.
///
/// ```
/// use avlib_tesira::key::correlation_key;
///
/// assert_eq!(correlation_key("Level1", Some("level"), &[1]), "Level1-level-1");
/// assert_eq!(correlation_key("Mixer1", Some("crosspointLevel"), &[2, 3]), "Mixer1-crosspointLevel-2-3");
/// assert_eq!(correlation_key("Level1", Some("numChannels"), &[]), "Level1-numChannels-");
/// ```
pub fn correlation_key(instance_tag: &str, attribute: Option<&str>, indices: &[u32]) -> String {
    let indices = indices
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join("-");
    [instance_tag, attribute.unwrap_or(""), &indices].join("-")
}
