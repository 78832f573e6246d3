//! Routing-key derivation
//!
//! One admitted event fans out to multiple routing keys on the topic
//! exchange: every event lands on `raw`, and event families get their own
//! key on top.

use crate::config::Topics;

/// Event-type prefixes mapped to a dedicated routing key.
const PREFIXED_FAMILIES: [&str; 5] = ["license.", "session.", "screen.", "ui.", "system."];

/// Routing keys an event of `event_type` is staged under.
pub fn routing_keys(event_type: &str, topics: &Topics) -> Vec<String> {
    let mut keys = vec![topics.raw.clone()];

    if event_type == "geo.ping" {
        keys.push(topics.geo.clone());
    }

    for prefix in PREFIXED_FAMILIES {
        if event_type.starts_with(prefix) {
            let key = match prefix {
                "license." => &topics.license,
                "session." => &topics.session,
                "screen." => &topics.screen,
                "ui." => &topics.ui,
                _ => &topics.system,
            };
            keys.push(key.clone());
        }
    }

    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geo_ping_fans_out_to_raw_and_geo() {
        let topics = Topics::default();
        let keys = routing_keys("geo.ping", &topics);
        assert_eq!(keys, vec!["sb.events.raw", "sb.events.geo"]);
    }

    #[test]
    fn test_geo_prefix_alone_is_not_enough() {
        let topics = Topics::default();
        let keys = routing_keys("geo.other", &topics);
        assert_eq!(keys, vec!["sb.events.raw"]);
    }

    #[test]
    fn test_license_prefix() {
        let topics = Topics::default();
        let keys = routing_keys("license.update", &topics);
        assert_eq!(keys, vec!["sb.events.raw", "sb.events.license"]);
    }

    #[test]
    fn test_prefix_requires_dot() {
        let topics = Topics::default();
        let keys = routing_keys("sessionless", &topics);
        assert_eq!(keys, vec!["sb.events.raw"]);
    }

    #[test]
    fn test_unknown_type_goes_to_raw_only() {
        let topics = Topics::default();
        let keys = routing_keys("app.opened", &topics);
        assert_eq!(keys, vec!["sb.events.raw"]);
    }

    #[test]
    fn test_all_prefixed_families() {
        let topics = Topics::default();
        for (event_type, expected) in [
            ("session.start", "sb.events.session"),
            ("screen.view", "sb.events.screen"),
            ("ui.tap", "sb.events.ui"),
            ("system.boot", "sb.events.system"),
        ] {
            let keys = routing_keys(event_type, &topics);
            assert_eq!(keys, vec!["sb.events.raw".to_string(), expected.to_string()]);
        }
    }
}
