//! Session variable cache.
//!
//! Tracks the handful of session GUCs the pooler keeps consistent when a
//! client is handed a server that last served someone else. Unknown keys are
//! rejected so the caller can fall through to generic handling.

use std::fmt::Write as _;

use bytes::{BufMut, BytesMut};

use crate::messages::parameter_status;

pub const NUM_VARS: usize = 6;

/// Recognized variables and their slot capacities (value byte limit is one
/// less, mirroring a NUL-terminated fixed array).
const SLOTS: [(&str, usize); NUM_VARS] = [
    ("client_encoding", 16),
    ("datestyle", 16),
    ("timezone", 36),
    ("standard_conforming_strings", 4),
    ("application_name", 64),
    ("client_pid", 12),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarCache {
    values: [String; NUM_VARS],
}

impl VarCache {
    pub fn new() -> VarCache {
        VarCache::default()
    }

    /// Store `value` if `key` names a recognized variable, truncating to the
    /// slot capacity. Returns false for unknown keys.
    pub fn set(&mut self, key: &str, value: &str) -> bool {
        for (i, (name, cap)) in SLOTS.iter().enumerate() {
            if key.eq_ignore_ascii_case(name) {
                self.values[i] = truncate(value, cap - 1);
                return true;
            }
        }
        false
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        SLOTS
            .iter()
            .position(|(name, _)| key.eq_ignore_ascii_case(name))
            .map(|i| self.values[i].as_str())
    }

    /// Copy every slot that is set in `src` but empty here.
    pub fn fill_unset(&mut self, src: &VarCache) {
        for i in 0..NUM_VARS {
            if self.values[i].is_empty() {
                self.values[i] = src.values[i].clone();
            }
        }
    }

    /// Append a ParameterStatus packet for every non-empty slot.
    pub fn add_params(&self, pkt: &mut BytesMut) {
        for i in 0..NUM_VARS {
            if !self.values[i].is_empty() {
                pkt.put(parameter_status(SLOTS[i].0, &self.values[i]));
            }
        }
    }

    pub fn clean(&mut self) {
        for value in &mut self.values {
            value.clear();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.values
            .iter()
            .enumerate()
            .map(|(i, v)| (SLOTS[i].0, v.as_str()))
    }
}

/// Build the `SET` statement reconciling `server` to `client`: one fragment
/// per variable the client has set to something the server session does not
/// have. `None` when the sessions already agree.
pub fn diff_sql(client: &VarCache, server: &VarCache) -> Option<String> {
    let mut sql = String::new();
    for i in 0..NUM_VARS {
        let want = &client.values[i];
        if want.is_empty() || *want == server.values[i] {
            continue;
        }
        let _ = write!(
            sql,
            "SET {}='{}';",
            SLOTS[i].0,
            want.replace('\'', "''")
        );
    }
    if sql.is_empty() {
        None
    } else {
        Some(sql)
    }
}

fn truncate(value: &str, max: usize) -> String {
    if value.len() <= max {
        return value.to_string();
    }
    let mut end = max;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::header::{get_header, PktType};
    use crate::messages::parse_parameter_status;

    #[test]
    fn set_recognizes_exactly_the_known_names() {
        let mut cache = VarCache::new();
        for key in [
            "client_encoding",
            "datestyle",
            "timezone",
            "standard_conforming_strings",
            "application_name",
            "client_pid",
        ] {
            assert!(cache.set(key, "x"), "{key} should be recognized");
        }
        assert!(!cache.set("search_path", "public"));
        assert!(!cache.set("work_mem", "64MB"));
        assert!(!cache.set("", "x"));
    }

    #[test]
    fn set_is_case_insensitive() {
        let mut cache = VarCache::new();
        assert!(cache.set("DateStyle", "ISO"));
        assert_eq!(cache.get("datestyle"), Some("ISO"));
        assert!(cache.set("TIMEZONE", "UTC"));
        assert_eq!(cache.get("TimeZone"), Some("UTC"));
    }

    #[test]
    fn long_values_are_truncated_on_ingest() {
        let mut cache = VarCache::new();
        let long = "x".repeat(100);
        assert!(cache.set("client_encoding", &long));
        assert_eq!(cache.get("client_encoding").unwrap().len(), 15);
    }

    #[test]
    fn diff_is_empty_iff_sessions_agree() {
        let mut client = VarCache::new();
        let mut server = VarCache::new();
        assert!(diff_sql(&client, &server).is_none());

        client.set("client_encoding", "LATIN1");
        server.set("client_encoding", "UTF8");
        let sql = diff_sql(&client, &server).unwrap();
        assert_eq!(sql, "SET client_encoding='LATIN1';");

        server.set("client_encoding", "LATIN1");
        assert!(diff_sql(&client, &server).is_none());
    }

    #[test]
    fn unset_client_values_are_not_applied() {
        let client = VarCache::new();
        let mut server = VarCache::new();
        server.set("timezone", "UTC");
        assert!(diff_sql(&client, &server).is_none());
    }

    #[test]
    fn diff_quotes_by_doubling() {
        let mut client = VarCache::new();
        let server = VarCache::new();
        client.set("timezone", "it's-a-zone");
        let sql = diff_sql(&client, &server).unwrap();
        assert_eq!(sql, "SET timezone='it''s-a-zone';");
    }

    #[test]
    fn fill_unset_keeps_existing_values() {
        let mut defaults = VarCache::new();
        defaults.set("client_encoding", "UTF8");
        defaults.set("datestyle", "ISO");

        let mut client = VarCache::new();
        client.set("client_encoding", "LATIN1");
        client.fill_unset(&defaults);

        assert_eq!(client.get("client_encoding"), Some("LATIN1"));
        assert_eq!(client.get("datestyle"), Some("ISO"));
    }

    #[test]
    fn add_params_emits_only_set_slots() {
        let mut cache = VarCache::new();
        cache.set("client_encoding", "UTF8");
        cache.set("client_pid", "4242");

        let mut pkt = BytesMut::new();
        cache.add_params(&mut pkt);

        let mut seen = Vec::new();
        let mut rest = &pkt[..];
        while !rest.is_empty() {
            let hdr = get_header(rest).unwrap().unwrap();
            assert_eq!(hdr.ptype, PktType::Typed(b'S'));
            seen.push(parse_parameter_status(hdr.data).unwrap());
            rest = &rest[hdr.len..];
        }
        assert_eq!(
            seen,
            vec![
                ("client_encoding".to_string(), "UTF8".to_string()),
                ("client_pid".to_string(), "4242".to_string()),
            ]
        );
    }

    #[test]
    fn clean_zeroes_every_slot() {
        let mut cache = VarCache::new();
        cache.set("client_encoding", "UTF8");
        cache.clean();
        assert!(cache.iter().all(|(_, v)| v.is_empty()));
    }
}
