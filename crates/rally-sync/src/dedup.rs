//! Identity keys and per-run seen-sets.
//!
//! A key is marked seen only after the entity it names has been written
//! (or staged in the committed transaction). Checking before writing and
//! marking after guarantees at-most-once persistence within a run.

use std::collections::HashSet;
use std::fmt;

use rally_core::{Address, AddressKey, CityKey, CleanRecord};
use sha2::{Digest, Sha256};
use uuid::Uuid;

const RECORD_NAMESPACE: Uuid = Uuid::from_u128(0x6f1d_3b52_8a44_4c0e_9d7a_52c1_e0b3_a917);

/// Append-only set of identity keys.
#[derive(Debug, Default, Clone)]
pub struct SeenSet {
    keys: HashSet<String>,
}

impl SeenSet {
    pub fn has(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Returns `false` when the key was already present.
    pub fn add(&mut self, key: impl Into<String>) -> bool {
        self.keys.insert(key.into())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Location,
    City,
    Record,
}

/// The fields each entity kind is identified by.
#[derive(Debug, Clone, Copy)]
pub enum Identity<'a> {
    Location(&'a Address),
    City { city: &'a str, state: &'a str },
    Record {
        record: &'a CleanRecord,
        latitude: f64,
        longitude: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    kind: EntityKind,
    key: String,
}

impl IdentityKey {
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Hex sha256 of the key; stored as the unique identity column.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.key.as_bytes()))
    }

    /// Deterministic row id, stable across runs for the same key.
    pub fn uuid(&self) -> Uuid {
        Uuid::new_v5(&RECORD_NAMESPACE, self.key.as_bytes())
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

pub fn record_key(record: &CleanRecord, latitude: f64, longitude: f64) -> String {
    format!(
        "{}:{}|{}|{}|{:.6}|{:.6}",
        record.kind.as_str(),
        record.canonical_date(),
        record.name,
        record.link.as_deref().unwrap_or_default(),
        latitude,
        longitude
    )
}

#[derive(Debug, Default)]
pub struct IdentityDeduplicator {
    locations: SeenSet,
    cities: SeenSet,
    records: SeenSet,
}

impl IdentityDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_for(identity: Identity<'_>) -> IdentityKey {
        match identity {
            Identity::Location(address) => IdentityKey {
                kind: EntityKind::Location,
                key: AddressKey::from_address(address).to_string(),
            },
            Identity::City { city, state } => IdentityKey {
                kind: EntityKind::City,
                key: CityKey::new(city, state).to_string(),
            },
            Identity::Record {
                record,
                latitude,
                longitude,
            } => IdentityKey {
                kind: EntityKind::Record,
                key: record_key(record, latitude, longitude),
            },
        }
    }

    pub fn has_seen(&self, key: &IdentityKey) -> bool {
        self.set(key.kind).has(&key.key)
    }

    /// Call only once the entity named by `key` is durably written.
    pub fn mark_seen(&mut self, key: &IdentityKey) {
        let set = match key.kind {
            EntityKind::Location => &mut self.locations,
            EntityKind::City => &mut self.cities,
            EntityKind::Record => &mut self.records,
        };
        set.add(key.key.clone());
    }

    pub fn seen_count(&self, kind: EntityKind) -> usize {
        self.set(kind).len()
    }

    fn set(&self, kind: EntityKind) -> &SeenSet {
        match kind {
            EntityKind::Location => &self.locations,
            EntityKind::City => &self.cities,
            EntityKind::Record => &self.records,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::NaiveDate;
    use rally_core::RecordKind;

    use super::*;

    fn record(kind: RecordKind, name: &str) -> CleanRecord {
        CleanRecord {
            sheet: "events".into(),
            row_index: 1,
            kind,
            date: NaiveDate::from_ymd_opt(2025, 6, 14).expect("date"),
            name: name.into(),
            address: Address::new("", "Springfield", "IL", "62704", ""),
            link: Some("https://example.org/e/1".into()),
            coverage_url: None,
            turnout_low: None,
            turnout_high: None,
            extensions: BTreeMap::new(),
        }
    }

    #[test]
    fn record_keys_ignore_source_row_position() {
        let a = record(RecordKind::Event, "No Kings Rally");
        let mut b = a.clone();
        b.sheet = "events-backup".into();
        b.row_index = 99;
        b.extensions.insert("notes".into(), "dup".into());

        let key_a = IdentityDeduplicator::key_for(Identity::Record {
            record: &a,
            latitude: 39.78,
            longitude: -89.65,
        });
        let key_b = IdentityDeduplicator::key_for(Identity::Record {
            record: &b,
            latitude: 39.780000001,
            longitude: -89.65,
        });
        assert_eq!(key_a, key_b);
        assert_eq!(
            key_a.as_str(),
            "event:2025-06-14|No Kings Rally|https://example.org/e/1|39.780000|-89.650000"
        );
        assert_eq!(key_a.uuid(), key_b.uuid());
        assert_eq!(key_a.digest().len(), 64);
    }

    #[test]
    fn kinds_do_not_collide() {
        let event = record(RecordKind::Event, "March");
        let turnout = record(RecordKind::Turnout, "March");
        let e = IdentityDeduplicator::key_for(Identity::Record {
            record: &event,
            latitude: 1.0,
            longitude: 2.0,
        });
        let t = IdentityDeduplicator::key_for(Identity::Record {
            record: &turnout,
            latitude: 1.0,
            longitude: 2.0,
        });
        assert_ne!(e, t);
        assert_ne!(e.uuid(), t.uuid());
    }

    #[test]
    fn seen_sets_are_scoped_by_kind() {
        let mut dedup = IdentityDeduplicator::new();
        let city = IdentityDeduplicator::key_for(Identity::City {
            city: "Springfield",
            state: "IL",
        });
        assert_eq!(city.as_str(), "springfield-illinois");
        assert!(!dedup.has_seen(&city));
        dedup.mark_seen(&city);
        dedup.mark_seen(&city);
        assert!(dedup.has_seen(&city));
        assert_eq!(dedup.seen_count(EntityKind::City), 1);
        assert_eq!(dedup.seen_count(EntityKind::Location), 0);

        let address = Address::new("", "springfield", "il", "62704", "");
        let location = IdentityDeduplicator::key_for(Identity::Location(&address));
        assert_eq!(location.as_str(), "62704|springfield|il");
        assert!(!dedup.has_seen(&location));
    }

    #[test]
    fn seen_set_reports_fresh_inserts() {
        let mut set = SeenSet::default();
        assert!(set.is_empty());
        assert!(set.add("a"));
        assert!(!set.add("a"));
        assert!(set.has("a"));
        assert_eq!(set.len(), 1);
    }
}
