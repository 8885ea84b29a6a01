//! Replicated key-value tables and this node's own published entries.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::common::{Closest, Hash, Hashed};

/// Reading this key returns the whole table, writing it remotely is rejected.
pub const WHOLE_TABLE_KEY: &str = "*";

pub const DEFAULT_TABLE_COUNT: usize = 128;
pub const DEFAULT_TABLE_SIZE: usize = 1024;
pub const DEFAULT_VALUE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_VALUE_UPDATE_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct ValueSettings {
    pub table_count: usize,
    pub table_size: usize,
    /// Entries not updated for this long are dropped on sweep.
    pub value_timeout: Duration,
}

impl Default for ValueSettings {
    fn default() -> Self {
        Self {
            table_count: DEFAULT_TABLE_COUNT,
            table_size: DEFAULT_TABLE_SIZE,
            value_timeout: DEFAULT_VALUE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
struct ValueEntry {
    value: String,
    key_hash: Hash,
    update_time: Instant,
}

#[derive(Debug, Default)]
struct ValueTable {
    entries: HashMap<String, ValueEntry>,
    update_time: Option<Instant>,
}

impl ValueTable {
    fn evict_oldest(&mut self, limit: usize) {
        while self.entries.len() > limit {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.update_time)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }
}

struct KeyRef<'a> {
    key: &'a str,
    entry: &'a ValueEntry,
}

impl Hashed for KeyRef<'_> {
    fn hash(&self) -> Hash {
        self.entry.key_hash
    }
}

struct Candidate {
    key: String,
    value: String,
    hash: Hash,
}

impl Hashed for Candidate {
    fn hash(&self) -> Hash {
        self.hash
    }
}

/// The `count` entries of `values` whose key hash is closest to the hash of `key`.
pub fn closest_values(
    values: BTreeMap<String, String>,
    key: &str,
    count: usize,
) -> BTreeMap<String, String> {
    let mut closest = Closest::new(Hash::of(key), count);
    for (key, value) in values {
        closest.add(Candidate {
            hash: Hash::of(&key),
            key,
            value,
        });
    }

    closest
        .into_iter()
        .map(|candidate| (candidate.key, candidate.value))
        .collect()
}

#[derive(Debug, Default)]
/// Values other peers stored on this node, per table name.
pub struct DistributedValueTableMgr {
    tables: HashMap<String, ValueTable>,
    settings: ValueSettings,
}

impl DistributedValueTableMgr {
    pub fn new(settings: ValueSettings) -> Self {
        Self {
            tables: HashMap::new(),
            settings,
        }
    }

    // === Getters ===

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn value_count(&self) -> usize {
        self.tables.values().map(|t| t.entries.len()).sum()
    }

    /// Exact read, [WHOLE_TABLE_KEY] returns every entry of the table.
    pub fn find_value(&self, table: &str, key: &str) -> BTreeMap<String, String> {
        let Some(table) = self.tables.get(table) else {
            return BTreeMap::new();
        };

        if key == WHOLE_TABLE_KEY {
            return table
                .entries
                .iter()
                .map(|(k, entry)| (k.clone(), entry.value.clone()))
                .collect();
        }

        table
            .entries
            .get(key)
            .map(|entry| BTreeMap::from([(key.to_string(), entry.value.clone())]))
            .unwrap_or_default()
    }

    /// Fuzzy read: the `count` entries whose key hash is closest to the key's.
    pub fn find_closest_values(
        &self,
        table: &str,
        key: &str,
        count: usize,
    ) -> BTreeMap<String, String> {
        let Some(table) = self.tables.get(table) else {
            return BTreeMap::new();
        };

        let mut closest = Closest::new(Hash::of(key), count);
        for (key, entry) in &table.entries {
            closest.add(KeyRef { key, entry });
        }

        closest
            .into_iter()
            .map(|item| (item.key.to_string(), item.entry.value.clone()))
            .collect()
    }

    // === Public Methods ===

    /// Store a value for a remote writer, returns false for an empty or reserved key.
    pub fn update_value(&mut self, table: &str, key: &str, value: &str, now: Instant) -> bool {
        if table.is_empty() || key.is_empty() || key == WHOLE_TABLE_KEY {
            return false;
        }

        let limit = self.settings.table_size;
        let values_table = self.tables.entry(table.to_string()).or_default();
        values_table.update_time = Some(now);
        values_table.entries.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                key_hash: Hash::of(key),
                update_time: now,
            },
        );
        values_table.evict_oldest(limit);

        true
    }

    /// Store many values, returns how many were accepted.
    pub fn update_values(
        &mut self,
        table: &str,
        values: &BTreeMap<String, String>,
        now: Instant,
    ) -> usize {
        values
            .iter()
            .filter(|(key, value)| self.update_value(table, key, value, now))
            .count()
    }

    /// Expire stale tables and entries.
    pub fn sweep(&mut self, now: Instant) {
        let timeout = self.settings.value_timeout;
        let is_stale =
            |time: Option<Instant>| time.map_or(true, |t| now.saturating_duration_since(t) >= timeout);

        if self.tables.len() > self.settings.table_count {
            self.tables.retain(|_, table| !is_stale(table.update_time));

            while self.tables.len() > self.settings.table_count {
                let Some(oldest) = self
                    .tables
                    .iter()
                    .min_by_key(|(_, table)| table.update_time)
                    .map(|(name, _)| name.clone())
                else {
                    break;
                };
                self.tables.remove(&oldest);
            }
        }

        for table in self.tables.values_mut() {
            table
                .entries
                .retain(|_, entry| !is_stale(Some(entry.update_time)));
        }
        self.tables.retain(|_, table| !table.entries.is_empty());
    }
}

#[derive(Debug, Clone)]
struct LocalValue {
    value: String,
    published: Instant,
}

#[derive(Debug)]
/// Entries this node published itself, republished periodically.
pub struct LocalValueMgr {
    tables: HashMap<String, HashMap<String, LocalValue>>,
    update_interval: Duration,
}

impl LocalValueMgr {
    pub fn new(update_interval: Duration) -> Self {
        Self {
            tables: HashMap::new(),
            update_interval,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn save(&mut self, table: &str, key: &str, value: &str, now: Instant) {
        self.tables.entry(table.to_string()).or_default().insert(
            key.to_string(),
            LocalValue {
                value: value.to_string(),
                published: now,
            },
        );
    }

    /// Remove one entry, or every entry of the table for [WHOLE_TABLE_KEY].
    pub fn delete(&mut self, table: &str, key: &str) -> bool {
        if key == WHOLE_TABLE_KEY {
            return self.tables.remove(table).is_some();
        }

        let Some(values) = self.tables.get_mut(table) else {
            return false;
        };
        let removed = values.remove(key).is_some();
        if values.is_empty() {
            self.tables.remove(table);
        }

        removed
    }

    pub fn get(&self, table: &str, key: &str) -> BTreeMap<String, String> {
        let Some(values) = self.tables.get(table) else {
            return BTreeMap::new();
        };

        values
            .iter()
            .filter(|(k, _)| key == WHOLE_TABLE_KEY || *k == key)
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }

    /// Fuzzy read over our own entries, same selection as
    /// [DistributedValueTableMgr::find_closest_values].
    pub fn find_closest_values(
        &self,
        table: &str,
        key: &str,
        count: usize,
    ) -> BTreeMap<String, String> {
        closest_values(self.get(table, WHOLE_TABLE_KEY), key, count)
    }

    /// Entries not published within the update interval, per table, marked as
    /// published now.
    pub fn take_due(&mut self, now: Instant) -> Vec<(String, BTreeMap<String, String>)> {
        let interval = self.update_interval;
        let mut due = Vec::new();

        for (table, values) in self.tables.iter_mut() {
            let stale: BTreeMap<String, String> = values
                .iter_mut()
                .filter(|(_, v)| now.saturating_duration_since(v.published) >= interval)
                .map(|(key, v)| {
                    v.published = now;
                    (key.clone(), v.value.clone())
                })
                .collect();

            if !stale.is_empty() {
                due.push((table.clone(), stale));
            }
        }

        due
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exact_and_whole_table_reads() {
        let now = Instant::now();
        let mut values = DistributedValueTableMgr::new(ValueSettings::default());

        assert!(values.update_value("t", "a", "1", now));
        assert!(values.update_value("t", "b", "2", now));

        assert_eq!(
            values.find_value("t", "a"),
            BTreeMap::from([("a".to_string(), "1".to_string())])
        );
        assert_eq!(values.find_value("t", WHOLE_TABLE_KEY).len(), 2);
        assert!(values.find_value("t", "c").is_empty());
        assert!(values.find_value("missing", "a").is_empty());
    }

    #[test]
    fn reserved_key_is_not_writable() {
        let now = Instant::now();
        let mut values = DistributedValueTableMgr::new(ValueSettings::default());

        values.update_value("t", "a", "1", now);
        assert!(!values.update_value("t", WHOLE_TABLE_KEY, "clobber", now));

        let written = values.update_values(
            "t",
            &BTreeMap::from([
                (WHOLE_TABLE_KEY.to_string(), "x".to_string()),
                ("b".to_string(), "2".to_string()),
            ]),
            now,
        );
        assert_eq!(written, 1);
        assert_eq!(
            values.find_value("t", WHOLE_TABLE_KEY),
            BTreeMap::from([
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ])
        );
    }

    #[test]
    fn unrefreshed_value_is_swept() {
        let now = Instant::now();
        let settings = ValueSettings::default();
        let timeout = settings.value_timeout;
        let mut values = DistributedValueTableMgr::new(settings);

        values.update_value("t", "old", "1", now);
        values.update_value("t", "fresh", "2", now + timeout);

        values.sweep(now + timeout + Duration::from_secs(1));

        assert!(values.find_value("t", "old").is_empty());
        assert_eq!(values.find_value("t", "fresh").len(), 1);
    }

    #[test]
    fn table_count_cap() {
        let now = Instant::now();
        let settings = ValueSettings {
            table_count: 2,
            ..Default::default()
        };
        let mut values = DistributedValueTableMgr::new(settings);

        values.update_value("a", "k", "v", now);
        values.update_value("b", "k", "v", now + Duration::from_secs(1));
        values.update_value("c", "k", "v", now + Duration::from_secs(2));

        values.sweep(now + Duration::from_secs(3));

        assert_eq!(values.table_count(), 2);
        assert!(values.find_value("a", "k").is_empty());
    }

    #[test]
    fn table_size_cap_evicts_oldest() {
        let now = Instant::now();
        let settings = ValueSettings {
            table_size: 2,
            ..Default::default()
        };
        let mut values = DistributedValueTableMgr::new(settings);

        values.update_value("t", "a", "1", now);
        values.update_value("t", "b", "2", now + Duration::from_secs(1));
        values.update_value("t", "c", "3", now + Duration::from_secs(2));

        assert_eq!(values.value_count(), 2);
        assert!(values.find_value("t", "a").is_empty());
    }

    #[test]
    fn fuzzy_reads_closest_keys() {
        let now = Instant::now();
        let mut values = DistributedValueTableMgr::new(ValueSettings::default());

        for i in 0..50 {
            values.update_value("t", &format!("key-{i}"), &i.to_string(), now);
        }

        let found = values.find_closest_values("t", "key-7", 5);
        assert_eq!(found.len(), 5);
        // An exact match is distance zero.
        assert_eq!(found.get("key-7").map(String::as_str), Some("7"));
    }

    #[test]
    fn local_values_republish() {
        let now = Instant::now();
        let interval = Duration::from_secs(300);
        let mut local = LocalValueMgr::new(interval);

        local.save("t", "a", "1", now);
        local.save("t", "b", "2", now + Duration::from_secs(200));

        assert!(local.take_due(now + Duration::from_secs(10)).is_empty());

        let due = local.take_due(now + interval);
        assert_eq!(
            due,
            vec![(
                "t".to_string(),
                BTreeMap::from([("a".to_string(), "1".to_string())])
            )]
        );

        // Marked as published.
        assert!(local.take_due(now + interval).is_empty());
    }

    #[test]
    fn local_fuzzy_reads_match_replicas() {
        let now = Instant::now();
        let mut local = LocalValueMgr::new(Duration::from_secs(300));
        let mut values = DistributedValueTableMgr::new(ValueSettings::default());

        for i in 0..50 {
            let key = format!("key-{i}");
            local.save("t", &key, &i.to_string(), now);
            values.update_value("t", &key, &i.to_string(), now);
        }

        assert_eq!(
            local.find_closest_values("t", "key-7", 5),
            values.find_closest_values("t", "key-7", 5)
        );
        assert!(local.find_closest_values("other", "key-7", 5).is_empty());
    }

    #[test]
    fn local_delete_whole_table() {
        let now = Instant::now();
        let mut local = LocalValueMgr::new(Duration::from_secs(300));

        local.save("t", "a", "1", now);
        local.save("t", "b", "2", now);

        assert_eq!(local.get("t", WHOLE_TABLE_KEY).len(), 2);
        assert!(local.delete("t", "a"));
        assert!(!local.delete("t", "a"));
        assert!(local.delete("t", WHOLE_TABLE_KEY));
        assert!(local.is_empty());
    }
}
