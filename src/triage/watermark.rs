//! The persisted boundary between processed and unprocessed threads.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::warn;

pub const WATERMARK_KEY: &str = "triage_watermark";

/// Lookback applied when no watermark has been stored yet.
pub const DEFAULT_LOOKBACK_MS: i64 = 60 * 60 * 1000;

/// Durable string key-value storage shared across invocations.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Millisecond timestamp stored as a decimal string under a single key.
pub struct WatermarkStore<'a> {
    store: &'a dyn KeyValueStore,
    key: &'a str,
}

impl<'a> WatermarkStore<'a> {
    pub fn new(store: &'a dyn KeyValueStore) -> Self {
        Self::with_key(store, WATERMARK_KEY)
    }

    pub fn with_key(store: &'a dyn KeyValueStore, key: &'a str) -> Self {
        Self { store, key }
    }

    /// Returns `None` when nothing is stored or the stored value is not a
    /// number.
    pub fn read(&self) -> Result<Option<i64>> {
        let Some(raw) = self
            .store
            .get(self.key)
            .with_context(|| format!("read watermark '{}'", self.key))?
        else {
            return Ok(None);
        };

        match raw.trim().parse::<i64>() {
            Ok(ms) => Ok(Some(ms)),
            Err(error) => {
                warn!(key = self.key, value = %raw, %error, "ignoring unparseable watermark");
                Ok(None)
            }
        }
    }

    pub fn write(&self, ms: i64) -> Result<()> {
        self.store
            .set(self.key, &ms.to_string())
            .with_context(|| format!("write watermark '{}'", self.key))
    }

    /// The stored watermark, or `now - 1h` when absent.
    pub fn read_or_default(&self, now: DateTime<Utc>) -> Result<i64> {
        Ok(self
            .read()?
            .unwrap_or_else(|| now.timestamp_millis() - DEFAULT_LOOKBACK_MS))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{KeyValueStore, WatermarkStore, WATERMARK_KEY};
    use crate::memory::MemoryStore;

    #[test]
    fn empty_store_defaults_to_one_hour_ago() {
        let store = MemoryStore::new();
        let watermark = WatermarkStore::new(&store);
        let now = Utc
            .with_ymd_and_hms(2026, 4, 1, 10, 0, 0)
            .single()
            .expect("valid timestamp");

        assert_eq!(watermark.read().expect("read"), None);
        assert_eq!(
            watermark.read_or_default(now).expect("read default"),
            now.timestamp_millis() - 3_600_000
        );
    }

    #[test]
    fn write_persists_as_decimal_string() {
        let store = MemoryStore::new();
        let watermark = WatermarkStore::new(&store);
        watermark.write(1_712_000_000_123).expect("write");

        assert_eq!(
            store.get(WATERMARK_KEY).expect("get"),
            Some("1712000000123".to_string())
        );
        assert_eq!(watermark.read().expect("read"), Some(1_712_000_000_123));
    }

    #[test]
    fn garbage_value_reads_as_absent() {
        let store = MemoryStore::new();
        store.set(WATERMARK_KEY, "yesterday").expect("set");
        let watermark = WatermarkStore::new(&store);
        assert_eq!(watermark.read().expect("read"), None);
    }
}
