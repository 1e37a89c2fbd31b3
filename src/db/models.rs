use chrono::{DateTime, Duration, Utc};
use rusqlite::{Result as SqlResult, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncState {
    pub key: String,
    pub value: Option<String>,
    pub updated_at: Option<String>,
}

impl SyncState {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            key: row.get("key")?,
            value: row.get("value")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// A periodic timer registration bound to a cycle handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Trigger {
    pub id: i64,
    pub handler_name: String,
    pub interval_minutes: u32,
    pub created_at: DateTime<Utc>,
}

impl Trigger {
    /// The periodic trigger is recreated by every cycle, so the next firing
    /// is always one interval after creation.
    pub fn next_fire_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::minutes(i64::from(self.interval_minutes))
    }

    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let created_raw: String = row.get("created_at")?;
        let created_at = DateTime::parse_from_rfc3339(&created_raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    created_raw.len(),
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;

        Ok(Self {
            id: row.get("id")?,
            handler_name: row.get("handler_name")?,
            interval_minutes: row.get("interval_minutes")?,
            created_at,
        })
    }
}
