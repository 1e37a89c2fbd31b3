//! Process-local stand-ins for the durable key-value store and the trigger
//! registry.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{bail, Result};
use chrono::Utc;

use crate::db::models::Trigger;
use crate::triage::scheduler::TriggerService;
use crate::triage::watermark::KeyValueStore;

#[derive(Debug, Default)]
struct State {
    values: HashMap<String, String>,
    writes: Vec<(String, String)>,
    triggers: Vec<Trigger>,
    next_trigger_id: i64,
    fail_trigger_creation: bool,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `set` call in order, including overwrites.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.lock().writes.clone()
    }

    /// Registers a trigger directly, bypassing `create_periodic_trigger`.
    pub fn seed_trigger(&self, handler_name: &str, interval_minutes: u32) -> Trigger {
        let mut state = self.lock();
        state.next_trigger_id += 1;
        let trigger = Trigger {
            id: state.next_trigger_id,
            handler_name: handler_name.to_string(),
            interval_minutes,
            created_at: Utc::now(),
        };
        state.triggers.push(trigger.clone());
        trigger
    }

    pub fn fail_trigger_creation(&self) {
        self.lock().fail_trigger_creation = true;
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.lock();
        state.values.insert(key.to_string(), value.to_string());
        state.writes.push((key.to_string(), value.to_string()));
        Ok(())
    }
}

impl TriggerService for MemoryStore {
    fn list_triggers(&self) -> Result<Vec<Trigger>> {
        Ok(self.lock().triggers.clone())
    }

    fn delete_trigger(&self, trigger: &Trigger) -> Result<()> {
        self.lock().triggers.retain(|t| t.id != trigger.id);
        Ok(())
    }

    fn create_periodic_trigger(
        &self,
        handler_name: &str,
        interval_minutes: u32,
    ) -> Result<Trigger> {
        if self.lock().fail_trigger_creation {
            bail!("trigger service unavailable");
        }
        Ok(self.seed_trigger(handler_name, interval_minutes))
    }
}
