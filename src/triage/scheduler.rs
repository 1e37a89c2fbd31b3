use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::db::models::Trigger;

/// The periodic-timer registry that re-invokes a handler.
pub trait TriggerService {
    fn list_triggers(&self) -> Result<Vec<Trigger>>;

    fn delete_trigger(&self, trigger: &Trigger) -> Result<()>;

    fn create_periodic_trigger(&self, handler_name: &str, interval_minutes: u32)
        -> Result<Trigger>;
}

/// Deletes every trigger bound to `handler_name`, then installs exactly one
/// firing every `interval_minutes`. Triggers of other handlers are untouched.
pub fn rearm(
    triggers: &dyn TriggerService,
    handler_name: &str,
    interval_minutes: u32,
) -> Result<Trigger> {
    let existing = triggers.list_triggers().context("list triggers")?;

    let mut removed = 0usize;
    for trigger in existing.iter().filter(|t| t.handler_name == handler_name) {
        triggers
            .delete_trigger(trigger)
            .with_context(|| format!("delete trigger {} for {handler_name}", trigger.id))?;
        removed += 1;
    }
    debug!(handler = handler_name, removed, "removed previous triggers");

    let trigger = triggers
        .create_periodic_trigger(handler_name, interval_minutes)
        .with_context(|| format!("create trigger for {handler_name}"))?;
    info!(
        handler = handler_name,
        interval_minutes,
        next_fire_at = %trigger.next_fire_at(),
        "cycle re-armed"
    );
    Ok(trigger)
}

/// The trigger that will next fire `handler_name`, if any. With several
/// registrations the earliest firing wins.
pub fn next_trigger(triggers: &dyn TriggerService, handler_name: &str) -> Result<Option<Trigger>> {
    Ok(triggers
        .list_triggers()
        .context("list triggers")?
        .into_iter()
        .filter(|t| t.handler_name == handler_name)
        .min_by_key(Trigger::next_fire_at))
}
