//! Tick scheduler: decides which candidates are attempted this tick.
//!
//! The selector is closed-form and stateless between ticks. Instead of
//! launching every due backup at once, each tick takes 1/24th of the
//! whole candidate set, which smears a fleet of simultaneously
//! provisioned volumes across 24 ticks without starving any volume.

use std::collections::HashMap;

use chrono::{Duration, NaiveDateTime};
use tracing::info;

use crate::candidates::Candidate;

/// A volume is due once its last attempt is older than 23h30m, leaving
/// slack for tick jitter on a 24h cadence.
fn due_window() -> Duration {
    Duration::seconds(24 * 3600 - 30 * 60)
}

/// Selects this tick's batch. `in_flight` maps volume ids to the worker
/// job that still owns them; those volumes are skipped.
pub fn select(
    candidates: Vec<Candidate>,
    now: NaiveDateTime,
    in_flight: &HashMap<String, String>,
) -> Vec<Candidate> {
    let total = candidates.len();

    let mut due: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| match c.last_attempt {
            None => true,
            Some(last_attempt) => now - last_attempt > due_window(),
        })
        .collect();

    // Oldest attempt first; the sort is stable, so volumes that have
    // never been attempted keep their listing order.
    due.sort_by_key(|c| c.last_attempt.unwrap_or(NaiveDateTime::UNIX_EPOCH));

    let quota = total.div_ceil(24).min(due.len());
    info!("{} volumes to backup, doing {} now", total, quota);
    due.truncate(quota);

    due.retain(|c| match in_flight.get(&c.pv) {
        Some(job) => {
            info!(pv = %c.pv, job = %job, "Skipping backup, job exists");
            false
        }
        None => true,
    });

    due
}
