//! State shared between the request handler and the control loop

use crate::models::{StatRecord, StatsMap, TargetUpdates, TimedRecord};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type SharedSession = Arc<Mutex<SessionState>>;

/// One control session; every field is guarded by the session mutex
#[derive(Debug, Default)]
pub struct SessionState {
    /// Checked by the control loop at tick boundaries
    pub stop: bool,
    /// Applied at the next tick, then cleared
    pub pending_updates: TargetUpdates,
    /// Every record since `start`
    pub history: StatsMap,
    /// Records since the previous `stats` poll
    pub current: StatsMap,
    /// Set when the control loop ended on an error
    pub failure: Option<String>,
}

impl SessionState {
    pub fn shared() -> SharedSession {
        Arc::new(Mutex::new(Self::default()))
    }

    /// Seed empty buffers so that polls report every component, even before its first record
    pub fn register_components<'a>(&mut self, names: impl IntoIterator<Item = &'a String>) {
        for name in names {
            self.history.entry(name.clone()).or_default();
            self.current.entry(name.clone()).or_default();
        }
    }

    /// Later entries replace earlier ones for the same component
    pub fn stage_updates(&mut self, updates: TargetUpdates) {
        self.pending_updates.extend(updates);
    }

    pub fn take_updates(&mut self) -> TargetUpdates {
        std::mem::take(&mut self.pending_updates)
    }

    /// Append one tick's records to both buffers
    pub fn record(&mut self, t: f64, records: BTreeMap<String, StatRecord>) {
        for (name, record) in records {
            self.current
                .entry(name.clone())
                .or_default()
                .push(TimedRecord(t, record.clone()));
            self.history
                .entry(name)
                .or_default()
                .push(TimedRecord(t, record));
        }
    }

    /// Hand out the since-last-poll buffer, keeping the component keys
    pub fn drain_current(&mut self) -> StatsMap {
        self.current
            .iter_mut()
            .map(|(name, records)| (name.clone(), std::mem::take(records)))
            .collect()
    }

    pub fn take_history(&mut self) -> StatsMap {
        std::mem::take(&mut self.history)
    }
}
