use std::collections::{BTreeMap, HashSet};

use tracing::{info, warn};

use crate::event::short_id;
use crate::state::ContainerState;
use crate::store::Store;
use crate::Result;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateChange {
    Upsert(ContainerState),
    Remove { container_id: String },
}

/// Outcome of one compaction pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub upserted: Vec<String>,
    /// Containers whose newest event was a destroy and whose row was dropped.
    pub removed: Vec<String>,
    pub failed: usize,
}

impl CompactionReport {
    pub fn is_noop(&self) -> bool {
        self.upserted.is_empty() && self.removed.is_empty() && self.failed == 0
    }
}

/// Computes the changes that bring `current` in line with the newest events.
///
/// `newest` holds the candidate rows carrying the highest fine timestamp of
/// their container, in insertion order; when a container has more than one
/// candidate the last one wins. With `existing_links` set, interfaces that no
/// longer exist on the host are dropped from the desired rows. Rows that
/// already match produce no change.
pub fn plan_compaction<I>(
    newest: I,
    current: &BTreeMap<String, ContainerState>,
    existing_links: Option<&HashSet<String>>,
) -> Vec<StateChange>
where
    I: IntoIterator<Item = ContainerState>,
{
    let mut latest: BTreeMap<String, ContainerState> = BTreeMap::new();
    for candidate in newest {
        latest.insert(candidate.container_id.clone(), candidate);
    }

    let mut changes = Vec::new();
    for (container_id, mut desired) in latest {
        if desired.action.is_terminal() {
            if current.contains_key(&container_id) {
                changes.push(StateChange::Remove { container_id });
            }
            continue;
        }
        if let Some(links) = existing_links {
            desired.interfaces.retain(|name| links.contains(name));
        }
        match current.get(&container_id) {
            Some(row) if *row == desired => {}
            _ => changes.push(StateChange::Upsert(desired)),
        }
    }
    changes
}

impl Store {
    /// Reduces the event log to one row per container.
    ///
    /// Read failures abort the pass and are returned; failures applying a
    /// single change are logged and counted, the rest of the batch still runs.
    pub fn compact(&self, existing_links: Option<&HashSet<String>>) -> Result<CompactionReport> {
        let newest = self.newest_events()?;
        let current = self.container_states()?;
        let changes = plan_compaction(newest, &current, existing_links);

        let mut report = CompactionReport::default();
        for change in changes {
            match change {
                StateChange::Upsert(state) => match self.upsert_state(&state) {
                    Ok(()) => {
                        info!(
                            container = short_id(&state.container_id),
                            action = %state.action,
                            interfaces = %state.interfaces,
                            "upserted container state"
                        );
                        report.upserted.push(state.container_id);
                    }
                    Err(e) => {
                        warn!(%e, container = short_id(&state.container_id), "failed to upsert container state");
                        report.failed += 1;
                    }
                },
                StateChange::Remove { container_id } => match self.remove_state(&container_id) {
                    Ok(()) => {
                        info!(container = short_id(&container_id), "removed destroyed container");
                        report.removed.push(container_id);
                    }
                    Err(e) => {
                        warn!(%e, container = short_id(&container_id), "failed to remove container state");
                        report.failed += 1;
                    }
                },
            }
        }
        Ok(report)
    }
}
